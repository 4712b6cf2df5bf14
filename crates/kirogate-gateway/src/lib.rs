pub mod app;
pub mod http;
pub mod orchestrator;

pub use app::{build_router, AppState};
