pub mod config;
pub mod error;
pub mod fingerprint;
pub mod ids;
pub mod models;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
