pub mod message;
pub mod normalize;
pub mod parser;
pub mod payload;
pub mod thinking;
pub mod tools;
pub mod truncation;

pub use message::{Block, Content, ImageData, Role, ToolCall, ToolResult, UnifiedMessage};
pub use normalize::{build_upstream_payload, NormalizeOptions};
pub use parser::{EventStreamParser, ParsedToolCall, StreamEvent};
pub use tools::UnifiedTool;
pub use truncation::TruncationCaches;
