pub mod builder;
pub mod entry;

pub use builder::{build_timeline, LogSignature, TimelineBuilder, TimelineItem};
pub use entry::{LogEntry, ToolCall, ToolOutput, ToolResult};
