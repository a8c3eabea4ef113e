//! 工具层：注册表、校验、重试、传输与调用器

pub mod calendar;
pub mod invoker;
pub mod registry;
pub mod retry;
pub mod transport;
pub mod types;
pub mod validation;

pub use calendar::Calendar;
pub use invoker::{RegistryInvoker, ToolInvoker};
pub use registry::{ToolRegistry, ToolSpec};
pub use retry::RetryPolicy;
pub use transport::{
    ChannelTransport, HttpTransport, LocalTool, LocalTransport, ToolMailbox, ToolTransport,
};
pub use types::{ToolCall, ToolRequest, ToolResult, ToolStatus};
