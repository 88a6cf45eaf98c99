pub mod adapter;
pub mod builtin;
pub mod protocol;
pub mod server;

pub use adapter::{ToolAdapter, ToolDescriptor};
pub use builtin::{
    AnalyticsTool, BackendConnector, DatabaseQueryTool, DocumentSearchTool, HttpBackendConnector,
};
pub use protocol::{handle_rpc, RpcError, RpcRequest, RpcResponse};
pub use server::{ToolAuth, ToolResult, ToolServer, ToolServerConfig, ToolStatus};
