pub mod client;
pub mod transport;
pub mod types;

pub use client::{AgentClient, RetryPolicy};
pub use transport::{AgentTransport, HttpAgentTransport};
pub use types::{InvocationRequest, InvocationResult, InvocationStatus};
