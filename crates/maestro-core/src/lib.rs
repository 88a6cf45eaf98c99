pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod message;
pub mod telemetry;

pub use config::{
    AgentClientConfig, CoreConfig, PolicyConfig, RegistryConfig, SchedulerConfig, SessionConfig,
};
pub use context::TransactionContext;
pub use error::{CoreError, CoreResult, DenySubcode, ErrorEnvelope, ErrorInfo};
pub use event::{Phase, SessionEvent};
pub use message::{Message, Role};
pub use telemetry::{LogSink, NoopSink, SpanTimer, TelemetrySink};
