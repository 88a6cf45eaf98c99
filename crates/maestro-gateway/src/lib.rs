pub mod server;
pub mod sse;
pub mod state;
pub mod ws;

pub use server::GatewayServer;
pub use state::{ApiAuth, AppState, Identity};
