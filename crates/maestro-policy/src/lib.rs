pub mod audit;
pub mod document;
pub mod engine;
pub mod loader;
pub mod rate;

pub use audit::{AuditEntry, AuditLog, AuditSink, JsonlAuditSink};
pub use document::{
    PolicyDocument, RateLimits, ResourceRestrictions, ResourceType, RoleRules,
};
pub use engine::{AppliedRestrictions, PolicyDecision, PolicyEngine};
pub use loader::{PolicyLoader, PolicyProvider};
pub use rate::{RateKey, RateLimiter, RateScope};
