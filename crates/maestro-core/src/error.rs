use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type CoreResult<T> = Result<T, CoreError>;

/// Why a policy decision refused the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenySubcode {
    ExplicitDeny,
    ParameterForbidden,
    RateLimited,
    DefaultDeny,
    NoEligibleAgent,
}

impl DenySubcode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenySubcode::ExplicitDeny => "ExplicitDeny",
            DenySubcode::ParameterForbidden => "ParameterForbidden",
            DenySubcode::RateLimited => "RateLimited",
            DenySubcode::DefaultDeny => "DefaultDeny",
            DenySubcode::NoEligibleAgent => "NoEligibleAgent",
        }
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("session closed: {0}")]
    SessionClosed(Uuid),

    #[error("session expired: {0}")]
    SessionExpired(Uuid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("denied ({}): {detail}", .subcode.as_str())]
    Denied { subcode: DenySubcode, detail: String },

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool timed out: {0}")]
    ToolTimeout(String),

    #[error("tool failed: {0}")]
    ToolFailed(String),

    #[error("agent unreachable: {0}")]
    AgentUnreachable(String),

    #[error("agent failed: {0}")]
    AgentFailed(String),

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn denied(subcode: DenySubcode, detail: impl Into<String>) -> Self {
        CoreError::Denied {
            subcode,
            detail: detail.into(),
        }
    }

    /// Stable identifier surfaced in envelopes, logs, and audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::SessionNotFound(_) => "SessionNotFound",
            CoreError::SessionClosed(_) => "SessionClosed",
            CoreError::SessionExpired(_) => "SessionExpired",
            CoreError::InvalidRequest(_) => "InvalidRequest",
            CoreError::Unauthorized(_) => "Unauthorized",
            CoreError::Denied { .. } => "Denied",
            CoreError::ToolNotFound(_) => "ToolNotFound",
            CoreError::ToolTimeout(_) => "ToolTimeout",
            CoreError::ToolFailed(_) => "ToolFailed",
            CoreError::AgentUnreachable(_) => "AgentUnreachable",
            CoreError::AgentFailed(_) => "AgentFailed",
            CoreError::Overloaded(_) => "Overloaded",
            CoreError::TimedOut(_) => "TimedOut",
            CoreError::ConfigError(_) => "ConfigError",
            CoreError::Internal(_) => "Internal",
        }
    }

    /// Transient faults are retried by the agent client within a single
    /// invocation. Policy denials and validation failures never are.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::AgentUnreachable(_))
    }

    pub fn to_envelope(&self, transaction_id: Option<Uuid>) -> ErrorEnvelope {
        let subcode = match self {
            CoreError::Denied { subcode, .. } => Some(subcode.as_str().to_string()),
            _ => None,
        };
        ErrorEnvelope {
            kind: self.kind().to_string(),
            message: self.to_string(),
            subcode,
            transaction_id,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(format!("serialization: {e}"))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Internal(format!("io: {e}"))
    }
}

/// Structured error shape delivered to callers. Never a raw server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
}

/// Compact error carried inside invocation and tool results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn from_error(err: &CoreError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_deny_subcode() {
        let err = CoreError::denied(DenySubcode::DefaultDeny, "agent A_restricted");
        let env = err.to_envelope(Some(Uuid::new_v4()));
        assert_eq!(env.kind, "Denied");
        assert_eq!(env.subcode.as_deref(), Some("DefaultDeny"));
        assert!(env.transaction_id.is_some());
    }

    #[test]
    fn envelope_omits_subcode_for_other_kinds() {
        let err = CoreError::TimedOut("deadline".into());
        let env = err.to_envelope(None);
        assert_eq!(env.kind, "TimedOut");
        assert!(env.subcode.is_none());
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("subcode").is_none());
    }

    #[test]
    fn transient_classification() {
        assert!(CoreError::AgentUnreachable("refused".into()).is_transient());
        assert!(!CoreError::AgentFailed("bad input".into()).is_transient());
        assert!(!CoreError::denied(DenySubcode::RateLimited, "").is_transient());
    }

    #[test]
    fn subcode_serializes_as_variant_name() {
        let json = serde_json::to_string(&DenySubcode::RateLimited).unwrap();
        assert_eq!(json, "\"RateLimited\"");
    }
}
