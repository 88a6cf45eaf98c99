use axum::http::HeaderMap;
use maestro_core::{CoreError, CoreResult};
use maestro_orchestrator::Scheduler;
use maestro_policy::{PolicyEngine, PolicyLoader};
use maestro_registry::AgentRegistry;
use maestro_session::SessionStore;
use maestro_tools::ToolServer;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolved caller identity for the transaction context.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_id: Option<String>,
    pub role: Option<String>,
}

/// Bearer-token table for the inbound transports. An empty table disables
/// authentication; callers then run under the policy default role.
#[derive(Debug, Clone, Default)]
pub struct ApiAuth {
    tokens: HashMap<String, (Option<String>, String)>,
}

impl ApiAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: Option<String>,
        role: impl Into<String>,
    ) -> Self {
        self.tokens.insert(token.into(), (user_id, role.into()));
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Resolve `Authorization: Bearer <token>`. With auth disabled every
    /// request maps to the anonymous default identity.
    pub fn identify(&self, headers: &HeaderMap) -> CoreResult<Identity> {
        if !self.is_enabled() {
            return Ok(Identity::default());
        }
        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| CoreError::Unauthorized("missing bearer token".into()))?;
        let (user_id, role) = self
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| CoreError::Unauthorized("token not recognized".into()))?;
        Ok(Identity {
            user_id,
            role: Some(role),
        })
    }
}

/// Everything the transports need, constructed once at start-up and
/// injected; no hidden globals.
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<AgentRegistry>,
    pub policy: Arc<PolicyEngine>,
    pub policy_loader: Arc<PolicyLoader>,
    pub scheduler: Arc<Scheduler>,
    pub tools: Arc<ToolServer>,
    pub auth: ApiAuth,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn disabled_auth_yields_anonymous_identity() {
        let auth = ApiAuth::new();
        let identity = auth.identify(&HeaderMap::new()).unwrap();
        assert!(identity.user_id.is_none());
        assert!(identity.role.is_none());
    }

    #[test]
    fn bearer_token_resolves_user_and_role() {
        let auth = ApiAuth::new().with_token("sekrit", Some("u1".into()), "analyst");
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer sekrit"),
        );
        let identity = auth.identify(&headers).unwrap();
        assert_eq!(identity.user_id.as_deref(), Some("u1"));
        assert_eq!(identity.role.as_deref(), Some("analyst"));
    }

    #[test]
    fn missing_or_wrong_token_is_unauthorized() {
        let auth = ApiAuth::new().with_token("sekrit", None, "analyst");
        assert_eq!(
            auth.identify(&HeaderMap::new()).unwrap_err().kind(),
            "Unauthorized"
        );

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer nope"));
        assert_eq!(auth.identify(&headers).unwrap_err().kind(), "Unauthorized");
    }
}
