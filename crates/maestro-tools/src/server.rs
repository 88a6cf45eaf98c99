use crate::adapter::{ToolAdapter, ToolDescriptor};
use maestro_core::{
    CoreError, CoreResult, ErrorInfo, NoopSink, SpanTimer, TelemetrySink, TransactionContext,
};
use maestro_policy::{PolicyEngine, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Failed,
    TimedOut,
    Denied,
}

/// Normalized outcome of one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub latency_ms: u64,
}

impl ToolResult {
    fn success(data: serde_json::Value, latency_ms: u64) -> Self {
        Self {
            status: ToolStatus::Success,
            data: Some(data),
            error: None,
            latency_ms,
        }
    }

    fn failure(status: ToolStatus, error: ErrorInfo, latency_ms: u64) -> Self {
        Self {
            status,
            data: None,
            error: Some(error),
            latency_ms,
        }
    }
}

/// Token → identity table. An empty table disables authentication and
/// resolves every caller to the default role.
#[derive(Debug, Clone, Default)]
pub struct ToolAuth {
    tokens: HashMap<String, (Option<String>, String)>,
    default_role: String,
}

impl ToolAuth {
    pub fn new(default_role: impl Into<String>) -> Self {
        Self {
            tokens: HashMap::new(),
            default_role: default_role.into(),
        }
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

    pub fn resolve(&self, token: &str) -> CoreResult<(Option<String>, String)> {
        if !self.is_enabled() {
            return Ok((None, self.default_role.clone()));
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| CoreError::Unauthorized("token not recognized".into()))
    }
}

#[derive(Debug, Clone)]
pub struct ToolServerConfig {
    pub default_timeout: Duration,
    pub max_in_flight_per_adapter: usize,
    pub queue_overflow: usize,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            max_in_flight_per_adapter: 16,
            queue_overflow: 1024,
        }
    }
}

struct ToolEntry {
    adapter: Arc<dyn ToolAdapter>,
    limiter: Arc<Semaphore>,
    queued: AtomicUsize,
}

/// Uniform, authenticated tool-call surface for specialized agents. Every
/// call is authenticated, policy-checked, bounded, timed, and traced under
/// its transaction id.
pub struct ToolServer {
    adapters: HashMap<String, ToolEntry>,
    auth: ToolAuth,
    policy: Arc<PolicyEngine>,
    telemetry: Arc<dyn TelemetrySink>,
    config: ToolServerConfig,
}

impl ToolServer {
    pub fn new(auth: ToolAuth, policy: Arc<PolicyEngine>, config: ToolServerConfig) -> Self {
        Self {
            adapters: HashMap::new(),
            auth,
            policy,
            telemetry: Arc::new(NoopSink),
            config,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Adapters register at start-up, before the server is shared.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        let name = adapter.descriptor().name.clone();
        info!(tool = %name, "tool adapter registered");
        self.adapters.insert(
            name,
            ToolEntry {
                adapter,
                limiter: Arc::new(Semaphore::new(self.config.max_in_flight_per_adapter)),
                queued: AtomicUsize::new(0),
            },
        );
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .adapters
            .values()
            .map(|e| e.adapter.descriptor().clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Observable queue depth for one adapter.
    pub fn queue_depth(&self, tool_id: &str) -> usize {
        self.adapters
            .get(tool_id)
            .map(|e| e.queued.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Errors (`Unauthorized`, `ToolNotFound`, `Overloaded`) abort the call
    /// outright; everything else is reported inside the `ToolResult`.
    pub async fn call(
        &self,
        tool_id: &str,
        arguments: serde_json::Value,
        auth_token: &str,
        parent: Option<&TransactionContext>,
    ) -> CoreResult<ToolResult> {
        let start = Instant::now();

        let (user_id, role) = self.auth.resolve(auth_token)?;
        let ctx = match parent {
            Some(parent) => parent.child(),
            None => TransactionContext::root(None, user_id, Some(role)),
        };
        let _span = SpanTimer::start(self.telemetry.as_ref(), "tool.call", &ctx);

        let decision = self.policy.evaluate(
            &ctx,
            ResourceType::Tool,
            tool_id,
            "call",
            arguments.as_object(),
        );
        if !decision.allowed {
            return Ok(ToolResult::failure(
                ToolStatus::Denied,
                ErrorInfo::from_error(&decision.to_error()),
                start.elapsed().as_millis() as u64,
            ));
        }

        let entry = self
            .adapters
            .get(tool_id)
            .ok_or_else(|| CoreError::ToolNotFound(tool_id.to_string()))?;

        if entry.queued.load(Ordering::SeqCst) >= self.config.queue_overflow {
            return Err(CoreError::Overloaded(format!(
                "tool '{tool_id}' queue is full"
            )));
        }
        entry.queued.fetch_add(1, Ordering::SeqCst);
        let permit = entry.limiter.clone().acquire_owned().await;
        entry.queued.fetch_sub(1, Ordering::SeqCst);
        let _permit =
            permit.map_err(|_| CoreError::Internal("tool limiter closed".into()))?;

        let timeout = decision
            .applied_restrictions
            .max_execution_time()
            .unwrap_or(self.config.default_timeout);

        let outcome = tokio::time::timeout(timeout, entry.adapter.call(arguments, &ctx)).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Err(_) => {
                warn!(tool = %tool_id, transaction_id = %ctx.transaction_id, "tool call timed out");
                ToolResult::failure(
                    ToolStatus::TimedOut,
                    ErrorInfo::new("ToolTimeout", format!("tool '{tool_id}' exceeded {timeout:?}")),
                    latency_ms,
                )
            }
            Ok(Ok(data)) => ToolResult::success(data, latency_ms),
            Ok(Err(e)) => {
                warn!(tool = %tool_id, transaction_id = %ctx.transaction_id, error = %e, "tool call failed");
                ToolResult::failure(
                    ToolStatus::Failed,
                    ErrorInfo::new("ToolFailed", e.to_string()),
                    latency_ms,
                )
            }
        };
        info!(
            tool = %tool_id,
            transaction_id = %ctx.transaction_id,
            status = ?result.status,
            latency_ms,
            "tool call finished"
        );
        Ok(result)
    }
}
