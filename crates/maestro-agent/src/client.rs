use crate::transport::AgentTransport;
use crate::types::{InvocationRequest, InvocationResult, InvocationStatus};
use maestro_core::{AgentClientConfig, CoreError, ErrorInfo};
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Retry behaviour for transient invocation failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_cap_ms: 4000,
        }
    }
}

impl From<&AgentClientConfig> for RetryPolicy {
    fn from(cfg: &AgentClientConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff_base_ms: cfg.backoff_base_ms,
            backoff_cap_ms: cfg.backoff_cap_ms,
        }
    }
}

/// Exponential backoff `base * 2^attempt`, capped.
fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(policy.backoff_cap_ms)
}

/// Full jitter: a uniform draw over the whole backoff interval.
fn jittered(delay_ms: u64) -> u64 {
    if delay_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=delay_ms)
}

/// Outbound invocation of a specialized agent with deadline, retries on
/// transient failures, and cooperative cancellation. Failures are encoded
/// in the returned `InvocationResult`, never raised past the client.
pub struct AgentClient {
    transport: Arc<dyn AgentTransport>,
    policy: RetryPolicy,
}

impl AgentClient {
    pub fn new(transport: Arc<dyn AgentTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn invoke(
        &self,
        endpoint: &str,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> InvocationResult {
        let start = Instant::now();
        let agent_id = request.agent_id.clone();

        let attempts = self.run_attempts(endpoint, request, cancel);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                info!(agent_id = %agent_id, "invocation cancelled");
                return InvocationResult::failure(
                    agent_id,
                    InvocationStatus::Cancelled,
                    ErrorInfo::new("AgentFailed", "cancelled"),
                    start.elapsed().as_millis() as u64,
                );
            }
            res = tokio::time::timeout(request.deadline, attempts) => res,
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Err(_) => {
                warn!(agent_id = %agent_id, deadline_ms = request.deadline.as_millis() as u64, "invocation deadline exhausted");
                InvocationResult::failure(
                    agent_id,
                    InvocationStatus::TimedOut,
                    ErrorInfo::new("TimedOut", "invocation deadline exhausted"),
                    latency_ms,
                )
            }
            Ok(Ok(payload)) => InvocationResult::success(agent_id, payload, latency_ms),
            Ok(Err(e)) => InvocationResult::failure(
                agent_id,
                InvocationStatus::Failed,
                ErrorInfo::from_error(&e),
                latency_ms,
            ),
        }
    }

    async fn run_attempts(
        &self,
        endpoint: &str,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, CoreError> {
        let mut last_err: Option<CoreError> = None;

        for attempt in 0..=self.policy.max_retries {
            match self.transport.send(endpoint, request).await {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_transient() => {
                    if attempt < self.policy.max_retries {
                        let delay = jittered(compute_backoff(&self.policy, attempt));
                        info!(
                            agent_id = %request.agent_id,
                            attempt,
                            delay_ms = delay,
                            error = %e,
                            "transient failure, backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(std::time::Duration::from_millis(delay)) => {}
                            _ = cancel.cancelled() => {
                                last_err = Some(e);
                                break;
                            }
                        }
                    }
                    last_err = Some(e);
                }
                Err(e) => {
                    warn!(agent_id = %request.agent_id, attempt, error = %e, "non-transient failure");
                    return Err(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| CoreError::AgentFailed(format!("{}: retries exhausted", request.agent_id))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maestro_core::{CoreResult, TransactionContext};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Scripted transport: pops one result per attempt.
    struct MockTransport {
        results: Mutex<Vec<CoreResult<serde_json::Value>>>,
        calls: AtomicU32,
        per_call_delay: Duration,
    }

    impl MockTransport {
        fn new(results: Vec<CoreResult<serde_json::Value>>) -> Self {
            Self {
                results: Mutex::new(results),
                calls: AtomicU32::new(0),
                per_call_delay: Duration::ZERO,
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.per_call_delay = delay;
            self
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentTransport for MockTransport {
        async fn send(
            &self,
            _endpoint: &str,
            _request: &InvocationRequest,
        ) -> CoreResult<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.per_call_delay.is_zero() {
                tokio::time::sleep(self.per_call_delay).await;
            }
            let mut results = self.results.lock().await;
            if results.is_empty() {
                Err(CoreError::AgentUnreachable("script exhausted".into()))
            } else {
                results.remove(0)
            }
        }
    }

    fn instant_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 0,
            backoff_cap_ms: 0,
        }
    }

    fn request(deadline: Duration) -> InvocationRequest {
        InvocationRequest::new(
            TransactionContext::root(None, None, None),
            "A1",
            "query",
            deadline,
        )
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let transport = Arc::new(MockTransport::new(vec![
            Err(CoreError::AgentUnreachable("connection reset".into())),
            Ok(serde_json::json!({"rows": 1})),
        ]));
        let client = AgentClient::new(transport.clone(), instant_policy());
        let cancel = CancellationToken::new();

        let result = client
            .invoke("http://a1", &request(Duration::from_secs(5)), &cancel)
            .await;
        assert_eq!(result.status, InvocationStatus::Success);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn non_transient_returns_immediately() {
        let transport = Arc::new(MockTransport::new(vec![
            Err(CoreError::AgentFailed("400-class".into())),
            Ok(serde_json::json!({})),
        ]));
        let client = AgentClient::new(transport.clone(), instant_policy());
        let cancel = CancellationToken::new();

        let result = client
            .invoke("http://a1", &request(Duration::from_secs(5)), &cancel)
            .await;
        assert_eq!(result.status, InvocationStatus::Failed);
        assert_eq!(result.error.as_ref().unwrap().kind, "AgentFailed");
        assert_eq!(transport.calls(), 1, "no retry after non-transient failure");
    }

    #[tokio::test]
    async fn retries_exhausted_reports_last_error() {
        let transport = Arc::new(MockTransport::new(vec![
            Err(CoreError::AgentUnreachable("503".into())),
            Err(CoreError::AgentUnreachable("503".into())),
            Err(CoreError::AgentUnreachable("503".into())),
            Err(CoreError::AgentUnreachable("503".into())),
        ]));
        let client = AgentClient::new(transport.clone(), instant_policy());
        let cancel = CancellationToken::new();

        let result = client
            .invoke("http://a1", &request(Duration::from_secs(5)), &cancel)
            .await;
        assert_eq!(result.status, InvocationStatus::Failed);
        assert_eq!(result.error.as_ref().unwrap().kind, "AgentUnreachable");
        assert_eq!(transport.calls(), 4, "initial attempt plus three retries");
    }

    #[tokio::test]
    async fn deadline_exhaustion_is_timed_out() {
        let transport = Arc::new(
            MockTransport::new(vec![Ok(serde_json::json!({}))])
                .slow(Duration::from_millis(200)),
        );
        let client = AgentClient::new(transport, instant_policy());
        let cancel = CancellationToken::new();

        let result = client
            .invoke("http://a1", &request(Duration::from_millis(20)), &cancel)
            .await;
        assert_eq!(result.status, InvocationStatus::TimedOut);
        assert_eq!(result.error.as_ref().unwrap().kind, "TimedOut");
    }

    #[tokio::test]
    async fn cancellation_aborts_attempt() {
        let transport = Arc::new(
            MockTransport::new(vec![Ok(serde_json::json!({}))])
                .slow(Duration::from_millis(500)),
        );
        let client = AgentClient::new(transport, instant_policy());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = client
            .invoke("http://a1", &request(Duration::from_secs(10)), &cancel)
            .await;
        assert_eq!(result.status, InvocationStatus::Cancelled);
        assert!(result.latency_ms < 400, "cancel observed promptly");
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 250,
            backoff_cap_ms: 4000,
        };
        assert_eq!(compute_backoff(&policy, 0), 250);
        assert_eq!(compute_backoff(&policy, 1), 500);
        assert_eq!(compute_backoff(&policy, 2), 1000);
        assert_eq!(compute_backoff(&policy, 3), 2000);
        assert_eq!(compute_backoff(&policy, 4), 4000);
        assert_eq!(compute_backoff(&policy, 5), 4000);
    }

    #[test]
    fn jitter_stays_within_interval() {
        for _ in 0..100 {
            let d = jittered(1000);
            assert!(d <= 1000);
        }
        assert_eq!(jittered(0), 0);
    }
}
