use crate::condition::LoopCondition;
use crate::plan::{
    build_pattern, ExecutionPlan, OrchestrationPattern, PlannerClient, PlannerProposal,
    RequestContext,
};
use crate::result::{IterationRecord, OrchestrationResult};
use chrono::Utc;
use futures_util::future::join_all;
use maestro_agent::{AgentClient, InvocationRequest, InvocationResult, InvocationStatus};
use maestro_core::{
    CoreError, CoreResult, DenySubcode, ErrorInfo, Message, NoopSink, Phase, SchedulerConfig,
    SessionEvent, SpanTimer, TelemetrySink, TransactionContext,
};
use maestro_policy::{PolicyEngine, ResourceType};
use maestro_registry::{AgentRegistry, SelectionStrategy};
use maestro_session::{SessionStatus, SessionStore};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared pieces handed to spawned pattern tasks.
struct TaskContext {
    client: Arc<AgentClient>,
    sessions: Arc<SessionStore>,
}

/// Per-agent execution budgets resolved during the policy step.
type Budgets = HashMap<String, Option<Duration>>;

/// Runs top-level requests: plan, policy-check, execute the pattern,
/// aggregate, and push progress to the session's event queue.
pub struct Scheduler {
    registry: Arc<AgentRegistry>,
    policy: Arc<PolicyEngine>,
    sessions: Arc<SessionStore>,
    client: Arc<AgentClient>,
    planner: Arc<dyn PlannerClient>,
    telemetry: Arc<dyn TelemetrySink>,
    config: SchedulerConfig,
    process_limiter: Arc<Semaphore>,
    queued: AtomicUsize,
}

impl Scheduler {
    pub fn new(
        registry: Arc<AgentRegistry>,
        policy: Arc<PolicyEngine>,
        sessions: Arc<SessionStore>,
        client: AgentClient,
        planner: Arc<dyn PlannerClient>,
        config: SchedulerConfig,
    ) -> Self {
        let process_limiter = Arc::new(Semaphore::new(config.process_max_in_flight.max(1)));
        Self {
            registry,
            policy,
            sessions,
            client: Arc::new(client),
            planner,
            telemetry: Arc::new(NoopSink),
            config,
            process_limiter,
            queued: AtomicUsize::new(0),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Observable depth of the admission queue.
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Entry point for all three transports. Blocks until the terminal
    /// outcome; progress is streamed through the session's event queue on
    /// the way.
    pub async fn handle_message(
        &self,
        session_id: Uuid,
        query: &str,
        context: Option<&serde_json::Value>,
        user_id: Option<String>,
        role: Option<String>,
    ) -> CoreResult<OrchestrationResult> {
        // Admission control: a bounded number in flight, a bounded queue
        // behind it.
        if self.queued.load(Ordering::SeqCst) >= self.config.queue_overflow {
            return Err(CoreError::Overloaded(
                "scheduler admission queue is full".into(),
            ));
        }
        self.queued.fetch_add(1, Ordering::SeqCst);
        let permit = self.process_limiter.clone().acquire_owned().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        let _permit = permit.map_err(|_| CoreError::Internal("process limiter closed".into()))?;

        let session = self.sessions.get(session_id).await?;
        if session.is_closed() {
            return Err(CoreError::SessionClosed(session_id));
        }
        let ctx = TransactionContext::root(
            Some(session_id),
            user_id.or(session.user_id),
            role,
        );
        info!(
            transaction_id = %ctx.transaction_id,
            session_id = %session_id,
            "request accepted"
        );

        self.sessions
            .append_message(session_id, Message::user(query))
            .await?;
        let _ = self
            .sessions
            .set_status(session_id, SessionStatus::Processing)
            .await;

        let outcome = self.run_request(&ctx, session_id, query, context).await;
        match outcome {
            Ok(result) => {
                let message = Message::agent(result.summary())
                    .with_metadata("pattern", serde_json::json!(result.pattern))
                    .with_metadata("agents", serde_json::json!(result.agents))
                    .with_metadata("transaction_id", serde_json::json!(ctx.transaction_id))
                    .with_metadata("duration_ms", serde_json::json!(ctx.elapsed_ms()));
                let _ = self.sessions.append_message(session_id, message).await;
                self.emit(
                    session_id,
                    SessionEvent::Complete {
                        result: result.to_value(),
                    },
                )
                .await;
                let _ = self
                    .sessions
                    .set_status(session_id, SessionStatus::Idle)
                    .await;
                Ok(result)
            }
            Err(e) => {
                warn!(
                    transaction_id = %ctx.transaction_id,
                    kind = e.kind(),
                    error = %e,
                    "request failed"
                );
                self.emit(
                    session_id,
                    SessionEvent::Error {
                        error: e.to_envelope(Some(ctx.transaction_id)),
                    },
                )
                .await;
                let _ = self
                    .sessions
                    .set_status(session_id, SessionStatus::Idle)
                    .await;
                Err(e)
            }
        }
    }

    async fn run_request(
        &self,
        ctx: &TransactionContext,
        session_id: Uuid,
        query: &str,
        context: Option<&serde_json::Value>,
    ) -> CoreResult<OrchestrationResult> {
        let _span = SpanTimer::start(self.telemetry.as_ref(), "scheduler.request", ctx);
        let reqctx = RequestContext::from_value(context)?;

        self.emit(
            session_id,
            SessionEvent::status(Phase::Planning, serde_json::json!({})),
        )
        .await;
        let (plan, endpoints) = self.resolve_plan(query, &reqctx).await?;
        let (agents, budgets) = self.authorize(ctx, &plan)?;

        self.emit(
            session_id,
            SessionEvent::status(
                Phase::Dispatching,
                serde_json::json!({
                    "pattern": plan.pattern.name(),
                    "agents": agents,
                    "user_override": plan.user_override,
                }),
            ),
        )
        .await;

        let cancel = self
            .sessions
            .cancellation_token(session_id)
            .await?
            .child_token();

        let (results, iterations, iterations_completed) = match plan.pattern.clone() {
            OrchestrationPattern::Simple => {
                let agent = &agents[0];
                let deadline = self.deadline_for(&budgets, agent, &reqctx, None);
                let result = Self::invoke_agent(
                    &self.task_context(),
                    session_id,
                    ctx.child(),
                    agent,
                    &endpoints[agent],
                    query,
                    deadline,
                    Vec::new(),
                    &cancel,
                )
                .await;
                (vec![result], None, None)
            }
            OrchestrationPattern::Sequential => {
                let results = self
                    .execute_sequential(
                        ctx, session_id, query, &agents, &endpoints, &budgets, &reqctx,
                        &plan.optional, &cancel,
                    )
                    .await;
                (results, None, None)
            }
            OrchestrationPattern::Parallel { timeout, fail_fast } => {
                let results = self
                    .execute_parallel(
                        ctx, session_id, query, &agents, &endpoints, &budgets, &reqctx, timeout,
                        fail_fast, &cancel,
                    )
                    .await;
                (results, None, None)
            }
            OrchestrationPattern::Loop {
                max_iterations,
                condition,
            } => {
                let (iterations, completed) = self
                    .execute_loop(
                        ctx, session_id, query, &agents, &endpoints, &budgets, &reqctx,
                        &plan.optional, max_iterations, condition, &cancel,
                    )
                    .await;
                let last = iterations
                    .last()
                    .map(|i| i.results.clone())
                    .unwrap_or_default();
                (last, Some(iterations), Some(completed))
            }
        };

        Ok(OrchestrationResult {
            transaction_id: ctx.transaction_id,
            pattern: plan.pattern.name().to_string(),
            user_override: plan.user_override,
            agents,
            results,
            iterations,
            iterations_completed,
            timestamp: Utc::now(),
        })
    }

    /// Step B: user overrides win; otherwise the planner proposes and the
    /// registry validates, falling back to `simple` with the best single
    /// match.
    async fn resolve_plan(
        &self,
        query: &str,
        reqctx: &RequestContext,
    ) -> CoreResult<(ExecutionPlan, HashMap<String, String>)> {
        let default_timeout = self.config.default_timeout();

        if reqctx.has_override() {
            let agents = reqctx.override_agents().ok_or_else(|| {
                CoreError::InvalidRequest("pattern override without agents".into())
            })?;
            let name = reqctx.orchestration_pattern.as_deref().unwrap_or("simple");
            let pattern = build_pattern(name, reqctx, default_timeout)?;
            if pattern == OrchestrationPattern::Simple && agents.len() != 1 {
                return Err(CoreError::InvalidRequest(
                    "simple execution requires exactly one agent".into(),
                ));
            }
            let endpoints = self.pinned_endpoints(&agents).await?;
            return Ok((
                ExecutionPlan {
                    pattern,
                    agents,
                    user_override: true,
                    optional: reqctx.optional_set(),
                },
                endpoints,
            ));
        }

        let capabilities = self.registry.capability_snapshot().await;
        let proposal = match self.planner.plan(query, &capabilities).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "planner failed, falling back to single-agent plan");
                PlannerProposal {
                    pattern: "simple".to_string(),
                    agents: Vec::new(),
                }
            }
        };

        if !proposal.agents.is_empty() {
            let validated = self.pinned_endpoints(&proposal.agents).await;
            match validated {
                Ok(endpoints) => {
                    let pattern = build_pattern(&proposal.pattern, reqctx, default_timeout)?;
                    return Ok((
                        ExecutionPlan {
                            pattern,
                            agents: proposal.agents,
                            user_override: false,
                            optional: reqctx.optional_set(),
                        },
                        endpoints,
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "planned agents unavailable, falling back");
                }
            }
        }

        // Best single match across whatever is reachable.
        let eligible = self
            .registry
            .select(&[], &SelectionStrategy::LeastLoaded)
            .await;
        let Some(best) = eligible.first() else {
            return Err(CoreError::denied(
                DenySubcode::NoEligibleAgent,
                "no eligible agent for this request",
            ));
        };
        let agents = vec![best.record.id.clone()];
        let endpoints =
            HashMap::from([(best.record.id.clone(), best.record.endpoint.clone())]);
        Ok((
            ExecutionPlan {
                pattern: OrchestrationPattern::Simple,
                agents,
                user_override: false,
                optional: HashSet::new(),
            },
            endpoints,
        ))
    }

    async fn pinned_endpoints(&self, agents: &[String]) -> CoreResult<HashMap<String, String>> {
        let snapshots = self
            .registry
            .select(&[], &SelectionStrategy::Pinned(agents.to_vec()))
            .await;
        if snapshots.len() != agents.len() {
            let found: HashSet<&str> = snapshots
                .iter()
                .map(|s| s.record.id.as_str())
                .collect();
            let missing = agents
                .iter()
                .find(|a| !found.contains(a.as_str()))
                .cloned()
                .unwrap_or_default();
            return Err(CoreError::denied(
                DenySubcode::NoEligibleAgent,
                format!("agent '{missing}' is not available"),
            ));
        }
        Ok(snapshots
            .into_iter()
            .map(|s| (s.record.id.clone(), s.record.endpoint))
            .collect())
    }

    /// Step C: evaluate each planned agent. Sequential-class plans refuse
    /// outright on any denial; parallel plans drop the denied agents and
    /// proceed with survivors.
    fn authorize(
        &self,
        ctx: &TransactionContext,
        plan: &ExecutionPlan,
    ) -> CoreResult<(Vec<String>, Budgets)> {
        let drop_denied = matches!(plan.pattern, OrchestrationPattern::Parallel { .. });
        let mut survivors = Vec::new();
        let mut budgets = Budgets::new();
        let mut first_denial: Option<CoreError> = None;

        for agent in &plan.agents {
            let decision =
                self.policy
                    .evaluate(ctx, ResourceType::Agent, agent, "invoke", None);
            if decision.allowed {
                budgets.insert(
                    agent.clone(),
                    decision.applied_restrictions.max_execution_time(),
                );
                survivors.push(agent.clone());
            } else if drop_denied {
                warn!(agent = %agent, reason = %decision.reason, "agent dropped from parallel plan");
                first_denial.get_or_insert(decision.to_error());
            } else {
                return Err(decision.to_error());
            }
        }

        if survivors.is_empty() {
            return Err(first_denial.unwrap_or_else(|| {
                CoreError::denied(DenySubcode::NoEligibleAgent, "no agents in plan")
            }));
        }
        Ok((survivors, budgets))
    }

    /// Effective deadline = min(policy budget, caller timeout, remaining
    /// pattern wall clock, scheduler default).
    fn deadline_for(
        &self,
        budgets: &Budgets,
        agent: &str,
        reqctx: &RequestContext,
        remaining_wall: Option<Duration>,
    ) -> Duration {
        let mut deadline = self.config.default_timeout();
        let parts = [
            budgets.get(agent).copied().flatten(),
            reqctx.timeout(),
            remaining_wall,
        ];
        for limit in parts.into_iter().flatten() {
            deadline = deadline.min(limit);
        }
        deadline
    }

    fn task_context(&self) -> TaskContext {
        TaskContext {
            client: self.client.clone(),
            sessions: self.sessions.clone(),
        }
    }

    async fn emit(&self, session_id: Uuid, event: SessionEvent) {
        Self::emit_with(&self.sessions, session_id, event).await;
    }

    async fn emit_with(sessions: &SessionStore, session_id: Uuid, event: SessionEvent) {
        if let Err(e) = sessions.enqueue_event(session_id, event).await {
            debug!(session_id = %session_id, error = %e, "progress event not delivered");
        }
    }

    /// One invocation with its start/complete status events.
    #[allow(clippy::too_many_arguments)]
    async fn invoke_agent(
        tctx: &TaskContext,
        session_id: Uuid,
        ctx: TransactionContext,
        agent: &str,
        endpoint: &str,
        input: &str,
        deadline: Duration,
        previous_results: Vec<serde_json::Value>,
        cancel: &CancellationToken,
    ) -> InvocationResult {
        Self::emit_with(
            &tctx.sessions,
            session_id,
            SessionEvent::status(Phase::AgentStart, serde_json::json!({"agent": agent})),
        )
        .await;

        let mut request = InvocationRequest::new(ctx, agent, input, deadline);
        request.previous_results = previous_results;
        let result = tctx.client.invoke(endpoint, &request, cancel).await;

        Self::emit_with(
            &tctx.sessions,
            session_id,
            SessionEvent::status(
                Phase::AgentComplete,
                serde_json::json!({"agent": agent, "status": result.status}),
            ),
        )
        .await;
        result
    }

    fn cancelled_result(agent: &str) -> InvocationResult {
        InvocationResult::failure(
            agent,
            InvocationStatus::Cancelled,
            ErrorInfo::new("AgentFailed", "cancelled"),
            0,
        )
    }

    /// Strict program order; the output of step N feeds step N+1. Halts on
    /// the first non-success unless that step is marked optional.
    #[allow(clippy::too_many_arguments)]
    async fn execute_sequential(
        &self,
        ctx: &TransactionContext,
        session_id: Uuid,
        query: &str,
        agents: &[String],
        endpoints: &HashMap<String, String>,
        budgets: &Budgets,
        reqctx: &RequestContext,
        optional: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Vec<InvocationResult> {
        let tctx = self.task_context();
        let mut results = Vec::with_capacity(agents.len());
        let mut previous: Vec<serde_json::Value> = Vec::new();

        for agent in agents {
            if cancel.is_cancelled() {
                results.push(Self::cancelled_result(agent));
                break;
            }
            let deadline = self.deadline_for(budgets, agent, reqctx, None);
            let result = Self::invoke_agent(
                &tctx,
                session_id,
                ctx.child(),
                agent,
                &endpoints[agent],
                query,
                deadline,
                previous.clone(),
                cancel,
            )
            .await;

            let succeeded = result.is_success();
            if let Some(payload) = result.payload.clone().filter(|_| succeeded) {
                previous.push(payload);
            }
            let step_optional = optional.contains(agent);
            results.push(result);
            if !succeeded && !step_optional {
                break;
            }
        }
        results
    }

    /// Fan out concurrently, bounded in flight, under a wall-clock
    /// deadline. With `fail_fast` the first non-success cancels the peers;
    /// result positions always match the plan's agent order.
    #[allow(clippy::too_many_arguments)]
    async fn execute_parallel(
        &self,
        ctx: &TransactionContext,
        session_id: Uuid,
        query: &str,
        agents: &[String],
        endpoints: &HashMap<String, String>,
        budgets: &Budgets,
        reqctx: &RequestContext,
        timeout: Duration,
        fail_fast: bool,
        cancel: &CancellationToken,
    ) -> Vec<InvocationResult> {
        let limiter = Arc::new(Semaphore::new(self.config.parallel_max_in_flight.max(1)));
        let group = cancel.child_token();
        let started = Instant::now();
        let default_timeout = self.config.default_timeout();
        let reqctx_timeout = reqctx.timeout();

        let mut handles = Vec::with_capacity(agents.len());
        for (idx, agent) in agents.iter().enumerate() {
            let tctx = self.task_context();
            let limiter = limiter.clone();
            let group = group.clone();
            let agent = agent.clone();
            let endpoint = endpoints[&agent].clone();
            let budget = budgets.get(&agent).copied().flatten();
            let child_ctx = ctx.child();
            let query = query.to_string();

            handles.push(tokio::spawn(async move {
                let _permit = match limiter.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return (idx, Self::cancelled_result(&agent)),
                };
                if group.is_cancelled() {
                    return (idx, Self::cancelled_result(&agent));
                }
                let remaining = timeout.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return (
                        idx,
                        InvocationResult::failure(
                            &agent,
                            InvocationStatus::TimedOut,
                            ErrorInfo::new("TimedOut", "pattern deadline exhausted"),
                            started.elapsed().as_millis() as u64,
                        ),
                    );
                }
                let mut deadline = default_timeout.min(remaining);
                for limit in [budget, reqctx_timeout].into_iter().flatten() {
                    deadline = deadline.min(limit);
                }

                let result = Self::invoke_agent(
                    &tctx,
                    session_id,
                    child_ctx,
                    &agent,
                    &endpoint,
                    &query,
                    deadline,
                    Vec::new(),
                    &group,
                )
                .await;

                if fail_fast
                    && !result.is_success()
                    && result.status != InvocationStatus::Cancelled
                {
                    info!(agent = %agent, "fail-fast: cancelling peer invocations");
                    group.cancel();
                }
                (idx, result)
            }));
        }

        let mut slots: Vec<Option<InvocationResult>> = vec![None; agents.len()];
        for joined in join_all(handles).await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => warn!(error = %e, "parallel task panicked"),
            }
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    InvocationResult::failure(
                        &agents[idx],
                        InvocationStatus::Failed,
                        ErrorInfo::new("Internal", "task aborted"),
                        0,
                    )
                })
            })
            .collect()
    }

    /// Repeat the inner sequential plan up to `max_iterations`, checking
    /// the stop condition against each iteration's aggregated result. An
    /// unevaluable condition counts as not met and is logged.
    #[allow(clippy::too_many_arguments)]
    async fn execute_loop(
        &self,
        ctx: &TransactionContext,
        session_id: Uuid,
        query: &str,
        agents: &[String],
        endpoints: &HashMap<String, String>,
        budgets: &Budgets,
        reqctx: &RequestContext,
        optional: &HashSet<String>,
        max_iterations: u32,
        condition: Option<LoopCondition>,
        cancel: &CancellationToken,
    ) -> (Vec<IterationRecord>, u32) {
        let mut iterations = Vec::new();
        let mut completed = 0;

        for iteration in 1..=max_iterations.max(1) {
            if cancel.is_cancelled() {
                break;
            }
            let results = self
                .execute_sequential(
                    ctx, session_id, query, agents, endpoints, budgets, reqctx, optional, cancel,
                )
                .await;
            completed = iteration;
            let iteration_failed = results.iter().any(|r| !r.is_success());

            self.emit(
                session_id,
                SessionEvent::status(
                    Phase::Iteration,
                    serde_json::json!({"iteration": iteration, "of": max_iterations}),
                ),
            )
            .await;
            iterations.push(IterationRecord { iteration, results });

            if iteration_failed {
                warn!(iteration, "loop iteration failed, stopping");
                break;
            }
            if let Some(cond) = &condition {
                match Self::condition_met(&iterations[iterations.len() - 1], cond) {
                    Some(true) => {
                        info!(iteration, condition = %cond, "loop condition satisfied");
                        break;
                    }
                    Some(false) => {}
                    None => {
                        warn!(iteration, condition = %cond, "loop condition not evaluable, treating as not met");
                    }
                }
            }
        }
        (iterations, completed)
    }

    /// Evaluate against the iteration's aggregated result: the newest step
    /// payload that can decide the condition wins.
    fn condition_met(iteration: &IterationRecord, condition: &LoopCondition) -> Option<bool> {
        for result in iteration.results.iter().rev() {
            if let Some(payload) = &result.payload {
                if let Some(verdict) = condition.evaluate(payload) {
                    return Some(verdict);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::LoopCondition;

    #[test]
    fn condition_checks_newest_payload_first() {
        let iteration = IterationRecord {
            iteration: 1,
            results: vec![
                InvocationResult::success("A1", serde_json::json!({"accuracy": 0.2}), 1),
                InvocationResult::success("A2", serde_json::json!({"accuracy": 0.95}), 1),
            ],
        };
        let cond = LoopCondition::parse("accuracy > 0.9").unwrap();
        assert_eq!(Scheduler::condition_met(&iteration, &cond), Some(true));
    }

    #[test]
    fn condition_missing_everywhere_is_none() {
        let iteration = IterationRecord {
            iteration: 1,
            results: vec![InvocationResult::success(
                "A1",
                serde_json::json!({"rows": 10}),
                1,
            )],
        };
        let cond = LoopCondition::parse("accuracy > 0.9").unwrap();
        assert_eq!(Scheduler::condition_met(&iteration, &cond), None);
    }
}
