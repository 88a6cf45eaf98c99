use async_trait::async_trait;
use maestro_agent::{AgentClient, AgentTransport, InvocationRequest, InvocationStatus, RetryPolicy};
use maestro_core::{CoreError, CoreResult, DenySubcode, SchedulerConfig, SessionConfig, SessionEvent};
use maestro_orchestrator::{HeuristicPlanner, Scheduler};
use maestro_policy::{AuditLog, PolicyDocument, PolicyEngine, RoleRules};
use maestro_registry::{AgentRecord, AgentRegistry};
use maestro_session::SessionStore;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Scripted behaviours per agent id.
enum Behavior {
    Ok(serde_json::Value),
    /// One value per call, in order.
    Script(Mutex<VecDeque<serde_json::Value>>),
    Fail,
    Slow(Duration, serde_json::Value),
}

struct MockTransport {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MockTransport {
    fn new(behaviors: HashMap<String, Behavior>) -> Self {
        Self {
            behaviors,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn count(&self, agent: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == agent)
            .count()
    }

    fn bodies_for(&self, agent: &str) -> Vec<serde_json::Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == agent)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl AgentTransport for MockTransport {
    async fn send(
        &self,
        _endpoint: &str,
        request: &InvocationRequest,
    ) -> CoreResult<serde_json::Value> {
        self.calls
            .lock()
            .unwrap()
            .push((request.agent_id.clone(), request.wire_body()));
        match self.behaviors.get(&request.agent_id) {
            None => Ok(serde_json::json!({"echo": request.input})),
            Some(Behavior::Ok(v)) => Ok(v.clone()),
            Some(Behavior::Script(script)) => Ok(script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| serde_json::json!({}))),
            Some(Behavior::Fail) => Err(CoreError::AgentFailed(format!(
                "{}: scripted failure",
                request.agent_id
            ))),
            Some(Behavior::Slow(delay, v)) => {
                tokio::time::sleep(*delay).await;
                Ok(v.clone())
            }
        }
    }
}

struct Fixture {
    scheduler: Scheduler,
    sessions: Arc<SessionStore>,
    policy: Arc<PolicyEngine>,
    transport: Arc<MockTransport>,
}

fn allow_all_for(role: &str) -> PolicyDocument {
    let mut doc = PolicyDocument::default();
    doc.roles.insert(
        role.to_string(),
        RoleRules {
            allow_agents: vec!["*".into()],
            ..Default::default()
        },
    );
    doc
}

async fn fixture(
    agents: &[(&str, &[&str])],
    behaviors: HashMap<String, Behavior>,
    doc: PolicyDocument,
) -> Fixture {
    let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
    for (id, caps) in agents {
        registry
            .register(AgentRecord::new(
                *id,
                format!("{id}-name"),
                caps.iter().map(|c| c.to_string()),
                format!("http://{id}"),
            ))
            .await
            .unwrap();
    }
    let sessions = SessionStore::new(SessionConfig::default());
    let policy = Arc::new(PolicyEngine::new(doc, Arc::new(AuditLog::new(256))));
    let transport = Arc::new(MockTransport::new(behaviors));
    let client = AgentClient::new(
        transport.clone(),
        RetryPolicy {
            max_retries: 0,
            backoff_base_ms: 0,
            backoff_cap_ms: 0,
        },
    );
    let scheduler = Scheduler::new(
        registry.clone(),
        policy.clone(),
        sessions.clone(),
        client,
        Arc::new(HeuristicPlanner),
        SchedulerConfig::default(),
    );
    Fixture {
        scheduler,
        sessions,
        policy,
        transport,
    }
}

async fn new_session(f: &Fixture) -> Uuid {
    f.sessions
        .create(Some("u1".into()), HashMap::new())
        .await
        .id
}

/// Compact event labels: `status:planning`, `status:agent_start:A1`,
/// `complete`, `error`, `closed`.
async fn event_labels(f: &Fixture, session_id: Uuid) -> Vec<String> {
    let cancel = CancellationToken::new();
    let (events, _) = f
        .sessions
        .dequeue_events(session_id, 0, &cancel)
        .await
        .unwrap();
    events
        .iter()
        .map(|q| match &q.event {
            SessionEvent::Status { phase, info } => {
                let phase = serde_json::to_value(phase).unwrap();
                match info.get("agent").and_then(|a| a.as_str()) {
                    Some(agent) => format!("status:{}:{agent}", phase.as_str().unwrap()),
                    None => format!("status:{}", phase.as_str().unwrap()),
                }
            }
            other => other.kind().to_string(),
        })
        .collect()
}

fn assert_subsequence(labels: &[String], expected: &[&str]) {
    let mut it = labels.iter();
    for want in expected {
        assert!(
            it.any(|l| l == want),
            "expected '{want}' in order within {labels:?}"
        );
    }
}

#[tokio::test]
async fn simple_auto_select_runs_single_agent() {
    let f = fixture(
        &[("A1", &["search"])],
        HashMap::new(),
        allow_all_for("analyst"),
    )
    .await;
    let sid = new_session(&f).await;

    let result = f
        .scheduler
        .handle_message(sid, "find users older than 30", None, None, Some("analyst".into()))
        .await
        .unwrap();

    assert_eq!(result.pattern, "simple");
    assert!(!result.user_override);
    assert_eq!(result.agents, vec!["A1"]);
    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0].status, InvocationStatus::Success);

    let labels = event_labels(&f, sid).await;
    assert_subsequence(
        &labels,
        &[
            "status:planning",
            "status:agent_start:A1",
            "status:agent_complete:A1",
            "complete",
        ],
    );
    assert_eq!(labels.last().unwrap(), "complete");
    assert_eq!(labels.iter().filter(|l| *l == "complete").count(), 1);

    // The session log holds the user message and the agent reply.
    let session = f.sessions.get(sid).await.unwrap();
    assert_eq!(session.messages.len(), 2);
}

#[tokio::test]
async fn sequential_override_chains_outputs() {
    let mut behaviors = HashMap::new();
    behaviors.insert(
        "A1".to_string(),
        Behavior::Ok(serde_json::json!({"rows": 3})),
    );
    let f = fixture(
        &[("A1", &["search"]), ("A2", &["reporting"])],
        behaviors,
        allow_all_for("analyst"),
    )
    .await;
    let sid = new_session(&f).await;

    let context = serde_json::json!({
        "orchestration_pattern": "sequential",
        "agent_sequence": ["A1", "A2"],
    });
    let result = f
        .scheduler
        .handle_message(sid, "report on users", Some(&context), None, Some("analyst".into()))
        .await
        .unwrap();

    assert!(result.user_override);
    assert_eq!(result.pattern, "sequential");
    assert_eq!(result.results.len(), 2);
    assert!(result.results.iter().all(|r| r.is_success()));

    // Step two saw step one's output.
    let bodies = f.transport.bodies_for("A2");
    assert_eq!(bodies[0]["context"]["previous_results"][0]["rows"], 3);

    let labels = event_labels(&f, sid).await;
    assert_subsequence(
        &labels,
        &[
            "status:agent_start:A1",
            "status:agent_complete:A1",
            "status:agent_start:A2",
            "status:agent_complete:A2",
            "complete",
        ],
    );
}

#[tokio::test]
async fn parallel_fail_fast_cancels_peers() {
    let mut behaviors = HashMap::new();
    behaviors.insert(
        "A1".to_string(),
        Behavior::Slow(Duration::from_millis(400), serde_json::json!({})),
    );
    behaviors.insert("A2".to_string(), Behavior::Fail);
    behaviors.insert(
        "A3".to_string(),
        Behavior::Slow(Duration::from_millis(400), serde_json::json!({})),
    );
    let f = fixture(
        &[("A1", &["a"]), ("A2", &["b"]), ("A3", &["c"])],
        behaviors,
        allow_all_for("analyst"),
    )
    .await;
    let sid = new_session(&f).await;

    let context = serde_json::json!({
        "orchestration_pattern": "parallel",
        "agents": ["A1", "A2", "A3"],
        "parallel_config": {"timeout": 30, "fail_fast": true},
    });
    let started = Instant::now();
    let result = f
        .scheduler
        .handle_message(sid, "fan out", Some(&context), None, Some("analyst".into()))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5), "well inside timeout");
    assert_eq!(result.results.len(), 3);
    // Positions match the plan's agent order.
    let ids: Vec<&str> = result.results.iter().map(|r| r.agent_id.as_str()).collect();
    assert_eq!(ids, vec!["A1", "A2", "A3"]);
    assert_eq!(result.results[1].status, InvocationStatus::Failed);
    for peer in [&result.results[0], &result.results[2]] {
        assert!(
            matches!(
                peer.status,
                InvocationStatus::Cancelled | InvocationStatus::Success
            ),
            "peer ended as {:?}",
            peer.status
        );
    }
    // The failure propagated fast enough that at least one peer was cut off.
    assert!(result
        .results
        .iter()
        .any(|r| r.status == InvocationStatus::Cancelled));

    let labels = event_labels(&f, sid).await;
    assert_eq!(labels.last().unwrap(), "complete");
}

#[tokio::test]
async fn parallel_without_fail_fast_reports_each_agent() {
    let mut behaviors = HashMap::new();
    behaviors.insert("A2".to_string(), Behavior::Fail);
    let f = fixture(
        &[("A1", &["a"]), ("A2", &["b"]), ("A3", &["c"])],
        behaviors,
        allow_all_for("analyst"),
    )
    .await;
    let sid = new_session(&f).await;

    let context = serde_json::json!({
        "orchestration_pattern": "parallel",
        "agents": ["A1", "A2", "A3"],
        "parallel_config": {"timeout": 30, "fail_fast": false},
    });
    let result = f
        .scheduler
        .handle_message(sid, "fan out", Some(&context), None, Some("analyst".into()))
        .await
        .unwrap();

    let statuses: Vec<InvocationStatus> = result.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            InvocationStatus::Success,
            InvocationStatus::Failed,
            InvocationStatus::Success
        ]
    );
}

#[tokio::test]
async fn loop_stops_when_condition_met() {
    let mut behaviors = HashMap::new();
    behaviors.insert(
        "A1".to_string(),
        Behavior::Ok(serde_json::json!({"step": "gather"})),
    );
    behaviors.insert(
        "A2".to_string(),
        Behavior::Script(Mutex::new(VecDeque::from(vec![
            serde_json::json!({"accuracy": 0.7}),
            serde_json::json!({"accuracy": 0.85}),
            serde_json::json!({"accuracy": 0.92}),
        ]))),
    );
    let f = fixture(
        &[("A1", &["gather"]), ("A2", &["refine"])],
        behaviors,
        allow_all_for("analyst"),
    )
    .await;
    let sid = new_session(&f).await;

    let context = serde_json::json!({
        "orchestration_pattern": "loop",
        "agents": ["A1", "A2"],
        "loop_config": {"max_iterations": 5, "condition": "accuracy > 0.9"},
    });
    let result = f
        .scheduler
        .handle_message(sid, "refine until accurate", Some(&context), None, Some("analyst".into()))
        .await
        .unwrap();

    assert_eq!(result.iterations_completed, Some(3));
    assert_eq!(result.iterations.as_ref().unwrap().len(), 3);
    // No fourth iteration was invoked.
    assert_eq!(f.transport.count("A2"), 3);
    assert_eq!(f.transport.count("A1"), 3);

    let labels = event_labels(&f, sid).await;
    assert_eq!(
        labels.iter().filter(|l| *l == "status:iteration").count(),
        3
    );
}

#[tokio::test]
async fn policy_denial_never_reaches_agent_client() {
    let mut doc = PolicyDocument::default();
    doc.roles.insert(
        "tool_user".to_string(),
        RoleRules {
            allow_agents: vec!["A1".into()],
            ..Default::default()
        },
    );
    let f = fixture(
        &[("A1", &["search"]), ("A_restricted", &["secrets"])],
        HashMap::new(),
        doc,
    )
    .await;
    let sid = new_session(&f).await;

    let context = serde_json::json!({"agents": ["A_restricted"]});
    let err = f
        .scheduler
        .handle_message(sid, "read secrets", Some(&context), None, Some("tool_user".into()))
        .await
        .unwrap_err();

    match &err {
        CoreError::Denied { subcode, .. } => assert_eq!(*subcode, DenySubcode::DefaultDeny),
        other => panic!("expected Denied, got {other:?}"),
    }
    assert_eq!(f.transport.count("A_restricted"), 0, "no invocation occurred");

    // Terminal error event carries the transaction id, and an audit entry
    // exists under the same id.
    let cancel = CancellationToken::new();
    let (events, _) = f.sessions.dequeue_events(sid, 0, &cancel).await.unwrap();
    let envelope = events
        .iter()
        .find_map(|q| match &q.event {
            SessionEvent::Error { error } => Some(error.clone()),
            _ => None,
        })
        .expect("terminal error event");
    assert_eq!(envelope.kind, "Denied");
    assert_eq!(envelope.subcode.as_deref(), Some("DefaultDeny"));
    let txn = envelope.transaction_id.unwrap();
    assert!(!f.policy.audit().by_transaction(txn).is_empty());
}

#[tokio::test]
async fn sequential_halts_after_failure_unless_optional() {
    let mut behaviors = HashMap::new();
    behaviors.insert("A1".to_string(), Behavior::Fail);
    let f = fixture(
        &[("A1", &["a"]), ("A2", &["b"])],
        behaviors,
        allow_all_for("analyst"),
    )
    .await;

    // Hard failure halts the chain: A2 is never invoked.
    let sid = new_session(&f).await;
    let context = serde_json::json!({
        "orchestration_pattern": "sequential",
        "agent_sequence": ["A1", "A2"],
    });
    let result = f
        .scheduler
        .handle_message(sid, "chain", Some(&context), None, Some("analyst".into()))
        .await
        .unwrap();
    assert_eq!(result.results.len(), 1);
    assert_eq!(f.transport.count("A2"), 0);

    // Marked optional, the chain continues past the failure.
    let sid = new_session(&f).await;
    let context = serde_json::json!({
        "orchestration_pattern": "sequential",
        "agent_sequence": ["A1", "A2"],
        "optional_agents": ["A1"],
    });
    let result = f
        .scheduler
        .handle_message(sid, "chain", Some(&context), None, Some("analyst".into()))
        .await
        .unwrap();
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.results[1].status, InvocationStatus::Success);
}

#[tokio::test]
async fn parallel_drops_denied_agents_and_proceeds() {
    let mut doc = PolicyDocument::default();
    doc.roles.insert(
        "analyst".to_string(),
        RoleRules {
            allow_agents: vec!["A1".into()],
            ..Default::default()
        },
    );
    let f = fixture(&[("A1", &["a"]), ("A2", &["b"])], HashMap::new(), doc).await;
    let sid = new_session(&f).await;

    let context = serde_json::json!({
        "orchestration_pattern": "parallel",
        "agents": ["A1", "A2"],
        "parallel_config": {"timeout": 10},
    });
    let result = f
        .scheduler
        .handle_message(sid, "fan out", Some(&context), None, Some("analyst".into()))
        .await
        .unwrap();

    assert_eq!(result.agents, vec!["A1"]);
    assert_eq!(result.results.len(), 1);
    assert_eq!(f.transport.count("A2"), 0);
}

#[tokio::test]
async fn empty_registry_yields_no_eligible_agent() {
    let f = fixture(&[], HashMap::new(), allow_all_for("analyst")).await;
    let sid = new_session(&f).await;

    let err = f
        .scheduler
        .handle_message(sid, "anything", None, None, Some("analyst".into()))
        .await
        .unwrap_err();
    match err {
        CoreError::Denied { subcode, .. } => {
            assert_eq!(subcode, DenySubcode::NoEligibleAgent)
        }
        other => panic!("expected Denied, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_pinned_agent_is_rejected_before_execution() {
    let f = fixture(&[("A1", &["a"])], HashMap::new(), allow_all_for("analyst")).await;
    let sid = new_session(&f).await;

    let context = serde_json::json!({"agents": ["ghost"]});
    let err = f
        .scheduler
        .handle_message(sid, "go", Some(&context), None, Some("analyst".into()))
        .await
        .unwrap_err();
    match err {
        CoreError::Denied { subcode, .. } => {
            assert_eq!(subcode, DenySubcode::NoEligibleAgent)
        }
        other => panic!("expected Denied, got {other:?}"),
    }
    assert_eq!(f.transport.count("ghost"), 0);
}
