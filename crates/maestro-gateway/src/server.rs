use crate::state::AppState;
use crate::{sse, ws};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use maestro_core::{CoreError, Message, Role};
use maestro_registry::{AgentHealth, AgentRecord};
use maestro_tools::{handle_rpc, RpcRequest};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// The HTTP surface: request/response messages, SSE streaming, the
/// bidirectional socket, session lifecycle, registry and policy admin.
pub struct GatewayServer;

impl GatewayServer {
    pub fn build(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/sessions", post(create_session))
            .route("/sessions/{id}", get(get_session).delete(close_session))
            .route("/messages", post(post_message))
            .route("/stream", get(sse::stream))
            .route("/ws", get(ws::ws_handler))
            .route("/agents", get(list_agents))
            .route("/agents/register", post(register_agent))
            .route("/agents/{id}/heartbeat", post(agent_heartbeat))
            .route("/capabilities", get(list_capabilities))
            .route("/patterns", get(list_patterns))
            .route("/override-options", get(override_options))
            .route("/metrics", get(metrics))
            .route("/policy/reload", post(reload_policy))
            .route("/tools/rpc", post(tools_rpc))
            .with_state(state)
    }
}

/// Structured envelope; raw server errors never reach the wire.
pub fn error_response(err: &CoreError) -> Response {
    let status = match err {
        CoreError::SessionNotFound(_) | CoreError::SessionExpired(_) | CoreError::ToolNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        CoreError::SessionClosed(_) => StatusCode::CONFLICT,
        CoreError::InvalidRequest(_) | CoreError::ConfigError(_) => StatusCode::BAD_REQUEST,
        CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        CoreError::Denied { .. } => StatusCode::FORBIDDEN,
        CoreError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::TimedOut(_) | CoreError::ToolTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CoreError::AgentUnreachable(_) | CoreError::AgentFailed(_) | CoreError::ToolFailed(_) => {
            StatusCode::BAD_GATEWAY
        }
        CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err.to_envelope(None))).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let agents = state.registry.list_all(None).await;
    Json(serde_json::json!({
        "status": "ok",
        "service": "maestro",
        "sessions": state.sessions.count().await,
        "agents": agents.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    user_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

fn session_body(session: &maestro_session::Session) -> serde_json::Value {
    serde_json::json!({
        "session_id": session.id,
        "user_id": session.user_id,
        "status": session.status,
        "created_at": session.created_at,
        "last_touched": session.last_touched,
        "message_count": session.messages.len(),
    })
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    let session = state
        .sessions
        .create(request.user_id, request.metadata)
        .await;
    (StatusCode::CREATED, Json(session_body(&session))).into_response()
}

async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.sessions.get(id).await {
        Ok(session) => Json(session_body(&session)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn close_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.sessions.close(id).await {
        Ok(()) => Json(serde_json::json!({"status": "closed", "session_id": id})).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    session_id: Uuid,
    content: String,
    context: Option<serde_json::Value>,
}

/// Sync transport: blocks until the terminal event and returns the
/// aggregated result.
async fn post_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PostMessageRequest>,
) -> Response {
    let identity = match state.auth.identify(&headers) {
        Ok(identity) => identity,
        Err(e) => return error_response(&e),
    };
    match state
        .scheduler
        .handle_message(
            request.session_id,
            &request.content,
            request.context.as_ref(),
            identity.user_id,
            identity.role,
        )
        .await
    {
        Ok(result) => Json(serde_json::json!({
            "session_id": request.session_id,
            "summary": result.summary(),
            "result": result.to_value(),
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let agents = state.registry.list_all(None).await;
    Json(serde_json::json!({ "agents": agents }))
}

#[derive(Debug, Deserialize)]
struct RegisterAgentRequest {
    id: String,
    name: String,
    #[serde(default)]
    capabilities: Vec<String>,
    endpoint: String,
    max_capacity: Option<u32>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

/// Self-registration endpoint for specialized agents.
async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterAgentRequest>,
) -> Response {
    let mut record = AgentRecord::new(
        request.id.clone(),
        request.name,
        request.capabilities,
        request.endpoint,
    );
    if let Some(capacity) = request.max_capacity {
        record = record.with_capacity(capacity);
    }
    record.metadata = request.metadata;
    match state.registry.register(record).await {
        Ok(()) => {
            info!(agent_id = %request.id, "agent registered via gateway");
            Json(serde_json::json!({"status": "registered", "agent_id": request.id}))
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    load: u32,
    status: Option<AgentHealth>,
}

async fn agent_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> Response {
    match state
        .registry
        .heartbeat(&id, request.load, request.status)
        .await
    {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_capabilities(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.registry.capability_snapshot().await;
    Json(serde_json::json!({ "capabilities": snapshot }))
}

async fn list_patterns() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "patterns": [
            {"name": "simple", "description": "Single agent handles the request"},
            {"name": "sequential", "description": "Agents run in order; each output feeds the next step"},
            {"name": "parallel", "description": "Agents run concurrently under a shared deadline"},
            {"name": "loop", "description": "Agents repeat until a condition is met or iterations run out"},
        ]
    }))
}

async fn override_options() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "context_keys": {
            "orchestration_pattern": "simple | sequential | parallel | loop",
            "agents": "list of agent ids",
            "agent_sequence": "ordered agent ids for sequential plans",
            "parallel_config": {"timeout": "seconds", "fail_fast": "bool"},
            "loop_config": {"max_iterations": "int", "condition": "e.g. accuracy > 0.9"},
            "optional_agents": "sequential steps allowed to fail",
            "timeout_seconds": "per-invocation ceiling",
        }
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let agents = state.registry.list_all(None).await;
    let healthy = agents
        .iter()
        .filter(|a| a.health == AgentHealth::Healthy)
        .count();
    let degraded = agents
        .iter()
        .filter(|a| a.health == AgentHealth::Degraded)
        .count();
    let unreachable = agents
        .iter()
        .filter(|a| a.health == AgentHealth::Unreachable)
        .count();
    let total_load: u32 = agents.iter().map(|a| a.record.load).sum();
    let total_capacity: u32 = agents.iter().map(|a| a.record.max_capacity).sum();
    let (allowed, denied) = state.policy.audit().decision_counts();
    Json(serde_json::json!({
        "sessions": state.sessions.count().await,
        "scheduler_queue_depth": state.scheduler.queue_depth(),
        "agents": {
            "total": agents.len(),
            "healthy": healthy,
            "degraded": degraded,
            "unreachable": unreachable,
            "total_load": total_load,
            "total_capacity": total_capacity,
        },
        "policy": {"allowed": allowed, "denied": denied},
    }))
}

/// Admin: atomically publish a fresh policy document. On failure the old
/// policy stays in force.
async fn reload_policy(State(state): State<Arc<AppState>>) -> Response {
    match state.policy_loader.reload_into(&state.policy).await {
        Ok(()) => Json(serde_json::json!({"status": "reloaded"})).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Tool-server protocol endpoint for specialized agents.
async fn tools_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RpcRequest>,
) -> Json<maestro_tools::RpcResponse> {
    Json(handle_rpc(&state.tools, request, None).await)
}

/// Shared by the socket transport for history frames.
pub(crate) fn history_body(messages: &[Message]) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "role": match m.role {
                    Role::User => "user",
                    Role::Agent => "agent",
                    Role::System => "system",
                },
                "content": m.content,
                "timestamp": m.timestamp,
                "metadata": m.metadata,
            })
        })
        .collect();
    serde_json::json!({"type": "history", "messages": entries})
}
