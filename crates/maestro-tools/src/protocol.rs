//! Request/response envelope for the tool-server protocol.

use crate::server::ToolServer;
use maestro_core::TransactionContext;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub id: serde_json::Value,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn ok(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: serde_json::Value, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
    #[serde(default)]
    auth_token: String,
}

/// Dispatch one protocol request. `tools/list` needs no auth; `tools/call`
/// authenticates inside the server.
pub async fn handle_rpc(
    server: &ToolServer,
    request: RpcRequest,
    parent: Option<&TransactionContext>,
) -> RpcResponse {
    match request.method.as_str() {
        "tools/list" => {
            let tools = server.list();
            match serde_json::to_value(tools) {
                Ok(value) => RpcResponse::ok(request.id, value),
                Err(e) => RpcResponse::err(request.id, "Internal", e.to_string()),
            }
        }
        "tools/call" => {
            let params: CallParams = match serde_json::from_value(request.params) {
                Ok(p) => p,
                Err(e) => {
                    return RpcResponse::err(
                        request.id,
                        "InvalidRequest",
                        format!("bad tools/call params: {e}"),
                    )
                }
            };
            match server
                .call(&params.name, params.arguments, &params.auth_token, parent)
                .await
            {
                Ok(result) => match serde_json::to_value(result) {
                    Ok(value) => RpcResponse::ok(request.id, value),
                    Err(e) => RpcResponse::err(request.id, "Internal", e.to_string()),
                },
                Err(e) => RpcResponse::err(request.id, e.kind(), e.to_string()),
            }
        }
        other => RpcResponse::err(
            request.id,
            "InvalidRequest",
            format!("unknown method '{other}'"),
        ),
    }
}
