//! Adapters for the shared enterprise backends. The backends themselves are
//! opaque: each adapter shapes parameters and delegates to a connector.

use crate::adapter::{ToolAdapter, ToolDescriptor};
use async_trait::async_trait;
use maestro_core::{CoreError, CoreResult, TransactionContext};
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque access to a named backend service (database, document store,
/// analytics engine).
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn execute(&self, service: &str, request: serde_json::Value) -> CoreResult<serde_json::Value>;
}

/// HTTP connector: `POST {base}/execute` per configured service.
pub struct HttpBackendConnector {
    client: reqwest::Client,
    endpoints: HashMap<String, String>,
}

impl HttpBackendConnector {
    pub fn new(endpoints: HashMap<String, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }
}

#[async_trait]
impl BackendConnector for HttpBackendConnector {
    async fn execute(&self, service: &str, request: serde_json::Value) -> CoreResult<serde_json::Value> {
        let base = self
            .endpoints
            .get(service)
            .ok_or_else(|| CoreError::ToolFailed(format!("no backend configured for '{service}'")))?;
        let url = format!("{}/execute", base.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::ToolFailed(format!("backend '{service}': {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::ToolFailed(format!(
                "backend '{service}' returned {}",
                response.status()
            )));
        }
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| CoreError::ToolFailed(format!("backend '{service}': bad body: {e}")))
    }
}

fn required_str<'a>(arguments: &'a serde_json::Value, key: &str) -> CoreResult<&'a str> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::InvalidRequest(format!("missing required argument '{key}'")))
}

/// SQL-ish search over the enterprise database.
pub struct DatabaseQueryTool {
    descriptor: ToolDescriptor,
    connector: Arc<dyn BackendConnector>,
}

impl DatabaseQueryTool {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            descriptor: ToolDescriptor::new(
                "query_database",
                "Search the enterprise database",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "database": {"type": "string"},
                        "limit": {"type": "integer"}
                    },
                    "required": ["query"]
                }),
            ),
            connector,
        }
    }
}

#[async_trait]
impl ToolAdapter for DatabaseQueryTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(
        &self,
        arguments: serde_json::Value,
        ctx: &TransactionContext,
    ) -> CoreResult<serde_json::Value> {
        let query = required_str(&arguments, "query")?;
        let request = serde_json::json!({
            "query": query,
            "database": arguments.get("database").cloned().unwrap_or_else(|| "default".into()),
            "limit": arguments.get("limit").cloned().unwrap_or_else(|| 100.into()),
            "transaction_id": ctx.transaction_id,
        });
        self.connector.execute("database", request).await
    }
}

/// Full-text search over enterprise document repositories.
pub struct DocumentSearchTool {
    descriptor: ToolDescriptor,
    connector: Arc<dyn BackendConnector>,
}

impl DocumentSearchTool {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            descriptor: ToolDescriptor::new(
                "search_documents",
                "Search enterprise document repositories",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "repository": {"type": "string"},
                        "limit": {"type": "integer"}
                    },
                    "required": ["query"]
                }),
            ),
            connector,
        }
    }
}

#[async_trait]
impl ToolAdapter for DocumentSearchTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(
        &self,
        arguments: serde_json::Value,
        ctx: &TransactionContext,
    ) -> CoreResult<serde_json::Value> {
        let query = required_str(&arguments, "query")?;
        let request = serde_json::json!({
            "query": query,
            "repository": arguments.get("repository").cloned().unwrap_or_else(|| "enterprise_docs".into()),
            "limit": arguments.get("limit").cloned().unwrap_or_else(|| 10.into()),
            "transaction_id": ctx.transaction_id,
        });
        self.connector.execute("documents", request).await
    }
}

/// Analytics and model runs against a named data source.
pub struct AnalyticsTool {
    descriptor: ToolDescriptor,
    connector: Arc<dyn BackendConnector>,
}

impl AnalyticsTool {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            descriptor: ToolDescriptor::new(
                "run_analytics",
                "Run analytics against enterprise data sources",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "analysis_type": {"type": "string"},
                        "data_source": {"type": "string"},
                        "parameters": {"type": "object"}
                    },
                    "required": ["analysis_type", "data_source"]
                }),
            ),
            connector,
        }
    }
}

#[async_trait]
impl ToolAdapter for AnalyticsTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(
        &self,
        arguments: serde_json::Value,
        ctx: &TransactionContext,
    ) -> CoreResult<serde_json::Value> {
        let analysis_type = required_str(&arguments, "analysis_type")?;
        let data_source = required_str(&arguments, "data_source")?;
        let request = serde_json::json!({
            "analysis_type": analysis_type,
            "data_source": data_source,
            "parameters": arguments.get("parameters").cloned().unwrap_or_else(|| serde_json::json!({})),
            "transaction_id": ctx.transaction_id,
        });
        self.connector.execute("analytics", request).await
    }
}
