use async_trait::async_trait;
use maestro_core::{CoreResult, TransactionContext};
use serde::{Deserialize, Serialize};

/// Static description registered with the tool server at start-up. The
/// policy engine consults `input_schema` property names for parameter
/// validation; clients see it through `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A named handler exposing one typed operation to specialized agents.
/// Registered in a table keyed by name; the backend it fronts is opaque.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn call(
        &self,
        arguments: serde_json::Value,
        ctx: &TransactionContext,
    ) -> CoreResult<serde_json::Value>;
}
