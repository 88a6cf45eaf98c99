use crate::document::PolicyDocument;
use crate::engine::PolicyEngine;
use async_trait::async_trait;
use maestro_core::{CoreError, CoreResult};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// External policy source, consulted before the local document. Static for
/// a given reload cycle; never fetched per call.
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    async fn fetch(&self) -> CoreResult<Option<PolicyDocument>>;
}

/// Resolves the active policy from, in order: an external provider, a local
/// TOML document, built-in defaults (deny everything). First non-empty
/// source wins.
pub struct PolicyLoader {
    provider: Option<Arc<dyn PolicyProvider>>,
    path: Option<PathBuf>,
}

impl PolicyLoader {
    pub fn new(provider: Option<Arc<dyn PolicyProvider>>, path: Option<PathBuf>) -> Self {
        Self { provider, path }
    }

    pub fn from_path(path: PathBuf) -> Self {
        Self {
            provider: None,
            path: Some(path),
        }
    }

    pub async fn load(&self) -> CoreResult<PolicyDocument> {
        if let Some(provider) = &self.provider {
            match provider.fetch().await {
                Ok(Some(doc)) => {
                    doc.validate().map_err(CoreError::ConfigError)?;
                    info!(source = "provider", "policy loaded");
                    return Ok(doc);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "policy provider failed, trying local document"),
            }
        }

        if let Some(path) = &self.path {
            let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                CoreError::ConfigError(format!("cannot read policy '{}': {e}", path.display()))
            })?;
            let doc: PolicyDocument = toml::from_str(&raw).map_err(|e| {
                CoreError::ConfigError(format!("cannot parse policy '{}': {e}", path.display()))
            })?;
            doc.validate().map_err(CoreError::ConfigError)?;
            info!(source = %path.display(), "policy loaded");
            return Ok(doc);
        }

        info!(source = "defaults", "policy loaded");
        Ok(PolicyDocument::default())
    }

    /// Load and publish a fresh document. On any failure the previously
    /// active policy remains in force and the error is surfaced to the
    /// caller only.
    pub async fn reload_into(&self, engine: &PolicyEngine) -> CoreResult<()> {
        match self.load().await {
            Ok(doc) => {
                engine.swap(doc);
                info!("policy reloaded");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "policy reload failed, keeping active document");
                Err(e)
            }
        }
    }
}
