//! Authentication collaborator consumed by the command engine.

use async_trait::async_trait;
use tracing::info;

use crate::{
    config::Config,
    error::{EngineError, EngineResult},
};

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Identity used to pre-fill the connect command, when one is cached.
    fn identity_hint(&self) -> Option<String>;

    /// Bearer token for a secondary remote channel.
    async fn bearer_token(&self, scope: &str) -> EngineResult<String>;

    /// Opens the interactive consent path before the hint-less connect retry.
    async fn begin_interactive(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Reads the identity hint and tokens from configuration.
#[derive(Debug, Clone)]
pub struct ConfigAuth {
    cfg: Config,
}

impl ConfigAuth {
    pub fn from_config(cfg: &Config) -> Self {
        Self { cfg: cfg.clone() }
    }
}

#[async_trait]
impl AuthProvider for ConfigAuth {
    fn identity_hint(&self) -> Option<String> {
        self.cfg
            .get("ADMIN_UPN")
            .filter(|s| !s.trim().is_empty())
    }

    async fn bearer_token(&self, scope: &str) -> EngineResult<String> {
        self.cfg.token_for_scope(scope).ok_or_else(|| {
            EngineError::Auth(format!(
                "no token configured for scope {scope}; set ADMIN_TOKEN or a scope-specific ADMIN_TOKEN_* key"
            ))
        })
    }

    async fn begin_interactive(&self) -> EngineResult<()> {
        info!("falling back to interactive sign-in; follow the prompt from the remote service");
        Ok(())
    }
}
