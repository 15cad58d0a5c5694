use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::transport::{CoalescedGet, Transport};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderSettings {
    #[serde(default)]
    pub model: Option<String>,
}

/// Server-persisted settings document: the active provider and each
/// provider's configured model.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub active_provider: Option<String>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

impl Settings {
    pub fn active_model(&self) -> Option<&str> {
        let provider = self.active_provider.as_deref()?;
        self.providers.get(provider)?.model.as_deref()
    }
}

/// Configuration boundary. Settings are an idempotent GET, so concurrent
/// loads coalesce into one request and the result is cached until `reload`.
pub struct SettingsProvider {
    loader: CoalescedGet,
}

impl SettingsProvider {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            loader: CoalescedGet::new(transport, "settings"),
        }
    }

    pub async fn load(&self) -> Result<Settings> {
        let value = self.loader.load().await?;
        serde_json::from_value(value).map_err(Into::into)
    }

    pub async fn reload(&self) -> Result<Settings> {
        let value = self.loader.reload().await?;
        serde_json::from_value(value).map_err(Into::into)
    }

    /// An explicitly passed model always wins and skips the network. With no
    /// explicit model the active provider's configured model is used; having
    /// neither is an `ExecutionRejected` before any wire call carries a
    /// blank model.
    pub async fn resolve_model(&self, explicit: Option<&str>) -> Result<String> {
        if let Some(model) = explicit.map(str::trim).filter(|model| !model.is_empty()) {
            return Ok(model.to_string());
        }
        let settings = self.load().await?;
        settings
            .active_model()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::ExecutionRejected(
                    "no model configured; pass --model or configure a provider".to_string(),
                )
            })
    }
}
