use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::dispatch::{DeliveryPayload, HookDelivery};
use crate::hooks::{compile_all, HookConfig, HookSet, HookSource};
use crate::identity::Author;

/// HTTP client for the gateway collaborator: hook configuration loads,
/// hook deliveries, and profile enhancement.
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

#[derive(Debug, Deserialize, Default)]
struct RawHookSet {
    #[serde(default)]
    hooks: Vec<HookConfig>,
    #[serde(default)]
    profile_data: Vec<HookConfig>,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl HookSource for HttpGateway {
    async fn load_hooks(&self) -> Result<HookSet> {
        let response = self
            .client
            .get(&self.config.hooks_url)
            .send()
            .await
            .context("Failed to reach hook configuration source")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("hook configuration source returned {status}");
        }

        let raw: RawHookSet = response
            .json()
            .await
            .context("Failed to parse hook configuration")?;
        Ok(HookSet {
            hooks: compile_all(raw.hooks),
            profile_data: compile_all(raw.profile_data),
        })
    }
}

#[async_trait]
impl HookDelivery for HttpGateway {
    async fn send_to_hook(&self, hook: &HookConfig, payload: &DeliveryPayload) -> Result<String> {
        debug!("delivering to {}", hook.url);
        let response = self
            .client
            .post(&hook.url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("delivery to {} failed", hook.url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("hook at {} returned {status}", hook.url);
        }

        response
            .text()
            .await
            .with_context(|| format!("could not read response from {}", hook.url))
    }

    /// Sends the author record to a profile hook and overlays whatever
    /// object comes back onto it. A non-object response leaves the record
    /// untouched.
    async fn enhance_profile(&self, hook: &HookConfig, author: &Author) -> Result<Author> {
        let response = self
            .client
            .post(&hook.url)
            .json(author)
            .send()
            .await
            .with_context(|| format!("profile hook {} unreachable", hook.url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("profile hook {} returned {status}", hook.url);
        }

        let extra: serde_json::Value = match response.json().await {
            Ok(value) => value,
            Err(_) => return Ok(author.clone()),
        };
        let serde_json::Value::Object(extra) = extra else {
            return Ok(author.clone());
        };

        let mut merged = serde_json::to_value(author).context("author is serializable")?;
        if let Some(map) = merged.as_object_mut() {
            map.extend(extra);
        }
        serde_json::from_value(merged)
            .with_context(|| format!("profile hook {} returned incompatible fields", hook.url))
    }
}
