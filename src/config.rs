use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub slack: SlackConfig,
    pub gateway: GatewayConfig,
    #[serde(default = "default_delivery_config")]
    pub delivery: DeliveryConfig,
    #[serde(default = "default_control_config")]
    pub control: ControlConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    pub token: String,
    #[serde(default = "default_slack_base_url")]
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Endpoint serving the hook configuration document.
    pub hooks_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Run each hook delivery on its own task instead of inline.
    #[serde(default = "default_concurrent")]
    pub concurrent: bool,
    /// Cap on simultaneously in-flight deliveries when concurrent.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    /// Bind address for the cache introspection server.
    #[serde(default = "default_control_bind")]
    pub bind: String,
}

fn default_slack_base_url() -> String {
    "https://slack.com/api".to_string()
}

fn default_concurrent() -> bool {
    true
}

fn default_max_in_flight() -> usize {
    16
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_control_bind() -> String {
    "127.0.0.1:8718".to_string()
}

fn default_delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        concurrent: default_concurrent(),
        max_in_flight: default_max_in_flight(),
        timeout_secs: default_timeout_secs(),
    }
}

fn default_control_config() -> ControlConfig {
    ControlConfig {
        bind: default_control_bind(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}
