use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

/// One configured forwarding rule, as served by the gateway. Read-only to
/// the bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    /// Channel filter. Absent or `"*"` matches every channel.
    #[serde(default)]
    pub channel: Option<String>,
    /// Regex evaluated against the normalized message text. Profile hooks
    /// carry no pattern.
    #[serde(rename = "match", default)]
    pub pattern: Option<String>,
    pub url: String,
    #[serde(rename = "type", default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "message".to_string()
}

/// A text-pattern match against a hook.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMatch {
    pub full: String,
    /// Captured groups in order, `None` for groups that did not participate.
    pub captures: Vec<Option<String>>,
}

/// A hook whose text pattern was compiled once at load time.
#[derive(Debug, Clone)]
pub struct CompiledHook {
    pub config: HookConfig,
    pattern: Option<Regex>,
}

impl CompiledHook {
    pub fn compile(config: HookConfig) -> Result<Self> {
        let pattern = match &config.pattern {
            Some(p) => Some(
                Regex::new(p).with_context(|| format!("bad hook pattern '{p}'"))?,
            ),
            None => None,
        };
        Ok(Self { config, pattern })
    }

    /// A hook with no channel filter matches every channel. Otherwise the
    /// filter is compared against the resolved display name, ignoring case,
    /// an optional leading `#`, and an optional `server/` prefix.
    pub fn channel_match(&self, channel_name: &str, server: &str) -> bool {
        let Some(filter) = self.config.channel.as_deref() else {
            return true;
        };
        if filter == "*" {
            return true;
        }
        let scoped = format!("{server}/");
        let filter = filter.strip_prefix(&scoped).unwrap_or(filter);
        filter
            .trim_start_matches('#')
            .eq_ignore_ascii_case(channel_name.trim_start_matches('#'))
    }

    /// Evaluates the hook's pattern against normalized text. Hooks without
    /// a pattern never match.
    pub fn text_match(&self, text: &str) -> Option<TextMatch> {
        let pattern = self.pattern.as_ref()?;
        let caps = pattern.captures(text)?;
        let full = caps.get(0)?.as_str().to_string();
        let captures = caps
            .iter()
            .skip(1)
            .map(|group| group.map(|m| m.as_str().to_string()))
            .collect();
        Some(TextMatch { full, captures })
    }
}

/// Compiles a batch of hook configs, dropping (with a log line) any whose
/// pattern fails to compile so one bad hook cannot take the set down.
pub fn compile_all(configs: Vec<HookConfig>) -> Vec<CompiledHook> {
    configs
        .into_iter()
        .filter_map(|config| match CompiledHook::compile(config) {
            Ok(hook) => Some(hook),
            Err(e) => {
                warn!("skipping hook: {e:#}");
                None
            }
        })
        .collect()
}

/// The hook configuration for one message: general forwarding hooks plus
/// profile-enhancement hooks, both in configuration order.
#[derive(Debug, Clone, Default)]
pub struct HookSet {
    pub hooks: Vec<CompiledHook>,
    pub profile_data: Vec<CompiledHook>,
}

/// Source of hook configuration. Called once per inbound message; the
/// bridge caches nothing here.
#[async_trait]
pub trait HookSource: Send + Sync {
    async fn load_hooks(&self) -> Result<HookSet>;
}
