use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DeliveryPayload, Dispatcher};
use crate::hooks::{CompiledHook, HookSource};
use crate::identity::{Author, Channel, IdentityCache};
use crate::normalize::MessageNormalizer;

/// One inbound chat event, as handed over by the transport collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub user: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    pub ts: String,
}

/// Connection lifecycle as seen by the bridge. `Closing` and `Closed` are
/// terminal; reconnection belongs to the transport, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Live,
    Closing,
    Closed,
}

/// Ties the pipeline together: identity resolution, normalization, hook
/// matching, and dispatch. The transport drives it through the `on_*`
/// callbacks, one inbound event at a time.
pub struct Bridge {
    platform_tag: String,
    server: String,
    identities: Arc<IdentityCache>,
    normalizer: MessageNormalizer,
    hook_source: Arc<dyn HookSource>,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<LinkState>,
}

impl Bridge {
    pub fn new(
        server: String,
        identities: Arc<IdentityCache>,
        hook_source: Arc<dyn HookSource>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            platform_tag: "slack".to_string(),
            server,
            identities,
            normalizer: MessageNormalizer::new(),
            hook_source,
            dispatcher,
            state: Mutex::new(LinkState::Connecting),
        }
    }

    pub async fn state(&self) -> LinkState {
        *self.state.lock().await
    }

    pub async fn on_hello(&self) {
        info!("Connected to '{}'", self.server);
    }

    pub async fn on_close(&self) {
        *self.state.lock().await = LinkState::Closing;
        info!("Client is about to disconnect");
    }

    pub async fn on_closed(&self) {
        *self.state.lock().await = LinkState::Closed;
        info!("Client has disconnected");
    }

    /// Inbound-message callback. The very first event flips Connecting to
    /// Live and is dropped unprocessed, so reconnects do not replay the
    /// last message of the previous session.
    pub async fn on_message(&self, message: InboundMessage) {
        {
            let mut state = self.state.lock().await;
            match *state {
                LinkState::Connecting => {
                    *state = LinkState::Live;
                    debug!("link is live; suppressed first event {}", message.ts);
                    return;
                }
                LinkState::Live => {}
                LinkState::Closing | LinkState::Closed => {
                    warn!("dropping event {} received after disconnect", message.ts);
                    return;
                }
            }
        }

        if message.hidden {
            return;
        }

        if let Err(e) = self.process(&message).await {
            error!("failed to process event {}: {e:#}", message.ts);
        }
    }

    async fn process(&self, message: &InboundMessage) -> Result<()> {
        let hooks = self.hook_source.load_hooks().await?;

        debug!("processing {:?}", message);

        let channel = match self
            .identities
            .resolve_channel(&message.channel, &message.user)
            .await
        {
            Ok(channel) => Some(channel),
            Err(e) => {
                warn!("{e}");
                None
            }
        };

        let author = self
            .resolve_author(message, channel.as_ref(), &hooks.profile_data)
            .await;

        let text = self
            .normalizer
            .normalize(&message.text, message, &self.identities)
            .await;

        // Without a resolved channel no filter can be evaluated, so no hook
        // fires for this message.
        let Some(channel) = channel else {
            return Ok(());
        };

        // Every hook is evaluated, in configuration order; every match
        // fires. This is not first-match-wins.
        for hook in &hooks.hooks {
            if !hook.channel_match(&channel.display_name, &self.server) {
                continue;
            }
            let Some(matched) = hook.text_match(&text) else {
                continue;
            };

            info!(
                "Matched hook {:?}, posting to {}",
                hook.config.pattern, hook.config.url
            );

            let payload = DeliveryPayload {
                timestamp: message.ts.clone(),
                platform: self.platform_tag.clone(),
                server: self.server.clone(),
                channel: channel.clone(),
                author: author.clone(),
                category: hook.config.category.clone(),
                text: text.clone(),
                captures: std::iter::once(Some(matched.full))
                    .chain(matched.captures)
                    .collect(),
            };
            self.dispatcher
                .clone()
                .dispatch(hook.config.clone(), payload, message.channel.clone())
                .await;
        }

        Ok(())
    }

    /// Resolves the message author, running profile-enhancement hooks the
    /// first time a uid is seen. The enhanced record is what gets cached.
    async fn resolve_author(
        &self,
        message: &InboundMessage,
        channel: Option<&Channel>,
        profile_hooks: &[CompiledHook],
    ) -> Option<Author> {
        if let Some(author) = self.identities.cached_author(&message.user).await {
            return Some(author);
        }

        let mut author = match self.identities.resolve_author(&message.user).await {
            Ok(author) => author,
            Err(e) => {
                warn!("{e}");
                return None;
            }
        };

        if let Some(channel) = channel {
            for hook in profile_hooks {
                if !hook.channel_match(&channel.display_name, &self.server) {
                    continue;
                }
                debug!("enhancing profile {} via {}", author.uid, hook.config.url);
                author = self.dispatcher.enhance_profile(&hook.config, author).await;
            }
            self.identities.update_author(author.clone()).await;
        }

        Some(author)
    }
}
