use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::config::DeliveryConfig;
use crate::error::BridgeError;
use crate::hooks::HookConfig;
use crate::identity::{Author, Channel, IdentityCache};
use crate::normalize::ACTION_PREFIX;

/// Outbound half of the chat platform API.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<()>;
    async fn post_action(&self, channel_id: &str, text: &str) -> Result<()>;
}

/// Gateway delivery interface.
#[async_trait]
pub trait HookDelivery: Send + Sync {
    /// POSTs the payload to the hook's target URL, returning the raw
    /// response body.
    async fn send_to_hook(&self, hook: &HookConfig, payload: &DeliveryPayload) -> Result<String>;

    /// POSTs an author record to a profile hook, returning the (possibly)
    /// enhanced record.
    async fn enhance_profile(&self, hook: &HookConfig, author: &Author) -> Result<Author>;
}

/// What a matched hook receives.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryPayload {
    pub timestamp: String,
    pub platform: String,
    pub server: String,
    pub channel: Channel,
    pub author: Option<Author>,
    #[serde(rename = "type")]
    pub category: String,
    pub text: String,
    /// Index 0 is the full match, the rest are captured groups.
    pub captures: Vec<Option<String>>,
}

/// Delivers matched events to hook targets and routes structured responses
/// back into chat.
///
/// Deliveries either run inline or, when `concurrent` is set, on their own
/// task behind a semaphore so bursty traffic cannot pile up unbounded
/// in-flight requests. Every delivery is capped by a timeout.
pub struct Dispatcher {
    chat: Arc<dyn ChatSender>,
    gateway: Arc<dyn HookDelivery>,
    identities: Arc<IdentityCache>,
    concurrent: bool,
    timeout: Duration,
    in_flight: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        chat: Arc<dyn ChatSender>,
        gateway: Arc<dyn HookDelivery>,
        identities: Arc<IdentityCache>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            chat,
            gateway,
            identities,
            concurrent: config.concurrent,
            timeout: Duration::from_secs(config.timeout_secs),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
        }
    }

    /// Hands one matched event to its hook. `origin_channel` is where a
    /// structured response gets replied to.
    pub async fn dispatch(
        self: Arc<Self>,
        hook: HookConfig,
        payload: DeliveryPayload,
        origin_channel: String,
    ) {
        if !self.concurrent {
            self.deliver(&hook, &payload, &origin_channel).await;
            return;
        }

        let permit = match self.in_flight.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        tokio::spawn(async move {
            let _in_flight = permit;
            self.deliver(&hook, &payload, &origin_channel).await;
        });
    }

    /// One delivery, errors captured here so a failing hook never disturbs
    /// its siblings or later messages.
    async fn deliver(&self, hook: &HookConfig, payload: &DeliveryPayload, origin_channel: &str) {
        let body = match tokio::time::timeout(
            self.timeout,
            self.gateway.send_to_hook(hook, payload),
        )
        .await
        {
            Err(_) => {
                error!(
                    "{}",
                    BridgeError::HookDeliveryFailure {
                        url: hook.url.clone(),
                        reason: format!("timed out after {:?}", self.timeout),
                    }
                );
                return;
            }
            Ok(Err(e)) => {
                error!(
                    "{}",
                    BridgeError::HookDeliveryFailure {
                        url: hook.url.clone(),
                        reason: format!("{e:#}"),
                    }
                );
                return;
            }
            Ok(Ok(body)) => body,
        };

        self.handle_response(hook, &body, origin_channel).await;
    }

    /// A response body that parses as an object with a string `content`
    /// field becomes a reply into the originating channel. Anything else is
    /// logged and dropped.
    async fn handle_response(&self, hook: &HookConfig, body: &str, origin_channel: &str) {
        let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
        let content = parsed
            .as_ref()
            .and_then(|v| v.as_object())
            .and_then(|map| map.get("content"))
            .and_then(|v| v.as_str());

        match content {
            Some(content) => {
                if let Err(e) = self.send_message(origin_channel, content).await {
                    warn!("could not reply to {origin_channel}: {e:#}");
                }
            }
            None => {
                warn!(
                    "{}: {body}",
                    BridgeError::MalformedHookResponse {
                        url: hook.url.clone(),
                    }
                );
            }
        }
    }

    /// Sends `content` to a channel named or identified by `target`.
    ///
    /// The name index is consulted first; failing that, the target is
    /// accepted as a raw id only when it carries a recognized channel-type
    /// marker. Content starting with `/me ` goes through the platform's
    /// action-message path.
    pub async fn send_message(&self, target: &str, content: &str) -> Result<()> {
        let channel_id = match self.identities.lookup_channel_id(target).await {
            Some(id) => id,
            None if matches!(target.chars().next(), Some('G' | 'D' | 'C')) => target.to_string(),
            None => return Err(BridgeError::UnknownChannelTarget(target.to_string()).into()),
        };

        if let Some(action) = content.strip_prefix(ACTION_PREFIX) {
            self.chat.post_action(&channel_id, action).await?;
        } else {
            self.chat.post_message(&channel_id, content).await?;
        }
        debug!("sent to {channel_id}");
        Ok(())
    }

    /// Runs `author` through one profile-enhancement hook. On any failure
    /// the record passes through unchanged.
    pub async fn enhance_profile(&self, hook: &HookConfig, author: Author) -> Author {
        match self.gateway.enhance_profile(hook, &author).await {
            Ok(enhanced) => enhanced,
            Err(e) => {
                warn!("profile hook {} failed: {e:#}", hook.url);
                author
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::identity::tests::{make_author, FakeDirectory};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeSender {
        pub messages: Mutex<Vec<(String, String)>>,
        pub actions: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChatSender for FakeSender {
        async fn post_message(&self, channel_id: &str, text: &str) -> Result<()> {
            self.messages
                .lock()
                .await
                .push((channel_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn post_action(&self, channel_id: &str, text: &str) -> Result<()> {
            self.actions
                .lock()
                .await
                .push((channel_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    /// Returns canned bodies per hook URL and records every delivery that
    /// ran to completion. A non-zero `delay` makes each delivery take that
    /// long.
    #[derive(Default)]
    pub(crate) struct FakeGateway {
        pub responses: std::collections::HashMap<String, String>,
        pub failing_urls: Vec<String>,
        pub deliveries: Mutex<Vec<(String, DeliveryPayload)>>,
        pub delivery_count: AtomicUsize,
        pub delay: Duration,
    }

    #[async_trait]
    impl HookDelivery for FakeGateway {
        async fn send_to_hook(
            &self,
            hook: &HookConfig,
            payload: &DeliveryPayload,
        ) -> Result<String> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.delivery_count.fetch_add(1, Ordering::SeqCst);
            self.deliveries
                .lock()
                .await
                .push((hook.url.clone(), payload.clone()));
            if self.failing_urls.contains(&hook.url) {
                anyhow::bail!("connection refused");
            }
            Ok(self
                .responses
                .get(&hook.url)
                .cloned()
                .unwrap_or_else(|| "ok".to_string()))
        }

        async fn enhance_profile(&self, _hook: &HookConfig, author: &Author) -> Result<Author> {
            let mut enhanced = author.clone();
            enhanced.display_name = format!("{} (enhanced)", enhanced.display_name);
            Ok(enhanced)
        }
    }

    fn delivery_config() -> DeliveryConfig {
        DeliveryConfig {
            concurrent: false,
            max_in_flight: 4,
            timeout_secs: 5,
        }
    }

    fn make_hook(url: &str) -> HookConfig {
        HookConfig {
            channel: None,
            pattern: Some(".".to_string()),
            url: url.to_string(),
            category: "message".to_string(),
        }
    }

    fn make_payload() -> DeliveryPayload {
        DeliveryPayload {
            timestamp: "1700000000.000100".to_string(),
            platform: "slack".to_string(),
            server: "myteam".to_string(),
            channel: Channel {
                uid: "C100".to_string(),
                display_name: "#general".to_string(),
            },
            author: Some(make_author("U1", "bob")),
            category: "message".to_string(),
            text: "hello".to_string(),
            captures: vec![Some("hello".to_string())],
        }
    }

    fn make_dispatcher(gateway: Arc<FakeGateway>, sender: Arc<FakeSender>) -> Arc<Dispatcher> {
        let identities = Arc::new(IdentityCache::new(Arc::new(FakeDirectory::default())));
        Arc::new(Dispatcher::new(
            sender,
            gateway,
            identities,
            &delivery_config(),
        ))
    }

    #[tokio::test]
    async fn test_content_response_is_replied_to_origin() {
        let gateway = Arc::new(FakeGateway {
            responses: [("http://x".to_string(), r#"{"content":"hi"}"#.to_string())]
                .into_iter()
                .collect(),
            ..FakeGateway::default()
        });
        let sender = Arc::new(FakeSender::default());
        let dispatcher = make_dispatcher(gateway, sender.clone());

        dispatcher
            .clone()
            .dispatch(make_hook("http://x"), make_payload(), "C100".to_string())
            .await;

        let messages = sender.messages.lock().await;
        assert_eq!(messages.as_slice(), &[("C100".to_string(), "hi".to_string())]);
    }

    #[tokio::test]
    async fn test_non_object_response_is_discarded() {
        let gateway = Arc::new(FakeGateway {
            responses: [("http://x".to_string(), "thanks!".to_string())]
                .into_iter()
                .collect(),
            ..FakeGateway::default()
        });
        let sender = Arc::new(FakeSender::default());
        let dispatcher = make_dispatcher(gateway, sender.clone());

        dispatcher
            .clone()
            .dispatch(make_hook("http://x"), make_payload(), "C100".to_string())
            .await;

        assert!(sender.messages.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_object_without_content_is_discarded() {
        let gateway = Arc::new(FakeGateway {
            responses: [("http://x".to_string(), r#"{"status":"ok"}"#.to_string())]
                .into_iter()
                .collect(),
            ..FakeGateway::default()
        });
        let sender = Arc::new(FakeSender::default());
        let dispatcher = make_dispatcher(gateway, sender.clone());

        dispatcher
            .clone()
            .dispatch(make_hook("http://x"), make_payload(), "C100".to_string())
            .await;

        assert!(sender.messages.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_block_the_next() {
        let gateway = Arc::new(FakeGateway {
            failing_urls: vec!["http://down".to_string()],
            ..FakeGateway::default()
        });
        let sender = Arc::new(FakeSender::default());
        let dispatcher = make_dispatcher(gateway.clone(), sender);

        dispatcher
            .clone()
            .dispatch(make_hook("http://down"), make_payload(), "C100".to_string())
            .await;
        dispatcher
            .clone()
            .dispatch(make_hook("http://up"), make_payload(), "C100".to_string())
            .await;

        assert_eq!(gateway.delivery_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_delivery_times_out_without_reply() {
        let gateway = Arc::new(FakeGateway {
            delay: Duration::from_secs(3),
            responses: [("http://slow".to_string(), r#"{"content":"late"}"#.to_string())]
                .into_iter()
                .collect(),
            ..FakeGateway::default()
        });
        let sender = Arc::new(FakeSender::default());
        let identities = Arc::new(IdentityCache::new(Arc::new(FakeDirectory::default())));
        let dispatcher = Arc::new(Dispatcher::new(
            sender.clone(),
            gateway.clone(),
            identities,
            &DeliveryConfig {
                concurrent: false,
                max_in_flight: 4,
                timeout_secs: 1,
            },
        ));

        dispatcher
            .clone()
            .dispatch(make_hook("http://slow"), make_payload(), "C100".to_string())
            .await;

        // Cut off mid-flight: the delivery never completed and its late
        // response never became a reply.
        assert_eq!(gateway.delivery_count.load(Ordering::SeqCst), 0);
        assert!(sender.messages.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_dispatch_hands_off_without_waiting() {
        let gateway = Arc::new(FakeGateway {
            delay: Duration::from_millis(200),
            responses: [("http://x".to_string(), r#"{"content":"hi"}"#.to_string())]
                .into_iter()
                .collect(),
            ..FakeGateway::default()
        });
        let sender = Arc::new(FakeSender::default());
        let identities = Arc::new(IdentityCache::new(Arc::new(FakeDirectory::default())));
        let dispatcher = Arc::new(Dispatcher::new(
            sender.clone(),
            gateway.clone(),
            identities,
            &DeliveryConfig {
                concurrent: true,
                max_in_flight: 4,
                timeout_secs: 5,
            },
        ));

        let start = tokio::time::Instant::now();
        for _ in 0..4 {
            dispatcher
                .clone()
                .dispatch(make_hook("http://x"), make_payload(), "C100".to_string())
                .await;
        }
        // Handing off waits on a permit, never on the deliveries themselves.
        assert!(start.elapsed() < Duration::from_millis(150));

        // Let the spawned deliveries run out their delay.
        tokio::time::sleep(Duration::from_millis(500)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(gateway.delivery_count.load(Ordering::SeqCst), 4);
        assert_eq!(sender.messages.lock().await.len(), 4);
    }

    #[tokio::test]
    async fn test_send_resolves_channel_name_through_index() {
        let directory = Arc::new(FakeDirectory::default());
        let identities = Arc::new(IdentityCache::new(directory));
        identities.resolve_channel("C100", "U1").await.unwrap();

        let sender = Arc::new(FakeSender::default());
        let dispatcher = Dispatcher::new(
            sender.clone(),
            Arc::new(FakeGateway::default()),
            identities,
            &delivery_config(),
        );

        dispatcher.send_message("#general", "hi").await.unwrap();
        let messages = sender.messages.lock().await;
        assert_eq!(messages.as_slice(), &[("C100".to_string(), "hi".to_string())]);
    }

    #[tokio::test]
    async fn test_send_accepts_raw_id_with_known_marker() {
        let sender = Arc::new(FakeSender::default());
        let dispatcher = make_dispatcher(Arc::new(FakeGateway::default()), sender.clone());

        dispatcher.send_message("D42", "psst").await.unwrap();
        assert_eq!(sender.messages.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_send_rejects_unknown_target() {
        let sender = Arc::new(FakeSender::default());
        let dispatcher = make_dispatcher(Arc::new(FakeGateway::default()), sender.clone());

        let err = dispatcher.send_message("nowhere", "hi").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::UnknownChannelTarget(_))
        ));
        assert!(sender.messages.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_action_content_uses_action_send_path() {
        let sender = Arc::new(FakeSender::default());
        let dispatcher = make_dispatcher(Arc::new(FakeGateway::default()), sender.clone());

        dispatcher.send_message("C9", "/me waves").await.unwrap();
        assert!(sender.messages.lock().await.is_empty());
        let actions = sender.actions.lock().await;
        assert_eq!(actions.as_slice(), &[("C9".to_string(), "waves".to_string())]);
    }
}
