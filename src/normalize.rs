use regex::Regex;
use tracing::warn;

use crate::bridge::InboundMessage;
use crate::identity::IdentityCache;

/// Marker prepended to action/emote messages, both inbound and outbound.
pub const ACTION_PREFIX: &str = "/me ";

/// Rewrites raw message text into the form hooks match against: mention
/// tokens expanded with resolved nicknames, platform escaping undone, and
/// action messages prefixed with `/me `.
pub struct MessageNormalizer {
    mention: Regex,
}

impl MessageNormalizer {
    pub fn new() -> Self {
        // Raw mention tokens look like <@U02AB3CD>. Expanded ones carry a
        // |nickname suffix and no longer match, which keeps a second
        // normalization pass from touching them.
        Self {
            mention: Regex::new(r"(?i)<@([A-Z0-9]+)>").expect("mention pattern"),
        }
    }

    pub async fn normalize(
        &self,
        raw: &str,
        message: &InboundMessage,
        cache: &IdentityCache,
    ) -> String {
        let text = self.expand_mentions(raw, cache).await;
        let text = unescape(&text);
        if message.subtype.as_deref() == Some("me_message") && !text.starts_with(ACTION_PREFIX) {
            return format!("{ACTION_PREFIX}{text}");
        }
        text
    }

    /// Rewrites every `<@UID>` token to `<@UID|nickname>`, resolving the
    /// author inline if not cached. Tokens whose resolution fails are left
    /// byte-for-byte unchanged.
    async fn expand_mentions(&self, text: &str, cache: &IdentityCache) -> String {
        let tokens: Vec<(std::ops::Range<usize>, String)> = self
            .mention
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some((whole.range(), caps[1].to_string()))
            })
            .collect();
        if tokens.is_empty() {
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for (range, uid) in tokens {
            out.push_str(&text[cursor..range.start]);
            match cache.resolve_author(&uid).await {
                Ok(author) => {
                    out.push_str(&format!("<@{uid}|{}>", author.nickname));
                }
                Err(e) => {
                    warn!("leaving mention unexpanded: {e}");
                    out.push_str(&text[range.clone()]);
                }
            }
            cursor = range.end;
        }
        out.push_str(&text[cursor..]);
        out
    }
}

/// Decodes the platform's text-escaping entities back to raw characters.
/// `&amp;` goes last so it does not manufacture new entities.
fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::FakeDirectory;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn message(subtype: Option<&str>) -> InboundMessage {
        InboundMessage {
            channel: "C1".to_string(),
            user: "U1".to_string(),
            text: String::new(),
            subtype: subtype.map(str::to_string),
            hidden: false,
            ts: "1700000000.000100".to_string(),
        }
    }

    fn cache() -> (Arc<FakeDirectory>, IdentityCache) {
        let directory = Arc::new(FakeDirectory::default());
        let cache = IdentityCache::new(directory.clone());
        (directory, cache)
    }

    #[tokio::test]
    async fn test_mention_expanded_with_resolved_nickname() {
        let (directory, cache) = cache();
        let normalizer = MessageNormalizer::new();

        let out = normalizer
            .normalize("<@U1> hello", &message(None), &cache)
            .await;
        assert_eq!(out, "<@U1|nick-u1> hello");
        assert_eq!(directory.user_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_resolution_leaves_token_unchanged() {
        let directory = Arc::new(FakeDirectory {
            fail_users: true,
            ..FakeDirectory::default()
        });
        let cache = IdentityCache::new(directory);
        let normalizer = MessageNormalizer::new();

        let out = normalizer
            .normalize("hey <@U404>!", &message(None), &cache)
            .await;
        assert_eq!(out, "hey <@U404>!");
    }

    #[tokio::test]
    async fn test_unescape_entities() {
        let (_, cache) = cache();
        let normalizer = MessageNormalizer::new();

        let out = normalizer
            .normalize("a &lt;tag&gt; &amp; more", &message(None), &cache)
            .await;
        assert_eq!(out, "a <tag> & more");
    }

    #[tokio::test]
    async fn test_action_subtype_gets_prefix() {
        let (_, cache) = cache();
        let normalizer = MessageNormalizer::new();

        let out = normalizer
            .normalize("waves", &message(Some("me_message")), &cache)
            .await;
        assert_eq!(out, "/me waves");
    }

    #[tokio::test]
    async fn test_normalization_is_idempotent() {
        let (_, cache) = cache();
        let normalizer = MessageNormalizer::new();
        let msg = message(Some("me_message"));

        let once = normalizer.normalize("<@U1> says &lt;hi&gt;", &msg, &cache).await;
        let twice = normalizer.normalize(&once, &msg, &cache).await;
        assert_eq!(once, twice);
    }
}
