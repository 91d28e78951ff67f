use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::BridgeError;

/// A user identity snapshot captured at resolution time.
///
/// Records are never refreshed automatically; an explicit cache clear is the
/// only way to force a re-fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub uid: String,
    pub nickname: String,
    pub username: String,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "photo", default)]
    pub photo_url: String,
    #[serde(rename = "tz", default)]
    pub timezone: String,
}

/// A resolved conversation target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub uid: String,
    /// `#name` for channels and groups, the bare peer name for DMs.
    #[serde(rename = "name")]
    pub display_name: String,
}

/// The chat platform's identity read API, as consumed by the cache.
#[async_trait]
pub trait ChatDirectory: Send + Sync {
    async fn user_info(&self, uid: &str) -> Result<Author>;
    async fn group_info(&self, id: &str) -> Result<Channel>;
    async fn channel_info(&self, id: &str) -> Result<Channel>;
    /// Channel identity for a direct-message conversation. The display name
    /// comes from the peer's user record, not from the channel id.
    async fn dm_channel_info(&self, user_id: &str) -> Result<Channel>;
}

#[derive(Debug, Default, Clone, Serialize)]
struct CacheInner {
    users: HashMap<String, Author>,
    nicks: HashMap<String, String>,
    channels: HashMap<String, Channel>,
    channel_names: HashMap<String, String>,
}

/// Read-only view of the four cache structures, served by the control
/// surface.
#[derive(Debug, Serialize)]
pub struct CacheSnapshot {
    pub users: HashMap<String, Author>,
    pub nicks: HashMap<String, String>,
    pub channels: HashMap<String, Channel>,
    pub channel_names: HashMap<String, String>,
}

/// Memoizing store for resolved identities.
///
/// All four structures live behind one mutex, so inserting a record and its
/// name-index entry is a single atomic unit and `clear_all` empties
/// everything in one step. A second map of per-id gates guarantees at most
/// one in-flight external fetch per uncached id.
pub struct IdentityCache {
    directory: Arc<dyn ChatDirectory>,
    inner: Mutex<CacheInner>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdentityCache {
    pub fn new(directory: Arc<dyn ChatDirectory>) -> Self {
        Self {
            directory,
            inner: Mutex::new(CacheInner::default()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached author for `uid`, fetching it from the directory
    /// on first sight. Concurrent calls for the same uid collapse into a
    /// single fetch.
    pub async fn resolve_author(&self, uid: &str) -> Result<Author, BridgeError> {
        if let Some(author) = self.cached_author(uid).await {
            return Ok(author);
        }

        let gate = self.fetch_gate(uid).await;
        let _held = gate.lock().await;

        // Whoever held the gate before us may have filled the cache.
        if let Some(author) = self.cached_author(uid).await {
            return Ok(author);
        }

        info!("Fetching account info: {uid}");
        let fetched = self.directory.user_info(uid).await;
        if let Ok(author) = &fetched {
            self.insert_author(author.clone()).await;
        }
        // Released on failure too, or the inflight table keeps an entry
        // for every id that never resolves.
        self.release_gate(uid).await;
        fetched.map_err(|e| BridgeError::UnresolvedIdentity {
            id: uid.to_string(),
            reason: format!("{e:#}"),
        })
    }

    /// Returns the cached channel for `channel_id`, fetching it on first
    /// sight. The leading id marker picks the fetch strategy; `D` ids
    /// resolve through the message's `user_id` instead of the channel id.
    pub async fn resolve_channel(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<Channel, BridgeError> {
        if let Some(channel) = self.cached_channel(channel_id).await {
            return Ok(channel);
        }

        let gate = self.fetch_gate(channel_id).await;
        let _held = gate.lock().await;

        if let Some(channel) = self.cached_channel(channel_id).await {
            return Ok(channel);
        }

        let fetched = match channel_id.chars().next() {
            Some('G') => {
                info!("Fetching group info: {channel_id}");
                self.directory.group_info(channel_id).await
            }
            Some('D') => self.directory.dm_channel_info(user_id).await,
            Some('C') => {
                info!("Fetching channel info: {channel_id}");
                self.directory.channel_info(channel_id).await
            }
            _ => Err(anyhow::anyhow!("unrecognized channel id marker")),
        };

        if let Ok(channel) = &fetched {
            if channel_id.starts_with('D') {
                info!("Private message from {}", channel.display_name);
            }
            self.insert_channel(channel_id, channel.clone()).await;
        }
        self.release_gate(channel_id).await;
        fetched.map_err(|e| BridgeError::UnresolvedIdentity {
            id: channel_id.to_string(),
            reason: format!("{e:#}"),
        })
    }

    pub async fn cached_author(&self, uid: &str) -> Option<Author> {
        self.inner.lock().await.users.get(uid).cloned()
    }

    pub async fn cached_channel(&self, channel_id: &str) -> Option<Channel> {
        self.inner.lock().await.channels.get(channel_id).cloned()
    }

    /// Name-index read used to turn a human-typed channel reference into a
    /// deliverable id.
    pub async fn lookup_channel_id(&self, name: &str) -> Option<String> {
        self.inner.lock().await.channel_names.get(name).cloned()
    }

    /// Replaces the stored record for an author, keeping the nickname index
    /// in step. Used after profile enhancement; if the nickname changed,
    /// the old index entry goes away with it.
    pub async fn update_author(&self, author: Author) {
        let mut inner = self.inner.lock().await;
        let stale = inner
            .users
            .get(&author.uid)
            .map(|previous| previous.nickname.clone());
        if let Some(stale) = stale {
            if stale != author.nickname {
                inner.nicks.remove(&stale);
            }
        }
        inner
            .nicks
            .insert(author.nickname.clone(), author.uid.clone());
        inner.users.insert(author.uid.clone(), author);
    }

    /// Empties all four structures in one step. Subsequent resolutions
    /// re-fetch from the directory.
    pub async fn clear_all(&self) {
        let mut inner = self.inner.lock().await;
        *inner = CacheInner::default();
        debug!("identity cache cleared");
    }

    pub async fn snapshot(&self) -> CacheSnapshot {
        let inner = self.inner.lock().await;
        CacheSnapshot {
            users: inner.users.clone(),
            nicks: inner.nicks.clone(),
            channels: inner.channels.clone(),
            channel_names: inner.channel_names.clone(),
        }
    }

    async fn insert_author(&self, author: Author) {
        // One critical section: the nickname index must never reference a
        // uid absent from the primary map.
        let mut inner = self.inner.lock().await;
        inner
            .nicks
            .insert(author.nickname.clone(), author.uid.clone());
        inner.users.insert(author.uid.clone(), author);
    }

    async fn insert_channel(&self, channel_id: &str, channel: Channel) {
        let mut inner = self.inner.lock().await;
        inner
            .channel_names
            .insert(channel.display_name.clone(), channel_id.to_string());
        inner.channels.insert(channel_id.to_string(), channel);
    }

    async fn fetch_gate(&self, key: &str) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release_gate(&self, key: &str) {
        self.inflight.lock().await.remove(key);
    }
}
