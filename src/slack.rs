use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::SlackConfig;
use crate::dispatch::ChatSender;
use crate::identity::{Author, ChatDirectory, Channel};

/// Client for the Slack Web API surface the bridge consumes: identity
/// reads, plain and action sends, and the auth check done at startup.
pub struct SlackClient {
    client: reqwest::Client,
    config: SlackConfig,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    user: Option<SlackUser>,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    id: String,
    name: String,
    #[serde(default)]
    real_name: String,
    #[serde(default)]
    tz: String,
    #[serde(default)]
    profile: SlackProfile,
}

#[derive(Debug, Deserialize, Default)]
struct SlackProfile {
    #[serde(default)]
    image_192: String,
}

#[derive(Debug, Deserialize)]
struct GroupResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    group: Option<NamedConversation>,
}

#[derive(Debug, Deserialize)]
struct ChannelResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    channel: Option<NamedConversation>,
}

#[derive(Debug, Deserialize)]
struct NamedConversation {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthTestResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    team: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    url: String,
}

/// Result of the startup `auth.test` call.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub team: String,
    pub user: String,
    pub url: String,
}

impl AuthInfo {
    /// Workspace subdomain, parsed from the `https://{domain}.slack.com/`
    /// URL the auth check returns.
    pub fn domain(&self) -> String {
        self.url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

impl SlackClient {
    pub fn new(config: SlackConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub async fn auth_test(&self) -> Result<AuthInfo> {
        let response: AuthTestResponse = self.call("auth.test", &[]).await?;
        check_ok(response.ok, response.error, "auth.test")?;
        Ok(AuthInfo {
            team: response.team,
            user: response.user,
            url: response.url,
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}/{}", self.config.base_url, method);
        debug!("Calling Slack API: {method}");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .form(params)
            .send()
            .await
            .with_context(|| format!("Failed to reach Slack API method {method}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Slack API error on {method} ({status})");
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse Slack response for {method}"))
    }

    async fn fetch_user(&self, uid: &str) -> Result<SlackUser> {
        let response: UserResponse = self.call("users.info", &[("user", uid)]).await?;
        check_ok(response.ok, response.error, "users.info")?;
        response.user.context("users.info returned no user")
    }
}

fn check_ok(ok: bool, error: Option<String>, method: &str) -> Result<()> {
    if ok {
        return Ok(());
    }
    anyhow::bail!(
        "Slack API {method} refused: {}",
        error.unwrap_or_else(|| "unknown error".to_string())
    )
}

#[async_trait]
impl ChatDirectory for SlackClient {
    async fn user_info(&self, uid: &str) -> Result<Author> {
        let user = self.fetch_user(uid).await?;
        Ok(Author {
            uid: uid.to_string(),
            nickname: user.name.clone(),
            username: user.name,
            display_name: user.real_name,
            photo_url: user.profile.image_192,
            timezone: user.tz,
        })
    }

    async fn group_info(&self, id: &str) -> Result<Channel> {
        let response: GroupResponse = self.call("groups.info", &[("channel", id)]).await?;
        check_ok(response.ok, response.error, "groups.info")?;
        let group = response.group.context("groups.info returned no group")?;
        Ok(Channel {
            uid: id.to_string(),
            display_name: format!("#{}", group.name),
        })
    }

    async fn channel_info(&self, id: &str) -> Result<Channel> {
        let response: ChannelResponse = self.call("channels.info", &[("channel", id)]).await?;
        check_ok(response.ok, response.error, "channels.info")?;
        let channel = response.channel.context("channels.info returned no channel")?;
        Ok(Channel {
            uid: id.to_string(),
            display_name: format!("#{}", channel.name),
        })
    }

    async fn dm_channel_info(&self, user_id: &str) -> Result<Channel> {
        let user = self.fetch_user(user_id).await?;
        Ok(Channel {
            uid: user.id,
            display_name: user.name,
        })
    }
}

#[async_trait]
impl ChatSender for SlackClient {
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<()> {
        let response: SendResponse = self
            .call("chat.postMessage", &[("channel", channel_id), ("text", text)])
            .await?;
        check_ok(response.ok, response.error, "chat.postMessage")
    }

    async fn post_action(&self, channel_id: &str, text: &str) -> Result<()> {
        let response: SendResponse = self
            .call("chat.meMessage", &[("channel", channel_id), ("text", text)])
            .await?;
        check_ok(response.ok, response.error, "chat.meMessage")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_domain_parsing() {
        let auth = AuthInfo {
            team: "My Team".to_string(),
            user: "bridgebot".to_string(),
            url: "https://myteam.slack.com/".to_string(),
        };
        assert_eq!(auth.domain(), "myteam");
    }
}
