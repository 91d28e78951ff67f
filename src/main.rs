mod bridge;
mod config;
mod control;
mod dispatch;
mod error;
mod gateway;
mod hooks;
mod identity;
mod normalize;
mod slack;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bridge::Bridge;
use crate::config::Config;
use crate::control::ControlState;
use crate::dispatch::Dispatcher;
use crate::gateway::HttpGateway;
use crate::identity::IdentityCache;
use crate::slack::SlackClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,slackbridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Hook source: {}", config.gateway.hooks_url);
    info!("  Concurrent delivery: {}", config.delivery.concurrent);
    info!("  Control surface: {}", config.control.bind);

    let slack = Arc::new(SlackClient::new(config.slack.clone()));

    // One auth check up front gives us the team identity and the server
    // domain carried in every delivery payload.
    let auth = slack.auth_test().await.context("Slack auth check failed")?;
    info!(
        "Successfully connected, welcome '{}' to the '{}' team at {}",
        auth.user, auth.team, auth.url
    );

    let gateway = Arc::new(HttpGateway::new(config.gateway.clone()));
    let identities = Arc::new(IdentityCache::new(slack.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        slack.clone(),
        gateway.clone(),
        identities.clone(),
        &config.delivery,
    ));
    let bridge = Arc::new(Bridge::new(
        auth.domain(),
        identities.clone(),
        gateway,
        dispatcher,
    ));

    // The control surface also carries the transport callbacks, so this
    // server is the process's whole event loop.
    control::serve(
        config.control.bind.clone(),
        ControlState {
            bridge,
            identities,
            team: auth.team,
            bot_name: auth.user,
        },
    )
    .await
}
