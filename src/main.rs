mod blogging;
mod bot;
mod config;
mod im;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::blogging::bluesky::BlueskyClient;
use crate::blogging::mastodon::MastodonClient;
use crate::blogging::posting::PostingFlow;
use crate::blogging::{AuthedPlatform, Authorizer, Platforms};
use crate::bot::Sessions;
use crate::config::Config;
use crate::store::{Store, Vault};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,crossposter=debug".into()),
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
    info!("  Allowed users: {:?}", config.telegram.allowed_user_ids);
    info!("  Platforms: {:?}", config.enabled_platforms());
    info!("  Default languages: {:?}", config.posting.default_langs);

    let vault = Vault::from_passphrase(&config.storage.secret_key()?)?;
    let store = Store::open(&config.storage.database_path, vault)?;

    let mut platforms = Platforms::new();
    let mut authorizers: Vec<(String, Arc<dyn Authorizer>)> = Vec::new();
    if config.mastodon.enabled {
        let client = Arc::new(MastodonClient::new(
            config.mastodon.clone(),
            store.credentials(),
        ));
        platforms.insert("Mastodon".to_string(), client.clone() as Arc<dyn AuthedPlatform>);
        authorizers.push(("mastodon".to_string(), client as Arc<dyn Authorizer>));
    }
    if config.bluesky.enabled {
        let client = Arc::new(BlueskyClient::new(
            config.bluesky.clone(),
            store.credentials(),
        ));
        platforms.insert("Bluesky".to_string(), client.clone() as Arc<dyn AuthedPlatform>);
        authorizers.push(("bluesky".to_string(), client as Arc<dyn Authorizer>));
    }

    let posting = PostingFlow::new(platforms, config.posting.default_langs.clone())
        .with_publish_timeout(Duration::from_secs(config.posting.publish_timeout_secs));
    let sessions = Arc::new(Sessions::new(
        bot::scheduler_factory(posting, authorizers),
        bot::help_text(&config.enabled_platforms()),
    ));

    // Cancelling the root token aborts in-flight turns and stops the dispatcher.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
                cancel.cancel();
            }
        }
    });

    info!("Bot is starting...");
    bot::run(&config.telegram, sessions, cancel).await?;

    Ok(())
}
