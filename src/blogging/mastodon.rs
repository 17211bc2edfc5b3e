//! Mastodon client: out-of-band OAuth authorization through the chat and
//! status publishing with media attachments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blogging::{
    cancellable, http_client, is_handshake_abort, Authorizer, MicroblogPost, Platform,
};
use crate::config::MastodonConfig;
use crate::im::handshake::{self, AuthorizationChannel, Handshake};
use crate::im::UserId;
use crate::store::CredentialStore;

const PLATFORM: &str = "mastodon";
const REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

pub const SERVER_PROMPT: &str = "What is the mastodon instance server URL?";

/// Everything needed to act on behalf of one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MastodonAccount {
    pub server: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub acct: String,
}

#[derive(Debug, Deserialize)]
struct AppRegistration {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct VerifiedAccount {
    acct: String,
}

#[derive(Debug, Deserialize)]
struct MediaAttachment {
    id: String,
}

#[derive(Debug, Serialize)]
struct NewStatus<'a> {
    status: &'a str,
    media_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct Status {
    url: Option<String>,
    uri: String,
}

#[derive(Clone)]
pub struct MastodonClient {
    http: reqwest::Client,
    config: MastodonConfig,
    credentials: CredentialStore,
    sessions: Arc<Mutex<HashMap<UserId, MastodonAccount>>>,
}

impl MastodonClient {
    pub fn new(config: MastodonConfig, credentials: CredentialStore) -> Self {
        Self {
            http: http_client(Duration::from_secs(config.request_timeout_secs)),
            config,
            credentials,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Authorized account for `user`, from the cache or the store.
    async fn account(&self, user: UserId) -> Result<Option<MastodonAccount>> {
        if let Some(account) = self.sessions.lock().await.get(&user) {
            return Ok(Some(account.clone()));
        }
        let stored: Option<MastodonAccount> = self.credentials.load(user, PLATFORM).await?;
        match stored {
            Some(account) if !account.access_token.is_empty() => {
                self.sessions.lock().await.insert(user, account.clone());
                Ok(Some(account))
            }
            _ => Ok(None),
        }
    }

    async fn authorize(&self, handshake: Handshake, user: UserId) {
        match self.run_handshake(&handshake, user).await {
            Ok(account) => {
                info!("Mastodon: user {} authorized as @{}", user, account.acct);
                let _ = handshake
                    .notify(format!("Authorized on Mastodon as @{}", account.acct))
                    .await;
            }
            Err(e) if is_handshake_abort(&e) => {
                debug!("Mastodon: authorization for user {} abandoned: {}", user, e);
            }
            Err(e) => {
                warn!("Mastodon: authorization for user {} failed: {:#}", user, e);
                let _ = handshake
                    .notify(format!("Mastodon authorization failed: {e:#}"))
                    .await;
            }
        }
    }

    async fn run_handshake(&self, handshake: &Handshake, user: UserId) -> Result<MastodonAccount> {
        let cancel = handshake.cancel_token();
        let server = normalize_server(&handshake.ask(SERVER_PROMPT).await?)?;

        let stored: Option<MastodonAccount> = self.credentials.load(user, PLATFORM).await?;
        let mut account = match reusable_app(stored, &server) {
            Some(account) => {
                debug!("Mastodon: reusing app registration on {} for user {}", server, user);
                account
            }
            None => {
                let app = cancellable(cancel, self.register_app(&server)).await?;
                MastodonAccount {
                    server: server.clone(),
                    client_id: app.client_id,
                    client_secret: app.client_secret,
                    ..Default::default()
                }
            }
        };

        let url = authorize_url(&account.server, &account.client_id, &self.config.scopes)?;
        let code = handshake
            .ask(format!(
                "Open your browser to \n{url}\n and copy/paste the given token"
            ))
            .await?;

        account.access_token =
            cancellable(cancel, self.exchange_code(&account, code.trim())).await?;
        account.acct = cancellable(cancel, self.verify(&account)).await?;

        self.credentials.save(user, PLATFORM, &account).await?;
        self.sessions.lock().await.insert(user, account.clone());
        Ok(account)
    }

    async fn register_app(&self, server: &str) -> Result<AppRegistration> {
        self.http
            .post(format!("{server}/api/v1/apps"))
            .form(&[
                ("client_name", self.config.client_name.as_str()),
                ("redirect_uris", REDIRECT_URI),
                ("scopes", self.config.scopes.as_str()),
                ("website", self.config.website.as_str()),
            ])
            .send()
            .await
            .context("Failed to reach Mastodon server")?
            .error_for_status()
            .context("Mastodon app registration rejected")?
            .json()
            .await
            .context("Failed to parse app registration")
    }

    async fn exchange_code(&self, account: &MastodonAccount, code: &str) -> Result<String> {
        let token: TokenResponse = self
            .http
            .post(format!("{}/oauth/token", account.server))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", account.client_id.as_str()),
                ("client_secret", account.client_secret.as_str()),
                ("redirect_uri", REDIRECT_URI),
                ("scope", self.config.scopes.as_str()),
            ])
            .send()
            .await
            .context("Failed to reach Mastodon server")?
            .error_for_status()
            .context("Authorization code rejected")?
            .json()
            .await
            .context("Failed to parse token response")?;
        Ok(token.access_token)
    }

    async fn verify(&self, account: &MastodonAccount) -> Result<String> {
        let verified: VerifiedAccount = self
            .http
            .get(format!("{}/api/v1/accounts/verify_credentials", account.server))
            .bearer_auth(&account.access_token)
            .send()
            .await
            .context("Failed to reach Mastodon server")?
            .error_for_status()
            .context("Access token rejected")?
            .json()
            .await
            .context("Failed to parse account")?;
        Ok(verified.acct)
    }

    async fn publish(&self, account: &MastodonAccount, post: &MicroblogPost) -> Result<String> {
        let mut media_ids = Vec::with_capacity(post.images.len());
        for (idx, image) in post.images.iter().enumerate() {
            let part = Part::bytes(image.data.clone())
                .file_name(image.file_name(idx))
                .mime_str(image.mime_type())?;
            let form = Form::new()
                .part("file", part)
                .text("description", image.alt_text.clone());
            let media: MediaAttachment = self
                .http
                .post(format!("{}/api/v2/media", account.server))
                .bearer_auth(&account.access_token)
                .multipart(form)
                .send()
                .await
                .with_context(|| format!("Failed to upload image {idx}"))?
                .error_for_status()
                .with_context(|| format!("Image {idx} rejected"))?
                .json()
                .await
                .context("Failed to parse media attachment")?;
            media_ids.push(media.id);
        }

        let status: Status = self
            .http
            .post(format!("{}/api/v1/statuses", account.server))
            .bearer_auth(&account.access_token)
            .json(&NewStatus {
                status: &post.text,
                media_ids,
                language: post.langs.first().map(String::as_str),
            })
            .send()
            .await
            .context("Failed to post status")?
            .error_for_status()
            .context("Status rejected")?
            .json()
            .await
            .context("Failed to parse status")?;

        Ok(status.url.unwrap_or(status.uri))
    }
}

#[async_trait]
impl Platform for MastodonClient {
    async fn post(
        &self,
        cancel: &CancellationToken,
        user: UserId,
        post: &MicroblogPost,
    ) -> Result<String> {
        let Some(account) = self.account(user).await? else {
            bail!("no Mastodon account linked");
        };
        let url = cancellable(cancel, self.publish(&account, post)).await?;
        info!("Mastodon: posted status for user {}: {}", user, url);
        Ok(url)
    }
}

#[async_trait]
impl Authorizer for MastodonClient {
    async fn is_authorized(&self, user: UserId) -> bool {
        match self.account(user).await {
            Ok(account) => account.is_some(),
            Err(e) => {
                warn!("Mastodon: loading account for user {} failed: {:#}", user, e);
                false
            }
        }
    }

    async fn start_authorization(
        &self,
        cancel: CancellationToken,
        user: UserId,
    ) -> Result<AuthorizationChannel> {
        let (handshake, channel) = handshake::channel(cancel);
        let client = self.clone();
        tokio::spawn(async move {
            client.authorize(handshake, user).await;
        });
        Ok(channel)
    }
}

/// Accept `mastodon.social`, `https://mastodon.social/` and the like.
fn normalize_server(raw: &str) -> Result<String> {
    let raw = raw.trim().trim_end_matches('/');
    if raw.is_empty() {
        bail!("empty server URL");
    }
    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let url = reqwest::Url::parse(&with_scheme)
        .with_context(|| format!("Invalid server URL: {raw}"))?;
    if url.host_str().is_none() {
        bail!("Invalid server URL: {raw}");
    }
    Ok(with_scheme)
}

/// The stored app registration, stripped of its login, when it belongs to
/// `server`.
fn reusable_app(stored: Option<MastodonAccount>, server: &str) -> Option<MastodonAccount> {
    let account = stored?;
    if account.server != server || account.client_id.is_empty() || account.client_secret.is_empty()
    {
        return None;
    }
    Some(MastodonAccount {
        access_token: String::new(),
        acct: String::new(),
        ..account
    })
}

fn authorize_url(server: &str, client_id: &str, scopes: &str) -> Result<reqwest::Url> {
    reqwest::Url::parse_with_params(
        &format!("{server}/oauth/authorize"),
        &[
            ("client_id", client_id),
            ("redirect_uri", REDIRECT_URI),
            ("response_type", "code"),
            ("scope", scopes),
        ],
    )
    .context("Failed to build authorization URL")
}
