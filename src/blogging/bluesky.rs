//! Bluesky client over the AT protocol XRPC endpoints, authenticated with
//! an app password.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blogging::{
    cancellable, http_client, is_handshake_abort, Authorizer, MicroblogPost, Platform,
};
use crate::config::BlueskyConfig;
use crate::im::handshake::{self, AuthorizationChannel, Handshake};
use crate::im::UserId;
use crate::store::CredentialStore;

const PLATFORM: &str = "bluesky";
const POST_COLLECTION: &str = "app.bsky.feed.post";
/// Access tokens live for about two hours; renew well before that.
const SESSION_TTL: Duration = Duration::from_secs(90 * 60);
const FALLBACK_LANGS: &[&str] = &["en"];

pub const HANDLE_PROMPT: &str = "What is your Bluesky username?";
pub const PASSWORD_PROMPT: &str = "What is your Bluesky application password?";

/// Stored login for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueskyAccount {
    pub handle: String,
    pub app_password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    did: String,
    handle: String,
}

#[derive(Clone)]
struct CachedSession {
    session: Session,
    created: Instant,
}

impl CachedSession {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created) < SESSION_TTL
    }
}

#[derive(Debug, Deserialize)]
struct UploadedBlob {
    blob: Value,
}

#[derive(Debug, Deserialize)]
struct CreatedRecord {
    uri: String,
}

#[derive(Clone)]
pub struct BlueskyClient {
    http: reqwest::Client,
    config: BlueskyConfig,
    credentials: CredentialStore,
    sessions: Arc<Mutex<HashMap<UserId, CachedSession>>>,
}

impl BlueskyClient {
    pub fn new(config: BlueskyConfig, credentials: CredentialStore) -> Self {
        Self {
            http: http_client(Duration::from_secs(config.request_timeout_secs)),
            config,
            credentials,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn xrpc(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.config.service_url.trim_end_matches('/'), method)
    }

    async fn create_session(&self, account: &BlueskyAccount) -> Result<Session> {
        let response = self
            .http
            .post(self.xrpc("com.atproto.server.createSession"))
            .json(&json!({
                "identifier": account.handle,
                "password": account.app_password,
            }))
            .send()
            .await
            .context("Failed to reach Bluesky")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Bluesky login failed ({}): {}", status, body);
        }
        response.json().await.context("Failed to parse Bluesky session")
    }

    /// A live session for `user`, logging in again when the cached one is stale.
    async fn session(&self, user: UserId) -> Result<Option<Session>> {
        if let Some(cached) = self.sessions.lock().await.get(&user) {
            if cached.is_fresh(Instant::now()) {
                return Ok(Some(cached.session.clone()));
            }
        }
        let stored: Option<BlueskyAccount> = self.credentials.load(user, PLATFORM).await?;
        let Some(account) = stored else {
            return Ok(None);
        };
        debug!("Bluesky: opening session for user {}", user);
        let session = self.create_session(&account).await?;
        self.cache(user, session.clone()).await;
        Ok(Some(session))
    }

    async fn cache(&self, user: UserId, session: Session) {
        self.sessions.lock().await.insert(
            user,
            CachedSession {
                session,
                created: Instant::now(),
            },
        );
    }

    async fn authorize(&self, handshake: Handshake, user: UserId) {
        match self.run_handshake(&handshake, user).await {
            Ok(handle) => {
                info!("Bluesky: user {} authorized as @{}", user, handle);
                let _ = handshake
                    .notify(format!("Authorized on Bluesky as @{handle}"))
                    .await;
            }
            Err(e) if is_handshake_abort(&e) => {
                debug!("Bluesky: authorization for user {} abandoned: {}", user, e);
            }
            Err(e) => {
                warn!("Bluesky: authorization for user {} failed: {:#}", user, e);
                let _ = handshake
                    .notify(format!("Bluesky authorization failed: {e:#}"))
                    .await;
            }
        }
    }

    async fn run_handshake(&self, handshake: &Handshake, user: UserId) -> Result<String> {
        let handle = handshake.ask(HANDLE_PROMPT).await?;
        let app_password = handshake.ask(PASSWORD_PROMPT).await?;
        let account = BlueskyAccount {
            handle: handle.trim().trim_start_matches('@').to_string(),
            app_password: app_password.trim().to_string(),
        };

        let session = cancellable(handshake.cancel_token(), self.create_session(&account)).await?;
        self.credentials.save(user, PLATFORM, &account).await?;
        let handle = session.handle.clone();
        self.cache(user, session).await;
        Ok(handle)
    }

    async fn upload_blob(&self, session: &Session, data: &[u8], mime: &str) -> Result<Value> {
        let uploaded: UploadedBlob = self
            .http
            .post(self.xrpc("com.atproto.repo.uploadBlob"))
            .bearer_auth(&session.access_jwt)
            .header(reqwest::header::CONTENT_TYPE, mime)
            .body(data.to_vec())
            .send()
            .await
            .context("Failed to upload image")?
            .error_for_status()
            .context("Image rejected")?
            .json()
            .await
            .context("Failed to parse uploaded blob")?;
        Ok(uploaded.blob)
    }

    async fn publish(&self, session: &Session, post: &MicroblogPost) -> Result<String> {
        let mut blobs = Vec::with_capacity(post.images.len());
        for image in &post.images {
            blobs.push(
                self.upload_blob(session, &image.data, image.mime_type())
                    .await?,
            );
        }

        let record = post_record(post, &blobs, chrono::Utc::now());
        let created: CreatedRecord = self
            .http
            .post(self.xrpc("com.atproto.repo.createRecord"))
            .bearer_auth(&session.access_jwt)
            .json(&json!({
                "repo": session.did,
                "collection": POST_COLLECTION,
                "record": record,
            }))
            .send()
            .await
            .context("Failed to create post")?
            .error_for_status()
            .context("Post rejected")?
            .json()
            .await
            .context("Failed to parse created record")?;

        post_url(&session.handle, &created.uri)
    }
}

#[async_trait]
impl Platform for BlueskyClient {
    async fn post(
        &self,
        cancel: &CancellationToken,
        user: UserId,
        post: &MicroblogPost,
    ) -> Result<String> {
        let Some(session) = cancellable(cancel, self.session(user)).await? else {
            bail!("no Bluesky account linked");
        };
        let url = cancellable(cancel, self.publish(&session, post)).await?;
        info!("Bluesky: posted for user {}: {}", user, url);
        Ok(url)
    }
}

#[async_trait]
impl Authorizer for BlueskyClient {
    async fn is_authorized(&self, user: UserId) -> bool {
        if self.sessions.lock().await.contains_key(&user) {
            return true;
        }
        match self.credentials.load::<BlueskyAccount>(user, PLATFORM).await {
            Ok(account) => account.is_some(),
            Err(e) => {
                warn!("Bluesky: loading account for user {} failed: {:#}", user, e);
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

/// The `app.bsky.feed.post` record for `post`.
fn post_record(post: &MicroblogPost, blobs: &[Value], now: chrono::DateTime<chrono::Utc>) -> Value {
    let langs: Vec<&str> = if post.langs.is_empty() {
        FALLBACK_LANGS.to_vec()
    } else {
        post.langs.iter().map(String::as_str).collect()
    };
    let mut record = json!({
        "$type": POST_COLLECTION,
        "text": post.text,
        "createdAt": now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "langs": langs,
    });

    let facets = link_facets(&post.text);
    if !facets.is_empty() {
        record["facets"] = Value::Array(facets);
    }

    if !blobs.is_empty() {
        let images: Vec<Value> = post
            .images
            .iter()
            .zip(blobs)
            .map(|(image, blob)| json!({ "alt": image.alt_text, "image": blob }))
            .collect();
        record["embed"] = json!({
            "$type": "app.bsky.embed.images",
            "images": images,
        });
    }
    record
}

/// Link facets for every http(s) URL in `text`. Bluesky does not linkify
/// plain text, and facet offsets are UTF-8 byte positions.
fn link_facets(text: &str) -> Vec<Value> {
    let mut facets = Vec::new();
    let mut start = None;
    for (idx, ch) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
        match (ch.is_whitespace(), start) {
            (false, None) => start = Some(idx),
            (true, Some(begin)) => {
                let word = &text[begin..idx];
                if word.starts_with("https://") || word.starts_with("http://") {
                    let uri = word.trim_end_matches(|c: char| ".,;:!?)".contains(c));
                    let end = begin + uri.len();
                    facets.push(json!({
                        "index": { "byteStart": begin, "byteEnd": end },
                        "features": [{
                            "$type": "app.bsky.richtext.facet#link",
                            "uri": uri,
                        }],
                    }));
                }
                start = None;
            }
            _ => {}
        }
    }
    facets
}

/// Web URL for the record at `at_uri` (`at://<did>/<collection>/<rkey>`).
fn post_url(handle: &str, at_uri: &str) -> Result<String> {
    let rkey = at_uri
        .strip_prefix("at://")
        .and_then(|rest| rest.rsplit('/').next())
        .filter(|rkey| !rkey.is_empty())
        .with_context(|| format!("Unexpected record URI: {at_uri}"))?;
    Ok(format!("https://bsky.app/profile/{handle}/post/{rkey}"))
}
