use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blogging::{BlogImage, MicroblogPost, Platforms};
use crate::im::flow::{Flow, FlowError, FlowOutcome};
use crate::im::{Message, Messenger, UserId};

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(120);

/// In-progress drafts, at most one per user. Every compound operation runs
/// under a single lock acquisition.
#[derive(Clone, Default)]
pub struct DraftStore {
    drafts: Arc<Mutex<HashMap<UserId, MicroblogPost>>>,
}

impl DraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `post` unless the user already has a draft. Returns whether
    /// it was stored.
    pub async fn create(&self, user: UserId, post: MicroblogPost) -> bool {
        let mut drafts = self.drafts.lock().await;
        if drafts.contains_key(&user) {
            return false;
        }
        drafts.insert(user, post);
        true
    }

    /// Apply `f` to the user's draft, if there is one.
    pub async fn update<R>(
        &self,
        user: UserId,
        f: impl FnOnce(&mut MicroblogPost) -> R,
    ) -> Option<R> {
        let mut drafts = self.drafts.lock().await;
        drafts.get_mut(&user).map(f)
    }

    /// Remove and return the user's draft.
    pub async fn take(&self, user: UserId) -> Option<MicroblogPost> {
        self.drafts.lock().await.remove(&user)
    }

    #[cfg(test)]
    pub async fn get(&self, user: UserId) -> Option<MicroblogPost> {
        self.drafts.lock().await.get(&user).cloned()
    }
}

/// Collects text and images into a draft and publishes it to every enabled
/// platform.
///
/// `/new` opens a draft, plain messages add to it, `/send` publishes and
/// `/cancel` discards. Clones share the same draft store, so one instance
/// can be handed to every user's scheduler.
#[derive(Clone)]
pub struct PostingFlow {
    drafts: DraftStore,
    platforms: Arc<Platforms>,
    default_langs: Vec<String>,
    publish_timeout: Duration,
}

impl PostingFlow {
    pub fn new(platforms: Platforms, default_langs: Vec<String>) -> Self {
        Self {
            drafts: DraftStore::new(),
            platforms: Arc::new(platforms),
            default_langs,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Bound on one platform's publish, so a stalled server is reported as
    /// that platform's failure instead of holding the user's session.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    #[cfg(test)]
    pub fn drafts(&self) -> &DraftStore {
        &self.drafts
    }

    async fn reply(
        &self,
        messenger: &dyn Messenger,
        message: &Message,
        text: impl Into<String>,
    ) -> Result<(), FlowError> {
        messenger
            .send_message(&message.reply(text))
            .await
            .map_err(|e| FlowError::delivery(messenger, e))
    }

    async fn new_post(
        &self,
        message: &Message,
        messenger: &dyn Messenger,
    ) -> Result<FlowOutcome, FlowError> {
        let command = message.as_command(self.command_parser())?;
        let (keyword, positional) = command.split_args();
        let raw_langs = keyword
            .get("langs")
            .or_else(|| keyword.get("lang"))
            .or_else(|| positional.iter().find(|p| !p.is_empty()));
        let langs = match raw_langs {
            Some(raw) => parse_langs(raw),
            None => self.default_langs.clone(),
        };

        let created = self
            .drafts
            .create(message.user_id, MicroblogPost::with_langs(langs.clone()))
            .await;
        if !created {
            self.reply(
                messenger,
                message,
                "You already have an active post. Use /send to post it or /cancel to discard it.",
            )
            .await?;
            return Ok(FlowOutcome::Continue);
        }

        info!("User {} started a new post (langs: {:?})", message.user_id, langs);
        let mut text = String::from(
            "Started a new post. Now send text or images to add content. \
             Use /send when ready or /cancel to discard.",
        );
        if !langs.is_empty() {
            text.push_str(&format!("\nLanguages: {}", langs.join(", ")));
        }
        self.reply(messenger, message, text).await?;
        Ok(FlowOutcome::Continue)
    }

    async fn add_content(
        &self,
        message: &Message,
        messenger: &dyn Messenger,
    ) -> Result<FlowOutcome, FlowError> {
        let added = self
            .drafts
            .update(message.user_id, |post| {
                let mut added = false;
                if !message.text.is_empty() {
                    post.append_text(&message.text);
                    added = true;
                }
                for image in &message.images {
                    post.add_image(BlogImage::from(image));
                    added = true;
                }
                added
            })
            .await;

        match added {
            None => {
                self.reply(
                    messenger,
                    message,
                    "No active post. Use /new to start writing a new post.",
                )
                .await?;
                Ok(FlowOutcome::Finished)
            }
            Some(true) => {
                debug!("Added content to the post of user {}", message.user_id);
                self.reply(messenger, message, "Content added to your post.")
                    .await?;
                Ok(FlowOutcome::Continue)
            }
            Some(false) => {
                self.reply(
                    messenger,
                    message,
                    "Received message, but no content was added.",
                )
                .await?;
                Ok(FlowOutcome::Continue)
            }
        }
    }

    async fn send_post(
        &self,
        cancel: &CancellationToken,
        message: &Message,
        messenger: &dyn Messenger,
    ) -> Result<FlowOutcome, FlowError> {
        let user = message.user_id;
        // Taken before publishing so a second /send finds nothing.
        let Some(post) = self.drafts.take(user).await else {
            self.reply(
                messenger,
                message,
                "No active post to send. Use /new to start a post.",
            )
            .await?;
            return Ok(FlowOutcome::Finished);
        };

        if self.platforms.is_empty() {
            self.reply(
                messenger,
                message,
                "No platforms are enabled, the post was discarded.",
            )
            .await?;
            return Ok(FlowOutcome::Finished);
        }

        info!(
            "Sending post for user {} to {} platform(s)",
            user,
            self.platforms.len()
        );
        let timeout = self.publish_timeout;
        let results = join_all(self.platforms.iter().map(|(name, platform)| {
            let post = &post;
            async move {
                let publish = async {
                    if !platform.is_authorized(user).await {
                        return Err(anyhow::anyhow!(
                            "account not authorized, use /{}_auth first",
                            name.to_lowercase()
                        ));
                    }
                    platform.post(cancel, user, post).await
                };
                match tokio::time::timeout(timeout, publish).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "no answer after {:?}, the post may not have been published",
                        timeout
                    )),
                }
            }
        }))
        .await;

        let mut delivery_errors = Vec::new();
        for ((name, _), result) in self.platforms.iter().zip(results) {
            let text = match result {
                Ok(url) => {
                    info!("Post for user {} sent to {}: {}", user, name, url);
                    format!("Post sent to {name} ({url})")
                }
                Err(e) => {
                    warn!("Posting to {} failed for user {}: {:#}", name, user, e);
                    format!("Post not sent to {name}: {e:#}")
                }
            };
            if let Err(e) = messenger.send_message(&message.reply(text)).await {
                warn!("{} send message err: {:#}", messenger.name(), e);
                delivery_errors.push(e);
            }
        }

        if !delivery_errors.is_empty() {
            return Err(FlowError::DeliveryBatch(delivery_errors));
        }
        Ok(FlowOutcome::Finished)
    }

    async fn cancel_post(
        &self,
        message: &Message,
        messenger: &dyn Messenger,
    ) -> Result<FlowOutcome, FlowError> {
        let response = match self.drafts.take(message.user_id).await {
            Some(_) => "Post canceled.",
            None => "No active post to cancel.",
        };
        self.reply(messenger, message, response).await?;
        Ok(FlowOutcome::Finished)
    }
}

/// Split a `en,es` style list, dropping empty entries.
fn parse_langs(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Flow for PostingFlow {
    async fn start(
        &mut self,
        cancel: &CancellationToken,
        message: &Message,
        messenger: &dyn Messenger,
    ) -> Result<FlowOutcome, FlowError> {
        self.handle_message(cancel, message, messenger).await
    }

    async fn handle_message(
        &mut self,
        cancel: &CancellationToken,
        message: &Message,
        messenger: &dyn Messenger,
    ) -> Result<FlowOutcome, FlowError> {
        if !message.is_command() {
            return self.add_content(message, messenger).await;
        }

        let command = message.as_command(self.command_parser())?;
        match command.name.as_str() {
            "/new" => self.new_post(message, messenger).await,
            "/send" => self.send_post(cancel, message, messenger).await,
            "/cancel" => self.cancel_post(message, messenger).await,
            other => {
                self.reply(
                    messenger,
                    message,
                    format!(
                        "Unknown command {other} while writing a post. \
                         Use /send to post it or /cancel to discard it."
                    ),
                )
                .await?;
                Ok(FlowOutcome::Continue)
            }
        }
    }
}
