//! Microblog drafts and the contracts every publishing platform implements.

pub mod authorize;
pub mod bluesky;
pub mod mastodon;
pub mod posting;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::im::handshake::{AuthorizationChannel, HandshakeError};
use crate::im::{Image, UserId};

/// An image attached to a draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlogImage {
    pub data: Vec<u8>,
    pub alt_text: String,
}

impl BlogImage {
    pub fn new(data: Vec<u8>, alt_text: impl Into<String>) -> Self {
        Self {
            data,
            alt_text: alt_text.into(),
        }
    }

    /// MIME type guessed from the leading magic bytes. Chats mostly hand us
    /// JPEGs, so that is the fallback.
    pub fn mime_type(&self) -> &'static str {
        let d = &self.data;
        if d.starts_with(&[0x89, b'P', b'N', b'G']) {
            "image/png"
        } else if d.starts_with(b"GIF8") {
            "image/gif"
        } else if d.len() >= 12 && &d[0..4] == b"RIFF" && &d[8..12] == b"WEBP" {
            "image/webp"
        } else {
            "image/jpeg"
        }
    }

    pub fn file_name(&self, index: usize) -> String {
        let ext = self
            .mime_type()
            .strip_prefix("image/")
            .unwrap_or("jpeg");
        format!("image-{index}.{ext}")
    }
}

impl From<&Image> for BlogImage {
    fn from(image: &Image) -> Self {
        BlogImage::new(image.data.clone(), image.caption.clone())
    }
}

/// A post being written: text accumulated line by line plus images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MicroblogPost {
    pub text: String,
    pub images: Vec<BlogImage>,
    /// ISO 639-1 language tags, possibly empty.
    pub langs: Vec<String>,
}

impl MicroblogPost {
    pub fn with_langs(langs: Vec<String>) -> Self {
        Self {
            langs,
            ..Default::default()
        }
    }

    /// Append a contribution on its own line.
    pub fn append_text(&mut self, text: &str) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(text);
    }

    pub fn add_image(&mut self, image: BlogImage) {
        self.images.push(image);
    }
}

/// A service drafts can be published to.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Publish `post` on behalf of `user`, returning the canonical URL.
    async fn post(
        &self,
        cancel: &CancellationToken,
        user: UserId,
        post: &MicroblogPost,
    ) -> Result<String>;
}

/// Links a chat user to an account on some service.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_authorized(&self, user: UserId) -> bool;

    /// Spawn the authorization task for `user` and return the channel its
    /// questions arrive on. The task stops waiting once `cancel` fires and
    /// closes the channel when it is done, whatever the result.
    async fn start_authorization(
        &self,
        cancel: CancellationToken,
        user: UserId,
    ) -> Result<AuthorizationChannel>;
}

pub trait AuthedPlatform: Platform + Authorizer {}

impl<T: Platform + Authorizer + ?Sized> AuthedPlatform for T {}

/// Enabled platforms by display name, in a stable order.
pub type Platforms = BTreeMap<String, Arc<dyn AuthedPlatform>>;

/// HTTP client shared by the platform clients. Every request is bounded so
/// a silent server cannot hold a user's session.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("crossposter/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

/// Race `fut` against cancellation.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => anyhow::bail!("canceled"),
        res = fut => res,
    }
}

/// True when an authorization task failed only because the chat side went
/// away, so there is nobody left to tell.
pub(crate) fn is_handshake_abort(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<HandshakeError>(),
        Some(HandshakeError::Canceled | HandshakeError::Closed)
    )
}
