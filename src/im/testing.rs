//! Test doubles for messengers and publishing platforms.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::blogging::{Authorizer, MicroblogPost, Platform};
use crate::im::handshake::AuthorizationChannel;
use crate::im::{Message, Messenger, Transport, UserId};

/// An inbound Telegram-like message from `user` with the given text.
pub fn message(user: u64, text: &str) -> Message {
    Message {
        transport: Transport::Telegram,
        chat_id: user as i64,
        user_id: UserId(user),
        message_id: Some(1),
        in_reply_to: None,
        text: text.to_string(),
        images: Vec::new(),
    }
}

/// Messenger that keeps every message it was asked to send. Sends whose
/// text contains `fail_on` are rejected and not recorded.
#[derive(Clone, Default)]
pub struct RecordingMessenger {
    sent: Arc<Mutex<Vec<Message>>>,
    fail_on: Option<String>,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(pattern: &str) -> Self {
        Self {
            sent: Arc::default(),
            fail_on: Some(pattern.to_string()),
        }
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|m| m.text).collect()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_message(&self, message: &Message) -> Result<()> {
        if let Some(pattern) = &self.fail_on {
            if message.text.contains(pattern.as_str()) {
                bail!("refusing to send {:?}", message.text);
            }
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Platform double with a fixed authorization state and publish result.
pub struct ScriptedPlatform {
    authorized: bool,
    stalls: bool,
    result: std::result::Result<String, String>,
    posts: Mutex<Vec<(UserId, MicroblogPost)>>,
}

impl ScriptedPlatform {
    pub fn publishing_to(url: &str) -> Arc<Self> {
        Arc::new(Self {
            authorized: true,
            stalls: false,
            result: Ok(url.to_string()),
            posts: Mutex::default(),
        })
    }

    pub fn failing_with(error: &str) -> Arc<Self> {
        Arc::new(Self {
            authorized: true,
            stalls: false,
            result: Err(error.to_string()),
            posts: Mutex::default(),
        })
    }

    pub fn unauthorized() -> Arc<Self> {
        Arc::new(Self {
            authorized: false,
            stalls: false,
            result: Err("unreachable".to_string()),
            posts: Mutex::default(),
        })
    }

    /// A publish that never completes, like a server that stopped answering.
    pub fn stalling() -> Arc<Self> {
        Arc::new(Self {
            authorized: true,
            stalls: true,
            result: Err("unreachable".to_string()),
            posts: Mutex::default(),
        })
    }

    pub fn posts(&self) -> Vec<(UserId, MicroblogPost)> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Platform for ScriptedPlatform {
    async fn post(
        &self,
        _cancel: &CancellationToken,
        user: UserId,
        post: &MicroblogPost,
    ) -> Result<String> {
        self.posts.lock().unwrap().push((user, post.clone()));
        if self.stalls {
            std::future::pending::<()>().await;
        }
        // Yield so concurrent publishes interleave in tests.
        tokio::task::yield_now().await;
        self.result.clone().map_err(anyhow::Error::msg)
    }
}

#[async_trait]
impl Authorizer for ScriptedPlatform {
    async fn is_authorized(&self, _user: UserId) -> bool {
        self.authorized
    }

    async fn start_authorization(
        &self,
        _cancel: CancellationToken,
        _user: UserId,
    ) -> Result<AuthorizationChannel> {
        bail!("authorization is not scripted")
    }
}
