//! Transport-agnostic chat model: inbound/outbound messages, the messenger
//! seam replies go through, and the conversation-flow engine.

pub mod command;
pub mod flow;
pub mod handshake;
pub mod telegram;
#[cfg(test)]
pub mod testing;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::im::command::{Command, CommandError, CommandParser};

/// Chat transport a message arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Telegram,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Telegram => write!(f, "telegram"),
        }
    }
}

/// Transport-specific user id, the key every per-user store is indexed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An image as it travels between chats and the bot: raw bytes plus caption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub data: Vec<u8>,
    pub caption: String,
}

/// A message received from, or about to be sent to, a chat.
#[derive(Debug, Clone)]
pub struct Message {
    pub transport: Transport,
    pub chat_id: i64,
    pub user_id: UserId,
    /// `None` for outbound messages that have not been delivered yet.
    pub message_id: Option<i64>,
    pub in_reply_to: Option<i64>,
    pub text: String,
    pub images: Vec<Image>,
}

impl Message {
    /// Derive a reply that keeps the routing identifiers of this message.
    pub fn reply(&self, text: impl Into<String>) -> Message {
        Message {
            transport: self.transport,
            chat_id: self.chat_id,
            user_id: self.user_id,
            message_id: None,
            in_reply_to: self.message_id,
            text: text.into(),
            images: Vec::new(),
        }
    }

    /// A command is any message whose text starts with `/`.
    pub fn is_command(&self) -> bool {
        self.text.starts_with('/')
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.images.is_empty()
    }

    /// Parse the text as a command with the given parser.
    pub fn as_command(&self, parser: CommandParser) -> Result<Command, CommandError> {
        if !self.is_command() {
            return Err(CommandError::NotACommand(self.text.clone()));
        }
        parser(&self.text)
    }
}

/// Outbound side of a chat transport.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_message(&self, message: &Message) -> Result<()>;

    /// Short transport name used in logs.
    fn name(&self) -> &str;
}
