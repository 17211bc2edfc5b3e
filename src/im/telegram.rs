//! Telegram binding: teloxide messages in, [`Messenger`] replies out.

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId, ReplyParameters};
use tracing::debug;

use crate::im::{Image, Message, Messenger, Transport, UserId};

/// Telegram rejects texts over 4096 chars; stay a little under.
const MAX_TEXT_LEN: usize = 4000;

/// Convert a teloxide message, downloading the largest attached photo.
/// Messages without a sender (channel posts) yield `None`.
pub async fn from_telegram(bot: &Bot, msg: &teloxide::types::Message) -> Result<Option<Message>> {
    let Some(mut message) = convert(msg) else {
        return Ok(None);
    };

    // Telegram sends every resolution of a photo; the last one is the largest.
    if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
        let file = bot
            .get_file(photo.file.id.clone())
            .await
            .context("telegram get photo file")?;
        let mut data = Vec::new();
        bot.download_file(&file.path, &mut data)
            .await
            .context("telegram download photo file")?;
        debug!("Downloaded {} byte photo from chat {}", data.len(), message.chat_id);
        message.images.push(Image {
            data,
            caption: msg.caption().unwrap_or_default().to_string(),
        });
    }

    Ok(Some(message))
}

fn convert(msg: &teloxide::types::Message) -> Option<Message> {
    let user = msg.from.as_ref()?;
    Some(Message {
        transport: Transport::Telegram,
        chat_id: msg.chat.id.0,
        user_id: UserId(user.id.0),
        message_id: Some(i64::from(msg.id.0)),
        in_reply_to: msg.reply_to_message().map(|m| i64::from(m.id.0)),
        text: msg.text().unwrap_or_default().to_string(),
        images: Vec::new(),
    })
}

/// Split long messages on newline or space boundaries.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Sends [`Message`]s through the Bot API.
#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_message(&self, message: &Message) -> Result<()> {
        let chat = ChatId(message.chat_id);
        let reply_to = message
            .in_reply_to
            .and_then(|id| i32::try_from(id).ok())
            .map(|id| ReplyParameters::new(MessageId(id)));

        if message.text.is_empty() {
            return Ok(());
        }
        for chunk in split_message(&message.text, MAX_TEXT_LEN) {
            let mut request = self.bot.send_message(chat, chunk);
            if let Some(params) = &reply_to {
                request = request.reply_parameters(params.clone());
            }
            request.await.context("telegram send message")?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn telegram_message(value: serde_json::Value) -> teloxide::types::Message {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_split_short_message() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
    }

    #[test]
    fn test_split_prefers_newlines_then_spaces() {
        let chunks = split_message("aaaa\nbbbb cccc", 8);
        assert_eq!(chunks, vec!["aaaa\n", "bbbb ", "cccc"]);
        assert_eq!(chunks.concat(), "aaaa\nbbbb cccc");
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "ñ".repeat(10);
        let chunks = split_message(&text, 5);
        assert!(chunks.iter().all(|c| c.len() <= 5));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_convert_text_message() {
        let msg = telegram_message(json!({
            "message_id": 17,
            "date": 1700000000,
            "chat": { "id": 42, "type": "private", "first_name": "Ana" },
            "from": { "id": 42, "is_bot": false, "first_name": "Ana" },
            "text": "/new lang=es"
        }));

        let converted = convert(&msg).unwrap();
        assert_eq!(converted.transport, Transport::Telegram);
        assert_eq!(converted.chat_id, 42);
        assert_eq!(converted.user_id, UserId(42));
        assert_eq!(converted.message_id, Some(17));
        assert_eq!(converted.in_reply_to, None);
        assert_eq!(converted.text, "/new lang=es");
        assert!(converted.images.is_empty());
    }

    #[test]
    fn test_convert_requires_sender() {
        let msg = telegram_message(json!({
            "message_id": 3,
            "date": 1700000000,
            "chat": { "id": -100, "type": "channel", "title": "news" },
            "text": "hello"
        }));
        assert!(convert(&msg).is_none());
    }
}
