// Message model shared by the store, the event hub and the HTTP API

use crate::chat::clock::now_millis;
use crate::chat::error::{ChatError, ChatResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest content kept on a message, in characters
pub const MAX_CONTENT_CHARS: usize = 2000;

/// Kind of payload a message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "video" => Some(MessageKind::Video),
            "file" => Some(MessageKind::File),
            _ => None,
        }
    }
}

/// Delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "delivered" => MessageStatus::Delivered,
            _ => MessageStatus::Sent,
        }
    }
}

/// A stored message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message ID
    pub id: String,
    /// Client ID of the sender
    pub sender_id: String,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
    pub status: MessageStatus,
    /// ms since the Unix epoch
    pub created_at: u64,
    pub delivered_at: Option<u64>,
}

/// Client-submitted message, before it is stored
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(default)]
    pub sender_id: String,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<MessageKind>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
}

impl NewMessage {
    /// Plain text message
    pub fn text(sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            content: Some(content.into()),
            kind: Some(MessageKind::Text),
            ..Default::default()
        }
    }

    /// Validate and turn into a fresh `sent` message
    pub fn into_message(self) -> ChatResult<Message> {
        if self.sender_id.trim().is_empty() {
            return Err(ChatError::InvalidPayload("senderId is required".into()));
        }
        let kind = self
            .kind
            .ok_or_else(|| ChatError::InvalidPayload("type is required".into()))?;

        let content = self
            .content
            .map(|c| c.chars().take(MAX_CONTENT_CHARS).collect::<String>());

        Ok(Message {
            id: Uuid::new_v4().to_string(),
            sender_id: self.sender_id,
            content,
            kind,
            file_url: self.file_url,
            file_name: self.file_name,
            file_size: self.file_size,
            mime_type: self.mime_type,
            status: MessageStatus::Sent,
            created_at: now_millis(),
            delivered_at: None,
        })
    }
}

/// Payload of the "status" topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub message_ids: Vec<String>,
}
