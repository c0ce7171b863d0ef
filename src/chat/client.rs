// Consumer side of the push stream
//
// The hub keeps no history, so a consumer that loses its stream must poll
// `/api/messages?after=<cursor>` until the stream is back. `Timeline` holds
// the cursor and deduplicates by id whichever path a message arrives on.

use crate::chat::message::{Message, MessageStatus, StatusUpdate};
use std::collections::HashSet;

/// One parsed event-stream event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

/// Incremental parser for `text/event-stream` bodies
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completes
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = Self::parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    fn parse_block(block: &str) -> Option<SseEvent> {
        let mut id = None;
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();

        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "id" => id = Some(value.to_string()),
                "event" => event = Some(value.to_string()),
                "data" => data.push(value),
                _ => {}
            }
        }

        // Comment-only blocks carry no event
        if event.is_none() && data.is_empty() {
            return None;
        }

        Some(SseEvent {
            id,
            event: event.unwrap_or_else(|| "message".to_string()),
            data: data.join("\n"),
        })
    }
}

/// How the consumer is currently receiving messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Streaming,
    Polling,
}

/// Local view of the conversation for one participant
#[derive(Debug)]
pub struct Timeline {
    client_id: String,
    messages: Vec<Message>,
    seen: HashSet<String>,
    cursor: Option<u64>,
    mode: FeedMode,
}

impl Timeline {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            messages: Vec::new(),
            seen: HashSet::new(),
            cursor: None,
            mode: FeedMode::Streaming,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// `createdAt` of the newest message seen
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    pub fn mode(&self) -> FeedMode {
        self.mode
    }

    /// The stream failed: poll until it is re-established
    pub fn on_stream_error(&mut self) {
        if self.mode == FeedMode::Streaming {
            tracing::debug!("Stream lost, falling back to polling");
        }
        self.mode = FeedMode::Polling;
    }

    /// The stream is open again
    pub fn on_stream_open(&mut self) {
        self.mode = FeedMode::Streaming;
    }

    /// Path for the next catch-up poll
    pub fn poll_path(&self) -> String {
        match self.cursor {
            Some(cursor) => format!("/api/messages?after={cursor}"),
            None => "/api/messages".to_string(),
        }
    }

    /// Merge messages from either path, returning ids this client should ack
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = Message>) -> Vec<String> {
        let mut acks = Vec::new();

        for message in incoming {
            self.cursor = Some(self.cursor.map_or(message.created_at, |c| c.max(message.created_at)));

            if !self.seen.insert(message.id.clone()) {
                // Already rendered; only the status can have moved on
                if message.status == MessageStatus::Delivered {
                    if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
                        existing.status = MessageStatus::Delivered;
                        existing.delivered_at = message.delivered_at;
                    }
                }
                continue;
            }

            if message.sender_id != self.client_id && message.status == MessageStatus::Sent {
                acks.push(message.id.clone());
            }

            let at = self
                .messages
                .partition_point(|m| m.created_at <= message.created_at);
            self.messages.insert(at, message);
        }

        acks
    }

    /// Mark own messages listed in a status update as delivered
    pub fn apply_status(&mut self, update: &StatusUpdate) -> usize {
        let mut changed = 0;
        for message in self.messages.iter_mut() {
            if message.sender_id == self.client_id
                && message.status == MessageStatus::Sent
                && update.message_ids.contains(&message.id)
            {
                message.status = MessageStatus::Delivered;
                changed += 1;
            }
        }
        changed
    }

    /// Apply a pushed event, returning ids this client should ack
    pub fn apply_event(&mut self, event: &SseEvent) -> serde_json::Result<Vec<String>> {
        match event.event.as_str() {
            "message" => {
                let message: Message = serde_json::from_str(&event.data)?;
                Ok(self.merge([message]))
            }
            "status" => {
                let update: StatusUpdate = serde_json::from_str(&event.data)?;
                self.apply_status(&update);
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::NewMessage;

    fn message_at(sender: &str, content: &str, created_at: u64) -> Message {
        let mut message = NewMessage::text(sender, content).into_message().unwrap();
        message.created_at = created_at;
        message
    }

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(": connected\n\n").is_empty());
        assert!(parser.push("id: m1\nevent: mes").is_empty());

        let events = parser.push("sage\ndata: {\"a\":1}\n\nevent: ping\ndata: {}\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    id: Some("m1".into()),
                    event: "message".into(),
                    data: "{\"a\":1}".into()
                },
                SseEvent {
                    id: None,
                    event: "ping".into(),
                    data: "{}".into()
                },
            ]
        );
    }

    #[test]
    fn test_merge_dedups_and_advances_cursor() {
        let mut timeline = Timeline::new("bob");
        let a = message_at("alice", "a", 10);
        let b = message_at("alice", "b", 20);

        let acks = timeline.merge([b.clone(), a.clone()]);
        assert_eq!(acks.len(), 2);
        assert_eq!(timeline.cursor(), Some(20));
        assert_eq!(timeline.messages()[0].id, a.id);

        // Polling overlap returns b again
        let acks = timeline.merge([b.clone()]);
        assert!(acks.is_empty());
        assert_eq!(timeline.messages().len(), 2);
        assert_eq!(timeline.poll_path(), "/api/messages?after=20");
    }

    #[test]
    fn test_own_messages_not_acked() {
        let mut timeline = Timeline::new("alice");
        let acks = timeline.merge([message_at("alice", "mine", 1)]);
        assert!(acks.is_empty());
    }

    #[test]
    fn test_status_updates_own_messages() {
        let mut timeline = Timeline::new("alice");
        let mine = message_at("alice", "mine", 1);
        let theirs = message_at("bob", "theirs", 2);
        timeline.merge([mine.clone(), theirs.clone()]);

        let update = StatusUpdate {
            message_ids: vec![mine.id.clone(), theirs.id.clone(), "unknown".into()],
        };
        assert_eq!(timeline.apply_status(&update), 1);
        assert_eq!(timeline.get(&mine.id).unwrap().status, MessageStatus::Delivered);
        assert_eq!(timeline.get(&theirs.id).unwrap().status, MessageStatus::Sent);
        assert_eq!(timeline.apply_status(&update), 0);
    }

    #[test]
    fn test_mode_transitions() {
        let mut timeline = Timeline::new("alice");
        assert_eq!(timeline.mode(), FeedMode::Streaming);
        assert_eq!(timeline.poll_path(), "/api/messages");

        timeline.on_stream_error();
        assert_eq!(timeline.mode(), FeedMode::Polling);
        timeline.on_stream_open();
        assert_eq!(timeline.mode(), FeedMode::Streaming);
    }
}
