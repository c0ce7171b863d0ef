// Push stream sessions (text/event-stream)
//
// One `StreamSession` per open connection: Connecting -> Open -> Closed.
// Subscriptions and the heartbeat timer live inside `run`, so they are
// released on every way out of it, including the task being aborted.

use crate::chat::clock::now_millis;
use crate::chat::error::{ChatError, ChatResult};
use crate::chat::events::{EventHub, HubEvent, Topic};
use crate::chat::session::SessionManager;
use hyper::body::{Bytes, Sender};
use serde::Serialize;
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Interval between `ping` events
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(15_000);

/// Lifecycle of a stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Open,
    Closed,
}

/// Why a session reached `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away or the transport failed
    ClientGone,
    /// The server is shutting down
    Shutdown,
    /// The event hub was dropped
    HubClosed,
}

/// Comment frame, ignored by consumers but keeps intermediaries busy
pub fn comment_frame(text: &str) -> Bytes {
    Bytes::from(format!(": {text}\n\n"))
}

/// Event frame with an optional resumable id
pub fn event_frame<T: Serialize>(
    event: &str,
    id: Option<&str>,
    data: &T,
) -> Result<Bytes, serde_json::Error> {
    let data = serde_json::to_string(data)?;
    let mut frame = String::with_capacity(data.len() + event.len() + 32);
    if let Some(id) = id {
        frame.push_str("id: ");
        frame.push_str(id);
        frame.push('\n');
    }
    frame.push_str("event: ");
    frame.push_str(event);
    frame.push_str("\ndata: ");
    frame.push_str(&data);
    frame.push_str("\n\n");
    Ok(Bytes::from(frame))
}

/// Frame for a hub event: messages carry their id, status updates do not
pub fn hub_event_frame(event: &HubEvent) -> Result<Bytes, serde_json::Error> {
    match event {
        HubEvent::Message(message) => {
            event_frame(Topic::Message.as_str(), Some(&message.id), message)
        }
        HubEvent::Status(update) => event_frame(Topic::Status.as_str(), None, update),
    }
}

#[derive(Serialize)]
struct Ping {
    time: u64,
}

/// Heartbeat frame carrying the current time
pub fn ping_frame() -> Bytes {
    event_frame("ping", None, &Ping { time: now_millis() })
        .unwrap_or_else(|_| comment_frame("ping"))
}

/// Resolves once the receiving side of `sink` has been dropped
async fn client_gone(sink: &mut Sender) {
    poll_fn(|cx| match sink.poll_ready(cx) {
        Poll::Ready(Err(_)) => Poll::Ready(()),
        _ => Poll::Pending,
    })
    .await
}

/// A single push stream connection
pub struct StreamSession {
    hub: EventHub,
    heartbeat: Duration,
    shutdown: CancellationToken,
    state: StreamState,
}

impl StreamSession {
    pub fn new(hub: EventHub, heartbeat: Duration, shutdown: CancellationToken) -> Self {
        Self {
            hub,
            heartbeat,
            shutdown,
            state: StreamState::Connecting,
        }
    }

    /// Create a session only for a valid session token
    pub fn authorize(
        sessions: &SessionManager,
        token: Option<&str>,
        hub: EventHub,
        heartbeat: Duration,
        shutdown: CancellationToken,
    ) -> ChatResult<Self> {
        match token {
            Some(token) if sessions.validate(token) => Ok(Self::new(hub, heartbeat, shutdown)),
            _ => Err(ChatError::Unauthorized),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Serve the stream into `sink` until the connection closes
    pub async fn run(mut self, mut sink: Sender) -> CloseReason {
        let reason = self.serve(&mut sink).await;
        self.state = StreamState::Closed;
        tracing::debug!("Stream closed: {:?}", reason);
        reason
    }

    async fn serve(&mut self, sink: &mut Sender) -> CloseReason {
        // One queue for both topics keeps frames in publish order
        let mut events = self.hub.subscribe_many(&[Topic::Message, Topic::Status]);
        self.state = StreamState::Open;
        tracing::debug!("Stream opened (subscription {})", events.id());

        if let Err(reason) = self.write(sink, comment_frame("connected")).await {
            return reason;
        }

        let start = tokio::time::Instant::now() + self.heartbeat;
        let mut heartbeat = tokio::time::interval_at(start, self.heartbeat);

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return CloseReason::Shutdown,
                _ = client_gone(sink) => return CloseReason::ClientGone,
                event = events.recv() => match event {
                    Some(event) => hub_event_frame(&event),
                    None => return CloseReason::HubClosed,
                },
                _ = heartbeat.tick() => Ok(ping_frame()),
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!("Failed to encode stream event: {}", e);
                    continue;
                }
            };

            if let Err(reason) = self.write(sink, frame).await {
                return reason;
            }
        }
    }

    async fn write(&self, sink: &mut Sender, frame: Bytes) -> Result<(), CloseReason> {
        tokio::select! {
            result = sink.send_data(frame) => result.map_err(|_| CloseReason::ClientGone),
            _ = self.shutdown.cancelled() => Err(CloseReason::Shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::{NewMessage, StatusUpdate};
    use hyper::body::HttpBody;
    use hyper::Body;

    async fn next_frame(body: &mut Body) -> String {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.data())
            .await
            .expect("frame in time")
            .expect("body open")
            .expect("chunk");
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    async fn wait_for_subscribers(hub: &EventHub) {
        for _ in 0..100 {
            if hub.subscriber_count(Topic::Message) == 1 && hub.subscriber_count(Topic::Status) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stream never subscribed");
    }

    #[test]
    fn test_frame_format() {
        assert_eq!(&comment_frame("connected")[..], b": connected\n\n");

        let frame = event_frame("status", None, &StatusUpdate { message_ids: vec!["a".into()] }).unwrap();
        assert_eq!(&frame[..], b"event: status\ndata: {\"messageIds\":[\"a\"]}\n\n");

        let frame = event_frame("message", Some("m1"), &serde_json::json!({"id": "m1"})).unwrap();
        assert_eq!(&frame[..], b"id: m1\nevent: message\ndata: {\"id\":\"m1\"}\n\n");
    }

    #[test]
    fn test_authorize_requires_valid_session() {
        let sessions = SessionManager::new("s", Duration::from_secs(60));
        let hub = EventHub::default();
        let token = sessions.issue();

        let ok = StreamSession::authorize(
            &sessions,
            Some(&token),
            hub.clone(),
            HEARTBEAT_INTERVAL,
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(ok.state(), StreamState::Connecting);

        for bad in [None, Some("garbage")] {
            assert!(matches!(
                StreamSession::authorize(&sessions, bad, hub.clone(), HEARTBEAT_INTERVAL, CancellationToken::new()),
                Err(ChatError::Unauthorized)
            ));
        }
    }

    #[tokio::test]
    async fn test_forwards_events_with_ids() {
        let hub = EventHub::default();
        let shutdown = CancellationToken::new();
        let session = StreamSession::new(hub.clone(), HEARTBEAT_INTERVAL, shutdown.clone());
        let (sink, mut body) = Body::channel();
        let task = tokio::spawn(session.run(sink));

        assert_eq!(next_frame(&mut body).await, ": connected\n\n");
        wait_for_subscribers(&hub).await;

        let message = NewMessage::text("alice", "hi").into_message().unwrap();
        hub.publish(HubEvent::Message(message.clone()));
        let frame = next_frame(&mut body).await;
        assert!(frame.starts_with(&format!("id: {}\nevent: message\ndata: ", message.id)));

        hub.publish(HubEvent::Status(StatusUpdate {
            message_ids: vec![message.id.clone()],
        }));
        let frame = next_frame(&mut body).await;
        assert!(frame.starts_with("event: status\n"));

        shutdown.cancel();
        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
        assert_eq!(hub.subscriber_count(Topic::Message), 0);
        assert_eq!(hub.subscriber_count(Topic::Status), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_pings() {
        let hub = EventHub::default();
        let shutdown = CancellationToken::new();
        let session = StreamSession::new(hub.clone(), Duration::from_millis(20), shutdown.clone());
        let (sink, mut body) = Body::channel();
        let task = tokio::spawn(session.run(sink));

        assert_eq!(next_frame(&mut body).await, ": connected\n\n");
        let ping = next_frame(&mut body).await;
        assert!(ping.starts_with("event: ping\ndata: {\"time\":"));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_subscriptions() {
        let hub = EventHub::default();
        let session = StreamSession::new(hub.clone(), HEARTBEAT_INTERVAL, CancellationToken::new());
        let (sink, mut body) = Body::channel();
        let task = tokio::spawn(session.run(sink));

        next_frame(&mut body).await;
        wait_for_subscribers(&hub).await;
        drop(body);

        // Traffic racing the disconnect must not keep the session alive
        hub.publish(HubEvent::Status(StatusUpdate { message_ids: vec![] }));

        let reason = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::ClientGone);
        assert_eq!(hub.subscriber_count(Topic::Message), 0);
        assert_eq!(hub.subscriber_count(Topic::Status), 0);
    }

    #[tokio::test]
    async fn test_message_precedes_its_status() {
        use crate::chat::client::{SseParser, Timeline};
        use crate::chat::message::MessageStatus;

        let hub = EventHub::default();
        let shutdown = CancellationToken::new();
        let session = StreamSession::new(hub.clone(), HEARTBEAT_INTERVAL, shutdown.clone());
        let (sink, mut body) = Body::channel();
        let task = tokio::spawn(session.run(sink));

        assert_eq!(next_frame(&mut body).await, ": connected\n\n");
        wait_for_subscribers(&hub).await;

        let mut parser = SseParser::new();
        let mut alice = Timeline::new("alice");

        for _ in 0..50 {
            let message = NewMessage::text("alice", "ping").into_message().unwrap();
            hub.publish(HubEvent::Message(message.clone()));
            hub.publish(HubEvent::Status(StatusUpdate {
                message_ids: vec![message.id.clone()],
            }));

            let mut events = Vec::new();
            while events.len() < 2 {
                events.extend(parser.push(&next_frame(&mut body).await));
            }
            assert_eq!(events[0].event, "message");
            assert_eq!(events[1].event, "status");

            for event in &events {
                alice.apply_event(event).unwrap();
            }
            assert_eq!(alice.get(&message.id).unwrap().status, MessageStatus::Delivered);
        }

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_noticed_without_traffic() {
        let hub = EventHub::default();
        let session = StreamSession::new(hub.clone(), HEARTBEAT_INTERVAL, CancellationToken::new());
        let (sink, mut body) = Body::channel();
        let task = tokio::spawn(session.run(sink));

        next_frame(&mut body).await;
        wait_for_subscribers(&hub).await;
        drop(body);

        // Well inside one heartbeat interval, with nothing published
        let reason = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("closed before the next heartbeat")
            .unwrap();
        assert_eq!(reason, CloseReason::ClientGone);
        assert_eq!(hub.subscriber_count(Topic::Message), 0);
        assert_eq!(hub.subscriber_count(Topic::Status), 0);
    }

    #[tokio::test]
    async fn test_aborted_task_releases_subscriptions() {
        let hub = EventHub::default();
        let session = StreamSession::new(hub.clone(), HEARTBEAT_INTERVAL, CancellationToken::new());
        let (sink, mut body) = Body::channel();
        let task = tokio::spawn(session.run(sink));

        next_frame(&mut body).await;
        wait_for_subscribers(&hub).await;

        task.abort();
        let _ = task.await;
        assert_eq!(hub.subscriber_count(Topic::Message), 0);
        assert_eq!(hub.subscriber_count(Topic::Status), 0);
    }
}
