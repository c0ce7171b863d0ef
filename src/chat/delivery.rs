// Delivery acknowledgment
//
// The status event carries every requested id, including ids that did not
// transition (unknown, already delivered, or the requester's own). Listeners
// treat it as "these are delivered now" and the repeat is harmless.

use crate::chat::clock::now_millis;
use crate::chat::error::ChatResult;
use crate::chat::events::{EventHub, HubEvent};
use crate::chat::message::StatusUpdate;
use crate::chat::storage::MessageStore;
use std::sync::Arc;

/// Result of an acknowledgment call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Ids that moved from `sent` to `delivered` in this call
    pub transitioned: Vec<String>,
    /// Whether a status event was published
    pub published: bool,
}

/// Applies delivery acknowledgments and republishes them
#[derive(Clone)]
pub struct DeliveryTracker {
    store: Arc<dyn MessageStore>,
    hub: EventHub,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn MessageStore>, hub: EventHub) -> Self {
        Self { store, hub }
    }

    /// Mark messages received by `requester_id` as delivered
    pub fn acknowledge(&self, message_ids: &[String], requester_id: &str) -> ChatResult<AckOutcome> {
        if message_ids.is_empty() {
            return Ok(AckOutcome::default());
        }

        let now = now_millis();
        let mut transitioned = Vec::new();

        for id in message_ids {
            match self.store.mark_delivered(id, requester_id, now) {
                Ok(true) => transitioned.push(id.clone()),
                Ok(false) => {}
                Err(e) => {
                    // Rows already flipped in this call must still be announced
                    if !transitioned.is_empty() {
                        self.hub.publish(HubEvent::Status(StatusUpdate {
                            message_ids: transitioned.clone(),
                        }));
                    }
                    tracing::error!(
                        "Acknowledgment by {} failed after {} transition(s): {}",
                        requester_id,
                        transitioned.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }

        tracing::info!(
            "{} acknowledged {} message(s), {} newly delivered",
            requester_id,
            message_ids.len(),
            transitioned.len()
        );

        self.hub.publish(HubEvent::Status(StatusUpdate {
            message_ids: message_ids.to_vec(),
        }));

        Ok(AckOutcome {
            transitioned,
            published: true,
        })
    }
}
