//! Message reconciliation: the single writer of the displayed timeline.
//!
//! Live deliveries and history backfill both end up here. A message id is
//! shown at most once, and the timeline keeps arrival order. It is never
//! re-sorted by the sender's clock, so participants with clock skew can
//! appear out of send-time order.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{MessageId, ParticipantId},
    protocol::{delivery_token_to_datetime, MessagePayload},
};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub sender_id: ParticipantId,
    pub screen_name: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn from_payload(payload: MessagePayload, delivery_token: u64) -> Self {
        let sent_at = payload.sent_at();
        Self {
            id: payload.id,
            text: payload.text,
            sender_id: payload.sender_id,
            screen_name: payload.screen_name,
            sent_at,
            received_at: delivery_token_to_datetime(delivery_token),
        }
    }

    pub fn decode(payload: &serde_json::Value, delivery_token: u64) -> serde_json::Result<Self> {
        MessagePayload::from_value(payload).map(|payload| Self::from_payload(payload, delivery_token))
    }
}

/// How a history batch is applied to a timeline that may already hold live
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationPolicy {
    /// History is merged by id, keeping live messages that arrived first.
    #[default]
    Merge,
    /// History overwrites the timeline. Live messages received before the
    /// batch landed are lost unless the batch also covers them.
    Replace,
}

/// Appends `incoming` unless a message with the same id is already present.
pub fn merge(mut existing: Vec<Message>, incoming: Message) -> Vec<Message> {
    if !existing.iter().any(|message| message.id == incoming.id) {
        existing.push(incoming);
    }
    existing
}

pub type SharedTimeline = Arc<Mutex<Timeline>>;

#[derive(Debug, Default)]
pub struct Timeline {
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedTimeline {
        Arc::new(Mutex::new(Self::new()))
    }

    #[cfg(test)]
    pub(crate) fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    /// Same contract as [`merge`]; returns whether the message was appended.
    pub fn merge(&mut self, incoming: Message) -> bool {
        if !self.seen.insert(incoming.id.clone()) {
            return false;
        }
        self.messages.push(incoming);
        true
    }

    /// Applies a history batch in history order and returns how many
    /// messages were appended.
    pub fn apply_history(&mut self, batch: Vec<Message>, policy: HydrationPolicy) -> usize {
        if policy == HydrationPolicy::Replace {
            self.clear();
        }
        batch
            .into_iter()
            .map(|message| self.merge(message))
            .filter(|appended| *appended)
            .count()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
