use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, MessageId, ParticipantId};

/// Delivery tokens count 1/10 microsecond ticks since the unix epoch.
pub const DELIVERY_TOKEN_TICKS_PER_MILLI: u64 = 10_000;

pub fn delivery_token_to_millis(delivery_token: u64) -> i64 {
    (delivery_token / DELIVERY_TOKEN_TICKS_PER_MILLI) as i64
}

pub fn delivery_token_to_datetime(delivery_token: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(delivery_token_to_millis(delivery_token))
        .single()
        .unwrap_or_default()
}

/// Chat message as published on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub text: String,
    pub sender_id: ParticipantId,
    pub screen_name: String,
    /// RFC 3339 timestamp taken from the sender's clock.
    pub timestamp: String,
}

impl MessagePayload {
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: &serde_json::Value) -> serde_json::Result<Self> {
        Self::deserialize(value)
    }
}

/// A live copy of a published payload as handed to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub channel: ChannelId,
    pub payload: serde_json::Value,
    pub delivery_token: u64,
    pub publisher: String,
}

/// A retained payload returned by a history query.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub payload: serde_json::Value,
    pub delivery_token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub delivery_token: u64,
}
