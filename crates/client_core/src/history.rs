use std::sync::Arc;

use anyhow::{Context, Result};
use pubsub_integration::PubSubTransport;
use shared::domain::ChannelId;
use tracing::{debug, warn};

use crate::reconciler::Message;

pub const MAX_HISTORY_WINDOW: usize = 100;

/// Fetches the recent-message window for a newly activated channel.
pub struct HistoryHydrator {
    transport: Arc<dyn PubSubTransport>,
    limit: usize,
}

impl HistoryHydrator {
    pub fn new(transport: Arc<dyn PubSubTransport>, limit: usize) -> Self {
        Self {
            transport,
            limit: limit.clamp(1, MAX_HISTORY_WINDOW),
        }
    }

    #[cfg(test)]
    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the window in transport order. Entries that do not decode as
    /// chat messages are skipped.
    pub async fn fetch(&self, channel: &ChannelId) -> Result<Vec<Message>> {
        let entries = self
            .transport
            .history(channel, self.limit)
            .await
            .with_context(|| format!("history request failed for channel {channel}"))?;

        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            match Message::decode(&entry.payload, entry.delivery_token) {
                Ok(message) => messages.push(message),
                Err(err) => warn!(
                    channel = %channel,
                    delivery_token = entry.delivery_token,
                    "history: skipping undecodable entry: {err}"
                ),
            }
        }
        debug!(channel = %channel, count = messages.len(), "history: fetched window");
        Ok(messages)
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
