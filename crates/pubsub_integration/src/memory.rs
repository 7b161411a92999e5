//! In-process broker implementing [`PubSubTransport`] for local sessions and
//! tests. Every [`InMemoryConnection`] behaves like one client connection:
//! it owns its listeners and subscriptions, and counts once towards presence
//! on each channel it is subscribed to.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::ChannelId,
    protocol::{Delivery, HistoryEntry, PublishAck, DELIVERY_TOKEN_TICKS_PER_MILLI},
};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::{ListenerId, ListenerRegistration, PubSubTransport};

pub const DEFAULT_HISTORY_RETENTION: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOp {
    Subscribe,
    Unsubscribe,
    Publish,
    Presence,
    History,
}

type ConnectionId = u64;

#[derive(Default)]
struct ChannelState {
    subscribers: HashSet<ConnectionId>,
    retained: VecDeque<HistoryEntry>,
}

struct ConnectionState {
    listeners: HashMap<ListenerId, mpsc::UnboundedSender<Delivery>>,
    subscriptions: HashSet<ChannelId>,
    pending_failures: HashSet<TransportOp>,
}

struct BrokerState {
    channels: HashMap<ChannelId, ChannelState>,
    connections: HashMap<ConnectionId, ConnectionState>,
    next_connection: ConnectionId,
    next_listener: u64,
    last_token: u64,
    retention: usize,
}

impl BrokerState {
    fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut ConnectionState> {
        self.connections
            .get_mut(&id)
            .ok_or_else(|| anyhow!("connection {id} is closed"))
    }

    fn take_failure(&mut self, id: ConnectionId, op: TransportOp) -> Result<()> {
        if self.connection_mut(id)?.pending_failures.remove(&op) {
            return Err(anyhow!("injected {op:?} failure"));
        }
        Ok(())
    }

    fn next_delivery_token(&mut self) -> u64 {
        let now_ticks = u64::try_from(Utc::now().timestamp_micros()).unwrap_or_default()
            * (DELIVERY_TOKEN_TICKS_PER_MILLI / 1000);
        self.last_token = now_ticks.max(self.last_token + 1);
        self.last_token
    }

    /// Drops the channel entry once nobody listens and nothing is retained.
    fn detach(&mut self, id: ConnectionId, channel: &ChannelId) {
        let Some(state) = self.channels.get_mut(channel) else {
            return;
        };
        state.subscribers.remove(&id);
        if state.subscribers.is_empty() && state.retained.is_empty() {
            self.channels.remove(channel);
        }
    }
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_HISTORY_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerState {
                channels: HashMap::new(),
                connections: HashMap::new(),
                next_connection: 1,
                next_listener: 1,
                last_token: 0,
                retention: retention.max(1),
            })),
        }
    }

    pub async fn connect(&self) -> InMemoryConnection {
        self.connect_as(uuid::Uuid::new_v4().to_string()).await
    }

    pub async fn connect_as(&self, identity: impl Into<String>) -> InMemoryConnection {
        let mut guard = self.inner.lock().await;
        let id = guard.next_connection;
        guard.next_connection += 1;
        guard.connections.insert(
            id,
            ConnectionState {
                listeners: HashMap::new(),
                subscriptions: HashSet::new(),
                pending_failures: HashSet::new(),
            },
        );
        InMemoryConnection {
            broker: self.clone(),
            id,
            identity: identity.into(),
        }
    }

    /// Current subscriber count of `channel`, bypassing fault injection.
    pub async fn occupancy(&self, channel: &ChannelId) -> usize {
        self.inner
            .lock()
            .await
            .channels
            .get(channel)
            .map(|state| state.subscribers.len())
            .unwrap_or_default()
    }
}

pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: ConnectionId,
    identity: String,
}

impl InMemoryConnection {
    /// Makes the next call of `op` on this connection fail.
    pub async fn fail_next(&self, op: TransportOp) {
        if let Some(conn) = self.broker.inner.lock().await.connections.get_mut(&self.id) {
            conn.pending_failures.insert(op);
        }
    }

    pub async fn listener_count(&self) -> usize {
        self.broker
            .inner
            .lock()
            .await
            .connections
            .get(&self.id)
            .map(|conn| conn.listeners.len())
            .unwrap_or_default()
    }

    /// Drops every subscription and listener, as if the client went away.
    pub async fn disconnect(&self) {
        let mut guard = self.broker.inner.lock().await;
        if let Some(conn) = guard.connections.remove(&self.id) {
            for channel in &conn.subscriptions {
                guard.detach(self.id, channel);
            }
        }
    }
}

#[async_trait]
impl PubSubTransport for InMemoryConnection {
    fn client_identity(&self) -> String {
        self.identity.clone()
    }

    async fn add_listener(&self) -> Result<ListenerRegistration> {
        let mut guard = self.broker.inner.lock().await;
        let id = ListenerId(guard.next_listener);
        guard.next_listener += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        guard.connection_mut(self.id)?.listeners.insert(id, tx);
        Ok(ListenerRegistration {
            id,
            deliveries: rx,
        })
    }

    async fn remove_listener(&self, listener: ListenerId) -> Result<()> {
        let mut guard = self.broker.inner.lock().await;
        guard.connection_mut(self.id)?.listeners.remove(&listener);
        Ok(())
    }

    async fn subscribe(&self, channels: &[ChannelId]) -> Result<()> {
        let mut guard = self.broker.inner.lock().await;
        guard.take_failure(self.id, TransportOp::Subscribe)?;
        for channel in channels {
            guard
                .connection_mut(self.id)?
                .subscriptions
                .insert(channel.clone());
            guard
                .channels
                .entry(channel.clone())
                .or_default()
                .subscribers
                .insert(self.id);
        }
        debug!(connection = self.id, count = channels.len(), "broker: subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[ChannelId]) -> Result<()> {
        let mut guard = self.broker.inner.lock().await;
        guard.take_failure(self.id, TransportOp::Unsubscribe)?;
        for channel in channels {
            guard.connection_mut(self.id)?.subscriptions.remove(channel);
            guard.detach(self.id, channel);
        }
        Ok(())
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        let mut guard = self.broker.inner.lock().await;
        guard.take_failure(self.id, TransportOp::Unsubscribe)?;
        let channels = std::mem::take(&mut guard.connection_mut(self.id)?.subscriptions);
        for channel in &channels {
            guard.detach(self.id, channel);
        }
        debug!(connection = self.id, count = channels.len(), "broker: unsubscribed all");
        Ok(())
    }

    async fn publish(&self, channel: &ChannelId, payload: serde_json::Value) -> Result<PublishAck> {
        let mut guard = self.broker.inner.lock().await;
        guard.take_failure(self.id, TransportOp::Publish)?;
        let delivery_token = guard.next_delivery_token();
        let retention = guard.retention;

        let state = guard.channels.entry(channel.clone()).or_default();
        state.retained.push_back(HistoryEntry {
            payload: payload.clone(),
            delivery_token,
        });
        while state.retained.len() > retention {
            state.retained.pop_front();
        }
        let mut subscribers = state.subscribers.iter().copied().collect::<Vec<_>>();
        subscribers.sort_unstable();

        let delivery = Delivery {
            channel: channel.clone(),
            payload,
            delivery_token,
            publisher: self.identity.clone(),
        };
        for subscriber in subscribers {
            if let Some(conn) = guard.connections.get_mut(&subscriber) {
                conn.listeners
                    .retain(|_, listener| listener.send(delivery.clone()).is_ok());
            }
        }

        Ok(PublishAck { delivery_token })
    }

    async fn presence(&self, channel: &ChannelId) -> Result<usize> {
        let mut guard = self.broker.inner.lock().await;
        guard.take_failure(self.id, TransportOp::Presence)?;
        Ok(guard
            .channels
            .get(channel)
            .map(|state| state.subscribers.len())
            .unwrap_or_default())
    }

    async fn history(&self, channel: &ChannelId, count: usize) -> Result<Vec<HistoryEntry>> {
        let mut guard = self.broker.inner.lock().await;
        guard.take_failure(self.id, TransportOp::History)?;
        let Some(state) = guard.channels.get(channel) else {
            return Ok(Vec::new());
        };
        let skip = state.retained.len().saturating_sub(count);
        Ok(state.retained.iter().skip(skip).cloned().collect())
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
