use async_trait::async_trait;
use shared::{
    domain::ChannelId,
    protocol::{Delivery, HistoryEntry, PublishAck},
};
use tokio::sync::mpsc;

mod memory;

pub use memory::{InMemoryBroker, InMemoryConnection, TransportOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// A message listener registered on a transport connection. Deliveries for
/// every channel the connection is subscribed to arrive on `deliveries` in
/// transport order.
#[derive(Debug)]
pub struct ListenerRegistration {
    pub id: ListenerId,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
pub trait PubSubTransport: Send + Sync {
    fn client_identity(&self) -> String;
    async fn add_listener(&self) -> anyhow::Result<ListenerRegistration>;
    async fn remove_listener(&self, listener: ListenerId) -> anyhow::Result<()>;
    async fn subscribe(&self, channels: &[ChannelId]) -> anyhow::Result<()>;
    async fn unsubscribe(&self, channels: &[ChannelId]) -> anyhow::Result<()>;
    async fn unsubscribe_all(&self) -> anyhow::Result<()>;
    async fn publish(
        &self,
        channel: &ChannelId,
        payload: serde_json::Value,
    ) -> anyhow::Result<PublishAck>;
    /// Number of connections currently subscribed to `channel`.
    async fn presence(&self, channel: &ChannelId) -> anyhow::Result<usize>;
    /// Most recent `count` retained payloads, oldest first.
    async fn history(&self, channel: &ChannelId, count: usize)
        -> anyhow::Result<Vec<HistoryEntry>>;
}
