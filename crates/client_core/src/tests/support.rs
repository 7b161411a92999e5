use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pubsub_integration::{ListenerId, ListenerRegistration, PubSubTransport};
use serde_json::{json, Value};
use shared::{
    domain::ChannelId,
    protocol::{Delivery, HistoryEntry, PublishAck},
};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::{reconciler::SharedTimeline, room::Clock};

pub const BASE_TOKEN: u64 = 17_000_000_000_000_000;

pub fn wire(id: &str, text: &str) -> Value {
    json!({
        "id": id,
        "text": text,
        "senderId": "participant-b",
        "screenName": "Wren",
        "timestamp": "2023-11-14T22:13:20.000Z",
    })
}

pub fn history_entry(id: &str, offset: u64) -> HistoryEntry {
    HistoryEntry {
        payload: wire(id, id),
        delivery_token: BASE_TOKEN + offset,
    }
}

pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn at(millis: i64) -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicI64::new(millis),
        })
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Transport double with a call log, scripted presence/history results and
/// an optional gate that holds history requests until released.
pub struct ScriptedTransport {
    identity: String,
    pub calls: Mutex<Vec<String>>,
    pub published: Mutex<Vec<(ChannelId, Value)>>,
    presence: Mutex<Option<usize>>,
    history: Mutex<Option<Vec<HistoryEntry>>>,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
    listeners: Mutex<HashMap<ListenerId, mpsc::UnboundedSender<Delivery>>>,
    next_listener: AtomicU64,
    peak_listeners: AtomicUsize,
    pub history_requested: Arc<Notify>,
    history_gate: Option<Arc<Notify>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            identity: "participant-a".to_string(),
            calls: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            presence: Mutex::new(Some(1)),
            history: Mutex::new(Some(Vec::new())),
            fail_subscribe: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            peak_listeners: AtomicUsize::new(0),
            history_requested: Arc::new(Notify::new()),
            history_gate: None,
        }
    }

    pub fn with_identity(mut self, identity: &str) -> Self {
        self.identity = identity.to_string();
        self
    }

    pub fn with_presence(self, occupancy: Option<usize>) -> Self {
        *self.presence.try_lock().expect("presence lock") = occupancy;
        self
    }

    pub fn with_history(self, history: Option<Vec<HistoryEntry>>) -> Self {
        *self.history.try_lock().expect("history lock") = history;
        self
    }

    pub fn with_history_gate(mut self, gate: Arc<Notify>) -> Self {
        self.history_gate = Some(gate);
        self
    }

    pub fn failing_subscribe(self) -> Self {
        self.fail_subscribe.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_publish(self) -> Self {
        self.fail_publish.store(true, Ordering::SeqCst);
        self
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub async fn live_listeners(&self) -> usize {
        self.listeners.lock().await.len()
    }

    pub fn peak_listeners(&self) -> usize {
        self.peak_listeners.load(Ordering::SeqCst)
    }

    /// Pushes a delivery to every registered listener.
    pub async fn deliver(&self, channel: &str, payload: Value, delivery_token: u64) {
        let delivery = Delivery {
            channel: ChannelId::new(channel),
            payload,
            delivery_token,
            publisher: "remote".to_string(),
        };
        for listener in self.listeners.lock().await.values() {
            let _ = listener.send(delivery.clone());
        }
    }

    async fn record(&self, call: String) {
        self.calls.lock().await.push(call);
    }
}

#[async_trait]
impl PubSubTransport for ScriptedTransport {
    fn client_identity(&self) -> String {
        self.identity.clone()
    }

    async fn add_listener(&self) -> Result<ListenerRegistration> {
        self.record("add_listener".into()).await;
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.listeners.lock().await;
        listeners.insert(id, tx);
        self.peak_listeners
            .fetch_max(listeners.len(), Ordering::SeqCst);
        Ok(ListenerRegistration {
            id,
            deliveries: rx,
        })
    }

    async fn remove_listener(&self, listener: ListenerId) -> Result<()> {
        self.record("remove_listener".into()).await;
        self.listeners.lock().await.remove(&listener);
        Ok(())
    }

    async fn subscribe(&self, channels: &[ChannelId]) -> Result<()> {
        let names = channels.iter().map(ChannelId::as_str).collect::<Vec<_>>();
        self.record(format!("subscribe:{}", names.join(","))).await;
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(anyhow!("subscribe rejected"));
        }
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[ChannelId]) -> Result<()> {
        let names = channels.iter().map(ChannelId::as_str).collect::<Vec<_>>();
        self.record(format!("unsubscribe:{}", names.join(","))).await;
        Ok(())
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        self.record("unsubscribe_all".into()).await;
        Ok(())
    }

    async fn publish(&self, channel: &ChannelId, payload: Value) -> Result<PublishAck> {
        self.record(format!("publish:{channel}")).await;
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(anyhow!("publish rejected"));
        }
        self.published.lock().await.push((channel.clone(), payload));
        Ok(PublishAck {
            delivery_token: BASE_TOKEN,
        })
    }

    async fn presence(&self, channel: &ChannelId) -> Result<usize> {
        self.record(format!("presence:{channel}")).await;
        (*self.presence.lock().await).ok_or_else(|| anyhow!("presence timed out"))
    }

    async fn history(&self, channel: &ChannelId, count: usize) -> Result<Vec<HistoryEntry>> {
        self.record(format!("history:{channel}:{count}")).await;
        self.history_requested.notify_one();
        if let Some(gate) = &self.history_gate {
            gate.notified().await;
        }
        self.history
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("history unavailable"))
    }
}

/// Polls `timeline` until `predicate` holds or a second passes.
pub async fn wait_for_timeline(
    timeline: &SharedTimeline,
    predicate: impl Fn(&crate::reconciler::Timeline) -> bool,
) -> bool {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if predicate(&*timeline.lock().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
