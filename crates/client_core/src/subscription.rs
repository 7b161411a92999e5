//! Binds the single live message listener to the active channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use pubsub_integration::{ListenerId, PubSubTransport};
use shared::{domain::ChannelId, protocol::Delivery};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    reconciler::{Message, SharedTimeline},
    ClientEvent,
};

/// Where live deliveries for one channel end up.
#[derive(Clone)]
pub struct DeliverySink {
    channel: ChannelId,
    timeline: SharedTimeline,
    events: broadcast::Sender<ClientEvent>,
}

impl DeliverySink {
    pub fn new(
        channel: ChannelId,
        timeline: SharedTimeline,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            channel,
            timeline,
            events,
        }
    }

    pub async fn deliver(&self, delivery: Delivery) {
        if delivery.channel != self.channel {
            debug!(
                channel = %delivery.channel,
                active = %self.channel,
                "subscription: dropping delivery for inactive channel"
            );
            return;
        }

        let message = match Message::decode(&delivery.payload, delivery.delivery_token) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    channel = %self.channel,
                    publisher = %delivery.publisher,
                    "subscription: dropping undecodable delivery: {err}"
                );
                return;
            }
        };

        let appended = self.timeline.lock().await.merge(message.clone());
        if appended {
            let _ = self.events.send(ClientEvent::MessageReceived(message));
        } else {
            debug!(message_id = %message.id, "subscription: duplicate delivery ignored");
        }
    }
}

struct LiveBinding {
    channel: ChannelId,
    listener: ListenerId,
    // Parked until the owner starts delivery; the transport queues deliveries
    // in the meantime.
    deliveries: Option<mpsc::UnboundedReceiver<Delivery>>,
    pump: Option<JoinHandle<()>>,
}

pub struct SubscriptionCoordinator {
    transport: Arc<dyn PubSubTransport>,
    binding: Option<LiveBinding>,
}

impl SubscriptionCoordinator {
    pub fn new(transport: Arc<dyn PubSubTransport>) -> Self {
        Self {
            transport,
            binding: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn active_channel(&self) -> Option<&ChannelId> {
        self.binding.as_ref().map(|binding| &binding.channel)
    }

    #[cfg(test)]
    pub(crate) fn is_delivering(&self) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| binding.pump.is_some())
    }

    /// Registers one listener and subscribes to `channel`. Any previous
    /// binding is fully torn down first.
    pub async fn bind(&mut self, channel: &ChannelId) -> Result<()> {
        self.teardown().await;

        let registration = self
            .transport
            .add_listener()
            .await
            .context("failed to register message listener")?;
        if let Err(err) = self
            .transport
            .subscribe(std::slice::from_ref(channel))
            .await
        {
            let _ = self.transport.remove_listener(registration.id).await;
            return Err(err.context(format!("failed to subscribe to channel {channel}")));
        }

        info!(channel = %channel, listener = registration.id.0, "subscription: bound");
        self.binding = Some(LiveBinding {
            channel: channel.clone(),
            listener: registration.id,
            deliveries: Some(registration.deliveries),
            pump: None,
        });
        Ok(())
    }

    /// Starts draining queued and future deliveries into `sink`. Returns
    /// false when nothing is bound or delivery is already running.
    pub fn start_delivery(&mut self, sink: DeliverySink) -> bool {
        let Some(binding) = self.binding.as_mut() else {
            return false;
        };
        let Some(mut deliveries) = binding.deliveries.take() else {
            return false;
        };

        binding.pump = Some(tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                sink.deliver(delivery).await;
            }
        }));
        true
    }

    /// Removes the handler, then unsubscribes from every channel. Transport
    /// failures here are ignored.
    pub async fn teardown(&mut self) {
        let Some(binding) = self.binding.take() else {
            return;
        };

        if let Some(pump) = binding.pump {
            pump.abort();
            let _ = pump.await;
        }
        drop(binding.deliveries);
        if let Err(err) = self.transport.remove_listener(binding.listener).await {
            debug!(listener = binding.listener.0, "subscription: remove listener failed: {err:#}");
        }
        if let Err(err) = self.transport.unsubscribe_all().await {
            debug!(channel = %binding.channel, "subscription: unsubscribe failed: {err:#}");
        }
        info!(channel = %binding.channel, "subscription: released");
    }
}

#[cfg(test)]
#[path = "tests/subscription_tests.rs"]
mod tests;
