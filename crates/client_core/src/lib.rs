use std::sync::Arc;

use anyhow::anyhow;
use chrono::{SecondsFormat, Utc};
use pubsub_integration::PubSubTransport;
use shared::{
    domain::{ChannelId, MessageId, RoomPhase},
    error::UserNotice,
    protocol::MessagePayload,
};
use storage::SessionStore;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub mod config;
pub mod error;
pub mod history;
pub mod identity;
pub mod reconciler;
pub mod room;
pub mod subscription;

pub use config::{load_settings, ClientSettings};
pub use error::{ClientError, InvalidRoomCodeReason};
pub use reconciler::{merge, HydrationPolicy, Message, Timeline};
pub use room::{Clock, RoomSnapshot, SessionState, SystemClock};

use history::HistoryHydrator;
use identity::IdentityManager;
use reconciler::SharedTimeline;
use room::{RoomCodeGenerator, RoomLifecycleController};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    RoomStateChanged(RoomSnapshot),
    /// Emitted only when the reconciler appended a new message.
    MessageReceived(Message),
    TimelineReplaced(Vec<Message>),
    Notice(UserNotice),
}

pub struct ChatClient {
    transport: Arc<dyn PubSubTransport>,
    identity: IdentityManager,
    rooms: RoomLifecycleController,
    timeline: SharedTimeline,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(
        settings: &ClientSettings,
        transport: Arc<dyn PubSubTransport>,
        store: Arc<dyn SessionStore>,
    ) -> Arc<Self> {
        Self::new_with_clock(settings, transport, store, Arc::new(SystemClock))
    }

    pub fn new_with_clock(
        settings: &ClientSettings,
        transport: Arc<dyn PubSubTransport>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let timeline = Timeline::shared();
        let rooms = RoomLifecycleController::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            RoomCodeGenerator::new(settings.room_tag.clone(), clock),
            HistoryHydrator::new(Arc::clone(&transport), settings.history_limit),
            settings.hydration_policy,
            Arc::clone(&timeline),
            events.clone(),
        );
        Arc::new(Self {
            identity: IdentityManager::new(store, Arc::clone(&transport)),
            transport,
            rooms,
            timeline,
            events,
        })
    }

    /// Resolves the participant id and silently restores a persisted room.
    pub async fn start(&self) -> Result<Option<ChannelId>, ClientError> {
        let participant_id = self.identity.get_or_create_participant_id().await?;
        self.rooms.set_participant(participant_id).await;
        self.rooms.restore_from_persistence().await
    }

    pub async fn set_screen_name(&self, screen_name: &str) -> Result<(), ClientError> {
        self.rooms.set_screen_name(screen_name).await
    }

    pub async fn create_room(&self) -> Result<Option<ChannelId>, ClientError> {
        self.rooms.create_room().await
    }

    pub async fn join_room(&self, code: &str) -> Result<ChannelId, ClientError> {
        self.rooms.join_room(code).await
    }

    pub async fn leave_room(&self) -> Result<(), ClientError> {
        self.rooms.leave_room().await
    }

    pub async fn end_session(&self) -> Result<(), ClientError> {
        self.rooms.end_session().await
    }

    /// Publishes without waiting for the transport. The message shows up in
    /// the timeline once the live subscription echoes it back; publish
    /// failures are only logged.
    pub async fn send_message(&self, text: &str) -> Result<MessageId, ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::Validation("message must not be blank".into()));
        }

        let room = self.rooms.snapshot().await;
        let channel = match (room.phase, room.session.channel_id) {
            (RoomPhase::Active, Some(channel)) => channel,
            _ => return Err(ClientError::NoActiveRoom),
        };
        let sender_id = match room.session.participant_id {
            Some(id) => id,
            None => self.identity.get_or_create_participant_id().await?,
        };

        let payload = MessagePayload {
            id: MessageId::generate(),
            text: text.to_string(),
            sender_id,
            screen_name: room.session.screen_name.unwrap_or_default(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let message_id = payload.id.clone();
        let value = payload
            .to_value()
            .map_err(|err| ClientError::Transport(anyhow!("failed to encode message: {err}")))?;

        let transport = Arc::clone(&self.transport);
        let id = message_id.clone();
        tokio::spawn(async move {
            match transport.publish(&channel, value).await {
                Ok(ack) => debug!(
                    channel = %channel,
                    message_id = %id,
                    delivery_token = ack.delivery_token,
                    "publish: acknowledged"
                ),
                Err(err) => warn!(
                    channel = %channel,
                    message_id = %id,
                    "publish: failed: {err:#}"
                ),
            }
        });

        Ok(message_id)
    }

    pub async fn timeline(&self) -> Vec<Message> {
        self.timeline.lock().await.snapshot()
    }

    pub async fn room(&self) -> RoomSnapshot {
        self.rooms.snapshot().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
