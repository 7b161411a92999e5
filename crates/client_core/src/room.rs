//! Room lifecycle: create, join, leave and restore, driven through the
//! Idle -> Joining -> Active -> Leaving -> Idle state machine.
//!
//! Entering Active binds the live subscription, backfills history and only
//! then lets the reconciler see live traffic (under the merge policy), so a
//! message delivered while history is in flight is neither lost nor doubled.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use chrono::Utc;
use pubsub_integration::PubSubTransport;
use serde::Serialize;
use shared::{
    domain::{ChannelId, ParticipantId, RoomPhase},
    error::{ErrorCode, UserNotice},
};
use storage::{SessionStore, StoreKey};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{
    error::{ClientError, InvalidRoomCodeReason},
    history::HistoryHydrator,
    reconciler::{HydrationPolicy, SharedTimeline},
    subscription::{DeliverySink, SubscriptionCoordinator},
    ClientEvent,
};

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Issues `<tag>-<creationEpochMillis>` room codes. The millisecond part
/// never repeats or goes backwards for one generator.
pub struct RoomCodeGenerator {
    tag: String,
    clock: Arc<dyn Clock>,
    last_issued: AtomicI64,
}

impl RoomCodeGenerator {
    pub fn new(tag: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            tag: tag.into(),
            clock,
            last_issued: AtomicI64::new(0),
        }
    }

    pub fn next_code(&self) -> ChannelId {
        let now = self.clock.now_millis();
        let previous = self
            .last_issued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        ChannelId(format!("{}-{}", self.tag, now.max(previous + 1)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub participant_id: Option<ParticipantId>,
    pub screen_name: Option<String>,
    pub channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub phase: RoomPhase,
    pub session: SessionState,
}

impl Default for RoomSnapshot {
    fn default() -> Self {
        Self {
            phase: RoomPhase::Idle,
            session: SessionState::default(),
        }
    }
}

fn transition(
    state: &mut RoomSnapshot,
    operation: &'static str,
    from: RoomPhase,
    to: RoomPhase,
) -> Result<(), ClientError> {
    if state.phase != from {
        return Err(ClientError::InvalidTransition {
            operation,
            phase: state.phase,
        });
    }
    state.phase = to;
    Ok(())
}

pub struct RoomLifecycleController {
    store: Arc<dyn SessionStore>,
    transport: Arc<dyn PubSubTransport>,
    codes: RoomCodeGenerator,
    hydrator: HistoryHydrator,
    policy: HydrationPolicy,
    coordinator: Mutex<SubscriptionCoordinator>,
    timeline: SharedTimeline,
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<RoomSnapshot>,
}

impl RoomLifecycleController {
    pub fn new(
        store: Arc<dyn SessionStore>,
        transport: Arc<dyn PubSubTransport>,
        codes: RoomCodeGenerator,
        hydrator: HistoryHydrator,
        policy: HydrationPolicy,
        timeline: SharedTimeline,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            store,
            coordinator: Mutex::new(SubscriptionCoordinator::new(Arc::clone(&transport))),
            transport,
            codes,
            hydrator,
            policy,
            timeline,
            events,
            state: Mutex::new(RoomSnapshot::default()),
        }
    }

    pub async fn snapshot(&self) -> RoomSnapshot {
        self.state.lock().await.clone()
    }

    pub async fn set_participant(&self, participant_id: ParticipantId) {
        self.state.lock().await.session.participant_id = Some(participant_id);
    }

    pub async fn set_screen_name(&self, screen_name: &str) -> Result<(), ClientError> {
        let screen_name = screen_name.trim();
        if screen_name.is_empty() {
            return Err(ClientError::Validation("screen name must not be blank".into()));
        }

        let mut guard = self.state.lock().await;
        if guard.phase != RoomPhase::Idle {
            return Err(ClientError::InvalidTransition {
                operation: "set_screen_name",
                phase: guard.phase,
            });
        }
        guard.session.screen_name = Some(screen_name.to_string());
        Ok(())
    }

    /// Returns `Ok(None)` without side effects when no screen name has been
    /// chosen yet.
    pub async fn create_room(&self) -> Result<Option<ChannelId>, ClientError> {
        let screen_name = {
            let mut guard = self.state.lock().await;
            let Some(screen_name) = guard.session.screen_name.clone() else {
                info!("room: create ignored, no screen name chosen");
                return Ok(None);
            };
            transition(&mut guard, "create_room", RoomPhase::Idle, RoomPhase::Joining)?;
            screen_name
        };
        self.emit_state().await;

        let channel = self.codes.next_code();
        self.activate(&channel, Some(&screen_name), true).await?;
        info!(channel = %channel, "room: created");
        Ok(Some(channel))
    }

    pub async fn join_room(&self, code: &str) -> Result<ChannelId, ClientError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(self.reject_code(code, InvalidRoomCodeReason::Empty));
        }
        let channel = ChannelId::new(code);

        let screen_name = {
            let mut guard = self.state.lock().await;
            let Some(screen_name) = guard.session.screen_name.clone() else {
                return Err(ClientError::Validation(
                    "choose a screen name before joining a room".into(),
                ));
            };
            transition(&mut guard, "join_room", RoomPhase::Idle, RoomPhase::Joining)?;
            screen_name
        };
        self.emit_state().await;

        // A creator whose own subscription is still in flight reads as zero
        // occupancy here; such a join is rejected like any empty room.
        match self.transport.presence(&channel).await {
            Ok(occupancy) if occupancy > 0 => {
                info!(channel = %channel, occupancy, "room: code validated");
            }
            Ok(_) => {
                self.settle(RoomPhase::Idle, None).await;
                return Err(self.reject_code(code, InvalidRoomCodeReason::Unoccupied));
            }
            Err(err) => {
                warn!(channel = %channel, "room: presence query failed: {err:#}");
                self.settle(RoomPhase::Idle, None).await;
                return Err(self.reject_code(code, InvalidRoomCodeReason::PresenceQueryFailed));
            }
        }

        self.activate(&channel, Some(&screen_name), true).await?;
        info!(channel = %channel, "room: joined");
        Ok(channel)
    }

    /// Stops the live subscription, discards in-memory messages and clears
    /// the persisted channel. Leaving while already Idle is a no-op.
    pub async fn leave_room(&self) -> Result<(), ClientError> {
        let channel = {
            let mut guard = self.state.lock().await;
            if guard.phase == RoomPhase::Idle {
                return Ok(());
            }
            transition(&mut guard, "leave_room", RoomPhase::Active, RoomPhase::Leaving)?;
            guard.session.channel_id.clone()
        };
        self.emit_state().await;

        self.coordinator.lock().await.teardown().await;
        self.timeline.lock().await.clear();
        let _ = self.events.send(ClientEvent::TimelineReplaced(Vec::new()));

        let cleared = self.store.remove(StoreKey::ChannelId).await;
        self.settle(RoomPhase::Idle, None).await;
        if let Some(channel) = channel {
            info!(channel = %channel, "room: left");
        }
        cleared.map_err(ClientError::Store)
    }

    /// Same observable effect as [`Self::leave_room`]. Ending a room for
    /// every participant needs enforcement outside this client.
    pub async fn end_session(&self) -> Result<(), ClientError> {
        self.leave_room().await
    }

    /// Reactivates a persisted session without checking presence, so a
    /// reload is not blocked by a momentarily empty room.
    pub async fn restore_from_persistence(&self) -> Result<Option<ChannelId>, ClientError> {
        let values = self
            .store
            .get_many(&[StoreKey::ChannelId, StoreKey::ScreenName])
            .await
            .map_err(ClientError::Store)?;
        let channel = values
            .get(&StoreKey::ChannelId)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(ChannelId::new);
        let screen_name = values
            .get(&StoreKey::ScreenName)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let (channel, screen_name) = match (channel, screen_name) {
            (Some(channel), Some(screen_name)) => (channel, screen_name),
            (Some(channel), None) => {
                warn!(channel = %channel, "room: discarding persisted channel without screen name");
                self.store
                    .remove(StoreKey::ChannelId)
                    .await
                    .map_err(ClientError::Store)?;
                return Ok(None);
            }
            (None, screen_name) => {
                if let Some(screen_name) = screen_name {
                    let mut guard = self.state.lock().await;
                    if guard.phase == RoomPhase::Idle {
                        guard.session.screen_name = Some(screen_name);
                    }
                }
                return Ok(None);
            }
        };

        {
            let mut guard = self.state.lock().await;
            transition(&mut guard, "restore", RoomPhase::Idle, RoomPhase::Joining)?;
            guard.session.screen_name = Some(screen_name);
        }
        self.emit_state().await;

        self.activate(&channel, None, false).await?;
        info!(channel = %channel, "room: restored persisted session");
        Ok(Some(channel))
    }

    async fn activate(
        &self,
        channel: &ChannelId,
        screen_name: Option<&str>,
        persist: bool,
    ) -> Result<(), ClientError> {
        let mut coordinator = self.coordinator.lock().await;
        if let Err(err) = coordinator.bind(channel).await {
            warn!(channel = %channel, "room: activation failed: {err:#}");
            drop(coordinator);
            self.settle(RoomPhase::Idle, None).await;
            return Err(ClientError::Transport(err));
        }

        if persist {
            let mut entries = vec![(StoreKey::ChannelId, channel.as_str())];
            if let Some(screen_name) = screen_name {
                entries.push((StoreKey::ScreenName, screen_name));
            }
            if let Err(err) = self.store.set_many(&entries).await {
                coordinator.teardown().await;
                drop(coordinator);
                self.settle(RoomPhase::Idle, None).await;
                return Err(ClientError::Store(err));
            }
        }

        self.settle(RoomPhase::Active, Some(channel.clone())).await;
        self.hydrate(&mut coordinator, channel).await;
        Ok(())
    }

    async fn hydrate(&self, coordinator: &mut SubscriptionCoordinator, channel: &ChannelId) {
        let sink = DeliverySink::new(
            channel.clone(),
            Arc::clone(&self.timeline),
            self.events.clone(),
        );
        if self.policy == HydrationPolicy::Replace {
            coordinator.start_delivery(sink.clone());
        }

        match self.hydrator.fetch(channel).await {
            Ok(batch) => {
                let fetched = batch.len();
                let snapshot = {
                    let mut timeline = self.timeline.lock().await;
                    timeline.apply_history(batch, self.policy);
                    timeline.snapshot()
                };
                info!(
                    channel = %channel,
                    fetched,
                    policy = ?self.policy,
                    "history: hydrated"
                );
                let _ = self.events.send(ClientEvent::TimelineReplaced(snapshot));
            }
            Err(err) => warn!(channel = %channel, "history: hydration failed: {err:#}"),
        }

        if self.policy == HydrationPolicy::Merge {
            coordinator.start_delivery(sink);
        }
    }

    fn reject_code(&self, code: &str, reason: InvalidRoomCodeReason) -> ClientError {
        let message = match reason {
            InvalidRoomCodeReason::Empty => "Enter a room code to join.".to_string(),
            InvalidRoomCodeReason::Unoccupied | InvalidRoomCodeReason::PresenceQueryFailed => {
                format!("Room '{code}' does not exist or has no participants.")
            }
        };
        let _ = self.events.send(ClientEvent::Notice(UserNotice::new(
            ErrorCode::InvalidRoomCode,
            message,
        )));
        ClientError::InvalidRoomCode {
            code: code.to_string(),
            reason,
        }
    }

    async fn settle(&self, phase: RoomPhase, channel: Option<ChannelId>) {
        {
            let mut guard = self.state.lock().await;
            guard.phase = phase;
            guard.session.channel_id = channel;
        }
        self.emit_state().await;
    }

    async fn emit_state(&self) {
        let snapshot = self.snapshot().await;
        let _ = self.events.send(ClientEvent::RoomStateChanged(snapshot));
    }
}

#[cfg(test)]
#[path = "tests/room_tests.rs"]
mod tests;
