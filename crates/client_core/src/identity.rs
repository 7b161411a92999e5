use std::sync::Arc;

use pubsub_integration::PubSubTransport;
use shared::domain::ParticipantId;
use storage::{SessionStore, StoreKey};
use tracing::info;

use crate::error::ClientError;

/// Stable per-installation participant id, persisted in the session store.
pub struct IdentityManager {
    store: Arc<dyn SessionStore>,
    transport: Arc<dyn PubSubTransport>,
}

impl IdentityManager {
    pub fn new(store: Arc<dyn SessionStore>, transport: Arc<dyn PubSubTransport>) -> Self {
        Self { store, transport }
    }

    /// Store failures are fatal: there is no safe default identity.
    pub async fn get_or_create_participant_id(&self) -> Result<ParticipantId, ClientError> {
        if let Some(existing) = self
            .store
            .get(StoreKey::ParticipantId)
            .await
            .map_err(ClientError::Store)?
            .filter(|id| !id.trim().is_empty())
        {
            return Ok(ParticipantId::new(existing));
        }

        let fresh = ParticipantId::new(self.transport.client_identity());
        self.store
            .set(StoreKey::ParticipantId, fresh.as_str())
            .await
            .map_err(ClientError::Store)?;
        info!(participant_id = %fresh, "identity: created participant id");
        Ok(fresh)
    }
}
