use crate::core::config::PersistenceSettings;
use crate::core::state::{ContainerState, StateManager, StateMetrics, TransitionRecord};
use crate::shared::error::{PoolError, PoolResult};
use crate::shared::utils::unix_millis;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

const SNAPSHOT_TTL_SECS: i64 = 24 * 60 * 60;

/// Serializable state of one tracked container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedContainerState {
    pub state: ContainerState,
    pub entered_at_ms: i64,
    pub recovery_attempts: u32,
}

/// One snapshot document, written whole on every persistence tick. Readers
/// rely on `sequence` increasing monotonically to reject stale writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub sequence: u64,
    pub captured_at_ms: i64,
    pub containers: HashMap<String, PersistedContainerState>,
    pub metrics: StateMetrics,
    pub recent_transitions: Vec<TransitionRecord>,
}

/// Redis-backed snapshot store for the control plane's tracked state.
pub struct SnapshotStore {
    client: Option<redis::Client>,
    settings: PersistenceSettings,
    sequence: AtomicU64,
    last_loaded: AtomicU64,
}

impl SnapshotStore {
    pub fn new(settings: PersistenceSettings) -> PoolResult<Self> {
        let client = if settings.enabled {
            let client = redis::Client::open(settings.redis_url.clone()).map_err(|e| {
                error!("failed to create redis client: {e}");
                PoolError::Persistence(format!("failed to create redis client: {e}"))
            })?;
            info!(url = %settings.redis_url, "snapshot persistence enabled");
            Some(client)
        } else {
            info!("snapshot persistence disabled");
            None
        };

        Ok(Self {
            client,
            settings,
            sequence: AtomicU64::new(0),
            last_loaded: AtomicU64::new(0),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    fn snapshot_key(&self) -> String {
        format!("{}:snapshot", self.settings.key_prefix)
    }

    /// Build the next snapshot from the state manager, stamping a fresh
    /// sequence id.
    pub fn capture(&self, state: &StateManager) -> StateSnapshot {
        StateSnapshot {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            captured_at_ms: unix_millis(),
            containers: state.export(),
            metrics: state.metrics(),
            recent_transitions: state.recent_transitions(self.settings.keep_transitions),
        }
    }

    pub async fn save(&self, snapshot: &StateSnapshot) -> PoolResult<()> {
        let client = match &self.client {
            Some(client) => client,
            None => return Ok(()),
        };

        let payload = serde_json::to_string(snapshot).map_err(|e| {
            PoolError::Serialization(format!("failed to serialize snapshot: {e}"))
        })?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PoolError::Persistence(format!("redis connection failed: {e}")))?;

        let key = self.snapshot_key();
        conn.set::<_, _, ()>(&key, &payload)
            .await
            .map_err(|e| PoolError::Persistence(format!("failed to save snapshot: {e}")))?;
        conn.expire::<_, ()>(&key, SNAPSHOT_TTL_SECS)
            .await
            .map_err(|e| PoolError::Persistence(format!("failed to set snapshot expiry: {e}")))?;

        debug!(
            sequence = snapshot.sequence,
            containers = snapshot.containers.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Load the last written snapshot, enforcing sequence monotonicity across
    /// repeated loads.
    pub async fn load_latest(&self) -> PoolResult<Option<StateSnapshot>> {
        let client = match &self.client {
            Some(client) => client,
            None => return Ok(None),
        };

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PoolError::Persistence(format!("redis connection failed: {e}")))?;

        let payload: Option<String> = conn
            .get(self.snapshot_key())
            .await
            .map_err(|e| PoolError::Persistence(format!("failed to load snapshot: {e}")))?;

        let payload = match payload {
            Some(payload) => payload,
            None => {
                debug!("no snapshot present");
                return Ok(None);
            }
        };

        let snapshot: StateSnapshot = serde_json::from_str(&payload).map_err(|e| {
            PoolError::Serialization(format!("failed to deserialize snapshot: {e}"))
        })?;
        self.validate_monotonic(snapshot.sequence)?;

        // Resume numbering after the recovered snapshot.
        self.sequence.fetch_max(snapshot.sequence, Ordering::SeqCst);
        info!(
            sequence = snapshot.sequence,
            containers = snapshot.containers.len(),
            "snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    fn validate_monotonic(&self, sequence: u64) -> PoolResult<()> {
        let previous = self.last_loaded.swap(sequence, Ordering::SeqCst);
        if sequence < previous {
            self.last_loaded.store(previous, Ordering::SeqCst);
            return Err(PoolError::Persistence(format!(
                "snapshot sequence regressed: {sequence} after {previous}"
            )));
        }
        Ok(())
    }
}
