use crate::core::config::StateSettings;
use crate::core::events::{EventBus, PoolEvent};
use crate::core::persistence::PersistedContainerState;
use crate::core::pool::PoolManager;
use crate::core::runtime::{ContainerRuntime, RuntimeStatus};
use crate::core::template::POOL_LABEL;
use crate::shared::error::{PoolError, PoolResult};
use crate::shared::utils::unix_millis;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Initializing,
    Created,
    Starting,
    Running,
    Available,
    Busy,
    Stopping,
    Stopped,
    Failed,
    Recycling,
    Unknown,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Initializing => "initializing",
            ContainerState::Created => "created",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Available => "available",
            ContainerState::Busy => "busy",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
            ContainerState::Failed => "failed",
            ContainerState::Recycling => "recycling",
            ContainerState::Unknown => "unknown",
        }
    }

    /// The validated transition table. Anything not listed here is rejected
    /// unless forced by reconciliation.
    pub fn can_transition_to(self, to: ContainerState) -> bool {
        use ContainerState::*;
        let allowed: &[ContainerState] = match self {
            Initializing => &[Created, Failed],
            Created => &[Starting, Failed],
            Starting => &[Running, Failed],
            Running => &[Available, Busy, Stopping, Failed],
            Available => &[Busy, Stopping, Recycling, Failed],
            Busy => &[Available, Stopping, Recycling, Failed],
            Stopping => &[Stopped, Failed],
            Stopped => &[Starting, Recycling],
            Failed => &[Recycling, Starting],
            Recycling => &[Initializing],
            Unknown => &[Initializing, Failed, Recycling],
        };
        allowed.contains(&to)
    }

    /// Upper bound a container may sit in this state before the reconciler
    /// flags it as stuck.
    fn max_duration(self) -> Option<Duration> {
        match self {
            ContainerState::Starting => Some(Duration::from_secs(60)),
            ContainerState::Stopping => Some(Duration::from_secs(30)),
            ContainerState::Recycling => Some(Duration::from_secs(120)),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Translates runtime-observed flags onto the pool state space.
pub fn map_runtime_status(status: &RuntimeStatus) -> ContainerState {
    if status.oom_killed || status.dead {
        ContainerState::Failed
    } else if status.restarting {
        ContainerState::Starting
    } else if status.running {
        ContainerState::Running
    } else {
        // Paused and exited both land here; the runtime keeps no finer signal.
        ContainerState::Stopped
    }
}

/// Some tracked states are refinements of what the runtime can observe: a
/// runtime-running container may legitimately be tracked as available or
/// busy.
fn compatible(tracked: ContainerState, observed: ContainerState) -> bool {
    if tracked == observed {
        return true;
    }
    observed == ContainerState::Running
        && matches!(
            tracked,
            ContainerState::Available | ContainerState::Busy | ContainerState::Running
        )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub at_ms: i64,
    pub container_id: String,
    pub from: ContainerState,
    pub to: ContainerState,
    pub reason: String,
    pub forced: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateMetrics {
    pub distribution: HashMap<ContainerState, usize>,
    pub transitions_total: u64,
    pub rejected_transitions: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub checked: usize,
    pub inconsistencies: usize,
    pub corrected: usize,
    pub orphans_adopted: usize,
}

struct TrackedContainer {
    state: ContainerState,
    entered_at: Instant,
    entered_at_ms: i64,
    /// Bumped on every committed transition so watchdogs and teardown tasks
    /// can detect they are stale.
    generation: u64,
    recovery_attempts: u32,
}

/// Per-container gate: the lock serializes transitions, the ticket lets a
/// newer pending transition supersede an older one still waiting.
struct Gate {
    lock: Arc<Mutex<()>>,
    ticket: AtomicU64,
}

const TRANSITION_LOG_CAP: usize = 1000;
const RECYCLE_TEARDOWN_GRACE: Duration = Duration::from_secs(10);

/// Tracks the per-container state machine, validates transitions, and
/// reconciles tracked state against what the runtime reports.
pub struct StateManager {
    runtime: Arc<dyn ContainerRuntime>,
    bus: EventBus,
    settings: StateSettings,
    entries: DashMap<String, TrackedContainer>,
    gates: DashMap<String, Arc<Gate>>,
    log: StdMutex<VecDeque<TransitionRecord>>,
    transitions_total: AtomicU64,
    rejected: AtomicU64,
    pool: RwLock<Weak<PoolManager>>,
    cancel: StdMutex<CancellationToken>,
    started: AtomicBool,
}

impl StateManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        bus: EventBus,
        settings: StateSettings,
    ) -> Self {
        Self {
            runtime,
            bus,
            settings,
            entries: DashMap::new(),
            gates: DashMap::new(),
            log: StdMutex::new(VecDeque::with_capacity(TRANSITION_LOG_CAP)),
            transitions_total: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            pool: RwLock::new(Weak::new()),
            cancel: StdMutex::new(CancellationToken::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Late-wired back-reference; the pool owns the records, this manager
    /// only pokes partition membership on available/busy entry.
    pub fn attach_pool(&self, pool: Weak<PoolManager>) {
        *self.pool.write().unwrap() = pool;
    }

    pub fn track(&self, id: &str, initial: ContainerState) {
        self.entries.insert(
            id.to_string(),
            TrackedContainer {
                state: initial,
                entered_at: Instant::now(),
                entered_at_ms: unix_millis(),
                generation: 0,
                recovery_attempts: 0,
            },
        );
        debug!(container_id = id, state = %initial, "tracking container");
    }

    pub fn untrack(&self, id: &str) {
        self.entries.remove(id);
        self.gates.remove(id);
        debug!(container_id = id, "stopped tracking container");
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn state_of(&self, id: &str) -> Option<ContainerState> {
        self.entries.get(id).map(|entry| entry.state)
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn distribution(&self) -> HashMap<ContainerState, usize> {
        let mut distribution = HashMap::new();
        for entry in self.entries.iter() {
            *distribution.entry(entry.value().state).or_insert(0) += 1;
        }
        distribution
    }

    pub fn metrics(&self) -> StateMetrics {
        StateMetrics {
            distribution: self.distribution(),
            transitions_total: self.transitions_total.load(Ordering::SeqCst),
            rejected_transitions: self.rejected.load(Ordering::SeqCst),
        }
    }

    pub fn recent_transitions(&self, n: usize) -> Vec<TransitionRecord> {
        let log = self.log.lock().unwrap();
        log.iter().rev().take(n).rev().cloned().collect()
    }

    /// Serializable view of every tracked container, for snapshots.
    pub fn export(&self) -> HashMap<String, PersistedContainerState> {
        self.entries
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    PersistedContainerState {
                        state: entry.value().state,
                        entered_at_ms: entry.value().entered_at_ms,
                        recovery_attempts: entry.value().recovery_attempts,
                    },
                )
            })
            .collect()
    }

    /// Reload tracked state from a snapshot. The next reconcile pass settles
    /// any entry the runtime disagrees with.
    pub fn restore(&self, containers: HashMap<String, PersistedContainerState>) {
        for (id, persisted) in containers {
            self.entries.insert(
                id,
                TrackedContainer {
                    state: persisted.state,
                    entered_at: Instant::now(),
                    entered_at_ms: persisted.entered_at_ms,
                    generation: 0,
                    recovery_attempts: persisted.recovery_attempts,
                },
            );
        }
    }

    /// Validated transition. Fails with a typed error on an edge outside the
    /// table, bumping the rejection counter and emitting an event.
    pub async fn transition(
        self: &Arc<Self>,
        id: &str,
        to: ContainerState,
        reason: &str,
    ) -> PoolResult<()> {
        self.apply(id, to, reason, false).await
    }

    /// Reconciliation path: bypasses validation, always leaves an audit entry
    /// marked forced. Forcing a container into its current state is a no-op.
    pub async fn force_transition(
        self: &Arc<Self>,
        id: &str,
        to: ContainerState,
        reason: &str,
    ) -> PoolResult<()> {
        self.apply(id, to, reason, true).await
    }

    fn gate(&self, id: &str) -> Arc<Gate> {
        self.gates
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Gate {
                    lock: Arc::new(Mutex::new(())),
                    ticket: AtomicU64::new(0),
                })
            })
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn raw_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.gate(id).lock.clone()
    }

    async fn apply(
        self: &Arc<Self>,
        id: &str,
        to: ContainerState,
        reason: &str,
        forced: bool,
    ) -> PoolResult<()> {
        let gate = self.gate(id);
        let ticket = gate.ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = gate.lock.lock().await;

        // A newer request arrived while this one waited for the lock; the
        // newer one wins and this one is cancelled uncommitted.
        if gate.ticket.load(Ordering::SeqCst) != ticket {
            debug!(container_id = id, to = %to, "transition superseded");
            return Err(PoolError::TransitionSuperseded(id.to_string()));
        }

        let (from, generation) = {
            let mut entry = self
                .entries
                .get_mut(id)
                .ok_or_else(|| PoolError::UnknownContainer(id.to_string()))?;
            let from = entry.state;

            if forced && from == to {
                return Ok(());
            }

            if !forced && !from.can_transition_to(to) {
                drop(entry);
                self.rejected.fetch_add(1, Ordering::SeqCst);
                self.bus.publish(PoolEvent::InvalidTransition {
                    container_id: id.to_string(),
                    from,
                    to,
                    at_ms: unix_millis(),
                });
                warn!(container_id = id, from = %from, to = %to, "invalid transition rejected");
                return Err(PoolError::InvalidTransition {
                    container_id: id.to_string(),
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                });
            }

            entry.state = to;
            entry.entered_at = Instant::now();
            entry.entered_at_ms = unix_millis();
            entry.generation += 1;
            if to == ContainerState::Available {
                entry.recovery_attempts = 0;
            }
            (from, entry.generation)
        };

        self.transitions_total.fetch_add(1, Ordering::SeqCst);
        self.record_transition(id, from, to, reason, forced);
        self.bus.publish(PoolEvent::StateTransitioned {
            container_id: id.to_string(),
            from,
            to,
            reason: reason.to_string(),
            forced,
            at_ms: unix_millis(),
        });
        debug!(container_id = id, from = %from, to = %to, forced, reason, "state transition");

        self.run_entry_actions(id, to, generation);
        Ok(())
    }

    fn record_transition(
        &self,
        id: &str,
        from: ContainerState,
        to: ContainerState,
        reason: &str,
        forced: bool,
    ) {
        let mut log = self.log.lock().unwrap();
        if log.len() >= TRANSITION_LOG_CAP {
            log.pop_front();
        }
        log.push_back(TransitionRecord {
            at_ms: unix_millis(),
            container_id: id.to_string(),
            from,
            to,
            reason: reason.to_string(),
            forced,
        });
    }

    /// Side effects of entering a state. Runs while the per-container lock is
    /// still held, so partition membership changes stay serialized with the
    /// transition itself; longer-running work is spawned.
    fn run_entry_actions(self: &Arc<Self>, id: &str, to: ContainerState, generation: u64) {
        if let Some(pool) = self.pool.read().unwrap().upgrade() {
            pool.apply_partition(id, to);
        }

        match to {
            ContainerState::Failed => {
                if self.settings.recovery.enable {
                    self.schedule_recovery(id, generation);
                }
            }
            ContainerState::Stopping => {
                self.arm_stopping_watchdog(id, generation);
            }
            ContainerState::Recycling => {
                self.schedule_teardown(id, generation);
            }
            _ => {}
        }
    }

    fn schedule_recovery(self: &Arc<Self>, id: &str, generation: u64) {
        let attempts = self
            .entries
            .get(id)
            .map(|entry| entry.recovery_attempts)
            .unwrap_or(0);
        if attempts >= self.settings.recovery.max_attempts {
            info!(
                container_id = id,
                attempts, "recovery attempts exhausted, recycling"
            );
            let manager = self.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                let _ = manager
                    .transition(&id, ContainerState::Recycling, "recovery exhausted")
                    .await;
            });
            return;
        }

        let manager = self.clone();
        let id = id.to_string();
        let cooldown = self.settings.recovery.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let still_failed = manager
                .entries
                .get(&id)
                .map(|entry| entry.state == ContainerState::Failed && entry.generation == generation)
                .unwrap_or(false);
            if still_failed {
                manager.attempt_recovery(&id).await;
            }
        });
    }

    /// Stop/start the container and verify it actually came back.
    async fn attempt_recovery(self: &Arc<Self>, id: &str) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.recovery_attempts += 1;
            info!(
                container_id = id,
                attempt = entry.recovery_attempts,
                "attempting container recovery"
            );
        } else {
            return;
        }

        let _ = self.runtime.stop(id, Duration::from_secs(5)).await;

        if self
            .transition(id, ContainerState::Starting, "recovery attempt")
            .await
            .is_err()
        {
            return;
        }

        if let Err(e) = self.runtime.start(id).await {
            warn!(container_id = id, "recovery start failed: {e}");
            let _ = self
                .transition(id, ContainerState::Failed, "recovery start failed")
                .await;
            return;
        }

        tokio::time::sleep(self.settings.recovery.timeout).await;

        match self.runtime.inspect(id).await {
            Ok(status) if status.running => {
                if self
                    .transition(id, ContainerState::Running, "recovered")
                    .await
                    .is_ok()
                {
                    let _ = self
                        .transition(id, ContainerState::Available, "recovered")
                        .await;
                }
            }
            _ => {
                warn!(container_id = id, "recovery verification failed");
                let _ = self
                    .transition(id, ContainerState::Failed, "recovery verification failed")
                    .await;
            }
        }
    }

    fn arm_stopping_watchdog(self: &Arc<Self>, id: &str, generation: u64) {
        let manager = self.clone();
        let id = id.to_string();
        let deadline = ContainerState::Stopping
            .max_duration()
            .unwrap_or(Duration::from_secs(30));
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let stuck = manager
                .entries
                .get(&id)
                .map(|entry| {
                    entry.state == ContainerState::Stopping && entry.generation == generation
                })
                .unwrap_or(false);
            if stuck {
                warn!(container_id = %id, "container did not stop in time");
                let _ = manager
                    .force_transition(&id, ContainerState::Failed, "stopping watchdog expired")
                    .await;
            }
        });
    }

    /// Tracking is torn down a grace period after recycling begins so late
    /// events on the container still resolve. The pool record goes with it
    /// when nothing else already removed the container.
    fn schedule_teardown(self: &Arc<Self>, id: &str, generation: u64) {
        let manager = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(RECYCLE_TEARDOWN_GRACE).await;
            let still_recycling = manager
                .entries
                .get(&id)
                .map(|entry| {
                    entry.state == ContainerState::Recycling && entry.generation == generation
                })
                .unwrap_or(false);
            if still_recycling {
                let pool = manager.pool.read().unwrap().upgrade();
                match pool {
                    Some(pool) => pool.remove(&id, "recycle teardown").await,
                    None => manager.untrack(&id),
                }
            }
        });
    }

    /// One reconciliation pass: cross-check every tracked container against
    /// the runtime, then sweep the runtime for labeled containers nobody
    /// tracks.
    pub async fn reconcile(self: &Arc<Self>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let auto_correct = self.settings.validation.auto_correct;

        let tracked: Vec<(String, ContainerState, Duration)> = self
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().state,
                    entry.value().entered_at.elapsed(),
                )
            })
            .collect();

        for (id, state, in_state_for) in tracked {
            report.checked += 1;
            match self.runtime.inspect(&id).await {
                Ok(status) => {
                    let observed = map_runtime_status(&status);
                    let stuck = state
                        .max_duration()
                        .map(|max| in_state_for > max)
                        .unwrap_or(false);
                    let mismatch = !compatible(state, observed);

                    if mismatch || stuck {
                        report.inconsistencies += 1;
                        warn!(
                            container_id = %id,
                            tracked = %state,
                            observed = %observed,
                            stuck,
                            "state inconsistency detected"
                        );
                        if auto_correct {
                            let reason = if stuck {
                                "stuck state corrected"
                            } else {
                                "reconciled to observed state"
                            };
                            if self.force_transition(&id, observed, reason).await.is_ok() {
                                report.corrected += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    let terminal_tracked = matches!(
                        state,
                        ContainerState::Failed | ContainerState::Recycling | ContainerState::Stopped
                    );
                    if !terminal_tracked {
                        report.inconsistencies += 1;
                        warn!(container_id = %id, tracked = %state, "container unreachable in runtime: {e}");
                        if auto_correct {
                            if self
                                .force_transition(&id, ContainerState::Failed, "missing in runtime")
                                .await
                                .is_ok()
                            {
                                report.corrected += 1;
                            }
                        }
                    }
                }
            }
        }

        report.orphans_adopted = self.adopt_orphans().await;
        if report.inconsistencies > 0 || report.orphans_adopted > 0 {
            info!(
                checked = report.checked,
                inconsistencies = report.inconsistencies,
                corrected = report.corrected,
                orphans = report.orphans_adopted,
                "reconciliation pass complete"
            );
        }
        report
    }

    /// Containers carrying the pool label that nobody tracks enter `unknown`
    /// and are normalized from there.
    async fn adopt_orphans(self: &Arc<Self>) -> usize {
        let discovered = match self.runtime.list(POOL_LABEL).await {
            Ok(list) => list,
            Err(e) => {
                warn!("orphan discovery failed: {e}");
                return 0;
            }
        };

        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let min_age = self.settings.recovery.orphan_age.as_secs() as i64;
        let mut adopted = 0;

        for container in discovered {
            if self.entries.contains_key(&container.id) {
                continue;
            }
            if now_secs - container.created_at < min_age {
                // Freshly created by someone, likely still settling.
                continue;
            }

            info!(container_id = %container.id, "adopting orphan container");
            self.track(&container.id, ContainerState::Unknown);
            if let Some(pool) = self.pool.read().unwrap().upgrade() {
                pool.adopt(&container.id);
            }

            let observed = match self.runtime.inspect(&container.id).await {
                Ok(status) => map_runtime_status(&status),
                Err(_) => ContainerState::Failed,
            };
            if self
                .force_transition(&container.id, observed, "orphan normalization")
                .await
                .is_ok()
                && observed == ContainerState::Running
            {
                let _ = self
                    .transition(&container.id, ContainerState::Available, "orphan adopted")
                    .await;
            }
            adopted += 1;
        }
        adopted
    }

    /// Spawn the periodic validation loop.
    pub fn start(self: &Arc<Self>) {
        if !self.settings.validation.enable {
            info!("state validation disabled");
            self.started.store(true, Ordering::SeqCst);
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = self.clone();
        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();
        let interval = self.settings.validation.interval;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.reconcile().await;
                    }
                    _ = cancel.cancelled() => {
                        debug!("state validation loop stopped");
                        break;
                    }
                }
            }
        });
        info!(interval = ?interval, "state validation loop started");
    }

    pub fn stop(&self) {
        self.cancel.lock().unwrap().cancel();
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::InMemoryRuntime;
    use std::collections::HashMap as StdHashMap;

    fn new_manager(
        settings: StateSettings,
    ) -> (
        Arc<StateManager>,
        Arc<InMemoryRuntime>,
        tokio::sync::mpsc::UnboundedReceiver<PoolEvent>,
    ) {
        let runtime = Arc::new(InMemoryRuntime::new());
        let (bus, rx) = EventBus::channel();
        let manager = Arc::new(StateManager::new(runtime.clone(), bus, settings));
        (manager, runtime, rx)
    }

    fn no_recovery() -> StateSettings {
        let mut settings = StateSettings::default();
        settings.recovery.enable = false;
        settings
    }

    #[test]
    fn test_transition_table() {
        use ContainerState::*;
        assert!(Initializing.can_transition_to(Created));
        assert!(Created.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Available));
        assert!(Available.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Available));
        assert!(Busy.can_transition_to(Recycling));
        assert!(Stopped.can_transition_to(Starting));
        assert!(Failed.can_transition_to(Recycling));
        assert!(Recycling.can_transition_to(Initializing));
        assert!(Unknown.can_transition_to(Recycling));

        assert!(!Available.can_transition_to(Stopped));
        assert!(!Available.can_transition_to(Available));
        assert!(!Stopped.can_transition_to(Busy));
        assert!(!Recycling.can_transition_to(Available));
        assert!(!Initializing.can_transition_to(Running));
    }

    #[test]
    fn test_runtime_status_mapping() {
        let running = RuntimeStatus {
            running: true,
            ..Default::default()
        };
        assert_eq!(map_runtime_status(&running), ContainerState::Running);

        let oom = RuntimeStatus {
            oom_killed: true,
            ..Default::default()
        };
        assert_eq!(map_runtime_status(&oom), ContainerState::Failed);

        let restarting = RuntimeStatus {
            restarting: true,
            ..Default::default()
        };
        assert_eq!(map_runtime_status(&restarting), ContainerState::Starting);

        assert_eq!(
            map_runtime_status(&RuntimeStatus::default()),
            ContainerState::Stopped
        );
    }

    #[tokio::test]
    async fn test_valid_transition_applies() {
        let (manager, _runtime, _rx) = new_manager(no_recovery());
        manager.track("c1", ContainerState::Available);

        manager
            .transition("c1", ContainerState::Busy, "job assignment")
            .await
            .unwrap();
        assert_eq!(manager.state_of("c1"), Some(ContainerState::Busy));
        assert_eq!(manager.metrics().transitions_total, 1);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected_with_event() {
        let (manager, _runtime, mut rx) = new_manager(no_recovery());
        manager.track("c1", ContainerState::Available);

        let err = manager
            .transition("c1", ContainerState::Stopped, "nonsense")
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidTransition { .. }));
        assert_eq!(manager.state_of("c1"), Some(ContainerState::Available));
        assert_eq!(manager.rejected_count(), 1);

        match rx.recv().await.unwrap() {
            PoolEvent::InvalidTransition { from, to, .. } => {
                assert_eq!(from, ContainerState::Available);
                assert_eq!(to, ContainerState::Stopped);
            }
            other => panic!("unexpected event {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_force_to_current_state_is_noop() {
        let (manager, _runtime, _rx) = new_manager(no_recovery());
        manager.track("c1", ContainerState::Available);

        manager
            .force_transition("c1", ContainerState::Available, "redundant")
            .await
            .unwrap();
        assert_eq!(manager.metrics().transitions_total, 0);
        assert!(manager.recent_transitions(10).is_empty());
    }

    #[tokio::test]
    async fn test_forced_transition_audited() {
        let (manager, _runtime, _rx) = new_manager(no_recovery());
        manager.track("c1", ContainerState::Available);

        manager
            .force_transition("c1", ContainerState::Stopped, "reconciled")
            .await
            .unwrap();
        let log = manager.recent_transitions(10);
        assert_eq!(log.len(), 1);
        assert!(log[0].forced);
        assert_eq!(log[0].to, ContainerState::Stopped);
    }

    #[tokio::test]
    async fn test_pending_transition_superseded() {
        let (manager, _runtime, _rx) = new_manager(no_recovery());
        manager.track("c1", ContainerState::Available);

        // Hold the gate so the first transition parks on the lock.
        let raw = manager.raw_lock("c1");
        let guard = raw.lock().await;

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .transition("c1", ContainerState::Busy, "older")
                    .await
            })
        };
        // Give the first request time to take its ticket and park.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let second = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .transition("c1", ContainerState::Stopping, "newer")
                    .await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        drop(guard);

        let first_result = first.await.unwrap();
        let second_result = second.await.unwrap();
        assert!(matches!(
            first_result,
            Err(PoolError::TransitionSuperseded(_))
        ));
        assert!(second_result.is_ok());
        assert_eq!(manager.state_of("c1"), Some(ContainerState::Stopping));
    }

    #[tokio::test]
    async fn test_unknown_container_rejected() {
        let (manager, _runtime, _rx) = new_manager(no_recovery());
        let err = manager
            .transition("ghost", ContainerState::Busy, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::UnknownContainer(_)));
    }

    #[tokio::test]
    async fn test_transition_log_capped() {
        let (manager, _runtime, _rx) = new_manager(no_recovery());
        manager.track("c1", ContainerState::Available);
        for _ in 0..((TRANSITION_LOG_CAP / 2) + 50) {
            manager
                .transition("c1", ContainerState::Busy, "flip")
                .await
                .unwrap();
            manager
                .transition("c1", ContainerState::Available, "flop")
                .await
                .unwrap();
        }
        assert_eq!(manager.log.lock().unwrap().len(), TRANSITION_LOG_CAP);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_watchdog_forces_failed() {
        let (manager, _runtime, _rx) = new_manager(no_recovery());
        manager.track("c1", ContainerState::Available);
        manager
            .transition("c1", ContainerState::Stopping, "shutdown request")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(manager.state_of("c1"), Some(ContainerState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recycling_teardown_untracks() {
        let (manager, _runtime, _rx) = new_manager(no_recovery());
        manager.track("c1", ContainerState::Busy);
        manager
            .transition("c1", ContainerState::Recycling, "worn out")
            .await
            .unwrap();

        tokio::time::sleep(RECYCLE_TEARDOWN_GRACE + Duration::from_secs(1)).await;
        assert!(!manager.contains("c1"));
    }

    #[tokio::test]
    async fn test_recovery_restores_available() {
        let mut settings = StateSettings::default();
        settings.recovery.timeout = Duration::from_millis(10);
        let (manager, runtime, _rx) = new_manager(settings);

        runtime.seed_container("c1", StdHashMap::new(), false, 0);
        manager.track("c1", ContainerState::Running);
        manager
            .transition("c1", ContainerState::Failed, "probe failed")
            .await
            .unwrap();

        // Recovery: cooldown, stop/start, verification delay.
        for _ in 0..100 {
            if manager.state_of("c1") == Some(ContainerState::Available) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.state_of("c1"), Some(ContainerState::Available));
        assert!(runtime.is_running("c1"));
    }

    #[tokio::test]
    async fn test_reconcile_corrects_mismatch() {
        let (manager, runtime, _rx) = new_manager(no_recovery());
        runtime.seed_container("c1", StdHashMap::new(), true, 0);
        manager.track("c1", ContainerState::Available);

        // Compatible: runtime-running vs tracked available is fine.
        let report = manager.reconcile().await;
        assert_eq!(report.inconsistencies, 0);

        // Kill it behind the manager's back; next pass corrects.
        runtime.kill_container("c1", false);
        let report = manager.reconcile().await;
        assert_eq!(report.inconsistencies, 1);
        assert_eq!(report.corrected, 1);
        assert_eq!(manager.state_of("c1"), Some(ContainerState::Stopped));
    }

    #[tokio::test]
    async fn test_reconcile_missing_container_fails() {
        let (manager, _runtime, _rx) = new_manager(no_recovery());
        manager.track("ghost", ContainerState::Busy);

        let report = manager.reconcile().await;
        assert_eq!(report.inconsistencies, 1);
        assert_eq!(manager.state_of("ghost"), Some(ContainerState::Failed));
    }

    #[tokio::test]
    async fn test_orphan_adopted_into_distribution() {
        let (manager, runtime, _rx) = new_manager(no_recovery());
        let mut labels = StdHashMap::new();
        labels.insert(POOL_LABEL.to_string(), "true".to_string());
        // created_at 0 makes it far older than the orphan age.
        runtime.seed_container("stray", labels, true, 0);

        let report = manager.reconcile().await;
        assert_eq!(report.orphans_adopted, 1);
        assert_eq!(manager.state_of("stray"), Some(ContainerState::Available));
        assert!(manager
            .distribution()
            .contains_key(&ContainerState::Available));
    }

    #[tokio::test]
    async fn test_fresh_unlabeled_containers_ignored() {
        let (manager, runtime, _rx) = new_manager(no_recovery());
        // No pool label: never adopted.
        runtime.seed_container("foreign", StdHashMap::new(), true, 0);

        let report = manager.reconcile().await;
        assert_eq!(report.orphans_adopted, 0);
        assert!(!manager.contains("foreign"));
    }

    #[tokio::test]
    async fn test_export_restore_round_trip() {
        let (manager, _runtime, _rx) = new_manager(no_recovery());
        manager.track("c1", ContainerState::Available);
        manager.track("c2", ContainerState::Busy);

        let exported = manager.export();
        assert_eq!(exported.len(), 2);

        let (restored, _runtime, _rx) = new_manager(no_recovery());
        restored.restore(exported);
        assert_eq!(restored.state_of("c1"), Some(ContainerState::Available));
        assert_eq!(restored.state_of("c2"), Some(ContainerState::Busy));
    }
}
