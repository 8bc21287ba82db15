use crate::core::config::CoreConfig;
use crate::core::events::{EventBus, EventSink, PoolEvent};
use crate::core::monitor::{AlertSeverity, ResourceMonitor, SuggestionKind, SYSTEM_CPU, SYSTEM_MEMORY};
use crate::core::optimizer::{JobRequirements, OptimizerSelector, ReuseOptimizer};
use crate::core::persistence::SnapshotStore;
use crate::core::pool::{ContainerHandle, JobResult, PoolManager};
use crate::core::runtime::ContainerRuntime;
use crate::core::scaler::{
    DynamicScaler, ScalingAction, ScalingDecision, ScalingPriority, ZeroQueueDepth,
};
use crate::core::state::StateManager;
use crate::shared::error::{AcquireError, PoolResult};
use crate::shared::utils::unix_millis;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DISPATCH_LOG_CAP: usize = 1000;
/// Invalid-transition delta that makes the optimization cycle force an extra
/// validation pass.
const REJECTION_SPIKE: u64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    pub pool: crate::core::pool::PoolStatus,
    pub scaling: crate::core::scaler::ScalerStatus,
    pub optimization: crate::core::optimizer::OptimizerStatus,
    pub state_distribution: HashMap<String, usize>,
    pub alerts: Vec<crate::core::monitor::Alert>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub details: String,
    pub last_check_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub components: HashMap<String, ComponentHealth>,
    pub overall: bool,
}

/// Suggestion ids already acted on, bounded.
struct DispatchLog {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DispatchLog {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// True when the id is new; remembers it.
    fn first_time(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= DISPATCH_LOG_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

/// Owns every subsystem, routes their events, and exposes the public
/// operations of the control plane. Built explicitly, never a global: tests
/// construct disposable coordinators around fakes.
pub struct Coordinator {
    config: CoreConfig,
    runtime: Arc<dyn ContainerRuntime>,
    sink: Arc<dyn EventSink>,
    pool: Arc<PoolManager>,
    state: Arc<StateManager>,
    scaler: Arc<DynamicScaler>,
    optimizer: Arc<ReuseOptimizer>,
    monitor: Arc<ResourceMonitor>,
    snapshots: Arc<SnapshotStore>,
    events_rx: Mutex<Option<UnboundedReceiver<PoolEvent>>>,
    dispatched: Mutex<DispatchLog>,
    health: Mutex<HashMap<String, ComponentHealth>>,
    rejections_seen: AtomicU64,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl Coordinator {
    pub fn new(
        config: CoreConfig,
        runtime: Arc<dyn ContainerRuntime>,
        sink: Arc<dyn EventSink>,
    ) -> PoolResult<Arc<Self>> {
        let (bus, events_rx) = EventBus::channel();

        let state = Arc::new(StateManager::new(
            runtime.clone(),
            bus.clone(),
            config.state.clone(),
        ));
        let pool = Arc::new(PoolManager::new(
            runtime.clone(),
            state.clone(),
            bus.clone(),
            config.pool.clone(),
            config.container.clone(),
            config.health.clone(),
            config.optimizer.max_reuse_count,
        ));
        state.attach_pool(Arc::downgrade(&pool));

        let scaler = Arc::new(DynamicScaler::new(
            Arc::downgrade(&pool),
            config.scaler.clone(),
            config.prediction.clone(),
            config.cost.clone(),
            bus.clone(),
            Arc::new(ZeroQueueDepth),
        ));
        pool.set_scaling_executor(scaler.clone());

        let optimizer = Arc::new(ReuseOptimizer::new(config.optimizer.clone()));
        if optimizer.is_enabled() {
            pool.set_selector(Arc::new(OptimizerSelector::new(optimizer.clone())));
        }

        let monitor = Arc::new(ResourceMonitor::new(
            runtime.clone(),
            Arc::downgrade(&pool),
            config.monitor.clone(),
            bus.clone(),
        ));
        let snapshots = Arc::new(SnapshotStore::new(config.persistence.clone())?);

        Ok(Arc::new(Self {
            config,
            runtime,
            sink,
            pool,
            state,
            scaler,
            optimizer,
            monitor,
            snapshots,
            events_rx: Mutex::new(Some(events_rx)),
            dispatched: Mutex::new(DispatchLog::new()),
            health: Mutex::new(HashMap::new()),
            rejections_seen: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }))
    }

    /// Bring everything up: restore the last snapshot, initialize the pool,
    /// then start every periodic loop.
    pub async fn start(self: &Arc<Self>) -> PoolResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.snapshots.load_latest().await {
            Ok(Some(snapshot)) => {
                info!(
                    sequence = snapshot.sequence,
                    containers = snapshot.containers.len(),
                    "restoring tracked state from snapshot"
                );
                for id in snapshot.containers.keys() {
                    self.pool.adopt(id);
                }
                self.state.restore(snapshot.containers);
            }
            Ok(None) => {}
            Err(e) => warn!("snapshot restore skipped: {e}"),
        }

        self.pool.initialize().await?;

        if let Some(events_rx) = self.events_rx.lock().unwrap().take() {
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator.route_events(events_rx).await;
            });
        }

        self.state.start();
        self.scaler.start();
        self.monitor.start();
        self.spawn_pattern_loop();
        self.spawn_persistence_loop();
        self.spawn_health_loop();
        self.spawn_optimization_loop();

        info!("control plane started");
        Ok(())
    }

    async fn route_events(self: Arc<Self>, mut events_rx: UnboundedReceiver<PoolEvent>) {
        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => {
                        self.sink.emit(&event);
                        self.react(&event).await;
                    }
                    None => break,
                },
                _ = self.cancel.cancelled() => {
                    // Drain whatever is already queued, then stop routing.
                    while let Ok(event) = events_rx.try_recv() {
                        self.sink.emit(&event);
                    }
                    break;
                }
            }
        }
        debug!("event routing stopped");
    }

    /// Cross-component reactions to routed events.
    async fn react(&self, event: &PoolEvent) {
        match event {
            PoolEvent::AlertGenerated { alert }
                if alert.severity == AlertSeverity::Critical
                    && (alert.resource == SYSTEM_CPU || alert.resource == SYSTEM_MEMORY) =>
            {
                warn!(resource = %alert.resource, "critical system alert, shedding two containers");
                let decision = ScalingDecision {
                    action: ScalingAction::ScaleDown(2),
                    priority: ScalingPriority::Emergency,
                    confidence: 1.0,
                    reason: format!("critical alert on {}", alert.resource),
                    at_ms: unix_millis(),
                };
                self.scaler.execute(&decision).await;
            }
            PoolEvent::AnomalyDetected { anomaly } if anomaly.high_severity => {
                if let Some(container_id) = &anomaly.container_id {
                    warn!(container_id = %container_id, "recycling container after anomaly");
                    self.pool.recycle(container_id, "resource anomaly").await;
                }
            }
            PoolEvent::OptimizationSuggestions { suggestions, .. } => {
                for suggestion in suggestions {
                    let fresh = self.dispatched.lock().unwrap().first_time(&suggestion.id);
                    if !fresh {
                        continue;
                    }
                    self.execute_suggestion(suggestion).await;
                }
            }
            PoolEvent::ContainerRemoved { container_id, .. } => {
                self.optimizer.forget(container_id);
                self.monitor.forget_container(container_id);
            }
            _ => {}
        }
    }

    async fn execute_suggestion(&self, suggestion: &crate::core::monitor::OptimizationSuggestion) {
        info!(kind = ?suggestion.kind, reason = %suggestion.reason, "executing suggestion");
        match suggestion.kind {
            SuggestionKind::ScaleUp => {
                let decision = ScalingDecision {
                    action: ScalingAction::ScaleUp(1),
                    priority: ScalingPriority::Normal,
                    confidence: 0.7,
                    reason: suggestion.reason.clone(),
                    at_ms: unix_millis(),
                };
                self.scaler.execute(&decision).await;
            }
            SuggestionKind::ScaleDown => {
                let decision = ScalingDecision {
                    action: ScalingAction::ScaleDown(1),
                    priority: ScalingPriority::Normal,
                    confidence: 0.7,
                    reason: suggestion.reason.clone(),
                    at_ms: unix_millis(),
                };
                self.scaler.execute(&decision).await;
            }
            SuggestionKind::RecycleContainer => {
                if let Some(container_id) = &suggestion.container_id {
                    self.pool.recycle(container_id, "monitor suggestion").await;
                }
            }
            SuggestionKind::MemoryOptimization => {
                // No direct lever; the suggestion is surfaced to the sink.
                debug!("memory optimization suggestion noted");
            }
        }
    }

    fn spawn_pattern_loop(self: &Arc<Self>) {
        let optimizer = self.optimizer.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + optimizer.pattern_interval(),
                optimizer.pattern_interval(),
            );
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => optimizer.analyze_patterns(),
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    fn spawn_persistence_loop(self: &Arc<Self>) {
        if !self.snapshots.is_enabled() {
            return;
        }
        let snapshots = self.snapshots.clone();
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let interval = self.config.persistence.interval;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = snapshots.capture(&state);
                        if let Err(e) = snapshots.save(&snapshot).await {
                            warn!("snapshot write failed: {e}");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let coordinator = self.clone();
        let cancel = self.cancel.clone();
        let interval = self.config.coordinator.health_interval;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => coordinator.health_cycle().await,
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    fn spawn_optimization_loop(self: &Arc<Self>) {
        let coordinator = self.clone();
        let cancel = self.cancel.clone();
        let interval = self.config.coordinator.optimization_interval;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => coordinator.optimization_cycle().await,
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Ask each component for its status; restart stopped loops when
    /// auto-restart is on.
    pub async fn health_cycle(self: &Arc<Self>) {
        let now = unix_millis();
        let runtime_ok = self.runtime.ping().await.is_ok();

        let mut components = HashMap::new();
        components.insert(
            "runtime".to_string(),
            ComponentHealth {
                healthy: runtime_ok,
                details: if runtime_ok {
                    "reachable".to_string()
                } else {
                    "ping failed".to_string()
                },
                last_check_ms: now,
            },
        );
        components.insert(
            "pool".to_string(),
            ComponentHealth {
                healthy: self.pool.is_initialized(),
                details: format!("{} containers", self.pool.len()),
                last_check_ms: now,
            },
        );
        components.insert(
            "state_manager".to_string(),
            ComponentHealth {
                healthy: self.state.is_started(),
                details: format!("{} tracked", self.state.tracked_count()),
                last_check_ms: now,
            },
        );
        components.insert(
            "scaler".to_string(),
            ComponentHealth {
                healthy: self.scaler.is_started(),
                details: format!(
                    "{} operations in progress",
                    self.scaler.operations_in_progress()
                ),
                last_check_ms: now,
            },
        );
        components.insert(
            "monitor".to_string(),
            ComponentHealth {
                healthy: self.monitor.is_started(),
                details: format!("{} samples", self.monitor.status().samples_collected),
                last_check_ms: now,
            },
        );

        let unhealthy: Vec<String> = components
            .iter()
            .filter(|(_, health)| !health.healthy)
            .map(|(name, _)| name.clone())
            .collect();
        let overall = unhealthy.is_empty();

        if !overall && self.config.coordinator.auto_restart && !self.cancel.is_cancelled() {
            for name in &unhealthy {
                match name.as_str() {
                    "scaler" => {
                        warn!("restarting scaler");
                        self.scaler.stop();
                        self.scaler.start();
                    }
                    "state_manager" => {
                        warn!("restarting state manager");
                        self.state.stop();
                        self.state.start();
                    }
                    "monitor" => {
                        warn!("restarting monitor");
                        self.monitor.stop();
                        self.monitor.start();
                    }
                    _ => {}
                }
            }
        }

        *self.health.lock().unwrap() = components;
        debug!(overall, "health check complete");
        let event = PoolEvent::HealthCheckCompleted {
            healthy: overall,
            unhealthy_components: unhealthy,
            at_ms: now,
        };
        self.sink.emit(&event);
    }

    /// Cross-component optimization rules, evaluated every few minutes.
    pub async fn optimization_cycle(self: &Arc<Self>) {
        let pool_status = self.pool.status();
        let scaler_status = self.scaler.status();
        let optimizer_status = self.optimizer.status();
        let state_metrics = self.state.metrics();

        // High utilization with no scaling underway: push the scaler now.
        if pool_status.utilization > self.config.scaler.thresholds.scale_up
            && scaler_status.operations_in_progress == 0
        {
            info!("optimization cycle forcing a scaling evaluation");
            self.scaler.run_once().await;
        }

        // Low reuse efficiency with headroom: recycle the worst container.
        if optimizer_status.overall_reuse_efficiency
            < self.config.optimizer.reuse_efficiency_threshold
            && pool_status.total > pool_status.min_size
        {
            if let Some(worst) = self.worst_container() {
                info!(container_id = %worst, "aggressive recycling of least efficient container");
                self.pool.recycle(&worst, "low reuse efficiency").await;
            }
        }

        // A burst of rejected transitions: force an extra validation pass.
        let rejected = state_metrics.rejected_transitions;
        let seen = self.rejections_seen.swap(rejected, Ordering::SeqCst);
        if rejected.saturating_sub(seen) >= REJECTION_SPIKE {
            warn!(rejected, "invalid-transition spike, reconciling");
            self.state.reconcile().await;
        }

        // Standing critical alerts keep shedding capacity (cooldown-gated).
        let has_critical = self
            .monitor
            .active_alerts()
            .iter()
            .any(|alert| alert.severity == AlertSeverity::Critical);
        if has_critical && pool_status.total > pool_status.min_size {
            let decision = ScalingDecision {
                action: ScalingAction::ScaleDown(1),
                priority: ScalingPriority::Normal,
                confidence: 0.6,
                reason: "standing critical resource alert".to_string(),
                at_ms: unix_millis(),
            };
            let within_cooldown = scaler_status.down_cooldown_remaining_ms > 0;
            if !within_cooldown {
                self.scaler.execute(&decision).await;
            }
        }

        // Resource warnings: refresh reuse patterns so selection adapts.
        let has_warning = self
            .monitor
            .active_alerts()
            .iter()
            .any(|alert| alert.severity == AlertSeverity::Warning);
        if has_warning {
            self.optimizer.analyze_patterns();
        }

        // Recovery paths can leave the pool short; top it back up.
        if self.pool.is_initialized() && pool_status.total < pool_status.min_size {
            let missing = pool_status.min_size - pool_status.total;
            info!(missing, "topping pool back up to minimum");
            for _ in 0..missing {
                if let Err(e) = self.pool.create_container("base").await {
                    warn!("top-up creation failed: {e}");
                    break;
                }
            }
        }
    }

    fn worst_container(&self) -> Option<String> {
        self.pool
            .container_ids()
            .into_iter()
            .map(|id| {
                let efficiency = self.optimizer.reuse_efficiency(&id);
                (id, efficiency)
            })
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _)| id)
    }

    /// Hand out a container for a job.
    pub async fn acquire(&self, requirements: &JobRequirements) -> Result<ContainerHandle, AcquireError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(AcquireError::RuntimeUnavailable(
                "control plane not started".to_string(),
            ));
        }
        self.pool.acquire(requirements).await
    }

    /// Take a finished job's container back. Records the outcome for the
    /// optimizer first, then either recycles or republishes. Never fails.
    pub async fn release(&self, id: &str, result: JobResult) {
        let fingerprint = result
            .fingerprint
            .clone()
            .unwrap_or_else(|| JobRequirements::default().fingerprint());
        self.optimizer.record_outcome(
            id,
            fingerprint,
            result.duration_ms,
            result.success,
            result.resource_usage.clone().unwrap_or_default(),
        );

        if let Some(record) = self.pool.record(id) {
            if let Some(reason) = self.optimizer.should_recycle(&record) {
                info!(container_id = id, reason = %reason, "optimizer-driven recycle on release");
                self.pool.recycle(id, &reason).await;
                return;
            }
        }
        self.pool.release(id, &result).await;
    }

    /// Abort a running job's container.
    pub async fn cancel(&self, id: &str) {
        info!(container_id = id, "job cancelled");
        self.pool.recycle(id, "job cancelled").await;
    }

    pub fn status(&self) -> CoreStatus {
        CoreStatus {
            pool: self.pool.status(),
            scaling: self.scaler.status(),
            optimization: self.optimizer.status(),
            state_distribution: self
                .state
                .distribution()
                .into_iter()
                .map(|(state, count)| (state.as_str().to_string(), count))
                .collect(),
            alerts: self.monitor.active_alerts(),
        }
    }

    pub fn health(&self) -> HealthReport {
        let components = self.health.lock().unwrap().clone();
        let overall = !components.is_empty() && components.values().all(|health| health.healthy);
        HealthReport {
            components,
            overall,
        }
    }

    /// Graceful shutdown: stop the loops, then wait out in-flight scaling
    /// work up to the shutdown deadline.
    pub async fn stop(&self) {
        info!("stopping control plane");
        self.cancel.cancel();
        self.scaler.stop();
        self.monitor.stop();
        self.state.stop();

        let deadline = tokio::time::Instant::now() + self.config.coordinator.shutdown_timeout;
        while self.scaler.operations_in_progress() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.scaler.operations_in_progress() > 0 {
            warn!("shutdown deadline reached with scaling operations in flight");
        }
        self.started.store(false, Ordering::SeqCst);
        info!("control plane stopped");
    }

    /// Skip the drain, force-remove every container, clear the partitions.
    pub async fn emergency_stop(&self) {
        warn!("emergency stop requested");
        self.cancel.cancel();
        self.scaler.stop();
        self.monitor.stop();
        self.state.stop();
        self.pool.clear_all().await;
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn scaler(&self) -> &Arc<DynamicScaler> {
        &self.scaler
    }

    pub fn optimizer(&self) -> &Arc<ReuseOptimizer> {
        &self.optimizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ContainerState;
    use crate::core::test_utils::{CollectingSink, InMemoryRuntime};
    use crate::core::template::POOL_LABEL;

    fn test_config(min: usize, max: usize) -> CoreConfig {
        let mut config = CoreConfig::default();
        config.pool.min_size = min;
        config.pool.max_size = max;
        config.pool.warmup_containers = 0;
        config.pool.scale_wait = Duration::from_millis(200);
        config.persistence.enabled = false;
        config.state.recovery.enable = false;
        // Keep periodic loops quiet during tests; cycles are driven manually.
        config.state.validation.interval = Duration::from_secs(3600);
        config.scaler.timing.interval = Duration::from_secs(3600);
        config.monitor.interval = Duration::from_secs(3600);
        config.coordinator.health_interval = Duration::from_secs(3600);
        config.coordinator.optimization_interval = Duration::from_secs(3600);
        config
    }

    struct Fixture {
        coordinator: Arc<Coordinator>,
        runtime: Arc<InMemoryRuntime>,
        sink: Arc<CollectingSink>,
    }

    async fn started(config: CoreConfig) -> Fixture {
        let runtime = Arc::new(InMemoryRuntime::new());
        let sink = Arc::new(CollectingSink::new());
        let coordinator =
            Coordinator::new(config, runtime.clone(), sink.clone()).unwrap();
        coordinator.start().await.unwrap();
        Fixture {
            coordinator,
            runtime,
            sink,
        }
    }

    fn requirements() -> JobRequirements {
        JobRequirements {
            job_type: "build".to_string(),
            language: "rust".to_string(),
            ..Default::default()
        }
    }

    async fn wait_until<F: Fn() -> bool>(predicate: F, timeout_ms: u64) -> bool {
        for _ in 0..(timeout_ms / 10) {
            if predicate() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        predicate()
    }

    #[tokio::test]
    async fn test_cold_start() {
        let f = started(test_config(3, 6)).await;

        let status = f.coordinator.status();
        assert_eq!(status.pool.total, 3);
        assert_eq!(status.pool.available, 3);
        assert_eq!(status.pool.utilization, 0.0);
        assert_eq!(status.state_distribution.get("available"), Some(&3));
        assert_eq!(f.runtime.container_count(), 3);
    }

    #[tokio::test]
    async fn test_burst_absorbed_by_emergency_scaling() {
        let f = started(test_config(3, 6)).await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(f.coordinator.acquire(&requirements()).await.unwrap());
        }
        assert_eq!(f.coordinator.status().pool.utilization, 1.0);

        // One scaler tick: critical utilization, emergency growth to max.
        f.coordinator.scaler().run_once().await;
        assert!(
            wait_until(|| f.coordinator.status().pool.total == 6, 2000).await,
            "pool should grow to max size"
        );

        let released = handles.pop().unwrap();
        f.coordinator
            .release(&released.id, JobResult {
                success: true,
                duration_ms: 1000,
                ..Default::default()
            })
            .await;
        let status = f.coordinator.status();
        assert_eq!(status.pool.busy, 2);
        assert!(status.pool.available >= 3);
    }

    #[tokio::test]
    async fn test_optimizer_preemptive_recycle_on_release() {
        let mut config = test_config(1, 3);
        config.optimizer.max_reuse_count = 2;
        let f = started(config).await;

        let first = f.coordinator.acquire(&requirements()).await.unwrap();
        f.coordinator
            .release(&first.id, JobResult {
                success: true,
                duration_ms: 500,
                ..Default::default()
            })
            .await;

        let second = f.coordinator.acquire(&requirements()).await.unwrap();
        assert_eq!(second.id, first.id);
        f.coordinator
            .release(&second.id, JobResult {
                success: true,
                duration_ms: 500,
                ..Default::default()
            })
            .await;

        // The container hit its reuse cap: recycled and replaced.
        assert!(f.coordinator.pool().record(&first.id).is_none());
        assert!(
            wait_until(|| f.coordinator.status().pool.total == 1, 2000).await,
            "replacement should restore the minimum"
        );
    }

    #[tokio::test]
    async fn test_orphan_appears_in_status_after_reconcile() {
        let f = started(test_config(2, 4)).await;

        let mut labels = std::collections::HashMap::new();
        labels.insert(POOL_LABEL.to_string(), "true".to_string());
        f.runtime.seed_container("stray", labels, true, 0);

        f.coordinator.state_manager().reconcile().await;

        let status = f.coordinator.status();
        assert_eq!(status.pool.total, 3);
        assert_eq!(status.state_distribution.get("available"), Some(&3));
        assert!(f.coordinator.pool().record("stray").is_some());
    }

    #[tokio::test]
    async fn test_invalid_transition_surfaces_event_and_counter() {
        let f = started(test_config(1, 2)).await;
        let id = f.coordinator.pool().container_ids().pop().unwrap();

        let result = f
            .coordinator
            .state_manager()
            .transition(&id, ContainerState::Stopped, "bogus")
            .await;
        assert!(result.is_err());

        assert!(
            wait_until(|| f.sink.count_of("invalidTransition") == 1, 1000).await,
            "invalid transition event should reach the sink"
        );
        assert_eq!(f.coordinator.state_manager().rejected_count(), 1);
        assert_eq!(
            f.coordinator.state_manager().state_of(&id),
            Some(ContainerState::Available)
        );
    }

    #[tokio::test]
    async fn test_critical_alert_drives_emergency_scale_down() {
        let f = started(test_config(3, 8)).await;
        f.coordinator.pool().create_container("base").await.unwrap();
        f.coordinator.pool().create_container("base").await.unwrap();
        assert_eq!(f.coordinator.status().pool.total, 5);

        // Inject one critical cpu reading.
        let band = f.coordinator.config.monitor.thresholds.cpu.clone();
        let alert = f
            .coordinator
            .monitor()
            .check_resource(SYSTEM_CPU, 97.0, &band);
        assert!(alert.is_some());

        assert!(
            wait_until(|| f.coordinator.status().pool.total == 3, 2000).await,
            "two containers should be shed"
        );
        assert_eq!(f.sink.count_of("alertGenerated"), 1);

        // The shed stamped the down cooldown.
        let status = f.coordinator.scaler().status();
        assert!(status.down_cooldown_remaining_ms > 0);
    }

    #[tokio::test]
    async fn test_high_anomaly_recycles_container() {
        let f = started(test_config(2, 4)).await;
        let victim = f.coordinator.pool().container_ids().pop().unwrap();

        // Feed a stable container cpu series, then a hard spike.
        let key = format!("container.{victim}.cpu");
        for n in 0..30 {
            f.coordinator.monitor().record(&key, 20.0 + (n % 2) as f64);
        }
        f.coordinator.monitor().record(&key, 99.0);
        let anomaly = f
            .coordinator
            .monitor()
            .detect_anomaly(&key, Some(victim.clone()))
            .unwrap();
        assert!(anomaly.high_severity);
        f.coordinator
            .react(&PoolEvent::AnomalyDetected { anomaly })
            .await;

        assert!(f.coordinator.pool().record(&victim).is_none());
    }

    #[tokio::test]
    async fn test_suggestions_dispatch_once() {
        let f = started(test_config(2, 4)).await;
        let victim = f.coordinator.pool().container_ids().pop().unwrap();

        let suggestion = crate::core::monitor::OptimizationSuggestion {
            id: "s-1".to_string(),
            at_ms: unix_millis(),
            kind: SuggestionKind::RecycleContainer,
            container_id: Some(victim.clone()),
            reason: "hot container".to_string(),
        };
        let event = PoolEvent::OptimizationSuggestions {
            suggestions: vec![suggestion.clone()],
            at_ms: unix_millis(),
        };

        f.coordinator.react(&event).await;
        assert!(f.coordinator.pool().record(&victim).is_none());
        let total_after_first = f.coordinator.status().pool.total;

        // Replaying the same suggestion id is a no-op.
        f.coordinator.react(&event).await;
        assert_eq!(f.coordinator.status().pool.total, total_after_first);
    }

    #[tokio::test]
    async fn test_health_cycle_reports_and_restarts() {
        let f = started(test_config(1, 2)).await;

        f.coordinator.health_cycle().await;
        let report = f.coordinator.health();
        assert!(report.overall);
        assert!(report.components["pool"].healthy);
        assert!(report.components["runtime"].healthy);

        // Kill a loop; the next cycle restarts it.
        f.coordinator.scaler().stop();
        f.coordinator.health_cycle().await;
        assert!(f.coordinator.scaler().is_started());
    }

    #[tokio::test]
    async fn test_optimization_cycle_tops_up_below_minimum() {
        let f = started(test_config(2, 4)).await;
        let id = f.coordinator.pool().container_ids().pop().unwrap();
        f.coordinator.pool().remove(&id, "simulated loss").await;
        assert_eq!(f.coordinator.status().pool.total, 1);

        f.coordinator.optimization_cycle().await;
        assert_eq!(f.coordinator.status().pool.total, 2);
    }

    #[tokio::test]
    async fn test_cancel_recycles_busy_container() {
        let f = started(test_config(1, 3)).await;
        let handle = f.coordinator.acquire(&requirements()).await.unwrap();

        f.coordinator.cancel(&handle.id).await;
        assert!(f.coordinator.pool().record(&handle.id).is_none());
        assert!(
            wait_until(|| f.coordinator.status().pool.total == 1, 2000).await,
            "replacement should restore the minimum"
        );
    }

    #[tokio::test]
    async fn test_emergency_stop_clears_everything() {
        let f = started(test_config(3, 6)).await;
        assert_eq!(f.runtime.container_count(), 3);

        f.coordinator.emergency_stop().await;
        assert_eq!(f.runtime.container_count(), 0);
        assert_eq!(f.coordinator.status().pool.total, 0);

        let err = f.coordinator.acquire(&requirements()).await.unwrap_err();
        assert!(matches!(err, AcquireError::RuntimeUnavailable(_)));
    }

    #[tokio::test]
    async fn test_release_never_fails_on_unknown_container() {
        let f = started(test_config(1, 2)).await;
        f.coordinator
            .release("ghost", JobResult {
                success: false,
                ..Default::default()
            })
            .await;
        assert_eq!(f.coordinator.status().pool.total, 1);
    }
}
