use crate::core::config::{ContainerSettings, HealthSettings, PoolSettings};
use crate::core::events::{EventBus, PoolEvent};
use crate::core::optimizer::{JobFingerprint, JobRequirements};
use crate::core::runtime::ContainerRuntime;
use crate::core::state::{ContainerState, StateManager};
use crate::core::template::ContainerTemplate;
use crate::shared::error::{AcquireError, PoolError, PoolResult};
use crate::shared::utils::{random_container_name, unix_millis};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const CONTAINER_NAME_PREFIX: &str = "runnerpool";
const ACQUIRE_POLL: Duration = Duration::from_millis(100);
const CREATE_ATTEMPTS: u32 = 3;

/// Last observed resource usage of one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_limit: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub pid_count: u64,
}

impl ResourceSnapshot {
    pub fn memory_percent(&self) -> f64 {
        if self.memory_limit == 0 {
            return 0.0;
        }
        (self.memory_used as f64 / self.memory_limit as f64) * 100.0
    }
}

/// In-memory metadata for one managed container. Owned exclusively by the
/// pool; other components get cloned snapshots.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    pub template: String,
    pub created_at: Instant,
    pub created_at_ms: i64,
    pub started_at: Option<Instant>,
    pub last_used: Option<Instant>,
    pub job_count: u64,
    pub failure_count: u64,
    pub unhealthy_checks: u64,
    pub last_stats: Option<ResourceSnapshot>,
    pub memory_limit_bytes: i64,
    pub cpus: f64,
}

impl ContainerRecord {
    fn new(id: String, template: &ContainerTemplate) -> Self {
        Self {
            id,
            template: template.name.clone(),
            created_at: Instant::now(),
            created_at_ms: unix_millis(),
            started_at: None,
            last_used: None,
            job_count: 0,
            failure_count: 0,
            unhealthy_checks: 0,
            last_stats: None,
            memory_limit_bytes: template.memory_bytes,
            cpus: template.cpus,
        }
    }
}

/// What a selector sees about one available container.
#[derive(Debug, Clone)]
pub struct CandidateView {
    pub id: String,
    pub job_count: u64,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Container selection strategy, injected at construction. The default picks
/// the least-recently-used healthy container; the optimizer swaps in its
/// weighted scorer.
pub trait ContainerSelector: Send + Sync {
    fn select(&self, requirements: &JobRequirements, candidates: &[CandidateView])
        -> Option<String>;
}

pub struct LeastRecentlyUsedSelector;

impl ContainerSelector for LeastRecentlyUsedSelector {
    fn select(
        &self,
        _requirements: &JobRequirements,
        candidates: &[CandidateView],
    ) -> Option<String> {
        candidates
            .iter()
            .max_by_key(|candidate| candidate.idle_ms)
            .map(|candidate| candidate.id.clone())
    }
}

/// Capacity growth capability, injected at construction. The scaler
/// implements it; acquisitions call through it when the pool runs dry.
#[async_trait]
pub trait ScalingExecutor: Send + Sync {
    /// Ask for `count` additional containers. Returns how many creations were
    /// started, or a denial when budgets or cooldowns forbid growth.
    async fn request_growth(&self, count: usize) -> PoolResult<usize>;
}

/// Outcome of a finished job, reported on release.
#[derive(Debug, Clone, Default)]
pub struct JobResult {
    pub success: bool,
    pub duration_ms: u64,
    pub resource_usage: Option<ResourceSnapshot>,
    pub fingerprint: Option<JobFingerprint>,
}

/// Handle returned to the job-queue caller.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerHandle {
    pub id: String,
    pub started_at_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    pub warming: usize,
    pub in_flight: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// busy / total, 0 when the pool is empty.
    pub utilization: f64,
}

/// Owns the container population and its lifecycle. Partition membership is
/// only mutated under the per-container transition lock (through
/// `apply_partition`) or inside `remove`.
pub struct PoolManager {
    runtime: Arc<dyn ContainerRuntime>,
    state: Arc<StateManager>,
    bus: EventBus,
    pool_cfg: PoolSettings,
    container_cfg: ContainerSettings,
    health_cfg: HealthSettings,
    max_reuse_count: u64,
    templates: DashMap<String, ContainerTemplate>,
    records: DashMap<String, ContainerRecord>,
    available: DashSet<String>,
    busy: DashSet<String>,
    warming: DashSet<String>,
    selector: RwLock<Arc<dyn ContainerSelector>>,
    scaling: RwLock<Option<Arc<dyn ScalingExecutor>>>,
    availability: Notify,
    initialized: AtomicBool,
}

impl PoolManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        state: Arc<StateManager>,
        bus: EventBus,
        pool_cfg: PoolSettings,
        container_cfg: ContainerSettings,
        health_cfg: HealthSettings,
        max_reuse_count: u64,
    ) -> Self {
        Self {
            runtime,
            state,
            bus,
            pool_cfg,
            container_cfg,
            health_cfg,
            max_reuse_count,
            templates: DashMap::new(),
            records: DashMap::new(),
            available: DashSet::new(),
            busy: DashSet::new(),
            warming: DashSet::new(),
            selector: RwLock::new(Arc::new(LeastRecentlyUsedSelector)),
            scaling: RwLock::new(None),
            availability: Notify::new(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn set_selector(&self, selector: Arc<dyn ContainerSelector>) {
        *self.selector.write().unwrap() = selector;
    }

    pub fn set_scaling_executor(&self, executor: Arc<dyn ScalingExecutor>) {
        *self.scaling.write().unwrap() = Some(executor);
    }

    pub fn register_template(&self, template: ContainerTemplate) {
        info!(template = %template.name, image = %template.image, "registered template");
        self.templates.insert(template.name.clone(), template);
    }

    /// Validate the runtime, register the default template, and create the
    /// initial population. Fails only when not a single container could be
    /// created.
    pub async fn initialize(&self) -> PoolResult<()> {
        self.runtime.ping().await?;
        self.register_template(ContainerTemplate::base(&self.container_cfg));

        let created = self.create_batch("base", self.pool_cfg.min_size).await;
        if created == 0 && self.pool_cfg.min_size > 0 {
            return Err(PoolError::terminal(
                "pool initialization created zero containers",
            ));
        }

        let warmed = self
            .create_batch("base", self.pool_cfg.warmup_containers)
            .await;

        self.initialized.store(true, Ordering::SeqCst);
        info!(
            created,
            warmed,
            min_size = self.pool_cfg.min_size,
            "pool initialized"
        );
        Ok(())
    }

    async fn create_batch(&self, template: &str, count: usize) -> usize {
        let results = join_all((0..count).map(|_| self.create_container(template))).await;
        results
            .iter()
            .filter(|result| match result {
                Ok(_) => true,
                Err(e) => {
                    warn!("container creation failed: {e}");
                    false
                }
            })
            .count()
    }

    /// Create, start, and publish one container: create -> start -> setup
    /// commands (best-effort) -> available. The record sits in `warming`
    /// until it is published.
    pub async fn create_container(&self, template_name: &str) -> PoolResult<String> {
        if self.records.len() >= self.pool_cfg.max_size {
            return Err(PoolError::ScalingDenied(format!(
                "pool already at max size {}",
                self.pool_cfg.max_size
            )));
        }

        let template = self
            .templates
            .get(template_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PoolError::terminal(format!("unknown template: {template_name}")))?;

        let name = random_container_name(CONTAINER_NAME_PREFIX);
        // Transient runtime failures get a short backoff-and-retry; semantic
        // ones surface immediately.
        let id = {
            let mut attempt: u32 = 1;
            loop {
                match self.runtime.create(&template, &name).await {
                    Ok(id) => break id,
                    Err(e) if e.is_retryable() && attempt < CREATE_ATTEMPTS => {
                        warn!(attempt, "container create failed, retrying: {e}");
                        tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        self.state.track(&id, ContainerState::Initializing);
        self.records
            .insert(id.clone(), ContainerRecord::new(id.clone(), &template));
        self.warming.insert(id.clone());

        match self.bring_up(&id, &template).await {
            Ok(()) => {
                if let Some(mut record) = self.records.get_mut(&id) {
                    record.started_at = Some(Instant::now());
                }
                self.bus.publish(PoolEvent::ContainerCreated {
                    container_id: id.clone(),
                    template: template.name.clone(),
                    at_ms: unix_millis(),
                });
                info!(container_id = %id, template = %template.name, "container ready");
                Ok(id)
            }
            Err(e) => {
                warn!(container_id = %id, "container bring-up failed: {e}");
                let _ = self
                    .state
                    .force_transition(&id, ContainerState::Failed, "bring-up failed")
                    .await;
                self.remove(&id, "bring-up failed").await;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, id: &str, template: &ContainerTemplate) -> PoolResult<()> {
        self.state
            .transition(id, ContainerState::Created, "created")
            .await?;
        self.state
            .transition(id, ContainerState::Starting, "starting")
            .await?;
        self.runtime.start(id).await?;
        self.state
            .transition(id, ContainerState::Running, "running")
            .await?;

        // Setup failures are logged, not fatal.
        for command in &template.setup_commands {
            let argv = shell(command);
            match self.runtime.exec(id, &argv).await {
                Ok(output) if !output.success() => {
                    warn!(container_id = id, command, exit_code = output.exit_code, "setup command failed");
                }
                Err(e) => warn!(container_id = id, command, "setup command error: {e}"),
                _ => {}
            }
        }

        self.state
            .transition(id, ContainerState::Available, "published")
            .await?;
        Ok(())
    }

    /// Pick a container for the job, waiting briefly on scaling when the pool
    /// is dry. This is the only operation that surfaces errors to callers.
    pub async fn acquire(
        &self,
        requirements: &JobRequirements,
    ) -> Result<ContainerHandle, AcquireError> {
        let deadline = Instant::now() + self.pool_cfg.scale_wait;
        let mut growth_requested = false;
        let mut scaling_blocked: Option<String> = None;

        loop {
            let candidates = self.candidate_views();
            let chosen = {
                let selector = self.selector.read().unwrap().clone();
                selector.select(requirements, &candidates)
            };

            if let Some(id) = chosen {
                match self
                    .state
                    .transition(&id, ContainerState::Busy, "job assigned")
                    .await
                {
                    Ok(()) => {
                        if let Some(mut record) = self.records.get_mut(&id) {
                            record.last_used = Some(Instant::now());
                            record.job_count += 1;
                        }
                        self.bus.publish(PoolEvent::ContainerAssigned {
                            container_id: id.clone(),
                            job_type: requirements.job_type.clone(),
                            at_ms: unix_millis(),
                        });
                        debug!(container_id = %id, job_type = %requirements.job_type, "container assigned");
                        return Ok(ContainerHandle {
                            id,
                            started_at_ms: unix_millis(),
                        });
                    }
                    Err(e) => {
                        // The candidate raced into another state; try again.
                        debug!("assignment lost race: {e}");
                        tokio::task::yield_now().await;
                        continue;
                    }
                }
            }

            if !growth_requested {
                growth_requested = true;
                let executor = self.scaling.read().unwrap().clone();
                if let Some(executor) = executor {
                    if let Err(e) = executor.request_growth(1).await {
                        debug!("growth request denied: {e}");
                        scaling_blocked = Some(e.to_string());
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(match scaling_blocked {
                    Some(message) => AcquireError::ScalingBlocked(message),
                    None => AcquireError::NoCapacity(format!(
                        "no container became available within {:?}",
                        self.pool_cfg.scale_wait
                    )),
                });
            }
            let wait = (deadline - now).min(ACQUIRE_POLL);
            let _ = tokio::time::timeout(wait, self.availability.notified()).await;
        }
    }

    fn candidate_views(&self) -> Vec<CandidateView> {
        self.available
            .iter()
            .filter_map(|id| self.records.get(id.key()).map(|record| record.clone()))
            .filter(|record| self.is_healthy(record))
            .map(|record| {
                let stats = record.last_stats.clone().unwrap_or_default();
                CandidateView {
                    id: record.id.clone(),
                    job_count: record.job_count,
                    age_ms: record.created_at.elapsed().as_millis() as u64,
                    idle_ms: record
                        .last_used
                        .map(|used| used.elapsed().as_millis() as u64)
                        .unwrap_or(u64::MAX),
                    cpu_percent: stats.cpu_percent,
                    memory_percent: stats.memory_percent(),
                }
            })
            .collect()
    }

    fn is_healthy(&self, record: &ContainerRecord) -> bool {
        record.unhealthy_checks < self.health_cfg.unhealthy_threshold
            && record.failure_count < self.health_cfg.unhealthy_threshold
            && record.job_count < self.max_reuse_count
    }

    /// Return a container after a job. Never fails the caller: anything that
    /// goes wrong escalates into recycling.
    pub async fn release(&self, id: &str, result: &JobResult) {
        if !self.records.contains_key(id) {
            warn!(container_id = id, "release for unknown container ignored");
            return;
        }

        if !result.success {
            if let Some(mut record) = self.records.get_mut(id) {
                record.failure_count += 1;
            }
        }

        if let Some(reason) = self.recycle_reason(id) {
            info!(container_id = id, reason = %reason, "recycling on release");
            self.bus.publish(PoolEvent::ContainerReturned {
                container_id: id.to_string(),
                success: result.success,
                recycled: true,
                at_ms: unix_millis(),
            });
            self.recycle(id, &reason).await;
            return;
        }

        if let Err(e) = self.run_cleanup(id).await {
            warn!(container_id = id, "cleanup failed, recycling: {e}");
            self.bus.publish(PoolEvent::ContainerReturned {
                container_id: id.to_string(),
                success: result.success,
                recycled: true,
                at_ms: unix_millis(),
            });
            self.recycle(id, "cleanup failed").await;
            return;
        }

        if let Err(e) = self
            .state
            .transition(id, ContainerState::Available, "job complete")
            .await
        {
            warn!(container_id = id, "republish failed, removing: {e}");
            self.recycle(id, "republish failed").await;
            return;
        }

        if let Some(mut record) = self.records.get_mut(id) {
            record.last_used = Some(Instant::now());
        }
        self.bus.publish(PoolEvent::ContainerReturned {
            container_id: id.to_string(),
            success: result.success,
            recycled: false,
            at_ms: unix_millis(),
        });
        self.availability.notify_waiters();
    }

    /// Why this container should not serve another job, if any.
    fn recycle_reason(&self, id: &str) -> Option<String> {
        let record = self.records.get(id)?;
        if record.job_count >= self.max_reuse_count {
            return Some(format!("reuse cap reached ({} jobs)", record.job_count));
        }
        if record.created_at.elapsed() >= self.health_cfg.max_age {
            return Some("max container age reached".to_string());
        }
        if record.failure_count >= self.health_cfg.unhealthy_threshold
            || record.unhealthy_checks >= self.health_cfg.unhealthy_threshold
        {
            return Some("health threshold exceeded".to_string());
        }
        None
    }

    async fn run_cleanup(&self, id: &str) -> PoolResult<()> {
        let commands = self
            .records
            .get(id)
            .and_then(|record| self.templates.get(&record.template))
            .map(|template| template.cleanup_commands.clone())
            .unwrap_or_default();

        for command in &commands {
            let argv = shell(command);
            let output = self.runtime.exec(id, &argv).await?;
            if !output.success() {
                return Err(PoolError::transient(format!(
                    "cleanup command exited {}: {command}",
                    output.exit_code
                )));
            }
        }
        Ok(())
    }

    /// Drop a container from every set and from the runtime. Safe to call
    /// twice; the second call is a no-op.
    pub async fn remove(&self, id: &str, reason: &str) {
        self.available.remove(id);
        self.busy.remove(id);
        self.warming.remove(id);
        let existed = self.records.remove(id).is_some();

        let _ = self.runtime.stop(id, self.container_cfg.stop_grace).await;
        if let Err(e) = self.runtime.remove(id, true).await {
            warn!(container_id = id, "runtime removal failed: {e}");
        }
        self.state.untrack(id);

        if existed {
            info!(container_id = id, reason, "container removed");
            self.bus.publish(PoolEvent::ContainerRemoved {
                container_id: id.to_string(),
                reason: reason.to_string(),
                at_ms: unix_millis(),
            });
        }
    }

    /// Remove and, when the pool dropped below its minimum, create a
    /// replacement of the same template.
    pub async fn recycle(&self, id: &str, reason: &str) {
        let template = self
            .records
            .get(id)
            .map(|record| record.template.clone())
            .unwrap_or_else(|| "base".to_string());

        let _ = self
            .state
            .transition(id, ContainerState::Recycling, reason)
            .await;
        self.remove(id, reason).await;

        if self.initialized.load(Ordering::SeqCst) && self.records.len() < self.pool_cfg.min_size {
            info!(template = %template, "creating replacement container");
            if let Err(e) = self.create_container(&template).await {
                warn!("replacement creation failed: {e}");
            }
        }
    }

    /// Register a record for a container discovered in the runtime rather
    /// than created by us. Partition membership follows from its state.
    pub fn adopt(&self, id: &str) {
        if self.records.contains_key(id) {
            return;
        }
        let template = self
            .templates
            .get("base")
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| ContainerTemplate::base(&self.container_cfg));
        self.records
            .insert(id.to_string(), ContainerRecord::new(id.to_string(), &template));
        debug!(container_id = id, "adopted container record");
    }

    /// Partition bookkeeping, called from the state manager while it holds
    /// the per-container transition lock.
    pub fn apply_partition(&self, id: &str, state: ContainerState) {
        match state {
            ContainerState::Available => {
                self.busy.remove(id);
                self.warming.remove(id);
                self.available.insert(id.to_string());
                self.availability.notify_waiters();
            }
            ContainerState::Busy => {
                self.available.remove(id);
                self.warming.remove(id);
                self.busy.insert(id.to_string());
            }
            _ => {
                self.available.remove(id);
                self.busy.remove(id);
            }
        }
    }

    /// Scale-down victims: available containers only, oldest first, then most
    /// used, never cutting below the minimum size.
    pub fn scale_down_victims(&self, count: usize) -> Vec<String> {
        let headroom = self
            .records
            .len()
            .saturating_sub(self.pool_cfg.min_size)
            .min(count);
        if headroom == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<ContainerRecord> = self
            .available
            .iter()
            .filter_map(|id| self.records.get(id.key()).map(|record| record.clone()))
            .collect();
        candidates.sort_by(|a, b| {
            b.created_at
                .elapsed()
                .cmp(&a.created_at.elapsed())
                .then(b.job_count.cmp(&a.job_count))
        });
        candidates
            .into_iter()
            .take(headroom)
            .map(|record| record.id)
            .collect()
    }

    /// Containers idle past the configured timeout, for the cost overlay.
    pub fn idle_count(&self) -> usize {
        self.available
            .iter()
            .filter_map(|id| self.records.get(id.key()).map(|record| record.clone()))
            .filter(|record| {
                record
                    .last_used
                    .map(|used| used.elapsed() >= self.health_cfg.idle_timeout)
                    .unwrap_or(true)
            })
            .count()
    }

    pub fn status(&self) -> PoolStatus {
        let total = self.records.len();
        let available = self.available.len();
        let busy = self.busy.len();
        let warming = self.warming.len();
        PoolStatus {
            total,
            available,
            busy,
            warming,
            in_flight: total.saturating_sub(available + busy + warming),
            min_size: self.pool_cfg.min_size,
            max_size: self.pool_cfg.max_size,
            utilization: if total == 0 {
                0.0
            } else {
                busy as f64 / total as f64
            },
        }
    }

    pub fn record(&self, id: &str) -> Option<ContainerRecord> {
        self.records.get(id).map(|record| record.clone())
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Update the cached resource snapshot; the monitor calls this every
    /// sampling interval.
    pub fn update_stats(&self, id: &str, snapshot: ResourceSnapshot) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.last_stats = Some(snapshot);
        }
    }

    pub fn mark_unhealthy_check(&self, id: &str) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.unhealthy_checks += 1;
        }
    }

    /// Force-remove everything. Used by emergency stop only.
    pub async fn clear_all(&self) {
        let ids = self.container_ids();
        for id in &ids {
            let _ = self.runtime.remove(id, true).await;
            self.state.untrack(id);
        }
        self.records.clear();
        self.available.clear();
        self.busy.clear();
        self.warming.clear();
        warn!(removed = ids.len(), "pool cleared by emergency stop");
    }
}

fn shell(command: &str) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        command.to_string(),
    ]
}
