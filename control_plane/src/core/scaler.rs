use crate::core::config::{CostSettings, PredictionSettings, ScalerSettings};
use crate::core::events::{EventBus, PoolEvent, ScalingDirection};
use crate::core::pool::{PoolManager, PoolStatus, ScalingExecutor};
use crate::shared::error::{PoolError, PoolResult};
use crate::shared::utils::{hour_of_day, unix_millis};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BUSINESS_HOURS: std::ops::RangeInclusive<u32> = 9..=17;

/// External queue-depth source feeding pending demand into utilization. The
/// built-in implementation reports an empty queue; the queue collaborator
/// replaces it.
pub trait QueueDepth: Send + Sync {
    fn depth(&self) -> usize;
}

pub struct ZeroQueueDepth;

impl QueueDepth for ZeroQueueDepth {
    fn depth(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "count")]
pub enum ScalingAction {
    None,
    ScaleUp(usize),
    ScaleDown(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingPriority {
    Normal,
    Emergency,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub priority: ScalingPriority,
    pub confidence: f64,
    pub reason: String,
    pub at_ms: i64,
}

impl ScalingDecision {
    fn none(reason: impl Into<String>) -> Self {
        Self {
            action: ScalingAction::None,
            priority: ScalingPriority::Normal,
            confidence: 0.0,
            reason: reason.into(),
            at_ms: unix_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScalerStatus {
    pub started: bool,
    pub operations_in_progress: usize,
    pub smoothed_demand: f64,
    pub trend: f64,
    pub samples: u64,
    pub consecutive_ups: u32,
    pub consecutive_downs: u32,
    pub up_cooldown_remaining_ms: u64,
    pub down_cooldown_remaining_ms: u64,
    pub last_decision: Option<ScalingDecision>,
}

#[derive(Default)]
struct ScalerInner {
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
    consecutive_ups: u32,
    consecutive_downs: u32,
    demand: f64,
    trend: f64,
    samples: u64,
    last_decision: Option<ScalingDecision>,
}

/// Interval-driven pool sizing: utilization thresholds, trend prediction, and
/// cost pressure folded into one decision per tick.
pub struct DynamicScaler {
    pool: Weak<PoolManager>,
    settings: ScalerSettings,
    prediction: PredictionSettings,
    cost: CostSettings,
    bus: EventBus,
    queue: Arc<dyn QueueDepth>,
    inner: Mutex<ScalerInner>,
    semaphore: Arc<Semaphore>,
    in_progress: Arc<AtomicUsize>,
    cancel: Mutex<CancellationToken>,
    started: AtomicBool,
}

impl DynamicScaler {
    pub fn new(
        pool: Weak<PoolManager>,
        settings: ScalerSettings,
        prediction: PredictionSettings,
        cost: CostSettings,
        bus: EventBus,
        queue: Arc<dyn QueueDepth>,
    ) -> Self {
        let max_concurrent = settings.limits.max_concurrent.max(1);
        Self {
            pool,
            settings,
            prediction,
            cost,
            bus,
            queue,
            inner: Mutex::new(ScalerInner::default()),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            in_progress: Arc::new(AtomicUsize::new(0)),
            cancel: Mutex::new(CancellationToken::new()),
            started: AtomicBool::new(false),
        }
    }

    /// One decision from the current pool status. Pure bookkeeping aside from
    /// the smoothing state, so it is directly testable.
    pub fn evaluate(&self, status: &PoolStatus, hour: u32) -> ScalingDecision {
        let total = status.total;
        let limits = &self.settings.limits;
        let thresholds = &self.settings.thresholds;

        // Queued jobs the pool has not seen yet count as demand.
        let util = if total == 0 {
            0.0
        } else {
            (status.utilization + self.queue.depth() as f64 / total as f64).min(1.0)
        };

        let mut inner = self.inner.lock().unwrap();
        let prediction = if self.prediction.enable {
            Some(self.update_prediction(&mut inner, util, hour))
        } else {
            None
        };

        let headroom = status.max_size.saturating_sub(total);
        let min_size = status.min_size;

        // Critical pressure overrides cooldowns and per-interval caps.
        if util >= thresholds.critical {
            let count = (2 * limits.max_up).min(headroom);
            let decision = if count == 0 {
                ScalingDecision::none("critical utilization but pool at max size")
            } else {
                ScalingDecision {
                    action: ScalingAction::ScaleUp(count),
                    priority: ScalingPriority::Emergency,
                    confidence: 1.0,
                    reason: format!("critical utilization {util:.2}"),
                    at_ms: unix_millis(),
                }
            };
            Self::note_decision(&mut inner, &decision);
            return decision;
        }

        // Neither direction may act while either cooldown is running.
        if let Some(last) = inner.last_scale_up {
            if last.elapsed() < self.settings.timing.up_cooldown {
                let decision = ScalingDecision::none("scale-up cooldown active");
                inner.last_decision = Some(decision.clone());
                return decision;
            }
        }
        if let Some(last) = inner.last_scale_down {
            if last.elapsed() < self.settings.timing.down_cooldown {
                let decision = ScalingDecision::none("scale-down cooldown active");
                inner.last_decision = Some(decision.clone());
                return decision;
            }
        }

        let mut decision = if util > thresholds.scale_up && headroom > 0 {
            let base = ((util - thresholds.scale_up) * total as f64).ceil() as usize;
            let mut count = base.max(1).min(limits.max_up);
            if inner.consecutive_ups >= 3 {
                // Sustained pressure: lean in harder, still capped.
                count = ((count as f64 * 1.5).ceil() as usize).min(limits.max_up);
            }
            count = count.min(headroom);
            ScalingDecision {
                action: ScalingAction::ScaleUp(count),
                priority: if util >= thresholds.emergency {
                    ScalingPriority::Emergency
                } else {
                    ScalingPriority::Normal
                },
                confidence: (util / thresholds.scale_up).min(1.0),
                reason: format!("utilization {util:.2} above scale-up threshold"),
                at_ms: unix_millis(),
            }
        } else if util <= thresholds.scale_down && total > min_size {
            let target_mid = (thresholds.scale_up + thresholds.scale_down) / 2.0;
            let excess = ((target_mid - util) * total as f64).ceil() as usize;
            let mut count = excess.max(1).min(limits.max_down);
            if inner.consecutive_downs >= 4 {
                // Safety brake after a long shrink streak.
                count = ((count as f64 * 0.7).floor() as usize).max(1);
            }
            count = count.min(total - min_size);
            ScalingDecision {
                action: ScalingAction::ScaleDown(count),
                priority: ScalingPriority::Normal,
                confidence: ((thresholds.scale_down - util) / thresholds.scale_down)
                    .clamp(0.3, 1.0),
                reason: format!("utilization {util:.2} below scale-down threshold"),
                at_ms: unix_millis(),
            }
        } else {
            ScalingDecision::none(format!("utilization {util:.2} within band"))
        };

        if let Some(predicted) = prediction {
            decision = self.apply_prediction(decision, predicted, util, headroom);
        }
        if self.cost.enable {
            decision = self.apply_cost(decision, status, hour);
        }

        Self::note_decision(&mut inner, &decision);
        decision
    }

    /// Exponentially smoothed demand with a double-smoothed trend. Below the
    /// minimum sample count the raw smoothed demand is returned, without
    /// extrapolation.
    fn update_prediction(&self, inner: &mut ScalerInner, util: f64, hour: u32) -> f64 {
        let alpha = self.prediction.smoothing;
        let beta = self.prediction.trend_weight;

        if inner.samples == 0 {
            inner.demand = util;
            inner.trend = 0.0;
        } else {
            let previous = inner.demand;
            inner.demand = alpha * util + (1.0 - alpha) * previous;
            inner.trend = beta * (inner.demand - previous) + (1.0 - beta) * inner.trend;
        }
        inner.samples += 1;

        if inner.samples < self.prediction.min_data_points {
            return inner.demand;
        }
        (inner.demand + inner.trend).clamp(0.0, 1.0) * seasonal_factor(hour)
    }

    fn apply_prediction(
        &self,
        decision: ScalingDecision,
        predicted: f64,
        util: f64,
        headroom: usize,
    ) -> ScalingDecision {
        match decision.action {
            ScalingAction::ScaleUp(count) if predicted < 0.8 * util => {
                let reduced = ((count as f64 * 0.7).floor() as usize).max(1);
                debug!(predicted, util, count, reduced, "prediction trimmed scale-up");
                ScalingDecision {
                    action: ScalingAction::ScaleUp(reduced),
                    reason: format!("{} (trimmed by falling prediction)", decision.reason),
                    ..decision
                }
            }
            ScalingAction::None if util > 0.0 && predicted > 1.3 * util && headroom > 0 => {
                ScalingDecision {
                    action: ScalingAction::ScaleUp(1),
                    priority: ScalingPriority::Normal,
                    confidence: predicted.min(1.0),
                    reason: format!("predicted demand {predicted:.2} ahead of utilization {util:.2}"),
                    at_ms: decision.at_ms,
                }
            }
            ScalingAction::ScaleDown(_) if predicted > 1.1 * util => {
                ScalingDecision::none(format!(
                    "scale-down suppressed by predicted demand {predicted:.2}"
                ))
            }
            _ => decision,
        }
    }

    fn apply_cost(
        &self,
        decision: ScalingDecision,
        status: &PoolStatus,
        hour: u32,
    ) -> ScalingDecision {
        let idle_ratio = if status.total == 0 {
            0.0
        } else {
            status.available as f64 / status.total as f64
        };
        let window_active = self.cost.schedule.iter().any(|window| window.contains(hour));

        match decision.action {
            ScalingAction::ScaleUp(count) if idle_ratio > self.cost.idle_threshold => {
                let shrunk = count.saturating_sub(1);
                if shrunk == 0 {
                    ScalingDecision::none(format!(
                        "scale-up dropped, idle ratio {idle_ratio:.2} above threshold"
                    ))
                } else {
                    ScalingDecision {
                        action: ScalingAction::ScaleUp(shrunk),
                        reason: format!("{} (shrunk by idle cost pressure)", decision.reason),
                        ..decision
                    }
                }
            }
            ScalingAction::ScaleDown(count)
                if idle_ratio > self.cost.idle_threshold || window_active =>
            {
                let grown = (count + 1)
                    .min(self.settings.limits.max_down)
                    .min(status.total.saturating_sub(status.min_size));
                ScalingDecision {
                    action: ScalingAction::ScaleDown(grown.max(count)),
                    reason: format!("{} (grown by cost pressure)", decision.reason),
                    ..decision
                }
            }
            _ => decision,
        }
    }

    fn note_decision(inner: &mut ScalerInner, decision: &ScalingDecision) {
        match decision.action {
            ScalingAction::ScaleUp(_) => {
                inner.consecutive_ups += 1;
                inner.consecutive_downs = 0;
            }
            ScalingAction::ScaleDown(_) => {
                inner.consecutive_downs += 1;
                inner.consecutive_ups = 0;
            }
            ScalingAction::None => {
                inner.consecutive_ups = 0;
                inner.consecutive_downs = 0;
            }
        }
        inner.last_decision = Some(decision.clone());
    }

    /// Execute a decision. Individual container failures are tallied; one
    /// failure never aborts the batch.
    pub async fn execute(&self, decision: &ScalingDecision) {
        match decision.action {
            ScalingAction::None => {}
            ScalingAction::ScaleUp(count) => self.scale_up(count).await,
            ScalingAction::ScaleDown(count) => self.scale_down(count).await,
        }
    }

    async fn scale_up(&self, count: usize) {
        let pool = match self.pool.upgrade() {
            Some(pool) => pool,
            None => return,
        };

        info!(count, "scaling up");
        let tasks = (0..count).map(|_| {
            let pool = pool.clone();
            let semaphore = self.semaphore.clone();
            let gauge = self.in_progress.clone();
            async move {
                let _permit = semaphore.acquire().await;
                gauge.fetch_add(1, Ordering::SeqCst);
                let result = pool.create_container("base").await;
                gauge.fetch_sub(1, Ordering::SeqCst);
                result
            }
        });
        let results = join_all(tasks).await;
        let succeeded = results.iter().filter(|result| result.is_ok()).count();

        self.inner.lock().unwrap().last_scale_up = Some(Instant::now());
        if succeeded == 0 && count > 0 {
            let error = results
                .into_iter()
                .filter_map(|result| result.err())
                .map(|e| e.to_string())
                .next()
                .unwrap_or_else(|| "unknown".to_string());
            warn!(count, "scale-up produced no containers: {error}");
            self.bus.publish(PoolEvent::ScalingFailed {
                direction: ScalingDirection::Up,
                requested: count,
                error,
                at_ms: unix_millis(),
            });
        } else {
            self.bus.publish(PoolEvent::ScalingCompleted {
                direction: ScalingDirection::Up,
                requested: count,
                succeeded,
                at_ms: unix_millis(),
            });
        }
    }

    async fn scale_down(&self, count: usize) {
        let pool = match self.pool.upgrade() {
            Some(pool) => pool,
            None => return,
        };

        let victims = pool.scale_down_victims(count);
        info!(requested = count, victims = victims.len(), "scaling down");
        let mut succeeded = 0;
        for victim in &victims {
            self.in_progress.fetch_add(1, Ordering::SeqCst);
            pool.recycle(victim, "scale-down").await;
            self.in_progress.fetch_sub(1, Ordering::SeqCst);
            succeeded += 1;
        }

        self.inner.lock().unwrap().last_scale_down = Some(Instant::now());
        self.bus.publish(PoolEvent::ScalingCompleted {
            direction: ScalingDirection::Down,
            requested: count,
            succeeded,
            at_ms: unix_millis(),
        });
    }

    /// One tick: read pool status, decide, act.
    pub async fn run_once(&self) {
        let status = match self.pool.upgrade() {
            Some(pool) => pool.status(),
            None => return,
        };
        let decision = self.evaluate(&status, hour_of_day());
        if decision.action != ScalingAction::None {
            info!(
                reason = %decision.reason,
                confidence = decision.confidence,
                "scaling decision"
            );
            self.execute(&decision).await;
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let scaler = self.clone();
        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();
        let interval = self.settings.timing.interval;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scaler.run_once().await,
                    _ = cancel.cancelled() => {
                        debug!("scaler loop stopped");
                        break;
                    }
                }
            }
        });
        info!(interval = ?interval, "scaler started");
    }

    pub fn stop(&self) {
        self.cancel.lock().unwrap().cancel();
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn operations_in_progress(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ScalerStatus {
        let inner = self.inner.lock().unwrap();
        let up_remaining = inner
            .last_scale_up
            .map(|last| {
                self.settings
                    .timing
                    .up_cooldown
                    .saturating_sub(last.elapsed())
            })
            .unwrap_or(Duration::ZERO);
        let down_remaining = inner
            .last_scale_down
            .map(|last| {
                self.settings
                    .timing
                    .down_cooldown
                    .saturating_sub(last.elapsed())
            })
            .unwrap_or(Duration::ZERO);

        ScalerStatus {
            started: self.is_started(),
            operations_in_progress: self.operations_in_progress(),
            smoothed_demand: inner.demand,
            trend: inner.trend,
            samples: inner.samples,
            consecutive_ups: inner.consecutive_ups,
            consecutive_downs: inner.consecutive_downs,
            up_cooldown_remaining_ms: up_remaining.as_millis() as u64,
            down_cooldown_remaining_ms: down_remaining.as_millis() as u64,
            last_decision: inner.last_decision.clone(),
        }
    }
}

/// Demand runs hotter in business hours.
fn seasonal_factor(hour: u32) -> f64 {
    if BUSINESS_HOURS.contains(&hour) {
        1.2
    } else {
        0.8
    }
}

/// The pool calls through this when an acquisition finds no candidate:
/// demand-driven growth, still subject to scaling budgets and cooldowns.
#[async_trait]
impl ScalingExecutor for DynamicScaler {
    async fn request_growth(&self, count: usize) -> PoolResult<usize> {
        let pool = self
            .pool
            .upgrade()
            .ok_or_else(|| PoolError::ShuttingDown)?;

        if self.in_progress.load(Ordering::SeqCst) + count > self.settings.limits.max_concurrent {
            return Err(PoolError::ScalingDenied(
                "concurrent scaling limit reached".to_string(),
            ));
        }
        {
            let inner = self.inner.lock().unwrap();
            if let Some(last) = inner.last_scale_up {
                if last.elapsed() < self.settings.timing.up_cooldown {
                    return Err(PoolError::ScalingDenied("scale-up cooldown active".to_string()));
                }
            }
        }
        if pool.status().total + count > pool.status().max_size {
            return Err(PoolError::ScalingDenied("pool at max size".to_string()));
        }

        self.inner.lock().unwrap().last_scale_up = Some(Instant::now());
        for _ in 0..count {
            let pool = pool.clone();
            let semaphore = self.semaphore.clone();
            let gauge = self.in_progress.clone();
            let bus = self.bus.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                gauge.fetch_add(1, Ordering::SeqCst);
                let result = pool.create_container("base").await;
                gauge.fetch_sub(1, Ordering::SeqCst);
                match result {
                    Ok(_) => bus.publish(PoolEvent::ScalingCompleted {
                        direction: ScalingDirection::Up,
                        requested: 1,
                        succeeded: 1,
                        at_ms: unix_millis(),
                    }),
                    Err(e) => bus.publish(PoolEvent::ScalingFailed {
                        direction: ScalingDirection::Up,
                        requested: 1,
                        error: e.to_string(),
                        at_ms: unix_millis(),
                    }),
                }
            });
        }
        debug!(count, "demand-driven growth started");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        ContainerSettings, CostWindow, HealthSettings, PoolSettings, StateSettings,
    };
    use crate::core::events::EventBus;
    use crate::core::state::StateManager;
    use crate::core::test_utils::InMemoryRuntime;

    const OFF_HOURS: u32 = 3;
    const BUSINESS: u32 = 12;

    struct Fixture {
        scaler: Arc<DynamicScaler>,
        pool: Arc<PoolManager>,
    }

    async fn fixture_with(
        min: usize,
        max: usize,
        settings: ScalerSettings,
        prediction: PredictionSettings,
        cost: CostSettings,
    ) -> Fixture {
        let runtime = Arc::new(InMemoryRuntime::new());
        let (bus, _rx) = EventBus::channel();
        let mut state_settings = StateSettings::default();
        state_settings.recovery.enable = false;
        let state = Arc::new(StateManager::new(
            runtime.clone(),
            bus.clone(),
            state_settings,
        ));
        let pool = Arc::new(PoolManager::new(
            runtime,
            state.clone(),
            bus.clone(),
            PoolSettings {
                min_size: min,
                max_size: max,
                target_size: min,
                warmup_containers: 0,
                scale_wait: Duration::from_millis(100),
            },
            ContainerSettings::default(),
            HealthSettings::default(),
            100,
        ));
        state.attach_pool(Arc::downgrade(&pool));
        pool.initialize().await.unwrap();

        let scaler = Arc::new(DynamicScaler::new(
            Arc::downgrade(&pool),
            settings,
            prediction,
            cost,
            bus,
            Arc::new(ZeroQueueDepth),
        ));
        Fixture { scaler, pool }
    }

    async fn fixture(min: usize, max: usize) -> Fixture {
        let mut prediction = PredictionSettings::default();
        prediction.enable = false;
        let mut cost = CostSettings::default();
        cost.enable = false;
        fixture_with(min, max, ScalerSettings::default(), prediction, cost).await
    }

    fn status(total: usize, busy: usize, min: usize, max: usize) -> PoolStatus {
        PoolStatus {
            total,
            available: total - busy,
            busy,
            warming: 0,
            in_flight: 0,
            min_size: min,
            max_size: max,
            utilization: if total == 0 {
                0.0
            } else {
                busy as f64 / total as f64
            },
        }
    }

    #[tokio::test]
    async fn test_exact_scale_up_threshold_does_not_trigger() {
        let f = fixture(3, 20).await;
        // 4 busy of 5 is exactly 0.80.
        let decision = f.scaler.evaluate(&status(5, 4, 3, 20), OFF_HOURS);
        assert_eq!(decision.action, ScalingAction::None);
    }

    #[tokio::test]
    async fn test_above_threshold_scales_up() {
        let f = fixture(3, 20).await;
        let decision = f.scaler.evaluate(&status(10, 9, 3, 20), OFF_HOURS);
        match decision.action {
            ScalingAction::ScaleUp(count) => {
                assert_eq!(count, 1);
                assert_eq!(decision.priority, ScalingPriority::Emergency); // 0.9 >= emergency
                assert!((decision.confidence - 1.0).abs() < 1e-9);
            }
            other => panic!("expected scale-up, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_critical_utilization_takes_emergency_path() {
        let f = fixture(3, 6).await;
        // Exactly at the critical threshold the emergency path is taken:
        // 3 of 3 busy is 1.0; use a synthetic 0.95 too.
        let decision = f.scaler.evaluate(&status(3, 3, 3, 6), OFF_HOURS);
        match decision.action {
            ScalingAction::ScaleUp(count) => {
                // min(2 * max_up, max - total) = min(6, 3).
                assert_eq!(count, 3);
                assert_eq!(decision.priority, ScalingPriority::Emergency);
                assert_eq!(decision.confidence, 1.0);
            }
            other => panic!("expected emergency scale-up, got {other:?}"),
        }

        let mut exactly_critical = status(20, 19, 3, 40);
        exactly_critical.utilization = 0.95;
        let decision = f.scaler.evaluate(&exactly_critical, OFF_HOURS);
        assert!(matches!(decision.action, ScalingAction::ScaleUp(_)));
        assert_eq!(decision.priority, ScalingPriority::Emergency);
    }

    #[tokio::test]
    async fn test_no_scale_up_at_max_size() {
        let f = fixture(3, 6).await;
        let decision = f.scaler.evaluate(&status(6, 6, 3, 6), OFF_HOURS);
        assert_eq!(decision.action, ScalingAction::None);
    }

    #[tokio::test]
    async fn test_no_scale_down_at_min_size() {
        let f = fixture(3, 6).await;
        let decision = f.scaler.evaluate(&status(3, 0, 3, 6), OFF_HOURS);
        assert_eq!(decision.action, ScalingAction::None);
    }

    #[tokio::test]
    async fn test_scale_down_capped_by_limit() {
        let f = fixture(3, 20).await;
        let decision = f.scaler.evaluate(&status(10, 2, 3, 20), OFF_HOURS);
        match decision.action {
            ScalingAction::ScaleDown(count) => {
                assert!(count <= f.scaler.settings.limits.max_down);
                assert_eq!(count, 2);
            }
            other => panic!("expected scale-down, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scale_up_capped_by_limit() {
        let f = fixture(3, 40).await;
        // util 0.95 would be critical; use 0.94: base = ceil(0.14 * 20) = 3.
        let mut high = status(20, 19, 3, 40);
        high.utilization = 0.94;
        let decision = f.scaler.evaluate(&high, OFF_HOURS);
        match decision.action {
            ScalingAction::ScaleUp(count) => assert_eq!(count, 3),
            other => panic!("expected scale-up, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_consecutive_scale_ups_accelerate() {
        let f = fixture(3, 40).await;
        let high = status(10, 9, 3, 40);
        for _ in 0..3 {
            let decision = f.scaler.evaluate(&high, OFF_HOURS);
            assert!(matches!(decision.action, ScalingAction::ScaleUp(1)));
        }
        // Fourth consecutive: 1 * 1.5 rounded up = 2.
        let decision = f.scaler.evaluate(&high, OFF_HOURS);
        assert!(matches!(decision.action, ScalingAction::ScaleUp(2)));
    }

    #[tokio::test]
    async fn test_cooldown_blocks_both_directions() {
        let f = fixture(3, 20).await;
        f.scaler.inner.lock().unwrap().last_scale_up = Some(Instant::now());

        let up = f.scaler.evaluate(&status(10, 9, 3, 20), OFF_HOURS);
        assert_eq!(up.action, ScalingAction::None);
        assert!(up.reason.contains("cooldown"));

        let down = f.scaler.evaluate(&status(10, 1, 3, 20), OFF_HOURS);
        assert_eq!(down.action, ScalingAction::None);
    }

    #[tokio::test]
    async fn test_critical_ignores_cooldown() {
        let f = fixture(3, 20).await;
        f.scaler.inner.lock().unwrap().last_scale_up = Some(Instant::now());

        let decision = f.scaler.evaluate(&status(10, 10, 3, 20), OFF_HOURS);
        assert!(matches!(decision.action, ScalingAction::ScaleUp(_)));
        assert_eq!(decision.priority, ScalingPriority::Emergency);
    }

    #[tokio::test]
    async fn test_execute_scale_up_creates_containers() {
        let f = fixture(3, 6).await;
        let decision = f.scaler.evaluate(&status(3, 3, 3, 6), OFF_HOURS);
        f.scaler.execute(&decision).await;

        assert_eq!(f.pool.status().total, 6);
        // Cooldown stamped by execution.
        let follow_up = f.scaler.evaluate(&status(6, 5, 3, 6), OFF_HOURS);
        assert_eq!(follow_up.action, ScalingAction::None);
    }

    #[tokio::test]
    async fn test_execute_scale_down_removes_available_only() {
        let f = fixture(2, 10).await;
        for _ in 0..3 {
            f.pool.create_container("base").await.unwrap();
        }
        assert_eq!(f.pool.status().total, 5);

        let decision = f.scaler.evaluate(&status(5, 0, 2, 10), OFF_HOURS);
        assert!(matches!(decision.action, ScalingAction::ScaleDown(2)));
        f.scaler.execute(&decision).await;

        let status = f.pool.status();
        assert_eq!(status.total, 3);
        assert_eq!(status.busy, 0);
    }

    #[tokio::test]
    async fn test_prediction_below_min_points_returns_smoothed_demand() {
        let mut prediction = PredictionSettings::default();
        prediction.min_data_points = 5;
        let mut cost = CostSettings::default();
        cost.enable = false;
        let f = fixture_with(3, 20, ScalerSettings::default(), prediction, cost).await;

        let mut inner = f.scaler.inner.lock().unwrap();
        // Two samples only: no trend extrapolation, no seasonal factor.
        let first = f.scaler.update_prediction(&mut inner, 0.6, BUSINESS);
        assert!((first - 0.6).abs() < 1e-9);
        let second = f.scaler.update_prediction(&mut inner, 1.0, BUSINESS);
        assert!((second - (0.3 + 0.42)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_preemptive_scale_up_from_prediction() {
        let prediction = PredictionSettings::default();
        let mut cost = CostSettings::default();
        cost.enable = false;
        let f = fixture_with(3, 20, ScalerSettings::default(), prediction, cost).await;

        // Establish high smoothed demand; 0.8 sits exactly on the threshold
        // so each decision is a within-band none.
        for _ in 0..8 {
            f.scaler.evaluate(&status(10, 8, 3, 20), BUSINESS);
        }
        // Load drops but the prediction still points up: preemptive growth.
        let decision = f.scaler.evaluate(&status(10, 5, 3, 20), BUSINESS);
        assert!(matches!(decision.action, ScalingAction::ScaleUp(1)));
        assert!(decision.reason.contains("predicted"));
    }

    #[tokio::test]
    async fn test_prediction_suppresses_scale_down() {
        let prediction = PredictionSettings::default();
        let mut cost = CostSettings::default();
        cost.enable = false;
        let f = fixture_with(3, 20, ScalerSettings::default(), prediction, cost).await;

        for _ in 0..8 {
            f.scaler.evaluate(&status(10, 8, 3, 20), BUSINESS);
        }
        let decision = f.scaler.evaluate(&status(10, 2, 3, 20), BUSINESS);
        assert_eq!(decision.action, ScalingAction::None);
        assert!(decision.reason.contains("suppressed"));
    }

    #[tokio::test]
    async fn test_prediction_trims_scale_up() {
        let prediction = PredictionSettings::default();
        let mut cost = CostSettings::default();
        cost.enable = false;
        let f = fixture_with(3, 40, ScalerSettings::default(), prediction, cost).await;

        // Establish a low-demand history.
        for _ in 0..8 {
            f.scaler.evaluate(&status(20, 2, 3, 40), OFF_HOURS);
        }
        // A sudden spike scales up, but the cold prediction trims the count:
        // base ceil(0.1 * 20) = 2, trimmed to 1.
        let mut spike = status(20, 18, 3, 40);
        spike.utilization = 0.90;
        let decision = f.scaler.evaluate(&spike, OFF_HOURS);
        assert!(matches!(decision.action, ScalingAction::ScaleUp(1)));
        assert!(decision.reason.contains("trimmed"));
    }

    #[tokio::test]
    async fn test_cost_window_grows_scale_down() {
        let mut prediction = PredictionSettings::default();
        prediction.enable = false;
        let mut cost = CostSettings::default();
        cost.schedule = vec![CostWindow {
            start_hour: 0,
            end_hour: 23,
        }];
        let mut settings = ScalerSettings::default();
        settings.limits.max_down = 5;
        let f = fixture_with(3, 20, settings, prediction, cost).await;

        // excess = ceil((0.55 - 0.2) * 10) = 4, grown to 5 by the window.
        let decision = f.scaler.evaluate(&status(10, 2, 3, 20), OFF_HOURS);
        assert!(matches!(decision.action, ScalingAction::ScaleDown(5)));
        assert!(decision.reason.contains("cost"));
    }

    #[tokio::test]
    async fn test_idle_pressure_drops_small_scale_up() {
        let mut prediction = PredictionSettings::default();
        prediction.enable = false;
        let cost = CostSettings::default();
        let f = fixture_with(3, 40, ScalerSettings::default(), prediction, cost).await;

        // Synthetic: utilization above threshold but the pool mostly idle.
        let mut odd = status(20, 2, 3, 40);
        odd.utilization = 0.85;
        let decision = f.scaler.evaluate(&odd, OFF_HOURS);
        assert_eq!(decision.action, ScalingAction::None);
        assert!(decision.reason.contains("idle"));
    }

    #[tokio::test]
    async fn test_request_growth_respects_cooldown() {
        let f = fixture(1, 6).await;

        let granted = f.scaler.request_growth(1).await.unwrap();
        assert_eq!(granted, 1);

        let denied = f.scaler.request_growth(1).await.unwrap_err();
        assert!(matches!(denied, PoolError::ScalingDenied(_)));
    }

    #[tokio::test]
    async fn test_seasonal_factor() {
        assert_eq!(seasonal_factor(12), 1.2);
        assert_eq!(seasonal_factor(3), 0.8);
        assert_eq!(seasonal_factor(9), 1.2);
        assert_eq!(seasonal_factor(18), 0.8);
    }
}
