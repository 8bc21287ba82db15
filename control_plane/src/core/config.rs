use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the control plane. Every knob has a default so
/// a bare `CoreConfig::default()` yields a runnable setup; the builder and the
/// daemon's environment loader override individual fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub pool: PoolSettings,
    pub container: ContainerSettings,
    pub scaler: ScalerSettings,
    pub prediction: PredictionSettings,
    pub cost: CostSettings,
    pub health: HealthSettings,
    pub monitor: MonitorSettings,
    pub state: StateSettings,
    pub optimizer: OptimizerSettings,
    pub persistence: PersistenceSettings,
    pub coordinator: CoordinatorSettings,
}

/// Population bounds for the container pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub target_size: usize,
    pub warmup_containers: usize,
    /// Upper bound on how long an acquisition waits for a scaling-induced
    /// container when no candidate is available.
    pub scale_wait: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 3,
            max_size: 20,
            target_size: 8,
            warmup_containers: 2,
            scale_wait: Duration::from_secs(5),
        }
    }
}

/// Defaults for the base container template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    pub base_image: String,
    pub memory: String,
    pub cpus: String,
    pub working_dir: String,
    pub network_mode: Option<String>,
    /// Grace period passed to the runtime on stop.
    pub stop_grace: Duration,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            base_image: "ubuntu:22.04".to_string(),
            memory: "2g".to_string(),
            cpus: "1.0".to_string(),
            working_dir: "/workspace".to_string(),
            network_mode: None,
            stop_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalerSettings {
    pub thresholds: ScaleThresholds,
    pub limits: ScaleLimits,
    pub timing: ScaleTiming,
}

/// Utilization trigger points, fractions in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleThresholds {
    pub scale_up: f64,
    pub scale_down: f64,
    pub critical: f64,
    pub emergency: f64,
}

impl Default for ScaleThresholds {
    fn default() -> Self {
        Self {
            scale_up: 0.80,
            scale_down: 0.30,
            critical: 0.95,
            emergency: 0.90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleLimits {
    pub max_up: usize,
    pub max_down: usize,
    pub max_concurrent: usize,
}

impl Default for ScaleLimits {
    fn default() -> Self {
        Self {
            max_up: 3,
            max_down: 2,
            max_concurrent: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleTiming {
    pub interval: Duration,
    pub up_cooldown: Duration,
    pub down_cooldown: Duration,
}

impl Default for ScaleTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            up_cooldown: Duration::from_secs(30),
            down_cooldown: Duration::from_secs(180),
        }
    }
}

/// Predictive scaling overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSettings {
    pub enable: bool,
    /// Smoothing factor applied to observed utilization.
    pub smoothing: f64,
    /// Smoothing factor for the trend component.
    pub trend_weight: f64,
    /// Below this many samples the prediction is the smoothed demand alone.
    pub min_data_points: u64,
}

impl Default for PredictionSettings {
    fn default() -> Self {
        Self {
            enable: true,
            smoothing: 0.3,
            trend_weight: 0.4,
            min_data_points: 5,
        }
    }
}

/// Cost-aware scaling overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSettings {
    pub enable: bool,
    /// Idle ratio (available / total) above which scale-downs are favored.
    pub idle_threshold: f64,
    /// Scheduled scale-down windows, hours of day in UTC.
    pub schedule: Vec<CostWindow>,
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            enable: true,
            idle_threshold: 0.8,
            schedule: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl CostWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour <= self.end_hour
        } else {
            // Window wraps past midnight.
            hour >= self.start_hour || hour <= self.end_hour
        }
    }
}

/// Per-container health bounds enforced on release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    pub check_interval: Duration,
    pub unhealthy_threshold: u64,
    pub idle_timeout: Duration,
    pub max_age: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            unhealthy_threshold: 3,
            idle_timeout: Duration::from_secs(300),
            max_age: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub thresholds: ResourceThresholds,
    pub alert_cooldown: Duration,
    pub alert_retention: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            thresholds: ResourceThresholds::default(),
            alert_cooldown: Duration::from_secs(300),
            alert_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceThresholds {
    pub cpu: ThresholdBand,
    pub memory: ThresholdBand,
    pub disk: ThresholdBand,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu: ThresholdBand {
                warning: 80.0,
                critical: 95.0,
                low: 20.0,
            },
            memory: ThresholdBand {
                warning: 85.0,
                critical: 95.0,
                low: 30.0,
            },
            disk: ThresholdBand {
                warning: 80.0,
                critical: 90.0,
                low: 40.0,
            },
        }
    }
}

/// Alert bands in percent of capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdBand {
    pub warning: f64,
    pub critical: f64,
    pub low: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSettings {
    pub validation: ValidationSettings,
    pub recovery: RecoverySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    pub enable: bool,
    pub interval: Duration,
    pub auto_correct: bool,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            enable: true,
            interval: Duration::from_secs(30),
            auto_correct: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    pub enable: bool,
    /// Delay before a recovery attempt, and the bound on start verification.
    pub timeout: Duration,
    pub max_attempts: u32,
    /// How long an unlabeled-in-state container may exist in the runtime
    /// before reconciliation adopts it.
    pub orphan_age: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enable: true,
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            orphan_age: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub enable: bool,
    pub max_reuse_count: u64,
    pub reuse_efficiency_threshold: f64,
    pub preemptive_threshold: f64,
    pub max_container_age: Duration,
    /// A job averaging this long scores zero on execution time.
    pub slow_job_threshold_ms: f64,
    pub weights: ScoreWeights,
    pub pattern_interval: Duration,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            enable: true,
            max_reuse_count: 100,
            reuse_efficiency_threshold: 0.85,
            preemptive_threshold: 0.7,
            max_container_age: Duration::from_secs(3600),
            slow_job_threshold_ms: 300_000.0,
            weights: ScoreWeights::default(),
            pattern_interval: Duration::from_secs(120),
        }
    }
}

/// Weights for the candidate scoring formula. Recency always contributes a
/// fixed 0.1 on top of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub env: f64,
    pub perf: f64,
    pub res: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            env: 0.4,
            perf: 0.3,
            res: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub redis_url: String,
    pub key_prefix: String,
    pub interval: Duration,
    /// How many trailing transitions each snapshot carries.
    pub keep_transitions: usize,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "runnerpool".to_string(),
            interval: Duration::from_secs(60),
            keep_transitions: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    pub health_interval: Duration,
    pub optimization_interval: Duration,
    pub auto_restart: bool,
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            optimization_interval: Duration::from_secs(300),
            auto_restart: true,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}
