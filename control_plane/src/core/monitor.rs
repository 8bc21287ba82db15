use crate::core::config::{MonitorSettings, ThresholdBand};
use crate::core::events::{EventBus, PoolEvent};
use crate::core::pool::{PoolManager, PoolStatus, ResourceSnapshot};
use crate::core::runtime::{ContainerRuntime, RuntimeStats};
use crate::shared::utils::{mean, ols_slope, percentile, std_dev, unix_millis};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SERIES_CAP: usize = 1000;
const ANOMALY_MIN_POINTS: usize = 20;
const ANOMALY_Z: f64 = 2.5;
const ANOMALY_Z_HIGH: f64 = 3.0;
const PREDICTION_MIN_POINTS: usize = 10;
const PREDICTION_WINDOW: usize = 10;

pub const SYSTEM_CPU: &str = "system.cpu";
pub const SYSTEM_MEMORY: &str = "system.memory";
pub const SYSTEM_DISK: &str = "system.disk";
pub const SYSTEM_LOAD: &str = "system.load";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub at_ms: i64,
    pub resource: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub metadata: HashMap<String, String>,
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub at_ms: i64,
    pub resource: String,
    pub container_id: Option<String>,
    pub value: f64,
    pub z_score: f64,
    pub high_severity: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    ScaleUp,
    ScaleDown,
    MemoryOptimization,
    RecycleContainer,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationSuggestion {
    pub id: String,
    pub at_ms: i64,
    pub kind: SuggestionKind,
    pub container_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourcePrediction {
    pub resource: String,
    pub predicted: f64,
    pub slope: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WindowStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemSample {
    pub at_ms: i64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub load_normalized: f64,
    pub process_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub started: bool,
    pub samples_collected: u64,
    pub active_alerts: usize,
    pub tracked_series: usize,
}

/// Per-container CPU percentage from cumulative counters:
/// (cpu_delta / system_delta) * online_cpus * 100, capped at full machine.
fn cpu_percent_from(stats: &RuntimeStats, previous: Option<(u64, u64)>) -> f64 {
    let (prev_cpu, prev_system) = match previous {
        Some(previous) => previous,
        None => return 0.0,
    };
    let cpu_delta = stats.cpu_total_usage.saturating_sub(prev_cpu);
    let system_delta = stats.system_cpu_usage.saturating_sub(prev_system);
    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }
    let cpus = stats.online_cpus.max(1) as f64;
    ((cpu_delta as f64 / system_delta as f64) * cpus * 100.0).min(100.0 * cpus)
}

/// Memory percentage excluding cache pages. A zero limit yields 0.
fn memory_percent_from(stats: &RuntimeStats) -> f64 {
    if stats.memory_limit == 0 {
        debug!("container memory limit missing, reporting 0");
        return 0.0;
    }
    let used = stats.memory_usage.saturating_sub(stats.memory_cache);
    (used as f64 / stats.memory_limit as f64) * 100.0
}

fn severity_for(value: f64, band: &ThresholdBand) -> Option<AlertSeverity> {
    if value >= band.critical {
        Some(AlertSeverity::Critical)
    } else if value >= band.warning {
        Some(AlertSeverity::Warning)
    } else if value <= band.low {
        Some(AlertSeverity::Info)
    } else {
        None
    }
}

/// Samples host and per-container resource usage, maintains bounded series,
/// and turns what it sees into alerts, anomalies, and suggestions. All of its
/// own failures are log-only.
pub struct ResourceMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    pool: Weak<PoolManager>,
    settings: MonitorSettings,
    bus: EventBus,
    system: Mutex<sysinfo::System>,
    series: Mutex<HashMap<String, VecDeque<(i64, f64)>>>,
    prev_cpu: DashMap<String, (u64, u64)>,
    alerts: Mutex<Vec<Alert>>,
    cooldowns: Mutex<HashMap<(String, AlertSeverity), Instant>>,
    samples_collected: AtomicU64,
    cancel: Mutex<CancellationToken>,
    started: AtomicBool,
}

impl ResourceMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        pool: Weak<PoolManager>,
        settings: MonitorSettings,
        bus: EventBus,
    ) -> Self {
        Self {
            runtime,
            pool,
            settings,
            bus,
            system: Mutex::new(sysinfo::System::new()),
            series: Mutex::new(HashMap::new()),
            prev_cpu: DashMap::new(),
            alerts: Mutex::new(Vec::new()),
            cooldowns: Mutex::new(HashMap::new()),
            samples_collected: AtomicU64::new(0),
            cancel: Mutex::new(CancellationToken::new()),
            started: AtomicBool::new(false),
        }
    }

    /// One monitoring tick.
    pub async fn sample_once(&self) {
        let system = self.sample_system();
        self.record(SYSTEM_CPU, system.cpu_percent);
        self.record(SYSTEM_MEMORY, system.memory_percent);
        self.record(SYSTEM_DISK, system.disk_percent);
        self.record(SYSTEM_LOAD, system.load_normalized);

        let thresholds = self.settings.thresholds.clone();
        self.check_resource(SYSTEM_CPU, system.cpu_percent, &thresholds.cpu);
        self.check_resource(SYSTEM_MEMORY, system.memory_percent, &thresholds.memory);
        self.check_resource(SYSTEM_DISK, system.disk_percent, &thresholds.disk);

        let hot_containers = self.sample_containers().await;

        for key in [SYSTEM_CPU, SYSTEM_MEMORY, SYSTEM_DISK, SYSTEM_LOAD] {
            if let Some(anomaly) = self.detect_anomaly(key, None) {
                self.bus.publish(PoolEvent::AnomalyDetected { anomaly });
            }
        }

        let pool_status = self.pool.upgrade().map(|pool| pool.status());
        let suggestions = self.suggestions_for(&system, pool_status.as_ref(), &hot_containers);
        if !suggestions.is_empty() {
            self.bus.publish(PoolEvent::OptimizationSuggestions {
                suggestions,
                at_ms: unix_millis(),
            });
        }

        self.prune_alerts();
        self.samples_collected.fetch_add(1, Ordering::SeqCst);
        self.bus.publish(PoolEvent::MonitoringCompleted {
            containers_sampled: hot_containers.sampled,
            at_ms: unix_millis(),
        });
    }

    fn sample_system(&self) -> SystemSample {
        let mut system = self.system.lock().unwrap();
        system.refresh_cpu_usage();
        system.refresh_memory();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

        let cpu_percent = system.global_cpu_usage() as f64;
        let memory_percent = if system.total_memory() == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / system.total_memory() as f64) * 100.0
        };
        let process_count = system.processes().len();
        drop(system);

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let (total_space, available_space) = disks.iter().fold((0u64, 0u64), |(total, avail), disk| {
            (total + disk.total_space(), avail + disk.available_space())
        });
        let disk_percent = if total_space == 0 {
            0.0
        } else {
            ((total_space - available_space) as f64 / total_space as f64) * 100.0
        };

        let cores = num_cpus::get().max(1) as f64;
        let load_normalized = sysinfo::System::load_average().one / cores;

        SystemSample {
            at_ms: unix_millis(),
            cpu_percent,
            memory_percent,
            disk_percent,
            load_normalized,
            process_count,
        }
    }

    async fn sample_containers(&self) -> ContainerSweep {
        let pool = match self.pool.upgrade() {
            Some(pool) => pool,
            None => return ContainerSweep::default(),
        };

        let mut sweep = ContainerSweep::default();
        for id in pool.container_ids() {
            let stats = match self.runtime.stats(&id).await {
                Ok(stats) => stats,
                Err(e) => {
                    // A tracked container the runtime cannot report on counts
                    // against its health budget.
                    debug!(container_id = %id, "container stats unavailable: {e}");
                    pool.mark_unhealthy_check(&id);
                    continue;
                }
            };
            sweep.sampled += 1;

            let previous = self.prev_cpu.get(&id).map(|entry| *entry.value());
            self.prev_cpu
                .insert(id.clone(), (stats.cpu_total_usage, stats.system_cpu_usage));

            let cpu_percent = cpu_percent_from(&stats, previous);
            let memory_percent = memory_percent_from(&stats);

            pool.update_stats(
                &id,
                ResourceSnapshot {
                    cpu_percent,
                    memory_used: stats.memory_usage.saturating_sub(stats.memory_cache),
                    memory_limit: stats.memory_limit,
                    network_rx_bytes: stats.network_rx_bytes,
                    network_tx_bytes: stats.network_tx_bytes,
                    block_read_bytes: stats.block_read_bytes,
                    block_write_bytes: stats.block_write_bytes,
                    pid_count: stats.pid_count,
                },
            );

            let cpu_key = format!("container.{id}.cpu");
            let memory_key = format!("container.{id}.memory");
            self.record(&cpu_key, cpu_percent);
            self.record(&memory_key, memory_percent);

            if cpu_percent > 95.0 || memory_percent > 95.0 {
                sweep.hot.push(id.clone());
            }
            if let Some(anomaly) = self.detect_anomaly(&cpu_key, Some(id.clone())) {
                self.bus.publish(PoolEvent::AnomalyDetected { anomaly });
            }
        }
        sweep
    }

    pub(crate) fn record(&self, key: &str, value: f64) {
        let mut series = self.series.lock().unwrap();
        let points = series.entry(key.to_string()).or_default();
        if points.len() >= SERIES_CAP {
            points.pop_front();
        }
        points.push_back((unix_millis(), value));
    }

    /// Z-score anomaly over the latest point of a series with enough history.
    pub(crate) fn detect_anomaly(&self, key: &str, container_id: Option<String>) -> Option<Anomaly> {
        let series = self.series.lock().unwrap();
        let points = series.get(key)?;
        if points.len() < ANOMALY_MIN_POINTS {
            return None;
        }

        let values: Vec<f64> = points.iter().map(|(_, value)| *value).collect();
        let (latest, history) = values.split_last()?;
        let sigma = std_dev(history);
        if sigma < f64::EPSILON {
            return None;
        }
        let z = (latest - mean(history)).abs() / sigma;
        if z <= ANOMALY_Z {
            return None;
        }

        warn!(resource = key, value = latest, z_score = z, "resource anomaly detected");
        Some(Anomaly {
            at_ms: unix_millis(),
            resource: key.to_string(),
            container_id,
            value: *latest,
            z_score: z,
            high_severity: z > ANOMALY_Z_HIGH,
        })
    }

    /// Threshold evaluation with per (resource, severity) cooldown. Returns
    /// the alert when one was raised.
    pub fn check_resource(
        &self,
        resource: &str,
        value: f64,
        band: &ThresholdBand,
    ) -> Option<Alert> {
        let severity = severity_for(value, band)?;

        {
            let cooldowns = self.cooldowns.lock().unwrap();
            if let Some(last) = cooldowns.get(&(resource.to_string(), severity)) {
                if last.elapsed() < self.settings.alert_cooldown {
                    debug!(resource, ?severity, "alert suppressed by cooldown");
                    return None;
                }
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("value".to_string(), format!("{value:.2}"));
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            at_ms: unix_millis(),
            resource: resource.to_string(),
            severity,
            message: match severity {
                AlertSeverity::Critical => format!("{resource} critically high at {value:.1}%"),
                AlertSeverity::Warning => format!("{resource} elevated at {value:.1}%"),
                AlertSeverity::Info => format!("{resource} low at {value:.1}%"),
            },
            metadata,
            resolved: false,
        };

        self.cooldowns
            .lock()
            .unwrap()
            .insert((resource.to_string(), severity), Instant::now());
        self.alerts.lock().unwrap().push(alert.clone());
        self.bus.publish(PoolEvent::AlertGenerated {
            alert: alert.clone(),
        });
        info!(resource, ?severity, value, "alert generated");
        Some(alert)
    }

    fn suggestions_for(
        &self,
        system: &SystemSample,
        pool_status: Option<&PoolStatus>,
        sweep: &ContainerSweep,
    ) -> Vec<OptimizationSuggestion> {
        let mut suggestions = Vec::new();
        let now = unix_millis();

        if system.cpu_percent > 90.0 {
            suggestions.push(OptimizationSuggestion {
                id: Uuid::new_v4().to_string(),
                at_ms: now,
                kind: SuggestionKind::ScaleDown,
                container_id: None,
                reason: format!("system cpu at {:.1}%", system.cpu_percent),
            });
        }
        if system.memory_percent > 90.0 {
            suggestions.push(OptimizationSuggestion {
                id: Uuid::new_v4().to_string(),
                at_ms: now,
                kind: SuggestionKind::MemoryOptimization,
                container_id: None,
                reason: format!("system memory at {:.1}%", system.memory_percent),
            });
        }
        for container_id in &sweep.hot {
            suggestions.push(OptimizationSuggestion {
                id: Uuid::new_v4().to_string(),
                at_ms: now,
                kind: SuggestionKind::RecycleContainer,
                container_id: Some(container_id.clone()),
                reason: "container resource usage above 95%".to_string(),
            });
        }
        if let Some(status) = pool_status {
            if status.total > 0 {
                let utilization = status.utilization * 100.0;
                if utilization < 30.0 && status.total > status.min_size {
                    suggestions.push(OptimizationSuggestion {
                        id: Uuid::new_v4().to_string(),
                        at_ms: now,
                        kind: SuggestionKind::ScaleDown,
                        container_id: None,
                        reason: format!("pool utilization at {utilization:.0}%"),
                    });
                } else if utilization > 85.0 {
                    suggestions.push(OptimizationSuggestion {
                        id: Uuid::new_v4().to_string(),
                        at_ms: now,
                        kind: SuggestionKind::ScaleUp,
                        container_id: None,
                        reason: format!("pool utilization at {utilization:.0}%"),
                    });
                }
            }
        }
        suggestions
    }

    /// OLS projection one interval ahead over the series tail, clipped to the
    /// percentage range.
    pub fn predict(&self, key: &str) -> Option<ResourcePrediction> {
        let series = self.series.lock().unwrap();
        let points = series.get(key)?;
        if points.len() < PREDICTION_MIN_POINTS {
            return None;
        }

        let tail: Vec<f64> = points
            .iter()
            .rev()
            .take(PREDICTION_WINDOW)
            .rev()
            .map(|(_, value)| *value)
            .collect();
        let slope = ols_slope(&tail);
        let last = *tail.last()?;
        Some(ResourcePrediction {
            resource: key.to_string(),
            predicted: (last + slope).clamp(0.0, 100.0),
            slope,
            confidence: (points.len() as f64 / PREDICTION_MIN_POINTS as f64).min(1.0),
        })
    }

    /// Rolling aggregates for the standard windows.
    pub fn windows(&self, key: &str) -> HashMap<&'static str, WindowStats> {
        let windows: [(&'static str, Duration); 4] = [
            ("1m", Duration::from_secs(60)),
            ("5m", Duration::from_secs(300)),
            ("15m", Duration::from_secs(900)),
            ("1h", Duration::from_secs(3600)),
        ];

        let series = self.series.lock().unwrap();
        let mut result = HashMap::new();
        let points = match series.get(key) {
            Some(points) => points,
            None => return result,
        };
        let now = unix_millis();

        for (name, window) in windows {
            let cutoff = now - window.as_millis() as i64;
            let values: Vec<f64> = points
                .iter()
                .filter(|(at, _)| *at >= cutoff)
                .map(|(_, value)| *value)
                .collect();
            if values.is_empty() {
                continue;
            }
            result.insert(
                name,
                WindowStats {
                    avg: mean(&values),
                    min: values.iter().cloned().fold(f64::INFINITY, f64::min),
                    max: values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                    p95: percentile(&values, 95.0),
                },
            );
        }
        result
    }

    fn prune_alerts(&self) {
        let cutoff = unix_millis() - self.settings.alert_retention.as_millis() as i64;
        let mut alerts = self.alerts.lock().unwrap();
        let before = alerts.len();
        alerts.retain(|alert| alert.at_ms >= cutoff);
        if alerts.len() < before {
            debug!(pruned = before - alerts.len(), "expired alerts pruned");
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .filter(|alert| !alert.resolved)
            .cloned()
            .collect()
    }

    pub fn forget_container(&self, id: &str) {
        self.prev_cpu.remove(id);
        let mut series = self.series.lock().unwrap();
        series.remove(&format!("container.{id}.cpu"));
        series.remove(&format!("container.{id}.memory"));
    }

    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitor = self.clone();
        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();
        let interval = self.settings.interval;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.sample_once().await,
                    _ = cancel.cancelled() => {
                        debug!("monitor loop stopped");
                        break;
                    }
                }
            }
        });
        info!(interval = ?interval, "resource monitor started");
    }

    pub fn stop(&self) {
        self.cancel.lock().unwrap().cancel();
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            started: self.is_started(),
            samples_collected: self.samples_collected.load(Ordering::SeqCst),
            active_alerts: self.active_alerts().len(),
            tracked_series: self.series.lock().unwrap().len(),
        }
    }
}

#[derive(Debug, Default)]
struct ContainerSweep {
    sampled: usize,
    hot: Vec<String>,
}
