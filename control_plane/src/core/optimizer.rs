use crate::core::config::OptimizerSettings;
use crate::core::pool::{
    CandidateView, ContainerRecord, ContainerSelector, LeastRecentlyUsedSelector, ResourceSnapshot,
};
use crate::shared::utils::unix_millis;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const HISTORY_CAP: usize = 100;
const RECENCY_SATURATION_MS: f64 = 300_000.0;
/// Two fingerprints at least this similar count as the same job pattern.
const PATTERN_MATCH_THRESHOLD: f64 = 0.8;

/// What a job asks of its container, as delivered by the job-schema parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequirements {
    pub job_type: String,
    pub language: String,
    pub framework: String,
    pub cpu_class: String,
    pub memory_class: String,
    pub disk_class: String,
    pub dependencies: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
}

impl JobRequirements {
    pub fn fingerprint(&self) -> JobFingerprint {
        let mut hasher = DefaultHasher::new();
        for (key, value) in &self.env {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        let mut volumes = self.volumes.clone();
        volumes.sort();
        volumes.hash(&mut hasher);
        let mut networks = self.networks.clone();
        networks.sort();
        networks.hash(&mut hasher);

        JobFingerprint {
            job_type: self.job_type.clone(),
            language: self.language.clone(),
            framework: self.framework.clone(),
            resource_class: [
                self.cpu_class.clone(),
                self.memory_class.clone(),
                self.disk_class.clone(),
            ],
            dependencies: self.dependencies.iter().cloned().collect(),
            env_hash: hasher.finish(),
        }
    }
}

/// Compact structural summary of a job, compared by weighted similarity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFingerprint {
    pub job_type: String,
    pub language: String,
    pub framework: String,
    pub resource_class: [String; 3],
    pub dependencies: BTreeSet<String>,
    pub env_hash: u64,
}

impl JobFingerprint {
    /// Coarse grouping key for pattern analysis.
    pub fn pattern_key(&self) -> String {
        format!("{}/{}/{}", self.job_type, self.language, self.framework)
    }
}

fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Weighted similarity of two fingerprints in [0, 1]: job type 0.30,
/// language 0.25, framework 0.20, resource classes 0.15, dependencies 0.10.
pub fn similarity(a: &JobFingerprint, b: &JobFingerprint) -> f64 {
    let mut score = 0.0;
    if a.job_type == b.job_type {
        score += 0.30;
    }
    if a.language == b.language {
        score += 0.25;
    }
    if a.framework == b.framework {
        score += 0.20;
    }

    let classes_a: BTreeSet<String> = a
        .resource_class
        .iter()
        .enumerate()
        .map(|(i, class)| format!("{i}:{class}"))
        .collect();
    let classes_b: BTreeSet<String> = b
        .resource_class
        .iter()
        .enumerate()
        .map(|(i, class)| format!("{i}:{class}"))
        .collect();
    score += 0.15 * jaccard(&classes_a, &classes_b);
    score += 0.10 * jaccard(&a.dependencies, &b.dependencies);
    score
}

/// One finished job on one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub at_ms: i64,
    pub fingerprint: JobFingerprint,
    pub duration_ms: u64,
    pub success: bool,
    pub resource_usage: ResourceSnapshot,
}

#[derive(Debug, Default)]
struct ContainerProfile {
    history: VecDeque<JobOutcome>,
    total_jobs: u64,
    successful_jobs: u64,
    total_duration_ms: u64,
    efficiency_sum: f64,
}

impl ContainerProfile {
    fn avg_exec_time_ms(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.total_jobs as f64
    }

    fn success_rate(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.5;
        }
        self.successful_jobs as f64 / self.total_jobs as f64
    }

    fn resource_efficiency(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.5;
        }
        self.efficiency_sum / self.total_jobs as f64
    }
}

/// How efficiently one job used its container: light resource pressure
/// scores high.
fn job_efficiency(usage: &ResourceSnapshot) -> f64 {
    if usage.memory_limit == 0 && usage.cpu_percent == 0.0 {
        return 0.5;
    }
    (1.0 - (usage.cpu_percent + usage.memory_percent()) / 200.0).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PatternStats {
    pub jobs: u64,
    pub successes: u64,
    pub containers: usize,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStatus {
    pub enabled: bool,
    pub tracked_containers: usize,
    pub recorded_outcomes: u64,
    pub overall_success_rate: f64,
    pub overall_reuse_efficiency: f64,
    pub pattern_matches: u64,
    pub patterns_tracked: usize,
}

/// Scores available containers against incoming jobs and records outcomes.
/// Scoring failures never block acquisition; the pool's default selector is
/// always the fallback.
pub struct ReuseOptimizer {
    settings: OptimizerSettings,
    profiles: DashMap<String, ContainerProfile>,
    patterns: Mutex<HashMap<String, PatternStats>>,
    outcomes_recorded: AtomicU64,
    pattern_matches: AtomicU64,
}

impl ReuseOptimizer {
    pub fn new(settings: OptimizerSettings) -> Self {
        Self {
            settings,
            profiles: DashMap::new(),
            patterns: Mutex::new(HashMap::new()),
            outcomes_recorded: AtomicU64::new(0),
            pattern_matches: AtomicU64::new(0),
        }
    }

    /// score = w_pat * pattern + w_perf * performance + w_res * resources
    ///         + 0.1 * recency, all components in [0, 1].
    pub fn score(&self, candidate: &CandidateView, fingerprint: &JobFingerprint) -> f64 {
        let weights = &self.settings.weights;
        let pattern = self.pattern_score(&candidate.id, fingerprint);
        let performance = self.performance_score(&candidate.id);
        let resources = resource_score(candidate);
        let recency = recency_score(candidate.idle_ms);

        weights.env * pattern + weights.perf * performance + weights.res * resources + 0.1 * recency
    }

    /// Similarity of the job to the container's recent history: best match
    /// dominates (0.7) with the average as a tiebreaker (0.3). No history is
    /// neutral.
    fn pattern_score(&self, container_id: &str, fingerprint: &JobFingerprint) -> f64 {
        let profile = match self.profiles.get(container_id) {
            Some(profile) => profile,
            None => return 0.5,
        };
        if profile.history.is_empty() {
            return 0.5;
        }

        let similarities: Vec<f64> = profile
            .history
            .iter()
            .map(|outcome| similarity(fingerprint, &outcome.fingerprint))
            .collect();
        let max = similarities.iter().cloned().fold(0.0_f64, f64::max);
        let mean = similarities.iter().sum::<f64>() / similarities.len() as f64;
        max * 0.7 + mean * 0.3
    }

    fn performance_score(&self, container_id: &str) -> f64 {
        let profile = match self.profiles.get(container_id) {
            Some(profile) => profile,
            None => return 0.5,
        };
        if profile.total_jobs == 0 {
            return 0.5;
        }

        let exec_time_score =
            (1.0 - profile.avg_exec_time_ms() / self.settings.slow_job_threshold_ms).max(0.0);
        0.4 * exec_time_score + 0.4 * profile.success_rate() + 0.2 * profile.resource_efficiency()
    }

    /// Append the outcome to the container's bounded history and refresh its
    /// aggregates.
    pub fn record_outcome(
        &self,
        container_id: &str,
        fingerprint: JobFingerprint,
        duration_ms: u64,
        success: bool,
        resource_usage: ResourceSnapshot,
    ) {
        let mut profile = self.profiles.entry(container_id.to_string()).or_default();

        let seen_pattern = profile
            .history
            .iter()
            .any(|outcome| similarity(&fingerprint, &outcome.fingerprint) >= PATTERN_MATCH_THRESHOLD);
        if seen_pattern && success {
            self.pattern_matches.fetch_add(1, Ordering::SeqCst);
        }

        if profile.history.len() >= HISTORY_CAP {
            profile.history.pop_front();
        }
        profile.history.push_back(JobOutcome {
            at_ms: unix_millis(),
            fingerprint,
            duration_ms,
            success,
            resource_usage: resource_usage.clone(),
        });

        profile.total_jobs += 1;
        if success {
            profile.successful_jobs += 1;
        }
        profile.total_duration_ms += duration_ms;
        profile.efficiency_sum += job_efficiency(&resource_usage);

        self.outcomes_recorded.fetch_add(1, Ordering::SeqCst);
        debug!(
            container_id,
            success,
            duration_ms,
            total_jobs = profile.total_jobs,
            "job outcome recorded"
        );
    }

    /// Blend of success rate and resource efficiency used for preemptive
    /// recycling decisions.
    pub fn reuse_efficiency(&self, container_id: &str) -> f64 {
        let profile = match self.profiles.get(container_id) {
            Some(profile) => profile,
            None => return 1.0,
        };
        if profile.total_jobs == 0 {
            return 1.0;
        }
        0.6 * profile.success_rate() + 0.4 * profile.resource_efficiency()
    }

    pub fn overall_reuse_efficiency(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for entry in self.profiles.iter() {
            if entry.value().total_jobs > 0 {
                sum += 0.6 * entry.value().success_rate() + 0.4 * entry.value().resource_efficiency();
                count += 1;
            }
        }
        if count == 0 {
            1.0
        } else {
            sum / count as f64
        }
    }

    /// Reuse limits: hard job-count cap, hard age cap, and a preemptive
    /// trigger once a proven container starts degrading.
    pub fn should_recycle(&self, record: &ContainerRecord) -> Option<String> {
        if record.job_count >= self.settings.max_reuse_count {
            return Some(format!(
                "reuse count {} reached limit {}",
                record.job_count, self.settings.max_reuse_count
            ));
        }
        if record.created_at.elapsed() >= self.settings.max_container_age {
            return Some("container age limit reached".to_string());
        }
        if record.job_count > 10 {
            let efficiency = self.reuse_efficiency(&record.id);
            if efficiency < self.settings.preemptive_threshold {
                return Some(format!(
                    "reuse efficiency {efficiency:.2} below threshold {:.2}",
                    self.settings.preemptive_threshold
                ));
            }
        }
        None
    }

    /// Background pass: group recent jobs by pattern and refresh per-pattern
    /// aggregates.
    pub fn analyze_patterns(&self) {
        let mut grouped: HashMap<String, (u64, u64, u64, HashSet<String>)> = HashMap::new();
        for entry in self.profiles.iter() {
            for outcome in entry.value().history.iter() {
                let key = outcome.fingerprint.pattern_key();
                let slot = grouped.entry(key).or_default();
                slot.0 += 1;
                if outcome.success {
                    slot.1 += 1;
                }
                slot.2 += outcome.duration_ms;
                slot.3.insert(entry.key().clone());
            }
        }

        let mut patterns = self.patterns.lock().unwrap();
        patterns.clear();
        for (key, (jobs, successes, total_duration, containers)) in grouped {
            patterns.insert(
                key,
                PatternStats {
                    jobs,
                    successes,
                    containers: containers.len(),
                    avg_duration_ms: if jobs == 0 {
                        0.0
                    } else {
                        total_duration as f64 / jobs as f64
                    },
                },
            );
        }
        if !patterns.is_empty() {
            info!(patterns = patterns.len(), "job pattern analysis refreshed");
        }
    }

    pub fn pattern_stats(&self) -> HashMap<String, PatternStats> {
        self.patterns.lock().unwrap().clone()
    }

    /// Drop everything known about a removed container.
    pub fn forget(&self, container_id: &str) {
        self.profiles.remove(container_id);
    }

    pub fn pattern_interval(&self) -> Duration {
        self.settings.pattern_interval
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enable
    }

    pub fn status(&self) -> OptimizerStatus {
        let mut successes = 0u64;
        let mut jobs = 0u64;
        for entry in self.profiles.iter() {
            successes += entry.value().successful_jobs;
            jobs += entry.value().total_jobs;
        }
        OptimizerStatus {
            enabled: self.settings.enable,
            tracked_containers: self.profiles.len(),
            recorded_outcomes: self.outcomes_recorded.load(Ordering::SeqCst),
            overall_success_rate: if jobs == 0 {
                1.0
            } else {
                successes as f64 / jobs as f64
            },
            overall_reuse_efficiency: self.overall_reuse_efficiency(),
            pattern_matches: self.pattern_matches.load(Ordering::SeqCst),
            patterns_tracked: self.patterns.lock().unwrap().len(),
        }
    }
}

fn resource_score(candidate: &CandidateView) -> f64 {
    let cpu = candidate.cpu_percent.clamp(0.0, 100.0);
    let memory = candidate.memory_percent.clamp(0.0, 100.0);
    ((1.0 - cpu / 100.0) + (1.0 - memory / 100.0)) / 2.0
}

fn recency_score(idle_ms: u64) -> f64 {
    (idle_ms as f64 / RECENCY_SATURATION_MS).min(1.0)
}

/// Weighted-score selector handed to the pool when optimization is on. Falls
/// back to least-recently-used whenever scoring produces nothing usable.
pub struct OptimizerSelector {
    optimizer: Arc<ReuseOptimizer>,
    fallback: LeastRecentlyUsedSelector,
}

impl OptimizerSelector {
    pub fn new(optimizer: Arc<ReuseOptimizer>) -> Self {
        Self {
            optimizer,
            fallback: LeastRecentlyUsedSelector,
        }
    }
}

impl ContainerSelector for OptimizerSelector {
    fn select(
        &self,
        requirements: &JobRequirements,
        candidates: &[CandidateView],
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        if !self.optimizer.is_enabled() {
            return self.fallback.select(requirements, candidates);
        }

        let fingerprint = requirements.fingerprint();
        let best = candidates
            .iter()
            .map(|candidate| (self.optimizer.score(candidate, &fingerprint), candidate))
            .filter(|(score, _)| score.is_finite())
            .max_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((score, candidate)) => {
                debug!(container_id = %candidate.id, score, "optimizer selected container");
                Some(candidate.id.clone())
            }
            None => self.fallback.select(requirements, candidates),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn requirements(job_type: &str, language: &str) -> JobRequirements {
        JobRequirements {
            job_type: job_type.to_string(),
            language: language.to_string(),
            framework: "cargo".to_string(),
            cpu_class: "medium".to_string(),
            memory_class: "medium".to_string(),
            disk_class: "small".to_string(),
            dependencies: vec!["rustc".to_string(), "git".to_string()],
            ..Default::default()
        }
    }

    fn candidate(id: &str, idle_ms: u64, cpu: f64, memory: f64) -> CandidateView {
        CandidateView {
            id: id.to_string(),
            job_count: 1,
            age_ms: 60_000,
            idle_ms,
            cpu_percent: cpu,
            memory_percent: memory,
        }
    }

    fn record(id: &str, job_count: u64) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            template: "base".to_string(),
            created_at: Instant::now(),
            created_at_ms: unix_millis(),
            started_at: None,
            last_used: None,
            job_count,
            failure_count: 0,
            unhealthy_checks: 0,
            last_stats: None,
            memory_limit_bytes: 0,
            cpus: 1.0,
        }
    }

    #[test]
    fn test_fingerprint_env_hash_is_stable() {
        let mut a = requirements("build", "rust");
        a.env.insert("CI".to_string(), "true".to_string());
        let mut b = requirements("build", "rust");
        b.env.insert("CI".to_string(), "true".to_string());
        assert_eq!(a.fingerprint().env_hash, b.fingerprint().env_hash);

        b.env.insert("EXTRA".to_string(), "1".to_string());
        assert_ne!(a.fingerprint().env_hash, b.fingerprint().env_hash);
    }

    #[test]
    fn test_similarity_identical_is_one() {
        let fp = requirements("build", "rust").fingerprint();
        assert!((similarity(&fp, &fp) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_similarity_weights() {
        let a = requirements("build", "rust").fingerprint();
        let mut other = requirements("test", "rust");
        other.dependencies = vec!["rustc".to_string(), "git".to_string()];
        let b = other.fingerprint();
        // Everything matches except the job type: 1.0 - 0.30.
        assert!((similarity(&a, &b) - 0.70).abs() < 1e-9);

        let disjoint = JobRequirements {
            job_type: "deploy".to_string(),
            language: "go".to_string(),
            framework: "make".to_string(),
            cpu_class: "xl".to_string(),
            memory_class: "xl".to_string(),
            disk_class: "xl".to_string(),
            dependencies: vec!["golang".to_string()],
            ..Default::default()
        }
        .fingerprint();
        assert!(similarity(&a, &disjoint) < 1e-9);
    }

    #[test]
    fn test_scores_neutral_without_history() {
        let optimizer = ReuseOptimizer::new(OptimizerSettings::default());
        let fp = requirements("build", "rust").fingerprint();
        assert_eq!(optimizer.pattern_score("c1", &fp), 0.5);
        assert_eq!(optimizer.performance_score("c1"), 0.5);
    }

    #[test]
    fn test_recency_saturates() {
        assert_eq!(recency_score(0), 0.0);
        assert!((recency_score(150_000) - 0.5).abs() < 1e-9);
        assert_eq!(recency_score(300_000), 1.0);
        assert_eq!(recency_score(u64::MAX), 1.0);
    }

    #[test]
    fn test_resource_score_prefers_idle_containers() {
        let idle = candidate("c1", 0, 0.0, 0.0);
        let loaded = candidate("c2", 0, 80.0, 60.0);
        assert_eq!(resource_score(&idle), 1.0);
        assert!((resource_score(&loaded) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_score_formula() {
        let optimizer = ReuseOptimizer::new(OptimizerSettings::default());
        let fp = requirements("build", "rust").fingerprint();
        // Fresh container, fully idle candidate with recency saturated:
        // 0.4*0.5 + 0.3*0.5 + 0.3*1.0 + 0.1*1.0 = 0.75.
        let view = candidate("c1", 600_000, 0.0, 0.0);
        assert!((optimizer.score(&view, &fp) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_outcome_recording_updates_aggregates() {
        let optimizer = ReuseOptimizer::new(OptimizerSettings::default());
        let fp = requirements("build", "rust").fingerprint();

        optimizer.record_outcome("c1", fp.clone(), 60_000, true, ResourceSnapshot::default());
        optimizer.record_outcome("c1", fp.clone(), 120_000, false, ResourceSnapshot::default());

        let profile = optimizer.profiles.get("c1").unwrap();
        assert_eq!(profile.total_jobs, 2);
        assert_eq!(profile.successful_jobs, 1);
        assert!((profile.avg_exec_time_ms() - 90_000.0).abs() < 1e-9);
        assert_eq!(profile.success_rate(), 0.5);
    }

    #[test]
    fn test_history_capped() {
        let optimizer = ReuseOptimizer::new(OptimizerSettings::default());
        let fp = requirements("build", "rust").fingerprint();
        for _ in 0..(HISTORY_CAP + 20) {
            optimizer.record_outcome("c1", fp.clone(), 1_000, true, ResourceSnapshot::default());
        }
        assert_eq!(optimizer.profiles.get("c1").unwrap().history.len(), HISTORY_CAP);
    }

    #[test]
    fn test_should_recycle_on_reuse_cap() {
        let optimizer = ReuseOptimizer::new(OptimizerSettings::default());
        assert!(optimizer.should_recycle(&record("c1", 100)).is_some());
        assert!(optimizer.should_recycle(&record("c1", 99)).is_none());
    }

    #[test]
    fn test_should_recycle_on_age() {
        let mut settings = OptimizerSettings::default();
        settings.max_container_age = Duration::from_millis(0);
        let optimizer = ReuseOptimizer::new(settings);
        assert!(optimizer.should_recycle(&record("c1", 1)).is_some());
    }

    #[test]
    fn test_preemptive_recycle_needs_evidence() {
        let optimizer = ReuseOptimizer::new(OptimizerSettings::default());
        let fp = requirements("build", "rust").fingerprint();
        // Eleven straight failures tank the reuse efficiency.
        for _ in 0..11 {
            optimizer.record_outcome("c1", fp.clone(), 1_000, false, ResourceSnapshot::default());
        }

        let reason = optimizer.should_recycle(&record("c1", 11));
        assert!(reason.is_some());
        assert!(reason.unwrap().contains("efficiency"));

        // Same efficiency but too few jobs: no preemptive trigger.
        for _ in 0..5 {
            optimizer.record_outcome("c2", fp.clone(), 1_000, false, ResourceSnapshot::default());
        }
        assert!(optimizer.should_recycle(&record("c2", 5)).is_none());
    }

    #[test]
    fn test_pattern_analysis_groups_jobs() {
        let optimizer = ReuseOptimizer::new(OptimizerSettings::default());
        let build = requirements("build", "rust").fingerprint();
        let test = requirements("test", "go").fingerprint();

        optimizer.record_outcome("c1", build.clone(), 5_000, true, ResourceSnapshot::default());
        optimizer.record_outcome("c2", build.clone(), 7_000, true, ResourceSnapshot::default());
        optimizer.record_outcome("c2", test.clone(), 3_000, false, ResourceSnapshot::default());

        optimizer.analyze_patterns();
        let patterns = optimizer.pattern_stats();
        assert_eq!(patterns.len(), 2);

        let build_stats = &patterns[&build.pattern_key()];
        assert_eq!(build_stats.jobs, 2);
        assert_eq!(build_stats.successes, 2);
        assert_eq!(build_stats.containers, 2);
        assert!((build_stats.avg_duration_ms - 6_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_selector_prefers_matching_history() {
        let optimizer = Arc::new(ReuseOptimizer::new(OptimizerSettings::default()));
        let reqs = requirements("build", "rust");
        let fp = reqs.fingerprint();

        // c1 has run this exact job successfully and quickly; c2 is unknown.
        for _ in 0..5 {
            optimizer.record_outcome("c1", fp.clone(), 10_000, true, ResourceSnapshot::default());
        }

        let selector = OptimizerSelector::new(optimizer);
        let candidates = vec![
            candidate("c1", 600_000, 10.0, 10.0),
            candidate("c2", 600_000, 10.0, 10.0),
        ];
        assert_eq!(selector.select(&reqs, &candidates), Some("c1".to_string()));
    }

    #[test]
    fn test_selector_empty_candidates() {
        let optimizer = Arc::new(ReuseOptimizer::new(OptimizerSettings::default()));
        let selector = OptimizerSelector::new(optimizer);
        assert_eq!(selector.select(&requirements("build", "rust"), &[]), None);
    }
}
