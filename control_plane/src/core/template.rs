use crate::core::config::ContainerSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label attached to every container the pool manages. Reconciliation lists by
/// this label to discover orphans, so it must never change between releases.
pub const POOL_LABEL: &str = "runnerpool.managed";

const BYTES_IN_MB: i64 = 1024 * 1024;

/// Declarative description of a pool container. Templates are values: the
/// pool registers them once and creation reads them, nothing mutates a
/// template after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerTemplate {
    pub name: String,
    pub image: String,
    pub working_dir: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub memory_bytes: i64,
    pub cpus: f64,
    pub network_mode: Option<String>,
    pub security_opts: Vec<String>,
    /// Mount point -> mount options.
    pub tmpfs: HashMap<String, String>,
    /// Shell commands run best-effort after the container starts.
    pub setup_commands: Vec<String>,
    /// Shell commands run between jobs to return the workspace to a clean
    /// slate.
    pub cleanup_commands: Vec<String>,
}

impl ContainerTemplate {
    /// The default template every pool registers at initialization.
    pub fn base(settings: &ContainerSettings) -> Self {
        let mut labels = HashMap::new();
        labels.insert(POOL_LABEL.to_string(), "true".to_string());
        labels.insert("runnerpool.template".to_string(), "base".to_string());

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,noexec,nosuid,size=512m".to_string());

        Self {
            name: "base".to_string(),
            image: settings.base_image.clone(),
            working_dir: settings.working_dir.clone(),
            env: vec![
                "DEBIAN_FRONTEND=noninteractive".to_string(),
                format!("RUNNER_WORKDIR={}", settings.working_dir),
            ],
            labels,
            memory_bytes: parse_memory(&settings.memory),
            cpus: settings.cpus.parse().unwrap_or(1.0),
            network_mode: settings.network_mode.clone(),
            security_opts: vec!["no-new-privileges:true".to_string()],
            tmpfs,
            setup_commands: vec![format!(
                "mkdir -p {dir} && chmod 0777 {dir}",
                dir = settings.working_dir
            )],
            cleanup_commands: vec![
                format!("rm -rf {}/* {}/.[!.]* 2>/dev/null || true", settings.working_dir, settings.working_dir),
                "pkill -9 -f job-step || true".to_string(),
                format!("cd {}", settings.working_dir),
            ],
        }
    }
}

/// Calculates the CPU period and CPU quota for a given number of CPUs.
/// Docker's default CPU period is 100,000 microseconds.
pub fn cpu_limits(cpus: f64) -> (i64, i64) {
    let cpu_period = 100_000_u64;
    let cpu_quota = (cpu_period as f64 * cpus).round() as i64;
    (cpu_period as i64, cpu_quota)
}

/// Parses a human memory size ("2g", "512m", "1024") into bytes. Bare numbers
/// are taken as megabytes.
pub fn parse_memory(value: &str) -> i64 {
    let trimmed = value.trim().to_lowercase();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * BYTES_IN_MB),
        Some('m') => (&trimmed[..trimmed.len() - 1], BYTES_IN_MB),
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024),
        _ => (trimmed.as_str(), BYTES_IN_MB),
    };
    digits
        .parse::<f64>()
        .map(|n| (n * multiplier as f64) as i64)
        .unwrap_or(2 * 1024 * BYTES_IN_MB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_limits() {
        let (period, quota) = cpu_limits(1.0);
        assert_eq!(period, 100_000);
        assert_eq!(quota, 100_000);

        let (period, quota) = cpu_limits(2.0);
        assert_eq!(period, 100_000);
        assert_eq!(quota, 200_000);

        let (period, quota) = cpu_limits(0.5);
        assert_eq!(period, 100_000);
        assert_eq!(quota, 50_000);
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("2g"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512m"), 512 * 1024 * 1024);
        assert_eq!(parse_memory("256"), 256 * 1024 * 1024);
        // Unparseable input falls back to 2g.
        assert_eq!(parse_memory("lots"), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_base_template_carries_pool_label() {
        let template = ContainerTemplate::base(&ContainerSettings::default());
        assert_eq!(template.labels.get(POOL_LABEL).map(String::as_str), Some("true"));
        assert_eq!(template.memory_bytes, 2 * 1024 * 1024 * 1024);
        assert!((template.cpus - 1.0).abs() < f64::EPSILON);
        assert!(!template.cleanup_commands.is_empty());
    }
}
