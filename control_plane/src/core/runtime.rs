use crate::core::template::{cpu_limits, ContainerTemplate};
use crate::shared::error::{PoolError, PoolResult};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, MemoryStatsStats,
    RemoveContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of running a command inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runtime-observed container status flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeStatus {
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    pub oom_killed: bool,
    pub dead: bool,
}

/// One stats snapshot straight from the runtime. CPU values are cumulative
/// counters; percentage math happens in the monitor, which keeps the previous
/// sample per container.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    pub cpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub online_cpus: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_cache: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub pid_count: u64,
}

/// A container found by label listing, used for orphan discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredContainer {
    pub id: String,
    pub labels: HashMap<String, String>,
    /// Unix seconds, as reported by the runtime.
    pub created_at: i64,
}

/// Capability over a single-host container runtime. The control plane is
/// agnostic to which conforming runtime backs it; tests use an in-memory
/// implementation.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verify the runtime endpoint is reachable.
    async fn ping(&self) -> PoolResult<()>;

    /// Create a container from a template under a caller-chosen name and
    /// return the runtime id.
    async fn create(&self, template: &ContainerTemplate, name: &str) -> PoolResult<String>;

    async fn start(&self, id: &str) -> PoolResult<()>;

    async fn exec(&self, id: &str, argv: &[String]) -> PoolResult<ExecOutput>;

    async fn stop(&self, id: &str, grace: Duration) -> PoolResult<()>;

    /// Remove a container. A missing container is not an error.
    async fn remove(&self, id: &str, force: bool) -> PoolResult<()>;

    async fn inspect(&self, id: &str) -> PoolResult<RuntimeStatus>;

    async fn stats(&self, id: &str) -> PoolResult<RuntimeStats>;

    /// List containers carrying the given label key, running or not.
    async fn list(&self, label: &str) -> PoolResult<Vec<DiscoveredContainer>>;
}

/// Docker implementation over bollard.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> PoolResult<Self> {
        let docker = Docker::connect_with_http_defaults()
            .map_err(|e| PoolError::transient(format!("Failed to connect to Docker: {e}")))?;
        Ok(Self { docker })
    }

    pub fn with_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Maps a bollard error onto the transient/terminal split. Server-side 5xx
/// and transport problems are worth retrying; 4xx responses (bad spec,
/// missing image, conflicts) and payload mismatches are not.
fn classify(err: bollard::errors::Error) -> PoolError {
    match &err {
        bollard::errors::Error::DockerResponseServerError { status_code, message } => {
            if *status_code >= 500 {
                PoolError::transient(format!("runtime responded {status_code}: {message}"))
            } else {
                PoolError::terminal(format!("runtime rejected request ({status_code}): {message}"))
            }
        }
        bollard::errors::Error::JsonDataError { .. } | bollard::errors::Error::JsonSerdeError { .. } => {
            PoolError::terminal(format!("runtime payload mismatch: {err}"))
        }
        _ => PoolError::transient(format!("runtime transport error: {err}")),
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> PoolResult<()> {
        self.docker.ping().await.map(|_| ()).map_err(classify)
    }

    async fn create(&self, template: &ContainerTemplate, name: &str) -> PoolResult<String> {
        let (cpu_period, cpu_quota) = cpu_limits(template.cpus);

        let host_config = HostConfig {
            memory: Some(template.memory_bytes),
            cpu_period: Some(cpu_period),
            cpu_quota: Some(cpu_quota),
            network_mode: template.network_mode.clone(),
            security_opt: if template.security_opts.is_empty() {
                None
            } else {
                Some(template.security_opts.clone())
            },
            tmpfs: if template.tmpfs.is_empty() {
                None
            } else {
                Some(template.tmpfs.clone())
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(template.image.clone()),
            working_dir: Some(template.working_dir.clone()),
            env: Some(template.env.clone()),
            labels: Some(template.labels.clone()),
            // Keep the container alive between jobs; jobs run through exec.
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "while true; do sleep 30; done".to_string(),
            ]),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(classify)?;

        debug!(container_id = %response.id, name, "created container");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> PoolResult<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(classify)
    }

    async fn exec(&self, id: &str, argv: &[String]) -> PoolResult<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions::<String> {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;

        let mut stdout = Vec::new();
        match self.docker.start_exec(&exec.id, None).await.map_err(classify)? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(log) => stdout.extend_from_slice(&log.into_bytes()),
                        Err(e) => {
                            warn!(container_id = id, "exec output stream error: {e}");
                            break;
                        }
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(classify)?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
        })
    }

    async fn stop(&self, id: &str, grace: Duration) -> PoolResult<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> PoolResult<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn inspect(&self, id: &str) -> PoolResult<RuntimeStatus> {
        let response = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(classify)?;

        let state = response.state.unwrap_or_default();
        Ok(RuntimeStatus {
            running: state.running.unwrap_or(false),
            paused: state.paused.unwrap_or(false),
            restarting: state.restarting.unwrap_or(false),
            oom_killed: state.oom_killed.unwrap_or(false),
            dead: state.dead.unwrap_or(false),
        })
    }

    async fn stats(&self, id: &str) -> PoolResult<RuntimeStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(id, Some(options));
        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(classify(e)),
            None => return Err(PoolError::transient(format!("no stats returned for {id}"))),
        };

        // Memory accounting excludes the page cache: cgroup v1 reports it as
        // `cache`, v2 approximates through `inactive_file`.
        let memory_cache = match stats.memory_stats.stats {
            Some(MemoryStatsStats::V1(v1)) => v1.cache,
            Some(MemoryStatsStats::V2(v2)) => v2.inactive_file,
            None => 0,
        };

        let (network_rx_bytes, network_tx_bytes) = stats
            .networks
            .as_ref()
            .map(|networks| {
                networks.values().fold((0u64, 0u64), |(rx, tx), net| {
                    (rx + net.rx_bytes, tx + net.tx_bytes)
                })
            })
            .unwrap_or((0, 0));

        let (block_read_bytes, block_write_bytes) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .as_ref()
            .map(|entries| {
                entries.iter().fold((0u64, 0u64), |(read, write), entry| {
                    if entry.op.eq_ignore_ascii_case("read") {
                        (read + entry.value, write)
                    } else if entry.op.eq_ignore_ascii_case("write") {
                        (read, write + entry.value)
                    } else {
                        (read, write)
                    }
                })
            })
            .unwrap_or((0, 0));

        Ok(RuntimeStats {
            cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
            system_cpu_usage: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1),
            memory_usage: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            memory_cache,
            network_rx_bytes,
            network_tx_bytes,
            block_read_bytes,
            block_write_bytes,
            pid_count: stats.pids_stats.current.unwrap_or(0),
        })
    }

    async fn list(&self, label: &str) -> PoolResult<Vec<DiscoveredContainer>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(classify)?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                summary.id.map(|id| DiscoveredContainer {
                    id,
                    labels: summary.labels.unwrap_or_default(),
                    created_at: summary.created.unwrap_or(0),
                })
            })
            .collect())
    }
}
