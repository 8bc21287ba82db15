//! In-memory fakes for exercising the control plane without a Docker daemon.

use crate::core::events::{EventSink, PoolEvent};
use crate::core::runtime::{
    ContainerRuntime, DiscoveredContainer, ExecOutput, RuntimeStats, RuntimeStatus,
};
use crate::core::template::ContainerTemplate;
use crate::shared::error::{PoolError, PoolResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub oom_killed: bool,
    pub created_at: i64,
}

/// A container runtime backed by a map. Supports failure injection so tests
/// can drive the error paths.
pub struct InMemoryRuntime {
    containers: DashMap<String, FakeContainer>,
    next_id: AtomicU64,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_inspect: AtomicBool,
    /// Stats handed back for every container.
    pub stats: Mutex<RuntimeStats>,
    pub exec_exit_code: AtomicU64,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            next_id: AtomicU64::new(1),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_inspect: AtomicBool::new(false),
            stats: Mutex::new(RuntimeStats {
                online_cpus: 2,
                memory_limit: 2 * 1024 * 1024 * 1024,
                ..Default::default()
            }),
            exec_exit_code: AtomicU64::new(0),
        }
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.containers
            .get(id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    /// Register a container the control plane did not create, e.g. an orphan
    /// left behind by a previous process.
    pub fn seed_container(&self, id: &str, labels: HashMap<String, String>, running: bool, created_at: i64) {
        self.containers.insert(
            id.to_string(),
            FakeContainer {
                name: id.to_string(),
                labels,
                running,
                oom_killed: false,
                created_at,
            },
        );
    }

    pub fn kill_container(&self, id: &str, oom: bool) {
        if let Some(mut c) = self.containers.get_mut(id) {
            c.running = false;
            c.oom_killed = oom;
        }
    }

    pub fn set_stats(&self, stats: RuntimeStats) {
        *self.stats.lock().unwrap() = stats;
    }
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn ping(&self) -> PoolResult<()> {
        Ok(())
    }

    async fn create(&self, template: &ContainerTemplate, name: &str) -> PoolResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(PoolError::terminal("create disabled by test"));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                labels: template.labels.clone(),
                running: false,
                oom_killed: false,
                created_at: 0,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> PoolResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(PoolError::transient("start disabled by test"));
        }
        let mut container = self
            .containers
            .get_mut(id)
            .ok_or_else(|| PoolError::terminal(format!("no such container: {id}")))?;
        container.running = true;
        Ok(())
    }

    async fn exec(&self, id: &str, _argv: &[String]) -> PoolResult<ExecOutput> {
        if !self.containers.contains_key(id) {
            return Err(PoolError::terminal(format!("no such container: {id}")));
        }
        Ok(ExecOutput {
            exit_code: self.exec_exit_code.load(Ordering::SeqCst) as i64,
            stdout: Vec::new(),
        })
    }

    async fn stop(&self, id: &str, _grace: std::time::Duration) -> PoolResult<()> {
        if let Some(mut container) = self.containers.get_mut(id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> PoolResult<()> {
        self.containers.remove(id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> PoolResult<RuntimeStatus> {
        if self.fail_inspect.load(Ordering::SeqCst) {
            return Err(PoolError::transient("inspect disabled by test"));
        }
        let container = self
            .containers
            .get(id)
            .ok_or_else(|| PoolError::terminal(format!("no such container: {id}")))?;
        Ok(RuntimeStatus {
            running: container.running,
            oom_killed: container.oom_killed,
            dead: container.oom_killed,
            ..Default::default()
        })
    }

    async fn stats(&self, id: &str) -> PoolResult<RuntimeStats> {
        if !self.containers.contains_key(id) {
            return Err(PoolError::transient(format!("no such container: {id}")));
        }
        Ok(self.stats.lock().unwrap().clone())
    }

    async fn list(&self, label: &str) -> PoolResult<Vec<DiscoveredContainer>> {
        Ok(self
            .containers
            .iter()
            .filter(|entry| entry.value().labels.contains_key(label))
            .map(|entry| DiscoveredContainer {
                id: entry.key().clone(),
                labels: entry.value().labels.clone(),
                created_at: entry.value().created_at,
            })
            .collect())
    }
}

/// Sink that records every event for later assertions.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<PoolEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.kind()).collect()
    }

    pub fn count_of(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &PoolEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
