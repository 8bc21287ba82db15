use crate::core::config::CoreConfig;
use crate::core::coordinator::Coordinator;
use crate::core::events::{EventSink, NullSink};
use crate::core::runtime::{ContainerRuntime, DockerRuntime};
use crate::shared::error::PoolResult;
use std::sync::Arc;
use std::time::Duration;

/// Builder for configuring and creating the control plane. Unset options
/// fall back to the documented defaults; runtime and sink are injectable so
/// tests run against fakes.
#[derive(Default)]
pub struct ControlPlaneBuilder {
    config: CoreConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl ControlPlaneBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn min_size(mut self, min: usize) -> Self {
        self.config.pool.min_size = min;
        self
    }

    pub fn max_size(mut self, max: usize) -> Self {
        self.config.pool.max_size = max;
        self
    }

    pub fn warmup_containers(mut self, warmup: usize) -> Self {
        self.config.pool.warmup_containers = warmup;
        self
    }

    pub fn base_image(mut self, image: String) -> Self {
        self.config.container.base_image = image;
        self
    }

    pub fn scale_interval(mut self, interval: Duration) -> Self {
        self.config.scaler.timing.interval = interval;
        self
    }

    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.config.monitor.interval = interval;
        self
    }

    pub fn persistence_enabled(mut self, enabled: bool) -> Self {
        self.config.persistence.enabled = enabled;
        self
    }

    pub fn redis_url(mut self, url: String) -> Self {
        self.config.persistence.redis_url = url;
        self
    }

    pub fn prediction_enabled(mut self, enabled: bool) -> Self {
        self.config.prediction.enable = enabled;
        self
    }

    pub fn optimizer_enabled(mut self, enabled: bool) -> Self {
        self.config.optimizer.enable = enabled;
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Wire everything together. The coordinator still needs `start()` to
    /// create containers and spawn its loops.
    pub fn build(self) -> PoolResult<Arc<Coordinator>> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Arc::new(DockerRuntime::connect()?),
        };
        let sink = self.sink.unwrap_or_else(|| Arc::new(NullSink));
        Coordinator::new(self.config, runtime, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::InMemoryRuntime;

    #[tokio::test]
    async fn test_builder_wires_and_starts() {
        let coordinator = ControlPlaneBuilder::new()
            .min_size(2)
            .max_size(5)
            .warmup_containers(0)
            .persistence_enabled(false)
            .runtime(Arc::new(InMemoryRuntime::new()))
            .build()
            .unwrap();

        coordinator.start().await.unwrap();
        let status = coordinator.status();
        assert_eq!(status.pool.total, 2);
        assert_eq!(status.pool.max_size, 5);
        coordinator.stop().await;
    }

    #[test]
    fn test_builder_overrides() {
        let builder = ControlPlaneBuilder::new()
            .min_size(4)
            .max_size(12)
            .base_image("debian:bookworm".to_string())
            .prediction_enabled(false)
            .redis_url("redis://cache:6379".to_string());

        assert_eq!(builder.config.pool.min_size, 4);
        assert_eq!(builder.config.pool.max_size, 12);
        assert_eq!(builder.config.container.base_image, "debian:bookworm");
        assert!(!builder.config.prediction.enable);
        assert_eq!(builder.config.persistence.redis_url, "redis://cache:6379");
    }
}
