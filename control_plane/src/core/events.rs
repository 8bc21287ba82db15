use crate::core::monitor::{Alert, Anomaly, OptimizationSuggestion};
use crate::core::state::ContainerState;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Everything the control plane tells the outside world, typed. Components
/// publish onto the coordinator-owned channel through an [`EventBus`]; the
/// coordinator routes each event to the external [`EventSink`] and to its own
/// reactions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PoolEvent {
    ContainerCreated {
        container_id: String,
        template: String,
        at_ms: i64,
    },
    ContainerAssigned {
        container_id: String,
        job_type: String,
        at_ms: i64,
    },
    ContainerReturned {
        container_id: String,
        success: bool,
        recycled: bool,
        at_ms: i64,
    },
    ContainerRemoved {
        container_id: String,
        reason: String,
        at_ms: i64,
    },
    StateTransitioned {
        container_id: String,
        from: ContainerState,
        to: ContainerState,
        reason: String,
        forced: bool,
        at_ms: i64,
    },
    InvalidTransition {
        container_id: String,
        from: ContainerState,
        to: ContainerState,
        at_ms: i64,
    },
    ScalingCompleted {
        direction: ScalingDirection,
        requested: usize,
        succeeded: usize,
        at_ms: i64,
    },
    ScalingFailed {
        direction: ScalingDirection,
        requested: usize,
        error: String,
        at_ms: i64,
    },
    AlertGenerated {
        alert: Alert,
    },
    AnomalyDetected {
        anomaly: Anomaly,
    },
    OptimizationSuggestions {
        suggestions: Vec<OptimizationSuggestion>,
        at_ms: i64,
    },
    HealthCheckCompleted {
        healthy: bool,
        unhealthy_components: Vec<String>,
        at_ms: i64,
    },
    MonitoringCompleted {
        containers_sampled: usize,
        at_ms: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingDirection {
    Up,
    Down,
}

impl PoolEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PoolEvent::ContainerCreated { .. } => "containerCreated",
            PoolEvent::ContainerAssigned { .. } => "containerAssigned",
            PoolEvent::ContainerReturned { .. } => "containerReturned",
            PoolEvent::ContainerRemoved { .. } => "containerRemoved",
            PoolEvent::StateTransitioned { .. } => "stateTransitioned",
            PoolEvent::InvalidTransition { .. } => "invalidTransition",
            PoolEvent::ScalingCompleted { .. } => "scalingCompleted",
            PoolEvent::ScalingFailed { .. } => "scalingFailed",
            PoolEvent::AlertGenerated { .. } => "alertGenerated",
            PoolEvent::AnomalyDetected { .. } => "anomalyDetected",
            PoolEvent::OptimizationSuggestions { .. } => "optimizationSuggestions",
            PoolEvent::HealthCheckCompleted { .. } => "healthCheckCompleted",
            PoolEvent::MonitoringCompleted { .. } => "monitoringCompleted",
        }
    }
}

/// Outbound event consumer. Delivery is best-effort: `emit` must not block
/// and the control plane never awaits acknowledgment.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PoolEvent);
}

/// Sink that drops everything. Used when no external consumer is wired.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, event: &PoolEvent) {
        debug!(kind = event.kind(), "event dropped (no sink configured)");
    }
}

/// Cloneable publishing handle onto the coordinator's event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<PoolEvent>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish an event. Failures mean the coordinator is gone, which only
    /// happens during shutdown, so they are silently ignored.
    pub fn publish(&self, event: PoolEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::utils::unix_millis;

    #[test]
    fn test_event_kind_names() {
        let event = PoolEvent::ContainerCreated {
            container_id: "c1".to_string(),
            template: "base".to_string(),
            at_ms: unix_millis(),
        };
        assert_eq!(event.kind(), "containerCreated");

        let event = PoolEvent::InvalidTransition {
            container_id: "c1".to_string(),
            from: ContainerState::Available,
            to: ContainerState::Stopped,
            at_ms: unix_millis(),
        };
        assert_eq!(event.kind(), "invalidTransition");
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = PoolEvent::ScalingCompleted {
            direction: ScalingDirection::Up,
            requested: 3,
            succeeded: 2,
            at_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "scalingCompleted");
        assert_eq!(json["direction"], "up");
        assert_eq!(json["requested"], 3);
    }

    #[tokio::test]
    async fn test_bus_delivers_in_order() {
        let (bus, mut rx) = EventBus::channel();
        for n in 0..3usize {
            bus.publish(PoolEvent::ContainerRemoved {
                container_id: format!("c{n}"),
                reason: "test".to_string(),
                at_ms: unix_millis(),
            });
        }
        for n in 0..3usize {
            match rx.recv().await.unwrap() {
                PoolEvent::ContainerRemoved { container_id, .. } => {
                    assert_eq!(container_id, format!("c{n}"));
                }
                other => panic!("unexpected event: {:?}", other.kind()),
            }
        }
    }
}
