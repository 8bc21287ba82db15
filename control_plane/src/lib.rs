//! Control plane for a pool of ephemeral CI job containers.
//!
//! The [`core::coordinator::Coordinator`] owns the subsystems: the pool
//! manager holding the container population, the state manager running the
//! per-container lifecycle machine, the dynamic scaler, the reuse optimizer,
//! and the resource monitor. Build one through
//! [`core::builder::ControlPlaneBuilder`].

pub mod core;
pub mod shared;

pub use crate::core::builder::ControlPlaneBuilder;
pub use crate::core::config::CoreConfig;
pub use crate::core::coordinator::{Coordinator, CoreStatus, HealthReport};
pub use crate::core::events::{EventSink, PoolEvent};
pub use crate::core::optimizer::JobRequirements;
pub use crate::core::pool::{ContainerHandle, JobResult};
pub use crate::shared::error::{AcquireError, PoolError, PoolResult};
