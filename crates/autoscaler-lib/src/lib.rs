//! Core library of the Proxmox VE cluster autoscaler
//!
//! This crate provides:
//! - Cluster utilization sampling and the scale decision
//! - The VM provisioning state machine on top of the Proxmox API
//! - Node join via Ansible or a remote join command, with rollback
//! - VM record persistence in Postgres
//! - The control loop tying these together, plus health and metrics

pub mod control_loop;
pub mod health;
pub mod join;
pub mod models;
pub mod observability;
pub mod provisioner;
pub mod record;
pub mod retry;
pub mod sampler;

#[cfg(test)]
pub(crate) mod test_support;

pub use control_loop::{ControlLoop, ControlLoopConfig, CycleError, CycleOutcome};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AutoscalerMetrics, StructuredLogger};
pub use retry::{Attempts, RetryExhausted, RetryPolicy};
