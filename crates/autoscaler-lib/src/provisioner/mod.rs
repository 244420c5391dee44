//! VM provisioning state machine
//!
//! Drives a new worker VM from template clone to a reachable guest:
//! clone, start, wait for power-on, wait for the guest agent, then wait
//! for a network address. Each stage is built on a [`RetryPolicy`] and the
//! hypervisor is only ever reached through the [`VmProvider`] capability.
//!
//! [`RetryPolicy`]: crate::retry::RetryPolicy

mod lifecycle;
mod proxmox;
mod spec;
mod state;


pub use lifecycle::{
    select_address, ClonedVm, LifecycleController, LifecyclePolicies, ProvisionedVm,
    DEFAULT_INTERFACE_FILTER,
};
pub use proxmox::{ProxmoxClient, ProxmoxConfig};
pub use spec::{GuestConfig, ProvisioningSpec};
pub use state::{ProvisioningAttempt, ProvisioningState};

use crate::models::{GuestInterface, RunState, VmHandle};
use crate::retry::RetryExhausted;
use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by the hypervisor API
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// The VM (or another addressed object) does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A readiness probe has not succeeded yet
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("hypervisor task {upid} finished with status {status}")]
    TaskFailed { upid: String, status: String },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("hypervisor API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("unexpected hypervisor response: {0}")]
    Response(String),

    #[error("hypervisor request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Cycle-fatal failures of a provisioning attempt
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("template {0} not found on any hypervisor node")]
    TemplateNotFound(String),

    #[error("clone failed during {step}: {error}")]
    Clone {
        step: &'static str,
        #[source]
        error: HypervisorError,
    },

    #[error("vm {vmid} failed to start: {error}")]
    Start {
        vmid: u32,
        #[source]
        error: RetryExhausted<HypervisorError>,
    },
}

/// Arguments of a clone request
#[derive(Debug, Clone)]
pub struct CloneRequest<'a> {
    pub source: &'a VmHandle,
    pub target: &'a VmHandle,
    pub name: &'a str,
    pub pool: Option<&'a str>,
    pub full: bool,
}

/// Hypervisor control API used by the provisioning stages
#[async_trait]
pub trait VmProvider: Send + Sync {
    /// Every VM instance of the named template, across all nodes
    async fn find_template_instances(&self, name: &str) -> Result<Vec<VmHandle>, HypervisorError>;

    /// Next VM id the hypervisor would hand out
    async fn next_free_id(&self) -> Result<u32, HypervisorError>;

    async fn clone_instance(&self, request: &CloneRequest<'_>) -> Result<(), HypervisorError>;

    /// Apply the guest configuration to a freshly cloned VM
    async fn push_config(&self, vm: &VmHandle, config: &GuestConfig) -> Result<(), HypervisorError>;

    /// Wait until the clone's transient instance has shut down
    async fn wait_for_clone_source_shutdown(&self, vm: &VmHandle) -> Result<(), HypervisorError>;

    async fn start(&self, vm: &VmHandle) -> Result<(), HypervisorError>;

    async fn run_state(&self, vm: &VmHandle) -> Result<RunState, HypervisorError>;

    async fn ping_agent(&self, vm: &VmHandle) -> Result<(), HypervisorError>;

    async fn guest_interfaces(&self, vm: &VmHandle) -> Result<Vec<GuestInterface>, HypervisorError>;

    async fn stop(&self, vm: &VmHandle) -> Result<(), HypervisorError>;

    async fn delete(&self, vm: &VmHandle) -> Result<(), HypervisorError>;
}
