//! Per-attempt provisioning state

use crate::models::VmHandle;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Stage of a single provisioning attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    Cloning,
    Starting,
    AwaitingPowerOn,
    AwaitingAgent,
    AwaitingNetwork,
    Configuring,
    Validating,
    Joined,
    RolledBack,
}

impl ProvisioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningState::Cloning => "cloning",
            ProvisioningState::Starting => "starting",
            ProvisioningState::AwaitingPowerOn => "awaiting_power_on",
            ProvisioningState::AwaitingAgent => "awaiting_agent",
            ProvisioningState::AwaitingNetwork => "awaiting_network",
            ProvisioningState::Configuring => "configuring",
            ProvisioningState::Validating => "validating",
            ProvisioningState::Joined => "joined",
            ProvisioningState::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisioningState::Joined | ProvisioningState::RolledBack)
    }

    /// States only ever move forward; terminal states are final
    pub fn can_advance_to(&self, next: ProvisioningState) -> bool {
        !self.is_terminal() && next > *self
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one attempt through the provisioning state machine
#[derive(Debug)]
pub struct ProvisioningAttempt {
    state: ProvisioningState,
    vm: Option<VmHandle>,
    history: Vec<ProvisioningState>,
    started_at: Instant,
}

impl Default for ProvisioningAttempt {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisioningAttempt {
    pub fn new() -> Self {
        Self {
            state: ProvisioningState::Cloning,
            vm: None,
            history: vec![ProvisioningState::Cloning],
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn vm(&self) -> Option<&VmHandle> {
        self.vm.as_ref()
    }

    /// Every state visited so far, in order
    pub fn history(&self) -> &[ProvisioningState] {
        &self.history
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Record the VM created by the clone stage
    pub fn assign_vm(&mut self, vm: VmHandle) {
        self.vm = Some(vm);
    }

    /// Move to `next`. Backward or post-terminal transitions are refused
    /// and reported; the state is left unchanged.
    pub fn advance(&mut self, next: ProvisioningState) -> bool {
        if !self.state.can_advance_to(next) {
            error!(
                from = %self.state,
                to = %next,
                "Refusing invalid provisioning transition"
            );
            return false;
        }

        info!(
            event = "stage_changed",
            vmid = self.vm.as_ref().map(|vm| vm.vmid),
            from = %self.state,
            to = %next,
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "Provisioning stage changed"
        );
        self.state = next;
        self.history.push(next);
        true
    }
}
