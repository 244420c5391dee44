//! Lifecycle controller: clone → start → power-on → agent → network

use super::{
    CloneRequest, GuestConfig, HypervisorError, ProvisionError, ProvisioningAttempt,
    ProvisioningSpec, ProvisioningState, VmProvider,
};
use crate::models::{GuestInterface, RunState, VmHandle, VmRecord};
use crate::retry::RetryPolicy;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Interface name substring used to pick the guest address
pub const DEFAULT_INTERFACE_FILTER: &str = "eth";

const DEFAULT_VM_NAME: &str = "kworker";
const VM_TYPE: &str = "qemu";

/// Retry policies for each lifecycle stage
#[derive(Debug, Clone, Copy)]
pub struct LifecyclePolicies {
    pub start: RetryPolicy,
    pub power_on: RetryPolicy,
    pub agent: RetryPolicy,
    pub network: RetryPolicy,
    pub destroy: RetryPolicy,
}

impl Default for LifecyclePolicies {
    fn default() -> Self {
        Self {
            start: RetryPolicy::bounded(Duration::from_secs(10), 5),
            power_on: RetryPolicy::bounded(Duration::from_secs(5), 100),
            agent: RetryPolicy::bounded(Duration::from_secs(5), 100),
            network: RetryPolicy::unbounded(Duration::from_secs(10)),
            destroy: RetryPolicy::unbounded(Duration::from_secs(10)),
        }
    }
}

/// A VM that has been cloned and configured but not yet started
#[derive(Debug, Clone, PartialEq)]
pub struct ClonedVm {
    pub handle: VmHandle,
    pub hostname: String,
    pub guest: GuestConfig,
}

impl ClonedVm {
    /// Metadata row persisted for this VM
    pub fn record(&self) -> VmRecord {
        VmRecord {
            vmid: self.handle.vmid,
            node: self.handle.node.clone(),
            pool: self.guest.pool().map(str::to_string),
            vmtype: VM_TYPE.to_string(),
            memory: self.record_column("memory", self.guest.memory()),
            cores: self.record_column("cores", self.guest.cores()),
        }
    }

    /// Out-of-range guest values are stored as 0 rather than wrapped
    fn record_column(&self, column: &str, value: Option<i64>) -> i32 {
        let value = value.unwrap_or_default();
        i32::try_from(value).unwrap_or_else(|_| {
            warn!(
                vmid = self.handle.vmid,
                column = column,
                value = value,
                "Guest config value out of range for the VM record, storing 0"
            );
            0
        })
    }
}

/// A running VM with a reachable guest address
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedVm {
    pub handle: VmHandle,
    pub hostname: String,
    pub address: IpAddr,
    pub guest: GuestConfig,
}

/// First address of the first interface whose name contains `filter`.
///
/// Interfaces are considered in enumeration order; a matching interface
/// without any address is skipped.
pub fn select_address(interfaces: &[GuestInterface], filter: &str) -> Option<IpAddr> {
    interfaces
        .iter()
        .filter(|iface| iface.name.contains(filter))
        .find_map(|iface| iface.addresses.first().copied())
}

/// Drives the hypervisor side of a provisioning attempt
pub struct LifecycleController {
    provider: Arc<dyn VmProvider>,
    policies: LifecyclePolicies,
    interface_filter: String,
}

impl LifecycleController {
    pub fn new(provider: Arc<dyn VmProvider>) -> Self {
        Self {
            provider,
            policies: LifecyclePolicies::default(),
            interface_filter: DEFAULT_INTERFACE_FILTER.to_string(),
        }
    }

    pub fn with_policies(mut self, policies: LifecyclePolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_interface_filter(mut self, filter: impl Into<String>) -> Self {
        self.interface_filter = filter.into();
        self
    }

    pub fn policies(&self) -> &LifecyclePolicies {
        &self.policies
    }

    /// Clone, start and wait until the guest is reachable
    pub async fn provision(
        &self,
        spec: &ProvisioningSpec,
        attempt: &mut ProvisioningAttempt,
    ) -> Result<ProvisionedVm, ProvisionError> {
        let cloned = self.clone_vm(spec, attempt).await?;
        self.bring_up(cloned, attempt).await
    }

    /// Cloning stage. A single attempt: any failure is fatal for the cycle
    /// and no VM is left behind that needs a rollback.
    pub async fn clone_vm(
        &self,
        spec: &ProvisioningSpec,
        attempt: &mut ProvisioningAttempt,
    ) -> Result<ClonedVm, ProvisionError> {
        let step = |step: &'static str| move |error: HypervisorError| ProvisionError::Clone { step, error };

        info!(template = %spec.template, node = %spec.target_node, "Looking for template");
        let templates = self
            .provider
            .find_template_instances(&spec.template)
            .await
            .map_err(step("find_template"))?;

        // Prefer a template instance that already lives on the target node
        let source = templates
            .iter()
            .find(|t| t.node == spec.target_node)
            .or_else(|| templates.first())
            .cloned()
            .ok_or_else(|| ProvisionError::TemplateNotFound(spec.template.clone()))?;

        let vmid = self
            .provider
            .next_free_id()
            .await
            .map_err(step("next_free_id"))?;
        let handle = VmHandle::new(vmid, spec.target_node.clone());

        let mut guest = spec.effective_guest();
        let hostname = format!("{}-{}", guest.name().unwrap_or(DEFAULT_VM_NAME), vmid);
        guest.set("name", hostname.clone());

        info!(
            vmid = vmid,
            node = %handle.node,
            source = %source,
            hostname = %hostname,
            "Cloning template"
        );

        let request = CloneRequest {
            source: &source,
            target: &handle,
            name: &hostname,
            pool: guest.pool(),
            full: spec.full_clone,
        };
        self.provider
            .clone_instance(&request)
            .await
            .map_err(step("clone"))?;
        attempt.assign_vm(handle.clone());

        self.provider
            .push_config(&handle, &guest)
            .await
            .map_err(step("push_config"))?;
        self.provider
            .wait_for_clone_source_shutdown(&handle)
            .await
            .map_err(step("wait_for_shutdown"))?;

        info!(vmid = vmid, "Completed cloning process");

        Ok(ClonedVm {
            handle,
            hostname,
            guest,
        })
    }

    /// Start the cloned VM and wait for power-on, the guest agent and a
    /// network address, in that order.
    pub async fn bring_up(
        &self,
        cloned: ClonedVm,
        attempt: &mut ProvisioningAttempt,
    ) -> Result<ProvisionedVm, ProvisionError> {
        let handle = &cloned.handle;

        attempt.advance(ProvisioningState::Starting);
        self.start(handle).await?;

        attempt.advance(ProvisioningState::AwaitingPowerOn);
        self.await_power_on(handle).await;

        attempt.advance(ProvisioningState::AwaitingAgent);
        self.await_agent(handle).await;

        attempt.advance(ProvisioningState::AwaitingNetwork);
        let address = self.await_network(handle).await;
        info!(vmid = handle.vmid, address = %address, "Guest network is up");

        Ok(ProvisionedVm {
            handle: cloned.handle,
            hostname: cloned.hostname,
            address,
            guest: cloned.guest,
        })
    }

    async fn start(&self, handle: &VmHandle) -> Result<(), ProvisionError> {
        let provider = self.provider.as_ref();

        self.policies
            .start
            .run("start", move |_| async move { provider.start(handle).await })
            .await
            .map_err(|error| ProvisionError::Start {
                vmid: handle.vmid,
                error,
            })
    }

    /// Poll until the VM reports `running`. Each exhausted round re-issues
    /// the start call and polls again.
    async fn await_power_on(&self, handle: &VmHandle) {
        let provider = self.provider.as_ref();

        loop {
            let result = self
                .policies
                .power_on
                .run("power_on", move |_| async move {
                    match provider.run_state(handle).await? {
                        RunState::Running => Ok(()),
                        other => Err(HypervisorError::NotReady(format!("vm state is {:?}", other))),
                    }
                })
                .await;

            match result {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        vmid = handle.vmid,
                        node = %handle.node,
                        stage = "power_on",
                        error = %e,
                        "VM did not power on within wait time, re-issuing start"
                    );
                    if let Err(e) = provider.start(handle).await {
                        error!(vmid = handle.vmid, error = %e, "Failed to re-issue start");
                    }
                }
            }
        }
    }

    /// Ping the in-guest agent until it answers. Exhausted rounds simply
    /// wait again.
    async fn await_agent(&self, handle: &VmHandle) {
        let provider = self.provider.as_ref();

        loop {
            let result = self
                .policies
                .agent
                .run("agent", move |_| async move { provider.ping_agent(handle).await })
                .await;

            match result {
                Ok(()) => return,
                Err(e) => warn!(
                    vmid = handle.vmid,
                    node = %handle.node,
                    stage = "agent",
                    error = %e,
                    "Guest agent did not start within wait time, waiting again"
                ),
            }
        }
    }

    async fn await_network(&self, handle: &VmHandle) -> IpAddr {
        let provider = self.provider.as_ref();
        let filter = self.interface_filter.as_str();

        self.policies
            .network
            .run_forever("network", move |_| async move {
                let interfaces = provider.guest_interfaces(handle).await?;
                select_address(&interfaces, filter).ok_or_else(|| {
                    HypervisorError::NotReady(format!("no address on an interface matching {:?}", filter))
                })
            })
            .await
    }

    /// Stop and delete the VM, retrying until the hypervisor confirms the
    /// deletion. A VM that is already gone counts as destroyed.
    pub async fn destroy(&self, handle: &VmHandle) {
        let provider = self.provider.as_ref();

        warn!(vmid = handle.vmid, node = %handle.node, "Destroying VM");

        self.policies
            .destroy
            .run_forever("destroy", move |_| async move {
                match provider.stop(handle).await {
                    Ok(()) | Err(HypervisorError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                match provider.delete(handle).await {
                    Ok(()) => Ok(()),
                    Err(HypervisorError::NotFound(_)) => {
                        info!(vmid = handle.vmid, "VM already deleted");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            })
            .await;

        info!(vmid = handle.vmid, node = %handle.node, "Deleted VM");
    }
}
