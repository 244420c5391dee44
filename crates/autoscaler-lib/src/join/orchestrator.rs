//! Join orchestration: configure, validate, then label or roll back

use super::{
    default_labels, ConfigRunner, DirectJoin, Inventory, JoinConfiguration, JoinOutcome,
    NodeLabeler, PlaybookJoin, PlaybookRun,
};
use crate::provisioner::{LifecycleController, ProvisionedVm, ProvisioningAttempt, ProvisioningState};
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Retry policies of the playbook path
#[derive(Debug, Clone, Copy)]
pub struct JoinPolicies {
    /// Inventory generation and validation
    pub inventory: RetryPolicy,
    /// Playbook execution: the first run plus exactly one retry
    pub playbook: RetryPolicy,
}

impl Default for JoinPolicies {
    fn default() -> Self {
        Self {
            inventory: RetryPolicy::bounded(Duration::from_secs(1), 3),
            playbook: RetryPolicy::bounded(Duration::from_secs(10), 2),
        }
    }
}

/// Configures a provisioned VM and settles the attempt
pub struct JoinOrchestrator {
    configuration: JoinConfiguration,
    runner: Arc<dyn ConfigRunner>,
    labeler: Arc<dyn NodeLabeler>,
    lifecycle: Arc<LifecycleController>,
    policies: JoinPolicies,
    labels: BTreeMap<String, String>,
}

impl JoinOrchestrator {
    pub fn new(
        configuration: JoinConfiguration,
        runner: Arc<dyn ConfigRunner>,
        labeler: Arc<dyn NodeLabeler>,
        lifecycle: Arc<LifecycleController>,
    ) -> Self {
        Self {
            configuration,
            runner,
            labeler,
            lifecycle,
            policies: JoinPolicies::default(),
            labels: default_labels(),
        }
    }

    pub fn with_policies(mut self, policies: JoinPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn configuration(&self) -> &JoinConfiguration {
        &self.configuration
    }

    /// Configure the VM, then label it on success or destroy it otherwise
    pub async fn join(&self, vm: &ProvisionedVm, attempt: &mut ProvisioningAttempt) -> JoinOutcome {
        attempt.advance(ProvisioningState::Configuring);
        let outcome = self.configure(vm).await;

        attempt.advance(ProvisioningState::Validating);
        match &outcome {
            JoinOutcome::Joined => {
                self.label(vm).await;
                attempt.advance(ProvisioningState::Joined);
            }
            JoinOutcome::Unjoinable(reason) => {
                warn!(
                    vmid = vm.handle.vmid,
                    hostname = %vm.hostname,
                    reason = %reason,
                    "Node is unjoinable, rolling back"
                );
                self.rollback(vm).await;
                attempt.advance(ProvisioningState::RolledBack);
            }
        }

        outcome
    }

    /// Run the configured join strategy against the VM
    pub async fn configure(&self, vm: &ProvisionedVm) -> JoinOutcome {
        info!(
            vmid = vm.handle.vmid,
            address = %vm.address,
            mode = self.configuration.mode(),
            "Configuring node"
        );

        match &self.configuration {
            JoinConfiguration::Playbook(join) => self.playbook_join(join, vm).await,
            JoinConfiguration::Direct(join) => self.direct_join(join, vm).await,
        }
    }

    async fn playbook_join(&self, join: &PlaybookJoin, vm: &ProvisionedVm) -> JoinOutcome {
        if let Err(e) = self
            .runner
            .sync_repository(&join.repo_url, &join.repo_location)
            .await
        {
            return JoinOutcome::Unjoinable(format!("repository sync failed: {:#}", e));
        }

        let inventory = self
            .policies
            .inventory
            .run("inventory", move |_| async move { self.write_inventory(join, vm).await })
            .await;
        if let Err(e) = inventory {
            return JoinOutcome::Unjoinable(e.to_string());
        }

        if let Some(requirements) = join.requirements_path() {
            if let Err(e) = self.runner.install_requirements(&requirements).await {
                return JoinOutcome::Unjoinable(format!("requirements install failed: {:#}", e));
            }
        }

        let run = PlaybookRun {
            playbook: join.playbook_path(),
            inventory: join.inventory_path.clone(),
            tag: join.tag.clone(),
            user: join.ssh_user.clone(),
            extra_vars: join.extra_vars.clone(),
            join_token: join.join_token.clone(),
        };
        let runner = self.runner.as_ref();
        let run = &run;

        match self
            .policies
            .playbook
            .run("playbook", move |_| async move { runner.run_playbook(run).await })
            .await
        {
            Ok(()) => {
                info!(vmid = vm.handle.vmid, playbook = %run.playbook.display(), "Playbook completed");
                JoinOutcome::Joined
            }
            Err(e) => JoinOutcome::Unjoinable(e.to_string()),
        }
    }

    /// Render the inventory, write it and read it back through the parser
    async fn write_inventory(&self, join: &PlaybookJoin, vm: &ProvisionedVm) -> Result<()> {
        let rendered = Inventory::render(&join.tag, &vm.hostname, vm.address, &join.ssh_user);

        if let Some(parent) = join.inventory_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&join.inventory_path, rendered)
            .await
            .with_context(|| format!("Failed to write {}", join.inventory_path.display()))?;

        let written = tokio::fs::read_to_string(&join.inventory_path)
            .await
            .with_context(|| format!("Failed to read {}", join.inventory_path.display()))?;
        Inventory::parse(&written)?.validate_host(join.tag.trim(), &vm.hostname, vm.address)?;

        info!(path = %join.inventory_path.display(), "Inventory generated");
        Ok(())
    }

    async fn direct_join(&self, join: &DirectJoin, vm: &ProvisionedVm) -> JoinOutcome {
        match self
            .runner
            .run_remote_join(&join.ssh_user, vm.address, &join.command)
            .await
        {
            Ok(()) => JoinOutcome::Joined,
            Err(e) => JoinOutcome::Unjoinable(format!("remote join failed: {:#}", e)),
        }
    }

    /// Label the joined node. Failures are logged only.
    pub async fn label(&self, vm: &ProvisionedVm) {
        match self.labeler.label_node(&vm.hostname, &self.labels).await {
            Ok(()) => info!(node = %vm.hostname, labels = ?self.labels, "Labeled node"),
            Err(e) => error!(node = %vm.hostname, error = %e, "Failed to label node"),
        }
    }

    /// Destroy the VM, retrying until the hypervisor confirms
    pub async fn rollback(&self, vm: &ProvisionedVm) {
        self.lifecycle.destroy(&vm.handle).await;
    }
}
