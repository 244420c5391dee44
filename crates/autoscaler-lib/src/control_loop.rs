//! Scale-decision control loop
//!
//! One cycle: sample cluster utilization, decide, and when triggered run a
//! single provisioning attempt end to end (clone, persist the record,
//! bring the VM up, join, then label or roll back). Attempts never overlap.

use crate::health::{components, HealthRegistry};
use crate::join::{JoinOrchestrator, JoinOutcome};
use crate::observability::{AutoscalerMetrics, StructuredLogger};
use crate::provisioner::{LifecycleController, ProvisionError, ProvisioningAttempt, ProvisioningSpec};
use crate::record::RecordKeeper;
use crate::sampler::{
    SamplingError, ScaleGate, ScalingTrigger, TriggerReason, Utilization, UtilizationSampler,
};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Default wait between cycles
pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_secs(10);

/// Failures that end a cycle early
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("sampling failed: {0}")]
    Sampling(#[from] SamplingError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

impl CycleError {
    /// Stage the cycle stopped at
    pub fn stage(&self) -> &'static str {
        match self {
            CycleError::Sampling(_) => "sample",
            CycleError::Provision(ProvisionError::Start { .. }) => "start",
            CycleError::Provision(_) => "clone",
        }
    }
}

/// What a completed cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Utilization within limits, nothing provisioned
    Idle(ScalingTrigger),
    Joined { vmid: u32, trigger: TriggerReason },
    RolledBack {
        vmid: u32,
        trigger: TriggerReason,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ControlLoopConfig {
    pub interval: Duration,
    /// Provisioning input used for every new worker
    pub spec: ProvisioningSpec,
}

impl ControlLoopConfig {
    pub fn new(spec: ProvisioningSpec) -> Self {
        Self {
            interval: DEFAULT_LOOP_INTERVAL,
            spec,
        }
    }
}

pub struct ControlLoop {
    sampler: UtilizationSampler,
    gate: ScaleGate,
    lifecycle: Arc<LifecycleController>,
    records: RecordKeeper,
    join: JoinOrchestrator,
    config: ControlLoopConfig,
    /// Forces one provisioning pass on startup; cleared after the first decision
    first_cycle: bool,
    health: HealthRegistry,
    metrics: AutoscalerMetrics,
    logger: StructuredLogger,
}

impl ControlLoop {
    pub fn new(
        sampler: UtilizationSampler,
        gate: ScaleGate,
        lifecycle: Arc<LifecycleController>,
        records: RecordKeeper,
        join: JoinOrchestrator,
        config: ControlLoopConfig,
    ) -> Self {
        let logger = StructuredLogger::new(config.spec.target_node.clone());
        Self {
            sampler,
            gate,
            lifecycle,
            records,
            join,
            config,
            first_cycle: true,
            health: HealthRegistry::new(),
            metrics: AutoscalerMetrics::new(),
            logger,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn is_first_cycle(&self) -> bool {
        self.first_cycle
    }

    /// Run cycles until shutdown is signalled. Shutdown is only observed
    /// between cycles, never during a provisioning attempt.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            template = %self.config.spec.template,
            "Starting control loop"
        );
        self.health.set_ready(true).await;

        loop {
            match self.run_cycle().await {
                Ok(outcome) => info!(outcome = ?outcome, "Cycle complete"),
                Err(e) => {
                    error!(stage = e.stage(), error = %e, "Cycle failed");
                    self.metrics.inc_cycle_failures(e.stage());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.recv() => {
                    info!("Shutting down control loop");
                    break;
                }
            }
        }
    }

    /// Run a single cycle
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, CycleError> {
        self.metrics.inc_cycles();

        let utilization = self.sample().await;
        let utilization = self.track(components::SAMPLER, utilization).await?;
        self.metrics.set_utilization(&utilization);

        let trigger = self.gate.decide(&utilization, self.first_cycle);
        self.first_cycle = false;
        self.logger.log_scale_decision(&utilization, &trigger);

        if !trigger.triggered {
            return Ok(CycleOutcome::Idle(trigger));
        }

        self.metrics.inc_provisioning_attempts();
        let mut attempt = ProvisioningAttempt::new();

        let cloned = self.lifecycle.clone_vm(&self.config.spec, &mut attempt).await;
        let cloned = self.track(components::PROVISIONER, cloned).await?;

        self.records.persist(&cloned.record()).await;
        self.health.set_healthy(components::RECORD_STORE).await;

        let vm = self.lifecycle.bring_up(cloned, &mut attempt).await;
        let vm = self.track(components::PROVISIONER, vm).await?;

        let outcome = self.join.join(&vm, &mut attempt).await;
        self.metrics.observe_provisioning_duration(attempt.elapsed());

        let vmid = vm.handle.vmid;
        match outcome {
            JoinOutcome::Joined => {
                self.metrics.inc_joins();
                self.health.set_healthy(components::JOIN).await;
                self.logger.log_vm_joined(vmid, &vm.hostname, attempt.elapsed());
                Ok(CycleOutcome::Joined {
                    vmid,
                    trigger: trigger.reason,
                })
            }
            JoinOutcome::Unjoinable(reason) => {
                self.metrics.inc_rollbacks();
                self.health
                    .set_degraded(components::JOIN, format!("vm {} rolled back: {}", vmid, reason))
                    .await;
                self.logger.log_vm_rolled_back(vmid, &reason);
                Ok(CycleOutcome::RolledBack {
                    vmid,
                    trigger: trigger.reason,
                    reason,
                })
            }
        }
    }

    async fn sample(&self) -> Result<Utilization, SamplingError> {
        self.sampler.sample().await?.utilization()
    }

    /// Mirror a stage result into the component's health
    async fn track<T, E: Display>(&self, component: &str, result: Result<T, E>) -> Result<T, E> {
        match &result {
            Ok(_) => self.health.set_healthy(component).await,
            Err(e) => self.health.set_unhealthy(component, e.to_string()).await,
        }
        result
    }
}
