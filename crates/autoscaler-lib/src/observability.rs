//! Prometheus metrics and structured lifecycle events

use crate::sampler::{ScalingTrigger, Utilization};
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec, Gauge,
    Histogram, IntCounter, IntCounterVec,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Provisioning takes minutes, not milliseconds
const PROVISIONING_BUCKETS: &[f64] = &[
    15.0, 30.0, 60.0, 120.0, 180.0, 300.0, 450.0, 600.0, 900.0, 1800.0,
];

static GLOBAL_METRICS: OnceLock<AutoscalerMetricsInner> = OnceLock::new();

struct AutoscalerMetricsInner {
    cycles: IntCounter,
    cpu_utilization: Gauge,
    memory_utilization: Gauge,
    provisioning_attempts: IntCounter,
    joins: IntCounter,
    rollbacks: IntCounter,
    cycle_failures: IntCounterVec,
    provisioning_duration_seconds: Histogram,
}

impl AutoscalerMetricsInner {
    fn new() -> Self {
        Self {
            cycles: register_int_counter!(
                "pve_autoscaler_cycles_total",
                "Control loop cycles run"
            )
            .expect("Failed to register cycles_total"),

            cpu_utilization: register_gauge!(
                "pve_autoscaler_cpu_utilization_percent",
                "Mean per-node CPU utilization of the last sample"
            )
            .expect("Failed to register cpu_utilization_percent"),

            memory_utilization: register_gauge!(
                "pve_autoscaler_memory_utilization_percent",
                "Mean per-node memory utilization of the last sample"
            )
            .expect("Failed to register memory_utilization_percent"),

            provisioning_attempts: register_int_counter!(
                "pve_autoscaler_provisioning_attempts_total",
                "Provisioning attempts started"
            )
            .expect("Failed to register provisioning_attempts_total"),

            joins: register_int_counter!(
                "pve_autoscaler_joins_total",
                "VMs that joined the cluster"
            )
            .expect("Failed to register joins_total"),

            rollbacks: register_int_counter!(
                "pve_autoscaler_rollbacks_total",
                "VMs destroyed after failing to join"
            )
            .expect("Failed to register rollbacks_total"),

            cycle_failures: register_int_counter_vec!(
                "pve_autoscaler_cycle_failures_total",
                "Cycles aborted by a cycle-fatal error",
                &["stage"]
            )
            .expect("Failed to register cycle_failures_total"),

            provisioning_duration_seconds: register_histogram!(
                "pve_autoscaler_provisioning_duration_seconds",
                "Time from clone to joined or rolled back",
                PROVISIONING_BUCKETS.to_vec()
            )
            .expect("Failed to register provisioning_duration_seconds"),
        }
    }
}

/// Handle to the process-wide autoscaler metrics. Clones share the
/// same underlying collectors.
#[derive(Clone)]
pub struct AutoscalerMetrics {
    _private: (),
}

impl Default for AutoscalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoscalerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AutoscalerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AutoscalerMetricsInner {
        GLOBAL_METRICS.get_or_init(AutoscalerMetricsInner::new)
    }

    pub fn inc_cycles(&self) {
        self.inner().cycles.inc();
    }

    pub fn set_utilization(&self, utilization: &Utilization) {
        self.inner().cpu_utilization.set(utilization.cpu_ratio);
        self.inner().memory_utilization.set(utilization.mem_ratio);
    }

    pub fn inc_provisioning_attempts(&self) {
        self.inner().provisioning_attempts.inc();
    }

    pub fn inc_joins(&self) {
        self.inner().joins.inc();
    }

    pub fn inc_rollbacks(&self) {
        self.inner().rollbacks.inc();
    }

    pub fn inc_cycle_failures(&self, stage: &str) {
        self.inner().cycle_failures.with_label_values(&[stage]).inc();
    }

    pub fn observe_provisioning_duration(&self, duration: Duration) {
        self.inner()
            .provisioning_duration_seconds
            .observe(duration.as_secs_f64());
    }
}

/// Emits the named lifecycle events of the autoscaler
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, template: &str, join_mode: &str) {
        info!(
            event = "autoscaler_started",
            node = %self.node_name,
            version = %version,
            template = %template,
            join_mode = %join_mode,
            "Autoscaler started"
        );
    }

    pub fn log_scale_decision(&self, utilization: &Utilization, trigger: &ScalingTrigger) {
        info!(
            event = "scale_decision",
            node = %self.node_name,
            cpu_percent = utilization.cpu_ratio,
            memory_percent = utilization.mem_ratio,
            triggered = trigger.triggered,
            reason = %trigger.reason,
            "Scale decision"
        );
    }

    pub fn log_vm_joined(&self, vmid: u32, hostname: &str, elapsed: Duration) {
        info!(
            event = "vm_joined",
            node = %self.node_name,
            vmid = vmid,
            hostname = %hostname,
            elapsed_secs = elapsed.as_secs(),
            "VM joined the cluster"
        );
    }

    pub fn log_vm_rolled_back(&self, vmid: u32, reason: &str) {
        warn!(
            event = "vm_rolled_back",
            node = %self.node_name,
            vmid = vmid,
            reason = %reason,
            "VM rolled back"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "autoscaler_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Autoscaler shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handles_share_collectors() {
        let first = AutoscalerMetrics::new();
        let second = AutoscalerMetrics::new();

        first.inc_joins();
        second.inc_joins();
        first.inc_cycle_failures("clone");
        second.set_utilization(&Utilization {
            cpu_ratio: 85.0,
            mem_ratio: 60.0,
        });

        assert!(first.inner().joins.get() >= 2);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("loki");
        assert_eq!(logger.node_name, "loki");
    }
}
