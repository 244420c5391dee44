//! Threshold gate for provisioning decisions

use super::Utilization;
use serde::Serialize;
use std::fmt;

/// Why a decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Cpu,
    Memory,
    CpuAndMemory,
    FirstCycle,
    WithinLimits,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Cpu => "cpu",
            TriggerReason::Memory => "memory",
            TriggerReason::CpuAndMemory => "cpu+memory",
            TriggerReason::FirstCycle => "first_cycle",
            TriggerReason::WithinLimits => "within_limits",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`ScaleGate::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScalingTrigger {
    pub triggered: bool,
    pub reason: TriggerReason,
}

/// Compares utilization against the configured limits (both in percent)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleGate {
    pub cpu_limit: f64,
    pub memory_limit: f64,
}

impl ScaleGate {
    pub fn new(cpu_limit: f64, memory_limit: f64) -> Self {
        Self {
            cpu_limit,
            memory_limit,
        }
    }

    /// Trigger when either ratio strictly exceeds its limit, or
    /// unconditionally on the first cycle.
    pub fn decide(&self, utilization: &Utilization, is_first_cycle: bool) -> ScalingTrigger {
        let cpu_breach = utilization.cpu_ratio > self.cpu_limit;
        let mem_breach = utilization.mem_ratio > self.memory_limit;

        let reason = match (cpu_breach, mem_breach) {
            (true, true) => TriggerReason::CpuAndMemory,
            (true, false) => TriggerReason::Cpu,
            (false, true) => TriggerReason::Memory,
            (false, false) if is_first_cycle => TriggerReason::FirstCycle,
            (false, false) => TriggerReason::WithinLimits,
        };

        ScalingTrigger {
            triggered: reason != TriggerReason::WithinLimits,
            reason,
        }
    }
}
