//! Core data models for the autoscaler

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Allocatable capacity of a cluster node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub name: String,
    pub allocatable_cpu_millis: i64,
    pub allocatable_mem_bytes: i64,
}

/// Current usage of a cluster node as reported by the metrics API
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeUsage {
    pub used_cpu_millis: i64,
    pub used_mem_bytes: i64,
}

/// Capacity and usage of one node within a poll cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSample {
    pub name: String,
    pub allocatable_cpu_millis: i64,
    pub allocatable_mem_bytes: i64,
    pub used_cpu_millis: i64,
    pub used_mem_bytes: i64,
}

impl NodeSample {
    pub fn new(capacity: NodeCapacity, usage: NodeUsage) -> Self {
        Self {
            name: capacity.name,
            allocatable_cpu_millis: capacity.allocatable_cpu_millis,
            allocatable_mem_bytes: capacity.allocatable_mem_bytes,
            used_cpu_millis: usage.used_cpu_millis,
            used_mem_bytes: usage.used_mem_bytes,
        }
    }
}

/// A specific VM instance on the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmHandle {
    pub vmid: u32,
    pub node: String,
}

impl VmHandle {
    pub fn new(vmid: u32, node: impl Into<String>) -> Self {
        Self {
            vmid,
            node: node.into(),
        }
    }
}

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.vmid)
    }
}

/// Power state reported by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Stopped,
    Paused,
    #[serde(other)]
    Unknown,
}

impl RunState {
    pub fn from_status(status: &str) -> Self {
        match status {
            "running" => RunState::Running,
            "stopped" => RunState::Stopped,
            "paused" => RunState::Paused,
            _ => RunState::Unknown,
        }
    }
}

/// Network interface as seen by the in-guest agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInterface {
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

/// Persisted metadata for a cloned VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub vmid: u32,
    pub node: String,
    pub pool: Option<String>,
    pub vmtype: String,
    pub memory: i32,
    pub cores: i32,
}
