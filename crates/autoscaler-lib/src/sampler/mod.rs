//! Cluster utilization sampling
//!
//! One poll cycle lists the cluster nodes, reads each node's usage and
//! reduces the result to a single CPU/memory utilization pair. The
//! [`ScaleGate`] turns that pair into a provisioning decision.

mod gate;
mod kube_metrics;
mod quantity;


pub use gate::{ScaleGate, ScalingTrigger, TriggerReason};
pub use kube_metrics::KubeMetricsProvider;
pub use quantity::{parse_bytes, parse_cpu_millis};

use crate::models::{NodeCapacity, NodeSample, NodeUsage};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Source of node capacity and usage figures
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// List every node with its allocatable capacity
    async fn list_nodes(&self) -> Result<Vec<NodeCapacity>>;

    /// Current usage of a single node
    async fn node_usage(&self, name: &str) -> Result<NodeUsage>;
}

/// Errors raised while sampling or reducing utilization
#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("failed to list cluster nodes: {0:#}")]
    ListNodes(anyhow::Error),

    #[error("failed to read usage of node {node}: {error:#}")]
    NodeUsage { node: String, error: anyhow::Error },

    #[error("cluster reported zero nodes")]
    EmptyCluster,
}

/// Aggregate utilization in percent of allocatable capacity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Utilization {
    pub cpu_ratio: f64,
    pub mem_ratio: f64,
}

/// Per-node samples collected in one poll cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterSnapshot {
    pub nodes: Vec<NodeSample>,
}

impl ClusterSnapshot {
    pub fn new(nodes: Vec<NodeSample>) -> Self {
        Self { nodes }
    }

    /// Average the per-node CPU and memory ratios across all nodes.
    ///
    /// A node with a non-positive allocatable value contributes zero for
    /// that resource; it still counts towards the divisor.
    pub fn utilization(&self) -> Result<Utilization, SamplingError> {
        if self.nodes.is_empty() {
            return Err(SamplingError::EmptyCluster);
        }

        let mut cpu_total = 0.0;
        let mut mem_total = 0.0;

        for node in &self.nodes {
            cpu_total += percent_of(
                &node.name,
                "cpu",
                node.used_cpu_millis,
                node.allocatable_cpu_millis,
            );
            mem_total += percent_of(
                &node.name,
                "memory",
                node.used_mem_bytes,
                node.allocatable_mem_bytes,
            );
        }

        let count = self.nodes.len() as f64;
        Ok(Utilization {
            cpu_ratio: cpu_total / count,
            mem_ratio: mem_total / count,
        })
    }
}

fn percent_of(node: &str, resource: &str, used: i64, allocatable: i64) -> f64 {
    if allocatable <= 0 {
        warn!(
            node = %node,
            resource = resource,
            allocatable = allocatable,
            "Non-positive allocatable capacity, counting node as idle"
        );
        return 0.0;
    }
    used as f64 / allocatable as f64 * 100.0
}

/// Takes one utilization sample across the whole cluster
pub struct UtilizationSampler {
    provider: Arc<dyn MetricsProvider>,
}

impl UtilizationSampler {
    pub fn new(provider: Arc<dyn MetricsProvider>) -> Self {
        Self { provider }
    }

    /// Fetch capacity and usage for every node. Any failure aborts the
    /// sample; the next cycle simply tries again.
    pub async fn sample(&self) -> Result<ClusterSnapshot, SamplingError> {
        let nodes = self
            .provider
            .list_nodes()
            .await
            .map_err(SamplingError::ListNodes)?;

        let mut samples = Vec::with_capacity(nodes.len());
        for capacity in nodes {
            let usage = self
                .provider
                .node_usage(&capacity.name)
                .await
                .map_err(|error| SamplingError::NodeUsage {
                    node: capacity.name.clone(),
                    error,
                })?;

            debug!(
                node = %capacity.name,
                used_cpu_millis = usage.used_cpu_millis,
                allocatable_cpu_millis = capacity.allocatable_cpu_millis,
                used_mem_bytes = usage.used_mem_bytes,
                allocatable_mem_bytes = capacity.allocatable_mem_bytes,
                "Sampled node"
            );
            samples.push(NodeSample::new(capacity, usage));
        }

        Ok(ClusterSnapshot::new(samples))
    }
}
