//! Kubernetes-backed metrics provider
//!
//! Node capacity comes from `Node.status.allocatable`; usage comes from the
//! `metrics.k8s.io/v1beta1` NodeMetrics resource served by metrics-server.

use super::{parse_bytes, parse_cpu_millis, MetricsProvider};
use crate::models::{NodeCapacity, NodeUsage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::{Api, Client};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct NodeMetrics {
    usage: BTreeMap<String, Quantity>,
}

/// Reads node capacity and usage through the Kubernetes API
#[derive(Clone)]
pub struct KubeMetricsProvider {
    client: Client,
}

impl KubeMetricsProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// `metrics.k8s.io/v1beta1` NodeMetrics, served under the `nodes` plural
    fn node_metrics_resource() -> ApiResource {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "NodeMetrics");
        ApiResource::from_gvk_with_plural(&gvk, "nodes")
    }

    fn usage_from(object: DynamicObject, node: &str) -> Result<NodeUsage> {
        let metrics: NodeMetrics = serde_json::from_value(object.data)
            .with_context(|| format!("malformed NodeMetrics for node {}", node))?;

        Ok(NodeUsage {
            used_cpu_millis: parse_cpu_millis(Self::quantity(&metrics.usage, "cpu", node)?)?,
            used_mem_bytes: parse_bytes(Self::quantity(&metrics.usage, "memory", node)?)?,
        })
    }

    fn quantity<'a>(map: &'a BTreeMap<String, Quantity>, key: &str, node: &str) -> Result<&'a str> {
        map.get(key)
            .map(|q| q.0.as_str())
            .with_context(|| format!("node {} does not report {}", node, key))
    }
}

#[async_trait]
impl MetricsProvider for KubeMetricsProvider {
    async fn list_nodes(&self) -> Result<Vec<NodeCapacity>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .context("Failed to list nodes")?;

        let mut capacities = Vec::with_capacity(nodes.items.len());
        for node in nodes.items {
            let name = node
                .metadata
                .name
                .clone()
                .context("node object without a name")?;
            let allocatable = node
                .status
                .and_then(|s| s.allocatable)
                .unwrap_or_default();

            capacities.push(NodeCapacity {
                allocatable_cpu_millis: parse_cpu_millis(Self::quantity(&allocatable, "cpu", &name)?)?,
                allocatable_mem_bytes: parse_bytes(Self::quantity(&allocatable, "memory", &name)?)?,
                name,
            });
        }

        Ok(capacities)
    }

    async fn node_usage(&self, name: &str) -> Result<NodeUsage> {
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &Self::node_metrics_resource());
        let object = api
            .get(name)
            .await
            .with_context(|| format!("Failed to fetch metrics for node {}", name))?;

        Self::usage_from(object, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_metrics(usage: serde_json::Value) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "metrics.k8s.io/v1beta1",
            "kind": "NodeMetrics",
            "metadata": { "name": "kworker-142" },
            "timestamp": "2026-10-18T09:00:00Z",
            "window": "20s",
            "usage": usage,
        }))
        .unwrap()
    }

    #[test]
    fn test_node_metrics_resource() {
        let resource = KubeMetricsProvider::node_metrics_resource();
        assert_eq!(resource.api_version, "metrics.k8s.io/v1beta1");
        assert_eq!(resource.plural, "nodes");
    }

    #[test]
    fn test_usage_from_node_metrics() {
        let object = node_metrics(serde_json::json!({ "cpu": "250000000n", "memory": "2048Ki" }));

        let usage = KubeMetricsProvider::usage_from(object, "kworker-142").unwrap();

        assert_eq!(usage.used_cpu_millis, 250);
        assert_eq!(usage.used_mem_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn test_usage_missing_memory() {
        let object = node_metrics(serde_json::json!({ "cpu": "1" }));

        let err = KubeMetricsProvider::usage_from(object, "kworker-142").unwrap_err();
        assert!(err.to_string().contains("does not report memory"));
    }
}
