//! Node labeling through the Kubernetes API

use super::NodeLabeler;
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;

const FIELD_MANAGER: &str = "pve-autoscaler";

/// Applies labels with a merge patch on the `Node` object
pub struct KubeNodeLabeler {
    nodes: Api<Node>,
}

impl KubeNodeLabeler {
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client),
        }
    }
}

fn label_patch(labels: &BTreeMap<String, String>) -> Value {
    json!({
        "metadata": {
            "labels": labels
        }
    })
}

#[async_trait]
impl NodeLabeler for KubeNodeLabeler {
    async fn label_node(&self, node: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let patch = label_patch(labels);
        self.nodes
            .patch(node, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("Failed to label node {}", node))?;
        Ok(())
    }
}
