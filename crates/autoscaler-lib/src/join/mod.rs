//! Cluster join for freshly provisioned VMs
//!
//! A VM with a reachable address is configured either by an Ansible
//! playbook run or by a single remote join command. The outcome decides
//! whether the node is labeled or rolled back.

mod command;
mod inventory;
mod kube_labeler;
mod orchestrator;

#[cfg(test)]
mod tests;

pub use command::CommandRunner;
pub use inventory::{Inventory, InventoryError, InventoryHost};
pub use kube_labeler::KubeNodeLabeler;
pub use orchestrator::{JoinOrchestrator, JoinPolicies};

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Label key applied to joined worker nodes
pub const WORKER_ROLE_LABEL: &str = "node-role.kubernetes.io/worker";

/// Default labels applied to a joined node
pub fn default_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(WORKER_ROLE_LABEL.to_string(), "worker".to_string())])
}

/// Join through an Ansible playbook kept in a git repository
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookJoin {
    pub repo_url: String,
    /// Local checkout of `repo_url`
    pub repo_location: PathBuf,
    /// Playbook path relative to the checkout
    pub playbook: PathBuf,
    /// Collection requirements file relative to the checkout
    pub requirements: Option<PathBuf>,
    pub inventory_path: PathBuf,
    /// Inventory group the new host is placed in
    pub tag: String,
    pub ssh_user: String,
    /// Extra-vars file passed as `-e @file`
    pub extra_vars: Option<PathBuf>,
    pub join_token: Option<String>,
}

impl PlaybookJoin {
    pub fn playbook_path(&self) -> PathBuf {
        self.repo_location.join(&self.playbook)
    }

    pub fn requirements_path(&self) -> Option<PathBuf> {
        self.requirements
            .as_ref()
            .map(|r| self.repo_location.join(r))
    }
}

/// Join through a single command run over SSH
#[derive(Debug, Clone, PartialEq)]
pub struct DirectJoin {
    pub ssh_user: String,
    pub command: String,
}

/// How new nodes are joined, resolved once at startup
#[derive(Debug, Clone, PartialEq)]
pub enum JoinConfiguration {
    Playbook(PlaybookJoin),
    Direct(DirectJoin),
}

impl JoinConfiguration {
    pub fn mode(&self) -> &'static str {
        match self {
            JoinConfiguration::Playbook(_) => "playbook",
            JoinConfiguration::Direct(_) => "direct",
        }
    }
}

/// Result of configuring a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Unjoinable(String),
}

impl JoinOutcome {
    pub fn is_joined(&self) -> bool {
        matches!(self, JoinOutcome::Joined)
    }
}

impl fmt::Display for JoinOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinOutcome::Joined => f.write_str("joined"),
            JoinOutcome::Unjoinable(reason) => write!(f, "unjoinable: {}", reason),
        }
    }
}

/// Arguments of one `ansible-playbook` invocation
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookRun {
    pub playbook: PathBuf,
    pub inventory: PathBuf,
    pub tag: String,
    pub user: String,
    pub extra_vars: Option<PathBuf>,
    pub join_token: Option<String>,
}

/// Runs the configuration tooling against a new host
#[async_trait]
pub trait ConfigRunner: Send + Sync {
    /// Clone `url` into `dest`, or pull if the checkout already exists
    async fn sync_repository(&self, url: &str, dest: &Path) -> Result<()>;

    async fn install_requirements(&self, requirements: &Path) -> Result<()>;

    async fn run_playbook(&self, run: &PlaybookRun) -> Result<()>;

    async fn run_remote_join(&self, user: &str, address: IpAddr, command: &str) -> Result<()>;
}

/// Applies labels to a cluster node
#[async_trait]
pub trait NodeLabeler: Send + Sync {
    async fn label_node(&self, node: &str, labels: &BTreeMap<String, String>) -> Result<()>;
}
