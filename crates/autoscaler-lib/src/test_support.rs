//! Hand-written capability mocks shared by the unit tests

use crate::join::{ConfigRunner, NodeLabeler, PlaybookRun};
use crate::models::{GuestInterface, NodeCapacity, NodeUsage, RunState, VmHandle, VmRecord};
use crate::provisioner::{CloneRequest, GuestConfig, HypervisorError, VmProvider};
use crate::record::{RecordStore, StoredRecord};
use crate::sampler::MetricsProvider;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Ordered log of calls across several mocks
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Hypervisor that succeeds after configurable numbers of failures
pub struct MockVmProvider {
    pub templates: Vec<VmHandle>,
    pub next_id: u32,
    pub fail_clone: bool,
    /// `start` calls that fail before one succeeds
    pub start_failures: AtomicUsize,
    /// Run-state reports `running` only once this many starts were issued
    pub running_after_starts: usize,
    pub agent_failures: AtomicUsize,
    /// Interface listings that come back without an address
    pub network_failures: AtomicUsize,
    pub interfaces: Vec<GuestInterface>,
    /// `delete` calls that fail with an API error before succeeding
    pub delete_failures: AtomicUsize,
    /// Report the VM as already gone instead of deleting it
    pub already_deleted: bool,

    pub clone_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub run_state_calls: AtomicUsize,
    pub ping_calls: AtomicUsize,
    pub interface_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub clone_requests: Mutex<Vec<(VmHandle, VmHandle, String)>>,
    pub pushed_configs: Mutex<Vec<GuestConfig>>,
    pub events: EventLog,
}

impl MockVmProvider {
    pub fn new(events: EventLog) -> Self {
        Self {
            templates: vec![VmHandle::new(9000, "loki")],
            next_id: 142,
            fail_clone: false,
            start_failures: AtomicUsize::new(0),
            running_after_starts: 1,
            agent_failures: AtomicUsize::new(0),
            network_failures: AtomicUsize::new(0),
            interfaces: vec![
                GuestInterface {
                    name: "lo".to_string(),
                    addresses: vec!["127.0.0.1".parse().unwrap()],
                },
                GuestInterface {
                    name: "eth0".to_string(),
                    addresses: vec!["10.0.0.5".parse().unwrap(), "fe80::1".parse().unwrap()],
                },
            ],
            delete_failures: AtomicUsize::new(0),
            already_deleted: false,
            clone_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            run_state_calls: AtomicUsize::new(0),
            ping_calls: AtomicUsize::new(0),
            interface_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            clone_requests: Mutex::new(Vec::new()),
            pushed_configs: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VmProvider for MockVmProvider {
    async fn find_template_instances(&self, _name: &str) -> Result<Vec<VmHandle>, HypervisorError> {
        Ok(self.templates.clone())
    }

    async fn next_free_id(&self) -> Result<u32, HypervisorError> {
        Ok(self.next_id)
    }

    async fn clone_instance(&self, request: &CloneRequest<'_>) -> Result<(), HypervisorError> {
        self.clone_calls.fetch_add(1, Ordering::SeqCst);
        self.events.push("clone");
        if self.fail_clone {
            return Err(HypervisorError::Api {
                status: 500,
                body: "storage full".to_string(),
            });
        }
        self.clone_requests.lock().unwrap().push((
            request.source.clone(),
            request.target.clone(),
            request.name.to_string(),
        ));
        Ok(())
    }

    async fn push_config(&self, _vm: &VmHandle, config: &GuestConfig) -> Result<(), HypervisorError> {
        self.pushed_configs.lock().unwrap().push(config.clone());
        Ok(())
    }

    async fn wait_for_clone_source_shutdown(&self, _vm: &VmHandle) -> Result<(), HypervisorError> {
        Ok(())
    }

    async fn start(&self, _vm: &VmHandle) -> Result<(), HypervisorError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.events.push("start");
        if take_failure(&self.start_failures) {
            return Err(HypervisorError::Api {
                status: 500,
                body: "start failed".to_string(),
            });
        }
        Ok(())
    }

    async fn run_state(&self, _vm: &VmHandle) -> Result<RunState, HypervisorError> {
        self.run_state_calls.fetch_add(1, Ordering::SeqCst);
        if Self::calls(&self.start_calls) >= self.running_after_starts {
            Ok(RunState::Running)
        } else {
            Ok(RunState::Stopped)
        }
    }

    async fn ping_agent(&self, _vm: &VmHandle) -> Result<(), HypervisorError> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.agent_failures) {
            return Err(HypervisorError::NotReady("agent not running".to_string()));
        }
        Ok(())
    }

    async fn guest_interfaces(&self, _vm: &VmHandle) -> Result<Vec<GuestInterface>, HypervisorError> {
        self.interface_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.network_failures) {
            return Ok(vec![GuestInterface {
                name: "eth0".to_string(),
                addresses: vec![],
            }]);
        }
        Ok(self.interfaces.clone())
    }

    async fn stop(&self, vm: &VmHandle) -> Result<(), HypervisorError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.already_deleted {
            return Err(HypervisorError::NotFound(format!("vm {} does not exist", vm.vmid)));
        }
        Ok(())
    }

    async fn delete(&self, vm: &VmHandle) -> Result<(), HypervisorError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.events.push("delete");
        if self.already_deleted {
            return Err(HypervisorError::NotFound(format!("vm {} does not exist", vm.vmid)));
        }
        if take_failure(&self.delete_failures) {
            return Err(HypervisorError::Api {
                status: 500,
                body: "vm locked".to_string(),
            });
        }
        Ok(())
    }
}

/// Record store whose first inserts fail
pub struct FlakyRecordStore {
    failures: AtomicUsize,
    pub insert_calls: AtomicUsize,
    pub schema_calls: AtomicUsize,
    stored: Mutex<Vec<VmRecord>>,
    events: EventLog,
}

impl FlakyRecordStore {
    pub fn new(failures: usize, events: EventLog) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            insert_calls: AtomicUsize::new(0),
            schema_calls: AtomicUsize::new(0),
            stored: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn stored(&self) -> Vec<VmRecord> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for FlakyRecordStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert(&self, record: &VmRecord) -> Result<StoredRecord> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures) {
            bail!("relation \"vms\" does not exist");
        }
        self.events.push("persist");

        let mut stored = self.stored.lock().unwrap();
        let superseded = match stored.iter_mut().find(|r| r.vmid == record.vmid) {
            Some(existing) => {
                *existing = record.clone();
                true
            }
            None => {
                stored.push(record.clone());
                false
            }
        };
        Ok(StoredRecord {
            vmid: record.vmid,
            superseded,
        })
    }
}

/// Config runner with scripted playbook and join results
pub struct ScriptedRunner {
    pub fail_sync: bool,
    pub fail_requirements: bool,
    /// Playbook runs that fail before one succeeds
    pub playbook_failures: AtomicUsize,
    pub fail_remote_join: bool,

    pub sync_calls: AtomicUsize,
    pub requirements_calls: AtomicUsize,
    pub playbook_calls: AtomicUsize,
    pub remote_calls: Mutex<Vec<(String, IpAddr, String)>>,
    pub playbook_runs: Mutex<Vec<PlaybookRun>>,
    events: EventLog,
}

impl ScriptedRunner {
    pub fn new(events: EventLog) -> Self {
        Self {
            fail_sync: false,
            fail_requirements: false,
            playbook_failures: AtomicUsize::new(0),
            fail_remote_join: false,
            sync_calls: AtomicUsize::new(0),
            requirements_calls: AtomicUsize::new(0),
            playbook_calls: AtomicUsize::new(0),
            remote_calls: Mutex::new(Vec::new()),
            playbook_runs: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn with_playbook_failures(self, failures: usize) -> Self {
        self.playbook_failures.store(failures, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl ConfigRunner for ScriptedRunner {
    async fn sync_repository(&self, _url: &str, _dest: &Path) -> Result<()> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sync {
            bail!("repository not found");
        }
        Ok(())
    }

    async fn install_requirements(&self, _requirements: &Path) -> Result<()> {
        self.requirements_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_requirements {
            bail!("galaxy unreachable");
        }
        Ok(())
    }

    async fn run_playbook(&self, run: &PlaybookRun) -> Result<()> {
        self.playbook_calls.fetch_add(1, Ordering::SeqCst);
        self.events.push("playbook");
        self.playbook_runs.lock().unwrap().push(run.clone());
        if take_failure(&self.playbook_failures) {
            bail!("ansible-playbook exited with exit status: 2");
        }
        Ok(())
    }

    async fn run_remote_join(&self, user: &str, address: IpAddr, command: &str) -> Result<()> {
        self.events.push("remote_join");
        self.remote_calls
            .lock()
            .unwrap()
            .push((user.to_string(), address, command.to_string()));
        if self.fail_remote_join {
            return Err(anyhow!("ssh exited with exit status: 255"));
        }
        Ok(())
    }
}

/// Labeler that records calls and optionally fails
#[derive(Default)]
pub struct RecordingLabeler {
    pub fail: bool,
    pub calls: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

#[async_trait]
impl NodeLabeler for RecordingLabeler {
    async fn label_node(&self, node: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((node.to_string(), labels.clone()));
        if self.fail {
            bail!("nodes \"{}\" not found", node);
        }
        Ok(())
    }
}

/// Metrics provider with settable figures: `(name, cpu_alloc, mem_alloc, cpu_used, mem_used)`
pub struct FixedMetrics {
    nodes: Mutex<Vec<(String, i64, i64, i64, i64)>>,
}

impl FixedMetrics {
    pub fn new(nodes: &[(&str, i64, i64, i64, i64)]) -> Self {
        let metrics = Self {
            nodes: Mutex::new(Vec::new()),
        };
        metrics.set(nodes);
        metrics
    }

    pub fn set(&self, nodes: &[(&str, i64, i64, i64, i64)]) {
        *self.nodes.lock().unwrap() = nodes
            .iter()
            .map(|(n, ca, ma, cu, mu)| (n.to_string(), *ca, *ma, *cu, *mu))
            .collect();
    }
}

#[async_trait]
impl MetricsProvider for FixedMetrics {
    async fn list_nodes(&self) -> Result<Vec<NodeCapacity>> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .map(|(name, cpu, mem, _, _)| NodeCapacity {
                name: name.clone(),
                allocatable_cpu_millis: *cpu,
                allocatable_mem_bytes: *mem,
            })
            .collect())
    }

    async fn node_usage(&self, name: &str) -> Result<NodeUsage> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|(n, ..)| n == name)
            .map(|(_, _, _, cpu, mem)| NodeUsage {
                used_cpu_millis: *cpu,
                used_mem_bytes: *mem,
            })
            .ok_or_else(|| anyhow!("no metrics for {}", name))
    }
}
