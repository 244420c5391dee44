//! Tests for join orchestration

use super::*;
use crate::models::VmHandle;
use crate::provisioner::{
    GuestConfig, LifecycleController, ProvisionedVm, ProvisioningAttempt, ProvisioningState,
};
use crate::test_support::{EventLog, MockVmProvider, RecordingLabeler, ScriptedRunner};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

fn vm() -> ProvisionedVm {
    ProvisionedVm {
        handle: VmHandle::new(142, "loki"),
        hostname: "kworker-142".to_string(),
        address: "10.0.0.5".parse().unwrap(),
        guest: GuestConfig::default(),
    }
}

fn playbook_config(dir: &TempDir) -> PlaybookJoin {
    PlaybookJoin {
        repo_url: "https://git.example.com/infra/k8s-ansible.git".to_string(),
        repo_location: dir.path().join("ansible"),
        playbook: PathBuf::from("playbooks/join.yaml"),
        requirements: Some(PathBuf::from("requirements.yml")),
        inventory_path: dir.path().join("inventory").join("hosts"),
        tag: "workers".to_string(),
        ssh_user: "admin".to_string(),
        extra_vars: None,
        join_token: Some("abcdef.0123456789abcdef".to_string()),
    }
}

fn direct_config() -> DirectJoin {
    DirectJoin {
        ssh_user: "admin".to_string(),
        command: "sudo kubeadm join 10.0.0.1:6443 --token abcdef.0123456789abcdef".to_string(),
    }
}

struct Harness {
    provider: Arc<MockVmProvider>,
    runner: Arc<ScriptedRunner>,
    labeler: Arc<RecordingLabeler>,
    orchestrator: JoinOrchestrator,
}

impl Harness {
    fn new(configuration: JoinConfiguration, runner: ScriptedRunner, labeler: RecordingLabeler) -> Self {
        let provider = Arc::new(MockVmProvider::new(EventLog::default()));
        let runner = Arc::new(runner);
        let labeler = Arc::new(labeler);
        let lifecycle = Arc::new(LifecycleController::new(provider.clone()));
        let orchestrator =
            JoinOrchestrator::new(configuration, runner.clone(), labeler.clone(), lifecycle);
        Self {
            provider,
            runner,
            labeler,
            orchestrator,
        }
    }

    /// Attempt positioned where the join stage picks it up
    fn attempt() -> ProvisioningAttempt {
        let mut attempt = ProvisioningAttempt::new();
        attempt.assign_vm(VmHandle::new(142, "loki"));
        attempt.advance(ProvisioningState::AwaitingNetwork);
        attempt
    }
}

mod playbook_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_playbook_join_labels_node() {
        let dir = TempDir::new().unwrap();
        let config = playbook_config(&dir);
        let harness = Harness::new(
            JoinConfiguration::Playbook(config.clone()),
            ScriptedRunner::new(EventLog::default()),
            RecordingLabeler::default(),
        );
        let mut attempt = Harness::attempt();

        let outcome = harness.orchestrator.join(&vm(), &mut attempt).await;

        assert_eq!(outcome, JoinOutcome::Joined);
        assert_eq!(attempt.state(), ProvisioningState::Joined);
        assert!(attempt.history().contains(&ProvisioningState::Configuring));
        assert!(attempt.history().contains(&ProvisioningState::Validating));

        let inventory = std::fs::read_to_string(&config.inventory_path).unwrap();
        assert_eq!(
            inventory,
            "[workers]\nkworker-142 ansible_host=10.0.0.5 ansible_port=22 ansible_user=admin\n"
        );

        assert_eq!(harness.runner.sync_calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.runner.requirements_calls.load(Ordering::SeqCst), 1);
        let runs = harness.runner.playbook_runs.lock().unwrap().clone();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].playbook, dir.path().join("ansible/playbooks/join.yaml"));
        assert_eq!(runs[0].inventory, config.inventory_path);
        assert_eq!(runs[0].join_token.as_deref(), Some("abcdef.0123456789abcdef"));

        let labels = harness.labeler.calls.lock().unwrap().clone();
        assert_eq!(labels, vec![("kworker-142".to_string(), default_labels())]);
        assert_eq!(MockVmProvider::calls(&harness.provider.delete_calls), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playbook_retried_exactly_once() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(
            JoinConfiguration::Playbook(playbook_config(&dir)),
            ScriptedRunner::new(EventLog::default()).with_playbook_failures(1),
            RecordingLabeler::default(),
        );

        let outcome = harness.orchestrator.join(&vm(), &mut Harness::attempt()).await;

        assert!(outcome.is_joined());
        assert_eq!(harness.runner.playbook_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_playbook_failure_rolls_back() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(
            JoinConfiguration::Playbook(playbook_config(&dir)),
            ScriptedRunner::new(EventLog::default()).with_playbook_failures(5),
            RecordingLabeler::default(),
        );
        let mut attempt = Harness::attempt();

        let outcome = harness.orchestrator.join(&vm(), &mut attempt).await;

        assert!(matches!(outcome, JoinOutcome::Unjoinable(ref reason) if reason.contains("playbook")));
        assert_eq!(harness.runner.playbook_calls.load(Ordering::SeqCst), 2);
        assert_eq!(MockVmProvider::calls(&harness.provider.delete_calls), 1);
        assert_eq!(attempt.state(), ProvisioningState::RolledBack);
        assert!(harness.labeler.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwritable_inventory_is_unjoinable() {
        let dir = TempDir::new().unwrap();
        // A regular file where the inventory directory should be
        std::fs::write(dir.path().join("inventory"), "not a directory").unwrap();
        let harness = Harness::new(
            JoinConfiguration::Playbook(playbook_config(&dir)),
            ScriptedRunner::new(EventLog::default()),
            RecordingLabeler::default(),
        );

        let outcome = harness.orchestrator.join(&vm(), &mut Harness::attempt()).await;

        assert!(matches!(outcome, JoinOutcome::Unjoinable(ref reason) if reason.contains("3 attempts")));
        assert_eq!(harness.runner.playbook_calls.load(Ordering::SeqCst), 0);
        assert_eq!(MockVmProvider::calls(&harness.provider.delete_calls), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repository_sync_failure_is_unjoinable() {
        let dir = TempDir::new().unwrap();
        let mut runner = ScriptedRunner::new(EventLog::default());
        runner.fail_sync = true;
        let harness = Harness::new(
            JoinConfiguration::Playbook(playbook_config(&dir)),
            runner,
            RecordingLabeler::default(),
        );

        let outcome = harness.orchestrator.join(&vm(), &mut Harness::attempt()).await;

        assert!(!outcome.is_joined());
        assert_eq!(harness.runner.playbook_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requirements_skipped_when_not_configured() {
        let dir = TempDir::new().unwrap();
        let mut config = playbook_config(&dir);
        config.requirements = None;
        let harness = Harness::new(
            JoinConfiguration::Playbook(config),
            ScriptedRunner::new(EventLog::default()),
            RecordingLabeler::default(),
        );

        let outcome = harness.orchestrator.join(&vm(), &mut Harness::attempt()).await;

        assert!(outcome.is_joined());
        assert_eq!(harness.runner.requirements_calls.load(Ordering::SeqCst), 0);
    }
}

mod direct_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_direct_join() {
        let harness = Harness::new(
            JoinConfiguration::Direct(direct_config()),
            ScriptedRunner::new(EventLog::default()),
            RecordingLabeler::default(),
        );

        let outcome = harness.orchestrator.join(&vm(), &mut Harness::attempt()).await;

        assert!(outcome.is_joined());
        let calls = harness.runner.remote_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "admin");
        assert_eq!(calls[0].1.to_string(), "10.0.0.5");
        assert!(calls[0].2.starts_with("sudo kubeadm join"));
        assert_eq!(harness.runner.sync_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_join_failure_rolls_back_without_retry() {
        let mut runner = ScriptedRunner::new(EventLog::default());
        runner.fail_remote_join = true;
        let harness = Harness::new(
            JoinConfiguration::Direct(direct_config()),
            runner,
            RecordingLabeler::default(),
        );
        let mut attempt = Harness::attempt();

        let outcome = harness.orchestrator.join(&vm(), &mut attempt).await;

        assert!(!outcome.is_joined());
        assert_eq!(harness.runner.remote_calls.lock().unwrap().len(), 1);
        assert_eq!(MockVmProvider::calls(&harness.provider.delete_calls), 1);
        assert_eq!(attempt.state(), ProvisioningState::RolledBack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_label_failure_is_not_fatal() {
        let labeler = RecordingLabeler {
            fail: true,
            ..RecordingLabeler::default()
        };
        let harness = Harness::new(
            JoinConfiguration::Direct(direct_config()),
            ScriptedRunner::new(EventLog::default()),
            labeler,
        );
        let mut attempt = Harness::attempt();

        let outcome = harness.orchestrator.join(&vm(), &mut attempt).await;

        assert!(outcome.is_joined());
        assert_eq!(attempt.state(), ProvisioningState::Joined);
        assert_eq!(harness.labeler.calls.lock().unwrap().len(), 1);
        assert_eq!(MockVmProvider::calls(&harness.provider.delete_calls), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_labels() {
        let harness = Harness::new(
            JoinConfiguration::Direct(direct_config()),
            ScriptedRunner::new(EventLog::default()),
            RecordingLabeler::default(),
        );
        let labels = BTreeMap::from([("pool".to_string(), "burst".to_string())]);
        let orchestrator = harness.orchestrator.with_labels(labels.clone());

        orchestrator.label(&vm()).await;

        let calls = harness.labeler.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("kworker-142".to_string(), labels)]);
    }
}

#[test]
fn test_join_mode() {
    assert_eq!(JoinConfiguration::Direct(direct_config()).mode(), "direct");
    assert_eq!(
        JoinOutcome::Unjoinable("ssh refused".to_string()).to_string(),
        "unjoinable: ssh refused"
    );
}
