//! [`ConfigRunner`] backed by local `git`, `ansible-*` and `ssh` binaries

use super::{ConfigRunner, PlaybookRun};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

/// Runs configuration tools as child processes. Their stdout and stderr
/// are passed through to ours.
pub struct CommandRunner {
    private_key: PathBuf,
}

impl CommandRunner {
    pub fn new(private_key: impl Into<PathBuf>) -> Self {
        Self {
            private_key: private_key.into(),
        }
    }

    fn playbook_command(&self, run: &PlaybookRun) -> Command {
        let mut cmd = Command::new("ansible-playbook");
        cmd.arg("-i")
            .arg(&run.inventory)
            .arg("--tags")
            .arg(&run.tag)
            .arg("--private-key")
            .arg(&self.private_key)
            .arg("--user")
            .arg(&run.user);
        if let Some(extra_vars) = &run.extra_vars {
            cmd.arg("-e").arg(format!("@{}", extra_vars.display()));
        }
        if let Some(token) = &run.join_token {
            cmd.arg("-e").arg(format!("join_token={}", token));
        }
        cmd.arg(&run.playbook);
        cmd
    }

    fn ssh_command(&self, user: &str, address: IpAddr, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&self.private_key)
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg(format!("{}@{}", user, address))
            .arg(command);
        cmd
    }
}

async fn run(mut cmd: Command, description: &str) -> Result<()> {
    info!("Running {}", description);
    let status = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("Failed to execute {}", description))?;

    if !status.success() {
        bail!("{} exited with {}", description, status);
    }
    info!("{} succeeded", description);
    Ok(())
}

#[async_trait]
impl ConfigRunner for CommandRunner {
    async fn sync_repository(&self, url: &str, dest: &Path) -> Result<()> {
        if dest.join(".git").is_dir() {
            info!(repo = %url, "Repository already cloned, pulling latest from origin");
            let mut cmd = Command::new("git");
            cmd.arg("-C").arg(dest).arg("pull");
            return run(cmd, "git pull").await;
        }

        let mut cmd = Command::new("git");
        cmd.arg("clone").arg(url).arg(dest);
        run(cmd, "git clone").await
    }

    async fn install_requirements(&self, requirements: &Path) -> Result<()> {
        let mut cmd = Command::new("ansible-galaxy");
        cmd.arg("collection").arg("install").arg("-r").arg(requirements);
        run(cmd, "ansible-galaxy collection install").await
    }

    async fn run_playbook(&self, playbook: &PlaybookRun) -> Result<()> {
        run(self.playbook_command(playbook), "ansible-playbook").await
    }

    async fn run_remote_join(&self, user: &str, address: IpAddr, command: &str) -> Result<()> {
        run(self.ssh_command(user, address, command), "remote join").await
    }
}
