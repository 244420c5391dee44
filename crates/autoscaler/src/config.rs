//! Autoscaler configuration
//!
//! Values are layered from a secrets directory (one file per key), then
//! `AUTOSCALER_*` environment variables, then `POSTGRES_*` environment
//! variables. Later sources win.

use autoscaler_lib::join::{DirectJoin, JoinConfiguration, PlaybookJoin};
use autoscaler_lib::provisioner::{GuestConfig, ProvisioningSpec, ProxmoxConfig};
use autoscaler_lib::record::PostgresConfig;
use autoscaler_lib::sampler::ScaleGate;
use config::{Environment, Map, Source, Value};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SECRETS_DIR: &str = "/etc/secrets";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoscalerConfig {
    /// Mean CPU utilization (percent) above which a node is added
    pub cpu_limit: f64,
    /// Mean memory utilization (percent) above which a node is added
    pub memory_limit: f64,
    /// Hypervisor node new VMs are created on
    pub node_name: String,
    pub template_name: String,
    /// JSON object of VM config keys applied to every clone
    pub cloud_init: String,
    /// Enable the guest agent on every clone; bring-up waits on the agent
    /// and reads guest addresses through it
    #[serde(default = "default_force_agent")]
    pub force_agent: bool,

    pub pm_api_url: String,
    pub pm_user: String,
    #[serde(default, alias = "pm_password")]
    pub pm_pass: String,
    #[serde(default)]
    pub pm_otp: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    /// Seconds to wait for hypervisor tasks
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,

    #[serde(default = "default_loop_interval")]
    pub loop_interval_secs: u64,
    #[serde(default = "default_interface_filter")]
    pub interface_filter: String,

    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_key")]
    pub ssh_key: PathBuf,
    #[serde(default)]
    pub ansible_repo: Option<String>,
    /// Playbook path inside the repository
    #[serde(default)]
    pub playbook: Option<String>,
    #[serde(default)]
    pub requirements: Option<String>,
    #[serde(default)]
    pub extra_vars: Option<PathBuf>,
    #[serde(default)]
    pub join_token: Option<String>,
    /// Command run over SSH when no playbook is configured
    #[serde(default)]
    pub join_command: Option<String>,
    #[serde(default = "default_inventory_path")]
    pub inventory_path: PathBuf,
    #[serde(default = "default_repo_location")]
    pub repo_location: PathBuf,
    #[serde(default = "default_ansible_tag")]
    pub ansible_tag: String,

    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,
    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,
    pub postgres_db: String,
    pub postgres_user: String,
    pub postgres_password: String,
}

fn default_force_agent() -> bool {
    true
}

fn default_task_timeout() -> u64 {
    300
}

fn default_loop_interval() -> u64 {
    10
}

fn default_interface_filter() -> String {
    autoscaler_lib::provisioner::DEFAULT_INTERFACE_FILTER.to_string()
}

fn default_ssh_user() -> String {
    "admin".to_string()
}

fn default_ssh_key() -> PathBuf {
    PathBuf::from("/etc/ssh/id_rsa")
}

fn default_inventory_path() -> PathBuf {
    PathBuf::from("/root/hosts")
}

fn default_repo_location() -> PathBuf {
    PathBuf::from("/root/ansible")
}

fn default_ansible_tag() -> String {
    "workers".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_postgres_host() -> String {
    "postgres-db-lb".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

/// Map a secret file name to a config key: `cpuLimit` and `CPU_LIMIT`
/// both become `cpu_limit`.
pub fn secret_key(file_name: &str) -> String {
    let mut key = String::with_capacity(file_name.len() + 4);
    let mut prev_lower = false;
    for c in file_name.chars() {
        if c == '-' {
            key.push('_');
            prev_lower = false;
            continue;
        }
        if c.is_ascii_uppercase() && prev_lower {
            key.push('_');
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        key.push(c.to_ascii_lowercase());
    }
    key
}

/// Config source reading one value per file from a mounted secret
#[derive(Debug, Clone)]
pub struct SecretsDir {
    path: PathBuf,
}

impl SecretsDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Source for SecretsDir {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, config::ConfigError> {
        let mut values = Map::new();
        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(values),
            Err(e) => return Err(config::ConfigError::Foreign(Box::new(e))),
        };

        let origin = self.path.display().to_string();
        for entry in entries {
            let entry = entry.map_err(|e| config::ConfigError::Foreign(Box::new(e)))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Kubernetes secret mounts carry `..data` style bookkeeping entries
            if name.starts_with('.') || !entry.path().is_file() {
                continue;
            }

            let raw = std::fs::read_to_string(entry.path())
                .map_err(|e| config::ConfigError::Foreign(Box::new(e)))?;
            let value = raw.trim().trim_matches('"').to_string();
            values.insert(secret_key(&name), Value::new(Some(&origin), value));
        }

        Ok(values)
    }
}

impl AutoscalerConfig {
    /// Load from the secrets directory and the process environment
    pub fn load(secrets_dir: &Path) -> Result<Self, ConfigError> {
        Self::load_with_env(secrets_dir, None)
    }

    /// Load with an explicit environment instead of the process one
    pub fn load_with_env(
        secrets_dir: &Path,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(SecretsDir::new(secrets_dir))
            .add_source(Environment::with_prefix("AUTOSCALER").source(env.clone()))
            .add_source(
                Environment::with_prefix("POSTGRES")
                    .keep_prefix(true)
                    .source(env),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, limit) in [("cpu_limit", self.cpu_limit), ("memory_limit", self.memory_limit)] {
            if !(limit > 0.0 && limit <= 100.0) {
                return Err(invalid(field, format!("{} is not a percentage in (0, 100]", limit)));
            }
        }
        if self.node_name.trim().is_empty() {
            return Err(invalid("node_name", "must not be empty"));
        }
        if self.template_name.trim().is_empty() {
            return Err(invalid("template_name", "must not be empty"));
        }
        if self.task_timeout == 0 {
            return Err(invalid("task_timeout", "must be positive"));
        }
        if self.loop_interval_secs == 0 {
            return Err(invalid("loop_interval_secs", "must be positive"));
        }
        url::Url::parse(&self.pm_api_url).map_err(|e| invalid("pm_api_url", e.to_string()))?;
        self.guest_config()?;
        self.join_configuration()?;
        Ok(())
    }

    pub fn scale_gate(&self) -> ScaleGate {
        ScaleGate::new(self.cpu_limit, self.memory_limit)
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_secs)
    }

    pub fn guest_config(&self) -> Result<GuestConfig, ConfigError> {
        GuestConfig::from_json(&self.cloud_init).map_err(|e| invalid("cloud_init", format!("{:#}", e)))
    }

    pub fn provisioning_spec(&self) -> Result<ProvisioningSpec, ConfigError> {
        Ok(
            ProvisioningSpec::new(&self.template_name, &self.node_name, self.guest_config()?)
                .with_force_agent(self.force_agent),
        )
    }

    pub fn proxmox(&self) -> ProxmoxConfig {
        ProxmoxConfig {
            api_url: self.pm_api_url.clone(),
            user: self.pm_user.clone(),
            password: self.pm_pass.clone(),
            otp: self.pm_otp.clone().filter(|otp| !otp.is_empty()),
            insecure: self.insecure,
            task_timeout: Duration::from_secs(self.task_timeout),
        }
    }

    pub fn postgres(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.postgres_host.clone(),
            port: self.postgres_port,
            database: self.postgres_db.clone(),
            user: self.postgres_user.clone(),
            password: self.postgres_password.clone(),
        }
    }

    /// Playbook mode when both the repository and the playbook are set,
    /// otherwise a direct join command is required.
    pub fn join_configuration(&self) -> Result<JoinConfiguration, ConfigError> {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());

        match (non_empty(&self.ansible_repo), non_empty(&self.playbook)) {
            (Some(repo_url), Some(playbook)) => Ok(JoinConfiguration::Playbook(PlaybookJoin {
                repo_url,
                repo_location: self.repo_location.clone(),
                playbook: PathBuf::from(playbook),
                requirements: non_empty(&self.requirements).map(PathBuf::from),
                inventory_path: self.inventory_path.clone(),
                tag: self.ansible_tag.clone(),
                ssh_user: self.ssh_user.clone(),
                extra_vars: self.extra_vars.clone(),
                join_token: non_empty(&self.join_token),
            })),
            _ => match non_empty(&self.join_command) {
                Some(command) => Ok(JoinConfiguration::Direct(DirectJoin {
                    ssh_user: self.ssh_user.clone(),
                    command,
                })),
                None => Err(invalid(
                    "join_command",
                    "required unless both ansible_repo and playbook are set",
                )),
            },
        }
    }
}
