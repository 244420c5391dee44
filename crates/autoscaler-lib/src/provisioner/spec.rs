//! Provisioning inputs

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Guest configuration payload applied to a cloned VM.
///
/// Keys are hypervisor VM config keys (`memory`, `cores`, `ciuser`,
/// `ipconfig0`, `agent`, ...). `pool` is consumed by the clone request
/// rather than pushed as config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuestConfig {
    settings: Map<String, Value>,
}

impl GuestConfig {
    /// Parse a JSON object such as the `cloud-init` secret
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw).context("Guest config is not valid JSON")?;
        match value {
            Value::Object(settings) => Ok(Self { settings }),
            other => bail!("Guest config must be a JSON object, got {}", other),
        }
    }

    pub fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.settings.insert(key.to_string(), value.into());
    }

    pub fn name(&self) -> Option<&str> {
        self.get("name").and_then(Value::as_str)
    }

    pub fn pool(&self) -> Option<&str> {
        self.get("pool").and_then(Value::as_str).filter(|p| !p.is_empty())
    }

    /// Memory in MiB
    pub fn memory(&self) -> Option<i64> {
        self.get("memory").and_then(as_integer)
    }

    pub fn cores(&self) -> Option<i64> {
        self.get("cores").and_then(as_integer)
    }

    /// Whether the in-guest agent is enabled (`1`, `true`, or `enabled=1,...`)
    pub fn agent_enabled(&self) -> bool {
        match self.get("agent") {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            Some(Value::String(s)) => {
                let first = s.split(',').next().unwrap_or_default();
                first == "1" || first == "enabled=1"
            }
            _ => false,
        }
    }

    /// Enable the guest agent, required for address discovery and for
    /// configuration runs that need in-guest access.
    pub fn force_agent(&mut self) {
        if !self.agent_enabled() {
            self.set("agent", "1");
        }
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Immutable input of one provisioning attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningSpec {
    /// Name of the template VM to clone
    pub template: String,
    /// Hypervisor node the new VM is created on
    pub target_node: String,
    pub guest: GuestConfig,
    /// Force-enable the guest agent regardless of the guest config
    pub force_agent: bool,
    /// Full clone instead of a linked clone
    pub full_clone: bool,
}

impl ProvisioningSpec {
    pub fn new(template: impl Into<String>, target_node: impl Into<String>, guest: GuestConfig) -> Self {
        Self {
            template: template.into(),
            target_node: target_node.into(),
            guest,
            force_agent: false,
            full_clone: true,
        }
    }

    pub fn with_force_agent(mut self, force: bool) -> Self {
        self.force_agent = force;
        self
    }

    /// Guest config as it will be pushed to the VM
    pub fn effective_guest(&self) -> GuestConfig {
        let mut guest = self.guest.clone();
        if self.force_agent {
            guest.force_agent();
        }
        guest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_config_typed_access() {
        let guest = GuestConfig::from_json(
            r#"{"name":"kworker","memory":"4096","cores":4,"pool":"k8s","agent":"enabled=1,fstrim_cloned_disks=1"}"#,
        )
        .unwrap();

        assert_eq!(guest.name(), Some("kworker"));
        assert_eq!(guest.memory(), Some(4096));
        assert_eq!(guest.cores(), Some(4));
        assert_eq!(guest.pool(), Some("k8s"));
        assert!(guest.agent_enabled());
    }

    #[test]
    fn test_guest_config_rejects_non_object() {
        assert!(GuestConfig::from_json("[1, 2]").is_err());
        assert!(GuestConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_force_agent() {
        let guest = GuestConfig::from_json(r#"{"memory":2048,"agent":0}"#).unwrap();
        assert!(!guest.agent_enabled());

        let spec = ProvisioningSpec::new("arch-template", "loki", guest.clone());
        assert!(!spec.effective_guest().agent_enabled());

        let spec = spec.with_force_agent(true);
        assert!(spec.effective_guest().agent_enabled());
        // the provisioning input itself is left untouched
        assert!(!spec.guest.agent_enabled());
    }
}
