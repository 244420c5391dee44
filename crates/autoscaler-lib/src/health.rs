//! Component health behind the liveness and readiness probes
//!
//! Each pipeline stage reports into a shared [`HealthRegistry`]. The
//! overall status is the worst component status; readiness additionally
//! requires the control loop to have started.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Component names for health tracking
pub mod components {
    /// Cluster utilization sampling
    pub const SAMPLER: &str = "sampler";
    /// Clone and bring-up against the hypervisor
    pub const PROVISIONER: &str = "provisioner";
    pub const RECORD_STORE: &str = "record_store";
    /// Playbook or remote join of the last provisioned VM
    pub const JOIN: &str = "join";

    pub const ALL: &[&str] = &[SAMPLER, PROVISIONER, RECORD_STORE, JOIN];
}

/// Ordered from best to worst so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Last operation failed but the loop keeps running
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix timestamp of the last report
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn report(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::report(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::report(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::report(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }

    /// Names of components currently reporting unhealthy
    pub fn unhealthy(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, health)| !health.status.is_operational())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    components: BTreeMap<String, ComponentHealth>,
    ready: bool,
}

/// Shared, cloneable view of component health
#[derive(Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn register_all(&self) {
        for name in components::ALL {
            self.register(name).await;
        }
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.state.read().await.components.clone();
        HealthResponse {
            status: HealthResponse::compute_status(&components),
            components,
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = self.state.read().await.ready;
        if !ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("Autoscaler not yet initialized".to_string()),
            };
        }

        let health = self.health().await;
        let unhealthy = health.unhealthy();
        if unhealthy.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy components: {}", unhealthy.join(", "))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let health = HealthRegistry::new().health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_register_all() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        let health = registry.health().await;
        assert_eq!(health.components.len(), components::ALL.len());
        assert!(health
            .components
            .values()
            .all(|c| c.status == ComponentStatus::Healthy));
    }

    #[tokio::test]
    async fn test_overall_status_is_worst_component() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        registry
            .set_degraded(components::JOIN, "vm 142 rolled back")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set_unhealthy(components::SAMPLER, "metrics API unreachable")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);

        registry.set_healthy(components::SAMPLER).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_not_ready_until_loop_starts() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        assert!(!registry.readiness().await.ready);

        registry.set_ready(true).await;
        let readiness = registry.readiness().await;
        assert!(readiness.ready);
        assert!(readiness.reason.is_none());
    }

    #[tokio::test]
    async fn test_readiness_names_unhealthy_components() {
        let registry = HealthRegistry::new();
        registry.register_all().await;
        registry.set_ready(true).await;
        registry
            .set_unhealthy(components::PROVISIONER, "template not found")
            .await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Unhealthy components: provisioner")
        );
    }

    #[tokio::test]
    async fn test_degraded_component_stays_ready() {
        let registry = HealthRegistry::new();
        registry.register_all().await;
        registry.set_ready(true).await;
        registry.set_degraded(components::RECORD_STORE, "retrying").await;

        assert!(registry.readiness().await.ready);
    }
}
