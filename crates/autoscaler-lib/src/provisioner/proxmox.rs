//! Proxmox VE API client
//!
//! Implements [`VmProvider`] over the Proxmox JSON API (`/api2/json`).
//! Authenticates either with an API token (`user@realm!tokenid` + secret)
//! or with a ticket obtained from username/password/OTP; tickets are
//! renewed on the first 401.

use super::{CloneRequest, GuestConfig, HypervisorError, VmProvider};
use crate::models::{GuestInterface, RunState, VmHandle};
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for the Proxmox API
#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    /// API root, e.g. `https://pve:8006/api2/json`
    pub api_url: String,
    /// `root@pam`, or `user@realm!tokenid` for API tokens
    pub user: String,
    /// Password, or the token secret
    pub password: String,
    pub otp: Option<String>,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Upper bound on waiting for asynchronous hypervisor tasks
    pub task_timeout: Duration,
}

/// Whether the user id names an API token rather than a login user
pub fn user_requires_api_token(user: &str) -> bool {
    static TOKEN_USER: OnceLock<Regex> = OnceLock::new();
    TOKEN_USER
        .get_or_init(|| Regex::new("[a-z0-9]+@[a-z0-9]+![a-z0-9]+").expect("valid token regex"))
        .is_match(user)
}

#[derive(Debug, Clone)]
enum Auth {
    Token(String),
    Ticket { ticket: String, csrf: String },
}

#[derive(Debug, Deserialize)]
struct TicketResponse {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_prevention_token: String,
}

#[derive(Debug, Deserialize)]
struct ClusterResource {
    vmid: Option<u32>,
    node: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentInterfaces {
    #[serde(default)]
    result: Vec<AgentInterface>,
}

#[derive(Debug, Deserialize)]
struct AgentInterface {
    name: String,
    #[serde(default, rename = "ip-addresses")]
    ip_addresses: Vec<AgentAddress>,
}

#[derive(Debug, Deserialize)]
struct AgentAddress {
    #[serde(rename = "ip-address")]
    ip_address: String,
}

/// Proxmox VE implementation of [`VmProvider`]
pub struct ProxmoxClient {
    http: Client,
    base_url: Url,
    config: ProxmoxConfig,
    auth: RwLock<Auth>,
}

impl ProxmoxClient {
    /// Build the HTTP client and authenticate
    pub async fn connect(config: ProxmoxConfig) -> Result<Self, HypervisorError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.insecure)
            .build()?;

        let base_url = Url::parse(config.api_url.trim_end_matches('/'))
            .map_err(|e| HypervisorError::Response(format!("invalid API url {}: {}", config.api_url, e)))?;

        let auth = Self::authenticate(&http, &base_url, &config).await?;
        let client = Self {
            http,
            base_url,
            config,
            auth: RwLock::new(auth),
        };

        if matches!(*client.auth.read().await, Auth::Token(_)) {
            // Tokens are not validated until first use, so check them now
            let version = client.request(Method::GET, &["version"], &[]).await?;
            info!(version = %version["version"], "Connected to Proxmox API with token");
        } else {
            info!(user = %client.config.user, "Logged in to Proxmox API");
        }

        Ok(client)
    }

    fn url(base: &Url, segments: &[&str]) -> Result<Url, HypervisorError> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| HypervisorError::Response(format!("API url {} cannot be a base", base)))?
            .extend(segments);
        Ok(url)
    }

    async fn authenticate(http: &Client, base: &Url, config: &ProxmoxConfig) -> Result<Auth, HypervisorError> {
        if user_requires_api_token(&config.user) {
            return Ok(Auth::Token(format!(
                "PVEAPIToken={}={}",
                config.user, config.password
            )));
        }

        let mut form = vec![
            ("username", config.user.clone()),
            ("password", config.password.clone()),
        ];
        if let Some(otp) = config.otp.as_ref().filter(|o| !o.is_empty()) {
            form.push(("otp", otp.clone()));
        }

        let response = http
            .post(Self::url(base, &["access", "ticket"])?)
            .form(&form)
            .send()
            .await?;
        let data = Self::unwrap_data(response).await?;
        let ticket: TicketResponse = serde_json::from_value(data)
            .map_err(|e| HypervisorError::Response(format!("login response: {}", e)))?;

        Ok(Auth::Ticket {
            ticket: ticket.ticket,
            csrf: ticket.csrf_prevention_token,
        })
    }

    /// Extract `data` from a Proxmox response envelope
    async fn unwrap_data(response: reqwest::Response) -> Result<Value, HypervisorError> {
        let status = response.status();
        if status.is_success() {
            let mut body: Value = response.json().await?;
            return Ok(body.get_mut("data").map(Value::take).unwrap_or(Value::Null));
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND || body.contains("does not exist") {
            return Err(HypervisorError::NotFound(body));
        }
        Err(HypervisorError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn send_once(
        &self,
        method: Method,
        url: Url,
        form: &[(&str, String)],
    ) -> Result<reqwest::Response, HypervisorError> {
        let is_get = method == Method::GET;
        let mut builder = self.http.request(method.clone(), url);

        builder = match &*self.auth.read().await {
            Auth::Token(header) => builder.header("Authorization", header.as_str()),
            Auth::Ticket { ticket, csrf } => {
                let builder = builder.header("Cookie", format!("PVEAuthCookie={}", ticket));
                if is_get {
                    builder
                } else {
                    builder.header("CSRFPreventionToken", csrf.as_str())
                }
            }
        };

        Ok(Self::with_params(builder, &method, form).send().await?)
    }

    /// GET and DELETE read their parameters from the query string, the
    /// other methods from a form body
    fn with_params(builder: RequestBuilder, method: &Method, params: &[(&str, String)]) -> RequestBuilder {
        if params.is_empty() {
            builder
        } else if *method == Method::GET || *method == Method::DELETE {
            builder.query(params)
        } else {
            builder.form(params)
        }
    }

    async fn request(
        &self,
        method: Method,
        segments: &[&str],
        form: &[(&str, String)],
    ) -> Result<Value, HypervisorError> {
        let url = Self::url(&self.base_url, segments)?;
        debug!(method = %method, url = %url, "Proxmox API request");

        let response = self.send_once(method.clone(), url.clone(), form).await?;
        if response.status() == StatusCode::UNAUTHORIZED && !user_requires_api_token(&self.config.user) {
            info!("Proxmox ticket expired, logging in again");
            let auth = Self::authenticate(&self.http, &self.base_url, &self.config).await?;
            *self.auth.write().await = auth;
            let retry = self.send_once(method, url, form).await?;
            return Self::unwrap_data(retry).await;
        }

        Self::unwrap_data(response).await
    }

    /// Issue a request that starts an asynchronous task and wait for it
    async fn run_task(
        &self,
        node: &str,
        method: Method,
        segments: &[&str],
        form: &[(&str, String)],
    ) -> Result<(), HypervisorError> {
        let data = self.request(method, segments, form).await?;
        match data.as_str() {
            Some(upid) if upid.starts_with("UPID:") => self.wait_task(node, upid).await,
            _ => Ok(()),
        }
    }

    async fn wait_task(&self, node: &str, upid: &str) -> Result<(), HypervisorError> {
        let deadline = Instant::now() + self.config.task_timeout;

        loop {
            let data = self
                .request(Method::GET, &["nodes", node, "tasks", upid, "status"], &[])
                .await?;
            let status: TaskStatus = serde_json::from_value(data)
                .map_err(|e| HypervisorError::Response(format!("task status: {}", e)))?;

            if status.status == "stopped" {
                return match status.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    other => Err(HypervisorError::TaskFailed {
                        upid: upid.to_string(),
                        status: other.unwrap_or("unknown").to_string(),
                    }),
                };
            }

            if Instant::now() >= deadline {
                return Err(HypervisorError::Timeout(format!("task {}", upid)));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    fn qemu_path<'a>(vm: &'a VmHandle, vmid: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
        let mut segments = vec!["nodes", vm.node.as_str(), "qemu", vmid];
        segments.extend_from_slice(rest);
        segments
    }

    /// Flatten guest config values into form parameters
    fn config_form(config: &GuestConfig) -> Vec<(&str, String)> {
        config
            .settings()
            .iter()
            .filter(|(key, _)| key.as_str() != "pool")
            .filter_map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
                    Value::Null => return None,
                    other => other.to_string(),
                };
                Some((key.as_str(), value))
            })
            .collect()
    }
}

#[async_trait]
impl VmProvider for ProxmoxClient {
    async fn find_template_instances(&self, name: &str) -> Result<Vec<VmHandle>, HypervisorError> {
        let data = self
            .request(
                Method::GET,
                &["cluster", "resources"],
                &[("type", "vm".to_string())],
            )
            .await?;
        let resources: Vec<ClusterResource> = serde_json::from_value(data)
            .map_err(|e| HypervisorError::Response(format!("cluster resources: {}", e)))?;

        Ok(resources
            .into_iter()
            .filter(|r| r.name.as_deref() == Some(name))
            .filter_map(|r| Some(VmHandle::new(r.vmid?, r.node?)))
            .collect())
    }

    async fn next_free_id(&self) -> Result<u32, HypervisorError> {
        let data = self.request(Method::GET, &["cluster", "nextid"], &[]).await?;
        let parsed = match &data {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        };
        parsed.ok_or_else(|| HypervisorError::Response(format!("unexpected next id {}", data)))
    }

    async fn clone_instance(&self, request: &CloneRequest<'_>) -> Result<(), HypervisorError> {
        let source_id = request.source.vmid.to_string();
        let mut form = vec![
            ("newid", request.target.vmid.to_string()),
            ("name", request.name.to_string()),
            ("target", request.target.node.clone()),
            ("full", if request.full { "1" } else { "0" }.to_string()),
        ];
        if let Some(pool) = request.pool {
            form.push(("pool", pool.to_string()));
        }

        self.run_task(
            &request.source.node,
            Method::POST,
            &Self::qemu_path(request.source, &source_id, &["clone"]),
            &form,
        )
        .await
    }

    async fn push_config(&self, vm: &VmHandle, config: &GuestConfig) -> Result<(), HypervisorError> {
        let vmid = vm.vmid.to_string();
        let form = Self::config_form(config);
        self.run_task(
            &vm.node,
            Method::POST,
            &Self::qemu_path(vm, &vmid, &["config"]),
            &form,
        )
        .await
    }

    async fn wait_for_clone_source_shutdown(&self, vm: &VmHandle) -> Result<(), HypervisorError> {
        let deadline = Instant::now() + self.config.task_timeout;
        loop {
            if self.run_state(vm).await? == RunState::Stopped {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HypervisorError::Timeout(format!("shutdown of vm {}", vm.vmid)));
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }

    async fn start(&self, vm: &VmHandle) -> Result<(), HypervisorError> {
        let vmid = vm.vmid.to_string();
        self.run_task(
            &vm.node,
            Method::POST,
            &Self::qemu_path(vm, &vmid, &["status", "start"]),
            &[],
        )
        .await
    }

    async fn run_state(&self, vm: &VmHandle) -> Result<RunState, HypervisorError> {
        let vmid = vm.vmid.to_string();
        let data = self
            .request(
                Method::GET,
                &Self::qemu_path(vm, &vmid, &["status", "current"]),
                &[],
            )
            .await?;
        Ok(RunState::from_status(data["status"].as_str().unwrap_or_default()))
    }

    async fn ping_agent(&self, vm: &VmHandle) -> Result<(), HypervisorError> {
        let vmid = vm.vmid.to_string();
        self.request(
            Method::POST,
            &Self::qemu_path(vm, &vmid, &["agent", "ping"]),
            &[],
        )
        .await
        .map(|_| ())
    }

    async fn guest_interfaces(&self, vm: &VmHandle) -> Result<Vec<GuestInterface>, HypervisorError> {
        let vmid = vm.vmid.to_string();
        let data = self
            .request(
                Method::GET,
                &Self::qemu_path(vm, &vmid, &["agent", "network-get-interfaces"]),
                &[],
            )
            .await?;
        let interfaces: AgentInterfaces = serde_json::from_value(data)
            .map_err(|e| HypervisorError::Response(format!("guest interfaces: {}", e)))?;

        Ok(interfaces
            .result
            .into_iter()
            .map(|iface| GuestInterface {
                name: iface.name,
                addresses: iface
                    .ip_addresses
                    .iter()
                    .filter_map(|a| a.ip_address.parse::<IpAddr>().ok())
                    .collect(),
            })
            .collect())
    }

    async fn stop(&self, vm: &VmHandle) -> Result<(), HypervisorError> {
        let vmid = vm.vmid.to_string();
        self.run_task(
            &vm.node,
            Method::POST,
            &Self::qemu_path(vm, &vmid, &["status", "stop"]),
            &[],
        )
        .await
    }

    async fn delete(&self, vm: &VmHandle) -> Result<(), HypervisorError> {
        let vmid = vm.vmid.to_string();
        self.run_task(
            &vm.node,
            Method::DELETE,
            &Self::qemu_path(vm, &vmid, &[]),
            &[("purge", "1".to_string())],
        )
        .await
    }
}
