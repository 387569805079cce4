use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use url::Url;

use super::{
    GuestHandle, GuestKind, GuestSpec, GuestState, HypervisorClient, HypervisorError, UsageSample,
};

// key: hypervisor-proxmox -> ticket auth,guest lifecycle

/// PVE tickets expire after two hours; refresh a little earlier.
const TICKET_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60 - 5 * 60);
const TAG_PREFIX: &str = "idem-";
const DEFAULT_PORT: u16 = 8006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDefaults {
    pub bus: String,
    pub engine: String,
    pub format: String,
    pub cloudinit: String,
    pub network_bridge: String,
    pub container_template: Option<String>,
}

impl Default for StorageDefaults {
    fn default() -> Self {
        Self {
            bus: "virtio".to_string(),
            engine: "local-zfs".to_string(),
            format: "raw".to_string(),
            cloudinit: "cloudinit".to_string(),
            network_bridge: "vmbr0".to_string(),
            container_template: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    pub hostname: String,
    pub username: String,
    pub password: Option<String>,
    pub node: String,
    pub verify_tls: bool,
    pub request_timeout: Duration,
    /// Pause between task status reads while a guest operation runs.
    pub task_poll_interval: Duration,
    pub storage: StorageDefaults,
}

impl ProxmoxConfig {
    /// Resolves the API root. A bare hostname gets the default scheme and port.
    pub fn api_base(&self) -> Result<String> {
        let raw = self.hostname.trim();
        let candidate = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{raw}:{DEFAULT_PORT}")
        };
        let url = Url::parse(&candidate)
            .with_context(|| format!("invalid proxmox hostname '{}'", self.hostname))?;
        Ok(format!(
            "{}/api2/json",
            url.as_str().trim_end_matches('/')
        ))
    }
}

#[derive(Clone)]
struct Ticket {
    ticket: String,
    csrf_token: String,
    issued_at: Instant,
}

impl Ticket {
    fn is_fresh(&self) -> bool {
        self.issued_at.elapsed() < TICKET_LIFETIME
    }
}

pub struct ProxmoxClient {
    client: reqwest::Client,
    base_url: String,
    config: ProxmoxConfig,
    ticket: RwLock<Option<Ticket>>,
}

#[derive(Debug, Deserialize)]
struct TicketResponse {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Debug, Deserialize)]
struct ClusterResource {
    #[serde(default)]
    vmid: Option<u32>,
    #[serde(default)]
    node: Option<String>,
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default)]
    tags: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CurrentStatus {
    status: String,
    #[serde(default)]
    cpu: f64,
    #[serde(default)]
    mem: u64,
    #[serde(default)]
    disk: u64,
}

impl ProxmoxClient {
    pub fn new(config: ProxmoxConfig) -> Result<Self> {
        let base_url = config.api_base()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .context("failed to build proxmox client")?;
        Ok(Self {
            client,
            base_url,
            config,
            ticket: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn guest_path(handle: &GuestHandle) -> String {
        format!("nodes/{}/{}/{}", handle.node, handle.kind.as_str(), handle.vmid)
    }

    async fn login(&self) -> Result<Ticket, HypervisorError> {
        let password = self.config.password.as_deref().ok_or_else(|| {
            HypervisorError::Unreachable("no proxmox password configured".to_string())
        })?;
        let response = self
            .client
            .post(self.endpoint("access/ticket"))
            .form(&[
                ("username", self.config.username.as_str()),
                ("password", password),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(HypervisorError::Unreachable(format!(
                "proxmox login failed with status {status}"
            )));
        }

        let body: Value = response.json().await.map_err(transport_error)?;
        let parsed: TicketResponse = serde_json::from_value(
            body.get("data").cloned().unwrap_or(Value::Null),
        )
        .map_err(|err| HypervisorError::Unreachable(format!("malformed login response: {err}")))?;

        tracing::debug!(user = %self.config.username, "obtained proxmox ticket");
        Ok(Ticket {
            ticket: parsed.ticket,
            csrf_token: parsed.csrf_token,
            issued_at: Instant::now(),
        })
    }

    async fn ticket(&self, force_refresh: bool) -> Result<Ticket, HypervisorError> {
        if !force_refresh {
            if let Some(ticket) = self.ticket.read().await.as_ref() {
                if ticket.is_fresh() {
                    return Ok(ticket.clone());
                }
            }
        }

        let mut guard = self.ticket.write().await;
        if !force_refresh {
            if let Some(ticket) = guard.as_ref() {
                if ticket.is_fresh() {
                    return Ok(ticket.clone());
                }
            }
        }
        let fresh = self.login().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(String, String)]>,
    ) -> Result<Value, HypervisorError> {
        let mut relogged = false;
        loop {
            let ticket = self.ticket(relogged).await?;
            let mut request = self
                .client
                .request(method.clone(), self.endpoint(path))
                .header(
                    reqwest::header::COOKIE,
                    format!("PVEAuthCookie={}", ticket.ticket),
                );
            if method != Method::GET {
                request = request.header("CSRFPreventionToken", ticket.csrf_token.as_str());
            }
            if let Some(form) = form {
                request = request.form(form);
            }

            let response = request.send().await.map_err(transport_error)?;
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !relogged {
                tracing::debug!(%path, "proxmox ticket rejected; logging in again");
                relogged = true;
                continue;
            }

            let body = response.text().await.map_err(transport_error)?;
            if !status.is_success() {
                return Err(classify_failure(status, &body));
            }
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            let parsed: Value = serde_json::from_str(&body).map_err(|err| {
                HypervisorError::Unreachable(format!("malformed proxmox response: {err}"))
            })?;
            return Ok(parsed.get("data").cloned().unwrap_or(Value::Null));
        }
    }

    /// Waits for the worker task a guest operation forked.
    ///
    /// Create, start, stop and delete answer with a task id before the work is
    /// done. The wait has no limit of its own; callers run it under their
    /// deadline.
    async fn wait_for_task(&self, data: &Value, fallback_node: &str) -> Result<(), HypervisorError> {
        let Some(upid) = data.as_str().filter(|upid| upid.starts_with("UPID:")) else {
            return Ok(());
        };
        // UPID:<node>:<pid>:<pstart>:<starttime>:<type>:<id>:<user>:
        let node = upid
            .split(':')
            .nth(1)
            .filter(|node| !node.is_empty())
            .unwrap_or(fallback_node);
        let path = format!("nodes/{node}/tasks/{upid}/status");

        loop {
            let data = self.call(Method::GET, &path, None).await?;
            let task: TaskStatus = serde_json::from_value(data).map_err(|err| {
                HypervisorError::Unreachable(format!("malformed task status for {upid}: {err}"))
            })?;
            if task.status == "stopped" {
                return match task.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    Some(exit) if exit.starts_with("WARNINGS") => {
                        tracing::warn!(%upid, exit, "proxmox task finished with warnings");
                        Ok(())
                    }
                    Some(exit) => Err(HypervisorError::Rejected(format!(
                        "task {upid} failed: {exit}"
                    ))),
                    None => Err(HypervisorError::Rejected(format!(
                        "task {upid} stopped without an exit status"
                    ))),
                };
            }
            tokio::time::sleep(self.config.task_poll_interval).await;
        }
    }

    async fn run_task(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(String, String)]>,
        node: &str,
    ) -> Result<(), HypervisorError> {
        let data = self.call(method, path, form).await?;
        self.wait_for_task(&data, node).await
    }

    async fn next_vmid(&self) -> Result<u32, HypervisorError> {
        let data = self.call(Method::GET, "cluster/nextid", None).await?;
        let parsed = match &data {
            Value::String(raw) => raw.trim().parse::<u32>().ok(),
            Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        };
        parsed.ok_or_else(|| {
            HypervisorError::Unreachable(format!("unexpected nextid payload: {data}"))
        })
    }

    async fn current_status(
        &self,
        handle: &GuestHandle,
    ) -> Result<CurrentStatus, HypervisorError> {
        let data = self
            .call(
                Method::GET,
                &format!("{}/status/current", Self::guest_path(handle)),
                None,
            )
            .await?;
        serde_json::from_value(data).map_err(|err| {
            HypervisorError::Unreachable(format!("malformed guest status for {handle}: {err}"))
        })
    }

    fn creation_form(
        &self,
        spec: &GuestSpec,
        vmid: u32,
    ) -> Result<Vec<(String, String)>, HypervisorError> {
        let storage = &self.config.storage;
        let mut form = vec![
            ("vmid".to_string(), vmid.to_string()),
            ("cores".to_string(), spec.cpus.to_string()),
            ("memory".to_string(), spec.memory_mib.to_string()),
            ("tags".to_string(), idempotency_tag(&spec.idempotency_key)),
            (
                "description".to_string(),
                format!("Managed by Proxmox addon (key {})", spec.idempotency_key),
            ),
        ];

        match spec.kind {
            GuestKind::Qemu => {
                form.push(("name".to_string(), spec.name.clone()));
                form.push((
                    format!("{}0", storage.bus),
                    format!(
                        "{}:{},format={}",
                        storage.engine, spec.storage_gib, storage.format
                    ),
                ));
                form.push(("ide2".to_string(), format!("{}:cloudinit", storage.cloudinit)));
                form.push((
                    "net0".to_string(),
                    format!("virtio,bridge={}", storage.network_bridge),
                ));
                form.push(("ipconfig0".to_string(), "ip=dhcp".to_string()));
            }
            GuestKind::Lxc => {
                let template = storage.container_template.clone().ok_or_else(|| {
                    HypervisorError::Rejected("no container template configured".to_string())
                })?;
                form.push(("hostname".to_string(), spec.name.clone()));
                form.push(("ostemplate".to_string(), template));
                form.push((
                    "rootfs".to_string(),
                    format!("{}:{}", storage.engine, spec.storage_gib),
                ));
                form.push((
                    "net0".to_string(),
                    format!("name=eth0,bridge={},ip=dhcp", storage.network_bridge),
                ));
            }
        }

        Ok(form)
    }
}

#[async_trait]
impl HypervisorClient for ProxmoxClient {
    async fn create_guest(&self, spec: &GuestSpec) -> Result<GuestHandle, HypervisorError> {
        if let Some(existing) = self.find_guest(&spec.idempotency_key).await? {
            tracing::info!(
                guest = %existing,
                key = %spec.idempotency_key,
                "reusing guest created by an earlier attempt"
            );
            return Ok(existing);
        }

        let vmid = self.next_vmid().await?;
        let form = self.creation_form(spec, vmid)?;
        self.run_task(
            Method::POST,
            &format!("nodes/{}/{}", self.config.node, spec.kind.as_str()),
            Some(&form),
            &self.config.node,
        )
        .await?;

        Ok(GuestHandle {
            node: self.config.node.clone(),
            vmid,
            kind: spec.kind,
        })
    }

    async fn start_guest(&self, handle: &GuestHandle) -> Result<(), HypervisorError> {
        self.run_task(
            Method::POST,
            &format!("{}/status/start", Self::guest_path(handle)),
            Some(&[]),
            &handle.node,
        )
        .await
    }

    async fn stop_guest(&self, handle: &GuestHandle) -> Result<(), HypervisorError> {
        self.run_task(
            Method::POST,
            &format!("{}/status/stop", Self::guest_path(handle)),
            Some(&[]),
            &handle.node,
        )
        .await
    }

    async fn destroy_guest(&self, handle: &GuestHandle) -> Result<(), HypervisorError> {
        // PVE refuses to delete a running guest; the stop task must finish first.
        if self.guest_state(handle).await? == GuestState::Running {
            self.stop_guest(handle).await?;
        }
        self.run_task(
            Method::DELETE,
            &format!("{}?purge=1", Self::guest_path(handle)),
            None,
            &handle.node,
        )
        .await
    }

    async fn guest_state(&self, handle: &GuestHandle) -> Result<GuestState, HypervisorError> {
        let status = self.current_status(handle).await?;
        Ok(if status.status == "running" {
            GuestState::Running
        } else {
            GuestState::Stopped
        })
    }

    async fn fetch_usage(&self, handle: &GuestHandle) -> Result<UsageSample, HypervisorError> {
        let status = self.current_status(handle).await?;
        Ok(UsageSample {
            cpu_load: status.cpu,
            memory_used_bytes: status.mem,
            storage_used_bytes: status.disk,
        })
    }

    async fn find_guest(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<GuestHandle>, HypervisorError> {
        let data = self
            .call(Method::GET, "cluster/resources?type=vm", None)
            .await?;
        let resources: Vec<ClusterResource> = serde_json::from_value(data).map_err(|err| {
            HypervisorError::Unreachable(format!("malformed cluster resources: {err}"))
        })?;
        let wanted = idempotency_tag(idempotency_key);

        for resource in resources {
            let tagged = resource
                .tags
                .as_deref()
                .map(|tags| {
                    tags.split(|c: char| c == ';' || c == ',' || c == ' ')
                        .any(|tag| tag == wanted)
                })
                .unwrap_or(false);
            if !tagged {
                continue;
            }
            let kind = match resource.resource_type.parse::<GuestKind>() {
                Ok(kind) => kind,
                Err(_) => continue,
            };
            if let (Some(vmid), Some(node)) = (resource.vmid, resource.node) {
                return Ok(Some(GuestHandle { node, vmid, kind }));
            }
        }
        Ok(None)
    }

    async fn guest_address(&self, handle: &GuestHandle) -> Result<Option<String>, HypervisorError> {
        let config = self
            .call(
                Method::GET,
                &format!("{}/config", Self::guest_path(handle)),
                None,
            )
            .await?;
        let field = match handle.kind {
            GuestKind::Qemu => "ipconfig0",
            GuestKind::Lxc => "net0",
        };
        Ok(config
            .get(field)
            .and_then(|value| value.as_str())
            .and_then(parse_ip_assignment))
    }

    async fn ping(&self) -> Result<(), HypervisorError> {
        self.call(Method::GET, "version", None).await?;
        Ok(())
    }
}

pub fn idempotency_tag(key: &str) -> String {
    format!("{TAG_PREFIX}{}", key.to_ascii_lowercase())
}

fn transport_error(err: reqwest::Error) -> HypervisorError {
    HypervisorError::Unreachable(err.to_string())
}

fn failure_detail(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        value
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.trim().to_string())
            .or_else(|| value.get("errors").map(|errors| errors.to_string()))
    });
    let message = message.unwrap_or_else(|| body.chars().take(200).collect());
    if message.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {message}")
    }
}

/// Maps a non-success PVE response onto the hypervisor error taxonomy.
pub(crate) fn classify_failure(status: StatusCode, body: &str) -> HypervisorError {
    let detail = failure_detail(status, body);
    let lowered = body.to_ascii_lowercase();

    if status == StatusCode::NOT_FOUND || lowered.contains("does not exist") {
        return HypervisorError::NotFound(detail);
    }

    match status {
        StatusCode::UNAUTHORIZED
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => HypervisorError::Unreachable(detail),
        _ if lowered.contains("got timeout")
            || lowered.contains("can't lock file")
            || lowered.contains("is locked") =>
        {
            HypervisorError::Unreachable(detail)
        }
        _ => HypervisorError::Rejected(detail),
    }
}

/// Extracts the address from `ip=10.0.0.5/24,gw=…` style assignments.
pub(crate) fn parse_ip_assignment(raw: &str) -> Option<String> {
    raw.split(',')
        .filter_map(|part| part.trim().strip_prefix("ip="))
        .find(|value| !matches!(*value, "dhcp" | "manual" | "auto"))
        .map(|value| value.split('/').next().unwrap_or(value).to_string())
        .filter(|value| !value.is_empty())
}
