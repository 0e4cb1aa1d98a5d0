//! Proxmox VE API client.
//!
//! Talks to `https://{host}:{port}/api2/json` with API-token
//! authentication. Every response is wrapped in a `{"data": ...}`
//! envelope. Requests carry the client-wide timeout; a timed-out request
//! surfaces as [`ControlError::Timeout`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use vmscale_core::ProxmoxSettings;

use crate::error::{ControlError, ControlResult};
use crate::plane::ControlPlane;
use crate::types::*;

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

/// HTTP client for one Proxmox VE cluster.
#[derive(Clone)]
pub struct ProxmoxClient {
    base_url: String,
    client: Client,
    auth_header: String,
}

impl ProxmoxClient {
    /// Build a client from settings. An API token is required.
    pub fn new(settings: &ProxmoxSettings, timeout: Duration) -> ControlResult<Self> {
        if settings.token_name.is_empty() || settings.token_value.is_empty() {
            return Err(ControlError::Config(
                "PROXMOX_TOKEN_NAME and PROXMOX_TOKEN_VALUE must be set".to_string(),
            ));
        }
        Self::with_base_url(
            settings.base_url(),
            token_header(settings),
            timeout,
            settings.verify_tls,
        )
    }

    /// Build a client against an explicit API base URL.
    pub fn with_base_url(
        base_url: impl Into<String>,
        auth_header: String,
        timeout: Duration,
        verify_tls: bool,
    ) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| ControlError::Config(e.to_string()))?;
        let base_url: String = base_url.into();
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            auth_header,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn vm_path(node: &str, vmid: u32) -> String {
        format!("/nodes/{node}/qemu/{vmid}")
    }

    /// Send a request and unwrap the `data` envelope.
    async fn call<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> ControlResult<T> {
        let resp = req
            .header(AUTHORIZATION, &self.auth_header)
            .send()
            .await
            .map_err(|e| classify(e, what))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            debug!(%status, what, "control plane request failed");
            return Err(if status == StatusCode::NOT_FOUND {
                ControlError::NotFound(what.to_string())
            } else {
                ControlError::Status {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        let envelope: Envelope<T> = resp
            .json()
            .await
            .map_err(|e| ControlError::Decode(format!("{what}: {e}")))?;
        Ok(envelope.data)
    }

    /// Ask the cluster for the next free vmid.
    pub async fn next_vmid(&self) -> ControlResult<u32> {
        let raw: serde_json::Value = self
            .call(self.client.get(self.url("/cluster/nextid")), "next vmid")
            .await?;
        match &raw {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        }
        .ok_or_else(|| ControlError::Decode(format!("next vmid: unexpected value {raw}")))
    }
}

#[async_trait]
impl ControlPlane for ProxmoxClient {
    async fn list_nodes(&self) -> ControlResult<Vec<NodeSummary>> {
        self.call(self.client.get(self.url("/nodes")), "list nodes")
            .await
    }

    async fn list_vms(&self, node: Option<&str>) -> ControlResult<Vec<VmSummary>> {
        let nodes = match node {
            Some(n) => vec![n.to_string()],
            None => self
                .list_nodes()
                .await?
                .into_iter()
                .map(|n| n.node)
                .collect(),
        };

        let mut vms = Vec::new();
        for node in nodes {
            let what = format!("list vms on {node}");
            let mut listed: Vec<VmSummary> = self
                .call(self.client.get(self.url(&format!("/nodes/{node}/qemu"))), &what)
                .await?;
            for vm in &mut listed {
                vm.node = node.clone();
            }
            vms.extend(listed);
        }
        Ok(vms)
    }

    async fn vm_status(&self, node: &str, vmid: u32) -> ControlResult<VmStatusReport> {
        let path = format!("{}/status/current", Self::vm_path(node, vmid));
        self.call(self.client.get(self.url(&path)), &format!("status of {node}/{vmid}"))
            .await
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> ControlResult<VmConfig> {
        let path = format!("{}/config", Self::vm_path(node, vmid));
        self.call(self.client.get(self.url(&path)), &format!("config of {node}/{vmid}"))
            .await
    }

    async fn update_vm_config(
        &self,
        node: &str,
        vmid: u32,
        update: &ConfigUpdate,
    ) -> ControlResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        let path = format!("{}/config", Self::vm_path(node, vmid));
        let _: serde_json::Value = self
            .call(
                self.client.put(self.url(&path)).json(update),
                &format!("config update of {node}/{vmid}"),
            )
            .await?;
        Ok(())
    }

    async fn create_vm(&self, node: &str, params: &CreateVmParams) -> ControlResult<u32> {
        let vmid = match params.vmid {
            Some(id) => id,
            None => self.next_vmid().await?,
        };

        let mut body = serde_json::json!({
            "vmid": vmid,
            "name": params.name,
            "memory": params.memory,
            "cores": params.cores,
            "sockets": params.sockets,
            "net0": params.net0,
            "ostype": params.ostype,
            "scsi0": format!("{}:{}", params.storage, params.disk_gb),
        });
        if let Some(description) = &params.description {
            body["description"] = serde_json::Value::String(description.clone());
        }

        let _: serde_json::Value = self
            .call(
                self.client
                    .post(self.url(&format!("/nodes/{node}/qemu")))
                    .json(&body),
                &format!("create vm {vmid} on {node}"),
            )
            .await?;
        Ok(vmid)
    }

    async fn start_vm(&self, node: &str, vmid: u32) -> ControlResult<()> {
        let path = format!("{}/status/start", Self::vm_path(node, vmid));
        let _: serde_json::Value = self
            .call(self.client.post(self.url(&path)), &format!("start {node}/{vmid}"))
            .await?;
        Ok(())
    }

    async fn stop_vm(&self, node: &str, vmid: u32) -> ControlResult<()> {
        let path = format!("{}/status/stop", Self::vm_path(node, vmid));
        let _: serde_json::Value = self
            .call(self.client.post(self.url(&path)), &format!("stop {node}/{vmid}"))
            .await?;
        Ok(())
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> ControlResult<()> {
        let path = Self::vm_path(node, vmid);
        let _: serde_json::Value = self
            .call(self.client.delete(self.url(&path)), &format!("delete {node}/{vmid}"))
            .await?;
        Ok(())
    }
}

/// `Authorization` header value for API-token auth.
fn token_header(settings: &ProxmoxSettings) -> String {
    format!(
        "PVEAPIToken={}!{}={}",
        settings.user, settings.token_name, settings.token_value
    )
}

fn classify(e: reqwest::Error, what: &str) -> ControlError {
    if e.is_timeout() {
        ControlError::Timeout(what.to_string())
    } else {
        ControlError::Transport(format!("{what}: {e}"))
    }
}
