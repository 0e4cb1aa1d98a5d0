//! REST API handlers.
//!
//! Read handlers go straight to the `StateStore`. Handlers that change a
//! VM take its lock, call the control plane, and write the record only
//! once that call succeeded.

use std::future::Future;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use vmscale_control::{
    ConfigUpdate, ControlError, ControlPlane, ControlResult, CreateVmParams, ResourceUsage,
    with_timeout,
};
use vmscale_state::*;

use crate::ApiState;
use crate::response::{ApiError, ApiResponse};

type ApiResult = Result<Response, ApiError>;

const DEFAULT_EVENT_LIMIT: usize = 50;

impl ApiState {
    /// Bound a control-plane call with the configured timeout.
    async fn call<T>(
        &self,
        what: impl Into<String>,
        fut: impl Future<Output = ControlResult<T>>,
    ) -> ControlResult<T> {
        with_timeout(self.call_timeout, what, fut).await
    }

    fn load_vm(&self, id: VmId) -> Result<VmRecord, ApiError> {
        self.store
            .get_vm(id)?
            .ok_or_else(|| ApiError::not_found(format!("vm {id} not found")))
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> ApiResult {
    let nodes = state.call("list nodes", state.control.list_nodes()).await?;
    Ok(ApiResponse::ok(nodes).into_response())
}

/// GET /api/v1/nodes/{node}/vms
///
/// Straight from the control plane, so VMs vmscale does not manage show up
/// too.
pub async fn list_node_vms(
    State(state): State<ApiState>,
    Path(node): Path<String>,
) -> ApiResult {
    let vms = state
        .call(format!("list vms on {node}"), state.control.list_vms(Some(&node)))
        .await?;
    Ok(ApiResponse::ok(vms).into_response())
}

/// GET /api/v1/nodes/{node}/vms/{vmid}
pub async fn get_vm_by_key(
    State(state): State<ApiState>,
    Path((node, vmid)): Path<(String, u32)>,
) -> ApiResult {
    match state.store.get_vm_by_key(&node, vmid)? {
        Some(vm) => Ok(ApiResponse::ok(vm).into_response()),
        None => Err(ApiError::not_found(format!("vm {node}/{vmid} not found"))),
    }
}

// ── VM records ─────────────────────────────────────────────────

/// GET /api/v1/vms
pub async fn list_vms(State(state): State<ApiState>) -> ApiResult {
    Ok(ApiResponse::ok(state.store.list_vms()?).into_response())
}

/// GET /api/v1/vms/{id}
pub async fn get_vm(State(state): State<ApiState>, Path(id): Path<VmId>) -> ApiResult {
    Ok(ApiResponse::ok(state.load_vm(id)?).into_response())
}

/// Provisioning request: target node plus creation parameters.
#[derive(Debug, Deserialize)]
pub struct CreateVmRequest {
    pub node: String,
    #[serde(flatten)]
    pub params: CreateVmParams,
    #[serde(default)]
    pub autoscaling_enabled: bool,
    /// Keys from the software catalog.
    #[serde(default)]
    pub software: Vec<String>,
}

/// POST /api/v1/vms
pub async fn create_vm(
    State(state): State<ApiState>,
    Json(req): Json<CreateVmRequest>,
) -> ApiResult {
    let params = &req.params;
    if req.node.is_empty() || params.name.is_empty() {
        return Err(ApiError::bad_request("node and name are required"));
    }
    if params.cores == 0 || params.memory == 0 {
        return Err(ApiError::bad_request("cores and memory must be positive"));
    }
    if let Some(unknown) = req.software.iter().find(|k| !state.software.contains_key(*k)) {
        return Err(ApiError::bad_request(format!("unknown software option: {unknown}")));
    }

    let vmid = state
        .call(
            format!("create vm on {}", req.node),
            state.control.create_vm(&req.node, params),
        )
        .await?;

    let record = state
        .store
        .create_vm(NewVm {
            name: params.name.clone(),
            node: req.node.clone(),
            vmid,
            status: VmStatus::Stopped,
            cores: params.cores,
            memory_mb: params.memory,
            disk_gb: params.disk_gb,
            os_type: params.ostype.clone(),
            autoscaling_enabled: req.autoscaling_enabled,
            software: req.software.clone(),
        })
        .inspect_err(|e| {
            error!(node = %req.node, vmid, error = %e, "vm provisioned but record not stored");
        })?;

    info!(vm_id = record.id, node = %record.node, vmid, "vm provisioned");
    Ok((StatusCode::CREATED, ApiResponse::ok(record)).into_response())
}

/// DELETE /api/v1/vms/{id}
///
/// A VM already gone from the control plane still has its record removed.
pub async fn delete_vm(State(state): State<ApiState>, Path(id): Path<VmId>) -> ApiResult {
    let guard = state.locks.lock(id).await;
    let vm = state.load_vm(id)?;

    match state
        .call(
            format!("delete {}", vm.external_key()),
            state.control.delete_vm(&vm.node, vm.vmid),
        )
        .await
    {
        Ok(()) => {}
        Err(ControlError::NotFound(_)) => {
            warn!(vm_id = id, key = %vm.external_key(), "vm already absent from control plane");
        }
        Err(e) => return Err(e.into()),
    }

    state.store.delete_vm(id)?;
    drop(guard);
    state.locks.forget(id).await;
    info!(vm_id = id, key = %vm.external_key(), "vm deprovisioned");
    Ok(ApiResponse::ok("deleted").into_response())
}

// ── Lifecycle ──────────────────────────────────────────────────

/// Live status of one VM.
#[derive(Debug, Serialize, Deserialize)]
pub struct VmLiveStatus {
    pub vm_id: VmId,
    pub node: String,
    pub vmid: u32,
    pub status: String,
    pub usage: ResourceUsage,
}

/// GET /api/v1/vms/{id}/status
pub async fn vm_status(State(state): State<ApiState>, Path(id): Path<VmId>) -> ApiResult {
    let vm = state.load_vm(id)?;
    let report = state
        .call(
            format!("status of {}", vm.external_key()),
            state.control.vm_status(&vm.node, vm.vmid),
        )
        .await?;
    Ok(ApiResponse::ok(VmLiveStatus {
        vm_id: vm.id,
        node: vm.node,
        vmid: vm.vmid,
        usage: report.resource_usage(),
        status: report.status,
    })
    .into_response())
}

/// GET /api/v1/vms/{id}/config
pub async fn vm_config(State(state): State<ApiState>, Path(id): Path<VmId>) -> ApiResult {
    let vm = state.load_vm(id)?;
    let config = state
        .call(
            format!("config of {}", vm.external_key()),
            state.control.vm_config(&vm.node, vm.vmid),
        )
        .await?;
    Ok(ApiResponse::ok(config).into_response())
}

/// POST /api/v1/vms/{id}/start
pub async fn start_vm(State(state): State<ApiState>, Path(id): Path<VmId>) -> ApiResult {
    let _guard = state.locks.lock(id).await;
    let vm = state.load_vm(id)?;
    state
        .call(
            format!("start {}", vm.external_key()),
            state.control.start_vm(&vm.node, vm.vmid),
        )
        .await?;
    let vm = state.store.set_vm_status(id, VmStatus::Running)?;
    info!(vm_id = id, "vm started");
    Ok(ApiResponse::ok(vm).into_response())
}

/// POST /api/v1/vms/{id}/stop
pub async fn stop_vm(State(state): State<ApiState>, Path(id): Path<VmId>) -> ApiResult {
    let _guard = state.locks.lock(id).await;
    let vm = state.load_vm(id)?;
    state
        .call(
            format!("stop {}", vm.external_key()),
            state.control.stop_vm(&vm.node, vm.vmid),
        )
        .await?;
    let vm = state.store.set_vm_status(id, VmStatus::Stopped)?;
    info!(vm_id = id, "vm stopped");
    Ok(ApiResponse::ok(vm).into_response())
}

// ── Resizing ───────────────────────────────────────────────────

/// Manual resize body. Absent fields are left as they are.
#[derive(Debug, Default, Deserialize)]
pub struct ResizeRequest {
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
}

/// POST /api/v1/vms/{id}/resize
///
/// Operator resizes are not bounded by the autoscaler's caps and do not
/// produce scaling events.
pub async fn resize_vm(
    State(state): State<ApiState>,
    Path(id): Path<VmId>,
    Json(req): Json<ResizeRequest>,
) -> ApiResult {
    let update = ResourceUpdate {
        cores: req.cores,
        memory_mb: req.memory_mb,
    };
    if update.is_empty() {
        return Err(ApiError::bad_request("nothing to resize"));
    }
    if update.cores == Some(0) || update.memory_mb == Some(0) {
        return Err(ApiError::bad_request("cores and memory_mb must be positive"));
    }

    let _guard = state.locks.lock(id).await;
    let vm = state.load_vm(id)?;
    let config = ConfigUpdate {
        cores: update.cores,
        memory: update.memory_mb,
    };
    state
        .call(
            format!("resize {}", vm.external_key()),
            state.control.update_vm_config(&vm.node, vm.vmid, &config),
        )
        .await?;
    let vm = state.store.update_vm_resources(id, &update)?;
    info!(vm_id = id, cores = vm.cores, memory_mb = vm.memory_mb, "vm resized");
    Ok(ApiResponse::ok(vm).into_response())
}

/// Autoscaling toggle body.
#[derive(Debug, Deserialize)]
pub struct AutoscalingRequest {
    pub enabled: bool,
}

/// PUT /api/v1/vms/{id}/autoscaling
pub async fn set_autoscaling(
    State(state): State<ApiState>,
    Path(id): Path<VmId>,
    Json(req): Json<AutoscalingRequest>,
) -> ApiResult {
    let _guard = state.locks.lock(id).await;
    let vm = state.store.set_autoscaling(id, req.enabled)?;
    info!(vm_id = id, enabled = req.enabled, "autoscaling toggled");
    Ok(ApiResponse::ok(vm).into_response())
}

// ── Scaling history ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/vms/{id}/scaling_events
///
/// History outlives the VM record, so a deleted VM still answers.
pub async fn list_scaling_events(
    State(state): State<ApiState>,
    Path(id): Path<VmId>,
    Query(query): Query<EventsQuery>,
) -> ApiResult {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Ok(ApiResponse::ok(state.store.list_scaling_events(id, limit)?).into_response())
}

// ── Autoscaler ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct AutoscalerStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub cpu_threshold_high: f64,
    pub cpu_threshold_low: f64,
}

/// GET /api/v1/autoscaler
pub async fn autoscaler_status(State(state): State<ApiState>) -> ApiResult {
    let thresholds = state.controller.autoscaler().thresholds();
    Ok(ApiResponse::ok(AutoscalerStatus {
        running: state.controller.is_running().await,
        interval_secs: state.controller.interval().as_secs(),
        cpu_threshold_high: thresholds.high,
        cpu_threshold_low: thresholds.low,
    })
    .into_response())
}

/// POST /api/v1/autoscaler/start
pub async fn start_autoscaler(State(state): State<ApiState>) -> ApiResult {
    let started = state.controller.start().await;
    Ok(ApiResponse::ok(serde_json::json!({ "started": started })).into_response())
}

/// POST /api/v1/autoscaler/stop
pub async fn stop_autoscaler(State(state): State<ApiState>) -> ApiResult {
    let stopped = state.controller.stop().await;
    Ok(ApiResponse::ok(serde_json::json!({ "stopped": stopped })).into_response())
}

/// POST /api/v1/autoscaler/run
pub async fn run_autoscaler(State(state): State<ApiState>) -> ApiResult {
    let report = state.controller.run_once().await?;
    Ok(ApiResponse::ok(report).into_response())
}

// ── Software catalog ───────────────────────────────────────────

/// GET /api/v1/software
pub async fn list_software(State(state): State<ApiState>) -> ApiResult {
    Ok(ApiResponse::ok(state.software.as_ref()).into_response())
}
