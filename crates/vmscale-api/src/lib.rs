//! vmscale-api — REST API for vmscale.
//!
//! Axum route handlers for VM records, VM lifecycle on the control plane,
//! manual resizing, scaling history and the autoscaling controller.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/nodes` | Control-plane nodes |
//! | GET | `/api/v1/nodes/{node}/vms` | VMs live on a node, managed or not |
//! | GET | `/api/v1/nodes/{node}/vms/{vmid}` | VM record by control-plane address |
//! | GET | `/api/v1/vms` | List VM records |
//! | POST | `/api/v1/vms` | Provision a VM |
//! | GET | `/api/v1/vms/{id}` | Get a VM record |
//! | DELETE | `/api/v1/vms/{id}` | Deprovision a VM |
//! | GET | `/api/v1/vms/{id}/status` | Live resource usage |
//! | GET | `/api/v1/vms/{id}/config` | Live applied configuration |
//! | POST | `/api/v1/vms/{id}/start` | Start a VM |
//! | POST | `/api/v1/vms/{id}/stop` | Stop a VM |
//! | POST | `/api/v1/vms/{id}/resize` | Set cores and/or memory |
//! | PUT | `/api/v1/vms/{id}/autoscaling` | Enable or disable autoscaling |
//! | GET | `/api/v1/vms/{id}/scaling_events` | Scaling history, newest first |
//! | GET | `/api/v1/autoscaler` | Controller state |
//! | POST | `/api/v1/autoscaler/start` | Start the controller |
//! | POST | `/api/v1/autoscaler/stop` | Stop the controller |
//! | POST | `/api/v1/autoscaler/run` | Run one cycle now |
//! | GET | `/api/v1/software` | Software catalog for provisioning |

pub mod handlers;
pub mod response;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post, put};

use vmscale_autoscale::AutoscaleController;
use vmscale_control::ControlPlane;
use vmscale_core::SoftwareCatalog;
use vmscale_state::{StateStore, VmLocks};

pub use response::{ApiError, ApiResponse};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub control: Arc<dyn ControlPlane>,
    pub controller: Arc<AutoscaleController>,
    /// Must be the same table the autoscaler locks through.
    pub locks: VmLocks,
    /// Upper bound for each control-plane call made by a handler.
    pub call_timeout: Duration,
    pub software: Arc<SoftwareCatalog>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{node}/vms", get(handlers::list_node_vms))
        .route("/nodes/{node}/vms/{vmid}", get(handlers::get_vm_by_key))
        .route("/vms", get(handlers::list_vms).post(handlers::create_vm))
        .route("/vms/{id}", get(handlers::get_vm).delete(handlers::delete_vm))
        .route("/vms/{id}/status", get(handlers::vm_status))
        .route("/vms/{id}/config", get(handlers::vm_config))
        .route("/vms/{id}/start", post(handlers::start_vm))
        .route("/vms/{id}/stop", post(handlers::stop_vm))
        .route("/vms/{id}/resize", post(handlers::resize_vm))
        .route("/vms/{id}/autoscaling", put(handlers::set_autoscaling))
        .route("/vms/{id}/scaling_events", get(handlers::list_scaling_events))
        .route("/autoscaler", get(handlers::autoscaler_status))
        .route("/autoscaler/start", post(handlers::start_autoscaler))
        .route("/autoscaler/stop", post(handlers::stop_autoscaler))
        .route("/autoscaler/run", post(handlers::run_autoscaler))
        .route("/software", get(handlers::list_software))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
