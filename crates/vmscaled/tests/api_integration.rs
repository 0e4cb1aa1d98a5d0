//! End-to-end API tests.
//!
//! Drives the full router against an in-memory store and the simulated
//! control plane: provisioning, lifecycle, resizing, the autoscaler
//! endpoints and scaling history.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use vmscale_api::{ApiState, build_router};
use vmscale_autoscale::{AutoscaleController, Autoscaler, Thresholds};
use vmscale_control::{ControlPlane, Fault, InMemoryControlPlane, ResourceProbe};
use vmscale_core::Settings;
use vmscale_state::{StateStore, VmLocks};

const NODE: &str = "pve1";

struct TestApp {
    router: Router,
    plane: InMemoryControlPlane,
    controller: Arc<AutoscaleController>,
}

fn test_app_with(store: StateStore) -> TestApp {
    let plane = InMemoryControlPlane::new();
    plane.add_node(NODE);
    let locks = VmLocks::new();
    let timeout = Duration::from_millis(500);
    let probe = ResourceProbe::new(Arc::new(plane.clone()), timeout);
    let autoscaler = Autoscaler::new(store.clone(), probe, locks.clone(), Thresholds::default());
    let controller = Arc::new(AutoscaleController::new(
        autoscaler,
        Duration::from_secs(60),
        Duration::from_secs(1),
    ));
    let router = build_router(ApiState {
        store,
        control: Arc::new(plane.clone()),
        controller: controller.clone(),
        locks,
        call_timeout: timeout,
        software: Arc::new(Settings::default().software),
    });
    TestApp {
        router,
        plane,
        controller,
    }
}

fn test_app() -> TestApp {
    test_app_with(StateStore::open_in_memory().unwrap())
}

impl TestApp {
    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// Provision a running VM and return its internal id.
    async fn provision(&self, name: &str, cores: u32, memory: u32) -> u64 {
        let (status, body) = self
            .send(
                "POST",
                "/api/v1/vms",
                Some(json!({
                    "node": NODE,
                    "name": name,
                    "cores": cores,
                    "memory": memory,
                    "autoscaling_enabled": true
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let id = body["data"]["id"].as_u64().unwrap();

        let (status, _) = self.send("POST", &format!("/api/v1/vms/{id}/start"), None).await;
        assert_eq!(status, StatusCode::OK);
        id
    }

    fn vmid_of(&self, body: &Value) -> u32 {
        body["data"]["vmid"].as_u64().unwrap() as u32
    }
}

#[tokio::test]
async fn list_vms_empty() {
    let app = test_app();
    let (status, body) = app.send("GET", "/api/v1/vms", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn provision_and_fetch_by_both_addresses() {
    let app = test_app();
    let id = app.provision("web", 2, 2048).await;

    let (status, body) = app.send("GET", &format!("/api/v1/vms/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "running");
    let vmid = app.vmid_of(&body);

    let (status, body) = app
        .send("GET", &format!("/api/v1/nodes/{NODE}/vms/{vmid}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], id);
}

#[tokio::test]
async fn unknown_vm_returns_error_envelope() {
    let app = test_app();
    let (status, body) = app.send("GET", "/api/v1/vms/404", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("404"));
}

#[tokio::test]
async fn nodes_come_from_control_plane() {
    let app = test_app();
    let (status, body) = app.send("GET", "/api/v1/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["node"], NODE);
}

#[tokio::test]
async fn live_status_reports_percent_usage() {
    let app = test_app();
    let id = app.provision("web", 2, 2048).await;
    let (_, body) = app.send("GET", &format!("/api/v1/vms/{id}"), None).await;
    app.plane.set_cpu(NODE, app.vmid_of(&body), 42.0);

    let (status, body) = app
        .send("GET", &format!("/api/v1/vms/{id}/status"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "running");
    let cpu = body["data"]["usage"]["cpu_percent"].as_f64().unwrap();
    assert!((cpu - 42.0).abs() < 1e-9);
}

#[tokio::test]
async fn manual_resize_is_partial_and_unrecorded() {
    let app = test_app();
    let id = app.provision("web", 2, 2048).await;

    let (status, body) = app
        .send(
            "POST",
            &format!("/api/v1/vms/{id}/resize"),
            Some(json!({ "cores": 6 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cores"], 6);
    assert_eq!(body["data"]["memory_mb"], 2048);

    let (_, events) = app
        .send("GET", &format!("/api/v1/vms/{id}/scaling_events"), None)
        .await;
    assert_eq!(events["data"], json!([]));
}

#[tokio::test]
async fn autoscaler_run_scales_busy_vm_and_records_history() {
    let app = test_app();
    let id = app.provision("web", 2, 2000).await;
    let (_, body) = app.send("GET", &format!("/api/v1/vms/{id}"), None).await;
    let vmid = app.vmid_of(&body);
    app.plane.set_cpu(NODE, vmid, 85.0);

    let (status, report) = app.send("POST", "/api/v1/autoscaler/run", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["data"]["events"].as_array().unwrap().len(), 1);

    let (_, body) = app.send("GET", &format!("/api/v1/vms/{id}"), None).await;
    assert_eq!(body["data"]["cores"], 3);
    assert_eq!(body["data"]["memory_mb"], 2500);

    app.plane.set_cpu(NODE, vmid, 10.0);
    app.send("POST", "/api/v1/autoscaler/run", None).await;

    let (_, events) = app
        .send("GET", &format!("/api/v1/vms/{id}/scaling_events"), None)
        .await;
    let events = events["data"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["kind"], "scale_down");
    assert_eq!(events[0]["old_cores"], 3);
    assert_eq!(events[0]["new_cores"], 2);
    assert_eq!(events[0]["new_memory_mb"], 2000);
    assert_eq!(events[1]["kind"], "scale_up");
    assert_eq!(events[1]["old_memory_mb"], 2000);

    let (_, limited) = app
        .send(
            "GET",
            &format!("/api/v1/vms/{id}/scaling_events?limit=1"),
            None,
        )
        .await;
    assert_eq!(limited["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_actuation_leaves_no_trace() {
    let app = test_app();
    let id = app.provision("web", 2, 2000).await;
    let (_, before) = app.send("GET", &format!("/api/v1/vms/{id}"), None).await;
    let vmid = app.vmid_of(&before);
    app.plane.set_cpu(NODE, vmid, 95.0);
    app.plane.set_fault(NODE, vmid, Fault::Update, true);

    let (status, report) = app.send("POST", "/api/v1/autoscaler/run", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["data"]["failed"], 1);

    let (_, after) = app.send("GET", &format!("/api/v1/vms/{id}"), None).await;
    assert_eq!(after["data"], before["data"]);
    let (_, events) = app
        .send("GET", &format!("/api/v1/vms/{id}/scaling_events"), None)
        .await;
    assert_eq!(events["data"], json!([]));
}

#[tokio::test]
async fn stopped_or_disabled_vms_are_not_scaled() {
    let app = test_app();
    let stopped = app.provision("stopped", 2, 2000).await;
    let disabled = app.provision("disabled", 2, 2000).await;
    for id in [stopped, disabled] {
        let (_, body) = app.send("GET", &format!("/api/v1/vms/{id}"), None).await;
        app.plane.set_cpu(NODE, app.vmid_of(&body), 95.0);
    }

    app.send("POST", &format!("/api/v1/vms/{stopped}/stop"), None)
        .await;
    let (status, _) = app
        .send(
            "PUT",
            &format!("/api/v1/vms/{disabled}/autoscaling"),
            Some(json!({ "enabled": false })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, report) = app.send("POST", "/api/v1/autoscaler/run", None).await;
    assert_eq!(report["data"]["candidates"], 1);
    assert_eq!(report["data"]["events"], json!([]));
}

#[tokio::test]
async fn autoscaler_start_stop_via_api() {
    let app = test_app();

    let (_, body) = app.send("POST", "/api/v1/autoscaler/start", None).await;
    assert_eq!(body["data"]["started"], true);
    let (_, body) = app.send("POST", "/api/v1/autoscaler/start", None).await;
    assert_eq!(body["data"]["started"], false);

    let (_, body) = app.send("GET", "/api/v1/autoscaler", None).await;
    assert_eq!(body["data"]["running"], true);
    assert_eq!(body["data"]["interval_secs"], 60);
    assert_eq!(body["data"]["cpu_threshold_high"], 80.0);

    let (_, body) = app.send("POST", "/api/v1/autoscaler/stop", None).await;
    assert_eq!(body["data"]["stopped"], true);
    let (_, body) = app.send("POST", "/api/v1/autoscaler/stop", None).await;
    assert_eq!(body["data"]["stopped"], false);
    assert!(!app.controller.is_running().await);
}

#[tokio::test]
async fn deprovision_removes_record_but_keeps_history() {
    let app = test_app();
    let id = app.provision("web", 2, 2000).await;
    let (_, body) = app.send("GET", &format!("/api/v1/vms/{id}"), None).await;
    let vmid = app.vmid_of(&body);
    app.plane.set_cpu(NODE, vmid, 95.0);
    app.send("POST", "/api/v1/autoscaler/run", None).await;

    let (status, _) = app.send("DELETE", &format!("/api/v1/vms/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(app.plane.vm(NODE, vmid).is_none());

    let (status, _) = app.send("GET", &format!("/api/v1/vms/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, events) = app
        .send("GET", &format!("/api/v1/vms/{id}/scaling_events"), None)
        .await;
    assert_eq!(events["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_body_is_a_client_error() {
    let app = test_app();
    let id = app.provision("web", 2, 2048).await;
    let (status, _) = app
        .send(
            "POST",
            &format!("/api/v1/vms/{id}/resize"),
            Some(json!({ "cores": "many" })),
        )
        .await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vmscale.redb");

    let id = {
        let app = test_app_with(StateStore::open(&path).unwrap());
        app.provision("persistent", 2, 2048).await
    };

    let store = StateStore::open(&path).unwrap();
    let vm = store.get_vm(id).unwrap().unwrap();
    assert_eq!(vm.name, "persistent");
}

#[tokio::test]
async fn vm_powered_off_out_of_band_is_not_scaled() {
    let app = test_app();
    let id = app.provision("web", 2, 2000).await;
    let (_, before) = app.send("GET", &format!("/api/v1/vms/{id}"), None).await;
    let vmid = app.vmid_of(&before);
    // Shut down directly on the hypervisor; the record still says running.
    app.plane.stop_vm(NODE, vmid).await.unwrap();

    let (status, report) = app.send("POST", "/api/v1/autoscaler/run", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["data"]["held"], 1);
    assert_eq!(report["data"]["events"], json!([]));

    let (_, after) = app.send("GET", &format!("/api/v1/vms/{id}"), None).await;
    assert_eq!(after["data"], before["data"]);
}

#[tokio::test]
async fn live_reads_and_software_catalog() {
    let app = test_app();
    let (status, catalog) = app.send("GET", "/api/v1/software", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(catalog["data"]["arr_suite"]["name"], "ARR Suite");

    let (status, body) = app
        .send(
            "POST",
            "/api/v1/vms",
            Some(json!({
                "node": NODE,
                "name": "office",
                "cores": 2,
                "memory": 2048,
                "software": ["office_suite"]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["data"]["software"], json!(["office_suite"]));
    let id = body["data"]["id"].as_u64().unwrap();
    let vmid = app.vmid_of(&body);

    let (status, config) = app
        .send("GET", &format!("/api/v1/vms/{id}/config"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["data"]["cores"], 2);
    assert_eq!(config["data"]["memory"], 2048);

    let (status, listing) = app
        .send("GET", &format!("/api/v1/nodes/{NODE}/vms"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["data"][0]["vmid"], vmid);
    assert_eq!(listing["data"][0]["node"], NODE);

    let (status, _) = app
        .send(
            "POST",
            "/api/v1/vms",
            Some(json!({ "node": NODE, "name": "bad", "software": ["nope"] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
