//! Observability HTTP endpoints.
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/healthz` | GET | Liveness probe |
//! | `/readyz` | GET | Readiness probe |
//! | `/v1/volumes` | GET | Volume summaries |
//! | `/v1/volumes/{name}` | GET | One volume with its children |
//! | `/v1/nodes` | GET | Node and disk summaries |
//!
//! Read-only: the management API proper lives outside this daemon.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::error;

use dbv_datastore::DataStore;

#[derive(Clone)]
struct AppState {
    ds: DataStore,
}

pub async fn serve(addr: String, ds: DataStore, shutdown: Arc<Notify>) {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(healthz))
        .route("/v1/volumes", get(list_volumes))
        .route("/v1/volumes/:name", get(get_volume))
        .route("/v1/nodes", get(list_nodes))
        .with_state(AppState { ds });

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, "failed to bind observability endpoint: {}", e);
            return;
        }
    };
    let _ = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await;
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_volumes(State(state): State<AppState>) -> Json<Value> {
    let volumes: Vec<Value> = state
        .ds
        .list_volumes()
        .into_iter()
        .map(|v| {
            json!({
                "name": v.name(),
                "state": v.status.state.to_string(),
                "robustness": v.status.robustness.to_string(),
                "node": v.status.current_node_id,
                "replicas": v.spec.number_of_replicas,
            })
        })
        .collect();
    Json(json!({ "volumes": volumes }))
}

async fn get_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let volume = state
        .ds
        .get_volume(&name)
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let engines: Vec<Value> = state
        .ds
        .list_engines_by_volume(&name)
        .into_iter()
        .map(|e| {
            json!({
                "name": e.name(),
                "node": e.spec.instance.node_id,
                "desire": e.spec.instance.desire_state.to_string(),
                "state": e.status.instance.current_state.to_string(),
                "endpoint": e.status.endpoint,
            })
        })
        .collect();
    let replicas: Vec<Value> = state
        .ds
        .list_replicas_by_volume(&name)
        .into_iter()
        .map(|r| {
            json!({
                "name": r.name(),
                "node": r.spec.instance.node_id,
                "disk": r.spec.disk_id,
                "desire": r.spec.instance.desire_state.to_string(),
                "state": r.status.instance.current_state.to_string(),
                "failed_at": r.spec.failed_at,
            })
        })
        .collect();
    Ok(Json(json!({
        "volume": {
            "name": volume.name(),
            "state": volume.status.state.to_string(),
            "robustness": volume.status.robustness.to_string(),
            "node": volume.status.current_node_id,
            "conditions": volume.status.conditions,
        },
        "engines": engines,
        "replicas": replicas,
    })))
}

async fn list_nodes(State(state): State<AppState>) -> Json<Value> {
    let nodes: Vec<Value> = state
        .ds
        .list_nodes()
        .into_iter()
        .map(|n| {
            let disks: Vec<Value> = state
                .ds
                .list_disks_by_node(n.name())
                .into_iter()
                .map(|d| {
                    json!({
                        "id": d.name(),
                        "path": d.spec.path,
                        "schedulable_bytes": d.schedulable_bytes(),
                    })
                })
                .collect();
            json!({
                "name": n.name(),
                "ready": n.is_ready(),
                "allow_scheduling": n.spec.allow_scheduling,
                "tags": n.spec.tags,
                "disks": disks,
            })
        })
        .collect();
    Json(json!({ "nodes": nodes }))
}
