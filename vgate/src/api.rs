//! HTTP control API
//!
//! Exposes the forwarding table and the lease table. Failed mutations come
//! back as 400 with a plain-text reason; removing an unknown exposure is a
//! no-op success.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};

use crate::forwarder::{ExposeRequest, PortForwarder, UnexposeRequest};
use crate::pool::IpPool;

#[derive(Clone)]
struct ApiState {
    forwarder: Arc<PortForwarder>,
    pool: Arc<IpPool>,
}

pub(crate) fn router(forwarder: Arc<PortForwarder>, pool: Arc<IpPool>) -> Router {
    Router::new()
        .route("/services/forwarder/all", get(list_forwards))
        .route("/services/forwarder/expose", post(expose))
        .route("/services/forwarder/unexpose", post(unexpose))
        .route("/leases", get(leases))
        .with_state(ApiState { forwarder, pool })
}

async fn list_forwards(State(state): State<ApiState>) -> Json<Vec<ExposeRequest>> {
    Json(state.forwarder.list())
}

async fn expose(State(state): State<ApiState>, Json(req): Json<ExposeRequest>) -> Response {
    match state.forwarder.expose(&req.local, &req.remote).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

async fn unexpose(State(state): State<ApiState>, Json(req): Json<UnexposeRequest>) -> StatusCode {
    state.forwarder.unexpose(&req.local);
    StatusCode::OK
}

async fn leases(State(state): State<ApiState>) -> Json<BTreeMap<String, Ipv4Addr>> {
    Json(state.pool.leases())
}
