use crate::metrics::Metrics;
use crate::publisher::Publisher;
use crate::state::{Snapshot, SnapshotStore};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub store: Arc<SnapshotStore>,
    pub publisher: Arc<Publisher>,
    pub restrict_to_admin: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiState {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub broker_connected: bool,
    pub restrict_to_admin: bool,
}

pub fn build_router(
    metrics: Arc<Metrics>,
    store: Arc<SnapshotStore>,
    publisher: Arc<Publisher>,
    restrict_to_admin: bool,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .with_state(HttpAppState {
            metrics,
            store,
            publisher,
            restrict_to_admin,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(ApiState {
        snapshot: state.store.read().await,
        broker_connected: state.publisher.is_connected(),
        restrict_to_admin: state.restrict_to_admin,
    })
}
