use std::{io::ErrorKind, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{
        HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::error;

use crate::{
    application::{error::HttpError, render::RenderCoordinator},
    infra::{
        artifacts::{ArtifactError, ArtifactStore},
        assets,
    },
};

use super::{
    middleware::{log_responses, set_request_context},
    tts::tts,
};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
pub struct HttpState {
    pub coordinator: Arc<RenderCoordinator>,
    pub artifacts: Arc<ArtifactStore>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(assets::serve_index))
        .route("/static/{*path}", get(assets::serve_asset))
        .route("/tts", get(tts))
        .route("/files/{*path}", get(serve_artifact))
        .route("/metrics", get(render_metrics))
        .route("/_health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn serve_artifact(State(state): State<HttpState>, Path(path): Path<String>) -> Response {
    const SOURCE: &str = "infra::http::public::serve_artifact";

    match state.artifacts.read(&path).await {
        Ok(bytes) => build_artifact_response(&path, bytes),
        Err(ArtifactError::InvalidName) => HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "File not found",
            format!("Rejected artifact name `{path}`"),
        )
        .into_response(),
        Err(ArtifactError::Io(err)) if err.kind() == ErrorKind::NotFound => HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "File not found",
            "The requested artifact is not available",
        )
        .into_response(),
        Err(err) => {
            error!(
                target = SOURCE,
                path = %path,
                error = %err,
                "failed to read stored artifact"
            );
            HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read rendered file",
                &err,
            )
            .into_response()
        }
    }
}

fn build_artifact_response(path: &str, bytes: Bytes) -> Response {
    let len = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }
    // Artifact names are content hashes, so a name never changes meaning.
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );

    response
}

async fn render_metrics(State(state): State<HttpState>) -> Response {
    match state.metrics.as_ref() {
        Some(handle) => (
            [(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            handle.render(),
        )
            .into_response(),
        None => HttpError::new(
            "infra::http::public::render_metrics",
            StatusCode::NOT_FOUND,
            "Metrics are not enabled",
            "No metrics recorder installed",
        )
        .into_response(),
    }
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}
