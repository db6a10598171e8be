use std::{num::NonZeroUsize, sync::Arc};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use sonare::{
    application::render::{
        FailureCode, PoolLimits, RenderCoordinator, RenderFailure, RenderJob, Renderer,
        WorkerPool,
    },
    domain::text::ContentKey,
    infra::{
        artifacts::ArtifactStore,
        http::{HttpState, build_router},
    },
};
use tempfile::TempDir;
use tower::ServiceExt;

const MAX_TEXT_LENGTH: usize = 10;

struct EchoRenderer;

#[async_trait]
impl Renderer for EchoRenderer {
    async fn render(&self, job: &RenderJob<'_>) -> Result<(), RenderFailure> {
        if job.text == "fail" {
            return Err(RenderFailure::new(FailureCode::ExitStatus, "exit code 1: nope"));
        }
        tokio::fs::write(job.output, format!("RIFF {}", job.text))
            .await
            .map_err(|err| RenderFailure::new(FailureCode::Io, err.to_string()))
    }
}

fn app(dir: &TempDir, with_metrics: bool) -> Router {
    let artifacts = Arc::new(ArtifactStore::new(dir.path().join("files")).expect("store"));
    let pool = WorkerPool::new(
        PoolLimits {
            max_procs: NonZeroUsize::new(1).expect("non-zero"),
            max_queue_depth: 4,
        },
        Arc::new(EchoRenderer),
        Arc::clone(&artifacts),
    );
    let coordinator = Arc::new(RenderCoordinator::new(
        Arc::clone(&artifacts),
        pool,
        MAX_TEXT_LENGTH,
    ));
    let metrics = with_metrics.then(|| PrometheusBuilder::new().build_recorder().handle());

    build_router(HttpState {
        coordinator,
        artifacts,
        metrics,
    })
}

async fn get(app: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
    let response = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn blank_or_missing_text_is_bad_request() {
    let dir = TempDir::new().expect("temp dir");
    let app = app(&dir, false);

    for uri in ["/tts", "/tts?text=", "/tts?text=%20%20"] {
        let (status, _, body) = get(&app, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body, "Input text must be nonempty");
    }
}

#[tokio::test]
async fn overlong_text_reports_both_lengths() {
    let dir = TempDir::new().expect("temp dir");
    let app = app(&dir, false);

    let (status, _, body) = get(&app, "/tts?text=hello%20world").await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body, "Input text length 11 exceeds maximum 10");
}

#[tokio::test]
async fn rendered_text_redirects_to_cacheable_file() {
    let dir = TempDir::new().expect("temp dir");
    let app = app(&dir, false);

    let (status, headers, _) = get(&app, "/tts?text=hi%20there").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    let location = headers
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .expect("location header")
        .to_string();
    let key = ContentKey::from_normalized("hi there");
    assert_eq!(location, format!("/files/{}", key.file_name()));

    let (status, headers, body) = get(&app, &location).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "RIFF hi there");
    assert_eq!(
        headers
            .get(header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok()),
        Some("public, max-age=31536000, immutable")
    );

    // Served from disk the second time.
    let (status, headers, _) = get(&app, "/tts?text=hi%20there").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(
        headers
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok()),
        Some(location.as_str())
    );
}

#[tokio::test]
async fn render_failure_is_server_error() {
    let dir = TempDir::new().expect("temp dir");
    let app = app(&dir, false);

    let (status, _, body) = get(&app, "/tts?text=fail").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("exit_status"), "unexpected body: {body}");
}

#[tokio::test]
async fn unknown_or_unsafe_files_are_not_found() {
    let dir = TempDir::new().expect("temp dir");
    let app = app(&dir, false);

    let (status, _, _) = get(&app, "/files/missing.wav").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = get(&app, "/files/nested/dir.wav").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = get(&app, "/files/.staging-abc.wav").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn index_health_and_metrics_routes() {
    let dir = TempDir::new().expect("temp dir");

    let app_without_metrics = app(&dir, false);
    let (status, headers, body) = get(&app_without_metrics, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/html"))
    );
    assert!(body.contains("/tts"));

    let (status, _, _) = get(&app_without_metrics, "/static/style.css").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = get(&app_without_metrics, "/_health").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = get(&app_without_metrics, "/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let app_with_metrics = app(&dir, true);
    let (status, headers, _) = get(&app_with_metrics, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/plain"))
    );
}
