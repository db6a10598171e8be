use axum::{
    Extension,
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
};
use metrics::counter;
use serde::Deserialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::info;

use crate::{
    application::{
        error::HttpError,
        render::{Decision, Submission},
    },
    domain::text::ContentKey,
    infra::telemetry::METRIC_TTS_REQUESTS_TOTAL,
};

use super::{RequestContext, public::HttpState};

const FILES_PREFIX: &str = "/files/";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct TtsQuery {
    text: Option<String>,
}

/// `GET /tts?text=...`: render (or reuse) speech for `text` and redirect to the file.
pub(super) async fn tts(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<TtsQuery>,
) -> Response {
    let text = query.text.unwrap_or_default();

    let submission = match state.coordinator.submit(&text).await {
        Ok(submission) => submission,
        Err(err) => {
            log_request(&ctx, &text, "", Decision::RejectInvalid);
            return HttpError::from(err).into_response();
        }
    };

    let key = submission.key().clone();
    log_request(&ctx, &text, key.file_name().as_str(), submission.decision());

    match submission.resolve().await {
        Ok(_) => Redirect::to(&artifact_location(&key)).into_response(),
        Err(err) => HttpError::from(err).into_response(),
    }
}

pub(super) fn artifact_location(key: &ContentKey) -> String {
    format!("{FILES_PREFIX}{}", key.file_name())
}

fn log_request(ctx: &RequestContext, text: &str, file: &str, decision: Decision) {
    counter!(METRIC_TTS_REQUESTS_TOTAL, "decision" => decision.as_str()).increment(1);

    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    info!(
        target = "sonare::http::tts",
        timestamp = %timestamp,
        request_id = %ctx.request_id,
        client_addr = %ctx.client_addr_display(),
        forwarded_for = ctx.forwarded_for.as_deref().unwrap_or(""),
        text = text,
        file = file,
        decision = decision.as_str(),
        "tts request"
    );
}
