use super::AppState;
use crate::model::{JobEvent, JobRequest, JobResult, JobState, JobUpdate};
use crate::orchestrator::{start_job, JobHandle};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::mpsc;

/// One line of the NDJSON job stream.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Frame {
    State { state: JobState },
    Update(JobUpdate),
    Result(Box<JobResult>),
}

pub(crate) async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub(crate) async fn list_presets(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "presets": state.presets.list(),
        "model_types": state.settings.model_types,
    }))
}

/// Start a job and stream its progress. Closing the connection cancels the job.
pub(crate) async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> impl IntoResponse {
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let handle = start_job(
        state.settings.clone(),
        state.presets.clone(),
        request,
        evt_tx,
    );
    let job_id = handle.job_id().to_string();
    tracing::info!(job_id = %job_id, "job accepted");

    let stream = futures::stream::unfold((evt_rx, handle), next_chunk);
    (
        [
            (header::CONTENT_TYPE, "application/x-ndjson".to_string()),
            (HeaderName::from_static("x-job-id"), job_id),
        ],
        Body::from_stream(stream),
    )
}

/// Pull the next event and render it. The handle rides along so that dropping
/// the stream drops the job's control channel.
async fn next_chunk(
    (mut evt_rx, handle): (mpsc::UnboundedReceiver<JobEvent>, JobHandle),
) -> Option<(Result<Bytes, Infallible>, (mpsc::UnboundedReceiver<JobEvent>, JobHandle))> {
    let ev = evt_rx.recv().await?;
    let frames = match ev {
        JobEvent::State { state } => vec![Frame::State { state }],
        JobEvent::Log { live, .. } => vec![Frame::Update(JobUpdate {
            images: Vec::new(),
            archive: None,
            log: live,
        })],
        JobEvent::Completed { result } => {
            tracing::info!(job_id = handle.job_id(), success = result.outcome.is_success(), "job finished");
            vec![Frame::Update(JobUpdate::from(result.as_ref())), Frame::Result(result)]
        }
    };
    Some((Ok(encode_frames(&frames)), (evt_rx, handle)))
}

fn encode_frames(frames: &[Frame]) -> Bytes {
    let mut buf = Vec::new();
    for frame in frames {
        match serde_json::to_writer(&mut buf, frame) {
            Ok(()) => buf.push(b'\n'),
            Err(e) => tracing::warn!(error = %e, "failed to encode frame"),
        }
    }
    Bytes::from(buf)
}
