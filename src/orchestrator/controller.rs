//! Job lifecycle controller.
//!
//! Spawns each job as its own task and hands the collaborator a handle to cancel or await it.

use crate::engine::{EngineControl, JobEngine};
use crate::model::{JobEvent, JobRequest, JobResult, JobSettings};
use crate::orchestrator::post_process::process_job_completion;
use crate::presets::PresetRegistry;
use anyhow::{Context, Result};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

/// Control handle for one running job.
///
/// Dropping the handle drops the control sender, which the engine treats as a cancel.
pub(crate) struct JobHandle {
    job_id: String,
    ctrl_tx: UnboundedSender<EngineControl>,
    handle: JoinHandle<JobResult>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel(&self) {
        let _ = self.ctrl_tx.send(EngineControl::Cancel);
    }

    /// Wait for the job, post-processing included.
    pub async fn join(self) -> Result<JobResult> {
        // Keep the control sender alive until the job is over.
        let JobHandle {
            job_id,
            ctrl_tx,
            handle,
        } = self;
        let res = handle
            .await
            .with_context(|| format!("job {job_id} task failed"));
        drop(ctrl_tx);
        res
    }
}

fn gen_job_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}", rng.gen::<u64>())
}

/// Spawn a new job and return its control handle.
///
/// The event stream ends with exactly one `JobEvent::Completed` carrying the
/// post-processed result.
pub(crate) fn start_job(
    settings: Arc<JobSettings>,
    presets: Arc<PresetRegistry>,
    request: JobRequest,
    event_tx: UnboundedSender<JobEvent>,
) -> JobHandle {
    let job_id = gen_job_id();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();
    let engine = JobEngine::new(job_id.clone(), settings.clone(), presets);
    let span_id = job_id.clone();
    let handle = tokio::spawn(async move {
        let raw = engine.run(request, event_tx.clone(), ctrl_rx).await;
        let processed = process_job_completion(&settings, raw).await;
        for msg in &processed.export_messages {
            tracing::info!(job_id = %span_id, "{msg}");
        }
        let result = processed.result;
        let _ = event_tx.send(JobEvent::Completed {
            result: Box::new(result.clone()),
        });
        result
    });
    JobHandle {
        job_id,
        ctrl_tx,
        handle,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::model::{JobOutcome, ModelChoice, DEFAULT_PRESET};
    use std::path::PathBuf;

    fn setup(script: &str) -> (tempfile::TempDir, Arc<JobSettings>, Arc<PresetRegistry>, JobRequest) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("map.jpg");
        std::fs::write(&input, b"img").unwrap();
        let weights = dir.path().join("w.pth");
        std::fs::write(&weights, b"w").unwrap();
        let mut presets = PresetRegistry::new();
        presets.insert(DEFAULT_PRESET, weights);
        let settings = JobSettings {
            program: PathBuf::from("sh"),
            program_args: vec!["-c".into(), script.into()],
            workspace_root: dir.path().join("ws"),
            ..JobSettings::default()
        };
        let request = JobRequest {
            input_image: Some(input),
            model: ModelChoice::Preset(DEFAULT_PRESET.into()),
            model_type: "unet".into(),
            unseen: true,
            vectorization: false,
            extra_args: String::new(),
        };
        (dir, Arc::new(settings), Arc::new(presets), request)
    }

    #[tokio::test]
    async fn completed_event_is_last_and_matches_join() {
        let (_dir, settings, presets, request) = setup("echo hello; touch seg.png");
        let (evt_tx, mut evt_rx) = mpsc::unbounded_channel();
        let handle = start_job(settings, presets, request, evt_tx);
        assert_eq!(handle.job_id().len(), 16);

        let result = handle.join().await.unwrap();
        assert!(result.outcome.is_success());

        let mut last = None;
        let mut completed = 0;
        while let Some(ev) = evt_rx.recv().await {
            if matches!(ev, JobEvent::Completed { .. }) {
                completed += 1;
            }
            last = Some(ev);
        }
        assert_eq!(completed, 1);
        match last {
            Some(JobEvent::Completed { result: done }) => {
                assert_eq!(done.job_id, result.job_id);
                assert_eq!(done.images, result.images);
            }
            other => panic!("unexpected last event {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_through_handle() {
        let (_dir, settings, presets, request) = setup("echo ready; sleep 30");
        let (evt_tx, mut evt_rx) = mpsc::unbounded_channel();
        let handle = start_job(settings, presets, request, evt_tx);
        while let Some(ev) = evt_rx.recv().await {
            if matches!(&ev, JobEvent::Log { line, .. } if line == "ready") {
                handle.cancel();
                break;
            }
        }
        let result = handle.join().await.unwrap();
        assert!(matches!(
            result.outcome,
            JobOutcome::Failure { kind: FailureKind::Cancelled, .. }
        ));
    }

    #[test]
    fn job_ids_are_distinct_hex() {
        let a = gen_job_id();
        let b = gen_job_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
