pub(crate) mod collector;
pub(crate) mod command;
mod log_buffer;
pub(crate) mod runner;
pub(crate) mod workspace;

use crate::error::{JobFailure, ValidationError};
use crate::model::{
    now_rfc3339, ExitReport, JobEvent, JobOutcome, JobRequest, JobResult, JobSettings, JobState,
    ModelChoice,
};
use crate::presets::PresetRegistry;
use command::{split_extra_args, CommandSpec};
use log_buffer::LogBuffer;
use runner::{RunLimits, RunOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use workspace::Workspace;

#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Kill the running program and finish the job as cancelled
    Cancel,
}

/// Drives one job through validation, workspace setup, the run and result collection.
pub struct JobEngine {
    job_id: String,
    settings: Arc<JobSettings>,
    presets: Arc<PresetRegistry>,
}

/// Model file resolved during validation.
struct ResolvedModel {
    path: PathBuf,
    /// Uploaded files are copied into the workspace; presets are used in place.
    uploaded: bool,
}

struct Validated {
    input: PathBuf,
    model: ResolvedModel,
}

/// Per-job mutable state. Owned by the job's task only.
struct JobRun {
    job_id: String,
    started_utc: String,
    log: LogBuffer,
    event_tx: mpsc::UnboundedSender<JobEvent>,
}

/// Everything known when a job ends.
#[derive(Default)]
struct Finish {
    workspace: Option<PathBuf>,
    images: Vec<PathBuf>,
    archive: Option<PathBuf>,
    archive_error: Option<String>,
    exit: Option<ExitReport>,
    failure: Option<JobFailure>,
}

impl JobRun {
    fn state(&self, state: JobState) {
        tracing::debug!(job_id = %self.job_id, ?state, "job state");
        let _ = self.event_tx.send(JobEvent::State { state });
    }

    fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        let live = self.log.append(line.clone());
        let _ = self.event_tx.send(JobEvent::Log { line, live });
    }

    fn finish(mut self, finish: Finish) -> JobResult {
        let outcome = match finish.failure {
            None => JobOutcome::Success,
            Some(failure) => {
                tracing::warn!(job_id = %self.job_id, error = %failure, "job failed");
                self.log(format!("ERROR: {failure}"));
                JobOutcome::Failure {
                    kind: failure.kind(),
                    message: failure.to_string(),
                }
            }
        };
        let success = outcome.is_success();
        self.state(JobState::Done { success });
        JobResult {
            job_id: self.job_id,
            workspace: finish.workspace,
            images: finish.images,
            archive: finish.archive,
            archive_error: finish.archive_error,
            log: self.log.final_view(),
            exit: finish.exit,
            outcome,
            started_utc: self.started_utc,
            finished_utc: now_rfc3339(),
        }
    }

    fn fail(self, failure: JobFailure) -> JobResult {
        self.finish(Finish {
            failure: Some(failure),
            ..Finish::default()
        })
    }
}

impl JobEngine {
    pub fn new(job_id: String, settings: Arc<JobSettings>, presets: Arc<PresetRegistry>) -> Self {
        Self {
            job_id,
            settings,
            presets,
        }
    }

    /// Run the job to completion.
    ///
    /// Never fails: every failure is reported inside the returned `JobResult`,
    /// together with whatever log and images exist at that point.
    pub async fn run(
        self,
        request: JobRequest,
        event_tx: mpsc::UnboundedSender<JobEvent>,
        mut control_rx: mpsc::UnboundedReceiver<EngineControl>,
    ) -> JobResult {
        let cfg = &self.settings;
        let mut job = JobRun {
            job_id: self.job_id.clone(),
            started_utc: now_rfc3339(),
            log: LogBuffer::with_windows(cfg.live_window, cfg.final_window),
            event_tx,
        };
        tracing::info!(job_id = %self.job_id, "job started");

        job.state(JobState::Validating);
        let validated = match self.validate(&request) {
            Ok(v) => v,
            Err(failure) => return job.fail(failure),
        };

        job.state(JobState::PreparingWorkspace);
        let ws = match Workspace::create(&cfg.workspace_root).await {
            Ok(ws) => ws,
            Err(e) => return job.fail(e.into()),
        };
        tracing::info!(job_id = %self.job_id, workspace_id = ws.id(), path = %ws.path().display(), "workspace ready");

        let staged = async {
            let input = ws.copy_into(&validated.input).await?;
            let model = if validated.model.uploaded {
                ws.copy_into(&validated.model.path).await?
            } else {
                validated.model.path.clone()
            };
            Ok::<_, JobFailure>((input, model))
        }
        .await;
        let (input_path, model_path) = match staged {
            Ok(paths) => paths,
            Err(failure) => return abort_before_launch(job, ws, failure).await,
        };

        job.state(JobState::BuildingCommand);
        let cmd = match CommandSpec::build(
            &cfg.program,
            &cfg.program_args,
            &request,
            &model_path,
            &input_path,
        ) {
            Ok(cmd) => cmd,
            Err(e) => return abort_before_launch(job, ws, e.into()).await,
        };

        job.state(JobState::Running);
        job.log(format!("cwd: {}", ws.path().display()));
        job.log(format!("cmd: {}", cmd.display()));
        let process = match runner::spawn(&cmd, ws.path()) {
            Ok(p) => p,
            Err(e) => return abort_before_launch(job, ws, e.into()).await,
        };
        tracing::debug!(job_id = %self.job_id, pid = ?process.pid(), "streaming output");

        let limits = RunLimits {
            wall: cfg.timeout,
            idle: cfg.idle_timeout,
        };
        let outcome = process
            .supervise(limits, &mut control_rx, |line| job.log(line))
            .await;

        let (exit, mut failure) = match outcome {
            RunOutcome::Exited(exit) if exit.success() => (Some(exit), None),
            RunOutcome::Exited(exit) => (Some(exit), Some(JobFailure::Runtime(exit))),
            RunOutcome::TimedOut { kind, limit, exit } => {
                (exit, Some(JobFailure::Timeout { kind, limit }))
            }
            RunOutcome::Cancelled { exit } => (exit, Some(JobFailure::Cancelled)),
        };

        job.state(JobState::CollectingResults);
        let collection = collector::collect(ws.path()).await;
        let (archive, archive_error) = match collection.archive {
            Ok(path) => (Some(path), None),
            Err(e) => {
                let message = e.to_string();
                if failure.is_none() {
                    failure = Some(e.into());
                } else {
                    // The primary failure stays; keep the archive problem visible in the log.
                    job.log(format!("ERROR: {message}"));
                }
                (None, Some(message))
            }
        };
        tracing::info!(
            job_id = %self.job_id,
            images = collection.images.len(),
            archive = archive.is_some(),
            "results collected"
        );

        job.finish(Finish {
            workspace: Some(ws.path().to_path_buf()),
            images: collection.images,
            archive,
            archive_error,
            exit,
            failure,
        })
    }

    /// Check the request and resolve its files without touching the filesystem.
    fn validate(&self, req: &JobRequest) -> Result<Validated, JobFailure> {
        let input = req
            .input_image
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ValidationError::MissingInput)?;
        if !input.is_file() {
            return Err(ValidationError::InputNotFound(input.clone()).into());
        }

        let model = match &req.model {
            ModelChoice::Preset(name) => ResolvedModel {
                path: self
                    .presets
                    .resolve(name)
                    .map_err(ValidationError::from)?
                    .to_path_buf(),
                uploaded: false,
            },
            ModelChoice::Upload(path) => {
                let path = path
                    .as_ref()
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or(ValidationError::MissingUpload)?;
                check_readable(path)?;
                ResolvedModel {
                    path: path.clone(),
                    uploaded: true,
                }
            }
        };

        if !self.settings.model_types.iter().any(|t| *t == req.model_type) {
            return Err(ValidationError::UnknownModelType(
                req.model_type.clone(),
                self.settings.model_types.join(", "),
            )
            .into());
        }

        check_staged_names(input, &model)?;

        // Reject malformed extra arguments before any side effect.
        split_extra_args(&req.extra_args)?;

        Ok(Validated {
            input: input.clone(),
            model,
        })
    }
}

fn check_readable(path: &Path) -> Result<(), ValidationError> {
    let unreadable = |source| ValidationError::UnreadableUpload {
        path: path.to_path_buf(),
        source,
    };
    let meta = std::fs::metadata(path).map_err(unreadable)?;
    if !meta.is_file() {
        return Err(unreadable(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    std::fs::File::open(path).map_err(unreadable)?;
    Ok(())
}

/// Staged files share the workspace with the archive and with each other.
fn check_staged_names(input: &Path, model: &ResolvedModel) -> Result<(), ValidationError> {
    let input_name = input.file_name();
    let model_name = model.uploaded.then(|| model.path.file_name()).flatten();
    for name in [input_name, model_name].into_iter().flatten() {
        if name == collector::ARCHIVE_NAME {
            return Err(ValidationError::ReservedName(collector::ARCHIVE_NAME.to_string()));
        }
    }
    match (input_name, model_name) {
        (Some(a), Some(b)) if a == b => Err(ValidationError::NameCollision(
            a.to_string_lossy().into_owned(),
        )),
        _ => Ok(()),
    }
}

/// Failure after the workspace exists but before anything ran: drop the workspace.
async fn abort_before_launch(job: JobRun, ws: Workspace, failure: JobFailure) -> JobResult {
    let path = ws.path().to_path_buf();
    if let Err(e) = ws.remove().await {
        tracing::warn!(workspace = %path.display(), error = %e, "failed to remove workspace");
    }
    job.fail(failure)
}
