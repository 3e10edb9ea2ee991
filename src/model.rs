use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::FailureKind;

/// Name of the preset selected when a request does not name a model.
pub const DEFAULT_PRESET: &str = "UNet (default)";

/// Model-type tag accepted when none is configured.
pub const DEFAULT_MODEL_TYPE: &str = "unet";

/// Settings shared read-only by every job of this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    /// Executable of the inference program (usually the interpreter).
    pub program: PathBuf,
    /// Arguments placed between the executable and the job flags.
    pub program_args: Vec<String>,
    /// Directory under which per-job workspaces are created.
    pub workspace_root: PathBuf,
    pub live_window: usize,
    pub final_window: usize,
    /// Total wall-clock budget for the child process.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Maximum time without a new output line.
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    pub retention: RetentionPolicy,
    #[serde(with = "humantime_serde")]
    pub workspace_ttl: Duration,
    /// Exported copies of the archive and images land here when set.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Accepted values for `JobRequest::model_type`.
    pub model_types: Vec<String>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            program_args: vec!["-u".into(), "inference/new_map_inference.py".into()],
            workspace_root: default_workspace_root(),
            live_window: 500,
            final_window: 2000,
            timeout: None,
            idle_timeout: None,
            retention: RetentionPolicy::Keep,
            workspace_ttl: Duration::from_secs(24 * 60 * 60),
            output_dir: None,
            model_types: vec![DEFAULT_MODEL_TYPE.to_string()],
        }
    }
}

/// Workspaces live in the user cache directory, falling back to the system temp dir.
pub fn default_workspace_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("histmap-runner")
        .join("workspaces")
}

/// What happens to a workspace once its `JobResult` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    /// Leave every workspace in place (stale ones are swept by TTL).
    Keep,
    /// Remove every workspace.
    Delete,
    /// Remove workspaces of successful jobs, keep failed ones for debugging.
    KeepFailed,
}

impl RetentionPolicy {
    pub fn should_remove(self, success: bool) -> bool {
        match self {
            RetentionPolicy::Keep => false,
            RetentionPolicy::Delete => true,
            RetentionPolicy::KeepFailed => success,
        }
    }
}

/// Which weight file the job should use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelChoice {
    /// A named entry of the preset registry.
    Preset(String),
    /// An ad-hoc weight file supplied with the request.
    Upload(Option<PathBuf>),
}

impl Default for ModelChoice {
    fn default() -> Self {
        ModelChoice::Preset(DEFAULT_PRESET.to_string())
    }
}

/// Parameters of one job as handed over by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub input_image: Option<PathBuf>,
    #[serde(default)]
    pub model: ModelChoice,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default = "default_true")]
    pub unseen: bool,
    #[serde(default = "default_true")]
    pub vectorization: bool,
    #[serde(default)]
    pub extra_args: String,
}

fn default_model_type() -> String {
    DEFAULT_MODEL_TYPE.to_string()
}

fn default_true() -> bool {
    true
}

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Render a short human-readable description.
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(sig)) => format!("terminated by signal {sig}"),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

/// Orchestrator states, emitted on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Validating,
    PreparingWorkspace,
    BuildingCommand,
    Running,
    CollectingResults,
    Done { success: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure { kind: FailureKind, message: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success)
    }
}

/// Terminal artifact handed back to the collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    /// Absent when the job failed before a workspace was created.
    pub workspace: Option<PathBuf>,
    pub images: Vec<PathBuf>,
    pub archive: Option<PathBuf>,
    /// Set when collection ran but the archive could not be written.
    #[serde(default)]
    pub archive_error: Option<String>,
    pub log: String,
    /// Absent when the program never ran.
    pub exit: Option<ExitReport>,
    pub outcome: JobOutcome,
    pub started_utc: String,
    pub finished_utc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    State {
        state: JobState,
    },
    Log {
        line: String,
        /// Current live window, newest line last.
        live: String,
    },
    Completed {
        // Boxed so per-line events stay small.
        result: Box<JobResult>,
    },
}

/// Collaborator-facing snapshot: images, archive and log text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub images: Vec<PathBuf>,
    pub archive: Option<PathBuf>,
    pub log: String,
}

impl From<&JobResult> for JobUpdate {
    fn from(r: &JobResult) -> Self {
        Self {
            images: r.images.clone(),
            archive: r.archive.clone(),
            log: r.log.clone(),
        }
    }
}

/// Current UTC time as RFC 3339.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}
