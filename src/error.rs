use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::model::ExitReport;

/// Bad or missing input, detected before any side effect.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("No input image provided.")]
    MissingInput,

    #[error("Input image not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error(transparent)]
    Preset(#[from] PresetError),

    #[error("Please upload a .pth model.")]
    MissingUpload,

    #[error("Uploaded model is not readable: {}: {source}", .path.display())]
    UnreadableUpload {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unsupported model type '{0}' (expected one of: {1})")]
    UnknownModelType(String, String),

    #[error("File name '{0}' is reserved for the results archive.")]
    ReservedName(String),

    #[error("Input image and uploaded model share the file name '{0}'.")]
    NameCollision(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresetError {
    #[error("Preset model '{0}' is not configured.")]
    Unknown(String),

    #[error("Preset model not found: {}", .path.display())]
    Missing { name: String, path: PathBuf },
}

#[derive(Error, Debug)]
#[error("cannot create workspace under {}: {source}", .root.display())]
pub struct WorkspaceError {
    pub root: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[derive(Error, Debug)]
pub enum CopyError {
    #[error("refusing to copy {}: no usable file name", .0.display())]
    InvalidName(PathBuf),

    #[error("refusing to overwrite {} in workspace", .0.display())]
    Exists(PathBuf),

    #[error("cannot copy {} into workspace: {source}", .from.display())]
    Io {
        from: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot parse extra arguments (unbalanced quotes?): {input}")]
pub struct ArgumentParseError {
    pub input: String,
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("executable not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("permission denied launching {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("failed to launch {}: {source}", .program.display())]
    Io {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    pub fn from_io(program: PathBuf, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => LaunchError::NotFound(program),
            std::io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied(program),
            _ => LaunchError::Io { program, source },
        }
    }
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("cannot read workspace {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write archive {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write archive {}: {source}", .path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
}

/// Which inactivity or total-time limit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    Wall,
    Idle,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Wall => f.write_str("total run time"),
            TimeoutKind::Idle => f.write_str("no output"),
        }
    }
}

fn format_limit(limit: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*limit)
}

/// Reason a job ended in `Done(failure)`.
#[derive(Error, Debug)]
pub enum JobFailure {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Copy(#[from] CopyError),

    #[error(transparent)]
    ArgumentParse(#[from] ArgumentParseError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("process failed with {}", .0.describe())]
    Runtime(ExitReport),

    #[error("timed out after {} ({kind})", format_limit(.limit))]
    Timeout { kind: TimeoutKind, limit: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Serializable tag of a `JobFailure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Workspace,
    Copy,
    ArgumentParse,
    Launch,
    Runtime,
    Timeout,
    Cancelled,
    Archive,
}

impl JobFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobFailure::Validation(_) => FailureKind::Validation,
            JobFailure::Workspace(_) => FailureKind::Workspace,
            JobFailure::Copy(_) => FailureKind::Copy,
            JobFailure::ArgumentParse(_) => FailureKind::ArgumentParse,
            JobFailure::Launch(_) => FailureKind::Launch,
            JobFailure::Runtime(_) => FailureKind::Runtime,
            JobFailure::Timeout { .. } => FailureKind::Timeout,
            JobFailure::Cancelled => FailureKind::Cancelled,
            JobFailure::Archive(_) => FailureKind::Archive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_error_classifies_io_kinds() {
        let p = PathBuf::from("/nope");
        let e = LaunchError::from_io(p.clone(), std::io::ErrorKind::NotFound.into());
        assert!(matches!(e, LaunchError::NotFound(_)));
        let e = LaunchError::from_io(p.clone(), std::io::ErrorKind::PermissionDenied.into());
        assert!(matches!(e, LaunchError::PermissionDenied(_)));
        let e = LaunchError::from_io(p, std::io::ErrorKind::Other.into());
        assert!(matches!(e, LaunchError::Io { .. }));
    }

    #[test]
    fn timeout_message_names_the_limit() {
        let e = JobFailure::Timeout {
            kind: TimeoutKind::Idle,
            limit: Duration::from_secs(30),
        };
        assert_eq!(e.to_string(), "timed out after 30s (no output)");
        assert_eq!(e.kind(), FailureKind::Timeout);
    }

    #[test]
    fn preset_messages_identify_the_path() {
        let e = ValidationError::from(PresetError::Missing {
            name: "UNet (default)".into(),
            path: PathBuf::from("/models/unet.pth"),
        });
        assert_eq!(e.to_string(), "Preset model not found: /models/unet.pth");
    }
}
