//! Post-job processing utilities.
//!
//! Handles exports to the output directory, workspace retention and the stale-workspace sweep.

use crate::engine::workspace::sweep_stale;
use crate::model::{JobResult, JobSettings};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Result of post-job processing, ready for collaborators.
pub(crate) struct ProcessedJob {
    pub result: JobResult,
    pub export_messages: Vec<String>,
}

/// Export results when an output directory is configured, then apply the retention policy.
///
/// A workspace is only removed once its archive and images were exported, so a
/// deleting policy never throws away the only copy of a result.
pub(crate) async fn process_job_completion(settings: &JobSettings, run: JobResult) -> ProcessedJob {
    let mut result = run;
    let mut export_messages = Vec::new();

    let Some(workspace) = result.workspace.clone() else {
        return ProcessedJob {
            result,
            export_messages,
        };
    };

    let mut exported = false;
    if let Some(out_root) = settings.output_dir.as_deref() {
        let dest = out_root.join(&result.job_id);
        match export_results(&result, &dest).await {
            Ok((images, archive)) => {
                export_messages.push(format!("Exported results: {}", dest.display()));
                result.images = images;
                result.archive = archive;
                exported = true;
            }
            Err(e) => export_messages.push(format!("Export failed: {e:#}")),
        }
    }

    if settings.retention.should_remove(result.outcome.is_success()) {
        if exported {
            match tokio::fs::remove_dir_all(&workspace).await {
                Ok(()) => {
                    export_messages.push(format!("Removed workspace: {}", workspace.display()));
                    result.workspace = None;
                }
                Err(e) => export_messages.push(format!(
                    "Removing workspace {} failed: {e}",
                    workspace.display()
                )),
            }
        } else {
            export_messages.push(format!(
                "Keeping workspace {} (results were not exported)",
                workspace.display()
            ));
        }
    }

    ProcessedJob {
        result,
        export_messages,
    }
}

/// Copy images and archive into `dest`; returns the rewritten paths.
async fn export_results(
    result: &JobResult,
    dest: &Path,
) -> Result<(Vec<PathBuf>, Option<PathBuf>)> {
    tokio::fs::create_dir_all(dest)
        .await
        .with_context(|| format!("create {}", dest.display()))?;

    let mut images = Vec::with_capacity(result.images.len());
    for img in &result.images {
        images.push(copy_to(img, dest).await?);
    }
    let archive = match result.archive.as_deref() {
        Some(a) => Some(copy_to(a, dest).await?),
        None => None,
    };
    Ok((images, archive))
}

async fn copy_to(src: &Path, dest: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .with_context(|| format!("no file name in {}", src.display()))?;
    let target = dest.join(name);
    tokio::fs::copy(src, &target)
        .await
        .with_context(|| format!("copy {} to {}", src.display(), target.display()))?;
    Ok(target)
}

/// Remove workspaces older than the configured TTL.
pub(crate) async fn sweep_workspaces(settings: &JobSettings) -> usize {
    match sweep_stale(&settings.workspace_root, settings.workspace_ttl).await {
        Ok(0) => 0,
        Ok(n) => {
            tracing::info!(
                removed = n,
                root = %settings.workspace_root.display(),
                "swept stale workspaces"
            );
            n
        }
        Err(e) => {
            tracing::warn!(
                root = %settings.workspace_root.display(),
                error = %e,
                "workspace sweep failed"
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::model::{JobOutcome, RetentionPolicy};
    use std::time::Duration;

    fn result_in(ws: &Path, success: bool) -> JobResult {
        std::fs::create_dir_all(ws).unwrap();
        std::fs::write(ws.join("out.png"), b"png").unwrap();
        std::fs::write(ws.join("outputs.zip"), b"zip").unwrap();
        JobResult {
            job_id: "abc123".into(),
            workspace: Some(ws.to_path_buf()),
            images: vec![ws.join("out.png")],
            archive: Some(ws.join("outputs.zip")),
            archive_error: None,
            log: "done".into(),
            exit: None,
            outcome: if success {
                JobOutcome::Success
            } else {
                JobOutcome::Failure {
                    kind: FailureKind::Runtime,
                    message: "process failed with exit code 1".into(),
                }
            },
            started_utc: "t0".into(),
            finished_utc: "t1".into(),
        }
    }

    #[tokio::test]
    async fn keep_without_output_dir_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("histmapseg_x");
        let settings = JobSettings::default();
        let p = process_job_completion(&settings, result_in(&ws, true)).await;
        assert_eq!(p.result.workspace.as_deref(), Some(ws.as_path()));
        assert_eq!(p.result.images, vec![ws.join("out.png")]);
        assert!(p.export_messages.is_empty());
        assert!(ws.exists());
    }

    #[tokio::test]
    async fn delete_policy_exports_then_removes_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("histmapseg_y");
        let out = dir.path().join("out");
        let settings = JobSettings {
            retention: RetentionPolicy::Delete,
            output_dir: Some(out.clone()),
            ..JobSettings::default()
        };
        let p = process_job_completion(&settings, result_in(&ws, true)).await;

        let dest = out.join("abc123");
        assert_eq!(p.result.images, vec![dest.join("out.png")]);
        assert_eq!(p.result.archive, Some(dest.join("outputs.zip")));
        assert!(dest.join("out.png").is_file());
        assert!(p.result.workspace.is_none());
        assert!(!ws.exists());
    }

    #[tokio::test]
    async fn keep_failed_retains_failed_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("histmapseg_z");
        let settings = JobSettings {
            retention: RetentionPolicy::KeepFailed,
            output_dir: Some(dir.path().join("out")),
            ..JobSettings::default()
        };
        let p = process_job_completion(&settings, result_in(&ws, false)).await;
        assert!(ws.exists());
        assert_eq!(p.result.workspace.as_deref(), Some(ws.as_path()));
    }

    #[tokio::test]
    async fn failed_export_keeps_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("histmapseg_w");
        // A file where the output directory should be makes the export fail.
        let blocker = dir.path().join("out");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let settings = JobSettings {
            retention: RetentionPolicy::Delete,
            output_dir: Some(blocker),
            ..JobSettings::default()
        };
        let p = process_job_completion(&settings, result_in(&ws, true)).await;
        assert!(ws.exists());
        assert!(p.export_messages[0].starts_with("Export failed"));
        assert_eq!(p.result.images, vec![ws.join("out.png")]);
    }

    #[tokio::test]
    async fn sweep_uses_settings_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("histmapseg_old")).unwrap();
        std::fs::create_dir(dir.path().join("unrelated")).unwrap();
        let settings = JobSettings {
            workspace_root: dir.path().to_path_buf(),
            workspace_ttl: Duration::ZERO,
            ..JobSettings::default()
        };
        assert_eq!(sweep_workspaces(&settings).await, 1);
        assert!(dir.path().join("unrelated").exists());
    }
}
