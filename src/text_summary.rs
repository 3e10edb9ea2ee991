//! Text summary builder for CLI output.

use crate::model::{JobOutcome, JobResult};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a human-readable summary of a finished job.
pub(crate) fn build_text_summary(result: &JobResult) -> TextSummary {
    let mut lines = Vec::new();

    let status = match &result.outcome {
        JobOutcome::Success => "success".to_string(),
        JobOutcome::Failure { message, .. } => format!("failed ({message})"),
    };
    lines.push(format!("Job {}: {status}", result.job_id));
    if let Some(exit) = result.exit.as_ref() {
        lines.push(format!("Exit: {}", exit.describe()));
    }
    if let Some(ws) = result.workspace.as_deref() {
        lines.push(format!("Workspace: {}", ws.display()));
    }
    match (&result.archive, &result.archive_error) {
        (Some(a), _) => lines.push(format!("Archive: {}", a.display())),
        (None, Some(e)) => lines.push(format!("Archive: not written ({e})")),
        (None, None) => {}
    }
    if result.images.is_empty() {
        lines.push("Images: none".into());
    } else {
        lines.push(format!("Images ({}):", result.images.len()));
        for img in &result.images {
            lines.push(format!("  {}", img.display()));
        }
    }
    lines.push(format!("Started: {}  Finished: {}", result.started_utc, result.finished_utc));

    TextSummary { lines }
}
