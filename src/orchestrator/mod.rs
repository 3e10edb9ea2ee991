//! Application-level orchestration utilities.
//!
//! This module owns the job lifecycle (spawn, cancel, await) and post-job processing
//! such as exports, workspace retention and stale-workspace sweeps. CLI and HTTP layers
//! call into this module to keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{start_job, JobHandle};
pub(crate) use post_process::sweep_workspaces;
