use crate::model::{
    default_workspace_root, JobEvent, JobRequest, JobSettings, JobState, ModelChoice,
    RetentionPolicy, DEFAULT_MODEL_TYPE, DEFAULT_PRESET,
};
use crate::orchestrator::{start_job, sweep_workspaces};
use crate::presets::PresetRegistry;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "histmap-runner",
    version,
    about = "Run the historical map segmentation program per job, stream its log and archive the outputs"
)]
pub struct Cli {
    #[command(flatten)]
    pub settings: SettingsArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Process-wide job settings.
#[derive(Debug, Args, Clone)]
pub struct SettingsArgs {
    /// Executable of the inference program
    #[arg(long, env = "HISTMAP_PROGRAM", default_value = "python3")]
    pub program: PathBuf,

    /// Argument placed before the job flags (repeatable)
    #[arg(
        long = "program-arg",
        value_name = "ARG",
        allow_hyphen_values = true,
        default_values = ["-u", "inference/new_map_inference.py"]
    )]
    pub program_args: Vec<String>,

    /// Directory holding the per-job workspaces [default: user cache dir]
    #[arg(long, env = "HISTMAP_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,

    /// Lines shown while a job runs
    #[arg(long, default_value_t = 500)]
    pub live_lines: usize,

    /// Lines kept in the final log
    #[arg(long, default_value_t = 2000)]
    pub final_lines: usize,

    /// Kill the program after this total run time (e.g. 30m)
    #[arg(long, env = "HISTMAP_TIMEOUT")]
    pub timeout: Option<humantime::Duration>,

    /// Kill the program after this long without output
    #[arg(long, env = "HISTMAP_IDLE_TIMEOUT")]
    pub idle_timeout: Option<humantime::Duration>,

    /// What to do with a workspace once its job is done
    #[arg(long, value_enum, env = "HISTMAP_RETENTION", default_value_t = RetentionPolicy::Keep)]
    pub retention: RetentionPolicy,

    /// Workspaces older than this are swept
    #[arg(long, env = "HISTMAP_WORKSPACE_TTL", default_value = "24h")]
    pub workspace_ttl: humantime::Duration,

    /// Copy archives and images to <DIR>/<job id>
    #[arg(long, env = "HISTMAP_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Directory the stock preset path is resolved against
    #[arg(long, env = "HISTMAP_APP_ROOT", default_value = ".")]
    pub app_root: PathBuf,

    /// Extra preset as NAME=PATH (repeatable)
    #[arg(long = "add-preset", value_name = "NAME=PATH", value_parser = PresetRegistry::parse_entry)]
    pub add_presets: Vec<(String, PathBuf)>,

    /// Register every .pth file of this directory as a preset
    #[arg(long, env = "HISTMAP_MODELS_DIR")]
    pub models_dir: Option<PathBuf>,

    /// Accepted --model_type values (repeatable)
    #[arg(long = "allowed-model-type", value_name = "TYPE", default_values = [DEFAULT_MODEL_TYPE])]
    pub model_types: Vec<String>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run one job and wait for it
    Run(RunArgs),
    /// List configured presets
    Presets {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Serve the HTTP interface
    Serve(ServeArgs),
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Input map image
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Preset model name
    #[arg(long, conflicts_with = "model")]
    pub preset: Option<String>,

    /// Custom .pth weight file (copied into the workspace)
    #[arg(long)]
    pub model: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_MODEL_TYPE)]
    pub model_type: String,

    /// Use --unseen true or --unseen false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub unseen: bool,

    /// Use --vectorization true or --vectorization false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub vectorization: bool,

    /// Additional arguments passed verbatim (shell-style quoting)
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub extra_args: String,

    /// Print JSON result
    #[arg(long)]
    pub json: bool,

    /// Run silently: suppress the streamed log (for cron usage)
    #[arg(long)]
    pub silent: bool,
}

impl RunArgs {
    pub fn to_request(&self) -> JobRequest {
        let model = match (&self.model, &self.preset) {
            (Some(file), _) => ModelChoice::Upload(Some(file.clone())),
            (None, Some(name)) => ModelChoice::Preset(name.clone()),
            (None, None) => ModelChoice::Preset(DEFAULT_PRESET.to_string()),
        };
        JobRequest {
            input_image: self.input.clone(),
            model,
            model_type: self.model_type.clone(),
            unseen: self.unseen,
            vectorization: self.vectorization,
            extra_args: self.extra_args.clone(),
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct ServeArgs {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 7860)]
    pub port: u16,
}

impl Cli {
    pub fn is_silent(&self) -> bool {
        matches!(&self.command, Command::Run(r) if r.silent)
    }
}

/// Build `JobSettings` from CLI arguments.
pub fn build_settings(args: &SettingsArgs) -> Result<JobSettings> {
    if args.retention != RetentionPolicy::Keep && args.output_dir.is_none() {
        let name = args
            .retention
            .to_possible_value()
            .map(|v| v.get_name().to_string())
            .unwrap_or_default();
        return Err(anyhow::anyhow!(
            "--retention {name} removes workspaces; set --output-dir so results are kept"
        ));
    }
    if args.model_types.is_empty() {
        return Err(anyhow::anyhow!("at least one --allowed-model-type is required"));
    }
    Ok(JobSettings {
        program: args.program.clone(),
        program_args: args.program_args.clone(),
        workspace_root: args
            .workspace_root
            .clone()
            .unwrap_or_else(default_workspace_root),
        live_window: args.live_lines,
        final_window: args.final_lines,
        timeout: args.timeout.map(Duration::from),
        idle_timeout: args.idle_timeout.map(Duration::from),
        retention: args.retention,
        workspace_ttl: Duration::from(args.workspace_ttl),
        output_dir: args.output_dir.clone(),
        model_types: args.model_types.clone(),
    })
}

/// Build the preset registry: stock preset, then the models dir, then explicit entries.
pub fn build_presets(args: &SettingsArgs) -> Result<PresetRegistry> {
    let mut reg = PresetRegistry::with_default(&args.app_root);
    if let Some(dir) = args.models_dir.as_deref() {
        let n = reg.load_dir(dir)?;
        tracing::debug!(dir = %dir.display(), count = n, "loaded presets from models dir");
    }
    for (name, path) in &args.add_presets {
        reg.insert(name.clone(), path.clone());
    }
    Ok(reg)
}

/// Run the selected command. Returns `false` when a job ended in failure.
pub async fn run(args: Cli) -> Result<bool> {
    let settings = build_settings(&args.settings)?;
    let presets = build_presets(&args.settings)?;

    match args.command {
        Command::Run(run_args) => {
            // Validate that --silent can only be used with --json
            if run_args.silent && !run_args.json {
                return Err(anyhow::anyhow!(
                    "--silent can only be used with --json. Use --silent --json together."
                ));
            }
            run_job(settings, presets, run_args).await
        }
        Command::Presets { json } => {
            print_presets(&settings, &presets, json)?;
            Ok(true)
        }
        Command::Serve(serve) => {
            crate::server::serve(settings, presets, &serve.host, serve.port).await?;
            Ok(true)
        }
    }
}

fn print_presets(settings: &JobSettings, presets: &PresetRegistry, json: bool) -> Result<()> {
    let list = presets.list();
    let mut out = std::io::stdout().lock();
    if json {
        let body = serde_json::json!({
            "presets": list,
            "model_types": settings.model_types,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&body)?)?;
        return Ok(());
    }
    for p in list {
        let status = if p.available { "ok" } else { "missing" };
        writeln!(out, "{}\t{}\t{status}", p.name, p.path.display())?;
    }
    Ok(())
}

fn state_label(state: JobState) -> &'static str {
    match state {
        JobState::Validating => "Validating",
        JobState::PreparingWorkspace => "Preparing workspace",
        JobState::BuildingCommand => "Building command",
        JobState::Running => "Running",
        JobState::CollectingResults => "Collecting results",
        JobState::Done { success: true } => "Done",
        JobState::Done { success: false } => "Failed",
    }
}

/// Run one job, streaming its log to stderr, and print the result to stdout.
async fn run_job(settings: JobSettings, presets: PresetRegistry, args: RunArgs) -> Result<bool> {
    sweep_workspaces(&settings).await;

    let silent = args.silent;
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let handle = start_job(
        Arc::new(settings),
        Arc::new(presets),
        args.to_request(),
        evt_tx,
    );
    tracing::debug!(job_id = handle.job_id(), "job submitted");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelled = false;

    loop {
        tokio::select! {
            ev = evt_rx.recv() => match ev {
                Some(JobEvent::State { state }) => {
                    if !silent {
                        let _ = out_tx.send(OutputLine::Stderr(format!("== {} ==", state_label(state))));
                    }
                }
                Some(JobEvent::Log { line, .. }) => {
                    if !silent {
                        let _ = out_tx.send(OutputLine::Stderr(line));
                    }
                }
                Some(JobEvent::Completed { .. }) => {}
                None => break,
            },
            _ = &mut ctrl_c, if !cancelled => {
                cancelled = true;
                let _ = out_tx.send(OutputLine::Stderr("Cancelling…".into()));
                handle.cancel();
            }
        }
    }

    let result = handle.join().await?;

    if args.json {
        let out = serde_json::to_string_pretty(&result).context("serialize job result")?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        let summary = crate::text_summary::build_text_summary(&result);
        for line in summary.lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(result.outcome.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("histmap-runner").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn run_defaults_match_form_defaults() {
        let cli = parse(&["run", "--input", "map.png"]);
        let Command::Run(run) = &cli.command else {
            panic!("expected run");
        };
        let req = run.to_request();
        assert_eq!(req.model, ModelChoice::Preset(DEFAULT_PRESET.into()));
        assert!(req.unseen && req.vectorization);
        assert_eq!(req.model_type, "unet");

        let settings = build_settings(&cli.settings).unwrap();
        assert_eq!(settings.program, PathBuf::from("python3"));
        assert_eq!(settings.program_args, ["-u", "inference/new_map_inference.py"]);
        assert_eq!(settings.live_window, 500);
        assert_eq!(settings.final_window, 2000);
        assert_eq!(settings.workspace_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn boolean_flags_take_values() {
        let cli = parse(&[
            "run",
            "--input",
            "m.png",
            "--unseen",
            "false",
            "--extra-args",
            "--title \"two words\"",
        ]);
        let Command::Run(run) = &cli.command else {
            panic!("expected run");
        };
        let req = run.to_request();
        assert!(!req.unseen);
        assert!(req.vectorization);
        assert_eq!(req.extra_args, "--title \"two words\"");
    }

    #[test]
    fn model_file_selects_upload() {
        let cli = parse(&["run", "--input", "m.png", "--model", "/w/custom.pth"]);
        let Command::Run(run) = &cli.command else {
            panic!("expected run");
        };
        assert_eq!(
            run.to_request().model,
            ModelChoice::Upload(Some(PathBuf::from("/w/custom.pth")))
        );
    }

    #[test]
    fn preset_and_model_conflict() {
        let res = Cli::try_parse_from([
            "histmap-runner",
            "run",
            "--preset",
            "a",
            "--model",
            "b.pth",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn deleting_retention_requires_output_dir() {
        let cli = parse(&["--retention", "keep-failed", "presets"]);
        assert!(build_settings(&cli.settings).is_err());

        let cli = parse(&["--retention", "delete", "--output-dir", "/tmp/out", "presets"]);
        let settings = build_settings(&cli.settings).unwrap();
        assert_eq!(settings.retention, RetentionPolicy::Delete);
    }

    #[test]
    fn timeouts_parse_human_durations() {
        let cli = parse(&["--timeout", "30m", "--idle-timeout", "90s", "presets"]);
        let settings = build_settings(&cli.settings).unwrap();
        assert_eq!(settings.timeout, Some(Duration::from_secs(1800)));
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn presets_combine_default_dir_and_explicit_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hist.pth"), b"w").unwrap();
        let models = dir.path().display().to_string();
        let cli = parse(&[
            "--app-root",
            "/opt/app",
            "--models-dir",
            &models,
            "--add-preset",
            "Custom=/w/c.pth",
            "presets",
        ]);
        let reg = build_presets(&cli.settings).unwrap();
        let names: Vec<String> = reg.list().into_iter().map(|p| p.name).collect();
        assert!(names.contains(&DEFAULT_PRESET.to_string()));
        assert!(names.contains(&"hist".to_string()));
        assert!(names.contains(&"Custom".to_string()));
        assert_eq!(
            reg.resolve(DEFAULT_PRESET).err().map(|e| e.to_string()),
            Some("Preset model not found: /opt/app/models/unet_best_weight.pth".into())
        );
    }

    #[test]
    fn silent_flag_is_detected() {
        let cli = parse(&["run", "--json", "--silent"]);
        assert!(cli.is_silent());
        let cli = parse(&["serve", "--port", "8080"]);
        assert!(!cli.is_silent());
        let Command::Serve(s) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(s.port, 8080);
    }
}
