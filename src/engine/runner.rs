use crate::engine::command::CommandSpec;
use crate::engine::EngineControl;
use crate::error::{LaunchError, TimeoutKind};
use crate::model::ExitReport;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// How long to keep forwarding buffered output after a kill.
const KILL_DRAIN: Duration = Duration::from_millis(250);
/// Upper bound for reaping a killed child.
const KILL_REAP: Duration = Duration::from_secs(5);

/// Time limits enforced while a child runs.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RunLimits {
    /// Total wall-clock budget.
    pub wall: Option<Duration>,
    /// Longest allowed gap between two output lines.
    pub idle: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// Output ended and the child exited on its own.
    Exited(ExitReport),
    TimedOut {
        kind: TimeoutKind,
        limit: Duration,
        exit: Option<ExitReport>,
    },
    Cancelled {
        exit: Option<ExitReport>,
    },
}

enum Stop {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut(TimeoutKind, Duration),
    Cancelled,
}

/// A launched child whose stdout and stderr are merged into one line stream.
pub(crate) struct RunningProcess {
    child: Child,
    pid: Option<u32>,
    lines: mpsc::UnboundedReceiver<String>,
}

/// Launch `cmd` inside `cwd`.
///
/// On unix the child leads a new process group so the whole tree can be
/// killed at once, and stdout and stderr share one pipe so lines arrive in
/// the order the child wrote them.
pub(crate) fn spawn(cmd: &CommandSpec, cwd: &Path) -> Result<RunningProcess, LaunchError> {
    let launch_err = |e| LaunchError::from_io(PathBuf::from(cmd.program()), e);
    let mut command = Command::new(cmd.program());
    command
        .args(cmd.args())
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let (tx, lines) = mpsc::unbounded_channel();

    #[cfg(unix)]
    let child = {
        command.process_group(0);
        let (reader, writer) = merged_output_pipe().map_err(|e| LaunchError::Io {
            program: PathBuf::from(cmd.program()),
            source: e,
        })?;
        let stderr_end = writer.try_clone().map_err(|e| LaunchError::Io {
            program: PathBuf::from(cmd.program()),
            source: e,
        })?;
        command
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr_end));
        let child = command.spawn().map_err(launch_err)?;
        // Close the parent's write ends so EOF arrives when the child side closes.
        drop(command);
        tokio::spawn(forward_lines(reader, tx));
        child
    };

    #[cfg(not(unix))]
    let child = {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn().map_err(launch_err)?;
        if let Some(out) = child.stdout.take() {
            tokio::spawn(forward_lines(out, tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward_lines(err, tx));
        }
        child
    };

    let pid = child.id();
    tracing::info!(pid = ?pid, program = cmd.program(), cwd = %cwd.display(), "process started");
    Ok(RunningProcess { child, pid, lines })
}

/// One close-on-exec pipe: an async read end and a write end for the child.
#[cfg(unix)]
fn merged_output_pipe() -> std::io::Result<(tokio::net::unix::pipe::Receiver, std::os::fd::OwnedFd)> {
    use nix::fcntl::OFlag;

    let (read_fd, write_fd) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
    let reader = tokio::net::unix::pipe::Receiver::from_owned_fd(read_fd)?;
    Ok((reader, write_fd))
}

/// Splits a byte stream into lines ending at `\n`, `\r` or `\r\n`.
///
/// Carriage returns end a line so progress bars that redraw in place stream
/// one line per update.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    buf: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &b in chunk {
            match b {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\n' | b'\r' => {
                    self.after_cr = b == b'\r';
                    out.push(self.take());
                }
                _ => {
                    self.after_cr = false;
                    self.buf.push(b);
                }
            }
        }
        out
    }

    /// Trailing text without a line end, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).trim_end().to_string();
        self.buf.clear();
        line
    }
}

async fn forward_lines<R>(mut pipe: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::default();
    let mut chunk = vec![0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.feed(&chunk[..n]) {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
    if let Some(rest) = splitter.finish() {
        let _ = tx.send(rest);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => futures::future::pending().await,
    }
}

impl RunningProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Forward every output line to `on_line` until the child ends, a limit
    /// fires, or the collaborator cancels.
    ///
    /// A closed control channel counts as cancellation.
    pub async fn supervise<F>(
        mut self,
        limits: RunLimits,
        control_rx: &mut mpsc::UnboundedReceiver<EngineControl>,
        mut on_line: F,
    ) -> RunOutcome
    where
        F: FnMut(String),
    {
        let started = Instant::now();
        let wall_deadline = limits.wall.map(|d| started + d);
        let mut last_output = started;
        let mut lines_open = true;

        let stop = loop {
            let idle_deadline = limits.idle.map(|d| last_output + d);
            tokio::select! {
                line = self.lines.recv(), if lines_open => match line {
                    Some(line) => {
                        last_output = Instant::now();
                        on_line(line);
                    }
                    None => lines_open = false,
                },
                // Reap only after both pipes hit EOF so no output is lost.
                status = self.child.wait(), if !lines_open => break Stop::Exited(status),
                ctrl = control_rx.recv() => match ctrl {
                    Some(EngineControl::Cancel) | None => break Stop::Cancelled,
                },
                _ = sleep_until_opt(wall_deadline) => {
                    break Stop::TimedOut(TimeoutKind::Wall, limits.wall.unwrap_or_default());
                }
                _ = sleep_until_opt(idle_deadline), if lines_open => {
                    break Stop::TimedOut(TimeoutKind::Idle, limits.idle.unwrap_or_default());
                }
            }
        };

        match stop {
            Stop::Exited(status) => {
                let exit = match status {
                    Ok(status) => ExitReport::from_status(status),
                    Err(e) => {
                        tracing::warn!(pid = ?self.pid, error = %e, "failed to reap child");
                        ExitReport { code: None, signal: None }
                    }
                };
                tracing::info!(pid = ?self.pid, exit = %exit.describe(), "process exited");
                RunOutcome::Exited(exit)
            }
            Stop::TimedOut(kind, limit) => {
                tracing::warn!(pid = ?self.pid, %kind, ?limit, "process timed out, killing");
                let exit = self.terminate(&mut on_line).await;
                RunOutcome::TimedOut { kind, limit, exit }
            }
            Stop::Cancelled => {
                tracing::info!(pid = ?self.pid, "process cancelled, killing");
                let exit = self.terminate(&mut on_line).await;
                RunOutcome::Cancelled { exit }
            }
        }
    }

    /// Kill the process tree, reap the leader and flush what is left in the pipes.
    async fn terminate<F>(&mut self, on_line: &mut F) -> Option<ExitReport>
    where
        F: FnMut(String),
    {
        self.kill_tree();
        let exit = match tokio::time::timeout(KILL_REAP, self.child.wait()).await {
            Ok(Ok(status)) => Some(ExitReport::from_status(status)),
            Ok(Err(e)) => {
                tracing::warn!(pid = ?self.pid, error = %e, "failed to reap killed child");
                None
            }
            Err(_) => {
                tracing::warn!(pid = ?self.pid, "killed child did not exit in time");
                None
            }
        };
        let drain_deadline = Instant::now() + KILL_DRAIN;
        while let Ok(Some(line)) =
            tokio::time::timeout_at(drain_deadline, self.lines.recv()).await
        {
            on_line(line);
        }
        exit
    }

    fn kill_tree(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::debug!(pid, error = %e, "killpg failed, killing leader only")
                    }
                }
            }
        }
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(pid = ?self.pid, error = %e, "kill failed");
        }
    }
}
