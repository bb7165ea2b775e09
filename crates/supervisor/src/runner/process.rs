use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ExitStatus, Runner};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Runs a program as a child process.
///
/// Stopping sends `SIGTERM` and escalates to `SIGKILL` once the grace period
/// has passed.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    grace_period: Duration,
    log_path: Option<PathBuf>,
}

impl ProcessRunner {
    /// Creates a runner for `program`.
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        ProcessRunner {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            log_path: None,
        }
    }

    /// Appends arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds environment variables.
    pub fn envs<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(env.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets how long a stopped process gets to exit before it is killed.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Appends stdout and stderr of the process to `path`.
    pub fn log_to<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// The program this runner launches.
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> anyhow::Result<Command> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(path) = &self.log_path {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            }
            let log = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let err = log.try_clone()?;
            command.stdout(log).stderr(err);
        }
        Ok(command)
    }

    /// Spawns the process without supervising it.
    pub(super) fn spawn(&self) -> anyhow::Result<Child> {
        let child = self
            .command()?
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;
        info!(program = %self.program.display(), pid = ?child.id(), "Process started");
        Ok(child)
    }

    async fn terminate(&self, child: &mut Child) -> anyhow::Result<()> {
        let pid = match child.id() {
            Some(pid) => pid,
            None => return Ok(()),
        };
        send_sigterm(pid);
        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                warn!(pid, grace_period = ?self.grace_period, "Process ignored SIGTERM, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Sends `SIGTERM` to `pid`. A process that already exited is not an error.
pub(super) fn send_sigterm(pid: u32) {
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "Failed to send SIGTERM"),
    }
}

#[async_trait::async_trait]
impl Runner for ProcessRunner {
    async fn run(&mut self, stop: CancellationToken) -> anyhow::Result<ExitStatus> {
        if stop.is_cancelled() {
            return Ok(ExitStatus::Stopped);
        }
        let mut child = self.spawn()?;

        tokio::select! {
            status = child.wait() => {
                let status = ExitStatus::from(status?);
                debug!(program = %self.program.display(), %status, "Process exited");
                Ok(status)
            }
            _ = stop.cancelled() => {
                self.terminate(&mut child).await?;
                info!(program = %self.program.display(), "Process stopped");
                Ok(ExitStatus::Stopped)
            }
        }
    }
}
