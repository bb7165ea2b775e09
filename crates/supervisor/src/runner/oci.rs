use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::process::send_sigterm;
use super::{ExitStatus, ProcessRunner, Runner};
use crate::container::ContainerSpec;
use crate::files;

/// How long the runtime process gets to exit after the container was killed.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs a container spec through an OCI runtime binary (`runc`, `crun`).
///
/// Each run writes `<bundle>/config.json`, removes any container left over
/// under the same ID, and then executes `<runtime> run --bundle <bundle> <id>`
/// in the foreground.
///
/// Stopping sends `SIGTERM` to the runtime, which forwards it to the
/// container. Once the grace period has passed the container is killed through
/// `<runtime> kill <id> KILL`. A stopped container is always removed with
/// `<runtime> delete --force <id>`.
pub struct OciRunner {
    id: String,
    spec: ContainerSpec,
    bundle: PathBuf,
    runtime: PathBuf,
    grace_period: Duration,
    log_path: Option<PathBuf>,
}

impl OciRunner {
    /// Creates a runner for container `id`.
    pub fn new<I, B, R>(id: I, spec: ContainerSpec, bundle: B, runtime: R) -> Self
    where
        I: Into<String>,
        B: Into<PathBuf>,
        R: Into<PathBuf>,
    {
        OciRunner {
            id: id.into(),
            spec,
            bundle: bundle.into(),
            runtime: runtime.into(),
            grace_period: Duration::from_secs(10),
            log_path: None,
        }
    }

    /// Sets how long a stopped container gets to exit before it is killed.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Appends the container output to `path`.
    pub fn log_to<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// The spec this runner launches.
    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    fn write_bundle(&self) -> anyhow::Result<()> {
        files::ensure_dir(&self.bundle, 0o700)?;
        let config = serde_json::to_vec_pretty(&self.spec)?;
        files::write_atomic(self.bundle.join("config.json"), &config, 0o600)
    }

    /// Runs `<runtime> <args>` to completion and reports whether it succeeded.
    async fn runtime_command(&self, args: &[&str]) -> bool {
        let output = tokio::process::Command::new(&self.runtime)
            .args(args)
            .output()
            .await;
        match output {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!(id = %self.id, ?args, error = %e, "Could not run container runtime");
                false
            }
        }
    }

    async fn delete_stale(&self) {
        if self.runtime_command(&["delete", "--force", self.id.as_str()]).await {
            debug!(id = %self.id, "Removed stale container")
        }
    }

    async fn stop_container(&self, child: &mut Child) -> anyhow::Result<()> {
        if let Some(pid) = child.id() {
            send_sigterm(pid);
        }
        if tokio::time::timeout(self.grace_period, child.wait())
            .await
            .is_err()
        {
            warn!(id = %self.id, grace_period = ?self.grace_period, "Container ignored SIGTERM, killing");
            if !self.runtime_command(&["kill", self.id.as_str(), "KILL"]).await {
                warn!(id = %self.id, "Container runtime failed to kill container");
            }
            if tokio::time::timeout(KILL_TIMEOUT, child.wait()).await.is_err() {
                child.kill().await?;
            }
        }
        if !self.runtime_command(&["delete", "--force", self.id.as_str()]).await {
            warn!(id = %self.id, "Container runtime failed to delete container");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Runner for OciRunner {
    #[instrument(level = "info", skip(self, stop), fields(id = %self.id))]
    async fn run(&mut self, stop: CancellationToken) -> anyhow::Result<ExitStatus> {
        self.write_bundle()
            .with_context(|| format!("failed to write bundle for {}", self.id))?;
        self.delete_stale().await;
        if stop.is_cancelled() {
            return Ok(ExitStatus::Stopped);
        }

        let bundle = self.bundle.to_string_lossy().into_owned();
        let mut process = ProcessRunner::new(&self.runtime)
            .args(vec!["run", "--bundle", bundle.as_str(), self.id.as_str()]);
        if let Some(path) = &self.log_path {
            process = process.log_to(path);
        }
        let mut child = process.spawn()?;

        tokio::select! {
            status = child.wait() => {
                let status = ExitStatus::from(status?);
                debug!(id = %self.id, %status, "Container exited");
                Ok(status)
            }
            _ = stop.cancelled() => {
                self.stop_container(&mut child).await?;
                info!(id = %self.id, "Container stopped");
                Ok(ExitStatus::Stopped)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::container::SpecBuilder;
    use std::os::unix::fs::PermissionsExt;

    fn fake_runtime(dir: &std::path::Path, script: &str) -> PathBuf {
        let path = dir.join("runtime");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn writes_bundle_and_invokes_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("invocations");
        let runtime = fake_runtime(
            dir.path(),
            &format!("echo \"$@\" >> {}", record.display()),
        );
        let bundle = dir.path().join("bundles/kubelet");
        let spec = SpecBuilder::new(vec!["/usr/local/bin/kubelet"]).build().unwrap();
        let mut runner = OciRunner::new("kubelet", spec.clone(), &bundle, runtime);

        let status = runner.run(CancellationToken::new()).await.unwrap();
        assert!(status.is_success());

        let written: ContainerSpec =
            serde_json::from_slice(&std::fs::read(bundle.join("config.json")).unwrap()).unwrap();
        assert_eq!(written, spec);
        let mode = std::fs::metadata(bundle.join("config.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        let invocations = std::fs::read_to_string(&record).unwrap();
        let lines: Vec<&str> = invocations.lines().collect();
        assert_eq!(lines[0], "delete --force kubelet");
        assert_eq!(
            lines[1],
            format!("run --bundle {} kubelet", bundle.display())
        );
    }

    #[tokio::test]
    async fn runtime_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_runtime(dir.path(), "[ \"$1\" = run ] && exit 7; exit 0");
        let spec = SpecBuilder::new(vec!["/bin/true"]).build().unwrap();
        let mut runner = OciRunner::new("svc", spec, dir.path().join("bundle"), runtime);
        let status = runner.run(CancellationToken::new()).await.unwrap();
        assert_eq!(status, ExitStatus::Failure { code: Some(7) });
    }

    fn recording_runtime(dir: &std::path::Path, run: &str) -> (PathBuf, PathBuf) {
        let record = dir.join("invocations");
        let pid = dir.join("pid");
        let runtime = fake_runtime(
            dir,
            &format!(
                "echo \"$@\" >> {record}\n\
                 case \"$1\" in\n\
                 run) echo $$ > {pid}; {run} ;;\n\
                 kill) kill -9 \"$(cat {pid})\" ;;\n\
                 esac",
                record = record.display(),
                pid = pid.display(),
                run = run,
            ),
        );
        (runtime, record)
    }

    async fn stop_after(runner: &mut OciRunner, after: Duration) -> ExitStatus {
        let stop = CancellationToken::new();
        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            canceller.cancel();
        });
        tokio::time::timeout(Duration::from_secs(10), runner.run(stop))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn container_ignoring_sigterm_is_killed_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, record) = recording_runtime(dir.path(), "trap '' TERM; exec sleep 30");
        let spec = SpecBuilder::new(vec!["/bin/true"]).build().unwrap();
        let mut runner = OciRunner::new("svc", spec, dir.path().join("bundle"), runtime)
            .grace_period(Duration::from_millis(200));

        let status = stop_after(&mut runner, Duration::from_millis(300)).await;
        assert_eq!(status, ExitStatus::Stopped);

        let invocations = std::fs::read_to_string(&record).unwrap();
        let lines: Vec<&str> = invocations.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "delete --force svc");
        assert!(lines[1].starts_with("run --bundle"));
        assert_eq!(lines[2], "kill svc KILL");
        assert_eq!(lines[3], "delete --force svc");
    }

    #[tokio::test]
    async fn container_exiting_on_sigterm_is_only_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, record) = recording_runtime(dir.path(), "exec sleep 30");
        let spec = SpecBuilder::new(vec!["/bin/true"]).build().unwrap();
        let mut runner = OciRunner::new("svc", spec, dir.path().join("bundle"), runtime)
            .grace_period(Duration::from_secs(5));

        let status = stop_after(&mut runner, Duration::from_millis(300)).await;
        assert_eq!(status, ExitStatus::Stopped);

        let invocations = std::fs::read_to_string(&record).unwrap();
        let lines: Vec<&str> = invocations.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("run --bundle"));
        assert_eq!(lines[2], "delete --force svc");
    }
}
