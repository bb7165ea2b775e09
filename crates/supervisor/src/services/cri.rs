use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::health::Check;
use crate::runner::{ProcessRunner, Runner};
use crate::service::{Machine, Service};

const ID: &str = "cri";

/// The container runtime the kubelet talks to.
///
/// Runs directly on the host and is healthy once its socket accepts
/// connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct Cri;

#[async_trait::async_trait]
impl Service for Cri {
    fn id(&self) -> &str {
        ID
    }

    async fn pre_func(&self, machine: &Machine) -> anyhow::Result<()> {
        let constants = &machine.constants;
        for dir in [&constants.cri_root_dir, &constants.cri_state_dir, &constants.log_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        if let Some(parent) = constants.cri_socket.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        // A socket left over from a previous run makes the runtime refuse to start.
        match tokio::fs::remove_file(&constants.cri_socket).await {
            Ok(()) => debug!(socket = %constants.cri_socket.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to remove {}", constants.cri_socket.display())
                })
            }
        }
        Ok(())
    }

    async fn runner(&self, machine: &Machine) -> anyhow::Result<Box<dyn Runner>> {
        let constants = &machine.constants;
        Ok(Box::new(
            ProcessRunner::new(&constants.cri_binary)
                .args(vec![
                    "--address".to_string(),
                    constants.cri_socket.display().to_string(),
                    "--state".to_string(),
                    constants.cri_state_dir.display().to_string(),
                    "--root".to_string(),
                    constants.cri_root_dir.display().to_string(),
                ])
                .envs(machine.config.machine.env.clone())
                .log_to(constants.log_dir.join("cri.log")),
        ))
    }

    fn health_check(&self, machine: &Machine) -> Option<Arc<dyn Check>> {
        Some(Arc::new(SocketCheck::new(&machine.constants.cri_socket)))
    }
}

/// Healthy when a Unix socket accepts connections.
#[derive(Clone, Debug)]
pub struct SocketCheck {
    path: PathBuf,
}

impl SocketCheck {
    /// Creates a check for the socket at `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        SocketCheck { path: path.into() }
    }
}

#[async_trait::async_trait]
impl Check for SocketCheck {
    async fn check(&self) -> anyhow::Result<()> {
        tokio::net::UnixStream::connect(&self.path)
            .await
            .with_context(|| format!("failed to connect to {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::services::test::machine;

    #[tokio::test]
    async fn socket_check_needs_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cri.sock");
        let check = SocketCheck::new(&path);
        assert!(check.check().await.is_err());

        let _listener = tokio::net::UnixListener::bind(&path).unwrap();
        assert!(check.check().await.is_ok());
    }

    #[tokio::test]
    async fn pre_func_removes_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path(), vec![]);
        let socket = &machine.constants.cri_socket;
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        std::fs::write(socket, b"").unwrap();

        Cri.pre_func(&machine).await.unwrap();
        assert!(!socket.exists());
        assert!(machine.constants.cri_root_dir.is_dir());

        // Nothing to remove the second time around.
        Cri.pre_func(&machine).await.unwrap();
    }

    #[tokio::test]
    async fn runner_is_built_from_constants() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path(), vec![]);
        assert!(Cri.runner(&machine).await.is_ok());
        assert!(Cri.health_check(&machine).is_some());
        assert!(!Cri.api_restart_allowed(&machine));
        assert!(Cri.depends_on().is_empty());
    }
}
