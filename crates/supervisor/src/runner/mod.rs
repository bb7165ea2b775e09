//! Runners launch one instance of a service and wait for it to exit.
//!
//! A runner is restartable: [`Runner::run`] may be called again after it
//! returns, which is how [`crate::restart::Restarter`] relaunches a service.
use std::fmt;

use tokio_util::sync::CancellationToken;

mod oci;
mod process;

pub use oci::OciRunner;
pub use process::ProcessRunner;

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// The process exited with status zero.
    Success,
    /// The process exited abnormally. `code` is `None` if it was killed by a
    /// signal.
    Failure {
        /// Exit code, if any.
        code: Option<i32>,
    },
    /// The process was stopped on request.
    Stopped,
}

impl ExitStatus {
    /// Returns true for a zero exit.
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if status.success() {
            ExitStatus::Success
        } else {
            ExitStatus::Failure {
                code: status.code(),
            }
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Success => f.write_str("exited successfully"),
            ExitStatus::Failure { code: Some(code) } => write!(f, "exited with code {}", code),
            ExitStatus::Failure { code: None } => f.write_str("killed by signal"),
            ExitStatus::Stopped => f.write_str("stopped"),
        }
    }
}

/// Launches a service and waits for it.
#[async_trait::async_trait]
pub trait Runner: Send {
    /// Runs the service until it exits or `stop` is cancelled.
    ///
    /// On cancellation the service must be terminated before returning
    /// [`ExitStatus::Stopped`]. An `Err` means the service could not be
    /// launched at all.
    async fn run(&mut self, stop: CancellationToken) -> anyhow::Result<ExitStatus>;
}
