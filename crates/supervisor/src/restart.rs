//! Restart supervision.
//!
//! A [`Restarter`] drives a [`Runner`] according to a [`Policy`], backing off
//! between launches so a crashing service can not spin in a tight loop.
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::runner::{ExitStatus, Runner};

/// Default run length after which the backoff starts over.
pub const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(60);

/// Whether a service is relaunched after it exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Policy {
    /// Always relaunch.
    Forever,
    /// Relaunch only after an abnormal exit.
    OnFailure,
    /// Never relaunch. Any failure is terminal.
    Never,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Forever => f.write_str("forever"),
            Policy::OnFailure => f.write_str("on-failure"),
            Policy::Never => f.write_str("never"),
        }
    }
}

/// Lifecycle notifications emitted by a [`Restarter`].
#[derive(Clone, Debug, PartialEq)]
pub enum RestartEvent {
    /// A launch is about to happen. Attempts count from 1.
    Launching {
        /// Launch attempt number.
        attempt: u32,
    },
    /// The service exited on its own.
    Exited {
        /// How it exited.
        status: ExitStatus,
    },
    /// The service could not be launched.
    LaunchFailed {
        /// Rendered error chain.
        error: String,
    },
    /// Waiting before the next launch.
    BackingOff {
        /// How long the wait is.
        delay: Duration,
    },
}

/// How supervision ended.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Stopped on request.
    Stopped,
    /// The service exited successfully and the policy does not relaunch it.
    Finished,
    /// The service failed and the policy does not relaunch it.
    Failed(String),
}

/// Relaunches a runner according to a restart policy.
pub struct Restarter<B = ExponentialBackoffStrategy> {
    runner: Box<dyn Runner>,
    policy: Policy,
    backoff: B,
    reset_after: Duration,
    events: Option<UnboundedSender<RestartEvent>>,
}

impl Restarter<ExponentialBackoffStrategy> {
    /// Creates a restarter with the default backoff.
    pub fn new(runner: Box<dyn Runner>, policy: Policy) -> Self {
        Restarter::with_backoff(runner, policy, ExponentialBackoffStrategy::default())
    }
}

impl<B: BackoffStrategy> Restarter<B> {
    /// Creates a restarter with a custom backoff.
    pub fn with_backoff(runner: Box<dyn Runner>, policy: Policy, backoff: B) -> Self {
        Restarter {
            runner,
            policy,
            backoff,
            reset_after: DEFAULT_RESET_AFTER,
            events: None,
        }
    }

    /// A run lasting at least `reset_after` resets the backoff.
    pub fn reset_after(mut self, reset_after: Duration) -> Self {
        self.reset_after = reset_after;
        self
    }

    /// Sends lifecycle events to `events`.
    pub fn events(mut self, events: UnboundedSender<RestartEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: RestartEvent) {
        if let Some(events) = &self.events {
            // The receiver going away only means nobody is watching anymore.
            let _ = events.send(event);
        }
    }

    /// Supervises the runner until the policy says stop or `stop` is
    /// cancelled. Cancelling `stop` terminates a running service and
    /// suppresses any further launch.
    pub async fn run(&mut self, stop: CancellationToken) -> Outcome {
        let mut attempt = 0u32;
        loop {
            if stop.is_cancelled() {
                return Outcome::Stopped;
            }
            attempt += 1;
            self.emit(RestartEvent::Launching { attempt });
            let started = Instant::now();
            let result = self.runner.run(stop.clone()).await;
            let ran_for = started.elapsed();

            match result {
                Ok(ExitStatus::Stopped) => return Outcome::Stopped,
                Ok(status) => {
                    self.emit(RestartEvent::Exited { status });
                    if stop.is_cancelled() {
                        return Outcome::Stopped;
                    }
                    match (self.policy, status.is_success()) {
                        (Policy::Never, false) => {
                            error!(%status, "Service failed and will not be restarted");
                            return Outcome::Failed(status.to_string());
                        }
                        (Policy::Never, true) | (Policy::OnFailure, true) => {
                            info!(%status, policy = %self.policy, "Service finished");
                            return Outcome::Finished;
                        }
                        _ => warn!(%status, attempt, "Service exited"),
                    }
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    error!(error = %message, attempt, "Service failed to launch");
                    self.emit(RestartEvent::LaunchFailed {
                        error: message.clone(),
                    });
                    if self.policy == Policy::Never {
                        return Outcome::Failed(message);
                    }
                }
            }

            if ran_for >= self.reset_after {
                self.backoff.reset();
            }
            let delay = self.backoff.next_duration();
            self.emit(RestartEvent::BackingOff { delay });
            info!(?delay, "Restarting service after backoff");
            tokio::select! {
                _ = stop.cancelled() => return Outcome::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
