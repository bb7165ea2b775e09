//! Health checking.
//!
//! A [`HealthChecker`] probes a service on an interval and publishes
//! [`HealthStatus`] transitions over a `watch` channel. It runs as its own
//! task and never blocks the caller.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Probe timing and thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Wait before the first probe.
    pub initial_delay: Duration,
    /// Time between probes.
    pub period: Duration,
    /// A probe taking longer than this fails.
    pub timeout: Duration,
    /// Consecutive failures that make a service unhealthy.
    pub failure_threshold: u32,
    /// Consecutive successes that make a service healthy.
    pub success_threshold: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            initial_delay: Duration::from_secs(1),
            period: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
            failure_threshold: 1,
            success_threshold: 1,
        }
    }
}

/// Health of a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Not probed yet.
    Unknown,
    /// Passing probes.
    Healthy,
    /// Failing probes.
    Unhealthy,
}

/// Latest published health.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Current state.
    pub state: HealthState,
    /// Message of the probe that caused the last transition.
    pub last_message: String,
    /// When the last transition happened.
    pub last_change: Option<DateTime<Utc>>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus {
            state: HealthState::Unknown,
            last_message: String::new(),
            last_change: None,
        }
    }
}

/// A single probe.
#[async_trait::async_trait]
pub trait Check: Send + Sync {
    /// Probes once. `Ok` means healthy.
    async fn check(&self) -> anyhow::Result<()>;
}

/// Probes an HTTP endpoint; only a 200 response is healthy.
pub struct HttpCheck {
    client: reqwest::Client,
    url: url::Url,
}

impl HttpCheck {
    /// Creates a check for `url`.
    pub fn new(url: url::Url) -> Self {
        HttpCheck {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait::async_trait]
impl Check for HttpCheck {
    async fn check(&self) -> anyhow::Result<()> {
        let response = self.client.get(self.url.clone()).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            anyhow::bail!("{} returned {}", self.url, response.status());
        }
        Ok(())
    }
}

/// Periodically runs a [`Check`].
pub struct HealthChecker {
    check: Arc<dyn Check>,
    settings: Settings,
    status: watch::Sender<HealthStatus>,
}

impl HealthChecker {
    /// Creates a checker and the receiver its transitions are published on.
    pub fn new(check: Arc<dyn Check>, settings: Settings) -> (Self, watch::Receiver<HealthStatus>) {
        let (status, receiver) = watch::channel(HealthStatus::default());
        (
            HealthChecker {
                check,
                settings,
                status,
            },
            receiver,
        )
    }

    /// Probes until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(self.settings.initial_delay) => {}
        }

        let mut interval = tokio::time::interval(self.settings.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = HealthState::Unknown;
        let mut streak = Streak::default();

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }

            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = tokio::time::timeout(self.settings.timeout, self.check.check()) => result,
            };
            let (next, message) = match result {
                Ok(Ok(())) => {
                    streak.success();
                    let next = if streak.successes >= self.settings.success_threshold {
                        HealthState::Healthy
                    } else {
                        state
                    };
                    (next, String::new())
                }
                Ok(Err(e)) => {
                    streak.failure();
                    debug!(error = %e, failures = streak.failures, "Health probe failed");
                    let next = if streak.failures >= self.settings.failure_threshold {
                        HealthState::Unhealthy
                    } else {
                        state
                    };
                    (next, format!("{:#}", e))
                }
                Err(_) => {
                    streak.failure();
                    debug!(failures = streak.failures, "Health probe timed out");
                    let next = if streak.failures >= self.settings.failure_threshold {
                        HealthState::Unhealthy
                    } else {
                        state
                    };
                    (next, format!("probe timed out after {:?}", self.settings.timeout))
                }
            };

            if next != state {
                match next {
                    HealthState::Unhealthy => warn!(message = %message, "Service became unhealthy"),
                    _ => info!(state = ?next, "Service health changed"),
                }
                state = next;
                self.status.send_replace(HealthStatus {
                    state,
                    last_message: message,
                    last_change: Some(Utc::now()),
                });
            }
        }
    }
}

/// Consecutive probe outcomes. A success clears the failures and the other
/// way around.
#[derive(Debug, Default)]
struct Streak {
    successes: u32,
    failures: u32,
}

impl Streak {
    fn success(&mut self) {
        self.successes = self.successes.saturating_add(1);
        self.failures = 0;
    }

    fn failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.successes = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted probe results, then keeps returning the last one.
    struct Scripted(Mutex<(VecDeque<bool>, bool)>);

    impl Scripted {
        fn new(script: Vec<bool>) -> Arc<dyn Check> {
            let last = *script.last().unwrap();
            Arc::new(Scripted(Mutex::new((script.into(), last))))
        }
    }

    #[async_trait::async_trait]
    impl Check for Scripted {
        async fn check(&self) -> anyhow::Result<()> {
            let ok = {
                let mut guard = self.0.lock().unwrap();
                let last = guard.1;
                guard.0.pop_front().unwrap_or(last)
            };
            if ok {
                Ok(())
            } else {
                Err(anyhow::anyhow!("probe failed"))
            }
        }
    }

    struct Hangs;

    #[async_trait::async_trait]
    impl Check for Hangs {
        async fn check(&self) -> anyhow::Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn settings(failure_threshold: u32) -> Settings {
        Settings {
            initial_delay: Duration::from_secs(2),
            period: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
            failure_threshold,
            success_threshold: 1,
        }
    }

    #[test]
    fn streak_saturates_and_resets() {
        let mut streak = Streak {
            successes: u32::MAX,
            failures: 0,
        };
        streak.success();
        assert_eq!(streak.successes, u32::MAX);

        streak.failure();
        assert_eq!(streak.successes, 0);
        assert_eq!(streak.failures, 1);

        streak.failures = u32::MAX;
        streak.failure();
        assert_eq!(streak.failures, u32::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_only_after_initial_delay() {
        let (checker, status) = HealthChecker::new(Scripted::new(vec![true]), settings(1));
        let token = CancellationToken::new();
        tokio::spawn(checker.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(status.borrow().state, HealthState::Unknown);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(status.borrow().state, HealthState::Healthy);
        assert!(status.borrow().last_change.is_some());
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_only_after_failure_threshold() {
        let script = vec![true, false, false, false, true];
        let (checker, status) = HealthChecker::new(Scripted::new(script), settings(3));
        let token = CancellationToken::new();
        tokio::spawn(checker.run(token.clone()));

        // Probes run at 2s, 3s, 4s, 5s and 6s.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(status.borrow().state, HealthState::Healthy);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(status.borrow().state, HealthState::Healthy);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(status.borrow().state, HealthState::Unhealthy);
        assert_eq!(status.borrow().last_message, "probe failed");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(status.borrow().state, HealthState::Healthy);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_counts_as_failure() {
        let (checker, status) = HealthChecker::new(Arc::new(Hangs), settings(1));
        let token = CancellationToken::new();
        tokio::spawn(checker.run(token.clone()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(status.borrow().state, HealthState::Unhealthy);
        assert!(status.borrow().last_message.contains("timed out"));
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_checker() {
        let (checker, _status) = HealthChecker::new(Arc::new(Hangs), settings(1));
        let token = CancellationToken::new();
        let handle = tokio::spawn(checker.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(2200)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_millis(10), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn http_check_requires_200() {
        use warp::Filter;

        let ok = warp::path("healthz").map(|| "ok");
        let (ok_addr, server) = warp::serve(ok).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        let failing = warp::path("healthz").map(|| {
            warp::reply::with_status("down", warp::http::StatusCode::INTERNAL_SERVER_ERROR)
        });
        let (failing_addr, server) = warp::serve(failing).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let url = |addr: std::net::SocketAddr| {
            url::Url::parse(&format!("http://{}/healthz", addr)).unwrap()
        };
        assert!(HttpCheck::new(url(ok_addr)).check().await.is_ok());
        let err = HttpCheck::new(url(failing_addr)).check().await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn http_check_fails_on_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = url::Url::parse(&format!("http://{}/healthz", addr)).unwrap();
        assert!(HttpCheck::new(url).check().await.is_err());
    }
}
