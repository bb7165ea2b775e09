//! The orchestrator.
//!
//! [`System`] collects service registrations, validates their dependencies and
//! starts one lifecycle task per service. Each task walks its service through
//! dependency and condition waits, setup, supervised running and health
//! checking, and publishes [`ServiceStatus`] updates over a `watch` channel.
//! Dependents read those channels to decide when they may start.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn};
use tracing_futures::Instrument;

use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::health::{HealthChecker, HealthState, HealthStatus};
use crate::restart::{Outcome, Policy, RestartEvent, Restarter};
use crate::service::{Machine, Service, ServiceEvent, ServiceState, ServiceStatus};

const EVENT_CAPACITY: usize = 256;

/// Orchestrator errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SystemError {
    /// Two services share an ID.
    #[error("service {id} is already registered")]
    DuplicateService {
        /// The duplicated ID.
        id: String,
    },
    /// A service depends on a service nobody registered.
    #[error("service {service} depends on unknown service {dependency}")]
    UnknownDependency {
        /// The dependent service.
        service: String,
        /// The missing dependency.
        dependency: String,
    },
    /// Services depend on each other in a loop.
    #[error("dependency cycle between services: {}", services.join(", "))]
    DependencyCycle {
        /// Services that could not be ordered.
        services: Vec<String>,
    },
    /// No service has the ID.
    #[error("unknown service {id}")]
    UnknownService {
        /// The requested ID.
        id: String,
    },
    /// The service refuses API restarts.
    #[error("service {id} does not allow API restarts")]
    RestartNotAllowed {
        /// The requested ID.
        id: String,
    },
}

/// Services registered with the orchestrator, not yet started.
pub struct System {
    machine: Arc<Machine>,
    services: Vec<Arc<dyn Service>>,
}

impl System {
    /// Creates an orchestrator for `machine`.
    pub fn new(machine: Arc<Machine>) -> Self {
        System {
            machine,
            services: Vec::new(),
        }
    }

    /// Registers a service. IDs must be unique.
    pub fn register(&mut self, service: Arc<dyn Service>) -> Result<(), SystemError> {
        if self.services.iter().any(|s| s.id() == service.id()) {
            return Err(SystemError::DuplicateService {
                id: service.id().to_string(),
            });
        }
        debug!(service = %service.id(), "Registered service");
        self.services.push(service);
        Ok(())
    }

    /// Orders services so that every service comes after its dependencies.
    /// Services with no ordering constraint between them keep registration
    /// order.
    pub fn start_order(&self) -> Result<Vec<String>, SystemError> {
        let ids: HashSet<&str> = self.services.iter().map(|s| s.id()).collect();
        let mut remaining: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<&str>> = HashMap::new();

        for service in self.services.iter() {
            let depends_on = service.depends_on();
            for dependency in depends_on.iter() {
                if !ids.contains(dependency.as_str()) {
                    return Err(SystemError::UnknownDependency {
                        service: service.id().to_string(),
                        dependency: dependency.clone(),
                    });
                }
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(service.id());
            }
            let unique: HashSet<&String> = depends_on.iter().collect();
            remaining.insert(service.id(), unique.len());
        }

        let mut order = Vec::with_capacity(self.services.len());
        let mut placed: HashSet<&str> = HashSet::new();
        // Always pick the earliest registered service that is free to start.
        while let Some(id) = self
            .services
            .iter()
            .map(|s| s.id())
            .find(|id| !placed.contains(id) && remaining.get(id) == Some(&0))
        {
            placed.insert(id);
            order.push(id.to_string());
            let mut released = HashSet::new();
            for dependent in dependents.get(id).into_iter().flatten() {
                if released.insert(*dependent) {
                    if let Some(count) = remaining.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
        }

        if order.len() != self.services.len() {
            let services = self
                .services
                .iter()
                .map(|s| s.id())
                .filter(|id| !placed.contains(id))
                .map(String::from)
                .collect();
            return Err(SystemError::DependencyCycle { services });
        }
        Ok(order)
    }

    /// Validates the registrations and starts every service.
    #[instrument(level = "info", skip(self))]
    pub fn start(self) -> Result<SystemHandle, SystemError> {
        let order = self.start_order()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let root = CancellationToken::new();

        let mut by_id: HashMap<String, Arc<dyn Service>> = self
            .services
            .into_iter()
            .map(|s| (s.id().to_string(), s))
            .collect();

        let mut units = HashMap::new();
        let mut tasks = HashMap::new();
        for id in order.iter() {
            let service = match by_id.remove(id) {
                Some(service) => service,
                None => continue,
            };
            let api_restart_allowed = service.api_restart_allowed(&self.machine);
            let (status, status_rx) =
                watch::channel(ServiceStatus::new(id.clone(), api_restart_allowed));
            let (restart_tx, restart_rx) = mpsc::unbounded_channel();
            let token = root.child_token();

            let dependencies = service
                .depends_on()
                .into_iter()
                .filter_map(|dependency| {
                    units
                        .get(&dependency)
                        .map(|unit: &Unit| (dependency, unit.status.clone()))
                })
                .collect();

            let lifecycle = Lifecycle {
                service,
                machine: self.machine.clone(),
                reporter: Reporter {
                    id: id.clone(),
                    status,
                    events: events.clone(),
                    has_check: AtomicBool::new(false),
                },
                dependencies,
                restart_requests: restart_rx,
                token: token.clone(),
            };
            let task = tokio::spawn(
                lifecycle
                    .run()
                    .instrument(info_span!("service", service = %id)),
            );
            info!(service = %id, "Started service lifecycle");

            units.insert(
                id.clone(),
                Unit {
                    status: status_rx,
                    restart: restart_tx,
                    token,
                    api_restart_allowed,
                },
            );
            tasks.insert(id.clone(), task);
        }

        Ok(SystemHandle {
            inner: Arc::new(Inner {
                order,
                units,
                events,
                tasks: Mutex::new(tasks),
                root,
            }),
        })
    }
}

struct Unit {
    status: watch::Receiver<ServiceStatus>,
    restart: mpsc::UnboundedSender<()>,
    token: CancellationToken,
    api_restart_allowed: bool,
}

struct Inner {
    order: Vec<String>,
    units: HashMap<String, Unit>,
    events: broadcast::Sender<ServiceEvent>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    root: CancellationToken,
}

/// A running orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct SystemHandle {
    inner: Arc<Inner>,
}

impl SystemHandle {
    /// Service IDs in start order.
    pub fn services(&self) -> &[String] {
        &self.inner.order
    }

    /// Current status of every service, in start order.
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.inner
            .order
            .iter()
            .filter_map(|id| self.status(id))
            .collect()
    }

    /// Current status of one service.
    pub fn status(&self, id: &str) -> Option<ServiceStatus> {
        self.inner
            .units
            .get(id)
            .map(|unit| unit.status.borrow().clone())
    }

    /// Subscribes to status changes of one service.
    pub fn watch(&self, id: &str) -> Option<watch::Receiver<ServiceStatus>> {
        self.inner.units.get(id).map(|unit| unit.status.clone())
    }

    /// Subscribes to state transitions of all services.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Asks a service to restart. The running process is stopped and the
    /// service goes through its lifecycle again. A finished or failed service
    /// is started again.
    pub fn restart(&self, id: &str) -> Result<(), SystemError> {
        let unit = self
            .inner
            .units
            .get(id)
            .ok_or_else(|| SystemError::UnknownService { id: id.to_string() })?;
        if !unit.api_restart_allowed {
            return Err(SystemError::RestartNotAllowed { id: id.to_string() });
        }
        info!(service = %id, "Restart requested");
        // A closed channel means the service is shutting down.
        let _ = unit.restart.send(());
        Ok(())
    }

    /// Stops every service, dependents before their dependencies, and waits
    /// for the lifecycle tasks to finish.
    #[instrument(level = "info", skip(self))]
    pub async fn shutdown(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        for id in self.inner.order.iter().rev() {
            if let Some(unit) = self.inner.units.get(id) {
                unit.token.cancel();
            }
            if let Some(task) = tasks.remove(id) {
                if let Err(e) = task.await {
                    error!(service = %id, error = %e, "Service task panicked");
                }
            }
        }
        self.inner.root.cancel();
        info!("All services stopped");
    }
}

/// Publishes status transitions of one service.
struct Reporter {
    id: String,
    status: watch::Sender<ServiceStatus>,
    events: broadcast::Sender<ServiceEvent>,
    has_check: AtomicBool,
}

impl Reporter {
    fn transition<M: Into<String>>(&self, state: ServiceState, message: M) {
        let message = message.into();
        let now = Utc::now();
        self.status.send_modify(|status| {
            status.state = state;
            status.message = message.clone();
            status.last_change = now;
            status.ready = is_ready(state, &status.health, self.has_check.load(Ordering::SeqCst));
        });
        info!(state = %state, message = %message, "Service state changed");
        // Nobody listening is fine.
        let _ = self.events.send(ServiceEvent {
            id: self.id.clone(),
            state,
            message,
            timestamp: now,
        });
    }

    fn health(&self, health: HealthStatus) {
        let has_check = self.has_check.load(Ordering::SeqCst);
        self.status.send_modify(|status| {
            status.ready = is_ready(status.state, &health, has_check);
            status.health = health;
        });
    }
}

fn is_ready(state: ServiceState, health: &HealthStatus, has_check: bool) -> bool {
    match state {
        ServiceState::Running => !has_check || health.state == HealthState::Healthy,
        ServiceState::Finished => true,
        _ => false,
    }
}

struct Lifecycle {
    service: Arc<dyn Service>,
    machine: Arc<Machine>,
    reporter: Reporter,
    dependencies: Vec<(String, watch::Receiver<ServiceStatus>)>,
    restart_requests: mpsc::UnboundedReceiver<()>,
    token: CancellationToken,
}

/// How one pass through the lifecycle ended.
enum Round {
    /// Shut down.
    Stopped,
    /// Restart requested through the API.
    Restart,
    /// Ended for good, until an API restart.
    Ended,
}

impl Lifecycle {
    async fn run(mut self) {
        loop {
            let round = self.round().await;
            let state = self.reporter.status.borrow().state;
            if let Err(e) = self.service.post_func(&self.machine, state).await {
                warn!(error = %format!("{:#}", e), "Post hook failed");
            }
            match round {
                Round::Stopped => break,
                Round::Restart => continue,
                Round::Ended => {
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        request = self.restart_requests.recv() => {
                            if request.is_none() {
                                break;
                            }
                            self.reporter.transition(ServiceState::Restarting, "restart requested");
                        }
                    }
                }
            }
        }
        let state = self.reporter.status.borrow().state;
        match state {
            ServiceState::Stopped | ServiceState::Finished | ServiceState::Failed => {}
            _ => self.reporter.transition(ServiceState::Stopped, "stopped"),
        }
    }

    async fn round(&mut self) -> Round {
        if !self.wait_for_dependencies().await {
            self.reporter.transition(ServiceState::Stopped, "stopped while waiting for dependencies");
            return Round::Stopped;
        }

        if let Some(condition) = self.service.condition(&self.machine) {
            self.reporter
                .transition(ServiceState::Waiting, format!("waiting for {}", condition));
            if let Err(e) = condition.wait(&self.token).await {
                if e.is_cancelled() || self.token.is_cancelled() {
                    self.reporter
                        .transition(ServiceState::Stopped, "stopped while waiting for condition");
                    return Round::Stopped;
                }
                error!(error = %e, "Start condition can not be satisfied");
                self.reporter
                    .transition(ServiceState::Failed, format!("condition failed: {}", e));
                return Round::Ended;
            }
        }

        if let Some(round) = self.prepare().await {
            return round;
        }

        let runner = match self.service.runner(&self.machine).await {
            Ok(runner) => runner,
            Err(e) => {
                let message = format!("{:#}", e);
                error!(error = %message, "Failed to build service runner");
                self.reporter
                    .transition(ServiceState::Failed, format!("failed to build runner: {}", message));
                return Round::Ended;
            }
        };

        while self.restart_requests.try_recv().is_ok() {}
        self.supervise(runner).await
    }

    async fn wait_for_dependencies(&mut self) -> bool {
        if self.dependencies.is_empty() {
            return true;
        }
        let names: Vec<&str> = self.dependencies.iter().map(|(id, _)| id.as_str()).collect();
        self.reporter.transition(
            ServiceState::Waiting,
            format!("waiting for services: {}", names.join(", ")),
        );
        let token = self.token.clone();
        for (id, status) in self.dependencies.iter_mut() {
            loop {
                if status.borrow().ready {
                    debug!(dependency = %id, "Dependency is ready");
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => return false,
                    changed = status.changed() => {
                        if changed.is_err() {
                            // The dependency's task is gone, it will never be ready.
                            token.cancelled().await;
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Runs the setup hook, retrying with backoff unless the service is never
    /// restarted. Returns how the round ended if it did not get past setup.
    async fn prepare(&mut self) -> Option<Round> {
        let policy = self.service.restart_policy();
        let mut backoff = ExponentialBackoffStrategy::default();
        loop {
            self.reporter.transition(ServiceState::Preparing, "running pre-start setup");
            let result = tokio::select! {
                _ = self.token.cancelled() => None,
                result = self.service.pre_func(&self.machine) => Some(result),
            };
            let e = match result {
                None => {
                    self.reporter.transition(ServiceState::Stopped, "stopped during setup");
                    return Some(Round::Stopped);
                }
                Some(Ok(())) => return None,
                Some(Err(e)) => format!("{:#}", e),
            };
            error!(error = %e, "Pre-start setup failed");
            if policy == Policy::Never {
                self.reporter
                    .transition(ServiceState::Failed, format!("setup failed: {}", e));
                return Some(Round::Ended);
            }
            let delay = backoff.next_duration();
            self.reporter.transition(
                ServiceState::Restarting,
                format!("setup failed, retrying in {:?}: {}", delay, e),
            );
            tokio::select! {
                _ = self.token.cancelled() => {
                    self.reporter.transition(ServiceState::Stopped, "stopped during setup");
                    return Some(Round::Stopped);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn supervise(&mut self, runner: Box<dyn crate::runner::Runner>) -> Round {
        let run_token = self.token.child_token();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut restarter =
            Restarter::new(runner, self.service.restart_policy()).events(events_tx);

        let check = self.service.health_check(&self.machine);
        let has_check = check.is_some();
        self.reporter.has_check.store(has_check, Ordering::SeqCst);
        self.reporter.health(HealthStatus::default());
        let (_idle, mut health) = watch::channel(HealthStatus::default());
        if let Some(check) = check {
            let (checker, receiver) =
                HealthChecker::new(check, self.service.health_settings(&self.machine));
            health = receiver;
            tokio::spawn(
                checker
                    .run(run_token.child_token())
                    .instrument(info_span!("health")),
            );
        }

        let reporter = &self.reporter;
        let restart_requests = &mut self.restart_requests;
        let mut restart_requested = false;
        let outcome = {
            let run = restarter.run(run_token.clone());
            tokio::pin!(run);
            loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    Some(event) = events.recv() => apply(reporter, event),
                    Ok(()) = health.changed() => {
                        let status = health.borrow().clone();
                        reporter.health(status);
                    }
                    Some(()) = restart_requests.recv(), if !restart_requested => {
                        restart_requested = true;
                        run_token.cancel();
                    }
                }
            }
        };
        run_token.cancel();
        while let Ok(event) = events.try_recv() {
            apply(reporter, event);
        }
        reporter.health(HealthStatus::default());

        if self.token.is_cancelled() {
            reporter.transition(ServiceState::Stopped, "stopped");
            return Round::Stopped;
        }
        if restart_requested {
            reporter.transition(ServiceState::Restarting, "restart requested");
            return Round::Restart;
        }
        match outcome {
            Outcome::Stopped => {
                reporter.transition(ServiceState::Stopped, "stopped");
                Round::Stopped
            }
            Outcome::Finished => {
                reporter.transition(ServiceState::Finished, "finished");
                Round::Ended
            }
            Outcome::Failed(message) => {
                reporter.transition(ServiceState::Failed, message);
                Round::Ended
            }
        }
    }
}

fn apply(reporter: &Reporter, event: RestartEvent) {
    match event {
        RestartEvent::Launching { attempt } => {
            reporter.transition(ServiceState::Running, format!("launch attempt {}", attempt))
        }
        RestartEvent::Exited { status } => debug!(%status, "Process exited"),
        RestartEvent::LaunchFailed { error } => debug!(%error, "Launch failed"),
        RestartEvent::BackingOff { delay } => reporter.transition(
            ServiceState::Restarting,
            format!("restarting in {:?}", delay),
        ),
    }
}
