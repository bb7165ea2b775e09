//! The service contract.
//!
//! A [`Service`] describes one supervised system process: what it waits for,
//! how it is prepared and launched, how its health is probed and whether it is
//! restarted. The orchestrator in [`crate::system`] supplies the generic
//! lifecycle around it.
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::config::{Constants, MachineConfig};
use crate::health::{self, Check, HealthStatus};
use crate::image::ImageStore;
use crate::nodeip::AddressSource;
use crate::restart::Policy;
use crate::runner::Runner;
use crate::state::ResourceStore;

/// Everything a service may consult while it is prepared and launched.
pub struct Machine {
    /// Fixed paths, ports and limits.
    pub constants: Constants,
    /// Operator configuration.
    pub config: MachineConfig,
    /// Shared resource store the start conditions watch.
    pub store: ResourceStore,
    /// Local image storage.
    pub images: Arc<dyn ImageStore>,
    /// Local interface addresses.
    pub addresses: Arc<dyn AddressSource>,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("constants", &self.constants)
            .field("config", &self.config)
            .field("store", &self.store)
            .finish()
    }
}

/// Where a service is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceState {
    /// Registered, not started.
    Initialized,
    /// Waiting for dependencies or the start condition.
    Waiting,
    /// Running the pre-start setup.
    Preparing,
    /// The process is running.
    Running,
    /// The process exited and is about to be relaunched.
    Restarting,
    /// The process exited and will not be relaunched.
    Finished,
    /// The service failed and will not be relaunched.
    Failed,
    /// Stopped on request.
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Initialized => "Initialized",
            ServiceState::Waiting => "Waiting",
            ServiceState::Preparing => "Preparing",
            ServiceState::Running => "Running",
            ServiceState::Restarting => "Restarting",
            ServiceState::Finished => "Finished",
            ServiceState::Failed => "Failed",
            ServiceState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// Published status of a service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Service ID.
    pub id: String,
    /// Lifecycle state.
    pub state: ServiceState,
    /// Health, `Unknown` for services without a health check.
    pub health: HealthStatus,
    /// Whether dependents may start: running and, if health checked,
    /// healthy; or finished.
    pub ready: bool,
    /// Message of the last transition.
    pub message: String,
    /// When the last transition happened.
    pub last_change: DateTime<Utc>,
    /// Whether the operator API may restart the service.
    pub api_restart_allowed: bool,
}

impl ServiceStatus {
    /// Initial status of a registered service.
    pub fn new<S: Into<String>>(id: S, api_restart_allowed: bool) -> Self {
        ServiceStatus {
            id: id.into(),
            state: ServiceState::Initialized,
            health: HealthStatus::default(),
            ready: false,
            message: String::new(),
            last_change: Utc::now(),
            api_restart_allowed,
        }
    }
}

/// A state transition of a service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEvent {
    /// Service ID.
    pub id: String,
    /// New state.
    pub state: ServiceState,
    /// What happened.
    pub message: String,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

/// A supervised service.
///
/// Only [`Service::id`] and [`Service::runner`] are required; everything else
/// defaults to "no dependencies, no condition, no setup, no health check,
/// restart forever, API restart refused".
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Unique ID.
    fn id(&self) -> &str;

    /// Services that must be ready before the condition is evaluated.
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    /// Condition gating the start.
    fn condition(&self, _machine: &Machine) -> Option<Condition> {
        None
    }

    /// Idempotent setup before every launch.
    async fn pre_func(&self, _machine: &Machine) -> anyhow::Result<()> {
        Ok(())
    }

    /// Cleanup after the service stopped. Failures are logged only.
    async fn post_func(&self, _machine: &Machine, _state: ServiceState) -> anyhow::Result<()> {
        Ok(())
    }

    /// Builds the runner. Errors here are configuration errors and are not
    /// retried.
    async fn runner(&self, machine: &Machine) -> anyhow::Result<Box<dyn Runner>>;

    /// Restart policy.
    fn restart_policy(&self) -> Policy {
        Policy::Forever
    }

    /// Health probe.
    fn health_check(&self, _machine: &Machine) -> Option<Arc<dyn Check>> {
        None
    }

    /// Health probe settings.
    fn health_settings(&self, _machine: &Machine) -> health::Settings {
        health::Settings::default()
    }

    /// Whether the operator API may restart the service.
    fn api_restart_allowed(&self, _machine: &Machine) -> bool {
        false
    }
}
