use std::fmt;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Condition, ConditionError};
use crate::state::{Event, Resource, ResourceKey, ResourceStore};

/// Kind of the time synchronization status resource.
pub const TIME_STATUS_KIND: &str = "TimeStatuses.time";
/// Kind of the network status resource.
pub const NETWORK_STATUS_KIND: &str = "NetworkStatuses.net";
/// Kind of the node name resource.
pub const NODENAME_KIND: &str = "Nodenames.kubernetes";

/// ID of the time and network status resources.
pub const STATUS_ID: &str = "status";
/// ID of the node name resource.
pub const NODENAME_ID: &str = "nodename";

/// Waits for a resource to exist and, optionally, for some of its fields to
/// hold expected values.
///
/// Fields are addressed with JSON pointers (`/synced`, `/status/ready`).
#[derive(Clone)]
pub struct ResourceCondition {
    store: ResourceStore,
    key: ResourceKey,
    fields: Vec<(String, Value)>,
    description: String,
}

impl ResourceCondition {
    /// Satisfied as soon as the resource exists.
    pub fn exists(store: ResourceStore, key: ResourceKey) -> Self {
        let description = format!("resource {}", key);
        ResourceCondition {
            store,
            key,
            fields: Vec::new(),
            description,
        }
    }

    /// Additionally requires the field at `pointer` to equal `value`.
    pub fn field<P: Into<String>, V: Into<Value>>(mut self, pointer: P, value: V) -> Self {
        self.fields.push((pointer.into(), value.into()));
        self
    }

    /// Replaces the human readable description.
    pub fn describe<D: Into<String>>(mut self, description: D) -> Self {
        self.description = description.into();
        self
    }

    /// The watched resource.
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Returns true if `resource` satisfies the condition.
    pub fn satisfied_by(&self, resource: &Resource) -> bool {
        self.fields
            .iter()
            .all(|(pointer, expected)| resource.spec.pointer(pointer) == Some(expected))
    }

    /// Waits until the resource satisfies the condition.
    ///
    /// Fails with [`ConditionError::ResourceDeleted`] if the resource is
    /// deleted while waiting, and with [`ConditionError::Cancelled`] once the
    /// token is cancelled.
    pub async fn wait(&self, token: &CancellationToken) -> Result<(), ConditionError> {
        let (current, mut events) = self.store.watch(&self.key).await;
        let mut seen = current.is_some();
        if current.map(|r| self.satisfied_by(&r)).unwrap_or(false) {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(ConditionError::Cancelled {
                        condition: self.description.clone(),
                    });
                }
                event = events.recv() => match event {
                    Ok(event) if event.key() != &self.key => continue,
                    Ok(Event::Put(resource)) => {
                        seen = true;
                        if self.satisfied_by(&resource) {
                            return Ok(());
                        }
                    }
                    Ok(Event::Deleted(key)) => {
                        return Err(ConditionError::ResourceDeleted {
                            key,
                            condition: self.description.clone(),
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, key = %self.key, "Watch lagged, re-reading resource");
                        match self.store.get(&self.key).await {
                            Some(resource) => {
                                seen = true;
                                if self.satisfied_by(&resource) {
                                    return Ok(());
                                }
                            }
                            None if seen => {
                                return Err(ConditionError::ResourceDeleted {
                                    key: self.key.clone(),
                                    condition: self.description.clone(),
                                });
                            }
                            None => {}
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(ConditionError::StoreClosed {
                            condition: self.description.clone(),
                        });
                    }
                }
            }
        }
    }
}

impl fmt::Display for ResourceCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// Network readiness flags published in the network status resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkReadiness {
    /// At least one address is configured.
    AddressReady,
    /// Network connectivity is established.
    ConnectivityReady,
    /// The hostname is set.
    HostnameReady,
    /// Files in /etc (hosts, resolv.conf) are rendered.
    EtcFilesReady,
}

impl NetworkReadiness {
    fn pointer(&self) -> &'static str {
        match self {
            NetworkReadiness::AddressReady => "/addressReady",
            NetworkReadiness::ConnectivityReady => "/connectivityReady",
            NetworkReadiness::HostnameReady => "/hostnameReady",
            NetworkReadiness::EtcFilesReady => "/etcFilesReady",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            NetworkReadiness::AddressReady => "address",
            NetworkReadiness::ConnectivityReady => "connectivity",
            NetworkReadiness::HostnameReady => "hostname",
            NetworkReadiness::EtcFilesReady => "etcfiles",
        }
    }
}

/// Satisfied once time is synchronized.
pub fn time_sync(store: ResourceStore) -> Condition {
    ResourceCondition::exists(store, ResourceKey::new(TIME_STATUS_KIND, STATUS_ID))
        .field("/synced", true)
        .describe("time sync")
        .into()
}

/// Satisfied once every requested network readiness flag is set.
pub fn network_ready(store: ResourceStore, checks: &[NetworkReadiness]) -> Condition {
    let names: Vec<&str> = checks.iter().map(|c| c.name()).collect();
    checks
        .iter()
        .fold(
            ResourceCondition::exists(store, ResourceKey::new(NETWORK_STATUS_KIND, STATUS_ID)),
            |condition, check| condition.field(check.pointer(), true),
        )
        .describe(format!("network: {}", names.join(", ")))
        .into()
}

/// Satisfied once the node name is published.
pub fn nodename_ready(store: ResourceStore) -> Condition {
    ResourceCondition::exists(store, ResourceKey::new(NODENAME_KIND, NODENAME_ID))
        .describe("nodename")
        .into()
}

/// Reads the published node name.
pub async fn node_name(store: &ResourceStore) -> Option<String> {
    store
        .get(&ResourceKey::new(NODENAME_KIND, NODENAME_ID))
        .await
        .and_then(|r| r.spec.get("nodename").and_then(Value::as_str).map(String::from))
}
