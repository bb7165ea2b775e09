//! Conditions gate service start.
//!
//! A [`Condition`] is a tree: leaves are resource readiness checks or custom
//! predicates, inner nodes ([`Condition::All`]) require every child. Waiting on
//! a condition blocks cooperatively until it is satisfied, it can never be
//! satisfied, or the given cancellation token fires.
use std::fmt;
use std::sync::Arc;

use async_recursion::async_recursion;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::state::ResourceKey;

mod resource;

pub use resource::{
    network_ready, node_name, nodename_ready, time_sync, NetworkReadiness, ResourceCondition,
    NETWORK_STATUS_KIND, NODENAME_ID, NODENAME_KIND, STATUS_ID, TIME_STATUS_KIND,
};

/// Why waiting for a condition stopped without the condition being satisfied.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConditionError {
    /// The wait was cancelled before the condition was satisfied.
    #[error("wait for {condition} was cancelled")]
    Cancelled {
        /// Description of the condition being waited for.
        condition: String,
    },
    /// The watched resource was deleted. The condition can not be satisfied.
    #[error("resource {key} was deleted while waiting for {condition}")]
    ResourceDeleted {
        /// The deleted resource.
        key: ResourceKey,
        /// Description of the condition being waited for.
        condition: String,
    },
    /// The resource store stopped sending updates.
    #[error("resource store closed while waiting for {condition}")]
    StoreClosed {
        /// Description of the condition being waited for.
        condition: String,
    },
    /// A custom predicate failed.
    #[error("{0}")]
    Failed(String),
}

impl ConditionError {
    /// Returns true if the wait ended because of cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConditionError::Cancelled { .. })
    }
}

/// A custom asynchronous predicate.
///
/// Implementations must return [`ConditionError::Cancelled`] promptly once the
/// token is cancelled.
#[async_trait::async_trait]
pub trait Predicate: fmt::Display + Send + Sync {
    /// Waits until the predicate holds.
    async fn wait(&self, token: &CancellationToken) -> Result<(), ConditionError>;
}

/// A start condition.
#[derive(Clone)]
pub enum Condition {
    /// Satisfied when every child is satisfied.
    All(Vec<Condition>),
    /// Satisfied when a resource in the store reaches the expected state.
    Resource(ResourceCondition),
    /// Satisfied when the predicate says so.
    Custom(Arc<dyn Predicate>),
}

impl Condition {
    /// Builds a condition that requires all of `conditions`.
    pub fn all<I: IntoIterator<Item = Condition>>(conditions: I) -> Self {
        Condition::All(conditions.into_iter().collect())
    }

    /// Wraps a custom predicate.
    pub fn custom<P: Predicate + 'static>(predicate: P) -> Self {
        Condition::Custom(Arc::new(predicate))
    }

    /// Waits for the condition.
    ///
    /// Children of [`Condition::All`] are waited on concurrently with a child
    /// token; the first failure cancels the remaining children.
    #[async_recursion]
    pub async fn wait(&self, token: &CancellationToken) -> Result<(), ConditionError> {
        match self {
            Condition::All(children) => {
                let child_token = token.child_token();
                let result = futures::future::try_join_all(
                    children.iter().map(|child| child.wait(&child_token)),
                )
                .await;
                child_token.cancel();
                result.map(|_| ())
            }
            Condition::Resource(condition) => condition.wait(token).await,
            Condition::Custom(predicate) => predicate.wait(token).await,
        }
    }
}

impl From<ResourceCondition> for Condition {
    fn from(condition: ResourceCondition) -> Self {
        Condition::Resource(condition)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::All(children) => {
                let descriptions: Vec<String> = children.iter().map(|c| c.to_string()).collect();
                write!(f, "{}", descriptions.join(", "))
            }
            Condition::Resource(condition) => condition.fmt(f),
            Condition::Custom(predicate) => predicate.fmt(f),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Condition({})", self)
    }
}
