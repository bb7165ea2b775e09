//! Command line construction for supervised processes.
//!
//! A service starts from a set of base flags it requires to work at all and
//! merges operator supplied extra flags on top. Every flag may carry a
//! [`MergePolicy`] which decides whether the operator is allowed to touch it.
use std::collections::{BTreeMap, HashMap};
use std::iter::FromIterator;

use thiserror::Error;

/// Decides how an extra value for a flag combines with the base value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergePolicy {
    /// The base value is authoritative. Any extra value is a configuration error.
    Denied,
    /// The extra value replaces the base value. This is the default for flags
    /// that have no policy.
    Overwrite,
    /// Comma separated list flag: extra values are appended after the base
    /// values, skipping values that are already present.
    Additive,
}

impl Default for MergePolicy {
    fn default() -> Self {
        MergePolicy::Overwrite
    }
}

/// Per flag merge policies. Flags absent from the map use [`MergePolicy::Overwrite`].
pub type MergePolicies = HashMap<String, MergePolicy>;

/// An error produced while merging flags.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    /// An extra value was supplied for a flag whose policy is [`MergePolicy::Denied`].
    #[error("extra argument {flag:?} is not allowed to be overridden")]
    MergeDenied {
        /// The offending flag name.
        flag: String,
    },
}

/// An ordered set of `--flag=value` pairs.
///
/// Keys are kept sorted so that [`Args::args`] renders the same command line
/// for the same input every time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Args(BTreeMap<String, String>);

impl Args {
    /// Creates an empty set of flags.
    pub fn new() -> Self {
        Args(BTreeMap::new())
    }

    /// Sets (or replaces) a flag.
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the value of a flag, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns true if the flag is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of flags.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no flags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates flags in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merges `extra` into `self` following `policies`.
    ///
    /// The merge is all or nothing: if any extra flag is denied, `self` is left
    /// untouched and the first denied flag (in key order) is reported.
    pub fn merge(&mut self, extra: &Args, policies: &MergePolicies) -> Result<(), ArgsError> {
        if let Some(flag) = extra
            .0
            .keys()
            .find(|key| policies.get(key.as_str()) == Some(&MergePolicy::Denied))
        {
            return Err(ArgsError::MergeDenied { flag: flag.clone() });
        }

        for (key, value) in extra.0.iter() {
            let merged = match (policies.get(key), self.0.get(key)) {
                (Some(MergePolicy::Additive), Some(existing)) => append_values(existing, value),
                _ => value.clone(),
            };
            self.0.insert(key.clone(), merged);
        }

        Ok(())
    }

    /// Renders the flags as `--key=value` strings in key order.
    pub fn args(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(key, value)| format!("--{}={}", key, value))
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Args {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Args(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, String>> for Args {
    fn from(map: BTreeMap<String, String>) -> Self {
        Args(map)
    }
}

/// Merges `extra` on top of a copy of `base` and returns the result.
pub fn build(base: &Args, extra: &Args, policies: &MergePolicies) -> Result<Args, ArgsError> {
    let mut merged = base.clone();
    merged.merge(extra, policies)?;
    Ok(merged)
}

fn append_values(existing: &str, extra: &str) -> String {
    let mut values: Vec<&str> = existing.split(',').filter(|v| !v.is_empty()).collect();
    for value in extra.split(',').filter(|v| !v.is_empty()) {
        if !values.contains(&value) {
            values.push(value);
        }
    }
    values.join(",")
}
