//! Dehydration and Hydration
//!
//! A snapshot is a flat map of instance id to state for a filtered subset of
//! an ecosystem's instances, suitable for persisting, shipping to devtools,
//! or seeding another ecosystem. Per-template transforms applied on the way
//! out are undone by their declared inverses on the way in.
//!
//! Snapshots serialize with serde; MessagePack helpers are provided for a
//! compact binary round trip.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Filters selecting which instances a dehydration includes. An empty
/// options value includes everything.
#[derive(Debug, Clone, Default)]
pub struct DehydrateOptions {
    /// Include only instances of these template keys. Empty = all templates.
    pub templates: Vec<String>,
    /// Include only instances whose id contains this substring.
    pub id_contains: Option<String>,
    /// Include only instances whose template carries at least one of these
    /// flags. Empty = no flag requirement.
    pub include_flags: Vec<String>,
    /// Exclude instances whose template carries any of these flags.
    pub exclude_flags: Vec<String>,
}

impl DehydrateOptions {
    /// Include everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to the given template keys.
    pub fn templates<I, S>(mut self, templates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.templates = templates.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to ids containing the given substring.
    pub fn id_contains(mut self, needle: impl Into<String>) -> Self {
        self.id_contains = Some(needle.into());
        self
    }

    /// Require at least one of the given template flags.
    pub fn include_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_flags = flags.into_iter().map(Into::into).collect();
        self
    }

    /// Exclude templates carrying any of the given flags.
    pub fn exclude_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_flags = flags.into_iter().map(Into::into).collect();
        self
    }

    /// Whether an instance passes every configured filter.
    pub(crate) fn matches(&self, template_key: &str, id: &str, flags: &[String]) -> bool {
        if !self.templates.is_empty() && !self.templates.iter().any(|t| t == template_key) {
            return false;
        }
        if let Some(needle) = &self.id_contains {
            if !id.contains(needle.as_str()) {
                return false;
            }
        }
        if !self.include_flags.is_empty()
            && !self.include_flags.iter().any(|f| flags.contains(f))
        {
            return false;
        }
        if self.exclude_flags.iter().any(|f| flags.contains(f)) {
            return false;
        }
        true
    }
}

/// How hydration treats instances that already exist.
#[derive(Debug, Clone, Copy)]
pub struct HydrateOptions {
    /// When `true` (the default), matching live instances have the value
    /// applied immediately; when `false`, values are only staged for
    /// instances initialized in the future.
    pub retroactive: bool,
}

impl Default for HydrateOptions {
    fn default() -> Self {
        Self { retroactive: true }
    }
}

/// A dehydrated `{instance id -> state}` map, ordered for stable output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot(pub BTreeMap<String, Value>);

impl Snapshot {
    /// Number of dehydrated instances.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The dehydrated state for an instance id.
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.0.get(id)
    }

    /// Encode as MessagePack.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Snapshot(e.to_string()))
    }

    /// Decode from MessagePack.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Snapshot(e.to_string()))
    }
}
