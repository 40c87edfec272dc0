//! Desired resource descriptions and ledger records
//!
//! A [`ResourceSpec`] is what the configuration renderer hands the engine; a
//! [`ResourceRecord`] is what the tracker remembers about a resource it owns.

use crate::types::{ResourceKey, ResourceStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Desired state of one remote resource
///
/// The manifest is opaque to the engine; only the remote client reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(flatten)]
    pub key: ResourceKey,
    /// Manifest reference understood by the remote client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
    /// Labels stamped onto the resource
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ResourceSpec {
    /// Create a spec for a namespaced resource
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: ResourceKey::new(kind, namespace, name),
            manifest: None,
            labels: BTreeMap::new(),
        }
    }

    /// Create a spec for a cluster-scoped resource
    pub fn cluster_scoped(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, "", name)
    }

    /// Attach a manifest reference
    pub fn with_manifest(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.manifest = Some(manifest.into());
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Ledger entry for a resource owned by a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    #[serde(flatten)]
    pub key: ResourceKey,
    pub status: ResourceStatus,
    /// Phase that created the resource
    pub phase: String,
    /// Ordinal of the creating phase, used to order teardown
    pub phase_ordinal: u32,
    /// Incremented on every creation event
    pub generation: u32,
    /// Tracker-wide creation sequence number
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Whether this record still represents something on the remote side
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}
