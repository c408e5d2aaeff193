use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// A build snapshot. Opaque to the cache: it carries its own digest and size, and the cache
/// never interprets its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub digest: Digest,
    pub size: u64,
}

/// An environment-variable value, which may carry platform-specific variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Single(String),
    Variants(BTreeMap<String, String>),
}

/// The result of a single cacheable build operation. Any of the three components may be empty;
/// `snapshot` is the only one that is always present once a result exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResult {
    pub snapshot: Snapshot,
    #[serde(default)]
    pub environment_changes: BTreeMap<String, EnvValue>,
    #[serde(default)]
    pub metadata_changes: BTreeMap<String, String>,
}

impl CachedResult {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            environment_changes: BTreeMap::new(),
            metadata_changes: BTreeMap::new(),
        }
    }
}

/// The coarse textual tag identifying an operation variant. Not part of the fingerprint (the
/// operation digest already is); aids filtering and statistics only. `Unknown` preserves forward
/// compatibility for manifests written by a newer cache version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Exec,
    Filesystem,
    Image,
    Metadata,
    #[serde(other)]
    Unknown,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Exec => "exec",
            OperationType::Filesystem => "filesystem",
            OperationType::Image => "image",
            OperationType::Metadata => "metadata",
            OperationType::Unknown => "unknown",
        }
    }
}
