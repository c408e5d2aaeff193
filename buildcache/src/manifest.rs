use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compression::Algorithm;
use crate::digest::Digest;
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::platform::Platform;
use crate::result::OperationType;

pub const SCHEMA_VERSION: u32 = 2;
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.container-build.cache.manifest.v2+json";

const ANNOTATION_CREATED: &str = "com.apple.container-build.created";
const ANNOTATION_CACHE_VERSION: &str = "com.apple.container-build.cache-version";
const ANNOTATION_COMPRESSION: &str = "com.apple.container-build.compression";
const ANNOTATION_UNCOMPRESSED_SIZE: &str = "com.apple.container-build.uncompressed-size";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    Snapshot,
    Environment,
    Metadata,
}

impl LayerType {
    fn base_media_type(self) -> &'static str {
        match self {
            LayerType::Snapshot => "application/vnd.container-build.snapshot.v1+json",
            LayerType::Environment => "application/vnd.container-build.environment.v1+json",
            LayerType::Metadata => "application/vnd.container-build.metadata.v1+json",
        }
    }
}

/// An OCI-style descriptor referring to a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheLayer {
    pub descriptor: Descriptor,
    #[serde(rename = "type")]
    pub layer_type: LayerType,
}

impl CacheLayer {
    pub fn new(
        layer_type: LayerType,
        digest: Digest,
        compressed_size: u64,
        uncompressed_size: u64,
        algorithm: Algorithm,
    ) -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_COMPRESSION.to_string(), algorithm.name().to_string());
        annotations.insert(
            ANNOTATION_UNCOMPRESSED_SIZE.to_string(),
            uncompressed_size.to_string(),
        );
        let media_type = format!(
            "{}{}",
            layer_type.base_media_type(),
            algorithm.media_type_suffix()
        );
        Self {
            descriptor: Descriptor {
                media_type,
                digest,
                size: compressed_size,
                annotations,
            },
            layer_type,
        }
    }
}

// Spec's wire schema nests a single `cacheKey` object; this flattens it to the digest and input
// list directly, which is simpler to construct and validate without losing any information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestConfig {
    pub cache_key_operation_digest: Digest,
    pub cache_key_input_digests: Vec<Digest>,
    pub operation_type: OperationType,
    pub platform: Platform,
    pub build_version: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: ManifestConfig,
    pub layers: Vec<CacheLayer>,
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
}

/// Assembles a manifest from a key, operation-type tag, and the already-built layers. Layer
/// ordering places snapshot first (always present); environment/metadata only appear when
/// their source map was non-empty (callers simply omit the `CacheLayer` in that case).
pub fn build_manifest(
    key: &CacheKey,
    operation_type: OperationType,
    layers: Vec<CacheLayer>,
    build_version: &str,
    key_version: &str,
    now: DateTime<Utc>,
) -> Result<CacheManifest, CacheError> {
    let mut ordered = layers;
    ordered.sort_by_key(|l| match l.layer_type {
        LayerType::Snapshot => 0,
        LayerType::Environment => 1,
        LayerType::Metadata => 2,
    });

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_CREATED.to_string(), now.to_rfc3339());
    annotations.insert(ANNOTATION_CACHE_VERSION.to_string(), key_version.to_string());

    Ok(CacheManifest {
        schema_version: SCHEMA_VERSION,
        media_type: MANIFEST_MEDIA_TYPE.to_string(),
        config: ManifestConfig {
            cache_key_operation_digest: key.operation_digest.clone(),
            cache_key_input_digests: key.sorted_input_digests().into_iter().cloned().collect(),
            operation_type,
            platform: key.platform.clone(),
            build_version: build_version.to_string(),
            created_at: now,
        },
        layers: ordered,
        annotations,
        subject: None,
    })
}
