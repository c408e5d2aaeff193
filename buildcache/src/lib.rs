//! Content-addressable build cache: fingerprints cacheable build operations, stores their
//! results as OCI-manifest-structured layers over a content-addressed blob store, and tracks
//! them in a serialized, size- and TTL-bounded index with background GC.

mod blobstore;
mod compression;
mod config;
mod digest;
mod engine;
mod error;
mod eviction;
mod fingerprint;
mod index;
mod key;
mod manifest;
mod platform;
mod result;
mod stats;

pub use blobstore::{BlobStore, FsBlobStore, IngestSession};
pub use compression::Algorithm as CompressionAlgorithm;
pub use config::{CacheConfig, CacheConfigBuilder, CompressionConfig, ConcurrencyConfig, EvictionPolicy};
pub use digest::{Digest, DigestAlgorithm};
pub use engine::BuildCache;
pub use error::{CacheError, Result};
pub use key::CacheKey;
pub use manifest::{CacheLayer, CacheManifest, Descriptor, LayerType};
pub use platform::Platform;
pub use result::{CachedResult, EnvValue, OperationType, Snapshot};
pub use stats::CacheStatistics;
