use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::{watch, Mutex};

use crate::blobstore::{BlobStore, FsBlobStore};
use crate::compression;
use crate::config::CacheConfig;
use crate::digest::Digest;
use crate::error::CacheError;
use crate::eviction;
use crate::fingerprint::fingerprint;
use crate::index::{EntryMetadata, Index};
use crate::key::CacheKey;
use crate::manifest::{build_manifest, CacheLayer, CacheManifest, Descriptor, LayerType, MANIFEST_MEDIA_TYPE};
use crate::result::{CachedResult, OperationType};
use crate::stats::CacheStatistics;

/// The public cache contract. `get`/`put`/`has` never fail to the caller — a cache miss or a
/// failed `put` must never fail a build. Only `evict`'s per-entry failures and construction
/// (`open`) can surface a `CacheError`.
pub struct BuildCache {
    index: Arc<Index>,
    blob_store: Arc<dyn BlobStore>,
    config: CacheConfig,
    // single-writer-per-fingerprint: a fingerprint claimed here is mid-ingest: a second put
    // observing the claim returns immediately rather than racing the first into the blob store
    in_flight_puts: Mutex<HashSet<String>>,
    shutdown: watch::Sender<bool>,
    gc_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BuildCache {
    /// Opens (or creates) a cache at `config.index_path`, loading the index and warm-starting it
    /// eagerly rather than lazily on first `get` — the same eager-load-at-build idiom as
    /// `peoci::ocidist_cache::ClientBuilder::load_from_disk`.
    pub async fn open(config: CacheConfig) -> Result<Self, CacheError> {
        if !config.eviction_policy.is_implemented() {
            error!(
                "configured eviction policy '{}' is recognized but not implemented; refusing to open with an unobserved gap between configured and actual behavior",
                config.eviction_policy.name()
            );
            return Err(CacheError::UnsupportedEvictionPolicy(config.eviction_policy.name()));
        }

        let index = Arc::new(Index::open(&config.index_path).await?);
        let blob_store: Arc<dyn BlobStore> =
            Arc::new(FsBlobStore::open(config.index_path.join("blobs-store")).await?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let gc_handle = tokio::spawn(eviction::run_background_loop(
            index.clone(),
            blob_store.clone(),
            config.gc_interval,
            config.max_size,
            shutdown_rx,
        ));

        Ok(Self {
            index,
            blob_store,
            config,
            in_flight_puts: Mutex::new(HashSet::new()),
            shutdown: shutdown_tx,
            gc_handle: Mutex::new(Some(gc_handle)),
        })
    }

    /// Signals the background GC loop to stop. It terminates within one `gc_interval`; this
    /// awaits that termination so dropping the cache doesn't orphan the task.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.gc_handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    fn fingerprint_of(&self, key: &CacheKey) -> Option<String> {
        match fingerprint(key, &self.config.cache_key_version) {
            Ok(fp) => Some(fp),
            Err(e) => {
                error!("fingerprint derivation failed: {:?}", e);
                None
            }
        }
    }

    /// Fingerprints the key, looks up the index, fetches the manifest and every layer blob,
    /// decompresses, and reconstructs the result. Any internal failure degrades to `None` and is
    /// logged — never surfaced to the caller.
    pub async fn get(&self, key: &CacheKey, operation_type: OperationType) -> Option<CachedResult> {
        let fp = self.fingerprint_of(key)?;

        let entry = match self.index.get(&fp).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!("get({fp}): index lookup failed: {:?}", e);
                return None;
            }
        };

        let manifest_bytes = match self.blob_store.get(&entry.descriptor.digest).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                // the manifest this entry points to is gone. Weak reference collapses: drop
                // the orphaned entry and report a miss.
                info!("get({fp}): manifest blob missing, collapsing orphaned entry");
                let _ = self.index.remove(&[fp.clone()]).await;
                return None;
            }
            Err(e) => {
                warn!("get({fp}): manifest fetch failed: {:?}", e);
                return None;
            }
        };

        let manifest: CacheManifest = match serde_json::from_slice(&manifest_bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!("get({fp}): manifest unreadable: {:?}", e);
                return None;
            }
        };

        match self.assemble_result(&fp, &manifest).await {
            Ok(result) => {
                info!(
                    "get({fp}) hit operation={}",
                    operation_type.as_str()
                );
                Some(result)
            }
            Err(e) => {
                warn!("get({fp}): failed to assemble result: {:?}", e);
                None
            }
        }
    }

    async fn assemble_result(
        &self,
        fingerprint: &str,
        manifest: &CacheManifest,
    ) -> Result<CachedResult, CacheError> {
        let mut snapshot = None;
        let mut environment_changes = BTreeMap::new();
        let mut metadata_changes = BTreeMap::new();

        for layer in &manifest.layers {
            let bytes = match self.blob_store.get(&layer.descriptor.digest).await? {
                Some(bytes) => bytes,
                None => {
                    info!("get({fingerprint}): layer blob {} missing", layer.descriptor.digest);
                    return Err(CacheError::ItemNotFound);
                }
            };

            if self.config.verify_integrity {
                let recomputed = Digest::sha256(&bytes);
                if recomputed != layer.descriptor.digest {
                    error!("get({fingerprint}): digest mismatch on layer, evicting entry");
                    let _ = self.index.remove(&[fingerprint.to_string()]).await;
                    return Err(CacheError::DigestMismatch);
                }
            }

            let plain = compression::decompress(&bytes)?;
            match layer.layer_type {
                LayerType::Snapshot => {
                    snapshot = Some(serde_json::from_slice(&plain)?);
                }
                LayerType::Environment => {
                    environment_changes = serde_json::from_slice(&plain)?;
                }
                LayerType::Metadata => {
                    metadata_changes = serde_json::from_slice(&plain)?;
                }
            }
        }

        Ok(CachedResult {
            snapshot: snapshot.ok_or(CacheError::ItemNotFound)?,
            environment_changes,
            metadata_changes,
        })
    }

    /// Fingerprints the key; if already indexed, returns (idempotent — a fingerprint maps to at
    /// most one entry). Otherwise opens an ingest session, writes each non-empty component as a
    /// compressed layer blob, writes the manifest, commits, and records the index entry. On any
    /// failure the session is canceled and the cache state is left unchanged — `put` is
    /// best-effort.
    pub async fn put(&self, result: CachedResult, key: &CacheKey, operation_type: OperationType) {
        let Some(fp) = self.fingerprint_of(key) else {
            return;
        };

        if self.index.peek(&fp).await.is_some() {
            return;
        }

        {
            let mut in_flight = self.in_flight_puts.lock().await;
            if in_flight.contains(&fp) {
                return;
            }
            in_flight.insert(fp.clone());
        }

        let outcome = self.put_inner(&fp, result, key, operation_type).await;

        self.in_flight_puts.lock().await.remove(&fp);

        match outcome {
            Ok(()) => {
                info!("put({fp}) committed operation={}", operation_type.as_str());
                if self.index.total_size().await > self.config.max_size {
                    let index = self.index.clone();
                    let blob_store = self.blob_store.clone();
                    let max_size = self.config.max_size;
                    tokio::spawn(async move {
                        eviction::evict_for_size(&index, blob_store.as_ref(), max_size).await;
                    });
                }
            }
            Err(e) => {
                warn!("put({fp}) failed, cache state unchanged: {:?}", e);
            }
        }
    }

    async fn put_inner(
        &self,
        fp: &str,
        result: CachedResult,
        key: &CacheKey,
        operation_type: OperationType,
    ) -> Result<(), CacheError> {
        let session = self.blob_store.new_ingest_session().await?;

        let staged = self.write_layers_and_manifest(&session, &result, key, operation_type).await;

        let (manifest_digest, manifest_size) = match staged {
            Ok(v) => v,
            Err(e) => {
                if let Err(cancel_err) = self.blob_store.cancel_ingest_session(session).await {
                    error!("put({fp}): session cancel also failed: {:?}", cancel_err);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.blob_store.complete_ingest_session(session).await {
            error!("put({fp}): session commit failed: {:?}", e);
            return Err(e);
        }

        let metadata = EntryMetadata {
            created_at: Utc::now(),
            accessed_at: Utc::now(),
            operation_hash: key.operation_digest.to_string(),
            operation_type,
            platform: key.platform.clone(),
            ttl_seconds: self.config.default_ttl.map(|d| d.as_secs() as i64),
            tags: Vec::new(),
        };

        let descriptor = Descriptor {
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            digest: manifest_digest,
            size: manifest_size,
            annotations: BTreeMap::new(),
        };

        self.index.put(fp, descriptor, metadata).await
    }

    async fn write_layers_and_manifest(
        &self,
        session: &crate::blobstore::IngestSession,
        result: &CachedResult,
        key: &CacheKey,
        operation_type: OperationType,
    ) -> Result<(Digest, u64), CacheError> {
        let mut layers = Vec::new();

        let snapshot_bytes = serde_json::to_vec(&result.snapshot)?;
        layers.push(self.write_layer(session, LayerType::Snapshot, &snapshot_bytes).await?);

        if !result.environment_changes.is_empty() {
            let bytes = serde_json::to_vec(&result.environment_changes)?;
            layers.push(self.write_layer(session, LayerType::Environment, &bytes).await?);
        }

        if !result.metadata_changes.is_empty() {
            let bytes = serde_json::to_vec(&result.metadata_changes)?;
            layers.push(self.write_layer(session, LayerType::Metadata, &bytes).await?);
        }

        let manifest = build_manifest(
            key,
            operation_type,
            layers,
            &self.config.build_version,
            &self.config.cache_key_version,
            Utc::now(),
        )?;
        let manifest_value = serde_json::to_value(&manifest)?;
        let (manifest_size, manifest_digest) = self.blob_store.create(session, &manifest_value).await?;

        Ok((manifest_digest, manifest_size))
    }

    async fn write_layer(
        &self,
        session: &crate::blobstore::IngestSession,
        layer_type: LayerType,
        plain: &[u8],
    ) -> Result<CacheLayer, CacheError> {
        let (compressed, effective_algorithm) = compression::compress(
            plain,
            self.config.compression.algorithm,
            self.config.compression.level,
            self.config.compression.min_size,
        )?;
        let (compressed_size, digest) = self.blob_store.write(session, &compressed).await?;
        // the layer is labeled with the algorithm the bytes were actually stored under, not the
        // configured one — compress() falls back to plain below min_size, and a mislabeled layer
        // would send a future decompress() down the wrong decoder
        Ok(CacheLayer::new(
            layer_type,
            digest,
            compressed_size,
            plain.len() as u64,
            effective_algorithm,
        ))
    }

    /// Fingerprints and consults the index only — does not touch the blob store.
    pub async fn has(&self, key: &CacheKey) -> bool {
        let Some(fp) = self.fingerprint_of(key) else {
            return false;
        };
        self.index.peek(&fp).await.is_some()
    }

    /// Evicts each key's entry: fetches the manifest to discover layer digests, bulk-deletes
    /// (manifest + layers), and removes the index entry. Per-entry errors are swallowed.
    pub async fn evict(&self, keys: &[CacheKey]) {
        let fingerprints: Vec<String> = keys.iter().filter_map(|k| self.fingerprint_of(k)).collect();
        eviction::evict_by_fingerprints(&self.index, self.blob_store.as_ref(), &fingerprints).await;
    }

    pub async fn statistics(&self) -> CacheStatistics {
        self.index.statistics().await
    }
}
