use std::sync::Arc;

use chrono::Utc;
use log::{error, info};
use tokio::sync::watch;

use crate::blobstore::BlobStore;
use crate::index::Index;
use crate::manifest::CacheManifest;

/// Reads the manifest for `fingerprint`, bulk-deletes the manifest blob plus every layer blob it
/// references, and removes the index entry. Swallows per-entry errors and logs them — a failed
/// eviction must not abort the rest of the sweep.
async fn evict_one(index: &Index, blob_store: &dyn BlobStore, fingerprint: &str) -> bool {
    let Some(entry) = index.peek(fingerprint).await else {
        return false;
    };

    let mut digests = vec![entry.descriptor.digest.clone()];
    match blob_store.get(&entry.descriptor.digest).await {
        Ok(Some(bytes)) => match serde_json::from_slice::<CacheManifest>(&bytes) {
            Ok(manifest) => {
                digests.extend(manifest.layers.into_iter().map(|l| l.descriptor.digest));
            }
            Err(e) => error!("evict({fingerprint}): manifest unreadable: {:?}", e),
        },
        Ok(None) => info!("evict({fingerprint}): manifest already absent, deleting index entry only"),
        Err(e) => error!("evict({fingerprint}): manifest fetch failed: {:?}", e),
    }

    if let Err(e) = blob_store.delete(&digests).await {
        error!("evict({fingerprint}): blob delete failed: {:?}", e);
    }

    match index.remove(&[fingerprint.to_string()]).await {
        Ok(n) => n > 0,
        Err(e) => {
            error!("evict({fingerprint}): index remove failed: {:?}", e);
            false
        }
    }
}

pub async fn evict_by_fingerprints(
    index: &Index,
    blob_store: &dyn BlobStore,
    fingerprints: &[String],
) -> u64 {
    let mut evicted = 0u64;
    for fp in fingerprints {
        if evict_one(index, blob_store, fp).await {
            evicted += 1;
        }
    }
    evicted
}

/// Size-capped LRU eviction. Evicts from the least-recently-accessed entry, ties broken by
/// older `created_at`, until `total_size <= 0.8 * max_size`.
pub async fn evict_for_size(index: &Index, blob_store: &dyn BlobStore, max_size: u64) -> u64 {
    let current = index.total_size().await;
    if current <= max_size {
        return 0;
    }

    let target = (max_size as f64 * 0.8) as u64;
    let ordered = index.entries_by_lru().await;

    let mut evicted = 0u64;
    let mut remaining = current;
    for (fingerprint, entry) in ordered {
        if remaining <= target {
            break;
        }
        if evict_one(index, blob_store, &fingerprint).await {
            remaining = remaining.saturating_sub(entry.descriptor.size);
            evicted += 1;
        }
    }
    if evicted > 0 {
        info!("size eviction: removed {evicted} entries, total_size now ~{remaining}");
    }
    evicted
}

/// TTL sweep: removes every entry whose `created_at + ttl < now`.
pub async fn sweep_ttl(index: &Index, blob_store: &dyn BlobStore) -> u64 {
    let now = Utc::now();
    let expired = index.expired_entries(now).await;
    if expired.is_empty() {
        return 0;
    }
    evict_by_fingerprints(index, blob_store, &expired).await
}

/// The long-lived background GC loop. Sleeps `gc_interval`, runs the TTL sweep, then reapplies
/// the size trigger, checking for cancellation at the head of each iteration. Terminates within
/// one `gc_interval` of the shutdown signal flipping to `true`.
pub async fn run_background_loop(
    index: Arc<Index>,
    blob_store: Arc<dyn BlobStore>,
    gc_interval: std::time::Duration,
    max_size: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            info!("gc loop: shutdown observed, terminating");
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(gc_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("gc loop: shutdown observed during sleep, terminating");
                    return;
                }
            }
        }

        let ttl_evicted = sweep_ttl(&index, blob_store.as_ref()).await;
        let size_evicted = evict_for_size(&index, blob_store.as_ref(), max_size).await;
        if let Err(e) = index.mark_gc_completed().await {
            error!("gc loop: failed to record last_gc: {:?}", e);
        }
        info!("gc tick: ttl_evicted={ttl_evicted} size_evicted={size_evicted}");
    }
}
