use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::CacheError;
use crate::manifest::Descriptor;
use crate::platform::Platform;
use crate::result::OperationType;
use crate::stats::CacheStatistics;

pub const INDEX_VERSION: u32 = 1;
const INDEX_FILE: &str = "index.json";
const INDEX_TMP_FILE: &str = "index.json.tmp";
const INDEX_CORRUPTED_FILE: &str = "index.json.corrupted";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub operation_hash: String,
    // an addition beyond the minimal entry-metadata tuple; carried here purely so statistics()
    // can derive a per-operation-type breakdown without re-reading every manifest blob
    pub operation_type: OperationType,
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl EntryMetadata {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            Some(ttl) => self.created_at + chrono::Duration::seconds(ttl) < now,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub descriptor: Descriptor,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub total_size: u64,
    pub entry_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_gc: Option<DateTime<Utc>>,
}

impl Counters {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            total_size: 0,
            entry_count: 0,
            hit_count: 0,
            miss_count: 0,
            eviction_count: 0,
            last_modified: now,
            last_gc: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexState {
    version: u32,
    // BTreeMap so serde_json emits entries in fingerprint-sorted order (I6's "fully-written
    // state" requirement covers byte-for-byte determinism, not just field presence)
    entries: BTreeMap<String, CacheEntry>,
    statistics: Counters,
}

impl IndexState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
            statistics: Counters::fresh(now),
        }
    }

    fn recompute_total_size(&mut self) {
        self.statistics.total_size = self.entries.values().map(|e| e.descriptor.size).sum();
        self.statistics.entry_count = self.entries.len() as u64;
    }
}

/// The serialized mapping fingerprint -> entry, with atomic file replace and corruption
/// recovery. All mutation goes through a single mutex (single-writer discipline) so the
/// atomic-replace protocol on disk is never raced by two concurrent writers.
pub struct Index {
    dir: PathBuf,
    state: Mutex<IndexState>,
}

impl Index {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let state = Self::load(&dir).await?;
        Ok(Self {
            dir,
            state: Mutex::new(state),
        })
    }

    async fn load(dir: &Path) -> Result<IndexState, CacheError> {
        let path = dir.join(INDEX_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(IndexState::fresh(Utc::now()));
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<IndexState>(&bytes) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("index.json failed to parse ({:?}), quarantining and starting fresh", e);
                let corrupted = dir.join(INDEX_CORRUPTED_FILE);
                if let Err(e) = tokio::fs::rename(&path, &corrupted).await {
                    error!("failed to quarantine corrupt index: {:?}", e);
                }
                Ok(IndexState::fresh(Utc::now()))
            }
        }
    }

    /// Serializes with sorted keys (via `BTreeMap`) and ISO-8601 timestamps, writes to a sibling
    /// temp file, fsyncs, then atomically replaces the target. On any failure the temp file is
    /// removed and a `StorageFailed` error surfaces — `index.json` must never be left
    /// partially-written.
    async fn save(&self, state: &IndexState) -> Result<(), CacheError> {
        let tmp_path = self.dir.join(INDEX_TMP_FILE);
        let final_path = self.dir.join(INDEX_FILE);

        let write_result: Result<(), CacheError> = async {
            let bytes = serde_json::to_vec_pretty(state)?;
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp_path, &final_path).await?;
            Ok(())
        }
        .await;

        if write_result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        write_result
    }

    /// Inserts or replaces the entry for `fingerprint`. Bumps `entryCount` only on insert — a
    /// fingerprint maps to at most one entry, so a repeat `put` on an already-indexed
    /// fingerprint is a no-op at the engine layer before this is ever reached, but this method
    /// stays idempotent regardless.
    pub async fn put(
        &self,
        fingerprint: &str,
        descriptor: Descriptor,
        metadata: EntryMetadata,
    ) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        state.entries.insert(
            fingerprint.to_string(),
            CacheEntry { descriptor, metadata },
        );
        state.recompute_total_size();
        state.statistics.last_modified = Utc::now();
        self.save(&state).await
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut state = self.state.lock().await;
        let found = state.entries.get(fingerprint).cloned();
        match found {
            Some(mut entry) => {
                entry.metadata.accessed_at = Utc::now();
                state.entries.insert(fingerprint.to_string(), entry.clone());
                state.statistics.hit_count += 1;
                state.statistics.last_modified = Utc::now();
                self.save(&state).await?;
                Ok(Some(entry))
            }
            None => {
                state.statistics.miss_count += 1;
                state.statistics.last_modified = Utc::now();
                self.save(&state).await?;
                Ok(None)
            }
        }
    }

    /// Reads the entry without recording a hit/miss or bumping `accessed_at` — used internally
    /// where the engine needs to inspect an entry without it counting as a lookup (e.g. deciding
    /// whether a fingerprint is already indexed before a `put`).
    pub async fn peek(&self, fingerprint: &str) -> Option<CacheEntry> {
        let state = self.state.lock().await;
        state.entries.get(fingerprint).cloned()
    }

    pub async fn remove(&self, fingerprints: &[String]) -> Result<u64, CacheError> {
        let mut state = self.state.lock().await;
        let mut removed = 0u64;
        for fp in fingerprints {
            if state.entries.remove(fp).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            state.statistics.eviction_count += removed;
            state.recompute_total_size();
            state.statistics.last_modified = Utc::now();
            self.save(&state).await?;
        }
        Ok(removed)
    }

    pub async fn all(&self) -> BTreeMap<String, CacheEntry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn mark_gc_completed(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        state.statistics.last_gc = Some(Utc::now());
        self.save(&state).await
    }

    pub async fn statistics(&self) -> CacheStatistics {
        let state = self.state.lock().await;
        crate::stats::derive(&state.statistics, state.entries.values())
    }

    pub async fn total_size(&self) -> u64 {
        self.state.lock().await.statistics.total_size
    }

    /// Entries ordered ascending by `accessed_at`, tie-broken by ascending `created_at` — the
    /// exact order the LRU evictor consumes.
    pub async fn entries_by_lru(&self) -> Vec<(String, CacheEntry)> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| {
            a.1.metadata
                .accessed_at
                .cmp(&b.1.metadata.accessed_at)
                .then_with(|| a.1.metadata.created_at.cmp(&b.1.metadata.created_at))
        });
        entries
    }

    pub async fn expired_entries(&self, now: DateTime<Utc>) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .filter(|(_, entry)| entry.metadata.is_expired(now))
            .map(|(fp, _)| fp.clone())
            .collect()
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    fn descriptor(size: u64) -> Descriptor {
        Descriptor {
            media_type: "application/vnd.container-build.cache.manifest.v2+json".into(),
            digest: Digest::sha256(format!("{size}").as_bytes()),
            size,
            annotations: Default::default(),
        }
    }

    fn metadata() -> EntryMetadata {
        EntryMetadata {
            created_at: Utc::now(),
            accessed_at: Utc::now(),
            operation_hash: "sha256:aa".into(),
            operation_type: OperationType::Exec,
            platform: Platform::new("linux", "arm64"),
            ttl_seconds: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn put_then_get_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path()).await.unwrap();
        index.put("fp1", descriptor(100), metadata()).await.unwrap();

        assert!(index.get("fp1").await.unwrap().is_some());
        let stats = index.statistics().await;
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_size, 100);
    }

    #[tokio::test]
    async fn get_on_missing_fingerprint_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path()).await.unwrap();
        assert!(index.get("nope").await.unwrap().is_none());
        assert_eq!(index.statistics().await.miss_count, 1);
    }

    #[tokio::test]
    async fn remove_bumps_eviction_count_and_shrinks_size() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path()).await.unwrap();
        index.put("fp1", descriptor(100), metadata()).await.unwrap();
        index.put("fp2", descriptor(200), metadata()).await.unwrap();

        let removed = index.remove(&["fp1".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        let stats = index.statistics().await;
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_size, 200);
        assert_eq!(stats.eviction_count, 1);
    }

    #[tokio::test]
    async fn reopen_recovers_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = Index::open(dir.path()).await.unwrap();
            index.put("fp1", descriptor(50), metadata()).await.unwrap();
        }
        let reopened = Index::open(dir.path()).await.unwrap();
        assert!(reopened.peek("fp1").await.is_some());
    }

    #[tokio::test]
    async fn corrupted_index_is_quarantined_and_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(INDEX_FILE), b"not json at all")
            .await
            .unwrap();

        let index = Index::open(dir.path()).await.unwrap();
        assert!(index.all().await.is_empty());
        assert!(dir.path().join(INDEX_CORRUPTED_FILE).exists());

        // the next put succeeds and index.json contains a coherent, empty-derived state
        index.put("fp1", descriptor(10), metadata()).await.unwrap();
        assert_eq!(index.statistics().await.entry_count, 1);
    }
}
