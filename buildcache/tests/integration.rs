use std::time::Duration;

use buildcache::{
    BuildCache, CacheConfig, CacheKey, CachedResult, Digest, EnvValue, EvictionPolicy,
    OperationType, Platform, Snapshot,
};

fn platform() -> Platform {
    Platform::new("linux", "arm64")
}

fn key(op_seed: &[u8], inputs: Vec<Digest>) -> CacheKey {
    CacheKey::new(Digest::sha256(op_seed), inputs, platform())
}

fn trivial_result(snapshot_seed: &[u8], size: u64) -> CachedResult {
    CachedResult::new(Snapshot {
        digest: Digest::sha256(snapshot_seed),
        size,
    })
}

/// Round-trips a trivial snapshot through put then get.
#[tokio::test]
async fn round_trips_a_trivial_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BuildCache::open(CacheConfig::builder(dir.path()).build()).await.unwrap();

    let k = key(&[0xaa; 32], vec![]);
    let result = trivial_result(&[0xbb; 32], 1024);

    cache.put(result.clone(), &k, OperationType::Exec).await;
    let fetched = cache.get(&k, OperationType::Exec).await.unwrap();

    assert_eq!(fetched.snapshot.digest, Digest::sha256([0xbb; 32]));
    assert_eq!(fetched.snapshot.size, 1024);
    assert!(fetched.environment_changes.is_empty());
    assert!(fetched.metadata_changes.is_empty());

    cache.shutdown().await;
}

/// Permuting input digests does not change the fingerprint.
#[tokio::test]
async fn input_permutation_shares_a_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BuildCache::open(CacheConfig::builder(dir.path()).build()).await.unwrap();

    let d1 = Digest::sha256(b"input-a");
    let d2 = Digest::sha256(b"input-b");
    let k1 = key(b"op", vec![d1.clone(), d2.clone()]);
    let k2 = key(b"op", vec![d2, d1]);

    cache.put(trivial_result(b"snap", 10), &k1, OperationType::Filesystem).await;

    assert!(cache.has(&k2).await);
    assert!(cache.get(&k2, OperationType::Filesystem).await.is_some());

    cache.shutdown().await;
}

/// Scenario 3: bumping the configured cache-key version invalidates previously indexed keys.
#[tokio::test]
async fn key_version_bump_invalidates_existing_entries() {
    let dir = tempfile::tempdir().unwrap();
    let k = key(b"op", vec![]);

    {
        let cache = BuildCache::open(
            CacheConfig::builder(dir.path()).cache_key_version("v1").build(),
        )
        .await
        .unwrap();
        cache.put(trivial_result(b"snap", 10), &k, OperationType::Image).await;
        assert!(cache.has(&k).await);
        cache.shutdown().await;
    }

    let reopened = BuildCache::open(
        CacheConfig::builder(dir.path()).cache_key_version("v2").build(),
    )
    .await
    .unwrap();
    assert!(!reopened.has(&k).await);
    reopened.shutdown().await;
}

/// A non-trivial result (both maps populated) round-trips, and a repeat put is a no-op.
#[tokio::test]
async fn round_trips_full_result_and_put_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BuildCache::open(CacheConfig::builder(dir.path()).build()).await.unwrap();

    let k = key(b"op-full", vec![Digest::sha256(b"in1")]);
    let mut result = trivial_result(b"snap-full", 2048);
    result
        .environment_changes
        .insert("PATH".to_string(), EnvValue::Single("/usr/bin".to_string()));
    result.metadata_changes.insert("label".to_string(), "v1".to_string());

    cache.put(result.clone(), &k, OperationType::Metadata).await;
    cache.put(result.clone(), &k, OperationType::Metadata).await;

    let stats = cache.statistics().await;
    assert_eq!(stats.entry_count, 1, "repeat put must not create a second entry");

    let fetched = cache.get(&k, OperationType::Metadata).await.unwrap();
    assert_eq!(fetched, result);

    cache.shutdown().await;
}

/// Size-triggered LRU eviction keeps the least-recently-accessed entries gone and total_size
/// under control.
#[tokio::test]
async fn size_pressure_evicts_least_recently_accessed_entries_first() {
    let dir = tempfile::tempdir().unwrap();

    // Discover a single entry's manifest footprint so max_size can be set in proportion to it
    // rather than to an arbitrary guessed constant.
    let probe = BuildCache::open(CacheConfig::builder(dir.path()).max_size(u64::MAX).build())
        .await
        .unwrap();
    probe
        .put(trivial_result(b"probe", 10), &key(b"probe-op", vec![]), OperationType::Exec)
        .await;
    let unit_size = probe.statistics().await.total_size.max(1);
    probe.shutdown().await;

    let sized_dir = tempfile::tempdir().unwrap();
    let max_size = unit_size * 4;
    let cache = BuildCache::open(
        CacheConfig::builder(sized_dir.path()).max_size(max_size).build(),
    )
    .await
    .unwrap();

    for i in 0..8u32 {
        let k = key(format!("op-{i}").as_bytes(), vec![]);
        cache.put(trivial_result(format!("snap-{i}").as_bytes(), 10), &k, OperationType::Exec).await;
        // accessedAt only advances meaningfully with real wall-clock separation
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // size-trigger eviction runs in a spawned background task; give it a moment to finish
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(
        cache.statistics().await.total_size <= max_size,
        "size trigger should have brought total_size back under max_size"
    );
    // the earliest-written entries are the least-recently-accessed ones and should be gone
    assert!(!cache.has(&key(b"op-0", vec![])).await);
    assert!(cache.has(&key(b"op-7", vec![])).await);

    cache.shutdown().await;
}

/// An expired entry is gone after the next GC tick.
#[tokio::test]
async fn ttl_expired_entry_is_removed_by_background_gc() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BuildCache::open(
        CacheConfig::builder(dir.path())
            .default_ttl(Duration::from_secs(1))
            .gc_interval(Duration::from_millis(150))
            .build(),
    )
    .await
    .unwrap();

    let k = key(b"expiring-op", vec![]);
    cache.put(trivial_result(b"snap", 10), &k, OperationType::Exec).await;
    assert!(cache.has(&k).await);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(!cache.has(&k).await);
    cache.shutdown().await;
}

/// A corrupted index.json is quarantined and the cache resumes empty.
#[tokio::test]
async fn corrupted_index_is_quarantined_and_cache_keeps_working() {
    let dir = tempfile::tempdir().unwrap();

    {
        let cache = BuildCache::open(CacheConfig::builder(dir.path()).build()).await.unwrap();
        cache
            .put(trivial_result(b"snap", 10), &key(b"op", vec![]), OperationType::Exec)
            .await;
        cache.shutdown().await;
    }

    tokio::fs::write(dir.path().join("index.json"), b"not json").await.unwrap();

    let cache = BuildCache::open(CacheConfig::builder(dir.path()).build()).await.unwrap();
    assert_eq!(cache.statistics().await.entry_count, 0);
    assert!(dir.path().join("index.json.corrupted").exists());

    let k = key(b"new-op", vec![]);
    cache.put(trivial_result(b"snap2", 20), &k, OperationType::Exec).await;
    assert!(cache.has(&k).await);

    cache.shutdown().await;
}

/// Deleting a manifest blob out of band collapses the orphaned index entry on the next get.
#[tokio::test]
async fn orphaned_manifest_collapses_on_get() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BuildCache::open(CacheConfig::builder(dir.path()).build()).await.unwrap();

    let k = key(b"orphan-op", vec![]);
    cache.put(trivial_result(b"snap", 10), &k, OperationType::Exec).await;
    assert!(cache.has(&k).await);

    // simulate external deletion of every blob underneath the cache's store root
    let blobs_root = dir.path().join("blobs-store").join("blobs");
    let mut stack = vec![blobs_root];
    while let Some(d) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&d).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_type().await.unwrap().is_dir() {
                stack.push(entry.path());
            } else {
                tokio::fs::remove_file(entry.path()).await.unwrap();
            }
        }
    }

    assert!(cache.get(&k, OperationType::Exec).await.is_none());
    assert_eq!(cache.statistics().await.entry_count, 0, "orphaned entry must collapse");

    cache.shutdown().await;
}

/// Hit/miss counters and hit rate track exactly the observed traffic.
#[tokio::test]
async fn statistics_track_hits_and_misses_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BuildCache::open(CacheConfig::builder(dir.path()).build()).await.unwrap();

    let k = key(b"tracked-op", vec![]);
    cache.put(trivial_result(b"snap", 10), &k, OperationType::Exec).await;

    for _ in 0..3 {
        assert!(cache.get(&k, OperationType::Exec).await.is_some());
    }
    for _ in 0..2 {
        assert!(cache.get(&key(b"missing-op", vec![]), OperationType::Exec).await.is_none());
    }

    let stats = cache.statistics().await;
    assert_eq!(stats.hit_count, 3);
    assert_eq!(stats.miss_count, 2);
    assert!((stats.hit_rate - 0.6).abs() < 1e-9);

    cache.shutdown().await;
}

/// `evict` explicitly removes an entry and frees its blobs.
#[tokio::test]
async fn explicit_evict_removes_entry_and_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BuildCache::open(CacheConfig::builder(dir.path()).build()).await.unwrap();

    let k = key(b"evict-me", vec![]);
    cache.put(trivial_result(b"snap", 10), &k, OperationType::Exec).await;
    assert!(cache.has(&k).await);

    cache.evict(std::slice::from_ref(&k)).await;

    assert!(!cache.has(&k).await);
    assert_eq!(cache.statistics().await.entry_count, 0);

    cache.shutdown().await;
}

/// Configuring a recognized-but-unimplemented eviction policy must not silently run LRU in its
/// place — `open` refuses so the gap is observable rather than a config value being quietly
/// ignored.
#[tokio::test]
async fn unimplemented_eviction_policy_is_rejected_at_open() {
    let dir = tempfile::tempdir().unwrap();
    let result = BuildCache::open(
        CacheConfig::builder(dir.path())
            .eviction_policy(EvictionPolicy::Fifo)
            .build(),
    )
    .await;

    assert!(result.is_err());
}
