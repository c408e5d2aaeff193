use std::path::PathBuf;

use crate::compression::Algorithm;

/// Eviction policies recognized by configuration. Only `Lru` is implemented; the others are
/// reserved so a config value round-trips without silently aliasing to LRU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
    Ttl,
    Arc,
}

impl EvictionPolicy {
    pub fn is_implemented(self) -> bool {
        matches!(self, EvictionPolicy::Lru)
    }

    pub fn name(self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
            EvictionPolicy::Fifo => "fifo",
            EvictionPolicy::Ttl => "ttl",
            EvictionPolicy::Arc => "arc",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub algorithm: Algorithm,
    pub level: i32,
    pub min_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Gzip,
            level: 6,
            min_size: 512,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub max_concurrent_reads: Option<usize>,
    pub max_concurrent_writes: Option<usize>,
    pub max_concurrent_evictions: Option<usize>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reads: None,
            max_concurrent_writes: None,
            max_concurrent_evictions: None,
        }
    }
}

/// Recognized cache configuration. Built with the same chained-setter + `build()`-terminal
/// shape as `peoci::ocidist_cache::ClientBuilder`.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub index_path: PathBuf,
    pub max_size: u64,
    pub max_age: Option<std::time::Duration>,
    pub compression: CompressionConfig,
    pub eviction_policy: EvictionPolicy,
    pub concurrency: ConcurrencyConfig,
    pub verify_integrity: bool,
    pub gc_interval: std::time::Duration,
    pub cache_key_version: String,
    pub default_ttl: Option<std::time::Duration>,
    pub build_version: String,
}

pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfig {
    pub fn builder(index_path: impl Into<PathBuf>) -> CacheConfigBuilder {
        CacheConfigBuilder {
            config: CacheConfig {
                index_path: index_path.into(),
                max_size: 10_000_000_000,
                max_age: None,
                compression: CompressionConfig::default(),
                eviction_policy: EvictionPolicy::Lru,
                concurrency: ConcurrencyConfig::default(),
                verify_integrity: false,
                gc_interval: std::time::Duration::from_secs(300),
                cache_key_version: "v1".to_string(),
                default_ttl: None,
                build_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    /// Applies `BUILDCACHE_*` environment overrides on top of an already-built config. This is
    /// plumbing a host binary may opt into, not a CLI surface — just env var conveniences, the
    /// same way `peimage-service::main` reads `PEOCI_CACHE`/`PEOCI_AUTH` from the environment.
    pub fn from_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("BUILDCACHE_MAX_SIZE") {
            if let Ok(parsed) = v.parse() {
                self.max_size = parsed;
            }
        }
        if let Ok(v) = std::env::var("BUILDCACHE_KEY_VERSION") {
            self.cache_key_version = v;
        }
        if let Ok(v) = std::env::var("BUILDCACHE_GC_INTERVAL_SECS") {
            if let Ok(parsed) = v.parse() {
                self.gc_interval = std::time::Duration::from_secs(parsed);
            }
        }
        self
    }
}

impl CacheConfigBuilder {
    pub fn max_size(mut self, bytes: u64) -> Self {
        self.config.max_size = bytes;
        self
    }

    pub fn max_age(mut self, age: std::time::Duration) -> Self {
        self.config.max_age = Some(age);
        self
    }

    pub fn compression(mut self, compression: CompressionConfig) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.config.eviction_policy = policy;
        self
    }

    pub fn concurrency(mut self, concurrency: ConcurrencyConfig) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn verify_integrity(mut self, verify: bool) -> Self {
        self.config.verify_integrity = verify;
        self
    }

    pub fn gc_interval(mut self, interval: std::time::Duration) -> Self {
        self.config.gc_interval = interval;
        self
    }

    pub fn cache_key_version(mut self, version: impl Into<String>) -> Self {
        self.config.cache_key_version = version.into();
        self
    }

    pub fn default_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.config.default_ttl = Some(ttl);
        self
    }

    pub fn build_version(mut self, version: impl Into<String>) -> Self {
        self.config.build_version = version.into();
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}
