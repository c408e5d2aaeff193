use std::io;

// Error kinds per the cache's error-handling design. Most variants never cross the public
// BuildCache boundary: get/put/has absorb them and log instead (see engine.rs).
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    ItemNotFound,
    ManifestUnreadable(#[from] serde_json::Error),
    DigestMismatch,
    StorageFailed(#[from] io::Error),
    Errno(#[from] rustix::io::Errno),
    EncodingFailed,
    BadDigest,
    UnhandledCompression(String),
    UnsupportedEvictionPolicy(&'static str),
}

// how wrong is this? kept intentionally terse, matching the Debug-as-Display idiom used
// throughout the rest of the workspace's error types
impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
