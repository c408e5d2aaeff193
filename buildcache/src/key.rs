use crate::digest::Digest;
use crate::platform::Platform;

/// The logical identity of a cacheable operation: an operation digest, its input digests (order
/// is not meaningful — the cache sorts them before fingerprinting), and the target platform.
#[derive(Debug, Clone)]
pub struct CacheKey {
    pub operation_digest: Digest,
    pub input_digests: Vec<Digest>,
    pub platform: Platform,
}

impl CacheKey {
    pub fn new(operation_digest: Digest, input_digests: Vec<Digest>, platform: Platform) -> Self {
        Self {
            operation_digest,
            input_digests,
            platform,
        }
    }

    pub fn sorted_input_digests(&self) -> Vec<&Digest> {
        let mut refs: Vec<&Digest> = self.input_digests.iter().collect();
        refs.sort();
        refs
    }
}
