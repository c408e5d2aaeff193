use sha2::{Digest as _, Sha256};

use crate::error::CacheError;
use crate::key::CacheKey;

/// Derives the stable cache-lookup fingerprint for a key.
///
/// `SHA-256(keyVersion ∥ operationDigest.bytes ∥ sortedInputDigests.bytes ∥ canonical(platform))`,
/// rendered `sha256:<hex>`. Deterministic, insensitive to input-digest ordering, sensitive to any
/// change in operation digest, any input digest, the platform tuple, or the key version.
pub fn fingerprint(key: &CacheKey, key_version: &str) -> Result<String, CacheError> {
    // key_version is always a plain configured string; the UTF-8 check only exists because the
    // public contract promises a well-typed encoding error rather than a panic
    if std::str::from_utf8(key_version.as_bytes()).is_err() {
        return Err(CacheError::EncodingFailed);
    }

    let mut hasher = Sha256::new();
    hasher.update(key_version.as_bytes());
    hasher.update(key.operation_digest.bytes());
    for digest in key.sorted_input_digests() {
        hasher.update(digest.bytes());
    }
    hasher.update(key.platform.canonical_json().as_bytes());

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
