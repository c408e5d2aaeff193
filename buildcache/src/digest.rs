use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha384, Sha512};

use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    fn tag(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    fn byte_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    fn from_tag(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(DigestAlgorithm::Sha256),
            "sha384" => Some(DigestAlgorithm::Sha384),
            "sha512" => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }
}

/// A content digest: an algorithm tag paired with a fixed-length byte string. Printed as
/// `<algo>:<hex>`. Equality is value-wise; construction validates length and hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    bytes: Vec<u8>,
}

impl Digest {
    pub fn new(algorithm: DigestAlgorithm, bytes: Vec<u8>) -> Result<Self, CacheError> {
        if bytes.len() != algorithm.byte_len() {
            return Err(CacheError::BadDigest);
        }
        Ok(Self { algorithm, bytes })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sha256(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data.as_ref());
        Self {
            algorithm: DigestAlgorithm::Sha256,
            bytes: hasher.finalize().to_vec(),
        }
    }

    pub fn sha384(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha384::new();
        hasher.update(data.as_ref());
        Self {
            algorithm: DigestAlgorithm::Sha384,
            bytes: hasher.finalize().to_vec(),
        }
    }

    pub fn sha512(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(data.as_ref());
        Self {
            algorithm: DigestAlgorithm::Sha512,
            bytes: hasher.finalize().to_vec(),
        }
    }

    // blobs/<algo>/<hex>, the layout peoci::ocidir reads back (blobs/sha256/<digest>)
    pub fn as_blob_path(&self) -> String {
        format!("{}/{}", self.algorithm.tag(), hex::encode(&self.bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.tag(), hex::encode(&self.bytes))
    }
}

impl FromStr for Digest {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hexpart) = s.split_once(':').ok_or(CacheError::BadDigest)?;
        let algorithm = DigestAlgorithm::from_tag(algo).ok_or(CacheError::BadDigest)?;
        let bytes = hex::decode(hexpart).map_err(|_| CacheError::BadDigest)?;
        Digest::new(algorithm, bytes)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
