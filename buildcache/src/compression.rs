use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const LZ4_MAGIC: [u8; 4] = *b"LZ4F";

/// Compression algorithms recognized by the manifest's `compression` annotation. `Lz4`/`Zstd`
/// were placeholder stubs in the source this cache is modeled on (see DESIGN.md); both are fully
/// implemented here since the workspace already carries `zstd` and `lzzzz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    None,
    Gzip,
    Lz4,
    Zstd,
}

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::None => "none",
            Algorithm::Gzip => "gzip",
            Algorithm::Lz4 => "lz4",
            Algorithm::Zstd => "zstd",
        }
    }

    /// Media-type suffix, e.g. `+gzip`. `None` carries no suffix.
    pub fn media_type_suffix(self) -> &'static str {
        match self {
            Algorithm::None => "",
            Algorithm::Gzip => "+gzip",
            Algorithm::Lz4 => "+lz4",
            Algorithm::Zstd => "+zstd",
        }
    }
}

/// Compresses `bytes` with `algorithm` at `level`. Payloads smaller than `min_size` are left
/// uncompressed regardless of the requested algorithm — the returned `Algorithm` reflects the
/// bytes actually produced (`None` for that fallback case), never the algorithm the caller asked
/// for, so a caller that labels its output by the returned value never mislabels plain bytes as
/// compressed.
pub fn compress(
    bytes: &[u8],
    algorithm: Algorithm,
    level: i32,
    min_size: usize,
) -> Result<(Vec<u8>, Algorithm), CacheError> {
    if bytes.len() < min_size {
        return Ok((bytes.to_vec(), Algorithm::None));
    }
    match algorithm {
        Algorithm::None => Ok((bytes.to_vec(), Algorithm::None)),
        Algorithm::Gzip => {
            let compression = flate2::Compression::new(level.clamp(0, 9) as u32);
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), compression);
            encoder.write_all(bytes).map_err(CacheError::StorageFailed)?;
            let out = encoder.finish().map_err(CacheError::StorageFailed)?;
            Ok((out, Algorithm::Gzip))
        }
        Algorithm::Zstd => {
            let out = zstd::encode_all(bytes, level).map_err(CacheError::StorageFailed)?;
            Ok((out, Algorithm::Zstd))
        }
        Algorithm::Lz4 => {
            let max_size = lzzzz::lz4::max_compressed_size(bytes.len());
            let mut dst = vec![0u8; max_size];
            let written = lzzzz::lz4::compress(
                bytes,
                &mut dst,
                lzzzz::lz4::ACC_LEVEL_DEFAULT,
            )
            .map_err(|_| CacheError::UnhandledCompression("lz4".into()))?;
            dst.truncate(written);

            let mut framed = Vec::with_capacity(dst.len() + 12);
            framed.extend_from_slice(&LZ4_MAGIC);
            framed.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            framed.extend_from_slice(&dst);
            Ok((framed, Algorithm::Lz4))
        }
    }
}

/// Decompresses `bytes`. Probes the leading magic bytes for gzip/zstd/our lz4 framing; data that
/// matches none of them is assumed already plain and is returned unchanged (the "below threshold"
/// case from `compress`, or genuinely uncompressed input).
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CacheError> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut decoder = flate2::read::GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(CacheError::StorageFailed)?;
        Ok(out)
    } else if bytes.starts_with(&ZSTD_MAGIC) {
        zstd::decode_all(bytes).map_err(CacheError::StorageFailed)
    } else if bytes.starts_with(&LZ4_MAGIC) {
        let len_bytes: [u8; 8] = bytes[4..12]
            .try_into()
            .map_err(|_| CacheError::UnhandledCompression("lz4".into()))?;
        let original_len = u64::from_le_bytes(len_bytes) as usize;
        let mut dst = vec![0u8; original_len];
        lzzzz::lz4::decompress(&bytes[12..], &mut dst)
            .map_err(|_| CacheError::UnhandledCompression("lz4".into()))?;
        Ok(dst)
    } else {
        Ok(bytes.to_vec())
    }
}
