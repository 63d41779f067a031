use crate::config::MAX_BODY_SIZE;
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Compression step applied to bodies flagged `COMPRESSED`.
///
/// `None` keeps the step in the pipeline without transforming anything; both
/// peers must agree on the kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    None,
    Lz4,
    Zstd,
}

/// Maximum output size for decompression (aligned with MAX_BODY_SIZE)
const MAX_DECOMPRESSION_SIZE: usize = MAX_BODY_SIZE;

/// Compresses data using the specified compression algorithm
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if compression fails
pub fn compress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, 1)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompresses data that was compressed with the specified algorithm
///
/// Output is capped at MAX_BODY_SIZE to reject decompression bombs.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if decompression fails or the
/// output would exceed the cap
pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Lz4 => {
            if data.len() < 4 {
                return Err(ProtocolError::DecompressionFailure);
            }

            // lz4_flex prepends the uncompressed size as u32 LE
            let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed_size > MAX_DECOMPRESSION_SIZE {
                return Err(ProtocolError::DecompressionFailure);
            }

            lz4_flex::decompress_size_prepended(data)
                .map_err(|_| ProtocolError::DecompressionFailure)
        }
        CompressionKind::Zstd => {
            use std::io::Read;

            let mut out = Vec::new();
            let mut reader = zstd::stream::Decoder::new(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;

            let mut buffer = [0u8; 8192];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        out.extend_from_slice(&buffer[..n]);
                        if out.len() > MAX_DECOMPRESSION_SIZE {
                            return Err(ProtocolError::DecompressionFailure);
                        }
                    }
                    Err(_) => return Err(ProtocolError::DecompressionFailure),
                }
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_none_is_identity() {
        let data = b"left untouched";
        assert_eq!(compress(data, CompressionKind::None).unwrap(), data);
        assert_eq!(decompress(data, CompressionKind::None).unwrap(), data);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_lz4_compression_roundtrip() {
        let original = vec![3u8; 4096];
        let compressed = compress(&original, CompressionKind::Lz4).unwrap();
        assert!(compressed.len() < original.len());
        assert_eq!(decompress(&compressed, CompressionKind::Lz4).unwrap(), original);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zstd_compression_roundtrip() {
        let original = b"Hello, World! Hello, World! Hello, World!";
        let compressed = compress(original, CompressionKind::Zstd).unwrap();
        assert_eq!(
            decompress(&compressed, CompressionKind::Zstd).unwrap(),
            original
        );
    }

    #[test]
    fn test_lz4_claimed_size_limit() {
        let claimed_size = (MAX_DECOMPRESSION_SIZE + 1) as u32;
        let mut malicious = claimed_size.to_le_bytes().to_vec();
        malicious.extend_from_slice(&[0u8; 16]);
        assert!(decompress(&malicious, CompressionKind::Lz4).is_err());
    }

    #[test]
    fn test_lz4_short_input_rejection() {
        assert!(decompress(&[0x2b, 0x60], CompressionKind::Lz4).is_err());
    }
}
