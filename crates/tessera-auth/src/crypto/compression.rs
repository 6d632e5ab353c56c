//! Deflate helpers.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use super::CryptoError;

/// Upper bound on inflated size.
const MAX_INFLATED_LEN: u64 = 16 * 1024 * 1024;

/// Deflates `data` at the default level.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CryptoError::Compression(e.to_string()))
}

/// Inflates `data`, refusing output larger than 16 MiB.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    DeflateDecoder::new(data)
        .take(MAX_INFLATED_LEN + 1)
        .read_to_end(&mut out)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    if out.len() as u64 > MAX_INFLATED_LEN {
        return Err(CryptoError::Compression("inflated payload too large".into()));
    }
    Ok(out)
}

/// Deflates `data` only if that makes it smaller.
///
/// Returns the bytes to store, whether they are compressed, and the ratio of
/// stored size to original size.
pub fn compress_if_smaller(data: Vec<u8>) -> Result<(Vec<u8>, bool, f64), CryptoError> {
    let original = data.len();
    let compressed = deflate(&data)?;
    if compressed.len() < original {
        let ratio = compressed.len() as f64 / original as f64;
        Ok((compressed, true, ratio))
    } else {
        Ok((data, false, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_inflate() {
        let data = b"read write read write read write read write".repeat(8);
        let packed = deflate(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(inflate(&packed).unwrap(), data);
    }

    #[test]
    fn test_compress_if_smaller_skips_random_data() {
        use rand::RngCore;
        let mut data = vec![0u8; 256];
        rand::thread_rng().fill_bytes(&mut data);

        let (stored, compressed, ratio) = compress_if_smaller(data.clone()).unwrap();
        assert!(!compressed);
        assert_eq!(ratio, 1.0);
        assert_eq!(stored, data);
    }

    #[test]
    fn test_compress_if_smaller_compresses_repetitive_data() {
        let data = vec![b'a'; 1024];
        let (stored, compressed, ratio) = compress_if_smaller(data).unwrap();
        assert!(compressed);
        assert!(ratio < 0.5);
        assert_eq!(inflate(&stored).unwrap(), vec![b'a'; 1024]);
    }

    #[test]
    fn test_inflate_rejects_garbage() {
        assert!(inflate(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
