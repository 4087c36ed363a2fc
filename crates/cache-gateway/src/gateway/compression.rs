//! Transparent value compression
//!
//! Large values are stored as `gz:` followed by base64 of the gzip stream.
//! Reads always run through [`decompress`], which passes unmarked values
//! through untouched, so compressed and plain values can coexist.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

use crate::gateway::error::{GatewayError, GatewayResult};

/// Marker prefix of compressed values
pub const COMPRESSION_MARKER: &str = "gz:";

/// Default size above which values are compressed
pub const DEFAULT_THRESHOLD: usize = 1024;

/// Whether `value` should be compressed before storing
pub fn should_compress(value: &str, enabled: bool, threshold: usize) -> bool {
    enabled && value.len() > threshold
}

/// Whether `value` carries the compression marker
pub fn is_marked(value: &str) -> bool {
    value.starts_with(COMPRESSION_MARKER)
}

/// Compressed form of a value and the bytes saved (negative if it grew)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    pub value: String,
    pub savings: i64,
}

pub fn compress(value: &str) -> GatewayResult<Compressed> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(value.as_bytes())
        .map_err(|e| GatewayError::server(format!("Compression failed: {}", e)))?;
    let bytes = encoder
        .finish()
        .map_err(|e| GatewayError::server(format!("Compression failed: {}", e)))?;

    let encoded = format!("{}{}", COMPRESSION_MARKER, STANDARD.encode(bytes));
    let savings = value.len() as i64 - encoded.len() as i64;
    Ok(Compressed {
        value: encoded,
        savings,
    })
}

/// Reverse [`compress`]; values without the marker are returned as-is
pub fn decompress(value: &str) -> GatewayResult<String> {
    let Some(payload) = value.strip_prefix(COMPRESSION_MARKER) else {
        return Ok(value.to_string());
    };

    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| GatewayError::server(format!("Corrupt compressed value: {}", e)))?;

    let mut out = String::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_string(&mut out)
        .map_err(|e| GatewayError::server(format!("Corrupt compressed value: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_exclusive() {
        let at = "x".repeat(DEFAULT_THRESHOLD);
        let above = "x".repeat(DEFAULT_THRESHOLD + 1);
        assert!(!should_compress(&at, true, DEFAULT_THRESHOLD));
        assert!(should_compress(&above, true, DEFAULT_THRESHOLD));
        assert!(!should_compress(&above, false, DEFAULT_THRESHOLD));
    }

    #[test]
    fn test_large_value_round_trip() {
        let original = "lorem ipsum dolor sit amet ".repeat(100);
        let compressed = compress(&original).unwrap();

        assert!(compressed.value.starts_with(COMPRESSION_MARKER));
        assert!(compressed.savings > 0);
        assert_eq!(decompress(&compressed.value).unwrap(), original);
    }

    #[test]
    fn test_unmarked_value_passes_through() {
        assert_eq!(decompress("dark").unwrap(), "dark");
        assert_eq!(decompress("").unwrap(), "");
    }

    #[test]
    fn test_savings_may_be_negative() {
        let compressed = compress("ab").unwrap();
        assert!(compressed.savings < 0);
        assert_eq!(decompress(&compressed.value).unwrap(), "ab");
    }

    #[test]
    fn test_marker_detection() {
        assert!(is_marked("gz:hello"));
        assert!(!is_marked("gzip"));
        assert!(is_marked(&compress("hello").unwrap().value));
    }

    #[test]
    fn test_corrupt_payload_is_server_error() {
        let err = decompress("gz:not-base64!!").unwrap_err();
        assert!(err.is_backend_failure());

        let err = decompress(&format!("gz:{}", STANDARD.encode(b"not gzip"))).unwrap_err();
        assert!(matches!(err, GatewayError::Server { .. }));
    }
}
