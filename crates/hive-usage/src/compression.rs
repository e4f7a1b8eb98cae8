//! Payload compression.
//!
//! A batch is JSON-encoded and compressed once by the sender. The broker is
//! asked for no compression of its own, so whatever codec runs here is the
//! one downstream consumers must undo.

use bytes::Bytes;
use flate2::write::GzEncoder;
use std::io::Write;
use std::str::FromStr;

use crate::error::{Result, UsageError};

/// Stateless byte compressor.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Bytes>;

    /// Codec name used in logs.
    fn name(&self) -> &'static str;
}

/// Built-in codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// gzip, default level
    #[default]
    Gzip,
    /// LZ4 block format with the uncompressed size prepended
    Lz4,
}

impl Compressor for Compression {
    fn compress(&self, data: &[u8]) -> Result<Bytes> {
        match self {
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(
                    Vec::with_capacity(data.len() / 4),
                    flate2::Compression::default(),
                );
                encoder
                    .write_all(data)
                    .map_err(|e| UsageError::Compression(e.to_string()))?;
                let compressed = encoder
                    .finish()
                    .map_err(|e| UsageError::Compression(e.to_string()))?;
                Ok(Bytes::from(compressed))
            }
            Compression::Lz4 => Ok(Bytes::from(lz4_flex::compress_prepend_size(data))),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Lz4 => "lz4",
        }
    }
}

impl FromStr for Compression {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(Compression::Gzip),
            "lz4" => Ok(Compression::Lz4),
            other => Err(UsageError::ConfigError(format!(
                "unknown compression codec: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    const SAMPLE: &[u8] = br#"[{"id":"r1","map":{},"operations":[]},{"id":"r2","map":{},"operations":[]}]"#;

    #[test]
    fn test_gzip_is_readable_by_decoder() {
        let compressed = Compression::Gzip.compress(SAMPLE).unwrap();

        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, SAMPLE);
    }

    #[test]
    fn test_lz4_is_readable_by_decoder() {
        let compressed = Compression::Lz4.compress(SAMPLE).unwrap();
        let decompressed = lz4_flex::decompress_size_prepended(&compressed).unwrap();
        assert_eq!(decompressed, SAMPLE);
    }

    #[test]
    fn test_gzip_shrinks_repetitive_input() {
        let input = SAMPLE.repeat(200);
        let compressed = Compression::Gzip.compress(&input).unwrap();
        assert!(compressed.len() < input.len() / 10);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("LZ4".parse::<Compression>().unwrap(), Compression::Lz4);
        assert!(matches!(
            "zstd".parse::<Compression>(),
            Err(UsageError::ConfigError(_))
        ));
        assert_eq!(Compression::default().name(), "gzip");
    }
}
