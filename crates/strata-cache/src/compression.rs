//! Compression policy resolution and streaming (de)compressors.
//!
//! `resolve_compression_method` turns a caller's [`CompressionPolicy`] into a
//! concrete [`ResolvedCompression`]; [`encoder`]/[`decoder`] then wrap an
//! arbitrary `Write`/`Read` in the right codec so [`crate::archive`] never has
//! to know which one it got.

use crate::types::{CompressionMethod, CompressionPolicy, CompressionRequest, ResolvedCompression};
use std::io::{self, Read, Write};
use strata_core::{Error, Result};
use tracing::warn;

/// Long-distance-matching window, log2(bytes). `--long=30` in the zstd CLI.
const ZSTD_LONG_WINDOW_LOG: u32 = 30;

const ZSTD_LEVEL_RANGE: std::ops::RangeInclusive<i32> = 1..=19;
const GZIP_LEVEL_RANGE: std::ops::RangeInclusive<i32> = 1..=9;
const ZSTD_DEFAULT_LEVEL: i32 = 3;
const GZIP_DEFAULT_LEVEL: i32 = 6;

fn zstd_available() -> bool {
    cfg!(feature = "zstd")
}

/// Resolve `auto` to a concrete method, clamp the level into the method's
/// legal range, and fail if an explicitly-requested method has no encoder.
pub fn resolve_compression_method(policy: CompressionPolicy) -> Result<ResolvedCompression> {
    let method = match policy.method {
        CompressionRequest::Auto => {
            if zstd_available() {
                CompressionMethod::Zstd
            } else {
                CompressionMethod::Gzip
            }
        }
        CompressionRequest::Zstd => {
            if !zstd_available() {
                return Err(Error::CompressionUnavailable("zstd".to_string()));
            }
            CompressionMethod::Zstd
        }
        CompressionRequest::Gzip => CompressionMethod::Gzip,
        CompressionRequest::None => CompressionMethod::None,
    };

    if method == CompressionMethod::None {
        return Ok(ResolvedCompression {
            method,
            level: 0,
            clamped: false,
        });
    }

    let (range, default) = match method {
        CompressionMethod::Zstd => (ZSTD_LEVEL_RANGE, ZSTD_DEFAULT_LEVEL),
        CompressionMethod::Gzip => (GZIP_LEVEL_RANGE, GZIP_DEFAULT_LEVEL),
        CompressionMethod::None => unreachable!("handled above"),
    };

    let requested = policy.level.unwrap_or(default);
    let clamped_level = requested.clamp(*range.start(), *range.end());
    let clamped = clamped_level != requested;
    if clamped {
        warn!(
            method = ?method,
            requested,
            clamped_to = clamped_level,
            "compression level out of range, clamped"
        );
    }

    Ok(ResolvedCompression {
        method,
        level: clamped_level,
        clamped,
    })
}

/// A writer that compresses everything written to it before forwarding to
/// the underlying sink, selected at runtime by [`ResolvedCompression`].
pub enum CompressEncoder<W: Write> {
    #[cfg(feature = "zstd")]
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Gzip(flate2::write::GzEncoder<W>),
    None(W),
}

impl<W: Write> Write for CompressEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(feature = "zstd")]
            CompressEncoder::Zstd(w) => w.write(buf),
            CompressEncoder::Gzip(w) => w.write(buf),
            CompressEncoder::None(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(feature = "zstd")]
            CompressEncoder::Zstd(w) => w.flush(),
            CompressEncoder::Gzip(w) => w.flush(),
            CompressEncoder::None(w) => w.flush(),
        }
    }
}

impl<W: Write> CompressEncoder<W> {
    /// Flush and close the codec frame, returning the underlying writer.
    pub fn finish(self) -> Result<W> {
        match self {
            #[cfg(feature = "zstd")]
            CompressEncoder::Zstd(w) => w
                .finish()
                .map_err(|e| Error::Internal(format!("zstd finish failed: {e}"))),
            CompressEncoder::Gzip(w) => w
                .finish()
                .map_err(|e| Error::Internal(format!("gzip finish failed: {e}"))),
            CompressEncoder::None(w) => Ok(w),
        }
    }
}

/// Build a streaming encoder for `resolved` around `writer`.
pub fn encoder<W: Write>(writer: W, resolved: ResolvedCompression) -> Result<CompressEncoder<W>> {
    match resolved.method {
        CompressionMethod::Zstd => {
            #[cfg(feature = "zstd")]
            {
                let mut enc = zstd::stream::write::Encoder::new(writer, resolved.level)
                    .map_err(|e| Error::Internal(format!("zstd encoder init failed: {e}")))?;
                enc.long_distance_matching(true)
                    .map_err(|e| Error::Internal(format!("zstd long mode failed: {e}")))?;
                enc.window_log(ZSTD_LONG_WINDOW_LOG)
                    .map_err(|e| Error::Internal(format!("zstd window log failed: {e}")))?;
                Ok(CompressEncoder::Zstd(enc))
            }
            #[cfg(not(feature = "zstd"))]
            {
                let _ = writer;
                Err(Error::CompressionUnavailable("zstd".to_string()))
            }
        }
        CompressionMethod::Gzip => Ok(CompressEncoder::Gzip(flate2::write::GzEncoder::new(
            writer,
            flate2::Compression::new(resolved.level as u32),
        ))),
        CompressionMethod::None => Ok(CompressEncoder::None(writer)),
    }
}

/// A reader that decompresses from the underlying source as it is read,
/// selected at runtime by the archive's file-extension-inferred method.
pub enum CompressDecoder<R: Read> {
    #[cfg(feature = "zstd")]
    Zstd(Box<zstd::stream::read::Decoder<'static, io::BufReader<R>>>),
    Gzip(Box<flate2::read::GzDecoder<R>>),
    None(R),
}

impl<R: Read> Read for CompressDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(feature = "zstd")]
            CompressDecoder::Zstd(r) => r.read(buf),
            CompressDecoder::Gzip(r) => r.read(buf),
            CompressDecoder::None(r) => r.read(buf),
        }
    }
}

/// Build a streaming decoder for `method` around `reader`.
pub fn decoder<R: Read>(reader: R, method: CompressionMethod) -> Result<CompressDecoder<R>> {
    match method {
        CompressionMethod::Zstd => {
            #[cfg(feature = "zstd")]
            {
                let mut dec = zstd::stream::read::Decoder::new(reader)
                    .map_err(|e| Error::Internal(format!("zstd decoder init failed: {e}")))?;
                dec.window_log_max(ZSTD_LONG_WINDOW_LOG)
                    .map_err(|e| Error::Internal(format!("zstd window log failed: {e}")))?;
                Ok(CompressDecoder::Zstd(Box::new(dec)))
            }
            #[cfg(not(feature = "zstd"))]
            {
                let _ = reader;
                Err(Error::CompressionUnavailable("zstd".to_string()))
            }
        }
        CompressionMethod::Gzip => Ok(CompressDecoder::Gzip(Box::new(
            flate2::read::GzDecoder::new(reader),
        ))),
        CompressionMethod::None => Ok(CompressDecoder::None(reader)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(method: CompressionMethod, level: i32) {
        let resolved = ResolvedCompression {
            method,
            level,
            clamped: false,
        };
        let data = b"the quick brown fox jumps over the lazy dog".repeat(64);

        let mut enc = encoder(Vec::new(), resolved).unwrap();
        enc.write_all(&data).unwrap();
        let compressed = enc.finish().unwrap();

        let mut dec = decoder(compressed.as_slice(), method).unwrap();
        let mut out = Vec::new();
        dec.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn zstd_roundtrips() {
        roundtrip(CompressionMethod::Zstd, 3);
    }

    #[test]
    fn gzip_roundtrips() {
        roundtrip(CompressionMethod::Gzip, 6);
    }

    #[test]
    fn none_roundtrips() {
        roundtrip(CompressionMethod::None, 0);
    }

    #[test]
    fn auto_resolves_to_zstd_when_available() {
        let resolved = resolve_compression_method(CompressionPolicy::default()).unwrap();
        assert_eq!(resolved.method, CompressionMethod::Zstd);
    }

    #[test]
    fn out_of_range_level_is_clamped_not_rejected() {
        let resolved = resolve_compression_method(CompressionPolicy {
            method: CompressionRequest::Zstd,
            level: Some(99),
        })
        .unwrap();
        assert_eq!(resolved.level, 19);
        assert!(resolved.clamped);
    }

    #[test]
    fn none_method_ignores_supplied_level() {
        let resolved = resolve_compression_method(CompressionPolicy {
            method: CompressionRequest::None,
            level: Some(5),
        })
        .unwrap();
        assert_eq!(resolved.level, 0);
        assert!(!resolved.clamped);
    }
}
