//! Archive codec: pack a set of paths into a content-addressed tar, and the
//! inverse. Pure with respect to any backend or index state — everything
//! here operates on local paths only.

use crate::compression;
use crate::types::{CompressionMethod, CompressionPolicy, ResolvedCompression};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use strata_core::{Error, Result};
use tracing::debug;

/// Outcome of [`create_archive`].
#[derive(Debug, Clone)]
pub struct CreatedArchive {
    pub archive_path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub compression: CompressionMethod,
}

/// A `Write` that feeds every byte through a running SHA-256 digest.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Removes the path it guards on drop, unless [`TempTarGuard::disarm`] was
/// called. Keeps the "temp tar removed on all exit paths" invariant true
/// without duplicating cleanup code at every early return.
struct TempTarGuard {
    path: PathBuf,
    armed: bool,
}

impl TempTarGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempTarGuard {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Expand glob-style patterns against `working_dir`, returning deduplicated
/// `(archive_name, absolute_path)` pairs. Order is unspecified; callers that
/// need determinism (we do, for the content hash) should sort the result.
fn resolve_paths(paths: &[String], working_dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut seen = std::collections::BTreeMap::new();

    for pattern in paths {
        let pattern_path = Path::new(pattern);
        let absolute_pattern = if pattern_path.is_absolute() {
            pattern_path.to_path_buf()
        } else {
            working_dir.join(pattern_path)
        };

        let pattern_str = absolute_pattern.to_string_lossy().into_owned();
        let has_glob_metachars = pattern_str.contains(['*', '?', '[']);

        if has_glob_metachars {
            let matches = glob::glob(&pattern_str)
                .map_err(|e| Error::InvalidInput(format!("invalid glob pattern {pattern:?}: {e}")))?;
            for entry in matches {
                let abs = entry
                    .map_err(|e| Error::Internal(format!("glob read error: {e}")))?;
                let name = abs.strip_prefix(working_dir).unwrap_or(&abs).to_path_buf();
                seen.insert(name.clone(), abs);
            }
        } else if absolute_pattern.exists() {
            let name = absolute_pattern
                .strip_prefix(working_dir)
                .unwrap_or(&absolute_pattern)
                .to_path_buf();
            seen.insert(name, absolute_pattern);
        }
    }

    Ok(seen.into_iter().collect())
}

/// Pack `paths` (glob patterns resolved against `working_dir`) into a fresh
/// archive under `archive_dir`, named `sha256-<16hex>.<ext>` by the SHA-256
/// of the uncompressed tar contents.
pub fn create_archive(
    paths: &[String],
    archive_dir: &Path,
    working_dir: Option<&Path>,
    policy: CompressionPolicy,
) -> Result<CreatedArchive> {
    let working_dir = match working_dir {
        Some(d) => d.to_path_buf(),
        None => std::env::current_dir().map_err(Error::Io)?,
    };

    let resolved = resolve_paths(paths, &working_dir)?;
    if resolved.is_empty() {
        return Err(Error::NoFilesToCache);
    }

    let compression = compression::resolve_compression_method(policy)?;

    std::fs::create_dir_all(archive_dir).map_err(Error::Io)?;
    let temp_name = format!(".tmp-archive-{}-{}.tar", std::process::id(), temp_suffix());
    let temp_path = archive_dir.join(temp_name);
    let guard = TempTarGuard::new(temp_path.clone());

    let hash = {
        let file = File::create(&temp_path).map_err(Error::Io)?;
        let mut hashing = HashingWriter {
            inner: BufWriter::new(file),
            hasher: Sha256::new(),
        };
        {
            let mut builder = tar::Builder::new(&mut hashing);
            for (name, abs_path) in &resolved {
                append_entry(&mut builder, name, abs_path)?;
            }
            builder
                .finish()
                .map_err(|e| Error::Internal(format!("failed to finish tar: {e}")))?;
        }
        hashing.flush().map_err(Error::Io)?;
        hex::encode(&hashing.hasher.finalize()[..8])
    };

    let final_path = archive_dir.join(format!("sha256-{hash}.{}", compression.method.extension()));
    let size_bytes = compress_temp_tar(&temp_path, &final_path, compression)?;

    guard.disarm();
    let _ = std::fs::remove_file(&temp_path);

    debug!(
        archive = %final_path.display(),
        files = resolved.len(),
        size_bytes,
        "created archive"
    );

    Ok(CreatedArchive {
        archive_path: final_path,
        hash,
        size_bytes,
        compression: compression.method,
    })
}

fn temp_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

fn append_entry<W: Write>(builder: &mut tar::Builder<W>, name: &Path, abs_path: &Path) -> Result<()> {
    if abs_path.is_dir() {
        builder
            .append_dir_all(name, abs_path)
            .map_err(|e| Error::Internal(format!("failed to pack dir {}: {e}", abs_path.display())))
    } else {
        builder
            .append_path_with_name(abs_path, name)
            .map_err(|e| Error::Internal(format!("failed to pack file {}: {e}", abs_path.display())))
    }
}

fn compress_temp_tar(temp_tar: &Path, final_path: &Path, resolved: ResolvedCompression) -> Result<u64> {
    let reader = BufReader::new(File::open(temp_tar).map_err(Error::Io)?);
    let writer = BufWriter::new(File::create(final_path).map_err(Error::Io)?);
    let mut enc = compression::encoder(writer, resolved)?;
    let mut reader = reader;
    std::io::copy(&mut reader, &mut enc).map_err(Error::Io)?;
    let mut writer = enc.finish()?;
    writer.flush().map_err(Error::Io)?;
    drop(writer);
    Ok(std::fs::metadata(final_path).map_err(Error::Io)?.len())
}

/// Infer the compression method an archive was written with from its
/// filename extension.
pub fn infer_compression(archive_path: &Path) -> Result<CompressionMethod> {
    let name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput("archive path has no file name".to_string()))?;

    if name.ends_with(".tar.zst") {
        Ok(CompressionMethod::Zstd)
    } else if name.ends_with(".tar.gz") {
        Ok(CompressionMethod::Gzip)
    } else if name.ends_with(".tar") {
        Ok(CompressionMethod::None)
    } else {
        Err(Error::InvalidInput(format!(
            "cannot infer compression from archive name {name:?}"
        )))
    }
}

/// Extract an archive into `target_dir`, inferring its codec from the file
/// extension. Streams end to end: never buffers the whole archive.
pub fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<()> {
    let method = infer_compression(archive_path)?;
    std::fs::create_dir_all(target_dir).map_err(Error::Io)?;

    let file = BufReader::new(File::open(archive_path).map_err(Error::Io)?);
    let decoder = compression::decoder(file, method)?;
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(target_dir)
        .map_err(|e| Error::Internal(format!("failed to unpack archive: {e}")))?;

    debug!(archive = %archive_path.display(), target = %target_dir.display(), "extracted archive");
    Ok(())
}
