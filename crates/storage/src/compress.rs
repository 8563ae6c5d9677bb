//! Gzip helpers and the compressibility heuristic for the v1 file backend.

use crate::error::{StorageError, StorageResult};
use async_compression::Level;
use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};

/// Payloads at or below this size are never compressed.
pub const MIN_COMPRESS_SIZE: usize = 4096;

/// Smallest possible well-formed gzip file (header + empty deflate + trailer).
const GZIP_MIN_SIZE: u64 = 20;

/// Magic prefixes of formats that are already compressed and would only
/// waste CPU under a second gzip pass.
const INCOMPRESSIBLE_MAGICS: &[&[u8]] = &[
    b"PK\x03\x04",             // ZIP
    b"\xff\xd8\xff",           // JPEG
    b"\x89PNG",                // PNG
    b"GIF8",                   // GIF
    b"ID3",                    // MP3 with ID3 tag
    b"\xff\xfb",               // MP3 frame sync
    b"\x1f\x8b",               // gzip
    b"BZh",                    // bzip2
    b"\xfd7zXZ\x00",           // xz
    b"Rar!",                   // RAR
];

/// Content-sniffing compression decision.
///
/// Small payloads and known-compressed formats are stored as-is; everything
/// else goes through gzip.
pub fn should_compress(data: &[u8]) -> bool {
    if data.len() <= MIN_COMPRESS_SIZE {
        return false;
    }
    !INCOMPRESSIBLE_MAGICS
        .iter()
        .any(|magic| data.starts_with(magic))
}

/// Gzip-compress a buffer at the given level (1-9).
pub async fn gzip_compress(data: &[u8], level: u32) -> StorageResult<Vec<u8>> {
    let mut encoder = GzipEncoder::with_quality(Vec::new(), Level::Precise(level as i32));
    encoder.write_all(data).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

/// Decompress a gzip buffer.
pub async fn gzip_decompress(data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut decoder = GzipDecoder::new(BufReader::new(data));
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).await?;
    Ok(out)
}

/// Read the uncompressed size of a single-stream gzip file from its
/// trailer, without decompressing the payload.
///
/// The last four bytes of a gzip file are the little-endian uncompressed
/// size modulo 2^32. For multi-stream files the trailer only covers the
/// final stream, so the result can be short; that is a known format
/// limitation, logged rather than treated as corruption.
pub async fn gzip_uncompressed_size(path: &Path) -> StorageResult<u64> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| StorageError::from_io(path.display(), e))?;
    let len = file.metadata().await?.len();
    if len < GZIP_MIN_SIZE {
        tracing::warn!(
            path = %path.display(),
            len,
            "gzip file too short for a valid trailer, reporting size 0"
        );
        return Ok(0);
    }

    file.seek(std::io::SeekFrom::End(-4)).await?;
    let mut trailer = [0u8; 4];
    file.read_exact(&mut trailer).await?;
    Ok(u64::from(u32::from_le_bytes(trailer)))
}
