//! `.sync` sidecar files for resumable downloads.
//!
//! A download writes into `<name>.sync` next to the target. After every
//! partial chunk a 16-byte marker (`SYNCMARK` + big-endian i64 offset) is
//! written right after the data, stating that `[0, offset)` is confirmed.
//! The next chunk overwrites the marker. On completion the sidecar is cut
//! to the source size, renamed over the target and stamped with the
//! source's mtime.

use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::filetime_from_millis;

pub const SIDECAR_EXTENSION: &str = "sync";
pub const MARKER_MAGIC: &[u8; 8] = b"SYNCMARK";
pub const MARKER_LEN: u64 = 16;

const CHECKSUM_BUFFER: usize = 64 * 1024;

/// A chunk that would leave a gap in (or rewrite the middle of) a sidecar.
#[derive(Debug, Error)]
#[error("chunk at {position} does not continue {path:?}, confirmed up to {confirmed}")]
pub struct Misaligned {
    pub path: PathBuf,
    pub position: i64,
    /// Where the next chunk has to start
    pub confirmed: i64,
}

/// `<local>.sync`
pub fn sidecar_path(local: &Path) -> PathBuf {
    let mut name = local
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(OsString::new);
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    local.with_file_name(name)
}

pub fn is_sidecar(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == SIDECAR_EXTENSION)
}

pub fn encode_marker(offset: i64) -> [u8; MARKER_LEN as usize] {
    let mut marker = [0u8; MARKER_LEN as usize];
    marker[..8].copy_from_slice(MARKER_MAGIC);
    marker[8..].copy_from_slice(&offset.to_be_bytes());
    marker
}

/// Offset stated by the trailing marker, if the sidecar ends with a valid one.
pub async fn read_marker(sidecar: &Path) -> Result<Option<i64>> {
    let mut file = File::open(sidecar)
        .await
        .with_context(|| format!("Failed to open {}", sidecar.display()))?;
    let len = file.metadata().await?.len();
    if len < MARKER_LEN {
        return Ok(None);
    }

    file.seek(SeekFrom::Start(len - MARKER_LEN)).await?;
    let mut trailer = [0u8; MARKER_LEN as usize];
    file.read_exact(&mut trailer).await?;

    if &trailer[..8] != MARKER_MAGIC {
        return Ok(None);
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&trailer[8..]);
    let offset = i64::from_be_bytes(raw);

    // The marker sits right after the confirmed bytes.
    if offset < 0 || offset as u64 != len - MARKER_LEN {
        return Ok(None);
    }
    Ok(Some(offset))
}

/// CRC32 of the first `len` bytes of `path`.
pub async fn checksum_prefix(path: &Path, len: u64) -> Result<u32> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; CHECKSUM_BUFFER];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            anyhow::bail!(
                "{} is shorter than {} bytes",
                path.display(),
                len
            );
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hasher.finalize())
}

/// Where a previous download of this sidecar stopped, with the CRC32 of
/// everything before that point.
pub async fn resume_point(sidecar: &Path) -> Result<Option<(i64, u32)>> {
    match read_marker(sidecar).await? {
        Some(offset) => {
            let crc = checksum_prefix(sidecar, offset as u64).await?;
            Ok(Some((offset, crc)))
        }
        None => Ok(None),
    }
}

/// Bytes of the sidecar backed by its marker; 0 when the sidecar is
/// missing or carries no valid marker.
pub async fn confirmed_offset(sidecar: &Path) -> Result<i64> {
    match fs::metadata(sidecar).await {
        Ok(_) => Ok(read_marker(sidecar).await?.unwrap_or(0)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", sidecar.display())),
    }
}

/// Write `data` at `position`. Unless `last`, a marker for
/// `position + data.len()` follows it.
///
/// `position` must be 0 (start over) or the sidecar's confirmed offset;
/// anything else fails with [`Misaligned`] and writes nothing.
pub async fn write_chunk(sidecar: &Path, position: i64, data: &[u8], last: bool) -> Result<()> {
    if position != 0 {
        let confirmed = confirmed_offset(sidecar).await?;
        if position != confirmed {
            return Err(Misaligned {
                path: sidecar.to_path_buf(),
                position,
                confirmed,
            }
            .into());
        }
    }

    if let Some(parent) = sidecar.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(sidecar)
        .await
        .with_context(|| format!("Failed to open {}", sidecar.display()))?;

    file.seek(SeekFrom::Start(position as u64)).await?;
    file.write_all(data).await?;
    if !last {
        let end = position + data.len() as i64;
        file.write_all(&encode_marker(end)).await?;
        file.set_len(end as u64 + MARKER_LEN).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Cut the sidecar to `total_size`, move it over `target` and give it the
/// source mtime.
pub async fn finalize(sidecar: &Path, target: &Path, total_size: i64, modify_time: i64) -> Result<()> {
    {
        let file = OpenOptions::new()
            .write(true)
            .open(sidecar)
            .await
            .with_context(|| format!("Failed to open {}", sidecar.display()))?;
        file.set_len(total_size.max(0) as u64).await?;
        file.sync_all().await?;
    }

    fs::rename(sidecar, target).await.with_context(|| {
        format!(
            "Failed to rename {} -> {}",
            sidecar.display(),
            target.display()
        )
    })?;

    filetime::set_file_mtime(target, filetime_from_millis(modify_time))
        .with_context(|| format!("Failed to set mtime on {}", target.display()))?;
    Ok(())
}

/// Remove a sidecar if it exists.
pub async fn discard(sidecar: &Path) -> Result<()> {
    match fs::remove_file(sidecar).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", sidecar.display())),
    }
}
