//! Local retention: delete synced files that arrived before a horizon.
//!
//! Age is measured from when a file landed on this machine, never from its
//! mtime. A finalized download carries the server's mtime, which may be
//! years old on a file fetched a minute ago.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tracing::{debug, warn};

use crate::paths::plain_walk;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionStats {
    pub files_removed: u64,
    pub dirs_removed: u64,
    pub bytes_freed: u64,
}

/// Remove files under `root` that arrived before `now - days`, then every
/// directory left empty. `root` itself is kept. Blocking; run it on the
/// blocking pool.
pub fn purge_older_than(root: &Path, days: u32, now: SystemTime) -> Result<RetentionStats> {
    let mut stats = RetentionStats::default();
    if !root.exists() {
        return Ok(stats);
    }

    let horizon = now
        .checked_sub(Duration::from_secs(u64::from(days) * 86_400))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut dirs: Vec<PathBuf> = Vec::new();

    for entry in plain_walk(root) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Retention walk error: {}", e);
                continue;
            }
        };
        let path = entry.path();
        let Some(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            if path != root {
                dirs.push(path.to_path_buf());
            }
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("Cannot stat {}: {}", path.display(), e);
                continue;
            }
        };
        let arrived = arrived_at(&meta).unwrap_or(now);
        if arrived < horizon {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    debug!("Retention removed {}", path.display());
                    stats.files_removed += 1;
                    stats.bytes_freed += meta.len();
                }
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }

    // deepest first so parents empty out after their children
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        let empty = std::fs::read_dir(&dir)
            .map(|mut it| it.next().is_none())
            .unwrap_or(false);
        if empty && std::fs::remove_dir(&dir).is_ok() {
            stats.dirs_removed += 1;
        }
    }

    Ok(stats)
}

/// When the file appeared locally: its birth time where the filesystem
/// records one, otherwise its inode change time. Renaming a sidecar into
/// place and stamping the remote mtime both leave these alone or move
/// them forward.
fn arrived_at(meta: &Metadata) -> Option<SystemTime> {
    meta.created().ok().or_else(|| changed_at(meta))
}

#[cfg(unix)]
fn changed_at(meta: &Metadata) -> Option<SystemTime> {
    use std::os::unix::fs::MetadataExt;

    let secs = u64::try_from(meta.ctime()).ok()?;
    let nanos = u32::try_from(meta.ctime_nsec()).ok()?;
    SystemTime::UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
}

#[cfg(not(unix))]
fn changed_at(_meta: &Metadata) -> Option<SystemTime> {
    None
}
