//! Path handling shared by client and server: peer-supplied relative paths
//! are resolved under a root and must never escape it.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SyncError};

/// Resolve a leading `~` component against the home directory. Anything
/// else, `~user` included, is returned as given.
pub fn expand_home(path: &Path) -> PathBuf {
    let mut parts = path.components();
    let home = match parts.next() {
        Some(Component::Normal(first)) if first == "~" => dirs::home_dir(),
        _ => None,
    };
    match home {
        Some(home) if parts.as_path().as_os_str().is_empty() => home,
        Some(home) => home.join(parts.as_path()),
        None => path.to_path_buf(),
    }
}

fn invalid(path: &str, reason: &str) -> SyncError {
    SyncError::InvalidPath {
        path: PathBuf::from(path),
        reason: reason.to_string(),
    }
}

/// Resolve a peer-supplied `/`-separated path under `root`.
///
/// An empty path resolves to `root` itself when `allow_root` is set.
/// Absolute paths, `..` components and Windows prefixes are rejected.
pub fn resolve_under(root: &Path, relative: &str, allow_root: bool) -> Result<PathBuf> {
    let trimmed = relative.trim_start_matches("./");
    if trimmed.is_empty() || trimmed == "." {
        return if allow_root {
            Ok(root.to_path_buf())
        } else {
            Err(invalid(relative, "empty path"))
        };
    }

    if trimmed.contains('\0') {
        return Err(invalid(relative, "embedded NUL"));
    }

    let rel_path = Path::new(trimmed);
    if rel_path.is_absolute() || trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(invalid(relative, "absolute path"));
    }

    let mut full = root.to_path_buf();
    for part in trimmed.split(['/', '\\']) {
        match Path::new(part).components().next() {
            None | Some(Component::CurDir) => {}
            Some(Component::ParentDir) => return Err(invalid(relative, "path traversal")),
            Some(Component::Prefix(_)) | Some(Component::RootDir) => {
                return Err(invalid(relative, "prefix path"))
            }
            Some(Component::Normal(_)) => full.push(part),
        }
    }

    if !lexical(&full).starts_with(lexical(root)) {
        return Err(invalid(relative, "escapes root"));
    }
    Ok(full)
}

/// `path` with `.` dropped and `..` applied textually. Touches no files.
fn lexical(path: &Path) -> PathBuf {
    path.components().fold(PathBuf::new(), |mut out, part| {
        match part {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
        out
    })
}

/// Plain recursive walk: hidden files included, no ignore-file filtering,
/// symlinks not followed, siblings in name order.
pub fn plain_walk(root: &Path) -> ignore::Walk {
    ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
}

/// `/`-separated form of `path` relative to `root`.
pub fn to_wire_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Some(parts.join("/"))
}
