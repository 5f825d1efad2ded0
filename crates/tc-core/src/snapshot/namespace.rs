//! Discovery of pinned objects under a bpffs mount.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default recursion limit below the root.
pub const DEFAULT_MAX_DEPTH: usize = 8;

/// A path the walk or the loader gave up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPath {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of walking a namespace.
#[derive(Debug, Default)]
pub struct NamespaceWalk {
    /// Regular files, in sorted order. Each one is a table candidate.
    pub candidates: Vec<PathBuf>,
    pub skipped: Vec<SkippedPath>,
}

/// Collect every regular file under `root`.
///
/// Symlinks are not followed. Unreadable directories and entries are
/// recorded as skipped. Directories deeper than `max_depth` below the root
/// are not entered.
pub fn walk_namespace(root: &Path, max_depth: usize) -> NamespaceWalk {
    let mut walk = NamespaceWalk::default();
    walk_dir(root, 0, max_depth, &mut walk);
    walk.candidates.sort();
    walk
}

fn skip(walk: &mut NamespaceWalk, path: &Path, reason: impl Into<String>) {
    walk.skipped.push(SkippedPath {
        path: path.to_path_buf(),
        reason: reason.into(),
    });
}

fn walk_dir(dir: &Path, depth: usize, max_depth: usize, walk: &mut NamespaceWalk) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            skip(walk, dir, e.to_string());
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                skip(walk, dir, e.to_string());
                continue;
            }
        };
        let path = entry.path();
        let file_type = match fs::symlink_metadata(&path) {
            Ok(meta) => meta.file_type(),
            Err(e) => {
                skip(walk, &path, e.to_string());
                continue;
            }
        };

        if file_type.is_dir() {
            if depth < max_depth {
                walk_dir(&path, depth + 1, max_depth, walk);
            } else {
                skip(walk, &path, "maximum depth reached");
            }
        } else if file_type.is_file() {
            walk.candidates.push(path);
        } else if file_type.is_symlink() {
            skip(walk, &path, "symlink not followed");
        }
    }
}
