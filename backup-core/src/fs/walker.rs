//! Directory traversal in a deterministic order.
//!
//! Manifests, archives and change detection all need the same view of a
//! tree: regular files only, keyed by a `/`-separated path relative to the
//! root, sorted by that key.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// File names skipped wherever they appear
    pub exclude_names: Vec<String>,

    /// Only keep files whose modification time is strictly after this instant
    pub modified_after: Option<SystemTime>,
}

impl WalkOptions {
    pub fn excluding(names: &[&str]) -> Self {
        Self {
            exclude_names: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root, `/`-separated
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,

    /// Last modification time
    pub modified: SystemTime,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        let path = entry.path().to_path_buf();
        let relative = path.strip_prefix(root).unwrap_or(&path);

        Ok(Self {
            relative_path: relative_key(relative),
            size: metadata.len(),
            modified: metadata.modified()?,
            path,
        })
    }
}

/// `/`-separated form of a relative path, stable across platforms.
pub fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether a manifest or archive key stays inside its root once joined.
pub fn is_safe_relative(key: &str) -> bool {
    !key.is_empty()
        && Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Walk a directory tree and collect all regular files, sorted by relative path.
///
/// A missing root yields an empty list.
pub fn walk_files(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(e, &options.exclude_names));

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let info = FileInfo::from_entry(&entry, root)?;
        if let Some(since) = options.modified_after {
            if info.modified <= since {
                continue;
            }
        }
        files.push(info);
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

fn is_excluded(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|n| *n == file_name)
}
