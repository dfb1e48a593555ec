//! Purpose: Resolve request paths to data files under the served directory.
//! Exports: `default_data_dir` and `resolve_data_path`.
//! Role: Keep CLI and server path semantics aligned from one source.
//! Invariants: Resolved paths always stay inside the (canonical) data directory.
//! Invariants: `..`, absolute and prefixed components are rejected before touching the filesystem.

use std::path::{Component, Path, PathBuf};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum DataPathError {
    Empty,
    Traversal,
    NotFound,
    NotAFile,
}

pub(crate) fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

pub(crate) fn resolve_data_path(
    request_path: &str,
    data_dir: &Path,
) -> Result<PathBuf, DataPathError> {
    let relative = Path::new(request_path.trim_start_matches('/'));
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(DataPathError::Traversal);
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(DataPathError::Empty);
    }

    let candidate = data_dir.join(&clean);
    let resolved = std::fs::canonicalize(&candidate).map_err(|_| DataPathError::NotFound)?;
    // Symlinks may still point outside the served tree.
    let base = std::fs::canonicalize(data_dir).map_err(|_| DataPathError::NotFound)?;
    if !resolved.starts_with(&base) {
        return Err(DataPathError::Traversal);
    }
    if !resolved.is_file() {
        return Err(DataPathError::NotAFile);
    }
    Ok(resolved)
}
