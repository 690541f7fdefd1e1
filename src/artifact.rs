//! Stage artifact directories on disk.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Removes `dir` if present and recreates it empty.
///
/// # Errors
///
/// Returns an error if the directory cannot be removed or created.
pub(crate) fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        debug!("Clearing {}", dir.display());
        fs::remove_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    }
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))
}

/// Writes a file atomically.
///
/// # Process
///
/// 1. Creates the parent directory if needed
/// 2. Writes content to a temporary sibling and syncs it
/// 3. Renames the temporary file over the target
///
/// A reader of the next stage never sees a half-written artifact.
///
/// # Errors
///
/// Returns an error if any file operation fails.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let mut temp_file = fs::File::create(&temp_path).map_err(|e| Error::io(&temp_path, e))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|e| Error::io(&temp_path, e))?;
    temp_file.sync_all().map_err(|e| Error::io(&temp_path, e))?;
    drop(temp_file);

    fs::rename(&temp_path, path).map_err(|e| Error::io(path, e))
}

/// Serializes `value` as pretty JSON into `path`.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_atomic(path, &json)
}

/// Reads a UTF-8 text file.
///
/// # Errors
///
/// Returns [`Error::InvalidUtf8`] for undecodable content, an I/O error otherwise.
pub(crate) fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidData {
            Error::invalid_utf8(path)
        } else {
            Error::io(path, e)
        }
    })
}

/// Lists regular files in `dir` with the given extension, sorted by file name.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub(crate) fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Lists subdirectories of `dir`, sorted by name.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub(crate) fn list_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Resolves `path` to an absolute path without symlinks or `..`, even when it
/// does not exist yet.
///
/// The deepest existing ancestor is canonicalized and the missing tail is
/// normalized lexically on top of it.
///
/// # Errors
///
/// Returns an error if no ancestor can be canonicalized.
pub(crate) fn resolve_path(path: &Path) -> Result<PathBuf> {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        let candidate = if existing.as_os_str().is_empty() { Path::new(".") } else { existing };
        if let Ok(mut resolved) = candidate.canonicalize() {
            for component in tail.into_iter().rev() {
                match component {
                    Component::ParentDir => {
                        resolved.pop();
                    }
                    Component::Normal(name) => resolved.push(name),
                    _ => {}
                }
            }
            return Ok(resolved);
        }
        match (existing.parent(), existing.components().next_back()) {
            (Some(parent), Some(last)) => {
                tail.push(last);
                existing = parent;
            }
            _ => {
                return Err(Error::io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no existing ancestor"),
                ));
            }
        }
    }
}

/// Returns the file name without its extension.
pub(crate) fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_reset_dir_clears_contents() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("stage/old.txt").write_str("stale").unwrap();

        reset_dir(&temp.path().join("stage")).unwrap();

        assert!(temp.child("stage").path().is_dir());
        assert!(!temp.child("stage/old.txt").path().exists());
    }

    #[test]
    fn test_write_atomic_creates_parents() {
        let temp = assert_fs::TempDir::new().unwrap();
        let target = temp.path().join("pass_1/node_1.txt");

        write_atomic(&target, "merged").unwrap();

        temp.child("pass_1/node_1.txt").assert("merged");
        assert!(!temp.child("pass_1/node_1.txt.tmp").path().exists());
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("doc.txt");
        file.write_str("first").unwrap();

        write_atomic(file.path(), "second").unwrap();

        file.assert("second");
    }

    #[test]
    fn test_list_files_sorted_by_name() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("b.txt").write_str("b").unwrap();
        temp.child("a.txt").write_str("a").unwrap();
        temp.child("c.md").write_str("c").unwrap();
        temp.child("sub").create_dir_all().unwrap();

        let names: Vec<String> = list_files(temp.path(), "txt")
            .unwrap()
            .iter()
            .map(|p| stem_of(p))
            .collect();

        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(list_dirs(temp.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_path_collapses_parent_dirs() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("out/docs").create_dir_all().unwrap();
        temp.child("sub").create_dir_all().unwrap();
        let root = temp.path().canonicalize().unwrap();

        let existing = resolve_path(&temp.path().join("sub/../out")).unwrap();
        let missing = resolve_path(&temp.path().join("sub/new/../later/x")).unwrap();

        assert_eq!(existing, root.join("out"));
        assert_eq!(missing, root.join("sub/later/x"));
        assert!(resolve_path(&temp.path().join("out/docs")).unwrap().starts_with(&existing));
    }

    #[test]
    fn test_read_text_rejects_invalid_utf8() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("bad.txt");
        file.write_binary(&[0xff, 0xfe, 0x41]).unwrap();

        assert!(matches!(read_text(file.path()), Err(Error::InvalidUtf8 { .. })));
    }
}
