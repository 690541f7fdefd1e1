use crate::{
    config::ReleaseConfig,
    error::{Error, Result},
    report::Stage,
};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// A published release candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseEntry {
    /// Version number
    pub version: u32,

    /// Path of the published file
    pub path: PathBuf,
}

/// Parses the version out of `<basename><N>.<extension>`.
///
/// A bare `<basename>.<extension>` counts as version 1.
#[must_use]
pub fn parse_version(file_name: &str, basename: &str, extension: &str) -> Option<u32> {
    let stem = file_name
        .strip_suffix(extension)?
        .strip_suffix('.')?
        .strip_prefix(basename)?;
    if stem.is_empty() {
        return Some(1);
    }
    if !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Append-only directory of versioned release candidates.
#[derive(Debug, Clone)]
pub struct ReleaseManager {
    dir: PathBuf,
    basename: String,
    extension: String,
}

impl ReleaseManager {
    /// Creates a manager from release settings.
    #[must_use]
    pub fn new(config: &ReleaseConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            basename: config.basename.clone(),
            extension: config.extension.trim_start_matches('.').to_string(),
        }
    }

    /// Versions already present, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the release directory exists but cannot be read.
    pub fn existing_versions(&self) -> Result<Vec<u32>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| Error::io(&self.dir, e))? {
            let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| parse_version(name, &self.basename, &self.extension))
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// The version the next publish will use: highest existing plus one.
    ///
    /// # Errors
    ///
    /// Returns an error if the release directory cannot be read.
    pub fn next_version(&self) -> Result<u32> {
        Ok(self.existing_versions()?.last().map_or(1, |max| max + 1))
    }

    /// Path of the file for `version`.
    #[must_use]
    pub fn path_for(&self, version: u32) -> PathBuf {
        self.dir
            .join(format!("{}{}.{}", self.basename, version, self.extension))
    }

    /// Copies `source` into the release directory under the next version.
    ///
    /// The target is created exclusively, so an existing release is never
    /// overwritten; if another writer takes the version first, the next one is
    /// used. The source file is left in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is missing or the copy fails.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub fn publish(&self, source: &Path) -> Result<ReleaseEntry> {
        if !source.is_file() {
            return Err(Error::precondition(
                Stage::Release.name(),
                format!("final document '{}' does not exist", source.display()),
            ));
        }

        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;

        let mut version = self.next_version()?;
        loop {
            let path = self.path_for(version);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut target) => {
                    let mut reader = File::open(source).map_err(|e| Error::io(source, e))?;
                    io::copy(&mut reader, &mut target).map_err(|e| Error::io(&path, e))?;
                    target.sync_all().map_err(|e| Error::io(&path, e))?;

                    info!("Published release {} at {}", version, path.display());
                    return Ok(ReleaseEntry { version, path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("{} already exists, trying next version", path.display());
                    version += 1;
                }
                Err(e) => return Err(Error::io(&path, e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use assert_fs::TempDir;

    fn manager(dir: &Path) -> ReleaseManager {
        ReleaseManager::new(&ReleaseConfig {
            dir: dir.to_path_buf(),
            ..ReleaseConfig::default()
        })
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("candidate7.txt", "candidate", "txt"), Some(7));
        assert_eq!(parse_version("candidate.txt", "candidate", "txt"), Some(1));
        assert_eq!(parse_version("candidate7.md", "candidate", "txt"), None);
        assert_eq!(parse_version("candidate_7.txt", "candidate", "txt"), None);
        assert_eq!(parse_version("other3.txt", "candidate", "txt"), None);
        assert_eq!(parse_version("candidate-1.txt", "candidate", "txt"), None);
    }

    #[test]
    fn test_next_version_after_gaps() {
        let temp = TempDir::new().unwrap();
        temp.child("release/candidate2.txt").write_str("two").unwrap();
        temp.child("release/candidate5.txt").write_str("five").unwrap();
        temp.child("release/notes.txt").write_str("ignored").unwrap();

        let manager = manager(&temp.path().join("release"));

        assert_eq!(manager.existing_versions().unwrap(), vec![2, 5]);
        assert_eq!(manager.next_version().unwrap(), 6);
    }

    #[test]
    fn test_next_version_empty_or_missing_dir() {
        let temp = TempDir::new().unwrap();
        assert_eq!(manager(&temp.path().join("missing")).next_version().unwrap(), 1);

        temp.child("empty").create_dir_all().unwrap();
        assert_eq!(manager(&temp.path().join("empty")).next_version().unwrap(), 1);
    }

    #[test]
    fn test_bare_basename_counts_as_first_version() {
        let temp = TempDir::new().unwrap();
        temp.child("release/candidate.txt").write_str("first").unwrap();

        assert_eq!(manager(&temp.path().join("release")).next_version().unwrap(), 2);
    }

    #[test]
    fn test_publish_copies_without_overwriting() {
        let temp = TempDir::new().unwrap();
        let source = temp.child("final.txt");
        source.write_str("final document").unwrap();
        temp.child("release/candidate1.txt").write_str("old").unwrap();

        let manager = manager(&temp.path().join("release"));
        let first = manager.publish(source.path()).unwrap();
        let second = manager.publish(source.path()).unwrap();

        assert_eq!(first.version, 2);
        assert_eq!(second.version, 3);
        temp.child("release/candidate1.txt").assert("old");
        temp.child("release/candidate2.txt").assert("final document");
        temp.child("release/candidate3.txt").assert("final document");
        source.assert("final document");
    }

    #[test]
    fn test_publish_requires_source() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp.path().join("release"));

        let result = manager.publish(&temp.path().join("missing.txt"));

        assert!(matches!(result, Err(e) if e.is_precondition()));
        assert!(!temp.child("release").path().exists());
    }
}
