//! Skip-pattern matching for corpus discovery.

use crate::error::{Error, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Decides which corpus files are extracted.
///
/// A file is skipped when any pattern matches either its path relative to the
/// corpus root or its bare file name, so `index.md` skips every index page while
/// `api/**` skips a whole subtree.
#[derive(Debug, Clone)]
pub(crate) struct FileFilter {
    skip: GlobSet,
}

impl FileFilter {
    /// Compiles the skip patterns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] for the first pattern that is not a valid glob.
    pub(crate) fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::invalid_pattern(pattern, e.kind().to_string()))?;
            builder.add(glob);
        }

        let skip = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build glob set: {e}")))?;

        Ok(Self { skip })
    }

    /// Returns true if the file at `relative_path` should be extracted.
    pub(crate) fn should_process(&self, relative_path: &Path) -> bool {
        if self.skip.is_match(relative_path) {
            return false;
        }

        match relative_path.file_name() {
            Some(name) => !self.skip.is_match(Path::new(name)),
            None => true,
        }
    }
}
