//! Per-run scratch directory holding the extracted archive and index files.

use anyhow::{Context, Result};
use std::path::Path;
use tempfile::TempDir;
use tracing::{debug, warn};

pub struct WorkDir {
    dir: Option<TempDir>,
}

impl WorkDir {
    /// Creates a uniquely named directory under `parent`, or under the system
    /// temp directory when `parent` is `None`.
    pub fn create(parent: Option<&Path>) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("gtfsrt2lc-");
            b
        };
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        }
        .context("failed to create working directory")?;
        debug!(path = %dir.path().display(), "Working directory created");
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }

    /// Removes the directory. Failures are logged, never raised.
    pub fn close(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!(path = %path.display(), "Working directory removed"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove working directory"),
            }
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        self.remove();
    }
}
