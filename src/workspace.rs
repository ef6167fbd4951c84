use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

/// Scratch directory owned by one job.
///
/// The directory and everything in it is removed when the workspace is
/// dropped, whichever way the job ends.
#[derive(Debug)]
pub struct JobWorkspace {
    dir: TempDir,
}

impl JobWorkspace {
    /// Create a workspace under `parent`, or the system temp dir when `None`.
    pub fn create(parent: Option<&Path>, job_id: &str) -> io::Result<Self> {
        let prefix = format!("soundbath-{job_id}-");
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                tempfile::Builder::new().prefix(&prefix).tempdir_in(parent)?
            }
            None => tempfile::Builder::new().prefix(&prefix).tempdir()?,
        };
        debug!(job_id, path = %dir.path().display(), "workspace created");
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Remove the directory now and report failures instead of ignoring them.
    pub fn close(self) -> io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().inspect_err(|e| {
            warn!(path = %path.display(), error = %e, "workspace cleanup failed");
        })
    }
}
