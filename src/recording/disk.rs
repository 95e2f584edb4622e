//! Disk space monitoring
//!
//! The single reader of free space for the recordings filesystem. The
//! watchdog samples it to auto-stop sessions; the start gate queries it
//! before admitting a new session.

use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

const BYTES_PER_GIB: f64 = (1u64 << 30) as f64;

pub struct DiskMonitor {
    path: PathBuf,
}

impl DiskMonitor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Free bytes available to unprivileged writers on the filesystem
    /// holding the recordings root
    pub fn free_bytes(&self) -> Result<u64> {
        // the recordings root may not exist before the first session
        let probe: &Path = if self.path.exists() {
            &self.path
        } else {
            self.path.parent().unwrap_or(Path::new("/"))
        };
        let stat = nix::sys::statvfs::statvfs(probe)
            .map_err(|e| AppError::Internal(format!("statvfs {}: {}", probe.display(), e)))?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    pub fn free_gb(&self) -> Result<f64> {
        Ok(self.free_bytes()? as f64 / BYTES_PER_GIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_space_on_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = DiskMonitor::new(dir.path());
        let free = monitor.free_gb().unwrap();
        assert!(free > 0.0);
    }

    #[test]
    fn test_missing_path_falls_back_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = DiskMonitor::new(dir.path().join("not-created-yet"));
        assert!(monitor.free_bytes().unwrap() > 0);
    }
}
