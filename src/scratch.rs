use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::processor::Status;

/// Per-run scratch directory plus the cross-run resume-marker store.
///
/// The scratch dir holds review files and is private to the run (0700). The
/// state dir is stable across runs: one marker file per issue records its
/// terminal status, so a later run without `--replan` can skip work that
/// already finished. Markers are only ever written by the worker that owns
/// the issue, so no locking is needed.
pub struct Scratch {
    dir: PathBuf,
    state_dir: PathBuf,
}

impl Scratch {
    pub fn create(state_dir: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("hypha-")
            .tempdir()
            .map_err(|e| AppError::Startup(format!("Failed to create scratch dir: {e}")))?
            // The dir must survive the run unless --cleanup asks otherwise.
            .keep();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| AppError::Startup(format!("Failed to restrict scratch dir: {e}")))?;
        }

        std::fs::create_dir_all(state_dir)
            .map_err(|e| AppError::Startup(format!("Failed to create state dir: {e}")))?;

        Ok(Self {
            dir,
            state_dir: state_dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn marker_path(&self, number: u64) -> PathBuf {
        self.state_dir.join(format!("issue-{number}.status"))
    }

    /// Record the terminal status of an issue for future runs.
    pub fn record_status(&self, number: u64, status: Status) {
        let path = self.marker_path(number);
        if let Err(e) = std::fs::write(&path, status.as_str()) {
            tracing::warn!(issue = number, error = %e, "Failed to write resume marker");
        }
    }

    /// Status recorded by a previous run, if any.
    pub fn recorded_status(&self, number: u64) -> Option<Status> {
        let text = std::fs::read_to_string(self.marker_path(number)).ok()?;
        Status::parse(text.trim())
    }

    /// Remove the scratch dir and all resume markers (`--cleanup`).
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            tracing::warn!(error = %e, "Failed to remove scratch dir");
        }
        if let Err(e) = std::fs::remove_dir_all(&self.state_dir) {
            tracing::warn!(error = %e, "Failed to remove state dir");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_roundtrip() {
        let state = tempfile::tempdir().unwrap();
        let scratch = Scratch::create(state.path()).unwrap();

        assert_eq!(scratch.recorded_status(12), None);
        scratch.record_status(12, Status::Posted);
        assert_eq!(scratch.recorded_status(12), Some(Status::Posted));
        scratch.record_status(13, Status::Skipped);
        assert_eq!(scratch.recorded_status(13), Some(Status::Skipped));

        scratch.cleanup();
        assert!(!scratch.dir().exists());
    }

    #[test]
    fn scratch_dir_is_owner_only() {
        let state = tempfile::tempdir().unwrap();
        let scratch = Scratch::create(state.path()).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(scratch.dir()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        scratch.cleanup();
    }
}
