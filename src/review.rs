use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ALLOWED_EDITORS;
use crate::error::{AppError, Result};

/// Interactive review boundary: hand the plan to a human before posting.
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Returns the (possibly edited) plan text. An empty result means the
    /// reviewer discarded the plan.
    async fn review(&self, plan: &str) -> Result<String>;
}

/// Opens the plan in the user's `$EDITOR`, restricted to a known allow-list
/// of editor binaries, over a private owner-only scratch file.
pub struct EditorReviewer {
    scratch_dir: PathBuf,
}

impl EditorReviewer {
    pub fn new(scratch_dir: &Path) -> Self {
        Self {
            scratch_dir: scratch_dir.to_path_buf(),
        }
    }

    fn resolve_editor() -> Result<PathBuf> {
        let configured = std::env::var("EDITOR").unwrap_or_else(|_| "vim".to_string());
        let basename = Path::new(&configured)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("");

        let candidate = if ALLOWED_EDITORS.contains(&basename) {
            configured
        } else {
            tracing::warn!(editor = %configured, "Editor not approved, using vim");
            "vim".to_string()
        };

        if let Some(path) = find_in_path(&candidate) {
            return Ok(path);
        }

        tracing::warn!(editor = %candidate, "Editor not found, trying vim");
        find_in_path("vim")
            .ok_or_else(|| AppError::Review("Neither specified editor nor vim found in PATH".into()))
    }
}

#[async_trait]
impl Reviewer for EditorReviewer {
    async fn review(&self, plan: &str) -> Result<String> {
        let editor = Self::resolve_editor()?;
        let path = self.scratch_dir.join("review.md");

        tokio::fs::write(&path, plan).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        let status = Command::new(&editor)
            .arg(&path)
            .status()
            .await
            .map_err(|e| AppError::Review(format!("Failed to launch editor: {e}")))?;

        if !status.success() {
            return Err(AppError::Review(format!("Editor exited with {status}")));
        }

        Ok(tokio::fs::read_to_string(&path).await?)
    }
}

/// Minimal `$PATH` lookup. Absolute or relative paths are used as-is.
fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_in_path_locates_sh() {
        assert!(find_in_path("sh").is_some());
    }

    #[test]
    fn find_in_path_misses_nonsense() {
        assert!(find_in_path("definitely-not-an-editor-binary").is_none());
    }
}
