use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Tracker, WorkItem};
use crate::config::MAX_ISSUES_FETCH;
use crate::error::{AppError, Result};

/// Tracker backed by the `gh` CLI. Keeping the CLI as the boundary means no
/// token handling here; `gh` owns authentication.
pub struct GhTracker;

#[derive(Deserialize)]
struct GhIssueNumber {
    number: u64,
}

#[derive(Deserialize)]
struct GhIssue {
    title: Option<String>,
    body: Option<String>,
    #[serde(default)]
    comments: Vec<GhComment>,
}

#[derive(Deserialize)]
struct GhComment {
    body: Option<String>,
}

impl GhTracker {
    pub fn new() -> Self {
        Self
    }

    async fn run_gh(args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("gh")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AppError::Fetch(format!("Failed to run gh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Fetch(format!(
                "gh {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}

impl Default for GhTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tracker for GhTracker {
    async fn list_open(&self, limit: Option<usize>) -> Result<Vec<u64>> {
        let fetch_limit = MAX_ISSUES_FETCH.to_string();
        let stdout = Self::run_gh(&[
            "issue",
            "list",
            "--state",
            "open",
            "--limit",
            &fetch_limit,
            "--json",
            "number",
        ])
        .await?;

        let issues: Vec<GhIssueNumber> = serde_json::from_slice(&stdout)
            .map_err(|e| AppError::Fetch(format!("Failed to parse gh issue list: {e}")))?;

        let mut numbers: Vec<u64> = issues.into_iter().map(|i| i.number).collect();
        numbers.sort_unstable();
        if let Some(limit) = limit {
            numbers.truncate(limit);
        }
        Ok(numbers)
    }

    async fn get(&self, number: u64) -> Result<WorkItem> {
        let number_str = number.to_string();
        let stdout = Self::run_gh(&[
            "issue",
            "view",
            &number_str,
            "--json",
            "title,body,comments",
        ])
        .await?;

        let issue: GhIssue = serde_json::from_slice(&stdout)
            .map_err(|e| AppError::Fetch(format!("Failed to parse gh issue view: {e}")))?;

        Ok(WorkItem {
            number,
            title: issue.title.filter(|t| !t.is_empty()).unwrap_or_else(|| "Untitled".to_string()),
            body: issue.body.unwrap_or_default(),
            comments: issue
                .comments
                .into_iter()
                .map(|c| c.body.unwrap_or_default())
                .collect(),
        })
    }

    async fn comment(&self, number: u64, body: &str) -> Result<()> {
        // Stream the body over stdin so arbitrarily large plans never hit
        // argv limits.
        let mut child = Command::new("gh")
            .args(["issue", "comment", &number.to_string(), "--body-file", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AppError::Post(format!("Failed to run gh: {e}")))?;

        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| AppError::Post("gh stdin unavailable".into()))?;
            stdin
                .write_all(body.as_bytes())
                .await
                .map_err(|e| AppError::Post(format!("Failed to write comment body: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AppError::Post(format!("gh did not exit cleanly: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Post(stderr.trim().to_string()));
        }
        Ok(())
    }
}
