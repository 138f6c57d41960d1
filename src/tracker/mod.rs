pub mod gh;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A work item fetched from the tracker, immutable for the duration of one
/// processing attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub comments: Vec<String>,
}

/// Boundary to the external issue tracker. Calls may be slow or fail; every
/// failure surfaces as an error the processor catches per item.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// List open issue numbers, ascending, capped at `limit`.
    async fn list_open(&self, limit: Option<usize>) -> Result<Vec<u64>>;

    /// Fetch a full issue with comments.
    async fn get(&self, number: u64) -> Result<WorkItem>;

    /// Post a comment on an issue.
    async fn comment(&self, number: u64, body: &str) -> Result<()>;
}
