use std::sync::Arc;

use serde::Serialize;

use crate::config::{
    Options, MAX_BODY_SIZE, MAX_TITLE_LENGTH, PLAN_MARKER, RATE_LIMIT_MARKER,
};
use crate::error::{AppError, Result};
use crate::generator::PlanGenerator;
use crate::review::Reviewer;
use crate::scratch::Scratch;
use crate::tracker::Tracker;
use crate::transcript::Transcript;

/// Terminal status of one processed issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Posted,
    Skipped,
    DryRun,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Posted => "posted",
            Status::Skipped => "skipped",
            Status::DryRun => "dry-run",
            Status::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "posted" => Some(Status::Posted),
            "skipped" => Some(Status::Skipped),
            "dry-run" => Some(Status::DryRun),
            "error" => Some(Status::Error),
            _ => None,
        }
    }
}

/// One record per processed issue, immutable once produced.
#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub issue: u64,
    pub status: Status,
    pub error: Option<String>,
}

/// Per-issue state machine. `process` is total: every failure is folded into
/// an `ItemResult` with status `error`, so one bad issue never takes down the
/// batch.
pub struct ItemProcessor {
    tracker: Arc<dyn Tracker>,
    generator: Arc<dyn PlanGenerator>,
    reviewer: Option<Arc<dyn Reviewer>>,
    scratch: Arc<Scratch>,
    opts: Options,
}

impl ItemProcessor {
    pub fn new(
        tracker: Arc<dyn Tracker>,
        generator: Arc<dyn PlanGenerator>,
        reviewer: Option<Arc<dyn Reviewer>>,
        scratch: Arc<Scratch>,
        opts: Options,
    ) -> Self {
        Self {
            tracker,
            generator,
            reviewer,
            scratch,
            opts,
        }
    }

    pub async fn process(
        &self,
        number: u64,
        index: usize,
        total: usize,
        transcript: &Transcript,
    ) -> ItemResult {
        match self.process_inner(number, index, total, transcript).await {
            Ok(status) => ItemResult {
                issue: number,
                status,
                error: None,
            },
            Err(e) => {
                tracing::error!(issue = number, error = %e, "Issue failed");
                transcript.line(&format!("ERROR: {e}"));
                ItemResult {
                    issue: number,
                    status: Status::Error,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn process_inner(
        &self,
        number: u64,
        index: usize,
        total: usize,
        transcript: &Transcript,
    ) -> Result<Status> {
        transcript.line(&format!("[{index}/{total}] Issue #{number}"));

        // Resume marker from an earlier run.
        if !self.opts.replan {
            if let Some(prev) = self.scratch.recorded_status(number) {
                if matches!(prev, Status::Posted | Status::Skipped) {
                    transcript.line(&format!(
                        "Already {} in a previous run, skipping",
                        prev.as_str()
                    ));
                    return Ok(Status::Skipped);
                }
            }
        }

        let item = self.tracker.get(number).await?;

        // Title validation with truncation warning
        let mut title = item.title;
        let title_len = title.chars().count();
        if title_len > MAX_TITLE_LENGTH {
            tracing::warn!(
                issue = number,
                length = title_len,
                "Title unusually long, truncating"
            );
            transcript.line(&format!(
                "WARN: Title unusually long ({title_len} chars), truncating to {MAX_TITLE_LENGTH}"
            ));
            title = title.chars().take(MAX_TITLE_LENGTH).collect();
            title.push_str("...");
        }

        // Body size validation
        if item.body.len() > MAX_BODY_SIZE {
            return Err(AppError::Validation(format!(
                "Issue body too large ({} bytes, max {MAX_BODY_SIZE})",
                item.body.len()
            )));
        }

        // Check for an existing plan. A plan that itself carries a rate-limit
        // notice never completed, so it does not count.
        if !self.opts.replan {
            for comment in &item.comments {
                if comment.contains(PLAN_MARKER) {
                    if comment.contains(RATE_LIMIT_MARKER) {
                        transcript.line("Existing plan was rate-limited, will replan...");
                        break;
                    }
                    self.scratch.record_status(number, Status::Skipped);
                    return Ok(Status::Skipped);
                }
            }
        }

        // Dry-run: show what would be sent without invoking the generator.
        if self.opts.dry_run {
            transcript.line(&format!("[DRY RUN] Would generate plan for #{number}: {title}"));
            transcript.line("Plan prompt preview (first 20 lines):");
            let prompt = self.generator.build_prompt(number, &title, &item.body);
            for line in prompt.lines().take(20) {
                transcript.line(&format!("    {line}"));
            }
            return Ok(Status::DryRun);
        }

        let plan = self
            .generator
            .generate(number, &title, &item.body, transcript)
            .await?;

        if plan.trim().is_empty() {
            return Err(AppError::EmptyPlan);
        }

        let plan = if self.opts.auto {
            plan
        } else {
            let reviewer = self
                .reviewer
                .as_ref()
                .ok_or_else(|| AppError::Internal("No reviewer in interactive mode".into()))?;
            let edited = reviewer.review(&plan).await?;
            if edited.trim().is_empty() {
                transcript.line("Plan discarded during review, skipping");
                self.scratch.record_status(number, Status::Skipped);
                return Ok(Status::Skipped);
            }
            edited
        };

        self.post_plan(number, &plan).await?;
        transcript.line(&format!("Posted plan for issue #{number}"));
        self.scratch.record_status(number, Status::Posted);
        Ok(Status::Posted)
    }

    async fn post_plan(&self, number: u64, plan: &str) -> Result<()> {
        let mut header = PLAN_MARKER.to_string();
        if self.opts.replan {
            header.push_str(" (Revised)");
        }
        header.push_str("\n\n");
        if let Some(reason) = &self.opts.replan_reason {
            header.push_str(&format!("**Replan reason:** {reason}\n\n"));
        }

        self.tracker.comment(number, &format!("{header}{plan}")).await
    }
}
