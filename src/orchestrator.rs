use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::processor::{ItemProcessor, ItemResult, Status};
use crate::transcript::Transcript;

/// Fans issue processing out over a bounded worker pool (or a plain loop) and
/// reports results in original input order no matter how workers finish.
pub struct Orchestrator {
    processor: Arc<ItemProcessor>,
    parallel: bool,
    max_parallel: usize,
    cancel: watch::Receiver<bool>,
}

/// Counts by terminal status. Dry-run previews count as skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub posted: usize,
    pub skipped: usize,
    pub errors: usize,
    pub total: usize,
}

impl RunSummary {
    pub fn from_results(results: &[ItemResult]) -> Self {
        Self {
            posted: results.iter().filter(|r| r.status == Status::Posted).count(),
            skipped: results
                .iter()
                .filter(|r| matches!(r.status, Status::Skipped | Status::DryRun))
                .count(),
            errors: results.iter().filter(|r| r.status == Status::Error).count(),
            total: results.len(),
        }
    }
}

impl Orchestrator {
    pub fn new(
        processor: Arc<ItemProcessor>,
        parallel: bool,
        max_parallel: usize,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            processor,
            parallel,
            max_parallel,
            cancel,
        }
    }

    /// Process every issue, returning one result per issue in input order.
    pub async fn run(&self, issues: &[u64]) -> Vec<ItemResult> {
        if self.parallel {
            self.run_parallel(issues).await
        } else {
            self.run_sequential(issues).await
        }
    }

    async fn run_sequential(&self, issues: &[u64]) -> Vec<ItemResult> {
        let total = issues.len();
        let mut results = Vec::with_capacity(total);

        for (idx, &number) in issues.iter().enumerate() {
            if *self.cancel.borrow() {
                tracing::warn!("Run interrupted, stopping before remaining issues");
                results.push(interrupted(number));
                continue;
            }
            let transcript = Transcript::live();
            results.push(self.processor.process(number, idx + 1, total, &transcript).await);
        }

        results
    }

    async fn run_parallel(&self, issues: &[u64]) -> Vec<ItemResult> {
        let total = issues.len();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut join_set = JoinSet::new();

        for (idx, &number) in issues.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let processor = Arc::clone(&self.processor);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                // Buffer this worker's output so transcripts never interleave.
                let transcript = Transcript::buffered();
                let result = processor.process(number, idx + 1, total, &transcript).await;
                (idx, result, transcript.take())
            });
        }

        // Watch for the interrupt between joins too, so abort_all fires while
        // workers are still mid-generation. kill_on_drop on the generator
        // child reaps the in-flight subprocess when its task is aborted.
        let mut slots: Vec<Option<(ItemResult, String)>> = vec![None; total];
        let mut cancel = self.cancel.clone();
        let mut cancel_open = !*cancel.borrow();
        if !cancel_open {
            join_set.abort_all();
        }
        loop {
            tokio::select! {
                joined = join_set.join_next() => match joined {
                    None => break,
                    Some(Ok((idx, result, output))) => slots[idx] = Some((result, output)),
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => tracing::error!(error = %e, "Worker panicked"),
                },
                changed = cancel.changed(), if cancel_open => match changed {
                    Ok(()) if *cancel.borrow() => {
                        tracing::warn!("Run interrupted, aborting outstanding workers");
                        join_set.abort_all();
                        cancel_open = false;
                    }
                    Ok(()) => {}
                    Err(_) => cancel_open = false,
                },
            }
        }

        // Flush transcripts and collect results in original input order.
        let mut results = Vec::with_capacity(total);
        for (idx, slot) in slots.into_iter().enumerate() {
            match slot {
                Some((result, output)) => {
                    print!("{output}");
                    results.push(result);
                }
                None => results.push(interrupted(issues[idx])),
            }
        }

        results
    }
}

fn interrupted(number: u64) -> ItemResult {
    ItemResult {
        issue: number,
        status: Status::Error,
        error: Some("Interrupted".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::Options;
    use crate::error::{AppError, Result};
    use crate::generator::PlanGenerator;
    use crate::scratch::Scratch;
    use crate::tracker::{Tracker, WorkItem};

    struct MapTracker {
        items: HashMap<u64, WorkItem>,
    }

    impl MapTracker {
        fn with_issues(numbers: &[u64]) -> Self {
            let items = numbers
                .iter()
                .map(|&n| {
                    (
                        n,
                        WorkItem {
                            number: n,
                            title: format!("Issue {n}"),
                            body: "body".into(),
                            comments: vec![],
                        },
                    )
                })
                .collect();
            Self { items }
        }
    }

    #[async_trait]
    impl Tracker for MapTracker {
        async fn list_open(&self, _limit: Option<usize>) -> Result<Vec<u64>> {
            let mut numbers: Vec<u64> = self.items.keys().copied().collect();
            numbers.sort_unstable();
            Ok(numbers)
        }

        async fn get(&self, number: u64) -> Result<WorkItem> {
            self.items
                .get(&number)
                .cloned()
                .ok_or_else(|| AppError::Fetch(format!("no such issue {number}")))
        }

        async fn comment(&self, _number: u64, _body: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Generator whose latency depends on the issue number, to shuffle
    /// completion order relative to submission order.
    struct StaggeredGenerator;

    #[async_trait]
    impl PlanGenerator for StaggeredGenerator {
        async fn generate(
            &self,
            number: u64,
            _title: &str,
            _body: &str,
            transcript: &Transcript,
        ) -> Result<String> {
            tokio::time::sleep(Duration::from_millis(number * 40)).await;
            transcript.line(&format!("generated #{number}"));
            Ok(format!("plan for #{number}"))
        }

        fn build_prompt(&self, number: u64, _title: &str, _body: &str) -> String {
            format!("prompt #{number}")
        }
    }

    fn auto_options(parallel: bool) -> Options {
        Options {
            auto: true,
            replan: false,
            replan_reason: None,
            dry_run: false,
            cleanup: false,
            parallel,
            max_parallel: 4,
            timeout_secs: 600,
            throttle_secs: 0.0,
            json_output: false,
        }
    }

    fn orchestrator(issues: &[u64], parallel: bool) -> (Orchestrator, tempfile::TempDir) {
        let state = tempfile::tempdir().unwrap();
        let scratch = Arc::new(Scratch::create(state.path()).unwrap());
        let processor = Arc::new(ItemProcessor::new(
            Arc::new(MapTracker::with_issues(issues)),
            Arc::new(StaggeredGenerator),
            None,
            scratch,
            auto_options(parallel),
        ));
        let (tx, cancel) = watch::channel(false);
        // Run-scoped sender; tests that cancel build their own channel.
        std::mem::drop(tx);
        (Orchestrator::new(processor, parallel, 4, cancel), state)
    }

    #[tokio::test]
    async fn parallel_results_preserve_input_order() {
        // Issue 3 takes longest, so completion order is 1, 2, 3 while input
        // order is 3, 1, 2.
        let (orch, _state) = orchestrator(&[3, 1, 2], true);
        let results = orch.run(&[3, 1, 2]).await;

        let order: Vec<u64> = results.iter().map(|r| r.issue).collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert!(results.iter().all(|r| r.status == Status::Posted));
    }

    #[tokio::test]
    async fn sequential_results_preserve_input_order() {
        let (orch, _state) = orchestrator(&[2, 1], false);
        let results = orch.run(&[2, 1]).await;

        let order: Vec<u64> = results.iter().map(|r| r.issue).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[tokio::test]
    async fn missing_issue_is_isolated_to_its_result() {
        let (orch, _state) = orchestrator(&[1, 2], true);
        let results = orch.run(&[1, 99, 2]).await;

        assert_eq!(results[0].status, Status::Posted);
        assert_eq!(results[1].status, Status::Error);
        assert_eq!(results[2].status, Status::Posted);
    }

    #[tokio::test]
    async fn cancel_mid_run_aborts_parallel_workers() {
        let state = tempfile::tempdir().unwrap();
        let scratch = Arc::new(Scratch::create(state.path()).unwrap());
        let processor = Arc::new(ItemProcessor::new(
            Arc::new(MapTracker::with_issues(&[30])),
            Arc::new(StaggeredGenerator),
            None,
            scratch,
            auto_options(true),
        ));
        let (tx, cancel) = watch::channel(false);
        let orch = Orchestrator::new(processor, true, 4, cancel);

        // Issue 30 takes 1.2s when left alone; the interrupt at 100ms must
        // cut the run short.
        let start = tokio::time::Instant::now();
        let (results, _) = tokio::join!(orch.run(&[30]), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(true).unwrap();
        });

        assert!(start.elapsed() < Duration::from_millis(700));
        assert_eq!(results[0].status, Status::Error);
        assert_eq!(results[0].error.as_deref(), Some("Interrupted"));
    }

    #[tokio::test]
    async fn pre_cancelled_run_does_no_work() {
        let state = tempfile::tempdir().unwrap();
        let scratch = Arc::new(Scratch::create(state.path()).unwrap());
        let processor = Arc::new(ItemProcessor::new(
            Arc::new(MapTracker::with_issues(&[1, 2])),
            Arc::new(StaggeredGenerator),
            None,
            scratch,
            auto_options(false),
        ));
        let (tx, cancel) = watch::channel(true);
        let orch = Orchestrator::new(processor, false, 4, cancel);

        let results = orch.run(&[1, 2]).await;
        assert!(results.iter().all(|r| r.status == Status::Error));
        drop(tx);
    }

    #[test]
    fn summary_counts_by_status() {
        let results = vec![
            ItemResult { issue: 1, status: Status::Posted, error: None },
            ItemResult { issue: 2, status: Status::Skipped, error: None },
            ItemResult { issue: 3, status: Status::DryRun, error: None },
            ItemResult { issue: 4, status: Status::Error, error: Some("boom".into()) },
        ];
        let summary = RunSummary::from_results(&results);
        assert_eq!(
            summary,
            RunSummary { posted: 1, skipped: 2, errors: 1, total: 4 }
        );
    }
}
