use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{GeneratorConfig, Options, GENERATOR_MAX_STEPS, GENERATOR_MAX_TOOLS, MAX_RETRIES};
use crate::error::{AppError, Result};
use crate::ratelimit::{detect_rate_limit, wait_until};
use crate::throttle::Throttle;
use crate::transcript::Transcript;

/// Structured error envelope the generator CLI emits on provider failures.
const ERROR_ENVELOPE: &str = r#""type":"result","subtype":"error""#;

static ERROR_DETAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""errors":\[([^\]]*)\]"#).expect("error-detail regex is valid"));

/// Classification of one generator invocation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Ok,
    /// Wall-clock deadline breached; the process was killed.
    Timeout,
    /// Provider-side transient failure reported in the error envelope.
    Transient { detail: String },
    /// Provider rate limit; retry once the window clears.
    RateLimited { reset_epoch: i64 },
    /// Non-zero exit without a recognizable cause. Still retryable.
    HardError { code: i32 },
}

#[derive(Debug)]
pub struct ProcessOutcome {
    pub kind: OutcomeKind,
    pub combined: String,
    pub elapsed: Duration,
}

/// Classify the combined output of a finished generator process.
///
/// Order matters: the error envelope and rate-limit notice both arrive with
/// exit code 0, so text checks come before the exit-code check. `now` anchors
/// the rate-limit reset computation.
pub fn classify(
    combined: String,
    exit_code: Option<i32>,
    elapsed: Duration,
    now: DateTime<Utc>,
) -> ProcessOutcome {
    let kind = if combined.contains(ERROR_ENVELOPE) {
        let detail = ERROR_DETAIL_RE
            .captures(&combined)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "unknown".to_string());
        OutcomeKind::Transient { detail }
    } else if let Some(reset_epoch) = detect_rate_limit(&combined, now) {
        OutcomeKind::RateLimited { reset_epoch }
    } else if exit_code == Some(0) {
        OutcomeKind::Ok
    } else {
        OutcomeKind::HardError {
            code: exit_code.unwrap_or(-1),
        }
    };

    ProcessOutcome {
        kind,
        combined,
        elapsed,
    }
}

/// Exponential backoff between retryable failures: 2^attempt seconds.
/// Cancellable, so an interrupt never waits out the delay.
async fn backoff(attempt: u32, cancel: &mut watch::Receiver<bool>) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(1u64 << attempt);
    loop {
        if *cancel.borrow() {
            return Err(AppError::Interrupted);
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return Ok(()),
            changed = cancel.changed() => if changed.is_err() {
                // Sender gone; no cancellation can arrive anymore.
                tokio::time::sleep_until(deadline).await;
                return Ok(());
            },
        }
    }
}

/// Seam between the per-item processor and the external plan generator.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(
        &self,
        number: u64,
        title: &str,
        body: &str,
        transcript: &Transcript,
    ) -> Result<String>;

    /// The prompt that `generate` would send, for dry-run previews.
    fn build_prompt(&self, number: u64, title: &str, body: &str) -> String;
}

/// Drives the `claude` CLI for one issue at a time, with throttling, a
/// per-attempt deadline, and retry on transient failures.
pub struct ClaudeGenerator {
    program: String,
    leading_args: Vec<String>,
    replan: bool,
    replan_reason: Option<String>,
    timeout: Duration,
    throttle: Arc<Throttle>,
    cancel: watch::Receiver<bool>,
    clock: fn() -> DateTime<Utc>,
}

impl ClaudeGenerator {
    pub fn new(
        config: &GeneratorConfig,
        opts: &Options,
        repo_root: &Path,
        system_prompt: &str,
        throttle: Arc<Throttle>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        // Interactive runs keep Bash out of the allow-list; a human reviews
        // the plan anyway, so the generator stays read-only.
        let allowed_tools = if opts.auto {
            "Read,Glob,Grep,WebFetch,WebSearch,Bash"
        } else {
            "Read,Glob,Grep,WebFetch,WebSearch"
        };

        let leading_args = vec![
            "--model".to_string(),
            config.model.clone(),
            "--permission-mode".to_string(),
            "default".to_string(),
            "--allowedTools".to_string(),
            allowed_tools.to_string(),
            "--add-dir".to_string(),
            repo_root.display().to_string(),
            "--system-prompt".to_string(),
            system_prompt.to_string(),
        ];

        Self::from_parts(
            config.command.clone(),
            leading_args,
            opts,
            Duration::from_secs(opts.timeout_secs),
            throttle,
            cancel,
            Utc::now,
        )
    }

    /// Build from a raw program + argument prefix. The prompt is appended as
    /// `-p <prompt>` on every invocation. `clock` anchors rate-limit reset
    /// math and is `Utc::now` outside tests.
    pub fn from_parts(
        program: String,
        leading_args: Vec<String>,
        opts: &Options,
        timeout: Duration,
        throttle: Arc<Throttle>,
        cancel: watch::Receiver<bool>,
        clock: fn() -> DateTime<Utc>,
    ) -> Self {
        Self {
            program,
            leading_args,
            replan: opts.replan,
            replan_reason: opts.replan_reason.clone(),
            timeout,
            throttle,
            cancel,
            clock,
        }
    }

    /// Run one attempt: spawn, stream output under the deadline, classify.
    /// An external interrupt kills the child and surfaces as `Interrupted`.
    async fn run_attempt(&self, prompt: &str, transcript: &Transcript) -> Result<ProcessOutcome> {
        let mut cancel = self.cancel.clone();
        if *cancel.borrow() {
            return Err(AppError::Interrupted);
        }
        let mut cancel_open = true;

        let start = Instant::now();
        let deadline = start + self.timeout;

        let mut child = Command::new(&self.program)
            .args(&self.leading_args)
            .arg("-p")
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Internal(format!("Failed to spawn generator: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Internal("generator stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Internal("generator stderr unavailable".into()))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut combined = String::new();

        transcript.line("  -------- Generator Output --------");
        let timed_out = loop {
            if stdout_done && stderr_done {
                break false;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break true,
                changed = cancel.changed(), if cancel_open => match changed {
                    Ok(()) if *cancel.borrow() => {
                        let _ = child.kill().await;
                        return Err(AppError::Interrupted);
                    }
                    Ok(()) => {}
                    Err(_) => cancel_open = false,
                },
                line = stdout_lines.next_line(), if !stdout_done => match line? {
                    Some(line) => {
                        transcript.line(&line);
                        combined.push_str(&line);
                        combined.push('\n');
                    }
                    None => stdout_done = true,
                },
                line = stderr_lines.next_line(), if !stderr_done => match line? {
                    Some(line) => {
                        transcript.line(&line);
                        combined.push_str(&line);
                        combined.push('\n');
                    }
                    None => stderr_done = true,
                },
            }
        };
        transcript.line("  ----------------------------------");

        if timed_out {
            let _ = child.kill().await;
            return Ok(ProcessOutcome {
                kind: OutcomeKind::Timeout,
                combined,
                elapsed: start.elapsed(),
            });
        }

        // Streams are closed; the process should exit promptly, but hold it
        // to the same deadline in case it lingers.
        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                return Ok(ProcessOutcome {
                    kind: OutcomeKind::Timeout,
                    combined,
                    elapsed: start.elapsed(),
                });
            }
        };

        Ok(classify(combined, status.code(), start.elapsed(), (self.clock)()))
    }
}

#[async_trait]
impl PlanGenerator for ClaudeGenerator {
    async fn generate(
        &self,
        number: u64,
        title: &str,
        body: &str,
        transcript: &Transcript,
    ) -> Result<String> {
        let prompt = self.build_prompt(number, title, body);
        let mut cancel = self.cancel.clone();

        for attempt in 1..=MAX_RETRIES {
            if *cancel.borrow() {
                return Err(AppError::Interrupted);
            }
            self.throttle.acquire().await;

            transcript.line(&format!(
                "Generating plan (attempt {attempt}/{MAX_RETRIES}, timeout: {}s)...",
                self.timeout.as_secs()
            ));

            let outcome = self.run_attempt(&prompt, transcript).await?;

            match outcome.kind {
                OutcomeKind::Ok => {
                    transcript.line(&format!(
                        "Generation completed in {}s ({} bytes)",
                        outcome.elapsed.as_secs(),
                        outcome.combined.len()
                    ));
                    return Ok(outcome.combined);
                }
                OutcomeKind::Timeout => {
                    // The deadline itself was the cost; retry immediately.
                    tracing::warn!(
                        issue = number,
                        timeout_secs = self.timeout.as_secs(),
                        "Generator timed out, retrying"
                    );
                }
                OutcomeKind::Transient { detail } => {
                    tracing::warn!(issue = number, detail = %detail, "Generator transient error");
                    if attempt < MAX_RETRIES {
                        backoff(attempt, &mut cancel).await?;
                    }
                }
                OutcomeKind::RateLimited { reset_epoch } => {
                    tracing::warn!(issue = number, reset_epoch, "Generator rate limited");
                    wait_until(reset_epoch, &mut cancel).await?;
                }
                OutcomeKind::HardError { code } => {
                    tracing::warn!(issue = number, code, "Generator exited non-zero, retrying");
                    if attempt < MAX_RETRIES {
                        backoff(attempt, &mut cancel).await?;
                    }
                }
            }
        }

        Err(AppError::GenerationExhausted(MAX_RETRIES))
    }

    fn build_prompt(&self, number: u64, title: &str, body: &str) -> String {
        let mut prompt = format!(
            "Create a detailed implementation plan for the following GitHub issue:\n\n\
             Issue #{number}: {title}\n\n{body}"
        );

        if self.replan {
            prompt.push_str("\nNOTE: This is a REPLAN request.\n");
            if let Some(reason) = &self.replan_reason {
                prompt.push_str(&format!("REPLAN REASON: {reason}\n"));
            }
        }

        prompt.push_str(&format!(
            "\n\nBUDGET: You have a maximum of {GENERATOR_MAX_TOOLS} tool calls and \
             {GENERATOR_MAX_STEPS} steps.\n\n\
             Output markdown with:\n\
             1. Summary\n\
             2. Step-by-step implementation tasks\n\
             3. Files to modify/create\n\
             4. Testing approach\n\
             5. Success criteria\n\n\
             End with:\n\
             ## Resource Usage\n"
        ));

        prompt
    }
}
