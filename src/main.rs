use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hypha::config::{AppConfig, Options};
use hypha::error::AppError;
use hypha::generator::{ClaudeGenerator, PlanGenerator};
use hypha::orchestrator::{Orchestrator, RunSummary};
use hypha::processor::ItemProcessor;
use hypha::review::{EditorReviewer, Reviewer};
use hypha::scratch::Scratch;
use hypha::throttle::Throttle;
use hypha::tracker::gh::GhTracker;
use hypha::tracker::Tracker;

#[derive(Parser)]
#[command(
    name = "hypha",
    about = "Generate and post implementation plans for GitHub issues using Claude",
    after_help = "Examples:\n  \
        hypha --limit 5                    First 5 open issues\n  \
        hypha --issues 123,456             Specific issues only\n  \
        hypha --auto --replan              Auto mode, allow replanning\n  \
        hypha --issues 123 --replan-reason 'Need to add error handling'\n  \
        hypha --dry-run --issues 123       Preview without calling Claude\n  \
        hypha --auto --parallel --max-parallel 8   8 concurrent jobs"
)]
struct Cli {
    /// Only process the first N issues
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Only process specific issue numbers
    #[arg(long, value_name = "N,M,...")]
    issues: Option<String>,

    /// Non-interactive mode: skip editor review, auto-post plans
    #[arg(long)]
    auto: bool,

    /// Re-plan issues that already have plans
    #[arg(long)]
    replan: bool,

    /// Re-plan with context (implies --replan)
    #[arg(long, value_name = "TXT")]
    replan_reason: Option<String>,

    /// Preview which issues would be processed without calling the generator
    #[arg(long)]
    dry_run: bool,

    /// Delete scratch state on completion
    #[arg(long)]
    cleanup: bool,

    /// Process issues in parallel (requires --auto)
    #[arg(long)]
    parallel: bool,

    /// Max concurrent jobs
    #[arg(long, default_value_t = 4, value_name = "N")]
    max_parallel: usize,

    /// Timeout per generation attempt in seconds
    #[arg(long, default_value_t = 600, value_name = "SEC")]
    timeout: u64,

    /// Minimum seconds between generator call starts
    #[arg(long, default_value_t = 0.0, value_name = "SEC")]
    throttle: f64,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn parse_issue_list(raw: &str) -> anyhow::Result<Vec<u64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .with_context(|| format!("Invalid issue number '{s}' - must be numeric"))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so transcripts and --json stay clean on stdout.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let opts = Options {
        auto: cli.auto,
        replan: cli.replan || cli.replan_reason.is_some(),
        replan_reason: cli.replan_reason,
        dry_run: cli.dry_run,
        cleanup: cli.cleanup,
        parallel: cli.parallel,
        max_parallel: cli.max_parallel,
        timeout_secs: cli.timeout,
        throttle_secs: cli.throttle,
        json_output: cli.json,
    };
    opts.validate()?;

    let explicit_issues = cli.issues.as_deref().map(parse_issue_list).transpose()?;

    let config = AppConfig::load(cli.config.as_deref())?;
    let repo_root = std::env::current_dir().context("Failed to resolve working directory")?;

    let prompt_path = repo_root.join(&config.generator.prompt_path);
    let system_prompt = std::fs::read_to_string(&prompt_path).map_err(|_| {
        AppError::Startup(format!("Missing system prompt: {}", prompt_path.display()))
    })?;

    let scratch = Arc::new(Scratch::create(&repo_root.join(&config.state.dir))?);

    tracing::info!(dir = %scratch.dir().display(), "Scratch directory");
    tracing::info!(
        "Mode: {}",
        if opts.auto {
            "AUTO (non-interactive, plans auto-posted)"
        } else {
            "INTERACTIVE (editor review before posting)"
        }
    );
    if opts.parallel {
        tracing::info!(jobs = opts.max_parallel, "Parallel: ENABLED");
    }
    if opts.dry_run {
        tracing::info!("Dry-run: ENABLED (no changes will be made to GitHub)");
    }
    if opts.cleanup {
        tracing::info!("Cleanup: ENABLED (scratch state deleted on completion)");
    }
    if opts.replan {
        tracing::info!("Replan: ENABLED (will re-plan issues with existing plans)");
        if let Some(reason) = &opts.replan_reason {
            tracing::info!(reason = %reason, "Replan reason");
        }
    } else {
        tracing::info!("Replan: DISABLED (will skip issues with existing plans)");
    }

    // Ctrl+C flips the cancellation watch; in-flight generator attempts,
    // backoffs, and rate-limit waits all select on it and the orchestrator
    // aborts outstanding workers. A second Ctrl+C exits outright, since the
    // tokio handler keeps absorbing the signal once installed.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl+C, aborting run...");
            let _ = cancel_tx.send(true);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Second Ctrl+C, exiting immediately");
            std::process::exit(130);
        }
    });

    let tracker: Arc<dyn Tracker> = Arc::new(GhTracker::new());
    let throttle = Arc::new(Throttle::new(opts.throttle_secs));
    let generator: Arc<dyn PlanGenerator> = Arc::new(ClaudeGenerator::new(
        &config.generator,
        &opts,
        &repo_root,
        &system_prompt,
        throttle,
        cancel_rx.clone(),
    ));
    let reviewer: Option<Arc<dyn Reviewer>> = if opts.auto {
        None
    } else {
        Some(Arc::new(EditorReviewer::new(scratch.dir())))
    };

    let issue_list = match explicit_issues {
        Some(issues) => issues,
        None => tracker.list_open(cli.limit).await?,
    };

    println!();
    println!("==========================================");
    println!("  Issue Planning");
    println!("  Total issues to process: {}", issue_list.len());
    if opts.parallel {
        println!("  Parallel jobs: {}", opts.max_parallel);
    }
    println!("==========================================");
    println!();

    let processor = Arc::new(ItemProcessor::new(
        tracker,
        generator,
        reviewer,
        Arc::clone(&scratch),
        opts.clone(),
    ));
    let orchestrator = Orchestrator::new(
        processor,
        opts.parallel,
        opts.max_parallel,
        cancel_rx.clone(),
    );

    let results = orchestrator.run(&issue_list).await;
    let summary = RunSummary::from_results(&results);

    if opts.json_output {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        println!();
        println!("==========================================");
        println!("  Summary");
        println!("  Posted:  {}", summary.posted);
        println!("  Skipped: {}", summary.skipped);
        println!("  Errors:  {}", summary.errors);
        println!("  Total:   {}", summary.total);
        if !opts.cleanup {
            println!();
            println!("  Scratch directory: {}", scratch.dir().display());
        }
        println!("==========================================");
    }

    if opts.cleanup {
        scratch.cleanup();
    }

    if *cancel_rx.borrow() {
        std::process::exit(130);
    }
    if summary.errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}
