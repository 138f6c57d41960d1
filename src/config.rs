use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{AppError, Result};

/// Hard ceiling on how many open issues a single run will fetch.
pub const MAX_ISSUES_FETCH: usize = 500;
/// Generation attempts per issue before giving up.
pub const MAX_RETRIES: u32 = 3;
/// Tool-call budget quoted in the generator prompt.
pub const GENERATOR_MAX_TOOLS: u32 = 50;
/// Step budget quoted in the generator prompt.
pub const GENERATOR_MAX_STEPS: u32 = 50;
/// Issue bodies above this many bytes are rejected outright.
pub const MAX_BODY_SIZE: usize = 1_048_576;
/// Titles above this many characters are truncated with a trailing marker.
pub const MAX_TITLE_LENGTH: usize = 500;

/// Comment header that marks an already-planned issue.
pub const PLAN_MARKER: &str = "## Detailed Implementation Plan";
/// Substring that marks a plan cut short by a provider rate limit.
pub const RATE_LIMIT_MARKER: &str = "Limit reached";

/// Shell metacharacters rejected in replan reasons. No shell is ever invoked,
/// but the reason ends up verbatim in prompts and comments, so stay strict.
pub const DANGEROUS_SHELL_CHARS: &[char] = &[';', '|', '&', '$', '`', '<', '>'];

pub const ALLOWED_EDITORS: &[&str] = &[
    "vim", "vi", "emacs", "nano", "code", "subl", "nvim", "helix", "micro", "edit",
];

/// Immutable per-run option snapshot, built once from the CLI.
#[derive(Debug, Clone)]
pub struct Options {
    pub auto: bool,
    pub replan: bool,
    pub replan_reason: Option<String>,
    pub dry_run: bool,
    pub cleanup: bool,
    pub parallel: bool,
    pub max_parallel: usize,
    pub timeout_secs: u64,
    pub throttle_secs: f64,
    pub json_output: bool,
}

impl Options {
    /// Reject option combinations before any issue is touched.
    pub fn validate(&self) -> Result<()> {
        if self.parallel && !self.auto {
            return Err(AppError::Startup(
                "--parallel requires --auto (interactive review cannot run concurrently)".into(),
            ));
        }
        if self.max_parallel == 0 {
            return Err(AppError::Startup("--max-parallel must be at least 1".into()));
        }
        if let Some(reason) = &self.replan_reason {
            if reason.contains(DANGEROUS_SHELL_CHARS) {
                return Err(AppError::Startup(
                    "--replan-reason contains unsafe shell characters".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Repo-relative path to the system-prompt document. Missing file is a
    /// fatal startup error for the whole run.
    #[serde(default = "default_prompt_path")]
    pub prompt_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// Directory holding per-issue resume markers across runs.
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_command() -> String {
    "claude".to_string()
}

fn default_model() -> String {
    "opus".to_string()
}

fn default_prompt_path() -> PathBuf {
    PathBuf::from(".claude/agents/chief-architect.md")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".hypha/state")
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            model: default_model(),
            prompt_path: default_prompt_path(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            // Try default paths
            builder = builder.add_source(config::File::with_name("hypha").required(false));
        }

        // Environment variable overrides with HYPHA_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("HYPHA")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> Options {
        Options {
            auto: false,
            replan: false,
            replan_reason: None,
            dry_run: false,
            cleanup: false,
            parallel: false,
            max_parallel: 4,
            timeout_secs: 600,
            throttle_secs: 0.0,
            json_output: false,
        }
    }

    #[test]
    fn parallel_requires_auto() {
        let mut opts = base_options();
        opts.parallel = true;
        assert!(opts.validate().is_err());

        opts.auto = true;
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn replan_reason_rejects_shell_metacharacters() {
        let mut opts = base_options();
        opts.replan = true;
        opts.replan_reason = Some("add error handling; rm -rf /".into());
        assert!(opts.validate().is_err());

        opts.replan_reason = Some("add error handling".into());
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn defaults_when_no_config_present() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.generator.command, "claude");
        assert_eq!(cfg.generator.model, "opus");
        assert_eq!(
            cfg.generator.prompt_path,
            PathBuf::from(".claude/agents/chief-architect.md")
        );
        assert_eq!(cfg.state.dir, PathBuf::from(".hypha/state"));
    }
}
