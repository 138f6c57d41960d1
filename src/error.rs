use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to fetch issue: {0}")]
    Fetch(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Generator retries exceeded after {0} attempts")]
    GenerationExhausted(u32),

    #[error("Empty plan")]
    EmptyPlan,

    #[error("Review error: {0}")]
    Review(String),

    #[error("Failed to post comment: {0}")]
    Post(String),

    #[error("Interrupted by user")]
    Interrupted,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
