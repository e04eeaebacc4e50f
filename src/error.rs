//! Error types for qlora-mt.

use thiserror::Error;

/// Result type alias for qlora-mt operations.
pub type Result<T> = std::result::Result<T, TuneError>;

/// Errors that can occur while fine-tuning or evaluating.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TuneError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Model loading or merging error.
    #[error("model error: {0}")]
    Model(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Text generation error.
    #[error("generation error: {0}")]
    Generation(String),

    /// Metric computation error.
    #[error("metric error: {0}")]
    Metric(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    /// Hugging Face Hub error.
    #[error("hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(#[from] indicatif::style::TemplateError),

    /// Other errors.
    #[error("{0}")]
    Other(String),
}
