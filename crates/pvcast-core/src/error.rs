//! Error types for the forecast pipeline.
//!
//! The first five variants are the pipeline's own failure kinds; recoverable
//! ones become per-site status at stage boundaries. Only `Config` (and a run
//! where no model resolves) fails a run.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Input unavailable: {0}")]
    InputUnavailable(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
