//! Error taxonomy for the grounding model.
//!
//! Configuration mismatches are detected while the model is being built and are
//! never recovered from. Invalid inputs fail the affected call only. A non-finite
//! training loss aborts the adaptation step before any parameter is touched.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GroundingError {
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("loss is {value}, stopping adaptation")]
    NonFiniteLoss { value: f32 },

    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, GroundingError>;

impl GroundingError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigMismatch(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Fail with [`GroundingError::ConfigMismatch`] unless `expected == got`.
pub(crate) fn ensure_len(what: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(GroundingError::config(format!(
            "{what}: expected {expected}, got {got}"
        )));
    }
    Ok(())
}
