//! Error types for the cvdd crate.

use thiserror::Error;

/// Top-level error type for CVDD operations.
#[derive(Debug, Error)]
pub enum CvddError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{first} ({first_dim}) must match {second} ({second_dim})")]
    DimensionMismatch {
        first: String,
        first_dim: usize,
        second: String,
        second_dim: usize,
    },

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Invalid line format: {reason}: {content} (line number {line})")]
    Parse {
        line: usize,
        content: String,
        reason: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CvddError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Fails with `DimensionMismatch` unless the two widths agree.
    pub fn check_dimensions_match(
        first_dim: usize,
        second_dim: usize,
        first: &str,
        second: &str,
    ) -> Result<()> {
        if first_dim != second_dim {
            return Err(Self::DimensionMismatch {
                first: first.to_string(),
                first_dim,
                second: second.to_string(),
                second_dim,
            });
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, CvddError>;
