//! Error types shared by the inference core and the loaders/writers.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a demultiplexing run.
#[derive(Error, Debug)]
pub enum DemuxError {
    /// Count matrices and genotypes disagree in shape, or the donor count is missing
    #[error("input shape error: {message}")]
    InputShape { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    /// Every restart was discarded (numeric failure or cancellation)
    #[error("all {} restarts failed: {}", failures.len(), summarize(failures))]
    AllRestartsFailed { failures: Vec<RestartError> },

    #[error("parse error in {} at line {line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTSlib error: {0}")]
    Htslib(#[from] rust_htslib::errors::Error),
}

pub type Result<T> = std::result::Result<T, DemuxError>;

impl DemuxError {
    pub fn input_shape(message: impl Into<String>) -> Self {
        Self::InputShape {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}

/// Failure of a single restart. Never aborts the other restarts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RestartError {
    #[error("restart {restart}: non-finite {quantity} at iteration {iteration}")]
    NumericInstability {
        restart: usize,
        iteration: usize,
        quantity: &'static str,
    },

    #[error("restart {restart}: cancelled at iteration {iteration}")]
    Cancelled { restart: usize, iteration: usize },
}

impl RestartError {
    pub fn restart(&self) -> usize {
        match self {
            RestartError::NumericInstability { restart, .. } => *restart,
            RestartError::Cancelled { restart, .. } => *restart,
        }
    }
}

fn summarize(failures: &[RestartError]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
