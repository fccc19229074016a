//! Error types for chart synthesis

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the charter stages.
///
/// `MissingInput` and `MissingChart` abort only the stage that hit them; the
/// in-process pipeline logs them and moves on to the next stage.
#[derive(Debug, Error)]
pub enum ChartError {
    /// A required input file does not exist
    #[error("missing input file: {}", .0.display())]
    MissingInput(PathBuf),

    /// The chart file has no body for the requested difficulty
    #[error("no chart for difficulty '{0}'")]
    MissingChart(String),

    /// Structural failure while reading the chart text format
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Tempo segments violate ordering/contiguity rules
    #[error("invalid timing: {0}")]
    InvalidTiming(String),

    /// Note grid violates a hold/input invariant
    #[error("invalid note grid: {0}")]
    InvalidGrid(String),

    /// Feature data is present but unusable
    #[error("invalid feature data: {0}")]
    InvalidFeatures(String),

    /// Configuration value out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ChartError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        ChartError::Parse {
            line,
            message: message.into(),
        }
    }

    /// Whether the pipeline may skip the failing stage and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChartError::MissingInput(_) | ChartError::MissingChart(_) | ChartError::InvalidFeatures(_)
        )
    }
}

/// Result alias used across the charter crate
pub type Result<T> = std::result::Result<T, ChartError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ChartError::MissingChart("Hard".to_string());
        assert_eq!(err.to_string(), "no chart for difficulty 'Hard'");

        let err = ChartError::parse(12, "unterminated tag");
        assert_eq!(err.to_string(), "parse error at line 12: unterminated tag");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(ChartError::MissingChart("Easy".into()).is_recoverable());
        assert!(ChartError::MissingInput(PathBuf::from("a.sm")).is_recoverable());
        assert!(!ChartError::parse(1, "bad").is_recoverable());
    }
}
