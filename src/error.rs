//! Error types for beamline orchestration

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::motion::VectorError;

pub type Result<T> = std::result::Result<T, NyxError>;

#[derive(Error, Debug)]
pub enum NyxError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Vector motion rejected by controller: {0}")]
    Motion(VectorError),

    #[error("Timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    #[error("File {} does not exist", .0.display())]
    MissingFile(PathBuf),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("{step} failed: {source}")]
    Step {
        step: String,
        source: Box<NyxError>,
    },

    #[error("Device error on {channel}: {message}")]
    Device { channel: String, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NyxError {
    pub fn device(channel: &str, message: impl Into<String>) -> Self {
        NyxError::Device {
            channel: channel.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(what: impl Into<String>, elapsed: Duration) -> Self {
        NyxError::Timeout {
            what: what.into(),
            elapsed,
        }
    }

    /// Wrap a failed sub-operation so the parent command reports both
    pub fn step(step: impl Into<String>, source: NyxError) -> Self {
        NyxError::Step {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// The innermost error of a `Step` chain
    pub fn root_cause(&self) -> &NyxError {
        match self {
            NyxError::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_chain_display() {
        let err = NyxError::step(
            "power on",
            NyxError::Verification("robot still unpowered".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "power on failed: Verification failed: robot still unpowered"
        );
        assert!(matches!(err.root_cause(), NyxError::Verification(_)));
    }

    #[test]
    fn test_motion_error_reports_device_label() {
        let err = NyxError::Motion(VectorError::TooFast);
        assert_eq!(err.to_string(), "Vector motion rejected by controller: Too Fast");
    }
}
