//! JSON Output for orchestrator runs
//!
//! One JSON object per line on stdout for documents, motion outcomes, robot
//! command results and errors, so runs can be piped into other tools.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::motion::MotionOutcome;

/// Seconds since the UNIX epoch, microsecond precision
pub fn current_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Asset document or event emitted by a collection cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentEvent {
    pub timestamp: f64,
    /// Event type for JSON parsing
    #[serde(rename = "type")]
    pub event_type: String,
    /// "resource", "datum" or "event"
    pub kind: String,
    pub document: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub success: bool,
    pub error_code: String,
    pub estimated_duration_ms: f64,
    pub actual_elapsed_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub command: String,
    pub status: RobotStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub error: String,
    /// Innermost cause when the error is a chain of steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl DocumentEvent {
    pub fn new(kind: &str, document: serde_json::Value) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "document".to_string(),
            kind: kind.to_string(),
            document,
        }
    }
}

impl From<&MotionOutcome> for MotionEvent {
    fn from(outcome: &MotionOutcome) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "motion".to_string(),
            success: outcome.success,
            error_code: outcome.error_code.to_string(),
            estimated_duration_ms: outcome.estimated_duration_ms,
            actual_elapsed_ms: outcome.actual_elapsed_ms,
        }
    }
}

impl RobotEvent {
    pub fn completed(command: &str) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "robot".to_string(),
            command: command.to_string(),
            status: RobotStatus::Completed,
            message: format!("{} completed", command),
        }
    }

    pub fn failed(command: &str, error: &str) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "robot".to_string(),
            command: command.to_string(),
            status: RobotStatus::Failed,
            message: error.to_string(),
        }
    }
}

impl ErrorEvent {
    pub fn new(error: &str, cause: Option<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            error: error.to_string(),
            cause,
        }
    }
}

/// Output a JSON event to stdout
pub fn output_event<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{}", json);
    }
}

/// Convenience functions for outputting specific event types
pub mod output {
    use super::*;
    use crate::error::NyxError;

    pub fn motion(outcome: &MotionOutcome) {
        output_event(&MotionEvent::from(outcome));
    }

    pub fn robot_completed(command: &str) {
        output_event(&RobotEvent::completed(command));
    }

    pub fn robot_failed(command: &str, error: &str) {
        output_event(&RobotEvent::failed(command, error));
    }

    /// Output an error, including its root cause when it differs
    pub fn error(err: &NyxError) {
        let root = err.root_cause();
        let cause = (!std::ptr::eq(root, err)).then(|| root.to_string());
        output_event(&ErrorEvent::new(&err.to_string(), cause));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::VectorError;

    #[test]
    fn test_event_type_field() {
        let event = RobotEvent::failed("mount", "spindle occupied");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "robot");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["message"], "spindle occupied");
    }

    #[test]
    fn test_motion_event_uses_device_label() {
        let outcome = MotionOutcome {
            success: false,
            error_code: VectorError::TooSlow,
            estimated_duration_ms: 100.0,
            actual_elapsed_ms: 600.0,
        };
        let json = serde_json::to_value(MotionEvent::from(&outcome)).unwrap();
        assert_eq!(json["error_code"], "Too Slow");
        assert_eq!(json["success"], false);
    }

    #[test]
    fn test_error_event_omits_missing_cause() {
        let json = serde_json::to_string(&ErrorEvent::new("boom", None)).unwrap();
        assert!(!json.contains("cause"));
        assert!(current_timestamp() > 1_600_000_000.0);
    }
}
