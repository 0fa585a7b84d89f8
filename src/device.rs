//! Device Interface contract
//!
//! The orchestration core talks to the beamline control system only through
//! this trait: synchronous-style read, write (optionally waiting for the
//! device to confirm the value was applied) and value-change subscription.
//! Transport details live behind the implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::Result;

/// Value carried by a hardware control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ChannelValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelValue::Int(v) => Some(*v as f64),
            ChannelValue::Float(v) => Some(*v),
            ChannelValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ChannelValue::Int(v) => Some(*v),
            ChannelValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            ChannelValue::Float(_) => None,
            ChannelValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Non-zero numbers are true; text accepts the usual enum labels
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ChannelValue::Int(v) => Some(*v != 0),
            ChannelValue::Float(v) => Some(*v != 0.0),
            ChannelValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Some(true),
                "0" | "false" | "off" | "no" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelValue::Int(v) => write!(f, "{}", v),
            ChannelValue::Float(v) => write!(f, "{}", v),
            ChannelValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ChannelValue {
    fn from(v: i64) -> Self {
        ChannelValue::Int(v)
    }
}

impl From<i32> for ChannelValue {
    fn from(v: i32) -> Self {
        ChannelValue::Int(v as i64)
    }
}

impl From<u32> for ChannelValue {
    fn from(v: u32) -> Self {
        ChannelValue::Int(v as i64)
    }
}

impl From<f64> for ChannelValue {
    fn from(v: f64) -> Self {
        ChannelValue::Float(v)
    }
}

impl From<bool> for ChannelValue {
    fn from(v: bool) -> Self {
        ChannelValue::Int(v as i64)
    }
}

impl From<&str> for ChannelValue {
    fn from(v: &str) -> Self {
        ChannelValue::Text(v.to_string())
    }
}

impl From<String> for ChannelValue {
    fn from(v: String) -> Self {
        ChannelValue::Text(v)
    }
}

/// Named hardware control channels
///
/// Implementations serialize concurrent requests themselves; callers hold
/// no locks around these calls.
#[async_trait]
pub trait Device: Send + Sync {
    /// Read the current value of a channel
    async fn read(&self, channel: &str) -> Result<ChannelValue>;

    /// Write a value. With `confirm` set, resolves only once the device
    /// reports the value applied; otherwise returns as soon as it is sent.
    async fn write(&self, channel: &str, value: ChannelValue, confirm: bool) -> Result<()>;

    /// Subscribe to value changes. The receiver starts at the current value.
    async fn subscribe(&self, channel: &str) -> Result<watch::Receiver<ChannelValue>>;
}

pub type SharedDevice = Arc<dyn Device>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(ChannelValue::from(3).as_f64(), Some(3.0));
        assert_eq!(ChannelValue::from(2.0).as_i64(), Some(2));
        assert_eq!(ChannelValue::from(2.5).as_i64(), None);
        assert_eq!(ChannelValue::from("42").as_i64(), Some(42));
        assert_eq!(ChannelValue::from(true), ChannelValue::Int(1));
        assert_eq!(ChannelValue::from("On").as_bool(), Some(true));
        assert_eq!(ChannelValue::from("Too Fast").as_bool(), None);
        assert_eq!(ChannelValue::from("Too Fast").as_text(), "Too Fast");
    }

    #[test]
    fn test_untagged_yaml_values() {
        let values: Vec<ChannelValue> = serde_yaml::from_str("[1, 2.5, SOAK]").unwrap();
        assert_eq!(
            values,
            vec![
                ChannelValue::Int(1),
                ChannelValue::Float(2.5),
                ChannelValue::Text("SOAK".to_string())
            ]
        );
    }
}
