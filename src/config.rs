//! Configuration loading for the beamline orchestrator

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::{NyxError, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub channels: ChannelConfig,
    pub motion: MotionConfig,
    pub detector: DetectorConfig,
    pub zebra: ZebraConfig,
    pub assets: AssetConfig,
    pub robot: RobotConfig,
}

/// Control-system prefixes of each device
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub vector: String,
    pub detector: String,
    pub zebra: String,
    pub robot: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            vector: "XF:19IDC-ES{Gon:1-Vec}".to_string(),
            detector: "XF:19IDC-ES{Det:Eig16M}cam1:".to_string(),
            zebra: "XF:19IDC-ES{Zeb:1}:".to_string(),
            robot: "XF:19IDC-ES{Rbt:1}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MotionConfig {
    pub calc_settle_s: Option<f64>,
    pub start_settle_s: Option<f64>,
    pub poll_interval_s: Option<f64>,
    pub timeout_multiplier: Option<f64>,
    pub buffer_time_ms: Option<f64>,
    pub shutter_lag_time_ms: Option<f64>,
    pub shutter_time_ms: Option<f64>,
}

impl MotionConfig {
    /// Delay after a calculate-only go
    pub fn calc_settle(&self) -> Duration {
        secs(self.calc_settle_s, 1.0)
    }

    /// Delay after the real go before polling starts
    pub fn start_settle(&self) -> Duration {
        secs(self.start_settle_s, 0.2)
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_s, 0.1)
    }

    pub fn timeout_multiplier(&self) -> f64 {
        self.timeout_multiplier.unwrap_or(5.0)
    }

    pub fn buffer_time_ms(&self) -> f64 {
        self.buffer_time_ms.unwrap_or(50.0)
    }

    pub fn shutter_lag_time_ms(&self) -> f64 {
        self.shutter_lag_time_ms.unwrap_or(2.0)
    }

    pub fn shutter_time_ms(&self) -> f64 {
        self.shutter_time_ms.unwrap_or(2.0)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub name: Option<String>,
    pub arm_timeout_s: Option<f64>,
    /// Bound on the acquiring->idle wait in `complete`; 0 disables it
    pub acquire_timeout_s: Option<f64>,
    pub images_per_file: Option<u32>,
    pub file_perms: Option<u32>,
    pub file_owner: Option<String>,
}

impl DetectorConfig {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("eiger")
    }

    pub fn arm_timeout(&self) -> Duration {
        secs(self.arm_timeout_s, 10.0)
    }

    /// `None` (wait forever) for 0 or `.inf`
    pub fn acquire_timeout(&self) -> Option<Duration> {
        let s = self.acquire_timeout_s.unwrap_or(600.0);
        (s > 0.0 && s.is_finite()).then(|| secs(Some(s), 0.0))
    }

    pub fn images_per_file(&self) -> u32 {
        self.images_per_file.unwrap_or(1000)
    }

    /// rw-r--r--
    pub fn file_perms(&self) -> u32 {
        self.file_perms.unwrap_or(420)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ZebraConfig {
    pub reset_settle_s: Option<f64>,
}

impl ZebraConfig {
    pub fn reset_settle(&self) -> Duration {
        secs(self.reset_settle_s, 2.0)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AssetConfig {
    pub spec: Option<String>,
    pub extension: Option<String>,
    pub data_keys: Option<Vec<String>>,
}

impl AssetConfig {
    pub fn spec(&self) -> &str {
        self.spec.as_deref().unwrap_or("AD_PILATUS_MX")
    }

    pub fn extension(&self) -> &str {
        self.extension.as_deref().unwrap_or("cbf")
    }

    pub fn data_keys(&self) -> Vec<String> {
        self.data_keys
            .clone()
            .unwrap_or_else(|| vec!["data".to_string(), "omega".to_string()])
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RobotConfig {
    pub command_timeout_s: Option<f64>,
    pub soak_position: Option<String>,
}

impl RobotConfig {
    pub fn command_timeout(&self) -> Duration {
        secs(self.command_timeout_s, 60.0)
    }

    pub fn soak_position(&self) -> &str {
        self.soak_position.as_deref().unwrap_or("SOAK")
    }
}

/// Saturating; `Config::validate` rejects values that would saturate
fn secs(value: Option<f64>, default: f64) -> Duration {
    Duration::try_from_secs_f64(value.unwrap_or(default).max(0.0)).unwrap_or(Duration::MAX)
}

fn check_secs(name: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(s) if Duration::try_from_secs_f64(s).is_err() => Err(NyxError::Config(format!(
            "{} must be a non-negative number of seconds, got {}",
            name, s
        ))),
        _ => Ok(()),
    }
}

impl Config {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| NyxError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let durations = [
            ("motion.calc_settle_s", self.motion.calc_settle_s),
            ("motion.start_settle_s", self.motion.start_settle_s),
            ("motion.poll_interval_s", self.motion.poll_interval_s),
            ("detector.arm_timeout_s", self.detector.arm_timeout_s),
            ("zebra.reset_settle_s", self.zebra.reset_settle_s),
            ("robot.command_timeout_s", self.robot.command_timeout_s),
        ];
        for (name, value) in durations {
            check_secs(name, value)?;
        }
        if let Some(s) = self.detector.acquire_timeout_s {
            if s.is_nan() || s < 0.0 {
                return Err(NyxError::Config(format!(
                    "detector.acquire_timeout_s must be non-negative, got {}",
                    s
                )));
            }
        }

        let timings = [
            ("motion.buffer_time_ms", self.motion.buffer_time_ms()),
            ("motion.shutter_lag_time_ms", self.motion.shutter_lag_time_ms()),
            ("motion.shutter_time_ms", self.motion.shutter_time_ms()),
        ];
        if let Some((name, value)) = timings.iter().find(|(_, v)| !v.is_finite()) {
            return Err(NyxError::Config(format!("{} is not finite: {}", name, value)));
        }

        if !self.motion.timeout_multiplier().is_finite() || self.motion.timeout_multiplier() < 1.0 {
            return Err(NyxError::Config(format!(
                "motion.timeout_multiplier must be a finite number >= 1.0, got {}",
                self.motion.timeout_multiplier()
            )));
        }
        if self.assets.data_keys().is_empty() {
            return Err(NyxError::Config("assets.data_keys must not be empty".to_string()));
        }
        Ok(())
    }
}
