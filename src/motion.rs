//! Coordinated multi-axis motion controller
//!
//! Drives the goniometer vector program: every trajectory is first submitted
//! in calculate-only mode so the controller validates it and reports
//! kinematic estimates, then re-issued for real. Completion is detected by
//! polling the running status against a timeout derived from the
//! controller's own estimate, since the 0->1->0 edges of that status cannot
//! be relied upon to arrive as separate notifications.

use futures::future::{try_join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::channels::{Signal, VectorProgram};
use crate::config::MotionConfig;
use crate::device::{ChannelValue, SharedDevice};
use crate::error::{NyxError, Result};

/// Per-axis start/end pairs plus scan timing, in engineering units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionVector {
    /// Rotation (omega) in degrees
    pub o: (f64, f64),
    /// Translations in mm
    pub x: (f64, f64),
    pub y: (f64, f64),
    pub z: (f64, f64),
    pub exposure_ms: f64,
    pub num_samples: u32,
    pub buffer_time_ms: f64,
    pub shutter_lag_time_ms: f64,
    pub shutter_time_ms: f64,
}

impl MotionVector {
    /// Reject values the controller could never accept. `end` may be below `start`.
    pub fn validate(&self) -> Result<()> {
        let axes = [("o", self.o), ("x", self.x), ("y", self.y), ("z", self.z)];
        for (name, (start, end)) in axes {
            if !start.is_finite() || !end.is_finite() {
                return Err(NyxError::InvalidInput(format!(
                    "axis {} has non-finite range ({}, {})",
                    name, start, end
                )));
            }
        }

        let timings = [
            ("exposure_ms", self.exposure_ms),
            ("buffer_time_ms", self.buffer_time_ms),
            ("shutter_lag_time_ms", self.shutter_lag_time_ms),
            ("shutter_time_ms", self.shutter_time_ms),
        ];
        for (name, value) in timings {
            if !value.is_finite() || value < 0.0 {
                return Err(NyxError::InvalidInput(format!("{} must be a non-negative number, got {}", name, value)));
            }
        }

        if self.num_samples == 0 {
            return Err(NyxError::InvalidInput("num_samples must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Error reported by the vector program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorError {
    None,
    Aborted,
    ZeroExposure,
    TooFast,
    ZeroShutter,
    TooSlow,
    /// Anything the controller reports outside the known set, kept verbatim
    Unknown(String),
}

impl VectorError {
    const LABELS: [&'static str; 6] = ["None", "Aborted", "Zero Exposure", "Too Fast", "Zero Shutter", "Too Slow"];

    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "None" => VectorError::None,
            "Aborted" => VectorError::Aborted,
            "Zero Exposure" => VectorError::ZeroExposure,
            "Too Fast" => VectorError::TooFast,
            "Zero Shutter" => VectorError::ZeroShutter,
            "Too Slow" => VectorError::TooSlow,
            other => VectorError::Unknown(other.to_string()),
        }
    }

    /// Accepts either the enum label or its index
    pub fn from_value(value: &ChannelValue) -> Self {
        match value {
            ChannelValue::Text(label) => Self::from_label(label),
            other => match other.as_i64() {
                Some(index) if (0..Self::LABELS.len() as i64).contains(&index) => {
                    Self::from_label(Self::LABELS[index as usize])
                }
                _ => VectorError::Unknown(other.as_text()),
            },
        }
    }

    pub fn label(&self) -> &str {
        match self {
            VectorError::None => "None",
            VectorError::Aborted => "Aborted",
            VectorError::ZeroExposure => "Zero Exposure",
            VectorError::TooFast => "Too Fast",
            VectorError::ZeroShutter => "Zero Shutter",
            VectorError::TooSlow => "Too Slow",
            VectorError::Unknown(label) => label,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, VectorError::None)
    }
}

impl fmt::Display for VectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Kinematic estimate read back after a calculate-only pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryEstimate {
    pub time_to_speed_ms: f64,
    pub buffer_time_ms: f64,
    pub shutter_time_ms: f64,
    pub daq_duration_ms: f64,
    pub timeout_multiplier: f64,
}

impl TrajectoryEstimate {
    /// Acceleration and deceleration, buffer, shutter open and close, acquisition
    pub fn total_ms(&self) -> f64 {
        2.0 * self.time_to_speed_ms + self.buffer_time_ms + 2.0 * self.shutter_time_ms + self.daq_duration_ms
    }

    /// Saturates at `Duration::MAX` when the product does not fit
    pub fn timeout(&self) -> Duration {
        let ms = (self.timeout_multiplier * self.total_ms()).max(0.0);
        Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(Duration::MAX)
    }
}

/// Result of one motion attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionOutcome {
    pub success: bool,
    pub error_code: VectorError,
    pub estimated_duration_ms: f64,
    pub actual_elapsed_ms: f64,
}

impl MotionOutcome {
    /// A timed-out motion is a failure, never a quiet success
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(NyxError::timeout(
                format!("vector motion (estimated {:.0} ms)", self.estimated_duration_ms),
                Duration::from_secs_f64(self.actual_elapsed_ms / 1000.0),
            ))
        }
    }
}

/// Fixed delays of the validate/go/poll cycle
#[derive(Debug, Clone, Copy)]
pub struct MotionTiming {
    /// Wait after a calculate-only go; there is no calculation-done signal
    pub calc_settle: Duration,
    /// Wait after the real go, to get past the idle->running edge
    pub start_settle: Duration,
    pub poll_interval: Duration,
    pub timeout_multiplier: f64,
}

impl Default for MotionTiming {
    fn default() -> Self {
        Self {
            calc_settle: Duration::from_millis(1000),
            start_settle: Duration::from_millis(200),
            poll_interval: Duration::from_millis(100),
            timeout_multiplier: 5.0,
        }
    }
}

impl From<&MotionConfig> for MotionTiming {
    fn from(config: &MotionConfig) -> Self {
        Self {
            calc_settle: config.calc_settle(),
            start_settle: config.start_settle(),
            poll_interval: config.poll_interval(),
            timeout_multiplier: config.timeout_multiplier(),
        }
    }
}

/// Estimate readbacks must be usable as durations
async fn finite(signal: &Signal) -> Result<f64> {
    let value = signal.get_f64().await?;
    if !value.is_finite() {
        return Err(NyxError::device(signal.read_pv(), format!("non-finite estimate {}", value)));
    }
    Ok(value)
}

/// Validates and executes vector trajectories. Holds no state between calls.
pub struct MotionController {
    program: VectorProgram,
    timing: MotionTiming,
}

impl MotionController {
    pub fn new(device: &SharedDevice, prefix: &str, timing: MotionTiming) -> Self {
        Self {
            program: VectorProgram::new(device, prefix),
            timing,
        }
    }

    /// Validate, execute and wait for one trajectory
    pub async fn run(&self, vector: &MotionVector) -> Result<MotionOutcome> {
        let estimate = self.validate(vector).await?;
        self.start().await?;
        self.track(&estimate).await?.into_result()
    }

    /// Submit the trajectory in calculate-only mode and read back the estimate.
    /// Nothing moves; a controller-reported error aborts here.
    pub async fn validate(&self, vector: &MotionVector) -> Result<TrajectoryEstimate> {
        vector.validate()?;
        let p = &self.program;

        p.sync.put(1).await?;

        let writes: Vec<BoxFuture<'_, Result<()>>> = vec![
            p.calc_only.put(1).boxed(),
            p.expose.put(1).boxed(),
            p.hold.put(0).boxed(),
            p.exposure.put(vector.exposure_ms).boxed(),
            p.num_samples.put(vector.num_samples).boxed(),
            p.buffer_time.put(vector.buffer_time_ms).boxed(),
            p.shutter_lag_time.put(vector.shutter_lag_time_ms).boxed(),
            p.shutter_time.put(vector.shutter_time_ms).boxed(),
            p.o.start.put(vector.o.0).boxed(),
            p.o.end.put(vector.o.1).boxed(),
            p.x.start.put(vector.x.0).boxed(),
            p.x.end.put(vector.x.1).boxed(),
            p.y.start.put(vector.y.0).boxed(),
            p.y.end.put(vector.y.1).boxed(),
            p.z.start.put(vector.z.0).boxed(),
            p.z.end.put(vector.z.1).boxed(),
        ];
        try_join_all(writes).await?;

        p.go.set_nowait(1).await?;
        sleep(self.timing.calc_settle).await;

        let code = VectorError::from_value(&p.error.get().await?);
        if !code.is_none() {
            error!("Vector program rejected trajectory: {}", code);
            return Err(NyxError::Motion(code));
        }

        let estimate = TrajectoryEstimate {
            time_to_speed_ms: finite(&p.max_time_to_speed).await?,
            buffer_time_ms: finite(&p.buffer_time).await?,
            shutter_time_ms: finite(&p.shutter_time).await?,
            daq_duration_ms: finite(&p.data_acq_duration).await?,
            timeout_multiplier: self.timing.timeout_multiplier,
        };
        info!(
            "Vector trajectory accepted: estimated {:.0} ms, timeout {:.1} s",
            estimate.total_ms(),
            estimate.timeout().as_secs_f64()
        );
        Ok(estimate)
    }

    /// Leave calculate-only mode and issue the real go
    pub async fn start(&self) -> Result<()> {
        self.program.calc_only.put(0).await?;
        self.program.go.set_nowait(1).await?;
        info!("Vector motion started");
        Ok(())
    }

    /// Poll the running status until it drops or the estimate-derived timeout passes.
    /// A timeout yields `success == false`; the motion itself is not stopped.
    pub async fn track(&self, estimate: &TrajectoryEstimate) -> Result<MotionOutcome> {
        let timeout = estimate.timeout();
        let started = Instant::now();

        sleep(self.timing.start_settle).await;

        let polling = Instant::now();
        let running = loop {
            let running = self.program.running.get_bool().await?;
            if !running || polling.elapsed() > timeout {
                break running;
            }
            sleep(self.timing.poll_interval).await;
        };

        let outcome = MotionOutcome {
            success: !running,
            error_code: VectorError::None,
            estimated_duration_ms: estimate.total_ms(),
            actual_elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        };

        if outcome.success {
            info!("Vector motion finished in {:.0} ms", outcome.actual_elapsed_ms);
        } else {
            warn!(
                "Vector motion still running after {:.1} s (estimated {:.0} ms)",
                timeout.as_secs_f64(),
                outcome.estimated_duration_ms
            );
        }
        Ok(outcome)
    }

    /// Abort a running trajectory. Never issued automatically.
    pub async fn abort(&self) -> Result<()> {
        warn!("Aborting vector motion");
        self.program.abort.put(1).await
    }
}
