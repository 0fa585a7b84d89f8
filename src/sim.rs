//! In-memory simulated Device Interface
//!
//! `SimDevice` keeps every channel in a `watch` cell, records each write in
//! order and lets tests script how the "hardware" reacts to a write. The
//! [`SimDevice::beamline`] preset wires the reactions of a whole endstation
//! (vector program, detector, trigger box, robot) and backs the CLI.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::Config;
use crate::device::{ChannelValue, Device, SharedDevice};
use crate::error::{NyxError, Result};

/// One write observed by the simulator
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub channel: String,
    pub value: ChannelValue,
    pub confirm: bool,
}

type WriteHook = Arc<dyn Fn(&SimDevice, &ChannelValue) + Send + Sync>;

#[derive(Default)]
struct SimState {
    channels: Mutex<HashMap<String, watch::Sender<ChannelValue>>>,
    writes: Mutex<Vec<WriteRecord>>,
    hooks: Mutex<HashMap<String, Vec<WriteHook>>>,
    failing: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
}

/// Scriptable fake hardware; clones share the same channels
#[derive(Clone, Default)]
pub struct SimDevice {
    state: Arc<SimState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> SharedDevice {
        Arc::new(self.clone())
    }

    pub fn with_value(self, channel: &str, value: impl Into<ChannelValue>) -> Self {
        self.set_value(channel, value);
        self
    }

    /// Change a channel as the hardware would, notifying subscribers.
    /// Does not count as a write.
    pub fn set_value(&self, channel: &str, value: impl Into<ChannelValue>) {
        let value = value.into();
        let mut channels = lock(&self.state.channels);
        match channels.get(channel) {
            Some(tx) => {
                tx.send_replace(value);
            }
            None => {
                let (tx, _) = watch::channel(value);
                channels.insert(channel.to_string(), tx);
            }
        }
    }

    pub fn value(&self, channel: &str) -> Option<ChannelValue> {
        lock(&self.state.channels).get(channel).map(|tx| tx.borrow().clone())
    }

    fn has_channel(&self, channel: &str) -> bool {
        lock(&self.state.channels).contains_key(channel)
    }

    /// Every write so far, oldest first
    pub fn writes(&self) -> Vec<WriteRecord> {
        lock(&self.state.writes).clone()
    }

    /// Values written to one channel, oldest first
    pub fn writes_to(&self, channel: &str) -> Vec<ChannelValue> {
        lock(&self.state.writes)
            .iter()
            .filter(|w| w.channel == channel)
            .map(|w| w.value.clone())
            .collect()
    }

    pub fn clear_writes(&self) {
        lock(&self.state.writes).clear();
    }

    /// Run `hook` after every successful write to `channel`
    pub fn on_write<F>(&self, channel: &str, hook: F)
    where
        F: Fn(&SimDevice, &ChannelValue) + Send + Sync + 'static,
    {
        lock(&self.state.hooks)
            .entry(channel.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    /// Writes to `channel` are rejected by the device
    pub fn fail_writes(&self, channel: &str) {
        lock(&self.state.failing).insert(channel.to_string());
    }

    /// Writes to `channel` are never applied or confirmed
    pub fn stall_writes(&self, channel: &str) {
        lock(&self.state.stalled).insert(channel.to_string());
    }

    /// Setpoint writes are mirrored to their readback when it exists
    fn readback_of(&self, channel: &str) -> Option<String> {
        let candidate = match channel.strip_suffix("-SP") {
            Some(base) => format!("{}-I", base),
            None => format!("{}_RBV", channel),
        };
        self.has_channel(&candidate).then_some(candidate)
    }

    /// Idle vector program: readbacks present, no error, not running
    pub fn install_vector_program(&self, prefix: &str) {
        for name in ["Val:Exposure", "Val:NumSamples", "Val:BufferTime", "Val:ShutTime", "Val:ShutLagTime"] {
            self.set_value(&format!("{}{}-I", prefix, name), 0.0);
        }
        for motor in ["O", "X", "Y", "Z"] {
            self.set_value(&format!("{}Pos:{}Start-I", prefix, motor), 0.0);
            self.set_value(&format!("{}Pos:{}End-I", prefix, motor), 0.0);
            self.set_value(&format!("{}Val:{}TimeToSpeed-I", prefix, motor), 0.0);
            self.set_value(&format!("{}Sts:{}TooFast-Sts", prefix, motor), 0);
        }
        self.set_value(&format!("{}Val:DataAcqDuration-I", prefix), 0.0);
        self.set_value(&format!("{}Val:MaxTimeToSpeed-I", prefix), 0.0);
        self.set_value(&format!("{}Sts:Running-Sts", prefix), 0);
        self.set_value(&format!("{}Sts:State-Sts", prefix), "Idle");
        self.set_value(&format!("{}Sts:Error-Sts", prefix), "None");
    }

    /// Idle detector with every areaDetector readback present
    pub fn install_detector(&self, prefix: &str) {
        let readbacks: [(&str, ChannelValue); 18] = [
            ("SaveFiles", 0.into()),
            ("FileOwner", "".into()),
            ("FilePerms", 0.into()),
            ("AcquireTime", 0.0.into()),
            ("AcquirePeriod", 0.0.into()),
            ("NumTriggers", 0.into()),
            ("FilePath", "".into()),
            ("FWNamePattern", "".into()),
            ("SequenceId", 0.into()),
            ("BeamX", 0.0.into()),
            ("BeamY", 0.0.into()),
            ("OmegaIncr", 0.0.into()),
            ("OmegaStart", 0.0.into()),
            ("Wavelength", 0.0.into()),
            ("DetDist", 0.0.into()),
            ("TriggerMode", 0.into()),
            ("FWNImagesPerFile", 0.into()),
            ("Acquire", 0.into()),
        ];
        for (name, value) in readbacks {
            self.set_value(&format!("{}{}_RBV", prefix, name), value);
        }
        self.set_value(&format!("{}Armed", prefix), 0);
    }

    /// Robot powered, parked at `position`, tool 0 selected and mounted, spindle empty
    pub fn install_robot(&self, prefix: &str, position: &str) {
        let values: [(&str, ChannelValue); 8] = [
            ("Pwr-Sts", 1.into()),
            ("Mov-Sts", 0.into()),
            ("Tl-Sel", 0.into()),
            ("Tl-Sts", 0.into()),
            ("Samp:Dif-Sts", 0.into()),
            ("Pck:Dif-I", (-1).into()),
            ("Samp:Dif-I", (-1).into()),
            ("Pos-I", position.into()),
        ];
        for (name, value) in values {
            self.set_value(&format!("{}{}", prefix, name), value);
        }
    }

    /// A whole simulated endstation reacting to writes with plausible timing
    pub fn beamline(config: &Config) -> Self {
        let sim = SimDevice::new();
        let vec = config.channels.vector.clone();
        let det = config.channels.detector.clone();
        let robot = config.channels.robot.clone();
        let extension = config.assets.extension().to_string();
        let soak = config.robot.soak_position().to_string();

        sim.install_vector_program(&vec);
        sim.install_detector(&det);
        sim.install_robot(&robot, &soak);

        // Vector program: calculate-only passes publish estimates, real passes run
        sim.on_write(&format!("{}Cmd:Go-Cmd", vec), move |sim, _| {
            let read = |name: &str| sim.value(&format!("{}{}", vec, name)).and_then(|v| v.as_f64()).unwrap_or(0.0);
            let exposure = read("Val:Exposure-I");
            let samples = read("Val:NumSamples-I");

            if sim.value(&format!("{}CalcOnly-Sel", vec)).and_then(|v| v.as_bool()).unwrap_or(false) {
                let error = if exposure <= 0.0 { "Zero Exposure" } else { "None" };
                sim.set_value(&format!("{}Sts:Error-Sts", vec), error);
                sim.set_value(&format!("{}Val:MaxTimeToSpeed-I", vec), 25.0);
                sim.set_value(&format!("{}Val:DataAcqDuration-I", vec), exposure * samples);
                return;
            }

            let total_ms = 2.0 * read("Val:MaxTimeToSpeed-I")
                + read("Val:BufferTime-I")
                + 2.0 * read("Val:ShutTime-I")
                + read("Val:DataAcqDuration-I");
            sim.set_value(&format!("{}Sts:Running-Sts", vec), 1);

            let sim = sim.clone();
            let vec = vec.clone();
            let det = det.clone();
            let extension = extension.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(total_ms.max(0.0) / 1000.0)).await;
                sim.set_value(&format!("{}Sts:Running-Sts", vec), 0);
                if sim.value(&format!("{}Acquire_RBV", det)).and_then(|v| v.as_bool()).unwrap_or(false) {
                    sim.write_frames(&det, &extension);
                    sim.set_value(&format!("{}Armed", det), 0);
                    sim.set_value(&format!("{}Acquire_RBV", det), 0);
                }
            });
        });

        // Detector: acquire arms immediately
        let det = config.channels.detector.clone();
        sim.on_write(&format!("{}Acquire", det), move |sim, value| {
            let acquiring = value.as_bool().unwrap_or(false);
            sim.set_value(&format!("{}Armed", det), acquiring);
        });

        // Robot trajectories
        let traj = |name: &str| format!("{}Move:{}-Cmd", robot, name);
        let channel = {
            let robot = robot.clone();
            move |name: &str| format!("{}{}", robot, name)
        };
        {
            let channel = channel.clone();
            sim.on_write(&format!("{}Pwr:On-Cmd", robot), move |sim, _| {
                sim.set_value(&channel("Pwr-Sts"), 1);
            });
        }
        {
            let channel = channel.clone();
            sim.on_write(&format!("{}Tl-Sel", robot), move |sim, value| {
                sim.set_value(&channel("Tl-Sts"), value.clone());
            });
        }
        {
            let channel = channel.clone();
            let soak = soak.clone();
            sim.on_write(&traj("PutHt"), move |sim, _| {
                let puck = sim.value(&channel("Plt-SP")).unwrap_or(ChannelValue::Int(-1));
                let sample = sim.value(&channel("Samp-SP")).unwrap_or(ChannelValue::Int(-1));
                sim.set_value(&channel("Samp:Dif-Sts"), 1);
                sim.set_value(&channel("Pck:Dif-I"), puck);
                sim.set_value(&channel("Samp:Dif-I"), sample);
                sim.set_value(&channel("Pos-I"), soak.as_str());
            });
        }
        {
            let channel = channel.clone();
            let soak = soak.clone();
            sim.on_write(&traj("GetHt"), move |sim, _| {
                sim.set_value(&channel("Samp:Dif-Sts"), 0);
                sim.set_value(&channel("Pck:Dif-I"), -1);
                sim.set_value(&channel("Samp:Dif-I"), -1);
                sim.set_value(&channel("Pos-I"), soak.as_str());
            });
        }
        {
            let channel = channel.clone();
            let soak = soak.clone();
            sim.on_write(&traj("Sk"), move |sim, _| {
                sim.set_value(&channel("Pos-I"), soak.as_str());
            });
        }
        for name in ["Home", "Rcvr"] {
            let channel = channel.clone();
            sim.on_write(&traj(name), move |sim, _| {
                sim.set_value(&channel("Pos-I"), "HOME");
            });
        }

        sim
    }

    /// Write one empty frame file per trigger, named as the file writer would
    fn write_frames(&self, det: &str, extension: &str) {
        let text = |name: &str| self.value(&format!("{}{}_RBV", det, name)).map(|v| v.as_text()).unwrap_or_default();
        let int = |name: &str| self.value(&format!("{}{}_RBV", det, name)).and_then(|v| v.as_i64()).unwrap_or(0);

        let directory = PathBuf::from(text("FilePath"));
        let pattern = text("FWNamePattern");
        let prefix = pattern.strip_suffix("_$id").unwrap_or(&pattern).to_string();
        let first = int("SequenceId");
        let count = int("NumTriggers");

        for sequence in first..first + count {
            let path = directory.join(format!("{}_{:05}.{}", prefix, sequence, extension));
            if let Err(e) = std::fs::write(&path, b"") {
                warn!("Simulated detector could not write {}: {}", path.display(), e);
                return;
            }
        }
        debug!("Simulated detector wrote {} frames to {}", count, directory.display());
    }
}

#[async_trait]
impl Device for SimDevice {
    async fn read(&self, channel: &str) -> Result<ChannelValue> {
        self.value(channel)
            .ok_or_else(|| NyxError::device(channel, "no such channel"))
    }

    async fn write(&self, channel: &str, value: ChannelValue, confirm: bool) -> Result<()> {
        lock(&self.state.writes).push(WriteRecord {
            channel: channel.to_string(),
            value: value.clone(),
            confirm,
        });

        if lock(&self.state.failing).contains(channel) {
            return Err(NyxError::device(channel, "write rejected"));
        }

        if lock(&self.state.stalled).contains(channel) {
            if confirm {
                futures::future::pending::<()>().await;
            }
            return Ok(());
        }

        let readback = self.readback_of(channel);
        self.set_value(channel, value.clone());
        if let Some(readback) = readback {
            self.set_value(&readback, value.clone());
        }

        let hooks = lock(&self.state.hooks).get(channel).cloned().unwrap_or_default();
        for hook in hooks {
            hook(self, &value);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<watch::Receiver<ChannelValue>> {
        lock(&self.state.channels)
            .get(channel)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| NyxError::device(channel, "no such channel"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_writes_in_order() {
        let sim = SimDevice::new();
        let device = sim.shared();

        device.write("A", 1.into(), true).await.unwrap();
        device.write("B", "x".into(), false).await.unwrap();

        let writes = sim.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].channel, "A");
        assert!(writes[0].confirm);
        assert_eq!(writes[1].value, ChannelValue::Text("x".to_string()));
        assert!(!writes[1].confirm);
        assert_eq!(device.read("A").await.unwrap(), ChannelValue::Int(1));
    }

    #[tokio::test]
    async fn test_setpoint_mirrors_to_existing_readback() {
        let sim = SimDevice::new()
            .with_value("VEC:Val:Exposure-I", 0.0)
            .with_value("DET:Acquire_RBV", 0);

        sim.shared().write("VEC:Val:Exposure-SP", 12.5.into(), true).await.unwrap();
        sim.shared().write("DET:Acquire", 1.into(), false).await.unwrap();
        sim.shared().write("ROBOT:Plt-SP", 3.into(), true).await.unwrap();

        assert_eq!(sim.value("VEC:Val:Exposure-I"), Some(ChannelValue::Float(12.5)));
        assert_eq!(sim.value("DET:Acquire_RBV"), Some(ChannelValue::Int(1)));
        assert_eq!(sim.value("ROBOT:Plt-I"), None);
    }

    #[tokio::test]
    async fn test_missing_channel_read_fails() {
        let err = SimDevice::new().shared().read("NOPE").await.unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }

    #[tokio::test]
    async fn test_failing_write_is_recorded_but_not_applied() {
        let sim = SimDevice::new().with_value("A", 0);
        sim.fail_writes("A");

        assert!(sim.shared().write("A", 5.into(), true).await.is_err());
        assert_eq!(sim.value("A"), Some(ChannelValue::Int(0)));
        assert_eq!(sim.writes_to("A"), vec![ChannelValue::Int(5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_never_confirms() {
        let sim = SimDevice::new();
        sim.stall_writes("A");

        let result = tokio::time::timeout(Duration::from_secs(1), sim.shared().write("A", 1.into(), true)).await;
        assert!(result.is_err());
        assert_eq!(sim.value("A"), None);
    }

    #[tokio::test]
    async fn test_hooks_and_subscriptions() {
        let sim = SimDevice::new().with_value("DET:Armed", 0);
        sim.on_write("DET:Acquire", |sim, value| {
            sim.set_value("DET:Armed", value.clone());
        });
        let mut armed = sim.shared().subscribe("DET:Armed").await.unwrap();

        sim.shared().write("DET:Acquire", 1.into(), false).await.unwrap();

        armed.changed().await.unwrap();
        assert_eq!(*armed.borrow(), ChannelValue::Int(1));
    }

    #[tokio::test]
    async fn test_beamline_robot_put_updates_spindle() {
        let config = Config::default();
        let sim = SimDevice::beamline(&config);
        let robot = &config.channels.robot;
        let device = sim.shared();

        device.write(&format!("{}Plt-SP", robot), 2.into(), true).await.unwrap();
        device.write(&format!("{}Samp-SP", robot), 7.into(), true).await.unwrap();
        device.write(&format!("{}Move:PutHt-Cmd", robot), 1.into(), true).await.unwrap();

        assert_eq!(sim.value(&format!("{}Samp:Dif-Sts", robot)), Some(ChannelValue::Int(1)));
        assert_eq!(sim.value(&format!("{}Pck:Dif-I", robot)), Some(ChannelValue::Int(2)));
        assert_eq!(sim.value(&format!("{}Samp:Dif-I", robot)), Some(ChannelValue::Int(7)));
    }
}
