//! Typed channel bindings
//!
//! Thin accessors that map semantic fields onto control-system channel
//! names. Names are kept identical to the deployed IOCs so recorded traces
//! can be replayed against either side.

use tokio::sync::watch;

use crate::device::{ChannelValue, SharedDevice};
use crate::error::{NyxError, Result};

/// One logical signal, possibly split into setpoint and readback channels
#[derive(Clone)]
pub struct Signal {
    device: SharedDevice,
    read_pv: String,
    write_pv: String,
}

impl Signal {
    /// Signal read and written on the same channel
    pub fn new(device: &SharedDevice, pv: impl Into<String>) -> Self {
        let pv = pv.into();
        Self {
            device: device.clone(),
            read_pv: pv.clone(),
            write_pv: pv,
        }
    }

    /// Vector-program style pair: writes `<pv>-SP`, reads `<pv>-I`
    pub fn with_rbv(device: &SharedDevice, pv: &str) -> Self {
        Self {
            device: device.clone(),
            read_pv: format!("{}-I", pv),
            write_pv: format!("{}-SP", pv),
        }
    }

    /// areaDetector style pair: writes `<pv>`, reads `<pv>_RBV`
    pub fn with_ad_rbv(device: &SharedDevice, pv: &str) -> Self {
        Self {
            device: device.clone(),
            read_pv: format!("{}_RBV", pv),
            write_pv: pv.to_string(),
        }
    }

    pub fn read_pv(&self) -> &str {
        &self.read_pv
    }

    pub fn write_pv(&self) -> &str {
        &self.write_pv
    }

    pub async fn get(&self) -> Result<ChannelValue> {
        self.device.read(&self.read_pv).await
    }

    pub async fn get_f64(&self) -> Result<f64> {
        let value = self.get().await?;
        value
            .as_f64()
            .ok_or_else(|| NyxError::device(&self.read_pv, format!("expected a number, got '{}'", value)))
    }

    pub async fn get_i64(&self) -> Result<i64> {
        let value = self.get().await?;
        value
            .as_i64()
            .ok_or_else(|| NyxError::device(&self.read_pv, format!("expected an integer, got '{}'", value)))
    }

    pub async fn get_bool(&self) -> Result<bool> {
        let value = self.get().await?;
        value
            .as_bool()
            .ok_or_else(|| NyxError::device(&self.read_pv, format!("expected a boolean, got '{}'", value)))
    }

    pub async fn get_text(&self) -> Result<String> {
        Ok(self.get().await?.as_text())
    }

    /// Write and wait for the device to confirm
    pub async fn put(&self, value: impl Into<ChannelValue>) -> Result<()> {
        self.device.write(&self.write_pv, value.into(), true).await
    }

    /// Write without waiting for confirmation
    pub async fn set_nowait(&self, value: impl Into<ChannelValue>) -> Result<()> {
        self.device.write(&self.write_pv, value.into(), false).await
    }

    pub async fn subscribe(&self) -> Result<watch::Receiver<ChannelValue>> {
        self.device.subscribe(&self.read_pv).await
    }
}

/// Per-axis channels of the vector program
#[derive(Clone)]
pub struct VectorMotor {
    pub start: Signal,
    pub end: Signal,
    pub too_fast: Signal,
    pub time_to_speed: Signal,
}

impl VectorMotor {
    fn new(device: &SharedDevice, prefix: &str, motor: &str) -> Self {
        Self {
            start: Signal::with_rbv(device, &format!("{}Pos:{}Start", prefix, motor)),
            end: Signal::with_rbv(device, &format!("{}Pos:{}End", prefix, motor)),
            too_fast: Signal::new(device, format!("{}Sts:{}TooFast-Sts", prefix, motor)),
            time_to_speed: Signal::new(device, format!("{}Val:{}TimeToSpeed-I", prefix, motor)),
        }
    }
}

/// Coordinated multi-axis vector program
#[derive(Clone)]
pub struct VectorProgram {
    /// Exposure per sample (ms)
    pub exposure: Signal,
    pub num_samples: Signal,
    /// Buffer motion time (ms)
    pub buffer_time: Signal,
    /// Shutter opening/closing time (ms)
    pub shutter_time: Signal,
    pub shutter_lag_time: Signal,
    pub expose: Signal,
    /// Validate and compute the profile without moving
    pub calc_only: Signal,
    pub hold: Signal,
    pub o: VectorMotor,
    pub x: VectorMotor,
    pub y: VectorMotor,
    pub z: VectorMotor,
    pub data_acq_duration: Signal,
    pub max_time_to_speed: Signal,
    pub running: Signal,
    pub state: Signal,
    pub error: Signal,
    pub go: Signal,
    pub proceed: Signal,
    pub abort: Signal,
    /// Copy current readbacks into all axis setpoints
    pub sync: Signal,
}

impl VectorProgram {
    pub fn new(device: &SharedDevice, prefix: &str) -> Self {
        let rbv = |name: &str| Signal::with_rbv(device, &format!("{}{}", prefix, name));
        let plain = |name: &str| Signal::new(device, format!("{}{}", prefix, name));

        Self {
            exposure: rbv("Val:Exposure"),
            num_samples: rbv("Val:NumSamples"),
            buffer_time: rbv("Val:BufferTime"),
            shutter_time: rbv("Val:ShutTime"),
            shutter_lag_time: rbv("Val:ShutLagTime"),
            expose: plain("Expose-Sel"),
            calc_only: plain("CalcOnly-Sel"),
            hold: plain("Hold-Sel"),
            o: VectorMotor::new(device, prefix, "O"),
            x: VectorMotor::new(device, prefix, "X"),
            y: VectorMotor::new(device, prefix, "Y"),
            z: VectorMotor::new(device, prefix, "Z"),
            data_acq_duration: plain("Val:DataAcqDuration-I"),
            max_time_to_speed: plain("Val:MaxTimeToSpeed-I"),
            running: plain("Sts:Running-Sts"),
            state: plain("Sts:State-Sts"),
            error: plain("Sts:Error-Sts"),
            go: plain("Cmd:Go-Cmd"),
            proceed: plain("Cmd:Proceed-Cmd"),
            abort: plain("Cmd:Abort-Cmd"),
            sync: plain("Cmd:Sync-Cmd"),
        }
    }
}

/// Eiger camera plugin channels
#[derive(Clone)]
pub struct EigerCam {
    pub save_files: Signal,
    pub file_owner: Signal,
    pub file_perms: Signal,
    pub acquire_time: Signal,
    pub acquire_period: Signal,
    pub num_triggers: Signal,
    pub file_path: Signal,
    pub name_pattern: Signal,
    pub sequence_id: Signal,
    pub beam_center_x: Signal,
    pub beam_center_y: Signal,
    pub omega_incr: Signal,
    pub omega_start: Signal,
    pub wavelength: Signal,
    pub det_distance: Signal,
    pub trigger_mode: Signal,
    pub images_per_file: Signal,
    /// Acquisition status: 1 while acquiring, 0 when idle
    pub acquire: Signal,
    pub armed: Signal,
}

impl EigerCam {
    pub fn new(device: &SharedDevice, prefix: &str) -> Self {
        let ad = |name: &str| Signal::with_ad_rbv(device, &format!("{}{}", prefix, name));

        Self {
            save_files: ad("SaveFiles"),
            file_owner: ad("FileOwner"),
            file_perms: ad("FilePerms"),
            acquire_time: ad("AcquireTime"),
            acquire_period: ad("AcquirePeriod"),
            num_triggers: ad("NumTriggers"),
            file_path: ad("FilePath"),
            name_pattern: ad("FWNamePattern"),
            sequence_id: ad("SequenceId"),
            beam_center_x: ad("BeamX"),
            beam_center_y: ad("BeamY"),
            omega_incr: ad("OmegaIncr"),
            omega_start: ad("OmegaStart"),
            wavelength: ad("Wavelength"),
            det_distance: ad("DetDist"),
            trigger_mode: ad("TriggerMode"),
            images_per_file: ad("FWNImagesPerFile"),
            acquire: ad("Acquire"),
            armed: Signal::new(device, format!("{}Armed", prefix)),
        }
    }
}

/// Zebra position-compare and output channels
#[derive(Clone)]
pub struct ZebraChannels {
    pub reset: Signal,
    pub out1: Signal,
    pub m1_set_pos: Signal,
    pub m2_set_pos: Signal,
    pub m3_set_pos: Signal,
    pub arm_trig_source: Signal,
    pub arm: Signal,
    pub gate_start: Signal,
    pub gate_width: Signal,
    pub gate_step: Signal,
    pub gate_num: Signal,
    pub pulse_start: Signal,
    pub pulse_width: Signal,
    pub pulse_step: Signal,
    pub pulse_delay: Signal,
    pub pulse_max: Signal,
}

impl ZebraChannels {
    pub fn new(device: &SharedDevice, prefix: &str) -> Self {
        let plain = |name: &str| Signal::new(device, format!("{}{}", prefix, name));

        Self {
            reset: plain("SYS_RESET.PROC"),
            out1: plain("OUT1_TTL"),
            m1_set_pos: plain("M1:SETPOS.PROC"),
            m2_set_pos: plain("M2:SETPOS.PROC"),
            m3_set_pos: plain("M3:SETPOS.PROC"),
            arm_trig_source: plain("PC_ARM_SEL"),
            arm: plain("PC_ARM"),
            gate_start: plain("PC_GATE_START"),
            gate_width: plain("PC_GATE_WID"),
            gate_step: plain("PC_GATE_STEP"),
            gate_num: plain("PC_GATE_NGATE"),
            pulse_start: plain("PC_PULSE_START"),
            pulse_width: plain("PC_PULSE_WID"),
            pulse_step: plain("PC_PULSE_STEP"),
            pulse_delay: plain("PC_PULSE_DLY"),
            pulse_max: plain("PC_PULSE_MAX"),
        }
    }
}

/// ISARA sample-exchange robot channels
#[derive(Clone)]
pub struct IsaraChannels {
    pub power_on: Signal,
    pub powered: Signal,
    pub moving: Signal,
    pub home_traj: Signal,
    pub recover_traj: Signal,
    pub get_traj: Signal,
    pub put_traj: Signal,
    pub soak_traj: Signal,
    /// Tool the next trajectory will use
    pub tool_selected: Signal,
    /// Tool physically mounted on the arm
    pub tool_mounted: Signal,
    pub puck_selected: Signal,
    pub sample_selected: Signal,
    pub spindle_occupied: Signal,
    pub puck_on_spindle: Signal,
    pub sample_on_spindle: Signal,
    /// Name of the arm's current position
    pub position: Signal,
}

impl IsaraChannels {
    pub fn new(device: &SharedDevice, prefix: &str) -> Self {
        let plain = |name: &str| Signal::new(device, format!("{}{}", prefix, name));

        Self {
            power_on: plain("Pwr:On-Cmd"),
            powered: plain("Pwr-Sts"),
            moving: plain("Mov-Sts"),
            home_traj: plain("Move:Home-Cmd"),
            recover_traj: plain("Move:Rcvr-Cmd"),
            get_traj: plain("Move:GetHt-Cmd"),
            put_traj: plain("Move:PutHt-Cmd"),
            soak_traj: plain("Move:Sk-Cmd"),
            tool_selected: plain("Tl-Sel"),
            tool_mounted: plain("Tl-Sts"),
            puck_selected: plain("Plt-SP"),
            sample_selected: plain("Samp-SP"),
            spindle_occupied: plain("Samp:Dif-Sts"),
            puck_on_spindle: plain("Pck:Dif-I"),
            sample_on_spindle: plain("Samp:Dif-I"),
            position: plain("Pos-I"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    #[test]
    fn test_vector_channel_names() {
        let device = SimDevice::new().shared();
        let program = VectorProgram::new(&device, "XF:19IDC-ES{Gon:1-Vec}");

        assert_eq!(program.exposure.write_pv(), "XF:19IDC-ES{Gon:1-Vec}Val:Exposure-SP");
        assert_eq!(program.exposure.read_pv(), "XF:19IDC-ES{Gon:1-Vec}Val:Exposure-I");
        assert_eq!(program.o.start.write_pv(), "XF:19IDC-ES{Gon:1-Vec}Pos:OStart-SP");
        assert_eq!(program.z.end.read_pv(), "XF:19IDC-ES{Gon:1-Vec}Pos:ZEnd-I");
        assert_eq!(program.running.read_pv(), "XF:19IDC-ES{Gon:1-Vec}Sts:Running-Sts");
        assert_eq!(program.go.write_pv(), "XF:19IDC-ES{Gon:1-Vec}Cmd:Go-Cmd");
    }

    #[test]
    fn test_detector_channel_names() {
        let device = SimDevice::new().shared();
        let cam = EigerCam::new(&device, "DET:cam1:");

        assert_eq!(cam.acquire.write_pv(), "DET:cam1:Acquire");
        assert_eq!(cam.acquire.read_pv(), "DET:cam1:Acquire_RBV");
        assert_eq!(cam.armed.read_pv(), "DET:cam1:Armed");
    }

    #[tokio::test]
    async fn test_signal_type_errors_name_the_channel() {
        let sim = SimDevice::new().with_value("ROBOT:Pwr-Sts", "maybe");
        let robot = IsaraChannels::new(&sim.shared(), "ROBOT:");

        let err = robot.powered.get_bool().await.unwrap_err();
        assert!(err.to_string().contains("ROBOT:Pwr-Sts"));
    }
}
