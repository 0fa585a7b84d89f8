//! Zebra position-compare trigger gate
//!
//! The Zebra turns goniometer rotation into detector trigger pulses. It is
//! programmed once per scan and armed only after the vector motion has been
//! accepted.

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::channels::ZebraChannels;
use crate::config::ZebraConfig;
use crate::device::SharedDevice;
use crate::error::Result;
use crate::scan::ScanParameters;

/// Soft arm source
const ARM_SOURCE_SOFT: i64 = 0;
/// Routes the position-compare output to the detector trigger line
const OUT1_PC_PULSE: i64 = 31;

/// Gate and pulse programme for one rotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZebraSettings {
    pub angle_start: f64,
    pub gate_width: f64,
    pub scan_width: f64,
    pub pulse_width: f64,
    pub pulse_step: f64,
    pub pulse_delay: f64,
    pub num_images: u32,
    /// Zero image width: no rotation, gate is left to the pulse train
    pub is_still: bool,
}

impl ZebraSettings {
    pub fn from_scan(params: &ScanParameters) -> Self {
        let exposure_ms = params.exposure_ms();
        let img_width = params.image_width();
        let pulse_width = exposure_ms - 1.0;
        let pulse_step = exposure_ms + 0.0001;
        let gate_width = params.scan_width - (1.0 - pulse_width / pulse_step) * (img_width / 2.0);

        Self {
            angle_start: params.angle_start,
            gate_width,
            scan_width: params.scan_width,
            pulse_width,
            pulse_step,
            pulse_delay: params.exposure_period_per_image / 2.0 * 1000.0,
            num_images: params.num_images,
            is_still: img_width == 0.0,
        }
    }
}

pub struct ZebraController {
    channels: ZebraChannels,
    config: ZebraConfig,
}

impl ZebraController {
    pub fn new(device: &SharedDevice, prefix: &str, config: ZebraConfig) -> Self {
        Self {
            channels: ZebraChannels::new(device, prefix),
            config,
        }
    }

    /// Reset the box and route outputs for data acquisition
    pub async fn daq_prep(&self) -> Result<()> {
        let z = &self.channels;
        z.reset.put(1).await?;
        sleep(self.config.reset_settle()).await;
        z.out1.put(OUT1_PC_PULSE).await?;
        z.m1_set_pos.put(1).await?;
        z.m2_set_pos.put(1).await?;
        z.m3_set_pos.put(1).await?;
        z.arm_trig_source.put(ARM_SOURCE_SOFT).await?;
        debug!("Zebra prepared for acquisition");
        Ok(())
    }

    pub async fn setup_vector_scan(&self, settings: &ZebraSettings) -> Result<()> {
        let z = &self.channels;
        z.gate_start.put(settings.angle_start).await?;
        if !settings.is_still {
            z.gate_width.put(settings.gate_width).await?;
            z.gate_step.put(settings.scan_width).await?;
        }
        z.gate_num.put(1).await?;
        z.pulse_start.put(0).await?;
        z.pulse_width.put(settings.pulse_width).await?;
        z.pulse_step.put(settings.pulse_step).await?;
        z.pulse_delay.put(settings.pulse_delay).await?;
        z.pulse_max.put(settings.num_images).await?;
        info!(
            "Zebra programmed: {} pulses, width {:.4} ms, step {:.4} ms",
            settings.num_images, settings.pulse_width, settings.pulse_step
        );
        Ok(())
    }

    /// Full programming: prep then gate/pulse setup
    pub async fn configure(&self, settings: &ZebraSettings) -> Result<()> {
        self.daq_prep().await?;
        self.setup_vector_scan(settings).await
    }

    /// Later raster rows only change the pulse count
    pub async fn set_pulse_max(&self, num_images: u32) -> Result<()> {
        self.channels.pulse_max.put(num_images).await
    }

    pub async fn arm(&self) -> Result<()> {
        self.channels.arm.put(1).await?;
        info!("Zebra armed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChannelValue;
    use crate::scan::sample_scan;
    use crate::sim::SimDevice;
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn test_settings_from_scan() {
        let settings = ZebraSettings::from_scan(&sample_scan("/tmp"));

        assert_eq!(settings.pulse_width, 99.0);
        assert!((settings.pulse_step - 100.0001).abs() < 1e-9);
        assert_eq!(settings.pulse_delay, 50.0);
        let expected_gate = 180.0 - (1.0 - 99.0 / 100.0001) * 0.9;
        assert!((settings.gate_width - expected_gate).abs() < 1e-9);
        assert!(!settings.is_still);
    }

    #[test]
    fn test_still_scan() {
        let mut scan = sample_scan("/tmp");
        scan.scan_width = 0.0;
        assert!(ZebraSettings::from_scan(&scan).is_still);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_order_and_settle() {
        let sim = SimDevice::new();
        let zebra = ZebraController::new(&sim.shared(), "ZEB:", ZebraConfig::default());

        let started = Instant::now();
        zebra.configure(&ZebraSettings::from_scan(&sample_scan("/tmp"))).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));

        let channels: Vec<String> = sim.writes().into_iter().map(|w| w.channel).collect();
        assert_eq!(channels[0], "ZEB:SYS_RESET.PROC");
        assert_eq!(channels[1], "ZEB:OUT1_TTL");
        assert_eq!(channels.last().map(String::as_str), Some("ZEB:PC_PULSE_MAX"));
        assert_eq!(sim.writes_to("ZEB:OUT1_TTL"), vec![ChannelValue::Int(31)]);
        assert_eq!(sim.writes_to("ZEB:PC_GATE_NGATE"), vec![ChannelValue::Int(1)]);
        assert_eq!(sim.writes_to("ZEB:PC_PULSE_MAX"), vec![ChannelValue::Int(100)]);
        assert!(sim.writes_to("ZEB:PC_ARM").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_still_scan_skips_gate_geometry() {
        let sim = SimDevice::new();
        let zebra = ZebraController::new(&sim.shared(), "ZEB:", ZebraConfig::default());
        let mut scan = sample_scan("/tmp");
        scan.scan_width = 0.0;

        zebra.setup_vector_scan(&ZebraSettings::from_scan(&scan)).await.unwrap();
        assert!(sim.writes_to("ZEB:PC_GATE_WID").is_empty());
        assert!(sim.writes_to("ZEB:PC_GATE_STEP").is_empty());
    }
}
