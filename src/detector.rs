//! Detector Arm Controller
//!
//! Programs the acquisition parameters of an externally triggered detector
//! and arms it. Once armed the detector is gated by the trigger box; the
//! only thing left to observe is its acquisition status falling back to idle.

use futures::future::{try_join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::channels::EigerCam;
use crate::config::DetectorConfig;
use crate::device::{ChannelValue, SharedDevice};
use crate::error::Result;
use crate::scan::ScanParameters;
use crate::status::Status;

/// Internal (software) triggering
pub const TRIGGER_INTERNAL: i64 = 0;
/// Exposes for as long as the external gate is high
pub const TRIGGER_EXTERNAL_ENABLE: i64 = 3;

/// Everything written to the detector when arming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorArmSettings {
    pub acquire_time: f64,
    pub acquire_period: f64,
    pub num_triggers: u32,
    pub data_directory: String,
    pub name_pattern: String,
    pub sequence_id: u32,
    pub beam_center_x: f64,
    pub beam_center_y: f64,
    pub omega_incr: f64,
    pub omega_start: f64,
    pub wavelength: f64,
    pub det_distance_m: f64,
    pub images_per_file: u32,
}

impl DetectorArmSettings {
    pub fn from_scan(params: &ScanParameters, config: &DetectorConfig) -> Self {
        Self {
            acquire_time: params.exposure_period_per_image,
            acquire_period: params.exposure_period_per_image,
            num_triggers: params.num_images,
            data_directory: params.data_directory_name.clone(),
            name_pattern: format!("{}_$id", params.file_prefix_name()),
            sequence_id: params.file_number_start,
            beam_center_x: params.x_beam,
            beam_center_y: params.y_beam,
            omega_incr: params.image_width(),
            omega_start: params.angle_start,
            wavelength: params.wavelength,
            det_distance_m: params.det_distance_m,
            images_per_file: params.num_images_per_file.unwrap_or_else(|| config.images_per_file()),
        }
    }
}

/// Acquiring (1) to idle (0), and nothing else
pub fn acquisition_finished(old: &ChannelValue, new: &ChannelValue) -> bool {
    old.as_i64() == Some(1) && new.as_i64() == Some(0)
}

/// Idle (0) to armed (1)
pub fn armed_transition(old: &ChannelValue, new: &ChannelValue) -> bool {
    old.as_i64() == Some(0) && new.as_i64() == Some(1)
}

pub struct DetectorArmController {
    name: String,
    cam: EigerCam,
    config: DetectorConfig,
}

impl DetectorArmController {
    pub fn new(device: &SharedDevice, prefix: &str, config: DetectorConfig) -> Self {
        Self {
            name: config.name().to_string(),
            cam: EigerCam::new(device, prefix),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Gate acquisition from the external timing source
    pub async fn stage(&self) -> Result<()> {
        self.cam.trigger_mode.put(TRIGGER_EXTERNAL_ENABLE).await?;
        debug!("{}: staged for external triggering", self.name);
        Ok(())
    }

    /// Return to internal triggering
    pub async fn unstage(&self) -> Result<()> {
        self.cam.trigger_mode.put(TRIGGER_INTERNAL).await?;
        debug!("{}: unstaged", self.name);
        Ok(())
    }

    /// Program every acquisition parameter, then arm and wait for the
    /// detector to report armed
    pub async fn arm(&self, settings: &DetectorArmSettings) -> Result<()> {
        let cam = &self.cam;

        let mut writes: Vec<BoxFuture<'_, Result<()>>> = vec![
            cam.save_files.put(1).boxed(),
            cam.file_perms.put(self.config.file_perms()).boxed(),
            cam.acquire_time.put(settings.acquire_time).boxed(),
            cam.acquire_period.put(settings.acquire_period).boxed(),
            cam.num_triggers.put(settings.num_triggers).boxed(),
            cam.file_path.put(settings.data_directory.as_str()).boxed(),
            cam.name_pattern.put(settings.name_pattern.as_str()).boxed(),
            cam.sequence_id.put(settings.sequence_id).boxed(),
            cam.beam_center_x.put(settings.beam_center_x).boxed(),
            cam.beam_center_y.put(settings.beam_center_y).boxed(),
            cam.omega_incr.put(settings.omega_incr).boxed(),
            cam.omega_start.put(settings.omega_start).boxed(),
            cam.wavelength.put(settings.wavelength).boxed(),
            cam.det_distance.put(settings.det_distance_m).boxed(),
            cam.trigger_mode.put(TRIGGER_EXTERNAL_ENABLE).boxed(),
            cam.images_per_file.put(settings.images_per_file).boxed(),
        ];
        if let Some(owner) = &self.config.file_owner {
            writes.push(cam.file_owner.put(owner.as_str()).boxed());
        }
        try_join_all(writes).await?;

        let started = Instant::now();
        let armed = Status::transition(cam.armed.subscribe().await?, cam.armed.read_pv(), armed_transition)
            .with_timeout(Some(self.config.arm_timeout()), format!("{} to arm", self.name));

        cam.acquire.set_nowait(1).await?;
        armed.await?;

        info!("arm time = {:.3} s", started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Resolves when acquisition falls from acquiring to idle, bounded by
    /// the configured acquisition timeout
    pub async fn acquisition_done(&self) -> Result<Status> {
        let rx = self.cam.acquire.subscribe().await?;
        Ok(Status::transition(rx, self.cam.acquire.read_pv(), acquisition_finished)
            .with_timeout(self.config.acquire_timeout(), format!("{} acquisition to finish", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NyxError;
    use crate::scan::sample_scan;
    use crate::sim::SimDevice;
    use std::time::Duration;

    const PREFIX: &str = "DET:cam1:";

    fn armed_sim() -> SimDevice {
        let sim = SimDevice::new();
        sim.install_detector(PREFIX);
        sim.on_write("DET:cam1:Acquire", |sim, value| {
            sim.set_value("DET:cam1:Armed", value.clone());
        });
        sim
    }

    #[test]
    fn test_settings_from_scan() {
        let settings = DetectorArmSettings::from_scan(&sample_scan("/nyx-data/test"), &DetectorConfig::default());

        assert_eq!(settings.num_triggers, 100);
        assert_eq!(settings.name_pattern, "lyso_1_$id");
        assert_eq!(settings.sequence_id, 1);
        assert_eq!(settings.omega_incr, 1.8);
        assert_eq!(settings.acquire_time, 0.1);
        assert_eq!(settings.images_per_file, 1000);
    }

    #[test]
    fn test_transition_predicates_distinguish_direction() {
        let one = ChannelValue::Int(1);
        let zero = ChannelValue::Int(0);
        assert!(acquisition_finished(&one, &zero));
        assert!(!acquisition_finished(&zero, &one));
        assert!(!acquisition_finished(&zero, &zero));
        assert!(armed_transition(&zero, &one));
        assert!(!armed_transition(&one, &zero));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_writes_parameters_before_acquire() {
        let sim = armed_sim();
        let controller = DetectorArmController::new(&sim.shared(), PREFIX, DetectorConfig::default());
        let settings = DetectorArmSettings::from_scan(&sample_scan("/nyx-data/test"), &DetectorConfig::default());

        controller.arm(&settings).await.unwrap();

        let writes = sim.writes();
        let acquire = writes.iter().position(|w| w.channel == "DET:cam1:Acquire").unwrap();
        assert_eq!(acquire, writes.len() - 1);
        assert!(!writes[acquire].confirm);
        assert!(writes[..acquire].iter().all(|w| w.confirm));
        assert_eq!(sim.writes_to("DET:cam1:NumTriggers"), vec![ChannelValue::Int(100)]);
        assert_eq!(sim.writes_to("DET:cam1:FilePerms"), vec![ChannelValue::Int(420)]);
        assert_eq!(
            sim.value("DET:cam1:FWNamePattern_RBV"),
            Some(ChannelValue::Text("lyso_1_$id".to_string()))
        );
        assert!(sim.writes_to("DET:cam1:FileOwner").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_times_out_when_detector_never_arms() {
        let sim = SimDevice::new();
        sim.install_detector(PREFIX);
        let controller = DetectorArmController::new(&sim.shared(), PREFIX, DetectorConfig::default());
        let settings = DetectorArmSettings::from_scan(&sample_scan("/nyx-data/test"), &DetectorConfig::default());

        let err = controller.arm(&settings).await.unwrap_err();
        assert!(matches!(err, NyxError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_done_requires_falling_edge() {
        let sim = armed_sim();
        let config = DetectorConfig {
            acquire_timeout_s: Some(30.0),
            ..Default::default()
        };
        let controller = DetectorArmController::new(&sim.shared(), PREFIX, config);

        // Idle -> acquiring alone must not complete
        let done = controller.acquisition_done().await.unwrap();
        sim.set_value("DET:cam1:Acquire_RBV", 1);
        let early = tokio::time::timeout(Duration::from_secs(1), done).await;
        assert!(early.is_err());

        let done = controller.acquisition_done().await.unwrap();
        sim.set_value("DET:cam1:Acquire_RBV", 0);
        done.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_timeout_surfaces() {
        let sim = armed_sim();
        sim.set_value("DET:cam1:Acquire_RBV", 1);
        let config = DetectorConfig {
            acquire_timeout_s: Some(30.0),
            ..Default::default()
        };
        let controller = DetectorArmController::new(&sim.shared(), PREFIX, config);

        let err = controller.acquisition_done().await.unwrap().await.unwrap_err();
        assert!(matches!(err, NyxError::Timeout { .. }));
    }
}
