//! Flyer Orchestrator
//!
//! Runs one fly-scan cycle: kickoff starts the vector motion and arms the
//! trigger gate once the motion is accepted, complete waits for both the
//! motion and the detector's acquiring->idle transition, and the collect
//! steps turn the written frames into asset documents and events.
//!
//! ```text
//! Idle -> Armed -> Collecting -> Complete -> MetadataCollected -> Idle
//!        kickoff   complete     (resolved)   collect_asset_docs  collect
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::assets::{AssetBuffer, AssetDocument, AssetPipeline, FrameDatums, FrameSet};
use crate::config::{Config, MotionConfig};
use crate::detector::{DetectorArmController, DetectorArmSettings};
use crate::device::SharedDevice;
use crate::error::{NyxError, Result};
use crate::json_output::current_timestamp;
use crate::motion::{MotionController, MotionTiming, MotionVector, TrajectoryEstimate};
use crate::scan::ScanParameters;
use crate::status::Status;
use crate::telemetry::DocumentSink;
use crate::zebra::{ZebraController, ZebraSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlyerState {
    Idle,
    /// Kicked off; motion and detector progressing
    Armed,
    /// Waiting on the combined completion handle
    Collecting,
    Complete,
    MetadataCollected,
}

impl fmt::Display for FlyerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One event per frame, pointing at that frame's datums
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlyEvent {
    pub seq_num: u32,
    pub time: f64,
    pub data: BTreeMap<String, String>,
    pub timestamps: BTreeMap<String, f64>,
    pub filled: BTreeMap<String, bool>,
}

/// `configure_vector` translation: micrometres to millimetres, seconds to
/// milliseconds, rotation from start to start + width
pub fn vector_from_scan(params: &ScanParameters, config: &MotionConfig) -> MotionVector {
    let mm = |um: f64| (um / 1000.0, um / 1000.0);
    MotionVector {
        o: (params.angle_start, params.angle_start + params.scan_width),
        x: mm(params.x_start_um),
        y: mm(params.y_start_um),
        z: mm(params.z_start_um),
        exposure_ms: params.exposure_ms(),
        num_samples: params.num_images,
        buffer_time_ms: config.buffer_time_ms(),
        shutter_lag_time_ms: config.shutter_lag_time_ms(),
        shutter_time_ms: config.shutter_time_ms(),
    }
}

/// Frames the detector will write for this scan
pub fn frames_from_scan(params: &ScanParameters) -> FrameSet {
    FrameSet {
        root: params.data_directory_name.clone().into(),
        prefix: params.file_prefix_name().to_string(),
        first_sequence: params.file_number_start,
        count: params.num_images,
    }
}

/// Orchestrates one collection cycle at a time
pub struct Flyer {
    motion: Arc<MotionController>,
    detector: Arc<DetectorArmController>,
    zebra: Arc<ZebraController>,
    pipeline: AssetPipeline,
    motion_config: MotionConfig,
    state: Arc<watch::Sender<FlyerState>>,
    vector: Option<MotionVector>,
    frames: Option<FrameSet>,
    motion_started: Option<oneshot::Receiver<TrajectoryEstimate>>,
    detector_done: Option<Status>,
    /// Kickoff work that writes to hardware; aborted on reset
    in_flight: Vec<AbortHandle>,
    buffer: AssetBuffer,
    frame_datums: Vec<FrameDatums>,
}

impl Flyer {
    pub fn new(
        motion: MotionController,
        detector: DetectorArmController,
        zebra: ZebraController,
        pipeline: AssetPipeline,
        motion_config: MotionConfig,
    ) -> Self {
        let (state, _) = watch::channel(FlyerState::Idle);
        Self {
            motion: Arc::new(motion),
            detector: Arc::new(detector),
            zebra: Arc::new(zebra),
            pipeline,
            motion_config,
            state: Arc::new(state),
            vector: None,
            frames: None,
            motion_started: None,
            detector_done: None,
            in_flight: Vec::new(),
            buffer: AssetBuffer::new(),
            frame_datums: Vec::new(),
        }
    }

    pub fn from_config(device: &SharedDevice, config: &Config) -> Self {
        Self::new(
            MotionController::new(device, &config.channels.vector, MotionTiming::from(&config.motion)),
            DetectorArmController::new(device, &config.channels.detector, config.detector.clone()),
            ZebraController::new(device, &config.channels.zebra, config.zebra.clone()),
            AssetPipeline::from_config(&config.assets),
            config.motion.clone(),
        )
    }

    pub fn state(&self) -> FlyerState {
        *self.state.borrow()
    }

    /// Observe state changes, including those made by in-flight handles
    pub fn subscribe_state(&self) -> watch::Receiver<FlyerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: FlyerState) {
        let previous = self.state.send_replace(state);
        debug!("Flyer state {} -> {}", previous, state);
    }

    fn expect_state(&self, expected: FlyerState, operation: &str) -> Result<()> {
        let current = self.state();
        if current != expected {
            return Err(NyxError::State(format!(
                "{} requires the flyer to be {}, but it is {}",
                operation, expected, current
            )));
        }
        Ok(())
    }

    pub fn configure_vector(&mut self, params: &ScanParameters) -> MotionVector {
        let vector = vector_from_scan(params, &self.motion_config);
        self.vector = Some(vector.clone());
        vector
    }

    pub fn configure_detector(&mut self, params: &ScanParameters) -> FrameSet {
        let frames = frames_from_scan(params);
        self.frames = Some(frames.clone());
        frames
    }

    pub async fn configure_zebra(&self, params: &ScanParameters) -> Result<()> {
        self.zebra.configure(&ZebraSettings::from_scan(params)).await
    }

    /// Program and arm the detector for `params`
    pub async fn detector_arm(&self, params: &ScanParameters) -> Result<()> {
        let settings = DetectorArmSettings::from_scan(params, self.detector.config());
        self.detector.arm(&settings).await
    }

    /// Reconfigure for one raster row. Row 0 programs the trigger gate in
    /// full; later rows only change its pulse count.
    pub async fn update_parameters(&mut self, params: &ScanParameters, row_index: usize) -> Result<()> {
        params.validate()?;
        self.configure_vector(params);
        self.configure_detector(params);
        if row_index == 0 {
            debug!("row 0: fully configuring zebra");
            self.configure_zebra(params).await
        } else {
            debug!("row {}: only setting pulse max", row_index);
            self.zebra.set_pulse_max(params.num_images).await
        }
    }

    /// Stage the detector and start the motion. The returned handle resolves
    /// once the motion has been accepted and the trigger gate armed; it
    /// does not wait for the scan.
    pub async fn kickoff(&mut self) -> Result<Status> {
        self.expect_state(FlyerState::Idle, "kickoff")?;
        let vector = self
            .vector
            .clone()
            .ok_or_else(|| NyxError::State("kickoff before configure_vector".to_string()))?;

        // subscribe first: a failed subscription must leave the detector unstaged
        let detector_done = self.detector.acquisition_done().await?;
        self.detector.stage().await?;
        self.detector_done = Some(detector_done);

        let (started_tx, started_rx) = oneshot::channel();
        self.motion_started = Some(started_rx);

        let motion = self.motion.clone();
        let zebra = self.zebra.clone();
        let task = tokio::spawn(async move {
            let estimate = motion.validate(&vector).await?;
            motion.start().await?;
            let _ = started_tx.send(estimate);
            zebra.arm().await
        });
        self.in_flight.push(task.abort_handle());

        self.set_state(FlyerState::Armed);
        info!("Flyer kicked off");
        Ok(Status::from_task(task))
    }

    /// Handle resolving once the motion has finished AND the detector has
    /// gone from acquiring to idle
    pub fn complete(&mut self) -> Result<Status> {
        self.expect_state(FlyerState::Armed, "complete")?;
        let (Some(started), Some(detector_done)) = (self.motion_started.take(), self.detector_done.take()) else {
            return Err(NyxError::State("complete without a kickoff in flight".to_string()));
        };

        let motion = self.motion.clone();
        let motion_done = Status::spawn(async move {
            let estimate = started
                .await
                .map_err(|_| NyxError::State("vector motion never started".to_string()))?;
            motion.track(&estimate).await?.into_result().map(|_| ())
        });

        self.set_state(FlyerState::Collecting);
        let state = self.state.clone();
        Ok(motion_done.and(detector_done).then(move || async move {
            // a reset in the meantime owns the state
            let completed = state.send_if_modified(|s| {
                let collecting = *s == FlyerState::Collecting;
                if collecting {
                    *s = FlyerState::Complete;
                }
                collecting
            });
            if completed {
                info!("Flyer complete: motion finished and detector idle");
            }
            Ok(())
        }))
    }

    /// Asset documents for the finished cycle, drained from the cycle's
    /// buffer. Yields nothing before a kickoff or once already collected.
    pub fn collect_asset_docs(&mut self) -> Result<std::collections::vec_deque::IntoIter<AssetDocument>> {
        match self.state() {
            FlyerState::Idle | FlyerState::MetadataCollected => Ok(self.buffer.drain()),
            FlyerState::Complete => {
                let frames = self
                    .frames
                    .as_ref()
                    .ok_or_else(|| NyxError::State("no frames configured".to_string()))?;
                self.frame_datums = self.pipeline.compose(frames, &mut self.buffer)?;
                self.set_state(FlyerState::MetadataCollected);
                Ok(self.buffer.drain())
            }
            other => Err(NyxError::State(format!("cannot collect asset documents while {}", other))),
        }
    }

    /// Unstage the detector and emit one event per frame; returns to idle
    pub async fn collect(&mut self) -> Result<Vec<FlyEvent>> {
        self.expect_state(FlyerState::MetadataCollected, "collect")?;
        self.detector.unstage().await?;

        let image_key = format!("{}_image", self.detector.name());
        let frames = std::mem::take(&mut self.frame_datums);
        let events = frames
            .iter()
            .enumerate()
            .map(|(index, frame)| {
                let now = current_timestamp();
                let data: BTreeMap<String, String> = frame
                    .datum_ids
                    .iter()
                    .enumerate()
                    .map(|(i, (key, id))| {
                        let name = if i == 0 { image_key.clone() } else { key.clone() };
                        (name, id.clone())
                    })
                    .collect();
                FlyEvent {
                    seq_num: index as u32 + 1,
                    time: now,
                    timestamps: data.keys().map(|k| (k.clone(), now)).collect(),
                    filled: data.keys().map(|k| (k.clone(), false)).collect(),
                    data,
                }
            })
            .collect::<Vec<_>>();

        self.in_flight.clear();
        self.set_state(FlyerState::Idle);
        info!("Collected {} events", events.len());
        Ok(events)
    }

    /// Drain asset documents, then events, into `sink`
    pub async fn publish(&mut self, sink: &dyn DocumentSink) -> Result<usize> {
        let mut published = 0;
        for doc in self.collect_asset_docs()? {
            sink.publish_asset(&doc)
                .await
                .map_err(|e| NyxError::Publish(format!("{:#}", e)))?;
            published += 1;
        }
        for event in self.collect().await? {
            sink.publish_event(&event)
                .await
                .map_err(|e| NyxError::Publish(format!("{:#}", e)))?;
            published += 1;
        }
        Ok(published)
    }

    /// Abandon the current cycle and return to idle. Kickoff work that has
    /// not finished is aborted, so no further go or arm writes are issued.
    pub async fn reset(&mut self) -> Result<()> {
        for task in self.in_flight.drain(..) {
            task.abort();
        }
        self.motion_started = None;
        self.detector_done = None;
        self.frame_datums.clear();
        let discarded = self.buffer.drain().count();
        if discarded > 0 {
            warn!("Discarded {} unpublished asset documents", discarded);
        }
        self.set_state(FlyerState::Idle);
        self.detector.unstage().await
    }

    /// Whole cycle for one scan: configure, arm, kickoff, complete, publish
    pub async fn fly(&mut self, params: &ScanParameters, sink: &dyn DocumentSink) -> Result<usize> {
        let result = self.fly_inner(params, sink).await;
        if result.is_err() {
            if let Err(e) = self.reset().await {
                warn!("Reset after failed cycle also failed: {}", e);
            }
        }
        result
    }

    async fn fly_inner(&mut self, params: &ScanParameters, sink: &dyn DocumentSink) -> Result<usize> {
        self.update_parameters(params, 0).await?;
        self.detector_arm(params).await?;
        self.kickoff().await?.await?;
        self.complete()?.await?;
        self.publish(sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::DocumentKind;
    use crate::device::ChannelValue;
    use crate::scan::sample_scan;
    use crate::sim::SimDevice;
    use crate::telemetry::MemorySink;
    use std::time::Duration;
    use tempfile::TempDir;

    fn beamline() -> (SimDevice, Config) {
        let config = Config::default();
        (SimDevice::beamline(&config), config)
    }

    fn channel(config: &Config, name: &str) -> String {
        format!("{}{}", config.channels.detector, name)
    }

    #[test]
    fn test_configure_vector_translation() {
        let vector = vector_from_scan(&sample_scan("/tmp"), &MotionConfig::default());

        assert_eq!(vector.exposure_ms, 100.0);
        assert_eq!(vector.o, (0.0, 180.0));
        assert_eq!(vector.x, (1.5, 1.5));
        assert_eq!(vector.y, (-0.25, -0.25));
        assert_eq!(vector.z, (0.04, 0.04));
        assert_eq!(vector.num_samples, 100);
        assert_eq!(vector.buffer_time_ms, 50.0);
        assert_eq!(vector.shutter_time_ms, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_publishes_documents_and_events() {
        let dir = TempDir::new().unwrap();
        let scan = sample_scan(&dir.path().to_string_lossy());
        let (sim, config) = beamline();
        let mut flyer = Flyer::from_config(&sim.shared(), &config);
        let sink = MemorySink::new();

        let published = flyer.fly(&scan, &sink).await.unwrap();

        assert_eq!(published, 400);
        assert_eq!(flyer.state(), FlyerState::Idle);
        let assets = sink.assets();
        assert_eq!(assets.iter().filter(|d| d.kind() == DocumentKind::Resource).count(), 100);
        assert_eq!(assets.iter().filter(|d| d.kind() == DocumentKind::Datum).count(), 200);

        let events = sink.events();
        assert_eq!(events.len(), 100);
        assert_eq!(events[0].seq_num, 1);
        assert!(events[0].data.contains_key("eiger_image"));
        assert!(events[0].data["omega"].ends_with("/omega"));
        assert_eq!(events[0].filled["omega"], false);

        // unstaged back to internal triggering
        assert_eq!(
            sim.writes_to(&channel(&config, "TriggerMode")).last(),
            Some(&ChannelValue::Int(0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zebra_armed_only_after_motion_start() {
        let dir = TempDir::new().unwrap();
        let scan = sample_scan(&dir.path().to_string_lossy());
        let (sim, config) = beamline();
        let mut flyer = Flyer::from_config(&sim.shared(), &config);

        flyer.update_parameters(&scan, 0).await.unwrap();
        flyer.detector_arm(&scan).await.unwrap();
        flyer.kickoff().await.unwrap().await.unwrap();
        assert_eq!(flyer.state(), FlyerState::Armed);

        let writes = sim.writes();
        let go = format!("{}Cmd:Go-Cmd", config.channels.vector);
        let arm = format!("{}PC_ARM", config.channels.zebra);
        let last_go = writes.iter().rposition(|w| w.channel == go).unwrap();
        let zebra_arm = writes.iter().position(|w| w.channel == arm).unwrap();
        assert!(last_go < zebra_arm);

        flyer.complete().unwrap().await.unwrap();
        assert_eq!(flyer.state(), FlyerState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kickoff_fails_fast_when_staging_fails() {
        let (sim, config) = beamline();
        sim.fail_writes(&channel(&config, "TriggerMode"));
        let mut flyer = Flyer::from_config(&sim.shared(), &config);
        flyer.configure_vector(&sample_scan("/tmp"));

        assert!(flyer.kickoff().await.is_err());
        assert_eq!(flyer.state(), FlyerState::Idle);
        let go = format!("{}Cmd:Go-Cmd", config.channels.vector);
        assert!(sim.writes_to(&go).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_times_out_when_detector_never_finishes() {
        let dir = TempDir::new().unwrap();
        let scan = sample_scan(&dir.path().to_string_lossy());
        let mut config = Config::default();
        config.detector.acquire_timeout_s = Some(60.0);
        let sim = SimDevice::beamline(&config);
        let mut flyer = Flyer::from_config(&sim.shared(), &config);

        // never armed, so acquisition status stays idle
        flyer.update_parameters(&scan, 0).await.unwrap();
        flyer.kickoff().await.unwrap().await.unwrap();
        let err = flyer.complete().unwrap().await.unwrap_err();

        assert!(matches!(err, NyxError::Timeout { .. }));
        assert_eq!(flyer.state(), FlyerState::Collecting);
        flyer.reset().await.unwrap();
        assert_eq!(flyer.state(), FlyerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_asset_docs_drain_once() {
        let dir = TempDir::new().unwrap();
        let mut scan = sample_scan(&dir.path().to_string_lossy());
        scan.num_images = 5;
        let (sim, config) = beamline();
        let mut flyer = Flyer::from_config(&sim.shared(), &config);

        assert_eq!(flyer.collect_asset_docs().unwrap().count(), 0);

        flyer.update_parameters(&scan, 0).await.unwrap();
        flyer.detector_arm(&scan).await.unwrap();
        flyer.kickoff().await.unwrap().await.unwrap();
        flyer.complete().unwrap().await.unwrap();

        let docs: Vec<_> = flyer.collect_asset_docs().unwrap().collect();
        assert_eq!(docs.len(), 15);
        assert_eq!(flyer.state(), FlyerState::MetadataCollected);
        assert_eq!(flyer.collect_asset_docs().unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_first_frame_fails_collection() {
        let dir = TempDir::new().unwrap();
        let scan = sample_scan(&dir.path().to_string_lossy());
        let (sim, config) = beamline();
        let mut flyer = Flyer::from_config(&sim.shared(), &config);

        flyer.update_parameters(&scan, 0).await.unwrap();
        flyer.detector_arm(&scan).await.unwrap();
        flyer.kickoff().await.unwrap().await.unwrap();
        flyer.complete().unwrap().await.unwrap();
        std::fs::remove_file(dir.path().join("lyso_1_00001.cbf")).unwrap();

        let err = flyer.collect_asset_docs().unwrap_err();
        assert!(matches!(err, NyxError::MissingFile(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_raster_rows_after_first_only_set_pulse_max() {
        let (sim, config) = beamline();
        let mut flyer = Flyer::from_config(&sim.shared(), &config);
        let mut scan = sample_scan("/tmp");

        flyer.update_parameters(&scan, 0).await.unwrap();
        sim.clear_writes();
        scan.num_images = 40;
        flyer.update_parameters(&scan, 3).await.unwrap();

        let writes = sim.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].channel, format!("{}PC_PULSE_MAX", config.channels.zebra));
        assert_eq!(writes[0].value, ChannelValue::Int(40));
    }

    #[tokio::test]
    async fn test_out_of_order_calls_are_rejected() {
        let (sim, config) = beamline();
        let mut flyer = Flyer::from_config(&sim.shared(), &config);

        assert!(matches!(flyer.complete(), Err(NyxError::State(_))));
        assert!(matches!(flyer.kickoff().await, Err(NyxError::State(_))));
        assert!(sim.writes().is_empty());
    }

    struct RejectingSink;

    #[async_trait::async_trait]
    impl DocumentSink for RejectingSink {
        async fn publish_asset(&self, _doc: &AssetDocument) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("store unavailable"))
        }

        async fn publish_event(&self, _event: &FlyEvent) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_resets_flyer() {
        let dir = TempDir::new().unwrap();
        let mut scan = sample_scan(&dir.path().to_string_lossy());
        scan.num_images = 3;
        let (sim, config) = beamline();
        let mut flyer = Flyer::from_config(&sim.shared(), &config);
        let mut states = flyer.subscribe_state();

        let err = flyer.fly(&scan, &RejectingSink).await.unwrap_err();

        assert!(matches!(&err, NyxError::Publish(msg) if msg.contains("store unavailable")));
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), FlyerState::Idle);
        assert_eq!(flyer.collect_asset_docs().unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_mid_scan_is_rejected() {
        let dir = TempDir::new().unwrap();
        let scan = sample_scan(&dir.path().to_string_lossy());
        let (sim, config) = beamline();
        let mut flyer = Flyer::from_config(&sim.shared(), &config);

        flyer.update_parameters(&scan, 0).await.unwrap();
        flyer.detector_arm(&scan).await.unwrap();
        flyer.kickoff().await.unwrap().await.unwrap();

        assert!(matches!(flyer.collect().await, Err(NyxError::State(_))));
        assert_eq!(flyer.state(), FlyerState::Armed);
        assert_eq!(
            sim.writes_to(&channel(&config, "TriggerMode")).last(),
            Some(&ChannelValue::Int(3))
        );
        assert!(matches!(flyer.kickoff().await, Err(NyxError::State(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_stops_pending_kickoff() {
        let (sim, config) = beamline();
        let mut flyer = Flyer::from_config(&sim.shared(), &config);
        flyer.update_parameters(&sample_scan("/tmp"), 0).await.unwrap();

        drop(flyer.kickoff().await.unwrap());
        tokio::task::yield_now().await;
        flyer.reset().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(flyer.state(), FlyerState::Idle);
        let go = format!("{}Cmd:Go-Cmd", config.channels.vector);
        let calc_only = format!("{}CalcOnly-Sel", config.channels.vector);
        assert!(sim.writes_to(&go).len() <= 1);
        assert!(!sim.writes_to(&calc_only).contains(&ChannelValue::Int(0)));
        assert!(sim.writes_to(&format!("{}PC_ARM", config.channels.zebra)).is_empty());
        assert_eq!(
            sim.value(&format!("{}Sts:Running-Sts", config.channels.vector)),
            Some(ChannelValue::Int(0))
        );
    }

    #[tokio::test]
    async fn test_kickoff_leaves_detector_untouched_when_subscription_fails() {
        let config = Config::default();
        let sim = SimDevice::new();
        sim.install_vector_program(&config.channels.vector);
        let mut flyer = Flyer::from_config(&sim.shared(), &config);
        flyer.configure_vector(&sample_scan("/tmp"));

        let err = flyer.kickoff().await.unwrap_err();

        assert!(matches!(err, NyxError::Device { .. }));
        assert_eq!(flyer.state(), FlyerState::Idle);
        assert!(sim.writes().is_empty());
    }
}
