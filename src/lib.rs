//! nyxd - MX beamline fly-scan orchestration and sample exchange
//!
//! This library drives one data-collection cycle of a macromolecular
//! crystallography endstation through an abstract [`Device`] interface:
//! the goniometer vector program, an externally triggered detector, the
//! Zebra trigger gate and the ISARA sample-exchange robot.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use nyxd::{Config, ConsoleSink, Flyer, ScanParameters, SimDevice};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_from_path("config/nyxd.yaml")?;
//!     let scan = ScanParameters::load_from_path("config/scan.yaml")?;
//!
//!     let device = SimDevice::beamline(&config).shared();
//!     let mut flyer = Flyer::from_config(&device, &config);
//!
//!     let published = flyer.fly(&scan, &ConsoleSink::new()).await?;
//!     eprintln!("published {} documents", published);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **MotionController**: validate-then-run vector trajectories, polled completion
//! - **DetectorArmController**: detector programming, arming and acquisition status
//! - **ZebraController**: trigger gate programming and arming
//! - **AssetPipeline**: resource/datum documents for externally written frames
//! - **Flyer**: kickoff / complete / collect cycle over the above
//! - **RobotSequencer**: guarded mount, dismount, home, soak and recover
//! - **Status**: composable completion handles
//! - **DocumentSink**: transport-agnostic document publication

pub mod assets;
pub mod channels;
pub mod config;
pub mod detector;
pub mod device;
pub mod error;
pub mod flyer;
pub mod json_output;
pub mod motion;
pub mod robot;
pub mod scan;
pub mod sim;
pub mod status;
pub mod telemetry;
pub mod zebra;

// High-level exports for easy usage
pub use config::Config;
pub use device::{ChannelValue, Device, SharedDevice};
pub use error::{NyxError, Result};
pub use flyer::{FlyEvent, Flyer, FlyerState};
pub use robot::{RobotCommand, RobotSequencer, SampleLocation};
pub use scan::ScanParameters;
pub use sim::SimDevice;
pub use status::Status;
pub use telemetry::{ConsoleSink, DocumentSink, MemorySink, NoOpSink};

// Component exports for advanced usage
pub use assets::{AssetBuffer, AssetDocument, AssetPipeline, Datum, DocumentKind, FrameSet, Resource};
pub use detector::{DetectorArmController, DetectorArmSettings};
pub use motion::{MotionController, MotionOutcome, MotionTiming, MotionVector, TrajectoryEstimate, VectorError};
pub use zebra::{ZebraController, ZebraSettings};
pub use json_output::{DocumentEvent, ErrorEvent, MotionEvent, RobotEvent};
