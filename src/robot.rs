//! Robot Sequencer
//!
//! Guarded sample-exchange trajectories for the ISARA robot. Every command
//! reads the robot state first and fails before touching the hardware if a
//! precondition does not hold. Recoverable conditions (power, tool
//! selection, arm position) are corrected as separate verified steps, then
//! the trajectory is written with confirmation and its outcome verified.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::channels::{IsaraChannels, Signal};
use crate::config::RobotConfig;
use crate::device::{ChannelValue, SharedDevice};
use crate::error::{NyxError, Result};

/// Puck and sample position in the dewar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleLocation {
    pub puck: u32,
    pub sample: u32,
}

impl SampleLocation {
    pub fn parse(puck: &str, sample: &str) -> Result<Self> {
        let number = |what: &str, value: &str| {
            value
                .trim()
                .parse::<u32>()
                .map_err(|_| NyxError::InvalidInput(format!("{} '{}' is not a position number", what, value)))
        };
        Ok(Self {
            puck: number("puck", puck)?,
            sample: number("sample", sample)?,
        })
    }
}

impl fmt::Display for SampleLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "puck {} sample {}", self.puck, self.sample)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum RobotCommand {
    Mount(SampleLocation),
    Dismount(SampleLocation),
    Home,
    Soak,
    Recover,
}

impl RobotCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RobotCommand::Mount(_) => "mount",
            RobotCommand::Dismount(_) => "dismount",
            RobotCommand::Home => "home",
            RobotCommand::Soak => "soak",
            RobotCommand::Recover => "recover",
        }
    }
}

/// Robot state read in one pass before any write
#[derive(Debug, Clone)]
struct Snapshot {
    moving: bool,
    powered: bool,
    tool_selected: i64,
    tool_mounted: i64,
    spindle_occupied: bool,
    position: String,
}

pub struct RobotSequencer {
    robot: IsaraChannels,
    config: RobotConfig,
}

impl RobotSequencer {
    pub fn new(device: &SharedDevice, prefix: &str, config: RobotConfig) -> Self {
        Self {
            robot: IsaraChannels::new(device, prefix),
            config,
        }
    }

    pub async fn execute(&self, command: RobotCommand) -> Result<()> {
        match command {
            RobotCommand::Mount(location) => self.mount(location).await,
            RobotCommand::Dismount(location) => self.dismount(location).await,
            RobotCommand::Home => self.guarded_trajectory("home", &self.robot.home_traj).await,
            RobotCommand::Soak => self.guarded_trajectory("soak", &self.robot.soak_traj).await,
            RobotCommand::Recover => self.guarded_trajectory("recover", &self.robot.recover_traj).await,
        }
    }

    pub async fn mount(&self, location: SampleLocation) -> Result<()> {
        let snapshot = self.snapshot().await?;
        if snapshot.moving {
            return Err(NyxError::Precondition(format!("Can't mount {}: robot is moving", location)));
        }
        if snapshot.spindle_occupied {
            return Err(NyxError::Precondition(format!("Can't mount {}: spindle is occupied", location)));
        }

        if !snapshot.powered {
            self.power_on().await.map_err(|e| NyxError::step("power on", e))?;
        }
        if snapshot.tool_selected != snapshot.tool_mounted {
            self.fix_tool(snapshot.tool_mounted)
                .await
                .map_err(|e| NyxError::step("tool selection", e))?;
        }
        if snapshot.position != self.config.soak_position() {
            self.drive_to_soak(&snapshot.position)
                .await
                .map_err(|e| NyxError::step("move to soak", e))?;
        }

        self.confirmed("puck selection", &self.robot.puck_selected, location.puck).await?;
        self.confirmed("sample selection", &self.robot.sample_selected, location.sample).await?;
        self.trajectory("mount", &self.robot.put_traj).await?;

        let occupied = self.robot.spindle_occupied.get_bool().await?;
        let puck = self.robot.puck_on_spindle.get_i64().await?;
        let sample = self.robot.sample_on_spindle.get_i64().await?;
        if !occupied || puck != location.puck as i64 || sample != location.sample as i64 {
            return Err(NyxError::Verification(format!(
                "Can't mount {}: failed to mount (spindle holds puck {} sample {})",
                location, puck, sample
            )));
        }
        info!("Mounted {}", location);
        Ok(())
    }

    pub async fn dismount(&self, location: SampleLocation) -> Result<()> {
        let snapshot = self.snapshot().await?;
        if snapshot.moving {
            return Err(NyxError::Precondition(format!("Can't dismount {}: robot is moving", location)));
        }
        if !snapshot.spindle_occupied {
            return Err(NyxError::Precondition(format!("Can't dismount {}: spindle is empty", location)));
        }

        if !snapshot.powered {
            self.power_on().await.map_err(|e| NyxError::step("power on", e))?;
        }

        self.trajectory("dismount", &self.robot.get_traj).await?;

        if self.robot.spindle_occupied.get_bool().await? {
            return Err(NyxError::Verification(format!("Can't dismount {}: failed to dismount", location)));
        }
        info!("Dismounted {}", location);
        Ok(())
    }

    pub async fn home(&self) -> Result<()> {
        self.execute(RobotCommand::Home).await
    }

    pub async fn soak(&self) -> Result<()> {
        self.execute(RobotCommand::Soak).await
    }

    pub async fn recover(&self) -> Result<()> {
        self.execute(RobotCommand::Recover).await
    }

    /// Tool check, then the trajectory
    async fn guarded_trajectory(&self, name: &str, traj: &Signal) -> Result<()> {
        let selected = self.robot.tool_selected.get_i64().await?;
        let mounted = self.robot.tool_mounted.get_i64().await?;
        if selected != mounted {
            return Err(NyxError::Precondition(format!(
                "Can't {}: tool {} selected but tool {} mounted",
                name, selected, mounted
            )));
        }
        self.trajectory(name, traj).await
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        let r = &self.robot;
        Ok(Snapshot {
            moving: r.moving.get_bool().await?,
            powered: r.powered.get_bool().await?,
            tool_selected: r.tool_selected.get_i64().await?,
            tool_mounted: r.tool_mounted.get_i64().await?,
            spindle_occupied: r.spindle_occupied.get_bool().await?,
            position: r.position.get_text().await?,
        })
    }

    /// Write with confirmation, bounded by the command timeout
    async fn confirmed(&self, what: &str, signal: &Signal, value: impl Into<ChannelValue>) -> Result<()> {
        let limit = self.config.command_timeout();
        match tokio::time::timeout(limit, signal.put(value)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Robot {} not confirmed within {:?}", what, limit);
                Err(NyxError::timeout(format!("{} confirmation", what), limit))
            }
        }
    }

    async fn trajectory(&self, name: &str, traj: &Signal) -> Result<()> {
        info!("Robot trajectory: {}", name);
        self.confirmed(&format!("{} trajectory", name), traj, 1).await
    }

    async fn power_on(&self) -> Result<()> {
        info!("Robot unpowered, powering on");
        self.confirmed("power-on", &self.robot.power_on, 1).await?;
        if !self.robot.powered.get_bool().await? {
            return Err(NyxError::Verification("robot still unpowered".to_string()));
        }
        Ok(())
    }

    async fn fix_tool(&self, mounted: i64) -> Result<()> {
        info!("Selecting mounted tool {}", mounted);
        self.confirmed("tool selection", &self.robot.tool_selected, mounted).await?;
        let selected = self.robot.tool_selected.get_i64().await?;
        let now_mounted = self.robot.tool_mounted.get_i64().await?;
        if selected != now_mounted {
            return Err(NyxError::Verification(format!(
                "tool {} selected but tool {} mounted",
                selected, now_mounted
            )));
        }
        Ok(())
    }

    async fn drive_to_soak(&self, from: &str) -> Result<()> {
        info!("Robot at '{}', driving to soak", from);
        self.trajectory("soak", &self.robot.soak_traj).await?;
        let position = self.robot.position.get_text().await?;
        if position != self.config.soak_position() {
            return Err(NyxError::Verification(format!(
                "robot at '{}' after soak trajectory",
                position
            )));
        }
        Ok(())
    }
}
