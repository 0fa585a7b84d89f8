//! nyxd - beamline orchestrator CLI
//!
//! Runs fly scans, bare vector motions and robot commands against the
//! simulated endstation. Logs go to stderr; stdout carries one JSON object
//! per line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{error, info, Level};

use nyxd::flyer::vector_from_scan;
use nyxd::json_output::output;
use nyxd::motion::MotionTiming;
use nyxd::{
    Config, ConsoleSink, DocumentSink, Flyer, MotionController, RobotCommand, RobotSequencer, SampleLocation, ScanParameters,
    SimDevice,
};

const DEFAULT_CONFIG_PATH: &str = "config/nyxd.yaml";

#[derive(Parser)]
#[command(name = "nyxd")]
#[command(about = "MX beamline orchestrator - fly scans and sample exchange")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level for stderr output
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Full fly-scan cycle: arm, kickoff, complete, publish documents
    Fly {
        /// Scan parameters (YAML)
        #[arg(short, long)]
        scan: PathBuf,

        /// Pretty-print documents
        #[arg(long)]
        pretty: bool,
    },
    /// Validate and run only the vector motion of a scan
    Vector {
        #[arg(short, long)]
        scan: PathBuf,
    },
    /// Sample-exchange robot command
    Robot {
        #[arg(value_enum)]
        action: RobotAction,

        #[arg(long)]
        puck: Option<String>,

        #[arg(long)]
        sample: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RobotAction {
    Mount,
    Dismount,
    Home,
    Soak,
    Recover,
}

impl Args {
    /// Explicit path, then NYXD_CONFIG, then the default location
    fn get_config_path(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| std::env::var("NYXD_CONFIG").ok().map(PathBuf::from))
    }

    fn load_config(&self) -> Result<Config> {
        match self.get_config_path() {
            Some(path) => {
                info!("Using config: {}", path.display());
                Config::load_from_path(&path).with_context(|| format!("Failed to load {}", path.display()))
            }
            None if Path::new(DEFAULT_CONFIG_PATH).is_file() => {
                info!("Using config: {}", DEFAULT_CONFIG_PATH);
                Config::load_from_path(DEFAULT_CONFIG_PATH).context("Failed to load default config")
            }
            None => {
                info!("No config file found, using built-in defaults");
                Ok(Config::default())
            }
        }
    }
}

fn robot_command(action: RobotAction, puck: Option<&str>, sample: Option<&str>) -> Result<RobotCommand> {
    let location = || -> Result<SampleLocation> {
        let puck = puck.context("--puck is required")?;
        let sample = sample.context("--sample is required")?;
        Ok(SampleLocation::parse(puck, sample)?)
    };
    Ok(match action {
        RobotAction::Mount => RobotCommand::Mount(location()?),
        RobotAction::Dismount => RobotCommand::Dismount(location()?),
        RobotAction::Home => RobotCommand::Home,
        RobotAction::Soak => RobotCommand::Soak,
        RobotAction::Recover => RobotCommand::Recover,
    })
}

async fn run(args: &Args, config: &Config) -> Result<()> {
    let sim = SimDevice::beamline(config);
    let device = sim.shared();

    match &args.command {
        Command::Fly { scan, pretty } => {
            let params = ScanParameters::load_from_path(scan)
                .with_context(|| format!("Failed to load scan {}", scan.display()))?;
            std::fs::create_dir_all(&params.data_directory_name)
                .with_context(|| format!("Failed to create {}", params.data_directory_name))?;

            let sink = if *pretty { ConsoleSink::pretty() } else { ConsoleSink::new() };
            let mut flyer = Flyer::from_config(&device, config);
            let published = flyer.fly(&params, &sink).await?;
            info!("Fly scan finished, {} documents published", published);
            sink.publish_custom(
                "summary",
                &serde_json::json!({ "published": published, "num_images": params.num_images }),
            )
            .await?;
        }
        Command::Vector { scan } => {
            let params = ScanParameters::load_from_path(scan)
                .with_context(|| format!("Failed to load scan {}", scan.display()))?;
            let controller =
                MotionController::new(&device, &config.channels.vector, MotionTiming::from(&config.motion));
            let outcome = controller.run(&vector_from_scan(&params, &config.motion)).await?;
            output::motion(&outcome);
        }
        Command::Robot { action, puck, sample } => {
            let command = robot_command(*action, puck.as_deref(), sample.as_deref())?;
            if let RobotCommand::Dismount(location) = command {
                // start from a mounted sample so dismount has something to do
                sim.set_value(&format!("{}Samp:Dif-Sts", config.channels.robot), 1);
                sim.set_value(&format!("{}Pck:Dif-I", config.channels.robot), location.puck);
                sim.set_value(&format!("{}Samp:Dif-I", config.channels.robot), location.sample);
            }
            let robot = RobotSequencer::new(&device, &config.channels.robot, config.robot.clone());
            match robot.execute(command).await {
                Ok(()) => output::robot_completed(command.name()),
                Err(e) => {
                    output::robot_failed(command.name(), &e.to_string());
                    return Err(e.into());
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = Level::from_str(&args.log_level)
        .map_err(|_| anyhow::anyhow!("Invalid log level '{}'", args.log_level))?;
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    info!("NYX beamline orchestrator");
    info!("{}", "=".repeat(50));

    let config = args.load_config()?;

    if let Err(e) = run(&args, &config).await {
        error!("{:#}", e);
        if let Some(nyx) = e.downcast_ref::<nyxd::NyxError>() {
            output::error(nyx);
        }
        return Err(e);
    }
    Ok(())
}
