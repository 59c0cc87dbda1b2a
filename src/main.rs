use anyhow::{bail, Context, Result};
use bubblebot::config::{self, Settings};
use bubblebot::core::{
    Action, ActionBlock, AuxCommand, AuxDevice, Pose, Timeline, FOGGER_TRACK, MOTORS_TRACK,
};
use bubblebot::hardware::{Actuator, ConnectivityMonitor, HttpActuator, MockActuator, SharedActuatorState};
use bubblebot::playback::{ActionDispatcher, DispatchOutcome, EngineSnapshot, RunController};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bubblebot", version, about = "Timeline player for the BubbleBot bubble machine")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Controller URL, overrides the settings file
    #[arg(long, global = true, env = "BUBBLEBOT_URL")]
    url: Option<String>,

    /// Talk to a simulated controller instead of the real one
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Play a timeline in a loop until interrupted
    Run {
        /// Timeline JSON file
        timeline: PathBuf,

        /// Stop after this many seconds
        #[arg(long = "for", value_name = "SECS")]
        duration: Option<f64>,
    },
    /// Probe the controller once and print its state
    Probe,
    /// Move the arms to a pose (OPEN, CLOSE, DIP)
    Move { pose: Pose },
    /// Start or stop the blower or fogger
    Aux {
        device: AuxDevice,
        command: AuxCommand,
        /// Percent; defaults to the configured speed or intensity
        intensity: Option<u8>,
    },
    /// Print an example dip-and-blow timeline
    ExampleTimeline,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bubblebot=info")),
        )
        .init();

    let cli = Cli::parse();

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    if let Some(url) = cli.url {
        settings.actuator.base_url = url;
    }

    match cli.command {
        Command::ExampleTimeline => {
            let timeline = example_timeline(&settings)?;
            println!("{}", serde_json::to_string_pretty(&timeline.to_document())?);
            Ok(())
        }
        Command::Probe => {
            let actuator = build_actuator(&settings, cli.mock)?;
            let state = SharedActuatorState::default();
            let monitor = ConnectivityMonitor::new(
                actuator,
                state.clone(),
                settings.probe_interval(),
                settings.probe_timeout(),
            );
            let online = monitor.probe_once().await;
            println!("{}", serde_json::to_string_pretty(&state.snapshot())?);
            if !online {
                bail!("{} is offline", settings.actuator.base_url);
            }
            Ok(())
        }
        Command::Move { pose } => manual(&settings, cli.mock, Action::movement(pose)).await,
        Command::Aux {
            device,
            command,
            intensity,
        } => {
            let intensity = match command {
                AuxCommand::Start => Some(intensity.unwrap_or(match device {
                    AuxDevice::Blower => settings.blower.speed,
                    AuxDevice::Fogger => settings.fogger.intensity,
                })),
                AuxCommand::Stop => None,
            };
            manual(&settings, cli.mock, Action::aux(device, command, intensity)).await
        }
        Command::Run { timeline, duration } => {
            let timeline = config::load_timeline(&timeline, settings.motion.clone())?;
            let duration = duration
                .map(Duration::try_from_secs_f64)
                .transpose()
                .context("--for must be a non-negative number of seconds")?;
            play(&settings, cli.mock, timeline, duration).await
        }
    }
}

fn build_actuator(settings: &Settings, mock: bool) -> Result<Arc<dyn Actuator>> {
    if mock {
        let targets = settings.motion.targets.clone();
        let home = targets.get(Pose::HOME).unwrap_or_default();
        info!("Using simulated controller");
        return Ok(Arc::new(
            MockActuator::new("mock")
                .with_travel(settings.motion.seconds_per_step)
                .with_targets(targets)
                .with_positions(home),
        ));
    }
    let actuator = HttpActuator::new(&settings.actuator.base_url)
        .with_context(|| format!("Failed to create client for {}", settings.actuator.base_url))?;
    Ok(Arc::new(actuator))
}

/// Monitor plus controller over one actuator
fn build_engine(
    settings: &Settings,
    mock: bool,
    timeline: Timeline,
) -> Result<(ConnectivityMonitor, RunController)> {
    let actuator = build_actuator(settings, mock)?;
    let state = SharedActuatorState::default();
    let monitor = ConnectivityMonitor::new(
        actuator.clone(),
        state.clone(),
        settings.probe_interval(),
        settings.probe_timeout(),
    );
    let controller = RunController::new(
        ActionDispatcher::new(actuator, state),
        timeline,
        settings.playback_config(),
        settings.remote_config(),
    );
    Ok((monitor, controller))
}

async fn manual(settings: &Settings, mock: bool, action: Action) -> Result<()> {
    let timeline = Timeline::with_default_tracks(settings.motion.clone());
    let (monitor, controller) = build_engine(settings, mock, timeline)?;
    if !monitor.probe_once().await {
        bail!("{} is offline", settings.actuator.base_url);
    }

    match controller.manual_override(action).await? {
        DispatchOutcome::Completed => {
            println!("{}", serde_json::to_string_pretty(&controller.snapshot())?);
            Ok(())
        }
        outcome => bail!("{} was not sent ({:?})", action, outcome),
    }
}

async fn play(settings: &Settings, mock: bool, timeline: Timeline, duration: Option<Duration>) -> Result<()> {
    let (monitor, controller) = build_engine(settings, mock, timeline)?;

    // Know whether the controller is there before pushing configuration
    if !monitor.probe_once().await {
        warn!("{} is offline, playing locally until it answers", settings.actuator.base_url);
    }
    monitor.start();
    controller.start().await?;

    let deadline = duration.map(|d| Instant::now() + d);
    let mut status = tokio::time::interval(Duration::from_secs(1));
    let mut aborted = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = wait_until(deadline) => {
                info!("Run time elapsed");
                break;
            }
            _ = status.tick() => {
                let snap = controller.snapshot();
                log_status(&snap);
                if !snap.running {
                    aborted = snap.last_error;
                    break;
                }
            }
        }
    }

    controller.stop().await;
    monitor.stop();

    match aborted {
        Some(reason) => bail!("Run aborted: {}", reason),
        None => Ok(()),
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn log_status(snap: &EngineSnapshot) {
    info!(
        "{:<8} {:>5.1}/{:.1}s loop {} | {} | L{} R{} | blower {} fogger {}",
        snap.machine_state,
        snap.playhead,
        snap.loop_duration,
        snap.iteration,
        if snap.online { "online" } else { "OFFLINE" },
        snap.positions.left,
        snap.positions.right,
        on_off(snap.blower_running),
        on_off(snap.fogger_running),
    );
}

fn on_off(running: bool) -> &'static str {
    if running {
        "on"
    } else {
        "off"
    }
}

/// One dip cycle: dip and soak, lift out, open in front of the blower with smoke
fn example_timeline(settings: &Settings) -> Result<Timeline> {
    let motion = settings.motion.clone();
    let remote = &settings.remote;
    let mut timeline = Timeline::with_default_tracks(motion.clone());

    let mut position = timeline.origin();
    let mut at = 0.0;
    for (pose, hold) in [
        (Pose::Dip, remote.dip_duration),
        (Pose::Close, remote.lift_duration),
        (Pose::Open, remote.blow_duration),
    ] {
        let action = Action::movement(pose);
        let travel = motion.estimate(&action, &position);
        timeline.insert_block(MOTORS_TRACK, ActionBlock::movement(pose, at, hold))?;

        if pose == Pose::Open {
            timeline.insert_block(
                FOGGER_TRACK,
                ActionBlock::fogger(AuxCommand::Start, at, travel + hold).with_intensity(settings.fogger.intensity.min(100)),
            )?;
            timeline.insert_block(FOGGER_TRACK, ActionBlock::fogger(AuxCommand::Stop, at + travel + hold, 0.0))?;
        }

        position = motion.resolve(&action).unwrap_or(position);
        at += travel + hold;
    }
    Ok(timeline)
}
