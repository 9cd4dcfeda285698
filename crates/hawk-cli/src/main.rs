use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use hawk_fc::mav::MavFlightLink;
use hawk_fc::{FcConfig, FlightLink, Orientation};
use hawk_follow::telemetry::{TelemetryConfig, TelemetrySink, UdpTelemetry};
use hawk_follow::{doctor, ControllerConfig, ControllerStateMachine, FollowConfig, Parts, TickStatus};
use hawk_proto::command::VelocityCommand;
use hawk_proto::report::StepReport;
use hawk_vision::camera::{CameraConfig, FrameSource, ImageSequence};
use hawk_vision::detector::{Detector, DetectorConfig, TemplateDetector};
use hawk_vision::tracker::{create_tracker, TrackingConfig};
use hawk_vision::BoundingBox;

use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "hawk", version, about = "Hawk - vision-guided target following")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    /// Track (and optionally follow) a target through the configured frame source.
    Run {
        /// Initial region of interest as x,y,w,h in pixels.
        #[arg(long, value_parser = parse_roi)]
        roi: Option<BoundingBox>,
        /// Open an offboard session once tracking has started.
        #[arg(long)]
        follow: bool,
        #[arg(long)]
        max_frames: Option<u64>,
    },
    Fc {
        #[command(subcommand)]
        cmd: FcCmd,
    },
}

#[derive(Debug, Subcommand)]
enum FcCmd {
    /// Connect and print the telemetry seen within a few seconds.
    Probe,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    camera: CameraConfig,
    #[serde(default)]
    tracking: TrackingConfig,
    #[serde(default)]
    detector: DetectorConfig,
    #[serde(default)]
    follow: FollowConfig,
    #[serde(default)]
    controller: ControllerConfig,
    #[serde(default)]
    telemetry: TelemetryConfig,

    fc: Option<FcConfig>,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

fn parse_roi(s: &str) -> Result<BoundingBox, String> {
    let parts: Vec<i32> = s
        .split(',')
        .map(|p| p.trim().parse::<i32>().map_err(|e| format!("{}: {}", p, e)))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [x, y, w, h] => Ok(BoundingBox::new(*x, *y, *w, *h)),
        _ => Err("expected x,y,w,h".into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor_cmd(&cfg)?,
        Command::Run { roi, follow, max_frames } => run(cfg, roi, follow, max_frames).await?,
        Command::Fc { cmd } => fc_cmd(&cfg, cmd).await?,
    }
    Ok(())
}

/// Checks shared by `doctor` and `run`; `run` refuses to start on a bad config.
fn validate(cfg: &Config) -> Result<()> {
    doctor::check_follow(&cfg.follow)?;
    doctor::check_controller(&cfg.controller)?;
    doctor::check_telemetry(&cfg.telemetry)?;

    anyhow::ensure!(cfg.camera.width > 0 && cfg.camera.height > 0, "camera.width/height invalid");
    anyhow::ensure!(cfg.camera.fps > 0, "camera.fps invalid");
    anyhow::ensure!(cfg.tracking.search_radius > 0, "tracking.search_radius must be > 0");

    if let Some(fc) = &cfg.fc {
        fc.connection_url()?;
    }
    Ok(())
}

fn doctor_cmd(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    validate(cfg)?;
    if cfg.fc.is_none() {
        warn!("doctor: no [fc] section, follow commands will only be logged");
    }
    info!("doctor: OK");
    Ok(())
}

async fn fc_cmd(cfg: &Config, cmd: FcCmd) -> Result<()> {
    match cmd {
        FcCmd::Probe => {
            let fc = cfg.fc.clone().context("no [fc] config section")?;
            let link = MavFlightLink::new(fc);
            link.connect().await?;
            tokio::time::sleep(Duration::from_secs(2)).await;
            let st = link.status();
            println!("connected={}", st.connected);
            println!("last_heartbeat_age={:?}", st.hb_age());
            println!("offboard={}", st.in_offboard());
            println!("altitude_m={:?}", st.relative_alt_m);
            println!("orientation={:?}", st.orientation);
            println!("battery_v={:?} remaining={:?}", st.battery_voltage, st.battery_remaining);
            link.stop_polling().await?;
            Ok(())
        }
    }
}

/// Stand-in used when no flight controller is configured: commands are logged.
struct LogOnlyLink;

#[async_trait]
impl FlightLink for LogOnlyLink {
    async fn connect(&self) -> Result<()> {
        info!("fc: no [fc] section, running without a flight controller");
        Ok(())
    }

    async fn send_initial_setpoint(&self) -> Result<()> {
        Ok(())
    }

    async fn start_offboard_mode(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_offboard_mode(&self) -> Result<()> {
        Ok(())
    }

    async fn send_body_velocity_commands(&self, cmd: &VelocityCommand) -> Result<()> {
        debug!("fc: v=({:.2}, {:.2}, {:.2}) {:?}", cmd.vel_x, cmd.vel_y, cmd.vel_z, cmd.status);
        Ok(())
    }

    fn current_altitude(&self) -> f64 {
        0.0
    }

    fn orientation(&self) -> Orientation {
        Orientation::default()
    }

    fn telemetry_value(&self, _name: &str) -> Option<f64> {
        None
    }
}

fn log_report(what: &str, report: &StepReport) {
    match serde_json::to_string(report) {
        Ok(s) if report.is_ok() => info!("{}: {}", what, s),
        Ok(s) => warn!("{}: {}", what, s),
        Err(e) => warn!("{}: report encode failed: {}", what, e),
    }
}

async fn run(cfg: Config, roi: Option<BoundingBox>, follow: bool, max_frames: Option<u64>) -> Result<()> {
    validate(&cfg).context("invalid config")?;
    info!("run: starting");

    let link: Arc<dyn FlightLink> = match cfg.fc.clone() {
        Some(fc) => Arc::new(MavFlightLink::new(fc)),
        None => Arc::new(LogOnlyLink),
    };

    let capture = ImageSequence::open(&cfg.camera)?;
    let detector: Option<Box<dyn Detector>> = if cfg.detector.enable {
        Some(Box::new(TemplateDetector::new(cfg.detector.clone())))
    } else {
        None
    };
    let telemetry: Option<Box<dyn TelemetrySink>> = if cfg.telemetry.enable {
        Some(Box::new(UdpTelemetry::bind(&cfg.telemetry)?))
    } else {
        None
    };

    let parts = Parts {
        detector,
        telemetry,
        capture: Some(Box::new(capture) as Box<dyn FrameSource>),
        ..Parts::new(create_tracker(&cfg.tracking))
    };
    let ctl = ControllerStateMachine::new(cfg.controller.clone(), cfg.follow.clone(), link, parts);
    let frame_period = Duration::from_secs_f64(1.0 / f64::from(cfg.camera.fps.max(1)));

    let mut frames = 0u64;
    let mut pending_roi = roi;
    loop {
        if max_frames.map_or(false, |m| frames >= m) {
            break;
        }
        let Some(frame) = ctl.next_frame()? else {
            info!("run: frame source exhausted");
            break;
        };
        frames += 1;

        if let Some(bbox) = pending_roi.take() {
            log_report("track", &ctl.toggle_tracking(&frame, Some(bbox)).await);
            if follow {
                log_report("connect", &ctl.connect().await);
            }
        }

        let out = ctl.tick(frame).await;
        for e in &out.errors {
            warn!("run: frame {}: {}", frames, e);
        }
        match out.status {
            TickStatus::Tracked(b) => debug!("run: frame {} tracked {:?}", frames, b.as_tuple()),
            TickStatus::Redetected(b) => info!("run: frame {} redetected {:?}", frames, b.as_tuple()),
            TickStatus::Lost => info!("run: frame {} target lost", frames),
            TickStatus::Idle => {}
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("run: interrupted");
                break;
            }
            _ = tokio::time::sleep(frame_period) => {}
        }
    }

    let health = ctl.sender_health();
    info!(
        "run: {} frames, {} setpoints sent, {} failed",
        frames,
        health.sent(),
        health.failures()
    );
    log_report("shutdown", &ctl.shutdown().await);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roi_argument() {
        assert_eq!(parse_roi("100, 100,50,50").unwrap(), BoundingBox::new(100, 100, 50, 50));
        assert!(parse_roi("1,2,3").is_err());
        assert!(parse_roi("a,2,3,4").is_err());
    }

    #[test]
    fn minimal_config_parses() {
        let cfg: Config = toml::from_str(
            r#"
            [camera]
            frames_dir = "frames"
            width = 640
            height = 480
            fps = 30

            [follow]
            control_strategy = "constant_altitude"
            "#,
        )
        .unwrap();
        assert!(cfg.fc.is_none());
        assert!(!cfg.telemetry.enable);
        doctor_cmd(&cfg).unwrap();
    }

    #[tokio::test]
    async fn run_refuses_overlapping_gain_bands() {
        let cfg: Config = toml::from_str(
            r#"
            [camera]
            frames_dir = "no-such-dir"
            width = 640
            height = 480
            fps = 30

            [follow.gain_scheduling]
            enabled = true
            parameter = "current_altitude"

            [[follow.gain_scheduling.bands]]
            lower = 0.0
            upper = 20.0
            gains = { x = { p = 1.0, i = 0.0, d = 0.0 }, y = { p = 1.0, i = 0.0, d = 0.0 }, z = { p = 1.0, i = 0.0, d = 0.0 } }

            [[follow.gain_scheduling.bands]]
            lower = 10.0
            upper = 30.0
            gains = { x = { p = 2.0, i = 0.0, d = 0.0 }, y = { p = 2.0, i = 0.0, d = 0.0 }, z = { p = 2.0, i = 0.0, d = 0.0 } }
            "#,
        )
        .unwrap();
        let err = run(cfg, None, false, Some(1)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("overlap"), "{:#}", err);
    }

    #[tokio::test]
    async fn run_refuses_slow_setpoint_rate() {
        let cfg: Config = toml::from_str(
            r#"
            [camera]
            frames_dir = "no-such-dir"
            width = 640
            height = 480
            fps = 30

            [controller]
            setpoint_rate_hz = 1.0
            "#,
        )
        .unwrap();
        let err = run(cfg, None, false, Some(1)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("setpoint_rate_hz"), "{:#}", err);
    }
}
