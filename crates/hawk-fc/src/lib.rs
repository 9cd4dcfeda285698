pub mod mav;
pub mod state;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hawk_proto::command::VelocityCommand;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct FcConfig {
    /// Full mavlink connection string, e.g. "udpin:0.0.0.0:14540".
    /// When absent, `serial_dev` and `baud` are used.
    pub url: Option<String>,
    pub serial_dev: Option<String>,
    pub baud: Option<u32>,

    /// MAVLink ids we use (companion side)
    pub sys_id: u8,
    pub comp_id: u8,

    /// target system/component (FC side). 1/1 is common for PX4.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Require seeing FC heartbeat before connect succeeds and before mode changes
    pub require_heartbeat: bool,

    /// Heartbeat wait during connect. Default 3s.
    pub heartbeat_timeout_ms: Option<u64>,

    /// How long to wait for the FC to report the requested mode. Default 1.5s.
    pub mode_confirm_timeout_ms: Option<u64>,

    /// Zero setpoints streamed before requesting offboard. Default 10.
    pub initial_setpoint_count: Option<u32>,

    /// Companion heartbeat rate. Default 1Hz.
    pub send_heartbeat_hz: Option<f32>,
}

impl FcConfig {
    pub fn connection_url(&self) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let dev = self.serial_dev.as_ref().context("fc.url or fc.serial_dev required")?;
        let baud = self.baud.context("fc.baud missing for serial link")?;
        Ok(format!("serial:{}:{}", dev, baud))
    }
}

/// Vehicle attitude in radians.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Orientation {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

/// Everything the follow loop needs from the flight controller.
///
/// Commands are async and fallible. Telemetry accessors are synchronous and
/// return the latest cached values.
#[async_trait]
pub trait FlightLink: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn send_initial_setpoint(&self) -> Result<()>;

    async fn start_offboard_mode(&self) -> Result<()>;

    async fn stop_offboard_mode(&self) -> Result<()>;

    async fn send_body_velocity_commands(&self, cmd: &VelocityCommand) -> Result<()>;

    /// Altitude above home in meters.
    fn current_altitude(&self) -> f64;

    fn orientation(&self) -> Orientation;

    /// Named scalar lookup (used for gain scheduling).
    fn telemetry_value(&self, name: &str) -> Option<f64>;

    /// Stops background telemetry reception.
    async fn stop_polling(&self) -> Result<()> {
        Ok(())
    }
}
