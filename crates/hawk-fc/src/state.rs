use std::time::{Duration, Instant};

use crate::Orientation;

/// PX4 custom main mode carried in HEARTBEAT.custom_mode bits 16..24.
pub const PX4_MAIN_MODE_OFFBOARD: u32 = 6;

/// Latest telemetry seen from the flight controller.
#[derive(Debug, Clone, Default)]
pub struct FcStatus {
    pub connected: bool,
    pub last_heartbeat: Option<Instant>,
    pub custom_mode: Option<u32>,
    pub orientation: Orientation,
    pub relative_alt_m: Option<f64>,
    pub ground_speed: Option<f64>,
    pub climb_rate: Option<f64>,
    pub battery_voltage: Option<f32>,
    pub battery_remaining: Option<u8>,
}

impl FcStatus {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    pub fn in_offboard(&self) -> bool {
        self.custom_mode.map_or(false, |m| (m >> 16) & 0xff == PX4_MAIN_MODE_OFFBOARD)
    }

    /// Scalar telemetry by name.
    pub fn field(&self, name: &str) -> Option<f64> {
        match name {
            "current_altitude" | "altitude" => self.relative_alt_m,
            "current_ground_speed" | "ground_speed" => self.ground_speed,
            "climb_rate" => self.climb_rate,
            "current_roll" | "roll" => Some(self.orientation.roll),
            "current_pitch" | "pitch" => Some(self.orientation.pitch),
            "current_yaw" | "yaw" => Some(self.orientation.yaw),
            "battery_voltage" => self.battery_voltage.map(f64::from),
            "battery_remaining" => self.battery_remaining.map(f64::from),
            _ => None,
        }
    }
}
