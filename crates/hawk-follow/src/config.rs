use serde::Deserialize;
use std::time::Duration;

use crate::gains::GainScheduling;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStrategy {
    /// Lateral hold on x/y, descend toward the floor on z.
    ConstantAltitude,
    /// Lateral hold on y, image-height hold on z, x left to an outer controller.
    ConstantDistance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPositionMode {
    /// Lock onto wherever the target is when following starts.
    Initial,
    /// Always steer the target toward `desired_aim`.
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PidGains {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

impl PidGains {
    pub const fn new(p: f64, i: f64, d: f64) -> Self {
        Self { p, i, d }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AxisGains {
    pub x: PidGains,
    pub y: PidGains,
    pub z: PidGains,
}

/// Symmetric per-axis velocity limits in m/s.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct VelocityLimits {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FollowConfig {
    pub control_strategy: ControlStrategy,
    pub target_position_mode: TargetPositionMode,
    /// Normalized aim point used in `fixed` mode.
    pub desired_aim: (f64, f64),
    pub velocity_limits: VelocityLimits,
    pub pid_gains: AxisGains,
    pub gain_scheduling: GainScheduling,
    pub camera_gimbaled: bool,
    pub descent_enabled: bool,
    /// Descent floor in meters above home; descent halts at or below it.
    pub min_descent_height: f64,
    pub max_rate_of_descent: f64,
    pub base_adjustment_factor_x: f64,
    pub base_adjustment_factor_y: f64,
    pub altitude_factor: f64,
    /// Distance estimate to the target in meters.
    pub default_distance: f64,
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            control_strategy: ControlStrategy::ConstantAltitude,
            target_position_mode: TargetPositionMode::Initial,
            desired_aim: (0.0, 0.0),
            velocity_limits: VelocityLimits { x: 10.0, y: 10.0, z: 5.0 },
            pid_gains: AxisGains {
                x: PidGains::new(6.0, 0.3, 0.5),
                y: PidGains::new(6.0, 0.3, 0.5),
                z: PidGains::new(1.0, 0.02, 0.1),
            },
            gain_scheduling: GainScheduling::default(),
            camera_gimbaled: true,
            descent_enabled: false,
            min_descent_height: 20.0,
            max_rate_of_descent: 3.0,
            base_adjustment_factor_x: 0.0,
            base_adjustment_factor_y: 0.0,
            altitude_factor: 0.005,
            default_distance: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Run the detector when the tracker loses the target.
    pub auto_redetect: bool,
    pub setpoint_rate_hz: f64,
    pub sender_join_timeout_ms: u64,
    pub annotate_frames: bool,
}

impl ControllerConfig {
    pub fn setpoint_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.setpoint_rate_hz.max(0.1))
    }

    pub fn sender_join_timeout(&self) -> Duration {
        Duration::from_millis(self.sender_join_timeout_ms)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { auto_redetect: true, setpoint_rate_hz: 20.0, sender_join_timeout_ms: 500, annotate_frames: false }
    }
}
