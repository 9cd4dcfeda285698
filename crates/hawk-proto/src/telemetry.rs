use serde::{Deserialize, Serialize};

use crate::command::VelocityCommand;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub tracking: bool,
    pub bbox: Option<(i32, i32, i32, i32)>,
    pub center: Option<(i32, i32)>,
    pub normalized_center: Option<(f64, f64)>,
    // frames since the tracker last reported success
    pub lost_frames: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerSnapshot {
    pub session: String,
    pub following: bool,
    pub command: Option<VelocityCommand>,
    pub altitude_m: Option<f64>,
    // setpoint heartbeat health
    pub setpoints_sent: u64,
    pub setpoint_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub ts_unix_ms: i64,
    pub tracker: TrackerSnapshot,
    pub follower: FollowerSnapshot,
}
