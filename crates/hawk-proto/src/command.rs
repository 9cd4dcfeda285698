use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Active,
    Idle,
}

/// Body-frame velocity setpoint (m/s, NED body axes: x forward, y right, z down).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityCommand {
    pub vel_x: f64,
    pub vel_y: f64,
    pub vel_z: f64,
    pub timestamp: OffsetDateTime,
    pub status: CommandStatus,
}

impl VelocityCommand {
    pub fn active(vel_x: f64, vel_y: f64, vel_z: f64) -> Self {
        Self { vel_x, vel_y, vel_z, timestamp: OffsetDateTime::now_utc(), status: CommandStatus::Active }
    }

    /// Zero-velocity hover setpoint.
    pub fn idle() -> Self {
        Self { vel_x: 0.0, vel_y: 0.0, vel_z: 0.0, timestamp: OffsetDateTime::now_utc(), status: CommandStatus::Idle }
    }

    pub fn is_active(&self) -> bool {
        self.status == CommandStatus::Active
    }

    /// Same velocities, marked idle.
    pub fn into_idle(self) -> Self {
        Self { status: CommandStatus::Idle, timestamp: OffsetDateTime::now_utc(), ..self }
    }

    pub fn components(&self) -> [f64; 3] {
        [self.vel_x, self.vel_y, self.vel_z]
    }
}

impl Default for VelocityCommand {
    fn default() -> Self {
        Self::idle()
    }
}
