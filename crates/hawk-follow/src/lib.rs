//! Vision-guided target following: PID follower, setpoint heartbeat and the
//! controller that sequences tracking and the offboard session.

pub mod config;
pub mod controller;
pub mod doctor;
pub mod error;
pub mod follower;
pub mod gains;
pub mod pid;
pub mod session;
pub mod setpoint;
pub mod telemetry;

pub use config::{ControlStrategy, ControllerConfig, FollowConfig, TargetPositionMode};
pub use controller::{Command, ControllerStateMachine, Parts, TickOutput, TickStatus, TrackState};
pub use error::FollowError;
pub use follower::Follower;
pub use session::FollowSession;
pub use setpoint::{JoinOutcome, SenderHealth, SetpointSender, SharedCommand};
