use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use hawk_fc::{FlightLink, Orientation};
use hawk_proto::command::VelocityCommand;
use tracing::{debug, info, warn};

use crate::config::{ControlStrategy, FollowConfig};
use crate::gains::GainSource;
use crate::pid::Pid;
use crate::setpoint::SharedCommand;

/// Roll/pitch compensation for a body-fixed camera.
///
/// `r` is taken from the uncorrected coordinates.
pub fn gimbal_correction((x, y): (f64, f64), o: Orientation, distance: f64) -> (f64, f64) {
    let r = (x * x + y * y).sqrt();
    let adj_x = x + distance * o.roll + r * o.roll.cos();
    let adj_y = y - distance * o.pitch + r * o.roll.sin();
    (adj_x, adj_y)
}

/// Constant offset shrinking with the distance estimate.
pub fn adjustment_trim((x, y): (f64, f64), cfg: &FollowConfig) -> (f64, f64) {
    let scale = 1.0 + cfg.altitude_factor * cfg.default_distance;
    (x + cfg.base_adjustment_factor_x / scale, y + cfg.base_adjustment_factor_y / scale)
}

/// Turns normalized target positions into body velocity commands.
///
/// Image axes are cross-mapped onto the body: vertical image error drives
/// forward velocity, horizontal image error drives lateral velocity.
pub struct Follower {
    link: Arc<dyn FlightLink>,
    cfg: FollowConfig,
    /// Target lock, fixed for the lifetime of the follower.
    setpoint: (f64, f64),
    pid_x: Pid,
    pid_y: Pid,
    pid_z: Pid,
    command: Arc<SharedCommand>,
    gain_source: GainSource,
    config_warnings: u64,
}

impl Follower {
    pub fn new(
        link: Arc<dyn FlightLink>,
        initial_target: (f64, f64),
        cfg: FollowConfig,
        command: Arc<SharedCommand>,
    ) -> Self {
        let lim = cfg.velocity_limits;
        let g = cfg.pid_gains;
        // lateral controllers regulate the lock error to zero
        let pid_y = Pid::new(g.y, 0.0, (-lim.y, lim.y));
        let (pid_x, pid_z) = match cfg.control_strategy {
            ControlStrategy::ConstantAltitude => (
                Pid::new(g.x, 0.0, (-lim.x, lim.x)),
                Pid::new(g.z, cfg.min_descent_height, (-cfg.max_rate_of_descent, cfg.max_rate_of_descent)),
            ),
            ControlStrategy::ConstantDistance => (Pid::new(g.x, 0.0, (0.0, 0.0)), Pid::new(g.z, 0.0, (-lim.z, lim.z))),
        };
        info!(
            "follower: {:?} lock=({:.3}, {:.3}) gimbaled={}",
            cfg.control_strategy, initial_target.0, initial_target.1, cfg.camera_gimbaled
        );
        Self {
            link,
            cfg,
            setpoint: initial_target,
            pid_x,
            pid_y,
            pid_z,
            command,
            gain_source: GainSource::Static,
            config_warnings: 0,
        }
    }

    pub fn setpoint(&self) -> (f64, f64) {
        self.setpoint
    }

    pub fn strategy(&self) -> ControlStrategy {
        self.cfg.control_strategy
    }

    pub fn gain_source(&self) -> GainSource {
        self.gain_source
    }

    /// Steps where scheduling fell back to static gains.
    pub fn config_warnings(&self) -> u64 {
        self.config_warnings
    }

    pub fn pids(&self) -> [&Pid; 3] {
        [&self.pid_x, &self.pid_y, &self.pid_z]
    }

    pub fn compute(&mut self, target: (f64, f64)) -> VelocityCommand {
        self.compute_at(target, Instant::now())
    }

    /// One control step against `target` (normalized image coordinates).
    /// The command is published to the shared slot before it is returned.
    pub fn compute_at(&mut self, target: (f64, f64), now: Instant) -> VelocityCommand {
        self.refresh_gains();

        let corrected = if self.cfg.camera_gimbaled {
            target
        } else {
            gimbal_correction(target, self.link.orientation(), self.cfg.default_distance)
        };
        let (adj_x, adj_y) = adjustment_trim(corrected, &self.cfg);
        let error_x = self.setpoint.0 - adj_x;
        let error_y = self.setpoint.1 - adj_y;

        let alt = self.link.current_altitude();
        let above_floor = alt > self.cfg.min_descent_height;

        let (vel_x, vel_y, vel_z) = match self.cfg.control_strategy {
            ControlStrategy::ConstantAltitude => {
                let vx = self.pid_x.update_at(error_y, now);
                let vy = self.pid_y.update_at(error_x, now);
                let vz = if self.cfg.descent_enabled && above_floor {
                    self.pid_z.update_at(-alt, now)
                } else {
                    self.pid_z.hold();
                    0.0
                };
                (vx, vy, vz)
            }
            ControlStrategy::ConstantDistance => {
                let vy = self.pid_y.update_at(error_x, now);
                let vz = if above_floor {
                    self.pid_z.update_at(error_y, now)
                } else {
                    self.pid_z.hold();
                    0.0
                };
                (0.0, vy, vz)
            }
        };

        debug!(
            "follower: err=({:.3}, {:.3}) alt={:.1} -> v=({:.2}, {:.2}, {:.2})",
            error_x, error_y, alt, vel_x, vel_y, vel_z
        );
        let cmd = VelocityCommand::active(vel_x, vel_y, vel_z);
        self.command.publish(cmd);
        cmd
    }

    /// Computes a command and sends it once over the flight link.
    pub async fn follow_target(&mut self, target: (f64, f64)) -> Result<VelocityCommand> {
        let cmd = self.compute(target);
        self.link.send_body_velocity_commands(&cmd).await?;
        Ok(cmd)
    }

    fn refresh_gains(&mut self) {
        let sched = &self.cfg.gain_scheduling;
        let value = if sched.enabled { self.link.telemetry_value(&sched.parameter) } else { None };
        let (gains, source) = sched.resolve(&self.cfg.pid_gains, value);

        if source == GainSource::Missing {
            self.config_warnings += 1;
            if self.config_warnings == 1 {
                warn!("follower: gain scheduling field '{}' is unavailable, using static gains", sched.parameter);
            }
        } else if source != self.gain_source {
            debug!("follower: gains from {:?}", source);
        }
        self.gain_source = source;

        self.pid_x.set_gains(gains.x);
        self.pid_y.set_gains(gains.y);
        self.pid_z.set_gains(gains.z);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AxisGains, PidGains, VelocityLimits};
    use crate::gains::{GainBand, GainScheduling};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct StubLink {
        altitude: Mutex<f64>,
        orientation: Orientation,
        telemetry: HashMap<String, f64>,
        sent: Mutex<Vec<VelocityCommand>>,
        fail_send: bool,
    }

    #[async_trait]
    impl FlightLink for StubLink {
        async fn connect(&self) -> Result<()> {
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
            anyhow::ensure!(!self.fail_send, "link down");
            self.sent.lock().unwrap().push(*cmd);
            Ok(())
        }
        fn current_altitude(&self) -> f64 {
            *self.altitude.lock().unwrap()
        }
        fn orientation(&self) -> Orientation {
            self.orientation
        }
        fn telemetry_value(&self, name: &str) -> Option<f64> {
            self.telemetry.get(name).copied()
        }
    }

    fn p_only(p: f64) -> AxisGains {
        let g = PidGains::new(p, 0.0, 0.0);
        AxisGains { x: g, y: g, z: g }
    }

    fn cfg() -> FollowConfig {
        FollowConfig {
            pid_gains: p_only(1.0),
            velocity_limits: VelocityLimits { x: 5.0, y: 5.0, z: 2.0 },
            descent_enabled: true,
            min_descent_height: 10.0,
            max_rate_of_descent: 100.0,
            ..Default::default()
        }
    }

    fn follower(link: StubLink, cfg: FollowConfig) -> (Follower, Arc<SharedCommand>) {
        let shared = Arc::new(SharedCommand::new());
        (Follower::new(Arc::new(link), (0.0, 0.0), cfg, shared.clone()), shared)
    }

    #[test]
    fn gimbal_correction_for_rolled_airframe() {
        let o = Orientation { yaw: 0.0, pitch: 0.0, roll: 0.1 };
        let (x, y) = gimbal_correction((0.0, 0.0), o, 5.0);
        assert!((x - 0.5).abs() < 1e-12);
        assert!(y.abs() < 1e-12);

        let (x, y) = gimbal_correction((0.3, 0.4), o, 5.0);
        assert!((x - (0.3 + 0.5 + 0.5 * 0.1f64.cos())).abs() < 1e-12);
        assert!((y - (0.4 + 0.5 * 0.1f64.sin())).abs() < 1e-12);
    }

    #[test]
    fn trim_scales_with_distance() {
        let c = FollowConfig {
            base_adjustment_factor_x: 0.2,
            base_adjustment_factor_y: -0.1,
            altitude_factor: 0.1,
            default_distance: 10.0,
            ..Default::default()
        };
        let (x, y) = adjustment_trim((0.0, 0.0), &c);
        assert!((x - 0.1).abs() < 1e-12);
        assert!((y + 0.05).abs() < 1e-12);
    }

    #[test]
    fn lateral_axes_cross_mapped() {
        let (mut f, shared) = follower(StubLink::default(), cfg());
        let cmd = f.compute((0.2, -0.1));
        // error_x = -0.2 drives vel_y, error_y = 0.1 drives vel_x
        assert!((cmd.vel_x - -0.1).abs() < 1e-12);
        assert!((cmd.vel_y - 0.2).abs() < 1e-12);
        assert!(cmd.is_active());
        assert_eq!(shared.latest(), Some(cmd));
    }

    #[test]
    fn descent_halts_at_floor_inclusive() {
        let link = StubLink { altitude: Mutex::new(10.0), ..Default::default() };
        let (mut f, _) = follower(link, cfg());
        assert_eq!(f.compute((0.0, 0.0)).vel_z, 0.0);

        let link = StubLink { altitude: Mutex::new(10.5), ..Default::default() };
        let (mut f, _) = follower(link, cfg());
        // PID_z(-alt) against the floor: 10 + 10.5, clamped to the z limit
        let vz = f.compute((0.0, 0.0)).vel_z;
        assert!(vz > 0.0);
    }

    #[test]
    fn descent_disabled_keeps_altitude() {
        let link = StubLink { altitude: Mutex::new(50.0), ..Default::default() };
        let (mut f, _) = follower(link, FollowConfig { descent_enabled: false, ..cfg() });
        assert_eq!(f.compute((0.3, 0.3)).vel_z, 0.0);
    }

    #[test]
    fn halted_descent_does_not_integrate() {
        let link = Arc::new(StubLink { altitude: Mutex::new(5.0), ..Default::default() });
        let c = FollowConfig { pid_gains: AxisGains { z: PidGains::new(0.0, 1.0, 0.0), ..p_only(1.0) }, ..cfg() };
        let mut f = Follower::new(link.clone(), (0.0, 0.0), c, Arc::new(SharedCommand::new()));
        let t0 = Instant::now();
        f.compute_at((0.0, 0.0), t0);
        f.compute_at((0.0, 0.0), t0 + Duration::from_secs(5));
        assert_eq!(f.pids()[2].integral(), 0.0);

        *link.altitude.lock().unwrap() = 10.01;
        f.compute_at((0.0, 0.0), t0 + Duration::from_secs(6));
        assert_eq!(f.pids()[2].integral(), 0.0);
    }

    #[test]
    fn constant_distance_pins_forward_axis() {
        let link = StubLink { altitude: Mutex::new(30.0), ..Default::default() };
        let c = FollowConfig { control_strategy: ControlStrategy::ConstantDistance, ..cfg() };
        let (mut f, _) = follower(link, c);
        let cmd = f.compute((0.4, 0.5));
        assert_eq!(cmd.vel_x, 0.0);
        assert!((cmd.vel_y - 0.4).abs() < 1e-12);
        assert!((cmd.vel_z - 0.5).abs() < 1e-12);
    }

    #[test]
    fn outputs_stay_within_limits() {
        let link = StubLink { altitude: Mutex::new(1e6), ..Default::default() };
        let c = FollowConfig { pid_gains: p_only(1e6), max_rate_of_descent: 1.5, ..cfg() };
        let (mut f, _) = follower(link, c);
        for target in [(1e9, -1e9), (-1e12, 1e12), (f64::MAX, f64::MIN)] {
            let cmd = f.compute(target);
            assert!(cmd.vel_x.abs() <= 5.0);
            assert!(cmd.vel_y.abs() <= 5.0);
            assert!(cmd.vel_z.abs() <= 1.5);
        }
    }

    #[test]
    fn scheduled_gains_follow_telemetry() {
        let mut telemetry = HashMap::new();
        telemetry.insert("current_altitude".to_string(), 15.0);
        let link = StubLink { telemetry, ..Default::default() };
        let c = FollowConfig {
            gain_scheduling: GainScheduling {
                enabled: true,
                parameter: "current_altitude".into(),
                bands: vec![
                    GainBand { lower: 0.0, upper: 15.0, gains: p_only(1.0) },
                    GainBand { lower: 15.0, upper: 40.0, gains: p_only(3.0) },
                ],
            },
            ..cfg()
        };
        let (mut f, _) = follower(link, c);
        let cmd = f.compute((0.1, 0.0));
        assert_eq!(f.gain_source(), GainSource::Scheduled { lower: 15.0, upper: 40.0 });
        assert!((cmd.vel_y - 0.3).abs() < 1e-12);
    }

    #[test]
    fn missing_schedule_field_falls_back() {
        let c = FollowConfig {
            gain_scheduling: GainScheduling {
                enabled: true,
                parameter: "no_such_field".into(),
                bands: vec![GainBand { lower: 0.0, upper: 100.0, gains: p_only(9.0) }],
            },
            ..cfg()
        };
        let (mut f, _) = follower(StubLink::default(), c);
        let cmd = f.compute((0.1, 0.0));
        f.compute((0.1, 0.0));
        assert_eq!(f.gain_source(), GainSource::Missing);
        assert_eq!(f.config_warnings(), 2);
        assert!((cmd.vel_y - 0.1).abs() < 1e-12);
    }

    #[test]
    fn value_outside_every_band_uses_static_gains_quietly() {
        let mut telemetry = HashMap::new();
        telemetry.insert("current_altitude".to_string(), 99.0);
        let link = StubLink { telemetry, ..Default::default() };
        let c = FollowConfig {
            gain_scheduling: GainScheduling {
                enabled: true,
                parameter: "current_altitude".into(),
                bands: vec![GainBand { lower: 0.0, upper: 10.0, gains: p_only(9.0) }],
            },
            ..cfg()
        };
        let (mut f, _) = follower(link, c);
        let cmd = f.compute((0.1, 0.0));
        assert_eq!(f.gain_source(), GainSource::Unbanded);
        assert_eq!(f.config_warnings(), 0);
        assert!((cmd.vel_y - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn follow_target_sends_once_and_propagates_failure() {
        let link = Arc::new(StubLink::default());
        let mut f = Follower::new(link.clone(), (0.0, 0.0), cfg(), Arc::new(SharedCommand::new()));
        let cmd = f.follow_target((0.1, 0.1)).await.unwrap();
        assert_eq!(link.sent.lock().unwrap().as_slice(), &[cmd]);

        let failing = Arc::new(StubLink { fail_send: true, ..Default::default() });
        let mut f = Follower::new(failing, (0.0, 0.0), cfg(), Arc::new(SharedCommand::new()));
        assert!(f.follow_target((0.1, 0.1)).await.is_err());
    }
}
