use anyhow::Result;

use crate::config::{ControllerConfig, FollowConfig};
use crate::telemetry::TelemetryConfig;

pub fn check_follow(cfg: &FollowConfig) -> Result<()> {
    let lim = cfg.velocity_limits;
    anyhow::ensure!(lim.x >= 0.0 && lim.y >= 0.0 && lim.z >= 0.0, "follow.velocity_limits must be >= 0");
    anyhow::ensure!(cfg.max_rate_of_descent > 0.0, "follow.max_rate_of_descent must be > 0");
    anyhow::ensure!(cfg.min_descent_height >= 0.0, "follow.min_descent_height must be >= 0");
    anyhow::ensure!(cfg.default_distance > 0.0, "follow.default_distance must be > 0");
    anyhow::ensure!(
        1.0 + cfg.altitude_factor * cfg.default_distance > 0.0,
        "follow.altitude_factor makes the adjustment scale non-positive"
    );
    let (ax, ay) = cfg.desired_aim;
    anyhow::ensure!(ax.abs() <= 1.0 && ay.abs() <= 1.0, "follow.desired_aim must be within [-1, 1]");
    cfg.gain_scheduling.validate()?;
    Ok(())
}

pub fn check_controller(cfg: &ControllerConfig) -> Result<()> {
    // PX4 drops out of offboard below 2Hz
    anyhow::ensure!(
        cfg.setpoint_rate_hz > 2.0 && cfg.setpoint_rate_hz <= 100.0,
        "controller.setpoint_rate_hz should be in (2, 100]"
    );
    anyhow::ensure!(cfg.sender_join_timeout_ms >= 50, "controller.sender_join_timeout_ms too small");
    Ok(())
}

pub fn check_telemetry(cfg: &TelemetryConfig) -> Result<()> {
    if cfg.enable {
        anyhow::ensure!(!cfg.host.is_empty(), "telemetry.host missing");
        anyhow::ensure!(cfg.port != 0, "telemetry.port missing");
        anyhow::ensure!(cfg.rate_hz > 0.0 && cfg.rate_hz <= 50.0, "telemetry.rate_hz should be in (0, 50]");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gains::{GainBand, GainScheduling};

    #[test]
    fn defaults_pass() {
        check_follow(&FollowConfig::default()).unwrap();
        check_controller(&ControllerConfig::default()).unwrap();
        check_telemetry(&TelemetryConfig::default()).unwrap();
    }

    #[test]
    fn catches_bad_values() {
        let mut f = FollowConfig::default();
        f.velocity_limits.y = -1.0;
        assert!(check_follow(&f).is_err());

        let f = FollowConfig {
            gain_scheduling: GainScheduling {
                enabled: true,
                parameter: "current_altitude".into(),
                bands: vec![
                    GainBand { lower: 10.0, upper: 20.0, gains: FollowConfig::default().pid_gains },
                    GainBand { lower: 0.0, upper: 10.0, gains: FollowConfig::default().pid_gains },
                ],
            },
            ..Default::default()
        };
        assert!(check_follow(&f).is_err());

        let c = ControllerConfig { setpoint_rate_hz: 1.0, ..Default::default() };
        assert!(check_controller(&c).is_err());
    }
}
