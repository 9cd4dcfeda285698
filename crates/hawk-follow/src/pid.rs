use std::time::Instant;

use crate::config::PidGains;

/// Positional PID with output clamping and conditional-integration anti-windup.
///
/// `update(v)` evaluates `e = setpoint - v`. The derivative term acts on the
/// error and is zero on the first sample after construction or [`Pid::hold`].
#[derive(Debug, Clone)]
pub struct Pid {
    gains: PidGains,
    setpoint: f64,
    limits: (f64, f64),
    integral: f64,
    last_error: Option<f64>,
    last_time: Option<Instant>,
    saturated: bool,
}

impl Pid {
    /// `limits` must satisfy `lower <= upper`.
    pub fn new(gains: PidGains, setpoint: f64, limits: (f64, f64)) -> Self {
        let limits = if limits.0 <= limits.1 { limits } else { (limits.1, limits.0) };
        Self { gains, setpoint, limits, integral: 0.0, last_error: None, last_time: None, saturated: false }
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn limits(&self) -> (f64, f64) {
        self.limits
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Whether the last output was clamped.
    pub fn is_saturated(&self) -> bool {
        self.saturated
    }

    pub fn update(&mut self, input: f64) -> f64 {
        self.update_at(input, Instant::now())
    }

    pub fn update_at(&mut self, input: f64, now: Instant) -> f64 {
        let error = self.setpoint - input;
        let dt = self.last_time.map_or(0.0, |t| now.saturating_duration_since(t).as_secs_f64());

        let p = self.gains.p * error;
        let d = match self.last_error {
            Some(last) if dt > 0.0 && self.gains.d != 0.0 => self.gains.d * (error - last) / dt,
            _ => 0.0,
        };
        let integral = if dt > 0.0 { self.integral + self.gains.i * error * dt } else { self.integral };

        let (lo, hi) = self.limits;
        let raw = p + integral + d;
        let output = if raw.is_nan() { 0.0f64.clamp(lo, hi) } else { raw.clamp(lo, hi) };

        // integrate only while the output is not pinned at a limit
        self.saturated = raw.is_nan() || output != raw;
        if !self.saturated {
            self.integral = integral;
        }
        self.last_error = Some(error);
        self.last_time = Some(now);
        output
    }

    /// Marks a pause in evaluation. The integral is kept, but the next update
    /// starts a fresh time step and skips the derivative.
    pub fn hold(&mut self) {
        self.last_error = None;
        self.last_time = None;
    }
}
