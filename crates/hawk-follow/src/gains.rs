use serde::Deserialize;

use crate::config::AxisGains;
use crate::error::FollowError;

/// Gains applied while the scheduling parameter lies in `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GainBand {
    pub lower: f64,
    pub upper: f64,
    pub gains: AxisGains,
}

impl GainBand {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value < self.upper
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GainScheduling {
    pub enabled: bool,
    /// Telemetry field the bands are keyed on.
    pub parameter: String,
    pub bands: Vec<GainBand>,
}

impl Default for GainScheduling {
    fn default() -> Self {
        Self { enabled: false, parameter: "current_altitude".to_string(), bands: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GainSource {
    Static,
    Scheduled { lower: f64, upper: f64 },
    /// Scheduling is on but the parameter is unavailable.
    Missing,
    /// The parameter is known but lies outside every band.
    Unbanded,
}

impl GainScheduling {
    pub fn band_for(&self, value: f64) -> Option<&GainBand> {
        self.bands.iter().find(|b| b.contains(value))
    }

    /// Bands must be well-formed, sorted and non-overlapping.
    pub fn validate(&self) -> Result<(), FollowError> {
        if !self.enabled {
            return Ok(());
        }
        if self.parameter.trim().is_empty() {
            return Err(FollowError::Config("gain_scheduling.parameter is empty".into()));
        }
        if self.bands.is_empty() {
            return Err(FollowError::Config("gain_scheduling enabled without bands".into()));
        }
        for (i, b) in self.bands.iter().enumerate() {
            if !(b.lower < b.upper) {
                return Err(FollowError::Config(format!("gain band {} has lower >= upper", i)));
            }
        }
        for pair in self.bands.windows(2) {
            if pair[1].lower < pair[0].upper {
                return Err(FollowError::Config(format!(
                    "gain bands [{}, {}) and [{}, {}) overlap or are unsorted",
                    pair[0].lower, pair[0].upper, pair[1].lower, pair[1].upper
                )));
            }
        }
        Ok(())
    }

    /// Gains for the current value of the scheduling parameter.
    pub fn resolve(&self, defaults: &AxisGains, value: Option<f64>) -> (AxisGains, GainSource) {
        if !self.enabled {
            return (*defaults, GainSource::Static);
        }
        let Some(value) = value else {
            return (*defaults, GainSource::Missing);
        };
        match self.band_for(value) {
            Some(b) => (b.gains, GainSource::Scheduled { lower: b.lower, upper: b.upper }),
            None => (*defaults, GainSource::Unbanded),
        }
    }
}
