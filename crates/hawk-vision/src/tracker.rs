use anyhow::Result;
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::template::TemplateTracker;
use crate::{normalize_point, BoundingBox, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerAlgorithm {
    /// Template match searched around the last box.
    Template,
    /// Template match searched around a constant-velocity prediction.
    Predictive,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub algorithm: TrackerAlgorithm,
    /// Search half-width in pixels around the expected position.
    pub search_radius: u32,
    /// Mean absolute grey-level difference above which a match counts as lost.
    pub max_mean_abs_diff: f32,
    /// 0 keeps the initial template forever, 1 replaces it every frame.
    pub template_update_rate: f32,
    pub center_history_length: usize,
    /// Weight of the previous velocity in the estimate (0..1).
    pub velocity_smoothing: f32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            algorithm: TrackerAlgorithm::Template,
            search_radius: 24,
            max_mean_abs_diff: 30.0,
            template_update_rate: 0.1,
            center_history_length: 10,
            velocity_smoothing: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackUpdate {
    pub success: bool,
    /// Box from this frame on success, last known box otherwise.
    pub bbox: Option<BoundingBox>,
}

impl TrackUpdate {
    pub fn lost(last: Option<BoundingBox>) -> Self {
        Self { success: false, bbox: last }
    }
}

/// Per-target bookkeeping every tracker keeps: box, center, normalized
/// coordinates and a bounded history of recent normalized centers.
#[derive(Debug, Clone)]
pub struct TargetState {
    bbox: Option<BoundingBox>,
    center: Option<(i32, i32)>,
    normalized_center: Option<(f64, f64)>,
    normalized_bbox: Option<(f64, f64, f64, f64)>,
    history: VecDeque<(f64, f64)>,
    capacity: usize,
    estimate: Option<(f64, f64)>,
    last_update: Option<Instant>,
}

impl TargetState {
    pub fn new(history_capacity: usize) -> Self {
        let capacity = history_capacity.max(1);
        Self {
            bbox: None,
            center: None,
            normalized_center: None,
            normalized_bbox: None,
            history: VecDeque::with_capacity(capacity),
            capacity,
            estimate: None,
            last_update: None,
        }
    }

    /// Records a new box and recomputes every derived coordinate.
    pub fn set_bbox(&mut self, bbox: BoundingBox, frame_w: u32, frame_h: u32) {
        let center = bbox.center();
        let normalized = normalize_point(center.0 as f64, center.1 as f64, frame_w, frame_h);

        let half_w = frame_w as f64 / 2.0;
        let half_h = frame_h as f64 / 2.0;
        self.normalized_bbox = Some((
            (bbox.x as f64 - half_w) / half_w,
            (bbox.y as f64 - half_h) / half_h,
            bbox.width as f64 / frame_w as f64,
            bbox.height as f64 / frame_h as f64,
        ));

        self.bbox = Some(bbox);
        self.center = Some(center);
        self.normalized_center = Some(normalized);

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(normalized);
        debug!("normalized center: ({:.3}, {:.3})", normalized.0, normalized.1);
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        self.bbox
    }

    pub fn center(&self) -> Option<(i32, i32)> {
        self.center
    }

    pub fn normalized_center(&self) -> Option<(f64, f64)> {
        self.normalized_center
    }

    /// Top-left corner normalized like the center, size as a fraction of the frame.
    pub fn normalized_bbox(&self) -> Option<(f64, f64, f64, f64)> {
        self.normalized_bbox
    }

    pub fn history(&self) -> impl Iterator<Item = &(f64, f64)> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Mean of the recorded normalized centers.
    pub fn smoothed_center(&self) -> Option<(f64, f64)> {
        if self.history.is_empty() {
            return None;
        }
        let n = self.history.len() as f64;
        let (sx, sy) = self.history.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
        Some((sx / n, sy / n))
    }

    /// Predicted pixel position of the center on the next frame.
    pub fn estimate(&self) -> Option<(f64, f64)> {
        self.estimate
    }

    pub fn set_estimate(&mut self, estimate: Option<(f64, f64)>) {
        self.estimate = estimate;
    }

    /// Time since the previous call; zero on the first.
    pub fn update_time(&mut self) -> Duration {
        let now = Instant::now();
        let dt = self.last_update.map(|t| now.duration_since(t)).unwrap_or_default();
        self.last_update = Some(now);
        dt
    }
}

/// Single-target visual tracker.
pub trait Tracker: Send {
    fn name(&self) -> &'static str;

    /// Starts from scratch on `bbox`; any previous target state is discarded.
    fn start_tracking(&mut self, frame: &Frame, bbox: BoundingBox) -> Result<()>;

    fn update(&mut self, frame: &Frame) -> TrackUpdate;

    fn state(&self) -> &TargetState;

    fn reinitialize(&mut self, frame: &Frame, bbox: BoundingBox) -> Result<()> {
        self.start_tracking(frame, bbox)
    }

    fn bbox(&self) -> Option<BoundingBox> {
        self.state().bbox()
    }

    fn center(&self) -> Option<(i32, i32)> {
        self.state().center()
    }

    fn normalized_center(&self) -> Option<(f64, f64)> {
        self.state().normalized_center()
    }
}

pub fn create_tracker(cfg: &TrackingConfig) -> Box<dyn Tracker> {
    match cfg.algorithm {
        TrackerAlgorithm::Template => Box::new(TemplateTracker::new(cfg.clone(), false)),
        TrackerAlgorithm::Predictive => Box::new(TemplateTracker::new(cfg.clone(), true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_box_normalizes_to_upper_left() {
        let mut st = TargetState::new(4);
        st.set_bbox(BoundingBox::new(100, 100, 50, 50), 640, 480);
        assert_eq!(st.center(), Some((125, 125)));
        let (nx, ny) = st.normalized_center().unwrap();
        assert!((nx - (-0.609375)).abs() < 1e-9);
        assert!((ny - (-0.479166)).abs() < 1e-5);
    }

    #[test]
    fn history_is_bounded() {
        let mut st = TargetState::new(3);
        for i in 0..5 {
            st.set_bbox(BoundingBox::new(i * 10, 0, 10, 10), 100, 100);
        }
        assert_eq!(st.history_len(), 3);
        let first = *st.history().next().unwrap();
        // oldest kept entry is the third box, center x = 25
        assert!((first.0 - (-0.5)).abs() < 1e-9);
    }

    #[test]
    fn smoothed_center_averages_history() {
        let mut st = TargetState::new(2);
        st.set_bbox(BoundingBox::new(0, 0, 0, 0), 100, 100);
        st.set_bbox(BoundingBox::new(100, 100, 0, 0), 100, 100);
        assert_eq!(st.smoothed_center(), Some((0.0, 0.0)));
    }

    #[test]
    fn factory_picks_algorithm() {
        let cfg = TrackingConfig { algorithm: TrackerAlgorithm::Predictive, ..Default::default() };
        assert_eq!(create_tracker(&cfg).name(), "predictive");
        assert_eq!(create_tracker(&TrackingConfig::default()).name(), "template");
    }
}
