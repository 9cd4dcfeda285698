use anyhow::{Context, Result};
use image::GrayImage;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::template::{crop_patch, mean_abs_diff, search, to_gray};
use crate::tracker::Tracker;
use crate::{iou, BoundingBox, Frame};

/// Re-acquires a lost target from features captured when tracking started.
pub trait Detector: Send {
    fn extract_features(&mut self, frame: &Frame, bbox: BoundingBox) -> Result<()>;

    /// Searches `frame` for the target; on success the box is available from
    /// [`Detector::latest_bbox`].
    fn smart_redetection(&mut self, frame: &Frame, tracker: &dyn Tracker) -> bool;

    fn latest_bbox(&self) -> Option<BoundingBox>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub enable: bool,
    /// Grid step of the coarse full-frame pass.
    pub coarse_stride: u32,
    /// Coarse candidates refined at full resolution.
    pub max_candidates: usize,
    pub max_mean_abs_diff: f32,
    /// Score bonus (grey levels) per unit IoU with the tracker's last box.
    pub proximity_weight: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enable: true,
            coarse_stride: 4,
            max_candidates: 5,
            max_mean_abs_diff: 25.0,
            proximity_weight: 5.0,
        }
    }
}

pub struct TemplateDetector {
    cfg: DetectorConfig,
    template: Option<GrayImage>,
    latest: Option<BoundingBox>,
}

impl TemplateDetector {
    pub fn new(cfg: DetectorConfig) -> Self {
        Self { cfg, template: None, latest: None }
    }

    fn coarse_candidates(&self, gray: &GrayImage, template: &GrayImage) -> Vec<(i32, i32, f32)> {
        let (gw, gh) = gray.dimensions();
        let (tw, th) = template.dimensions();
        if tw > gw || th > gh {
            return Vec::new();
        }
        let stride = self.cfg.coarse_stride.max(1) as usize;

        let mut scored = Vec::new();
        for y in (0..=(gh - th)).step_by(stride) {
            for x in (0..=(gw - tw)).step_by(stride) {
                if let Some(s) = mean_abs_diff(gray, template, x as i32, y as i32) {
                    scored.push((x as i32, y as i32, s));
                }
            }
        }
        scored.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.cfg.max_candidates.max(1));
        scored
    }
}

impl Detector for TemplateDetector {
    fn extract_features(&mut self, frame: &Frame, bbox: BoundingBox) -> Result<()> {
        let (w, h) = frame.dimensions();
        let bbox = bbox.clip_to(w, h).with_context(|| format!("feature box {:?} outside frame", bbox))?;
        self.template = Some(crop_patch(&to_gray(frame), bbox));
        self.latest = None;
        info!("detector: features extracted from {:?}", bbox);
        Ok(())
    }

    fn smart_redetection(&mut self, frame: &Frame, tracker: &dyn Tracker) -> bool {
        self.latest = None;
        let Some(template) = self.template.as_ref() else {
            warn!("detector: redetection requested before features were extracted");
            return false;
        };

        let gray = to_gray(frame);
        let (tw, th) = template.dimensions();
        let last = tracker.bbox();
        let refine = self.cfg.coarse_stride.max(1) as i32;

        let mut best: Option<(BoundingBox, f32, f32)> = None;
        for (cx, cy, _) in self.coarse_candidates(&gray, template) {
            let Some((x, y, score)) = search(&gray, template, (cx, cy), refine) else { continue };
            let bbox = BoundingBox::new(x, y, tw as i32, th as i32);
            let overlap = last.map_or(0.0, |l| iou(&bbox, &l));
            let rank = score - self.cfg.proximity_weight * overlap;
            if best.map_or(true, |(_, _, r)| rank < r) {
                best = Some((bbox, score, rank));
            }
        }

        match best {
            Some((bbox, score, _)) if score <= self.cfg.max_mean_abs_diff => {
                info!("detector: redetected {:?} (score={:.2})", bbox, score);
                self.latest = Some(bbox);
                true
            }
            other => {
                debug!("detector: redetection failed (best={:?})", other.map(|b| b.1));
                false
            }
        }
    }

    fn latest_bbox(&self) -> Option<BoundingBox> {
        self.latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{create_tracker, TrackingConfig};
    use image::Rgb;

    fn frame_with_square(sx: u32, sy: u32) -> Frame {
        Frame::from_fn(120, 90, |x, y| {
            if x >= sx && x < sx + 12 && y >= sy && y < sy + 12 {
                Rgb([240, 240, 240])
            } else {
                let v = ((x * 7 + y * 3) % 60) as u8;
                Rgb([v, v, v])
            }
        })
    }

    #[test]
    fn redetects_far_away_target() {
        let start = frame_with_square(10, 10);
        let bbox = BoundingBox::new(10, 10, 12, 12);
        let mut det = TemplateDetector::new(DetectorConfig::default());
        det.extract_features(&start, bbox).unwrap();

        let mut tracker = create_tracker(&TrackingConfig::default());
        tracker.start_tracking(&start, bbox).unwrap();

        let moved = frame_with_square(90, 61);
        assert!(det.smart_redetection(&moved, tracker.as_ref()));
        assert_eq!(det.latest_bbox(), Some(BoundingBox::new(90, 61, 12, 12)));
    }

    #[test]
    fn fails_without_features_or_target() {
        let frame = frame_with_square(10, 10);
        let tracker = create_tracker(&TrackingConfig::default());
        let mut det = TemplateDetector::new(DetectorConfig::default());
        assert!(!det.smart_redetection(&frame, tracker.as_ref()));

        det.extract_features(&frame, BoundingBox::new(10, 10, 12, 12)).unwrap();
        let empty = Frame::from_pixel(120, 90, Rgb([0, 0, 0]));
        assert!(!det.smart_redetection(&empty, tracker.as_ref()));
        assert_eq!(det.latest_bbox(), None);
    }
}
