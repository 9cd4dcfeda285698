use anyhow::{Context, Result};
use image::{imageops, GrayImage, Luma};
use tracing::{debug, info};

use crate::tracker::{TargetState, TrackUpdate, Tracker, TrackingConfig};
use crate::{BoundingBox, Frame};

pub fn to_gray(frame: &Frame) -> GrayImage {
    imageops::grayscale(frame)
}

pub fn crop_patch(gray: &GrayImage, bbox: BoundingBox) -> GrayImage {
    imageops::crop_imm(gray, bbox.x as u32, bbox.y as u32, bbox.width as u32, bbox.height as u32).to_image()
}

/// Mean absolute grey-level difference between `patch` and the window of
/// `gray` whose top-left corner is (x, y). `None` when the window leaves the frame.
pub fn mean_abs_diff(gray: &GrayImage, patch: &GrayImage, x: i32, y: i32) -> Option<f32> {
    let (gw, gh) = gray.dimensions();
    let (pw, ph) = patch.dimensions();
    if x < 0 || y < 0 || pw == 0 || ph == 0 || x as u32 + pw > gw || y as u32 + ph > gh {
        return None;
    }

    let g = gray.as_raw();
    let p = patch.as_raw();
    let (x, y) = (x as usize, y as usize);
    let (gw, pw) = (gw as usize, pw as usize);

    let mut sum: u64 = 0;
    for row in 0..ph as usize {
        let go = (y + row) * gw + x;
        let po = row * pw;
        for (a, b) in g[go..go + pw].iter().zip(&p[po..po + pw]) {
            sum += a.abs_diff(*b) as u64;
        }
    }
    Some(sum as f32 / (pw * ph as usize) as f32)
}

/// Exhaustive search of top-left positions within `radius` of `origin`.
/// The origin is scored first and only a strictly better match replaces it,
/// so a stationary target never drifts on ties.
pub fn search(gray: &GrayImage, patch: &GrayImage, origin: (i32, i32), radius: i32) -> Option<(i32, i32, f32)> {
    let mut best = mean_abs_diff(gray, patch, origin.0, origin.1).map(|s| (origin.0, origin.1, s));
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx == 0 && dy == 0 {
                continue;
            }
            let (x, y) = (origin.0 + dx, origin.1 + dy);
            if let Some(score) = mean_abs_diff(gray, patch, x, y) {
                if best.map_or(true, |(_, _, b)| score < b) {
                    best = Some((x, y, score));
                }
            }
        }
    }
    best
}

fn blend(template: &mut GrayImage, patch: &GrayImage, rate: f32) {
    if rate <= 0.0 || template.dimensions() != patch.dimensions() {
        return;
    }
    let rate = rate.min(1.0);
    for (t, p) in template.pixels_mut().zip(patch.pixels()) {
        let v = (1.0 - rate) * t.0[0] as f32 + rate * p.0[0] as f32;
        *t = Luma([v.round().clamp(0.0, 255.0) as u8]);
    }
}

/// Grey-level template tracker. With `predictive` set, the search window is
/// centered on a smoothed constant-velocity prediction instead of the last box.
///
/// A box that sticks out of the frame is tracked as given; only its visible
/// part becomes the template, matched at a fixed offset inside the box.
pub struct TemplateTracker {
    cfg: TrackingConfig,
    predictive: bool,
    template: Option<GrayImage>,
    patch_offset: (i32, i32),
    state: TargetState,
    velocity: (f64, f64),
}

impl TemplateTracker {
    pub fn new(cfg: TrackingConfig, predictive: bool) -> Self {
        let state = TargetState::new(cfg.center_history_length);
        Self { cfg, predictive, template: None, patch_offset: (0, 0), state, velocity: (0.0, 0.0) }
    }

    pub fn velocity(&self) -> (f64, f64) {
        self.velocity
    }

    /// Top-left corner of the template window for a box at `last`.
    fn search_origin(&self, last: BoundingBox) -> (i32, i32) {
        let (ox, oy) = (last.x + self.patch_offset.0, last.y + self.patch_offset.1);
        if self.predictive {
            (ox + self.velocity.0.round() as i32, oy + self.velocity.1.round() as i32)
        } else {
            (ox, oy)
        }
    }
}

impl Tracker for TemplateTracker {
    fn name(&self) -> &'static str {
        if self.predictive { "predictive" } else { "template" }
    }

    fn start_tracking(&mut self, frame: &Frame, bbox: BoundingBox) -> Result<()> {
        anyhow::ensure!(bbox.is_valid(), "degenerate bounding box {:?}", bbox);
        let (w, h) = frame.dimensions();
        let visible = bbox.clip_to(w, h).with_context(|| format!("bounding box {:?} outside {}x{} frame", bbox, w, h))?;

        let gray = to_gray(frame);
        self.template = Some(crop_patch(&gray, visible));
        self.patch_offset = (visible.x - bbox.x, visible.y - bbox.y);
        self.state = TargetState::new(self.cfg.center_history_length);
        self.state.set_bbox(bbox, w, h);
        self.state.update_time();
        self.velocity = (0.0, 0.0);
        info!("tracker[{}]: started on {:?}", self.name(), bbox);
        Ok(())
    }

    fn update(&mut self, frame: &Frame) -> TrackUpdate {
        let last = self.state.bbox();
        let (Some(template), Some(prev)) = (self.template.as_ref(), last) else {
            return TrackUpdate::lost(last);
        };

        let gray = to_gray(frame);
        let origin = self.search_origin(prev);
        let found = search(&gray, template, origin, self.cfg.search_radius as i32);

        let Some((x, y, score)) = found.filter(|(_, _, s)| *s <= self.cfg.max_mean_abs_diff) else {
            debug!("tracker[{}]: lost (best={:?})", self.name(), found.map(|f| f.2));
            return TrackUpdate::lost(last);
        };

        let (tw, th) = template.dimensions();
        let window = BoundingBox::new(x, y, tw as i32, th as i32);
        let bbox = BoundingBox::new(x - self.patch_offset.0, y - self.patch_offset.1, prev.width, prev.height);
        let a = self.cfg.velocity_smoothing as f64;
        let (dx, dy) = ((bbox.x - prev.x) as f64, (bbox.y - prev.y) as f64);
        self.velocity = (a * self.velocity.0 + (1.0 - a) * dx, a * self.velocity.1 + (1.0 - a) * dy);

        let rate = self.cfg.template_update_rate;
        if rate > 0.0 {
            let patch = crop_patch(&gray, window);
            if let Some(t) = self.template.as_mut() {
                blend(t, &patch, rate);
            }
        }

        let (w, h) = frame.dimensions();
        self.state.set_bbox(bbox, w, h);
        self.state.update_time();
        let (cx, cy) = bbox.center();
        self.state.set_estimate(Some((cx as f64 + self.velocity.0, cy as f64 + self.velocity.1)));
        debug!("tracker[{}]: {:?} score={:.2}", self.name(), bbox, score);
        TrackUpdate { success: true, bbox: Some(bbox) }
    }

    fn state(&self) -> &TargetState {
        &self.state
    }
}
