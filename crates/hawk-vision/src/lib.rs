mod nms;
pub mod camera;
pub mod detector;
pub mod overlay;
pub mod segmentor;
pub mod template;
pub mod tracker;

use serde::{Deserialize, Serialize};

pub use nms::iou;

/// Video frame as delivered by capture: packed RGB8.
pub type Frame = image::RgbImage;

/// Pixel-space box, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Box spanning two corners, as segmentation models report them.
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x: x1.min(x2), y: y1.min(y2), width: (x2 - x1).abs(), height: (y2 - y1).abs() }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn center(&self) -> (i32, i32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    /// Edges inclusive, so a click on the outline selects the box.
    pub fn contains(&self, px: i32, py: i32) -> bool {
        self.x <= px && px <= self.right() && self.y <= py && py <= self.bottom()
    }

    /// Intersection with the frame rectangle; `None` when nothing is left.
    pub fn clip_to(&self, frame_w: u32, frame_h: u32) -> Option<Self> {
        let x1 = self.x.max(0);
        let y1 = self.y.max(0);
        let x2 = self.right().min(frame_w as i32);
        let y2 = self.bottom().min(frame_h as i32);
        let clipped = Self { x: x1, y: y1, width: x2 - x1, height: y2 - y1 };
        clipped.is_valid().then_some(clipped)
    }

    pub fn as_tuple(&self) -> (i32, i32, i32, i32) {
        (self.x, self.y, self.width, self.height)
    }
}

impl From<(i32, i32, i32, i32)> for BoundingBox {
    fn from((x, y, width, height): (i32, i32, i32, i32)) -> Self {
        Self { x, y, width, height }
    }
}

/// Maps a pixel position to [-1, 1] per axis with the frame center at (0, 0).
pub fn normalize_point(px: f64, py: f64, frame_w: u32, frame_h: u32) -> (f64, f64) {
    let half_w = frame_w as f64 / 2.0;
    let half_h = frame_h as f64 / 2.0;
    ((px - half_w) / half_w, (py - half_h) / half_h)
}
