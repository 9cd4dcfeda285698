use image::Rgb;

use crate::tracker::TargetState;
use crate::{BoundingBox, Frame};

pub const TRACK_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const CENTER_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const ESTIMATE_COLOR: Rgb<u8> = Rgb([0, 0, 255]);

fn put(frame: &mut Frame, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < frame.width() && (y as u32) < frame.height() {
        frame.put_pixel(x as u32, y as u32, color);
    }
}

pub fn draw_rect(frame: &mut Frame, bbox: BoundingBox, color: Rgb<u8>) {
    let (x2, y2) = (bbox.right() - 1, bbox.bottom() - 1);
    for x in bbox.x..=x2 {
        put(frame, x, bbox.y, color);
        put(frame, x, y2, color);
    }
    for y in bbox.y..=y2 {
        put(frame, bbox.x, y, color);
        put(frame, x2, y, color);
    }
}

/// Filled square marker of half-size `r`.
pub fn draw_marker(frame: &mut Frame, (cx, cy): (i32, i32), r: i32, color: Rgb<u8>) {
    for y in cy - r..=cy + r {
        for x in cx - r..=cx + r {
            put(frame, x, y, color);
        }
    }
}

/// Box, center and (when present) the predicted position.
pub fn annotate(frame: &mut Frame, state: &TargetState) {
    if let Some(bbox) = state.bbox() {
        draw_rect(frame, bbox, TRACK_COLOR);
    }
    if let Some(c) = state.center() {
        draw_marker(frame, c, 2, CENTER_COLOR);
    }
    if let Some((ex, ey)) = state.estimate() {
        draw_marker(frame, (ex.round() as i32, ey.round() as i32), 1, ESTIMATE_COLOR);
    }
}
