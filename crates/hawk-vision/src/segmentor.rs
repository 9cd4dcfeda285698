use anyhow::Result;

use crate::{BoundingBox, Frame};

/// Scene segmentation. Implementations wrap a model; the follow loop only
/// needs the rendered frame and the boxes from the last pass.
pub trait Segmentor: Send {
    fn segment_frame(&mut self, frame: &Frame) -> Result<Frame>;

    fn last_detections(&self) -> Vec<BoundingBox>;
}

/// First detection whose box contains the point.
pub fn detection_at(detections: &[BoundingBox], x: i32, y: i32) -> Option<BoundingBox> {
    detections.iter().copied().find(|d| d.contains(x, y))
}
