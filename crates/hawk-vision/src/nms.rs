use crate::BoundingBox;

pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ix_a = a.x.max(b.x);
    let iy_a = a.y.max(b.y);
    let ix_b = a.right().min(b.right());
    let iy_b = a.bottom().min(b.bottom());

    let iw = (ix_b - ix_a).max(0) as f32;
    let ih = (iy_b - iy_a).max(0) as f32;
    let inter = iw * ih;
    let union = a.area() as f32 + b.area() as f32 - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}
