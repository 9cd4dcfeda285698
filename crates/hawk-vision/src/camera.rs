use anyhow::{Context, Result};
use image::imageops::FilterType;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::Frame;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CameraConfig {
    /// Directory of still frames (jpeg/png), played in file-name order.
    pub frames_dir: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Where frames come from. `release` frees the device or file handles; after
/// it `next_frame` returns `Ok(None)`.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn release(&mut self) -> Result<()>;
}

pub struct ImageSequence {
    pending: VecDeque<PathBuf>,
    width: u32,
    height: u32,
    released: bool,
}

impl ImageSequence {
    pub fn open(cfg: &CameraConfig) -> Result<Self> {
        let dir = Path::new(&cfg.frames_dir);
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("read frames dir {}", cfg.frames_dir))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
                    Some("jpg" | "jpeg" | "png")
                )
            })
            .collect();
        paths.sort();
        anyhow::ensure!(!paths.is_empty(), "no jpeg/png frames in {}", cfg.frames_dir);
        info!("camera: {} frames from {}", paths.len(), cfg.frames_dir);

        Ok(Self { pending: paths.into(), width: cfg.width, height: cfg.height, released: false })
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Ok(None);
        }
        let Some(path) = self.pending.pop_front() else { return Ok(None) };
        debug!("camera: decode {}", path.display());
        let img = image::open(&path).with_context(|| format!("decode frame {}", path.display()))?.to_rgb8();

        if img.dimensions() == (self.width, self.height) {
            Ok(Some(img))
        } else {
            Ok(Some(image::imageops::resize(&img, self.width, self.height, FilterType::Triangle)))
        }
    }

    fn release(&mut self) -> Result<()> {
        self.pending.clear();
        self.released = true;
        info!("camera: released");
        Ok(())
    }
}
