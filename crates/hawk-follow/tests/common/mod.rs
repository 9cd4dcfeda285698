#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use hawk_fc::{FlightLink, Orientation};
use hawk_proto::command::VelocityCommand;
use hawk_proto::telemetry::TelemetryEvent;
use hawk_follow::telemetry::TelemetrySink;
use hawk_vision::camera::FrameSource;
use hawk_vision::segmentor::Segmentor;
use hawk_vision::{BoundingBox, Frame};
use image::Rgb;

/// Flight link double: records every call, fails the operations named in `fail`.
#[derive(Default)]
pub struct MockLink {
    pub calls: Mutex<Vec<&'static str>>,
    pub sent: Mutex<Vec<VelocityCommand>>,
    pub fail: Mutex<HashSet<&'static str>>,
    pub connect_delay: Duration,
    pub send_delay: Duration,
    /// Blocks the calling thread inside every send, like a stalled driver write.
    pub send_stall: Duration,
    pub altitude: Mutex<f64>,
}

impl MockLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, op: &'static str) {
        self.fail.lock().unwrap().insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        self.fail.lock().unwrap().remove(op);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
    }

    pub fn sent(&self) -> Vec<VelocityCommand> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(op);
        anyhow::ensure!(!self.fail.lock().unwrap().contains(op), "{} refused", op);
        Ok(())
    }
}

#[async_trait]
impl FlightLink for MockLink {
    async fn connect(&self) -> Result<()> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        self.record("connect")
    }

    async fn send_initial_setpoint(&self) -> Result<()> {
        self.record("initial_setpoint")
    }

    async fn start_offboard_mode(&self) -> Result<()> {
        self.record("start_offboard")
    }

    async fn stop_offboard_mode(&self) -> Result<()> {
        self.record("stop_offboard")
    }

    async fn send_body_velocity_commands(&self, cmd: &VelocityCommand) -> Result<()> {
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        if !self.send_stall.is_zero() {
            std::thread::sleep(self.send_stall);
        }
        self.record("send")?;
        self.sent.lock().unwrap().push(*cmd);
        Ok(())
    }

    fn current_altitude(&self) -> f64 {
        *self.altitude.lock().unwrap()
    }

    fn orientation(&self) -> Orientation {
        Orientation::default()
    }

    fn telemetry_value(&self, name: &str) -> Option<f64> {
        (name == "current_altitude").then(|| self.current_altitude())
    }

    async fn stop_polling(&self) -> Result<()> {
        self.record("stop_polling")
    }
}

/// Segmentor double returning the frame unchanged and fixed detections.
pub struct FixedSegmentor(pub Vec<BoundingBox>);

impl Segmentor for FixedSegmentor {
    fn segment_frame(&mut self, frame: &Frame) -> Result<Frame> {
        Ok(frame.clone())
    }

    fn last_detections(&self) -> Vec<BoundingBox> {
        self.0.clone()
    }
}

pub struct EmptyCapture(pub Arc<AtomicBool>);

impl FrameSource for EmptyCapture {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(None)
    }

    fn release(&mut self) -> Result<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink(pub Arc<Mutex<Vec<TelemetryEvent>>>);

impl TelemetrySink for RecordingSink {
    fn should_send(&mut self) -> bool {
        true
    }

    fn send(&mut self, event: &TelemetryEvent) -> Result<()> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// 120x90 textured frame with a bright 12x12 square at (sx, sy).
pub fn frame_with_square(sx: u32, sy: u32) -> Frame {
    Frame::from_fn(120, 90, |x, y| {
        if x >= sx && x < sx + 12 && y >= sy && y < sy + 12 {
            Rgb([240, 240, 240])
        } else {
            let v = ((x * 7 + y * 3) % 60) as u8;
            Rgb([v, v, v])
        }
    })
}
