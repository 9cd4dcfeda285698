use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use hawk_fc::FlightLink;
use hawk_proto::command::VelocityCommand;
use hawk_proto::report::StepReport;
use hawk_proto::telemetry::{FollowerSnapshot, TelemetryEvent, TrackerSnapshot};
use hawk_vision::camera::FrameSource;
use hawk_vision::detector::Detector;
use hawk_vision::overlay;
use hawk_vision::segmentor::{detection_at, Segmentor};
use hawk_vision::tracker::Tracker;
use hawk_vision::{BoundingBox, Frame};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::config::{ControllerConfig, FollowConfig, TargetPositionMode};
use crate::error::FollowError;
use crate::follower::Follower;
use crate::session::{FollowSession, SessionCell};
use crate::setpoint::{JoinOutcome, SenderHealth, SetpointSender, SharedCommand};
use crate::telemetry::TelemetrySink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Idle,
    Tracking,
}

/// What happened to the target on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    Idle,
    Tracked(BoundingBox),
    /// Tracker lost the target and the detector found it again.
    Redetected(BoundingBox),
    Lost,
}

#[derive(Debug)]
pub struct TickOutput {
    pub frame: Frame,
    pub status: TickStatus,
    /// Command sent this tick, when following.
    pub command: Option<VelocityCommand>,
    pub errors: Vec<String>,
}

/// Operator command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ToggleSegmentation,
    ToggleTracking(Option<BoundingBox>),
    Redetect,
    Connect,
    Disconnect,
    CancelActivities,
}

/// Vision collaborators and I/O handed to the controller at construction.
pub struct Parts {
    pub tracker: Box<dyn Tracker>,
    pub detector: Option<Box<dyn Detector>>,
    pub segmentor: Option<Box<dyn Segmentor>>,
    pub telemetry: Option<Box<dyn TelemetrySink>>,
    pub capture: Option<Box<dyn FrameSource>>,
}

impl Parts {
    pub fn new(tracker: Box<dyn Tracker>) -> Self {
        Self { tracker, detector: None, segmentor: None, telemetry: None, capture: None }
    }
}

struct Vision {
    tracking: TrackState,
    segmentation: bool,
    tracker: Box<dyn Tracker>,
    detector: Option<Box<dyn Detector>>,
    segmentor: Option<Box<dyn Segmentor>>,
    current_frame: Option<Frame>,
    lost_frames: u32,
}

enum Redetection {
    Disabled,
    Found(BoundingBox),
    NotFound,
    Failed(String),
}

impl Vision {
    fn begin_tracking(&mut self, frame: &Frame, roi: Option<BoundingBox>) -> Result<BoundingBox, FollowError> {
        let bbox = roi.filter(BoundingBox::is_valid).ok_or(FollowError::Validation(roi))?;
        self.tracker.start_tracking(frame, bbox).map_err(FollowError::Tracker)?;
        if let Some(detector) = self.detector.as_mut() {
            if let Err(e) = detector.extract_features(frame, bbox) {
                warn!("controller: feature extraction failed: {:#}", e);
            }
        }
        self.tracking = TrackState::Tracking;
        self.lost_frames = 0;
        Ok(bbox)
    }

    fn redetect(&mut self, frame: &Frame) -> Redetection {
        let Some(detector) = self.detector.as_mut() else {
            return Redetection::Disabled;
        };
        let found = detector.smart_redetection(frame, self.tracker.as_ref());
        let latest = detector.latest_bbox();
        match (found, latest) {
            (true, Some(bbox)) => match self.tracker.reinitialize(frame, bbox) {
                Ok(()) => {
                    self.lost_frames = 0;
                    Redetection::Found(bbox)
                }
                Err(e) => Redetection::Failed(format!("tracker reinitialization failed: {:#}", e)),
            },
            _ => Redetection::NotFound,
        }
    }

    fn snapshot(&self) -> TrackerSnapshot {
        let tracking = self.tracking == TrackState::Tracking;
        TrackerSnapshot {
            tracking,
            bbox: self.tracker.bbox().filter(|_| tracking).map(|b| b.as_tuple()),
            center: self.tracker.center().filter(|_| tracking),
            normalized_center: self.tracker.normalized_center().filter(|_| tracking),
            lost_frames: self.lost_frames,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sequences tracking, detection fallback and the flight-control session.
///
/// All methods take `&self`; the controller is meant to be shared behind an
/// `Arc` between the frame loop and the command surface. Tracking state and
/// session state are independent: cancelling tracking does not end the
/// session and vice versa.
pub struct ControllerStateMachine {
    cfg: ControllerConfig,
    follow_cfg: FollowConfig,
    link: Arc<dyn FlightLink>,
    session: SessionCell,
    vision: Mutex<Vision>,
    follower: tokio::sync::Mutex<Option<Follower>>,
    sender: Mutex<Option<SetpointSender>>,
    command: Arc<SharedCommand>,
    sender_health: Arc<SenderHealth>,
    telemetry: Mutex<Option<Box<dyn TelemetrySink>>>,
    capture: Mutex<Option<Box<dyn FrameSource>>>,
}

impl ControllerStateMachine {
    pub fn new(cfg: ControllerConfig, follow_cfg: FollowConfig, link: Arc<dyn FlightLink>, parts: Parts) -> Self {
        info!(
            "controller: tracker={} detector={} segmentor={}",
            parts.tracker.name(),
            parts.detector.is_some(),
            parts.segmentor.is_some()
        );
        Self {
            cfg,
            follow_cfg,
            link,
            session: SessionCell::new(),
            vision: Mutex::new(Vision {
                tracking: TrackState::Idle,
                segmentation: false,
                tracker: parts.tracker,
                detector: parts.detector,
                segmentor: parts.segmentor,
                current_frame: None,
                lost_frames: 0,
            }),
            follower: tokio::sync::Mutex::new(None),
            sender: Mutex::new(None),
            command: Arc::new(SharedCommand::new()),
            sender_health: Arc::new(SenderHealth::default()),
            telemetry: Mutex::new(parts.telemetry),
            capture: Mutex::new(parts.capture),
        }
    }

    pub fn session(&self) -> FollowSession {
        self.session.get()
    }

    pub fn is_following(&self) -> bool {
        self.session.get().is_following()
    }

    pub fn tracking_state(&self) -> TrackState {
        lock(&self.vision).tracking
    }

    pub fn segmentation_active(&self) -> bool {
        lock(&self.vision).segmentation
    }

    pub fn tracker_snapshot(&self) -> TrackerSnapshot {
        lock(&self.vision).snapshot()
    }

    pub fn latest_command(&self) -> Option<VelocityCommand> {
        self.command.latest()
    }

    pub fn sender_health(&self) -> &SenderHealth {
        &self.sender_health
    }

    pub fn sender_running(&self) -> bool {
        lock(&self.sender).as_ref().map_or(false, SetpointSender::is_running)
    }

    /// Pulls the next frame from the capture source, if one was provided.
    pub fn next_frame(&self) -> Result<Option<Frame>> {
        match lock(&self.capture).as_mut() {
            Some(source) => source.next_frame(),
            None => Ok(None),
        }
    }

    pub async fn handle(&self, cmd: Command) -> StepReport {
        debug!("controller: command {:?}", cmd);
        match cmd {
            Command::ToggleSegmentation => self.toggle_segmentation(),
            Command::ToggleTracking(roi) => {
                let frame = lock(&self.vision).current_frame.clone();
                match frame {
                    Some(frame) => self.toggle_tracking(&frame, roi).await,
                    None => {
                        let mut report = StepReport::new();
                        report.error(FollowError::NoFrame.to_string());
                        report
                    }
                }
            }
            Command::Redetect => self.redetect(),
            Command::Connect => self.connect().await,
            Command::Disconnect => self.disconnect().await,
            Command::CancelActivities => self.cancel_activities().await,
        }
    }

    pub fn toggle_segmentation(&self) -> StepReport {
        let mut report = StepReport::new();
        let on = {
            let mut v = lock(&self.vision);
            v.segmentation = !v.segmentation;
            v.segmentation
        };
        info!("controller: segmentation {}", if on { "on" } else { "off" });
        report.step(if on { "Segmentation activated." } else { "Segmentation deactivated." });
        report
    }

    /// Starts tracking `roi` on `frame`, or cancels everything when already tracking.
    pub async fn toggle_tracking(&self, frame: &Frame, roi: Option<BoundingBox>) -> StepReport {
        let started = {
            let mut guard = lock(&self.vision);
            let v = &mut *guard;
            if v.tracking == TrackState::Tracking {
                None
            } else {
                if v.current_frame.is_none() {
                    v.current_frame = Some(frame.clone());
                }
                Some(v.begin_tracking(frame, roi))
            }
        };

        match started {
            None => {
                let mut report = self.cancel_activities().await;
                report.step("Tracking deactivated.");
                report
            }
            Some(result) => Self::tracking_report(result),
        }
    }

    /// Starts tracking on the last frame seen by [`Self::tick`].
    pub fn start_tracking(&self, bbox: BoundingBox) -> StepReport {
        let result = {
            let mut guard = lock(&self.vision);
            let v = &mut *guard;
            if v.tracking == TrackState::Tracking {
                let mut report = StepReport::new();
                report.step("Tracking is already active.");
                return report;
            }
            match v.current_frame.take() {
                Some(frame) => {
                    let r = v.begin_tracking(&frame, Some(bbox));
                    v.current_frame = Some(frame);
                    r
                }
                None => Err(FollowError::NoFrame),
            }
        };
        Self::tracking_report(result)
    }

    pub async fn stop_tracking(&self) -> StepReport {
        if self.tracking_state() == TrackState::Idle {
            let mut report = StepReport::new();
            report.step("Tracking is not active.");
            return report;
        }
        let mut report = self.cancel_activities().await;
        report.step("Tracking deactivated.");
        report
    }

    fn tracking_report(result: Result<BoundingBox, FollowError>) -> StepReport {
        let mut report = StepReport::new();
        match result {
            Ok(bbox) => {
                info!("controller: tracking started on {:?}", bbox);
                report.step(format!("Tracking activated on {:?}.", bbox.as_tuple()));
            }
            Err(e) => {
                warn!("controller: tracking not started: {}", e);
                report.error(e.to_string());
            }
        }
        report
    }

    /// Runs the detector on the last frame and reinitializes the tracker on a hit.
    pub fn redetect(&self) -> StepReport {
        let mut report = StepReport::new();
        let mut guard = lock(&self.vision);
        let v = &mut *guard;
        let Some(frame) = v.current_frame.take() else {
            report.error(FollowError::NoFrame.to_string());
            return report;
        };
        let outcome = v.redetect(&frame);
        v.current_frame = Some(frame);
        match outcome {
            Redetection::Disabled => report.error("Detector is not enabled."),
            Redetection::Found(bbox) => report.step(format!("Redetection successful: {:?}.", bbox.as_tuple())),
            Redetection::NotFound => report.error("Redetection failed: target not found."),
            Redetection::Failed(e) => report.error(e),
        }
        report
    }

    /// Picks the segmentation detection under `(x, y)` and tracks it.
    pub fn select_at(&self, x: i32, y: i32) -> StepReport {
        let mut report = StepReport::new();
        let mut guard = lock(&self.vision);
        let v = &mut *guard;
        if !v.segmentation {
            report.error("Segmentation is not active.");
            return report;
        }
        let detections = v.segmentor.as_ref().map(|s| s.last_detections()).unwrap_or_default();
        let Some(bbox) = detection_at(&detections, x, y) else {
            report.error(format!("No detection at ({}, {}).", x, y));
            return report;
        };
        let Some(frame) = v.current_frame.take() else {
            report.error(FollowError::NoFrame.to_string());
            return report;
        };
        let result = v.begin_tracking(&frame, Some(bbox));
        v.current_frame = Some(frame);
        drop(guard);
        report.merge(Self::tracking_report(result));
        report
    }

    /// Opens a follow session. Concurrent callers race on the session cell;
    /// the loser reports the state it found.
    pub async fn connect(&self) -> StepReport {
        let mut report = StepReport::new();
        if let Err(current) = self.session.transition(FollowSession::Disconnected, FollowSession::Connecting) {
            report.step(format!("Follow mode already {}.", current));
            return report;
        }
        info!("controller: connecting");

        match self.open_session(&mut report).await {
            Ok(follower) => {
                *self.follower.lock().await = Some(follower);
                self.start_sender();
                report.step("Setpoint sender started.");
                if let Err(found) = self.session.transition(FollowSession::Connecting, FollowSession::Offboard) {
                    error!("controller: session moved to {} while connecting", found);
                }
                info!("controller: following");
                report.step("Follow mode activated.");
            }
            Err(e) => {
                error!("controller: connect failed: {}", e);
                report.error(e.to_string());
                if let Err(found) = self.session.transition(FollowSession::Connecting, FollowSession::Disconnected) {
                    error!("controller: session moved to {} while connecting", found);
                }
            }
        }
        report
    }

    async fn open_session(&self, report: &mut StepReport) -> Result<Follower, FollowError> {
        self.link.connect().await.map_err(|e| FollowError::link("connect", e))?;
        report.step("Connected to flight controller.");

        let target = self.initial_target();
        let follower = Follower::new(self.link.clone(), target, self.follow_cfg.clone(), self.command.clone());
        report.step(format!("Follower created with target ({:.3}, {:.3}).", target.0, target.1));

        self.link.send_initial_setpoint().await.map_err(|e| FollowError::link("initial setpoint", e))?;
        report.step("Initial setpoint sent.");

        self.link.start_offboard_mode().await.map_err(|e| FollowError::link("start offboard", e))?;
        report.step("Offboard mode started.");
        Ok(follower)
    }

    fn initial_target(&self) -> (f64, f64) {
        match self.follow_cfg.target_position_mode {
            TargetPositionMode::Fixed => self.follow_cfg.desired_aim,
            TargetPositionMode::Initial => {
                let v = lock(&self.vision);
                let center = v.tracker.normalized_center().filter(|_| v.tracking == TrackState::Tracking);
                center.unwrap_or_else(|| {
                    warn!("controller: no tracked target for initial lock, using aim point");
                    self.follow_cfg.desired_aim
                })
            }
        }
    }

    fn start_sender(&self) {
        let mut sender = SetpointSender::new(
            self.link.clone(),
            &self.command,
            self.cfg.setpoint_period(),
            self.sender_health.clone(),
        );
        sender.start();
        if let Some(old) = lock(&self.sender).replace(sender) {
            warn!("controller: replacing a setpoint sender that was still registered");
            old.stop();
        }
    }

    async fn stop_sender(&self) -> StepReport {
        let mut report = StepReport::new();
        let sender = lock(&self.sender).take();
        let Some(mut sender) = sender else {
            return report;
        };
        sender.stop();
        match sender.join(self.cfg.sender_join_timeout()).await {
            JoinOutcome::Stopped => report.step("Setpoint sender stopped."),
            JoinOutcome::Aborted => report.error(format!(
                "Setpoint sender did not stop within {} ms and was aborted.",
                self.cfg.sender_join_timeout_ms
            )),
            JoinOutcome::NotRunning => {}
        }
        report
    }

    /// Ends the follow session. Never fails; problems land in the report.
    pub async fn disconnect(&self) -> StepReport {
        let mut report = StepReport::new();
        if let Err(current) = self.session.transition(FollowSession::Offboard, FollowSession::Disconnecting) {
            report.step(format!("Follow mode is not active ({}).", current));
            return report;
        }
        info!("controller: disconnecting");

        match self.link.stop_offboard_mode().await {
            Ok(()) => report.step("Offboard mode stopped."),
            Err(e) => report.error(FollowError::link("stop offboard", e).to_string()),
        }
        report.merge(self.stop_sender().await);
        self.follower.lock().await.take();
        self.command.mark_idle();

        if let Err(found) = self.session.transition(FollowSession::Disconnecting, FollowSession::Disconnected) {
            error!("controller: session moved to {} while disconnecting", found);
        }
        report.step("Follow mode deactivated.");
        report
    }

    /// Stops tracking and segmentation and any running setpoint sender.
    /// The flight session itself is left as it is.
    pub async fn cancel_activities(&self) -> StepReport {
        {
            let mut v = lock(&self.vision);
            v.tracking = TrackState::Idle;
            v.segmentation = false;
            v.lost_frames = 0;
        }
        let mut report = self.stop_sender().await;
        info!("controller: activities cancelled");
        report.step("All activities cancelled.");
        report
    }

    /// Processes one frame. Collaborator failures are reported in the output
    /// and never prevent the next tick.
    pub async fn tick(&self, frame: Frame) -> TickOutput {
        let mut errors = Vec::new();
        let (frame, status, target) = {
            let mut guard = lock(&self.vision);
            let v = &mut *guard;
            let mut frame = frame;

            if v.segmentation {
                if let Some(segmentor) = v.segmentor.as_mut() {
                    match segmentor.segment_frame(&frame) {
                        Ok(rendered) => frame = rendered,
                        Err(e) => errors.push(format!("segmentation: {:#}", e)),
                    }
                }
            }

            let mut status = TickStatus::Idle;
            let mut target = None;
            if v.tracking == TrackState::Tracking {
                let update = v.tracker.update(&frame);
                match update.bbox.filter(|_| update.success) {
                    Some(bbox) => {
                        v.lost_frames = 0;
                        status = TickStatus::Tracked(bbox);
                        target = v.tracker.normalized_center();
                    }
                    None => {
                        v.lost_frames += 1;
                        status = TickStatus::Lost;
                        debug!("controller: target lost ({} frames)", v.lost_frames);
                        if self.cfg.auto_redetect {
                            match v.redetect(&frame) {
                                Redetection::Found(bbox) => status = TickStatus::Redetected(bbox),
                                Redetection::Failed(e) => errors.push(e),
                                Redetection::Disabled | Redetection::NotFound => {}
                            }
                        }
                    }
                }
            }

            v.current_frame = Some(frame.clone());
            if self.cfg.annotate_frames && matches!(status, TickStatus::Tracked(_) | TickStatus::Redetected(_)) {
                overlay::annotate(&mut frame, v.tracker.state());
            }
            (frame, status, target)
        };

        let mut command = None;
        if let Some(target) = target {
            if self.session.get() == FollowSession::Offboard {
                let mut follower = self.follower.lock().await;
                if let Some(f) = follower.as_mut() {
                    match f.follow_target(target).await {
                        Ok(cmd) => command = Some(cmd),
                        Err(e) => {
                            warn!("controller: follow step failed: {:#}", e);
                            errors.push(format!("follow: {:#}", e));
                        }
                    }
                }
            }
        }

        self.emit_telemetry();
        TickOutput { frame, status, command, errors }
    }

    fn emit_telemetry(&self) {
        let mut sink = lock(&self.telemetry);
        let Some(sink) = sink.as_mut() else { return };
        if !sink.should_send() {
            return;
        }
        let event = self.telemetry_event();
        if let Err(e) = sink.send(&event) {
            debug!("controller: telemetry send failed: {:#}", e);
        }
    }

    pub fn telemetry_event(&self) -> TelemetryEvent {
        let session = self.session.get();
        let following = session.is_following();
        TelemetryEvent {
            ts_unix_ms: (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
            tracker: self.tracker_snapshot(),
            follower: FollowerSnapshot {
                session: session.to_string(),
                following,
                command: self.command.latest(),
                altitude_m: following.then(|| self.link.current_altitude()),
                setpoints_sent: self.sender_health.sent(),
                setpoint_failures: self.sender_health.failures(),
            },
        }
    }

    /// Best-effort teardown; every step runs regardless of earlier failures.
    pub async fn shutdown(&self) -> StepReport {
        let mut report = StepReport::new();
        info!("controller: shutting down");

        match self.link.stop_polling().await {
            Ok(()) => report.step("Telemetry polling stopped."),
            Err(e) => report.error(FollowError::link("stop polling", e).to_string()),
        }

        if self.session.get() == FollowSession::Offboard {
            report.merge(self.disconnect().await);
        }
        report.merge(self.stop_sender().await);

        let capture = lock(&self.capture).take();
        if let Some(mut source) = capture {
            match source.release() {
                Ok(()) => report.step("Capture released."),
                Err(e) => report.error(format!("capture release failed: {:#}", e)),
            }
        }

        report.step("Shutdown complete.");
        report
    }
}
