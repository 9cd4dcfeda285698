use anyhow::{Context, Result};
use async_trait::async_trait;
use mavlink::{
    common::{
        MavAutopilot, MavCmd, MavFrame, MavMessage, MavModeFlag, MavState, MavType, PositionTargetTypemask,
        COMMAND_LONG_DATA, HEARTBEAT_DATA, SET_POSITION_TARGET_LOCAL_NED_DATA, SYS_STATUS_DATA,
    },
    MavConnection, MavHeader,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hawk_proto::command::VelocityCommand;

use crate::state::{FcStatus, PX4_MAIN_MODE_OFFBOARD};
use crate::{FcConfig, FlightLink, Orientation};

type Conn = Arc<Box<dyn MavConnection<MavMessage> + Send + Sync>>;

// Reader lifecycle. STOPPED readers can be resumed until they observe the stop.
const READER_RUNNING: u8 = 0;
const READER_STOPPED: u8 = 1;
const READER_EXITED: u8 = 2;

/// PX4 AUTO main mode and its LOITER sub mode, used when leaving offboard.
const PX4_MAIN_MODE_AUTO: u32 = 4;
const PX4_SUB_MODE_AUTO_LOITER: u32 = 3;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Telemetry reader bound to one opened connection.
///
/// The link keeps it after `stop_polling` so a later `connect` reuses the
/// same socket instead of binding the address a second time.
struct Reader {
    conn: Conn,
    state: Arc<AtomicU8>,
    handle: JoinHandle<()>,
}

impl Reader {
    fn resume(&self) -> bool {
        match self.state.compare_exchange(READER_STOPPED, READER_RUNNING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(cur) => cur == READER_RUNNING,
        }
    }

    fn stop(&self) {
        let _ = self.state.compare_exchange(READER_RUNNING, READER_STOPPED, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// MAVLink flight link to a PX4 autopilot.
pub struct MavFlightLink {
    cfg: FcConfig,
    /// Set while connected; commands go out through it.
    conn: Mutex<Option<Conn>>,
    reader: Mutex<Option<Reader>>,
    sequence: Arc<AtomicU8>,
    status: Arc<Mutex<FcStatus>>,
    boot: Instant,
}

impl MavFlightLink {
    pub fn new(cfg: FcConfig) -> Self {
        Self {
            cfg,
            conn: Mutex::new(None),
            reader: Mutex::new(None),
            sequence: Arc::new(AtomicU8::new(0)),
            status: Arc::new(Mutex::new(FcStatus::default())),
            boot: Instant::now(),
        }
    }

    pub fn status(&self) -> FcStatus {
        lock(&self.status).clone()
    }

    /// True while a reader thread is still alive, including one that was
    /// asked to stop but is parked in a blocking receive.
    pub fn is_polling(&self) -> bool {
        lock(&self.reader).as_ref().map_or(false, |r| !r.handle.is_finished())
    }

    fn header(&self) -> MavHeader {
        MavHeader {
            system_id: self.cfg.sys_id,
            component_id: self.cfg.comp_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        }
    }

    async fn send(&self, msg: MavMessage) -> Result<()> {
        let conn = lock(&self.conn).clone().context("flight link not connected")?;
        let hdr = self.header();
        // a stalled serial write must not hold a runtime worker
        tokio::task::spawn_blocking(move || conn.send(&hdr, &msg))
            .await
            .context("join mavlink send")?
            .context("mavlink send")?;
        Ok(())
    }

    /// Returns the connection of a reader that is (or can be made) live again,
    /// spawning a fresh reader on the kept socket when the old one has exited.
    fn reuse_connection(&self) -> Option<Conn> {
        let mut guard = lock(&self.reader);
        let reader = guard.as_mut()?;
        if !reader.resume() {
            debug!("fc: previous reader exited, restarting it on the kept connection");
            let conn = reader.conn.clone();
            *reader = self.spawn_reader(conn);
        }
        Some(reader.conn.clone())
    }

    async fn open_connection(&self, url: &str) -> Result<Conn> {
        let target = url.to_string();
        let conn = tokio::task::spawn_blocking(move || mavlink::connect::<MavMessage>(&target))
            .await
            .context("join mavlink connect")?
            .with_context(|| format!("mavlink connect {}", url))?;
        let conn: Conn = Arc::new(conn);
        *lock(&self.reader) = Some(self.spawn_reader(conn.clone()));
        Ok(conn)
    }

    fn ensure_heartbeat(&self, what: &str) -> Result<()> {
        if self.cfg.require_heartbeat && lock(&self.status).last_heartbeat.is_none() {
            anyhow::bail!("refusing {}: no heartbeat seen yet", what);
        }
        Ok(())
    }

    fn velocity_setpoint(&self, vx: f32, vy: f32, vz: f32) -> MavMessage {
        let type_mask = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_X_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Y_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Z_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE
            | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE;

        MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms: self.boot.elapsed().as_millis() as u32,
            target_system: self.cfg.target_sys,
            target_component: self.cfg.target_comp,
            coordinate_frame: MavFrame::MAV_FRAME_BODY_NED,
            type_mask,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            vx,
            vy,
            vz,
            afx: 0.0,
            afy: 0.0,
            afz: 0.0,
            yaw: 0.0,
            yaw_rate: 0.0,
        })
    }

    fn set_mode(&self, main_mode: u32, sub_mode: u32) -> MavMessage {
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: self.cfg.target_sys,
            target_component: self.cfg.target_comp,
            command: MavCmd::MAV_CMD_DO_SET_MODE,
            confirmation: 0,
            param1: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32,
            param2: main_mode as f32,
            param3: sub_mode as f32,
            param4: 0.0,
            param5: 0.0,
            param6: 0.0,
            param7: 0.0,
        })
    }

    async fn wait_for(&self, timeout: Duration, what: &str, pred: impl Fn(&FcStatus) -> bool) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if pred(&*lock(&self.status)) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        anyhow::bail!("timed out after {}ms waiting for {}", timeout.as_millis(), what)
    }

    fn spawn_reader(&self, conn: Conn) -> Reader {
        let state = Arc::new(AtomicU8::new(READER_RUNNING));
        let run = state.clone();
        let reader_conn = conn.clone();
        let status = self.status.clone();
        let sequence = self.sequence.clone();
        let hb_hz = self.cfg.send_heartbeat_hz.unwrap_or(1.0).max(0.2);
        let (sys_id, comp_id) = (self.cfg.sys_id, self.cfg.comp_id);

        // mavlink recv blocks, so the reader lives on the blocking pool.
        let handle = tokio::task::spawn_blocking(move || {
            let conn = reader_conn;
            let hb_interval = Duration::from_secs_f32(1.0 / hb_hz);
            let mut last_hb_send = Instant::now().checked_sub(hb_interval).unwrap_or_else(Instant::now);

            loop {
                if run
                    .compare_exchange(READER_STOPPED, READER_EXITED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
                if last_hb_send.elapsed() >= hb_interval {
                    let hdr = MavHeader { system_id: sys_id, component_id: comp_id, sequence: sequence.fetch_add(1, Ordering::Relaxed) };
                    if let Err(e) = conn.send(&hdr, &companion_heartbeat()) {
                        debug!("fc: companion heartbeat send failed: {:?}", e);
                    }
                    last_hb_send = Instant::now();
                }

                match conn.recv() {
                    Ok((_hdr, msg)) => apply_message(&mut lock(&status), &msg),
                    Err(e) => {
                        debug!("fc: recv error: {:?}", e);
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
            info!("fc: telemetry reader stopped");
        });
        Reader { conn, state, handle }
    }
}

impl Drop for MavFlightLink {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).as_ref() {
            reader.stop();
        }
    }
}

fn companion_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

fn apply_message(st: &mut FcStatus, msg: &MavMessage) {
    match msg {
        MavMessage::HEARTBEAT(hb) if hb.autopilot != MavAutopilot::MAV_AUTOPILOT_INVALID => {
            st.connected = true;
            st.last_heartbeat = Some(Instant::now());
            st.custom_mode = Some(hb.custom_mode);
        }
        MavMessage::ATTITUDE(a) => {
            st.orientation = Orientation { yaw: a.yaw as f64, pitch: a.pitch as f64, roll: a.roll as f64 };
        }
        MavMessage::GLOBAL_POSITION_INT(p) => {
            st.relative_alt_m = Some(p.relative_alt as f64 / 1000.0);
        }
        MavMessage::VFR_HUD(v) => {
            st.ground_speed = Some(v.groundspeed as f64);
            st.climb_rate = Some(v.climb as f64);
        }
        MavMessage::SYS_STATUS(s) => update_battery(st, s),
        _ => {}
    }
}

fn update_battery(st: &mut FcStatus, status: &SYS_STATUS_DATA) {
    // millivolts, u16::MAX means unknown
    if status.voltage_battery != u16::MAX {
        st.battery_voltage = Some(status.voltage_battery as f32 / 1000.0);
    }
    // percent, -1 means unknown
    if (0..=100).contains(&status.battery_remaining) {
        st.battery_remaining = Some(status.battery_remaining as u8);
    }
}

#[async_trait]
impl FlightLink for MavFlightLink {
    async fn connect(&self) -> Result<()> {
        let url = self.cfg.connection_url()?;
        let conn = match self.reuse_connection() {
            Some(conn) => {
                debug!("fc: reusing open connection to {}", url);
                conn
            }
            None => self.open_connection(&url).await?,
        };
        *lock(&self.conn) = Some(conn);

        if self.cfg.require_heartbeat {
            let timeout = Duration::from_millis(self.cfg.heartbeat_timeout_ms.unwrap_or(3000));
            if let Err(e) = self.wait_for(timeout, "FC heartbeat", |st| st.last_heartbeat.is_some()).await {
                // the reader keeps listening; a retry picks it up again
                *lock(&self.conn) = None;
                return Err(e);
            }
        }
        info!("fc: connected via {}", url);
        Ok(())
    }

    async fn send_initial_setpoint(&self) -> Result<()> {
        // PX4 only accepts offboard once a setpoint stream is already flowing.
        let n = self.cfg.initial_setpoint_count.unwrap_or(10).max(1);
        for _ in 0..n {
            self.send(self.velocity_setpoint(0.0, 0.0, 0.0)).await?;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        debug!("fc: streamed {} initial setpoints", n);
        Ok(())
    }

    async fn start_offboard_mode(&self) -> Result<()> {
        self.ensure_heartbeat("offboard")?;
        info!("FC: requesting OFFBOARD");
        self.send(self.set_mode(PX4_MAIN_MODE_OFFBOARD, 0)).await?;
        if self.cfg.require_heartbeat {
            let timeout = Duration::from_millis(self.cfg.mode_confirm_timeout_ms.unwrap_or(1500));
            self.wait_for(timeout, "OFFBOARD mode", FcStatus::in_offboard).await?;
        }
        Ok(())
    }

    async fn stop_offboard_mode(&self) -> Result<()> {
        info!("FC: leaving OFFBOARD (hold)");
        self.send(self.set_mode(PX4_MAIN_MODE_AUTO, PX4_SUB_MODE_AUTO_LOITER)).await?;
        if self.cfg.require_heartbeat {
            let timeout = Duration::from_millis(self.cfg.mode_confirm_timeout_ms.unwrap_or(1500));
            self.wait_for(timeout, "leaving OFFBOARD", |st| !st.in_offboard()).await?;
        }
        Ok(())
    }

    async fn send_body_velocity_commands(&self, cmd: &VelocityCommand) -> Result<()> {
        self.send(self.velocity_setpoint(cmd.vel_x as f32, cmd.vel_y as f32, cmd.vel_z as f32))
            .await
    }

    fn current_altitude(&self) -> f64 {
        lock(&self.status).relative_alt_m.unwrap_or(0.0)
    }

    fn orientation(&self) -> Orientation {
        lock(&self.status).orientation
    }

    fn telemetry_value(&self, name: &str) -> Option<f64> {
        lock(&self.status).field(name)
    }

    async fn stop_polling(&self) -> Result<()> {
        *lock(&self.conn) = None;
        match lock(&self.reader).as_ref() {
            Some(reader) => {
                // the blocking reader exits after its current recv returns
                reader.stop();
                info!("fc: telemetry polling stop requested");
            }
            None => warn!("fc: telemetry polling was not running"),
        }
        Ok(())
    }
}
