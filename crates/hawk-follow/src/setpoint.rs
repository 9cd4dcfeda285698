use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hawk_fc::FlightLink;
use hawk_proto::command::VelocityCommand;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Latest velocity command, written by the follower and read by the sender.
///
/// Readers always observe a whole command; there is no partially written
/// state to see.
#[derive(Debug)]
pub struct SharedCommand {
    tx: watch::Sender<Option<VelocityCommand>>,
}

impl SharedCommand {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn publish(&self, cmd: VelocityCommand) {
        self.tx.send_replace(Some(cmd));
    }

    pub fn latest(&self) -> Option<VelocityCommand> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<VelocityCommand>> {
        self.tx.subscribe()
    }

    /// Keeps the last components but flags them idle.
    pub fn mark_idle(&self) {
        self.tx.send_modify(|c| {
            if let Some(cmd) = c.as_mut() {
                *cmd = cmd.into_idle();
            }
        });
    }
}

impl Default for SharedCommand {
    fn default() -> Self {
        Self::new()
    }
}

/// Send counters visible to status reporting.
#[derive(Debug, Default)]
pub struct SenderHealth {
    sent: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SenderHealth {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, err: &anyhow::Error) {
        let n = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        // first failure and then every 50th, the sender runs at 20Hz
        if n == 1 || n % 50 == 0 {
            warn!("setpoint: send failed ({} so far): {:#}", n, err);
        } else {
            debug!("setpoint: send failed: {:#}", err);
        }
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(format!("{:#}", err));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Stopped,
    /// Did not exit within the timeout and was aborted.
    Aborted,
    NotRunning,
}

/// Periodic task re-sending the latest command so the autopilot keeps offboard.
pub struct SetpointSender {
    link: Arc<dyn FlightLink>,
    commands: watch::Receiver<Option<VelocityCommand>>,
    period: Duration,
    health: Arc<SenderHealth>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SetpointSender {
    pub fn new(
        link: Arc<dyn FlightLink>,
        commands: &SharedCommand,
        period: Duration,
        health: Arc<SenderHealth>,
    ) -> Self {
        Self {
            link,
            commands: commands.subscribe(),
            period,
            health,
            token: CancellationToken::new(),
            handle: None,
        }
    }

    /// Spawns the send loop on the current runtime. A second call is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        info!("setpoint: sender started, period {:?}", self.period);
        let task = run(
            self.link.clone(),
            self.commands.clone(),
            self.period,
            self.health.clone(),
            self.token.clone(),
        );
        self.handle = Some(tokio::spawn(task));
    }

    /// Requests termination; the loop exits at its next wakeup.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Waits up to `timeout` for the loop to exit, aborting it otherwise.
    pub async fn join(&mut self, timeout: Duration) -> JoinOutcome {
        let Some(mut handle) = self.handle.take() else {
            return JoinOutcome::NotRunning;
        };
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => {
                info!("setpoint: sender stopped");
                JoinOutcome::Stopped
            }
            Err(_) => {
                warn!("setpoint: sender did not stop within {:?}, aborting", timeout);
                handle.abort();
                JoinOutcome::Aborted
            }
        }
    }
}

impl Drop for SetpointSender {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run(
    link: Arc<dyn FlightLink>,
    commands: watch::Receiver<Option<VelocityCommand>>,
    period: Duration,
    health: Arc<SenderHealth>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let cmd = commands.borrow().unwrap_or_default();
        tokio::select! {
            _ = token.cancelled() => break,
            res = link.send_body_velocity_commands(&cmd) => match res {
                Ok(()) => health.record_sent(),
                Err(e) => health.record_failure(&e),
            },
        }
    }
    debug!("setpoint: loop exited");
}
