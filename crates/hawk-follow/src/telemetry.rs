use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use hawk_proto::telemetry::TelemetryEvent;
use serde::Deserialize;
use tracing::info;

/// Destination for per-tick state snapshots.
pub trait TelemetrySink: Send {
    /// Checked once per tick before an event is built.
    fn should_send(&mut self) -> bool;

    fn send(&mut self, event: &TelemetryEvent) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable: bool,
    pub host: String,
    pub port: u16,
    pub rate_hz: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { enable: false, host: "127.0.0.1".into(), port: 5551, rate_hz: 5.0 }
    }
}

/// Lets one event through per `min_interval`.
#[derive(Debug)]
pub struct IntervalGate {
    last: Option<Instant>,
    min_interval: Duration,
}

impl IntervalGate {
    pub fn new(min_interval: Duration) -> Self {
        Self { last: None, min_interval }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        if let Some(t) = self.last {
            if now.saturating_duration_since(t) < self.min_interval {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

/// JSON datagrams to a fixed UDP endpoint.
pub struct UdpTelemetry {
    socket: UdpSocket,
    target: SocketAddr,
    gate: IntervalGate,
}

impl UdpTelemetry {
    pub fn bind(cfg: &TelemetryConfig) -> Result<Self> {
        let target = (cfg.host.as_str(), cfg.port)
            .to_socket_addrs()
            .with_context(|| format!("resolve telemetry host {}:{}", cfg.host, cfg.port))?
            .next()
            .with_context(|| format!("no address for {}:{}", cfg.host, cfg.port))?;
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).context("bind telemetry socket")?;
        socket.set_nonblocking(true).context("telemetry socket nonblocking")?;
        info!("telemetry: sending to {} at {:.1} Hz", target, cfg.rate_hz);
        Ok(Self { socket, target, gate: IntervalGate::new(Duration::from_secs_f64(1.0 / cfg.rate_hz.max(0.1))) })
    }
}

impl TelemetrySink for UdpTelemetry {
    fn should_send(&mut self) -> bool {
        self.gate.allow()
    }

    fn send(&mut self, event: &TelemetryEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("encode telemetry")?;
        self.socket.send_to(&payload, self.target).context("send telemetry")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hawk_proto::telemetry::{FollowerSnapshot, TrackerSnapshot};

    #[test]
    fn gate_limits_rate() {
        let mut gate = IntervalGate::new(Duration::from_millis(200));
        let t0 = Instant::now();
        assert!(gate.allow_at(t0));
        assert!(!gate.allow_at(t0 + Duration::from_millis(100)));
        assert!(gate.allow_at(t0 + Duration::from_millis(200)));
    }

    #[test]
    fn datagram_is_json_event() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = rx.local_addr().unwrap().port();

        let cfg = TelemetryConfig { enable: true, host: "127.0.0.1".into(), port, rate_hz: 10.0 };
        let mut sink = UdpTelemetry::bind(&cfg).unwrap();
        assert!(sink.should_send());
        assert!(!sink.should_send());

        let event = TelemetryEvent {
            ts_unix_ms: 1,
            tracker: TrackerSnapshot {
                tracking: true,
                bbox: Some((1, 2, 3, 4)),
                center: Some((2, 4)),
                normalized_center: Some((0.0, 0.0)),
                lost_frames: 0,
            },
            follower: FollowerSnapshot {
                session: "disconnected".into(),
                following: false,
                command: None,
                altitude_m: None,
                setpoints_sent: 0,
                setpoint_failures: 0,
            },
        };
        sink.send(&event).unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = rx.recv_from(&mut buf).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(v["tracker"]["bbox"], serde_json::json!([1, 2, 3, 4]));
        assert_eq!(v["follower"]["session"], "disconnected");
    }
}
