use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of the flight-control session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FollowSession {
    Disconnected = 0,
    Connecting = 1,
    Offboard = 2,
    Disconnecting = 3,
}

impl FollowSession {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Offboard,
            3 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }

    pub fn is_following(self) -> bool {
        self == Self::Offboard
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use FollowSession::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Offboard)
                | (Connecting, Disconnected)
                | (Offboard, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

impl fmt::Display for FollowSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Offboard => "active",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Single source of truth for the session; transitions are compare-and-set so
/// concurrent connect/disconnect calls cannot both win.
#[derive(Debug)]
pub struct SessionCell(AtomicU8);

impl SessionCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(FollowSession::Disconnected as u8))
    }

    pub fn get(&self) -> FollowSession {
        FollowSession::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves `from -> to`, or returns the state actually found.
    pub fn transition(&self, from: FollowSession, to: FollowSession) -> Result<(), FollowSession> {
        debug_assert!(from.can_transition_to(to), "illegal session edge {:?} -> {:?}", from, to);
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(FollowSession::from_u8)
    }
}

impl Default for SessionCell {
    fn default() -> Self {
        Self::new()
    }
}
