use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::SessionError;

/// Lifecycle of one session.
///
/// Transitions follow the cycle
/// `Disconnected -> Connecting -> LoggingIn -> Connected -> Disconnecting -> Disconnected`.
/// A forced return to `Disconnected` is allowed from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    LoggingIn = 2,
    Connected = 3,
    Disconnecting = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::LoggingIn,
            3 => ConnectionState::Connected,
            4 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Whether `next` is the successor of `self` in the normal cycle.
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, LoggingIn)
                | (LoggingIn, Connected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::LoggingIn => "logging in",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Connection state readable from any thread. All accesses are `SeqCst`.
#[derive(Debug)]
pub(crate) struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected as u8))
    }

    pub(crate) fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves `from -> to` if `to` follows `from` in the cycle and the current
    /// state is still `from`.
    pub(crate) fn advance(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), SessionError> {
        if !from.can_advance_to(to) {
            return Err(SessionError::InvalidState {
                current: self.load(),
                requested: to,
            });
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| SessionError::InvalidState {
                current: ConnectionState::from_u8(actual),
                requested: to,
            })
    }

    /// Unconditionally returns to `Disconnected`, yielding the prior state.
    pub(crate) fn force_disconnected(&self) -> ConnectionState {
        ConnectionState::from_u8(
            self.0
                .swap(ConnectionState::Disconnected as u8, Ordering::SeqCst),
        )
    }
}
