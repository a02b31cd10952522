use talkgroup_core::{CodecError, ProtocolError, WireError};
use tokio_tungstenite::tungstenite;

use crate::config::ConfigError;
use crate::image::ImageError;
use crate::state::ConnectionState;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no tokio runtime is available to drive the connection")]
    NoRuntime,
    #[error("invalid request header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Everything a session operation can report.
///
/// `NotConnected` and `NoActiveStream` are state violations: nothing was sent
/// and the session is unaffected.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
    #[error("no outgoing voice stream is active")]
    NoActiveStream,
    #[error("cannot move to {requested} while {current}")]
    InvalidState {
        current: ConnectionState,
        requested: ConnectionState,
    },
    #[error("the transport has stopped accepting frames")]
    TransportClosed,
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
