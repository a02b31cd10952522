//! Push-to-talk channel client: session engine, WebSocket transport and the
//! voice-activated radio bridge.

pub mod bridge;
pub mod capture;
pub mod config;
pub mod error;
pub mod image;
pub mod listener;
mod registry;
pub mod session;
pub mod state;
pub mod transport;

pub use bridge::{BridgeError, RadioBridge, VoiceSink};
pub use capture::{CaptureError, CaptureSource, ReaderSource};
pub use config::{ChannelConfig, Config, ConfigError};
pub use error::{SessionError, TransportError};
pub use image::{ImageError, ImagePreparer, PreparedImage};
pub use listener::{NoopListener, SessionListener};
pub use session::{ResponseCallback, Session, SessionBuilder};
pub use state::ConnectionState;
pub use transport::{ConnectRequest, Connector, OutboundFrame, TransportEvents, WebSocketConnector};
