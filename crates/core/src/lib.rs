//! Transport-agnostic building blocks for the talkgroup client: PCM framing,
//! the binary and JSON wire formats, codec session management and the VOX
//! gate. Nothing in this crate performs I/O.

pub mod audio;
pub mod codec;
pub mod protocol;
pub mod vox;
pub mod wire;

pub use audio::{AudioFrame, FrameSizeError};
pub use codec::{CodecError, CodecFactory, CodecSessions, RawPcmCodec};
pub use protocol::{Command, Inbound, ProtocolError, Reply, ServerEvent};
pub use vox::{VoxConfig, VoxDecision, VoxGate, VoxState};
pub use wire::{BinaryFrame, FrameType, ImageKind, WireError};
