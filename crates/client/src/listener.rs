use talkgroup_core::protocol::{ChannelStatus, ImageEvent};

use crate::error::SessionError;

/// Receives session notifications.
///
/// Callbacks run on the transport task, outside every session lock, so an
/// implementation may call back into the session. They should return quickly.
pub trait SessionListener: Send + Sync {
    fn connected(&self) {}

    fn disconnected(&self, _reason: &str) {}

    /// A protocol violation, a rejected request or a server-side error.
    fn error(&self, _message: &str, _cause: Option<&SessionError>) {}

    fn text_message(&self, _from: &str, _text: &str) {}

    fn stream_started(&self, _stream_id: u32, _from: &str) {}

    fn stream_stopped(&self, _stream_id: u32, _from: &str) {}

    /// Decoded PCM16 for one packet of an inbound stream.
    fn audio_data(&self, _stream_id: u32, _pcm: &[u8]) {}

    fn image_received(&self, _image: &ImageEvent) {}

    fn channel_status(&self, _status: &ChannelStatus) {}
}

/// Ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SessionListener for NoopListener {}
