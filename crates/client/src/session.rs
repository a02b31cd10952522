//! The connection/session engine.
//!
//! A [`Session`] owns one logical connection to one channel. Public operations
//! are synchronous and never wait on the network: outbound frames are queued
//! for the transport's writer. Inbound frames arrive through
//! [`TransportEvents`](crate::transport::TransportEvents) and are turned into
//! [`SessionListener`] callbacks.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use talkgroup_core::audio::AudioFrame;
use talkgroup_core::codec::{CodecFactory, CodecSessions};
use talkgroup_core::protocol::{self, Command, Inbound, Reply, ServerEvent};
use talkgroup_core::wire::{self, BinaryFrame, FrameType, ImageKind};
use talkgroup_core::CodecError;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::ChannelConfig;
use crate::error::SessionError;
use crate::image::{ImageError, ImagePreparer, PreparedImage};
use crate::listener::{NoopListener, SessionListener};
use crate::registry::{Registry, lock};
use crate::state::{AtomicConnectionState, ConnectionState};
use crate::transport::{ConnectRequest, Connector, OutboundFrame, TransportEvents, WebSocketConnector};

/// Invoked once with the server's reply to a command.
pub type ResponseCallback = Box<dyn FnOnce(Reply) + Send>;

const NO_SEQ: u32 = 0;

#[derive(Debug, Default)]
struct OutgoingStream {
    stream_id: Option<u32>,
    next_packet_id: u32,
    /// Seq of the `start_stream` still awaiting its reply.
    start_seq: Option<u32>,
    /// Stop was requested before the stream id arrived.
    stop_on_start: bool,
}

struct PendingImage {
    thumbnail: Bytes,
    full: Bytes,
}

pub struct SessionBuilder {
    config: ChannelConfig,
    codec: Arc<dyn CodecFactory>,
    connector: Arc<dyn Connector>,
    listener: Arc<dyn SessionListener>,
    image_preparer: Option<Arc<dyn ImagePreparer>>,
    image_chunk_size: Option<usize>,
}

impl SessionBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn image_preparer(mut self, preparer: Arc<dyn ImagePreparer>) -> Self {
        self.image_preparer = Some(preparer);
        self
    }

    /// Splits image uploads into frames of at most `size` payload bytes.
    pub fn image_chunk_size(mut self, size: usize) -> Self {
        self.image_chunk_size = Some(size);
        self
    }

    pub fn build(self) -> Result<Session, SessionError> {
        self.config.validate()?;
        let codec = CodecSessions::new(self.codec)?;
        Ok(Session {
            inner: Arc::new(SessionInner {
                config: self.config,
                connector: self.connector,
                listener: self.listener,
                image_preparer: self.image_preparer,
                image_chunk_size: self.image_chunk_size,
                state: AtomicConnectionState::new(),
                seq: AtomicU32::new(1),
                epoch: AtomicU64::new(0),
                logon_seq: AtomicU32::new(NO_SEQ),
                outbound: Mutex::new(None),
                outgoing: Mutex::new(OutgoingStream::default()),
                pending_responses: Registry::new(),
                incoming_streams: Registry::new(),
                pending_images: Registry::new(),
                codec,
            }),
        })
    }
}

/// Handle to one channel connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    listener: Arc<dyn SessionListener>,
    image_preparer: Option<Arc<dyn ImagePreparer>>,
    image_chunk_size: Option<usize>,
    state: AtomicConnectionState,
    seq: AtomicU32,
    /// Bumped on connect and teardown so late events from a dropped
    /// transport are ignored.
    epoch: AtomicU64,
    logon_seq: AtomicU32,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
    outgoing: Mutex<OutgoingStream>,
    pending_responses: Registry<u32, ResponseCallback>,
    incoming_streams: Registry<u32, String>,
    pending_images: Registry<u32, PendingImage>,
    codec: CodecSessions,
}

impl Session {
    /// Starts building a session for `config` that encodes and decodes with
    /// `codec`. Defaults to a real WebSocket connector and a no-op listener.
    pub fn builder(config: ChannelConfig, codec: Arc<dyn CodecFactory>) -> SessionBuilder {
        SessionBuilder {
            config,
            codec,
            connector: Arc::new(WebSocketConnector),
            listener: Arc::new(NoopListener),
            image_preparer: None,
            image_chunk_size: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn channel(&self) -> &str {
        &self.inner.config.channel
    }

    /// Server-assigned id of the outgoing voice stream, once known.
    pub fn outgoing_stream_id(&self) -> Option<u32> {
        lock(&self.inner.outgoing).stream_id
    }

    /// True while a `start_stream` request is waiting for its stream id.
    pub fn voice_stream_pending(&self) -> bool {
        lock(&self.inner.outgoing).start_seq.is_some()
    }

    pub fn incoming_stream_count(&self) -> usize {
        self.inner.incoming_streams.len()
    }

    pub fn pending_response_count(&self) -> usize {
        self.inner.pending_responses.len()
    }

    pub fn pending_image_count(&self) -> usize {
        self.inner.pending_images.len()
    }

    /// Opens the transport and begins logging in. Only valid while
    /// disconnected.
    pub fn connect(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner
            .state
            .advance(ConnectionState::Disconnected, ConnectionState::Connecting)?;

        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&inner.outbound) = Some(tx);

        info!(url = %inner.config.server_url, channel = %inner.config.channel, "Connecting to channel server...");
        let events = TransportEvents::new(Arc::downgrade(inner), epoch);
        if let Err(e) = inner
            .connector
            .open(ConnectRequest::new(&inner.config.server_url), rx, events)
        {
            error!(error = %e, "Failed to start transport");
            inner.epoch.fetch_add(1, Ordering::SeqCst);
            lock(&inner.outbound).take();
            inner.state.force_disconnected();
            return Err(e.into());
        }
        Ok(())
    }

    /// Closes the connection. From `Connected` this is graceful: the state
    /// passes through `Disconnecting` until the transport confirms closure.
    /// While still connecting or logging in the session is torn down at once.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        match inner.state.load() {
            ConnectionState::Connected => {
                if inner
                    .state
                    .advance(ConnectionState::Connected, ConnectionState::Disconnecting)
                    .is_ok()
                {
                    info!("Disconnecting from channel server...");
                    lock(&inner.outbound).take();
                    inner.codec.release_decoders();
                }
            }
            ConnectionState::Connecting | ConnectionState::LoggingIn => {
                inner.teardown("disconnected by client");
            }
            state => debug!(%state, "Disconnect ignored"),
        }
    }

    /// Asks the server for a new outgoing voice stream. The stream id arrives
    /// later in the reply.
    pub fn start_voice_stream(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.require_connected("start_voice_stream")?;
        let seq = inner.next_seq();
        *lock(&inner.outgoing) = OutgoingStream {
            start_seq: Some(seq),
            ..OutgoingStream::default()
        };
        inner.send_command(seq, &Command::start_stream())?;
        Ok(())
    }

    /// Ends the outgoing voice stream. When the stream id has not arrived
    /// yet, the stop is sent as soon as it does.
    pub fn stop_voice_stream(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.require_connected("stop_voice_stream")?;
        let stream_id = {
            let mut outgoing = lock(&inner.outgoing);
            match outgoing.stream_id.take() {
                Some(stream_id) => stream_id,
                None if outgoing.start_seq.is_some() => {
                    outgoing.stop_on_start = true;
                    debug!("Stop deferred until the stream id arrives");
                    return Ok(());
                }
                None => {
                    debug!("No outgoing stream to stop");
                    return Ok(());
                }
            }
        };
        inner.send_stop_stream(stream_id)
    }

    /// Encodes one frame and sends it on the outgoing stream.
    pub fn send_voice_data(&self, frame: &AudioFrame) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.state.load() != ConnectionState::Connected {
            debug!("Voice frame dropped: not connected");
            return Err(SessionError::NotConnected);
        }

        let mut outgoing = lock(&inner.outgoing);
        let Some(stream_id) = outgoing.stream_id else {
            trace!("Voice frame dropped: no outgoing stream");
            return Err(SessionError::NoActiveStream);
        };
        let packet = inner.codec.encode(frame).inspect_err(|e| {
            warn!(stream_id, error = %e, "Failed to encode voice frame");
        })?;
        let packet_id = outgoing.next_packet_id;
        let frame = BinaryFrame::audio(stream_id, packet_id, packet);
        inner.send_frame(OutboundFrame::Binary(frame.encode()))?;
        outgoing.next_packet_id = packet_id.wrapping_add(1);
        trace!(stream_id, packet_id, "Sent voice packet");
        Ok(())
    }

    /// Posts a text message to the channel. `on_reply`, if given, receives
    /// the server's reply.
    pub fn send_text_message(
        &self,
        text: &str,
        on_reply: Option<ResponseCallback>,
    ) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.require_connected("send_text_message")?;
        let seq = inner.next_seq();
        if let Some(callback) = on_reply {
            inner.pending_responses.insert(seq, callback);
        }
        let command = Command::SendTextMessage {
            channel: inner.config.channel.clone(),
            text: text.to_string(),
        };
        inner.send_command(seq, &command).inspect_err(|_| {
            inner.pending_responses.take(&seq);
        })?;
        Ok(())
    }

    /// Prepares `jpeg` with the configured [`ImagePreparer`] and uploads it.
    pub fn send_image(&self, jpeg: &[u8]) -> Result<(), SessionError> {
        let preparer = self
            .inner
            .image_preparer
            .as_ref()
            .ok_or(ImageError::NoPreparer)?;
        self.inner.require_connected("send_image")?;
        let image = preparer.prepare(jpeg)?;
        self.send_prepared_image(image)
    }

    /// Announces an already prepared image. Its bytes are uploaded when the
    /// server replies with an image id.
    pub fn send_prepared_image(&self, image: PreparedImage) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.require_connected("send_image")?;
        let seq = inner.next_seq();
        let command = Command::SendImage {
            channel: inner.config.channel.clone(),
            image_type: "jpeg".to_string(),
            source: "library".to_string(),
            width: image.width,
            height: image.height,
            thumbnail_content_length: image.thumbnail.len(),
            content_length: image.full.len(),
        };
        inner.pending_images.insert(
            seq,
            PendingImage {
                thumbnail: image.thumbnail,
                full: image.full,
            },
        );
        inner.send_command(seq, &command).inspect_err(|_| {
            inner.pending_images.take(&seq);
        })?;
        Ok(())
    }
}

impl SessionInner {
    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn is_current(&self, epoch: u64) -> bool {
        let current = self.epoch.load(Ordering::SeqCst);
        if current != epoch {
            trace!(epoch, current, "Ignoring event from a stale transport");
        }
        current == epoch
    }

    fn require_connected(&self, operation: &'static str) -> Result<(), SessionError> {
        let state = self.state.load();
        if state != ConnectionState::Connected {
            warn!(operation, %state, "Operation ignored: session is not connected");
            return Err(SessionError::NotConnected);
        }
        Ok(())
    }

    fn send_frame(&self, frame: OutboundFrame) -> Result<(), SessionError> {
        let outbound = lock(&self.outbound);
        let sender = outbound.as_ref().ok_or(SessionError::NotConnected)?;
        sender
            .send(frame)
            .map_err(|_| SessionError::TransportClosed)
    }

    fn send_stop_stream(&self, stream_id: u32) -> Result<(), SessionError> {
        let command = Command::StopStream {
            stream_id,
            channel: self.config.channel.clone(),
        };
        self.send_command(self.next_seq(), &command)?;
        info!(stream_id, "Outgoing voice stream stopped.");
        Ok(())
    }

    fn send_command(&self, seq: u32, command: &Command) -> Result<(), SessionError> {
        let json = command.to_json(seq)?;
        self.send_frame(OutboundFrame::Text(json))?;
        debug!(seq, command = command.name(), "Sent command");
        Ok(())
    }

    pub(crate) fn handle_open(&self, epoch: u64) {
        if !self.is_current(epoch) {
            return;
        }
        if let Err(e) = self
            .state
            .advance(ConnectionState::Connecting, ConnectionState::LoggingIn)
        {
            warn!(error = %e, "Transport opened in an unexpected state");
            return;
        }

        let seq = self.next_seq();
        self.logon_seq.store(seq, Ordering::SeqCst);
        let (username, password) = match self.config.auth_token {
            Some(_) => (None, None),
            None => (self.config.username.clone(), self.config.password.clone()),
        };
        let logon = Command::Logon {
            auth_token: self.config.auth_token.clone(),
            username,
            password,
            channel: self.config.channel.clone(),
        };
        info!(channel = %self.config.channel, "Transport open, logging in...");
        if let Err(e) = self.send_command(seq, &logon) {
            error!(error = %e, "Failed to send logon");
            self.listener.error("Failed to send logon", Some(&e));
            self.teardown("logon could not be sent");
        }
    }

    pub(crate) fn handle_text(&self, epoch: u64, text: &str) {
        if !self.is_current(epoch) {
            return;
        }
        trace!(len = text.len(), "Received text frame");
        match protocol::parse_inbound(text) {
            Ok(Inbound::Reply(reply)) => self.handle_reply(reply),
            Ok(Inbound::Event(event)) => self.handle_event(event),
            Err(e) => {
                warn!(error = %e, "Failed to parse server message");
                self.listener
                    .error("Failed to parse server message", Some(&SessionError::Protocol(e)));
            }
        }
    }

    fn handle_reply(&self, reply: Reply) {
        if let Some(callback) = reply.seq.and_then(|seq| self.pending_responses.take(&seq)) {
            debug!(seq = ?reply.seq, "Dispatching reply to its callback");
            callback(reply);
            return;
        }

        if reply.is_error() {
            self.handle_rejection(&reply);
            return;
        }

        let mut handled = false;
        let answers_start = {
            let mut outgoing = lock(&self.outgoing);
            let answers = reply.seq.is_some() && reply.seq == outgoing.start_seq;
            if answers {
                outgoing.start_seq = None;
            }
            answers
        };
        if let Some(stream_id) = reply.stream_id {
            handled = true;
            let stop_now = {
                let mut outgoing = lock(&self.outgoing);
                let stop_now = std::mem::take(&mut outgoing.stop_on_start);
                if !stop_now {
                    outgoing.stream_id = Some(stream_id);
                    outgoing.next_packet_id = 0;
                }
                stop_now
            };
            info!(stream_id, "Outgoing voice stream started.");
            if stop_now {
                if let Err(e) = self.send_stop_stream(stream_id) {
                    warn!(stream_id, error = %e, "Failed to send deferred stop_stream");
                }
            }
        } else if answers_start {
            warn!(seq = ?reply.seq, "start_stream reply carried no stream id");
        }
        if let Some(image_id) = reply.image_id {
            handled = true;
            match reply.seq.and_then(|seq| self.pending_images.take(&seq)) {
                Some(image) => self.upload_image(image_id, image),
                None => warn!(image_id, seq = ?reply.seq, "Image id for an unknown request"),
            }
        }
        if !handled {
            debug!(seq = ?reply.seq, success = ?reply.success, "Reply acknowledged");
        }
    }

    fn handle_rejection(&self, reply: &Reply) {
        let message = reply.error_message().to_string();
        warn!(seq = ?reply.seq, error = %message, "Server rejected a request");
        if let Some(seq) = reply.seq {
            if self.pending_images.take(&seq).is_some() {
                debug!(seq, "Dropped pending image");
            }
            let mut outgoing = lock(&self.outgoing);
            if outgoing.start_seq == Some(seq) {
                *outgoing = OutgoingStream::default();
                debug!(seq, "Voice stream start rejected");
            }
        }
        let rejected = SessionError::Rejected(message.clone());
        self.listener.error(&message, Some(&rejected));

        let logon_seq = self.logon_seq.load(Ordering::SeqCst);
        if self.state.load() == ConnectionState::LoggingIn
            && logon_seq != NO_SEQ
            && reply.seq == Some(logon_seq)
        {
            error!(error = %message, "Logon failed");
            self.teardown(&format!("logon failed: {}", message));
        }
    }

    fn upload_image(&self, image_id: u32, image: PendingImage) {
        let frames = wire::image_frames(
            image_id,
            ImageKind::Thumbnail,
            &image.thumbnail,
            self.image_chunk_size,
        )
        .into_iter()
        .chain(wire::image_frames(
            image_id,
            ImageKind::Full,
            &image.full,
            self.image_chunk_size,
        ));
        for frame in frames {
            if let Err(e) = self.send_frame(OutboundFrame::Binary(frame.encode())) {
                warn!(image_id, error = %e, "Image upload interrupted");
                return;
            }
        }
        info!(
            image_id,
            thumbnail_bytes = image.thumbnail.len(),
            full_bytes = image.full.len(),
            "Image uploaded."
        );
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::ChannelStatus(status) => {
                debug!(status = %status.status, users_online = ?status.users_online, "Channel status");
                if status.is_online()
                    && self
                        .state
                        .advance(ConnectionState::LoggingIn, ConnectionState::Connected)
                        .is_ok()
                {
                    self.logon_seq.store(NO_SEQ, Ordering::SeqCst);
                    info!(channel = %self.config.channel, "Connected to channel.");
                    self.listener.connected();
                }
                self.listener.channel_status(&status);
            }
            ServerEvent::TextMessage(message) => {
                debug!(from = %message.from, "Text message received");
                self.listener.text_message(&message.from, &message.message);
            }
            ServerEvent::StreamStart(start) => {
                if let Err(e) = self.codec.start_decoding_session(start.stream_id) {
                    self.listener.error(
                        "Failed to create decoder for incoming stream",
                        Some(&SessionError::Codec(e)),
                    );
                    return;
                }
                self.incoming_streams.insert(start.stream_id, start.from.clone());
                info!(stream_id = start.stream_id, from = %start.from, "Incoming stream started.");
                self.listener.stream_started(start.stream_id, &start.from);
            }
            ServerEvent::StreamStop(stop) => {
                let known = self.incoming_streams.take(&stop.stream_id);
                self.codec.stop_decoding_session(stop.stream_id);
                let from = known.or(stop.from).unwrap_or_else(|| {
                    debug!(stream_id = stop.stream_id, "Stop for an unknown stream");
                    String::new()
                });
                info!(stream_id = stop.stream_id, from = %from, "Incoming stream stopped.");
                self.listener.stream_stopped(stop.stream_id, &from);
            }
            ServerEvent::Error(server_error) => {
                warn!(error = %server_error.error, "Server reported an error");
                self.listener.error(&server_error.error, None);
            }
            ServerEvent::Image(image) => {
                debug!(image_id = image.image_id, from = %image.from, "Image announced");
                self.listener.image_received(&image);
            }
            ServerEvent::Unrecognized { command, .. } => {
                debug!(%command, "Ignoring unrecognized server command");
            }
        }
    }

    pub(crate) fn handle_binary(&self, epoch: u64, data: &[u8]) {
        if !self.is_current(epoch) {
            return;
        }
        let frame = match BinaryFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed binary frame");
                self.listener
                    .error("Dropped malformed binary frame", Some(&SessionError::Wire(e)));
                return;
            }
        };

        match frame.frame_type {
            FrameType::Audio => match self.codec.decode(frame.id, &frame.payload) {
                Ok(pcm) => self.listener.audio_data(frame.id, &pcm),
                Err(CodecError::NoSession(stream_id)) => {
                    debug!(stream_id, "Audio for a stream without a decoder");
                }
                Err(e) => warn!(stream_id = frame.id, error = %e, "Failed to decode audio packet"),
            },
            FrameType::Image => {
                debug!(image_id = frame.id, len = frame.payload.len(), "Ignoring inbound image data");
            }
            FrameType::Other(kind) => debug!(kind, "Ignoring binary frame of unknown type"),
        }
    }

    pub(crate) fn handle_closed(&self, epoch: u64, reason: &str) {
        if !self.is_current(epoch) {
            return;
        }
        self.teardown(reason);
    }

    /// Forces `Disconnected` and clears everything tied to the connection.
    fn teardown(&self, reason: &str) {
        let previous = self.state.force_disconnected();
        if previous == ConnectionState::Disconnected {
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.outbound).take();
        self.logon_seq.store(NO_SEQ, Ordering::SeqCst);
        *lock(&self.outgoing) = OutgoingStream::default();

        let abandoned = self.pending_responses.drain().len();
        let streams = self.incoming_streams.drain().len();
        let images = self.pending_images.drain().len();
        let decoders = self.codec.release_decoders();

        info!(
            %reason,
            from = %previous,
            abandoned,
            streams,
            images,
            decoders,
            "Disconnected."
        );
        self.listener.disconnected(reason);
    }
}
