//! Voice-activated bridge between a capture source and a session.
//!
//! The capture side runs the VOX gate and never touches the network. Frames
//! the gate lets through go into an unbounded channel drained by a single
//! transmit thread that hands them to the [`VoiceSink`].

use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select, unbounded};
use talkgroup_core::audio::AudioFrame;
use talkgroup_core::vox::{VoxConfig, VoxConfigError, VoxDecision, VoxGate, VoxState};
use tracing::{debug, info, trace, warn};

use crate::capture::{CaptureError, CaptureSource};
use crate::error::SessionError;
use crate::registry::lock;
use crate::session::Session;
use crate::state::ConnectionState;

/// How often the transmit thread rechecks a pending stream start.
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Longest a frame waits for the server to assign a stream id.
const STREAM_START_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("radio bridge is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Vox(#[from] VoxConfigError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("failed to spawn transmit thread: {0}")]
    Spawn(#[source] io::Error),
}

/// The part of a session the bridge drives.
///
/// `start_voice_stream` only asks for a stream; frames sent before the
/// server assigns its id are rejected with [`SessionError::NoActiveStream`].
/// The bridge holds queued frames while `stream_pending` is true so the
/// start of speech is not clipped.
#[cfg_attr(test, mockall::automock)]
pub trait VoiceSink: Send + Sync {
    fn state(&self) -> ConnectionState;
    fn start_voice_stream(&self) -> Result<(), SessionError>;
    fn stop_voice_stream(&self) -> Result<(), SessionError>;
    /// True between `start_voice_stream` and the server's reply to it.
    fn stream_pending(&self) -> bool;
    fn send_voice_data(&self, frame: &AudioFrame) -> Result<(), SessionError>;
}

impl VoiceSink for Session {
    fn state(&self) -> ConnectionState {
        Session::state(self)
    }

    fn start_voice_stream(&self) -> Result<(), SessionError> {
        Session::start_voice_stream(self)
    }

    fn stop_voice_stream(&self) -> Result<(), SessionError> {
        Session::stop_voice_stream(self)
    }

    fn stream_pending(&self) -> bool {
        Session::voice_stream_pending(self)
    }

    fn send_voice_data(&self, frame: &AudioFrame) -> Result<(), SessionError> {
        Session::send_voice_data(self, frame)
    }
}

struct BridgeInner {
    sink: Arc<dyn VoiceSink>,
    gate: Mutex<VoxGate>,
    frames_tx: Sender<AudioFrame>,
    frames_rx: Receiver<AudioFrame>,
}

/// A running transmit thread. Dropping `cancel` stops it.
struct Transmitter {
    cancel: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl Transmitter {
    fn spawn(inner: Arc<BridgeInner>) -> io::Result<Self> {
        let (cancel, cancelled) = crossbeam_channel::bounded(1);
        let handle = thread::Builder::new()
            .name("vox-transmit".to_string())
            .spawn(move || transmit_loop(inner, cancelled))?;
        Ok(Self { cancel, handle })
    }

    fn finish(self) {
        drop(self.cancel);
        if self.handle.join().is_err() {
            warn!("Transmit thread panicked");
        }
    }
}

pub struct RadioBridge {
    inner: Arc<BridgeInner>,
    source: Mutex<Option<Box<dyn CaptureSource>>>,
    transmitter: Mutex<Option<Transmitter>>,
}

impl RadioBridge {
    pub fn new(sink: Arc<dyn VoiceSink>, vox: VoxConfig) -> Result<Self, BridgeError> {
        let (frames_tx, frames_rx) = unbounded();
        Ok(Self {
            inner: Arc::new(BridgeInner {
                sink,
                gate: Mutex::new(VoxGate::new(vox)?),
                frames_tx,
                frames_rx,
            }),
            source: Mutex::new(None),
            transmitter: Mutex::new(None),
        })
    }

    pub fn vox_state(&self) -> VoxState {
        lock(&self.inner.gate).state()
    }

    pub fn queued_frames(&self) -> usize {
        self.inner.frames_rx.len()
    }

    /// Starts the transmit thread and then `source`. A stopped bridge can be
    /// started again.
    pub fn start(&self, mut source: Box<dyn CaptureSource>) -> Result<(), BridgeError> {
        let mut transmitter = lock(&self.transmitter);
        if transmitter.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }
        let stale = self.inner.discard_queued();
        if stale > 0 {
            debug!(stale, "Discarded frames from a previous run");
        }
        let running = Transmitter::spawn(self.inner.clone()).map_err(BridgeError::Spawn)?;

        let inner = self.inner.clone();
        if let Err(e) =
            source.start(Box::new(move |pcm: &[u8]| inner.process_frame_at(pcm, Instant::now())))
        {
            running.finish();
            return Err(e.into());
        }
        *transmitter = Some(running);
        *lock(&self.source) = Some(source);
        info!("Radio bridge started.");
        Ok(())
    }

    /// Feeds one captured frame. Called from the capture context.
    pub fn process_frame(&self, pcm: &[u8]) {
        self.inner.process_frame_at(pcm, Instant::now());
    }

    pub fn process_frame_at(&self, pcm: &[u8], now: Instant) {
        self.inner.process_frame_at(pcm, now);
    }

    /// Stops capture and the transmit thread, then ends any open stream.
    pub async fn stop(&self) {
        let source = lock(&self.source).take();
        let transmitter = lock(&self.transmitter).take();
        let joined = tokio::task::spawn_blocking(move || {
            if let Some(mut source) = source {
                source.stop();
            }
            if let Some(transmitter) = transmitter {
                transmitter.finish();
            }
        })
        .await;
        if let Err(e) = joined {
            warn!(error = %e, "Failed to join capture and transmit threads");
        }

        let was_transmitting = {
            let mut gate = lock(&self.inner.gate);
            let state = gate.state();
            gate.reset();
            state == VoxState::Transmitting
        };
        let sink = &self.inner.sink;
        if was_transmitting && sink.state() == ConnectionState::Connected {
            if let Err(e) = sink.stop_voice_stream() {
                warn!(error = %e, "Failed to stop voice stream on shutdown");
            }
        }
        info!("Radio bridge stopped.");
    }
}

impl BridgeInner {
    fn discard_queued(&self) -> usize {
        self.frames_rx.try_iter().count()
    }

    fn enqueue(&self, frames: impl IntoIterator<Item = AudioFrame>) {
        for frame in frames {
            // The bridge owns a receiver, so the channel never disconnects.
            let _ = self.frames_tx.send(frame);
        }
    }

    fn process_frame_at(&self, pcm: &[u8], now: Instant) {
        let frame = match AudioFrame::from_bytes(pcm) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping captured frame");
                return;
            }
        };

        let decision = lock(&self.gate).push(frame, now);
        match decision {
            VoxDecision::Buffered => {}
            VoxDecision::Opened(frames) => {
                if let Err(e) = self.sink.start_voice_stream() {
                    debug!(error = %e, "Voice stream not started");
                }
                debug!(frames = frames.len(), "Queued pre-roll");
                self.enqueue(frames);
            }
            VoxDecision::Forward(frame) => self.enqueue([frame]),
            VoxDecision::Closed => {
                let dropped = self.discard_queued();
                if let Err(e) = self.sink.stop_voice_stream() {
                    debug!(error = %e, "Voice stream not stopped");
                }
                debug!(dropped, "Transmit queue flushed");
            }
        }
    }

    /// Sends one frame, first waiting out a pending stream start. Returns
    /// false when cancelled.
    fn transmit(&self, frame: &AudioFrame, cancelled: &Receiver<()>) -> bool {
        if self.sink.state() != ConnectionState::Connected {
            trace!("Dropping frame: sink not connected");
            return true;
        }
        let deadline = Instant::now() + STREAM_START_TIMEOUT;
        while self.sink.stream_pending() {
            if lock(&self.gate).state() != VoxState::Transmitting {
                trace!("Dropping frame: gate closed before the stream started");
                return true;
            }
            if Instant::now() >= deadline {
                debug!("Stream id did not arrive in time");
                break;
            }
            match cancelled.recv_timeout(STREAM_POLL_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return false,
            }
        }
        if let Err(e) = self.sink.send_voice_data(frame) {
            trace!(error = %e, "Voice frame not sent");
        }
        true
    }
}

fn transmit_loop(inner: Arc<BridgeInner>, cancelled: Receiver<()>) {
    debug!("Transmit loop started");
    loop {
        select! {
            recv(cancelled) -> _ => break,
            recv(inner.frames_rx) -> frame => {
                let Ok(frame) = frame else { break };
                if !inner.transmit(&frame, &cancelled) {
                    break;
                }
            }
        }
    }
    debug!("Transmit loop exited");
}
