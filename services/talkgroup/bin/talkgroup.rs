//! Main entrypoint for the talkgroup radio client.
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Choosing the audio codec backend.
//! 3. Connecting a session to the configured channel.
//! 4. Feeding a raw PCM file through the VOX bridge once connected.
//! 5. Writing received audio to disk and shutting down on Ctrl+C.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use talkgroup_client::{
    Config, RadioBridge, ReaderSource, Session, SessionError, SessionListener,
};
use talkgroup_core::codec::CodecFactory;
use talkgroup_core::protocol::{ChannelStatus, ImageEvent};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Push-to-talk channel client")]
struct Args {
    /// Raw 16 kHz mono PCM16 file to transmit through the VOX gate.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Replay the input file from the start when it ends.
    #[arg(long = "loop")]
    repeat: bool,

    /// Append decoded incoming audio to this file as raw PCM16.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Text message to post once connected.
    #[arg(long)]
    text: Option<String>,
}

enum Notice {
    Connected,
    Disconnected(String),
}

/// Logs channel activity and optionally records incoming audio.
struct ConsoleListener {
    notices: mpsc::UnboundedSender<Notice>,
    recording: Option<Mutex<BufWriter<File>>>,
}

impl ConsoleListener {
    fn new(
        notices: mpsc::UnboundedSender<Notice>,
        output: Option<&PathBuf>,
    ) -> anyhow::Result<Self> {
        let recording = output
            .map(|path| {
                File::create(path)
                    .with_context(|| format!("Failed to create {}", path.display()))
                    .map(|file| Mutex::new(BufWriter::new(file)))
            })
            .transpose()?;
        Ok(Self {
            notices,
            recording,
        })
    }
}

impl SessionListener for ConsoleListener {
    fn connected(&self) {
        let _ = self.notices.send(Notice::Connected);
    }

    fn disconnected(&self, reason: &str) {
        let _ = self.notices.send(Notice::Disconnected(reason.to_string()));
    }

    fn error(&self, message: &str, cause: Option<&SessionError>) {
        match cause {
            Some(cause) => warn!(%message, cause = %cause, "Session error"),
            None => warn!(%message, "Session error"),
        }
    }

    fn text_message(&self, from: &str, text: &str) {
        info!(%from, %text, "Text message");
    }

    fn stream_started(&self, stream_id: u32, from: &str) {
        info!(stream_id, %from, "Incoming voice");
    }

    fn stream_stopped(&self, stream_id: u32, from: &str) {
        info!(stream_id, %from, "Incoming voice ended");
    }

    fn audio_data(&self, stream_id: u32, pcm: &[u8]) {
        let Some(recording) = &self.recording else {
            return;
        };
        let mut writer = recording.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = writer.write_all(pcm) {
            error!(stream_id, error = %e, "Failed to record audio");
        }
    }

    fn image_received(&self, image: &ImageEvent) {
        info!(image_id = image.image_id, from = %image.from, "Image posted to channel");
    }

    fn channel_status(&self, status: &ChannelStatus) {
        info!(
            status = %status.status,
            users_online = ?status.users_online,
            "Channel status"
        );
    }
}

impl Drop for ConsoleListener {
    fn drop(&mut self) {
        if let Some(recording) = &self.recording {
            let mut writer = recording.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = writer.flush() {
                error!(error = %e, "Failed to flush recorded audio");
            }
        }
    }
}

#[cfg(feature = "opus")]
fn codec_backend() -> anyhow::Result<Arc<dyn CodecFactory>> {
    info!("Using Opus codec backend.");
    Ok(Arc::new(talkgroup_core::codec::opus::OpusCodec))
}

#[cfg(not(feature = "opus"))]
fn codec_backend() -> anyhow::Result<Arc<dyn CodecFactory>> {
    anyhow::bail!("No audio codec available: rebuild with `--features opus`")
}

/// Waits for `Ctrl+C` and logs it.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(channel = ?config.channel, "Configuration loaded.");

    // --- 3. Build the Session ---
    let codec = codec_backend()?;
    let (notices_tx, mut notices) = mpsc::unbounded_channel();
    let listener = Arc::new(ConsoleListener::new(notices_tx, args.output.as_ref())?);
    let session = Session::builder(config.channel.clone(), codec)
        .listener(listener)
        .build()
        .context("Failed to create session")?;
    let bridge = RadioBridge::new(Arc::new(session.clone()), config.vox.clone())
        .context("Invalid VOX configuration")?;

    // --- 4. Connect and Run ---
    session.connect().context("Failed to connect")?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            notice = notices.recv() => match notice {
                Some(Notice::Connected) => {
                    if let Some(text) = args.text.take() {
                        session
                            .send_text_message(&text, None)
                            .context("Failed to send text message")?;
                    }
                    if let Some(path) = args.input.take() {
                        let source = ReaderSource::open(&path, args.repeat)
                            .with_context(|| format!("Failed to open {}", path.display()))?;
                        bridge.start(Box::new(source)).context("Failed to start radio bridge")?;
                    }
                }
                Some(Notice::Disconnected(reason)) => {
                    warn!(%reason, "Connection lost.");
                    bridge.stop().await;
                    return Ok(());
                }
                None => break,
            },
        }
    }

    // --- 5. Shut Down ---
    bridge.stop().await;
    session.disconnect();
    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(notice) = notices.recv().await {
            if matches!(notice, Notice::Disconnected(_)) {
                break;
            }
        }
    })
    .await;
    if closed.is_err() {
        warn!("Timed out waiting for the server to close the connection.");
    }

    info!("Client has shut down.");
    Ok(())
}
