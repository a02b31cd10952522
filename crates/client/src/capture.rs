//! Audio capture sources feeding the radio bridge.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use talkgroup_core::audio::{FRAME_DURATION_MS, FRAME_SIZE_BYTES};
use tracing::{debug, info, warn};

/// Receives one 640-byte PCM frame per call.
pub type FrameCallback = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture source is already running")]
    AlreadyStarted,
    #[error("capture I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Something that produces 20 ms PCM frames until stopped.
pub trait CaptureSource: Send {
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError>;
    fn stop(&mut self);
}

/// Plays raw PCM16 from a reader in real time, one frame every 20 ms.
///
/// A trailing partial frame at end of input is discarded. With looping
/// enabled the reader is rewound instead of stopping.
pub struct ReaderSource<R> {
    reader: Option<R>,
    looping: bool,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ReaderSource<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>, looping: bool) -> Result<Self, CaptureError> {
        let file = File::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), looping, "Opened PCM capture file.");
        Ok(Self::new(BufReader::new(file), looping))
    }
}

impl<R: Read + Seek + Send + 'static> ReaderSource<R> {
    pub fn new(reader: R, looping: bool) -> Self {
        Self {
            reader: Some(reader),
            looping,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Fills `buf` completely. `Ok(false)` means the input ended first.
fn read_frame(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn pump<R: Read + Seek>(
    mut reader: R,
    looping: bool,
    running: &AtomicBool,
    on_frame: &mut FrameCallback,
) -> io::Result<u64> {
    let period = Duration::from_millis(FRAME_DURATION_MS as u64);
    let mut frame = [0u8; FRAME_SIZE_BYTES];
    let mut next_tick = Instant::now();
    let mut frames = 0u64;
    let mut frames_this_pass = 0u64;

    while running.load(Ordering::SeqCst) {
        if !read_frame(&mut reader, &mut frame)? {
            // An empty input would spin forever when looping.
            if !looping || frames_this_pass == 0 {
                break;
            }
            reader.seek(SeekFrom::Start(0))?;
            frames_this_pass = 0;
            continue;
        }
        on_frame(&frame);
        frames += 1;
        frames_this_pass += 1;

        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }
    Ok(frames)
}

impl<R: Read + Seek + Send + 'static> CaptureSource for ReaderSource<R> {
    fn start(&mut self, mut on_frame: FrameCallback) -> Result<(), CaptureError> {
        let reader = self.reader.take().ok_or(CaptureError::AlreadyStarted)?;
        let looping = self.looping;
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let worker = thread::Builder::new()
            .name("pcm-capture".to_string())
            .spawn(move || {
                match pump(reader, looping, &running, &mut on_frame) {
                    Ok(frames) => debug!(frames, "PCM capture finished"),
                    Err(e) => warn!(error = %e, "PCM capture failed"),
                }
                running.store(false, Ordering::SeqCst);
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("PCM capture thread panicked");
            }
        }
    }
}

impl<R> Drop for ReaderSource<R> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
