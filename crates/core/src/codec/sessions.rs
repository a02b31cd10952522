use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use super::{AudioDecoder, AudioEncoder, CodecError, CodecFactory};
use crate::audio::{AudioFrame, samples_to_le_bytes};

/// Owns the outbound encoder and one decoder per active inbound stream.
///
/// Handles are moved out of their table before being dropped, so a handle is
/// destroyed exactly once no matter how start/stop/close calls interleave.
pub struct CodecSessions {
    factory: Arc<dyn CodecFactory>,
    encoder: Mutex<Option<Box<dyn AudioEncoder>>>,
    decoders: Mutex<HashMap<u32, Box<dyn AudioDecoder>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CodecSessions {
    /// Creates the manager and its single outbound encoder.
    pub fn new(factory: Arc<dyn CodecFactory>) -> Result<Self, CodecError> {
        let encoder = factory.create_encoder()?;
        info!(codec = factory.name(), "Audio encoder created.");
        Ok(Self {
            factory,
            encoder: Mutex::new(Some(encoder)),
            decoders: Mutex::new(HashMap::new()),
        })
    }

    pub fn codec_name(&self) -> &'static str {
        self.factory.name()
    }

    /// Opens a decoder for `stream_id`, replacing any decoder already open
    /// under that id.
    pub fn start_decoding_session(&self, stream_id: u32) -> Result<(), CodecError> {
        let decoder = self.factory.create_decoder().inspect_err(|e| {
            error!(stream_id, error = %e, "Failed to create decoder");
        })?;
        if lock(&self.decoders).insert(stream_id, decoder).is_some() {
            warn!(stream_id, "Replaced an existing decoder for stream");
        } else {
            debug!(stream_id, "Decoder created for stream");
        }
        Ok(())
    }

    /// Destroys the decoder for `stream_id`. Returns whether one existed.
    pub fn stop_decoding_session(&self, stream_id: u32) -> bool {
        let removed = lock(&self.decoders).remove(&stream_id);
        match removed {
            Some(decoder) => {
                drop(decoder);
                debug!(stream_id, "Decoder destroyed for stream");
                true
            }
            None => false,
        }
    }

    pub fn has_decoding_session(&self, stream_id: u32) -> bool {
        lock(&self.decoders).contains_key(&stream_id)
    }

    pub fn active_decoding_sessions(&self) -> usize {
        lock(&self.decoders).len()
    }

    /// Compresses one frame with the outbound encoder.
    pub fn encode(&self, frame: &AudioFrame) -> Result<Vec<u8>, CodecError> {
        let mut guard = lock(&self.encoder);
        let encoder = guard.as_mut().ok_or(CodecError::Closed)?;
        encoder.encode(&frame.samples())
    }

    /// Decodes one packet for `stream_id` into little-endian PCM bytes. The
    /// output length is whatever the codec produced.
    pub fn decode(&self, stream_id: u32, packet: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut decoders = lock(&self.decoders);
        let decoder = decoders
            .get_mut(&stream_id)
            .ok_or(CodecError::NoSession(stream_id))?;
        let samples = decoder.decode(packet)?;
        Ok(samples_to_le_bytes(&samples))
    }

    /// Destroys every decoder, keeping the encoder.
    pub fn release_decoders(&self) -> usize {
        let drained: Vec<_> = lock(&self.decoders).drain().collect();
        let count = drained.len();
        drop(drained);
        if count > 0 {
            debug!(count, "Released decoding sessions");
        }
        count
    }

    /// Destroys the encoder and all decoders. Safe to call repeatedly.
    pub fn close(&self) {
        let encoder = lock(&self.encoder).take();
        let released = self.release_decoders();
        if let Some(encoder) = encoder {
            drop(encoder);
            info!(released, "Codec sessions closed.");
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.encoder).is_none()
    }
}

impl Drop for CodecSessions {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FRAME_SIZE_BYTES, SAMPLES_PER_FRAME};
    use crate::codec::RawPcmCodec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts live handles so tests can assert on create/destroy balance.
    #[derive(Default)]
    struct CountingCodec {
        live: Arc<AtomicUsize>,
        fail_decode: bool,
    }

    struct Handle(Arc<AtomicUsize>, bool);

    impl Drop for Handle {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl AudioEncoder for Handle {
        fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
            // Reversible transform: byte-swap every sample.
            Ok(pcm.iter().flat_map(|s| s.to_be_bytes()).collect())
        }
    }

    impl AudioDecoder for Handle {
        fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
            if self.1 {
                return Err(CodecError::Backend("corrupt packet".to_string()));
            }
            Ok(packet
                .chunks_exact(2)
                .map(|c| i16::from_be_bytes([c[0], c[1]]))
                .collect())
        }
    }

    impl CodecFactory for CountingCodec {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn create_encoder(&self) -> Result<Box<dyn AudioEncoder>, CodecError> {
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Handle(self.live.clone(), false)))
        }

        fn create_decoder(&self) -> Result<Box<dyn AudioDecoder>, CodecError> {
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Handle(self.live.clone(), self.fail_decode)))
        }
    }

    fn test_frame() -> AudioFrame {
        let samples: Vec<i16> = (0..SAMPLES_PER_FRAME as i16).map(|i| i * 37 - 5000).collect();
        AudioFrame::from_samples(&samples).unwrap()
    }

    #[test]
    fn test_round_trip_after_session_start() {
        let sessions = CodecSessions::new(Arc::new(CountingCodec::default())).unwrap();
        sessions.start_decoding_session(42).unwrap();

        let frame = test_frame();
        let packet = sessions.encode(&frame).unwrap();
        let pcm = sessions.decode(42, &packet).unwrap();
        assert_eq!(pcm.len(), FRAME_SIZE_BYTES);
        assert_eq!(pcm, frame.as_bytes());
    }

    #[test]
    fn test_decode_without_session_fails() {
        let sessions = CodecSessions::new(Arc::new(RawPcmCodec)).unwrap();
        assert_eq!(
            sessions.decode(5, &[0, 0]),
            Err(CodecError::NoSession(5))
        );
    }

    #[test]
    fn test_decode_after_stop_fails() {
        let sessions = CodecSessions::new(Arc::new(RawPcmCodec)).unwrap();
        sessions.start_decoding_session(5).unwrap();
        assert!(sessions.stop_decoding_session(5));
        assert!(!sessions.stop_decoding_session(5));
        assert_eq!(sessions.decode(5, &[0, 0]), Err(CodecError::NoSession(5)));
    }

    #[test]
    fn test_decoder_failure_is_reported() {
        let codec = CountingCodec {
            fail_decode: true,
            ..Default::default()
        };
        let sessions = CodecSessions::new(Arc::new(codec)).unwrap();
        sessions.start_decoding_session(1).unwrap();
        assert!(matches!(
            sessions.decode(1, &[0, 1]),
            Err(CodecError::Backend(_))
        ));
        // The session survives a bad packet.
        assert!(sessions.has_decoding_session(1));
    }

    #[test]
    fn test_output_length_follows_codec() {
        let sessions = CodecSessions::new(Arc::new(RawPcmCodec)).unwrap();
        sessions.start_decoding_session(3).unwrap();
        assert_eq!(sessions.decode(3, &[1, 0, 2, 0]).unwrap().len(), 4);
    }

    #[test]
    fn test_restart_replaces_decoder_without_leaking() {
        let live = Arc::new(AtomicUsize::new(0));
        let codec = CountingCodec {
            live: live.clone(),
            fail_decode: false,
        };
        let sessions = CodecSessions::new(Arc::new(codec)).unwrap();
        sessions.start_decoding_session(9).unwrap();
        sessions.start_decoding_session(9).unwrap();
        assert_eq!(sessions.active_decoding_sessions(), 1);
        // Encoder + one decoder.
        assert_eq!(live.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_is_idempotent_and_releases_everything() {
        let live = Arc::new(AtomicUsize::new(0));
        let codec = CountingCodec {
            live: live.clone(),
            fail_decode: false,
        };
        let sessions = CodecSessions::new(Arc::new(codec)).unwrap();
        sessions.start_decoding_session(1).unwrap();
        sessions.start_decoding_session(2).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 3);

        sessions.close();
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(sessions.is_closed());
        sessions.close();
        assert_eq!(live.load(Ordering::SeqCst), 0);

        assert_eq!(sessions.encode(&test_frame()), Err(CodecError::Closed));
        drop(sessions);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_release_decoders_keeps_encoder() {
        let sessions = CodecSessions::new(Arc::new(RawPcmCodec)).unwrap();
        sessions.start_decoding_session(1).unwrap();
        sessions.start_decoding_session(2).unwrap();
        assert_eq!(sessions.release_decoders(), 2);
        assert_eq!(sessions.active_decoding_sessions(), 0);
        assert!(sessions.encode(&test_frame()).is_ok());
    }
}
