//! libopus backend, enabled with the `opus` feature.

use super::{AudioDecoder, AudioEncoder, CodecError, CodecFactory};
use crate::audio::{SAMPLE_RATE, SAMPLES_PER_FRAME};

/// Upper bound for one compressed packet.
pub const MAX_OPUS_PACKET_SIZE: usize = 4000;
/// Opus packets may carry up to 120 ms of audio.
const MAX_DECODED_SAMPLES: usize = SAMPLES_PER_FRAME * 6;

#[derive(Debug, Clone, Copy, Default)]
pub struct OpusCodec;

struct OpusEncoder {
    inner: opus::Encoder,
    buffer: Vec<u8>,
}

struct OpusDecoder {
    inner: opus::Decoder,
    buffer: Vec<i16>,
}

impl From<opus::Error> for CodecError {
    fn from(err: opus::Error) -> Self {
        CodecError::Backend(err.to_string())
    }
}

impl AudioEncoder for OpusEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        let written = self.inner.encode(pcm, &mut self.buffer)?;
        Ok(self.buffer[..written].to_vec())
    }
}

impl AudioDecoder for OpusDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        let samples = self.inner.decode(packet, &mut self.buffer, false)?;
        Ok(self.buffer[..samples].to_vec())
    }
}

impl CodecFactory for OpusCodec {
    fn name(&self) -> &'static str {
        "opus"
    }

    fn create_encoder(&self) -> Result<Box<dyn AudioEncoder>, CodecError> {
        let inner = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)?;
        Ok(Box::new(OpusEncoder {
            inner,
            buffer: vec![0u8; MAX_OPUS_PACKET_SIZE],
        }))
    }

    fn create_decoder(&self) -> Result<Box<dyn AudioDecoder>, CodecError> {
        let inner = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)?;
        Ok(Box::new(OpusDecoder {
            inner,
            buffer: vec![0i16; MAX_DECODED_SAMPLES],
        }))
    }
}
