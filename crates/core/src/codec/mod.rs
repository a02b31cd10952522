//! Narrow codec interface plus the per-stream session manager built on it.
//!
//! A backend only has to turn one PCM frame into one packet and back. Handle
//! lifetime (one encoder per engine, one decoder per inbound stream) is owned
//! by [`CodecSessions`].

#[cfg(feature = "opus")]
pub mod opus;
mod sessions;

pub use sessions::CodecSessions;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("no decoding session for stream {0}")]
    NoSession(u32),
    #[error("codec sessions have been closed")]
    Closed,
    #[error("codec backend failure: {0}")]
    Backend(String),
}

/// Compresses one PCM frame at a time.
pub trait AudioEncoder: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;
}

/// Decompresses packets belonging to a single stream.
pub trait AudioDecoder: Send {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError>;
}

/// Creates owned encoder/decoder handles. Dropping a handle releases it.
pub trait CodecFactory: Send + Sync {
    /// Codec name announced to the server.
    fn name(&self) -> &'static str;
    fn create_encoder(&self) -> Result<Box<dyn AudioEncoder>, CodecError>;
    fn create_decoder(&self) -> Result<Box<dyn AudioDecoder>, CodecError>;
}

/// Lossless passthrough: packets are the little-endian PCM bytes themselves.
///
/// Useful for loopback testing against a local server; real channels expect
/// Opus.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPcmCodec;

struct RawPcmEncoder;
struct RawPcmDecoder;

impl AudioEncoder for RawPcmEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        Ok(crate::audio::samples_to_le_bytes(pcm))
    }
}

impl AudioDecoder for RawPcmDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        if packet.len() % 2 != 0 {
            return Err(CodecError::Backend(format!(
                "odd PCM packet length {}",
                packet.len()
            )));
        }
        Ok(crate::audio::samples_from_le_bytes(packet))
    }
}

impl CodecFactory for RawPcmCodec {
    fn name(&self) -> &'static str {
        "pcm"
    }

    fn create_encoder(&self) -> Result<Box<dyn AudioEncoder>, CodecError> {
        Ok(Box::new(RawPcmEncoder))
    }

    fn create_decoder(&self) -> Result<Box<dyn AudioDecoder>, CodecError> {
        Ok(Box::new(RawPcmDecoder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_pcm_is_reversible() {
        let mut encoder = RawPcmCodec.create_encoder().unwrap();
        let mut decoder = RawPcmCodec.create_decoder().unwrap();
        let pcm = vec![1i16, -2, 300, i16::MIN];
        let packet = encoder.encode(&pcm).unwrap();
        assert_eq!(packet.len(), 8);
        assert_eq!(decoder.decode(&packet).unwrap(), pcm);
    }

    #[test]
    fn test_raw_pcm_rejects_odd_packets() {
        let mut decoder = RawPcmCodec.create_decoder().unwrap();
        assert!(matches!(
            decoder.decode(&[1, 2, 3]),
            Err(CodecError::Backend(_))
        ));
    }
}
