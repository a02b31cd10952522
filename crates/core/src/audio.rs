//! PCM audio frame contract shared by capture, VOX analysis and the codecs.
//!
//! Every component works on exactly one 20 ms frame of 16-bit signed
//! little-endian mono audio at 16 kHz. The `AudioFrame` type enforces that
//! length at construction so partial frames never reach an encoder.

use std::fmt;

pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: usize = 1;
pub const FRAME_DURATION_MS: u32 = 20;
/// 16000 samples/s * 0.020 s = 320 samples per frame.
pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE / (1000 / FRAME_DURATION_MS)) as usize;
/// 320 samples * 1 channel * 2 bytes = 640 bytes.
pub const FRAME_SIZE_BYTES: usize = SAMPLES_PER_FRAME * CHANNELS * 2;

/// Returned when a buffer does not hold exactly one frame of PCM.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected a {expected}-byte PCM frame, got {actual} bytes")]
pub struct FrameSizeError {
    pub expected: usize,
    pub actual: usize,
}

/// One owned 20 ms frame of PCM16 audio.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioFrame {
    bytes: Box<[u8]>,
}

impl AudioFrame {
    /// Copies `pcm` into a new frame. Fails unless `pcm` is exactly
    /// [`FRAME_SIZE_BYTES`] long.
    pub fn from_bytes(pcm: &[u8]) -> Result<Self, FrameSizeError> {
        if pcm.len() != FRAME_SIZE_BYTES {
            return Err(FrameSizeError {
                expected: FRAME_SIZE_BYTES,
                actual: pcm.len(),
            });
        }
        Ok(Self {
            bytes: pcm.to_vec().into_boxed_slice(),
        })
    }

    /// Builds a frame from exactly [`SAMPLES_PER_FRAME`] samples.
    pub fn from_samples(samples: &[i16]) -> Result<Self, FrameSizeError> {
        if samples.len() != SAMPLES_PER_FRAME {
            return Err(FrameSizeError {
                expected: FRAME_SIZE_BYTES,
                actual: samples.len() * 2,
            });
        }
        Ok(Self {
            bytes: samples_to_le_bytes(samples).into_boxed_slice(),
        })
    }

    /// A frame of digital silence.
    pub fn silence() -> Self {
        Self {
            bytes: vec![0u8; FRAME_SIZE_BYTES].into_boxed_slice(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn samples(&self) -> Vec<i16> {
        samples_from_le_bytes(&self.bytes)
    }

    /// Root-mean-square loudness of this frame, normalized to `[0, 1]`.
    pub fn rms(&self) -> f64 {
        calculate_rms(&self.bytes)
    }
}

impl fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioFrame")
            .field("len", &self.bytes.len())
            .field("rms", &self.rms())
            .finish()
    }
}

impl TryFrom<&[u8]> for AudioFrame {
    type Error = FrameSizeError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(value)
    }
}

/// Computes the RMS level of little-endian PCM16 bytes.
///
/// The mean of the squared samples is square-rooted and divided by the
/// largest sample magnitude (32768), which maps any input into `[0, 1]`.
/// A trailing odd byte is ignored; an empty buffer measures as silence.
pub fn calculate_rms(pcm16_le: &[u8]) -> f64 {
    let sample_count = pcm16_le.len() / 2;
    if sample_count == 0 {
        return 0.0;
    }
    let sum_of_squares: i64 = pcm16_le
        .chunks_exact(2)
        .map(|chunk| {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as i64;
            sample * sample
        })
        .sum();
    let mean_square = sum_of_squares as f64 / sample_count as f64;
    mean_square.sqrt() / 32768.0
}

/// Interprets little-endian byte pairs as i16 samples. Incomplete trailing
/// bytes are skipped.
pub fn samples_from_le_bytes(pcm16_le: &[u8]) -> Vec<i16> {
    pcm16_le
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn constant_frame(value: i16) -> AudioFrame {
        AudioFrame::from_samples(&[value; SAMPLES_PER_FRAME]).unwrap()
    }

    #[test]
    fn test_frame_constants() {
        assert_eq!(SAMPLES_PER_FRAME, 320);
        assert_eq!(FRAME_SIZE_BYTES, 640);
    }

    #[test]
    fn test_frame_rejects_wrong_length() {
        let err = AudioFrame::from_bytes(&[0u8; 639]).unwrap_err();
        assert_eq!(err.expected, 640);
        assert_eq!(err.actual, 639);

        assert!(AudioFrame::from_bytes(&[]).is_err());
        assert!(AudioFrame::from_bytes(&[0u8; 1280]).is_err());
        assert!(AudioFrame::from_samples(&[0i16; 10]).is_err());
    }

    #[test]
    fn test_frame_is_a_defensive_copy() {
        let mut source = vec![1u8; FRAME_SIZE_BYTES];
        let frame = AudioFrame::try_from(source.as_slice()).unwrap();
        source[0] = 99;
        assert_eq!(frame.as_bytes()[0], 1);
    }

    #[test]
    fn test_rms_of_silence_is_zero() {
        assert_abs_diff_eq!(AudioFrame::silence().rms(), 0.0);
        assert_abs_diff_eq!(calculate_rms(&[]), 0.0);
    }

    #[test]
    fn test_rms_of_constant_signal() {
        // A constant signal's RMS equals its magnitude.
        assert_abs_diff_eq!(constant_frame(16384).rms(), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(constant_frame(-16384).rms(), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(constant_frame(i16::MIN).rms(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rms_of_square_wave() {
        let samples: Vec<i16> = (0..SAMPLES_PER_FRAME)
            .map(|i| if i % 2 == 0 { 3277 } else { -3277 })
            .collect();
        let frame = AudioFrame::from_samples(&samples).unwrap();
        assert_abs_diff_eq!(frame.rms(), 3277.0 / 32768.0, epsilon = 1e-9);
    }

    #[test]
    fn test_sample_byte_conversions() {
        let samples = vec![256i16, -256, 0, i16::MAX, i16::MIN];
        let bytes = samples_to_le_bytes(&samples);
        assert_eq!(&bytes[..4], &[0x00, 0x01, 0x00, 0xFF]);
        assert_eq!(samples_from_le_bytes(&bytes), samples);

        // Odd trailing byte is dropped.
        assert_eq!(samples_from_le_bytes(&[0x00, 0x40, 0x01]), vec![16384]);
    }
}
