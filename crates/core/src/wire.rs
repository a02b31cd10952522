//! Binary frame layout shared by audio packets and image uploads.
//!
//! ```text
//! +------+----------------+----------------------+-----------
//! | type | id (u32, BE)   | seq / kind (u32, BE) | payload...
//! +------+----------------+----------------------+-----------
//!    1          4                   4
//! ```
//!
//! For audio (`0x01`) the id is the stream id and the second field the packet
//! id. For images (`0x02`) the id is the server-assigned image id and the
//! second field is the image kind (1 = full, 2 = thumbnail).

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 9;

const TYPE_AUDIO: u8 = 0x01;
const TYPE_IMAGE: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("binary frame is {len} bytes, shorter than the 9-byte header")]
    Truncated { len: usize },
    #[error("unknown image kind {0}")]
    UnknownImageKind(u32),
}

/// Discriminates the two payload families carried in binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Audio,
    Image,
    /// A type byte this client does not understand. Kept so the caller can
    /// log and drop it.
    Other(u8),
}

impl FrameType {
    fn from_byte(byte: u8) -> Self {
        match byte {
            TYPE_AUDIO => FrameType::Audio,
            TYPE_IMAGE => FrameType::Image,
            other => FrameType::Other(other),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            FrameType::Audio => TYPE_AUDIO,
            FrameType::Image => TYPE_IMAGE,
            FrameType::Other(byte) => byte,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Full,
    Thumbnail,
}

impl ImageKind {
    pub fn code(self) -> u32 {
        match self {
            ImageKind::Full => 1,
            ImageKind::Thumbnail => 2,
        }
    }
}

impl TryFrom<u32> for ImageKind {
    type Error = WireError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ImageKind::Full),
            2 => Ok(ImageKind::Thumbnail),
            other => Err(WireError::UnknownImageKind(other)),
        }
    }
}

/// A decoded (or to-be-encoded) binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    pub frame_type: FrameType,
    /// Stream id for audio, image id for images.
    pub id: u32,
    /// Packet id for audio, image kind code for images.
    pub sequence: u32,
    pub payload: Bytes,
}

impl BinaryFrame {
    pub fn audio(stream_id: u32, packet_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type: FrameType::Audio,
            id: stream_id,
            sequence: packet_id,
            payload: payload.into(),
        }
    }

    pub fn image(image_id: u32, kind: ImageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type: FrameType::Image,
            id: image_id,
            sequence: kind.code(),
            payload: payload.into(),
        }
    }

    /// Parses a frame. Anything shorter than the header is rejected.
    pub fn decode(mut data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::Truncated { len: data.len() });
        }
        let frame_type = FrameType::from_byte(data.get_u8());
        let id = data.get_u32();
        let sequence = data.get_u32();
        Ok(Self {
            frame_type,
            id,
            sequence,
            payload: Bytes::copy_from_slice(data),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.frame_type.to_byte());
        buf.put_u32(self.id);
        buf.put_u32(self.sequence);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// The image kind, if this is an image frame with a known kind code.
    pub fn image_kind(&self) -> Option<ImageKind> {
        match self.frame_type {
            FrameType::Image => ImageKind::try_from(self.sequence).ok(),
            _ => None,
        }
    }
}

/// Builds the frames that upload one image payload.
///
/// With `chunk_size` unset the whole payload travels in a single frame. When
/// set, the payload is split into consecutive frames that share the same
/// header, each carrying at most `chunk_size` bytes.
pub fn image_frames(
    image_id: u32,
    kind: ImageKind,
    data: &Bytes,
    chunk_size: Option<usize>,
) -> Vec<BinaryFrame> {
    match chunk_size {
        Some(size) if size > 0 && data.len() > size => (0..data.len())
            .step_by(size)
            .map(|start| {
                let end = (start + size).min(data.len());
                BinaryFrame::image(image_id, kind, data.slice(start..end))
            })
            .collect(),
        _ => vec![BinaryFrame::image(image_id, kind, data.clone())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_frame_layout() {
        let frame = BinaryFrame::audio(7, 3, vec![0xAA, 0xBB]);
        let encoded = frame.encode();
        assert_eq!(
            encoded.as_ref(),
            &[0x01, 0, 0, 0, 7, 0, 0, 0, 3, 0xAA, 0xBB]
        );

        let decoded = BinaryFrame::decode(&encoded).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Audio);
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.sequence, 3);
        assert_eq!(decoded.payload.as_ref(), &[0xAA, 0xBB]);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_multibyte_fields_are_big_endian() {
        let frame = BinaryFrame::image(0x0102_0304, ImageKind::Thumbnail, Vec::new());
        let encoded = frame.encode();
        assert_eq!(encoded.as_ref(), &[0x02, 1, 2, 3, 4, 0, 0, 0, 2]);
        assert_eq!(
            BinaryFrame::decode(&encoded).unwrap().image_kind(),
            Some(ImageKind::Thumbnail)
        );
    }

    #[test]
    fn test_undersized_frame_is_rejected() {
        let err = BinaryFrame::decode(&[0x01, 0, 0, 0, 7]).unwrap_err();
        assert_eq!(err, WireError::Truncated { len: 5 });
        assert!(BinaryFrame::decode(&[]).is_err());
    }

    #[test]
    fn test_header_only_frame_has_empty_payload() {
        let decoded = BinaryFrame::decode(&[0x01, 0, 0, 0, 1, 0, 0, 0, 0]).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_unknown_type_byte_is_preserved() {
        let decoded = BinaryFrame::decode(&[0x7F, 0, 0, 0, 1, 0, 0, 0, 2, 9]).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Other(0x7F));
        assert_eq!(decoded.encode()[0], 0x7F);
        assert_eq!(decoded.image_kind(), None);
    }

    #[test]
    fn test_image_kind_codes() {
        assert_eq!(ImageKind::Full.code(), 1);
        assert_eq!(ImageKind::Thumbnail.code(), 2);
        assert_eq!(ImageKind::try_from(3), Err(WireError::UnknownImageKind(3)));
    }

    #[test]
    fn test_image_frames_unchunked_by_default() {
        let data = Bytes::from(vec![5u8; 40_000]);
        let frames = image_frames(9, ImageKind::Full, &data, None);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), 40_000);
    }

    #[test]
    fn test_image_frames_chunked() {
        let data = Bytes::from((0..10u8).collect::<Vec<_>>());
        let frames = image_frames(9, ImageKind::Full, &data, Some(4));
        let sizes: Vec<usize> = frames.iter().map(|f| f.payload.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(frames.iter().all(|f| f.id == 9 && f.sequence == 1));

        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, data.to_vec());
    }
}
