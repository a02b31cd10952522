use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("no image preparer is configured")]
    NoPreparer,
    #[error("image could not be prepared: {0}")]
    Invalid(String),
}

/// A JPEG ready for upload: dimensions, a thumbnail and the full image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub width: u32,
    pub height: u32,
    pub thumbnail: Bytes,
    pub full: Bytes,
}

/// Measures a JPEG and renders its thumbnail. Image decoding lives outside
/// this crate.
pub trait ImagePreparer: Send + Sync {
    fn prepare(&self, jpeg: &[u8]) -> Result<PreparedImage, ImageError>;
}
