//! Image frames extracted from the pipeline stream

use std::sync::Arc;

/// One complete image pulled out of the multipart byte stream
///
/// Frames are shared between the session and every reader, so the payload
/// lives behind an `Arc` and cloning never copies image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Image bytes (typically a JPEG)
    pub data: Arc<[u8]>,

    /// Frames extracted since the demuxer was last reset, starting at 1
    pub sequence: u64,
}

impl Frame {
    /// Create a new frame
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self { data: data.into(), sequence }
    }

    /// Borrow the image bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
