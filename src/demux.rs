//! Incremental multipart frame extraction
//!
//! The pipeline's multipart muxer writes parts shaped like:
//!
//! ```text
//! --ThisRandomString\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: 4242\r\n
//! \r\n
//! <image bytes>\r\n
//! --ThisRandomString\r\n
//! ...
//! ```
//!
//! [`FrameDemuxer`] consumes that stream in arbitrary chunks and keeps only the
//! newest complete image. A part is complete once the *next* boundary marker
//! has arrived; everything between the header terminator and that marker is
//! the frame (including the CRLF the muxer writes before each marker, which
//! image decoders ignore).
//!
//! Extraction is a three-phase state machine over an index into the pending
//! buffer, so no byte is scanned twice for the same needle:
//!
//! 1. **SeekBoundary** - find the first marker, dropping any garbage prefix
//! 2. **SeekHeaderEnd** - find the blank line that ends the part headers
//! 3. **SeekNextBoundary** - find the marker that closes the body
//!
//! The buffer only ever holds the unconsumed suffix of the stream, so memory
//! is bounded by the distance between two markers (capped by
//! `max_frame_bytes`), not by the length of the stream.

use tracing::{trace, warn};

use crate::types::Frame;

/// Boundary token used by the multipart muxer when none is configured
pub const DEFAULT_BOUNDARY: &str = "ThisRandomString";

/// Sequence that ends the part headers
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Largest body accepted before the demuxer resynchronises
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Advanced,
    Emitted,
    NeedMore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SeekBoundary,
    /// Buffer starts with a marker
    SeekHeaderEnd,
    /// Buffer starts with a marker and its headers; body begins at `body_start`
    SeekNextBoundary { body_start: usize },
}

/// Turns a multipart byte stream into "latest complete frame"
///
/// Frames replace each other; a frame that is never read is simply dropped.
#[derive(Debug)]
pub struct FrameDemuxer {
    marker: Vec<u8>,
    max_frame_bytes: usize,
    buffer: Vec<u8>,
    phase: Phase,
    /// Where the search for the current phase's needle resumes
    scan_from: usize,
    latest: Option<Frame>,
    sequence: u64,
    discarded: u64,
}

impl FrameDemuxer {
    /// Create a demuxer for parts separated by `--{boundary}`
    pub fn new(boundary: &str) -> Self {
        Self::with_limit(boundary, DEFAULT_MAX_FRAME_BYTES)
    }

    /// Create a demuxer that resynchronises once a part exceeds `max_frame_bytes`
    pub fn with_limit(boundary: &str, max_frame_bytes: usize) -> Self {
        let boundary = if boundary.is_empty() { DEFAULT_BOUNDARY } else { boundary };
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());

        Self {
            marker,
            max_frame_bytes: max_frame_bytes.max(1),
            buffer: Vec::new(),
            phase: Phase::SeekBoundary,
            scan_from: 0,
            latest: None,
            sequence: 0,
            discarded: 0,
        }
    }

    /// Append a chunk and extract every frame it completes
    ///
    /// Returns the number of frames extracted by this call. Only the last of
    /// them is retained.
    pub fn append(&mut self, chunk: &[u8]) -> usize {
        self.buffer.extend_from_slice(chunk);

        let mut extracted = 0;
        loop {
            match self.step() {
                Step::Advanced => {}
                Step::Emitted => extracted += 1,
                Step::NeedMore => break,
            }
        }

        trace!(chunk = chunk.len(), extracted, pending = self.buffer.len(), "Demuxed chunk");
        extracted
    }

    fn step(&mut self) -> Step {
        match self.phase {
            Phase::SeekBoundary => match find(&self.buffer, &self.marker, self.scan_from) {
                Some(pos) => {
                    self.consume(pos);
                    self.discarded += pos as u64;
                    self.enter(Phase::SeekHeaderEnd, self.marker.len());
                    Step::Advanced
                }
                None => {
                    // Only a marker straddling the next chunk can still matter
                    let keep = self.marker.len() - 1;
                    if self.buffer.len() > keep {
                        let garbage = self.buffer.len() - keep;
                        self.consume(garbage);
                        self.discarded += garbage as u64;
                    }
                    self.scan_from = 0;
                    Step::NeedMore
                }
            },
            Phase::SeekHeaderEnd => match find(&self.buffer, HEADER_TERMINATOR, self.scan_from) {
                Some(pos) => {
                    let body_start = pos + HEADER_TERMINATOR.len();
                    self.enter(Phase::SeekNextBoundary { body_start }, body_start);
                    Step::Advanced
                }
                None if self.buffer.len() > self.max_frame_bytes => self.resync("header"),
                None => {
                    self.scan_from =
                        resume_at(self.buffer.len(), HEADER_TERMINATOR, self.marker.len());
                    Step::NeedMore
                }
            },
            Phase::SeekNextBoundary { body_start } => {
                match find(&self.buffer, &self.marker, self.scan_from) {
                    Some(pos) => {
                        self.sequence += 1;
                        let body = self.buffer[body_start..pos].to_vec();
                        self.latest = Some(Frame::new(body, self.sequence));
                        // The closing marker opens the next part
                        self.consume(pos);
                        self.enter(Phase::SeekHeaderEnd, self.marker.len());
                        Step::Emitted
                    }
                    None if self.buffer.len() - body_start > self.max_frame_bytes => {
                        self.resync("body")
                    }
                    None => {
                        self.scan_from = resume_at(self.buffer.len(), &self.marker, body_start);
                        Step::NeedMore
                    }
                }
            }
        }
    }

    fn enter(&mut self, phase: Phase, scan_from: usize) {
        self.phase = phase;
        self.scan_from = scan_from;
    }

    fn consume(&mut self, len: usize) {
        self.buffer.drain(..len);
    }

    /// Abandon an oversized part and hunt for the next marker
    fn resync(&mut self, part: &'static str) -> Step {
        warn!(
            part,
            pending = self.buffer.len(),
            limit = self.max_frame_bytes,
            "Multipart part exceeds size limit, resynchronising"
        );
        // Skip the marker that opened this part so it is not matched again
        let skipped = self.marker.len().min(self.buffer.len());
        self.consume(skipped);
        self.discarded += skipped as u64;
        self.enter(Phase::SeekBoundary, 0);
        Step::Advanced
    }

    /// The newest complete frame, if any
    pub fn latest_frame(&self) -> Option<Frame> {
        self.latest.clone()
    }

    /// Drop all buffered bytes and the latest frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.phase = Phase::SeekBoundary;
        self.scan_from = 0;
        self.latest = None;
        self.sequence = 0;
        self.discarded = 0;
    }

    /// Bytes buffered but not yet part of an extracted frame
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Frames extracted since the last reset
    pub fn frames_extracted(&self) -> u64 {
        self.sequence
    }

    /// Bytes thrown away as garbage or oversized parts since the last reset
    pub fn bytes_discarded(&self) -> u64 {
        self.discarded
    }
}

/// Position of `needle` in `haystack` at or after `from`
fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    if needle.is_empty() {
        return Some(from);
    }
    haystack[from..].windows(needle.len()).position(|w| w == needle).map(|pos| pos + from)
}

/// Earliest offset where a `needle` completed by future bytes could begin
fn resume_at(len: usize, needle: &[u8], floor: usize) -> usize {
    len.saturating_sub(needle.len().saturating_sub(1)).max(floor)
}
