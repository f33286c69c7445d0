//! Frame extraction from a `multipart/x-mixed-replace` JPEG stream.
//!
//! Part headers and boundaries are skipped; frames are delimited by the JPEG
//! start-of-image and end-of-image markers, so the splitter does not depend on
//! the boundary name or on `Content-Length` headers being present.

use bytes::{Bytes, BytesMut};
use log::warn;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on buffered bytes while waiting for a frame to complete.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

#[derive(Debug, Default)]
pub struct MjpegSplitter {
    buffer: BytesMut,
}

impl MjpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of the HTTP body and returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buffer, &SOI, 0) else {
                // keep a trailing 0xFF, it may begin the next marker
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                let drop = self.buffer.len() - keep;
                let _ = self.buffer.split_to(drop);
                break;
            };
            let Some(end) = find(&self.buffer, &EOI, start + 2) else {
                let _ = self.buffer.split_to(start);
                break;
            };

            let _ = self.buffer.split_to(start);
            frames.push(self.buffer.split_to(end + 2 - start).freeze());
        }

        if self.buffer.len() > MAX_FRAME_BYTES {
            warn!("Discarding {} bytes of unterminated video frame", self.buffer.len());
            self.buffer.clear();
        }

        frames
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
