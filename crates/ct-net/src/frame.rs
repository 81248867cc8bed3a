//! ---
//! ct_section: "05-networking-external-interfaces"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Network connectivity for table applications."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::NetError;

/// Size of the little-endian length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(payload);
    frame.freeze()
}

/// Incremental decoder tolerating fragmented and coalesced reads.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    /// Decoder rejecting frames longer than `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_bytes,
        }
    }

    /// Buffer to read socket data into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Append raw bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, if buffered. Zero-length frames are skipped.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, NetError> {
        loop {
            if self.buffer.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let length = (&self.buffer[..FRAME_HEADER_LEN]).get_u32_le() as usize;
            if length > self.max_frame_bytes {
                return Err(NetError::FrameTooLarge {
                    length,
                    limit: self.max_frame_bytes,
                });
            }
            if length == 0 {
                self.buffer.advance(FRAME_HEADER_LEN);
                continue;
            }
            if self.buffer.len() < FRAME_HEADER_LEN + length {
                self.buffer.reserve(FRAME_HEADER_LEN + length - self.buffer.len());
                return Ok(None);
            }
            self.buffer.advance(FRAME_HEADER_LEN);
            return Ok(Some(self.buffer.split_to(length).freeze()));
        }
    }
}
