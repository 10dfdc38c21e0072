//! Stateful decoder turning a byte stream into memcached binary protocol frames.

use bytes::{Bytes, BytesMut};
use dcp_core::buffer::SegmentedBuffer;
use thiserror::Error;

use crate::config::{HEADER_LEN, STAGING_BUF_INITIAL_CAP};
use crate::header::FrameHeader;

/// Errors the codec can raise. Protocol status codes (NOT_MY_VBUCKET,
/// ROLLBACK, ...) are not errors here — they decode into a normal `Frame`
/// and are interpreted by the channel's demultiplexer.
#[derive(Debug, Error)]
pub enum McbpError {
    #[error("unrecognised magic byte {0:#x}")]
    BadMagic(u8),

    #[error("frame body of {0} bytes exceeds the configured maximum")]
    BodyTooLarge(u32),
}

pub type Result<T> = std::result::Result<T, McbpError>;

/// A fully decoded frame: header plus its raw body bytes (key + extras + value,
/// in that order, undivided — callers that need to split them use
/// `header.key_len` / `header.extras_len`).
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

/// The maximum body length the decoder will accept before erroring out.
/// DCP mutation bodies are rarely near this; it exists to bound memory use
/// against a corrupt or hostile peer.
pub const MAX_BODY_LEN: u32 = 64 * 1024 * 1024;

/// Stateful memcached binary protocol decoder.
///
/// Fast path: an entire frame is already buffered, body bytes are sliced out
/// of `SegmentedBuffer` with no copy. Slow path: the body spans more than one
/// network read, so bytes are reassembled into a staging `BytesMut` until
/// complete.
pub struct McbpDecoder {
    pending_header: Option<FrameHeader>,
    staging: BytesMut,
}

impl Default for McbpDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl McbpDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending_header: None,
            staging: BytesMut::with_capacity(STAGING_BUF_INITIAL_CAP),
        }
    }

    /// True while reassembling a fragmented body.
    #[must_use]
    pub const fn is_reassembling(&self) -> bool {
        self.pending_header.is_some()
    }

    /// Decode a single frame from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; does not consume
    /// partial input from `src` beyond what it has already staged.
    pub fn decode(&mut self, src: &mut SegmentedBuffer) -> Result<Option<Frame>> {
        if let Some(header) = self.pending_header {
            let needed = header.total_body_len as usize - self.staging.len();
            let take = needed.min(src.len());
            if let Some(bytes) = src.take_bytes(take) {
                self.staging.extend_from_slice(&bytes);
            }

            if self.staging.len() < header.total_body_len as usize {
                return Ok(None);
            }

            let body = self.staging.split().freeze();
            self.pending_header = None;
            return Ok(Some(Frame { header, body }));
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut raw_header = [0u8; HEADER_LEN];
        if !src.copy_prefix(HEADER_LEN, &mut raw_header) {
            return Ok(None);
        }

        let header = FrameHeader::decode(&raw_header)
            .ok_or(McbpError::BadMagic(raw_header[0]))?;

        if header.total_body_len > MAX_BODY_LEN {
            return Err(McbpError::BodyTooLarge(header.total_body_len));
        }

        let total_len = HEADER_LEN + header.total_body_len as usize;

        if src.len() >= total_len {
            src.advance(HEADER_LEN);
            let body = src
                .take_bytes(header.total_body_len as usize)
                .expect("len check ensures body is available");
            return Ok(Some(Frame { header, body }));
        }

        src.advance(HEADER_LEN);
        self.pending_header = Some(header);
        self.staging.clear();
        self.staging.reserve(header.total_body_len as usize);

        let available = src.len().min(header.total_body_len as usize);
        if let Some(bytes) = src.take_bytes(available) {
            self.staging.extend_from_slice(&bytes);
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    fn encode_frame(header: FrameHeader, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(body);
        buf.freeze()
    }

    #[test]
    fn decodes_whole_frame_in_one_shot() {
        let header = FrameHeader::request(Opcode::DcpStreamReq, 3, 1).with_total_body_len(5);
        let wire = encode_frame(header, b"hello");

        let mut src = SegmentedBuffer::new();
        src.push(wire);

        let mut decoder = McbpDecoder::new();
        let frame = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.header.vbucket(), 3);
        assert_eq!(&frame.body[..], b"hello");
        assert!(src.is_empty());
    }

    #[test]
    fn decodes_fragmented_body_across_reads() {
        let header = FrameHeader::request(Opcode::DcpMutation, 0, 0).with_total_body_len(10);
        let wire = encode_frame(header, b"0123456789");

        let mut decoder = McbpDecoder::new();
        let mut src = SegmentedBuffer::new();

        src.push(wire.slice(0..30));
        assert!(decoder.decode(&mut src).unwrap().is_none());
        assert!(decoder.is_reassembling());

        src.push(wire.slice(30..));
        let frame = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(&frame.body[..], b"0123456789");
        assert!(!decoder.is_reassembling());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut src = SegmentedBuffer::new();
        let mut bogus = vec![0xFF; HEADER_LEN];
        bogus[0] = 0x42;
        src.push(Bytes::from(bogus));

        let mut decoder = McbpDecoder::new();
        assert!(matches!(decoder.decode(&mut src), Err(McbpError::BadMagic(0x42))));
    }

    #[test]
    fn incomplete_header_requests_more_data() {
        let mut src = SegmentedBuffer::new();
        src.push(Bytes::from_static(&[0x81, 0x50]));
        let mut decoder = McbpDecoder::new();
        assert!(decoder.decode(&mut src).unwrap().is_none());
    }
}
