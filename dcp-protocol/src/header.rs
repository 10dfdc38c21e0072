//! The 24-byte memcached binary protocol header.

use crate::opcode::{Magic, Opcode};
use bytes::{Buf, BufMut, BytesMut};

use crate::config::HEADER_LEN;

/// Decoded memcached binary protocol header.
///
/// `status_or_vbucket` is the vbucket id on a request and the status code on
/// a response — the wire layout aliases the two fields, so this struct keeps
/// them as a single raw `u16` and lets callers interpret it via
/// `Magic::is_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: Magic,
    pub opcode: Opcode,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub status_or_vbucket: u16,
    pub total_body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl FrameHeader {
    /// Build a request header. `vbucket` is written into the
    /// status-or-vbucket slot.
    #[must_use]
    pub const fn request(opcode: Opcode, vbucket: u16, opaque: u32) -> Self {
        Self {
            magic: Magic::Request,
            opcode,
            key_len: 0,
            extras_len: 0,
            data_type: 0,
            status_or_vbucket: vbucket,
            total_body_len: 0,
            opaque,
            cas: 0,
        }
    }

    #[must_use]
    pub const fn with_key_len(mut self, key_len: u16) -> Self {
        self.key_len = key_len;
        self
    }

    #[must_use]
    pub const fn with_extras_len(mut self, extras_len: u8) -> Self {
        self.extras_len = extras_len;
        self
    }

    #[must_use]
    pub const fn with_total_body_len(mut self, total_body_len: u32) -> Self {
        self.total_body_len = total_body_len;
        self
    }

    #[must_use]
    pub const fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// The status code, valid only when `magic.is_response()`.
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status_or_vbucket
    }

    /// The vbucket id, valid only on a request header.
    #[must_use]
    pub const fn vbucket(&self) -> u16 {
        self.status_or_vbucket
    }

    /// Total body length (key + extras + value).
    #[must_use]
    pub const fn value_len(&self) -> usize {
        self.total_body_len as usize - self.key_len as usize - self.extras_len as usize
    }

    /// Encode the 24-byte header, big-endian, into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u8(self.magic.as_u8());
        buf.put_u8(self.opcode.as_u8());
        buf.put_u16(self.key_len);
        buf.put_u8(self.extras_len);
        buf.put_u8(self.data_type);
        buf.put_u16(self.status_or_vbucket);
        buf.put_u32(self.total_body_len);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }

    /// Decode a header from an exactly-`HEADER_LEN`-byte slice.
    pub fn decode(mut src: &[u8]) -> Option<Self> {
        if src.len() < HEADER_LEN {
            return None;
        }
        let magic = Magic::try_from_u8(src.get_u8())?;
        let opcode = Opcode::from(src.get_u8());
        let key_len = src.get_u16();
        let extras_len = src.get_u8();
        let data_type = src.get_u8();
        let status_or_vbucket = src.get_u16();
        let total_body_len = src.get_u32();
        let opaque = src.get_u32();
        let cas = src.get_u64();

        Some(Self {
            magic,
            opcode,
            key_len,
            extras_len,
            data_type,
            status_or_vbucket,
            total_body_len,
            opaque,
            cas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_request_header() {
        let hdr = FrameHeader::request(Opcode::DcpStreamReq, 7, 42)
            .with_extras_len(48)
            .with_total_body_len(48);

        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        let decoded = FrameHeader::decode(&buf).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(decoded.vbucket(), 7);
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(FrameHeader::decode(&[0u8; 10]).is_none());
    }

    #[test]
    fn value_len_subtracts_key_and_extras() {
        let hdr = FrameHeader::request(Opcode::DcpMutation, 0, 0)
            .with_key_len(3)
            .with_extras_len(31)
            .with_total_body_len(3 + 31 + 100);
        assert_eq!(hdr.value_len(), 100);
    }
}
