//! Small helpers for assembling memcached binary protocol requests.

use bytes::{BufMut, Bytes, BytesMut};

use crate::header::FrameHeader;
use crate::opcode::Opcode;

/// DCP_OPEN flags (extras field 2, big-endian u32).
pub const DCP_OPEN_FLAG_PRODUCER: u32 = 0x01;
pub const DCP_OPEN_FLAG_INCLUDE_XATTRS: u32 = 0x04;
pub const DCP_OPEN_FLAG_NO_VALUE: u32 = 0x08;
pub const DCP_OPEN_FLAG_COLLECTIONS: u32 = 0x800;

/// Assemble a complete request frame: header, key, extras, value, in wire order.
///
/// `extras` and `value` are written back to back; the caller is responsible
/// for the header's `extras_len`/`key_len`/`total_body_len` matching the
/// slices passed in.
pub fn build_request(header: FrameHeader, key: &[u8], extras: &[u8], value: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(24 + extras.len() + key.len() + value.len());
    header.encode(&mut out);
    out.extend_from_slice(extras);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out.freeze()
}

/// Build a DCP_OPEN request body (no key; extras = seqno(4, reserved) + flags(4)).
pub fn build_dcp_open(opaque: u32, connection_name: &str, flags: u32) -> Bytes {
    let mut extras = BytesMut::with_capacity(8);
    extras.put_u32(0); // reserved seqno field
    extras.put_u32(flags);

    let key = connection_name.as_bytes();
    let header = FrameHeader::request(Opcode::DcpOpen, 0, opaque)
        .with_extras_len(extras.len() as u8)
        .with_key_len(key.len() as u16)
        .with_total_body_len((extras.len() + key.len()) as u32);

    build_request(header, key, &extras, &[])
}

/// Build a DCP_CONTROL request body: key is the option name, value is its string value.
pub fn build_dcp_control(opaque: u32, name: &str, value: &str) -> Bytes {
    let key = name.as_bytes();
    let val = value.as_bytes();
    let header = FrameHeader::request(Opcode::DcpControl, 0, opaque)
        .with_key_len(key.len() as u16)
        .with_total_body_len((key.len() + val.len()) as u32);

    build_request(header, key, &[], val)
}

/// Build a DCP_STREAM_REQ request body. Extras layout:
/// flags(4) + reserved(4) + start_seqno(8) + end_seqno(8) + vbuuid(8) +
/// snap_start(8) + snap_end(8) = 48 bytes, optionally followed by a JSON
/// value carrying collection filters when collections are enabled.
#[allow(clippy::too_many_arguments)]
pub fn build_dcp_stream_req(
    opaque: u32,
    vbid: u16,
    start_seqno: u64,
    end_seqno: u64,
    vbuuid: u64,
    snap_start: u64,
    snap_end: u64,
    value: &[u8],
) -> Bytes {
    let mut extras = BytesMut::with_capacity(48);
    extras.put_u32(0); // flags
    extras.put_u32(0); // reserved
    extras.put_u64(start_seqno);
    extras.put_u64(end_seqno);
    extras.put_u64(vbuuid);
    extras.put_u64(snap_start);
    extras.put_u64(snap_end);

    let header = FrameHeader::request(Opcode::DcpStreamReq, vbid, opaque)
        .with_extras_len(extras.len() as u8)
        .with_total_body_len((extras.len() + value.len()) as u32);

    build_request(header, &[], &extras, value)
}

/// Build a DCP_BUFFER_ACK request body. Extras: bytes_acked(4).
pub fn build_buffer_ack(opaque: u32, vbid: u16, bytes_acked: u32) -> Bytes {
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(bytes_acked);

    let header = FrameHeader::request(Opcode::DcpBufferAck, vbid, opaque)
        .with_extras_len(extras.len() as u8)
        .with_total_body_len(extras.len() as u32);

    build_request(header, &[], &extras, &[])
}

/// Build a DCP_CLOSE_STREAM / DCP_GET_FAILOVER_LOG / GET_ALL_VB_SEQNOS style
/// request with no extras or value, keyed only by the vbucket id in the header.
pub fn build_simple_request(opcode: Opcode, opaque: u32, vbid: u16) -> Bytes {
    let header = FrameHeader::request(opcode, vbid, opaque);
    build_request(header, &[], &[], &[])
}

/// Build a DCP_NOOP response echoing the server's opaque, with success status.
pub fn build_noop_response(opaque: u32) -> Bytes {
    let mut buf = BytesMut::new();
    let header = FrameHeader {
        magic: crate::opcode::Magic::Response,
        opcode: Opcode::DcpNoop,
        key_len: 0,
        extras_len: 0,
        data_type: 0,
        status_or_vbucket: 0,
        total_body_len: 0,
        opaque,
        cas: 0,
    };
    header.encode(&mut buf);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::FrameHeader;

    #[test]
    fn dcp_open_sets_producer_flag() {
        let body = build_dcp_open(1, "conn-1", DCP_OPEN_FLAG_PRODUCER);
        let header = FrameHeader::decode(&body).unwrap();
        assert_eq!(header.opcode, Opcode::DcpOpen);
        assert_eq!(header.key_len as usize, "conn-1".len());
        let extras = &body[24..24 + header.extras_len as usize];
        let flags = u32::from_be_bytes(extras[4..8].try_into().unwrap());
        assert_eq!(flags, DCP_OPEN_FLAG_PRODUCER);
    }

    #[test]
    fn stream_req_encodes_extras_in_order() {
        let body = build_dcp_stream_req(9, 3, 5, u64::MAX, 111, 5, 20, &[]);
        let header = FrameHeader::decode(&body).unwrap();
        assert_eq!(header.vbucket(), 3);
        assert_eq!(header.extras_len, 48);
        let extras = &body[24..24 + 48];
        let start = u64::from_be_bytes(extras[8..16].try_into().unwrap());
        assert_eq!(start, 5);
    }

    #[test]
    fn buffer_ack_carries_byte_count() {
        let body = build_buffer_ack(1, 0, 600);
        let header = FrameHeader::decode(&body).unwrap();
        let extras = &body[24..24 + 4];
        assert_eq!(u32::from_be_bytes(extras.try_into().unwrap()), 600);
        assert_eq!(header.opcode, Opcode::DcpBufferAck);
    }
}
