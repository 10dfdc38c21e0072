//! Sans-IO demultiplexer for a single DCP channel.
//!
//! Bytes go in via [`ChannelSession::on_bytes`], typed events come out. No
//! socket, no executor, no timers — those live one layer up in the channel
//! that owns this session. Keeping the demux logic IO-free is what lets it
//! be driven byte-for-byte in tests without a real TCP connection.
//!
//! Unlike ZMTP's greeting/handshake/active progression, a DCP connection has
//! no binary handshake of its own — SASL auth and DCP_OPEN are just ordinary
//! request/response pairs over the same memcached framing used for
//! everything else. So there is only one state here; `register_pending` is
//! how the channel tells this demultiplexer what a response means.

use std::collections::HashMap;

use bytes::Bytes;
use dcp_core::buffer::SegmentedBuffer;

use crate::codec::{Frame, McbpDecoder, McbpError};
use crate::header::FrameHeader;
use crate::message::{
    self, DataFrame, FailoverLogEntry, OsoBoundary, SnapshotMarker, StreamEndReason,
    SystemEventFrame, VbucketSeqno,
};
use crate::opcode::{Opcode, Status};

/// What a request opaque was sent for, so the matching response can be
/// interpreted without re-deriving it from the opcode alone (DCP_STREAM_REQ's
/// response opcode is itself DCP_STREAM_REQ, carrying only a status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    DcpOpen,
    DcpControl,
    StreamReq,
    CloseStream,
    GetFailoverLog,
    GetSeqnos,
    GetCollectionsManifest,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    vbid: u16,
    kind: PendingKind,
}

/// Everything the channel layer needs to react to, emitted as a closed,
/// matchable event instead of a raw frame.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// DCP_OPEN or DCP_CONTROL succeeded.
    ControlAck { opaque: u32 },
    /// A DCP_STREAM_REQ was accepted; the failover log is the response body.
    StreamAccepted { vbid: u16, opaque: u32, failover_log: Vec<FailoverLogEntry> },
    /// A DCP_STREAM_REQ was rejected with ROLLBACK; `seqno` is where to restart from.
    StreamRollback { vbid: u16, opaque: u32, seqno: u64 },
    /// A DCP_STREAM_REQ landed on the wrong node.
    StreamNotMyVbucket { vbid: u16, opaque: u32 },
    /// Any other non-success status on a DCP_STREAM_REQ response.
    StreamRequestFailed { vbid: u16, opaque: u32, status: Status },
    SnapshotMarker { vbid: u16, marker: SnapshotMarker },
    Mutation(DataFrame),
    Deletion(DataFrame),
    Expiration(DataFrame),
    OsoSnapshot { vbid: u16, boundary: OsoBoundary },
    StreamEnd { vbid: u16, reason: StreamEndReason },
    SystemEvent(SystemEventFrame),
    CloseStreamAck { vbid: u16, opaque: u32 },
    FailoverLog { vbid: u16, opaque: u32, entries: Vec<FailoverLogEntry> },
    AllVbSeqnos { opaque: u32, entries: Vec<VbucketSeqno> },
    CollectionsManifest { vbid: u16, opaque: u32, json: Bytes },
    BufferAckAck { vbid: u16 },
    /// Server keepalive; the channel is expected to reply with the same opaque.
    Noop { opaque: u32 },
    /// A frame this session doesn't model or couldn't parse — logged and dropped.
    Unknown { opcode: Opcode, opaque: u32 },
}

/// Demultiplexes a byte stream belonging to one DCP connection into
/// [`ChannelEvent`]s, tracking in-flight opaques so non-push responses can be
/// matched back to the request that caused them.
pub struct ChannelSession {
    decoder: McbpDecoder,
    recv: SegmentedBuffer,
    pending: HashMap<u32, Pending>,
}

impl Default for ChannelSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoder: McbpDecoder::new(),
            recv: SegmentedBuffer::new(),
            pending: HashMap::new(),
        }
    }

    /// Record that `opaque` was just sent as a `kind` request against `vbid`,
    /// so the eventual response can be classified correctly.
    pub fn register_pending(&mut self, opaque: u32, vbid: u16, kind: PendingKind) {
        self.pending.insert(opaque, Pending { vbid, kind });
    }

    /// Feed newly-read bytes in; drain as many complete frames as are
    /// buffered into typed events.
    pub fn on_bytes(&mut self, src: Bytes) -> Result<Vec<ChannelEvent>, McbpError> {
        self.recv.push(src);

        let mut events = Vec::new();
        loop {
            match self.decoder.decode(&mut self.recv)? {
                Some(frame) => events.push(self.on_frame(frame)),
                None => break,
            }
        }
        Ok(events)
    }

    fn on_frame(&mut self, frame: Frame) -> ChannelEvent {
        let header = frame.header;
        match header.opcode {
            Opcode::DcpOpen | Opcode::DcpControl => {
                self.pending.remove(&header.opaque);
                ChannelEvent::ControlAck { opaque: header.opaque }
            }
            Opcode::DcpStreamReq => self.on_stream_req_response(header, &frame.body),
            Opcode::DcpSnapshotMarker => {
                let extras = &frame.body[..header.extras_len as usize];
                match message::parse_snapshot_marker(extras) {
                    Ok(marker) => ChannelEvent::SnapshotMarker { vbid: header.vbucket(), marker },
                    Err(_) => unknown(header),
                }
            }
            Opcode::DcpMutation => match message::parse_mutation(&header, &frame.body) {
                Ok(data) => ChannelEvent::Mutation(data),
                Err(_) => unknown(header),
            },
            Opcode::DcpDeletion => match message::parse_deletion(&header, &frame.body) {
                Ok(data) => ChannelEvent::Deletion(data),
                Err(_) => unknown(header),
            },
            Opcode::DcpExpiration => match message::parse_expiration(&header, &frame.body) {
                Ok(data) => ChannelEvent::Expiration(data),
                Err(_) => unknown(header),
            },
            Opcode::DcpOsoSnapshot => {
                let extras = &frame.body[..header.extras_len as usize];
                match message::parse_oso_snapshot(extras) {
                    Ok(boundary) => ChannelEvent::OsoSnapshot { vbid: header.vbucket(), boundary },
                    Err(_) => unknown(header),
                }
            }
            Opcode::DcpStreamEnd => {
                let extras = &frame.body[..header.extras_len as usize];
                let reason = message::parse_stream_end(extras)
                    .unwrap_or(StreamEndReason::Unknown(u32::MAX));
                ChannelEvent::StreamEnd { vbid: header.vbucket(), reason }
            }
            Opcode::DcpSystemEvent => match message::parse_system_event(&header, &frame.body) {
                Ok(ev) => ChannelEvent::SystemEvent(ev),
                Err(_) => unknown(header),
            },
            Opcode::DcpCloseStream => {
                self.pending.remove(&header.opaque);
                ChannelEvent::CloseStreamAck { vbid: header.vbucket(), opaque: header.opaque }
            }
            Opcode::DcpGetFailoverLog => {
                let pending = self.pending.remove(&header.opaque);
                let vbid = pending.map_or_else(|| header.vbucket(), |p| p.vbid);
                match message::parse_failover_log(&frame.body) {
                    Ok(entries) => ChannelEvent::FailoverLog { vbid, opaque: header.opaque, entries },
                    Err(_) => unknown(header),
                }
            }
            Opcode::GetAllVbSeqnos => match message::parse_all_vb_seqnos(&frame.body) {
                Ok(entries) => ChannelEvent::AllVbSeqnos { opaque: header.opaque, entries },
                Err(_) => unknown(header),
            },
            Opcode::GetCollectionsManifest => {
                let pending = self.pending.remove(&header.opaque);
                let vbid = pending.map_or_else(|| header.vbucket(), |p| p.vbid);
                ChannelEvent::CollectionsManifest { vbid, opaque: header.opaque, json: frame.body }
            }
            Opcode::DcpBufferAck => ChannelEvent::BufferAckAck { vbid: header.vbucket() },
            Opcode::DcpNoop => {
                if header.magic.is_response() {
                    unknown(header)
                } else {
                    ChannelEvent::Noop { opaque: header.opaque }
                }
            }
            other => ChannelEvent::Unknown { opcode: other, opaque: header.opaque },
        }
    }

    fn on_stream_req_response(&mut self, header: FrameHeader, body: &Bytes) -> ChannelEvent {
        let pending = self.pending.remove(&header.opaque);
        let vbid = pending.map_or_else(|| header.vbucket(), |p| p.vbid);
        let status = Status::from(header.status());

        match status {
            Status::Success => match message::parse_failover_log(body) {
                Ok(failover_log) => {
                    ChannelEvent::StreamAccepted { vbid, opaque: header.opaque, failover_log }
                }
                Err(_) => unknown(header),
            },
            Status::Rollback => {
                let seqno = if body.len() >= 8 {
                    u64::from_be_bytes(body[..8].try_into().expect("checked length"))
                } else {
                    0
                };
                ChannelEvent::StreamRollback { vbid, opaque: header.opaque, seqno }
            }
            Status::NotMyVbucket => ChannelEvent::StreamNotMyVbucket { vbid, opaque: header.opaque },
            other => ChannelEvent::StreamRequestFailed { vbid, opaque: header.opaque, status: other },
        }
    }
}

fn unknown(header: FrameHeader) -> ChannelEvent {
    ChannelEvent::Unknown { opcode: header.opcode, opaque: header.opaque }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Magic;
    use crate::utils::{build_dcp_stream_req, build_noop_response, build_simple_request};
    use bytes::{BufMut, BytesMut};

    fn encode_response(mut header: FrameHeader, status: u16, body: &[u8]) -> Bytes {
        header.magic = Magic::Response;
        header.status_or_vbucket = status;
        header.total_body_len = body.len() as u32;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(body);
        buf.freeze()
    }

    #[test]
    fn stream_req_success_carries_failover_log() {
        let mut session = ChannelSession::new();
        session.register_pending(7, 3, PendingKind::StreamReq);

        let mut body = BytesMut::new();
        body.put_u64(999);
        body.put_u64(42);

        let header = FrameHeader::request(Opcode::DcpStreamReq, 0, 7);
        let wire = encode_response(header, Status::Success.as_u16(), &body);

        let events = session.on_bytes(wire).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ChannelEvent::StreamAccepted { vbid, failover_log, .. } => {
                assert_eq!(*vbid, 3);
                assert_eq!(failover_log[0].uuid, 999);
                assert_eq!(failover_log[0].seqno, 42);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn stream_req_rollback_carries_seqno() {
        let mut session = ChannelSession::new();
        session.register_pending(5, 1, PendingKind::StreamReq);

        let header = FrameHeader::request(Opcode::DcpStreamReq, 0, 5);
        let wire = encode_response(header, Status::Rollback.as_u16(), &123u64.to_be_bytes());

        let events = session.on_bytes(wire).unwrap();
        assert!(matches!(events[0], ChannelEvent::StreamRollback { vbid: 1, seqno: 123, .. }));
    }

    #[test]
    fn noop_request_is_surfaced_for_reply() {
        let mut session = ChannelSession::new();
        let header = FrameHeader::request(Opcode::DcpNoop, 0, 55);
        let mut wire = BytesMut::new();
        header.encode(&mut wire);

        let events = session.on_bytes(wire.freeze()).unwrap();
        assert!(matches!(events[0], ChannelEvent::Noop { opaque: 55 }));

        let _ = build_noop_response(55); // shape sanity: channel would send this back
    }

    #[test]
    fn unregistered_close_stream_ack_falls_back_to_header_vbucket() {
        let mut session = ChannelSession::new();
        let req = build_simple_request(Opcode::DcpCloseStream, 9, 4);
        let req_header = FrameHeader::decode(&req).unwrap();
        let wire = encode_response(req_header, Status::Success.as_u16(), &[]);

        let events = session.on_bytes(wire).unwrap();
        assert!(matches!(events[0], ChannelEvent::CloseStreamAck { vbid: 4, opaque: 9 }));
    }

    #[test]
    fn stream_req_request_frame_round_trips_through_frame_header() {
        let body = build_dcp_stream_req(1, 0, 0, u64::MAX, 1, 0, 0, &[]);
        assert!(FrameHeader::decode(&body).is_some());
    }

    #[test]
    fn fragmented_mutation_is_only_emitted_once_complete() {
        let mut session = ChannelSession::new();

        let mut extras = BytesMut::new();
        extras.put_u64(1);
        extras.put_u64(1);
        extras.put_u32(0);
        extras.put_u32(0);
        extras.put_u32(0);
        extras.put_u16(0);
        extras.put_u8(0);

        let key = b"k";
        let value = b"v";
        let header = FrameHeader::request(Opcode::DcpMutation, 0, 0)
            .with_extras_len(extras.len() as u8)
            .with_key_len(key.len() as u16)
            .with_total_body_len((extras.len() + key.len() + value.len()) as u32);

        let mut wire = BytesMut::new();
        header.encode(&mut wire);
        wire.extend_from_slice(&extras);
        wire.extend_from_slice(key);
        wire.extend_from_slice(value);
        let wire = wire.freeze();

        let mid = wire.len() - 2;
        assert!(session.on_bytes(wire.slice(0..mid)).unwrap().is_empty());
        let events = session.on_bytes(wire.slice(mid..)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChannelEvent::Mutation(_)));
    }
}
