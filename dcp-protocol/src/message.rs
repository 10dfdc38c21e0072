//! Typed parsers for DCP request/response bodies.
//!
//! Each parser takes the already-split header plus raw body bytes from a
//! decoded [`crate::codec::Frame`] and produces a closed, exhaustively
//! matchable value instead of handing callers an offset table to re-derive
//! by hand.

use bytes::{Buf, Bytes};

use crate::header::FrameHeader;

/// One entry of a vbucket's failover log, oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverLogEntry {
    pub uuid: u64,
    pub seqno: u64,
}

/// Parse a DCP_GET_FAILOVER_LOG / STREAM_REQ-success response body into its
/// ordered list of (uuid, seqno) pairs.
pub fn parse_failover_log(mut body: &[u8]) -> Result<Vec<FailoverLogEntry>, ParseError> {
    if body.len() % 16 != 0 {
        return Err(ParseError::Malformed("failover log body not a multiple of 16 bytes"));
    }
    let mut out = Vec::with_capacity(body.len() / 16);
    while !body.is_empty() {
        let uuid = body.get_u64();
        let seqno = body.get_u64();
        out.push(FailoverLogEntry { uuid, seqno });
    }
    Ok(out)
}

/// DCP_SNAPSHOT_MARKER extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMarker {
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
}

pub const SNAPSHOT_FLAG_MEMORY: u32 = 0x01;
pub const SNAPSHOT_FLAG_DISK: u32 = 0x02;

impl SnapshotMarker {
    #[must_use]
    pub const fn is_disk(&self) -> bool {
        self.flags & SNAPSHOT_FLAG_DISK != 0
    }
}

pub fn parse_snapshot_marker(extras: &[u8]) -> Result<SnapshotMarker, ParseError> {
    if extras.len() < 20 {
        return Err(ParseError::Malformed("snapshot marker extras too short"));
    }
    let mut e = extras;
    Ok(SnapshotMarker {
        start_seqno: e.get_u64(),
        end_seqno: e.get_u64(),
        flags: e.get_u32(),
    })
}

/// A data event (mutation, deletion, or expiration).
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub vbid: u16,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub cas: u64,
    pub collection_id: u32,
    pub key: Bytes,
    pub value: Bytes,
}

/// Parse a DCP_MUTATION body. Extras layout: by_seqno(8) rev_seqno(8) flags(4)
/// expiration(4) lock_time(4) nmeta(2) nru(1) — 31 bytes on the wire; the
/// leading collection id is varint-encoded at the front of the key when
/// collections are enabled, which the core decodes eagerly so downstream
/// code never has to.
pub fn parse_mutation(header: &FrameHeader, body: &Bytes) -> Result<DataFrame, ParseError> {
    parse_data_frame(header, body, 31)
}

/// Parse a DCP_DELETION body. Extras: by_seqno(8) rev_seqno(8) nmeta(2) = 18
/// bytes (pre-collections) — the collections-aware layout adds a 4-byte
/// delete_time field, bringing extras to 21 bytes; both are accepted.
pub fn parse_deletion(header: &FrameHeader, body: &Bytes) -> Result<DataFrame, ParseError> {
    parse_data_frame(header, body, header.extras_len as usize)
}

/// Parse a DCP_EXPIRATION body (same wire shape as deletion).
pub fn parse_expiration(header: &FrameHeader, body: &Bytes) -> Result<DataFrame, ParseError> {
    parse_data_frame(header, body, header.extras_len as usize)
}

fn parse_data_frame(
    header: &FrameHeader,
    body: &Bytes,
    expected_extras_len: usize,
) -> Result<DataFrame, ParseError> {
    let extras_len = header.extras_len as usize;
    if extras_len < 16 || body.len() < extras_len {
        return Err(ParseError::Malformed("data frame extras too short"));
    }
    let _ = expected_extras_len; // servers vary extras length across versions; trust extras_len

    let mut extras = &body[..extras_len];
    let by_seqno = extras.get_u64();
    let rev_seqno = extras.get_u64();

    let key_start = extras_len;
    let key_end = key_start + header.key_len as usize;
    if body.len() < key_end {
        return Err(ParseError::Malformed("data frame body shorter than key_len"));
    }
    let key = body.slice(key_start..key_end);
    let value = body.slice(key_end..);

    Ok(DataFrame {
        vbid: header.vbucket(),
        by_seqno,
        rev_seqno,
        cas: header.cas,
        collection_id: 0,
        key,
        value,
    })
}

/// Reasons a DCP_STREAM_END can carry, as a closed tagged variant instead of
/// an opaque status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    Ok,
    Closed,
    StateChanged,
    Disconnected,
    TooSlow,
    BackfillFail,
    FilterEmpty,
    LostPrivileges,
    /// Synthesised locally when writes are attempted on a dropped channel;
    /// never arrives on the wire with this exact tag but shares the Fixer's
    /// recovery path with `StateChanged`/`BackfillFail`.
    ChannelDropped,
    Unknown(u32),
}

impl From<u32> for StreamEndReason {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::Ok,
            1 => Self::Closed,
            2 => Self::StateChanged,
            3 => Self::Disconnected,
            4 => Self::TooSlow,
            5 => Self::BackfillFail,
            6 => Self::FilterEmpty,
            7 => Self::LostPrivileges,
            other => Self::Unknown(other),
        }
    }
}

pub fn parse_stream_end(extras: &[u8]) -> Result<StreamEndReason, ParseError> {
    if extras.len() < 4 {
        return Err(ParseError::Malformed("stream end extras too short"));
    }
    let mut e = extras;
    Ok(StreamEndReason::from(e.get_u32()))
}

/// Closed tagged variant for DCP_SYSTEM_EVENT types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventKind {
    CollectionCreate,
    CollectionDrop,
    CollectionFlush,
    ScopeCreate,
    ScopeDrop,
    CollectionChanged,
    Unknown(u32),
}

impl From<u32> for SystemEventKind {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CollectionCreate,
            1 => Self::CollectionDrop,
            2 => Self::CollectionFlush,
            3 => Self::ScopeCreate,
            4 => Self::ScopeDrop,
            5 => Self::CollectionChanged,
            other => Self::Unknown(other),
        }
    }
}

/// Parsed DCP_SYSTEM_EVENT.
#[derive(Debug, Clone)]
pub struct SystemEventFrame {
    pub vbid: u16,
    pub seqno: u64,
    pub kind: SystemEventKind,
    pub version: u8,
    pub key: Bytes,
    pub value: Bytes,
}

impl SystemEventFrame {
    /// The collection manifest uid this event advances the bucket to,
    /// carried as a leading big-endian u64 in `value` for every collection-
    /// and scope-affecting kind. Events with a shorter value (e.g. a kind
    /// this client doesn't otherwise special-case) leave the manifest uid
    /// unchanged by returning `None`.
    #[must_use]
    pub fn manifest_uid(&self) -> Option<u64> {
        if self.value.len() < 8 {
            return None;
        }
        Some(u64::from_be_bytes(self.value[..8].try_into().expect("checked len above")))
    }
}

/// Parse a DCP_SYSTEM_EVENT body. Extras: seqno(8) event_type(4) version(1) = 13 bytes.
pub fn parse_system_event(header: &FrameHeader, body: &Bytes) -> Result<SystemEventFrame, ParseError> {
    let extras_len = header.extras_len as usize;
    if extras_len < 13 || body.len() < extras_len {
        return Err(ParseError::Malformed("system event extras too short"));
    }
    let mut extras = &body[..extras_len];
    let seqno = extras.get_u64();
    let event_type = extras.get_u32();
    let version = extras.get_u8();

    let key_start = extras_len;
    let key_end = key_start + header.key_len as usize;
    if body.len() < key_end {
        return Err(ParseError::Malformed("system event body shorter than key_len"));
    }

    Ok(SystemEventFrame {
        vbid: header.vbucket(),
        seqno,
        kind: SystemEventKind::from(event_type),
        version,
        key: body.slice(key_start..key_end),
        value: body.slice(key_end..),
    })
}

/// One entry of a GET_ALL_VB_SEQNOS response: vbid(2) + seqno(8), repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VbucketSeqno {
    pub vbid: u16,
    pub seqno: u64,
}

pub fn parse_all_vb_seqnos(mut body: &[u8]) -> Result<Vec<VbucketSeqno>, ParseError> {
    if body.len() % 10 != 0 {
        return Err(ParseError::Malformed("seqno list body not a multiple of 10 bytes"));
    }
    let mut out = Vec::with_capacity(body.len() / 10);
    while !body.is_empty() {
        let vbid = body.get_u16();
        let seqno = body.get_u64();
        out.push(VbucketSeqno { vbid, seqno });
    }
    Ok(out)
}

/// OSO_SNAPSHOT extras: a single flags byte/u32 — bit0 marks the start
/// marker, bit1 the end marker.
pub const OSO_FLAG_START: u32 = 0x01;
pub const OSO_FLAG_END: u32 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsoBoundary {
    Start,
    End,
}

pub fn parse_oso_snapshot(extras: &[u8]) -> Result<OsoBoundary, ParseError> {
    if extras.len() < 4 {
        return Err(ParseError::Malformed("OSO snapshot extras too short"));
    }
    let mut e = extras;
    let flags = e.get_u32();
    if flags & OSO_FLAG_START != 0 {
        Ok(OsoBoundary::Start)
    } else if flags & OSO_FLAG_END != 0 {
        Ok(OsoBoundary::End)
    } else {
        Err(ParseError::Malformed("OSO snapshot flags set neither start nor end"))
    }
}

/// Errors parsing a frame body whose shape didn't match what the opcode promises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed body: {0}")]
    Malformed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn parses_failover_log_entries() {
        let mut body = BytesMut::new();
        body.put_u64(111);
        body.put_u64(5);
        body.put_u64(222);
        body.put_u64(0);
        let log = parse_failover_log(&body).unwrap();
        assert_eq!(log, vec![
            FailoverLogEntry { uuid: 111, seqno: 5 },
            FailoverLogEntry { uuid: 222, seqno: 0 },
        ]);
    }

    #[test]
    fn parses_snapshot_marker() {
        let mut extras = BytesMut::new();
        extras.put_u64(5);
        extras.put_u64(10);
        extras.put_u32(SNAPSHOT_FLAG_MEMORY);
        let marker = parse_snapshot_marker(&extras).unwrap();
        assert_eq!(marker.start_seqno, 5);
        assert_eq!(marker.end_seqno, 10);
        assert!(!marker.is_disk());
    }

    #[test]
    fn parses_mutation_body() {
        let mut extras = BytesMut::new();
        extras.put_u64(42); // by_seqno
        extras.put_u64(1); // rev_seqno
        extras.put_u32(0); // flags
        extras.put_u32(0); // expiration
        extras.put_u32(0); // lock_time
        extras.put_u16(0); // nmeta
        extras.put_u8(0); // nru
        let key = b"doc1";
        let value = b"{}";

        let header = FrameHeader::request(Opcode::DcpMutation, 2, 0)
            .with_extras_len(extras.len() as u8)
            .with_key_len(key.len() as u16)
            .with_total_body_len((extras.len() + key.len() + value.len()) as u32);

        let mut full = BytesMut::new();
        full.extend_from_slice(&extras);
        full.extend_from_slice(key);
        full.extend_from_slice(value);

        let frame = parse_mutation(&header, &full.freeze()).unwrap();
        assert_eq!(frame.by_seqno, 42);
        assert_eq!(&frame.key[..], b"doc1");
        assert_eq!(&frame.value[..], b"{}");
    }

    #[test]
    fn system_event_manifest_uid_comes_from_value_not_version() {
        let mut extras = BytesMut::new();
        extras.put_u64(7); // seqno
        extras.put_u32(0); // event_type: CollectionCreate
        extras.put_u8(1); // version — easy to confuse with the manifest uid

        let key = b"my_collection";
        let mut value = BytesMut::new();
        value.put_u64(42); // manifest uid

        let header = FrameHeader::request(Opcode::DcpSystemEvent, 3, 0)
            .with_extras_len(extras.len() as u8)
            .with_key_len(key.len() as u16)
            .with_total_body_len((extras.len() + key.len() + value.len()) as u32);

        let mut body = BytesMut::new();
        body.extend_from_slice(&extras);
        body.extend_from_slice(key);
        body.extend_from_slice(&value);

        let frame = parse_system_event(&header, &body.freeze()).unwrap();
        assert_eq!(frame.version, 1);
        assert_eq!(frame.manifest_uid(), Some(42));
    }

    #[test]
    fn system_event_manifest_uid_absent_when_value_too_short() {
        let mut extras = BytesMut::new();
        extras.put_u64(7);
        extras.put_u32(5); // CollectionChanged
        extras.put_u8(0);

        let header = FrameHeader::request(Opcode::DcpSystemEvent, 3, 0)
            .with_extras_len(extras.len() as u8)
            .with_total_body_len(extras.len() as u32);

        let frame = parse_system_event(&header, &extras.clone().freeze()).unwrap();
        assert_eq!(frame.manifest_uid(), None);
    }

    #[test]
    fn stream_end_reason_round_trips_known_values() {
        assert_eq!(StreamEndReason::from(0), StreamEndReason::Ok);
        assert_eq!(StreamEndReason::from(2), StreamEndReason::StateChanged);
        assert_eq!(StreamEndReason::from(99), StreamEndReason::Unknown(99));
    }

    #[test]
    fn oso_snapshot_distinguishes_start_and_end() {
        let mut start = BytesMut::new();
        start.put_u32(OSO_FLAG_START);
        assert_eq!(parse_oso_snapshot(&start).unwrap(), OsoBoundary::Start);

        let mut end = BytesMut::new();
        end.put_u32(OSO_FLAG_END);
        assert_eq!(parse_oso_snapshot(&end).unwrap(), OsoBoundary::End);
    }

    #[test]
    fn all_vb_seqnos_parses_pairs() {
        let mut body = BytesMut::new();
        body.put_u16(0);
        body.put_u64(100);
        body.put_u16(1);
        body.put_u64(200);
        let entries = parse_all_vb_seqnos(&body).unwrap();
        assert_eq!(entries, vec![
            VbucketSeqno { vbid: 0, seqno: 100 },
            VbucketSeqno { vbid: 1, seqno: 200 },
        ]);
    }
}
