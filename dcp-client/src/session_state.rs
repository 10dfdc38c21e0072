//! Serialisable session state: the fixed-size partition array plus
//! per-stream filters, and its JSON persistence shape.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::partition::{ConnState, PartitionState, NO_END};
use dcp_protocol::message::FailoverLogEntry;

/// A partition's state, shared by reference between the Conductor and the
/// channel I/O context that currently streams it: read-many,
/// one-writer-at-a-time, enforced by the mutex.
pub type PartitionHandle = Arc<Mutex<PartitionState>>;

/// Per-stream collection filter, keyed by stream id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamState {
    pub stream_id: u16,
    pub collection_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PersistedFailoverEntry {
    uuid: u64,
    seqno: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PersistedPartition {
    vbid: u16,
    #[serde(rename = "maxSeq")]
    max_seq: u64,
    uuid: u64,
    seqno: u64,
    state: String,
    #[serde(rename = "failoverLog")]
    failover_log: Vec<PersistedFailoverEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PersistedStream {
    #[serde(rename = "streamId")]
    stream_id: u16,
    #[serde(rename = "collectionId")]
    collection_id: Option<u32>,
}

/// On-disk/on-wire JSON shape. `version` lets a future format change be
/// detected on load rather than silently misparsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedSessionState {
    version: u32,
    partitions: Vec<PersistedPartition>,
    streams: Vec<PersistedStream>,
}

const CURRENT_VERSION: u32 = 1;

fn state_tag(state: ConnState) -> &'static str {
    match state {
        ConnState::Disconnected => "disconnected",
        ConnState::Connecting => "connecting",
        ConnState::Connected => "connected",
        ConnState::Disconnecting => "disconnecting",
    }
}

fn state_from_tag(tag: &str) -> ConnState {
    match tag {
        "connecting" => ConnState::Connecting,
        "connected" => ConnState::Connected,
        "disconnecting" => ConnState::Disconnecting,
        _ => ConnState::Disconnected,
    }
}

/// Owned per-partition data that survives a round trip through JSON,
/// independent of the live `PartitionState` (which also holds runtime-only
/// fields like the backoff state and waiters).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSnapshot {
    pub vbid: u16,
    pub max_seq: u64,
    pub vbuuid: u64,
    pub seqno: u64,
    pub state: ConnState,
    pub failover_log: Vec<FailoverLogEntry>,
}

/// Owned session state: one slice per vbucket plus the stream filter table.
///
/// Holds [`PartitionState`] rather than a snapshot so a live `Conductor` can
/// mutate it directly; `to_persisted`/`from_persisted` project to and from
/// the serialisable shape.
pub struct SessionState {
    pub partitions: BTreeMap<u16, PartitionHandle>,
    pub failover_logs: BTreeMap<u16, Vec<FailoverLogEntry>>,
    pub streams: Vec<StreamState>,
}

impl SessionState {
    #[must_use]
    pub fn new(vbids: impl IntoIterator<Item = u16>) -> Self {
        let partitions = vbids
            .into_iter()
            .map(|v| (v, Arc::new(Mutex::new(PartitionState::new(v)))))
            .collect();
        Self {
            partitions,
            failover_logs: BTreeMap::new(),
            streams: Vec::new(),
        }
    }

    #[must_use]
    pub fn partition(&self, vbid: u16) -> Option<PartitionHandle> {
        self.partitions.get(&vbid).cloned()
    }

    /// Get or lazily create the partition slice for `vbid`. Used by the
    /// Conductor when a vbucket appears in the cluster config for the first
    /// time (e.g. no `vbuckets` subset was configured at startup).
    pub fn ensure_partition(&mut self, vbid: u16) -> PartitionHandle {
        self.partitions
            .entry(vbid)
            .or_insert_with(|| Arc::new(Mutex::new(PartitionState::new(vbid))))
            .clone()
    }

    #[must_use]
    pub fn current_vbuuid(&self, vbid: u16) -> u64 {
        self.failover_logs
            .get(&vbid)
            .and_then(|log| log.last())
            .map_or(0, |entry| entry.uuid)
    }

    /// Replace a partition's failover log; the newest entry supplies the
    /// vbuuid for future stream requests. Append-only except for this
    /// explicit replace on reconnect-after-rollback.
    pub fn set_failover_log(&mut self, vbid: u16, log: Vec<FailoverLogEntry>) {
        self.failover_logs.insert(vbid, log);
    }

    pub fn clear_failover_log(&mut self, vbid: u16) {
        self.failover_logs.remove(&vbid);
    }

    #[must_use]
    pub fn serialize(&self) -> String {
        let partitions = self
            .partitions
            .values()
            .map(|handle| {
                let ps = handle.lock();
                PersistedPartition {
                    vbid: ps.vbid,
                    max_seq: if ps.stream_end_seqno == NO_END { 0 } else { ps.stream_end_seqno },
                    uuid: self.current_vbuuid(ps.vbid),
                    seqno: ps.seqno,
                    state: state_tag(ps.state()).to_string(),
                    failover_log: self
                        .failover_logs
                        .get(&ps.vbid)
                        .into_iter()
                        .flatten()
                        .map(|e| PersistedFailoverEntry { uuid: e.uuid, seqno: e.seqno })
                        .collect(),
                }
            })
            .collect();

        let streams = self
            .streams
            .iter()
            .map(|s| PersistedStream { stream_id: s.stream_id, collection_id: s.collection_id })
            .collect();

        let persisted = PersistedSessionState { version: CURRENT_VERSION, partitions, streams };
        serde_json::to_string(&persisted).expect("session state always serialises")
    }

    /// Load the partition snapshots and stream filters out of a persisted
    /// blob, without reconstructing a live `SessionState` (callers apply the
    /// snapshot onto a freshly constructed one via `apply_snapshot`).
    pub fn deserialize_snapshots(
        json: &str,
    ) -> Result<(Vec<PartitionSnapshot>, Vec<StreamState>), dcp_core::error::DcpError> {
        let persisted: PersistedSessionState = serde_json::from_str(json)
            .map_err(|e| dcp_core::error::DcpError::Serde(e.to_string()))?;

        if persisted.version != CURRENT_VERSION {
            return Err(dcp_core::error::DcpError::Serde(format!(
                "unsupported session state version {}",
                persisted.version
            )));
        }

        let partitions = persisted
            .partitions
            .into_iter()
            .map(|p| PartitionSnapshot {
                vbid: p.vbid,
                max_seq: p.max_seq,
                vbuuid: p.uuid,
                seqno: p.seqno,
                state: state_from_tag(&p.state),
                failover_log: p
                    .failover_log
                    .into_iter()
                    .map(|e| FailoverLogEntry { uuid: e.uuid, seqno: e.seqno })
                    .collect(),
            })
            .collect();

        let streams = persisted
            .streams
            .into_iter()
            .map(|s| StreamState { stream_id: s.stream_id, collection_id: s.collection_id })
            .collect();

        Ok((partitions, streams))
    }

    pub fn apply_snapshot(&mut self, snapshot: &PartitionSnapshot) {
        let handle = self
            .partitions
            .entry(snapshot.vbid)
            .or_insert_with(|| Arc::new(Mutex::new(PartitionState::new(snapshot.vbid))));
        let mut ps = handle.lock();
        ps.seqno = snapshot.seqno;
        if snapshot.max_seq != 0 {
            ps.stream_end_seqno = snapshot.max_seq;
        }
        drop(ps);
        self.failover_logs.insert(snapshot.vbid, snapshot.failover_log.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut session = SessionState::new([0, 1]);
        session.partitions[&0].lock().seqno = 42;
        session.set_failover_log(0, vec![FailoverLogEntry { uuid: 123, seqno: 42 }]);
        session.streams.push(StreamState { stream_id: 0, collection_id: Some(9) });

        let json = session.serialize();
        let (snapshots, streams) = SessionState::deserialize_snapshots(&json).unwrap();

        let restored_zero = snapshots.iter().find(|s| s.vbid == 0).unwrap();
        assert_eq!(restored_zero.seqno, 42);
        assert_eq!(restored_zero.vbuuid, 123);
        assert_eq!(streams[0].collection_id, Some(9));
    }

    #[test]
    fn rejects_unknown_version() {
        let bad = r#"{"version":99,"partitions":[],"streams":[]}"#;
        assert!(SessionState::deserialize_snapshots(bad).is_err());
    }

    #[test]
    fn apply_snapshot_resumes_from_persisted_point() {
        let mut session = SessionState::new([0]);
        let snapshot = PartitionSnapshot {
            vbid: 0,
            max_seq: 0,
            vbuuid: 555,
            seqno: 77,
            state: ConnState::Disconnected,
            failover_log: vec![FailoverLogEntry { uuid: 555, seqno: 77 }],
        };
        session.apply_snapshot(&snapshot);
        assert_eq!(session.partitions[&0].lock().seqno, 77);
        assert_eq!(session.current_vbuuid(0), 555);
    }
}
