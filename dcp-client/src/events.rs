//! User-facing event types and the ack-handle contract.
//!
//! `SystemEvent` is a statically-typed sum type the Fixer consumes rather
//! than a dynamically-typed publish surface. `AckHandle` guarantees a
//! frame's flow-control credit is released exactly once, encoded as a
//! scoped acquisition with guaranteed release on every exit path, in the
//! same RAII style as `dcp_core::poison`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::flow_shared::SharedFlowController;
use dcp_protocol::message::StreamEndReason;
use dcp_protocol::opcode::Status;

/// Events the Fixer consumes, enqueued by channel demux and by the Conductor.
#[derive(Debug, Clone)]
pub enum SystemEvent {
    ChannelDropped { node: dcp_core::endpoint::NodeAddress },
    StreamEnd { vbid: u16, reason: StreamEndReason },
    OpenStreamResponse { vbid: u16, status: Status, backoff: std::time::Duration },
    Rollback { vbid: u16, seqno: u64 },
    NotMyVbucket { vbid: u16 },
    UnexpectedFailure { cause: String },
    Disconnect,
}

/// A DCP_MUTATION/DELETION/EXPIRATION handed to the user's data callback.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub vbid: u16,
    pub by_seqno: u64,
    pub cas: u64,
    pub key: Bytes,
    pub value: Bytes,
}

/// A control-plane event handed to the user's control callback
/// (SNAPSHOT_MARKER, SYSTEM_EVENT, rollback-derived notifications).
#[derive(Debug, Clone)]
pub enum ControlFrame {
    SnapshotMarker { vbid: u16, start: u64, end: u64 },
    SystemEvent { vbid: u16, seqno: u64, manifest_uid: u64, key: Bytes },
    Rollback { vbid: u16, seqno: u64 },
}

/// Scoped acquisition over one frame's flow-control credit.
///
/// Armed on construction; the caller MUST call [`AckHandle::ack`] exactly
/// once. Dropping without acking still releases the credit (on the
/// channel's next flush) but logs a leak warning in test builds.
pub struct AckHandle {
    len: usize,
    flow: SharedFlowController,
    acked: AtomicBool,
}

impl AckHandle {
    #[must_use]
    pub(crate) fn new(len: usize, flow: SharedFlowController) -> Self {
        Self {
            len,
            flow,
            acked: AtomicBool::new(false),
        }
    }

    /// Credit this frame's bytes back to the owning channel's flow
    /// controller. Idempotent: a second call is a no-op.
    pub fn ack(&self) {
        if self.acked.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flow.ack_bytes(self.len);
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if !self.acked.load(Ordering::Acquire) {
            #[cfg(test)]
            {
                tracing::warn!(len = self.len, "AckHandle dropped without ack() — leak");
            }
            self.flow.ack_bytes(self.len);
        }
    }
}

/// User-facing callbacks — the only surface exposed to the embedder.
/// Invoked on the owning channel's I/O context; implementations MUST NOT
/// block.
pub trait DataCallback: Send + Sync {
    fn data_event(&self, ack_handle: Arc<AckHandle>, frame: DataFrame);
}

pub trait ControlCallback: Send + Sync {
    fn control_event(&self, ack_handle: Arc<AckHandle>, frame: ControlFrame);
}

pub trait SystemEventCallback: Send + Sync {
    fn system_event(&self, event: SystemEvent);
}

/// Non-anomalous results the channel demux produces that the Conductor (not
/// the Fixer) needs to apply to `SessionState` — failover-log refreshes and
/// seqno samples don't belong on the Fixer's inbox since nothing needs
/// recovering, but the Conductor still has to update state and wake waiters.
#[derive(Debug, Clone)]
pub enum ChannelResult {
    FailoverLogUpdated { vbid: u16, entries: Vec<dcp_protocol::message::FailoverLogEntry> },
    SeqnosFetched { node: dcp_core::endpoint::NodeAddress },
    ManifestFetched { vbid: u16, json: Bytes },
}
