//! Per-vbucket durable session slice.
//!
//! `StateWaiter` is a generation-counter completion primitive: callers poll
//! a monotonically increasing counter instead of blocking on a condition
//! variable keyed to a scalar state byte.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dcp_core::reconnect::ReconnectState;

/// Sentinel for an open-ended stream end seqno.
pub const NO_END: u64 = u64::MAX;

/// Connection sub-state of one partition's stream, observable by waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Immutable value describing a DCP_STREAM_REQ to (re)issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub vbid: u16,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub vbuuid: u64,
    pub snap_start: u64,
    pub snap_end: u64,
    pub manifest_uid: u64,
    pub stream_id: u16,
    pub collection_id: u32,
}

/// A one-shot, re-armable completion signal.
///
/// Every wait operation (`wait_for_stop`, `wait_for_failover_log`, ...) gets
/// its own generation counter: callers record the generation before issuing
/// the request, then wait for it to advance past that point instead of
/// racing a condvar against a state byte that might flip twice before they
/// get scheduled.
pub struct StateWaiter {
    generation: AtomicU64,
}

impl Default for StateWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl StateWaiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn mark(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Called by the channel I/O context on every state transition.
    pub fn signal(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Poll until `generation` has advanced past `since`, or `timeout`
    /// elapses. A light poll loop rather than a true wake-on-notify
    /// primitive — acceptable here because state transitions are infrequent
    /// (connection lifecycle events, not per-frame), and it keeps the
    /// primitive runtime-agnostic.
    pub async fn wait_since(&self, since: u64, timeout: Duration) -> Result<(), WaitTimeout> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.generation.load(Ordering::Acquire) != since {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(WaitTimeout);
            }
            compio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("wait operation timed out")]
pub struct WaitTimeout;

/// Per-vbucket durable session slice.
pub struct PartitionState {
    pub vbid: u16,
    state: ConnState,
    pub seqno: u64,
    pub snapshot_start_seqno: u64,
    pub snapshot_end_seqno: u64,
    pub stream_end_seqno: u64,
    pub current_vbucket_seqno_in_master: u64,
    pub manifest_uid: u64,
    pub oso_active: bool,
    pub oso_max_seqno: u64,
    pub backoff: ReconnectState,
    pub pending_stream_request: Option<StreamRequest>,
    pub waiter: StateWaiter,
    /// Signalled whenever session-level data about this vbucket changes
    /// without a connection state transition — a failover log refresh, a
    /// manifest uid bump, a remote seqno sample. Separate from `waiter` so
    /// `wait_for_failover_log` doesn't wake spuriously on unrelated
    /// `Connecting`/`Connected` flips and vice versa.
    pub data_waiter: StateWaiter,
}

impl PartitionState {
    #[must_use]
    pub fn new(vbid: u16) -> Self {
        Self {
            vbid,
            state: ConnState::Disconnected,
            seqno: 0,
            snapshot_start_seqno: 0,
            snapshot_end_seqno: 0,
            stream_end_seqno: NO_END,
            current_vbucket_seqno_in_master: 0,
            manifest_uid: 0,
            oso_active: false,
            oso_max_seqno: 0,
            backoff: ReconnectState::partition_default(),
            pending_stream_request: None,
            waiter: StateWaiter::new(),
            data_waiter: StateWaiter::new(),
        }
    }

    /// Signal `data_waiter` after session-level data about this partition
    /// changed (failover log, manifest uid, remote seqno sample).
    pub fn touch_data(&mut self) {
        self.data_waiter.signal();
    }

    #[must_use]
    pub const fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        self.state = state;
        self.waiter.signal();
    }

    /// Apply a MUTATION/DELETION/EXPIRATION's by-seqno: outside OSO,
    /// `seqno` is unsigned-monotone; inside OSO, only `oso_max_seqno`
    /// advances.
    pub fn observe_data_seqno(&mut self, by_seqno: u64) {
        if self.oso_active {
            if by_seqno > self.oso_max_seqno {
                self.oso_max_seqno = by_seqno;
            }
        } else {
            self.seqno = by_seqno;
        }
    }

    pub fn begin_out_of_order(&mut self) {
        self.oso_active = true;
        self.oso_max_seqno = self.seqno;
    }

    /// Promote `oso_max_seqno` into `seqno` and snap the snapshot window to
    /// it, clearing any pending request.
    pub fn end_out_of_order(&mut self) {
        self.oso_active = false;
        self.seqno = self.oso_max_seqno;
        self.snapshot_start_seqno = self.oso_max_seqno;
        self.snapshot_end_seqno = self.oso_max_seqno;
        self.pending_stream_request = None;
    }

    pub fn on_snapshot_marker(&mut self, start: u64, end: u64) {
        self.snapshot_start_seqno = start;
        self.snapshot_end_seqno = end;
        self.pending_stream_request = None;
    }

    /// Max-wins update to the remote high-watermark sample, uniform across
    /// both the GET_ALL_VB_SEQNOS sample and SYSTEM_EVENT's embedded seqno.
    pub fn observe_remote_seqno(&mut self, seqno: u64) {
        if seqno > self.current_vbucket_seqno_in_master {
            self.current_vbucket_seqno_in_master = seqno;
        }
    }

    pub fn prepare_next_stream_request(&mut self, vbuuid: u64) {
        self.pending_stream_request = Some(StreamRequest {
            vbid: self.vbid,
            start_seqno: self.seqno,
            end_seqno: self.stream_end_seqno,
            vbuuid,
            snap_start: self.snapshot_start_seqno,
            snap_end: self.snapshot_end_seqno,
            manifest_uid: self.manifest_uid,
            stream_id: self.vbid,
            collection_id: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_advances_outside_oso() {
        let mut ps = PartitionState::new(0);
        ps.observe_data_seqno(5);
        ps.observe_data_seqno(10);
        assert_eq!(ps.seqno, 10);
    }

    #[test]
    fn oso_window_tracks_max_without_moving_seqno() {
        let mut ps = PartitionState::new(0);
        ps.begin_out_of_order();
        ps.observe_data_seqno(7);
        ps.observe_data_seqno(5);
        ps.observe_data_seqno(9);
        assert_eq!(ps.seqno, 0);
        assert_eq!(ps.oso_max_seqno, 9);

        ps.end_out_of_order();
        assert_eq!(ps.seqno, 9);
        assert_eq!(ps.snapshot_start_seqno, 9);
        assert_eq!(ps.snapshot_end_seqno, 9);
    }

    #[test]
    fn remote_seqno_observation_is_max_wins() {
        let mut ps = PartitionState::new(0);
        ps.observe_remote_seqno(10);
        ps.observe_remote_seqno(3);
        assert_eq!(ps.current_vbucket_seqno_in_master, 10);
        ps.observe_remote_seqno(20);
        assert_eq!(ps.current_vbucket_seqno_in_master, 20);
    }

    #[test]
    fn state_transition_signals_waiters() {
        let mut ps = PartitionState::new(0);
        let gen = ps.waiter.mark();
        ps.set_state(ConnState::Connecting);
        assert_ne!(ps.waiter.mark(), gen);
    }
}
