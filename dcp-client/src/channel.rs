//! DCP Channel: one TCP connection to one KV node.
//!
//! Owns the socket, the codec pipeline (`ChannelSession`), the per-channel
//! flow controller, and the set of vbuckets currently streaming here.
//! Connect, read, and flush are split the way a connection-oriented
//! binary protocol client usually separates them, generalised here to the
//! memcached binary protocol and DCP's typed request operations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite};
use compio::net::TcpStream;
use tracing::{debug, trace, warn};

use dcp_core::alloc::{IoArena, IoBytes};
use dcp_core::endpoint::NodeAddress;
use dcp_core::error::{DcpError, Result};
use dcp_core::options::ChannelOptions;
use dcp_core::poison::PoisonGuard;
use dcp_core::reconnect::ReconnectState;
use dcp_protocol::message::{OsoBoundary, StreamEndReason};
use dcp_protocol::opcode::{Opcode, Status};
use dcp_protocol::session::{ChannelEvent, ChannelSession, PendingKind};
use dcp_protocol::utils;

use crate::auth::Authenticator;
use crate::config::ClientConfig;
use crate::events::{
    AckHandle, ChannelResult, ControlCallback, ControlFrame, DataCallback, DataFrame, SystemEvent,
};
use crate::flow_shared::SharedFlowController;
use crate::partition::{ConnState, PartitionState, StreamRequest, NO_END};
use crate::session_state::PartitionHandle;

/// Opaque-to-vbid routing for in-flight requests that aren't tracked by
/// `ChannelSession` itself (get_seqnos/manifest requests aren't keyed to a
/// single vbucket the way stream/failover-log requests are).
fn next_opaque(counter: &mut u32) -> u32 {
    *counter = counter.wrapping_add(1);
    *counter
}

/// One bidirectional memcached-binary connection to a KV node.
pub struct DcpChannel {
    pub node: NodeAddress,
    stream: Option<TcpStream>,
    arena: IoArena,
    write_buf: BytesMut,
    session: ChannelSession,
    options: ChannelOptions,
    reconnect: ReconnectState,
    flow: SharedFlowController,
    flow_ack_rx: flume::Receiver<usize>,
    opaque_counter: u32,

    open_streams: BTreeSet<u16>,
    failover_log_pending: BTreeSet<u16>,
    state_fetched: bool,
    last_rx_monotonic: Instant,
    channel_dropped_reported: bool,
    is_poisoned: bool,

    partitions: BTreeMap<u16, PartitionHandle>,

    authenticator: Arc<dyn Authenticator>,
    connection_name: String,
    dcp_control_params: BTreeMap<String, String>,

    data_cb: Arc<dyn DataCallback>,
    control_cb: Arc<dyn ControlCallback>,
    system_tx: flume::Sender<SystemEvent>,
    results_tx: flume::Sender<ChannelResult>,
}

impl DcpChannel {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: NodeAddress,
        config: &ClientConfig,
        authenticator: Arc<dyn Authenticator>,
        data_cb: Arc<dyn DataCallback>,
        control_cb: Arc<dyn ControlCallback>,
        system_tx: flume::Sender<SystemEvent>,
        results_tx: flume::Sender<ChannelResult>,
    ) -> Self {
        let (flow, flow_ack_rx) = SharedFlowController::new(
            config.flow_control_buffer_size,
            config.buffer_ack_watermark_percent,
        );

        Self {
            node,
            stream: None,
            arena: IoArena::new(),
            write_buf: BytesMut::with_capacity(config.channel_options.write_buffer_size),
            session: ChannelSession::new(),
            options: config.channel_options.clone(),
            reconnect: ReconnectState::new(
                config.dcp_channels_reconnect_delay,
                config.dcp_channel_total_timeout.max(Duration::from_secs(64)),
            ),
            flow,
            flow_ack_rx,
            opaque_counter: 0,
            open_streams: BTreeSet::new(),
            failover_log_pending: BTreeSet::new(),
            state_fetched: false,
            last_rx_monotonic: Instant::now(),
            channel_dropped_reported: false,
            is_poisoned: false,
            partitions: BTreeMap::new(),
            authenticator,
            connection_name: config.connection_name.clone(),
            dcp_control_params: config.dcp_control_params.clone(),
            data_cb,
            control_cb,
            system_tx,
            results_tx,
        }
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    #[must_use]
    pub const fn is_state_fetched(&self) -> bool {
        self.state_fetched
    }

    pub fn register_partition(&mut self, vbid: u16, handle: PartitionHandle) {
        self.partitions.insert(vbid, handle);
    }

    pub fn unregister_partition(&mut self, vbid: u16) {
        self.partitions.remove(&vbid);
        self.open_streams.remove(&vbid);
        self.failover_log_pending.remove(&vbid);
    }

    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.open_streams.is_empty() || !self.partitions.is_empty()
    }

    /// `connect(attempt_timeout, total_timeout)`: repeatedly attempts
    /// TCP+SASL+DCP_OPEN+control negotiation, sleeping on backoff between
    /// attempts, aborting once `total_timeout` has elapsed since the first
    /// attempt. On success, re-opens every stream recorded in
    /// `open_streams`, re-submits pending failover-log requests, and
    /// re-samples seqnos if they were never fetched.
    pub async fn connect(&mut self, attempt_timeout: Duration, total_timeout: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let start = Instant::now();
        let mut last_err = None;

        loop {
            match self.try_connect_once(attempt_timeout).await {
                Ok(()) => {
                    self.reconnect.reset();
                    self.on_reconnected().await?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(node = %self.node, error = %e, "dcp channel connect attempt failed");
                    last_err = Some(e);
                    if total_timeout.is_zero() || start.elapsed() > total_timeout {
                        break;
                    }
                    let delay = self.reconnect.next_delay();
                    compio::time::sleep(delay).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| DcpError::disconnected(self.node.to_string())))
    }

    async fn try_connect_once(&mut self, attempt_timeout: Duration) -> Result<()> {
        let connect_fut = TcpStream::connect(self.node.socket_addr());
        let mut stream = match compio::time::timeout(attempt_timeout, connect_fut).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(DcpError::Io(e)),
            Err(_) => return Err(DcpError::Timeout(attempt_timeout)),
        };

        if let Err(e) = dcp_core::tcp::enable_tcp_nodelay(&stream) {
            warn!(node = %self.node, error = %e, "failed to set TCP_NODELAY");
        }

        self.authenticator.authenticate(&mut stream).await?;

        self.stream = Some(stream);
        self.session = ChannelSession::new();
        self.is_poisoned = false;
        self.last_rx_monotonic = Instant::now();
        self.channel_dropped_reported = false;

        self.send_dcp_open().await?;
        self.send_control_params().await?;
        Ok(())
    }

    async fn send_dcp_open(&mut self) -> Result<()> {
        let opaque = next_opaque(&mut self.opaque_counter);
        let body = utils::build_dcp_open(
            opaque,
            &self.connection_name,
            utils::DCP_OPEN_FLAG_PRODUCER | utils::DCP_OPEN_FLAG_COLLECTIONS,
        );
        self.session.register_pending(opaque, 0, PendingKind::DcpOpen);
        self.write_and_expect_ack(body, opaque).await
    }

    async fn send_control_params(&mut self) -> Result<()> {
        let params = self.dcp_control_params.clone();
        for (name, value) in params {
            let opaque = next_opaque(&mut self.opaque_counter);
            let body = utils::build_dcp_control(opaque, &name, &value);
            self.session.register_pending(opaque, 0, PendingKind::DcpControl);
            self.write_and_expect_ack(body, opaque).await?;
        }
        Ok(())
    }

    /// Write a request and pump reads until its response has been consumed
    /// from the wire (used only for the synchronous negotiation steps of
    /// `connect`; steady-state responses are drained by `pump`).
    async fn write_and_expect_ack(&mut self, body: Bytes, opaque: u32) -> Result<()> {
        self.write_bytes(&body).await?;
        loop {
            let events = self.read_raw().await?;
            for event in events {
                if matches!(&event, ChannelEvent::ControlAck { opaque: o } if *o == opaque) {
                    return Ok(());
                }
                self.handle_event(event).await?;
            }
        }
    }

    async fn on_reconnected(&mut self) -> Result<()> {
        let vbids: Vec<u16> = self.open_streams.iter().copied().collect();
        for vbid in vbids {
            if let Some(handle) = self.partitions.get(&vbid).cloned() {
                let req = {
                    let ps = handle.lock();
                    StreamRequest {
                        vbid,
                        start_seqno: ps.seqno,
                        end_seqno: ps.stream_end_seqno,
                        vbuuid: 0,
                        snap_start: ps.snapshot_start_seqno,
                        snap_end: ps.snapshot_end_seqno,
                        manifest_uid: ps.manifest_uid,
                        stream_id: vbid,
                        collection_id: 0,
                    }
                };
                self.reissue_stream(req).await?;
            }
        }

        let pending: Vec<u16> = self.failover_log_pending.iter().copied().collect();
        for vbid in pending {
            self.get_failover_log(vbid).await?;
        }

        if !self.state_fetched {
            self.get_seqnos().await?;
        }

        Ok(())
    }

    /// `open_stream`: sets PS state to Connecting, marks the vbid open, and
    /// writes DCP_STREAM_REQ. If not connected, synthesises
    /// `StreamEnd(CHANNEL_DROPPED)` instead of failing the caller. A no-op
    /// if `req.vbid` already has an open stream; re-sending a request for a
    /// vbid that's still open is `reissue_stream`'s job (used by
    /// `on_reconnected`), not a fresh `open_stream` call.
    pub async fn open_stream(&mut self, req: StreamRequest) -> Result<()> {
        if self.open_streams.contains(&req.vbid) {
            return Ok(());
        }
        self.reissue_stream(req).await
    }

    /// Writes DCP_STREAM_REQ for `req.vbid` unconditionally, whether it's a
    /// fresh stream (via `open_stream`) or a resend for one already tracked
    /// as open (via `on_reconnected`, after the underlying TCP connection
    /// was replaced).
    async fn reissue_stream(&mut self, req: StreamRequest) -> Result<()> {
        if let Some(handle) = self.partitions.get(&req.vbid) {
            handle.lock().set_state(ConnState::Connecting);
        }
        self.open_streams.insert(req.vbid);

        if !self.is_connected() {
            let _ = self
                .system_tx
                .send(SystemEvent::StreamEnd { vbid: req.vbid, reason: StreamEndReason::ChannelDropped });
            return Ok(());
        }

        let opaque = next_opaque(&mut self.opaque_counter);
        self.session.register_pending(opaque, req.vbid, PendingKind::StreamReq);

        let end = if req.end_seqno == NO_END { u64::MAX } else { req.end_seqno };
        let body = utils::build_dcp_stream_req(
            opaque,
            req.vbid,
            req.start_seqno,
            end,
            req.vbuuid,
            req.snap_start,
            req.snap_end,
            &[],
        );
        self.write_bytes(&body).await
    }

    /// `close_stream`: writes DCP_CLOSE_STREAM; PS transitions to
    /// Disconnecting. Errors if the channel isn't connected.
    pub async fn close_stream(&mut self, vbid: u16) -> Result<()> {
        if !self.is_connected() {
            return Err(DcpError::disconnected(self.node.to_string()));
        }
        if let Some(handle) = self.partitions.get(&vbid) {
            handle.lock().set_state(ConnState::Disconnecting);
        }
        let opaque = next_opaque(&mut self.opaque_counter);
        self.session.register_pending(opaque, vbid, PendingKind::CloseStream);
        let body = utils::build_simple_request(Opcode::DcpCloseStream, opaque, vbid);
        self.write_bytes(&body).await
    }

    pub async fn get_failover_log(&mut self, vbid: u16) -> Result<()> {
        self.failover_log_pending.insert(vbid);
        if !self.is_connected() {
            return Ok(());
        }
        let opaque = next_opaque(&mut self.opaque_counter);
        self.session.register_pending(opaque, vbid, PendingKind::GetFailoverLog);
        let body = utils::build_simple_request(Opcode::DcpGetFailoverLog, opaque, vbid);
        self.write_bytes(&body).await
    }

    pub async fn get_seqnos(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let opaque = next_opaque(&mut self.opaque_counter);
        self.session.register_pending(opaque, 0, PendingKind::GetSeqnos);
        let body = utils::build_simple_request(Opcode::GetAllVbSeqnos, opaque, 0);
        self.write_bytes(&body).await
    }

    /// `GET_COLLECTIONS_MANIFEST`: request-response, not keyed to a single
    /// vbid on the wire, but tagged with the vbid that asked for it so the
    /// Conductor can route the response back to the right waiter.
    pub async fn request_collections_manifest(&mut self, vbid: u16) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let opaque = next_opaque(&mut self.opaque_counter);
        self.session.register_pending(opaque, vbid, PendingKind::GetCollectionsManifest);
        let body = utils::build_simple_request(Opcode::GetCollectionsManifest, opaque, vbid);
        self.write_bytes(&body).await
    }

    /// Forwarded to the channel's flow controller; may produce a
    /// BUFFER_ACK on the wire immediately.
    pub async fn ack_bytes(&mut self, n: usize) -> Result<()> {
        self.flow.ack_bytes(n);
        self.drain_pending_acks().await
    }

    async fn drain_pending_acks(&mut self) -> Result<()> {
        while let Ok(bytes_acked) = self.flow_ack_rx.try_recv() {
            let opaque = next_opaque(&mut self.opaque_counter);
            let body = utils::build_buffer_ack(opaque, 0, bytes_acked as u32);
            if self.is_connected() {
                self.write_bytes(&body).await?;
            }
        }
        Ok(())
    }

    /// Read available bytes once and decode whatever frames are now
    /// complete, without reacting to them. Returns an empty vec on a
    /// zero-length read (the caller treats that as a dropped connection).
    async fn read_raw(&mut self) -> Result<Vec<ChannelEvent>> {
        let stream = self.stream.as_mut().ok_or_else(|| DcpError::disconnected(self.node.to_string()))?;
        let slab = self.arena.alloc_mut(self.options.read_buffer_size);

        let BufResult(result, slab) = match self.options.recv_timeout {
            None => AsyncRead::read(stream, slab).await,
            Some(dur) => match compio::time::timeout(dur, AsyncRead::read(stream, slab)).await {
                Ok(r) => r,
                Err(_) => return Err(DcpError::Timeout(dur)),
            },
        };

        let n = match result {
            Ok(n) => n,
            Err(e) => {
                self.stream = None;
                self.publish_channel_dropped();
                return Err(DcpError::Io(e));
            }
        };
        if n == 0 {
            self.stream = None;
            self.publish_channel_dropped();
            return Ok(Vec::new());
        }

        self.last_rx_monotonic = Instant::now();
        let bytes = slab.freeze();
        let events = self
            .session
            .on_bytes(bytes)
            .map_err(|e| DcpError::protocol(e.to_string()))?;

        Ok(events)
    }

    async fn write_bytes(&mut self, body: &[u8]) -> Result<()> {
        if self.is_poisoned {
            return Err(DcpError::disconnected(self.node.to_string()));
        }
        let stream = self.stream.as_mut().ok_or_else(|| DcpError::disconnected(self.node.to_string()))?;

        self.write_buf.clear();
        self.write_buf.extend_from_slice(body);
        let buf = self.write_buf.split().freeze();

        let guard = PoisonGuard::new(&mut self.is_poisoned);

        let BufResult(result, _) = match self.options.send_timeout {
            None => AsyncWrite::write(stream, IoBytes::new(buf)).await,
            Some(dur) => match compio::time::timeout(dur, AsyncWrite::write(stream, IoBytes::new(buf))).await {
                Ok(r) => r,
                Err(_) => return Err(DcpError::Timeout(dur)),
            },
        };

        if result.is_err() {
            self.stream = None;
            self.publish_channel_dropped();
        }
        result?;
        guard.disarm();
        Ok(())
    }

    /// One iteration of the channel's I/O context loop: read whatever is
    /// available and react to it. Callers (the Conductor's per-channel task)
    /// loop on this indefinitely.
    pub async fn pump(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Err(DcpError::disconnected(self.node.to_string()));
        }
        let events = self.read_raw().await?;
        for event in events {
            self.handle_event(event).await?;
        }
        self.drain_pending_acks().await
    }

    /// Dead-connection probe: call on a timer every
    /// `dead_connection_detection_interval`.
    pub fn check_dead_connection(&mut self, now: Instant) {
        if self.channel_dropped_reported {
            return;
        }
        if self.is_connected() && now.duration_since(self.last_rx_monotonic) > self.options.dead_connection_detection_interval {
            self.publish_channel_dropped();
        }
    }

    fn publish_channel_dropped(&mut self) {
        if self.channel_dropped_reported {
            return;
        }
        self.channel_dropped_reported = true;
        self.stream = None;
        let _ = self.system_tx.send(SystemEvent::ChannelDropped { node: self.node });
    }

    async fn handle_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::ControlAck { .. } => {}
            ChannelEvent::StreamAccepted { vbid, failover_log, .. } => {
                if let Some(handle) = self.partitions.get(&vbid) {
                    let mut ps = handle.lock();
                    ps.set_state(ConnState::Connected);
                    if let Some(last) = failover_log.last() {
                        ps.prepare_next_stream_request(last.uuid);
                    }
                }
                debug!(vbid, entries = failover_log.len(), "dcp stream accepted");
                let _ = self
                    .results_tx
                    .send(ChannelResult::FailoverLogUpdated { vbid, entries: failover_log });
            }
            ChannelEvent::StreamRollback { vbid, seqno, .. } => {
                if let Some(handle) = self.partitions.get(&vbid) {
                    handle.lock().set_state(ConnState::Disconnected);
                }
                self.open_streams.remove(&vbid);
                let _ = self.system_tx.send(SystemEvent::Rollback { vbid, seqno });
            }
            ChannelEvent::StreamNotMyVbucket { vbid, .. } => {
                if let Some(handle) = self.partitions.get(&vbid) {
                    handle.lock().set_state(ConnState::Disconnected);
                }
                self.open_streams.remove(&vbid);
                let _ = self.system_tx.send(SystemEvent::NotMyVbucket { vbid });
            }
            ChannelEvent::StreamRequestFailed { vbid, status, .. } => {
                let backoff = self
                    .partitions
                    .get(&vbid)
                    .map(|h| h.lock().backoff.current_interval())
                    .unwrap_or_default();
                let _ = self
                    .system_tx
                    .send(SystemEvent::OpenStreamResponse { vbid, status, backoff });
            }
            ChannelEvent::SnapshotMarker { vbid, marker } => {
                if let Some(handle) = self.partitions.get(&vbid) {
                    handle.lock().on_snapshot_marker(marker.start_seqno, marker.end_seqno);
                }
                let ack = Arc::new(AckHandle::new(0, self.flow.clone()));
                self.control_cb.control_event(
                    ack,
                    ControlFrame::SnapshotMarker { vbid, start: marker.start_seqno, end: marker.end_seqno },
                );
            }
            ChannelEvent::Mutation(data) | ChannelEvent::Deletion(data) | ChannelEvent::Expiration(data) => {
                let len = data.key.len() + data.value.len();
                if let Some(handle) = self.partitions.get(&data.vbid) {
                    handle.lock().observe_data_seqno(data.by_seqno);
                }
                // Credit is only granted once the callback acks the handle,
                // not at delivery, so a consumer that never acks holds back
                // the server's buffer instead of freeing it for free.
                let ack = Arc::new(AckHandle::new(len, self.flow.clone()));
                self.data_cb.data_event(
                    ack,
                    DataFrame {
                        vbid: data.vbid,
                        by_seqno: data.by_seqno,
                        cas: data.cas,
                        key: data.key,
                        value: data.value,
                    },
                );
            }
            ChannelEvent::OsoSnapshot { vbid, boundary } => {
                if let Some(handle) = self.partitions.get(&vbid) {
                    let mut ps = handle.lock();
                    match boundary {
                        OsoBoundary::Start => ps.begin_out_of_order(),
                        OsoBoundary::End => ps.end_out_of_order(),
                    }
                }
            }
            ChannelEvent::StreamEnd { vbid, reason } => {
                if let Some(handle) = self.partitions.get(&vbid) {
                    handle.lock().set_state(ConnState::Disconnected);
                }
                self.open_streams.remove(&vbid);
                let _ = self.system_tx.send(SystemEvent::StreamEnd { vbid, reason });
            }
            ChannelEvent::SystemEvent(ev) => {
                let manifest_uid = ev.manifest_uid();
                if let Some(handle) = self.partitions.get(&ev.vbid) {
                    let mut ps = handle.lock();
                    ps.seqno = ev.seqno;
                    if let Some(manifest_uid) = manifest_uid {
                        ps.manifest_uid = manifest_uid;
                    }
                }
                let ack = Arc::new(AckHandle::new(ev.key.len() + ev.value.len(), self.flow.clone()));
                self.control_cb.control_event(
                    ack,
                    ControlFrame::SystemEvent {
                        vbid: ev.vbid,
                        seqno: ev.seqno,
                        manifest_uid: manifest_uid.unwrap_or(0),
                        key: ev.key,
                    },
                );
            }
            ChannelEvent::CloseStreamAck { vbid, .. } => {
                if let Some(handle) = self.partitions.get(&vbid) {
                    handle.lock().set_state(ConnState::Disconnected);
                }
            }
            ChannelEvent::FailoverLog { vbid, entries, .. } => {
                self.failover_log_pending.remove(&vbid);
                if let Some(handle) = self.partitions.get(&vbid) {
                    if let Some(last) = entries.last() {
                        handle.lock().prepare_next_stream_request(last.uuid);
                    }
                }
                let _ = self.results_tx.send(ChannelResult::FailoverLogUpdated { vbid, entries });
            }
            ChannelEvent::AllVbSeqnos { entries, .. } => {
                self.state_fetched = true;
                for entry in &entries {
                    if let Some(handle) = self.partitions.get(&entry.vbid) {
                        handle.lock().observe_remote_seqno(entry.seqno);
                    }
                }
                let _ = self.results_tx.send(ChannelResult::SeqnosFetched { node: self.node });
            }
            ChannelEvent::CollectionsManifest { vbid, json, .. } => {
                let _ = self.results_tx.send(ChannelResult::ManifestFetched { vbid, json });
            }
            ChannelEvent::BufferAckAck { .. } => {
                trace!("buffer ack acknowledged");
            }
            ChannelEvent::Noop { opaque } => {
                let body = utils::build_noop_response(opaque);
                self.write_bytes(&body).await?;
            }
            ChannelEvent::Unknown { opcode, opaque } => {
                trace!(?opcode, opaque, "unrecognised dcp frame, dropping");
            }
        }
        Ok(())
    }
}
