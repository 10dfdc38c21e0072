//! Conductor: one task per DCP channel, plus the registry tying vbuckets to
//! their current master. A command channel per connection, a
//! `futures::select!` run loop per connection task, owned state behind a
//! registry the public API methods route through.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use dcp_core::endpoint::NodeAddress;
use dcp_core::error::{DcpError, Result};

use crate::auth::Authenticator;
use crate::channel::DcpChannel;
use crate::config::ClientConfig;
use crate::config_provider::ConfigProvider;
use crate::events::{
    ChannelResult, ControlCallback, DataCallback, SystemEvent, SystemEventCallback,
};
use crate::fixer::Fixer;
use crate::partition::StreamRequest;
use crate::session_state::{PartitionHandle, SessionState};

/// Commands sent to a single channel's I/O task. The task owns the
/// `DcpChannel` exclusively; everyone else talks to it through this queue.
enum ChannelCmd {
    RegisterPartition(u16, PartitionHandle),
    UnregisterPartition(u16),
    OpenStream(StreamRequest),
    CloseStream(u16),
    GetFailoverLog(u16),
    GetSeqnos,
    RequestManifest(u16),
    CheckDeadConnection,
    Reconnect(flume::Sender<Result<()>>),
    Shutdown,
}

/// Handle to a channel's I/O task, held by the Conductor's registry.
struct ChannelHandle {
    cmd_tx: flume::Sender<ChannelCmd>,
    state_fetched: Arc<AtomicBool>,
}

impl ChannelHandle {
    fn send(&self, cmd: ChannelCmd) {
        let _ = self.cmd_tx.send(cmd);
    }
}

/// Per-vbucket routing entry and cluster-wide bookkeeping.
pub struct Conductor {
    config: ClientConfig,
    config_provider: Arc<dyn ConfigProvider>,
    authenticator: Arc<dyn Authenticator>,
    data_cb: Arc<dyn DataCallback>,
    control_cb: Arc<dyn ControlCallback>,
    system_cb: Arc<dyn SystemEventCallback>,

    session: RwLock<SessionState>,
    channels: RwLock<BTreeMap<NodeAddress, ChannelHandle>>,
    routing: RwLock<BTreeMap<u16, NodeAddress>>,

    system_tx: flume::Sender<SystemEvent>,
    system_rx_for_fixer: Mutex<Option<flume::Receiver<SystemEvent>>>,
    results_tx: flume::Sender<ChannelResult>,
    results_rx_for_pump: Mutex<Option<flume::Receiver<ChannelResult>>>,

    connected: AtomicBool,
    terminal: AtomicBool,
}

impl Conductor {
    /// Build a new, unconnected conductor. Call [`Conductor::connect`] to
    /// start its background tasks.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ClientConfig,
        config_provider: Arc<dyn ConfigProvider>,
        authenticator: Arc<dyn Authenticator>,
        data_cb: Arc<dyn DataCallback>,
        control_cb: Arc<dyn ControlCallback>,
        system_cb: Arc<dyn SystemEventCallback>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let vbids = config.vbuckets.clone().unwrap_or_default();
        let (system_tx, system_rx) = flume::unbounded();
        let (results_tx, results_rx) = flume::unbounded();

        Ok(Arc::new(Self {
            config,
            config_provider,
            authenticator,
            data_cb,
            control_cb,
            system_cb,
            session: RwLock::new(SessionState::new(vbids)),
            channels: RwLock::new(BTreeMap::new()),
            routing: RwLock::new(BTreeMap::new()),
            system_tx,
            system_rx_for_fixer: Mutex::new(Some(system_rx)),
            results_tx,
            results_rx_for_pump: Mutex::new(Some(results_rx)),
            connected: AtomicBool::new(false),
            terminal: AtomicBool::new(false),
        }))
    }

    /// Restore session state from a previously persisted snapshot before
    /// connecting.
    pub fn restore_session(&self, json: &str) -> Result<()> {
        let (snapshots, streams) = SessionState::deserialize_snapshots(json)?;
        let mut session = self.session.write();
        for snapshot in &snapshots {
            session.apply_snapshot(snapshot);
        }
        session.streams = streams;
        Ok(())
    }

    /// Serialize the current session state for later persistence.
    #[must_use]
    pub fn persist_session(&self) -> String {
        self.session.read().serialize()
    }

    /// Idempotent: a second call is a no-op.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.connected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let results_rx = self
            .results_rx_for_pump
            .lock()
            .take()
            .expect("connect called exactly once");
        compio::runtime::spawn(Arc::clone(self).run_results_pump(results_rx)).detach();

        let system_rx = self
            .system_rx_for_fixer
            .lock()
            .take()
            .expect("connect called exactly once");
        let fixer = Fixer::new(system_rx, Arc::clone(self), self.config.dead_connection_detection_interval);
        compio::runtime::spawn(fixer.run()).detach();

        self.establish_dcp_connections().await
    }

    /// Refresh the cluster config and reconcile channels/routing against it.
    /// Shared by both the initial bootstrap and rebalance recovery paths.
    pub(crate) async fn establish_dcp_connections(self: &Arc<Self>) -> Result<()> {
        self.refresh_config().await?;

        let vbids: Vec<u16> = {
            let routing = self.routing.read();
            routing.keys().copied().collect()
        };
        for vbid in vbids {
            self.start_stream_for_partition(vbid).await;
        }
        Ok(())
    }

    /// Fetch the latest topology, fan it into the channel registry and the
    /// `vbid -> node` routing table. Does not itself (re)start streams.
    pub(crate) async fn refresh_config(self: &Arc<Self>) -> Result<()> {
        let bucket_config = self
            .config_provider
            .refresh()
            .await
            .map_err(|e| DcpError::disconnected(format!("config provider refresh failed: {e}")))?;

        let subset = self.config.vbuckets.as_deref();
        let masters = bucket_config.distinct_masters(subset);

        for node in &masters {
            self.ensure_channel(*node);
        }

        let vbids: Vec<u16> = match subset {
            Some(s) => s.to_vec(),
            None => bucket_config.vbucket_map.keys().copied().collect(),
        };

        for vbid in vbids {
            if let Some(node) = bucket_config.master_for(vbid) {
                let moved = {
                    let mut routing = self.routing.write();
                    let prev = routing.insert(vbid, node);
                    prev.is_some_and(|p| p != node)
                };
                let handle = self.session.write().ensure_partition(vbid);
                if let Some(ch) = self.channels.read().get(&node) {
                    ch.send(ChannelCmd::RegisterPartition(vbid, handle));
                }
                if moved {
                    debug!(vbid, %node, "vbucket master changed on rebalance");
                }
            }
        }

        let live_nodes: BTreeSet<NodeAddress> = masters.into_iter().collect();
        let orphaned: Vec<NodeAddress> = self
            .channels
            .read()
            .keys()
            .filter(|n| !live_nodes.contains(n))
            .copied()
            .collect();
        for node in orphaned {
            info!(%node, "node no longer master of any tracked vbucket, tearing down its channel");
            self.remove_channel(node);
        }

        Ok(())
    }

    #[must_use]
    pub(crate) fn master_for(&self, vbid: u16) -> Option<NodeAddress> {
        self.routing.read().get(&vbid).copied()
    }

    #[must_use]
    pub(crate) fn node_still_a_master(&self, node: NodeAddress) -> bool {
        self.routing.read().values().any(|n| *n == node)
    }

    /// Make sure a channel task exists for `node`; no-op if one is already
    /// registered.
    pub(crate) fn ensure_channel(self: &Arc<Self>, node: NodeAddress) {
        if self.channels.read().contains_key(&node) {
            return;
        }
        let mut channels = self.channels.write();
        if channels.contains_key(&node) {
            return;
        }

        let (cmd_tx, cmd_rx) = flume::unbounded();
        let state_fetched = Arc::new(AtomicBool::new(false));

        let dcp_channel = DcpChannel::new(
            node,
            &self.config,
            Arc::clone(&self.authenticator),
            Arc::clone(&self.data_cb),
            Arc::clone(&self.control_cb),
            self.system_tx.clone(),
            self.results_tx.clone(),
        );

        let actor = ChannelActor {
            channel: dcp_channel,
            cmd_rx,
            state_fetched: Arc::clone(&state_fetched),
            attempt_timeout: self.config.dcp_channel_attempt_timeout,
            total_timeout: self.config.dcp_channel_total_timeout,
            dead_connection_period: self.config.dead_connection_detection_interval,
        };
        compio::runtime::spawn(actor.run()).detach();

        channels.insert(node, ChannelHandle { cmd_tx, state_fetched });
    }

    /// Tear down a channel's task and clear its routing entries.
    pub(crate) fn remove_channel(&self, node: NodeAddress) {
        if let Some(handle) = self.channels.write().remove(&node) {
            handle.send(ChannelCmd::Shutdown);
        }
        self.routing.write().retain(|_, n| *n != node);
    }

    /// Synthesise a recoverable `StreamEnd` for every vbucket routed to
    /// `node`, without touching the routing table itself — the Fixer
    /// decides whether to keep routing entries around for a reconnect
    /// attempt.
    pub(crate) fn drop_channel_streams(&self, node: NodeAddress, reason: dcp_protocol::message::StreamEndReason) {
        let vbids: Vec<u16> = self
            .routing
            .read()
            .iter()
            .filter(|(_, n)| **n == node)
            .map(|(vbid, _)| *vbid)
            .collect();
        for vbid in vbids {
            let _ = self.system_tx.send(SystemEvent::StreamEnd { vbid, reason });
        }
    }

    /// Make one attempt to bring `node`'s channel back up. Further attempts
    /// go through the Fixer's normal backoff/retry machinery.
    pub(crate) async fn reconnect_channel_once(&self, node: NodeAddress) -> Result<()> {
        let (respond_tx, respond_rx) = flume::bounded(1);
        {
            let channels = self.channels.read();
            let handle = channels.get(&node).ok_or_else(|| DcpError::disconnected(node.to_string()))?;
            handle.send(ChannelCmd::Reconnect(respond_tx));
        }
        respond_rx
            .recv_async()
            .await
            .unwrap_or_else(|_| Err(DcpError::disconnected(node.to_string())))
    }

    /// Register `vbid` against `node`'s channel and the routing table, then
    /// (re)start its stream.
    pub(crate) fn register_partition_on(&self, vbid: u16, node: NodeAddress) {
        self.routing.write().insert(vbid, node);
        let handle = self.session.write().ensure_partition(vbid);
        if let Some(ch) = self.channels.read().get(&node) {
            ch.send(ChannelCmd::RegisterPartition(vbid, handle));
        }
    }

    /// Compute the next `DCP_STREAM_REQ` for `vbid` from its current
    /// session state and dispatch it to the owning channel.
    pub(crate) async fn prepare_and_restart_stream(&self, vbid: u16) {
        self.start_stream_for_partition(vbid).await;
    }

    async fn start_stream_for_partition(&self, vbid: u16) {
        let Some(node) = self.master_for(vbid) else {
            warn!(vbid, "no known master, cannot start stream");
            return;
        };

        let handle = self.session.write().ensure_partition(vbid);
        let vbuuid = self.session.read().current_vbuuid(vbid);
        let req = {
            let mut ps = handle.lock();
            if matches!(ps.state(), crate::partition::ConnState::Connecting | crate::partition::ConnState::Connected) {
                debug!(vbid, state = ?ps.state(), "stream already open, start_stream_for_partition is a no-op");
                return;
            }
            ps.prepare_next_stream_request(vbuuid);
            ps.pending_stream_request.expect("just set above")
        };

        if let Some(ch) = self.channels.read().get(&node) {
            ch.send(ChannelCmd::OpenStream(req));
        }
    }

    /// Request a stream stop for `vbid`.
    pub fn request_stop_stream(&self, vbid: u16) -> Result<()> {
        let node = self.master_for(vbid).ok_or(DcpError::NoMasterForVbucket(vbid))?;
        self.channels
            .read()
            .get(&node)
            .ok_or_else(|| DcpError::disconnected(node.to_string()))?
            .send(ChannelCmd::CloseStream(vbid));
        Ok(())
    }

    /// Poll until `vbid`'s partition leaves `Connecting`/`Disconnecting`, or
    /// `timeout` elapses.
    pub async fn wait_for_stop(&self, vbid: u16, timeout: Duration) -> Result<()> {
        let handle = self
            .session
            .read()
            .partition(vbid)
            .ok_or(DcpError::NoMasterForVbucket(vbid))?;
        wait_for(
            &handle,
            |ps| !matches!(ps.state(), crate::partition::ConnState::Disconnecting),
            timeout,
        )
        .await
    }

    /// Request a failover-log refresh for `vbid`.
    pub fn request_failover_log(&self, vbid: u16) -> Result<()> {
        let node = self.master_for(vbid).ok_or(DcpError::NoMasterForVbucket(vbid))?;
        self.channels
            .read()
            .get(&node)
            .ok_or_else(|| DcpError::disconnected(node.to_string()))?
            .send(ChannelCmd::GetFailoverLog(vbid));
        Ok(())
    }

    /// Request, then wait for, a failover-log refresh for `vbid`.
    pub async fn wait_for_failover_log(
        &self,
        vbid: u16,
        timeout: Duration,
    ) -> Result<Vec<dcp_protocol::message::FailoverLogEntry>> {
        let handle = self.session.write().ensure_partition(vbid);
        let since = handle.lock().data_waiter.mark();
        self.request_failover_log(vbid)?;

        let deadline = Instant::now() + timeout;
        loop {
            if handle.lock().data_waiter.mark() != since {
                break;
            }
            if Instant::now() >= deadline {
                return Err(DcpError::Timeout(timeout));
            }
            compio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(self.session.read().failover_logs.get(&vbid).cloned().unwrap_or_default())
    }

    /// Broadcast `GET_ALL_VB_SEQNOS` to every channel and wait until each has
    /// reported its sample, or `timeout` elapses.
    pub async fn get_seqnos(&self, timeout: Duration) -> Result<()> {
        let nodes: Vec<NodeAddress> = self.channels.read().keys().copied().collect();
        for node in &nodes {
            if let Some(ch) = self.channels.read().get(node) {
                ch.send(ChannelCmd::GetSeqnos);
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let all_fetched = self
                .channels
                .read()
                .values()
                .all(|ch| ch.state_fetched.load(Ordering::Acquire));
            if all_fetched {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DcpError::Timeout(timeout));
            }
            compio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Request the collections manifest for `vbid`'s current master.
    pub fn request_collections_manifest(&self, vbid: u16) -> Result<()> {
        let node = self.master_for(vbid).ok_or(DcpError::NoMasterForVbucket(vbid))?;
        self.channels
            .read()
            .get(&node)
            .ok_or_else(|| DcpError::disconnected(node.to_string()))?
            .send(ChannelCmd::RequestManifest(vbid));
        Ok(())
    }

    /// Tick the dead-connection detector across every registered channel,
    /// driven by the Fixer's own wake cycle.
    pub(crate) fn tick_dead_connections(&self) {
        for handle in self.channels.read().values() {
            handle.send(ChannelCmd::CheckDeadConnection);
        }
    }

    pub(crate) fn publish_unexpected_failure(&self, cause: String) {
        self.system_cb.system_event(SystemEvent::UnexpectedFailure { cause });
    }

    pub(crate) fn publish_rollback(&self, vbid: u16, seqno: u64) {
        self.system_cb.system_event(SystemEvent::Rollback { vbid, seqno });
    }

    /// Tear down every channel and stop the background tasks. `wait` is
    /// currently advisory — shutdown is fire-and-forget either way.
    pub fn disconnect(&self, _wait: bool) {
        if self.terminal.swap(true, Ordering::AcqRel) {
            return;
        }
        let nodes: Vec<NodeAddress> = self.channels.read().keys().copied().collect();
        for node in nodes {
            self.remove_channel(node);
        }
        let _ = self.system_tx.send(SystemEvent::Disconnect);
    }

    async fn run_results_pump(self: Arc<Self>, results_rx: flume::Receiver<ChannelResult>) {
        while let Ok(result) = results_rx.recv_async().await {
            self.apply_result(result);
        }
    }

    fn apply_result(&self, result: ChannelResult) {
        match result {
            ChannelResult::FailoverLogUpdated { vbid, entries } => {
                let handle = {
                    let mut session = self.session.write();
                    session.set_failover_log(vbid, entries);
                    session.ensure_partition(vbid)
                };
                handle.lock().touch_data();
            }
            ChannelResult::SeqnosFetched { node } => {
                debug!(%node, "seqno sample applied");
            }
            ChannelResult::ManifestFetched { vbid, json } => {
                if let Some(uid) = parse_manifest_uid(&json) {
                    if let Some(handle) = self.session.read().partition(vbid) {
                        let mut ps = handle.lock();
                        ps.manifest_uid = uid;
                        ps.touch_data();
                    }
                }
            }
        }
    }
}

async fn wait_for<F>(handle: &PartitionHandle, pred: F, timeout: Duration) -> Result<()>
where
    F: Fn(&crate::partition::PartitionState) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if pred(&handle.lock()) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(DcpError::Timeout(timeout));
        }
        compio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn parse_manifest_uid(json: &bytes::Bytes) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_slice(json).ok()?;
    let uid = value.get("uid")?;
    if let Some(n) = uid.as_u64() {
        return Some(n);
    }
    let s = uid.as_str()?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

/// One channel's I/O context, run as its own task rather than an OS
/// thread. Owns the `DcpChannel` exclusively; reacts to commands from the
/// Conductor and pumps the socket between them.
struct ChannelActor {
    channel: DcpChannel,
    cmd_rx: flume::Receiver<ChannelCmd>,
    state_fetched: Arc<AtomicBool>,
    attempt_timeout: Duration,
    total_timeout: Duration,
    dead_connection_period: Duration,
}

impl ChannelActor {
    async fn run(mut self) {
        if let Err(e) = self.channel.connect(self.attempt_timeout, self.total_timeout).await {
            warn!(node = %self.channel.node, error = %e, "initial channel connect failed, awaiting fixer recovery");
        }

        loop {
            self.state_fetched.store(self.channel.is_state_fetched(), Ordering::Release);

            futures::select! {
                cmd = self.cmd_rx.recv_async().fuse() => {
                    match cmd {
                        Ok(ChannelCmd::Shutdown) | Err(_) => break,
                        Ok(cmd) => self.apply_cmd(cmd).await,
                    }
                }
                _ = self.pump_or_sleep().fuse() => {}
            }
        }
    }

    async fn pump_or_sleep(&mut self) {
        if !self.channel.is_connected() {
            compio::time::sleep(self.dead_connection_period.min(Duration::from_secs(1))).await;
            return;
        }
        match compio::time::timeout(self.dead_connection_period, self.channel.pump()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(node = %self.channel.node, error = %e, "channel pump failed"),
            Err(_) => {}
        }
        self.channel.check_dead_connection(Instant::now());
    }

    async fn apply_cmd(&mut self, cmd: ChannelCmd) {
        let result = match cmd {
            ChannelCmd::RegisterPartition(vbid, handle) => {
                self.channel.register_partition(vbid, handle);
                Ok(())
            }
            ChannelCmd::UnregisterPartition(vbid) => {
                self.channel.unregister_partition(vbid);
                Ok(())
            }
            ChannelCmd::OpenStream(req) => self.channel.open_stream(req).await,
            ChannelCmd::CloseStream(vbid) => self.channel.close_stream(vbid).await,
            ChannelCmd::GetFailoverLog(vbid) => self.channel.get_failover_log(vbid).await,
            ChannelCmd::GetSeqnos => self.channel.get_seqnos().await,
            ChannelCmd::RequestManifest(vbid) => self.channel.request_collections_manifest(vbid).await,
            ChannelCmd::CheckDeadConnection => {
                self.channel.check_dead_connection(Instant::now());
                Ok(())
            }
            ChannelCmd::Reconnect(respond) => {
                let result = self.channel.connect(self.attempt_timeout, Duration::ZERO).await;
                let _ = respond.send_async(result).await;
                return;
            }
            ChannelCmd::Shutdown => return,
        };
        if let Err(e) = result {
            warn!(node = %self.channel.node, error = %e, "channel command failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn parse_manifest_uid_accepts_numeric_and_hex_string() {
        let numeric = bytes::Bytes::from_static(br#"{"uid":42}"#);
        assert_eq!(parse_manifest_uid(&numeric), Some(42));

        let hex = bytes::Bytes::from_static(br#"{"uid":"0x2a"}"#);
        assert_eq!(parse_manifest_uid(&hex), Some(42));
    }

    #[test]
    fn parse_manifest_uid_rejects_garbage() {
        let garbage = bytes::Bytes::from_static(b"not json");
        assert_eq!(parse_manifest_uid(&garbage), None);
    }

    #[test]
    fn addr_helper_round_trips() {
        assert_eq!(addr(11210).socket_addr().port(), 11210);
    }
}
