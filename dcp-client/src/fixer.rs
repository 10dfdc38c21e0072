//! Fixer: the single-task recovery controller consuming the system-event
//! inbox. Processes one anomaly at a time against a consistent view of the
//! cluster config, on a single-threaded event loop that drains its inbox
//! and a time-ordered backlog of deferred retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use dcp_core::endpoint::NodeAddress;
use dcp_protocol::message::StreamEndReason;
use dcp_protocol::opcode::Status;

use crate::conductor::Conductor;
use crate::events::SystemEvent;

/// Events past this many reattempts are given up on rather than retried
/// forever.
pub const MAX_REATTEMPTS: u32 = 100;

struct Backlogged {
    deadline: Instant,
    event: SystemEvent,
    attempts: u32,
}

/// Single-task recovery controller. Drains `inbox_rx`, and retries events
/// that can't be resolved immediately via a time-ordered backlog rather than
/// blocking the whole loop on one slow recovery.
pub struct Fixer {
    inbox_rx: flume::Receiver<SystemEvent>,
    conductor: Arc<Conductor>,
    backlog: Vec<Backlogged>,
    dead_connection_period: Duration,
}

impl Fixer {
    pub(crate) fn new(
        inbox_rx: flume::Receiver<SystemEvent>,
        conductor: Arc<Conductor>,
        dead_connection_period: Duration,
    ) -> Self {
        Self {
            inbox_rx,
            conductor,
            backlog: Vec::new(),
            dead_connection_period,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.backlog.iter().map(|b| b.deadline).min()
    }

    /// Main loop: `inbox.poll(min(dead_connection_period, next_backlog_due))`;
    /// on wake, drain whatever backlog entries are ready and tick the
    /// dead-connection detector across every channel.
    pub async fn run(mut self) {
        loop {
            let now = Instant::now();
            let wait = match self.next_deadline() {
                Some(d) if d > now => (d - now).min(self.dead_connection_period),
                Some(_) => Duration::from_millis(0),
                None => self.dead_connection_period,
            };

            futures::select! {
                msg = self.inbox_rx.recv_async().fuse() => {
                    match msg {
                        Ok(SystemEvent::Disconnect) | Err(_) => break,
                        Ok(event) => self.handle(event, 0).await,
                    }
                }
                _ = compio::time::sleep(wait).fuse() => {
                    self.drain_backlog().await;
                    self.conductor.tick_dead_connections();
                }
            }
        }
        debug!("fixer stopped");
    }

    async fn drain_backlog(&mut self) {
        let now = Instant::now();
        let mut ready = Vec::new();
        self.backlog.retain(|b| {
            if b.deadline <= now {
                ready.push((b.event.clone(), b.attempts));
                false
            } else {
                true
            }
        });
        for (event, attempts) in ready {
            self.handle(event, attempts).await;
        }
    }

    fn reschedule(&mut self, event: SystemEvent, attempts: u32, delay: Duration) {
        let attempts = attempts + 1;
        if attempts > MAX_REATTEMPTS {
            error!(attempts, "fixer retry budget exhausted, giving up");
            self.conductor.disconnect(false);
            self.conductor
                .publish_unexpected_failure(format!("retry budget exhausted after {attempts} attempts"));
            return;
        }
        self.backlog.push(Backlogged {
            deadline: Instant::now() + delay,
            event,
            attempts,
        });
    }

    async fn handle(&mut self, event: SystemEvent, attempts: u32) {
        match event {
            SystemEvent::ChannelDropped { node } => self.handle_channel_dropped(node, attempts).await,
            SystemEvent::StreamEnd { vbid, reason } => self.handle_stream_end(vbid, reason, attempts).await,
            SystemEvent::OpenStreamResponse { vbid, status, backoff } => {
                self.handle_open_stream_response(vbid, status, backoff, attempts).await;
            }
            SystemEvent::Rollback { vbid, seqno } => self.handle_rollback(vbid, seqno),
            SystemEvent::NotMyVbucket { vbid } => {
                self.handle_stream_end(vbid, StreamEndReason::StateChanged, attempts).await;
            }
            SystemEvent::UnexpectedFailure { cause } => {
                error!(cause, "unexpected failure reported to fixer");
                self.conductor.disconnect(false);
            }
            SystemEvent::Disconnect => {}
        }
    }

    async fn handle_channel_dropped(&mut self, node: NodeAddress, attempts: u32) {
        warn!(%node, "channel dropped, refreshing cluster config");
        if let Err(e) = self.conductor.refresh_config().await {
            warn!(%node, error = %e, "config refresh failed, retrying");
            self.reschedule(SystemEvent::ChannelDropped { node }, attempts, backoff_delay(attempts));
            return;
        }

        if !self.conductor.node_still_a_master(node) {
            self.conductor.drop_channel_streams(node, StreamEndReason::ChannelDropped);
            self.conductor.remove_channel(node);
            return;
        }

        match self.conductor.reconnect_channel_once(node).await {
            Ok(()) => info!(%node, "channel reconnected"),
            Err(e) => {
                warn!(%node, error = %e, "channel reconnect failed, dropping its streams for the fixer to re-route");
                self.conductor.drop_channel_streams(node, StreamEndReason::ChannelDropped);
                self.conductor.remove_channel(node);
            }
        }
    }

    async fn handle_stream_end(&mut self, vbid: u16, reason: StreamEndReason, attempts: u32) {
        match reason {
            StreamEndReason::Closed | StreamEndReason::Ok | StreamEndReason::FilterEmpty | StreamEndReason::LostPrivileges => {
                debug!(vbid, ?reason, "stream end, no action needed");
            }
            StreamEndReason::Disconnected => {
                debug!(vbid, "stream end: disconnected, awaiting channel-dropped event");
            }
            StreamEndReason::TooSlow => {
                warn!(vbid, "stream end: consumer too slow, no automatic recovery");
            }
            StreamEndReason::BackfillFail
            | StreamEndReason::StateChanged
            | StreamEndReason::ChannelDropped
            | StreamEndReason::Unknown(_) => {
                self.reroute_stream(vbid, SystemEvent::StreamEnd { vbid, reason }, attempts).await;
            }
        }
    }

    async fn handle_open_stream_response(&mut self, vbid: u16, status: Status, backoff: Duration, attempts: u32) {
        match status {
            Status::ManifestIsAhead => {
                compio::time::sleep(backoff).await;
                self.conductor.prepare_and_restart_stream(vbid).await;
            }
            Status::InvalidArguments => {
                error!(vbid, "invalid arguments opening stream, fatal");
                self.conductor.disconnect(false);
                self.conductor
                    .publish_unexpected_failure(format!("invalid arguments opening stream for vbucket {vbid}"));
            }
            Status::Success | Status::Rollback | Status::NotMyVbucket => {
                debug!(vbid, ?status, "open-stream-response carried a status this path never expects, ignoring");
            }
            Status::Unknown(code) => {
                debug!(vbid, code, "non-success open-stream-response, routing to the vbucket's current master");
                self.reroute_stream(vbid, SystemEvent::OpenStreamResponse { vbid, status, backoff }, attempts)
                    .await;
            }
        }
    }

    /// Shared recovery path for `StreamEnd`/`OpenStreamResponse` anomalies
    /// that call for finding a (possibly new) master and restarting the
    /// stream there. `retry_event` is what gets rescheduled if no master is
    /// known yet.
    async fn reroute_stream(&mut self, vbid: u16, retry_event: SystemEvent, attempts: u32) {
        if let Err(e) = self.conductor.refresh_config().await {
            warn!(vbid, error = %e, "config refresh failed while rerouting stream");
            self.reschedule(retry_event, attempts, backoff_delay(attempts));
            return;
        }

        match self.conductor.master_for(vbid) {
            Some(node) => {
                self.conductor.ensure_channel(node);
                self.conductor.register_partition_on(vbid, node);
                self.conductor.prepare_and_restart_stream(vbid).await;
            }
            None => self.reschedule(retry_event, attempts, backoff_delay(attempts)),
        }
    }

    fn handle_rollback(&mut self, vbid: u16, seqno: u64) {
        warn!(vbid, seqno, "rollback reported, disconnecting");
        self.conductor.disconnect(false);
        self.conductor.publish_rollback(vbid, seqno);
    }
}

fn backoff_delay(attempts: u32) -> Duration {
    let shift = attempts.min(6);
    Duration::from_secs(1u64 << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_caps_at_64_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(6), Duration::from_secs(64));
        assert_eq!(backoff_delay(20), Duration::from_secs(64));
    }
}
