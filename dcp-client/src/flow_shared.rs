//! Thread-shared wrapper around [`dcp_protocol::flow::FlowController`].
//!
//! `AckHandle`s (held by user callbacks) and the channel's writer task both
//! need to touch the same flow-control accounting; this is the seam between
//! them, a short `parking_lot` critical section plus a `flume` channel
//! telling the writer task when a BUFFER_ACK is due — matching the
//! teacher's pattern of `parking_lot` for short critical sections and
//! `flume` for cross-task signalling.

use dcp_protocol::flow::FlowController;
use parking_lot::Mutex;
use std::sync::Arc;

/// Clone-able handle shared between a channel's I/O context and the
/// `AckHandle`s it hands out to user callbacks.
#[derive(Clone)]
pub struct SharedFlowController {
    inner: Arc<Inner>,
}

struct Inner {
    controller: Mutex<FlowController>,
    ack_due: flume::Sender<usize>,
}

impl SharedFlowController {
    #[must_use]
    pub fn new(buffer_size: usize, watermark_percent: u8) -> (Self, flume::Receiver<usize>) {
        let (tx, rx) = flume::unbounded();
        let shared = Self {
            inner: Arc::new(Inner {
                controller: Mutex::new(FlowController::new(buffer_size, watermark_percent)),
                ack_due: tx,
            }),
        };
        (shared, rx)
    }

    /// Credit `n` bytes of DCP payload back to the server. Called from
    /// `AckHandle::ack`/`Drop` once a frame has actually been consumed; an
    /// un-acked frame holds its credit indefinitely, which is the point of
    /// routing BUFFER_ACK accounting through here rather than through
    /// delivery. If the watermark is crossed, notifies the writer task with
    /// the number of bytes to acknowledge.
    pub fn ack_bytes(&self, n: usize) {
        let mut controller = self.inner.controller.lock();
        if controller.on_bytes_received(n) {
            let due = controller.ack_due_bytes();
            controller.ack_sent();
            let _ = self.inner.ack_due.send(due);
        }
    }

    pub fn reset(&self) {
        self.inner.controller.lock().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crossing_watermark_notifies_writer() {
        let (flow, rx) = SharedFlowController::new(1000, 50);
        flow.ack_bytes(600);
        assert_eq!(rx.try_recv().unwrap(), 600);
    }

    #[test]
    fn below_watermark_does_not_notify() {
        let (flow, rx) = SharedFlowController::new(1000, 50);
        flow.ack_bytes(100);
        assert!(rx.try_recv().is_err());
    }
}
