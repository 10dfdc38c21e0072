//! Flow control accounting for a single DCP channel.
//!
//! The server throttles a producer connection to `buffer_size` bytes of
//! un-acknowledged data; the client must send DCP_BUFFER_ACK often enough
//! that the server never blocks waiting for room. `FlowController` only does
//! the accounting — turning bytes-seen into "yes, send an ack now" — callers
//! own the actual write.

/// Tracks unacknowledged bytes against a configured buffer size and
/// watermark, deciding when a DCP_BUFFER_ACK is due.
#[derive(Debug, Clone, Copy)]
pub struct FlowController {
    buffer_size: usize,
    watermark_percent: u8,
    unacked_bytes: usize,
    pending_ack_bytes: usize,
}

impl FlowController {
    /// `watermark_percent` is the percentage of `buffer_size` that must be
    /// unacknowledged before an ack is due; 0 disables flow control
    /// entirely (every call to `on_bytes_received` returns `false`).
    #[must_use]
    pub const fn new(buffer_size: usize, watermark_percent: u8) -> Self {
        Self {
            buffer_size,
            watermark_percent,
            unacked_bytes: 0,
            pending_ack_bytes: 0,
        }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(0, 0)
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.buffer_size > 0
    }

    #[must_use]
    pub const fn unacked_bytes(&self) -> usize {
        self.unacked_bytes
    }

    /// Record that `n` bytes of DCP payload were just delivered. Returns
    /// `true` once the unacked total crosses the watermark and a
    /// DCP_BUFFER_ACK should be sent; the caller is then expected to call
    /// [`FlowController::ack_sent`] once it has actually written the ack.
    pub fn on_bytes_received(&mut self, n: usize) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.unacked_bytes += n;
        self.pending_ack_bytes += n;

        let crossed = self.unacked_bytes.saturating_mul(100) / self.buffer_size
            >= self.watermark_percent as usize;
        crossed
    }

    /// The number of bytes a DCP_BUFFER_ACK sent right now should carry.
    #[must_use]
    pub const fn ack_due_bytes(&self) -> usize {
        self.pending_ack_bytes
    }

    /// Call once the ack for `ack_due_bytes()` has actually been written.
    pub fn ack_sent(&mut self) {
        self.unacked_bytes = self.unacked_bytes.saturating_sub(self.pending_ack_bytes);
        self.pending_ack_bytes = 0;
    }

    /// Reset all accounting, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.unacked_bytes = 0;
        self.pending_ack_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_controller_never_requests_acks() {
        let mut fc = FlowController::disabled();
        assert!(!fc.on_bytes_received(1_000_000));
    }

    #[test]
    fn crosses_watermark_at_configured_percent() {
        let mut fc = FlowController::new(1000, 50);
        assert!(!fc.on_bytes_received(400));
        assert!(fc.on_bytes_received(100));
        assert_eq!(fc.ack_due_bytes(), 500);
    }

    #[test]
    fn ack_sent_clears_pending_but_keeps_remainder_accounted() {
        let mut fc = FlowController::new(1000, 50);
        fc.on_bytes_received(600);
        assert_eq!(fc.unacked_bytes(), 600);
        fc.ack_sent();
        assert_eq!(fc.unacked_bytes(), 0);
        assert_eq!(fc.ack_due_bytes(), 0);
    }

    #[test]
    fn reset_clears_all_state() {
        let mut fc = FlowController::new(1000, 50);
        fc.on_bytes_received(900);
        fc.reset();
        assert_eq!(fc.unacked_bytes(), 0);
        assert_eq!(fc.ack_due_bytes(), 0);
    }
}
