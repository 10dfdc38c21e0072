//! Per-channel configuration options.
//!
//! Mirrors the builder-style option struct pattern used for socket
//! configuration: an immutable value, `with_*` methods returning `Self`,
//! injected once at construction rather than mutated in place.

use std::time::Duration;

/// Configuration for a single DCP channel (one TCP connection to one KV node).
///
/// # Examples
///
/// ```
/// use dcp_core::options::ChannelOptions;
/// use std::time::Duration;
///
/// let opts = ChannelOptions::default()
///     .with_recv_timeout(Duration::from_secs(5))
///     .with_connect_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Maximum time to wait for a single receive operation.
    /// - `None`: block indefinitely (default)
    /// - `Some(duration)`: return a timeout error if nothing arrives in time
    pub recv_timeout: Option<Duration>,

    /// Maximum time to wait for a single send operation.
    pub send_timeout: Option<Duration>,

    /// Time to wait for pending writes to flush before closing the socket.
    pub linger: Option<Duration>,

    /// Base reconnection delay (`dcp_channels_reconnect_delay` in the
    /// client configuration). Used to seed `dcp_core::reconnect::ReconnectState`.
    pub reconnect_ivl: Duration,

    /// Maximum reconnection delay the exponential backoff is capped at.
    pub reconnect_ivl_max: Duration,

    /// Per-attempt TCP connect timeout (`dcp_channel_attempt_timeout`).
    pub connect_timeout: Duration,

    /// Total time budget across all attempts inside one `connect()` call
    /// (`dcp_channel_total_timeout`). `Duration::ZERO` means a single attempt.
    pub connect_total_timeout: Duration,

    /// Size (bytes) of arena-allocated read buffers.
    /// - Default: 16384 (16KB) — DCP mutation bodies can exceed the 8KB
    ///   default that suits small request/response protocols.
    pub read_buffer_size: usize,

    /// Initial capacity of write buffers used to encode outgoing frames.
    pub write_buffer_size: usize,

    /// Interval at which the channel's dead-connection probe runs
    /// (`dead_connection_detection_interval`).
    pub dead_connection_detection_interval: Duration,

    /// Negotiated DCP flow-control buffer size advertised at DCP_OPEN time.
    /// `None` disables flow control entirely.
    pub flow_control_buffer_size: Option<usize>,

    /// Percentage (0,100] of `flow_control_buffer_size` that must be
    /// consumed-and-acked before a BUFFER_ACK is flushed.
    pub buffer_ack_watermark_percent: u8,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            recv_timeout: None,
            send_timeout: None,
            linger: Some(Duration::from_secs(5)),
            reconnect_ivl: Duration::from_secs(1),
            reconnect_ivl_max: Duration::from_secs(64),
            connect_timeout: Duration::from_secs(10),
            connect_total_timeout: Duration::from_secs(60),
            read_buffer_size: 16384,
            write_buffer_size: 8192,
            dead_connection_detection_interval: Duration::from_secs(30),
            flow_control_buffer_size: Some(20 * 1024 * 1024),
            buffer_ack_watermark_percent: 50,
        }
    }
}

impl ChannelOptions {
    /// Create options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_reconnect_ivl(mut self, ivl: Duration) -> Self {
        self.reconnect_ivl = ivl;
        self
    }

    pub fn with_reconnect_ivl_max(mut self, max: Duration) -> Self {
        self.reconnect_ivl_max = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_connect_total_timeout(mut self, timeout: Duration) -> Self {
        self.connect_total_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn with_buffer_sizes(mut self, read_size: usize, write_size: usize) -> Self {
        self.read_buffer_size = read_size;
        self.write_buffer_size = write_size;
        self
    }

    pub fn with_dead_connection_detection_interval(mut self, interval: Duration) -> Self {
        self.dead_connection_detection_interval = interval;
        self
    }

    pub fn with_flow_control_buffer_size(mut self, size: Option<usize>) -> Self {
        self.flow_control_buffer_size = size;
        self
    }

    pub fn with_buffer_ack_watermark_percent(mut self, percent: u8) -> Self {
        self.buffer_ack_watermark_percent = percent;
        self
    }

    /// Whether a receive call configured this way should return immediately
    /// rather than block.
    pub fn is_recv_nonblocking(&self) -> bool {
        matches!(self.recv_timeout, Some(d) if d.is_zero())
    }

    /// Whether a send call configured this way should return immediately
    /// rather than block.
    pub fn is_send_nonblocking(&self) -> bool {
        matches!(self.send_timeout, Some(d) if d.is_zero())
    }

    /// Validates the flow-control settings: a watermark of 0 with flow
    /// control enabled is a configuration error.
    pub fn validate_flow_control(&self) -> Result<(), crate::error::DcpError> {
        if self.flow_control_buffer_size.is_some() && self.buffer_ack_watermark_percent == 0 {
            return Err(crate::error::DcpError::InvalidFlowControl(
                "buffer_ack_watermark_percent must be in (0,100] when flow control is enabled"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = ChannelOptions::default();
        assert!(opts.recv_timeout.is_none());
        assert!(opts.send_timeout.is_none());
        assert_eq!(opts.reconnect_ivl, Duration::from_secs(1));
        assert_eq!(opts.reconnect_ivl_max, Duration::from_secs(64));
    }

    #[test]
    fn builder_pattern() {
        let opts = ChannelOptions::new()
            .with_recv_timeout(Duration::from_secs(5))
            .with_connect_timeout(Duration::from_secs(3));

        assert_eq!(opts.recv_timeout, Some(Duration::from_secs(5)));
        assert_eq!(opts.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn nonblocking_checks() {
        let blocking = ChannelOptions::new();
        assert!(!blocking.is_recv_nonblocking());

        let nonblocking = ChannelOptions::new().with_recv_timeout(Duration::ZERO);
        assert!(nonblocking.is_recv_nonblocking());
    }

    #[test]
    fn rejects_zero_watermark_with_flow_control_enabled() {
        let opts = ChannelOptions::new()
            .with_flow_control_buffer_size(Some(1024))
            .with_buffer_ack_watermark_percent(0);
        assert!(opts.validate_flow_control().is_err());
    }

    #[test]
    fn accepts_zero_watermark_with_flow_control_disabled() {
        let opts = ChannelOptions::new()
            .with_flow_control_buffer_size(None)
            .with_buffer_ack_watermark_percent(0);
        assert!(opts.validate_flow_control().is_ok());
    }
}
