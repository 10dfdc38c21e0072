//! Immutable client configuration, injected once at `Conductor::new`.
//!
//! Builder-pattern `with_*` methods mirror `dcp_core::options::ChannelOptions`
//! — no process-wide static defaults, only values threaded explicitly
//! through the constructor.

use std::collections::BTreeMap;
use std::time::Duration;

use dcp_core::options::ChannelOptions;

/// Which of a bucket's two network views to resolve node addresses against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkResolution {
    #[default]
    Default,
    External,
}

/// TLS options. Concrete keystore/password handling is out of scope for this
/// core; the fields exist so `Config` round-trips what a bootstrap layer
/// would need without this crate implementing certificate loading itself.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub keystore_path: Option<String>,
    pub keystore_password: Option<String>,
}

/// Immutable client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub bucket: String,
    pub cluster_seeds: Vec<String>,
    pub connection_name: String,
    pub collection_ids: Vec<u32>,
    pub vbuckets: Option<Vec<u16>>,
    pub network_resolution: NetworkResolution,
    pub tls: TlsConfig,
    pub bootstrap_http_port: u16,
    pub bootstrap_https_port: u16,

    pub buffer_ack_watermark_percent: u8,
    pub flow_control_buffer_size: usize,
    pub pool_buffers: bool,

    pub config_provider_attempt_timeout: Duration,
    pub config_provider_total_timeout: Duration,
    pub config_provider_reconnect_delay: Duration,

    pub dcp_channel_attempt_timeout: Duration,
    pub dcp_channel_total_timeout: Duration,
    pub dcp_channels_reconnect_delay: Duration,
    pub dead_connection_detection_interval: Duration,

    /// `opt-name -> value` pairs sent as DCP_CONTROL requests right after
    /// DCP_OPEN, e.g. `enable_noop=true`, `set_noop_interval=20`.
    pub dcp_control_params: BTreeMap<String, String>,

    pub channel_options: ChannelOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let mut dcp_control_params = BTreeMap::new();
        dcp_control_params.insert("enable_noop".to_string(), "true".to_string());
        dcp_control_params.insert("set_noop_interval".to_string(), "20".to_string());
        dcp_control_params.insert("enable_expiry_opcode".to_string(), "true".to_string());
        dcp_control_params.insert("enable_stream_id".to_string(), "true".to_string());

        Self {
            bucket: String::new(),
            cluster_seeds: Vec::new(),
            connection_name: "dcp-client".to_string(),
            collection_ids: Vec::new(),
            vbuckets: None,
            network_resolution: NetworkResolution::default(),
            tls: TlsConfig::default(),
            bootstrap_http_port: 8091,
            bootstrap_https_port: 18091,

            buffer_ack_watermark_percent: 50,
            flow_control_buffer_size: 20 * 1024 * 1024,
            pool_buffers: true,

            config_provider_attempt_timeout: Duration::from_secs(5),
            config_provider_total_timeout: Duration::from_secs(30),
            config_provider_reconnect_delay: Duration::from_secs(1),

            dcp_channel_attempt_timeout: Duration::from_secs(5),
            dcp_channel_total_timeout: Duration::from_secs(30),
            dcp_channels_reconnect_delay: Duration::from_secs(1),
            dead_connection_detection_interval: Duration::from_secs(60),

            dcp_control_params,
            channel_options: ChannelOptions::default(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new(bucket: impl Into<String>, cluster_seeds: Vec<String>) -> Self {
        Self {
            bucket: bucket.into(),
            cluster_seeds,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    #[must_use]
    pub fn with_vbuckets(mut self, vbuckets: Vec<u16>) -> Self {
        self.vbuckets = Some(vbuckets);
        self
    }

    #[must_use]
    pub fn with_collection_ids(mut self, ids: Vec<u32>) -> Self {
        self.collection_ids = ids;
        self
    }

    #[must_use]
    pub fn with_network_resolution(mut self, res: NetworkResolution) -> Self {
        self.network_resolution = res;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn with_buffer_ack_watermark_percent(mut self, pct: u8) -> Self {
        self.buffer_ack_watermark_percent = pct;
        self
    }

    #[must_use]
    pub fn with_flow_control_buffer_size(mut self, size: usize) -> Self {
        self.flow_control_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_dcp_channel_attempt_timeout(mut self, d: Duration) -> Self {
        self.dcp_channel_attempt_timeout = d;
        self
    }

    #[must_use]
    pub fn with_dcp_channel_total_timeout(mut self, d: Duration) -> Self {
        self.dcp_channel_total_timeout = d;
        self
    }

    #[must_use]
    pub fn with_dcp_channels_reconnect_delay(mut self, d: Duration) -> Self {
        self.dcp_channels_reconnect_delay = d;
        self
    }

    #[must_use]
    pub fn with_dead_connection_detection_interval(mut self, d: Duration) -> Self {
        self.dead_connection_detection_interval = d;
        self
    }

    #[must_use]
    pub fn with_dcp_control_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dcp_control_params.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_channel_options(mut self, options: ChannelOptions) -> Self {
        self.channel_options = options;
        self
    }

    /// Validate cross-field constraints a builder cannot catch at each step
    /// (the flow-control watermark rule).
    pub fn validate(&self) -> Result<(), dcp_core::error::DcpError> {
        self.channel_options
            .with_flow_control_buffer_size(Some(self.flow_control_buffer_size))
            .with_buffer_ack_watermark_percent(self.buffer_ack_watermark_percent)
            .validate_flow_control()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        let cfg = ClientConfig::new("my-bucket", vec!["127.0.0.1:8091".to_string()]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_watermark_with_flow_control_enabled_is_rejected() {
        let cfg = ClientConfig::new("b", vec![]).with_buffer_ack_watermark_percent(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builder_overrides_take_effect() {
        let cfg = ClientConfig::new("b", vec![])
            .with_connection_name("custom")
            .with_vbuckets(vec![0, 1, 2]);
        assert_eq!(cfg.connection_name, "custom");
        assert_eq!(cfg.vbuckets, Some(vec![0, 1, 2]));
    }
}
