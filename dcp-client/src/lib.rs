//! # dcp-client
//!
//! A Couchbase DCP (Database Change Protocol) streaming client built on
//! `io_uring` via `compio`.
//!
//! ## Architecture
//!
//! - **[`conductor`]**: the `Conductor` — one task per DCP channel, a
//!   registry mapping vbuckets to their current master node, and the public
//!   API surface for starting/stopping streams.
//! - **[`fixer`]**: the `Fixer` — a single recovery task consuming channel
//!   anomalies (dropped connections, stream ends, rollbacks, topology
//!   changes) and re-routing/retrying them with backoff.
//! - **[`channel`]**: `DcpChannel` — one memcached-binary-protocol TCP
//!   connection to one KV node, built on `dcp-protocol`'s sans-IO codec.
//! - **[`partition`]** / **[`session_state`]**: per-vbucket durable state and
//!   its JSON persistence shape.
//! - **[`config`]** / **[`config_provider`]** / **[`auth`]**: immutable
//!   client configuration and the cluster-topology/SASL collaborator seams.
//! - **[`events`]**: the user-facing callback traits, event types, and the
//!   flow-control `AckHandle` contract.
//!
//! No socket, executor, or timer concerns live in `dcp-protocol` — this
//! crate is where they're wired up, keeping the runtime/executor layer
//! separate from the protocol state machines underneath it.

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::future_not_send)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_arguments)]

pub mod auth;
pub mod channel;
pub mod conductor;
pub mod config;
pub mod config_provider;
pub mod dev_tracing;
pub mod events;
pub mod fixer;
pub mod flow_shared;
pub mod partition;
pub mod session_state;

pub use conductor::Conductor;
pub use config::{ClientConfig, NetworkResolution, TlsConfig};
pub use config_provider::{BucketConfig, ConfigProvider, StaticConfigProvider};
pub use dcp_core::endpoint::NodeAddress;
pub use dcp_core::error::{DcpError, Result};
pub use events::{AckHandle, ControlCallback, ControlFrame, DataCallback, DataFrame, SystemEvent, SystemEventCallback};

/// Convenient imports for consumers of this crate.
pub mod prelude {
    pub use crate::auth::{Authenticator, NoAuth};
    pub use crate::conductor::Conductor;
    pub use crate::config::{ClientConfig, NetworkResolution, TlsConfig};
    pub use crate::config_provider::{BucketConfig, ConfigProvider, StaticConfigProvider};
    pub use crate::events::{
        AckHandle, ControlCallback, ControlFrame, DataCallback, DataFrame, SystemEvent, SystemEventCallback,
    };
    pub use dcp_core::endpoint::NodeAddress;
    pub use dcp_core::error::{DcpError, Result};
}
