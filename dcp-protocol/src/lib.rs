//! # dcp-protocol
//!
//! **Internal protocol implementation crate for the DCP streaming client.**
//!
//! This is an internal implementation detail — use the `dcp-client` crate for
//! the public API. It provides the sans-IO memcached binary protocol codec
//! and the per-channel demultiplexer that turns decoded frames into typed
//! [`session::ChannelEvent`]s.
//!
//! ## Layering
//!
//! - [`opcode`] / [`header`]: closed tagged wire vocabulary (opcodes, status
//!   codes, the 24-byte header).
//! - [`codec`]: stateful frame decoder (`McbpDecoder`), fast-path zero-copy
//!   when a frame is fully buffered, slow-path reassembly otherwise.
//! - [`message`]: typed parsers for each DCP opcode's body.
//! - [`utils`]: request builders (DCP_OPEN, DCP_STREAM_REQ, DCP_BUFFER_ACK, ...).
//! - [`session`]: `ChannelSession`, the sans-IO demultiplexer that drives the
//!   above into a `Vec<ChannelEvent>` per `on_bytes` call.
//! - [`flow`]: `FlowController`, byte-watermark accounting for buffer acks.
//!
//! No socket, no executor, no timers live here — those belong to the channel
//! that owns a `ChannelSession` one layer up in `dcp-client`.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

pub mod codec;
pub mod config;
pub mod flow;
pub mod header;
pub mod message;
pub mod opcode;
pub mod session;
pub mod utils;

pub use codec::{Frame, McbpDecoder, McbpError};
pub use flow::FlowController;
pub use header::FrameHeader;
pub use opcode::{Magic, Opcode, Status};
pub use session::{ChannelEvent, ChannelSession, PendingKind};

/// Convenient imports for consumers of this crate.
pub mod prelude {
    pub use super::{
        ChannelEvent, ChannelSession, FlowController, Frame, FrameHeader, Magic, McbpDecoder,
        McbpError, Opcode, PendingKind, Status,
    };
    pub use bytes::Bytes;
}
