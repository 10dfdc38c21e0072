//! Transport-agnostic primitives shared by the DCP protocol and client crates:
//! - Pinned / io_uring-safe allocation (`alloc`)
//! - Zero-copy segmented receive buffer (`buffer`)
//! - KV node addressing (`endpoint`)
//! - Error types (`error`)
//! - Per-channel configuration (`options`)
//! - Cancellation-safe I/O guard (`poison`)
//! - Exponential backoff bookkeeping (`reconnect`)
//! - TCP socket tuning (`tcp`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]

pub mod alloc;
pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod options;
pub mod poison;
pub mod reconnect;
pub mod tcp;

pub mod prelude {
    pub use crate::alloc::{IoArena, SlabMut};
    pub use crate::buffer::SegmentedBuffer;
    pub use crate::endpoint::NodeAddress;
    pub use crate::error::{DcpError, Result};
    pub use crate::options::ChannelOptions;
    pub use crate::poison::PoisonGuard;
    pub use crate::reconnect::{ReconnectError, ReconnectState};
}
