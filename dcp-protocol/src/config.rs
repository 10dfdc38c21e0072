//! Buffer sizing for the memcached binary protocol codec.

/// Size of the fixed memcached binary protocol header (magic through cas).
pub const HEADER_LEN: usize = 24;

/// Initial staging buffer capacity for decoder reassembly.
///
/// Pre-allocated to avoid an initial reallocation when a frame body spans
/// more than one network read (the slow path in `McbpDecoder::decode`).
pub const STAGING_BUF_INITIAL_CAP: usize = 256;
