//! Authentication seam.
//!
//! SASL mechanism negotiation (PLAIN/CRAM/SCRAM) is out of scope for this
//! core — it is consumed as a collaborator behind a trait, rather than
//! hard-coding one scheme.

use async_trait::async_trait;
use compio::net::TcpStream;

use dcp_core::error::Result;

/// Performs whatever SASL exchange is required before DCP_OPEN is sent.
///
/// Implementations own the full `SASL_LIST_MECHS` / `SASL_AUTH` / `SASL_STEP`
/// dance against `stream`; this crate only needs to know when it's done.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, stream: &mut TcpStream) -> Result<()>;
}

/// No-op authenticator for unauthenticated test clusters and integration
/// tests driving an in-memory mock node.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    async fn authenticate(&self, _stream: &mut TcpStream) -> Result<()> {
        Ok(())
    }
}
