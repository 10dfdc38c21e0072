//! Memcached binary protocol opcodes and status codes used by DCP.
//!
//! Closed, exhaustive tagged variants rather than raw integers: an opcode or
//! status this crate doesn't recognise decodes to an `Unknown` variant
//! instead of failing the whole frame, matching the "Unknown: log and drop"
//! row of the channel's demultiplexer table.

/// Opcodes the channel sends or must be prepared to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    SaslListMechs,
    SaslAuth,
    SaslStep,
    DcpOpen,
    DcpControl,
    DcpStreamReq,
    DcpStreamEnd,
    DcpSnapshotMarker,
    DcpMutation,
    DcpDeletion,
    DcpExpiration,
    DcpOsoSnapshot,
    DcpSystemEvent,
    DcpBufferAck,
    DcpGetFailoverLog,
    DcpCloseStream,
    DcpNoop,
    GetAllVbSeqnos,
    GetCollectionsManifest,
    /// An opcode this crate doesn't model, carrying the raw byte.
    Unknown(u8),
}

impl Opcode {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::SaslListMechs => 0x20,
            Self::SaslAuth => 0x21,
            Self::SaslStep => 0x22,
            Self::DcpOpen => 0x50,
            Self::DcpControl => 0x5E,
            Self::DcpStreamReq => 0x53,
            Self::DcpStreamEnd => 0x55,
            Self::DcpSnapshotMarker => 0x56,
            Self::DcpMutation => 0x57,
            Self::DcpDeletion => 0x58,
            Self::DcpExpiration => 0x59,
            Self::DcpOsoSnapshot => 0x61,
            Self::DcpSystemEvent => 0x5F,
            Self::DcpBufferAck => 0x5D,
            Self::DcpGetFailoverLog => 0x54,
            Self::DcpCloseStream => 0x52,
            Self::DcpNoop => 0x5C,
            Self::GetAllVbSeqnos => 0x48,
            Self::GetCollectionsManifest => 0xBA,
            Self::Unknown(b) => b,
        }
    }
}

impl From<u8> for Opcode {
    fn from(b: u8) -> Self {
        match b {
            0x20 => Self::SaslListMechs,
            0x21 => Self::SaslAuth,
            0x22 => Self::SaslStep,
            0x50 => Self::DcpOpen,
            0x5E => Self::DcpControl,
            0x53 => Self::DcpStreamReq,
            0x55 => Self::DcpStreamEnd,
            0x56 => Self::DcpSnapshotMarker,
            0x57 => Self::DcpMutation,
            0x58 => Self::DcpDeletion,
            0x59 => Self::DcpExpiration,
            0x61 => Self::DcpOsoSnapshot,
            0x5F => Self::DcpSystemEvent,
            0x5D => Self::DcpBufferAck,
            0x54 => Self::DcpGetFailoverLog,
            0x52 => Self::DcpCloseStream,
            0x5C => Self::DcpNoop,
            0x48 => Self::GetAllVbSeqnos,
            0xBA => Self::GetCollectionsManifest,
            other => Self::Unknown(other),
        }
    }
}

/// Status codes carried in a response header's `status_or_vbucket` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    NotMyVbucket,
    Rollback,
    ManifestIsAhead,
    InvalidArguments,
    Unknown(u16),
}

impl Status {
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Success => 0x0000,
            Self::NotMyVbucket => 0x0007,
            Self::Rollback => 0x0023,
            Self::ManifestIsAhead => 0x0053,
            Self::InvalidArguments => 0x0004,
            Self::Unknown(v) => v,
        }
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<u16> for Status {
    fn from(v: u16) -> Self {
        match v {
            0x0000 => Self::Success,
            0x0007 => Self::NotMyVbucket,
            0x0023 => Self::Rollback,
            0x0053 => Self::ManifestIsAhead,
            0x0004 => Self::InvalidArguments,
            other => Self::Unknown(other),
        }
    }
}

/// Magic byte identifying a frame's direction and flex-framing extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
    RequestFlex,
    ResponseFlex,
}

impl Magic {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Request => 0x80,
            Self::Response => 0x81,
            Self::RequestFlex => 0x08,
            Self::ResponseFlex => 0x18,
        }
    }

    pub const fn try_from_u8(b: u8) -> Option<Self> {
        match b {
            0x80 => Some(Self::Request),
            0x81 => Some(Self::Response),
            0x08 => Some(Self::RequestFlex),
            0x18 => Some(Self::ResponseFlex),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(self, Self::Response | Self::ResponseFlex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrips() {
        for op in [
            Opcode::DcpOpen,
            Opcode::DcpStreamReq,
            Opcode::DcpMutation,
            Opcode::DcpSystemEvent,
            Opcode::GetCollectionsManifest,
        ] {
            assert_eq!(Opcode::from(op.as_u8()), op);
        }
    }

    #[test]
    fn unknown_opcode_preserved() {
        assert_eq!(Opcode::from(0xEE), Opcode::Unknown(0xEE));
    }

    #[test]
    fn status_roundtrips() {
        assert_eq!(Status::from(0x07), Status::NotMyVbucket);
        assert_eq!(Status::from(0x23), Status::Rollback);
        assert!(Status::Success.is_success());
        assert!(!Status::NotMyVbucket.is_success());
    }

    #[test]
    fn magic_bytes_match_spec() {
        assert_eq!(Magic::try_from_u8(0x80), Some(Magic::Request));
        assert_eq!(Magic::try_from_u8(0x81), Some(Magic::Response));
        assert_eq!(Magic::try_from_u8(0x08), Some(Magic::RequestFlex));
        assert_eq!(Magic::try_from_u8(0x18), Some(Magic::ResponseFlex));
        assert_eq!(Magic::try_from_u8(0xFF), None);
    }
}
