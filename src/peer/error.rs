use std::fmt;
use thiserror::Error;

/// How a failure affects the connection it happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The peer broke the protocol; never retried.
    Protocol,
    /// Refused by local policy; the peer may be retried later.
    Policy,
    /// Suspicious or useless data; dropped without closing.
    DataAnomaly,
    /// Too many messages of one kind; closed as abuse.
    Flood,
    /// The peer went silent; reconnecting is fine.
    Timeout,
    /// Closed by this side for its own reasons.
    Local,
}

/// Errors that can occur on a peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("connected to ourselves")]
    SelfConnection,

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    #[error("invalid request: piece {piece} offset {offset} length {length}")]
    InvalidRequest { piece: u32, offset: u32, length: u32 },

    #[error("invalid extension mapping: {0}")]
    InvalidExtensionMapping(String),

    #[error("extension error: {0}")]
    Extension(String),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("client {0} is banned")]
    BannedClient(String),

    #[error("duplicate peer identity")]
    DuplicateIdentity,

    #[error("another connection from this IP exists")]
    SameIp,

    #[error("connection limit reached")]
    ConnectionLimit,

    #[error("malformed bitfield: {got} bytes, expected {expected}")]
    MalformedBitfield { got: usize, expected: usize },

    #[error("discarded data: {0}")]
    Discarded(String),

    #[error("incoming {0} flood")]
    Flood(&'static str),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("no data received for {0} seconds")]
    IdleTimeout(u64),

    #[error("connection closed: {0}")]
    Closed(String),
}

impl PeerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeerError::InfoHashMismatch
            | PeerError::SelfConnection
            | PeerError::InvalidHandshake
            | PeerError::InvalidMessage(_)
            | PeerError::InvalidMessageId(_)
            | PeerError::InvalidRequest { .. }
            | PeerError::InvalidExtensionMapping(_)
            | PeerError::Extension(_)
            | PeerError::Bencode(_) => ErrorKind::Protocol,
            PeerError::BannedClient(_)
            | PeerError::DuplicateIdentity
            | PeerError::SameIp
            | PeerError::ConnectionLimit => ErrorKind::Policy,
            PeerError::MalformedBitfield { .. } | PeerError::Discarded(_) => {
                ErrorKind::DataAnomaly
            }
            PeerError::Flood(_) => ErrorKind::Flood,
            PeerError::HandshakeTimeout | PeerError::IdleTimeout(_) => ErrorKind::Timeout,
            PeerError::Closed(_) => ErrorKind::Local,
        }
    }

    /// Whether the connection must be closed.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::DataAnomaly
    }

    /// Whether the caller may try this peer again later.
    pub fn allows_retry(&self) -> bool {
        matches!(self.kind(), ErrorKind::Policy | ErrorKind::Timeout)
    }
}

/// Why a connection was closed; kept on the connection and handed to the
/// manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub kind: ErrorKind,
    pub message: String,
}

impl CloseReason {
    pub fn local(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Local,
            message: message.into(),
        }
    }

    pub fn allows_retry(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Policy | ErrorKind::Timeout | ErrorKind::Local
        )
    }
}

impl From<&PeerError> for CloseReason {
    fn from(err: &PeerError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
