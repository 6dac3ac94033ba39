use std::sync::Arc;

use thiserror::Error;

use crate::wire::ProtocolError;

#[derive(Debug, Clone, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No response arrived within the retry budget.
    #[error("request timed out")]
    RequestTimeout,

    /// The request, query or session was destroyed.
    #[error("request cancelled")]
    RequestCancelled,

    /// A query finished without a single node answering.
    #[error("too few nodes responded")]
    TooFewResponses,

    /// Every write of a commit phase failed; carries the last failure.
    #[error("commit failed: {0}")]
    CommitFailed(Box<DhtError>),

    /// The remote answered with a non-zero status.
    #[error("remote error status {status}")]
    Remote { status: u64 },

    #[error("no token received for closest node")]
    MissingToken,

    #[error("dht destroyed")]
    Destroyed,

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl DhtError {
    /// A short stable code, so callers can tell a timeout from a remote
    /// status or a malformed message without matching on the variant.
    pub fn code(&self) -> &'static str {
        match self {
            DhtError::Io(_) => "EIO",
            DhtError::Protocol(_) => "EPROTO",
            DhtError::RequestTimeout => "ETIMEDOUT",
            DhtError::RequestCancelled => "ECANCELED",
            DhtError::TooFewResponses => "ETOOFEW",
            DhtError::CommitFailed(_) => "ECOMMIT",
            DhtError::Remote { .. } => "ESTATUS",
            DhtError::MissingToken => "ENOTOKEN",
            DhtError::Destroyed => "EDESTROYED",
            DhtError::InvalidAddress(_) => "EADDR",
        }
    }
}

impl From<std::io::Error> for DhtError {
    fn from(err: std::io::Error) -> Self {
        DhtError::Io(Arc::new(err))
    }
}
