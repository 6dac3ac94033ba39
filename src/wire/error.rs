use thiserror::Error;

/// Errors produced while decoding a datagram.
///
/// Decoding is all-or-nothing: any of these means the whole datagram is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The version byte is not one we speak.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// The buffer ended before a field was complete.
    #[error("truncated message: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A length prefix does not fit in memory on this platform.
    #[error("invalid length prefix")]
    InvalidLength,

    /// A command name is not valid UTF-8.
    #[error("invalid string")]
    InvalidString,
}
