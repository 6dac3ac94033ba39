//! Binary wire format.
//!
//! Every UDP datagram carries exactly one [`Message`]. The header is a
//! version byte, a flags byte, a 16-bit transaction id and the destination
//! address; optional fields follow in a fixed order, gated by the flags.

mod encoding;
mod error;
mod message;

pub use encoding::{get_peer_addr, put_peer_addr};
pub use error::ProtocolError;
pub use message::{flags, status, Id, Kind, Message, Token};

#[cfg(test)]
mod tests;
