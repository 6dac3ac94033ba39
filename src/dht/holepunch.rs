//! Single-hop holepunch assistance.
//!
//! An initiator asks a relay that knows both parties to introduce it to a
//! peer. The relay forwards the initiator's observed address to the peer,
//! which pings the initiator so its own NAT opens a mapping back.
//!
//! Payload format (carried in the request value):
//! - 1 byte: message type
//! - 6 bytes: IPv4 address and port

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::node::PeerAddr;
use crate::constants::PEER_ADDR_LEN;
use crate::wire::{get_peer_addr, put_peer_addr};

/// Holepunch message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HolepunchMessageType {
    /// Initiator to relay: please introduce me to `addr`.
    Rendezvous = 0x00,
    /// Relay to peer: `addr` wants to reach you.
    Connect = 0x01,
}

impl TryFrom<u8> for HolepunchMessageType {
    type Error = HolepunchError;

    fn try_from(value: u8) -> Result<Self, HolepunchError> {
        match value {
            0x00 => Ok(HolepunchMessageType::Rendezvous),
            0x01 => Ok(HolepunchMessageType::Connect),
            _ => Err(HolepunchError::InvalidMessageType(value)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HolepunchError {
    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("message too short: expected {expected} bytes, got {actual}")]
    MessageTooShort { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HolepunchMessage {
    pub msg_type: HolepunchMessageType,
    pub addr: PeerAddr,
}

impl HolepunchMessage {
    pub const LEN: usize = 1 + PEER_ADDR_LEN;

    pub fn rendezvous(target: PeerAddr) -> Self {
        Self {
            msg_type: HolepunchMessageType::Rendezvous,
            addr: target,
        }
    }

    pub fn connect(initiator: PeerAddr) -> Self {
        Self {
            msg_type: HolepunchMessageType::Connect,
            addr: initiator,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(self.msg_type as u8);
        put_peer_addr(&mut buf, &self.addr);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, HolepunchError> {
        if data.len() < Self::LEN {
            return Err(HolepunchError::MessageTooShort {
                expected: Self::LEN,
                actual: data.len(),
            });
        }

        let msg_type = HolepunchMessageType::try_from(data[0])?;
        let mut rest = &data[1..];
        let addr = get_peer_addr(&mut rest).map_err(|_| HolepunchError::MessageTooShort {
            expected: Self::LEN,
            actual: data.len(),
        })?;

        Ok(Self { msg_type, addr })
    }
}
