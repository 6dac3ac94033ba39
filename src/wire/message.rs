use std::net::SocketAddrV4;

use bytes::{BufMut, Bytes, BytesMut};

use super::encoding::*;
use super::error::ProtocolError;
use crate::constants::{ID_LEN, PEER_ADDR_LEN, PROTOCOL_VERSION};

pub type Id = [u8; ID_LEN];
pub type Token = [u8; ID_LEN];

/// Flag bits of the second header byte.
pub mod flags {
    pub const IS_REQUEST: u8 = 0b0001;
    pub const HAS_ID: u8 = 0b0010;
    pub const HAS_TOKEN: u8 = 0b0100;
    /// `target` on requests, `closer_nodes` on responses.
    pub const HAS_ROUTE: u8 = 0b1000;
}

/// Response status codes carried on the wire.
pub mod status {
    pub const OK: u64 = 0;
    pub const UNKNOWN_COMMAND: u64 = 1;
    pub const INVALID_TOKEN: u64 = 2;
    pub const NO_SUCH_PEER: u64 = 3;
    pub const INVALID_PAYLOAD: u64 = 4;
}

/// The part of a message that differs between requests and responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    Request {
        command: String,
        target: Option<Id>,
    },
    Response {
        status: u64,
        closer_nodes: Option<Vec<SocketAddrV4>>,
    },
}

/// One datagram.
///
/// Field order on the wire: version, flags, tid, to, [id], [token],
/// [target | closer_nodes], command | status, value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tid: u16,
    /// Destination as seen by the sender. On responses this is the
    /// requester's observed external address.
    pub to: SocketAddrV4,
    pub id: Option<Id>,
    pub token: Option<Token>,
    pub kind: Kind,
    pub value: Bytes,
}

impl Message {
    pub fn request(command: impl Into<String>, to: SocketAddrV4) -> Self {
        Self {
            tid: 0,
            to,
            id: None,
            token: None,
            kind: Kind::Request {
                command: command.into(),
                target: None,
            },
            value: Bytes::new(),
        }
    }

    pub fn response(tid: u16, to: SocketAddrV4, status: u64) -> Self {
        Self {
            tid,
            to,
            id: None,
            token: None,
            kind: Kind::Response {
                status,
                closer_nodes: None,
            },
            value: Bytes::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, Kind::Request { .. })
    }

    pub fn command(&self) -> Option<&str> {
        match &self.kind {
            Kind::Request { command, .. } => Some(command),
            Kind::Response { .. } => None,
        }
    }

    pub fn target(&self) -> Option<&Id> {
        match &self.kind {
            Kind::Request { target, .. } => target.as_ref(),
            Kind::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u64> {
        match &self.kind {
            Kind::Request { .. } => None,
            Kind::Response { status, .. } => Some(*status),
        }
    }

    pub fn closer_nodes(&self) -> Option<&[SocketAddrV4]> {
        match &self.kind {
            Kind::Request { .. } => None,
            Kind::Response { closer_nodes, .. } => closer_nodes.as_deref(),
        }
    }

    fn flags(&self) -> u8 {
        let mut f = 0;
        if self.id.is_some() {
            f |= flags::HAS_ID;
        }
        if self.token.is_some() {
            f |= flags::HAS_TOKEN;
        }
        match &self.kind {
            Kind::Request { target, .. } => {
                f |= flags::IS_REQUEST;
                if target.is_some() {
                    f |= flags::HAS_ROUTE;
                }
            }
            Kind::Response { closer_nodes, .. } => {
                if closer_nodes.is_some() {
                    f |= flags::HAS_ROUTE;
                }
            }
        }
        f
    }

    /// Returns the exact encoded length of the message.
    pub fn preencode(&self) -> usize {
        // version + flags + tid + to
        let mut len = 1 + 1 + 2 + PEER_ADDR_LEN;
        if self.id.is_some() {
            len += ID_LEN;
        }
        if self.token.is_some() {
            len += ID_LEN;
        }
        match &self.kind {
            Kind::Request { command, target } => {
                if target.is_some() {
                    len += ID_LEN;
                }
                len += string_len(command);
            }
            Kind::Response {
                status,
                closer_nodes,
            } => {
                if let Some(nodes) = closer_nodes {
                    len += peer_list_len(nodes);
                }
                len += uint_len(*status);
            }
        }
        len + buffer_len(&self.value)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.preencode());

        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.flags());
        buf.put_u16_le(self.tid);
        put_peer_addr(&mut buf, &self.to);

        if let Some(id) = &self.id {
            put_fixed32(&mut buf, id);
        }
        if let Some(token) = &self.token {
            put_fixed32(&mut buf, token);
        }

        match &self.kind {
            Kind::Request { command, target } => {
                if let Some(target) = target {
                    put_fixed32(&mut buf, target);
                }
                put_string(&mut buf, command);
            }
            Kind::Response {
                status,
                closer_nodes,
            } => {
                if let Some(nodes) = closer_nodes {
                    put_peer_list(&mut buf, nodes);
                }
                put_uint(&mut buf, *status);
            }
        }

        put_buffer(&mut buf, &self.value);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;

        let version = get_u8(&mut buf)?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let f = get_u8(&mut buf)?;
        let tid = get_u16(&mut buf)?;
        let to = get_peer_addr(&mut buf)?;

        let id = if f & flags::HAS_ID != 0 {
            Some(get_fixed32(&mut buf)?)
        } else {
            None
        };
        let token = if f & flags::HAS_TOKEN != 0 {
            Some(get_fixed32(&mut buf)?)
        } else {
            None
        };

        let has_route = f & flags::HAS_ROUTE != 0;
        let kind = if f & flags::IS_REQUEST != 0 {
            let target = if has_route {
                Some(get_fixed32(&mut buf)?)
            } else {
                None
            };
            let command = get_string(&mut buf)?;
            Kind::Request { command, target }
        } else {
            let closer_nodes = if has_route {
                Some(get_peer_list(&mut buf)?)
            } else {
                None
            };
            let status = get_uint(&mut buf)?;
            Kind::Response {
                status,
                closer_nodes,
            }
        };

        let value = get_buffer(&mut buf)?;

        Ok(Self {
            tid,
            to,
            id,
            token,
            kind,
            value,
        })
    }
}
