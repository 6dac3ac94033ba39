use super::error::DhtError;
use crate::constants::ID_LEN;
use crate::wire::put_peer_addr;
use bytes::BytesMut;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;

const MAX_FAILURES: u8 = 3;
const STALE_AFTER_SECS: u64 = 15 * 60;

/// Peers are addressed by IPv4 host and port.
pub type PeerAddr = SocketAddrV4;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub fn generate<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut id = [0u8; ID_LEN];
        rng.fill_bytes(&mut id);
        Self(id)
    }

    /// The id a node at `addr` is expected to use: sha256 of its encoded address.
    pub fn derive(addr: &PeerAddr) -> Self {
        let mut buf = BytesMut::with_capacity(6);
        put_peer_addr(&mut buf, addr);
        Self(Sha256::digest(&buf).into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| DhtError::InvalidAddress("node id must be 32 bytes".into()))?;
        Ok(Self(id))
    }

    pub fn distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut dist = [0u8; ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Orders `a` and `b` by XOR distance to `self`, without building the distances.
    pub fn cmp_distance(&self, a: &NodeId, b: &NodeId) -> Ordering {
        for i in 0..ID_LEN {
            if a.0[i] != b.0[i] {
                return (a.0[i] ^ self.0[i]).cmp(&(b.0[i] ^ self.0[i]));
            }
        }
        Ordering::Equal
    }

    pub fn bucket_index(&self, other: &NodeId) -> usize {
        let dist = self.distance(other);

        for (i, &byte) in dist.iter().enumerate() {
            if byte != 0 {
                let leading = byte.leading_zeros() as usize;
                return i * 8 + leading;
            }
        }

        ID_LEN * 8 - 1
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Narrows a socket address to the IPv4 form the protocol carries.
pub fn to_peer_addr(addr: SocketAddr) -> Option<PeerAddr> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, v6.port())),
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: PeerAddr,
    pub last_seen: Instant,
    pub failures: u8,
}

impl Node {
    pub fn new(id: NodeId, addr: PeerAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    /// A node known only by address, with the id it is expected to have.
    pub fn from_addr(addr: PeerAddr) -> Self {
        Self::new(NodeId::derive(&addr), addr)
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn is_bad(&self) -> bool {
        self.failures >= MAX_FAILURES
    }

    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed().as_secs() > STALE_AFTER_SECS
    }
}
