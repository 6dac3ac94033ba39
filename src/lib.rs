//! dhtrpc - A Kademlia DHT RPC node
//!
//! This library provides the building blocks of a Kademlia-style DHT over
//! UDP: a compact binary message codec, a retrying request multiplexer,
//! iterative lookups with an optional commit phase, and the NAT and health
//! monitoring a node needs to decide when it may advertise itself.
//!
//! # Modules
//!
//! - [`wire`] - Message codec
//! - [`dht`] - Routing table, RPC transport, queries and the node itself
//! - [`nat`] - NAT classification from observed addresses
//! - [`health`] - Online/degraded/offline scoring
//! - [`constants`] - Protocol constants and defaults

pub mod constants;
pub mod dht;
pub mod health;
pub mod nat;
pub mod wire;

pub use dht::{
    Command, Commit, Dht, DhtError, DhtOptions, HandlerReply, HandlerTable, Node, NodeId,
    PeerAddr, Query, QueryOptions, QueryReply, RequestHandler, RequestMessage, RequestOptions,
    RoutingTable, Session,
};
pub use health::{HealthEvent, HealthMonitor};
pub use nat::{NatAnalysis, NatAnalyzer, NatType};
pub use wire::{Message, ProtocolError};
