//! Kademlia DHT node
//!
//! Nodes talk over UDP with compact binary messages. Requests are paced by
//! a congestion window and retried on a fixed tick; lookups walk towards a
//! target id, streaming every reply, and may finish with a commit phase
//! that writes to the closest nodes.

mod command;
mod congestion;
mod error;
mod holepunch;
mod node;
mod query;
mod routing;
mod rpc;
mod server;
mod session;

pub use command::Command;
pub use congestion::CongestionWindow;
pub use error::DhtError;
pub use holepunch::{HolepunchError, HolepunchMessage, HolepunchMessageType};
pub use node::{to_peer_addr, Node, NodeId, PeerAddr};
pub use query::{
    ClosestReplies, Commit, CommitFn, NodeFilter, Query, QueryOptions, QueryReply, QueryRequest,
};
pub use routing::RoutingTable;
pub use rpc::{
    IncomingRequest, Inbound, PendingRequest, RequestOptions, Response, Rpc, RpcOptions,
    StatsSnapshot,
};
pub use server::{Dht, DhtOptions, HandlerReply, HandlerTable, RequestHandler, RequestMessage};
pub use session::Session;
