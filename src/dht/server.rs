use super::command::Command;
use super::error::DhtError;
use super::holepunch::{HolepunchMessage, HolepunchMessageType};
use super::node::{to_peer_addr, Node, NodeId, PeerAddr};
use super::query::{Query, QueryOptions, QueryRequest};
use super::routing::RoutingTable;
use super::rpc::{
    IncomingRequest, Inbound, PendingRequest, RequestOptions, Response, Rpc, RpcOptions,
    StatsSnapshot,
};
use super::session::Session;
use crate::constants::{
    DEFAULT_CONCURRENCY, DEFAULT_K, DEFAULT_MAX_SLOW, DEFAULT_NAT_MIN_SAMPLES, DEFAULT_PORT,
    DEFAULT_REFRESH_TICKS, DEFAULT_TICK_INTERVAL, ID_LEN, MAX_DATAGRAM_SIZE,
    MAX_DOWN_HINTS_PER_TICK, NUM_BUCKETS, PEER_ADDR_LEN, TOKEN_ROTATION_INTERVAL,
};
use crate::health::{HealthEvent, HealthMonitor};
use crate::nat::{NatAnalysis, NatAnalyzer, NatType};
use crate::wire::{get_peer_addr, put_peer_addr, status, Kind, Message, Token};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const HEALTH_EVENT_CAPACITY: usize = 16;

/// What a [`RequestHandler`] answers with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerReply {
    pub status: u64,
    pub value: Option<Bytes>,
}

impl HandlerReply {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn value(value: impl Into<Bytes>) -> Self {
        Self {
            status: status::OK,
            value: Some(value.into()),
        }
    }

    pub fn error(status: u64) -> Self {
        Self {
            status,
            value: None,
        }
    }
}

/// Answers requests for an application command.
///
/// The request's token is only present if we issued it to the sender
/// recently, so handlers that accept writes can simply require it.
pub trait RequestHandler: Send + Sync {
    fn on_request(&self, request: &IncomingRequest) -> HandlerReply;
}

impl<F> RequestHandler for F
where
    F: Fn(&IncomingRequest) -> HandlerReply + Send + Sync,
{
    fn on_request(&self, request: &IncomingRequest) -> HandlerReply {
        self(request)
    }
}

/// Application commands by name.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `command`. Built-in command names are refused.
    pub fn on(mut self, command: impl Into<String>, handler: impl RequestHandler + 'static) -> Self {
        let command = command.into();
        if Command::parse(&command).is_internal() {
            warn!("refusing to override built-in command {}", command);
            return self;
        }
        self.handlers.insert(command, Arc::new(handler));
        self
    }

    pub fn get(&self, command: &str) -> Option<&Arc<dyn RequestHandler>> {
        self.handlers.get(command)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

#[derive(Debug, Clone)]
pub struct DhtOptions {
    pub host: Ipv4Addr,
    pub port: u16,
    pub bootstrap: Vec<SocketAddr>,
    pub k: usize,
    pub concurrency: usize,
    pub max_slow: usize,
    /// Never advertise an id; other nodes won't add us to their tables.
    pub ephemeral: bool,
    pub tick_interval: Duration,
    /// Maintenance ticks between background refresh lookups.
    pub refresh_ticks: u64,
    /// Distinct referrers needed before the NAT is classified.
    pub nat_min_samples: usize,
    pub rpc: RpcOptions,
    pub handlers: HandlerTable,
}

impl Default for DhtOptions {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            bootstrap: Vec::new(),
            k: DEFAULT_K,
            concurrency: DEFAULT_CONCURRENCY,
            max_slow: DEFAULT_MAX_SLOW,
            ephemeral: false,
            tick_interval: DEFAULT_TICK_INTERVAL,
            refresh_ticks: DEFAULT_REFRESH_TICKS,
            nat_min_samples: DEFAULT_NAT_MIN_SAMPLES,
            rpc: RpcOptions::default(),
            handlers: HandlerTable::default(),
        }
    }
}

/// An outgoing request, before it is addressed and given a transaction id.
#[derive(Debug, Clone)]
pub struct RequestMessage {
    pub command: Command,
    pub target: Option<NodeId>,
    pub token: Option<Token>,
    pub value: Bytes,
}

impl RequestMessage {
    pub fn new(command: impl Into<Command>) -> Self {
        Self {
            command: command.into(),
            target: None,
            token: None,
            value: Bytes::new(),
        }
    }

    pub fn target(mut self, target: NodeId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }
}

struct TokenSecrets {
    current: [u8; ID_LEN],
    previous: [u8; ID_LEN],
}

impl TokenSecrets {
    fn new<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut current = [0u8; ID_LEN];
        let mut previous = [0u8; ID_LEN];
        rng.fill_bytes(&mut current);
        rng.fill_bytes(&mut previous);
        Self { current, previous }
    }

    fn rotate<R: RngCore + ?Sized>(&mut self, rng: &mut R) {
        self.previous = self.current;
        rng.fill_bytes(&mut self.current);
    }
}

fn token_with_secret(addr: &PeerAddr, secret: &[u8; ID_LEN]) -> Token {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(addr.ip().octets());
    hasher.finalize().into()
}

/// A DHT node.
///
/// Owns the UDP socket, the routing table and the request multiplexer.
/// [`Dht::start`] spawns the loop that answers requests and drives
/// retries and maintenance.
///
/// # Examples
///
/// ```no_run
/// use dhtrpc::dht::{Dht, DhtOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let options = DhtOptions {
///     bootstrap: vec!["203.0.113.1:49737".parse()?],
///     ..Default::default()
/// };
/// let dht = Dht::bind(options).await?;
/// dht.start();
/// dht.bootstrap().await?;
///
/// let closest = dht.find_node(dht.routing_table().our_id()).finished().await?;
/// println!("{} nodes close to us", closest.len());
/// # Ok(())
/// # }
/// ```
pub struct Dht {
    rpc: Arc<Rpc>,
    local_addr: PeerAddr,
    options: DhtOptions,
    bootstrap_nodes: Vec<PeerAddr>,
    /// The id we advertise; `None` while ephemeral or not yet reachable.
    id: RwLock<Option<NodeId>>,
    routing_table: RoutingTable,
    token_secrets: RwLock<TokenSecrets>,
    nat: Mutex<NatAnalyzer>,
    nat_type: Mutex<NatType>,
    health: Mutex<HealthMonitor>,
    health_tx: broadcast::Sender<HealthEvent>,
    down_hints_sent: AtomicUsize,
    down_hints_received: AtomicUsize,
    ticks: AtomicU64,
    rng: Mutex<StdRng>,
    shutdown: watch::Sender<bool>,
}

impl Dht {
    pub async fn bind(options: DhtOptions) -> Result<Arc<Self>, DhtError> {
        Self::bind_with_rng(options, StdRng::from_os_rng()).await
    }

    /// Like [`Dht::bind`], drawing transaction ids, token secrets and
    /// refresh targets from `rng`.
    pub async fn bind_with_rng(
        options: DhtOptions,
        mut rng: StdRng,
    ) -> Result<Arc<Self>, DhtError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(options.host, options.port)).await?;
        let local = socket.local_addr()?;
        let local_addr = to_peer_addr(local)
            .ok_or_else(|| DhtError::InvalidAddress(format!("not an IPv4 address: {}", local)))?;

        let bootstrap_nodes = options
            .bootstrap
            .iter()
            .filter_map(|addr| to_peer_addr(*addr))
            .filter(|addr| *addr != local_addr)
            .collect();

        // A node bound to a concrete address can advertise right away;
        // otherwise it waits until the NAT analysis finds a stable address.
        let id = if options.ephemeral || local_addr.ip().is_unspecified() {
            None
        } else {
            Some(NodeId::derive(&local_addr))
        };
        let table_id = id.unwrap_or_else(|| NodeId::generate(&mut rng));

        let rpc = Rpc::new(Arc::new(socket), options.rpc.clone(), &mut rng);
        let token_secrets = TokenSecrets::new(&mut rng);
        let (health_tx, _) = broadcast::channel(HEALTH_EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        info!("DHT bound to {} with id {}", local_addr, table_id);

        Ok(Arc::new(Self {
            rpc,
            local_addr,
            bootstrap_nodes,
            id: RwLock::new(id),
            routing_table: RoutingTable::new(table_id, options.k),
            token_secrets: RwLock::new(token_secrets),
            nat: Mutex::new(NatAnalyzer::default()),
            nat_type: Mutex::new(NatType::Unknown),
            health: Mutex::new(HealthMonitor::default()),
            health_tx,
            down_hints_sent: AtomicUsize::new(0),
            down_hints_received: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
            rng: Mutex::new(rng),
            shutdown,
            options,
        }))
    }

    pub fn local_addr(&self) -> PeerAddr {
        self.local_addr
    }

    /// The id other nodes see, if we advertise one.
    pub fn id(&self) -> Option<NodeId> {
        *self.id.read()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.id().is_none()
    }

    pub fn options(&self) -> &DhtOptions {
        &self.options
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn bootstrap_nodes(&self) -> &[PeerAddr] {
        &self.bootstrap_nodes
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.rpc.stats()
    }

    pub fn is_online(&self) -> bool {
        self.health.lock().is_online()
    }

    pub fn is_degraded(&self) -> bool {
        self.health.lock().is_degraded()
    }

    pub fn nat_analysis(&self) -> NatAnalysis {
        self.nat
            .lock()
            .analyze(self.options.nat_min_samples)
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.health_tx.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// A new cancellation scope for requests and queries on this node.
    pub fn session(&self) -> Session {
        Session::new()
    }

    /// Adds a node we know to be reachable, e.g. from a previous run.
    pub fn add_node(&self, addr: PeerAddr) -> bool {
        self.routing_table.add_node(Node::from_addr(addr))
    }

    /// Spawns the receive and maintenance loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let dht = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dht.run().await {
                warn!("DHT loop stopped: {}", e);
            }
        })
    }

    /// Stops the loop, fails every pending request and closes the socket.
    pub fn destroy(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.rpc.destroy();
        info!("DHT on {} destroyed", self.local_addr);
    }

    pub async fn bootstrap(self: &Arc<Self>) -> Result<(), DhtError> {
        info!("Starting DHT bootstrap");

        let our_id = self.routing_table.our_id();
        match self.find_node(our_id).finished().await {
            Ok(_) => {}
            // The first node of a network has nobody to ask.
            Err(DhtError::TooFewResponses) => {
                debug!("bootstrap found no other nodes");
            }
            Err(e) => return Err(e),
        }

        info!(
            "DHT bootstrap complete, {} nodes in routing table",
            self.routing_table.node_count()
        );
        Ok(())
    }

    /// Sends a single request. The message is stamped with our id, if we
    /// advertise one, and the destination address.
    pub fn request(
        self: &Arc<Self>,
        message: RequestMessage,
        to: PeerAddr,
        options: RequestOptions,
    ) -> PendingRequest {
        let mut msg = Message::request(message.command.as_str(), to);
        if let Kind::Request { target, .. } = &mut msg.kind {
            *target = message.target.map(|t| t.0);
        }
        msg.id = self.id().map(|id| id.0);
        msg.token = message.token;
        msg.value = message.value;
        self.rpc.request(msg, to, options)
    }

    /// Pings `addr` and returns our address as it saw us.
    pub async fn ping(self: &Arc<Self>, addr: PeerAddr) -> Result<PeerAddr, DhtError> {
        let response = self
            .request(RequestMessage::new(Command::Ping), addr, RequestOptions::default())
            .await?;
        Ok(response.to)
    }

    /// Starts an iterative query for `target`.
    pub fn query(
        self: &Arc<Self>,
        target: impl Into<NodeId>,
        command: impl Into<Command>,
        value: impl Into<Bytes>,
        options: QueryOptions,
    ) -> Query {
        let request = QueryRequest {
            target: target.into(),
            command: command.into(),
            value: value.into(),
        };
        Query::start(self.clone(), request, options)
    }

    pub fn find_node(self: &Arc<Self>, target: impl Into<NodeId>) -> Query {
        self.query(target, Command::FindNode, Bytes::new(), QueryOptions::default())
    }

    /// Asks `referrer`, which knows both of us, to introduce us to `peer`,
    /// then pings `peer` directly.
    ///
    /// Returns our address as `peer` saw it.
    pub async fn holepunch(
        self: &Arc<Self>,
        peer: PeerAddr,
        referrer: PeerAddr,
    ) -> Result<PeerAddr, DhtError> {
        let payload = HolepunchMessage::rendezvous(peer).encode();
        self.request(
            RequestMessage::new(Command::Holepunch).value(payload),
            referrer,
            RequestOptions::default(),
        )
        .await?;
        self.ping(peer).await
    }

    /// Tells `referrer` that `down`, which it referred us to, did not answer.
    pub fn down_hint(self: &Arc<Self>, referrer: PeerAddr, down: PeerAddr) {
        if self.down_hints_sent.fetch_add(1, Ordering::Relaxed) >= MAX_DOWN_HINTS_PER_TICK {
            return;
        }
        trace!("down hint for {} to {}", down, referrer);

        let mut buf = BytesMut::with_capacity(PEER_ADDR_LEN);
        put_peer_addr(&mut buf, &down);
        let request = self.request(
            RequestMessage::new(Command::DownHint).value(buf.freeze()),
            referrer,
            RequestOptions::new().max_retries(0),
        );
        tokio::spawn(async move {
            let _ = request.await;
        });
    }

    pub async fn run(self: Arc<Self>) -> Result<(), DhtError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let Some(socket) = self.rpc.socket() else {
            return Err(DhtError::Destroyed);
        };
        let mut shutdown = self.shutdown.subscribe();

        let mut drain_interval = tokio::time::interval(self.options.rpc.drain_interval);
        let mut tick_interval = tokio::time::interval(self.options.tick_interval);
        let mut token_rotation_interval = tokio::time::interval(TOKEN_ROTATION_INTERVAL);

        drain_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        token_rotation_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        drain_interval.tick().await;
        tick_interval.tick().await;
        token_rotation_interval.tick().await;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                result = socket.recv_from(&mut buf) => {
                    let (n, addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            // ICMP errors from earlier sends surface here.
                            debug!("DHT recv error: {}", e);
                            continue;
                        }
                    };
                    if let Some(inbound) = self.rpc.on_message(&buf[..n], addr) {
                        self.handle_inbound(inbound).await;
                    }
                }
                _ = drain_interval.tick() => {
                    for addr in self.rpc.drain() {
                        if let Some(node) = self.routing_table.find_by_addr(&addr) {
                            self.routing_table.mark_failed(&node.id);
                        }
                    }
                }
                _ = tick_interval.tick() => {
                    self.on_tick();
                }
                _ = token_rotation_interval.tick() => {
                    self.rotate_token_secret();
                }
            }
        }
    }

    async fn handle_inbound(self: &Arc<Self>, inbound: Inbound) {
        match inbound {
            Inbound::Response(response) => self.on_response(&response),
            Inbound::Request(request) => self.on_request(request).await,
        }
    }

    fn on_response(&self, response: &Response) {
        if let Some(id) = response.id {
            self.routing_table.add_node(Node::new(id, response.from));
        }
        self.nat.lock().add(response.to, response.from);
    }

    async fn on_request(self: &Arc<Self>, mut request: IncomingRequest) {
        if let Some(token) = &request.token {
            if !self.validate_token(&request.from, token) {
                trace!("dropping stale token from {}", request.from);
                request.token = None;
            }
        }

        if let Some(id) = request.id {
            self.routing_table.add_node(Node::new(id, request.from));
        }

        match Command::parse(&request.command) {
            Command::Ping | Command::FindNode => {
                self.reply(&request, status::OK, Bytes::new()).await;
            }
            Command::DownHint => self.on_down_hint(request).await,
            Command::Holepunch => self.on_holepunch(request).await,
            Command::Custom(name) => match self.options.handlers.get(&name) {
                Some(handler) => {
                    let reply = handler.on_request(&request);
                    self.reply(&request, reply.status, reply.value.unwrap_or_default())
                        .await;
                }
                None => {
                    debug!("unknown command {} from {}", name, request.from);
                    self.reply(&request, status::UNKNOWN_COMMAND, Bytes::new())
                        .await;
                }
            },
        }
    }

    async fn reply(&self, request: &IncomingRequest, status: u64, value: Bytes) {
        let closer_nodes = request.target.map(|target| {
            self.routing_table
                .closest(&target, self.routing_table.k())
                .into_iter()
                .map(|n| n.addr)
                .filter(|addr| *addr != request.from)
                .collect()
        });

        let mut msg = Message::response(request.tid, request.from, status);
        msg.id = self.id().map(|id| id.0);
        msg.token = Some(self.generate_token(&request.from));
        msg.kind = Kind::Response {
            status,
            closer_nodes,
        };
        msg.value = value;

        self.rpc.reply(&msg, request.from).await;
    }

    async fn on_down_hint(self: &Arc<Self>, request: IncomingRequest) {
        self.reply(&request, status::OK, Bytes::new()).await;

        let mut value = &request.value[..];
        let Ok(down) = get_peer_addr(&mut value) else {
            return;
        };
        if self.down_hints_received.fetch_add(1, Ordering::Relaxed) >= MAX_DOWN_HINTS_PER_TICK {
            return;
        }
        if self.routing_table.find_by_addr(&down).is_none() {
            return;
        }

        debug!("{} reports {} as down, checking", request.from, down);
        let dht = self.clone();
        tokio::spawn(async move {
            if dht.ping(down).await.is_err() && dht.routing_table.remove_by_addr(&down).is_some()
            {
                debug!("removed unresponsive node {}", down);
            }
        });
    }

    async fn on_holepunch(self: &Arc<Self>, request: IncomingRequest) {
        let msg = match HolepunchMessage::decode(&request.value) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("bad holepunch payload from {}: {}", request.from, e);
                self.reply(&request, status::INVALID_PAYLOAD, Bytes::new())
                    .await;
                return;
            }
        };

        match msg.msg_type {
            HolepunchMessageType::Rendezvous => {
                if msg.addr == request.from || self.routing_table.find_by_addr(&msg.addr).is_none()
                {
                    self.reply(&request, status::NO_SUCH_PEER, Bytes::new())
                        .await;
                    return;
                }

                debug!("relaying holepunch from {} to {}", request.from, msg.addr);
                let forward = self.request(
                    RequestMessage::new(Command::Holepunch)
                        .value(HolepunchMessage::connect(request.from).encode()),
                    msg.addr,
                    RequestOptions::default(),
                );
                let dht = self.clone();
                tokio::spawn(async move {
                    let status = match forward.await {
                        Ok(_) => status::OK,
                        Err(_) => status::NO_SUCH_PEER,
                    };
                    dht.reply(&request, status, Bytes::new()).await;
                });
            }
            HolepunchMessageType::Connect => {
                self.reply(&request, status::OK, Bytes::new()).await;

                // Our outgoing ping opens the mapping the initiator punches into.
                let dht = self.clone();
                let initiator = msg.addr;
                tokio::spawn(async move {
                    if let Err(e) = dht.ping(initiator).await {
                        debug!("holepunch ping to {} failed: {}", initiator, e);
                    }
                });
            }
        }
    }

    fn on_tick(self: &Arc<Self>) {
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        self.down_hints_sent.store(0, Ordering::Relaxed);
        self.down_hints_received.store(0, Ordering::Relaxed);

        let stats = self.rpc.stats();
        let event = self.health.lock().update(stats.responses, stats.timeouts);
        if let Some(event) = event {
            self.on_health_event(event);
        }

        self.update_network_state();

        let healthy = self.health.lock().is_healthy();
        if healthy && ticks % self.options.refresh_ticks.max(1) == 0 {
            self.refresh();
        }
    }

    fn on_health_event(&self, event: HealthEvent) {
        match event {
            HealthEvent::Online => info!("DHT online"),
            HealthEvent::Degraded => warn!("DHT degraded, most requests are timing out"),
            HealthEvent::Offline => warn!("DHT offline, no responses received"),
        }
        let _ = self.health_tx.send(event);
    }

    fn update_network_state(&self) {
        let analysis = self.nat_analysis();

        {
            let mut nat_type = self.nat_type.lock();
            if *nat_type != analysis.nat_type {
                info!("NAT classified as {}", analysis.nat_type);
                *nat_type = analysis.nat_type;
            }
        }

        if self.options.ephemeral || self.id().is_some() {
            return;
        }
        if let Some(addr) = analysis.stable_addr() {
            let id = NodeId::derive(&addr);
            *self.id.write() = Some(id);
            self.routing_table.rekey(id);
            info!("DHT reachable at {}, now advertising id {}", addr, id);
        }
    }

    fn refresh(self: &Arc<Self>) {
        let mut targets = Vec::new();
        for bucket_idx in self.routing_table.stale_buckets() {
            targets.push(self.generate_id_for_bucket(bucket_idx));
        }
        if targets.is_empty() {
            targets.push(NodeId::generate(&mut *self.rng.lock()));
        }

        debug!("Refreshing DHT with {} lookups", targets.len());

        for target in targets {
            let query = self.find_node(target);
            tokio::spawn(async move {
                if let Err(e) = query.finished().await {
                    trace!("refresh lookup failed: {}", e);
                }
            });
        }
    }

    fn generate_id_for_bucket(&self, bucket_idx: usize) -> NodeId {
        let mut rng = self.rng.lock();
        if bucket_idx >= NUM_BUCKETS {
            return NodeId::generate(&mut *rng);
        }

        let mut id = self.routing_table.our_id().0;
        let byte_idx = bucket_idx / 8;
        let bit_idx = 7 - (bucket_idx % 8);

        id[byte_idx] ^= 1 << bit_idx;

        if bit_idx > 0 {
            let random_byte = (rng.next_u32() & 0xff) as u8;
            let keep_mask = !((1u8 << bit_idx) - 1);
            let random_mask = (1u8 << bit_idx) - 1;
            id[byte_idx] = (id[byte_idx] & keep_mask) | (random_byte & random_mask);
        }

        rng.fill_bytes(&mut id[byte_idx + 1..]);

        NodeId(id)
    }

    fn generate_token(&self, addr: &PeerAddr) -> Token {
        token_with_secret(addr, &self.token_secrets.read().current)
    }

    fn validate_token(&self, addr: &PeerAddr, token: &Token) -> bool {
        let secrets = self.token_secrets.read();
        token_with_secret(addr, &secrets.current) == *token
            || token_with_secret(addr, &secrets.previous) == *token
    }

    pub fn rotate_token_secret(&self) {
        let mut rng = self.rng.lock();
        self.token_secrets.write().rotate(&mut *rng);
        debug!("DHT token secret rotated");
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        self.rpc.destroy();
    }
}

impl fmt::Debug for Dht {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dht")
            .field("local_addr", &self.local_addr)
            .field("id", &self.id())
            .field("nodes", &self.routing_table.node_count())
            .finish()
    }
}
