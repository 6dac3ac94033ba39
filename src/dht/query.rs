//! Iterative lookups.
//!
//! A [`Query`] walks the network towards a target id: it asks the closest
//! known nodes, folds the closer nodes they return into its frontier and
//! keeps going until nothing closer is left. Every successful reply is
//! streamed to the caller as it arrives. An optional commit phase then
//! writes to the k closest repliers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::command::Command;
use super::error::DhtError;
use super::node::{Node, NodeId, PeerAddr};
use super::rpc::{RequestOptions, Response};
use super::server::{Dht, RequestMessage};
use super::session::{Abort, Attachment, Session};
use crate::constants::SLOWDOWN_CONCURRENCY;
use crate::wire::{status, Token};

const REPLY_CHANNEL_CAPACITY: usize = 64;

/// A successful reply received during a query.
#[derive(Debug, Clone)]
pub struct QueryReply {
    pub from: PeerAddr,
    /// The responder's verified id; replies without one never enter the
    /// closest set.
    pub id: Option<NodeId>,
    /// Our address as the responder saw it.
    pub to: PeerAddr,
    pub token: Option<Token>,
    pub closer_nodes: Vec<PeerAddr>,
    pub value: Bytes,
}

impl From<Response> for QueryReply {
    fn from(response: Response) -> Self {
        Self {
            from: response.from,
            id: response.id,
            to: response.to,
            token: response.token,
            closer_nodes: response.closer_nodes,
            value: response.value,
        }
    }
}

/// What a query sends to every node it visits.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub target: NodeId,
    pub command: Command,
    pub value: Bytes,
}

/// The k closest verified repliers, ordered by distance to the target.
#[derive(Debug, Clone)]
pub struct ClosestReplies {
    target: NodeId,
    k: usize,
    replies: Vec<QueryReply>,
}

impl ClosestReplies {
    pub fn new(target: NodeId, k: usize) -> Self {
        Self {
            target,
            k,
            replies: Vec::with_capacity(k),
        }
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    pub fn replies(&self) -> &[QueryReply] {
        &self.replies
    }

    /// Whether a node with `id` would make it into the set.
    pub fn is_closer(&self, id: &NodeId) -> bool {
        match self.replies.last() {
            Some(last) if self.replies.len() >= self.k => {
                let Some(last_id) = &last.id else {
                    return true;
                };
                self.target.cmp_distance(id, last_id).is_lt()
            }
            _ => true,
        }
    }

    /// Inserts a reply, replacing any earlier reply from the same id.
    ///
    /// Returns `false` for replies without a verified id or that are not
    /// closer than the current k-th entry.
    pub fn insert(&mut self, reply: QueryReply) -> bool {
        let Some(id) = reply.id else {
            return false;
        };
        if !self.is_closer(&id) {
            return false;
        }

        let mut pos = self.replies.len();
        while pos > 0 {
            let Some(prev) = self.replies[pos - 1].id else {
                break;
            };
            match self.target.cmp_distance(&prev, &id) {
                std::cmp::Ordering::Equal => {
                    self.replies[pos - 1] = reply;
                    return true;
                }
                std::cmp::Ordering::Greater => pos -= 1,
                std::cmp::Ordering::Less => break,
            }
        }

        self.replies.insert(pos, reply);
        self.replies.truncate(self.k);
        true
    }
}

/// A custom write for the commit phase.
pub type CommitFn =
    dyn Fn(Arc<Dht>, QueryReply, QueryRequest) -> BoxFuture<'static, Result<(), DhtError>>
        + Send
        + Sync;

/// What to do with the closest repliers once the walk is over.
#[derive(Clone, Default)]
pub enum Commit {
    #[default]
    None,
    /// Re-send the query's command, target and value to every closest
    /// replier along with the token it issued.
    Auto,
    Custom(Arc<CommitFn>),
}

impl Commit {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(Arc<Dht>, QueryReply, QueryRequest) -> BoxFuture<'static, Result<(), DhtError>>
            + Send
            + Sync
            + 'static,
    {
        Commit::Custom(Arc::new(f))
    }

    fn is_none(&self) -> bool {
        matches!(self, Commit::None)
    }
}

impl fmt::Debug for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Commit::None => write!(f, "None"),
            Commit::Auto => write!(f, "Auto"),
            Commit::Custom(_) => write!(f, "Custom"),
        }
    }
}

pub type NodeFilter = dyn Fn(&Node) -> bool + Send + Sync;

#[derive(Clone, Default)]
pub struct QueryOptions {
    /// Nodes to start from instead of the routing table, typically the
    /// closest nodes of an earlier query for the same target.
    pub nodes: Vec<PeerAddr>,
    pub concurrency: Option<usize>,
    pub max_slow: Option<usize>,
    pub commit: Commit,
    /// Drops candidate closer nodes for which this returns false.
    pub filter: Option<Arc<NodeFilter>>,
    pub session: Option<Session>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(mut self, nodes: Vec<PeerAddr>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn max_slow(mut self, max_slow: usize) -> Self {
        self.max_slow = Some(max_slow);
        self
    }

    pub fn commit(mut self, commit: Commit) -> Self {
        self.commit = commit;
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Node) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("nodes", &self.nodes.len())
            .field("concurrency", &self.concurrency)
            .field("max_slow", &self.max_slow)
            .field("commit", &self.commit)
            .field("filter", &self.filter.is_some())
            .field("session", &self.session)
            .finish()
    }
}

#[derive(Debug)]
struct Progress {
    closest: ClosestReplies,
    successes: usize,
    errors: usize,
}

/// A running lookup.
///
/// Yields every successful reply as a stream item. The stream ends after
/// the commit phase, or with a single `Err` item if the query fails.
/// Dropping the handle stops the lookup and withdraws its requests.
pub struct Query {
    target: NodeId,
    rx: mpsc::Receiver<Result<QueryReply, DhtError>>,
    progress: Arc<Mutex<Progress>>,
    task: JoinHandle<()>,
}

impl Query {
    pub(crate) fn start(dht: Arc<Dht>, request: QueryRequest, options: QueryOptions) -> Self {
        let k = dht.routing_table().k();
        let target = request.target;
        let progress = Arc::new(Mutex::new(Progress {
            closest: ClosestReplies::new(target, k),
            successes: 0,
            errors: 0,
        }));
        let (tx, rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);

        let (abort_tx, abort_rx) = mpsc::unbounded_channel();
        let attachment = match &options.session {
            Some(session) => {
                let handle = Arc::new(QueryAbort {
                    tx: Mutex::new(Some(abort_tx)),
                });
                match session.attach(handle) {
                    Ok(attachment) => Some(attachment),
                    Err(err) => {
                        let _ = tx.try_send(Err(err));
                        return Self {
                            target,
                            rx,
                            progress,
                            task: tokio::spawn(async {}),
                        };
                    }
                }
            }
            None => None,
        };

        let (slow_tx, slow_rx) = mpsc::unbounded_channel();
        let defaults = dht.options();
        let driver = Driver {
            concurrency: options.concurrency.unwrap_or(defaults.concurrency).max(1),
            max_slow: options.max_slow.unwrap_or(defaults.max_slow),
            k,
            request,
            commit: options.commit,
            filter: options.filter,
            progress: progress.clone(),
            tx,
            abort_rx,
            slow_tx,
            slow_rx,
            pending: Vec::new(),
            seen: HashMap::new(),
            inflight: FuturesUnordered::new(),
            active: HashSet::new(),
            slow: HashSet::new(),
            from_table: false,
            seed: options.nodes,
            attachment,
            dht,
        };

        Self {
            target,
            rx,
            progress,
            task: tokio::spawn(driver.run()),
        }
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Snapshot of the closest verified repliers so far.
    pub fn closest_replies(&self) -> Vec<QueryReply> {
        self.progress.lock().closest.replies().to_vec()
    }

    /// Addresses of the closest repliers, suitable for seeding a later
    /// query for the same target via [`QueryOptions::nodes`].
    pub fn closest_nodes(&self) -> Vec<PeerAddr> {
        self.progress
            .lock()
            .closest
            .replies()
            .iter()
            .map(|r| r.from)
            .collect()
    }

    pub fn successes(&self) -> usize {
        self.progress.lock().successes
    }

    pub fn errors(&self) -> usize {
        self.progress.lock().errors
    }

    /// Drives the query to completion, discarding streamed replies, and
    /// returns the closest repliers.
    pub async fn finished(mut self) -> Result<Vec<QueryReply>, DhtError> {
        while let Some(item) = self.rx.recv().await {
            item?;
        }
        Ok(self.closest_replies())
    }
}

impl Stream for Query {
    type Item = Result<QueryReply, DhtError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = self.progress.lock();
        f.debug_struct("Query")
            .field("target", &self.target)
            .field("closest", &progress.closest.len())
            .field("successes", &progress.successes)
            .field("errors", &progress.errors)
            .finish()
    }
}

struct QueryAbort {
    tx: Mutex<Option<mpsc::UnboundedSender<DhtError>>>,
}

impl Abort for QueryAbort {
    fn abort(&self, err: DhtError) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(err);
        }
    }
}

/// Per-address visit state.
enum Seen {
    /// Queued; remembers who told us about it for down hints.
    Refs(Vec<PeerAddr>),
    Done,
    Down,
}

type Visit = BoxFuture<'static, (PeerAddr, u64, Result<Response, DhtError>)>;

enum Event {
    Abort(DhtError),
    Slow(u64),
    Visited(PeerAddr, u64, Result<Response, DhtError>),
}

struct Driver {
    dht: Arc<Dht>,
    request: QueryRequest,
    k: usize,
    concurrency: usize,
    max_slow: usize,
    commit: Commit,
    filter: Option<Arc<NodeFilter>>,
    progress: Arc<Mutex<Progress>>,
    tx: mpsc::Sender<Result<QueryReply, DhtError>>,
    abort_rx: mpsc::UnboundedReceiver<DhtError>,
    slow_tx: mpsc::UnboundedSender<u64>,
    slow_rx: mpsc::UnboundedReceiver<u64>,
    /// Candidates sorted farthest first, so the closest pops off the end.
    pending: Vec<Node>,
    seen: HashMap<PeerAddr, Seen>,
    inflight: FuturesUnordered<Visit>,
    active: HashSet<u64>,
    slow: HashSet<u64>,
    from_table: bool,
    seed: Vec<PeerAddr>,
    attachment: Option<Attachment>,
}

impl Driver {
    async fn run(mut self) {
        let result = self.search().await;

        // Nothing may be sent after the query is over.
        self.inflight = FuturesUnordered::new();
        self.attachment = None;

        if let Err(err) = result {
            debug!(key = %self.request.target, "query failed: {}", err);
            let _ = self.tx.send(Err(err)).await;
        }
    }

    async fn search(&mut self) -> Result<(), DhtError> {
        let seed = std::mem::take(&mut self.seed);
        if seed.is_empty() {
            self.add_from_table();
        } else {
            for addr in seed {
                self.add_pending(Node::from_addr(addr), None);
            }
        }

        loop {
            self.read_more();

            if self.should_finish() {
                if self.from_table || self.successes() * 4 >= self.k {
                    break;
                }
                trace!(key = %self.request.target, "too few successes, retrying from routing table");
                self.add_from_table();
                self.read_more();
                if self.should_finish() {
                    break;
                }
            }

            let event = tokio::select! {
                biased;
                Some(err) = self.abort_rx.recv() => Event::Abort(err),
                Some(seq) = self.slow_rx.recv() => Event::Slow(seq),
                Some((addr, seq, result)) = self.inflight.next() => Event::Visited(addr, seq, result),
                else => break,
            };

            match event {
                Event::Abort(err) => return Err(err),
                Event::Slow(seq) => {
                    if self.active.contains(&seq) {
                        self.slow.insert(seq);
                    }
                }
                Event::Visited(addr, seq, result) => {
                    self.active.remove(&seq);
                    self.slow.remove(&seq);
                    match result {
                        Ok(response) => self.on_response(addr, response).await?,
                        Err(err) => self.on_error(addr, err)?,
                    }
                }
            }
        }

        self.flush().await
    }

    fn successes(&self) -> usize {
        self.progress.lock().successes
    }

    fn closest_len(&self) -> usize {
        self.progress.lock().closest.len()
    }

    fn is_closer(&self, id: &NodeId) -> bool {
        self.progress.lock().closest.is_closer(id)
    }

    fn should_finish(&self) -> bool {
        self.active.is_empty()
            || (self.slow.len() == self.active.len() && self.closest_len() >= self.k)
    }

    fn read_more(&mut self) {
        let concurrency = {
            let progress = self.progress.lock();
            if !self.from_table && progress.successes == 0 && progress.errors == 0 {
                SLOWDOWN_CONCURRENCY.min(self.concurrency)
            } else {
                self.concurrency
            }
        };

        // Retrying requests only stop counting once k replies are in.
        let tolerated = if self.closest_len() >= self.k {
            self.slow.len().min(self.max_slow)
        } else {
            0
        };

        while self.active.len() - tolerated < concurrency {
            let Some(node) = self.pending.pop() else {
                break;
            };
            // Something closer turned up while this one waited.
            if !self.is_closer(&node.id) {
                continue;
            }
            self.visit(node);
        }
    }

    fn visit(&mut self, node: Node) {
        let message = RequestMessage::new(self.request.command.clone())
            .target(self.request.target)
            .value(self.request.value.clone());
        let options = RequestOptions::new()
            .expect_ok(false)
            .on_retry(self.slow_tx.clone());

        let pending = self.dht.request(message, node.addr, options);
        let seq = pending.seq();
        let addr = node.addr;
        self.active.insert(seq);
        self.inflight
            .push(Box::pin(async move { (addr, seq, pending.await) }));
    }

    fn add_from_table(&mut self) {
        self.from_table = true;

        let target = self.request.target;
        for node in self.dht.routing_table().closest(&target, self.k) {
            self.add_pending(node, None);
        }

        if self.pending.len() < self.k {
            let bootstrap = self.dht.bootstrap_nodes().to_vec();
            for addr in bootstrap {
                self.add_pending(Node::from_addr(addr), None);
            }
        }
    }

    fn add_pending(&mut self, node: Node, referrer: Option<PeerAddr>) {
        if node.addr == self.dht.local_addr() || node.id == self.dht.routing_table().our_id() {
            return;
        }

        match self.seen.get_mut(&node.addr) {
            Some(Seen::Done) => return,
            Some(Seen::Down) => {
                if let Some(referrer) = referrer {
                    self.dht.down_hint(referrer, node.addr);
                }
                return;
            }
            Some(Seen::Refs(refs)) => {
                refs.extend(referrer);
                return;
            }
            None => {}
        }

        if !self.is_closer(&node.id) {
            return;
        }

        let target = self.request.target;
        let pos = self
            .pending
            .partition_point(|n| target.cmp_distance(&n.id, &node.id).is_gt());
        self.seen
            .insert(node.addr, Seen::Refs(referrer.into_iter().collect()));
        self.pending.insert(pos, node);
    }

    async fn on_response(&mut self, addr: PeerAddr, response: Response) -> Result<(), DhtError> {
        self.seen.insert(addr, Seen::Done);

        let ok = response.status == status::OK;
        let reply = QueryReply::from(response);
        {
            let mut progress = self.progress.lock();
            if ok {
                progress.successes += 1;
                progress.closest.insert(reply.clone());
            } else {
                progress.errors += 1;
            }
        }

        for &closer in &reply.closer_nodes {
            let node = Node::from_addr(closer);
            if let Some(filter) = &self.filter {
                if !filter(&node) {
                    continue;
                }
            }
            self.add_pending(node, Some(addr));
        }

        if !ok {
            return Ok(());
        }
        self.emit(reply).await
    }

    fn on_error(&mut self, addr: PeerAddr, err: DhtError) -> Result<(), DhtError> {
        if matches!(err, DhtError::Destroyed) || self.dht.is_destroyed() {
            return Err(DhtError::Destroyed);
        }
        trace!("query request to {} failed: {}", addr, err);

        self.progress.lock().errors += 1;
        if let Some(Seen::Refs(referrers)) = self.seen.insert(addr, Seen::Down) {
            for referrer in referrers {
                self.dht.down_hint(referrer, addr);
            }
        }
        Ok(())
    }

    /// Hands a reply to the consumer, unless the query is aborted meanwhile.
    async fn emit(&mut self, reply: QueryReply) -> Result<(), DhtError> {
        tokio::select! {
            biased;
            Some(err) = self.abort_rx.recv() => Err(err),
            sent = self.tx.send(Ok(reply)) => sent.map_err(|_| DhtError::RequestCancelled),
        }
    }

    async fn flush(&mut self) -> Result<(), DhtError> {
        self.inflight = FuturesUnordered::new();
        self.active.clear();
        self.slow.clear();

        if self.dht.is_destroyed() {
            return Err(DhtError::Destroyed);
        }

        let closest = self.progress.lock().closest.replies().to_vec();
        if closest.is_empty() {
            return Err(DhtError::TooFewResponses);
        }
        if self.commit.is_none() {
            return Ok(());
        }

        debug!(
            key = %self.request.target,
            nodes = closest.len(),
            "committing query"
        );

        let writes = closest.into_iter().map(|reply| {
            let dht = self.dht.clone();
            let request = self.request.clone();
            match &self.commit {
                Commit::Custom(f) => f(dht, reply, request),
                _ => auto_commit(dht, reply, request),
            }
        });

        let results = tokio::select! {
            biased;
            Some(err) = self.abort_rx.recv() => return Err(err),
            results = join_all(writes) => results,
        };

        let mut last_err = None;
        let mut committed = false;
        for result in results {
            match result {
                Ok(()) => committed = true,
                Err(err) => last_err = Some(err),
            }
        }

        match (committed, last_err) {
            (true, _) => Ok(()),
            (false, Some(err)) => Err(DhtError::CommitFailed(Box::new(err))),
            (false, None) => Err(DhtError::TooFewResponses),
        }
    }
}

fn auto_commit(
    dht: Arc<Dht>,
    reply: QueryReply,
    request: QueryRequest,
) -> BoxFuture<'static, Result<(), DhtError>> {
    Box::pin(async move {
        let token = reply.token.ok_or(DhtError::MissingToken)?;
        let message = RequestMessage::new(request.command)
            .target(request.target)
            .token(token)
            .value(request.value);
        dht.request(message, reply.from, RequestOptions::default())
            .await?;
        Ok(())
    })
}
