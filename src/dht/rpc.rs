use super::congestion::CongestionWindow;
use super::error::DhtError;
use super::node::{to_peer_addr, NodeId, PeerAddr};
use super::session::{Abort, Attachment, Session};
use crate::constants::{
    DEFAULT_DRAIN_INTERVAL, DEFAULT_MAX_RETRIES, DEFAULT_MAX_WINDOW, DEFAULT_TIMEOUT_TICKS,
};
use crate::wire::{status, Kind, Message, Token};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct RpcOptions {
    /// Sends allowed per drain tick; twice this across the whole window.
    pub max_window: usize,
    pub max_retries: u32,
    /// Drain ticks to wait for a reply before retrying.
    pub timeout_ticks: u32,
    pub drain_interval: Duration,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            max_window: DEFAULT_MAX_WINDOW,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ticks: DEFAULT_TIMEOUT_TICKS,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
        }
    }
}

/// Per-request behaviour.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub(crate) max_retries: Option<u32>,
    pub(crate) expect_ok: bool,
    pub(crate) session: Option<Session>,
    pub(crate) on_retry: Option<mpsc::UnboundedSender<u64>>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_retries: None,
            expect_ok: true,
            session: None,
            on_retry: None,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the transport's retry budget for this request.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// When false, non-zero statuses resolve as `Ok` instead of
    /// [`DhtError::Remote`].
    pub fn expect_ok(mut self, expect_ok: bool) -> Self {
        self.expect_ok = expect_ok;
        self
    }

    pub fn session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Receives the request's sequence number on its first retransmission.
    pub(crate) fn on_retry(mut self, tx: mpsc::UnboundedSender<u64>) -> Self {
        self.on_retry = Some(tx);
        self
    }
}

/// A decoded response to one of our requests.
#[derive(Debug, Clone)]
pub struct Response {
    pub tid: u16,
    pub from: PeerAddr,
    /// The responder's id, present only if it matches its address and the
    /// reply came from the address we asked.
    pub id: Option<NodeId>,
    /// Our address as observed by the responder.
    pub to: PeerAddr,
    pub token: Option<Token>,
    pub status: u64,
    pub closer_nodes: Vec<PeerAddr>,
    pub value: Bytes,
}

/// A decoded request from a remote node.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub tid: u16,
    pub from: PeerAddr,
    /// The sender's id, present only if it matches its address.
    pub id: Option<NodeId>,
    /// Our address as the sender addressed it.
    pub to: PeerAddr,
    pub token: Option<Token>,
    pub command: String,
    pub target: Option<NodeId>,
    pub value: Bytes,
}

/// What a datagram turned out to be.
#[derive(Debug)]
pub enum Inbound {
    Request(IncomingRequest),
    Response(Response),
}

/// Cumulative transport counters.
#[derive(Debug, Default)]
pub struct RpcStats {
    sent: AtomicU64,
    retries: AtomicU64,
    responses: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub retries: u64,
    pub responses: u64,
    pub timeouts: u64,
}

impl RpcStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

type Reply = Result<Response, DhtError>;

struct Inflight {
    seq: u64,
    tid: u16,
    to: PeerAddr,
    buffer: Bytes,
    /// Transmissions so far; zero while queued behind the congestion window.
    sent: u32,
    /// Drain ticks left before the request is retried or failed.
    timeout: u32,
    max_retries: u32,
    expect_ok: bool,
    on_retry: Option<mpsc::UnboundedSender<u64>>,
    tx: oneshot::Sender<Reply>,
}

struct RpcState {
    inflight: Vec<Inflight>,
    congestion: CongestionWindow,
    next_tid: u16,
    destroyed: bool,
}

/// Request/response multiplexer over one UDP socket.
///
/// Requests get sequential transaction ids and are matched to responses by
/// id alone. Retries and timeouts are evaluated on [`Rpc::drain`], which the
/// owner calls every `drain_interval`.
pub struct Rpc {
    /// Taken on destroy so the port is released.
    socket: Mutex<Option<Arc<UdpSocket>>>,
    options: RpcOptions,
    state: Mutex<RpcState>,
    next_seq: AtomicU64,
    stats: RpcStats,
}

impl Rpc {
    pub fn new<R: RngCore + ?Sized>(
        socket: Arc<UdpSocket>,
        options: RpcOptions,
        rng: &mut R,
    ) -> Arc<Self> {
        let next_tid = (rng.next_u32() & 0xffff) as u16;
        Arc::new(Self {
            socket: Mutex::new(Some(socket)),
            state: Mutex::new(RpcState {
                inflight: Vec::new(),
                congestion: CongestionWindow::new(options.max_window),
                next_tid,
                destroyed: false,
            }),
            options,
            next_seq: AtomicU64::new(1),
            stats: RpcStats::default(),
        })
    }

    /// The bound socket, or `None` once destroyed.
    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().clone()
    }

    pub fn options(&self) -> &RpcOptions {
        &self.options
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn inflight(&self) -> usize {
        self.state.lock().inflight.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Queues `message` for `to` and sends it right away if the window allows.
    ///
    /// The transaction id is assigned here; whatever `message.tid` held is
    /// overwritten.
    pub fn request(
        self: &Arc<Self>,
        mut message: Message,
        to: PeerAddr,
        options: RequestOptions,
    ) -> PendingRequest {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let pending = PendingRequest {
            seq,
            rx,
            rpc: Arc::downgrade(self),
            done: false,
            attachment: None,
        };

        {
            let mut state = self.state.lock();
            if state.destroyed {
                let _ = tx.send(Err(DhtError::Destroyed));
                return pending;
            }

            message.tid = state.next_tid;
            state.next_tid = state.next_tid.wrapping_add(1);

            state.inflight.push(Inflight {
                seq,
                tid: message.tid,
                to,
                buffer: message.encode(),
                sent: 0,
                timeout: 0,
                max_retries: options.max_retries.unwrap_or(self.options.max_retries),
                expect_ok: options.expect_ok,
                on_retry: options.on_retry,
                tx,
            });
        }

        let mut pending = pending;
        if let Some(session) = options.session {
            let handle = Arc::new(RequestAbort {
                rpc: Arc::downgrade(self),
                seq,
            });
            match session.attach(handle) {
                Ok(attachment) => pending.attachment = Some(attachment),
                Err(err) => {
                    self.cancel(seq, err);
                    return pending;
                }
            }
        }

        self.send_queued(seq);
        pending
    }

    fn send_queued(&self, seq: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.congestion.is_full() {
            trace!(seq, "congestion window full, request queued");
            return;
        }
        if let Some(req) = state.inflight.iter_mut().rev().find(|r| r.seq == seq) {
            self.transmit(&mut state.congestion, req);
        }
    }

    /// Returns false if the socket would block; the request stays queued.
    fn transmit(&self, congestion: &mut CongestionWindow, req: &mut Inflight) -> bool {
        let Some(socket) = self.socket() else {
            return false;
        };
        match socket.try_send_to(&req.buffer, SocketAddr::V4(req.to)) {
            Ok(_) => {
                congestion.send();
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
            Err(e) => {
                // Counts as an attempt so the request still times out.
                debug!("send to {} failed: {}", req.to, e);
            }
        }
        req.sent += 1;
        req.timeout = self.options.timeout_ticks.max(1);
        true
    }

    /// Decodes a datagram.
    ///
    /// Responses are matched to their pending request, which is resolved
    /// before the response is handed back. Requests are returned for the
    /// owner to answer. Malformed or unmatched datagrams yield `None`.
    pub fn on_message(&self, buf: &[u8], from: SocketAddr) -> Option<Inbound> {
        let from = to_peer_addr(from).filter(|a| a.port() != 0)?;

        let message = match Message::decode(buf) {
            Ok(m) => m,
            Err(e) => {
                warn!("dropping malformed datagram from {}: {}", from, e);
                return None;
            }
        };

        let id = message
            .id
            .map(NodeId)
            .filter(|id| *id == NodeId::derive(&from));

        match message.kind {
            Kind::Request { command, target } => Some(Inbound::Request(IncomingRequest {
                tid: message.tid,
                from,
                id,
                to: message.to,
                token: message.token,
                command,
                target: target.map(NodeId),
                value: message.value,
            })),
            Kind::Response {
                status,
                closer_nodes,
            } => {
                let req = {
                    let mut state = self.state.lock();
                    let Some(pos) = state.inflight.iter().position(|r| r.tid == message.tid)
                    else {
                        trace!(tid = message.tid, "response for unknown transaction from {}", from);
                        return None;
                    };
                    let req = state.inflight.swap_remove(pos);
                    state.congestion.recv();
                    req
                };
                self.stats.responses.fetch_add(1, Ordering::Relaxed);

                let response = Response {
                    tid: message.tid,
                    from,
                    id: if req.to == from { id } else { None },
                    to: message.to,
                    token: message.token,
                    status,
                    closer_nodes: closer_nodes.unwrap_or_default(),
                    value: message.value,
                };

                let result = if req.expect_ok && status != status::OK {
                    Err(DhtError::Remote { status })
                } else {
                    Ok(response.clone())
                };
                let _ = req.tx.send(result);

                Some(Inbound::Response(response))
            }
        }
    }

    /// Rotates the congestion window, sends queued requests that now fit and
    /// retries or fails requests whose timeout elapsed.
    ///
    /// Returns the destinations of requests that timed out.
    pub fn drain(&self) -> Vec<PeerAddr> {
        let mut timed_out = Vec::new();

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.congestion.drain();

            let mut i = 0;
            while i < state.inflight.len() {
                let req = &mut state.inflight[i];

                if req.sent == 0 {
                    if !state.congestion.is_full() {
                        self.transmit(&mut state.congestion, req);
                    }
                    i += 1;
                    continue;
                }

                if req.timeout > 1 {
                    req.timeout -= 1;
                    i += 1;
                    continue;
                }

                if req.sent > req.max_retries {
                    timed_out.push(state.inflight.swap_remove(i));
                    continue;
                }

                if state.congestion.is_full() {
                    i += 1;
                    continue;
                }

                if self.transmit(&mut state.congestion, req) {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    if req.sent == 2 {
                        if let Some(on_retry) = &req.on_retry {
                            let _ = on_retry.send(req.seq);
                        }
                    }
                }
                i += 1;
            }
        }

        let mut addrs = Vec::with_capacity(timed_out.len());
        for req in timed_out {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            debug!(tid = req.tid, "request to {} timed out", req.to);
            addrs.push(req.to);
            let _ = req.tx.send(Err(DhtError::RequestTimeout));
        }
        addrs
    }

    /// Removes a pending request and fails it with `err`.
    pub(crate) fn cancel(&self, seq: u64, err: DhtError) -> bool {
        let req = {
            let mut state = self.state.lock();
            match state.inflight.iter().position(|r| r.seq == seq) {
                Some(pos) => state.inflight.swap_remove(pos),
                None => return false,
            }
        };
        let _ = req.tx.send(Err(err));
        true
    }

    /// Sends a response immediately; replies bypass the congestion window.
    pub async fn reply(&self, message: &Message, to: PeerAddr) {
        let Some(socket) = self.socket() else {
            return;
        };
        let data = message.encode();
        if let Err(e) = socket.send_to(&data, SocketAddr::V4(to)).await {
            debug!("reply to {} failed: {}", to, e);
        }
    }

    /// Fails every pending request with [`DhtError::Destroyed`], refuses
    /// new ones and closes the socket.
    ///
    /// The port is released once the receive loop drops its handle too.
    pub fn destroy(&self) {
        let inflight = {
            let mut state = self.state.lock();
            state.destroyed = true;
            std::mem::take(&mut state.inflight)
        };
        self.socket.lock().take();
        for req in inflight {
            let _ = req.tx.send(Err(DhtError::Destroyed));
        }
    }
}

struct RequestAbort {
    rpc: Weak<Rpc>,
    seq: u64,
}

impl Abort for RequestAbort {
    fn abort(&self, err: DhtError) {
        if let Some(rpc) = self.rpc.upgrade() {
            rpc.cancel(self.seq, err);
        }
    }
}

/// Resolves with the response, or with a timeout or cancellation error.
///
/// Dropping it before completion withdraws the request.
pub struct PendingRequest {
    seq: u64,
    rx: oneshot::Receiver<Reply>,
    rpc: Weak<Rpc>,
    done: bool,
    attachment: Option<Attachment>,
}

impl PendingRequest {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Future for PendingRequest {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Reply> {
        let result = ready!(Pin::new(&mut self.rx).poll(cx));
        self.done = true;
        self.attachment = None;
        Poll::Ready(result.unwrap_or(Err(DhtError::RequestCancelled)))
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(rpc) = self.rpc.upgrade() {
            rpc.cancel(self.seq, DhtError::RequestCancelled);
        }
    }
}
