//! Scheduler backend.
//!
//! [`SchedBase`] owns every registered socket and all pending requests, and
//! is the only place actual I/O happens. Each [`SchedBase::tick`]:
//!
//! 1. applies completed worker connects,
//! 2. dispatches queued connect requests within the connection and
//!    half-open budgets,
//! 3. drains listener backlogs (closing blocked peers),
//! 4. grants download quotas in descending score order and reads,
//! 5. grants upload quotas in descending score order and writes,
//! 6. fires idle timeouts.
//!
//! Frontends observe the results as [`SockEvent`]s via
//! [`SchedBase::poll_events`]. Requests never outlive their socket: removing
//! or erroring a socket invalidates everything pending for it.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::rc::Rc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use ratemeter::SpeedMeter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use crate::transport::{Datagram, Listener, TcpTransport, Transport};
use crate::worker::WorkerHandle;
use crate::{SchedError, SockEvent, SocketId};

/// Upper bound for one granted download, and the natural cap for unlimited
/// peers.
pub const INPUT_BUFSIZE: usize = 100 * 1024;

/// Module-supplied priority score hook. Higher scores win the budget race.
pub type ScoreFn = Rc<dyn Fn() -> f32>;

/// Scheduler configuration.
#[derive(Clone)]
pub struct SchedConfig {
    /// Upload budget in bytes/sec; `None` is unlimited.
    pub up_limit: Option<u64>,
    /// Download budget in bytes/sec; `None` is unlimited.
    pub down_limit: Option<u64>,
    /// Maximum open connections.
    pub conn_limit: usize,
    /// Maximum simultaneous half-open (connecting) sockets.
    pub half_open_limit: usize,
    /// Milliseconds between ticks; sizes the per-tick byte budgets.
    pub tick_ms: u64,
    /// Default idle timeout for stream sockets.
    pub default_timeout_ms: u64,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            up_limit: None,
            down_limit: None,
            conn_limit: 500,
            half_open_limit: 20,
            tick_ms: 100,
            default_timeout_ms: 10_000,
        }
    }
}

/// Cumulative scheduler counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    /// Total bytes sent.
    pub up_bytes: u64,
    /// Total bytes received.
    pub down_bytes: u64,
    /// Datagrams sent.
    pub up_packets: u64,
    /// Datagrams received.
    pub down_packets: u64,
    /// Currently open connections.
    pub open_conns: usize,
    /// Currently half-open (connecting) sockets.
    pub half_open: usize,
    /// Connections refused because the peer IP was blocked.
    pub blocked: u64,
}

struct ConnSpec {
    addr: SocketAddrV4,
    timeout_ms: u64,
    seq: u64,
}

struct ConnOutcome {
    id: SocketId,
    result: Result<TcpStream, io::ErrorKind>,
}

struct StreamState {
    transport: Option<Box<dyn Transport>>,
    out_buf: Vec<u8>,
    in_buf: Vec<u8>,
    connected: bool,
    connecting: bool,
    conn_pending: Option<ConnSpec>,
    up_pending: Option<u64>,
    down_pending: Option<u64>,
    peer: Option<SocketAddrV4>,
    up_meter: SpeedMeter,
    down_meter: SpeedMeter,
    timeout_ms: u64,
    last_activity: u64,
}

struct ListenerState {
    listener: Box<dyn Listener>,
    accepted: VecDeque<(Box<dyn Transport>, SocketAddrV4)>,
}

struct UdpState {
    socket: Box<dyn Datagram>,
    out: VecDeque<(SocketAddrV4, Vec<u8>)>,
    inq: VecDeque<(SocketAddrV4, Vec<u8>)>,
    up_pending: Option<u64>,
    up_meter: SpeedMeter,
    down_meter: SpeedMeter,
}

enum SocketState {
    Stream(StreamState),
    Listener(ListenerState),
    Udp(UdpState),
}

struct Entry {
    state: SocketState,
    score: Option<ScoreFn>,
}

impl Entry {
    fn score(&self) -> f32 {
        self.score.as_ref().map_or(1.0, |f| f())
    }
}

/// The scheduler backend. See the module docs for the tick pipeline.
pub struct SchedBase {
    cfg: SchedConfig,
    now: u64,
    next_id: SocketId,
    next_seq: u64,
    sockets: FxHashMap<SocketId, Entry>,
    events: VecDeque<(SocketId, SockEvent)>,
    blocked_ips: FxHashSet<Ipv4Addr>,
    unlimited_ips: FxHashSet<Ipv4Addr>,
    counters: Counters,
    worker: WorkerHandle,
    conn_tx: Sender<ConnOutcome>,
    conn_rx: Receiver<ConnOutcome>,
}

impl SchedBase {
    /// Creates a backend dispatching blocking connects to `worker`.
    #[must_use]
    pub fn new(cfg: SchedConfig, worker: WorkerHandle) -> Self {
        let (conn_tx, conn_rx) = unbounded();
        Self {
            cfg,
            now: 0,
            next_id: 1,
            next_seq: 0,
            sockets: FxHashMap::default(),
            events: VecDeque::new(),
            blocked_ips: FxHashSet::default(),
            unlimited_ips: FxHashSet::default(),
            counters: Counters::default(),
            worker,
            conn_tx,
            conn_rx,
        }
    }

    /// Current scheduler clock in milliseconds.
    #[must_use]
    pub const fn now(&self) -> u64 {
        self.now
    }

    /// Cumulative counters snapshot.
    #[must_use]
    pub const fn counters(&self) -> Counters {
        self.counters
    }

    /// Updates the byte budgets at runtime.
    pub fn set_limits(&mut self, up: Option<u64>, down: Option<u64>) {
        self.cfg.up_limit = up;
        self.cfg.down_limit = down;
    }

    /// Adds `ip` to the block list. Blocked peers cannot be connected and
    /// their incoming connections are closed on accept.
    pub fn add_blocked_ip(&mut self, ip: Ipv4Addr) {
        self.blocked_ips.insert(ip);
    }

    /// Exempts `ip` from byte budgets (LAN peers and the like).
    pub fn add_unlimited_ip(&mut self, ip: Ipv4Addr) {
        self.unlimited_ips.insert(ip);
    }

    /// Returns false when `ip` is on the block list.
    #[must_use]
    pub fn is_allowed(&self, ip: Ipv4Addr) -> bool {
        !self.blocked_ips.contains(&ip)
    }

    /// Returns false when traffic with `ip` bypasses the byte budgets.
    #[must_use]
    pub fn is_limited(&self, ip: Ipv4Addr) -> bool {
        !self.unlimited_ips.contains(&ip)
    }

    fn alloc_id(&mut self) -> SocketId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn seq(&mut self) -> u64 {
        let s = self.next_seq;
        self.next_seq += 1;
        s
    }

    /// Registers a connected (or accepted) stream transport.
    pub fn add_stream(
        &mut self,
        transport: Box<dyn Transport>,
        score: Option<ScoreFn>,
    ) -> SocketId {
        let id = self.alloc_id();
        let peer = transport.peer();
        trace!(target: "sched", id, ?peer, "adding connected stream socket");
        self.counters.open_conns += 1;
        self.sockets.insert(
            id,
            Entry {
                state: SocketState::Stream(StreamState {
                    transport: Some(transport),
                    out_buf: Vec::new(),
                    in_buf: Vec::new(),
                    connected: true,
                    connecting: false,
                    conn_pending: None,
                    up_pending: None,
                    down_pending: None,
                    peer,
                    up_meter: SpeedMeter::default(),
                    down_meter: SpeedMeter::default(),
                    timeout_ms: self.cfg.default_timeout_ms,
                    last_activity: self.now,
                }),
                score,
            },
        );
        id
    }

    /// Registers an unconnected stream socket; pair with
    /// [`SchedBase::connect`].
    pub fn add_stream_pending(&mut self, score: Option<ScoreFn>) -> SocketId {
        let id = self.alloc_id();
        trace!(target: "sched", id, "adding pending stream socket");
        self.sockets.insert(
            id,
            Entry {
                state: SocketState::Stream(StreamState {
                    transport: None,
                    out_buf: Vec::new(),
                    in_buf: Vec::new(),
                    connected: false,
                    connecting: false,
                    conn_pending: None,
                    up_pending: None,
                    down_pending: None,
                    peer: None,
                    up_meter: SpeedMeter::default(),
                    down_meter: SpeedMeter::default(),
                    timeout_ms: self.cfg.default_timeout_ms,
                    last_activity: self.now,
                }),
                score,
            },
        );
        id
    }

    /// Registers a listening socket.
    pub fn add_listener(&mut self, listener: Box<dyn Listener>) -> SocketId {
        let id = self.alloc_id();
        self.sockets.insert(
            id,
            Entry {
                state: SocketState::Listener(ListenerState {
                    listener,
                    accepted: VecDeque::new(),
                }),
                score: None,
            },
        );
        id
    }

    /// Registers a datagram socket.
    pub fn add_udp(&mut self, socket: Box<dyn Datagram>) -> SocketId {
        let id = self.alloc_id();
        self.sockets.insert(
            id,
            Entry {
                state: SocketState::Udp(UdpState {
                    socket,
                    out: VecDeque::new(),
                    inq: VecDeque::new(),
                    up_pending: None,
                    up_meter: SpeedMeter::default(),
                    down_meter: SpeedMeter::default(),
                }),
                score: None,
            },
        );
        id
    }

    /// Removes a socket, invalidating all of its pending requests.
    pub fn del_socket(&mut self, id: SocketId) {
        if let Some(entry) = self.sockets.remove(&id) {
            if let SocketState::Stream(mut s) = entry.state {
                if s.connecting {
                    self.counters.half_open -= 1;
                }
                if s.connected {
                    self.counters.open_conns -= 1;
                }
                if let Some(t) = s.transport.as_mut() {
                    t.shutdown();
                }
            }
            // stale events for the removed socket are harmless: frontends
            // match them against their own registry first
        }
    }

    fn stream(&mut self, id: SocketId) -> Result<&mut StreamState, SchedError> {
        match self.sockets.get_mut(&id) {
            Some(Entry {
                state: SocketState::Stream(s),
                ..
            }) => Ok(s),
            Some(_) => Err(SchedError::WrongKind),
            None => Err(SchedError::UnknownSocket(id)),
        }
    }

    /// Queues outgoing data. Legal before the connect completes; the data
    /// is sent once the socket is up.
    pub fn write(&mut self, id: SocketId, data: &[u8]) -> Result<(), SchedError> {
        let seq = self.seq();
        let s = self.stream(id)?;
        s.out_buf.extend_from_slice(data);
        if s.connected && s.up_pending.is_none() {
            s.up_pending = Some(seq);
        }
        Ok(())
    }

    /// Drains and returns the socket's incoming buffer.
    pub fn read(&mut self, id: SocketId) -> Result<Vec<u8>, SchedError> {
        let s = self.stream(id)?;
        Ok(std::mem::take(&mut s.in_buf))
    }

    /// Bytes queued but not yet sent.
    pub fn pending_out(&mut self, id: SocketId) -> Result<usize, SchedError> {
        Ok(self.stream(id)?.out_buf.len())
    }

    /// Requests an outgoing connection. The attempt itself is released by a
    /// later tick, within the connection budgets.
    pub fn connect(
        &mut self,
        id: SocketId,
        addr: SocketAddrV4,
        timeout_ms: u64,
    ) -> Result<(), SchedError> {
        if !self.is_allowed(*addr.ip()) {
            self.counters.blocked += 1;
            self.events.push_back((id, SockEvent::Blocked));
            return Ok(());
        }
        let seq = self.seq();
        let s = self.stream(id)?;
        if s.connecting || s.conn_pending.is_some() || s.connected {
            return Err(SchedError::AlreadyConnecting);
        }
        s.conn_pending = Some(ConnSpec {
            addr,
            timeout_ms,
            seq,
        });
        Ok(())
    }

    /// Closes a socket, invalidating pending requests. The registration
    /// survives until [`SchedBase::del_socket`].
    pub fn disconnect(&mut self, id: SocketId) -> Result<(), SchedError> {
        let s = self.stream(id)?;
        s.conn_pending = None;
        s.up_pending = None;
        s.down_pending = None;
        if let Some(t) = s.transport.as_mut() {
            t.shutdown();
        }
        s.transport = None;
        let was_connected = std::mem::take(&mut s.connected);
        let was_connecting = std::mem::take(&mut s.connecting);
        if was_connected {
            self.counters.open_conns -= 1;
        }
        if was_connecting {
            self.counters.half_open -= 1;
        }
        Ok(())
    }

    /// Takes one accepted connection off a listener.
    pub fn accept(
        &mut self,
        id: SocketId,
    ) -> Result<Option<(Box<dyn Transport>, SocketAddrV4)>, SchedError> {
        match self.sockets.get_mut(&id) {
            Some(Entry {
                state: SocketState::Listener(l),
                ..
            }) => Ok(l.accepted.pop_front()),
            Some(_) => Err(SchedError::WrongKind),
            None => Err(SchedError::UnknownSocket(id)),
        }
    }

    /// Queues a datagram for sending.
    pub fn send_datagram(
        &mut self,
        id: SocketId,
        to: SocketAddrV4,
        data: Vec<u8>,
    ) -> Result<(), SchedError> {
        let seq = self.seq();
        match self.sockets.get_mut(&id) {
            Some(Entry {
                state: SocketState::Udp(u),
                ..
            }) => {
                u.out.push_back((to, data));
                if u.up_pending.is_none() {
                    u.up_pending = Some(seq);
                }
                Ok(())
            }
            Some(_) => Err(SchedError::WrongKind),
            None => Err(SchedError::UnknownSocket(id)),
        }
    }

    /// Takes one received datagram off a datagram socket.
    pub fn recv_datagram(
        &mut self,
        id: SocketId,
    ) -> Result<Option<(SocketAddrV4, Vec<u8>)>, SchedError> {
        match self.sockets.get_mut(&id) {
            Some(Entry {
                state: SocketState::Udp(u),
                ..
            }) => Ok(u.inq.pop_front()),
            Some(_) => Err(SchedError::WrongKind),
            None => Err(SchedError::UnknownSocket(id)),
        }
    }

    /// Sets the idle timeout for a stream socket.
    pub fn set_timeout(&mut self, id: SocketId, timeout_ms: u64) -> Result<(), SchedError> {
        self.stream(id)?.timeout_ms = timeout_ms;
        Ok(())
    }

    /// Remote endpoint of a stream socket.
    pub fn peer(&self, id: SocketId) -> Option<SocketAddrV4> {
        match self.sockets.get(&id) {
            Some(Entry {
                state: SocketState::Stream(s),
                ..
            }) => s.peer,
            _ => None,
        }
    }

    /// Returns true when the socket is connected.
    #[must_use]
    pub fn is_connected(&self, id: SocketId) -> bool {
        matches!(
            self.sockets.get(&id),
            Some(Entry {
                state: SocketState::Stream(s),
                ..
            }) if s.connected
        )
    }

    /// Current upload speed of a socket over the trailing second.
    #[must_use]
    pub fn up_speed(&self, id: SocketId) -> u64 {
        match self.sockets.get(&id) {
            Some(Entry {
                state: SocketState::Stream(s),
                ..
            }) => s.up_meter.speed(self.now, 1000),
            _ => 0,
        }
    }

    /// Current download speed of a socket over the trailing second.
    #[must_use]
    pub fn down_speed(&self, id: SocketId) -> u64 {
        match self.sockets.get(&id) {
            Some(Entry {
                state: SocketState::Stream(s),
                ..
            }) => s.down_meter.speed(self.now, 1000),
            _ => 0,
        }
    }

    /// Lifetime bytes uploaded to the peer on this socket.
    #[must_use]
    pub fn uploaded(&self, id: SocketId) -> u64 {
        match self.sockets.get(&id) {
            Some(Entry {
                state: SocketState::Stream(s),
                ..
            }) => s.up_meter.total(),
            _ => 0,
        }
    }

    /// Lifetime bytes downloaded from the peer on this socket.
    #[must_use]
    pub fn downloaded(&self, id: SocketId) -> u64 {
        match self.sockets.get(&id) {
            Some(Entry {
                state: SocketState::Stream(s),
                ..
            }) => s.down_meter.total(),
            _ => 0,
        }
    }

    /// Drains pending frontend events.
    pub fn poll_events(&mut self) -> Vec<(SocketId, SockEvent)> {
        self.events.drain(..).collect()
    }

    /// Runs one scheduling pass at clock `now_ms`.
    pub fn tick(&mut self, now_ms: u64) {
        self.now = now_ms;
        self.apply_conn_results();
        self.dispatch_connects();
        self.poll_listeners();
        self.run_downloads();
        self.run_uploads();
        self.fire_timeouts();
    }

    fn apply_conn_results(&mut self) {
        let outcomes: Vec<ConnOutcome> = self.conn_rx.try_iter().collect();
        for outcome in outcomes {
            let Some(Entry {
                state: SocketState::Stream(s),
                ..
            }) = self.sockets.get_mut(&outcome.id)
            else {
                continue; // socket removed while connecting
            };
            if !s.connecting {
                continue; // disconnect() raced the worker
            }
            s.connecting = false;
            self.counters.half_open -= 1;
            match outcome.result.and_then(|stream| {
                TcpTransport::new(stream).map_err(|e| e.kind())
            }) {
                Ok(transport) => {
                    s.peer = transport.peer();
                    s.transport = Some(Box::new(transport));
                    s.connected = true;
                    s.last_activity = self.now;
                    self.counters.open_conns += 1;
                    if !s.out_buf.is_empty() && s.up_pending.is_none() {
                        s.up_pending = Some(0);
                    }
                    self.events.push_back((outcome.id, SockEvent::Connected));
                }
                Err(kind) => {
                    debug!(target: "sched", id = outcome.id, ?kind, "connect failed");
                    self.events.push_back((outcome.id, SockEvent::ConnFailed));
                }
            }
        }
    }

    fn dispatch_connects(&mut self) {
        let mut queued: Vec<(f32, u64, SocketId)> = self
            .sockets
            .iter()
            .filter_map(|(id, e)| match &e.state {
                SocketState::Stream(s) => s
                    .conn_pending
                    .as_ref()
                    .map(|c| (e.score(), c.seq, *id)),
                _ => None,
            })
            .collect();
        sort_by_score(&mut queued);

        for (_, _, id) in queued {
            if self.counters.open_conns >= self.cfg.conn_limit
                || self.counters.half_open >= self.cfg.half_open_limit
            {
                break; // budget exhausted, retried next tick
            }
            let Some(Entry {
                state: SocketState::Stream(s),
                ..
            }) = self.sockets.get_mut(&id)
            else {
                continue;
            };
            let Some(spec) = s.conn_pending.take() else {
                continue;
            };
            s.connecting = true;
            self.counters.half_open += 1;
            let tx = self.conn_tx.clone();
            let addr = spec.addr;
            let timeout = Duration::from_millis(spec.timeout_ms.max(1));
            trace!(target: "sched", id, %addr, "dispatching connect");
            self.worker.submit(move || {
                let result = TcpStream::connect_timeout(&SocketAddr::V4(addr), timeout)
                    .map_err(|e| e.kind());
                let _ = tx.send(ConnOutcome { id, result });
            });
        }
    }

    fn poll_listeners(&mut self) {
        let ids: Vec<SocketId> = self
            .sockets
            .iter()
            .filter(|(_, e)| matches!(e.state, SocketState::Listener(_)))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            // bounded per tick so one busy listener cannot starve the rest
            for _ in 0..16 {
                if self.counters.open_conns >= self.cfg.conn_limit {
                    return;
                }
                let Some(Entry {
                    state: SocketState::Listener(l),
                    ..
                }) = self.sockets.get_mut(&id)
                else {
                    break;
                };
                match l.listener.accept() {
                    Ok(Some((mut transport, addr))) => {
                        if self.blocked_ips.contains(addr.ip()) {
                            transport.shutdown();
                            self.counters.blocked += 1;
                            debug!(target: "sched", %addr, "closed blocked peer");
                            continue;
                        }
                        l.accepted.push_back((transport, addr));
                        self.counters.open_conns += 1;
                        self.events.push_back((id, SockEvent::Accept));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(target: "sched", id, error = %e, "listener error");
                        break;
                    }
                }
            }
        }
    }

    fn budget_for(limit: Option<u64>, tick_ms: u64) -> Option<u64> {
        limit.map(|per_sec| (per_sec * tick_ms / 1000).max(1))
    }

    fn run_downloads(&mut self) {
        // every connected stream is an implicit download request; data
        // presence is discovered by the non-blocking read itself
        let mut candidates: Vec<(f32, u64, SocketId)> = Vec::new();
        let mut seq = self.next_seq;
        for (id, e) in &mut self.sockets {
            let score = e.score.as_ref().map_or(1.0, |f| f());
            match &mut e.state {
                SocketState::Stream(s) if s.connected => {
                    let assigned = *s.down_pending.get_or_insert_with(|| {
                        let v = seq;
                        seq += 1;
                        v
                    });
                    candidates.push((score, assigned, *id));
                }
                SocketState::Udp(_) => {
                    candidates.push((score, 0, *id));
                }
                _ => {}
            }
        }
        self.next_seq = seq;
        sort_by_score(&mut candidates);

        let mut budget = Self::budget_for(self.cfg.down_limit, self.cfg.tick_ms);
        let mut buf = vec![0u8; INPUT_BUFSIZE];

        for (_, _, id) in candidates {
            if budget == Some(0) {
                break; // retried next tick
            }
            let unlimited_ips = &self.unlimited_ips;
            match self.sockets.get_mut(&id).map(|e| &mut e.state) {
                Some(SocketState::Stream(s)) => {
                    let limited = s
                        .peer
                        .map_or(true, |p| !unlimited_ips.contains(p.ip()));
                    let quota = if limited {
                        budget.map_or(INPUT_BUFSIZE, |b| (b as usize).min(INPUT_BUFSIZE))
                    } else {
                        INPUT_BUFSIZE
                    };
                    let mut received = 0usize;
                    let mut fatal: Option<SockEvent> = None;
                    while received < quota {
                        let want = (quota - received).min(buf.len());
                        let Some(t) = s.transport.as_mut() else { break };
                        match t.read(&mut buf[..want]) {
                            Ok(0) => {
                                fatal = Some(SockEvent::Lost);
                                break;
                            }
                            Ok(n) => {
                                s.in_buf.extend_from_slice(&buf[..n]);
                                received += n;
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(_) => {
                                fatal = Some(SockEvent::Err);
                                break;
                            }
                        }
                    }
                    if received > 0 {
                        s.down_meter.add(self.now, received as u64);
                        s.last_activity = self.now;
                        self.counters.down_bytes += received as u64;
                        if limited {
                            if let Some(b) = budget.as_mut() {
                                *b = b.saturating_sub(received as u64);
                            }
                        }
                        self.events.push_back((id, SockEvent::Read));
                    }
                    s.down_pending = None;
                    if let Some(evt) = fatal {
                        self.stream_failure(id, evt);
                    }
                }
                Some(SocketState::Udp(u)) => {
                    loop {
                        match u.socket.recv_from(&mut buf) {
                            Ok(Some((n, from))) => {
                                u.inq.push_back((from, buf[..n].to_vec()));
                                u.down_meter.add(self.now, n as u64);
                                self.counters.down_bytes += n as u64;
                                self.counters.down_packets += 1;
                                if let Some(b) = budget.as_mut() {
                                    *b = b.saturating_sub(n as u64);
                                }
                                self.events.push_back((id, SockEvent::Read));
                            }
                            Ok(None) => break,
                            Err(e) => {
                                debug!(target: "sched", id, error = %e, "udp recv error");
                                break;
                            }
                        }
                        if budget == Some(0) {
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn run_uploads(&mut self) {
        let mut candidates: Vec<(f32, u64, SocketId)> = self
            .sockets
            .iter()
            .filter_map(|(id, e)| match &e.state {
                SocketState::Stream(s) => s.up_pending.map(|seq| (e.score(), seq, *id)),
                SocketState::Udp(u) => u.up_pending.map(|seq| (e.score(), seq, *id)),
                SocketState::Listener(_) => None,
            })
            .collect();
        sort_by_score(&mut candidates);

        let mut budget = Self::budget_for(self.cfg.up_limit, self.cfg.tick_ms);

        for (_, _, id) in candidates {
            if budget == Some(0) {
                break;
            }
            let unlimited_ips = &self.unlimited_ips;
            match self.sockets.get_mut(&id).map(|e| &mut e.state) {
                Some(SocketState::Stream(s)) => {
                    if !s.connected || s.out_buf.is_empty() {
                        // drained or invalidated since queueing
                        if s.out_buf.is_empty() {
                            s.up_pending = None;
                        }
                        continue;
                    }
                    let limited = s
                        .peer
                        .map_or(true, |p| !unlimited_ips.contains(p.ip()));
                    let quota = if limited {
                        budget.map_or(s.out_buf.len(), |b| (b as usize).min(s.out_buf.len()))
                    } else {
                        s.out_buf.len()
                    };
                    if quota == 0 {
                        continue;
                    }
                    let mut fatal: Option<SockEvent> = None;
                    let mut sent = 0usize;
                    {
                        let Some(t) = s.transport.as_mut() else { continue };
                        while sent < quota {
                            match t.write(&s.out_buf[sent..quota]) {
                                Ok(0) => break,
                                Ok(n) => sent += n,
                                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                                Err(_) => {
                                    fatal = Some(SockEvent::Err);
                                    break;
                                }
                            }
                        }
                    }
                    if sent > 0 {
                        s.out_buf.drain(..sent);
                        s.up_meter.add(self.now, sent as u64);
                        s.last_activity = self.now;
                        self.counters.up_bytes += sent as u64;
                        if limited {
                            if let Some(b) = budget.as_mut() {
                                *b = b.saturating_sub(sent as u64);
                            }
                        }
                        if s.out_buf.is_empty() {
                            // request fulfilled; tell the frontend it can
                            // queue more data
                            s.up_pending = None;
                            self.events.push_back((id, SockEvent::Write));
                        }
                    }
                    if let Some(evt) = fatal {
                        self.stream_failure(id, evt);
                    }
                }
                Some(SocketState::Udp(u)) => {
                    while let Some((to, data)) = u.out.front() {
                        if let Some(b) = budget {
                            if b < data.len() as u64 && b != 0 {
                                break; // datagram does not fit this tick
                            }
                            if b == 0 {
                                break;
                            }
                        }
                        match u.socket.send_to(data, *to) {
                            Ok(n) => {
                                u.up_meter.add(self.now, n as u64);
                                self.counters.up_bytes += n as u64;
                                self.counters.up_packets += 1;
                                if let Some(b) = budget.as_mut() {
                                    *b = b.saturating_sub(n as u64);
                                }
                            }
                            Err(e) => {
                                debug!(target: "sched", id, error = %e, "udp send error");
                            }
                        }
                        u.out.pop_front();
                    }
                    if u.out.is_empty() {
                        u.up_pending = None;
                    }
                }
                _ => {}
            }
        }
    }

    fn fire_timeouts(&mut self) {
        let mut timed_out = Vec::new();
        for (id, e) in &mut self.sockets {
            if let SocketState::Stream(s) = &mut e.state {
                if s.connected
                    && s.timeout_ms > 0
                    && self.now.saturating_sub(s.last_activity) >= s.timeout_ms
                {
                    s.last_activity = self.now;
                    timed_out.push(*id);
                }
            }
        }
        for id in timed_out {
            trace!(target: "sched", id, "socket idle timeout");
            if let Ok(s) = self.stream(id) {
                s.up_pending = None;
                s.down_pending = None;
                s.conn_pending = None;
            }
            self.events.push_back((id, SockEvent::Timeout));
        }
    }

    /// Error/EOF on a stream: invalidate everything pending, release the
    /// connection slot and surface the event.
    fn stream_failure(&mut self, id: SocketId, evt: SockEvent) {
        if let Ok(s) = self.stream(id) {
            s.up_pending = None;
            s.down_pending = None;
            s.conn_pending = None;
            if let Some(t) = s.transport.as_mut() {
                t.shutdown();
            }
            s.transport = None;
            let was_connected = std::mem::take(&mut s.connected);
            let was_connecting = std::mem::take(&mut s.connecting);
            if was_connected {
                self.counters.open_conns -= 1;
            }
            if was_connecting {
                self.counters.half_open -= 1;
            }
        }
        self.events.push_back((id, evt));
    }
}

fn sort_by_score(items: &mut [(f32, u64, SocketId)]) {
    items.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{memory_pair, MemDatagram, MemListener, MemTransport};
    use crate::WorkerPool;
    use std::net::Ipv4Addr;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    fn sched(cfg: SchedConfig) -> (WorkerPool, SchedBase) {
        let pool = WorkerPool::new(1);
        let base = SchedBase::new(cfg, pool.handle());
        (pool, base)
    }

    fn connected_pair(base: &mut SchedBase) -> (SocketId, MemTransport) {
        let (a, b) = memory_pair(addr(1, 1000), addr(2, 2000));
        let id = base.add_stream(Box::new(a), None);
        (id, b)
    }

    #[test]
    fn write_is_flushed_on_tick() {
        let (_pool, mut base) = sched(SchedConfig::default());
        let (id, mut far) = connected_pair(&mut base);
        base.write(id, b"hello donkey").unwrap();
        base.tick(100);

        let mut buf = [0u8; 64];
        let n = far.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello donkey");
        assert!(base
            .poll_events()
            .contains(&(id, SockEvent::Write)));
        assert_eq!(base.counters().up_bytes, 12);
    }

    #[test]
    fn incoming_bytes_surface_as_read_event() {
        let (_pool, mut base) = sched(SchedConfig::default());
        let (id, mut far) = connected_pair(&mut base);
        far.write(b"ping").unwrap();
        base.tick(100);

        assert!(base.poll_events().contains(&(id, SockEvent::Read)));
        assert_eq!(base.read(id).unwrap(), b"ping");
        assert_eq!(base.counters().down_bytes, 4);
    }

    #[test]
    fn upload_budget_is_enforced_per_tick() {
        let cfg = SchedConfig {
            up_limit: Some(100), // 100 B/s, 100ms ticks -> 10 bytes/tick
            ..SchedConfig::default()
        };
        let (_pool, mut base) = sched(cfg);
        let (id, mut far) = connected_pair(&mut base);
        base.write(id, &[7u8; 25]).unwrap();

        base.tick(100);
        let mut buf = [0u8; 64];
        assert_eq!(far.read(&mut buf).unwrap(), 10);
        base.tick(200);
        assert_eq!(far.read(&mut buf).unwrap(), 10);
        base.tick(300);
        assert_eq!(far.read(&mut buf).unwrap(), 5);
    }

    #[test]
    fn unlimited_peer_bypasses_budget() {
        let cfg = SchedConfig {
            up_limit: Some(100),
            ..SchedConfig::default()
        };
        let (_pool, mut base) = sched(cfg);
        base.add_unlimited_ip(Ipv4Addr::new(10, 0, 0, 2));
        let (id, mut far) = connected_pair(&mut base);
        base.write(id, &[7u8; 25]).unwrap();
        base.tick(100);
        let mut buf = [0u8; 64];
        assert_eq!(far.read(&mut buf).unwrap(), 25);
        // unlimited traffic does not deplete the shared budget: a second,
        // limited socket still gets its slice
        let (id2, mut far2) = connected_pair(&mut base);
        base.write(id2, &[1u8; 25]).unwrap();
        base.tick(200);
        assert_eq!(far2.read(&mut buf).unwrap(), 10);
        let _ = id;
    }

    #[test]
    fn higher_score_wins_the_budget() {
        let cfg = SchedConfig {
            up_limit: Some(100), // 10 bytes per tick
            ..SchedConfig::default()
        };
        let (_pool, mut base) = sched(cfg);
        let (low, mut far_low) = connected_pair(&mut base);
        let (a, b) = memory_pair(addr(3, 3000), addr(4, 4000));
        let high = base.add_stream(Box::new(a), Some(Rc::new(|| 5.0)));
        let mut far_high = b;

        base.write(low, &[0u8; 10]).unwrap();
        base.write(high, &[1u8; 10]).unwrap();
        base.tick(100);

        let mut buf = [0u8; 64];
        assert_eq!(far_high.read(&mut buf).unwrap(), 10);
        assert!(far_low.read(&mut buf).is_err()); // nothing granted yet
        base.tick(200);
        assert_eq!(far_low.read(&mut buf).unwrap(), 10);
    }

    #[test]
    fn equal_scores_run_fifo() {
        let cfg = SchedConfig {
            up_limit: Some(100),
            ..SchedConfig::default()
        };
        let (_pool, mut base) = sched(cfg);
        let (first, mut far_first) = connected_pair(&mut base);
        let (a, b) = memory_pair(addr(3, 3000), addr(4, 4000));
        let second = base.add_stream(Box::new(a), None);
        let mut far_second = b;

        base.write(first, &[0u8; 10]).unwrap();
        base.write(second, &[1u8; 10]).unwrap();
        base.tick(100);

        let mut buf = [0u8; 64];
        assert_eq!(far_first.read(&mut buf).unwrap(), 10);
        assert!(far_second.read(&mut buf).is_err());
    }

    #[test]
    fn eof_surfaces_as_lost_and_releases_conn() {
        let (_pool, mut base) = sched(SchedConfig::default());
        let (id, mut far) = connected_pair(&mut base);
        assert_eq!(base.counters().open_conns, 1);
        far.shutdown();
        base.tick(100);
        assert!(base.poll_events().contains(&(id, SockEvent::Lost)));
        assert_eq!(base.counters().open_conns, 0);
        assert!(!base.is_connected(id));
    }

    #[test]
    fn idle_timeout_fires_once() {
        let cfg = SchedConfig {
            default_timeout_ms: 1000,
            ..SchedConfig::default()
        };
        let (_pool, mut base) = sched(cfg);
        let (id, _far) = connected_pair(&mut base);
        base.tick(500);
        assert!(base.poll_events().is_empty());
        base.tick(1000);
        assert_eq!(base.poll_events(), vec![(id, SockEvent::Timeout)]);
        base.tick(1100);
        assert!(base.poll_events().is_empty());
    }

    #[test]
    fn blocked_ip_connect_is_refused() {
        let (_pool, mut base) = sched(SchedConfig::default());
        base.add_blocked_ip(Ipv4Addr::new(10, 0, 0, 9));
        let id = base.add_stream_pending(None);
        base.connect(id, addr(9, 4662), 5000).unwrap();
        assert_eq!(base.poll_events(), vec![(id, SockEvent::Blocked)]);
        assert_eq!(base.counters().blocked, 1);
    }

    #[test]
    fn blocked_ip_accept_is_closed_and_counted() {
        let (_pool, mut base) = sched(SchedConfig::default());
        base.add_blocked_ip(Ipv4Addr::new(10, 0, 0, 7));
        let mut listener = MemListener::default();
        let (a, _b) = memory_pair(addr(7, 1), addr(1, 2));
        listener.push(Box::new(a), addr(7, 4662));
        let id = base.add_listener(Box::new(listener));
        base.tick(100);
        assert!(base.poll_events().is_empty());
        assert_eq!(base.counters().blocked, 1);
        assert!(base.accept(id).unwrap().is_none());
    }

    #[test]
    fn accept_surfaces_queued_connection() {
        let (_pool, mut base) = sched(SchedConfig::default());
        let mut listener = MemListener::default();
        let (a, _b) = memory_pair(addr(6, 1), addr(1, 2));
        listener.push(Box::new(a), addr(6, 4662));
        let id = base.add_listener(Box::new(listener));
        base.tick(100);
        assert!(base.poll_events().contains(&(id, SockEvent::Accept)));
        let (_transport, from) = base.accept(id).unwrap().unwrap();
        assert_eq!(from, addr(6, 4662));
        assert_eq!(base.counters().open_conns, 1);
    }

    #[test]
    fn datagrams_round_trip_through_queues() {
        let (_pool, mut base) = sched(SchedConfig::default());
        let mut dg = MemDatagram::default();
        let sent = Rc::clone(&dg.sent);
        dg.push_incoming(vec![1, 2, 3], addr(5, 4665));
        let id = base.add_udp(Box::new(dg));

        base.send_datagram(id, addr(8, 4665), vec![9, 9]).unwrap();
        base.tick(100);

        assert_eq!(sent.borrow().as_slice(), &[(vec![9, 9], addr(8, 4665))]);
        assert_eq!(
            base.recv_datagram(id).unwrap(),
            Some((addr(5, 4665), vec![1, 2, 3]))
        );
        assert_eq!(base.counters().up_packets, 1);
        assert_eq!(base.counters().down_packets, 1);
    }

    #[test]
    fn del_socket_invalidates_and_releases() {
        let (_pool, mut base) = sched(SchedConfig::default());
        let (id, _far) = connected_pair(&mut base);
        base.write(id, b"pending").unwrap();
        base.del_socket(id);
        assert_eq!(base.counters().open_conns, 0);
        assert!(base.write(id, b"x").is_err());
        base.tick(100); // must not panic on the removed socket
    }

    #[test]
    fn disconnect_keeps_registration() {
        let (_pool, mut base) = sched(SchedConfig::default());
        let (id, _far) = connected_pair(&mut base);
        base.disconnect(id).unwrap();
        assert!(!base.is_connected(id));
        assert_eq!(base.counters().open_conns, 0);
        // still registered: buffered writes wait for a reconnect
        base.write(id, b"later").unwrap();
    }

    #[test]
    fn download_budget_throttles_reads() {
        let cfg = SchedConfig {
            down_limit: Some(100), // 10 bytes per 100ms tick
            ..SchedConfig::default()
        };
        let (_pool, mut base) = sched(cfg);
        let (id, mut far) = connected_pair(&mut base);
        far.write(&[3u8; 30]).unwrap();
        base.tick(100);
        assert_eq!(base.read(id).unwrap().len(), 10);
        base.tick(200);
        assert_eq!(base.read(id).unwrap().len(), 10);
    }

    #[test]
    fn speeds_and_totals_are_tracked() {
        let (_pool, mut base) = sched(SchedConfig::default());
        let (id, mut far) = connected_pair(&mut base);
        base.write(id, &[0u8; 100]).unwrap();
        far.write(&[0u8; 40]).unwrap();
        base.tick(100);
        assert_eq!(base.uploaded(id), 100);
        assert_eq!(base.downloaded(id), 40);
        assert!(base.up_speed(id) > 0);
    }
}
