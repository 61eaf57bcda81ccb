//! Peer sessions.
//!
//! A [`Client`] is one remote peer, keyed by `(id, tcp port)`. It
//! interleaves four concerns over a single TCP connection plus sideband
//! UDP: we want a file from them ([`SourceInfo`]), they wait in our upload
//! queue ([`QueueInfo`]), we actively send ([`UploadInfo`]) or receive
//! ([`DownloadInfo`]) data. A session with none of these and no pending
//! reask destroys itself.
//!
//! Handlers never touch other sessions or the server list directly:
//! cross-object effects are emitted as [`Action`]s and applied by the
//! owner. Any protocol violation marks the session dead; the registry
//! reaps it after the dispatch returns.

use std::net::SocketAddrV4;

use partdata::{LockedRange, UsedRange, ED2K_PARTSIZE};
use rangelist::Range;
use tracing::{debug, trace, warn};
use wire::{zlib_pack, zlib_unpack, FrameReader, Hash16};

use crate::engine::{ClientTimer, Ctx, TimerEvent};
use crate::opcodes::*;
use crate::packets::*;
use crate::{id_to_ip, is_low_id};

/// Stable registry key for a session; timers and actions carry these, and
/// stale keys are dropped by a liveness check.
pub type ClientKey = u64;

/// Reask interval: queue etiquette says once per 30 minutes.
pub const SOURCE_REASKTIME: u64 = 30 * 60 * 1000;
/// How long to wait for a UDP reask answer.
pub const UDP_TIMEOUT: u64 = 30_000;
/// Idle socket timeout outside transfers.
pub const SOCKET_TIMEOUT: u64 = 10_000;
/// Timeout while a transfer is running; mules stall often and slots are
/// expensive to regain.
pub const TRANSFER_TIMEOUT: u64 = 120_000;
/// How long to wait for a low-id peer to call back.
pub const CALLBACK_TIMEOUT: u64 = 60_000;
/// TCP connect timeout.
pub const CONNECT_TIMEOUT: u64 = 5_000;
/// Data block size on the wire.
pub const BLOCK_SIZE: usize = 10_240;
/// Transfer request granularity (one "chunk").
pub const CHUNK_REQ_SIZE: u64 = 184_320;

/// Cross-object effects emitted by session handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Ask the connected server to relay a callback to this low id.
    ReqCallback(u32),
    /// A source exchange mentioned a server.
    FoundServer(SocketAddrV4),
    /// A new source for a download was discovered.
    FoundSource {
        hash: Hash16,
        addr: SocketAddrV4,
        server: Option<SocketAddrV4>,
    },
    /// This session wants an upload slot.
    QueueUpload(ClientKey),
    /// This session no longer needs its slot/queue spot.
    CancelUpload(ClientKey),
    /// The peer's id changed; the registry must re-key and maybe merge.
    IdChanged { key: ClientKey, new_id: u32 },
    /// Chat text from the peer.
    ChatMessage { key: ClientKey, text: String },
}

#[derive(Clone, Copy, Debug, Default)]
struct SessionState {
    sent_hello: bool,
    got_hello: bool,
    sent_req: bool,
}

/// The peer offers files we download.
#[derive(Debug)]
pub struct SourceInfo {
    offered: Vec<u64>,
    req: u64,
    part_map: Option<Vec<bool>>,
    qr: u32,
}

impl SourceInfo {
    fn new(download: u64) -> Self {
        Self {
            offered: vec![download],
            req: download,
            part_map: None,
            qr: 0,
        }
    }

    /// Download currently requested from this peer.
    #[must_use]
    pub const fn requested(&self) -> u64 {
        self.req
    }

    /// Our queue rank on the remote side.
    #[must_use]
    pub const fn queue_rank(&self) -> u32 {
        self.qr
    }

    fn offers(&self, download: u64) -> bool {
        self.offered.contains(&download)
    }

    fn add_offered(&mut self, download: u64) {
        if !self.offers(download) {
            self.offered.push(download);
        }
    }

    fn rem_offered(&mut self, download: u64) {
        self.offered.retain(|d| *d != download);
        if self.req == download {
            if let Some(first) = self.offered.first() {
                self.req = *first;
            }
        }
    }

    /// Picks the offered download with the fewest sources as the request
    /// target.
    fn swap_to_lowest(&mut self, ctx: &Ctx<'_>) {
        let mut best = None;
        for &id in &self.offered {
            if let Some(d) = ctx.downloads.get(id) {
                let cnt = d.part.source_count();
                if best.map_or(true, |(c, _)| cnt < c) {
                    best = Some((cnt, id));
                }
            }
        }
        if let Some((_, id)) = best {
            self.req = id;
        }
    }
}

/// The peer waits in our upload queue.
#[derive(Clone, Debug)]
pub struct QueueInfo {
    req_hash: Hash16,
    qr: u32,
    enqueued_at: u64,
    /// Tick of the peer's last queue reask; stale entries get dropped.
    pub last_queue_reask: u64,
}

impl QueueInfo {
    /// Queue rank we last assigned.
    #[must_use]
    pub const fn queue_rank(&self) -> u32 {
        self.qr
    }

    /// Tick the peer entered the queue.
    #[must_use]
    pub const fn enqueued_at(&self) -> u64 {
        self.enqueued_at
    }
}

enum SendStream {
    Plain {
        range: Range,
        at: u64,
    },
    Packed {
        begin: u32,
        data: Vec<u8>,
        at: usize,
    },
}

/// We actively send data to the peer.
pub struct UploadInfo {
    req_hash: Hash16,
    req_chunks: std::collections::VecDeque<Range>,
    current: Option<SendStream>,
    sent: u64,
}

impl UploadInfo {
    fn new(req_hash: Hash16) -> Self {
        Self {
            req_hash,
            req_chunks: std::collections::VecDeque::new(),
            current: None,
            sent: 0,
        }
    }

    /// Bytes sent within this upload.
    #[must_use]
    pub const fn sent(&self) -> u64 {
        self.sent
    }
}

struct ActiveChunk {
    lock: LockedRange,
    next: u64,
}

/// Reassembly state for a compressed chunk: fragments accumulate until
/// `total` bytes arrived, then the stream inflates as one write sequence.
struct PackedStream {
    begin: u64,
    total: usize,
    accumulated: Vec<u8>,
}

/// We actively receive data from the peer.
pub struct DownloadInfo {
    download: u64,
    used: Option<UsedRange>,
    active: Vec<ActiveChunk>,
    packed: Option<PackedStream>,
}

impl DownloadInfo {
    fn new(download: u64) -> Self {
        Self {
            download,
            used: None,
            active: Vec::new(),
            packed: None,
        }
    }

    /// Download this transfer feeds.
    #[must_use]
    pub const fn target(&self) -> u64 {
        self.download
    }

    /// Tops up the active chunk set to three locked ranges.
    fn fill(&mut self, ctx: &mut Ctx<'_>, mask: Option<&[bool]>) {
        let Some(dl) = ctx.downloads.get_mut(self.download) else {
            return;
        };
        while self.active.len() < 3 {
            if self.used.is_none() {
                self.used = dl.part.get_range(ED2K_PARTSIZE, mask);
            }
            let Some(used) = &self.used else { break };
            match dl.part.get_lock(used, CHUNK_REQ_SIZE) {
                Some(lock) => {
                    let next = lock.range().begin();
                    self.active.push(ActiveChunk { lock, next });
                }
                None => {
                    // range exhausted, move on to the next one
                    let used = self.used.take().expect("checked above");
                    dl.part.release_range(&used);
                }
            }
        }
    }

    /// Outstanding wire requests, oldest first.
    fn chunk_requests(&self) -> Vec<Range> {
        self.active
            .iter()
            .filter(|c| c.next <= c.lock.range().end())
            .map(|c| Range::new(c.next, c.lock.range().end()))
            .collect()
    }

    /// Writes arriving data into the matching locks; bytes outside every
    /// held lock (a peer streaming a whole compressed part, say) go
    /// through the unlocked write path. Returns true when a whole
    /// requested chunk finished, so new requests should go out.
    fn write(&mut self, ctx: &mut Ctx<'_>, begin: u64, data: &[u8]) -> bool {
        let Some(dl) = ctx.downloads.get_mut(self.download) else {
            return false;
        };
        let mut finished = false;
        let end = begin + data.len() as u64 - 1;
        let mut written: Vec<Range> = Vec::new();
        let mut idx = 0;
        while idx < self.active.len() {
            let chunk = &mut self.active[idx];
            let lr = chunk.lock.range();
            if begin > lr.end() || end < chunk.next {
                idx += 1;
                continue;
            }
            // clip to the lock and skip what we already have
            let from = chunk.next.max(begin).max(lr.begin());
            let to = end.min(lr.end());
            if from > to {
                idx += 1;
                continue;
            }
            let off = (from - begin) as usize;
            let len = (to - from + 1) as usize;
            match dl
                .part
                .write_locked(&chunk.lock, from, &data[off..off + len])
            {
                Ok(_) => {
                    written.push(Range::new(from, to));
                    chunk.next = to + 1;
                    if chunk.next > lr.end() {
                        let done = self.active.remove(idx);
                        dl.part.unlock(&done.lock);
                        finished = true;
                        continue;
                    }
                }
                Err(e) => {
                    debug!(target: "ed2k::client", error = %e, "write into lock failed");
                    let done = self.active.remove(idx);
                    dl.part.unlock(&done.lock);
                    continue;
                }
            }
            idx += 1;
        }

        // remainder outside every lock: the simple-protocol write path
        written.sort_by_key(Range::begin);
        let mut at = begin;
        for w in &written {
            if at < w.begin() {
                let off = (at - begin) as usize;
                let len = (w.begin() - at) as usize;
                let _ = dl.part.write(at, &data[off..off + len]);
            }
            at = at.max(w.end().saturating_add(1));
        }
        if at <= end {
            let off = (at - begin) as usize;
            let _ = dl.part.write(at, &data[off..]);
        }
        finished
    }

    /// Feeds one compressed fragment; inflates and writes once complete.
    fn write_packed(
        &mut self,
        ctx: &mut Ctx<'_>,
        begin: u64,
        total: usize,
        fragment: &[u8],
    ) -> Result<bool, ()> {
        let stream = self.packed.get_or_insert_with(|| PackedStream {
            begin,
            total,
            accumulated: Vec::with_capacity(total),
        });
        if stream.begin != begin || stream.total != total {
            // the peer restarted mid-stream; start over at the new offset
            *stream = PackedStream {
                begin,
                total,
                accumulated: Vec::with_capacity(total),
            };
        }
        stream.accumulated.extend_from_slice(fragment);
        if stream.accumulated.len() < stream.total {
            return Ok(false);
        }
        let stream = self.packed.take().expect("just inserted");
        if stream.accumulated.len() > stream.total {
            return Err(()); // over-long stream is a protocol violation
        }
        let plain = zlib_unpack(&stream.accumulated).map_err(|_| ())?;
        let mut finished = false;
        let mut at = stream.begin;
        for piece in plain.chunks(BLOCK_SIZE) {
            finished |= self.write(ctx, at, piece);
            at += piece.len() as u64;
        }
        Ok(finished)
    }

    /// Releases every lock and range reference.
    fn cleanup(&mut self, ctx: &mut Ctx<'_>) {
        let Some(dl) = ctx.downloads.get_mut(self.download) else {
            return;
        };
        for chunk in self.active.drain(..) {
            dl.part.unlock(&chunk.lock);
        }
        if let Some(used) = self.used.take() {
            dl.part.release_range(&used);
        }
    }
}

/// One peer session.
pub struct Client {
    key: ClientKey,
    id: u32,
    tcp_port: u16,
    udp_port: u16,
    hash: Option<Hash16>,
    nick: String,
    client_soft: u32,
    features: Features,
    server: Option<(u32, u16)>,

    socket: Option<sched::SocketId>,
    frames: FrameReader,
    connected: bool,
    session: Option<SessionState>,

    source: Option<SourceInfo>,
    queue: Option<QueueInfo>,
    upload: Option<UploadInfo>,
    download: Option<DownloadInfo>,

    pub_key: Option<Vec<u8>>,
    sent_challenge: u32,
    req_challenge: u32,

    callback_in_progress: bool,
    reask_in_progress: bool,
    failed_udp_reasks: u32,
    last_reask_time: u64,
    last_reask_id: u32,
    dn_req_in_progress: bool,

    session_up: u64,
    session_down: u64,

    actions: Vec<Action>,
    dead: bool,
}

impl Client {
    /// Creates a session for a known endpoint, without connecting yet.
    #[must_use]
    pub fn new_outgoing(key: ClientKey, id: u32, tcp_port: u16) -> Self {
        Self::bare(key, id, tcp_port)
    }

    /// Creates a session for an accepted incoming connection.
    #[must_use]
    pub fn new_incoming(key: ClientKey, socket: sched::SocketId, peer: SocketAddrV4) -> Self {
        let mut c = Self::bare(key, crate::ip_to_id(*peer.ip()), peer.port());
        c.socket = Some(socket);
        c.connected = true;
        c.session = Some(SessionState::default());
        c
    }

    fn bare(key: ClientKey, id: u32, tcp_port: u16) -> Self {
        Self {
            key,
            id,
            tcp_port,
            udp_port: 0,
            hash: None,
            nick: String::new(),
            client_soft: 0,
            features: Features::default(),
            server: None,
            socket: None,
            frames: FrameReader::new(),
            connected: false,
            session: None,
            source: None,
            queue: None,
            upload: None,
            download: None,
            pub_key: None,
            sent_challenge: 0,
            req_challenge: 0,
            callback_in_progress: false,
            reask_in_progress: false,
            failed_udp_reasks: 0,
            last_reask_time: 0,
            last_reask_id: 0,
            dn_req_in_progress: false,
            session_up: 0,
            session_down: 0,
            actions: Vec::new(),
            dead: false,
        }
    }

    // ---- accessors -------------------------------------------------------

    /// Registry key.
    #[must_use]
    pub const fn key(&self) -> ClientKey {
        self.key
    }

    /// Current ed2k id.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// The peer's TCP listen port.
    #[must_use]
    pub const fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// The peer's UDP port (0 = unknown).
    #[must_use]
    pub const fn udp_port(&self) -> u16 {
        self.udp_port
    }

    /// The peer's user hash, once the handshake revealed it.
    #[must_use]
    pub const fn user_hash(&self) -> Option<Hash16> {
        self.hash
    }

    /// Returns true when the peer cannot accept connections.
    #[must_use]
    pub const fn is_low_id(&self) -> bool {
        is_low_id(self.id)
    }

    /// Scheduler socket, when a connection exists.
    #[must_use]
    pub const fn socket(&self) -> Option<sched::SocketId> {
        self.socket
    }

    /// Returns true when the TCP session is up.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Returns true once the session destroyed itself; the registry reaps
    /// these after dispatch.
    #[must_use]
    pub const fn is_dead(&self) -> bool {
        self.dead
    }

    /// Source-side state, when the peer offers files we want.
    #[must_use]
    pub const fn source_info(&self) -> Option<&SourceInfo> {
        self.source.as_ref()
    }

    /// Queue-side state, when the peer waits for our upload.
    #[must_use]
    pub const fn queue_info(&self) -> Option<&QueueInfo> {
        self.queue.as_ref()
    }

    /// Active upload state.
    #[must_use]
    pub const fn upload_info(&self) -> Option<&UploadInfo> {
        self.upload.as_ref()
    }

    /// Active download state.
    #[must_use]
    pub const fn download_info(&self) -> Option<&DownloadInfo> {
        self.download.as_ref()
    }

    /// Negotiated feature versions.
    #[must_use]
    pub const fn features(&self) -> Features {
        self.features
    }

    /// Drains the actions emitted by the last dispatch.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    fn emit(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// The peer's TCP endpoint, when it is directly reachable.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        if self.is_low_id() {
            None
        } else {
            Some(SocketAddrV4::new(id_to_ip(self.id), self.tcp_port))
        }
    }

    fn is_mule(&self) -> bool {
        (self.client_soft >> 24) as u8 == CS_EMULE
            && self
                .hash
                .map_or(false, |h| h[5] == 14 && h[14] == 111)
    }

    fn ver_minor(&self) -> u32 {
        (self.client_soft >> 10) & 0x7f
    }

    // ---- lifecycle -------------------------------------------------------

    /// Marks the session dead and releases everything it holds.
    pub fn destroy(&mut self, ctx: &mut Ctx<'_>) {
        if self.dead {
            return;
        }
        trace!(target: "ed2k::client", key = self.key, id = self.id, "destroying session");
        self.dead = true;
        if self.queue.is_some() || self.upload.is_some() {
            self.emit(Action::CancelUpload(self.key));
        }
        if let Some(mut dl) = self.download.take() {
            dl.cleanup(ctx);
        }
        self.upload = None;
        self.queue = None;
        self.source = None;
        if let Some(sock) = self.socket.take() {
            ctx.sched.del_socket(sock);
        }
        self.connected = false;
    }

    fn check_destroy(&mut self, ctx: &mut Ctx<'_>) {
        if self.source.is_none()
            && self.queue.is_none()
            && self.upload.is_none()
            && self.download.is_none()
        {
            self.destroy(ctx);
        }
    }

    fn send(&mut self, ctx: &mut Ctx<'_>, frame: Vec<u8>) {
        if let Some(sock) = self.socket {
            if ctx.sched.write(sock, &frame).is_err() {
                self.destroy(ctx);
            }
        }
    }

    // ---- connection management ------------------------------------------

    /// Attempts to reach the peer: direct TCP for high ids, server-relayed
    /// callback for low ids on our server.
    pub fn establish_connection(&mut self, ctx: &mut Ctx<'_>) {
        if self.socket.is_some() {
            return; // races with reconnects are common; ignore silently
        }
        if self.is_low_id() && ctx.identity.is_low_id() {
            trace!(target: "ed2k::deadsource", key = self.key, "low-id to low-id, dropping");
            self.destroy(ctx);
        } else if !self.is_low_id() {
            let addr = SocketAddrV4::new(id_to_ip(self.id), self.tcp_port);
            trace!(target: "ed2k::client", key = self.key, %addr, "connecting");
            let sock = ctx.sched.add_stream_pending(None);
            self.socket = Some(sock);
            self.session = Some(SessionState::default());
            if ctx.sched.connect(sock, addr, CONNECT_TIMEOUT).is_err() {
                self.destroy(ctx);
            }
        } else {
            // low-id peer: only reachable through its server's callback
            let on_our_server = match (self.server, ctx.current_server) {
                (Some((ip, port)), Some(cur)) => {
                    ip == crate::ip_to_id(*cur.ip()) && port == cur.port()
                }
                (None, Some(_)) => true,
                _ => false,
            };
            if !on_our_server {
                trace!(
                    target: "ed2k::deadsource",
                    key = self.key,
                    "low-id peer on another server, dropping"
                );
                self.destroy(ctx);
                return;
            }
            trace!(target: "ed2k::client", key = self.key, id = self.id, "requesting callback");
            self.emit(Action::ReqCallback(self.id));
            self.callback_in_progress = true;
            ctx.timers.schedule_in(
                ctx.now,
                CALLBACK_TIMEOUT,
                TimerEvent::Client(self.key, ClientTimer::CallbackTimeout),
            );
        }
    }

    /// Adopts an accepted/callback socket into this session.
    pub fn attach_socket(&mut self, ctx: &mut Ctx<'_>, socket: sched::SocketId) {
        if let Some(old) = self.socket.replace(socket) {
            ctx.sched.del_socket(old);
        }
        self.frames = FrameReader::new();
        self.connected = true;
        self.session = Some(SessionState::default());
        self.callback_in_progress = false;
    }

    /// Adds an offered download; optionally starts connecting right away.
    pub fn add_offered(&mut self, ctx: &mut Ctx<'_>, download: u64, connect: bool) {
        match &mut self.source {
            None => {
                trace!(target: "ed2k::client", key = self.key, download, "new source info");
                self.source = Some(SourceInfo::new(download));
                if self.connected && self.download.is_none() {
                    self.req_download(ctx);
                } else if self.socket.is_none() && connect {
                    self.establish_connection(ctx);
                }
            }
            Some(info) => info.add_offered(download),
        }
    }

    /// Removes an offered download; destroys the session when nothing is
    /// left.
    pub fn rem_offered(&mut self, ctx: &mut Ctx<'_>, download: u64) {
        if let Some(info) = &mut self.source {
            info.rem_offered(download);
            if info.offered.is_empty() {
                self.source = None;
                self.last_reask_time = 0;
            }
        }
        if let Some(dl) = &mut self.download {
            if dl.download == download {
                let mut dl = self.download.take().expect("just matched");
                dl.cleanup(ctx);
            }
        }
        self.check_destroy(ctx);
    }

    /// Folds another session for the same peer into this one, keeping the
    /// most recent non-null of each substate.
    pub fn merge(&mut self, mut other: Client) {
        if self.socket.is_none() && other.socket.is_some() {
            self.socket = other.socket.take();
            self.frames = std::mem::take(&mut other.frames);
            self.connected = other.connected;
            self.session = other.session;
        }
        if self.queue.is_none() {
            self.queue = other.queue.take();
        }
        if self.source.is_none() {
            self.source = other.source.take();
        }
        if self.upload.is_none() {
            self.upload = other.upload.take();
        }
        if self.download.is_none() {
            self.download = other.download.take();
        }
        if self.hash.is_none() {
            self.hash = other.hash;
        }
        if self.udp_port == 0 {
            self.udp_port = other.udp_port;
        }
        if self.pub_key.is_none() {
            self.pub_key = other.pub_key.take();
        }
        if self.server.is_none() {
            self.server = other.server;
        }
        if self.nick.is_empty() {
            self.nick = std::mem::take(&mut other.nick);
        }
        if self.client_soft == 0 {
            self.client_soft = other.client_soft;
            self.features = other.features;
        }
        if self.last_reask_time == 0 {
            self.last_reask_time = other.last_reask_time;
        }
        if self.sent_challenge == 0 {
            self.sent_challenge = other.sent_challenge;
        }
        if self.req_challenge == 0 {
            self.req_challenge = other.req_challenge;
        }
        self.callback_in_progress = false;
    }

    // ---- socket events ---------------------------------------------------

    /// Dispatches one scheduler event for this session's socket.
    pub fn on_sock_event(&mut self, ctx: &mut Ctx<'_>, evt: sched::SockEvent) {
        use sched::SockEvent as E;

        if let Some(sock) = self.socket {
            let timeout = if self.upload.is_some() || self.download.is_some() {
                TRANSFER_TIMEOUT
            } else {
                SOCKET_TIMEOUT
            };
            let _ = ctx.sched.set_timeout(sock, timeout);
        }

        match evt {
            E::Read => self.on_readable(ctx),
            E::Write => {
                if self.upload.is_some() && self.connected {
                    self.send_next_chunk(ctx);
                }
            }
            E::Connected => {
                trace!(target: "ed2k::client", key = self.key, "connected, sending hello");
                self.connected = true;
                self.failed_udp_reasks = 0;
                self.dn_req_in_progress = self.source.is_some();
                self.session = Some(SessionState {
                    sent_hello: true,
                    ..SessionState::default()
                });
                let hello = Hello::ours(ctx.identity, self.server_for_hello(ctx));
                self.send(ctx, hello.to_hello_frame());
            }
            E::ConnFailed | E::Blocked => {
                trace!(target: "ed2k::deadsource", key = self.key, "unable to connect");
                self.destroy(ctx);
            }
            E::Timeout | E::Lost | E::Err => {
                trace!(target: "ed2k::client", key = self.key, ?evt, "connection lost");
                self.on_lost_connection(ctx);
            }
            E::Accept => {} // listeners are handled by the registry
        }
    }

    fn server_for_hello(&self, ctx: &Ctx<'_>) -> Option<(u32, u16)> {
        ctx.current_server
            .map(|s| (crate::ip_to_id(*s.ip()), s.port()))
    }

    fn on_readable(&mut self, ctx: &mut Ctx<'_>) {
        let Some(sock) = self.socket else { return };
        let Ok(data) = ctx.sched.read(sock) else {
            return;
        };
        self.frames.feed(&data);
        loop {
            match self.frames.next_frame() {
                Ok(Some(frame)) => {
                    let swap = self.features.src_exch_ver >= 3;
                    match ClientMessage::decode(&frame, swap) {
                        Ok(msg) => self.handle_message(ctx, msg),
                        Err(e) => {
                            debug!(
                                target: "ed2k::deadsource",
                                key = self.key,
                                error = %e,
                                "bad packet, destroying session"
                            );
                            self.destroy(ctx);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(
                        target: "ed2k::deadsource",
                        key = self.key,
                        error = %e,
                        "stream framing error, destroying session"
                    );
                    self.destroy(ctx);
                }
            }
            if self.dead {
                return;
            }
        }
    }

    /// The §4.I failure ladder: decides between destroy, queue-reinsert
    /// and scheduled reask when the TCP connection goes away.
    fn on_lost_connection(&mut self, ctx: &mut Ctx<'_>) {
        if let Some(sock) = self.socket.take() {
            self.session_up += ctx.sched.uploaded(sock);
            self.session_down += ctx.sched.downloaded(sock);
            ctx.sched.del_socket(sock);
        }
        self.connected = false;
        self.frames = FrameReader::new();
        self.sent_challenge = 0;
        self.req_challenge = 0;

        if self.queue.is_none() && self.source.is_some() && self.last_reask_time == 0 {
            trace!(target: "ed2k::deadsource", key = self.key, "source but never connected");
            self.destroy(ctx);
        } else if self.source.is_none() && self.queue.is_none() {
            trace!(target: "ed2k::deadsource", key = self.key, "no substate after disconnect");
            self.destroy(ctx);
        } else if self.failed_udp_reasks > 2 {
            trace!(target: "ed2k::deadsource", key = self.key, "reask budget exhausted");
            self.destroy(ctx);
        } else if self.download.is_some() || (self.source.is_some() && self.dn_req_in_progress) {
            // transfer interrupted (or request unanswered): keep the
            // source and reask on schedule
            ctx.timers.schedule_in(
                ctx.now,
                SOURCE_REASKTIME,
                TimerEvent::Client(self.key, ClientTimer::Reask),
            );
            self.last_reask_time = ctx.now;
        } else if self.upload.is_some() {
            // the peer lost its slot, not its place in line
            let upload = self.upload.take().expect("just checked");
            if self.queue.is_none() {
                self.queue = Some(QueueInfo {
                    req_hash: upload.req_hash,
                    qr: 0,
                    enqueued_at: ctx.now,
                    last_queue_reask: ctx.now,
                });
            }
            self.emit(Action::QueueUpload(self.key));
        } else if self
            .session
            .map_or(false, |s| !s.sent_req)
            && self.source.is_some()
            && self.queue.is_none()
        {
            trace!(
                target: "ed2k::deadsource",
                key = self.key,
                "file request could not be sent this session"
            );
            self.destroy(ctx);
        } else if self.session.map_or(false, |s| !s.got_hello) {
            trace!(target: "ed2k::deadsource", key = self.key, "handshake never completed");
            self.destroy(ctx);
        }

        self.dn_req_in_progress = false;
        if let Some(mut dl) = self.download.take() {
            dl.cleanup(ctx);
        }
        self.upload = None;
        self.session = None;
    }

    /// Closes the TCP side without ending the session.
    pub fn disconnect(&mut self, ctx: &mut Ctx<'_>) {
        if let Some(sock) = self.socket {
            let _ = ctx.sched.disconnect(sock);
        }
        self.on_lost_connection(ctx);
    }

    // ---- timers ----------------------------------------------------------

    /// Handles a fired session timer.
    pub fn on_timer(&mut self, ctx: &mut Ctx<'_>, timer: ClientTimer) {
        match timer {
            ClientTimer::Reask => self.reask_for_download(ctx),
            ClientTimer::CallbackTimeout => {
                if self.callback_in_progress && !self.connected {
                    trace!(target: "ed2k::deadsource", key = self.key, "callback timed out");
                    self.destroy(ctx);
                }
            }
            ClientTimer::UdpTimeout => {
                if self.reask_in_progress {
                    self.reask_in_progress = false;
                    self.failed_udp_reasks += 1;
                    if self.failed_udp_reasks > 2 {
                        debug!(
                            target: "ed2k::client",
                            key = self.key,
                            "udp reasks failed, falling back to tcp"
                        );
                        self.establish_connection(ctx);
                    } else {
                        self.reask_for_download(ctx);
                    }
                }
            }
            ClientTimer::Reconnect => {
                if !self.connected && self.source.is_some() {
                    self.establish_connection(ctx);
                }
            }
        }
    }

    // ---- handshake -------------------------------------------------------

    fn store_info(&mut self, hello: &Hello) {
        self.tcp_port = hello.tcp_port;
        self.udp_port = hello.udp_port;
        self.features = hello.feature_set();
        self.hash = Some(hello.hash);
        self.server = hello.server.filter(|&(ip, _)| ip != 0);
        self.nick = hello.nick.clone();
        if (self.client_soft >> 24) as u8 != CS_MLDONKEY_NEW2 {
            // new mldonkeys send muleinfo first, then an emule-looking
            // hello; keep what muleinfo detected
            self.client_soft = hello.mule_ver;
        }
        if self.client_soft == 0 {
            self.client_soft = hello.version << 24;
        }
        trace!(
            target: "ed2k::client",
            key = self.key,
            nick = %self.nick,
            udp = self.udp_port,
            "handshake info stored"
        );
        if hello.client_id != self.id {
            self.emit(Action::IdChanged {
                key: self.key,
                new_id: hello.client_id,
            });
        }
    }

    fn handshake_completed(&mut self, ctx: &mut Ctx<'_>) {
        if self.features.sec_ident_ver > 0 && self.sent_challenge == 0 {
            self.verify_ident(ctx);
        } else {
            self.init_transfer(ctx);
        }
    }

    fn init_transfer(&mut self, ctx: &mut Ctx<'_>) {
        if self.upload.is_some() {
            self.queue = None;
            self.start_upload(ctx);
        }
        if self.source.is_some() && self.download.is_none() {
            self.req_download(ctx);
        }
    }

    // ---- packet dispatch -------------------------------------------------

    /// Handles one decoded packet. Called from the socket read path and
    /// from tests driving the session directly.
    pub fn handle_message(&mut self, ctx: &mut Ctx<'_>, msg: ClientMessage) {
        match msg {
            ClientMessage::Hello(h) => self.on_hello(ctx, &h),
            ClientMessage::HelloAnswer(h) => self.on_hello_answer(ctx, &h),
            ClientMessage::MuleInfo(i) => {
                self.process_mule_info(ctx, &i);
                let answer = MuleInfo::ours(ctx.identity).to_answer_frame();
                self.send(ctx, answer);
            }
            ClientMessage::MuleInfoAnswer(i) => self.process_mule_info(ctx, &i),
            ClientMessage::ReqFile(req) => self.on_req_file(ctx, &req),
            ClientMessage::SetReqFileId(hash) => self.on_set_req_file_id(ctx, hash),
            ClientMessage::StartUploadReq(hash) => self.on_upload_req(ctx, hash),
            ClientMessage::ReqHashSet(hash) => self.on_req_hash_set(ctx, hash),
            ClientMessage::ReqChunks(req) => self.on_req_chunks(ctx, req),
            ClientMessage::CancelTransfer => self.on_cancel_transfer(ctx),
            ClientMessage::FileName(p) => self.on_file_name(ctx, &p),
            ClientMessage::FileDesc(p) => {
                debug!(target: "ed2k::client", key = self.key, rating = p.rating, "file comment");
            }
            ClientMessage::FileStatus(p) => self.on_file_status(ctx, p),
            ClientMessage::NoFile(hash) => self.on_no_file(ctx, hash),
            ClientMessage::HashSet(p) => self.on_hash_set(ctx, &p),
            ClientMessage::AcceptUploadReq => self.on_accept_upload(ctx),
            ClientMessage::QueueRanking(qr) => self.set_on_queue(ctx, qr),
            ClientMessage::MuleQueueRank(qr) => self.set_on_queue(ctx, u32::from(qr)),
            ClientMessage::DataChunk(p) => self.on_data_chunk(ctx, &p),
            ClientMessage::PackedChunk(p) => self.on_packed_chunk(ctx, &p),
            ClientMessage::SourceExchReq(hash) => self.on_source_exch_req(ctx, hash),
            ClientMessage::AnswerSources(p) => self.on_answer_sources(&p),
            ClientMessage::Message(text) => {
                self.emit(Action::ChatMessage {
                    key: self.key,
                    text,
                });
            }
            ClientMessage::ChangeId { old, new } => {
                trace!(target: "ed2k::client", key = self.key, old, new, "peer changed id");
                self.emit(Action::IdChanged {
                    key: self.key,
                    new_id: new,
                });
            }
            ClientMessage::SecIdentState(p) => self.on_sec_ident_state(ctx, p),
            ClientMessage::PublicKey(key) => self.on_public_key(ctx, key),
            ClientMessage::Signature(p) => self.on_signature(ctx, &p),
            ClientMessage::PortTest => {}
        }
    }

    fn on_hello(&mut self, ctx: &mut Ctx<'_>, hello: &Hello) {
        let answer = Hello::ours(ctx.identity, self.server_for_hello(ctx)).to_answer_frame();
        self.send(ctx, answer);
        self.store_info(hello);
        if self.is_mule() && self.ver_minor() < 43 {
            trace!(target: "ed2k::client", key = self.key, "old mule, sending mule info");
            let info = MuleInfo::ours(ctx.identity).to_info_frame();
            self.send(ctx, info);
        }
        if let Some(s) = &mut self.session {
            s.got_hello = true;
            s.sent_hello = true;
        } else {
            self.session = Some(SessionState {
                sent_hello: true,
                got_hello: true,
                sent_req: false,
            });
        }
        self.handshake_completed(ctx);
    }

    fn on_hello_answer(&mut self, ctx: &mut Ctx<'_>, hello: &Hello) {
        self.store_info(hello);
        if let Some(s) = &mut self.session {
            s.got_hello = true;
        }
        self.handshake_completed(ctx);
    }

    fn process_mule_info(&mut self, ctx: &mut Ctx<'_>, info: &MuleInfo) {
        self.client_soft |= u32::from(info.compat_client) << 24;
        self.client_soft |= (u32::from(info.version) + 8) << 10;
        if self.features.udp_ver == 0 {
            self.features.udp_ver = info.udp_ver;
        }
        if self.features.src_exch_ver == 0 {
            self.features.src_exch_ver = info.src_exch_ver;
        }
        if self.udp_port == 0 {
            self.udp_port = info.udp_port;
        }
        if self.is_mule() && self.ver_minor() < 42 {
            self.handshake_completed(ctx);
        }
    }

    // ---- serving uploads -------------------------------------------------

    fn on_req_file(&mut self, ctx: &mut Ctx<'_>, req: &ReqFile) {
        if !self.connected {
            self.destroy(ctx);
            return;
        }
        match ctx.shared.find(&req.hash) {
            Some(sf) => {
                let frame = FileName {
                    hash: req.hash,
                    name: sf.name.clone(),
                }
                .to_frame();
                let partial_download = sf.download;
                self.send(ctx, frame);
                // serving a partial file: the asker has (some of) it too,
                // so passively pick them up as a source
                if let Some(download) = partial_download {
                    if self.source.is_none() {
                        trace!(
                            target: "ed2k::client",
                            key = self.key,
                            "passively adding source for partial file"
                        );
                        self.add_offered(ctx, download, false);
                        if !req.part_map.is_empty() {
                            let _ = ctx
                                .downloads
                                .get_mut(download)
                                .map(|d| d.part.add_source_mask(ED2K_PARTSIZE, &req.part_map));
                        }
                    }
                }
            }
            None => {
                trace!(target: "ed2k::client", key = self.key, "nofile for unknown hash");
                let frame = {
                    let mut w = wire::Writer::new();
                    w.hash(&req.hash);
                    wire::encode_frame(wire::Proto::Ed2k, OP_REQFILE_NOFILE, w.as_bytes())
                };
                self.send(ctx, frame);
            }
        }
    }

    fn file_status_for(&self, ctx: &Ctx<'_>, hash: &Hash16) -> Option<Vec<u8>> {
        let sf = ctx.shared.find(hash)?;
        let part_map = sf
            .download
            .and_then(|id| ctx.downloads.get(id))
            .map(|d| d.part.part_map(ED2K_PARTSIZE))
            .unwrap_or_default();
        Some(
            FileStatus {
                hash: *hash,
                part_map,
            }
            .to_frame(),
        )
    }

    fn on_set_req_file_id(&mut self, ctx: &mut Ctx<'_>, hash: Hash16) {
        if !self.connected {
            self.destroy(ctx);
            return;
        }
        let Some(status) = self.file_status_for(ctx, &hash) else {
            let mut w = wire::Writer::new();
            w.hash(&hash);
            let frame = wire::encode_frame(wire::Proto::Ed2k, OP_REQFILE_NOFILE, w.as_bytes());
            self.send(ctx, frame);
            return;
        };
        self.send(ctx, status);
        if let Some(upload) = &mut self.upload {
            if upload.current.is_some() || !upload.req_chunks.is_empty() {
                debug!(target: "ed2k::client", key = self.key, "SetReqFileId after ReqChunks");
                return;
            }
            upload.req_hash = hash;
        } else if let Some(queue) = &mut self.queue {
            queue.req_hash = hash;
        } else {
            self.queue = Some(QueueInfo {
                req_hash: hash,
                qr: 0,
                enqueued_at: ctx.now,
                last_queue_reask: ctx.now,
            });
            self.emit(Action::QueueUpload(self.key));
        }
    }

    fn on_upload_req(&mut self, ctx: &mut Ctx<'_>, hash: Option<Hash16>) {
        let hash = match hash
            .or_else(|| self.upload.as_ref().map(|u| u.req_hash))
            .or_else(|| self.queue.as_ref().map(|q| q.req_hash))
        {
            Some(h) => h,
            None => return, // not enough context to serve this
        };
        if ctx.shared.find(&hash).is_none() {
            return;
        }
        if self.upload.is_some() {
            // already uploading; just refresh the target
            if let Some(u) = &mut self.upload {
                u.req_hash = hash;
            }
            self.start_upload(ctx);
        } else if let Some(queue) = &mut self.queue {
            queue.req_hash = hash;
            queue.last_queue_reask = ctx.now;
            self.emit(Action::QueueUpload(self.key));
        } else {
            self.queue = Some(QueueInfo {
                req_hash: hash,
                qr: 0,
                enqueued_at: ctx.now,
                last_queue_reask: ctx.now,
            });
            self.emit(Action::QueueUpload(self.key));
        }
    }

    fn on_req_hash_set(&mut self, ctx: &mut Ctx<'_>, hash: Hash16) {
        let Some(hs) = ctx
            .shared
            .find(&hash)
            .and_then(|sf| sf.hash_set.clone())
        else {
            return; // ignored, same as not sharing it
        };
        let frame = HashSetPacket {
            file_hash: hash,
            chunk_hashes: hs.chunk_hashes,
        }
        .to_frame();
        self.send(ctx, frame);
    }

    /// Promotes this session to an upload slot. Called by the registry's
    /// queue manager.
    pub fn start_upload(&mut self, ctx: &mut Ctx<'_>) {
        if self.upload.is_none() {
            let Some(queue) = self.queue.take() else {
                return;
            };
            self.upload = Some(UploadInfo::new(queue.req_hash));
        }
        self.queue = None;
        if self.connected {
            trace!(target: "ed2k::client", key = self.key, "starting upload");
            self.send(ctx, wire::encode_frame(wire::Proto::Ed2k, OP_ACCEPTUPLOADREQ, &[]));
            let has_reqs = self
                .upload
                .as_ref()
                .map_or(false, |u| !u.req_chunks.is_empty());
            if has_reqs {
                self.send_next_chunk(ctx);
            }
        } else {
            self.establish_connection(ctx);
        }
    }

    /// Sends the queued rank to a waiting peer.
    pub fn send_queue_rank(&mut self, ctx: &mut Ctx<'_>, qr: u32) {
        if let Some(queue) = &mut self.queue {
            queue.qr = qr;
        }
        if !self.connected || self.queue.is_none() || self.upload.is_some() || qr == 0 {
            return;
        }
        trace!(target: "ed2k::client", key = self.key, qr, "sending queue ranking");
        let frame = if self.is_mule() {
            let mut w = wire::Writer::new();
            w.u16(qr as u16).u16(0).u32(0).u32(0);
            wire::encode_frame(wire::Proto::Emule, OP_MULEQUEUERANK, w.as_bytes())
        } else {
            let mut w = wire::Writer::new();
            w.u32(qr);
            wire::encode_frame(wire::Proto::Ed2k, OP_QUEUERANKING, w.as_bytes())
        };
        self.send(ctx, frame);
    }

    fn on_req_chunks(&mut self, ctx: &mut Ctx<'_>, req: ReqChunks) {
        if self.upload.is_none() || !self.connected {
            self.destroy(ctx);
            return;
        }
        if let Some(upload) = &mut self.upload {
            for r in req.ranges {
                upload.req_chunks.push_back(r);
            }
        }
        self.send_next_chunk(ctx);
    }

    /// Streams the next ≤10 KiB block of the current requested chunk,
    /// compressing whole chunks when the peer understands packed frames.
    pub fn send_next_chunk(&mut self, ctx: &mut Ctx<'_>) {
        if self.queue.is_some() || !self.connected {
            return;
        }
        let Some(upload) = &mut self.upload else {
            return;
        };

        if upload.current.is_none() {
            let Some(chunk) = upload.req_chunks.pop_front() else {
                // no more requested chunks
                if upload.sent == 0 {
                    return; // still waiting for the first request
                }
                trace!(target: "ed2k::client", key = self.key, "upload drained");
                self.upload = None;
                self.emit(Action::CancelUpload(self.key));
                self.queue = None;
                if self.download.is_none() {
                    self.disconnect(ctx);
                }
                if self.source.is_none() {
                    self.destroy(ctx);
                }
                return;
            };
            let hash = upload.req_hash;
            let Some(sf) = ctx.shared.find(&hash) else {
                self.upload = None;
                self.emit(Action::CancelUpload(self.key));
                self.check_destroy(ctx);
                return;
            };
            let data = match sf.read_block(chunk.begin(), chunk.length() as usize) {
                Ok(d) => d,
                Err(e) => {
                    debug!(target: "ed2k::client", key = self.key, error = %e, "chunk read failed");
                    let upload = self.upload.take().expect("checked");
                    self.queue = Some(QueueInfo {
                        req_hash: upload.req_hash,
                        qr: 0,
                        enqueued_at: ctx.now,
                        last_queue_reask: ctx.now,
                    });
                    self.emit(Action::QueueUpload(self.key));
                    return;
                }
            };
            let upload = self.upload.as_mut().expect("checked");
            if self.features.compr_ver > 0 {
                let packed = zlib_pack(&data);
                if packed.len() < data.len() {
                    upload.current = Some(SendStream::Packed {
                        begin: chunk.begin() as u32,
                        data: packed,
                        at: 0,
                    });
                } else {
                    upload.current = Some(SendStream::Plain {
                        range: chunk,
                        at: chunk.begin(),
                    });
                }
            } else {
                upload.current = Some(SendStream::Plain {
                    range: chunk,
                    at: chunk.begin(),
                });
            }
        }

        let upload = self.upload.as_mut().expect("ensured above");
        let hash = upload.req_hash;
        let mut sent_now = 0u64;
        let mut frame = None;
        let mut drained = false;
        match upload.current.as_mut().expect("ensured above") {
            SendStream::Plain { range, at } => {
                let len = (BLOCK_SIZE as u64).min(range.end() - *at + 1);
                let sf = ctx.shared.find(&hash);
                if let Some(sf) = sf {
                    if let Ok(data) = sf.read_block(*at, len as usize) {
                        frame = Some(
                            DataChunk {
                                hash,
                                begin: *at as u32,
                                end: (*at + len) as u32,
                                data,
                            }
                            .to_frame(),
                        );
                        sent_now = len;
                        *at += len;
                        drained = *at > range.end();
                    }
                }
            }
            SendStream::Packed { begin, data, at } => {
                let len = BLOCK_SIZE.min(data.len() - *at);
                frame = Some(
                    PackedChunk {
                        hash,
                        begin: *begin,
                        packed_total: data.len() as u32,
                        data: data[*at..*at + len].to_vec(),
                    }
                    .to_frame(),
                );
                sent_now = len as u64;
                *at += len;
                drained = *at >= data.len();
            }
        }
        if drained {
            upload.current = None;
        }

        match frame {
            Some(frame) => {
                upload.sent += sent_now;
                if let Some(pk) = self.pub_key.clone() {
                    ctx.credits.add_uploaded(&pk, sent_now);
                }
                self.send(ctx, frame);
            }
            None => {
                // read failure mid-chunk: requeue the peer
                let upload = self.upload.take().expect("ensured above");
                self.queue = Some(QueueInfo {
                    req_hash: upload.req_hash,
                    qr: 0,
                    enqueued_at: ctx.now,
                    last_queue_reask: ctx.now,
                });
                self.emit(Action::QueueUpload(self.key));
            }
        }
    }

    fn on_cancel_transfer(&mut self, ctx: &mut Ctx<'_>) {
        trace!(target: "ed2k::client", key = self.key, "transfer canceled by peer");
        self.upload = None;
        self.queue = None;
        self.emit(Action::CancelUpload(self.key));
        if self.source.is_none() {
            self.destroy(ctx);
        }
    }

    // ---- downloading -----------------------------------------------------

    fn req_download(&mut self, ctx: &mut Ctx<'_>) {
        if !self.connected || self.source.is_none() {
            return;
        }
        if let Some(info) = &mut self.source {
            info.swap_to_lowest(ctx);
        }
        let Some(req) = self.source.as_ref().map(SourceInfo::requested) else {
            return;
        };
        if !ctx.downloads.valid(req) {
            return;
        }
        if self.last_reask_time + SOURCE_REASKTIME > ctx.now && self.last_reask_time != 0 {
            // reasked recently (e.g. over UDP); don't spam, but remember
            // that a request went out this session
            if let Some(s) = &mut self.session {
                s.sent_req = true;
            }
            return;
        }

        let d = ctx.downloads.get(req).expect("validity checked");
        let hash = d.hash();
        let part_map = d.part.part_map(ED2K_PARTSIZE);
        let src_count = d.part.full_source_count() as u16;
        trace!(target: "ed2k::client", key = self.key, "requesting download");
        let frame = ReqFile {
            hash,
            part_map,
            src_count,
        }
        .to_frame();
        self.send(ctx, frame);

        self.last_reask_id = ctx.identity.id;
        if let Some(s) = &mut self.session {
            s.sent_req = true;
        }
        self.last_reask_time = ctx.now;
        self.dn_req_in_progress = true;
        self.failed_udp_reasks = 0;
    }

    fn on_file_name(&mut self, ctx: &mut Ctx<'_>, p: &FileName) {
        if self.source.is_none() {
            if let Some(d) = ctx.downloads.find(&p.hash) {
                self.add_offered(ctx, d, false);
            }
        }
        let Some(req) = self.source.as_ref().map(SourceInfo::requested) else {
            return; // we don't need the file after all
        };
        if !self.connected {
            self.destroy(ctx);
            return;
        }
        let (hash, src_exch_allowed) = match ctx.downloads.get(req) {
            Some(d) => (d.hash(), d.source_req_allowed(ctx.now)),
            None => return,
        };
        trace!(target: "ed2k::client", key = self.key, name = %p.name, "file name received");
        let mut w = wire::Writer::new();
        w.hash(&hash);
        let frame = wire::encode_frame(wire::Proto::Ed2k, OP_SETREQFILEID, w.as_bytes());
        self.send(ctx, frame);

        if src_exch_allowed && self.features.src_exch_ver > 0 {
            trace!(target: "ed2k::sourceexchange", key = self.key, "requesting sources");
            let mut w = wire::Writer::new();
            w.hash(&hash);
            let frame = wire::encode_frame(wire::Proto::Emule, OP_REQSOURCES, w.as_bytes());
            self.send(ctx, frame);
            if let Some(d) = ctx.downloads.get_mut(req) {
                d.set_last_src_exch(ctx.now);
            }
        }
    }

    fn on_file_status(&mut self, ctx: &mut Ctx<'_>, p: FileStatus) {
        if self.source.is_none() {
            if let Some(d) = ctx.downloads.find(&p.hash) {
                self.add_offered(ctx, d, false);
            }
        }
        if self.source.is_none() {
            return;
        }
        if !self.connected {
            self.destroy(ctx);
            return;
        }
        let req = self.source.as_ref().expect("checked").requested();
        let Some(d) = ctx.downloads.get_mut(req) else {
            return;
        };
        let expected = d.part.chunk_count(ED2K_PARTSIZE);
        let padded = expected + usize::from(d.part.size() % ED2K_PARTSIZE == 0);
        if !p.part_map.is_empty() && p.part_map.len() != expected && p.part_map.len() != padded {
            debug!(
                target: "ed2k::deadsource",
                key = self.key,
                got = p.part_map.len(),
                expected,
                "file status partmap has wrong bit count"
            );
            self.destroy(ctx);
            return;
        }
        // availability accounting
        let _ = d.part.add_source_mask(ED2K_PARTSIZE, &p.part_map);
        let hash = d.hash();
        let needs_hashes = d.part.size() > ED2K_PARTSIZE
            && !d
                .part
                .hash_sets()
                .iter()
                .any(|hs| hs.chunk_size == ED2K_PARTSIZE && !hs.chunk_hashes.is_empty());

        if let Some(info) = &mut self.source {
            info.part_map = Some(p.part_map.clone());
        }
        self.dn_req_in_progress = false;

        if self.has_needed_parts(ctx) && self.download.is_none() {
            trace!(target: "ed2k::client", key = self.key, "sending start upload request");
            let mut w = wire::Writer::new();
            w.hash(&hash);
            let frame = wire::encode_frame(wire::Proto::Ed2k, OP_STARTUPLOADREQ, w.as_bytes());
            self.send(ctx, frame);
            ctx.timers.schedule_in(
                ctx.now,
                SOURCE_REASKTIME,
                TimerEvent::Client(self.key, ClientTimer::Reask),
            );
            self.last_reask_time = ctx.now;
        } else if !self.has_needed_parts(ctx) {
            trace!(target: "ed2k::client", key = self.key, "peer has no needed parts");
            ctx.timers.schedule_in(
                ctx.now,
                SOURCE_REASKTIME * 2,
                TimerEvent::Client(self.key, ClientTimer::Reconnect),
            );
        }

        if needs_hashes {
            let mut w = wire::Writer::new();
            w.hash(&hash);
            let frame = wire::encode_frame(wire::Proto::Ed2k, OP_REQHASHSET, w.as_bytes());
            self.send(ctx, frame);
        }
    }

    fn has_needed_parts(&self, ctx: &Ctx<'_>) -> bool {
        let Some(info) = &self.source else {
            return false;
        };
        let Some(peer_map) = &info.part_map else {
            return false; // status not in yet
        };
        let Some(d) = ctx.downloads.get(info.req) else {
            return false;
        };
        if peer_map.is_empty() {
            return !d.part.is_file_complete(); // full source
        }
        let ours = d.part.part_map(ED2K_PARTSIZE);
        peer_map
            .iter()
            .enumerate()
            .any(|(i, has)| *has && !ours.get(i).copied().unwrap_or(false))
    }

    fn on_no_file(&mut self, ctx: &mut Ctx<'_>, hash: Hash16) {
        trace!(target: "ed2k::client", key = self.key, "peer has no such file");
        let Some(info) = &self.source else {
            return;
        };
        if let Some(d) = ctx.downloads.find(&hash) {
            if info.offers(d) {
                if let Some(dl) = ctx.downloads.get_mut(d) {
                    dl.forget_source(SocketAddrV4::new(
                        id_to_ip(self.id),
                        self.tcp_port,
                    ));
                }
                self.rem_offered(ctx, d);
            }
        }
    }

    fn on_hash_set(&mut self, ctx: &mut Ctx<'_>, p: &HashSetPacket) {
        let Some(req) = self.source.as_ref().map(SourceInfo::requested) else {
            return;
        };
        // cross-check: folding the chunk digests must reproduce the file
        // hash the set claims to describe
        let folded = partdata::ed2k_file_hash(&p.chunk_hashes);
        let Some(d) = ctx.downloads.get_mut(req) else {
            return;
        };
        if p.file_hash != d.hash() || folded != d.hash() {
            debug!(target: "ed2k::deadsource", key = self.key, "peer sent invalid hash set");
            self.destroy(ctx);
            return;
        }
        let hs = partdata::HashSetRef::ed2k(Some(p.file_hash), p.chunk_hashes.clone());
        if let Err(e) = d.part.add_hash_set(hs) {
            debug!(target: "ed2k::deadsource", key = self.key, error = %e, "hash set rejected");
            self.destroy(ctx);
        }
    }

    fn set_on_queue(&mut self, ctx: &mut Ctx<'_>, qr: u32) {
        if self.source.is_none() {
            return;
        }
        trace!(target: "ed2k::client", key = self.key, qr, "queued on remote side");
        if let Some(info) = &mut self.source {
            info.qr = qr;
        }
        // a ranking while transfer ran means the peer preempted us back
        // onto its queue; also makes the next AcceptUploadReq start clean
        if self.download.is_some() {
            ctx.timers.schedule_in(
                ctx.now,
                SOURCE_REASKTIME,
                TimerEvent::Client(self.key, ClientTimer::Reask),
            );
            self.last_reask_time = ctx.now;
        }
        if let Some(mut dl) = self.download.take() {
            dl.cleanup(ctx);
        }
        self.dn_req_in_progress = false;
    }

    fn on_accept_upload(&mut self, ctx: &mut Ctx<'_>) {
        let has_map = self
            .source
            .as_ref()
            .map_or(false, |s| s.part_map.is_some());
        if !has_map {
            trace!(
                target: "ed2k::client",
                key = self.key,
                "accept received, but what shall we download?"
            );
            return;
        }
        let req = self.source.as_ref().expect("has map").requested();
        let Some(d) = ctx.downloads.get(req) else {
            return;
        };
        if !d.part.is_running() {
            trace!(target: "ed2k::client", key = self.key, "file paused, canceling transfer");
            self.send(
                ctx,
                wire::encode_frame(wire::Proto::Ed2k, OP_CANCELTRANSFER, &[]),
            );
            if let Some(mut dl) = self.download.take() {
                dl.cleanup(ctx);
            }
            return;
        }
        if self.download.is_none() {
            let mask = self
                .source
                .as_ref()
                .and_then(|s| s.part_map.clone())
                .filter(|m| !m.is_empty());
            let mut dl = DownloadInfo::new(req);
            dl.fill(ctx, mask.as_deref());
            self.download = Some(dl);
            self.send_chunk_reqs(ctx, false);
        }
        if let Some(s) = &mut self.session {
            s.sent_req = true;
        }
    }

    fn send_chunk_reqs(&mut self, ctx: &mut Ctx<'_>, only_new: bool) {
        if !self.connected {
            return;
        }
        let Some(hash) = self
            .source
            .as_ref()
            .and_then(|s| ctx.downloads.get(s.req))
            .map(crate::download::Download::hash)
        else {
            return;
        };
        let Some(dl) = &mut self.download else {
            return;
        };
        let mask = self
            .source
            .as_ref()
            .and_then(|s| s.part_map.clone())
            .filter(|m| !m.is_empty());
        dl.fill(ctx, mask.as_deref());
        let mut reqs = dl.chunk_requests();
        if reqs.is_empty() {
            return;
        }
        if only_new && reqs.len() > 1 {
            // non-rotational scheme: only advertise the newest range
            reqs.drain(..reqs.len() - 1);
        }
        reqs.truncate(3);
        for r in &reqs {
            trace!(
                target: "ed2k::client",
                key = self.key,
                begin = r.begin(),
                end = r.end(),
                "requesting chunk"
            );
        }
        let frame = ReqChunks { hash, ranges: reqs }.to_frame();
        self.send(ctx, frame);
    }

    fn transfer_target_running(&self, ctx: &Ctx<'_>) -> bool {
        self.download
            .as_ref()
            .and_then(|dl| ctx.downloads.get(dl.download))
            .map_or(false, |d| d.part.is_running())
    }

    fn on_data_chunk(&mut self, ctx: &mut Ctx<'_>, p: &DataChunk) {
        if self.download.is_none() || !self.connected {
            self.destroy(ctx);
            return;
        }
        if !self.transfer_target_running(ctx) {
            self.send(
                ctx,
                wire::encode_frame(wire::Proto::Ed2k, OP_CANCELTRANSFER, &[]),
            );
            if let Some(mut dl) = self.download.take() {
                dl.cleanup(ctx);
            }
            return;
        }
        trace!(
            target: "ed2k::client",
            key = self.key,
            bytes = p.data.len(),
            "received data"
        );
        let finished = self
            .download
            .as_mut()
            .expect("checked")
            .write(ctx, u64::from(p.begin), &p.data);
        if let Some(pk) = self.pub_key.clone() {
            ctx.credits.add_downloaded(&pk, p.data.len() as u64);
        }
        if finished {
            self.send_chunk_reqs(ctx, true);
        }
    }

    fn on_packed_chunk(&mut self, ctx: &mut Ctx<'_>, p: &PackedChunk) {
        if self.download.is_none() || !self.connected {
            self.destroy(ctx);
            return;
        }
        if !self.transfer_target_running(ctx) {
            self.send(
                ctx,
                wire::encode_frame(wire::Proto::Ed2k, OP_CANCELTRANSFER, &[]),
            );
            if let Some(mut dl) = self.download.take() {
                dl.cleanup(ctx);
            }
            return;
        }
        trace!(
            target: "ed2k::client",
            key = self.key,
            bytes = p.data.len(),
            "received packed data"
        );
        let result = self.download.as_mut().expect("checked").write_packed(
            ctx,
            u64::from(p.begin),
            p.packed_total as usize,
            &p.data,
        );
        if let Some(pk) = self.pub_key.clone() {
            ctx.credits.add_downloaded(&pk, p.data.len() as u64);
        }
        match result {
            Ok(true) => self.send_chunk_reqs(ctx, true),
            Ok(false) => {}
            Err(()) => {
                debug!(target: "ed2k::deadsource", key = self.key, "bad packed stream");
                self.destroy(ctx);
            }
        }
    }

    // ---- source exchange -------------------------------------------------

    fn on_source_exch_req(&mut self, ctx: &mut Ctx<'_>, hash: Hash16) {
        let Some(d) = ctx.downloads.find(&hash).and_then(|id| ctx.downloads.get(id)) else {
            return;
        };
        let count = d.known_sources().len();
        if count == 0 || count >= 50 {
            return;
        }
        let sources: Vec<SourceEntry> = d
            .known_sources()
            .iter()
            .map(|s| SourceEntry {
                id: crate::ip_to_id(*s.addr.ip()),
                port: s.addr.port(),
                server_ip: s.server.map_or(0, |srv| crate::ip_to_id(*srv.ip())),
                server_port: s.server.map_or(0, |srv| srv.port()),
            })
            .collect();
        trace!(
            target: "ed2k::sourceexchange",
            key = self.key,
            count = sources.len(),
            "answering source exchange"
        );
        let frame = AnswerSources {
            hash,
            sources,
            swap_ids: self.features.src_exch_ver >= 3,
        }
        .to_frame();
        self.send(ctx, frame);
    }

    fn on_answer_sources(&mut self, p: &AnswerSources) {
        let mut added = 0u32;
        for src in &p.sources {
            let server = if src.server_ip != 0 {
                Some(SocketAddrV4::new(id_to_ip(src.server_ip), src.server_port))
            } else {
                None
            };
            if let Some(srv) = server {
                self.emit(Action::FoundServer(srv));
            }
            if src.id == 0 {
                continue;
            }
            self.emit(Action::FoundSource {
                hash: p.hash,
                addr: SocketAddrV4::new(id_to_ip(src.id), src.port),
                server,
            });
            added += 1;
        }
        trace!(
            target: "ed2k::sourceexchange",
            key = self.key,
            added,
            "received exchanged sources"
        );
    }

    // ---- secure identification -------------------------------------------

    fn on_sec_ident_state(&mut self, ctx: &mut Ctx<'_>, p: SecIdentState) {
        trace!(
            target: "ed2k::secident",
            key = self.key,
            state = p.state,
            challenge = p.challenge,
            "sec ident state"
        );
        self.req_challenge = p.challenge;
        if self.pub_key.is_none() && self.sent_challenge == 0 {
            self.verify_ident(ctx);
        }
        if p.state == SI_KEYANDSIGNEEDED {
            let frame = public_key_frame(ctx.credits.public_key());
            self.send(ctx, frame);
        }
        if self.pub_key.is_some() {
            self.send_signature(ctx);
        }
    }

    fn on_public_key(&mut self, ctx: &mut Ctx<'_>, key: Vec<u8>) {
        match &self.pub_key {
            Some(existing) if *existing != key => {
                warn!(
                    target: "ed2k::secident",
                    key = self.key,
                    "peer sent a different public key"
                );
                self.pub_key = None;
            }
            _ => {
                self.pub_key = Some(key);
                if self.req_challenge != 0 {
                    self.send_signature(ctx);
                }
            }
        }
    }

    fn on_signature(&mut self, ctx: &mut Ctx<'_>, p: &Signature) {
        let (Some(pub_key), true) = (self.pub_key.clone(), self.sent_challenge != 0) else {
            return;
        };
        let (ip_type, ip) = if self.features.sec_ident_ver > 1 && p.ip_type != IP_NONE {
            match p.ip_type {
                IP_REMOTE => (IP_REMOTE, ctx.identity.id),
                IP_LOCAL => (IP_LOCAL, self.id),
                _ => (IP_NONE, 0),
            }
        } else {
            (IP_NONE, 0)
        };
        let verified = ctx
            .credits
            .verify_signature(&pub_key, self.sent_challenge, &p.sign, ip_type, ip)
            .is_ok();
        if verified {
            trace!(target: "ed2k::secident", key = self.key, "ident succeeded");
            ctx.credits.create(&pub_key);
            ctx.credits.touch(&pub_key, ctx.now / 1000);
            self.init_transfer(ctx);
        } else {
            debug!(target: "ed2k::secident", key = self.key, "ident failed");
            self.pub_key = None;
        }
        self.sent_challenge = 0;
    }

    fn verify_ident(&mut self, ctx: &mut Ctx<'_>) {
        if self.features.sec_ident_ver == 0 || self.sent_challenge != 0 || !self.connected {
            return;
        }
        let state = if self.pub_key.is_some() {
            SI_SIGNEEDED
        } else {
            SI_KEYANDSIGNEEDED
        };
        let challenge = rand::random::<u32>() | 1; // zero means "no challenge"
        trace!(target: "ed2k::secident", key = self.key, challenge, "requesting ident");
        self.sent_challenge = challenge;
        let frame = SecIdentState { state, challenge }.to_frame();
        self.send(ctx, frame);
    }

    fn send_signature(&mut self, ctx: &mut Ctx<'_>) {
        let (Some(pub_key), true) = (self.pub_key.clone(), self.req_challenge != 0) else {
            return;
        };
        if !self.connected {
            return;
        }
        let (ip_type, ip) = crate::credits::signature_ip_binding(
            self.features.sec_ident_ver,
            ctx.identity.id,
            self.id,
        );
        trace!(
            target: "ed2k::secident",
            key = self.key,
            challenge = self.req_challenge,
            "sending signature"
        );
        let sign = ctx
            .credits
            .create_signature(&pub_key, self.req_challenge, ip_type, ip);
        let frame = Signature { sign, ip_type }.to_frame();
        self.send(ctx, frame);
        self.req_challenge = 0;
    }

    // ---- UDP reasks ------------------------------------------------------

    /// Periodic source reask: prefer UDP, escalate to TCP when the id
    /// changed or UDP is unavailable.
    pub fn reask_for_download(&mut self, ctx: &mut Ctx<'_>) {
        if self.source.is_none() || self.download.is_some() {
            return;
        }
        // 2-second grace keeps clock jitter from skipping a cycle
        if self.last_reask_time + SOURCE_REASKTIME > ctx.now + 2000 && self.last_reask_time != 0 {
            trace!(target: "ed2k::client", key = self.key, "reask too soon, skipping");
            return;
        }
        if !self.connected && ctx.identity.is_low_id() && self.is_low_id() {
            trace!(target: "ed2k::deadsource", key = self.key, "low-id reask impossible");
            self.destroy(ctx);
            return;
        }
        if self.connected {
            self.req_download(ctx);
        } else if self.last_reask_id != 0 && self.last_reask_id != ctx.identity.id {
            // the peer cannot map our UDP ping to the id it queued
            trace!(target: "ed2k::client", key = self.key, "id changed, forcing tcp reask");
            self.establish_connection(ctx);
        } else if !self.is_low_id() && self.udp_port != 0 && self.features.udp_ver > 0 {
            let Some(req) = self.source.as_ref().map(SourceInfo::requested) else {
                return;
            };
            let Some(d) = ctx.downloads.get(req) else {
                return;
            };
            let ping = ReaskFilePing {
                hash: d.hash(),
                part_map: d.part.part_map(ED2K_PARTSIZE),
                src_count: d.part.full_source_count() as u16,
            };
            let datagram = ping.to_datagram(self.features.udp_ver);
            let to = SocketAddrV4::new(id_to_ip(self.id), self.udp_port);
            trace!(target: "ed2k::client", key = self.key, %to, "udp reask");
            if ctx.sched.send_datagram(ctx.udp_socket, to, datagram).is_ok() {
                self.reask_in_progress = true;
                self.last_reask_id = ctx.identity.id;
                ctx.timers.schedule_in(
                    ctx.now,
                    UDP_TIMEOUT,
                    TimerEvent::Client(self.key, ClientTimer::UdpTimeout),
                );
            }
        } else {
            trace!(target: "ed2k::client", key = self.key, "tcp reask");
            self.establish_connection(ctx);
        }
    }

    /// Handles a client-to-client datagram from this peer.
    pub fn on_udp(&mut self, ctx: &mut Ctx<'_>, msg: &UdpMessage) {
        match msg {
            UdpMessage::ReaskFilePing(ping) => self.on_reask_ping(ctx, ping),
            UdpMessage::ReaskAck(ack) => self.on_reask_ack(ctx, ack),
            UdpMessage::FileNotFound => self.on_udp_file_not_found(ctx),
            UdpMessage::QueueFull => self.on_udp_queue_full(ctx),
            _ => {}
        }
    }

    fn udp_addr(&self) -> Option<SocketAddrV4> {
        if self.is_low_id() || self.udp_port == 0 {
            None
        } else {
            Some(SocketAddrV4::new(id_to_ip(self.id), self.udp_port))
        }
    }

    fn on_reask_ping(&mut self, ctx: &mut Ctx<'_>, ping: &ReaskFilePing) {
        // a forgotten peer (restart) passively re-enters the queue
        if self.queue.is_none() {
            trace!(
                target: "ed2k::client",
                key = self.key,
                "udp reask from unqueued peer, re-queueing passively"
            );
            self.on_upload_req(ctx, Some(ping.hash));
            if let Some(d) = ctx.downloads.find(&ping.hash) {
                self.add_offered(ctx, d, false);
            }
        }
        if self.upload.is_some() || self.queue.is_none() {
            return;
        }
        let Some(to) = self.udp_addr() else { return };

        if self
            .queue
            .as_ref()
            .map_or(false, |q| q.req_hash != ping.hash)
        {
            if ctx.shared.find(&ping.hash).is_some() {
                trace!(target: "ed2k::client", key = self.key, "udp swap to another file");
                if let Some(q) = &mut self.queue {
                    q.req_hash = ping.hash;
                }
            } else {
                let _ = ctx
                    .sched
                    .send_datagram(ctx.udp_socket, to, file_not_found_datagram());
                return;
            }
        }

        let queue = self.queue.as_mut().expect("checked");
        queue.last_queue_reask = ctx.now;
        let qr = queue.qr;
        let req_hash = queue.req_hash;
        let part_map = ctx
            .shared
            .find(&req_hash)
            .and_then(|sf| sf.download)
            .and_then(|id| ctx.downloads.get(id))
            .map(|d| d.part.part_map(ED2K_PARTSIZE))
            .unwrap_or_default();
        let ack = ReaskAck {
            part_map,
            qr: qr as u16,
        };
        trace!(target: "ed2k::client", key = self.key, qr, "answering udp reask");
        let _ = ctx.sched.send_datagram(
            ctx.udp_socket,
            to,
            ack.to_datagram(self.features.udp_ver.max(3)),
        );
    }

    fn on_reask_ack(&mut self, ctx: &mut Ctx<'_>, ack: &ReaskAck) {
        if self.source.is_none() {
            return;
        }
        self.reask_in_progress = false;
        self.failed_udp_reasks = 0;
        trace!(target: "ed2k::client", key = self.key, qr = ack.qr, "udp reask acknowledged");
        if let Some(info) = &mut self.source {
            if !ack.part_map.is_empty() {
                info.part_map = Some(ack.part_map.clone());
            }
            info.qr = u32::from(ack.qr);
        }
        ctx.timers.schedule_in(
            ctx.now,
            SOURCE_REASKTIME,
            TimerEvent::Client(self.key, ClientTimer::Reask),
        );
        self.last_reask_time = ctx.now;
    }

    fn on_udp_file_not_found(&mut self, ctx: &mut Ctx<'_>) {
        self.reask_in_progress = false;
        self.failed_udp_reasks = 0;
        trace!(target: "ed2k::client", key = self.key, "udp reask: file not found");
        if let Some(req) = self.source.as_ref().map(SourceInfo::requested) {
            self.rem_offered(ctx, req);
        }
        if self.source.is_some() {
            // another offered file remains; re-ask for that one
            self.reask_for_download(ctx);
        }
    }

    fn on_udp_queue_full(&mut self, ctx: &mut Ctx<'_>) {
        self.reask_in_progress = false;
        self.failed_udp_reasks = 0;
        trace!(target: "ed2k::client", key = self.key, "udp reask: queue full");
        if let Some(info) = &mut self.source {
            info.qr = 0;
        }
        ctx.timers.schedule_in(
            ctx.now,
            SOURCE_REASKTIME,
            TimerEvent::Client(self.key, ClientTimer::Reask),
        );
        self.last_reask_time = ctx.now;
    }

    /// Applies an id change decided by the registry.
    pub(crate) fn set_id(&mut self, new_id: u32) {
        self.id = new_id;
    }

    /// Records the peer's UDP port (used for passive reask sessions).
    pub(crate) fn set_udp_port(&mut self, port: u16) {
        self.udp_port = port;
    }

    /// Attaches a socket that is still connecting; the `Connected` event
    /// drives the handshake.
    pub(crate) fn adopt_pending_socket(&mut self, socket: sched::SocketId) {
        self.socket = Some(socket);
        self.connected = false;
    }

    /// The peer's verified public key, when identification succeeded.
    #[must_use]
    pub fn user_pub_key(&self) -> Option<&[u8]> {
        self.pub_key.as_deref()
    }

    /// Kicks the transfer machinery after an out-of-band state change
    /// (e.g. a session merge completed a callback).
    pub(crate) fn start_transfers(&mut self, ctx: &mut Ctx<'_>) {
        self.init_transfer(ctx);
    }

    /// Removes the peer from our queue (stale entry reaping).
    pub(crate) fn drop_queue_entry(&mut self, ctx: &mut Ctx<'_>) {
        self.queue = None;
        self.emit(Action::CancelUpload(self.key));
        self.check_destroy(ctx);
    }

    /// Updates the stored queue rank without sending it.
    pub(crate) fn store_queue_rank(&mut self, qr: u32) {
        if let Some(queue) = &mut self.queue {
            queue.qr = qr;
        }
    }
}
