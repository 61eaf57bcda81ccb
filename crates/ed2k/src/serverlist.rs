//! Server pool and login state machine.
//!
//! One server carries the TCP session (login, source queries, callbacks);
//! every other known server is polled over UDP in round-robin for stats
//! and sources. The set persists as `server.met`.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use rand::seq::SliceRandom;
use rustc_hash::FxHashMap;
use sched::{SockEvent, SocketId};
use tracing::{debug, info, trace, warn};
use wire::{FrameReader, Hash16, Reader, Tag, TagValue, Writer};

use crate::engine::{Ctx, ServerTimer, TimerEvent};
use crate::opcodes::*;
use crate::packets::*;

/// UDP stat/source query interval per server.
pub const SERVER_QUERY_TIME: u64 = 20 * 60 * 1000;
/// Keep-alive interval for the empty `OfferFiles` ping.
pub const SERVER_PING_TIME: u64 = 20 * 60 * 1000;
/// TCP source-reask interval.
pub const SOURCE_QUERY_TIME: u64 = 20 * 60 * 1000;
/// Login must complete within this window.
pub const LOGIN_TIMEOUT: u64 = 20_000;
/// Minimum pause between TCP connection attempts.
pub const RECONNECT_COOLDOWN: u64 = 3_000;
/// UDP ping answer timeout.
pub const PING_TIMEOUT: u64 = 10_000;
/// Stagger between scheduled `ReqSources` batches.
pub const SOURCE_BATCH_STAGGER: u64 = 245_000;
/// Files per `ReqSources` batch and batches per cycle.
pub const SOURCES_PER_PACKET: usize = 15;
pub const MAX_SOURCE_PACKETS: usize = 5;
/// Publishing cap at login.
pub const MAX_PUBLISH: usize = 300;

/// A known server.
#[derive(Clone, Debug)]
pub struct Server {
    /// TCP endpoint.
    pub addr: SocketAddrV4,
    pub name: String,
    pub desc: String,
    pub dyn_ip: String,
    pub version: String,
    pub aux_ports: String,
    pub ping: u32,
    pub failed_count: u32,
    pub preference: u32,
    pub users: u32,
    pub files: u32,
    pub max_users: u32,
    pub soft_limit: u32,
    pub hard_limit: u32,
    pub last_ping: u32,
    pub udp_flags: u32,
    pub low_id_users: u32,
    /// TCP feature flags from `IdChange`.
    pub tcp_flags: u32,
    /// Tick of the last UDP query round for this server.
    pub last_udp_query: u64,
    /// A `GlobStatReq` is in flight.
    pub ping_in_progress: bool,
    /// Challenge of the in-flight ping.
    pub challenge: u32,
}

impl Server {
    /// Creates an entry with defaults for `addr`.
    #[must_use]
    pub fn new(addr: SocketAddrV4) -> Self {
        Self {
            addr,
            name: addr.ip().to_string(),
            desc: String::new(),
            dyn_ip: String::new(),
            version: String::new(),
            aux_ports: String::new(),
            ping: 0,
            failed_count: 0,
            preference: 0,
            users: 0,
            files: 0,
            max_users: 0,
            soft_limit: 0,
            hard_limit: 0,
            last_ping: 0,
            udp_flags: 0,
            low_id_users: 0,
            tcp_flags: 0,
            last_udp_query: 0,
            ping_in_progress: false,
            challenge: 0,
        }
    }

    /// The server's UDP port (TCP port + 4, the network convention).
    #[must_use]
    pub fn udp_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(*self.addr.ip(), self.addr.port() + 4)
    }
}

/// Connection state of the TCP session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ServerStatus {
    /// No session.
    #[default]
    Offline,
    /// TCP connect in flight.
    Connecting,
    /// Waiting for the login answer.
    LoggingIn,
    /// Logged in.
    Connected,
}

/// Effects the server list hands to the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    /// Sources found for a download hash.
    FoundSources {
        hash: Hash16,
        sources: Vec<(u32, u16)>,
    },
    /// A peer wants us to connect it (low-id callback).
    Callback(SocketAddrV4),
    /// Search results arrived.
    SearchResults(SearchResultPacket),
    /// Our id changed (re-login or server decision).
    IdChanged(u32),
}

/// The known-server pool plus the single TCP session.
pub struct ServerList {
    servers: FxHashMap<SocketAddrV4, Server>,
    socket: Option<SocketId>,
    frames: FrameReader,
    current: Option<SocketAddrV4>,
    status: ServerStatus,
    last_conn_attempt: u64,
    last_source_request: u64,
    find_servers: bool,
    events: Vec<ServerEvent>,
}

impl ServerList {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(find_servers: bool) -> Self {
        Self {
            servers: FxHashMap::default(),
            socket: None,
            frames: FrameReader::new(),
            current: None,
            status: ServerStatus::Offline,
            last_conn_attempt: 0,
            last_source_request: 0,
            find_servers,
            events: Vec::new(),
        }
    }

    /// Current session status.
    #[must_use]
    pub const fn status(&self) -> ServerStatus {
        self.status
    }

    /// Endpoint of the server we are connected (or connecting) to.
    #[must_use]
    pub const fn current_server(&self) -> Option<SocketAddrV4> {
        self.current
    }

    /// The TCP socket, when a session exists.
    #[must_use]
    pub const fn socket(&self) -> Option<SocketId> {
        self.socket
    }

    /// Number of known servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Returns true when no servers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Iterates over the pool.
    pub fn iter(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    /// Drains events for the engine.
    pub fn take_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Adds a server if unknown.
    pub fn add_server(&mut self, addr: SocketAddrV4) {
        if addr.ip().is_unspecified() || addr.port() == 0 {
            return;
        }
        self.servers
            .entry(addr)
            .or_insert_with(|| Server::new(addr));
    }

    // ---- server.met ------------------------------------------------------

    /// Loads `server.met`, merging into the pool.
    pub fn load_met(&mut self, path: &Path) -> std::io::Result<usize> {
        let data = std::fs::read(path)?;
        let mut r = Reader::new(&data);
        let version = r.u8().map_err(bad_data)?;
        if version != ST_METVERSION && version != ST_METHEADER {
            warn!(target: "ed2k::server", "server.met has unknown version byte");
            return Ok(0);
        }
        let count = r.u32().map_err(bad_data)?;
        let mut added = 0usize;
        for _ in 0..count {
            match Self::read_met_entry(&mut r) {
                Ok(server) => {
                    added += usize::from(!self.servers.contains_key(&server.addr));
                    self.servers.entry(server.addr).or_insert(server);
                }
                Err(e) => {
                    warn!(target: "ed2k::server", error = %e, "corrupt server.met entry");
                    break;
                }
            }
        }
        info!(target: "ed2k::server", total = self.servers.len(), added, "server list loaded");
        Ok(added)
    }

    fn read_met_entry(r: &mut Reader<'_>) -> Result<Server, wire::WireError> {
        let ip = r.u32()?;
        let port = r.u16()?;
        let addr = SocketAddrV4::new(Ipv4Addr::from(ip.to_le_bytes()), port);
        let mut server = Server::new(addr);
        let tag_count = r.u32()?;
        for _ in 0..tag_count {
            let tag = Tag::read(r)?;
            let v = tag.value_u64().unwrap_or(0) as u32;
            match (tag.code(), &tag.value) {
                (Some(ST_NAME), TagValue::Str(s)) => server.name = s.clone(),
                (Some(ST_DESC), TagValue::Str(s)) => server.desc = s.clone(),
                (Some(ST_DYNIP), TagValue::Str(s)) => server.dyn_ip = s.clone(),
                (Some(ST_VERSION), TagValue::Str(s)) => server.version = s.clone(),
                (Some(ST_AUXPORTLIST), TagValue::Str(s)) => server.aux_ports = s.clone(),
                (Some(ST_PING), _) => server.ping = v,
                (Some(ST_FAIL), _) => server.failed_count = v,
                (Some(ST_PREFERENCE), _) => server.preference = v,
                (Some(ST_MAXUSERS), _) => server.max_users = v,
                (Some(ST_SOFTLIMIT), _) => server.soft_limit = v,
                (Some(ST_HARDLIMIT), _) => server.hard_limit = v,
                (Some(ST_LASTPING), _) => server.last_ping = v,
                (Some(ST_UDPFLAGS), _) => server.udp_flags = v,
                (Some(ST_LOWIDUSRS), _) => server.low_id_users = v,
                _ => {}
            }
        }
        Ok(server)
    }

    /// Saves the pool as `server.met`.
    pub fn save_met(&self, path: &Path) -> std::io::Result<()> {
        let mut w = Writer::new();
        w.u8(ST_METVERSION);
        w.u32(self.servers.len() as u32);
        for s in self.servers.values() {
            w.u32(u32::from_le_bytes(s.addr.ip().octets()));
            w.u16(s.addr.port());
            let mut tags = vec![
                Tag::string(ST_NAME, s.name.clone()),
                Tag::u32(ST_PING, s.ping),
                Tag::u32(ST_FAIL, s.failed_count),
                Tag::u32(ST_PREFERENCE, s.preference),
            ];
            if !s.desc.is_empty() {
                tags.push(Tag::string(ST_DESC, s.desc.clone()));
            }
            if !s.version.is_empty() {
                tags.push(Tag::string(ST_VERSION, s.version.clone()));
            }
            if !s.aux_ports.is_empty() {
                tags.push(Tag::string(ST_AUXPORTLIST, s.aux_ports.clone()));
            }
            if s.max_users != 0 {
                tags.push(Tag::u32(ST_MAXUSERS, s.max_users));
            }
            if s.soft_limit != 0 {
                tags.push(Tag::u32(ST_SOFTLIMIT, s.soft_limit));
            }
            if s.hard_limit != 0 {
                tags.push(Tag::u32(ST_HARDLIMIT, s.hard_limit));
            }
            if s.last_ping != 0 {
                tags.push(Tag::u32(ST_LASTPING, s.last_ping));
            }
            if s.udp_flags != 0 {
                tags.push(Tag::u32(ST_UDPFLAGS, s.udp_flags));
            }
            if s.low_id_users != 0 {
                tags.push(Tag::u32(ST_LOWIDUSRS, s.low_id_users));
            }
            Tag::write_list(&tags, &mut w);
        }
        std::fs::write(path, w.as_bytes())
    }

    // ---- TCP session -----------------------------------------------------

    /// Connects to a randomly chosen known server, evicting dead ones.
    pub fn connect_any(&mut self, ctx: &mut Ctx<'_>) {
        loop {
            let mut candidates: Vec<SocketAddrV4> = self.servers.keys().copied().collect();
            if candidates.is_empty() {
                debug!(target: "ed2k::server", "no servers to connect to");
                return;
            }
            candidates.shuffle(&mut rand::thread_rng());
            let pick = candidates[0];
            let failed = self.servers[&pick].failed_count;
            if failed > 2 {
                trace!(target: "ed2k::server", addr = %pick, "removing dead server");
                self.servers.remove(&pick);
                continue;
            }
            self.connect_to(ctx, pick);
            return;
        }
    }

    /// Connects to a specific server.
    pub fn connect_to(&mut self, ctx: &mut Ctx<'_>, addr: SocketAddrV4) {
        if let Some(sock) = self.socket.take() {
            ctx.sched.del_socket(sock);
        }
        self.add_server(addr);
        self.frames = FrameReader::new();
        self.current = Some(addr);
        self.status = ServerStatus::Connecting;
        self.last_conn_attempt = ctx.now;
        info!(target: "ed2k::server", %addr, "connecting to server");
        let sock = ctx.sched.add_stream_pending(None);
        self.socket = Some(sock);
        if ctx.sched.connect(sock, addr, RECONNECT_COOLDOWN).is_err() {
            self.on_session_failed(ctx);
        }
    }

    /// Routes a scheduler event for the server socket.
    pub fn handle_sock_event(&mut self, ctx: &mut Ctx<'_>, evt: SockEvent) {
        match evt {
            SockEvent::Connected => {
                info!(target: "ed2k::server", "server connection up, logging in");
                self.status = ServerStatus::LoggingIn;
                let frame = login_request_frame(ctx.identity);
                self.send(ctx, frame);
                ctx.timers.schedule_in(
                    ctx.now,
                    LOGIN_TIMEOUT,
                    TimerEvent::Server(ServerTimer::LoginTimeout),
                );
            }
            SockEvent::Read => self.on_readable(ctx),
            SockEvent::Write => {}
            SockEvent::Lost
            | SockEvent::Err
            | SockEvent::Timeout
            | SockEvent::ConnFailed
            | SockEvent::Blocked => {
                info!(target: "ed2k::server", ?evt, "server connection lost");
                self.on_session_failed(ctx);
            }
            SockEvent::Accept => {}
        }
    }

    fn on_session_failed(&mut self, ctx: &mut Ctx<'_>) {
        if let Some(addr) = self.current {
            if let Some(s) = self.servers.get_mut(&addr) {
                s.failed_count += 1;
            }
        }
        if let Some(sock) = self.socket.take() {
            ctx.sched.del_socket(sock);
        }
        self.current = None;
        self.status = ServerStatus::Offline;
        ctx.identity.id = 0;

        let since = ctx.now.saturating_sub(self.last_conn_attempt);
        if since >= RECONNECT_COOLDOWN {
            self.connect_any(ctx);
        } else {
            debug!(target: "ed2k::server", "reconnect shortly");
            ctx.timers.schedule_in(
                ctx.now,
                RECONNECT_COOLDOWN - since,
                TimerEvent::Server(ServerTimer::ConnRetry),
            );
        }
    }

    fn send(&mut self, ctx: &mut Ctx<'_>, frame: Vec<u8>) {
        if let Some(sock) = self.socket {
            let _ = ctx.sched.write(sock, &frame);
        }
    }

    fn on_readable(&mut self, ctx: &mut Ctx<'_>) {
        let Some(sock) = self.socket else { return };
        let Ok(data) = ctx.sched.read(sock) else {
            return;
        };
        self.frames.feed(&data);
        loop {
            match self.frames.next_frame() {
                Ok(Some(frame)) => match ServerTcpMessage::decode(&frame) {
                    Ok(msg) => self.handle_message(ctx, msg),
                    Err(e) => {
                        debug!(target: "ed2k::server", error = %e, "bad server packet");
                        self.on_session_failed(ctx);
                        return;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(target: "ed2k::server", error = %e, "server stream corrupt");
                    self.on_session_failed(ctx);
                    return;
                }
            }
        }
    }

    fn handle_message(&mut self, ctx: &mut Ctx<'_>, msg: ServerTcpMessage) {
        match msg {
            ServerTcpMessage::Message(text) => {
                for line in text.lines().filter(|l| !l.is_empty()) {
                    if let Some(rest) = line.strip_prefix("ERROR : ") {
                        warn!(target: "ed2k::server", "server: {rest}");
                    } else if let Some(rest) = line.strip_prefix("WARNING : ") {
                        warn!(target: "ed2k::server", "server: {rest}");
                    } else {
                        info!(target: "ed2k::server", "server: {line}");
                    }
                }
            }
            ServerTcpMessage::IdChange(p) => self.on_id_change(ctx, p),
            ServerTcpMessage::Status { users, files } => {
                trace!(target: "ed2k::server", users, files, "server status");
                if let Some(s) = self.current_mut() {
                    s.users = users;
                    s.files = files;
                }
            }
            ServerTcpMessage::ServerIdent(p) => {
                info!(target: "ed2k::server", name = %p.name, "server ident");
                if let Some(s) = self.current_mut() {
                    s.name = p.name;
                    s.desc = p.desc;
                }
            }
            ServerTcpMessage::ServerList(p) => {
                if self.find_servers {
                    let before = self.servers.len();
                    for (ip, port) in p.servers {
                        self.add_server(SocketAddrV4::new(
                            Ipv4Addr::from(ip.to_le_bytes()),
                            port,
                        ));
                    }
                    trace!(
                        target: "ed2k::server",
                        added = self.servers.len() - before,
                        "received server list"
                    );
                }
            }
            ServerTcpMessage::SearchResult(p) => {
                self.events.push(ServerEvent::SearchResults(p));
            }
            ServerTcpMessage::CallbackReq(p) => {
                let addr = SocketAddrV4::new(Ipv4Addr::from(p.ip.to_le_bytes()), p.port);
                trace!(target: "ed2k::server", %addr, "callback requested");
                self.events.push(ServerEvent::Callback(addr));
            }
            ServerTcpMessage::CallbackFail => {
                debug!(target: "ed2k::server", "callback failed");
            }
            ServerTcpMessage::FoundSources(p) => {
                debug!(
                    target: "ed2k::server",
                    count = p.sources.len(),
                    "sources from server"
                );
                self.events.push(ServerEvent::FoundSources {
                    hash: p.hash,
                    sources: p.sources,
                });
            }
        }
    }

    fn current_mut(&mut self) -> Option<&mut Server> {
        let addr = self.current?;
        self.servers.get_mut(&addr)
    }

    fn on_id_change(&mut self, ctx: &mut Ctx<'_>, p: IdChange) {
        info!(
            target: "ed2k::server",
            id = p.id,
            low = crate::is_low_id(p.id),
            "new client id"
        );
        ctx.identity.id = p.id;
        self.events.push(ServerEvent::IdChanged(p.id));
        if let Some(s) = self.current_mut() {
            s.tcp_flags = p.flags;
            s.failed_count = 0;
        }
        if self.status != ServerStatus::Connected {
            self.status = ServerStatus::Connected;
            info!(target: "ed2k::server", "logged in to the network");
            self.publish_files(ctx);
            self.last_source_request = 0;
            self.req_sources(ctx);
            ctx.timers.schedule_in(
                ctx.now,
                SERVER_PING_TIME,
                TimerEvent::Server(ServerTimer::PingKeepalive),
            );
            if self.find_servers {
                self.send(ctx, get_server_list_frame());
            }
        }
    }

    // ---- publishing ------------------------------------------------------

    fn offered_file(ctx: &Ctx<'_>, sf: &crate::shared::SharedFile) -> Option<OfferedFile> {
        if sf.size > u64::from(u32::MAX) {
            return None; // not representable on this network
        }
        if let Some(id) = sf.download {
            let complete = ctx.downloads.get(id).map_or(0, |d| d.part.completed_bytes());
            if complete < partdata::ED2K_PARTSIZE {
                return None; // nothing a peer could fetch yet
            }
        }
        let (id, port) = if sf.is_partial() {
            (FL_PARTIAL_ID, FL_PARTIAL_PORT)
        } else {
            (FL_COMPLETE_ID, FL_COMPLETE_PORT)
        };
        Some(OfferedFile {
            hash: sf.hash,
            id,
            port,
            name: sf.name.clone(),
            size: sf.size as u32,
            file_type: None,
        })
    }

    /// Publishes (up to 300 of) our shared files after login.
    pub fn publish_files(&mut self, ctx: &mut Ctx<'_>) {
        let zlib = self
            .current_mut()
            .map_or(false, |s| s.tcp_flags & FL_ZLIB != 0);
        let files: Vec<OfferedFile> = ctx
            .shared
            .iter()
            .filter_map(|sf| Self::offered_file(ctx, sf))
            .take(MAX_PUBLISH)
            .collect();
        if files.is_empty() {
            return;
        }
        trace!(target: "ed2k::server", count = files.len(), "publishing shared files");
        let frame = offer_files_frame(&files, zlib);
        self.send(ctx, frame);
    }

    /// Publishes one newly shared file.
    pub fn publish_file(&mut self, ctx: &mut Ctx<'_>, hash: &Hash16) {
        if self.status != ServerStatus::Connected {
            return;
        }
        let zlib = self
            .current_mut()
            .map_or(false, |s| s.tcp_flags & FL_ZLIB != 0);
        let Some(file) = ctx
            .shared
            .find(hash)
            .and_then(|sf| Self::offered_file(ctx, sf))
        else {
            return;
        };
        let frame = offer_files_frame(&[file], zlib);
        self.send(ctx, frame);
    }

    /// Requests a server-relayed callback to a low id.
    pub fn req_callback(&mut self, ctx: &mut Ctx<'_>, id: u32) {
        if self.status != ServerStatus::Connected {
            debug!(target: "ed2k::server", "callback request while offline, dropped");
            return;
        }
        self.send(ctx, req_callback_frame(id));
    }

    /// Sends a search to the connected server.
    pub fn search(&mut self, ctx: &mut Ctx<'_>, query: &Search) {
        if self.status == ServerStatus::Connected {
            self.send(ctx, query.to_frame());
        }
    }

    /// Fans the search out over UDP to servers that support it.
    pub fn global_search(&mut self, ctx: &mut Ctx<'_>, query: &Search, max_servers: usize) {
        let targets: Vec<SocketAddrV4> = self
            .servers
            .values()
            .filter(|s| s.udp_flags & SRV_FL_GETFILES != 0 && Some(s.addr) != self.current)
            .take(max_servers)
            .map(Server::udp_addr)
            .collect();
        let datagram = query.to_datagram();
        for to in targets {
            trace!(target: "ed2k::server", %to, "udp search");
            let _ = ctx
                .sched
                .send_datagram(ctx.udp_socket, to, datagram.clone());
        }
    }

    // ---- source queries --------------------------------------------------

    /// Requests sources for every running download: 15 per packet, up to 5
    /// packets staggered over the next minutes.
    pub fn req_sources(&mut self, ctx: &mut Ctx<'_>) {
        if self.status != ServerStatus::Connected {
            ctx.timers.schedule_in(
                ctx.now,
                SOURCE_QUERY_TIME,
                TimerEvent::Server(ServerTimer::ReqSources),
            );
            return;
        }
        if self.last_source_request + SOURCE_QUERY_TIME > ctx.now
            && self.last_source_request != 0
        {
            trace!(target: "ed2k::server", "delaying source reask");
            return;
        }

        let ids = ctx.downloads.ids_rarest_first();
        let mut batch = Vec::new();
        let mut packets = 0usize;
        let mut in_batch = 0usize;
        for id in ids {
            let Some(d) = ctx.downloads.get(id) else {
                continue;
            };
            batch.extend_from_slice(&req_sources_frame(&d.hash(), d.part.size() as u32));
            in_batch += 1;
            if in_batch == SOURCES_PER_PACKET {
                self.dispatch_source_batch(ctx, std::mem::take(&mut batch), packets);
                in_batch = 0;
                packets += 1;
                if packets >= MAX_SOURCE_PACKETS {
                    break;
                }
            }
        }
        if in_batch > 0 && packets < MAX_SOURCE_PACKETS {
            self.dispatch_source_batch(ctx, batch, packets);
        }

        self.last_source_request = ctx.now;
        ctx.timers.schedule_in(
            ctx.now,
            SOURCE_QUERY_TIME,
            TimerEvent::Server(ServerTimer::ReqSources),
        );
    }

    fn dispatch_source_batch(&mut self, ctx: &mut Ctx<'_>, batch: Vec<u8>, index: usize) {
        if index == 0 {
            self.send(ctx, batch);
        } else {
            ctx.timers.schedule_in(
                ctx.now,
                index as u64 * SOURCE_BATCH_STAGGER,
                TimerEvent::Server(ServerTimer::SourceBatch(batch)),
            );
        }
    }

    // ---- timers ----------------------------------------------------------

    /// Handles a fired server timer.
    pub fn on_timer(&mut self, ctx: &mut Ctx<'_>, timer: ServerTimer) {
        match timer {
            ServerTimer::ConnRetry => {
                if self.socket.is_none() {
                    self.connect_any(ctx);
                }
            }
            ServerTimer::LoginTimeout => {
                if self.status == ServerStatus::Connecting
                    || self.status == ServerStatus::LoggingIn
                {
                    info!(target: "ed2k::server", "server login timed out");
                    self.on_session_failed(ctx);
                }
            }
            ServerTimer::PingKeepalive => {
                if self.status == ServerStatus::Connected {
                    trace!(target: "ed2k::server", "keep-alive offer ping");
                    let frame = offer_files_frame(&[], false);
                    self.send(ctx, frame);
                }
                ctx.timers.schedule_in(
                    ctx.now,
                    SERVER_PING_TIME,
                    TimerEvent::Server(ServerTimer::PingKeepalive),
                );
            }
            ServerTimer::ReqSources => self.req_sources(ctx),
            ServerTimer::SourceBatch(batch) => {
                if self.status == ServerStatus::Connected {
                    debug!(target: "ed2k::server", "sending staggered source batch");
                    self.send(ctx, batch);
                }
            }
            ServerTimer::QueryServer => self.query_next_server(ctx),
            ServerTimer::PingTimeout(addr) => self.on_ping_timeout(addr),
        }
    }

    // ---- UDP round-robin -------------------------------------------------

    /// Pings the server whose UDP query is the oldest, then schedules the
    /// next round.
    pub fn query_next_server(&mut self, ctx: &mut Ctx<'_>) {
        let Some(addr) = self
            .servers
            .values()
            .filter(|s| !s.addr.ip().is_unspecified() && s.addr.port() != 0)
            .min_by_key(|s| s.last_udp_query)
            .map(|s| s.addr)
        else {
            return;
        };
        let now = ctx.now;
        let last = self.servers[&addr].last_udp_query;
        if last + SERVER_QUERY_TIME > now && last != 0 {
            let delay = last + SERVER_QUERY_TIME - now;
            ctx.timers
                .schedule_in(now, delay, TimerEvent::Server(ServerTimer::QueryServer));
            return;
        }

        self.ping_server(ctx, addr);
        if let Some(s) = self.servers.get_mut(&addr) {
            s.last_udp_query = now;
        }

        // spread queries evenly across the pool within one interval
        let next = SERVER_QUERY_TIME / self.servers.len().max(1) as u64;
        ctx.timers
            .schedule_in(now, next.max(1000), TimerEvent::Server(ServerTimer::QueryServer));
    }

    fn ping_server(&mut self, ctx: &mut Ctx<'_>, addr: SocketAddrV4) {
        let challenge = 0x55aa_0000 | u32::from(rand::random::<u16>());
        let Some(s) = self.servers.get_mut(&addr) else {
            return;
        };
        s.ping_in_progress = true;
        s.challenge = challenge;
        let to = s.udp_addr();
        trace!(target: "ed2k::server", %to, "sending stat ping");
        let _ = ctx
            .sched
            .send_datagram(ctx.udp_socket, to, glob_stat_req_datagram(challenge));
        ctx.timers.schedule_in(
            ctx.now,
            PING_TIMEOUT,
            TimerEvent::Server(ServerTimer::PingTimeout(addr)),
        );
    }

    fn on_ping_timeout(&mut self, addr: SocketAddrV4) {
        if Some(addr) == self.current {
            return; // the live session speaks for itself
        }
        let Some(s) = self.servers.get_mut(&addr) else {
            return;
        };
        if !s.ping_in_progress {
            return;
        }
        s.ping_in_progress = false;
        s.failed_count += 1;
        if s.failed_count > 2 {
            trace!(target: "ed2k::server", %addr, "removing server after three ping timeouts");
            self.servers.remove(&addr);
        }
    }

    /// Handles a server datagram. `from` is the server's UDP endpoint.
    pub fn handle_udp(&mut self, ctx: &mut Ctx<'_>, from: SocketAddrV4, msg: &UdpMessage) {
        match msg {
            UdpMessage::GlobStatRes(stats) => self.on_stat_res(ctx, from, *stats),
            UdpMessage::GlobFoundSources(answers) => {
                for a in answers {
                    trace!(
                        target: "ed2k::globsrc",
                        count = a.sources.len(),
                        "sources via udp"
                    );
                    self.events.push(ServerEvent::FoundSources {
                        hash: a.hash,
                        sources: a.sources.clone(),
                    });
                }
            }
            UdpMessage::GlobSearchRes(p) => {
                self.events.push(ServerEvent::SearchResults(p.clone()));
            }
            _ => {}
        }
    }

    fn on_stat_res(&mut self, ctx: &mut Ctx<'_>, from: SocketAddrV4, stats: GlobStatRes) {
        // the reply comes from the UDP port; the pool is keyed by TCP
        let tcp_addr = SocketAddrV4::new(*from.ip(), from.port().saturating_sub(4));
        if !self.servers.contains_key(&tcp_addr) {
            trace!(target: "ed2k::server", %tcp_addr, "passively adding server");
            self.add_server(tcp_addr);
        }
        let now = ctx.now;
        {
            let Some(s) = self.servers.get_mut(&tcp_addr) else {
                return;
            };
            if s.challenge != 0 && stats.challenge != s.challenge {
                debug!(
                    target: "ed2k::server",
                    %tcp_addr,
                    "stat response with wrong challenge, ignored"
                );
                return;
            }
            if s.ping_in_progress {
                s.ping_in_progress = false;
                let rtt = now.saturating_sub(s.last_udp_query) as u32;
                s.ping = rtt;
                s.last_ping = rtt;
            }
            s.users = stats.users;
            s.files = stats.files;
            s.max_users = stats.max_users;
            s.soft_limit = stats.soft_limit;
            s.hard_limit = stats.hard_limit;
            s.udp_flags = stats.udp_flags;
            s.low_id_users = stats.low_id_users;
            s.failed_count = 0;
        }
        // a live server answered: ask it for sources while we are at it
        self.udp_get_sources(ctx, tcp_addr);
    }

    /// Sends a batched UDP source query to one server, within the 512-byte
    /// datagram cap.
    pub fn udp_get_sources(&mut self, ctx: &mut Ctx<'_>, addr: SocketAddrV4) {
        let Some(s) = self.servers.get(&addr) else {
            return;
        };
        let with_size = s.udp_flags & SRV_FL_GETSOURCES2 != 0;
        let many = s.udp_flags & SRV_FL_GETSOURCES != 0 || with_size;
        // 512-byte datagrams: 25 entries with sizes (2+25*20), 31 without
        let limit = if many {
            if with_size {
                25
            } else {
                31
            }
        } else {
            1
        };
        let to = s.udp_addr();

        let mut entries: Vec<(Hash16, u32)> = Vec::new();
        for id in ctx.downloads.ids_rarest_first() {
            if entries.len() >= limit {
                break;
            }
            if let Some(d) = ctx.downloads.get(id) {
                entries.push((d.hash(), d.part.size() as u32));
            }
        }
        if entries.is_empty() {
            return;
        }
        let datagram = glob_get_sources_datagram(&entries, with_size);
        debug_assert!(datagram.len() <= 512);
        trace!(
            target: "ed2k::globsrc",
            %to,
            hashes = entries.len(),
            with_size,
            "udp source query"
        );
        let _ = ctx.sched.send_datagram(ctx.udp_socket, to, datagram);
    }
}

fn bad_data(_: wire::WireError) -> std::io::Error {
    std::io::Error::from(std::io::ErrorKind::InvalidData)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(62, 241, 53, a), port)
    }

    #[test]
    fn server_met_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.met");
        let mut list = ServerList::new(true);
        list.add_server(addr(1, 4661));
        list.add_server(addr(2, 4242));
        {
            let s = list.servers.get_mut(&addr(1, 4661)).unwrap();
            s.name = "big bang".into();
            s.users = 12345;
            s.udp_flags = SRV_FL_GETSOURCES2;
            s.max_users = 100_000;
        }
        list.save_met(&path).unwrap();

        let mut fresh = ServerList::new(true);
        let added = fresh.load_met(&path).unwrap();
        assert_eq!(added, 2);
        let s = &fresh.servers[&addr(1, 4661)];
        assert_eq!(s.name, "big bang");
        assert_eq!(s.udp_flags, SRV_FL_GETSOURCES2);
        assert_eq!(s.max_users, 100_000);
        // users/files are volatile and not persisted
        assert_eq!(s.users, 0);
    }

    #[test]
    fn met_with_bad_version_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.met");
        std::fs::write(&path, [0x42u8, 0, 0, 0, 0]).unwrap();
        let mut list = ServerList::new(true);
        assert_eq!(list.load_met(&path).unwrap(), 0);
    }

    #[test]
    fn duplicate_entries_are_merged() {
        let mut list = ServerList::new(true);
        list.add_server(addr(1, 4661));
        list.add_server(addr(1, 4661));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn udp_addr_is_tcp_plus_four() {
        let s = Server::new(addr(1, 4661));
        assert_eq!(s.udp_addr().port(), 4665);
    }

    #[test]
    fn null_addresses_are_rejected() {
        let mut list = ServerList::new(true);
        list.add_server(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 4661));
        list.add_server(addr(1, 0));
        assert!(list.is_empty());
    }
}
