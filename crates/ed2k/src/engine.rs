//! Engine wiring.
//!
//! [`Ed2k`] owns the protocol state (sessions, servers, downloads, shared
//! files, credits) and pumps it from the main loop: scheduler events in,
//! frames and datagrams dispatched, timers fired, worker outcomes applied.
//! Components never reach each other through globals; everything passes
//! through the [`Ctx`] handle built fresh for each dispatch.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;

use crossbeam_channel::{unbounded, Receiver, Sender};
use partdata::{HashOutcome, Hasher, PartEvent};
use rustc_hash::FxHashMap;
use sched::{
    SchedBase, SockEvent, SocketId, TcpListenerTransport, TimerQueue, UdpTransport, WorkerHandle,
};
use tracing::{debug, info, warn};
use wire::Hash16;

use crate::client::{ClientKey, SOURCE_REASKTIME};
use crate::clientlist::{ClientList, ListEvent};
use crate::credits::CreditsDb;
use crate::download::DownloadList;
use crate::packets::{SearchResultPacket, UdpMessage};
use crate::serverlist::{ServerEvent, ServerList};
use crate::shared::{SharedFile, SharedFiles};
use crate::Identity;

/// Shared-file hash jobs use this id offset so they cannot collide with
/// part-file ids.
const SHARE_JOB_BASE: u64 = 1 << 32;

/// Interval for flushing part files and sidecars.
const SAVE_INTERVAL: u64 = 60_000;
/// Interval for persisting server.met.
const MET_SAVE_INTERVAL: u64 = 17 * 60 * 1000;

/// Per-session timers.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientTimer {
    /// Periodic source reask.
    Reask,
    /// Low-id callback never arrived.
    CallbackTimeout,
    /// UDP reask went unanswered.
    UdpTimeout,
    /// Re-establish a connection to a no-needed-parts source.
    Reconnect,
}

/// Server-list timers.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerTimer {
    /// Retry the TCP connection.
    ConnRetry,
    /// Login answer deadline.
    LoginTimeout,
    /// Empty OfferFiles keep-alive.
    PingKeepalive,
    /// Periodic TCP source queries.
    ReqSources,
    /// A staggered, pre-built ReqSources batch.
    SourceBatch(Vec<u8>),
    /// UDP round-robin stat query.
    QueryServer,
    /// A UDP ping went unanswered.
    PingTimeout(SocketAddrV4),
}

/// Everything the timer queue can fire.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerEvent {
    /// A session timer; dropped when the session is gone.
    Client(ClientKey, ClientTimer),
    /// A server-list timer.
    Server(ServerTimer),
    /// Flush part files.
    SaveParts,
    /// Persist server.met.
    SaveServers,
}

/// Borrowed context handed into every dispatch.
pub struct Ctx<'a> {
    /// The I/O scheduler.
    pub sched: &'a mut SchedBase,
    /// Our network identity.
    pub identity: &'a mut Identity,
    /// Download registry.
    pub downloads: &'a mut DownloadList,
    /// Shared-file catalog.
    pub shared: &'a mut SharedFiles,
    /// Credit database.
    pub credits: &'a mut CreditsDb,
    /// Engine timer queue.
    pub timers: &'a mut TimerQueue<TimerEvent>,
    /// The client UDP socket.
    pub udp_socket: SocketId,
    /// Endpoint of the connected server, if any.
    pub current_server: Option<SocketAddrV4>,
    /// Scheduler clock, milliseconds.
    pub now: u64,
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct Ed2kConfig {
    /// Nickname for handshakes.
    pub nick: String,
    /// TCP listen port.
    pub tcp_port: u16,
    /// UDP port.
    pub udp_port: u16,
    /// Directory for part files and sidecars.
    pub temp_dir: PathBuf,
    /// Directory completed files move into.
    pub incoming_dir: PathBuf,
    /// server.met location.
    pub server_met: PathBuf,
    /// RSA key location for secure identification.
    pub crypt_key: PathBuf,
    /// Simultaneous upload slots.
    pub upload_slots: usize,
    /// Whether to grow the server list from the network.
    pub find_servers: bool,
}

/// The eDonkey2000 module.
pub struct Ed2k {
    cfg: Ed2kConfig,
    /// Our identity; the id field tracks the server session.
    pub identity: Identity,
    /// Peer sessions.
    pub clients: ClientList,
    /// Server pool.
    pub servers: ServerList,
    /// Download registry.
    pub downloads: DownloadList,
    /// Shared files.
    pub shared: SharedFiles,
    /// Credits / SecIdent.
    pub credits: CreditsDb,
    /// Engine timers.
    pub timers: TimerQueue<TimerEvent>,
    listener: Option<SocketId>,
    udp: SocketId,
    worker: WorkerHandle,
    hash_tx: Sender<HashOutcome>,
    hash_rx: Receiver<HashOutcome>,
    alloc_tx: Sender<(u64, bool)>,
    alloc_rx: Receiver<(u64, bool)>,
    share_jobs: FxHashMap<u64, PathBuf>,
    next_share_job: u64,
    search_results: Vec<SearchResultPacket>,
    chat_log: Vec<String>,
}

impl Ed2k {
    /// Creates the module, binding the listen and UDP sockets.
    pub fn new(
        cfg: Ed2kConfig,
        sched: &mut SchedBase,
        worker: WorkerHandle,
    ) -> std::io::Result<Self> {
        let listener = TcpListenerTransport::bind(SocketAddr::from((
            Ipv4Addr::UNSPECIFIED,
            cfg.tcp_port,
        )))?;
        let udp = UdpTransport::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.udp_port)))?;
        let listener_id = sched.add_listener(Box::new(listener));
        let udp_id = sched.add_udp(Box::new(udp));
        Self::with_sockets(cfg, Some(listener_id), udp_id, worker)
    }

    /// Creates the module around pre-registered sockets (tests inject
    /// in-memory transports here).
    pub fn with_sockets(
        cfg: Ed2kConfig,
        listener: Option<SocketId>,
        udp: SocketId,
        worker: WorkerHandle,
    ) -> std::io::Result<Self> {
        let credits = CreditsDb::load_or_generate(&cfg.crypt_key)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let identity = Identity {
            user_hash: new_user_hash(),
            nick: cfg.nick.clone(),
            tcp_port: cfg.tcp_port,
            udp_port: cfg.udp_port,
            id: 0,
        };
        let (hash_tx, hash_rx) = unbounded();
        let (alloc_tx, alloc_rx) = unbounded();
        Ok(Self {
            clients: ClientList::new(cfg.upload_slots),
            servers: ServerList::new(cfg.find_servers),
            downloads: DownloadList::new(),
            shared: SharedFiles::new(),
            credits,
            timers: TimerQueue::new(),
            identity,
            listener,
            udp,
            worker,
            hash_tx,
            hash_rx,
            alloc_tx,
            alloc_rx,
            share_jobs: FxHashMap::default(),
            next_share_job: SHARE_JOB_BASE,
            search_results: Vec::new(),
            chat_log: Vec::new(),
            cfg,
        })
    }

    /// Restores state and starts the periodic machinery. Call once before
    /// the first tick.
    pub fn start(&mut self, sched: &mut SchedBase, now: u64) {
        if self.servers.load_met(&self.cfg.server_met).is_err() {
            debug!(target: "ed2k", "no server.met yet");
        }
        self.restore_part_files();
        {
            let mut ctx = Self::make_ctx(
                sched,
                &mut self.identity,
                &mut self.downloads,
                &mut self.shared,
                &mut self.credits,
                &mut self.timers,
                self.udp,
                self.servers.current_server(),
                now,
            );
            self.servers.connect_any(&mut ctx);
            self.servers.query_next_server(&mut ctx);
        }
        self.timers
            .schedule_in(now, SAVE_INTERVAL, TimerEvent::SaveParts);
        self.timers
            .schedule_in(now, MET_SAVE_INTERVAL, TimerEvent::SaveServers);
    }

    fn restore_part_files(&mut self) {
        let Ok(entries) = std::fs::read_dir(&self.cfg.temp_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            let Some(name) = name else { continue };
            if !name.ends_with(".dat") {
                continue;
            }
            match partdata::load_dat(0, &path) {
                Ok(part) => {
                    let hash = part
                        .hash_sets()
                        .iter()
                        .find_map(|hs| hs.file_hash)
                        .unwrap_or([0; 16]);
                    let name = part.name();
                    let size = part.size();
                    let location = part.location().to_path_buf();
                    let id = self.downloads.adopt(hash, part);
                    info!(target: "ed2k", id, %name, "restored download");
                    if hash != [0; 16] {
                        // a partial file is shared under its final name
                        self.shared.insert(SharedFile {
                            hash,
                            name,
                            size,
                            path: location,
                            download: Some(id),
                            hash_set: None,
                        });
                    }
                }
                Err(e) => {
                    warn!(target: "ed2k", path = %path.display(), error = %e, "sidecar rejected");
                }
            }
        }
    }

    /// Collected search results (drained by the shell surface).
    pub fn take_search_results(&mut self) -> Vec<SearchResultPacket> {
        std::mem::take(&mut self.search_results)
    }

    /// Collected chat lines (drained by the shell surface).
    pub fn take_chat(&mut self) -> Vec<String> {
        std::mem::take(&mut self.chat_log)
    }

    /// Starts a download.
    pub fn start_download(
        &mut self,
        hash: Hash16,
        size: u64,
        name: &str,
    ) -> Result<u64, partdata::PartError> {
        let dest = self.cfg.incoming_dir.join(name);
        let id = self
            .downloads
            .create(hash, size, &self.cfg.temp_dir, &dest)?;
        // partial files are immediately shared
        let d = self.downloads.get(id).expect("just created");
        self.shared.insert(SharedFile {
            hash,
            name: name.to_owned(),
            size,
            path: d.part.location().to_path_buf(),
            download: Some(id),
            hash_set: None,
        });
        Ok(id)
    }

    /// Hashes and shares a complete local file on the worker pool.
    pub fn share_path(&mut self, path: PathBuf) {
        let job_id = self.next_share_job;
        self.next_share_job += 1;
        self.share_jobs.insert(job_id, path.clone());
        let size = std::fs::metadata(&path).map_or(0, |m| m.len());
        let hasher = Hasher::new(self.hash_tx.clone());
        let job = partdata::HashJob {
            part: job_id,
            path,
            kind: partdata::HashJobKind::Full { size },
        };
        self.worker.submit(move || hasher.run(&job));
    }

    #[allow(clippy::too_many_arguments)]
    fn make_ctx<'a>(
        sched: &'a mut SchedBase,
        identity: &'a mut Identity,
        downloads: &'a mut DownloadList,
        shared: &'a mut SharedFiles,
        credits: &'a mut CreditsDb,
        timers: &'a mut TimerQueue<TimerEvent>,
        udp_socket: SocketId,
        current_server: Option<SocketAddrV4>,
        now: u64,
    ) -> Ctx<'a> {
        Ctx {
            sched,
            identity,
            downloads,
            shared,
            credits,
            timers,
            udp_socket,
            current_server,
            now,
        }
    }

    /// One pump pass: timers, scheduler events, worker outcomes, part
    /// events, registry maintenance. Call after every scheduler tick.
    pub fn tick(&mut self, sched: &mut SchedBase, now: u64) {
        self.fire_timers(sched, now);
        self.pump_sched_events(sched, now);
        let newly_shared = self.pump_worker_outcomes();
        for hash in newly_shared {
            let current = self.servers.current_server();
            let mut ctx = Self::make_ctx(
                sched,
                &mut self.identity,
                &mut self.downloads,
                &mut self.shared,
                &mut self.credits,
                &mut self.timers,
                self.udp,
                current,
                now,
            );
            self.servers.publish_file(&mut ctx, &hash);
        }
        self.pump_part_events(sched, now);
        self.apply_list_events(sched, now);
        let current = self.servers.current_server();
        let mut ctx = Self::make_ctx(
            sched,
            &mut self.identity,
            &mut self.downloads,
            &mut self.shared,
            &mut self.credits,
            &mut self.timers,
            self.udp,
            current,
            now,
        );
        self.clients.tick(&mut ctx);
    }

    fn fire_timers(&mut self, sched: &mut SchedBase, now: u64) {
        for event in self.timers.pop_due(now) {
            let current = self.servers.current_server();
            match event {
                TimerEvent::Client(key, timer) => {
                    let mut ctx = Self::make_ctx(
                        sched,
                        &mut self.identity,
                        &mut self.downloads,
                        &mut self.shared,
                        &mut self.credits,
                        &mut self.timers,
                        self.udp,
                        current,
                        now,
                    );
                    self.clients.handle_timer(&mut ctx, key, timer);
                }
                TimerEvent::Server(timer) => {
                    let mut ctx = Self::make_ctx(
                        sched,
                        &mut self.identity,
                        &mut self.downloads,
                        &mut self.shared,
                        &mut self.credits,
                        &mut self.timers,
                        self.udp,
                        current,
                        now,
                    );
                    self.servers.on_timer(&mut ctx, timer);
                }
                TimerEvent::SaveParts => {
                    for d in self.downloads.iter_mut() {
                        d.part.save();
                    }
                    self.timers
                        .schedule_in(now, SAVE_INTERVAL, TimerEvent::SaveParts);
                }
                TimerEvent::SaveServers => {
                    if let Err(e) = self.servers.save_met(&self.cfg.server_met) {
                        warn!(target: "ed2k::server", error = %e, "saving server.met");
                    }
                    self.timers
                        .schedule_in(now, MET_SAVE_INTERVAL, TimerEvent::SaveServers);
                }
            }
        }
    }

    fn pump_sched_events(&mut self, sched: &mut SchedBase, now: u64) {
        for (socket, evt) in sched.poll_events() {
            let current = self.servers.current_server();
            if Some(socket) == self.listener {
                if evt == SockEvent::Accept {
                    self.accept_pending(sched, now);
                }
                continue;
            }
            if socket == self.udp {
                if evt == SockEvent::Read {
                    self.drain_datagrams(sched, now);
                }
                continue;
            }
            if Some(socket) == self.servers.socket() {
                let mut ctx = Self::make_ctx(
                    sched,
                    &mut self.identity,
                    &mut self.downloads,
                    &mut self.shared,
                    &mut self.credits,
                    &mut self.timers,
                    self.udp,
                    current,
                    now,
                );
                self.servers.handle_sock_event(&mut ctx, evt);
                continue;
            }
            let mut ctx = Self::make_ctx(
                sched,
                &mut self.identity,
                &mut self.downloads,
                &mut self.shared,
                &mut self.credits,
                &mut self.timers,
                self.udp,
                current,
                now,
            );
            self.clients.handle_sock_event(&mut ctx, socket, evt);
        }
    }

    fn accept_pending(&mut self, sched: &mut SchedBase, now: u64) {
        let Some(listener) = self.listener else { return };
        while let Ok(Some((transport, peer))) = sched.accept(listener) {
            let socket = sched.add_stream(transport, None);
            let current = self.servers.current_server();
            let mut ctx = Self::make_ctx(
                sched,
                &mut self.identity,
                &mut self.downloads,
                &mut self.shared,
                &mut self.credits,
                &mut self.timers,
                self.udp,
                current,
                now,
            );
            self.clients.add_incoming(&mut ctx, socket, peer);
        }
    }

    fn drain_datagrams(&mut self, sched: &mut SchedBase, now: u64) {
        while let Ok(Some((from, data))) = sched.recv_datagram(self.udp) {
            let msg = match UdpMessage::decode(&data) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(target: "ed2k", %from, error = %e, "bad datagram");
                    continue;
                }
            };
            let current = self.servers.current_server();
            let mut ctx = Self::make_ctx(
                sched,
                &mut self.identity,
                &mut self.downloads,
                &mut self.shared,
                &mut self.credits,
                &mut self.timers,
                self.udp,
                current,
                now,
            );
            match &msg {
                UdpMessage::GlobStatRes(_)
                | UdpMessage::GlobFoundSources(_)
                | UdpMessage::GlobSearchRes(_) => {
                    self.servers.handle_udp(&mut ctx, from, &msg);
                }
                _ => {
                    self.clients.handle_udp(&mut ctx, from, &msg);
                }
            }
        }
    }

    /// Applies queued hash/alloc outcomes; returns hashes of files that
    /// just became shared (for server publication).
    fn pump_worker_outcomes(&mut self) -> Vec<Hash16> {
        let mut newly_shared = Vec::new();
        let outcomes: Vec<HashOutcome> = self.hash_rx.try_iter().collect();
        for outcome in outcomes {
            let part_id = match &outcome {
                HashOutcome::ChunkVerified { part, .. }
                | HashOutcome::ChunkFailed { part, .. }
                | HashOutcome::FullDone { part, .. }
                | HashOutcome::Fatal { part, .. } => *part,
            };
            if part_id >= SHARE_JOB_BASE {
                if let Some(hash) = self.finish_share_job(part_id, &outcome) {
                    newly_shared.push(hash);
                }
                continue;
            }
            if let Some(d) = self.downloads.get_mut(part_id) {
                d.part.on_hash_outcome(&outcome);
            }
        }
        let allocs: Vec<(u64, bool)> = self.alloc_rx.try_iter().collect();
        for (part_id, ok) in allocs {
            if let Some(d) = self.downloads.get_mut(part_id) {
                d.part.on_alloc_done(ok);
            }
        }
        newly_shared
    }

    fn finish_share_job(&mut self, job_id: u64, outcome: &HashOutcome) -> Option<Hash16> {
        let path = self.share_jobs.remove(&job_id)?;
        let HashOutcome::FullDone { hashes, size, .. } = outcome else {
            warn!(target: "ed2k", path = %path.display(), "hashing shared file failed");
            return None;
        };
        let hash = hashes.file_hash?;
        let name = path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        info!(target: "ed2k", %name, "file shared");
        self.shared.insert(SharedFile {
            hash,
            name,
            size: *size,
            path,
            download: None,
            hash_set: Some(hashes.clone()),
        });
        Some(hash)
    }

    fn pump_part_events(&mut self, sched: &mut SchedBase, now: u64) {
        // collect jobs and events first; reacting needs the registry
        let mut jobs = Vec::new();
        let mut allocs = Vec::new();
        let mut completed = Vec::new();
        for d in self.downloads.iter_mut() {
            jobs.extend(d.part.take_hash_jobs());
            if let Some(req) = d.part.take_alloc_request() {
                allocs.push((d.part.id(), req));
            }
            for evt in d.part.poll_events() {
                match evt {
                    PartEvent::Completed => completed.push(d.part.id()),
                    PartEvent::Corruption(range) => {
                        warn!(
                            target: "ed2k",
                            id = d.part.id(),
                            begin = range.begin(),
                            end = range.end(),
                            "corruption detected, ranges re-queued"
                        );
                    }
                    PartEvent::AllocFailed => {
                        warn!(target: "ed2k", id = d.part.id(), "disk full, download auto-paused");
                    }
                    _ => {}
                }
            }
        }
        for job in jobs {
            let hasher = Hasher::new(self.hash_tx.clone());
            self.worker.submit(move || hasher.run(&job));
        }
        for (id, req) in allocs {
            let tx = self.alloc_tx.clone();
            self.worker.submit(move || {
                let ok = partdata::run_alloc_job(&req);
                let _ = tx.send((id, ok));
            });
        }
        for id in completed {
            self.finish_download(sched, now, id);
        }
    }

    fn finish_download(&mut self, sched: &mut SchedBase, now: u64, id: u64) {
        let Some(d) = self.downloads.remove(id) else {
            return;
        };
        let hash = d.hash();
        info!(target: "ed2k", id, name = %d.part.name(), "download finished");
        if let Some(sf) = self.shared.find_mut(&hash) {
            sf.path = d.part.destination().to_path_buf();
            sf.download = None;
        }
        let current = self.servers.current_server();
        let mut ctx = Self::make_ctx(
            sched,
            &mut self.identity,
            &mut self.downloads,
            &mut self.shared,
            &mut self.credits,
            &mut self.timers,
            self.udp,
            current,
            now,
        );
        self.servers.publish_file(&mut ctx, &hash);
    }

    fn apply_list_events(&mut self, sched: &mut SchedBase, now: u64) {
        for event in self.servers.take_events() {
            let current = self.servers.current_server();
            let mut ctx = Self::make_ctx(
                sched,
                &mut self.identity,
                &mut self.downloads,
                &mut self.shared,
                &mut self.credits,
                &mut self.timers,
                self.udp,
                current,
                now,
            );
            match event {
                ServerEvent::FoundSources { hash, sources } => {
                    let Some(download) = ctx.downloads.find(&hash) else {
                        continue;
                    };
                    let server = current;
                    for (id, port) in sources {
                        self.clients
                            .add_source(&mut ctx, download, id, port, server, true);
                    }
                }
                ServerEvent::Callback(addr) => {
                    self.clients.handle_callback(&mut ctx, addr);
                }
                ServerEvent::SearchResults(results) => {
                    self.search_results.push(results);
                }
                ServerEvent::IdChanged(id) => {
                    debug!(target: "ed2k", id, "client id updated");
                    // sources queued on the old id force TCP reasks by
                    // themselves; nothing to do here
                }
            }
        }
        for event in self.clients.take_events() {
            let current = self.servers.current_server();
            let mut ctx = Self::make_ctx(
                sched,
                &mut self.identity,
                &mut self.downloads,
                &mut self.shared,
                &mut self.credits,
                &mut self.timers,
                self.udp,
                current,
                now,
            );
            match event {
                ListEvent::ReqCallback(id) => self.servers.req_callback(&mut ctx, id),
                ListEvent::FoundServer(addr) => self.servers.add_server(addr),
                ListEvent::ChatMessage(line) => {
                    info!(target: "ed2k", "{line}");
                    self.chat_log.push(line);
                }
            }
        }
    }

    /// Schedules the first reask for a fresh source (used when a download
    /// is added while its sources are already known).
    pub fn schedule_reask(&mut self, key: ClientKey, now: u64) {
        self.timers.schedule_in(
            now,
            SOURCE_REASKTIME,
            TimerEvent::Client(key, ClientTimer::Reask),
        );
    }
}

/// Generates a fresh user hash with the eMule compatibility marker bytes.
#[must_use]
pub fn new_user_hash() -> Hash16 {
    let mut hash: Hash16 = rand::random();
    hash[5] = 14;
    hash[14] = 111;
    hash
}
