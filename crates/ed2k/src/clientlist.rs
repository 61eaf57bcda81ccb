//! Session registry and upload queue.
//!
//! Owns every [`Client`], routes scheduler events, datagrams and timers to
//! the right session, applies the [`Action`]s sessions emit, and manages
//! the upload queue: waiting peers are ranked by effective wait time
//! (stretched by their credit modifier) and promoted into free slots.

use std::net::SocketAddrV4;

use rustc_hash::FxHashMap;
use sched::{SockEvent, SocketId};
use tracing::{debug, trace};
use wire::Hash16;

use crate::client::{Action, Client, ClientKey};
use crate::engine::{ClientTimer, Ctx};
use crate::{ip_to_id, is_low_id};

/// Queue entries with no reask inside this window are dropped; majors do
/// the same at the one-hour mark.
const QUEUE_STALE_MS: u64 = 60 * 60 * 1000;

/// Effects the registry cannot apply itself and hands to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListEvent {
    /// A session wants a server-relayed callback to this id.
    ReqCallback(u32),
    /// Source exchange mentioned a server worth knowing.
    FoundServer(SocketAddrV4),
    /// Chat text for the shell/GUI surface.
    ChatMessage(String),
}

/// All peer sessions plus the upload queue.
pub struct ClientList {
    next_key: ClientKey,
    clients: FxHashMap<ClientKey, Client>,
    by_socket: FxHashMap<SocketId, ClientKey>,
    upload_slots: usize,
    uploading: Vec<ClientKey>,
    events: Vec<ListEvent>,
}

impl ClientList {
    /// Creates a registry granting `upload_slots` simultaneous uploads.
    #[must_use]
    pub fn new(upload_slots: usize) -> Self {
        Self {
            next_key: 1,
            clients: FxHashMap::default(),
            by_socket: FxHashMap::default(),
            upload_slots: upload_slots.max(1),
            uploading: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true when no sessions exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Sessions currently holding an upload slot.
    #[must_use]
    pub fn uploading_count(&self) -> usize {
        self.uploading.len()
    }

    /// Borrows a session.
    #[must_use]
    pub fn get(&self, key: ClientKey) -> Option<&Client> {
        self.clients.get(&key)
    }

    /// Iterates over all sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    /// Drains events for the engine.
    pub fn take_events(&mut self) -> Vec<ListEvent> {
        std::mem::take(&mut self.events)
    }

    fn alloc_key(&mut self) -> ClientKey {
        let k = self.next_key;
        self.next_key += 1;
        k
    }

    fn find_by_endpoint(&self, id: u32, tcp_port: u16) -> Option<ClientKey> {
        self.clients
            .values()
            .find(|c| c.id() == id && c.tcp_port() == tcp_port)
            .map(Client::key)
    }

    fn find_by_udp(&self, from: SocketAddrV4) -> Option<ClientKey> {
        let id = ip_to_id(*from.ip());
        self.clients
            .values()
            .find(|c| c.id() == id && c.udp_port() == from.port())
            .map(Client::key)
    }

    /// Adds (or refreshes) a source for a download. Returns false when the
    /// endpoint was already known for that file.
    pub fn add_source(
        &mut self,
        ctx: &mut Ctx<'_>,
        download: u64,
        id: u32,
        tcp_port: u16,
        server: Option<SocketAddrV4>,
        connect: bool,
    ) -> bool {
        if id == 0 || tcp_port == 0 {
            return false;
        }
        if let Some(key) = self.find_by_endpoint(id, tcp_port) {
            let known = self
                .clients
                .get(&key)
                .and_then(Client::source_info)
                .map_or(false, |_| true);
            if let Some(client) = self.clients.get_mut(&key) {
                client.add_offered(ctx, download, false);
            }
            self.after_dispatch(ctx, key);
            return !known;
        }
        if !is_low_id(id) {
            if let Some(d) = ctx.downloads.get_mut(download) {
                d.remember_source(
                    SocketAddrV4::new(crate::id_to_ip(id), tcp_port),
                    server,
                );
            }
        }
        let key = self.alloc_key();
        trace!(target: "ed2k::client", key, id, tcp_port, "new source session");
        let mut client = Client::new_outgoing(key, id, tcp_port);
        client.add_offered(ctx, download, connect);
        self.insert(ctx, client);
        true
    }

    fn insert(&mut self, ctx: &mut Ctx<'_>, client: Client) {
        let key = client.key();
        if let Some(sock) = client.socket() {
            self.by_socket.insert(sock, key);
        }
        self.clients.insert(key, client);
        self.after_dispatch(ctx, key);
    }

    /// Registers an accepted incoming connection.
    pub fn add_incoming(&mut self, ctx: &mut Ctx<'_>, socket: SocketId, peer: SocketAddrV4) {
        let key = self.alloc_key();
        trace!(target: "ed2k::client", key, %peer, "incoming connection");
        let client = Client::new_incoming(key, socket, peer);
        self.by_socket.insert(socket, key);
        self.clients.insert(key, client);
    }

    /// Routes one scheduler event.
    pub fn handle_sock_event(&mut self, ctx: &mut Ctx<'_>, socket: SocketId, evt: SockEvent) {
        let Some(key) = self.by_socket.get(&socket).copied() else {
            return; // stale event for a removed socket
        };
        if let Some(client) = self.clients.get_mut(&key) {
            client.on_sock_event(ctx, evt);
        }
        self.after_dispatch(ctx, key);
    }

    /// Routes a client-to-client datagram, creating a passive session for
    /// unknown reasking peers.
    pub fn handle_udp(
        &mut self,
        ctx: &mut Ctx<'_>,
        from: SocketAddrV4,
        msg: &crate::packets::UdpMessage,
    ) {
        let key = match self.find_by_udp(from) {
            Some(key) => key,
            None => {
                let key = self.alloc_key();
                trace!(target: "ed2k::client", key, %from, "session for unknown udp peer");
                let mut client = Client::new_outgoing(key, ip_to_id(*from.ip()), 0);
                client.set_udp_port(from.port());
                self.clients.insert(key, client);
                key
            }
        };
        if let Some(client) = self.clients.get_mut(&key) {
            client.on_udp(ctx, msg);
        }
        self.after_dispatch(ctx, key);
    }

    /// Routes a fired session timer.
    pub fn handle_timer(&mut self, ctx: &mut Ctx<'_>, key: ClientKey, timer: ClientTimer) {
        if let Some(client) = self.clients.get_mut(&key) {
            client.on_timer(ctx, timer);
        }
        self.after_dispatch(ctx, key);
    }

    /// A server relayed a callback: connect the addr and merge with the
    /// placeholder session once the peer identifies itself.
    pub fn handle_callback(&mut self, ctx: &mut Ctx<'_>, addr: SocketAddrV4) {
        let sock = ctx.sched.add_stream_pending(None);
        if ctx
            .sched
            .connect(sock, addr, crate::client::CONNECT_TIMEOUT)
            .is_err()
        {
            ctx.sched.del_socket(sock);
            return;
        }
        let key = self.alloc_key();
        trace!(target: "ed2k::client", key, %addr, "connecting callback address");
        let mut client = Client::new_outgoing(key, ip_to_id(*addr.ip()), addr.port());
        client.adopt_pending_socket(sock);
        self.by_socket.insert(sock, key);
        self.clients.insert(key, client);
    }

    /// Applies queued actions, then reaps dead sessions. Applying one
    /// action can make another session emit more (a promotion, say), so
    /// this drains everyone, bounded against ping-pong.
    fn after_dispatch(&mut self, ctx: &mut Ctx<'_>, key: ClientKey) {
        let mut pending = match self.clients.get_mut(&key) {
            Some(c) => c.take_actions(),
            None => Vec::new(),
        };
        let mut rounds = 0;
        while !pending.is_empty() && rounds < 4 {
            for action in pending.drain(..) {
                self.apply_action(ctx, action);
            }
            for client in self.clients.values_mut() {
                pending.extend(client.take_actions());
            }
            rounds += 1;
        }
        self.reap(ctx);
    }

    fn apply_action(&mut self, ctx: &mut Ctx<'_>, action: Action) {
        match action {
            Action::ReqCallback(id) => self.events.push(ListEvent::ReqCallback(id)),
            Action::FoundServer(addr) => self.events.push(ListEvent::FoundServer(addr)),
            Action::ChatMessage { key, text } => {
                let from = self
                    .clients
                    .get(&key)
                    .map_or_else(String::new, |c| format!("{}:{}", c.id(), c.tcp_port()));
                self.events.push(ListEvent::ChatMessage(format!("{from}: {text}")));
            }
            Action::FoundSource { hash, addr, server } => {
                self.found_source(ctx, hash, addr, server);
            }
            Action::QueueUpload(key) => self.queue_upload(ctx, key),
            Action::CancelUpload(key) => self.cancel_upload(ctx, key),
            Action::IdChanged { key, new_id } => self.change_id(ctx, key, new_id),
        }
    }

    fn found_source(
        &mut self,
        ctx: &mut Ctx<'_>,
        hash: Hash16,
        addr: SocketAddrV4,
        server: Option<SocketAddrV4>,
    ) {
        let Some(download) = ctx.downloads.find(&hash) else {
            return;
        };
        self.add_source(ctx, download, ip_to_id(*addr.ip()), addr.port(), server, true);
    }

    /// Peers queued for an upload slot, best-ranked first. Wait time is
    /// stretched by the credit modifier.
    fn queue_order(&self, ctx: &Ctx<'_>) -> Vec<ClientKey> {
        let mut waiting: Vec<(f64, ClientKey)> = self
            .clients
            .values()
            .filter(|c| c.queue_info().is_some() && c.upload_info().is_none() && !c.is_dead())
            .map(|c| {
                let waited =
                    ctx.now.saturating_sub(c.queue_info().expect("filtered").enqueued_at());
                let modifier = c
                    .user_pub_key()
                    .and_then(|k| ctx.credits.find(k))
                    .map_or(1.0, |rec| rec.modifier());
                (f64::from(modifier) * waited as f64, c.key())
            })
            .collect();
        waiting.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        waiting.into_iter().map(|(_, k)| k).collect()
    }

    fn queue_upload(&mut self, ctx: &mut Ctx<'_>, key: ClientKey) {
        self.promote(ctx);
        // not promoted: tell the peer its rank
        if self.clients.get(&key).map_or(false, |c| {
            c.queue_info().is_some() && c.upload_info().is_none()
        }) {
            let order = self.queue_order(ctx);
            let qr = order.iter().position(|k| *k == key).map_or(0, |p| p + 1) as u32;
            if let Some(client) = self.clients.get_mut(&key) {
                client.send_queue_rank(ctx, qr);
            }
        }
    }

    fn cancel_upload(&mut self, ctx: &mut Ctx<'_>, key: ClientKey) {
        self.uploading.retain(|k| *k != key);
        self.promote(ctx);
    }

    fn promote(&mut self, ctx: &mut Ctx<'_>) {
        self.uploading.retain(|k| {
            self.clients
                .get(k)
                .map_or(false, |c| c.upload_info().is_some() && !c.is_dead())
        });
        while self.uploading.len() < self.upload_slots {
            let order = self.queue_order(ctx);
            let Some(next) = order.first().copied() else {
                break;
            };
            debug!(target: "ed2k::client", key = next, "promoting to upload slot");
            self.uploading.push(next);
            if let Some(client) = self.clients.get_mut(&next) {
                client.start_upload(ctx);
            }
        }
    }

    fn change_id(&mut self, ctx: &mut Ctx<'_>, key: ClientKey, new_id: u32) {
        let Some(client) = self.clients.get(&key) else {
            return;
        };
        let tcp_port = client.tcp_port();
        let other = self
            .find_by_endpoint(new_id, tcp_port)
            .filter(|other| *other != key);
        match other {
            Some(existing) => {
                // the peer already has a session (typically the callback
                // placeholder); fold this one into it
                debug!(
                    target: "ed2k::client",
                    key,
                    into = existing,
                    "merging duplicate sessions"
                );
                let Some(absorbed) = self.clients.remove(&key) else {
                    return;
                };
                if let Some(sock) = absorbed.socket() {
                    self.by_socket.insert(sock, existing);
                }
                self.uploading.retain(|k| *k != key);
                if let Some(target) = self.clients.get_mut(&existing) {
                    target.merge(absorbed);
                    // a merged connection completes a pending callback;
                    // restart the transfer machinery on the survivor
                    if target.is_connected() {
                        target.start_transfers(ctx);
                    }
                }
            }
            None => {
                if let Some(client) = self.clients.get_mut(&key) {
                    client.set_id(new_id);
                }
            }
        }
    }

    /// Periodic maintenance: refresh ranks, drop stale queue entries,
    /// promote into free slots.
    pub fn tick(&mut self, ctx: &mut Ctx<'_>) {
        let stale: Vec<ClientKey> = self
            .clients
            .values()
            .filter(|c| {
                c.queue_info().map_or(false, |q| {
                    ctx.now.saturating_sub(q.last_queue_reask) > QUEUE_STALE_MS
                })
            })
            .map(Client::key)
            .collect();
        for key in stale {
            trace!(target: "ed2k::client", key, "dropping stale queue entry");
            if let Some(client) = self.clients.get_mut(&key) {
                client.drop_queue_entry(ctx);
            }
            self.after_dispatch(ctx, key);
        }
        self.promote(ctx);
        let order = self.queue_order(ctx);
        for (pos, key) in order.iter().enumerate() {
            if let Some(client) = self.clients.get_mut(key) {
                client.store_queue_rank(pos as u32 + 1);
            }
        }
        self.reap(ctx);
    }

    fn reap(&mut self, _ctx: &mut Ctx<'_>) {
        let dead: Vec<ClientKey> = self
            .clients
            .values()
            .filter(|c| c.is_dead())
            .map(Client::key)
            .collect();
        for key in dead {
            if let Some(client) = self.clients.remove(&key) {
                if let Some(sock) = client.socket() {
                    self.by_socket.remove(&sock);
                }
            }
            self.uploading.retain(|k| *k != key);
        }
        self.by_socket.retain(|_, key| self.clients.contains_key(key));
    }
}
