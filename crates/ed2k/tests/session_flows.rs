//! Peer-session and server-list flows driven over in-memory transports:
//! the concurrent upload/download interleaving, the low-id callback merge,
//! UDP source acquisition, and compressed chunk reassembly.

use std::cell::RefCell;
use std::io::Write as _;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;

use ed2k::client::{Client, ClientKey};
use ed2k::clientlist::{ClientList, ListEvent};
use ed2k::engine::{ClientTimer, Ctx, TimerEvent};
use ed2k::opcodes::*;
use ed2k::packets::*;
use ed2k::serverlist::{ServerEvent, ServerList};
use ed2k::shared::{SharedFile, SharedFiles};
use ed2k::{download::DownloadList, ip_to_id, Identity};
use partdata::ED2K_PARTSIZE;
use rangelist::Range;
use sched::{
    memory_pair, MemDatagram, MemTransport, SchedBase, SchedConfig, SockEvent, TimerQueue,
    Transport, WorkerPool,
};
use wire::{zlib_pack, Frame, FrameReader, Hash16};

const HASH_A: Hash16 = [0xaa; 16];
const HASH_B: Hash16 = [0xbb; 16];

fn our_addr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(80, 1, 1, 1), 4662)
}

fn server_addr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(44, 1, 1, 1), 4661)
}

struct World {
    sched: SchedBase,
    _pool: WorkerPool,
    identity: Identity,
    downloads: DownloadList,
    shared: SharedFiles,
    credits: ed2k::credits::CreditsDb,
    timers: TimerQueue<TimerEvent>,
    udp: sched::SocketId,
    udp_sent: Rc<RefCell<Vec<(Vec<u8>, SocketAddrV4)>>>,
    now: u64,
    dir: tempfile::TempDir,
}

impl World {
    fn new() -> Self {
        let pool = WorkerPool::new(1);
        let mut sched = SchedBase::new(SchedConfig::default(), pool.handle());
        let dg = MemDatagram::default();
        let udp_sent = Rc::clone(&dg.sent);
        let udp = sched.add_udp(Box::new(dg));
        Self {
            sched,
            _pool: pool,
            identity: Identity {
                user_hash: [0x11; 16],
                nick: "tester".into(),
                tcp_port: 4662,
                udp_port: 4672,
                id: ip_to_id(*our_addr().ip()),
            },
            downloads: DownloadList::new(),
            shared: SharedFiles::new(),
            credits: ed2k::credits::CreditsDb::generate().expect("key"),
            timers: TimerQueue::new(),
            udp,
            udp_sent,
            now: 1_000,
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    fn ctx(&mut self) -> Ctx<'_> {
        Ctx {
            sched: &mut self.sched,
            identity: &mut self.identity,
            downloads: &mut self.downloads,
            shared: &mut self.shared,
            credits: &mut self.credits,
            timers: &mut self.timers,
            udp_socket: self.udp,
            current_server: Some(server_addr()),
            now: self.now,
        }
    }

    fn pump(&mut self) {
        self.now += 100;
        self.sched.tick(self.now);
    }

    /// Our download of `hash`, sized `size`.
    fn add_download(&mut self, hash: Hash16, size: u64) -> u64 {
        let dest = self.dir.path().join("incoming").join("a.bin");
        self.downloads
            .create(hash, size, self.dir.path(), &dest)
            .expect("download")
    }

    /// A complete local file the peer can fetch.
    fn add_shared(&mut self, hash: Hash16, bytes: &[u8]) {
        let path = self.dir.path().join("shared.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(bytes)
            .unwrap();
        self.shared.insert(SharedFile {
            hash,
            name: "shared.bin".into(),
            size: bytes.len() as u64,
            path,
            download: None,
            hash_set: None,
        });
    }

    /// A connected session plus the remote end of its pipe.
    fn incoming_client(&mut self, key: ClientKey, peer: SocketAddrV4) -> (Client, PeerEnd) {
        let (near, far) = memory_pair(our_addr(), peer);
        let sock = self.sched.add_stream(Box::new(near), None);
        let client = Client::new_incoming(key, sock, peer);
        (
            client,
            PeerEnd {
                transport: far,
                frames: FrameReader::new(),
            },
        )
    }
}

struct PeerEnd {
    transport: MemTransport,
    frames: FrameReader,
}

impl PeerEnd {
    /// Everything the session has sent since the last call.
    fn recv(&mut self) -> Vec<Frame> {
        let mut buf = [0u8; 16384];
        loop {
            match self.transport.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => self.frames.feed(&buf[..n]),
            }
        }
        let mut out = Vec::new();
        while let Some(frame) = self.frames.next_frame().expect("well-formed frames") {
            out.push(frame);
        }
        out
    }

    fn opcodes(&mut self) -> Vec<u8> {
        self.recv().iter().map(|f| f.opcode).collect()
    }
}

/// Feeds raw frame bytes through the scheduler into the session.
fn deliver(world: &mut World, client: &mut Client, peer: &mut PeerEnd, bytes: &[u8]) {
    peer.transport.write(bytes).expect("pipe write");
    world.pump();
    let events = world.sched.poll_events();
    let mut ctx = world.ctx();
    for (sock, evt) in events {
        if Some(sock) == client.socket() {
            client.on_sock_event(&mut ctx, evt);
        }
    }
}

fn flush(world: &mut World, client: &mut Client) {
    world.pump();
    let events = world.sched.poll_events();
    let mut ctx = world.ctx();
    for (sock, evt) in events {
        if Some(sock) == client.socket() && evt != SockEvent::Read {
            client.on_sock_event(&mut ctx, evt);
        }
    }
}

fn peer_hello(id: u32, tcp_port: u16, features: u32) -> Vec<u8> {
    Hello {
        hash: [0xcc; 16],
        client_id: id,
        tcp_port,
        nick: "peer".into(),
        version: VER_EDONKEY,
        mod_str: String::new(),
        mule_ver: 0,
        udp_port: 4672,
        features,
        server: Some((ip_to_id(*server_addr().ip()), server_addr().port())),
    }
    .to_hello_frame()
}

fn hash_frame(opcode: u8, hash: &Hash16) -> Vec<u8> {
    let mut w = wire::Writer::new();
    w.hash(hash);
    wire::encode_frame(wire::Proto::Ed2k, opcode, w.as_bytes())
}

#[test]
fn concurrent_upload_and_download_with_one_peer() {
    let mut world = World::new();
    let a = world.add_download(HASH_A, ED2K_PARTSIZE + 1);
    world.add_shared(HASH_B, &vec![0x42u8; 300_000]);

    let peer_addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 4662);
    let (mut client, mut peer) = world.incoming_client(1, peer_addr);

    // handshake: plain client, no secident so transfers start directly
    deliver(&mut world, &mut client, &mut peer, &peer_hello(ip_to_id(*peer_addr.ip()), 4662, 0));
    flush(&mut world, &mut client);
    assert!(peer.opcodes().contains(&OP_HELLOANSWER));

    // we want file A from them
    {
        let mut ctx = world.ctx();
        client.add_offered(&mut ctx, a, false);
    }
    flush(&mut world, &mut client);
    assert!(peer.opcodes().contains(&OP_REQFILE));

    // they want file B from us
    deliver(
        &mut world,
        &mut client,
        &mut peer,
        &ReqFile {
            hash: HASH_B,
            part_map: Vec::new(),
            src_count: 0,
        }
        .to_frame(),
    );
    deliver(&mut world, &mut client, &mut peer, &hash_frame(OP_SETREQFILEID, &HASH_B));
    deliver(&mut world, &mut client, &mut peer, &hash_frame(OP_STARTUPLOADREQ, &HASH_B));
    flush(&mut world, &mut client);
    let opcodes = peer.opcodes();
    assert!(opcodes.contains(&OP_FILENAME));
    assert!(opcodes.contains(&OP_REQFILE_STATUS));
    assert!(client.queue_info().is_some(), "peer is queued on our side");
    assert!(client
        .take_actions()
        .iter()
        .any(|a| matches!(a, ed2k::client::Action::QueueUpload(_))));

    // their answers for file A arrive
    deliver(
        &mut world,
        &mut client,
        &mut peer,
        &FileName {
            hash: HASH_A,
            name: "a.bin".into(),
        }
        .to_frame(),
    );
    deliver(
        &mut world,
        &mut client,
        &mut peer,
        &FileStatus {
            hash: HASH_A,
            part_map: Vec::new(), // they have the whole file
        }
        .to_frame(),
    );
    flush(&mut world, &mut client);
    let opcodes = peer.opcodes();
    assert!(opcodes.contains(&OP_SETREQFILEID));
    assert!(opcodes.contains(&OP_STARTUPLOADREQ));

    // both sides of the relationship alive at once
    assert!(client.source_info().is_some());
    assert!(client.queue_info().is_some());

    // our queue promotes them to a slot
    {
        let mut ctx = world.ctx();
        client.start_upload(&mut ctx);
    }
    flush(&mut world, &mut client);
    assert!(peer.opcodes().contains(&OP_ACCEPTUPLOADREQ));
    assert!(client.upload_info().is_some());
    assert!(
        client.queue_info().is_none(),
        "uploading implies not queued"
    );

    // they request a chunk of B and get data
    deliver(
        &mut world,
        &mut client,
        &mut peer,
        &ReqChunks {
            hash: HASH_B,
            ranges: vec![Range::new(0, 9_999)],
        }
        .to_frame(),
    );
    flush(&mut world, &mut client);
    let frames = peer.recv();
    let data = frames
        .iter()
        .find(|f| f.opcode == OP_SENDINGCHUNK)
        .expect("data chunk sent");
    let decoded = DataChunk::decode(&data.payload).unwrap();
    assert_eq!(decoded.begin, 0);
    assert_eq!(decoded.end, 10_000);
    assert!(decoded.data.iter().all(|b| *b == 0x42));

    // they promote us too: download starts
    deliver(
        &mut world,
        &mut client,
        &mut peer,
        &wire::encode_frame(wire::Proto::Ed2k, OP_ACCEPTUPLOADREQ, &[]),
    );
    flush(&mut world, &mut client);
    assert!(client.download_info().is_some());
    assert!(peer.opcodes().contains(&OP_REQCHUNKS));

    // losing the socket while downloading keeps the source and schedules
    // a reask instead of destroying the session
    let timers_before = world.timers.len();
    {
        let mut ctx = world.ctx();
        client.on_sock_event(&mut ctx, SockEvent::Lost);
    }
    assert!(!client.is_dead(), "session survives as a reask candidate");
    assert!(client.source_info().is_some());
    assert!(client.download_info().is_none());
    assert!(world.timers.len() > timers_before, "reask scheduled");
}

#[test]
fn low_id_callback_merges_into_placeholder() {
    let mut world = World::new();
    let a = world.add_download(HASH_A, ED2K_PARTSIZE + 1);
    let mut list = ClientList::new(4);

    let low_id = 1000u32; // well below the low-id limit

    // adding the source triggers a callback request through the server
    {
        let mut ctx = world.ctx();
        list.add_source(&mut ctx, a, low_id, 4662, Some(server_addr()), true);
    }
    let events = list.take_events();
    assert!(events.contains(&ListEvent::ReqCallback(low_id)));
    assert_eq!(list.len(), 1);
    let placeholder_key = list.iter().next().unwrap().key();

    // the peer calls back from its real address
    let caller_addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 40123);
    let (near, far) = memory_pair(our_addr(), caller_addr);
    let sock = world.sched.add_stream(Box::new(near), None);
    {
        let mut ctx = world.ctx();
        list.add_incoming(&mut ctx, sock, caller_addr);
    }
    assert_eq!(list.len(), 2);

    // its hello names the low id and listen port: sessions merge
    let mut far = far;
    far.write(&peer_hello(low_id, 4662, 0)).unwrap();
    world.pump();
    let events = world.sched.poll_events();
    {
        let mut ctx = world.ctx();
        for (s, evt) in events {
            list.handle_sock_event(&mut ctx, s, evt);
        }
    }
    assert_eq!(list.len(), 1, "duplicate sessions merged");
    let survivor = list.iter().next().unwrap();
    assert!(survivor.is_connected());
    assert!(survivor.source_info().is_some());
    assert_eq!(survivor.id(), low_id);

    // the callback timeout is now harmless for the merged session
    {
        let mut ctx = world.ctx();
        list.handle_timer(&mut ctx, placeholder_key, ClientTimer::CallbackTimeout);
    }
    assert_eq!(list.len(), 1);
}

#[test]
fn callback_timeout_without_answer_destroys_source() {
    let mut world = World::new();
    let a = world.add_download(HASH_A, ED2K_PARTSIZE + 1);
    let mut list = ClientList::new(4);
    {
        let mut ctx = world.ctx();
        list.add_source(&mut ctx, a, 2000, 4662, Some(server_addr()), true);
    }
    let key = list.iter().next().unwrap().key();
    {
        let mut ctx = world.ctx();
        list.handle_timer(&mut ctx, key, ClientTimer::CallbackTimeout);
    }
    assert_eq!(list.len(), 0, "unanswered callback kills the session");
}

#[test]
fn udp_source_acquisition_round_trip() {
    let mut world = World::new();
    let h1 = world.add_download([0x01; 16], 1_000_000);
    let h2 = world.add_download([0x02; 16], 2_000_000);
    // H2 is better provisioned, so H1 must be queried first
    world
        .downloads
        .get_mut(h2)
        .unwrap()
        .part
        .add_full_source(ED2K_PARTSIZE);

    let mut servers = ServerList::new(true);
    servers.add_server(server_addr());

    {
        let mut ctx = world.ctx();
        servers.query_next_server(&mut ctx);
    }
    world.pump();
    {
        let sent = world.udp_sent.borrow();
        assert_eq!(sent.len(), 1, "exactly one ping went out");
        let (ping, to) = &sent[0];
        assert_eq!(to.port(), server_addr().port() + 4);
        assert_eq!(ping[1], OP_GLOBSTATREQ);
    }
    let challenge = servers.iter().next().unwrap().challenge;
    assert_eq!(challenge >> 16, 0x55aa);

    // the server answers, advertising GetSources2
    let stats = GlobStatRes {
        challenge,
        users: 1000,
        files: 1_000_000,
        max_users: 2000,
        soft_limit: 100,
        hard_limit: 200,
        udp_flags: SRV_FL_GETSOURCES | SRV_FL_GETSOURCES2,
        low_id_users: 10,
    };
    let datagram = stats.to_datagram();
    let udp_from = SocketAddrV4::new(*server_addr().ip(), server_addr().port() + 4);
    {
        let mut ctx = world.ctx();
        let msg = UdpMessage::decode(&datagram).unwrap();
        servers.handle_udp(&mut ctx, udp_from, &msg);
    }
    world.pump();
    {
        let sent = world.udp_sent.borrow();
        assert_eq!(sent.len(), 2, "stat answer triggers one source query");
        let (query, _) = &sent[1];
        assert_eq!(query[1], OP_GLOBGETSOURCES2);
        assert!(query.len() <= 512);
        // rarest download leads the batch; both hashes present with sizes
        assert_eq!(&query[2..18], &[0x01; 16]);
        assert_eq!(&query[22..38], &[0x02; 16]);
    }

    // concatenated answer populates both downloads with distinct sources
    let answer_a = GlobFoundSources {
        hash: [0x01; 16],
        sources: vec![(ip_to_id(Ipv4Addr::new(10, 1, 1, 1)), 4662)],
    };
    let answer_b = GlobFoundSources {
        hash: [0x02; 16],
        sources: vec![(ip_to_id(Ipv4Addr::new(10, 1, 1, 2)), 4663)],
    };
    let mut datagram = answer_a.to_datagram();
    datagram.extend_from_slice(&answer_b.to_datagram());
    {
        let mut ctx = world.ctx();
        let msg = UdpMessage::decode(&datagram).unwrap();
        servers.handle_udp(&mut ctx, udp_from, &msg);
    }
    let found: Vec<_> = servers
        .take_events()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::FoundSources { hash, sources } => Some((hash, sources)),
            _ => None,
        })
        .collect();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].0, [0x01; 16]);
    assert_eq!(found[1].0, [0x02; 16]);
    assert_ne!(found[0].1, found[1].1, "distinct endpoints per download");
    let _ = h1;
}

#[test]
fn packed_chunks_reassemble_into_one_write_sequence() {
    let mut world = World::new();
    let a = world.add_download(HASH_A, ED2K_PARTSIZE + 1);

    let peer_addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 4662);
    let (mut client, mut peer) = world.incoming_client(1, peer_addr);

    deliver(&mut world, &mut client, &mut peer, &peer_hello(ip_to_id(*peer_addr.ip()), 4662, 0));
    {
        let mut ctx = world.ctx();
        client.add_offered(&mut ctx, a, false);
    }
    deliver(
        &mut world,
        &mut client,
        &mut peer,
        &FileName {
            hash: HASH_A,
            name: "a.bin".into(),
        }
        .to_frame(),
    );
    deliver(
        &mut world,
        &mut client,
        &mut peer,
        &FileStatus {
            hash: HASH_A,
            part_map: Vec::new(),
        }
        .to_frame(),
    );
    deliver(
        &mut world,
        &mut client,
        &mut peer,
        &wire::encode_frame(wire::Proto::Ed2k, OP_ACCEPTUPLOADREQ, &[]),
    );
    assert!(client.download_info().is_some());

    // one whole part, compressed, split over three frames
    let plain = vec![0x77u8; ED2K_PARTSIZE as usize];
    let packed = zlib_pack(&plain);
    let total = packed.len() as u32;
    let third = packed.len() / 3;
    let fragments = [
        &packed[..third],
        &packed[third..2 * third],
        &packed[2 * third..],
    ];
    for fragment in fragments {
        deliver(
            &mut world,
            &mut client,
            &mut peer,
            &PackedChunk {
                hash: HASH_A,
                begin: 0,
                packed_total: total,
                data: fragment.to_vec(),
            }
            .to_frame(),
        );
    }

    let part = &world.downloads.get(a).unwrap().part;
    assert!(
        part.complete_ranges()
            .contains_full(&Range::new(0, ED2K_PARTSIZE - 1)),
        "whole part delivered through the packed stream"
    );
    assert!(!client.is_dead());
}
