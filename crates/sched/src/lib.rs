//! Networking scheduler.
//!
//! All socket I/O in the engine flows through one [`SchedBase`] object that
//! arbitrates upload, download, connect and accept requests against global
//! byte and connection budgets. Frontends (protocol sessions) never touch
//! sockets directly: they register a transport, buffer writes through the
//! scheduler, and react to [`SockEvent`]s drained from it each tick.
//!
//! The design is a single-threaded tick loop: no I/O happens outside
//! [`SchedBase::tick`], and the only blocking operations (outgoing TCP
//! connects) run on the worker pool, posting completions back through a
//! channel.

mod backend;
mod timer;
mod transport;
mod worker;

pub use backend::{Counters, SchedBase, SchedConfig, ScoreFn, INPUT_BUFSIZE};
pub use timer::TimerQueue;
pub use transport::{
    memory_pair, Datagram, Listener, MemDatagram, MemListener, MemTransport,
    TcpListenerTransport, TcpTransport, Transport, UdpTransport,
};
pub use worker::{WorkerHandle, WorkerPool};

use thiserror::Error;

/// Stable identifier for a socket registered with the scheduler.
pub type SocketId = u64;

/// Events surfaced to frontends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SockEvent {
    /// Data arrived in the incoming buffer.
    Read,
    /// The outgoing buffer drained; more data may be written.
    Write,
    /// An outgoing connection completed.
    Connected,
    /// An outgoing connection attempt failed.
    ConnFailed,
    /// The remote end closed the connection.
    Lost,
    /// A socket error occurred.
    Err,
    /// No activity within the configured timeout.
    Timeout,
    /// A listener has an accepted connection queued.
    Accept,
    /// The requested peer is on the block list.
    Blocked,
}

/// Errors returned by scheduler entry points.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SchedError {
    /// The socket id is not registered (or already removed).
    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),
    /// Operation not valid for this socket kind (e.g. `accept` on a client
    /// stream).
    #[error("operation not supported by this socket")]
    WrongKind,
    /// A connect was issued while one is already pending.
    #[error("connect already in progress")]
    AlreadyConnecting,
}
