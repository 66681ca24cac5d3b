//! Zero-downtime process upgrades for TCP servers.
//!
//! A serving process (the incumbent) reacts to SIGHUP by re-executing its own
//! binary. The replacement (the candidate) duplicates the incumbent's
//! listening socket through a pidfd, serves concurrently with it for a short
//! overlap window, then retires the incumbent with a handle-addressed SIGTERM.
//! The kernel arbitrates accept-queue delivery between the two processes
//! during the overlap, so no connection in the backlog is ever dropped.

pub mod coordinator;
pub mod envelope;
pub mod launcher;
pub mod listener;
pub mod shutdown;

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;
use std::time::SystemTime;
use thiserror::Error;

pub use envelope::HandoffEnvelope;
pub use molt_pidfd::PidfdError;
pub use molt_pidfd::ProcessHandle;

#[derive(Debug, Error)]
pub enum UpgradeError {
    /// Fatal to a fresh bootstrap; there is no fallback socket to serve on.
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Fatal to a candidate holding an envelope; the incumbent is untouched
    /// and keeps serving.
    #[error("descriptor handoff failed")]
    Handoff(#[from] PidfdError),

    /// The duplicated descriptor could not be turned into a listener.
    #[error("duplicated descriptor is not usable as a listening socket")]
    Adopt(#[source] io::Error),

    /// Reported, never fatal to the incumbent; the operator may retry.
    #[error("failed to spawn replacement process")]
    Spawn(#[source] io::Error),

    /// The drain deadline expired with connections still open; they were
    /// force-closed.
    #[error("drain deadline of {deadline:?} expired with connections still open")]
    DrainTimeout { deadline: Duration },

    /// Retirement could not be delivered; the incumbent lingers until
    /// terminated manually.
    #[error("failed to deliver retirement signal to process {pid}")]
    SignalDelivery {
        pid: u32,
        #[source]
        source: PidfdError,
    },

    #[error("serve loop failed")]
    Serve(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Bound its own socket, or already completed a takeover.
    Incumbent,
    /// Spawned with a handoff envelope, serving on a duplicated socket.
    Candidate,
}

/// Per-process state, reconstructed at startup and immutable afterwards.
/// Shared read-only across the accept loop and the signal listener tasks.
#[derive(Debug)]
pub struct ProcessRecord {
    pub pid: u32,
    pub role: Role,
    pub listen_fd: RawFd,
    pub spawned_at: SystemTime,
}

impl ProcessRecord {
    pub fn new(role: Role, listen_fd: RawFd) -> Self {
        Self {
            pid: std::process::id(),
            role,
            listen_fd,
            spawned_at: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// Address to bind when starting without a handoff envelope.
    pub listen_addr: SocketAddr,
    /// Ceiling on the overlap window: the candidate retires the incumbent as
    /// soon as its serve loop is confirmed accepting, or when this interval
    /// elapses, whichever comes first.
    pub grace: Duration,
    /// Bound on draining in-flight connections after retirement/termination.
    pub drain: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            grace: Duration::from_secs(5),
            drain: Duration::from_secs(5),
        }
    }
}
