//! Listening-socket construction with a discoverable raw descriptor.
//!
//! Standard listener APIs hide the descriptor number behind the handle; the
//! handoff envelope needs it, so the socket is built by hand with socket2 and
//! the descriptor captured before the socket becomes a tokio listener. The
//! adopted path produces the same [`BoundListener`], so request handlers
//! cannot tell a fresh socket from a duplicated one.

use crate::UpgradeError;
use socket2::Domain;
use socket2::Protocol;
use socket2::Socket;
use socket2::Type;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use tokio::net::TcpListener;
use tracing::info;

const BACKLOG: i32 = 128;

/// A listening socket together with the raw descriptor it occupies in this
/// process's descriptor table.
#[derive(Debug)]
pub struct BoundListener {
    pub listener: TcpListener,
    pub fd: RawFd,
}

impl BoundListener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Binds a fresh listening socket on `addr`.
pub fn bind(addr: SocketAddr) -> Result<BoundListener, UpgradeError> {
    let bind_err = |source| UpgradeError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(BACKLOG).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let fd = socket.as_raw_fd();
    let listener = TcpListener::from_std(socket.into()).map_err(bind_err)?;
    info!(%addr, fd, "listening socket bound");
    Ok(BoundListener { listener, fd })
}

/// Wraps a descriptor duplicated from another process into a serving listener.
pub fn from_duplicated(fd: OwnedFd) -> Result<BoundListener, UpgradeError> {
    let socket = Socket::from(fd);
    socket.set_nonblocking(true).map_err(UpgradeError::Adopt)?;
    let raw = socket.as_raw_fd();
    let listener = TcpListener::from_std(socket.into()).map_err(UpgradeError::Adopt)?;
    Ok(BoundListener { listener, fd: raw })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn bind_exposes_the_raw_descriptor() {
        let bound = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(bound.fd > 0);
        assert_eq!(bound.listener.as_raw_fd(), bound.fd);
        assert!(bound.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn bind_reports_address_in_use() {
        let first = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = first.local_addr().unwrap();
        match bind(taken) {
            Err(UpgradeError::Bind { addr, .. }) => assert_eq!(addr, taken),
            other => panic!("expected Bind error, got {other:?}"),
        }
    }
}
