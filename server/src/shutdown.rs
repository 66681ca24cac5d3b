//! Serve-loop lifecycle: Serving, Draining, Terminated.
//!
//! The accept loop, the termination listener, and the upgrade listener run as
//! independent tasks coordinating only through a [`CancellationToken`]. The
//! token is the drain trigger: once cancelled, axum stops accepting and
//! in-flight exchanges get the drain deadline to finish before being
//! force-closed.

use crate::UpgradeError;
use crate::listener::BoundListener;
use axum::Router;
use std::io;
use std::time::Duration;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::Span;
use tracing::info;

/// A running accept/serve loop plus the readiness signal it fires just before
/// its first accept poll. (The socket itself accepts at the kernel level from
/// the moment it is bound or duplicated; connections queue in the backlog.)
#[derive(Debug)]
pub struct ServeTask {
    pub handle: JoinHandle<io::Result<()>>,
    pub ready: oneshot::Receiver<()>,
}

pub fn spawn_serve(bound: BoundListener, app: Router, shutdown: CancellationToken) -> ServeTask {
    let (ready_tx, ready) = oneshot::channel();
    let task = async move {
        let _ = ready_tx.send(());
        axum::serve(bound.listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    };
    ServeTask {
        handle: tokio::spawn(task.instrument(Span::current())),
        ready,
    }
}

/// Cancels the token when SIGTERM or SIGINT arrives. A retirement signal sent
/// by a candidate is a SIGTERM like any other; the incumbent does not need to
/// know the sender.
pub fn spawn_termination_listener(shutdown: CancellationToken) -> io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let task = async move {
        tokio::select! {
            _ = terminate.recv() => info!("received SIGTERM, retiring"),
            _ = interrupt.recv() => info!("received SIGINT, retiring"),
        }
        shutdown.cancel();
    };
    tokio::spawn(task.instrument(Span::current()));
    Ok(())
}

/// Waits for the serve loop to finish draining, bounded by `deadline`. On
/// expiry the loop is aborted, force-closing whatever connections remain.
pub async fn drain(
    handle: &mut JoinHandle<io::Result<()>>,
    deadline: Duration,
) -> Result<(), UpgradeError> {
    match tokio::time::timeout(deadline, &mut *handle).await {
        Ok(res) => {
            flatten_serve(res)?;
            info!("drain complete, all in-flight connections finished");
            Ok(())
        }
        Err(_) => {
            handle.abort();
            Err(UpgradeError::DrainTimeout { deadline })
        }
    }
}

pub(crate) fn flatten_serve(res: Result<io::Result<()>, JoinError>) -> Result<(), UpgradeError> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(UpgradeError::Serve(err)),
        Err(join_err) => Err(UpgradeError::Serve(io::Error::other(join_err))),
    }
}
