//! Process-level orchestration for both sides of an upgrade.
//!
//! Candidate states: Bootstrap (read envelope; none means standalone serve),
//! Duplicating (fatal on failure; the incumbent is untouched), OverlappedServe
//! (serving concurrently with the incumbent until readiness is confirmed, the
//! grace interval acting as fallback ceiling), SoleServe (retirement sent,
//! serving alone, itself upgradeable).

use crate::ProcessRecord;
use crate::Role;
use crate::ServerConfig;
use crate::UpgradeError;
use crate::envelope::HandoffEnvelope;
use crate::launcher;
use crate::listener;
use crate::listener::BoundListener;
use crate::shutdown;
use crate::shutdown::ServeTask;
use crate::shutdown::flatten_serve;
use axum::Router;
use molt_pidfd::ProcessHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Signal a candidate sends to vacate its incumbent. Same kind as external
/// termination: the incumbent's drain path is identical for both.
pub const RETIREMENT_SIGNAL: libc::c_int = libc::SIGTERM;

/// Interval between the serve loop's readiness signal and its first accept
/// poll actually running.
const READY_SETTLE: Duration = Duration::from_millis(100);

/// Entry point for an upgradeable server process. With a handoff envelope in
/// the environment this process is a candidate and takes over the envelope's
/// socket; without one it binds fresh. Returns when the process has drained
/// and should exit.
pub async fn run(config: &ServerConfig, app: Router) -> Result<(), UpgradeError> {
    match HandoffEnvelope::from_env() {
        Some(envelope) => {
            info!(
                incumbent_pid = envelope.pid,
                remote_fd = envelope.fd,
                "starting as replacement"
            );
            let incumbent = ProcessHandle::open(envelope.pid)?;
            let duplicated = incumbent.duplicate_fd(envelope.fd)?;
            let bound = listener::from_duplicated(duplicated)?;
            info!(fd = bound.fd, "duplicated the incumbent's listening socket");
            serve(config, app, bound, Some(incumbent), true).await
        }
        None => {
            let bound = listener::bind(config.listen_addr)?;
            serve(config, app, bound, None, true).await
        }
    }
}

/// Minimal variant: duplicate a socket from a running process and serve on it
/// with no upgrade orchestration. SIGTERM/SIGINT still drain.
pub async fn serve_adopted(
    config: &ServerConfig,
    source: HandoffEnvelope,
    app: Router,
) -> Result<(), UpgradeError> {
    let owner = ProcessHandle::open(source.pid)?;
    let duplicated = owner.duplicate_fd(source.fd)?;
    let bound = listener::from_duplicated(duplicated)?;
    info!(
        source_pid = source.pid,
        fd = bound.fd,
        "serving on duplicated socket"
    );
    serve(config, app, bound, None, false).await
}

async fn serve(
    config: &ServerConfig,
    app: Router,
    bound: BoundListener,
    incumbent: Option<ProcessHandle>,
    upgradeable: bool,
) -> Result<(), UpgradeError> {
    let role = if incumbent.is_some() {
        Role::Candidate
    } else {
        Role::Incumbent
    };
    let record = Arc::new(ProcessRecord::new(role, bound.fd));
    info!(role = ?record.role, fd = record.listen_fd, "serving");

    let shutdown_token = CancellationToken::new();
    shutdown::spawn_termination_listener(shutdown_token.clone()).map_err(UpgradeError::Serve)?;
    if upgradeable {
        launcher::spawn_upgrade_listener(Arc::clone(&record)).map_err(UpgradeError::Serve)?;
    }

    let ServeTask { mut handle, ready } = shutdown::spawn_serve(bound, app, shutdown_token.clone());

    if let Some(incumbent) = incumbent {
        tokio::select! {
            // The serve loop ended during the overlap: skip retirement
            // entirely and surface whatever happened. The incumbent stays up.
            res = &mut handle => return flatten_serve(res),
            _ = confirm_ready(ready, config.grace) => {}
        }
        match incumbent.send_signal(RETIREMENT_SIGNAL) {
            Ok(()) => info!(incumbent_pid = incumbent.pid(), "retirement signal sent"),
            Err(source) => {
                let err = UpgradeError::SignalDelivery {
                    pid: incumbent.pid(),
                    source,
                };
                // No automatic retry: the incumbent lingers until terminated
                // manually while this process keeps serving.
                error!("{err}");
            }
        }
    }

    tokio::select! {
        res = &mut handle => return flatten_serve(res),
        _ = shutdown_token.cancelled() => {}
    }
    info!("draining, no longer accepting new connections");
    shutdown::drain(&mut handle, config.drain).await?;
    info!("exiting");
    Ok(())
}

/// Resolves when it is safe to retire the incumbent: the serve loop reported
/// readiness (plus a settle interval), or the grace interval elapsed without
/// confirmation.
async fn confirm_ready(ready: oneshot::Receiver<()>, grace: Duration) {
    match tokio::time::timeout(grace, ready).await {
        Ok(Ok(())) => {
            tokio::time::sleep(READY_SETTLE).await;
            info!("serve loop accepting, retiring the incumbent");
        }
        // Sender dropped: the serve task is gone and the select racing this
        // future resolves through its other arm.
        Ok(Err(_)) => std::future::pending::<()>().await,
        Err(_) => {
            warn!("readiness not confirmed within grace interval, retiring the incumbent anyway");
        }
    }
}
