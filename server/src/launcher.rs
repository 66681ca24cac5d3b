//! Replacement-process launch: re-exec of the same binary with the handoff
//! envelope in its environment.

use crate::ProcessRecord;
use crate::UpgradeError;
use crate::envelope::HandoffEnvelope;
use std::io;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;
use std::sync::Arc;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tracing::Instrument;
use tracing::Span;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Starts a replacement process: same binary, same arguments, stdout/stderr
/// inherited so both processes log to the same console. Fire-and-forget; the
/// caller never waits for completion, only polls liveness to guard the
/// session.
pub fn spawn_candidate(record: &ProcessRecord) -> Result<Child, UpgradeError> {
    let exe = std::env::current_exe().map_err(UpgradeError::Spawn)?;
    let envelope = HandoffEnvelope {
        pid: record.pid,
        fd: record.listen_fd,
    };
    let mut command = Command::new(exe);
    command
        .args(std::env::args_os().skip(1))
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    envelope.apply(&mut command);
    command.spawn().map_err(UpgradeError::Spawn)
}

/// Listens for SIGHUP and spawns a candidate per upgrade request. At most one
/// session may be in flight: further SIGHUPs are rejected until the previous
/// candidate has either retired this process or is observed to have exited.
pub(crate) fn spawn_upgrade_listener(record: Arc<ProcessRecord>) -> io::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let task = async move {
        let mut in_flight: Option<Child> = None;
        while hangup.recv().await.is_some() {
            info!("received SIGHUP, starting upgrade");
            if let Some(candidate) = in_flight.as_mut() {
                match candidate.try_wait() {
                    Ok(None) => {
                        warn!("an upgrade session is already in flight, ignoring SIGHUP");
                        continue;
                    }
                    Ok(Some(status)) => {
                        warn!(%status, "previous candidate exited without retiring this process");
                        in_flight = None;
                    }
                    Err(err) => {
                        warn!("could not determine candidate status ({err}), ignoring SIGHUP");
                        continue;
                    }
                }
            }
            match spawn_candidate(&record) {
                Ok(candidate) => {
                    info!(candidate_pid = candidate.id(), "replacement process started");
                    in_flight = Some(candidate);
                }
                // The incumbent keeps serving; the operator may retry.
                Err(err) => error!("{err}"),
            }
        }
    };
    tokio::spawn(task.instrument(Span::current()));
    Ok(())
}
