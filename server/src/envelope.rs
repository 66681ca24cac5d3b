//! Handoff envelope: the {pid, fd} pair a parent passes to its replacement.
//!
//! Transported out-of-band through the environment as decimal integers. The
//! envelope is only valid while the source process keeps the descriptor open;
//! staleness surfaces later as a recoverable duplication failure, never here.

use std::os::fd::RawFd;
use std::process::Command;
use tracing::warn;

pub const ENV_UPGRADE_PID: &str = "MOLT_UPGRADE_PID";
pub const ENV_UPGRADE_FD: &str = "MOLT_UPGRADE_FD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffEnvelope {
    /// Process that owns the listening descriptor.
    pub pid: u32,
    /// Descriptor number *in that process's* descriptor table.
    pub fd: RawFd,
}

impl HandoffEnvelope {
    /// Reads the envelope from this process's environment. Absent,
    /// non-positive, or malformed values mean "no envelope": the caller
    /// bootstraps a fresh socket instead.
    pub fn from_env() -> Option<Self> {
        let pid = std::env::var(ENV_UPGRADE_PID).ok();
        let fd = std::env::var(ENV_UPGRADE_FD).ok();
        Self::from_values(pid.as_deref(), fd.as_deref())
    }

    fn from_values(pid: Option<&str>, fd: Option<&str>) -> Option<Self> {
        let (Some(pid_raw), Some(fd_raw)) = (pid, fd) else {
            return None;
        };
        let Ok(pid) = pid_raw.trim().parse::<i64>() else {
            warn!(value = pid_raw, "malformed {ENV_UPGRADE_PID}, bootstrapping fresh");
            return None;
        };
        let Ok(fd) = fd_raw.trim().parse::<i64>() else {
            warn!(value = fd_raw, "malformed {ENV_UPGRADE_FD}, bootstrapping fresh");
            return None;
        };
        if pid <= 0 || fd <= 0 || pid > i64::from(u32::MAX) || fd > i64::from(RawFd::MAX) {
            return None;
        }
        Some(Self {
            pid: pid as u32,
            fd: fd as RawFd,
        })
    }

    /// Stamps the envelope onto a child's environment, overriding whatever
    /// this process may itself have inherited.
    pub fn apply(&self, command: &mut Command) {
        command.env(ENV_UPGRADE_PID, self.pid.to_string());
        command.env(ENV_UPGRADE_FD, self.fd.to_string());
    }
}
