//! Stable process handles built on Linux pidfds.
//!
//! A [`ProcessHandle`] pins a specific process *instance*: operations made
//! through it keep targeting the process that was open at the time of
//! [`ProcessHandle::open`], even if its numeric pid is later reassigned to an
//! unrelated process. On top of the handle this crate exposes the two
//! operations the upgrade protocol needs: duplicating one of the remote
//! process's open descriptors into the local descriptor table
//! ([`ProcessHandle::duplicate_fd`]) and delivering a signal
//! ([`ProcessHandle::send_signal`]).

#[cfg(not(target_os = "linux"))]
compile_error!("molt-pidfd requires Linux (pidfd_open/pidfd_getfd/pidfd_send_signal)");

use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidfdError {
    /// The target process exited (and was reaped) between handle-open and the
    /// requested operation, or was already gone at open time.
    #[error("process {pid} is gone")]
    ProcessGone { pid: u32 },

    /// `fd` does not name an open descriptor in the target process.
    #[error("descriptor {fd} is not open in process {pid}")]
    DescriptorInvalid { pid: u32, fd: RawFd },

    #[error("not permitted to operate on process {pid}")]
    PermissionDenied { pid: u32 },

    /// The kernel predates pidfd_getfd (Linux 5.6).
    #[error("kernel does not support pidfd operations")]
    Unsupported,

    #[error("{op} failed for process {pid}")]
    Io {
        op: &'static str,
        pid: u32,
        #[source]
        source: io::Error,
    },
}

impl PidfdError {
    fn classify(op: &'static str, pid: u32, fd: Option<RawFd>, errno: i32) -> Self {
        match (errno, fd) {
            (libc::ESRCH, _) => PidfdError::ProcessGone { pid },
            (libc::EBADF, Some(fd)) => PidfdError::DescriptorInvalid { pid, fd },
            (libc::EPERM, _) => PidfdError::PermissionDenied { pid },
            (libc::ENOSYS, _) => PidfdError::Unsupported,
            _ => PidfdError::Io {
                op,
                pid,
                source: io::Error::from_raw_os_error(errno),
            },
        }
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// A stable reference to one process instance.
#[derive(Debug)]
pub struct ProcessHandle {
    fd: OwnedFd,
    pid: u32,
}

impl ProcessHandle {
    /// Opens a handle to the process currently known by `pid`. Fails with
    /// [`PidfdError::ProcessGone`] if no such process exists.
    pub fn open(pid: u32) -> Result<Self, PidfdError> {
        // SAFETY: pidfd_open takes no pointer arguments.
        let ret =
            unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0 as libc::c_uint) };
        if ret < 0 {
            return Err(PidfdError::classify("pidfd_open", pid, None, last_errno()));
        }
        // SAFETY: the kernel just handed us this descriptor and nothing else
        // owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(ret as RawFd) };
        Ok(Self { fd, pid })
    }

    /// The numeric pid this handle was opened with. Informational only; all
    /// operations go through the pidfd.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Duplicates descriptor `remote_fd` of the target process into the local
    /// descriptor table. The returned descriptor refers to the identical
    /// underlying kernel object (for a listening socket: same accept queue,
    /// same bound address) and is independently closable.
    pub fn duplicate_fd(&self, remote_fd: RawFd) -> Result<OwnedFd, PidfdError> {
        // SAFETY: pidfd_getfd takes no pointer arguments.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_pidfd_getfd,
                self.fd.as_raw_fd(),
                remote_fd,
                0 as libc::c_uint,
            )
        };
        if ret < 0 {
            return Err(PidfdError::classify(
                "pidfd_getfd",
                self.pid,
                Some(remote_fd),
                last_errno(),
            ));
        }
        // SAFETY: fresh descriptor returned by the kernel.
        Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
    }

    /// Delivers `signal` to the target process through the handle. Signal 0
    /// performs the usual existence-and-permission check without delivering
    /// anything.
    pub fn send_signal(&self, signal: libc::c_int) -> Result<(), PidfdError> {
        // SAFETY: a null siginfo_t is allowed and means "fill in as if sent
        // by kill(2)".
        let ret = unsafe {
            libc::syscall(
                libc::SYS_pidfd_send_signal,
                self.fd.as_raw_fd(),
                signal,
                std::ptr::null::<libc::siginfo_t>(),
                0 as libc::c_uint,
            )
        };
        if ret < 0 {
            return Err(PidfdError::classify(
                "pidfd_send_signal",
                self.pid,
                None,
                last_errno(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::fd::AsRawFd;
    use std::process::Command;

    #[test]
    fn duplicates_are_independent() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let me = ProcessHandle::open(std::process::id()).unwrap();

        let dup_a = me.duplicate_fd(listener.as_raw_fd()).unwrap();
        let dup_b = me.duplicate_fd(listener.as_raw_fd()).unwrap();
        assert_ne!(dup_a.as_raw_fd(), dup_b.as_raw_fd());
        assert_ne!(dup_a.as_raw_fd(), listener.as_raw_fd());

        // Closing one copy must not affect the other copies or the original.
        let listener_a = std::net::TcpListener::from(dup_a);
        assert_eq!(listener_a.local_addr().unwrap(), addr);
        drop(listener_a);

        let listener_b = std::net::TcpListener::from(dup_b);
        assert_eq!(listener_b.local_addr().unwrap(), addr);
        assert_eq!(listener.local_addr().unwrap(), addr);
    }

    #[test]
    fn signal_zero_probes_liveness() {
        let me = ProcessHandle::open(std::process::id()).unwrap();
        me.send_signal(0).unwrap();
    }

    #[test]
    fn unknown_descriptor_is_invalid() {
        let me = ProcessHandle::open(std::process::id()).unwrap();
        // Far above any plausible RLIMIT_NOFILE, so never an open descriptor.
        match me.duplicate_fd(1_000_000) {
            Err(PidfdError::DescriptorInvalid { fd, .. }) => assert_eq!(fd, 1_000_000),
            other => panic!("expected DescriptorInvalid, got {other:?}"),
        }
    }

    // Simulates pid reuse: once the original process is gone, a handle opened
    // while it was alive must report ProcessGone for every operation instead
    // of resolving the numeric pid again.
    #[test]
    fn stale_handle_reports_process_gone() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let handle = ProcessHandle::open(child.id()).unwrap();
        child.kill().unwrap();
        child.wait().unwrap();

        match handle.duplicate_fd(0) {
            Err(PidfdError::ProcessGone { pid }) => assert_eq!(pid, handle.pid()),
            other => panic!("expected ProcessGone, got {other:?}"),
        }
        match handle.send_signal(0) {
            Err(PidfdError::ProcessGone { .. }) => {}
            other => panic!("expected ProcessGone, got {other:?}"),
        }
    }

    #[test]
    fn open_on_dead_pid_reports_process_gone() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        match ProcessHandle::open(pid) {
            Err(PidfdError::ProcessGone { pid: gone }) => assert_eq!(gone, pid),
            other => panic!("expected ProcessGone, got {other:?}"),
        }
    }

    #[test]
    fn errno_classification() {
        assert!(matches!(
            PidfdError::classify("pidfd_getfd", 7, Some(3), libc::ESRCH),
            PidfdError::ProcessGone { pid: 7 }
        ));
        assert!(matches!(
            PidfdError::classify("pidfd_getfd", 7, Some(3), libc::EBADF),
            PidfdError::DescriptorInvalid { pid: 7, fd: 3 }
        ));
        assert!(matches!(
            PidfdError::classify("pidfd_send_signal", 7, None, libc::EPERM),
            PidfdError::PermissionDenied { pid: 7 }
        ));
        assert!(matches!(
            PidfdError::classify("pidfd_open", 7, None, libc::ENOSYS),
            PidfdError::Unsupported
        ));
        assert!(matches!(
            PidfdError::classify("pidfd_open", 7, None, libc::EBADF),
            PidfdError::Io { .. }
        ));
    }
}
