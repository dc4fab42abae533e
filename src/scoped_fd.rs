use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;
use nix::NixPath;
use std::os::unix::io::RawFd;
use std::str::FromStr;

/// An owned file descriptor, closed on drop.
///
/// A preload runtime never opens its control descriptors itself; the
/// recorder opens them and hands them down by number in environment
/// variables (`FTRACE_PIPE`, `FTRACE_LOGFD`).  `from_env_var` is the
/// single place that turns such a number into an owned descriptor,
/// rejecting values that do not name an open fd in this process.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    /// Parses an inherited descriptor number out of `var`.  `None` when
    /// the variable is unset, not a number, or names a closed fd.
    ///
    /// No logging here: the log fd itself is resolved through this.
    pub fn from_env_var(var: &str) -> Option<Self> {
        let fd = std::env::var(var)
            .ok()
            .and_then(|s| RawFd::from_str(s.trim()).ok())?;
        if fd < 0 {
            return None;
        }
        if fcntl(fd, FcntlArg::F_GETFD).is_err() {
            return None;
        }
        Some(ScopedFd { fd })
    }

    pub fn open_from_path<P: ?Sized + NixPath>(
        path: &P,
        oflag: OFlag,
        mode: Mode,
    ) -> nix::Result<Self> {
        let rawfd = open(path, oflag, mode)?;
        Ok(ScopedFd { fd: rawfd })
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // Nothing useful to do with a close failure here.
            let _ = close(self.fd);
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Gives the descriptor up without closing it, for handoff into
    /// state with its own lifetime rules (the control pipe keeps its fd
    /// in an atomic so fini can close it behind a shared reference).
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_disarms_drop() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let mut sfd = ScopedFd::from_raw(r);
        assert!(sfd.is_open());
        assert_eq!(sfd.extract(), r);
        assert!(!sfd.is_open());
        // r is still ours to close
        let _ = close(r);
        let _ = close(w);
    }

    #[test]
    fn env_var_names_an_open_fd() {
        let (r, w) = nix::unistd::pipe().unwrap();
        std::env::set_var("FTRACE_TEST_FD_GOOD", w.to_string());
        let mut sfd = ScopedFd::from_env_var("FTRACE_TEST_FD_GOOD").unwrap();
        assert_eq!(sfd.extract(), w);
        std::env::remove_var("FTRACE_TEST_FD_GOOD");
        let _ = close(r);
        let _ = close(w);
    }

    #[test]
    fn env_var_rejects_unset_garbage_and_closed_fds() {
        assert!(ScopedFd::from_env_var("FTRACE_TEST_FD_UNSET").is_none());

        std::env::set_var("FTRACE_TEST_FD_BAD", "pipe");
        assert!(ScopedFd::from_env_var("FTRACE_TEST_FD_BAD").is_none());
        std::env::set_var("FTRACE_TEST_FD_BAD", "-3");
        assert!(ScopedFd::from_env_var("FTRACE_TEST_FD_BAD").is_none());
        // far past any descriptor this process has open
        std::env::set_var("FTRACE_TEST_FD_BAD", "999999");
        assert!(ScopedFd::from_env_var("FTRACE_TEST_FD_BAD").is_none());
        std::env::remove_var("FTRACE_TEST_FD_BAD");
    }
}
