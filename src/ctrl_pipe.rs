//! Control-message channel to the recorder process.
//!
//! The recorder hands us a pre-opened pipe fd through `FTRACE_PIPE`.
//! Every message is one length-prefixed frame written with a single
//! gathered `writev`, so frames from different threads never interleave.
//! A short or failed write is a protocol error and aborts the runtime;
//! a missing or non-FIFO fd silently disables the channel (standalone
//! runs record into shared memory with nobody listening).

use crate::log::LogLevel::LogDebug;
use crate::log::LogLevel::LogWarn;
use crate::util;
use nix::sys::uio::{writev, IoVec};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

pub const CTRL_MAGIC: u32 = 0xf700_f700;

pub const CTRL_HDR_SIZE: usize = 12;

#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CtrlMsgKind {
    Session = 1,
    Tid = 2,
    ForkStart = 3,
    ForkEnd = 4,
    RecStart = 5,
    RecEnd = 6,
    Lost = 7,
}

/// The fd is interior-mutable so process fini can close the channel
/// behind the static session.
pub struct CtrlPipe {
    fd: AtomicI32,
}

impl CtrlPipe {
    pub fn disabled() -> CtrlPipe {
        CtrlPipe {
            fd: AtomicI32::new(-1),
        }
    }

    /// Validates that `fd` really is a FIFO; anything else disables the
    /// channel rather than risking writes to a stolen descriptor.
    pub fn from_fd(fd: RawFd) -> CtrlPipe {
        match nix::sys::stat::fstat(fd) {
            Ok(st) if st.st_mode & libc::S_IFMT == libc::S_IFIFO => CtrlPipe {
                fd: AtomicI32::new(fd),
            },
            Ok(_) => {
                log!(LogWarn, "fd {} is not a pipe; control messages off", fd);
                CtrlPipe::disabled()
            }
            Err(e) => {
                log!(LogWarn, "cannot stat fd {} ({}); control messages off", fd, e);
                CtrlPipe::disabled()
            }
        }
    }

    pub fn from_opt_fd(fd: Option<RawFd>) -> CtrlPipe {
        match fd {
            Some(fd) => CtrlPipe::from_fd(fd),
            None => CtrlPipe::disabled(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.fd.load(Ordering::Relaxed) >= 0
    }

    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::Relaxed);
        if fd >= 0 {
            let _ = nix::unistd::close(fd);
        }
    }

    pub fn send(&self, kind: CtrlMsgKind, payload: &[u8]) {
        let fd = self.fd.load(Ordering::Relaxed);
        if fd < 0 {
            return;
        }

        let mut hdr = [0u8; CTRL_HDR_SIZE];
        hdr[0..4].copy_from_slice(&CTRL_MAGIC.to_le_bytes());
        hdr[4..8].copy_from_slice(&(kind as u32).to_le_bytes());
        hdr[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());

        let iov = [IoVec::from_slice(&hdr), IoVec::from_slice(payload)];
        let total = hdr.len() + payload.len();
        match writev(fd, &iov) {
            Ok(n) if n == total => {}
            Ok(n) => fatal!("short write on control pipe: {} of {} bytes", n, total),
            Err(e) => fatal!("control pipe write failed: {}", e),
        }
        log!(LogDebug, "sent {:?}, {} byte payload", kind, payload.len());
    }

    /// SESSION: `{ time, pid, tid, sid[16], namelen, name }`.
    pub fn send_session(&self, sid: &str, exe_name: &str) {
        if !self.is_active() {
            return;
        }
        let name = exe_name.as_bytes();
        let mut payload = Vec::with_capacity(36 + name.len());
        payload.extend_from_slice(&util::now_ns().to_le_bytes());
        payload.extend_from_slice(&util::getpid().to_le_bytes());
        payload.extend_from_slice(&util::gettid().to_le_bytes());
        debug_assert_eq!(sid.len(), 16);
        payload.extend_from_slice(sid.as_bytes());
        payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
        payload.extend_from_slice(name);
        self.send(CtrlMsgKind::Session, &payload);
    }

    /// TID / FORK_START / FORK_END: `{ time, pid, tid }`.
    pub fn send_task(&self, kind: CtrlMsgKind, pid: u32, tid: u32) {
        if !self.is_active() {
            return;
        }
        let mut payload = [0u8; 16];
        payload[0..8].copy_from_slice(&util::now_ns().to_le_bytes());
        payload[8..12].copy_from_slice(&pid.to_le_bytes());
        payload[12..16].copy_from_slice(&tid.to_le_bytes());
        self.send(kind, &payload);
    }

    /// REC_START / REC_END: payload is the segment name.
    pub fn send_rec(&self, kind: CtrlMsgKind, seg_name: &str) {
        self.send(kind, seg_name.as_bytes());
    }

    pub fn send_lost(&self, count: u32) {
        self.send(CtrlMsgKind::Lost, &count.to_le_bytes());
    }
}

impl Drop for CtrlPipe {
    fn drop(&mut self) {
        self.close();
    }
}
