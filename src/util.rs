//! Clock and identity helpers used throughout the runtime.

use rand::rngs::OsRng;
use rand::RngCore;
use std::cell::Cell;
use std::fmt::Write as FmtWrite;

/// Monotonic clock reading in nanoseconds.  Called on the hot path;
/// `clock_gettime(CLOCK_MONOTONIC)` goes through the vDSO.
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

lazy_static! {
    static ref SESSION_ID: String = gen_session_id();
}

fn gen_session_id() -> String {
    let mut bytes = [0u8; 8];
    if OsRng.try_fill_bytes(&mut bytes).is_err() {
        fatal!("cannot read entropy for session id");
    }
    let mut s = String::with_capacity(16);
    for b in bytes.iter() {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// 16 hex digits derived from 8 random bytes; stable for the life of
/// the process (fork children keep the parent's id).
pub fn session_id() -> &'static str {
    &*SESSION_ID
}

thread_local! {
    static TID: Cell<u32> = Cell::new(0);
}

/// OS thread id, cached per thread.  The cache survives into a fork
/// child and must be cleared there (`clear_tid_cache`).
pub fn gettid() -> u32 {
    TID.with(|t| {
        if t.get() == 0 {
            t.set(unsafe { libc::syscall(libc::SYS_gettid) } as u32);
        }
        t.get()
    })
}

pub fn clear_tid_cache() {
    let _ = TID.try_with(|t| t.set(0));
}

pub fn getpid() -> u32 {
    unsafe { libc::getpid() as u32 }
}
