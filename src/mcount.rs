//! Instrumentation entry points and runtime lifecycle.
//!
//! Two hook styles share the filter/record path.  The mcount style
//! (`mcount_entry`/`mcount_exit`, reached through the arch stubs)
//! hijacks the caller's return address so exits are observed without
//! exit instrumentation; the cyg-profile style gets explicit exit calls
//! and never touches return addresses.
//!
//! Process-wide state is established by the first hook invocation on
//! any thread; later threads block on the same initialization.  A
//! per-thread recursion guard makes every hook a no-op while the
//! runtime itself is running, which breaks the cycle with a traced
//! program that instruments its own allocator: any allocation the
//! runtime performs happens with the guard already held.

use crate::arch;
use crate::arch::{MceRegs, RetRegs};
use crate::ctrl_pipe::CtrlMsgKind;
use crate::filter;
use crate::filter::CheckResult;
use crate::flags::Flags;
use crate::log::LogLevel::{LogDebug, LogInfo};
use crate::rstack::{rstack_restore, EntryFlags, ThreadData};
use crate::session::Session;
use crate::shmem::ShmemRing;
use crate::util;
use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

lazy_static! {
    static ref SESSION: Session = session_init();
}

/// Set once by fini; hooks observing it stay out of the way.
static MCOUNT_FINISHED: AtomicBool = AtomicBool::new(false);

static FORK_PPID: AtomicU32 = AtomicU32::new(0);

/// The pthread key whose destructor tears per-thread state down.
static TLS_KEY: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static GUARD: Cell<bool> = Cell::new(false);
    static TLS_TD: Cell<*mut ThreadData> = Cell::new(std::ptr::null_mut());
}

/// Every live thread's state, so process fini can drain rings owned by
/// threads other than the one running the destructor.  Guarded by a
/// spin flag rather than a mutex: the registry is touched only at
/// thread birth and death, and a raw flag can be taken across `fork`
/// by the atfork handlers so the child never inherits it held.
struct ThreadRegistry {
    lock: AtomicBool,
    list: UnsafeCell<Vec<*mut ThreadData>>,
}

unsafe impl Sync for ThreadRegistry {}

static THREADS: ThreadRegistry = ThreadRegistry {
    lock: AtomicBool::new(false),
    list: UnsafeCell::new(Vec::new()),
};

impl ThreadRegistry {
    fn acquire(&self) {
        while self.lock.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }

    fn with<R>(&self, f: impl FnOnce(&mut Vec<*mut ThreadData>) -> R) -> R {
        self.acquire();
        let r = f(unsafe { &mut *self.list.get() });
        self.release();
        r
    }

    fn register(&self, td: *mut ThreadData) {
        self.with(|v| v.push(td));
    }

    fn unregister(&self, td: *mut ThreadData) {
        self.with(|v| v.retain(|&p| p != td));
    }
}

struct RecursionGuard;

impl RecursionGuard {
    /// `None` when this thread is already inside the runtime (or its
    /// TLS is gone); the hook must then do nothing.
    fn enter() -> Option<RecursionGuard> {
        GUARD
            .try_with(|g| {
                if g.get() {
                    None
                } else {
                    g.set(true);
                    Some(RecursionGuard)
                }
            })
            .unwrap_or(None)
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        let _ = GUARD.try_with(|g| g.set(false));
    }
}

/// True when hooks on this thread must be no-ops.
pub fn mcount_should_stop() -> bool {
    MCOUNT_FINISHED.load(Ordering::Relaxed) || GUARD.try_with(|g| g.get()).unwrap_or(true)
}

fn session_init() -> Session {
    let flags = Flags::get();
    let exe_path = match std::fs::read_link("/proc/self/exe") {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(e) => fatal!("cannot read own executable path: {}", e),
    };
    let sess = Session::from_flags(flags, exe_path);

    if let Err(e) = std::fs::create_dir_all(&flags.out_dir) {
        fatal!("cannot create output directory {}: {}", flags.out_dir, e);
    }
    let maps = format!("{}/sid-{}.map", flags.out_dir, sess.sid);
    if let Err(e) = std::fs::copy("/proc/self/maps", &maps) {
        fatal!("cannot record address maps to {}: {}", maps, e);
    }

    let mut key: libc::pthread_key_t = 0;
    if unsafe { libc::pthread_key_create(&mut key, Some(thread_teardown)) } != 0 {
        fatal!("cannot create thread teardown key");
    }
    TLS_KEY.store(key, Ordering::Relaxed);

    unsafe {
        libc::pthread_atfork(Some(atfork_prepare), Some(atfork_parent), Some(atfork_child));
        libc::atexit(fini_at_exit);
    }

    sess.pipe.send_session(&sess.sid, sess.exe_name());
    log!(LogInfo, "session {} tracing {}", sess.sid, sess.exe_path);
    sess
}

fn thread_data() -> Option<&'static mut ThreadData> {
    let ptr = TLS_TD.try_with(|c| c.get()).ok()?;
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &mut *ptr })
    }
}

/// First hook on this thread: allocate the stack and scratch arenas,
/// announce the thread, open its segment ring.  Runs with the guard
/// held, so the allocations cannot reenter us.
fn thread_init(sess: &Session) -> Option<&'static mut ThreadData> {
    let tid = util::gettid();
    let td = Box::new(ThreadData::new(
        tid,
        sess.max_stack,
        sess.default_depth,
        sess.enabled(),
        &sess.sid,
        sess.buffer_size,
    ));
    let ptr = Box::into_raw(td);
    if TLS_TD.try_with(|c| c.set(ptr)).is_err() {
        // the thread is already past TLS destruction
        drop(unsafe { Box::from_raw(ptr) });
        return None;
    }
    let key = TLS_KEY.load(Ordering::Relaxed);
    if key != 0 {
        unsafe {
            libc::pthread_setspecific(key, ptr as *mut libc::c_void);
        }
    }
    THREADS.register(ptr);

    sess.pipe.send_task(CtrlMsgKind::Tid, util::getpid(), tid);
    let td = unsafe { &mut *ptr };
    td.shmem.prepare(&sess.pipe);
    log!(LogDebug, "thread {} ready, ring of {}", tid, td.shmem.len());
    Some(td)
}

unsafe extern "C" fn thread_teardown(ptr: *mut libc::c_void) {
    if ptr.is_null() {
        return;
    }
    let _ = GUARD.try_with(|g| g.set(true));
    let _ = TLS_TD.try_with(|c| c.set(std::ptr::null_mut()));
    // waits out any fini walk before the state goes away
    THREADS.unregister(ptr as *mut ThreadData);
    let mut td = Box::from_raw(ptr as *mut ThreadData);
    td.shmem.finish(&SESSION.pipe);
    drop(td);
    let _ = GUARD.try_with(|g| g.set(false));
}

/// mcount-style entry hook.  Returns -1 when the call is not tracked;
/// the stub then leaves the return address alone.
#[no_mangle]
pub extern "C" fn mcount_entry(parent_loc: *mut u64, child: u64, regs: *const MceRegs) -> i32 {
    if mcount_should_stop() {
        return -1;
    }
    let _guard = match RecursionGuard::enter() {
        Some(g) => g,
        None => return -1,
    };
    let tramp = arch::ret_trampoline();
    if tramp == 0 {
        // no exit hook on this target; only cyg-profile tracing works
        return -1;
    }

    let sess: &Session = &*SESSION;
    let td = match thread_data() {
        Some(td) => td,
        None => match thread_init(sess) {
            Some(td) => td,
            None => return -1,
        },
    };

    let parent_loc = arch::fixup_parent_loc(parent_loc);
    let (res, tr) = filter::entry_check(sess, td, child);
    if res == CheckResult::Out {
        return -1;
    }

    let ridx = td.idx;
    td.idx += 1;
    {
        let e = &mut td.rstack[ridx];
        e.depth = td.record_idx as u32;
        e.parent_loc = parent_loc;
        e.parent_ip = if parent_loc.is_null() {
            0
        } else {
            unsafe { *parent_loc }
        };
        e.child_ip = child;
        e.start_time = util::now_ns();
        e.end_time = 0;
        e.flags = EntryFlags::empty();
        e.pargs = std::ptr::null();
        e.dyn_idx = None;
    }
    if !parent_loc.is_null() {
        unsafe {
            *parent_loc = tramp;
        }
    }

    filter::entry_record(sess, td, ridx, tr, unsafe { regs.as_ref() });
    0
}

/// Return-trampoline landing point: pops the finished frame and hands
/// back the original return address.  Must make progress even after
/// fini or under the guard, or the traced program cannot return.
#[no_mangle]
pub extern "C" fn mcount_exit(retregs: *mut RetRegs) -> u64 {
    let outer_guard = GUARD
        .try_with(|g| {
            let v = g.get();
            g.set(true);
            v
        })
        .unwrap_or(true);

    let td = match thread_data() {
        Some(td) => td,
        None => fatal!("return trampoline hit without thread state"),
    };
    if td.idx == 0 {
        fatal!("return trampoline hit with an empty call stack");
    }
    let ridx = td.idx - 1;
    let parent_ip = td.rstack[ridx].parent_ip;

    if !MCOUNT_FINISHED.load(Ordering::Relaxed) {
        td.rstack[ridx].end_time = util::now_ns();
        filter::exit_record(&*SESSION, td, ridx, unsafe { retregs.as_ref() });
    }
    td.idx -= 1;

    if !outer_guard {
        let _ = GUARD.try_with(|g| g.set(false));
    }
    parent_ip
}

/// cyg-profile entry hook.  Always pushes a frame, even filtered-out
/// ones, so the paired exit hook pops exactly one.
#[no_mangle]
pub extern "C" fn __cyg_profile_func_enter(child: *mut libc::c_void, parent: *mut libc::c_void) {
    if mcount_should_stop() {
        return;
    }
    let _guard = match RecursionGuard::enter() {
        Some(g) => g,
        None => return,
    };
    let sess: &Session = &*SESSION;
    let td = match thread_data() {
        Some(td) => td,
        None => match thread_init(sess) {
            Some(td) => td,
            None => return,
        },
    };

    let (res, tr) = filter::entry_check(sess, td, child as u64);
    let ridx = td.idx;
    td.idx += 1;
    {
        let e = &mut td.rstack[ridx];
        e.depth = td.record_idx as u32;
        e.parent_loc = std::ptr::null_mut();
        e.parent_ip = parent as u64;
        e.child_ip = child as u64;
        e.end_time = 0;
        e.pargs = std::ptr::null();
        e.dyn_idx = None;
        if res == CheckResult::In {
            e.start_time = util::now_ns();
            e.flags = EntryFlags::empty();
        } else {
            // zero start time; the emission rule keys off the flags,
            // not the bogus duration this produces
            e.start_time = 0;
            e.flags = EntryFlags::NORECORD;
        }
    }
    filter::entry_record(sess, td, ridx, tr, None);
}

#[no_mangle]
pub extern "C" fn __cyg_profile_func_exit(_child: *mut libc::c_void, _parent: *mut libc::c_void) {
    if mcount_should_stop() {
        return;
    }
    let _guard = match RecursionGuard::enter() {
        Some(g) => g,
        None => return,
    };
    let td = match thread_data() {
        Some(td) => td,
        None => return,
    };
    if td.idx == 0 {
        return;
    }
    let ridx = td.idx - 1;
    if !td.rstack[ridx].flags.contains(EntryFlags::NORECORD) {
        td.rstack[ridx].end_time = util::now_ns();
    }
    filter::exit_record(&*SESSION, td, ridx, None);
    td.idx -= 1;
}

unsafe extern "C" fn atfork_prepare() {
    let pid = util::getpid();
    FORK_PPID.store(pid, Ordering::Relaxed);
    SESSION.pipe.send_task(CtrlMsgKind::ForkStart, pid, 0);
    // taken last so the child starts with a coherent, unheld registry
    THREADS.acquire();
}

unsafe extern "C" fn atfork_parent() {
    THREADS.release();
}

/// The child keeps its call stack but must not touch the parent's
/// buffers: the inherited mappings are abandoned unmapped and a fresh
/// ring is opened under the child's tid.  Registry entries for the
/// parent's other threads are dropped; those threads do not exist here
/// and their rings belong to the parent.
unsafe extern "C" fn atfork_child() {
    THREADS.release();
    util::clear_tid_cache();
    let _ = GUARD.try_with(|g| g.set(true));
    let own = TLS_TD
        .try_with(|c| c.get())
        .unwrap_or(std::ptr::null_mut());
    THREADS.with(|v| v.retain(|&p| p == own));
    if let Some(td) = thread_data() {
        td.shmem.forget();
        td.tid = util::gettid();
        td.shmem = ShmemRing::new(&SESSION.sid, td.tid, SESSION.buffer_size);
        td.shmem.prepare(&SESSION.pipe);
    }
    SESSION.pipe.send_task(
        CtrlMsgKind::ForkEnd,
        FORK_PPID.load(Ordering::Relaxed),
        util::getpid(),
    );
    let _ = GUARD.try_with(|g| g.set(false));
}

extern "C" fn fini_at_exit() {
    mcount_fini();
}

/// Process fini: drain every live thread's ring, close the channel,
/// stop all hooks.  The stop flag goes up first, so threads still
/// running see their hooks turn into no-ops before their state is
/// touched; hijacked return addresses still in flight are restored so
/// late returns bypass the runtime entirely.
pub fn mcount_fini() {
    if MCOUNT_FINISHED.swap(true, Ordering::Relaxed) {
        return;
    }
    let _ = GUARD.try_with(|g| g.set(true));
    THREADS.with(|threads| {
        for &ptr in threads.iter() {
            let td = unsafe { &mut *ptr };
            rstack_restore(&td.rstack, td.idx);
            td.idx = 0;
            td.shmem.finish(&SESSION.pipe);
        }
    });
    SESSION.pipe.close();
    let key = TLS_KEY.swap(0, Ordering::Relaxed);
    if key != 0 {
        unsafe {
            libc::pthread_key_delete(key);
        }
    }
    let _ = GUARD.try_with(|g| g.set(false));
    log!(LogDebug, "tracing finished");
}

#[no_mangle]
pub extern "C" fn _mcleanup() {
    mcount_fini();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_registry_tracks_live_pointers() {
        let a = 0x1000 as *mut ThreadData;
        let b = 0x2000 as *mut ThreadData;
        THREADS.register(a);
        THREADS.register(b);
        assert!(THREADS.with(|v| v.contains(&a) && v.contains(&b)));
        THREADS.unregister(a);
        assert!(THREADS.with(|v| !v.contains(&a) && v.contains(&b)));
        THREADS.unregister(b);
        assert!(THREADS.with(|v| !v.contains(&b)));
    }

    #[test]
    fn recursion_guard_blocks_nesting() {
        assert!(!GUARD.with(|g| g.get()));
        let g = RecursionGuard::enter().unwrap();
        assert!(RecursionGuard::enter().is_none());
        assert!(mcount_should_stop());
        drop(g);
        assert!(RecursionGuard::enter().is_some());
    }
}
