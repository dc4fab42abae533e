//! Per-thread return stack and thread-local tracing state.
//!
//! The stack is a bounded array indexed by depth, allocated once at
//! thread init; pushing a frame never allocates.  The argument scratch
//! buffer is a parallel arena: slot `i` always belongs to stack slot
//! `i`, so argument bytes survive exactly as long as their frame.

use crate::args::ARGBUF_SIZE;
use crate::shmem::ShmemRing;
use crate::trigger::Trigger;

bitflags! {
    pub struct EntryFlags: u32 {
        /// The ENTRY record has been emitted to a buffer.
        const WRITTEN  = 1 << 0;
        /// Filtered out; the frame only nests, it is never recorded.
        const NORECORD = 1 << 1;
        /// This frame matched an include filter and bumped `in_count`.
        const FILTERED = 1 << 2;
        /// This frame matched an exclude filter and bumped `out_count`.
        const NOTRACE  = 1 << 3;
        /// Argument payload is packed in the frame's scratch slot.
        const ARGUMENT = 1 << 4;
        /// Capture the return value at exit.
        const RETVAL   = 1 << 5;
        /// Force emission regardless of the duration threshold.
        const TRACE    = 1 << 6;
        /// Entered while tracing was off; nests but is not emitted.
        const DISABLED = 1 << 7;
        /// Caller return addresses are restored for this call and must
        /// be hijacked again at exit.
        const RECOVER  = 1 << 8;
    }
}

/// One in-flight call.
#[derive(Clone)]
pub struct RStackEntry {
    /// Recorded depth at entry time.
    pub depth: u32,
    /// Address of the slot holding the caller's return address, or
    /// null for hooks that do not hijack.
    pub parent_loc: *mut u64,
    /// Original value of `*parent_loc`.
    pub parent_ip: u64,
    /// Callee address.
    pub child_ip: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub flags: EntryFlags,
    /// Filter depth budget to restore at exit.
    pub filter_depth: i32,
    /// Trigger carrying the argument/retval specs, when any.
    pub pargs: *const Trigger,
    /// PLT slot index for dynamically hooked calls.
    pub dyn_idx: Option<u32>,
}

impl Default for RStackEntry {
    fn default() -> RStackEntry {
        RStackEntry {
            depth: 0,
            parent_loc: std::ptr::null_mut(),
            parent_ip: 0,
            child_ip: 0,
            start_time: 0,
            end_time: 0,
            flags: EntryFlags::empty(),
            filter_depth: 0,
            pargs: std::ptr::null(),
            dyn_idx: None,
        }
    }
}

/// Mutable filter-engine state, one per thread.
#[derive(Clone)]
pub struct FilterState {
    /// Remaining allowed depth.
    pub depth: i32,
    /// Nested include matches currently on the stack.
    pub in_count: i32,
    /// Nested exclude matches currently on the stack.
    pub out_count: i32,
    /// Scratch: depth as it was before the current entry check.
    pub saved_depth: i32,
}

pub struct ThreadData {
    pub tid: u32,
    /// Current stack depth; fatal when it would pass the stack bound.
    pub idx: usize,
    /// Logical recorded depth: frames on the stack not marked NORECORD.
    pub record_idx: usize,
    pub rstack: Vec<RStackEntry>,
    /// Argument scratch, `ARGBUF_SIZE` bytes per stack slot.
    pub argbuf: Vec<u8>,
    pub filter: FilterState,
    /// Last observed value of the global enable flag.
    pub enable_cached: bool,
    pub shmem: ShmemRing,
}

impl ThreadData {
    pub fn new(
        tid: u32,
        max_stack: usize,
        default_depth: i32,
        enabled: bool,
        sid: &str,
        bufsize: usize,
    ) -> ThreadData {
        ThreadData {
            tid,
            idx: 0,
            record_idx: 0,
            rstack: vec![RStackEntry::default(); max_stack],
            argbuf: vec![0u8; max_stack * ARGBUF_SIZE],
            filter: FilterState {
                depth: default_depth,
                in_count: 0,
                out_count: 0,
                saved_depth: default_depth,
            },
            enable_cached: enabled,
            shmem: ShmemRing::new(sid, tid, bufsize),
        }
    }

    pub fn argbuf_slot(&mut self, idx: usize) -> &mut [u8] {
        &mut self.argbuf[idx * ARGBUF_SIZE..(idx + 1) * ARGBUF_SIZE]
    }
}

/// Puts the original return addresses back into every in-flight frame
/// so the traced code observes its natural callers.
pub fn rstack_restore(rstack: &[RStackEntry], depth: usize) {
    for entry in rstack[..depth].iter().rev() {
        if !entry.parent_loc.is_null() {
            unsafe {
                *entry.parent_loc = entry.parent_ip;
            }
        }
    }
}

/// Re-installs the return trampoline in every in-flight frame, undoing
/// `rstack_restore`.
pub fn rstack_reset(rstack: &[RStackEntry], depth: usize, trampoline: u64) {
    if trampoline == 0 {
        return;
    }
    for entry in rstack[..depth].iter().rev() {
        if !entry.parent_loc.is_null() {
            unsafe {
                *entry.parent_loc = trampoline;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argbuf_slots_pair_with_stack_slots() {
        let mut td = ThreadData::new(1, 8, 4, true, "sid", 4096);
        assert_eq!(td.rstack.len(), 8);
        assert_eq!(td.argbuf.len(), 8 * ARGBUF_SIZE);
        td.argbuf_slot(3)[0] = 0xaa;
        assert_eq!(td.argbuf[3 * ARGBUF_SIZE], 0xaa);
        assert_eq!(td.argbuf[2 * ARGBUF_SIZE], 0);
    }

    #[test]
    fn restore_and_reset_walk_only_inflight_frames() {
        let mut slots = [0xdead_u64; 3];
        let mut rstack = vec![RStackEntry::default(); 4];
        for (i, slot) in slots.iter_mut().enumerate() {
            rstack[i].parent_loc = slot as *mut u64;
            rstack[i].parent_ip = 0x1000 + i as u64;
        }
        // frame 3 is not in flight
        rstack[3].parent_loc = std::ptr::null_mut();

        rstack_restore(&rstack, 3);
        assert_eq!(slots, [0x1000, 0x1001, 0x1002]);

        rstack_reset(&rstack, 3, 0x9999);
        assert_eq!(slots, [0x9999; 3]);

        // a zero trampoline means no hijacking on this target
        rstack_restore(&rstack, 3);
        rstack_reset(&rstack, 3, 0);
        assert_eq!(slots, [0x1000, 0x1001, 0x1002]);
    }
}
