//! Per-call policy evaluation.
//!
//! `entry_check` decides whether a call is tracked at all and keeps the
//! nested include/exclude counters honest; `entry_record` stamps the
//! decision onto the freshly pushed frame (and captures arguments);
//! `exit_record` unwinds the counters and applies the emission rule.
//!
//! A frame that matched an exclude rule is still pushed, marked
//! NORECORD, so its exit can decrement the counter that silences its
//! subtree.  Likewise a frame entered while tracing is off is pushed
//! as DISABLED so the tree keeps nesting correctly.

use crate::arch::{MceRegs, RetRegs};
use crate::args;
use crate::record::record_trace_data;
use crate::rstack::{rstack_reset, rstack_restore, EntryFlags, ThreadData};
use crate::session::Session;
use crate::trigger::{FilterMode, Trigger, TriggerFlags};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CheckResult {
    In,
    Out,
}

/// Decides whether the call to `child` is tracked.  `Out` means the
/// caller must not push a frame (mcount-style) or must push it as
/// NORECORD (cyg-style).
pub fn entry_check<'a>(
    sess: &'a Session,
    td: &mut ThreadData,
    child: u64,
) -> (CheckResult, Option<&'a Trigger>) {
    if td.idx >= sess.max_stack {
        fatal!("call stack overflow at depth {} (tid {})", td.idx, td.tid);
    }
    td.filter.saved_depth = td.filter.depth;

    if td.filter.out_count > 0 {
        return (CheckResult::Out, None);
    }

    let tr = sess.triggers.lookup(child);
    match tr {
        Some(t) if t.flags.contains(TriggerFlags::FILTER) => {
            match t.fmode {
                FilterMode::Include => td.filter.in_count += 1,
                FilterMode::Exclude => td.filter.out_count += 1,
                FilterMode::None => {}
            }
            td.filter.depth = sess.default_depth;
        }
        _ => {
            if sess.filter_mode == FilterMode::Include && td.filter.in_count == 0 {
                return (CheckResult::Out, tr);
            }
        }
    }

    if let Some(t) = tr {
        if t.flags.contains(TriggerFlags::DEPTH) {
            td.filter.depth = t.depth;
        }
        if t.flags.contains(TriggerFlags::TRACE_ON) {
            sess.set_enabled(true);
        }
        if t.flags.contains(TriggerFlags::TRACE_OFF) {
            sess.set_enabled(false);
        }
    }

    if !sess.enabled() {
        // still tracked so the subtree nests; marked DISABLED later
        return (CheckResult::In, tr);
    }

    if td.filter.depth <= 0 {
        return (CheckResult::Out, tr);
    }
    td.filter.depth -= 1;
    (CheckResult::In, tr)
}

/// Stamps the filter decision onto the pushed frame at `ridx`, packs
/// arguments, and reacts to an enable-flag transition.
pub fn entry_record(
    sess: &Session,
    td: &mut ThreadData,
    ridx: usize,
    tr: Option<&Trigger>,
    regs: Option<&MceRegs>,
) {
    let filtered_out = td.filter.out_count > 0
        || (sess.filter_mode == FilterMode::Include && td.filter.in_count == 0);
    {
        let entry = &mut td.rstack[ridx];
        if filtered_out {
            entry.flags |= EntryFlags::NORECORD;
        }
        entry.filter_depth = td.filter.saved_depth;
        entry.pargs = tr.map_or(std::ptr::null(), |t| t as *const Trigger);
        if let Some(t) = tr {
            if t.flags.contains(TriggerFlags::FILTER) {
                match t.fmode {
                    FilterMode::Include => entry.flags |= EntryFlags::FILTERED,
                    FilterMode::Exclude => entry.flags |= EntryFlags::NOTRACE,
                    FilterMode::None => {}
                }
            }
            if t.flags.contains(TriggerFlags::RETVAL) {
                entry.flags |= EntryFlags::RETVAL;
            }
            if t.flags.contains(TriggerFlags::TRACE) {
                entry.flags |= EntryFlags::TRACE;
            }
            if t.flags.contains(TriggerFlags::RECOVER) {
                entry.flags |= EntryFlags::RECOVER;
            }
        }
    }

    if !td.rstack[ridx].flags.contains(EntryFlags::NORECORD) {
        td.record_idx += 1;
        let enabled = sess.enabled();
        if !enabled {
            td.rstack[ridx].flags |= EntryFlags::DISABLED;
        } else if let Some(t) = tr {
            if t.flags.contains(TriggerFlags::ARGUMENT) {
                let parent_loc = td.rstack[ridx].parent_loc;
                let packed =
                    args::pack_entry_args(&t.args, regs, parent_loc, td.argbuf_slot(ridx))
                        .map(|n| n > 0)
                        .unwrap_or(false);
                if packed {
                    td.rstack[ridx].flags |= EntryFlags::ARGUMENT;
                }
            }
        }
        if td.enable_cached != enabled {
            if !enabled {
                // tracing just went off: push out what is in flight
                record_trace_data(td, ridx, None, &sess.pipe);
            }
            td.enable_cached = enabled;
        }
    }

    if td.rstack[ridx].flags.contains(EntryFlags::RECOVER) {
        // give the traced code its natural call chain; this frame's own
        // slot is hijacked again so its exit still lands in the runtime
        rstack_restore(&td.rstack, td.idx);
        let entry = &td.rstack[ridx];
        let tramp = crate::arch::ret_trampoline();
        if !entry.parent_loc.is_null() && tramp != 0 {
            unsafe {
                *entry.parent_loc = tramp;
            }
        }
    }
}

/// Unwinds the filter state for the finished frame at `ridx` and emits
/// its records when the emission rule passes.
pub fn exit_record(sess: &Session, td: &mut ThreadData, ridx: usize, retregs: Option<&RetRegs>) {
    td.filter.depth = td.rstack[ridx].filter_depth;
    let flags = td.rstack[ridx].flags;
    if flags.contains(EntryFlags::FILTERED) {
        td.filter.in_count -= 1;
    }
    if flags.contains(EntryFlags::NOTRACE) {
        td.filter.out_count -= 1;
    }

    if flags.contains(EntryFlags::RECOVER) {
        rstack_reset(&td.rstack, td.idx, crate::arch::ret_trampoline());
    }

    if flags.contains(EntryFlags::NORECORD) {
        return;
    }
    td.record_idx -= 1;

    if flags.contains(EntryFlags::DISABLED) {
        return;
    }

    let duration = td.rstack[ridx]
        .end_time
        .wrapping_sub(td.rstack[ridx].start_time);
    if flags.intersects(EntryFlags::WRITTEN | EntryFlags::TRACE) || duration >= sess.threshold_ns {
        let rv = if flags.contains(EntryFlags::RETVAL) && sess.enabled() {
            retregs
        } else {
            None
        };
        record_trace_data(td, ridx, rv, &sess.pipe);
    }
}
