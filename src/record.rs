//! Event record layout and the deferred-emission encoder.
//!
//! Records are only guaranteed to reach a buffer at exit time: when a
//! call ends (or a flush is forced), the encoder walks the return stack
//! backwards to the deepest ancestor whose ENTRY has not been emitted
//! yet, emits the missing ENTRY records oldest-first, then the EXIT for
//! the finished frame.  Short calls that never cross the duration
//! threshold simply vanish without ever touching a buffer.

use crate::arch::RetRegs;
use crate::args;
use crate::args::ARGBUF_SIZE;
use crate::ctrl_pipe::CtrlPipe;
use crate::rstack::{EntryFlags, RStackEntry, ThreadData};
use crate::shmem::ShmemRing;

pub const RECORD_SIZE: usize = 24;

/// Constant filler for the reserved byte.
pub const RECORD_SENTINEL: u8 = 0xa5;

#[repr(u16)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RecordKind {
    Entry = 0,
    Exit = 1,
    Lost = 2,
}

/// Fixed part of every event record, written packed little-endian and
/// naturally aligned to 8 so an optional payload that follows stays
/// aligned too.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Record {
    /// ENTRY: start time, EXIT: end time, LOST: zero.
    pub time: u64,
    pub kind: u16,
    pub unused: u8,
    /// Non-zero when an argument/retval payload follows.
    pub more: u8,
    /// Recorded depth.
    pub depth: u16,
    pub pad: u16,
    /// Callee address, or the drop count for LOST.
    pub addr: u64,
}

const_assert_eq!(std::mem::size_of::<Record>(), RECORD_SIZE);
const_assert_eq!(std::mem::align_of::<Record>(), 8);

impl Record {
    pub fn lost(count: u32) -> Record {
        Record {
            time: 0,
            kind: RecordKind::Lost as u16,
            unused: RECORD_SENTINEL,
            more: 0,
            depth: 0,
            pad: 0,
            addr: count as u64,
        }
    }

    /// # Safety
    /// `dst` must be writable for `RECORD_SIZE` bytes.
    pub unsafe fn write_to(&self, dst: *mut u8) {
        std::ptr::copy_nonoverlapping(self as *const Record as *const u8, dst, RECORD_SIZE);
    }

    pub fn from_bytes(bytes: &[u8]) -> Record {
        assert!(bytes.len() >= RECORD_SIZE);
        unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Record) }
    }
}

pub fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Appends one fixed record plus optional payload bytes to the ring.
/// Returns false when the event was dropped (the ring has already
/// accounted for it).
pub fn record_ret_stack(
    ring: &mut ShmemRing,
    pipe: &CtrlPipe,
    kind: RecordKind,
    entry: &RStackEntry,
    payload: Option<&[u8]>,
) -> bool {
    let plen = payload.map_or(0, |p| p.len());
    let total = RECORD_SIZE + align8(plen);
    let dst = match ring.reserve(total, pipe) {
        Some(d) => d,
        None => return false,
    };

    let rec = Record {
        time: match kind {
            RecordKind::Entry => entry.start_time,
            RecordKind::Exit => entry.end_time,
            RecordKind::Lost => 0,
        },
        kind: kind as u16,
        unused: RECORD_SENTINEL,
        more: (plen > 0) as u8,
        depth: entry.depth as u16,
        pad: 0,
        addr: entry.child_ip,
    };
    unsafe {
        rec.write_to(dst);
        if let Some(p) = payload {
            std::ptr::copy_nonoverlapping(p.as_ptr(), dst.add(RECORD_SIZE), plen);
            std::ptr::write_bytes(dst.add(RECORD_SIZE + plen), 0, align8(plen) - plen);
        }
    }
    true
}

/// Emits the backlog of unwritten ENTRY records below `top`, then the
/// EXIT for `top` itself when it has ended.  Called at an exit that
/// passes the emission rule, or as a forced flush (trace turned off,
/// thread teardown).
///
/// A mid-walk drop leaves the remaining frames unwritten so a later
/// descendant exit retries them; the skipped tail is counted as lost.
pub fn record_trace_data(
    td: &mut ThreadData,
    top: usize,
    retval: Option<&RetRegs>,
    pipe: &CtrlPipe,
) {
    let ThreadData {
        ref mut rstack,
        ref mut argbuf,
        ref mut shmem,
        ..
    } = *td;

    let mut lo = top + 1;
    while lo > 0 && !rstack[lo - 1].flags.contains(EntryFlags::WRITTEN) {
        lo -= 1;
    }

    let mut failed = false;
    let mut skipped: u32 = 0;
    for i in lo..=top {
        if rstack[i]
            .flags
            .intersects(EntryFlags::NORECORD | EntryFlags::DISABLED)
        {
            continue;
        }
        if failed {
            skipped += 1;
            continue;
        }
        let payload = if rstack[i].flags.contains(EntryFlags::ARGUMENT) {
            Some(args::slot_payload(
                &argbuf[i * ARGBUF_SIZE..(i + 1) * ARGBUF_SIZE],
            ))
        } else {
            None
        };
        if record_ret_stack(shmem, pipe, RecordKind::Entry, &rstack[i], payload) {
            rstack[i].flags |= EntryFlags::WRITTEN;
        } else {
            failed = true;
        }
    }

    if rstack[top].end_time != 0 {
        if failed {
            skipped += 1;
        } else {
            let mut payload: Option<&[u8]> = None;
            // Pack the retval only now, after the ENTRY backlog went
            // out: the slot may still hold this frame's argument bytes.
            if let Some(rv) = retval {
                if rstack[top].flags.contains(EntryFlags::RETVAL) && !rstack[top].pargs.is_null() {
                    let specs = unsafe { &(*rstack[top].pargs).args };
                    let range = top * ARGBUF_SIZE..(top + 1) * ARGBUF_SIZE;
                    let packed = args::pack_retval(specs, Some(rv), &mut argbuf[range.clone()])
                        .map(|n| n > 0)
                        .unwrap_or(false);
                    if packed {
                        payload = Some(args::slot_payload(&argbuf[range]));
                    }
                }
            }
            record_ret_stack(shmem, pipe, RecordKind::Exit, &rstack[top], payload);
        }
    }

    if skipped > 0 {
        shmem.add_losts(skipped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn wire_layout() {
        assert_eq!(offset_of!(Record, time), 0);
        assert_eq!(offset_of!(Record, kind), 8);
        assert_eq!(offset_of!(Record, unused), 10);
        assert_eq!(offset_of!(Record, more), 11);
        assert_eq!(offset_of!(Record, depth), 12);
        assert_eq!(offset_of!(Record, addr), 16);
    }

    #[test]
    fn roundtrip_through_bytes() {
        let rec = Record {
            time: 0x1122_3344_5566_7788,
            kind: RecordKind::Exit as u16,
            unused: RECORD_SENTINEL,
            more: 1,
            depth: 7,
            pad: 0,
            addr: 0x0040_0500,
        };
        let mut buf = [0u8; RECORD_SIZE];
        unsafe { rec.write_to(buf.as_mut_ptr()) };
        let back = Record::from_bytes(&buf);
        assert_eq!(back.time, rec.time);
        assert_eq!(back.kind, rec.kind);
        assert_eq!(back.more, 1);
        assert_eq!(back.depth, 7);
        assert_eq!(back.addr, rec.addr);
    }

    #[test]
    fn align8_pads_up() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(13), 16);
    }
}
