//! Per-thread ring of shared-memory segments.
//!
//! Each traced thread owns an ordered sequence of fixed-size segments
//! used as append-only event buffers.  A segment starts NEW, is claimed
//! by the producer with RECORDING, and is handed to the recorder with
//! WRITTEN when it fills up; the recorder clears RECORDING once it has
//! drained the bytes, which makes the segment reusable.  The flag word
//! is the only cross-process shared mutable datum, so all transitions
//! are single atomic operations and no lock exists anywhere on this
//! path.
//!
//! Records never straddle segments: when the next record does not fit,
//! the ring rotates to a reusable or freshly mapped segment.  When no
//! segment can be produced, events are dropped and counted; the count
//! is surfaced as a LOST record at the head of the next good segment.

use crate::ctrl_pipe::{CtrlMsgKind, CtrlPipe};
use crate::log::LogLevel::{LogDebug, LogError};
use crate::record::{Record, RECORD_SIZE};
use crate::scoped_fd::ScopedFd;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::sync::atomic::{AtomicU32, Ordering};

pub const SHMEM_FL_NEW: u32 = 1 << 0;
pub const SHMEM_FL_WRITTEN: u32 = 1 << 1;
pub const SHMEM_FL_RECORDING: u32 = 1 << 2;

pub const SEGMENT_HDR_SIZE: usize = 8;

/// How many trailing drained segments the ring tolerates before it
/// starts unmapping them again.
const SHRINK_THRESHOLD: usize = 3;

#[repr(C)]
pub struct SegmentHeader {
    pub flag: AtomicU32,
    pub size: AtomicU32,
}

const_assert_eq!(std::mem::size_of::<SegmentHeader>(), SEGMENT_HDR_SIZE);

/// One mapped segment.  The mapping is private to this process; the
/// underlying shm object is shared with the recorder.
pub struct ShmemBuffer {
    base: *mut u8,
    len: usize,
    name: String,
}

impl ShmemBuffer {
    pub fn create(name: &str, len: usize) -> nix::Result<ShmemBuffer> {
        let fd = ScopedFd::from_raw(shm_open(
            name,
            OFlag::O_RDWR | OFlag::O_CREAT,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?);
        if let Err(e) = ftruncate(fd.as_raw(), len as libc::off_t) {
            let _ = shm_unlink(name);
            return Err(e);
        }
        let base = match unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_raw(),
                0,
            )
        } {
            Ok(p) => p as *mut u8,
            Err(e) => {
                let _ = shm_unlink(name);
                return Err(e);
            }
        };

        let buf = ShmemBuffer {
            base,
            len,
            name: name.to_owned(),
        };
        buf.header().size.store(0, Ordering::Relaxed);
        buf.header().flag.store(SHMEM_FL_NEW, Ordering::Release);
        Ok(buf)
    }

    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.len - SEGMENT_HDR_SIZE
    }

    pub fn used(&self) -> usize {
        self.header().size.load(Ordering::Relaxed) as usize
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.used()
    }

    fn flag(&self) -> u32 {
        self.header().flag.load(Ordering::Acquire)
    }

    pub fn is_recording(&self) -> bool {
        self.flag() & SHMEM_FL_RECORDING != 0
    }

    /// Drained by the consumer: WRITTEN set, RECORDING cleared.
    fn is_written_idle(&self) -> bool {
        let f = self.flag();
        f & SHMEM_FL_RECORDING == 0 && f & SHMEM_FL_WRITTEN != 0
    }

    /// Claims the segment for writing.
    pub fn start_recording(&self) {
        self.header()
            .flag
            .fetch_or(SHMEM_FL_RECORDING, Ordering::AcqRel);
    }

    pub fn reset(&self) {
        self.header().size.store(0, Ordering::Relaxed);
    }

    /// Hands the segment to the recorder.  RECORDING stays set; the
    /// consumer clears it after draining, which is what makes the
    /// segment reusable.
    pub fn finish(&self) {
        self.header()
            .flag
            .store(SHMEM_FL_WRITTEN | SHMEM_FL_RECORDING, Ordering::Release);
    }

    /// Reserves `size` bytes at the tail, or `None` if they do not fit.
    pub fn alloc(&self, size: usize) -> Option<*mut u8> {
        let used = self.used();
        if self.capacity() < used + size {
            return None;
        }
        self.header()
            .size
            .store((used + size) as u32, Ordering::Relaxed);
        Some(unsafe { self.base.add(SEGMENT_HDR_SIZE + used) })
    }

    /// The record bytes written so far.
    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.add(SEGMENT_HDR_SIZE), self.used()) }
    }
}

impl Drop for ShmemBuffer {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

pub struct ShmemRing {
    sid: String,
    tid: u32,
    bufsize: usize,
    buffers: Vec<ShmemBuffer>,
    /// Index of the current write buffer; `None` while dropping.
    curr: Option<usize>,
    seqnum: u32,
    losts: u32,
    /// High-water mark of the ring length.
    max_buf: usize,
}

impl ShmemRing {
    pub fn new(sid: &str, tid: u32, bufsize: usize) -> ShmemRing {
        ShmemRing {
            sid: sid.to_owned(),
            tid,
            bufsize,
            buffers: Vec::new(),
            curr: None,
            seqnum: 0,
            losts: 0,
            max_buf: 0,
        }
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    pub fn losts(&self) -> u32 {
        self.losts
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn curr_buffer(&self) -> Option<&ShmemBuffer> {
        self.curr.map(|i| &self.buffers[i])
    }

    pub fn buffer(&self, idx: usize) -> Option<&ShmemBuffer> {
        self.buffers.get(idx)
    }

    fn seg_name(&self, idx: usize) -> String {
        format!("/ftrace-{}-{}-{:03}", self.sid, self.tid, idx)
    }

    /// Pre-allocates two segments and opens the first for writing.
    pub fn prepare(&mut self, pipe: &CtrlPipe) {
        debug_assert!(self.buffers.is_empty());
        for idx in 0..2 {
            let name = self.seg_name(idx);
            match ShmemBuffer::create(&name, self.bufsize) {
                Ok(b) => self.buffers.push(b),
                Err(e) => {
                    log!(LogError, "cannot allocate segment {}: {}", name, e);
                    break;
                }
            }
        }
        self.max_buf = self.buffers.len();
        if self.buffers.is_empty() {
            self.curr = None;
            return;
        }
        self.buffers[0].start_recording();
        self.curr = Some(0);
        pipe.send_rec(CtrlMsgKind::RecStart, self.buffers[0].name());
    }

    /// Moves to a segment with room in it: reuse the lowest drained or
    /// never-used one, else grow the ring.  On failure the ring enters
    /// dropping mode until a later rotation succeeds.
    pub fn rotate(&mut self, pipe: &CtrlPipe) {
        if let Some(ci) = self.curr.take() {
            pipe.send_rec(CtrlMsgKind::RecEnd, self.buffers[ci].name());
            self.buffers[ci].finish();
        }

        let next = match self.buffers.iter().position(|b| !b.is_recording()) {
            Some(i) => i,
            None => {
                let idx = self.buffers.len();
                let name = self.seg_name(idx);
                match ShmemBuffer::create(&name, self.bufsize) {
                    Ok(b) => {
                        self.buffers.push(b);
                        if self.buffers.len() > self.max_buf {
                            self.max_buf = self.buffers.len();
                        }
                        idx
                    }
                    Err(e) => {
                        log!(LogDebug, "segment allocation failed: {}; dropping", e);
                        return;
                    }
                }
            }
        };

        self.buffers[next].reset();
        self.buffers[next].start_recording();
        self.seqnum += 1;
        self.curr = Some(next);

        let trailing = self
            .buffers
            .iter()
            .rev()
            .take_while(|b| b.is_written_idle())
            .count();
        if trailing >= SHRINK_THRESHOLD {
            let victim = self.buffers.pop().unwrap();
            log!(LogDebug, "shrinking ring, unmapping {}", victim.name());
        }

        pipe.send_rec(CtrlMsgKind::RecStart, self.buffers[next].name());

        if self.losts > 0 {
            let rec = Record::lost(self.losts);
            if let Some(dst) = self.buffers[next].alloc(RECORD_SIZE) {
                unsafe { rec.write_to(dst) };
                pipe.send_lost(self.losts);
                self.losts = 0;
            }
        }
    }

    /// Reserves `size` bytes in the current segment, rotating first if
    /// it cannot fit.  A `None` means the event is dropped and has been
    /// accounted under `losts`.
    pub fn reserve(&mut self, size: usize, pipe: &CtrlPipe) -> Option<*mut u8> {
        let fits = match self.curr {
            Some(ci) => self.buffers[ci].remaining() >= size,
            None => false,
        };
        if !fits {
            self.rotate(pipe);
        }
        match self.curr {
            Some(ci) => match self.buffers[ci].alloc(size) {
                Some(p) => Some(p),
                None => {
                    self.losts += 1;
                    None
                }
            },
            None => {
                self.losts += 1;
                None
            }
        }
    }

    pub fn add_losts(&mut self, n: u32) {
        self.losts += n;
    }

    /// Flushes the current segment to the recorder at thread or process
    /// teardown.
    pub fn finish(&mut self, pipe: &CtrlPipe) {
        if let Some(ci) = self.curr.take() {
            pipe.send_rec(CtrlMsgKind::RecEnd, self.buffers[ci].name());
            self.buffers[ci].finish();
        }
    }

    /// Drops all segment handles without unmapping, for the child side
    /// of a fork: the mappings belong to the parent's ring and the
    /// child must never write into or tear down the parent's buffers.
    pub fn forget(&mut self) {
        for b in self.buffers.drain(..) {
            std::mem::forget(b);
        }
        self.curr = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use std::sync::atomic::{AtomicU32 as Counter, Ordering as COrd};

    static NEXT: Counter = Counter::new(0);

    fn test_ring(tid: u32, bufsize: usize) -> ShmemRing {
        let sid = format!(
            "t{:08x}{:04x}",
            crate::util::getpid(),
            NEXT.fetch_add(1, COrd::Relaxed)
        );
        ShmemRing::new(&sid, tid, bufsize)
    }

    fn unlink_all(ring: &ShmemRing) {
        for i in 0..ring.len() {
            let _ = shm_unlink(ring.buffer(i).unwrap().name());
        }
    }

    /// What the recorder does after draining a segment.
    fn consumer_clear(b: &ShmemBuffer) {
        b.header().flag.store(SHMEM_FL_WRITTEN, Ordering::Release);
    }

    #[test]
    fn segment_flag_lifecycle() {
        let mut ring = test_ring(1, 4096);
        let pipe = CtrlPipe::disabled();
        ring.prepare(&pipe);
        assert_eq!(ring.len(), 2);

        let b0 = ring.buffer(0).unwrap();
        assert!(b0.is_recording());
        assert_eq!(b0.flag() & SHMEM_FL_NEW, SHMEM_FL_NEW);
        let b1 = ring.buffer(1).unwrap();
        assert!(!b1.is_recording());
        assert_eq!(b1.flag(), SHMEM_FL_NEW);

        ring.rotate(&pipe);
        let b0 = ring.buffer(0).unwrap();
        // handed off but not yet drained
        assert!(b0.flag() & SHMEM_FL_WRITTEN != 0);
        assert!(b0.is_recording());
        assert_eq!(ring.curr_buffer().unwrap().name(), ring.buffer(1).unwrap().name());
        unlink_all(&ring);
    }

    #[test]
    fn segment_names_are_zero_padded() {
        let mut ring = test_ring(42, 4096);
        let pipe = CtrlPipe::disabled();
        ring.prepare(&pipe);
        let name = ring.buffer(0).unwrap().name().to_owned();
        assert!(name.starts_with("/ftrace-"));
        assert!(name.ends_with("-42-000"));
        assert!(ring.buffer(1).unwrap().name().ends_with("-42-001"));
        unlink_all(&ring);
    }

    #[test]
    fn rotation_extends_without_consumer_and_reuses_after_drain() {
        let mut ring = test_ring(1, 4096);
        let pipe = CtrlPipe::disabled();
        ring.prepare(&pipe);

        // no consumer: 0 is busy after rotation, 1 is taken, then grow
        ring.rotate(&pipe);
        ring.rotate(&pipe);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.curr_buffer().unwrap().name(), ring.buffer(2).unwrap().name());

        // recorder drains segment 0; next rotation picks it, lowest first
        consumer_clear(ring.buffer(0).unwrap());
        ring.rotate(&pipe);
        assert_eq!(ring.curr_buffer().unwrap().name(), ring.buffer(0).unwrap().name());
        assert_eq!(ring.len(), 3);
        unlink_all(&ring);
    }

    #[test]
    fn records_never_straddle_segments() {
        // capacity of exactly one record
        let mut ring = test_ring(1, SEGMENT_HDR_SIZE + RECORD_SIZE);
        let pipe = CtrlPipe::disabled();
        ring.prepare(&pipe);

        assert!(ring.reserve(RECORD_SIZE, &pipe).is_some());
        let first = ring.curr_buffer().unwrap().name().to_owned();
        assert!(ring.reserve(RECORD_SIZE, &pipe).is_some());
        let second = ring.curr_buffer().unwrap().name().to_owned();
        assert_ne!(first, second);
        assert_eq!(ring.buffer(0).unwrap().used(), RECORD_SIZE);
        assert_eq!(ring.buffer(1).unwrap().used(), RECORD_SIZE);
        assert_eq!(ring.losts(), 0);
        unlink_all(&ring);
    }

    #[test]
    fn oversized_record_is_dropped_and_counted() {
        let mut ring = test_ring(1, SEGMENT_HDR_SIZE + RECORD_SIZE);
        let pipe = CtrlPipe::disabled();
        ring.prepare(&pipe);

        assert!(ring.reserve(RECORD_SIZE * 2, &pipe).is_none());
        assert_eq!(ring.losts(), 1);
        assert!(ring.reserve(RECORD_SIZE * 2, &pipe).is_none());
        // the second attempt rotated, which surfaced the first drop as
        // a LOST record at the head of the fresh segment
        let rec = Record::from_bytes(&ring.curr_buffer().unwrap().payload()[..RECORD_SIZE]);
        assert_eq!(rec.kind, RecordKind::Lost as u16);
        assert_eq!(rec.addr, 1);
        // the second drop is pending for the next good rotation
        assert_eq!(ring.losts(), 1);
        unlink_all(&ring);
    }

    #[test]
    fn lost_record_heads_the_next_segment() {
        let mut ring = test_ring(1, 4096);
        let pipe = CtrlPipe::disabled();
        ring.prepare(&pipe);
        ring.add_losts(5);

        ring.rotate(&pipe);
        assert_eq!(ring.losts(), 0);
        let b = ring.curr_buffer().unwrap();
        let rec = Record::from_bytes(&b.payload()[..RECORD_SIZE]);
        assert_eq!(rec.kind, RecordKind::Lost as u16);
        assert_eq!(rec.addr, 5);
        assert_eq!(rec.time, 0);
        unlink_all(&ring);
    }

    #[test]
    fn ring_shrinks_when_three_trailing_segments_are_drained() {
        let mut ring = test_ring(1, 4096);
        let pipe = CtrlPipe::disabled();
        ring.prepare(&pipe);
        for _ in 0..4 {
            ring.rotate(&pipe);
        }
        assert_eq!(ring.len(), 5);

        for i in 0..5 {
            if !std::ptr::eq(ring.buffer(i).unwrap(), ring.curr_buffer().unwrap()) {
                consumer_clear(ring.buffer(i).unwrap());
            }
        }
        // move off the tail segment first
        ring.rotate(&pipe);
        consumer_clear(ring.buffer(4).unwrap());
        let victim = ring.buffer(4).unwrap().name().to_owned();
        ring.rotate(&pipe);
        assert_eq!(ring.len(), 4);
        assert!(ring
            .curr_buffer()
            .map(|b| b.name() != victim)
            .unwrap_or(false));
        let _ = shm_unlink(victim.as_str());
        unlink_all(&ring);
    }

    #[test]
    fn fork_child_gets_fresh_names() {
        let mut parent = test_ring(100, 4096);
        let pipe = CtrlPipe::disabled();
        parent.prepare(&pipe);
        assert!(parent.reserve(RECORD_SIZE, &pipe).is_some());
        let parent_names: Vec<String> = (0..parent.len())
            .map(|i| parent.buffer(i).unwrap().name().to_owned())
            .collect();

        // child side: same sid, new tid, inherited mappings abandoned
        let sid = parent.sid.clone();
        parent.forget();
        assert!(parent.is_empty());
        let mut child = ShmemRing::new(&sid, 101, 4096);
        child.prepare(&pipe);
        for i in 0..child.len() {
            let name = child.buffer(i).unwrap().name();
            assert!(!parent_names.iter().any(|p| p == name));
        }
        for n in &parent_names {
            let _ = shm_unlink(n.as_str());
        }
        unlink_all(&child);
    }
}
