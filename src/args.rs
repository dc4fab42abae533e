//! Argument and return-value capture.
//!
//! Captured values are packed into a per-stack-slot scratch buffer at
//! entry (or exit, for retvals) and copied into the event stream when
//! the record is emitted.  Slot layout: a leading `u32` holding the
//! payload byte count, then the payload itself.  The length header
//! never reaches the stream; it only sizes the copy.
//!
//! Payload encoding, one entry per matching `ArgSpec` in declaration
//! order:
//! - fixed-size values: the value's bytes, padded up to 4
//! - strings: `u16` length, the bytes, a trailing NUL, padded to 4; a
//!   null pointer is the sentinel length 4 with bytes `0xFF x 4`

use crate::arch::{MceRegs, RetRegs};
use crate::log::LogLevel::LogDebug;

pub const ARGBUF_SIZE: usize = 1024;

/// Longest string payload we will chase through a traced pointer.
const MAX_STR_LEN: usize = ARGBUF_SIZE - 8;

const NULL_STR_LEN: u16 = 4;
const NULL_STR_BYTES: [u8; 4] = [0xff; 4];

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ArgKind {
    /// Integer of the given byte size (1, 2, 4 or 8).
    Int(u8),
    /// Floating point of the given byte size (4 or 8).
    Float(u8),
    Str,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ArgSource {
    /// N-th argument in declaration order, 1-based.  Integer arguments
    /// beyond the register file are fetched from the caller's stack.
    Arg(u8),
    /// N-th stack slot above the return address, 1-based.
    Stack(u8),
    Retval,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ArgSpec {
    pub kind: ArgKind,
    pub source: ArgSource,
}

impl ArgSpec {
    pub fn is_retval(&self) -> bool {
        self.source == ArgSource::Retval
    }
}

enum Value {
    Scalar(u64),
    Wide([u8; 16]),
}

fn fetch_entry(
    spec: &ArgSpec,
    regs: Option<&MceRegs>,
    parent_loc: *mut u64,
) -> Option<Value> {
    match (spec.kind, spec.source) {
        (ArgKind::Float(_), ArgSource::Arg(n)) => regs?.fp_arg(n as usize).map(Value::Wide),
        (_, ArgSource::Arg(n)) => {
            let n = n as usize;
            if n == 0 {
                return None;
            }
            if n <= MceRegs::INT_ARG_REGS {
                regs?.int_arg(n).map(Value::Scalar)
            } else if !parent_loc.is_null() {
                // arg 7 sits one slot above the return address
                Some(Value::Scalar(unsafe {
                    *parent_loc.add(n - MceRegs::INT_ARG_REGS)
                }))
            } else {
                None
            }
        }
        (_, ArgSource::Stack(n)) => {
            if parent_loc.is_null() || n == 0 {
                None
            } else {
                Some(Value::Scalar(unsafe { *parent_loc.add(n as usize) }))
            }
        }
        (_, ArgSource::Retval) => None,
    }
}

fn fetch_retval(spec: &ArgSpec, regs: Option<&RetRegs>) -> Option<Value> {
    let regs = regs?;
    match spec.kind {
        ArgKind::Float(_) => Some(Value::Wide(regs.fp_retval())),
        _ => Some(Value::Scalar(regs.int_retval())),
    }
}

/// Packs the entry-direction specs into `slot`.  Returns the payload
/// length, or `Err` when the payload is dropped (overflow or a value
/// that cannot be fetched); the caller then emits the record without a
/// payload.
pub fn pack_entry_args(
    specs: &[ArgSpec],
    regs: Option<&MceRegs>,
    parent_loc: *mut u64,
    slot: &mut [u8],
) -> Result<usize, ()> {
    pack(specs, false, slot, |spec| fetch_entry(spec, regs, parent_loc))
}

/// Packs the retval-direction specs into `slot`.
pub fn pack_retval(
    specs: &[ArgSpec],
    regs: Option<&RetRegs>,
    slot: &mut [u8],
) -> Result<usize, ()> {
    pack(specs, true, slot, |spec| fetch_retval(spec, regs))
}

fn pack(
    specs: &[ArgSpec],
    retval: bool,
    slot: &mut [u8],
    fetch: impl Fn(&ArgSpec) -> Option<Value>,
) -> Result<usize, ()> {
    debug_assert!(slot.len() >= ARGBUF_SIZE);
    let mut off = 0usize;
    let limit = ARGBUF_SIZE - 4;

    for spec in specs.iter().filter(|s| s.is_retval() == retval) {
        let value = match fetch(spec) {
            Some(v) => v,
            None => {
                log!(LogDebug, "cannot fetch {:?}; payload dropped", spec);
                return Err(());
            }
        };
        let payload = &mut slot[4..];
        match (spec.kind, value) {
            (ArgKind::Str, Value::Scalar(ptr)) => {
                off = pack_str(payload, off, limit, ptr as *const u8)?;
            }
            (ArgKind::Float(size), Value::Wide(bytes)) => {
                let n = pad4(size as usize).min(8);
                if off + n > limit {
                    return overflow(off + n);
                }
                payload[off..off + n].copy_from_slice(&bytes[..n]);
                off += n;
            }
            (_, Value::Scalar(v)) => {
                let size = match spec.kind {
                    ArgKind::Int(s) | ArgKind::Float(s) => s as usize,
                    ArgKind::Str => 8,
                };
                let n = pad4(size).min(8);
                if off + n > limit {
                    return overflow(off + n);
                }
                payload[off..off + n].copy_from_slice(&v.to_le_bytes()[..n]);
                off += n;
            }
            _ => return Err(()),
        }
    }

    slot[0..4].copy_from_slice(&(off as u32).to_le_bytes());
    Ok(off)
}

fn pack_str(
    payload: &mut [u8],
    mut off: usize,
    limit: usize,
    ptr: *const u8,
) -> Result<usize, ()> {
    if ptr.is_null() {
        let n = 2 + NULL_STR_LEN as usize;
        if off + pad4(n) > limit {
            return overflow(off + pad4(n));
        }
        payload[off..off + 2].copy_from_slice(&NULL_STR_LEN.to_le_bytes());
        payload[off + 2..off + 6].copy_from_slice(&NULL_STR_BYTES);
        for b in &mut payload[off + n..off + pad4(n)] {
            *b = 0;
        }
        off += pad4(n);
        return Ok(off);
    }

    let mut len = 0usize;
    while len < MAX_STR_LEN && unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    let n = 2 + len + 1;
    if len >= MAX_STR_LEN || off + pad4(n) > limit {
        return overflow(off + pad4(n));
    }
    payload[off..off + 2].copy_from_slice(&(len as u16).to_le_bytes());
    unsafe {
        std::ptr::copy_nonoverlapping(ptr, payload[off + 2..].as_mut_ptr(), len);
    }
    payload[off + 2 + len] = 0;
    for b in &mut payload[off + n..off + pad4(n)] {
        *b = 0;
    }
    off += pad4(n);
    Ok(off)
}

fn overflow(want: usize) -> Result<usize, ()> {
    log!(
        LogDebug,
        "argument payload of {} bytes exceeds the scratch slot; dropped",
        want
    );
    Err(())
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// Reads a packed slot back: the payload bytes sized by the leading
/// length header.
pub fn slot_payload(slot: &[u8]) -> &[u8] {
    let len = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]) as usize;
    &slot[4..4 + len]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_arg(n: u8, size: u8) -> ArgSpec {
        ArgSpec {
            kind: ArgKind::Int(size),
            source: ArgSource::Arg(n),
        }
    }

    fn regs_with_args(args: &[u64]) -> MceRegs {
        let mut r = MceRegs::zeroed();
        for (i, &v) in args.iter().enumerate() {
            r.set_int_arg(i + 1, v);
        }
        r
    }

    #[test]
    fn two_i32_args() {
        let specs = [int_arg(1, 4), int_arg(2, 4)];
        let regs = regs_with_args(&[3, 5]);
        let mut slot = [0u8; ARGBUF_SIZE];
        let len = pack_entry_args(&specs, Some(&regs), std::ptr::null_mut(), &mut slot).unwrap();
        assert_eq!(len, 8);
        assert_eq!(slot_payload(&slot), &[3, 0, 0, 0, 5, 0, 0, 0]);
    }

    #[test]
    fn small_ints_pad_to_four() {
        let specs = [int_arg(1, 1), int_arg(2, 2)];
        let regs = regs_with_args(&[0x41, 0x4243]);
        let mut slot = [0u8; ARGBUF_SIZE];
        let len = pack_entry_args(&specs, Some(&regs), std::ptr::null_mut(), &mut slot).unwrap();
        assert_eq!(len, 8);
        assert_eq!(slot_payload(&slot), &[0x41, 0, 0, 0, 0x43, 0x42, 0, 0]);
    }

    #[test]
    fn string_arg_with_nul_and_padding() {
        let s = b"hey\0";
        let specs = [ArgSpec {
            kind: ArgKind::Str,
            source: ArgSource::Arg(1),
        }];
        let regs = regs_with_args(&[s.as_ptr() as u64]);
        let mut slot = [0u8; ARGBUF_SIZE];
        let len = pack_entry_args(&specs, Some(&regs), std::ptr::null_mut(), &mut slot).unwrap();
        // 2 len + 3 bytes + NUL = 6, padded to 8
        assert_eq!(len, 8);
        let p = slot_payload(&slot);
        assert_eq!(&p[0..2], &3u16.to_le_bytes());
        assert_eq!(&p[2..6], b"hey\0");
        assert_eq!(&p[6..8], &[0, 0]);
    }

    #[test]
    fn null_string_sentinel() {
        let specs = [ArgSpec {
            kind: ArgKind::Str,
            source: ArgSource::Arg(1),
        }];
        let regs = regs_with_args(&[0]);
        let mut slot = [0u8; ARGBUF_SIZE];
        let len = pack_entry_args(&specs, Some(&regs), std::ptr::null_mut(), &mut slot).unwrap();
        assert_eq!(len, 8);
        let p = slot_payload(&slot);
        assert_eq!(&p[0..2], &4u16.to_le_bytes());
        assert_eq!(&p[2..6], &[0xff; 4]);
    }

    #[test]
    fn overflow_drops_payload() {
        let big = vec![b'x'; ARGBUF_SIZE];
        let specs = [ArgSpec {
            kind: ArgKind::Str,
            source: ArgSource::Arg(1),
        }];
        let regs = regs_with_args(&[big.as_ptr() as u64]);
        let mut slot = [0u8; ARGBUF_SIZE];
        assert!(pack_entry_args(&specs, Some(&regs), std::ptr::null_mut(), &mut slot).is_err());
    }

    #[test]
    fn missing_regs_drop_payload() {
        let specs = [int_arg(1, 8)];
        let mut slot = [0u8; ARGBUF_SIZE];
        assert!(pack_entry_args(&specs, None, std::ptr::null_mut(), &mut slot).is_err());
    }

    #[test]
    fn retval_direction_is_skipped_at_entry() {
        let specs = [ArgSpec {
            kind: ArgKind::Int(8),
            source: ArgSource::Retval,
        }];
        let mut slot = [0u8; ARGBUF_SIZE];
        let len = pack_entry_args(&specs, None, std::ptr::null_mut(), &mut slot).unwrap();
        assert_eq!(len, 0);
    }

    #[test]
    fn retval_packs_rax() {
        let specs = [ArgSpec {
            kind: ArgKind::Int(4),
            source: ArgSource::Retval,
        }];
        let regs = RetRegs::with_int(8);
        let mut slot = [0u8; ARGBUF_SIZE];
        let len = pack_retval(&specs, Some(&regs), &mut slot).unwrap();
        assert_eq!(len, 4);
        assert_eq!(slot_payload(&slot), &[8, 0, 0, 0]);
    }
}
