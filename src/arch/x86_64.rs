//! x86_64 entry stub and return trampoline.
//!
//! `mcount` is emitted by the compiler at the top of every instrumented
//! function, after the frame pointer is set up, so the caller's return
//! address lives at `[rbp + 8]` and our own return address is the
//! callee's body.  The stub saves every register that may carry an
//! argument, hands `(parent_loc, child_ip, regs)` to `mcount_entry`,
//! and restores the world before resuming the callee.
//!
//! The return trampoline is what `mcount_entry` plants in the caller's
//! return slot.  It preserves the return-value registers across
//! `mcount_exit`, which hands back the original return address.

use core::arch::global_asm;

/// Number of integer argument registers in the SysV ABI.
const INT_ARG_REGS: usize = 6;
const FP_ARG_REGS: usize = 8;

/// Snapshot of the argument registers, in the exact order the entry
/// stub pushes them: r9 lowest.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct MceRegs {
    pub r9: u64,
    pub r8: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub xmm: [[u8; 16]; FP_ARG_REGS],
}

impl MceRegs {
    pub const INT_ARG_REGS: usize = INT_ARG_REGS;

    pub fn zeroed() -> MceRegs {
        MceRegs {
            r9: 0,
            r8: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            xmm: [[0; 16]; FP_ARG_REGS],
        }
    }

    /// 1-based integer argument register, SysV order.
    pub fn int_arg(&self, n: usize) -> Option<u64> {
        match n {
            1 => Some(self.rdi),
            2 => Some(self.rsi),
            3 => Some(self.rdx),
            4 => Some(self.rcx),
            5 => Some(self.r8),
            6 => Some(self.r9),
            _ => None,
        }
    }

    pub fn set_int_arg(&mut self, n: usize, v: u64) {
        match n {
            1 => self.rdi = v,
            2 => self.rsi = v,
            3 => self.rdx = v,
            4 => self.rcx = v,
            5 => self.r8 = v,
            6 => self.r9 = v,
            _ => {}
        }
    }

    /// 1-based floating-point argument register (xmm0..xmm7).
    pub fn fp_arg(&self, n: usize) -> Option<[u8; 16]> {
        if (1..=FP_ARG_REGS).contains(&n) {
            Some(self.xmm[n - 1])
        } else {
            None
        }
    }
}

/// Return-value registers, in the order the trampoline stacks them.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct RetRegs {
    pub rax: u64,
    pub rdx: u64,
    pub xmm0: [u8; 16],
}

impl RetRegs {
    pub fn with_int(v: u64) -> RetRegs {
        RetRegs {
            rax: v,
            rdx: 0,
            xmm0: [0; 16],
        }
    }

    pub fn int_retval(&self) -> u64 {
        self.rax
    }

    pub fn fp_retval(&self) -> [u8; 16] {
        self.xmm0
    }
}

extern "C" {
    fn mcount_return_trampoline();
}

/// Address planted into hijacked return slots.
pub fn ret_trampoline() -> u64 {
    mcount_return_trampoline as usize as u64
}

/// Hook point for targets that keep the return slot somewhere other
/// than the stack; a plain stack slot needs no fixup here.
pub fn fixup_parent_loc(parent_loc: *mut u64) -> *mut u64 {
    parent_loc
}

// Stack frame built by mcount, low to high:
//   [rsp +   0 ..  48)  r9 r8 rcx rdx rsi rdi
//   [rsp +  48 .. 176)  xmm0..xmm7
//   [rsp + 176]         return address into the instrumented function
global_asm!(
    ".text",
    ".globl mcount",
    ".type mcount, @function",
    "mcount:",
    "sub rsp, 176",
    "mov qword ptr [rsp + 40], rdi",
    "mov qword ptr [rsp + 32], rsi",
    "mov qword ptr [rsp + 24], rdx",
    "mov qword ptr [rsp + 16], rcx",
    "mov qword ptr [rsp + 8], r8",
    "mov qword ptr [rsp + 0], r9",
    "movups xmmword ptr [rsp + 48], xmm0",
    "movups xmmword ptr [rsp + 64], xmm1",
    "movups xmmword ptr [rsp + 80], xmm2",
    "movups xmmword ptr [rsp + 96], xmm3",
    "movups xmmword ptr [rsp + 112], xmm4",
    "movups xmmword ptr [rsp + 128], xmm5",
    "movups xmmword ptr [rsp + 144], xmm6",
    "movups xmmword ptr [rsp + 160], xmm7",
    // child ip = our own return address
    "mov rsi, qword ptr [rsp + 176]",
    // location of the caller's return address
    "lea rdi, [rbp + 8]",
    // register snapshot
    "mov rdx, rsp",
    // align the stack, keeping the old pointer and rax (variadic count)
    "mov rcx, rsp",
    "and rsp, -16",
    "push rcx",
    "push rax",
    "call mcount_entry",
    "pop rax",
    "pop rcx",
    "mov rsp, rcx",
    "movups xmm7, xmmword ptr [rsp + 160]",
    "movups xmm6, xmmword ptr [rsp + 144]",
    "movups xmm5, xmmword ptr [rsp + 128]",
    "movups xmm4, xmmword ptr [rsp + 112]",
    "movups xmm3, xmmword ptr [rsp + 96]",
    "movups xmm2, xmmword ptr [rsp + 80]",
    "movups xmm1, xmmword ptr [rsp + 64]",
    "movups xmm0, xmmword ptr [rsp + 48]",
    "mov r9, qword ptr [rsp + 0]",
    "mov r8, qword ptr [rsp + 8]",
    "mov rcx, qword ptr [rsp + 16]",
    "mov rdx, qword ptr [rsp + 24]",
    "mov rsi, qword ptr [rsp + 32]",
    "mov rdi, qword ptr [rsp + 40]",
    "add rsp, 176",
    "ret",
    ".size mcount, . - mcount",
);

// Frame, low to high:
//   [rsp +  0]        rax
//   [rsp +  8]        rdx
//   [rsp + 16 .. 32)  xmm0
//   [rsp + 32]        scratch
//   [rsp + 40]        original return address, installed after the call
global_asm!(
    ".text",
    ".globl mcount_return_trampoline",
    ".type mcount_return_trampoline, @function",
    "mcount_return_trampoline:",
    "sub rsp, 48",
    "mov qword ptr [rsp + 0], rax",
    "mov qword ptr [rsp + 8], rdx",
    "movups xmmword ptr [rsp + 16], xmm0",
    "mov rdi, rsp",
    "call mcount_exit",
    "mov qword ptr [rsp + 40], rax",
    "mov rax, qword ptr [rsp + 0]",
    "mov rdx, qword ptr [rsp + 8]",
    "movups xmm0, xmmword ptr [rsp + 16]",
    // leave the original return address as the new top of stack
    "add rsp, 40",
    "ret",
    ".size mcount_return_trampoline, . - mcount_return_trampoline",
);
