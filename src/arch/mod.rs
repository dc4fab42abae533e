//! Architecture-specific pieces: the `mcount` entry stub, the return
//! trampoline, and the register snapshots used for argument capture.
//!
//! Only x86_64 carries the assembly stubs; other targets still build
//! the library and can trace through the cyg-profile hooks, which need
//! no return-address hijacking.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::*;

#[cfg(not(target_arch = "x86_64"))]
mod generic;
#[cfg(not(target_arch = "x86_64"))]
pub use self::generic::*;
