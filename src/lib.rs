//! In-process tracing runtime for function-level profiling.
//!
//! This library is loaded into a target program (normally with
//! `LD_PRELOAD`) and is entered from compiler-inserted instrumentation on
//! every function entry and return.  Per thread it keeps a bounded stack
//! of in-flight calls, filters them against user policy, and streams the
//! surviving records to an external recorder process through a ring of
//! shared-memory segments, with a framed control channel over a
//! pre-opened pipe.
//!
//! The runtime never spawns threads of its own; everything runs on the
//! instrumented thread, guarded against reentrancy from the traced
//! program's own allocator.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;

pub mod arch;
pub mod args;
pub mod ctrl_pipe;
pub mod filter;
pub mod flags;
pub mod mcount;
pub mod record;
pub mod rstack;
pub mod scoped_fd;
pub mod session;
pub mod shmem;
pub mod trigger;
pub mod util;
