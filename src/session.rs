//! Process-wide tracing session: configuration, the trigger table, and
//! the control channel.  Built once before tracing begins; afterwards
//! everything is read-only except the enable flag, which trace-on/off
//! triggers flip from the hot path.

use crate::ctrl_pipe::CtrlPipe;
use crate::flags::Flags;
use crate::trigger::{FilterMode, TriggerTable};
use crate::util;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Session {
    /// 16 hex digits identifying this process's trace.
    pub sid: String,
    pub exe_path: String,
    pub buffer_size: usize,
    pub max_stack: usize,
    pub threshold_ns: u64,
    pub filter_mode: FilterMode,
    pub default_depth: i32,
    pub triggers: TriggerTable,
    pub pipe: CtrlPipe,
    pub enabled: AtomicBool,
}

impl Session {
    pub fn from_flags(flags: &Flags, exe_path: String) -> Session {
        let (triggers, filter_mode) = TriggerTable::from_flags(flags);
        Session {
            sid: util::session_id().to_owned(),
            exe_path,
            buffer_size: flags.buffer_size,
            max_stack: flags.max_stack,
            threshold_ns: flags.threshold_ns,
            filter_mode,
            default_depth: flags.depth,
            triggers,
            pipe: CtrlPipe::from_opt_fd(flags.pipe_fd),
            enabled: AtomicBool::new(!flags.disabled),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, v: bool) {
        self.enabled.store(v, Ordering::Relaxed);
    }

    pub fn exe_name(&self) -> &str {
        self.exe_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.exe_path)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// A quiet session for driving the engine in tests.
    pub fn session(max_stack: usize, threshold_ns: u64) -> Session {
        Session {
            sid: "0123456789abcdef".into(),
            exe_path: "/bin/true".into(),
            buffer_size: 4096,
            max_stack,
            threshold_ns,
            filter_mode: FilterMode::None,
            default_depth: crate::flags::DEFAULT_DEPTH,
            triggers: TriggerTable::new(),
            pipe: CtrlPipe::disabled(),
            enabled: AtomicBool::new(true),
        }
    }
}
