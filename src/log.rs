//! Leveled logging for a preload runtime.
//!
//! Messages go straight to a configurable file descriptor with a single
//! `write(2)`; the traced program's stdio buffering is never touched and
//! nothing here allocates, so the macros are safe to use from the hook
//! path while the recursion guard is held.
//!
//! `FTRACE_DEBUG` raises the process-wide level to debug; per-domain
//! debug levels come from `FTRACE_DEBUG_DOMAIN`, a string of
//! `<domain char><digit>` pairs (e.g. `s2f1` turns on shmem and filter
//! debugging).

use crate::scoped_fd::ScopedFd;
use std::fmt;
use std::fmt::Write as FmtWrite;
use std::os::unix::io::RawFd;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

use LogLevel::*;

pub struct LogConfig {
    fd: RawFd,
    base: LogLevel,
    /// Per-domain debug levels, indexed by lowercase letter.
    domains: [u8; 26],
}

lazy_static! {
    static ref LOG: LogConfig = LogConfig::from_env();
}

impl LogConfig {
    fn from_env() -> LogConfig {
        let fd = ScopedFd::from_env_var("FTRACE_LOGFD")
            .map(|mut f| f.extract())
            .unwrap_or(2);
        let debug = std::env::var("FTRACE_DEBUG")
            .ok()
            .and_then(|s| s.parse::<u8>().ok())
            .unwrap_or(0);
        let base = if debug > 0 { LogDebug } else { LogWarn };

        let mut domains = [0u8; 26];
        if let Ok(spec) = std::env::var("FTRACE_DEBUG_DOMAIN") {
            let mut chars = spec.bytes().peekable();
            while let Some(d) = chars.next() {
                let lvl = match chars.peek() {
                    Some(l) if l.is_ascii_digit() => {
                        let l = *l - b'0';
                        chars.next();
                        l
                    }
                    _ => 1,
                };
                if d.is_ascii_lowercase() {
                    domains[(d - b'a') as usize] = lvl;
                }
            }
        }

        LogConfig { fd, base, domains }
    }
}

/// A fixed single-letter domain per module; everything else falls back
/// to the first letter of the leaf module name.
fn domain_of(module: &str) -> Option<usize> {
    let leaf = module.rsplit("::").next().unwrap_or(module);
    let c = match leaf {
        "ctrl_pipe" => b'p',
        _ => *leaf.as_bytes().first()?,
    };
    if c.is_ascii_lowercase() {
        Some((c - b'a') as usize)
    } else {
        None
    }
}

fn level_allows(cfg: &LogConfig, level: LogLevel, module: &str) -> bool {
    if level <= cfg.base {
        return true;
    }
    level == LogDebug && domain_of(module).map_or(false, |d| cfg.domains[d] > 0)
}

pub fn log_enabled(level: LogLevel, module: &str) -> bool {
    level_allows(&*LOG, level, module)
}

fn level_tag(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

/// Formats into a stack buffer and truncates rather than allocating.
struct StackWriter {
    buf: [u8; 512],
    len: usize,
}

impl StackWriter {
    fn new() -> StackWriter {
        StackWriter {
            buf: [0; 512],
            len: 0,
        }
    }
}

impl fmt::Write for StackWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

pub fn write_log(level: LogLevel, module: &str, args: fmt::Arguments) {
    let mut w = StackWriter::new();
    let _ = write!(w, "ftrace: {}: {}: ", level_tag(level), module);
    let _ = w.write_fmt(args);
    if w.len == w.buf.len() {
        // leave room for the newline on truncation
        w.len -= 1;
    }
    w.buf[w.len] = b'\n';
    w.len += 1;
    unsafe {
        libc::write(LOG.fd, w.buf.as_ptr() as *const libc::c_void, w.len);
    }
}

macro_rules! log {
    ($lvl:expr, $($args:tt)*) => {{
        let lvl = $lvl;
        if $crate::log::log_enabled(lvl, module_path!()) {
            $crate::log::write_log(lvl, module_path!(), format_args!($($args)*));
        }
    }};
}

/// Logs at fatal level and aborts the process.  The traced program must
/// never observe an error from the runtime; either tracing is
/// transparent or the process dies with a diagnostic.
macro_rules! fatal {
    ($($args:tt)*) => {{
        $crate::log::write_log(
            $crate::log::LogLevel::LogFatal,
            module_path!(),
            format_args!($($args)*),
        );
        unsafe { ::libc::abort() }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(base: LogLevel, domains: &[(u8, u8)]) -> LogConfig {
        let mut d = [0u8; 26];
        for &(c, l) in domains {
            d[(c - b'a') as usize] = l;
        }
        LogConfig {
            fd: 2,
            base,
            domains: d,
        }
    }

    #[test]
    fn base_level_gates() {
        let c = cfg(LogWarn, &[]);
        assert!(level_allows(&c, LogError, "ftrace::shmem"));
        assert!(level_allows(&c, LogWarn, "ftrace::shmem"));
        assert!(!level_allows(&c, LogInfo, "ftrace::shmem"));
        assert!(!level_allows(&c, LogDebug, "ftrace::shmem"));
    }

    #[test]
    fn domain_raises_debug_only() {
        let c = cfg(LogWarn, &[(b's', 2)]);
        assert!(level_allows(&c, LogDebug, "ftrace::shmem"));
        assert!(!level_allows(&c, LogDebug, "ftrace::filter"));
        // domain overrides do not unlock info
        assert!(!level_allows(&c, LogInfo, "ftrace::shmem"));
    }

    #[test]
    fn pipe_module_maps_to_p() {
        assert_eq!(domain_of("ftrace::ctrl_pipe"), Some((b'p' - b'a') as usize));
        assert_eq!(domain_of("ftrace::mcount"), Some((b'm' - b'a') as usize));
    }
}
