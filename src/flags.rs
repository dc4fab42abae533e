//! Runtime configuration, read once from the environment.
//!
//! Everything is optional; missing or malformed values fall back to the
//! defaults below.  The raw filter/trigger/argument strings are kept
//! verbatim here and interpreted when the trigger table is built.

use crate::scoped_fd::ScopedFd;
use std::os::unix::io::RawFd;
use std::str::FromStr;

pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;
pub const DEFAULT_MAX_STACK: usize = 1024;
pub const DEFAULT_DEPTH: i32 = 1024;
pub const DEFAULT_OUT_DIR: &str = "ftrace.data";

lazy_static! {
    static ref FLAGS: Flags = Flags::from_env();
}

pub struct Flags {
    /// Control pipe to the recorder, inherited by fd number.
    pub pipe_fd: Option<RawFd>,
    pub log_fd: RawFd,
    pub debug: u8,
    pub debug_domain: String,
    pub out_dir: String,
    /// Size of one shared-memory segment.
    pub buffer_size: usize,
    pub max_stack: usize,
    /// Calls shorter than this are not recorded.
    pub threshold_ns: u64,
    pub color: bool,
    pub demangle: bool,
    pub filter: String,
    pub trigger: String,
    pub argument: String,
    pub retval: String,
    /// Default remaining-depth budget for the filter engine.
    pub depth: i32,
    /// Start with tracing off; a trace-on trigger turns it on later.
    pub disabled: bool,
    pub plthook: bool,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }

    fn from_env() -> Flags {
        Flags {
            pipe_fd: ScopedFd::from_env_var("FTRACE_PIPE").map(|mut fd| fd.extract()),
            log_fd: ScopedFd::from_env_var("FTRACE_LOGFD")
                .map(|mut fd| fd.extract())
                .unwrap_or(2),
            debug: env_or("FTRACE_DEBUG", 0),
            debug_domain: env_string("FTRACE_DEBUG_DOMAIN"),
            out_dir: std::env::var("FTRACE_DIR").unwrap_or_else(|_| DEFAULT_OUT_DIR.into()),
            buffer_size: env_or("FTRACE_BUFFER", DEFAULT_BUFFER_SIZE),
            max_stack: env_or("FTRACE_MAX_STACK", DEFAULT_MAX_STACK),
            threshold_ns: env_or("FTRACE_THRESHOLD", 0),
            color: env_bool("FTRACE_COLOR", true),
            demangle: env_bool("FTRACE_DEMANGLE", true),
            filter: env_string("FTRACE_FILTER"),
            trigger: env_string("FTRACE_TRIGGER"),
            argument: env_string("FTRACE_ARGUMENT"),
            retval: env_string("FTRACE_RETVAL"),
            depth: env_or("FTRACE_DEPTH", DEFAULT_DEPTH),
            disabled: env_bool("FTRACE_DISABLED", false),
            plthook: env_bool("FTRACE_PLTHOOK", true),
        }
    }
}

fn env_string(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn env_opt<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env_opt(name).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => parse_bool(&v, default),
        Err(_) => default,
    }
}

fn parse_bool(v: &str, default: bool) -> bool {
    match v.trim() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_forms() {
        assert!(parse_bool("1", false));
        assert!(parse_bool("yes", false));
        assert!(!parse_bool("off", true));
        // garbage keeps the default
        assert!(parse_bool("maybe", true));
        assert!(!parse_bool("maybe", false));
    }

    #[test]
    fn missing_vars_fall_back() {
        assert_eq!(env_or::<usize>("FTRACE_TEST_NOT_SET_X", 7), 7);
        assert_eq!(env_opt::<i32>("FTRACE_TEST_NOT_SET_Y"), None);
        assert_eq!(env_string("FTRACE_TEST_NOT_SET_Z"), "");
    }
}
