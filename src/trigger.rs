//! Per-callee policy rules, keyed by address.
//!
//! The table is built once at process init and is read-only afterwards;
//! the hot path only ever does lookups.  Symbol resolution lives outside
//! the runtime: a loader resolves names to addresses and installs
//! triggers through [`TriggerTable::entry`].  The environment variables
//! are additionally accepted in a bare numeric form (hex addresses) so
//! the runtime can be driven standalone:
//!
//! - `FTRACE_FILTER`:   `ADDR` to include, `!ADDR` to exclude
//! - `FTRACE_TRIGGER`:  `ADDR[:action,...]` with actions `trace`,
//!   `traceon`, `traceoff`, `recover`, `depth=N` (bare `ADDR` means
//!   `trace`)
//! - `FTRACE_ARGUMENT`: `ADDR/N` to capture the first N integer args
//! - `FTRACE_RETVAL`:   `ADDR` to capture an integer return value
//!
//! Entries are separated by `;` or `,` (`,` only where unambiguous).

use crate::args::{ArgKind, ArgSource, ArgSpec};
use crate::flags::Flags;
use crate::log::LogLevel::LogDebug;
use std::collections::BTreeMap;

bitflags! {
    pub struct TriggerFlags: u32 {
        const FILTER    = 1 << 0;
        const DEPTH     = 1 << 1;
        const TRACE_ON  = 1 << 2;
        const TRACE_OFF = 1 << 3;
        const ARGUMENT  = 1 << 4;
        const RETVAL    = 1 << 5;
        const TRACE     = 1 << 6;
        const RECOVER   = 1 << 7;
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FilterMode {
    None,
    Include,
    Exclude,
}

pub struct Trigger {
    pub flags: TriggerFlags,
    pub fmode: FilterMode,
    /// Depth override; meaningful only with `TriggerFlags::DEPTH`.
    pub depth: i32,
    /// Argument and retval specs, in declaration order.
    pub args: Vec<ArgSpec>,
}

impl Trigger {
    pub fn new() -> Trigger {
        Trigger {
            flags: TriggerFlags::empty(),
            fmode: FilterMode::None,
            depth: 0,
            args: Vec::new(),
        }
    }
}

impl Default for Trigger {
    fn default() -> Trigger {
        Trigger::new()
    }
}

pub struct TriggerTable {
    map: BTreeMap<u64, Trigger>,
}

impl TriggerTable {
    pub fn new() -> TriggerTable {
        TriggerTable {
            map: BTreeMap::new(),
        }
    }

    /// Returns the trigger for `addr`, inserting an empty one if
    /// needed.  This is the installation seam for the loader.
    pub fn entry(&mut self, addr: u64) -> &mut Trigger {
        self.map.entry(addr).or_insert_with(Trigger::new)
    }

    pub fn lookup(&self, addr: u64) -> Option<&Trigger> {
        self.map.get(&addr)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Builds the table from the numeric environment forms and reports
    /// the resulting global filter mode.
    pub fn from_flags(flags: &Flags) -> (TriggerTable, FilterMode) {
        let mut table = TriggerTable::new();
        let mut mode = FilterMode::None;

        for item in split_items(&flags.filter) {
            let (addr_str, fmode) = match item.strip_prefix('!') {
                Some(rest) => (rest, FilterMode::Exclude),
                None => (item, FilterMode::Include),
            };
            let addr = match parse_addr(addr_str) {
                Some(a) => a,
                None => {
                    log!(LogDebug, "skipping non-numeric filter entry {:?}", item);
                    continue;
                }
            };
            let tr = table.entry(addr);
            tr.flags |= TriggerFlags::FILTER;
            tr.fmode = fmode;
            // include filters dominate the global mode
            if fmode == FilterMode::Include {
                mode = FilterMode::Include;
            } else if mode == FilterMode::None {
                mode = FilterMode::Exclude;
            }
        }

        for item in split_items(&flags.trigger) {
            let mut parts = item.splitn(2, ':');
            let addr = match parse_addr(parts.next().unwrap_or("")) {
                Some(a) => a,
                None => {
                    log!(LogDebug, "skipping non-numeric trigger entry {:?}", item);
                    continue;
                }
            };
            let tr = table.entry(addr);
            match parts.next() {
                None => tr.flags |= TriggerFlags::TRACE,
                Some(actions) => {
                    for action in actions.split(',') {
                        match action.trim() {
                            "trace" => tr.flags |= TriggerFlags::TRACE,
                            "traceon" | "trace_on" => tr.flags |= TriggerFlags::TRACE_ON,
                            "traceoff" | "trace_off" => tr.flags |= TriggerFlags::TRACE_OFF,
                            "recover" => tr.flags |= TriggerFlags::RECOVER,
                            other => {
                                if let Some(d) = other.strip_prefix("depth=") {
                                    if let Ok(d) = d.parse::<i32>() {
                                        tr.flags |= TriggerFlags::DEPTH;
                                        tr.depth = d;
                                        continue;
                                    }
                                }
                                log!(LogDebug, "unknown trigger action {:?}", other);
                            }
                        }
                    }
                }
            }
        }

        for item in split_items(&flags.argument) {
            let mut parts = item.splitn(2, '/');
            let addr = match parse_addr(parts.next().unwrap_or("")) {
                Some(a) => a,
                None => continue,
            };
            let nargs = parts
                .next()
                .and_then(|n| n.parse::<u8>().ok())
                .unwrap_or(1);
            let tr = table.entry(addr);
            tr.flags |= TriggerFlags::ARGUMENT;
            for i in 1..=nargs {
                tr.args.push(ArgSpec {
                    kind: ArgKind::Int(8),
                    source: ArgSource::Arg(i),
                });
            }
        }

        for item in split_items(&flags.retval) {
            let addr = match parse_addr(item) {
                Some(a) => a,
                None => continue,
            };
            let tr = table.entry(addr);
            tr.flags |= TriggerFlags::RETVAL;
            tr.args.push(ArgSpec {
                kind: ArgKind::Int(8),
                source: ArgSource::Retval,
            });
        }

        (table, mode)
    }
}

impl Default for TriggerTable {
    fn default() -> TriggerTable {
        TriggerTable::new()
    }
}

fn split_items(s: &str) -> impl Iterator<Item = &str> {
    s.split(';').map(str::trim).filter(|i| !i.is_empty())
}

fn parse_addr(s: &str) -> Option<u64> {
    let s = s.trim();
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_with(filter: &str, trigger: &str, argument: &str, retval: &str) -> Flags {
        Flags {
            pipe_fd: None,
            log_fd: 2,
            debug: 0,
            debug_domain: String::new(),
            out_dir: "ftrace.data".into(),
            buffer_size: crate::flags::DEFAULT_BUFFER_SIZE,
            max_stack: crate::flags::DEFAULT_MAX_STACK,
            threshold_ns: 0,
            color: true,
            demangle: true,
            filter: filter.into(),
            trigger: trigger.into(),
            argument: argument.into(),
            retval: retval.into(),
            depth: crate::flags::DEFAULT_DEPTH,
            disabled: false,
            plthook: true,
        }
    }

    #[test]
    fn include_filter_sets_mode() {
        let f = flags_with("0x400500", "", "", "");
        let (table, mode) = TriggerTable::from_flags(&f);
        assert_eq!(mode, FilterMode::Include);
        let tr = table.lookup(0x400500).unwrap();
        assert!(tr.flags.contains(TriggerFlags::FILTER));
        assert_eq!(tr.fmode, FilterMode::Include);
    }

    #[test]
    fn exclude_only_sets_exclude_mode() {
        let f = flags_with("!0x400600", "", "", "");
        let (table, mode) = TriggerTable::from_flags(&f);
        assert_eq!(mode, FilterMode::Exclude);
        assert_eq!(table.lookup(0x400600).unwrap().fmode, FilterMode::Exclude);
    }

    #[test]
    fn include_dominates_mixed_mode() {
        let f = flags_with("!0x400600;0x400500", "", "", "");
        let (_, mode) = TriggerTable::from_flags(&f);
        assert_eq!(mode, FilterMode::Include);
    }

    #[test]
    fn trigger_actions() {
        let f = flags_with("", "0x1000;0x2000:traceoff,depth=3;0x3000:recover", "", "");
        let (table, _) = TriggerTable::from_flags(&f);
        assert!(table.lookup(0x1000).unwrap().flags.contains(TriggerFlags::TRACE));
        let t2 = table.lookup(0x2000).unwrap();
        assert!(t2.flags.contains(TriggerFlags::TRACE_OFF | TriggerFlags::DEPTH));
        assert_eq!(t2.depth, 3);
        assert!(table.lookup(0x3000).unwrap().flags.contains(TriggerFlags::RECOVER));
    }

    #[test]
    fn argument_and_retval_specs() {
        let f = flags_with("", "", "0x1000/2", "0x1000");
        let (table, _) = TriggerTable::from_flags(&f);
        let tr = table.lookup(0x1000).unwrap();
        assert!(tr.flags.contains(TriggerFlags::ARGUMENT | TriggerFlags::RETVAL));
        assert_eq!(tr.args.len(), 3);
        assert_eq!(tr.args[0].source, ArgSource::Arg(1));
        assert_eq!(tr.args[2].source, ArgSource::Retval);
    }

    #[test]
    fn symbolic_entries_are_ignored() {
        let f = flags_with("main;0x400500", "compute_hash", "", "");
        let (table, mode) = TriggerTable::from_flags(&f);
        assert_eq!(table.len(), 1);
        assert_eq!(mode, FilterMode::Include);
    }
}
