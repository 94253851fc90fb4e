//! Named event types and the `name:modifiers` syntax used on the command line.

use crate::environment;
use crate::error::{Error, Result};
use crate::perf::*;
use std::fs;

pub const DEFAULT_SAMPLE_FREQ: u64 = 4000;
pub const DEFAULT_TRACEPOINT_PERIOD: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventType {
    pub name: String,
    pub type_: u32,
    pub config: u64,
}

impl EventType {
    fn new(name: impl Into<String>, type_: u32, config: u64) -> Self {
        EventType {
            name: name.into(),
            type_,
            config,
        }
    }

    pub fn is_tracepoint(&self) -> bool {
        self.type_ == PERF_TYPE_TRACEPOINT
    }
}

const BUILTIN_EVENTS: &[(&str, u32, u64)] = &[
    ("cpu-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
    ("instructions", PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
    ("cache-references", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES),
    ("cache-misses", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
    ("branch-instructions", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
    ("branch-misses", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
    ("bus-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BUS_CYCLES),
    ("stalled-cycles-frontend", PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_FRONTEND),
    ("stalled-cycles-backend", PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_BACKEND),
    ("cpu-clock", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
    ("task-clock", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_TASK_CLOCK),
    ("page-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
    ("context-switches", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES),
    ("cpu-migrations", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_MIGRATIONS),
    ("minor-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MIN),
    ("major-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MAJ),
    ("alignment-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_ALIGNMENT_FAULTS),
    ("emulation-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_EMULATION_FAULTS),
];

pub fn builtin_event_types() -> impl Iterator<Item = EventType> {
    BUILTIN_EVENTS
        .iter()
        .map(|&(name, type_, config)| EventType::new(name, type_, config))
}

/// Look up an event by name: the builtin table, raw `rNNNN` events, then
/// tracepoints (`system:event`) under tracefs.
pub fn find_event_type(name: &str) -> Option<EventType> {
    if let Some(&(n, t, c)) = BUILTIN_EVENTS.iter().find(|(n, _, _)| *n == name) {
        return Some(EventType::new(n, t, c));
    }
    if let Some(hex) = name.strip_prefix('r')
        && !hex.is_empty()
        && let Ok(config) = u64::from_str_radix(hex, 16)
    {
        return Some(EventType::new(name, PERF_TYPE_RAW, config));
    }
    let (system, event) = name.split_once(':')?;
    if system.is_empty() || event.is_empty() || event.contains(['/', ':']) || system.contains('/') {
        return None;
    }
    let id_path = environment::tracefs_events_dir()?
        .join(system)
        .join(event)
        .join("id");
    let id = fs::read_to_string(id_path).ok()?.trim().parse().ok()?;
    Some(EventType::new(name, PERF_TYPE_TRACEPOINT, id))
}

/// An event type plus the privilege/precision modifiers given after `:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTypeAndModifier {
    /// The name as written, including any modifier suffix.
    pub name: String,
    pub event_type: EventType,
    pub modifier: String,
    pub exclude_user: bool,
    pub exclude_kernel: bool,
    pub exclude_hv: bool,
    pub exclude_host: bool,
    pub exclude_guest: bool,
    pub precise_ip: u8,
}

impl EventTypeAndModifier {
    fn plain(name: &str, event_type: EventType) -> Self {
        EventTypeAndModifier {
            name: name.to_string(),
            event_type,
            modifier: String::new(),
            exclude_user: false,
            exclude_kernel: false,
            exclude_hv: false,
            exclude_host: false,
            exclude_guest: false,
            precise_ip: 0,
        }
    }

    fn apply_modifier(&mut self, modifier: &str) -> Result<()> {
        let (mut u, mut k, mut h, mut host, mut guest) = (false, false, false, false, false);
        for c in modifier.chars() {
            match c {
                'u' => u = true,
                'k' => k = true,
                'h' => h = true,
                'H' => host = true,
                'G' => guest = true,
                'p' => self.precise_ip += 1,
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown event modifier '{c}' in '{}'",
                        self.name
                    )));
                }
            }
        }
        if self.precise_ip > 3 {
            return Err(Error::InvalidArgument(format!(
                "too many 'p' modifiers in '{}'",
                self.name
            )));
        }
        // Naming any privilege level excludes the unnamed ones.
        if u || k || h {
            self.exclude_user = !u;
            self.exclude_kernel = !k;
            self.exclude_hv = !h;
        }
        if host != guest {
            self.exclude_guest = host;
            self.exclude_host = guest;
        }
        self.modifier = modifier.to_string();
        Ok(())
    }

    pub fn apply_to(&self, attr: &mut PerfEventAttr) {
        attr.set_exclude_user(self.exclude_user);
        attr.set_exclude_kernel(self.exclude_kernel);
        attr.set_exclude_hv(self.exclude_hv);
        attr.set_exclude_host(self.exclude_host);
        attr.set_exclude_guest(self.exclude_guest);
        attr.set_precise_ip(self.precise_ip);
    }
}

/// Parse `name[:modifiers]`. A tracepoint name contains `:` itself, so the
/// whole string is tried as a name before splitting off a modifier.
pub fn parse_event_type(event: &str) -> Result<EventTypeAndModifier> {
    parse_event_type_with(event, find_event_type)
}

fn parse_event_type_with(
    event: &str,
    find: impl Fn(&str) -> Option<EventType>,
) -> Result<EventTypeAndModifier> {
    if let Some(t) = find(event) {
        return Ok(EventTypeAndModifier::plain(event, t));
    }
    if let Some((name, modifier)) = event.rsplit_once(':')
        && let Some(t) = find(name)
    {
        let mut parsed = EventTypeAndModifier::plain(event, t);
        parsed.apply_modifier(modifier)?;
        return Ok(parsed);
    }
    Err(Error::InvalidArgument(format!("unknown event type '{event}'")))
}

/// The attribute every selected event starts from.
pub fn create_default_attr(event_type: &EventType) -> PerfEventAttr {
    let mut attr = PerfEventAttr::new();
    attr.type_ = event_type.type_;
    attr.config = event_type.config;
    attr.set_disabled(true);
    attr.set_mmap(true);
    attr.set_comm(true);
    attr.set_sample_id_all(true);
    attr.read_format =
        PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING | PERF_FORMAT_ID;
    attr.sample_type = PERF_SAMPLE_IP
        | PERF_SAMPLE_TID
        | PERF_SAMPLE_TIME
        | PERF_SAMPLE_PERIOD
        | PERF_SAMPLE_CPU
        | PERF_SAMPLE_ID;
    if event_type.is_tracepoint() {
        attr.sample_type |= PERF_SAMPLE_RAW;
        attr.set_sample_period(DEFAULT_TRACEPOINT_PERIOD);
    } else {
        attr.set_sample_freq(DEFAULT_SAMPLE_FREQ);
    }
    attr
}

/// Reverse lookup used when describing attrs read back from a file.
pub fn event_name_for(type_: u32, config: u64) -> String {
    BUILTIN_EVENTS
        .iter()
        .find(|&&(_, t, c)| t == type_ && c == config)
        .map_or_else(
            || match type_ {
                PERF_TYPE_RAW => format!("r{config:x}"),
                PERF_TYPE_TRACEPOINT => format!("tracepoint:{config}"),
                _ => format!("type{type_}:config{config}"),
            },
            |(name, _, _)| name.to_string(),
        )
}

const SAMPLE_TYPE_NAMES: &[(u64, &str)] = &[
    (PERF_SAMPLE_IP, "ip"),
    (PERF_SAMPLE_TID, "tid"),
    (PERF_SAMPLE_TIME, "time"),
    (PERF_SAMPLE_ADDR, "addr"),
    (PERF_SAMPLE_READ, "read"),
    (PERF_SAMPLE_CALLCHAIN, "callchain"),
    (PERF_SAMPLE_ID, "id"),
    (PERF_SAMPLE_CPU, "cpu"),
    (PERF_SAMPLE_PERIOD, "period"),
    (PERF_SAMPLE_STREAM_ID, "stream_id"),
    (PERF_SAMPLE_RAW, "raw"),
    (PERF_SAMPLE_BRANCH_STACK, "branch_stack"),
    (PERF_SAMPLE_REGS_USER, "regs_user"),
    (PERF_SAMPLE_STACK_USER, "stack_user"),
    (PERF_SAMPLE_IDENTIFIER, "identifier"),
];

/// `ip|tid|time` style rendering of a sample_type mask.
pub fn sample_type_string(sample_type: u64) -> String {
    SAMPLE_TYPE_NAMES
        .iter()
        .filter(|(bit, _)| sample_type & bit != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_find(name: &str) -> Option<EventType> {
        if name == "sched:sched_switch" {
            return Some(EventType::new(name, PERF_TYPE_TRACEPOINT, 42));
        }
        find_event_type(name).filter(|t| !t.is_tracepoint())
    }

    #[test]
    fn test_builtin_lookup() {
        let t = find_event_type("cpu-cycles").unwrap();
        assert_eq!((t.type_, t.config), (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES));
        let t = find_event_type("task-clock").unwrap();
        assert_eq!((t.type_, t.config), (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_TASK_CLOCK));
        let t = find_event_type("r1a2b").unwrap();
        assert_eq!((t.type_, t.config), (PERF_TYPE_RAW, 0x1a2b));
        assert!(find_event_type("no-such-event").is_none());
        assert_eq!(builtin_event_types().count(), BUILTIN_EVENTS.len());
    }

    #[test]
    fn test_modifiers() {
        let e = parse_event_type_with("cpu-cycles:u", fake_find).unwrap();
        assert_eq!(e.event_type.name, "cpu-cycles");
        assert_eq!(e.name, "cpu-cycles:u");
        assert!(!e.exclude_user && e.exclude_kernel && e.exclude_hv);

        let e = parse_event_type_with("instructions:kpp", fake_find).unwrap();
        assert!(e.exclude_user && !e.exclude_kernel);
        assert_eq!(e.precise_ip, 2);

        let e = parse_event_type_with("cpu-clock", fake_find).unwrap();
        assert!(!e.exclude_user && !e.exclude_kernel && !e.exclude_hv);

        let e = parse_event_type_with("cpu-clock:G", fake_find).unwrap();
        assert!(e.exclude_host && !e.exclude_guest);

        assert!(parse_event_type_with("cpu-clock:x", fake_find).is_err());
        assert!(parse_event_type_with("cpu-clock:pppp", fake_find).is_err());
        assert!(parse_event_type_with("bogus:u", fake_find).is_err());
    }

    #[test]
    fn test_tracepoint_with_modifier() {
        let e = parse_event_type_with("sched:sched_switch", fake_find).unwrap();
        assert!(e.event_type.is_tracepoint());
        assert!(e.modifier.is_empty());
        let e = parse_event_type_with("sched:sched_switch:k", fake_find).unwrap();
        assert_eq!(e.event_type.config, 42);
        assert!(e.exclude_user);
    }

    #[test]
    fn test_default_attr() {
        let attr = create_default_attr(&find_event_type("cpu-cycles").unwrap());
        assert!(attr.freq() && attr.disabled() && attr.sample_id_all());
        assert_eq!(attr.sample_period_or_freq, DEFAULT_SAMPLE_FREQ);
        assert!(attr.has_sample(PERF_SAMPLE_ID));

        let tp = create_default_attr(&EventType::new("a:b", PERF_TYPE_TRACEPOINT, 7));
        assert!(!tp.freq());
        assert_eq!(tp.sample_period_or_freq, DEFAULT_TRACEPOINT_PERIOD);
        assert!(tp.has_sample(PERF_SAMPLE_RAW));
    }

    #[test]
    fn test_names() {
        assert_eq!(event_name_for(PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK), "cpu-clock");
        assert_eq!(event_name_for(PERF_TYPE_RAW, 0xff), "rff");
        assert_eq!(sample_type_string(PERF_SAMPLE_IP | PERF_SAMPLE_TIME), "ip|time");
    }
}
