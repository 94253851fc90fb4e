//! Facts about the running system gathered from /proc and /sys.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

const CPU_ONLINE_PATH: &str = "/sys/devices/system/cpu/online";
const CPU_POSSIBLE_PATH: &str = "/sys/devices/system/cpu/possible";

/// Parse a kernel cpu list such as "0-3,5,7-8".
pub fn parse_cpu_list(s: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in s.trim().split(',').filter(|p| !p.is_empty()) {
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| Error::InvalidArgument(format!("invalid cpu list '{}'", s.trim())))
        };
        match part.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if lo > hi {
                    return Err(Error::InvalidArgument(format!("invalid cpu range '{part}'")));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(parse(part)?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

pub fn online_cpus() -> Result<Vec<u32>> {
    parse_cpu_list(&fs::read_to_string(CPU_ONLINE_PATH)?)
}

pub fn possible_cpus() -> Result<Vec<u32>> {
    parse_cpu_list(&fs::read_to_string(CPU_POSSIBLE_PATH)?)
}

/// Current value of /proc/sys/kernel/perf_event_paranoid, if readable.
pub fn perf_event_paranoid() -> Option<i32> {
    fs::read_to_string("/proc/sys/kernel/perf_event_paranoid")
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Warn when the paranoid level will restrict what can be recorded.
pub fn check_perf_paranoid(system_wide: bool) {
    let Some(level) = perf_event_paranoid() else {
        return;
    };
    let limit = if system_wide { 0 } else { 1 };
    if level > limit && !nix::unistd::geteuid().is_root() {
        log::warn!(
            "perf_event_paranoid={}, recording may be restricted. Consider: sudo sysctl kernel.perf_event_paranoid={}",
            level,
            limit
        );
    }
}

pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

fn read_trimmed(path: &str) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

pub fn hostname() -> String {
    read_trimmed("/proc/sys/kernel/hostname").unwrap_or_default()
}

pub fn os_release() -> String {
    read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default()
}

pub fn arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        other => other,
    }
}

/// Directory holding tracepoint definitions, for tracefs or the older
/// debugfs mount point.
pub fn tracefs_events_dir() -> Option<PathBuf> {
    ["/sys/kernel/tracing/events", "/sys/kernel/debug/tracing/events"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.is_dir())
}

/// All thread ids of a process.
pub fn thread_ids(pid: u32) -> Result<Vec<u32>> {
    let task_path = format!("/proc/{pid}/task");
    let entries = fs::read_dir(&task_path).map_err(|e| {
        Error::InvalidArgument(format!("Cannot read threads of process {pid}: {e}"))
    })?;
    let mut tids: Vec<u32> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse().ok())
        .collect();
    tids.sort_unstable();
    Ok(tids)
}

pub fn all_processes() -> Result<Vec<u32>> {
    let mut pids: Vec<u32> = fs::read_dir("/proc")?
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse().ok())
        .collect();
    pids.sort_unstable();
    Ok(pids)
}

pub fn thread_comm(pid: u32, tid: u32) -> Option<String> {
    read_trimmed(&format!("/proc/{pid}/task/{tid}/comm"))
}

/// The thread group id (process id) of a thread.
pub fn tgid_of(tid: u32) -> Option<u32> {
    let status = fs::read_to_string(format!("/proc/{tid}/status")).ok()?;
    status
        .lines()
        .find_map(|l| l.strip_prefix("Tgid:"))
        .and_then(|v| v.trim().parse().ok())
}

pub fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// A parsed line of /proc/[pid]/maps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub pathname: Option<String>,
}

impl MemoryMapping {
    pub fn is_executable(&self) -> bool {
        self.perms.contains('x')
    }

    pub fn parse_line(line: &str) -> Option<MemoryMapping> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return None;
        }
        let (start, end) = parts[0].split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let offset = u64::from_str_radix(parts[2], 16).ok()?;
        let pathname = (parts.len() >= 6).then(|| parts[5..].join(" "));
        Some(MemoryMapping {
            start,
            end,
            perms: parts[1].to_string(),
            offset,
            pathname,
        })
    }
}

/// Executable mappings of a process, used to describe threads that were
/// running before recording started.
pub fn executable_mappings(pid: u32) -> Result<Vec<MemoryMapping>> {
    let content = fs::read_to_string(format!("/proc/{pid}/maps"))?;
    Ok(content
        .lines()
        .filter_map(MemoryMapping::parse_line)
        .filter(|m| m.is_executable())
        .collect())
}

/// Start address of the kernel text, from /proc/kallsyms when readable.
pub fn kernel_start_address() -> Option<u64> {
    let content = fs::read_to_string("/proc/kallsyms").ok()?;
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let addr = u64::from_str_radix(parts.next()?, 16).ok()?;
        let _kind = parts.next()?;
        (parts.next()? == "_text" && addr != 0).then_some(addr)
    })
}
