//! Processes, threads and their address-space maps as reconstructed from
//! mmap/comm/fork/exit records.

use crate::perf::{DEFAULT_KERNEL_MMAP_NAME, PERF_RECORD_MISC_CPUMODE_MASK, PERF_RECORD_MISC_KERNEL};
use crate::record::Record;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// Owner pid of kernel maps.
pub const KERNEL_PID: i32 = -1;
pub const UNKNOWN_MAP_NAME: &str = "unknown";
const UNKNOWN_COMM: &str = "unknown";
/// Name the kernel gives anonymous executable mappings.
const ANON_EXEC_NAME: &str = "//anon";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: i32,
    pub comm: Rc<str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadEntry {
    pub pid: i32,
    pub tid: i32,
    /// Latest comm seen for the thread.
    pub comm: Rc<str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    /// Owning process, or [`KERNEL_PID`].
    pub pid: i32,
    pub start_addr: u64,
    pub len: u64,
    pub pgoff: u64,
    /// Creation time of the mapping.
    pub time: u64,
    pub filename: String,
}

impl MapEntry {
    pub fn end_addr(&self) -> u64 {
        self.start_addr.saturating_add(self.len)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start_addr && addr < self.end_addr()
    }

    pub fn in_kernel(&self) -> bool {
        self.pid == KERNEL_PID
    }

    /// File offset of `addr`, which must lie inside the map.
    pub fn file_offset(&self, addr: u64) -> u64 {
        addr - self.start_addr + self.pgoff
    }
}

/// Live maps of one owner, keyed by start address. Live maps never overlap.
type MapSet = BTreeMap<u64, Rc<MapEntry>>;

fn find_in(maps: &MapSet, addr: u64) -> Option<&Rc<MapEntry>> {
    maps.range(..=addr)
        .next_back()
        .map(|(_, m)| m)
        .filter(|m| m.contains(addr))
}

/// Insert `map`, clipping older maps it overlaps down to the parts it
/// does not cover.
fn insert_map(maps: &mut MapSet, map: MapEntry) {
    let (start, end) = (map.start_addr, map.end_addr());
    let overlapped: Vec<u64> = maps
        .range(..end)
        .rev()
        .take_while(|(_, m)| m.end_addr() > start)
        .map(|(&k, _)| k)
        .collect();
    for key in overlapped {
        let Some(old) = maps.remove(&key) else {
            continue;
        };
        if old.start_addr < start {
            let head = MapEntry {
                len: start - old.start_addr,
                ..(*old).clone()
            };
            maps.insert(head.start_addr, Rc::new(head));
        }
        if old.end_addr() > end {
            let tail = MapEntry {
                start_addr: end,
                len: old.end_addr() - end,
                pgoff: old.pgoff + (end - old.start_addr),
                ..(*old).clone()
            };
            maps.insert(tail.start_addr, Rc::new(tail));
        }
    }
    maps.insert(start, Rc::new(map));
}

#[derive(Debug, Default)]
pub struct ThreadTree {
    processes: HashMap<i32, ProcessEntry>,
    threads: HashMap<i32, ThreadEntry>,
    kernel_maps: MapSet,
    user_maps: HashMap<i32, MapSet>,
    unknown_maps: HashMap<i32, Rc<MapEntry>>,
}

impl ThreadTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the comm of a process; a later call replaces it.
    pub fn add_process(&mut self, pid: i32, comm: &str) {
        self.processes.insert(
            pid,
            ProcessEntry {
                pid,
                comm: Rc::from(comm),
            },
        );
    }

    pub fn process(&self, pid: i32) -> Option<&ProcessEntry> {
        self.processes.get(&pid)
    }

    /// Add a thread or update its comm. The main thread's comm is also the
    /// process comm.
    pub fn add_thread(&mut self, pid: i32, tid: i32, comm: &str) {
        let comm: Rc<str> = Rc::from(comm);
        self.threads
            .entry(tid)
            .and_modify(|t| t.comm = comm.clone())
            .or_insert_with(|| ThreadEntry {
                pid,
                tid,
                comm: comm.clone(),
            });
        if pid == tid || !self.processes.contains_key(&pid) {
            self.processes.insert(pid, ProcessEntry { pid, comm });
        }
    }

    pub fn update_thread_comm(&mut self, pid: i32, tid: i32, comm: &str) {
        self.add_thread(pid, tid, comm);
    }

    pub fn thread(&self, tid: i32) -> Option<&ThreadEntry> {
        self.threads.get(&tid)
    }

    pub fn find_thread_or_new(&mut self, pid: i32, tid: i32) -> &ThreadEntry {
        if let Some(t) = self.threads.get(&tid)
            && t.pid != pid
        {
            log::debug!("thread {tid} moved from process {} to {pid}", t.pid);
            self.threads.remove(&tid);
        }
        if !self.processes.contains_key(&pid) {
            self.add_process(pid, UNKNOWN_COMM);
        }
        let process_comm = self.processes.get(&pid).map(|p| p.comm.clone());
        self.threads.entry(tid).or_insert_with(|| ThreadEntry {
            pid,
            tid,
            comm: process_comm.unwrap_or_else(|| Rc::from(UNKNOWN_COMM)),
        })
    }

    /// A child inherits the parent's comm and, when it starts a new
    /// process, a copy of the parent's user maps.
    pub fn fork_thread(&mut self, pid: i32, tid: i32, ppid: i32, ptid: i32) {
        let parent_comm = self.find_thread_or_new(ppid, ptid).comm.clone();
        self.find_thread_or_new(pid, tid);
        if let Some(child) = self.threads.get_mut(&tid) {
            child.comm = parent_comm.clone();
        }
        if pid != ppid {
            if let Some(p) = self.processes.get_mut(&pid) {
                p.comm = parent_comm;
            }
            if let Some(parent_maps) = self.user_maps.get(&ppid).cloned() {
                self.user_maps.entry(pid).or_insert(parent_maps);
            }
        }
    }

    /// Forget an exited thread. The process keeps its comm and maps: the
    /// main thread may exit while other threads keep running.
    pub fn exit_thread(&mut self, _pid: i32, tid: i32) {
        self.threads.remove(&tid);
    }

    /// Kernel maps are visible from every process. Zero-length maps, which
    /// the kernel reports to unprivileged recorders, are ignored.
    pub fn add_kernel_map(&mut self, start_addr: u64, len: u64, pgoff: u64, time: u64, filename: &str) {
        if len == 0 {
            return;
        }
        insert_map(
            &mut self.kernel_maps,
            MapEntry {
                pid: KERNEL_PID,
                start_addr,
                len,
                pgoff,
                time,
                filename: filename.to_string(),
            },
        );
    }

    pub fn add_user_map(&mut self, pid: i32, start_addr: u64, len: u64, pgoff: u64, time: u64, filename: &str) {
        if len == 0 {
            return;
        }
        insert_map(
            self.user_maps.entry(pid).or_default(),
            MapEntry {
                pid,
                start_addr,
                len,
                pgoff,
                time,
                filename: filename.to_string(),
            },
        );
    }

    pub fn add_thread_map(
        &mut self,
        pid: i32,
        tid: i32,
        start_addr: u64,
        len: u64,
        pgoff: u64,
        time: u64,
        filename: &str,
    ) {
        self.find_thread_or_new(pid, tid);
        self.add_user_map(pid, start_addr, len, pgoff, time, filename);
    }

    pub fn user_maps(&self, pid: i32) -> impl Iterator<Item = &Rc<MapEntry>> {
        self.user_maps.get(&pid).into_iter().flat_map(|m| m.values())
    }

    pub fn kernel_maps(&self) -> impl Iterator<Item = &Rc<MapEntry>> {
        self.kernel_maps.values()
    }

    /// The map covering `ip` in process `pid`: user maps first, then kernel
    /// maps, then the process's unknown map.
    pub fn find_map(&mut self, pid: i32, ip: u64) -> Rc<MapEntry> {
        let found = self
            .user_maps
            .get(&pid)
            .and_then(|maps| find_in(maps, ip))
            .or_else(|| find_in(&self.kernel_maps, ip));
        match found {
            Some(map) => map.clone(),
            None => self.unknown_map(pid),
        }
    }

    /// Like [`find_map`](Self::find_map) when the cpu mode of `ip` is known.
    pub fn find_map_in(&mut self, pid: i32, ip: u64, in_kernel: bool) -> Rc<MapEntry> {
        let found = if in_kernel {
            find_in(&self.kernel_maps, ip)
        } else {
            self.user_maps.get(&pid).and_then(|maps| find_in(maps, ip))
        };
        match found {
            Some(map) => map.clone(),
            None => self.unknown_map(pid),
        }
    }

    /// One catch-all map per process for addresses outside every known map.
    pub fn unknown_map(&mut self, pid: i32) -> Rc<MapEntry> {
        self.unknown_maps
            .entry(pid)
            .or_insert_with(|| {
                Rc::new(MapEntry {
                    pid,
                    start_addr: 0,
                    len: u64::MAX,
                    pgoff: 0,
                    time: 0,
                    filename: UNKNOWN_MAP_NAME.to_string(),
                })
            })
            .clone()
    }

    pub fn is_unknown_map(map: &MapEntry) -> bool {
        map.start_addr == 0 && map.len == u64::MAX && map.filename == UNKNOWN_MAP_NAME
    }

    /// Apply one record to the tree. Records that carry no thread or map
    /// information are ignored.
    pub fn update(&mut self, record: &Record) {
        match record {
            Record::Mmap(r) => {
                if r.misc & PERF_RECORD_MISC_CPUMODE_MASK == PERF_RECORD_MISC_KERNEL {
                    self.add_kernel_map(r.addr, r.len, r.pgoff, r.sample_id.time, &r.filename);
                } else {
                    self.add_thread_map(
                        r.pid as i32,
                        r.tid as i32,
                        r.addr,
                        r.len,
                        r.pgoff,
                        r.sample_id.time,
                        &r.filename,
                    );
                }
            }
            Record::Mmap2(r) => {
                if r.misc & PERF_RECORD_MISC_CPUMODE_MASK == PERF_RECORD_MISC_KERNEL {
                    self.add_kernel_map(r.addr, r.len, r.pgoff, r.sample_id.time, &r.filename);
                } else {
                    let filename = if r.filename == ANON_EXEC_NAME {
                        "[unknown]"
                    } else {
                        r.filename.as_str()
                    };
                    self.add_thread_map(
                        r.pid as i32,
                        r.tid as i32,
                        r.addr,
                        r.len,
                        r.pgoff,
                        r.sample_id.time,
                        filename,
                    );
                }
            }
            Record::Comm(r) => self.update_thread_comm(r.pid as i32, r.tid as i32, &r.comm),
            Record::Fork(r) => {
                self.fork_thread(r.pid as i32, r.tid as i32, r.ppid as i32, r.ptid as i32)
            }
            Record::Exit(r) => self.exit_thread(r.pid as i32, r.tid as i32),
            _ => {}
        }
    }

    /// Forget threads and maps.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Build a thread tree from a sequence of records.
pub fn build_thread_tree<'a>(records: impl IntoIterator<Item = &'a Record>) -> ThreadTree {
    let mut tree = ThreadTree::new();
    for record in records {
        tree.update(record);
    }
    tree
}

/// Whether a kernel map name refers to the kernel image rather than a module.
pub fn is_kernel_image(filename: &str) -> bool {
    filename == DEFAULT_KERNEL_MMAP_NAME || filename.starts_with("[kernel.kallsyms]")
}
