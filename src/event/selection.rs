//! The set of events being recorded and the descriptors opened for them.
//!
//! Events are added in groups; a group is opened as a kernel event group on
//! every (thread, cpu) pair, all members or none. Once opened, every cpu
//! has one ring buffer shared by all descriptors on it, and the set drains
//! those buffers into a record sink from an [`IOEventLoop`].

use super::event_fd::{CounterValue, EventBackend, EventFile, KernelBackend};
use super::event_type::{
    self, EventTypeAndModifier, DEFAULT_SAMPLE_FREQ, DEFAULT_TRACEPOINT_PERIOD,
};
use crate::environment;
use crate::error::{Error, Result};
use crate::io_loop::{EventHandle, IOEventLoop};
use crate::perf::*;
use crate::record::{self, EventIdRecord, Record};
use crate::record_file::features::EventDesc;
use crate::record_file::AttrWithIds;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

pub const DEFAULT_MIN_MMAP_PAGES: usize = 8;
pub const DEFAULT_MAX_MMAP_PAGES: usize = 256;
pub const DEFAULT_CPU_HOTPLUG_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_DWARF_STACK_SIZE: u32 = 8192;
/// Largest stack dump the kernel accepts, rounded down to 8 bytes.
pub const MAX_DWARF_STACK_SIZE: u32 = 65528;

/// Receives every record drained from the ring buffers. Returning false
/// stops the event loop with an error.
pub type RecordSink = Box<dyn FnMut(Record) -> bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterInfo {
    pub tid: i32,
    pub cpu: u32,
    pub counter: CounterValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountersInfo {
    pub group_id: usize,
    pub event_name: String,
    pub event_modifier: String,
    pub counters: Vec<CounterInfo>,
}

impl CountersInfo {
    pub fn total(&self) -> CounterValue {
        let mut total = CounterValue::default();
        for c in &self.counters {
            total.add(&c.counter);
        }
        total
    }
}

/// One selected event and the descriptors opened for it.
pub struct EventSelection {
    pub event_type: EventTypeAndModifier,
    pub attr: PerfEventAttr,
    files: Vec<Box<dyn EventFile>>,
    hotplugged_counters: Vec<CounterInfo>,
}

impl EventSelection {
    pub fn ids(&self) -> Vec<u64> {
        self.files.iter().map(|f| f.id()).collect()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

fn thread_desc(tid: i32) -> String {
    if tid == -1 {
        "all threads".to_string()
    } else {
        format!("thread {tid}")
    }
}

pub struct EventSelectionSet {
    backend: Box<dyn EventBackend>,
    for_stat: bool,
    groups: Vec<Vec<EventSelection>>,
    processes: BTreeSet<u32>,
    threads: BTreeSet<i32>,
    mmap_pages: usize,
    monitored_cpus: BTreeSet<u32>,
    online_cpus: Vec<u32>,
    sink: Option<RecordSink>,
    read_events: BTreeMap<u32, EventHandle>,
    decode_attrs: Vec<PerfEventAttr>,
    id_to_attr: HashMap<u64, usize>,
    id_positions: Option<(usize, usize)>,
    read_buf: Vec<u8>,
}

impl EventSelectionSet {
    /// A set backed by the running kernel. `for_stat` selects counting
    /// mode: no buffers are mapped and counters of offlined cpus are kept.
    pub fn new(for_stat: bool) -> Self {
        Self::with_backend(Box::new(KernelBackend), for_stat)
    }

    pub fn with_backend(backend: Box<dyn EventBackend>, for_stat: bool) -> Self {
        EventSelectionSet {
            backend,
            for_stat,
            groups: Vec::new(),
            processes: BTreeSet::new(),
            threads: BTreeSet::new(),
            mmap_pages: 0,
            monitored_cpus: BTreeSet::new(),
            online_cpus: Vec::new(),
            sink: None,
            read_events: BTreeMap::new(),
            decode_attrs: Vec::new(),
            id_to_attr: HashMap::new(),
            id_positions: None,
            read_buf: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Every selection, in the order their attrs are written to a file.
    pub fn selections(&self) -> impl Iterator<Item = &EventSelection> {
        self.groups.iter().flatten()
    }

    fn selections_mut(&mut self) -> impl Iterator<Item = &mut EventSelection> {
        self.groups.iter_mut().flatten()
    }

    fn build_selection(&self, name: &str, pending: &[EventSelection]) -> Result<EventSelection> {
        let event_type = event_type::parse_event_type(name)?;
        let mut attr = event_type::create_default_attr(&event_type.event_type);
        event_type.apply_to(&mut attr);
        if !self.backend.is_supported(&attr) {
            return Err(Error::KernelRejected {
                event: event_type.name,
                reason: "the event is not supported by the kernel".to_string(),
            });
        }
        if self
            .selections()
            .chain(pending)
            .any(|s| s.event_type.name == event_type.name)
        {
            return Err(Error::InvalidArgument(format!(
                "event type '{}' appears more than once",
                event_type.name
            )));
        }
        Ok(EventSelection {
            event_type,
            attr,
            files: Vec::new(),
            hotplugged_counters: Vec::new(),
        })
    }

    pub fn add_event(&mut self, name: &str) -> Result<()> {
        self.add_event_group(&[name])
    }

    /// Add events that are scheduled together. Nothing is added unless every
    /// event is accepted.
    pub fn add_event_group<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        if names.is_empty() {
            return Err(Error::InvalidArgument("empty event group".to_string()));
        }
        let mut group = Vec::with_capacity(names.len());
        for name in names {
            let selection = self.build_selection(name.as_ref(), &group)?;
            group.push(selection);
        }
        self.groups.push(group);
        self.union_sample_type();
        Ok(())
    }

    /// Give every attr the same sample_type so one decoder reads them all.
    fn union_sample_type(&mut self) {
        let sample_type = self.selections().fold(0, |acc, s| acc | s.attr.sample_type);
        for s in self.selections_mut() {
            s.attr.sample_type = sample_type;
        }
    }

    pub fn set_sample_freq(&mut self, freq: u64) {
        for s in self.selections_mut() {
            s.attr.set_sample_freq(freq);
        }
    }

    pub fn set_sample_period(&mut self, period: u64) {
        for s in self.selections_mut() {
            s.attr.set_sample_period(period);
        }
    }

    pub fn use_default_sample_freq(&mut self) {
        for s in self.selections_mut() {
            if s.event_type.event_type.is_tracepoint() {
                s.attr.set_sample_period(DEFAULT_TRACEPOINT_PERIOD);
            } else {
                s.attr.set_sample_freq(DEFAULT_SAMPLE_FREQ);
            }
        }
    }

    /// With enable-on-exec the events start disabled and the kernel enables
    /// them when the workload execs; otherwise they count from open.
    pub fn set_enable_on_exec(&mut self, enable: bool) {
        for s in self.selections_mut() {
            s.attr.set_enable_on_exec(enable);
            s.attr.set_disabled(enable);
        }
    }

    pub fn enable_on_exec(&self) -> bool {
        self.selections().all(|s| s.attr.enable_on_exec())
    }

    pub fn set_sample_id_all(&mut self) {
        for s in self.selections_mut() {
            s.attr.set_sample_id_all(true);
        }
    }

    pub fn set_inherit(&mut self, enable: bool) {
        for s in self.selections_mut() {
            s.attr.set_inherit(enable);
        }
    }

    /// Wake the reader on every record instead of when the buffer fills.
    pub fn set_low_watermark(&mut self) {
        for s in self.selections_mut() {
            s.attr.wakeup_events_or_watermark = 1;
        }
    }

    /// Check that the kernel accepts every attr after `modify`, then apply it.
    fn apply_if_supported(
        &mut self,
        feature: &str,
        modify: impl Fn(&mut PerfEventAttr),
    ) -> Result<()> {
        let mut modified = Vec::new();
        for s in self.selections() {
            let mut attr = s.attr.clone();
            modify(&mut attr);
            if !self.backend.is_supported(&attr) {
                return Err(Error::UnsupportedFeature(format!(
                    "{feature} is not supported for event '{}' on this device",
                    s.event_type.name
                )));
            }
            modified.push(attr);
        }
        for (s, attr) in self.selections_mut().zip(modified) {
            s.attr = attr;
        }
        Ok(())
    }

    pub fn set_branch_sampling(&mut self, branch_sample_type: u64) -> Result<()> {
        let valid = PERF_SAMPLE_BRANCH_ANY
            | PERF_SAMPLE_BRANCH_ANY_CALL
            | PERF_SAMPLE_BRANCH_ANY_RETURN
            | PERF_SAMPLE_BRANCH_IND_CALL;
        if branch_sample_type != 0 && branch_sample_type & valid == 0 {
            return Err(Error::InvalidArgument(format!(
                "invalid branch_sample_type: {branch_sample_type:#x}"
            )));
        }
        self.apply_if_supported("branch stack sampling", |attr| {
            if branch_sample_type != 0 {
                attr.sample_type |= PERF_SAMPLE_BRANCH_STACK;
            } else {
                attr.sample_type &= !PERF_SAMPLE_BRANCH_STACK;
            }
            attr.branch_sample_type = branch_sample_type;
        })
    }

    pub fn enable_fp_call_chain_sampling(&mut self) -> Result<()> {
        self.apply_if_supported("frame pointer call chain sampling", |attr| {
            attr.sample_type |= PERF_SAMPLE_CALLCHAIN;
        })
    }

    pub fn enable_dwarf_call_chain_sampling(&mut self, stack_size: u32) -> Result<()> {
        if stack_size == 0 || stack_size % 8 != 0 || stack_size > MAX_DWARF_STACK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "invalid dwarf stack size {stack_size}: must be a non-zero multiple of 8 up to {MAX_DWARF_STACK_SIZE}"
            )));
        }
        let regs = supported_user_regs_mask();
        if regs == 0 {
            return Err(Error::UnsupportedFeature(
                "dwarf call chain sampling is not supported on this architecture".to_string(),
            ));
        }
        self.apply_if_supported("dwarf call chain sampling", |attr| {
            attr.sample_type |=
                PERF_SAMPLE_CALLCHAIN | PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
            attr.set_exclude_callchain_user(true);
            attr.sample_regs_user = regs;
            attr.sample_stack_user = stack_size;
        })
    }

    pub fn need_kernel_symbol(&self) -> bool {
        self.selections().any(|s| !s.attr.exclude_kernel())
    }

    pub fn add_monitored_process(&mut self, pid: u32) {
        self.processes.insert(pid);
    }

    pub fn add_monitored_thread(&mut self, tid: i32) {
        self.threads.insert(tid);
    }

    /// Monitor every thread; descriptors are then opened per cpu only.
    pub fn set_system_wide(&mut self) {
        self.threads.insert(-1);
    }

    pub fn has_monitored_target(&self) -> bool {
        !self.processes.is_empty() || !self.threads.is_empty()
    }

    fn prepare_threads(&self) -> Result<BTreeSet<i32>> {
        let mut threads = self.threads.clone();
        for &pid in &self.processes {
            threads.extend(environment::thread_ids(pid)?.into_iter().map(|t| t as i32));
        }
        Ok(threads)
    }

    fn group_name(&self, group: usize) -> String {
        self.groups[group]
            .iter()
            .map(|s| s.event_type.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Open every member of a group on one (thread, cpu). On failure the
    /// members opened so far are closed again.
    fn open_group_on(&mut self, group: usize, tid: i32, cpu: u32, reopen: bool) -> Result<()> {
        let mut opened: Vec<Box<dyn EventFile>> = Vec::with_capacity(self.groups[group].len());
        for selection in &self.groups[group] {
            let mut attr = selection.attr.clone();
            if reopen {
                attr.set_enable_on_exec(false);
                attr.set_disabled(true);
            }
            let leader = opened.first().map(|f| f.as_ref());
            let file = self.backend.open(&attr, tid, cpu, leader).map_err(|e| {
                log::debug!(
                    "failed to open {} for {} on cpu {}: {}",
                    selection.event_type.name,
                    thread_desc(tid),
                    cpu,
                    e
                );
                e
            })?;
            opened.push(file);
        }
        for (selection, file) in self.groups[group].iter_mut().zip(opened) {
            selection.files.push(file);
        }
        Ok(())
    }

    /// Open descriptors for every group, thread and cpu. An empty cpu list
    /// means all online cpus. A (group, thread) pair must open on at least
    /// one cpu.
    pub fn open_event_files(&mut self, cpus: &[u32]) -> Result<()> {
        let online = self.backend.online_cpus()?;
        let cpus = if cpus.is_empty() {
            online
        } else {
            if let Some(cpu) = cpus.iter().find(|&&c| !online.contains(&c)) {
                return Err(Error::InvalidArgument(format!("cpu {cpu} is not online")));
            }
            cpus.to_vec()
        };
        let threads = self.prepare_threads()?;
        if threads.is_empty() {
            return Err(Error::InvalidArgument(
                "no process or thread to monitor".to_string(),
            ));
        }
        for group in 0..self.groups.len() {
            for &tid in &threads {
                let mut success = 0;
                let mut last_err = None;
                for &cpu in &cpus {
                    match self.open_group_on(group, tid, cpu, false) {
                        Ok(()) => success += 1,
                        Err(e) => last_err = Some(e),
                    }
                }
                if success == 0 {
                    let context = format!(
                        "failed to open event {} for {} on all cpus",
                        self.group_name(group),
                        thread_desc(tid)
                    );
                    return Err(match last_err {
                        Some(Error::PermissionDenied(msg)) => {
                            Error::PermissionDenied(format!("{context}: {msg}"))
                        }
                        Some(e) => Error::EventOpen(format!("{context}: {e}")),
                        None => Error::EventOpen(context),
                    });
                }
            }
        }
        self.rebuild_id_map()
    }

    fn rebuild_id_map(&mut self) -> Result<()> {
        self.decode_attrs = self.selections().map(|s| s.attr.clone()).collect();
        let mut id_to_attr = HashMap::new();
        for (index, s) in self.selections().enumerate() {
            for file in &s.files {
                id_to_attr.insert(file.id(), index);
            }
        }
        self.id_to_attr = id_to_attr;
        self.id_positions = if self.decode_attrs.len() > 1 {
            Some(record::common_id_positions(&self.decode_attrs)?)
        } else {
            None
        };
        Ok(())
    }

    pub fn enable_events(&self) -> Result<()> {
        for s in self.selections() {
            for file in &s.files {
                file.enable()?;
            }
        }
        Ok(())
    }

    pub fn disable_events(&self) -> Result<()> {
        for s in self.selections() {
            for file in &s.files {
                file.disable()?;
            }
        }
        Ok(())
    }

    pub fn read_counters(&self) -> Result<Vec<CountersInfo>> {
        let mut result = Vec::new();
        for (group_id, group) in self.groups.iter().enumerate() {
            for s in group {
                let mut counters = s.hotplugged_counters.clone();
                for file in &s.files {
                    counters.push(CounterInfo {
                        tid: file.tid(),
                        cpu: file.cpu(),
                        counter: file.read_counter()?,
                    });
                }
                result.push(CountersInfo {
                    group_id,
                    event_name: s.event_type.event_type.name.clone(),
                    event_modifier: s.event_type.modifier.clone(),
                    counters,
                });
            }
        }
        Ok(result)
    }

    /// Attrs and their descriptor ids, in attr-section order.
    pub fn attrs_with_ids(&self) -> Vec<AttrWithIds> {
        self.selections()
            .map(|s| AttrWithIds {
                attr: s.attr.clone(),
                ids: s.ids(),
            })
            .collect()
    }

    pub fn event_descs(&self) -> Vec<EventDesc> {
        self.selections()
            .map(|s| EventDesc {
                attr: s.attr.clone(),
                name: s.event_type.name.clone(),
                ids: s.ids(),
            })
            .collect()
    }

    /// Map one ring buffer per cpu, trying `max_pages` first and halving
    /// down to `min_pages` while the kernel refuses.
    pub fn mmap_event_files(&mut self, min_pages: usize, max_pages: usize) -> Result<()> {
        if !min_pages.is_power_of_two() || !max_pages.is_power_of_two() || min_pages > max_pages {
            return Err(Error::InvalidArgument(format!(
                "invalid mmap page range {min_pages}..{max_pages}"
            )));
        }
        let mut pages = max_pages;
        let mut last_err = None;
        while pages >= min_pages {
            match self.try_mmap_event_files(pages) {
                Ok(()) => {
                    log::debug!("mapped buffer size is {pages} pages");
                    self.mmap_pages = pages;
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("mapping {pages} pages failed: {e}");
                    for s in self.selections_mut() {
                        for file in &mut s.files {
                            file.destroy_mapped_buffer();
                        }
                    }
                    last_err = Some(e);
                }
            }
            pages >>= 1;
        }
        Err(last_err.unwrap_or_else(|| Error::InvalidArgument("no pages to map".to_string())))
    }

    fn try_mmap_event_files(&mut self, pages: usize) -> Result<()> {
        let mut owners: BTreeMap<u32, RawFd> = BTreeMap::new();
        for s in self.selections_mut() {
            for file in &mut s.files {
                match owners.get(&file.cpu()) {
                    Some(&owner_fd) => file.share_mapped_buffer(owner_fd)?,
                    None => {
                        file.create_mapped_buffer(pages)?;
                        owners.insert(file.cpu(), file.raw_fd());
                    }
                }
            }
        }
        Ok(())
    }

    fn create_mapped_buffer_for_cpu(&mut self, cpu: u32) -> Result<()> {
        let pages = self.mmap_pages.max(DEFAULT_MIN_MMAP_PAGES);
        let mut owner: Option<RawFd> = None;
        let mut result = Ok(());
        for s in self.selections_mut() {
            for file in s.files.iter_mut().filter(|f| f.cpu() == cpu) {
                result = match owner {
                    Some(fd) => file.share_mapped_buffer(fd),
                    None => {
                        let created = file.create_mapped_buffer(pages);
                        if created.is_ok() {
                            owner = Some(file.raw_fd());
                        }
                        created
                    }
                };
                if result.is_err() {
                    break;
                }
            }
            if result.is_err() {
                break;
            }
        }
        if result.is_err() {
            for s in self.selections_mut() {
                for file in s.files.iter_mut().filter(|f| f.cpu() == cpu) {
                    file.destroy_mapped_buffer();
                }
            }
        }
        result
    }

    /// Cpus that currently have a mapped buffer.
    pub fn buffer_cpus(&self) -> Vec<u32> {
        let cpus: BTreeSet<u32> = self
            .selections()
            .flat_map(|s| s.files.iter())
            .filter(|f| f.has_mapped_buffer())
            .map(|f| f.cpu())
            .collect();
        cpus.into_iter().collect()
    }

    fn buffer_owner_fd(&self, cpu: u32) -> Option<RawFd> {
        self.selections()
            .flat_map(|s| s.files.iter())
            .find(|f| f.cpu() == cpu && f.has_mapped_buffer())
            .map(|f| f.raw_fd())
    }

    fn attr_index_for(&self, data: &[u8]) -> usize {
        if let Some((sample_pos, reverse_pos)) = self.id_positions
            && let Some(id) = record::peek_event_id(data, sample_pos, reverse_pos)
            && let Some(&index) = self.id_to_attr.get(&id)
        {
            return index;
        }
        0
    }

    fn deliver(&mut self, record: Record) -> bool {
        match self.sink.as_mut() {
            Some(sink) => sink(record),
            None => true,
        }
    }

    fn deliver_records(&mut self, data: &[u8]) -> Result<bool> {
        let mut pos = 0;
        while pos < data.len() {
            let header = record::peek_header(&data[pos..])?;
            let size = usize::from(header.size);
            if size < PerfEventHeader::SIZE || size > data.len() - pos {
                return Err(Error::corrupt(format!(
                    "ring buffer record of type {} has bad size {} at offset {}",
                    header.type_, size, pos
                )));
            }
            let bytes = &data[pos..pos + size];
            pos += size;
            let index = self.attr_index_for(bytes);
            let attr = self
                .decode_attrs
                .get(index)
                .ok_or_else(|| Error::InvalidArgument("no event attrs".to_string()))?;
            let record = Record::decode(attr, bytes)?;
            if !self.deliver(record) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Drain the buffer of `cpu` once. Returns false if the sink refused a
    /// record.
    pub fn read_mmap_event_data_on_cpu(&mut self, cpu: u32) -> Result<bool> {
        let mut chunk = std::mem::take(&mut self.read_buf);
        chunk.clear();
        let owner = self
            .selections_mut()
            .flat_map(|s| s.files.iter_mut())
            .find(|f| f.cpu() == cpu && f.has_mapped_buffer());
        let read = match owner {
            Some(file) => file.read_mapped_data(&mut chunk),
            None => Ok(0),
        };
        let result = match read {
            Ok(0) => Ok(true),
            Ok(_) => self.deliver_records(&chunk),
            Err(e) => Err(e),
        };
        self.read_buf = chunk;
        result
    }

    /// Drain every buffer one last time; data below the wakeup threshold
    /// never raised a read event.
    pub fn finish_read_mmap_event_data(&mut self) -> Result<bool> {
        for cpu in self.buffer_cpus() {
            if !self.read_mmap_event_data_on_cpu(cpu)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Register a read event per mapped buffer; drained records go to `sink`.
    pub fn prepare_to_read_mmap_event_data(
        this: &Rc<RefCell<Self>>,
        lp: &mut IOEventLoop,
        sink: RecordSink,
    ) -> Result<()> {
        let cpus = {
            let mut set = this.borrow_mut();
            set.sink = Some(sink);
            set.buffer_cpus()
        };
        for cpu in cpus {
            Self::start_polling(this, lp, cpu)?;
        }
        Ok(())
    }

    fn start_polling(this: &Rc<RefCell<Self>>, lp: &mut IOEventLoop, cpu: u32) -> Result<()> {
        let Some(fd) = this.borrow().buffer_owner_fd(cpu) else {
            return Ok(());
        };
        let weak = Rc::downgrade(this);
        let handle = lp.add_read_event(fd, move |_| {
            let Some(set) = weak.upgrade() else {
                return true;
            };
            let result = set.borrow_mut().read_mmap_event_data_on_cpu(cpu);
            result.unwrap_or_else(|e| {
                log::error!("failed to read mapped buffer of cpu {cpu}: {e}");
                false
            })
        })?;
        this.borrow_mut().read_events.insert(cpu, handle);
        Ok(())
    }

    /// Probe the online cpu list every `interval` and follow cpus going
    /// offline or online. An empty `monitored_cpus` follows every cpu.
    pub fn handle_cpu_hotplug_events(
        this: &Rc<RefCell<Self>>,
        lp: &mut IOEventLoop,
        monitored_cpus: &[u32],
        interval: Duration,
    ) -> Result<()> {
        {
            let mut set = this.borrow_mut();
            set.monitored_cpus.extend(monitored_cpus);
            let online = set.backend.online_cpus()?;
            set.online_cpus = online;
        }
        let weak = Rc::downgrade(this);
        lp.add_periodic_event(interval, move |lp| {
            let Some(set) = weak.upgrade() else {
                return true;
            };
            Self::detect_cpu_hotplug_events(&set, lp).unwrap_or_else(|e| {
                log::error!("failed to handle cpu hotplug: {e}");
                false
            })
        })?;
        Ok(())
    }

    pub fn detect_cpu_hotplug_events(this: &Rc<RefCell<Self>>, lp: &mut IOEventLoop) -> Result<bool> {
        let (offlined, onlined, new_cpus) = {
            let set = this.borrow();
            let new_cpus = set.backend.online_cpus()?;
            let monitored =
                |cpu: u32| set.monitored_cpus.is_empty() || set.monitored_cpus.contains(&cpu);
            let offlined: Vec<u32> = set
                .online_cpus
                .iter()
                .copied()
                .filter(|&c| !new_cpus.contains(&c) && monitored(c))
                .collect();
            let onlined: Vec<u32> = new_cpus
                .iter()
                .copied()
                .filter(|&c| !set.online_cpus.contains(&c) && monitored(c))
                .collect();
            (offlined, onlined, new_cpus)
        };
        for cpu in offlined {
            log::info!("cpu {cpu} is offline");
            if !Self::handle_cpu_offline(this, lp, cpu)? {
                return Ok(false);
            }
        }
        for cpu in onlined {
            log::info!("cpu {cpu} is online");
            if !Self::handle_cpu_online(this, lp, cpu)? {
                return Ok(false);
            }
        }
        this.borrow_mut().online_cpus = new_cpus;
        Ok(true)
    }

    /// Drain (or snapshot, in counting mode) the cpu, then close its
    /// descriptors.
    fn handle_cpu_offline(this: &Rc<RefCell<Self>>, lp: &mut IOEventLoop, cpu: u32) -> Result<bool> {
        let mut set = this.borrow_mut();
        if set.for_stat {
            for s in set.selections_mut() {
                for file in s.files.iter().filter(|f| f.cpu() == cpu) {
                    let counter = file.read_counter()?;
                    s.hotplugged_counters.push(CounterInfo {
                        tid: file.tid(),
                        cpu,
                        counter,
                    });
                }
            }
        } else {
            if let Some(handle) = set.read_events.remove(&cpu) {
                lp.del_event(handle);
            }
            if !set.read_mmap_event_data_on_cpu(cpu)? {
                return Ok(false);
            }
        }
        for s in set.selections_mut() {
            s.files.retain(|f| f.cpu() != cpu);
        }
        Ok(true)
    }

    /// Map and enable the descriptors just opened on `cpu`. Returns
    /// (attr index, id) of each.
    fn activate_cpu(&mut self, cpu: u32) -> Result<Vec<(u64, u64)>> {
        if !self.for_stat {
            self.create_mapped_buffer_for_cpu(cpu)?;
        }
        let mut ids = Vec::new();
        for (index, s) in self.selections().enumerate() {
            for file in s.files.iter().filter(|f| f.cpu() == cpu) {
                file.enable()?;
                ids.push((index as u64, file.id()));
            }
        }
        Ok(ids)
    }

    /// Reopen descriptors on the cpu, map and enable them, and announce
    /// their ids with an EventId record.
    fn handle_cpu_online(this: &Rc<RefCell<Self>>, lp: &mut IOEventLoop, cpu: u32) -> Result<bool> {
        {
            let mut set = this.borrow_mut();
            let threads = set.prepare_threads()?;
            for group in 0..set.groups.len() {
                for &tid in &threads {
                    if let Err(e) = set.open_group_on(group, tid, cpu, true) {
                        // The cpu may already be offline again.
                        log::warn!(
                            "failed to open event {} for {} on cpu {}: {}",
                            set.group_name(group),
                            thread_desc(tid),
                            cpu,
                            e
                        );
                    }
                }
            }
            let ids = match set.activate_cpu(cpu) {
                Ok(ids) => ids,
                Err(e) => {
                    for s in set.selections_mut() {
                        s.files.retain(|f| f.cpu() != cpu);
                    }
                    return Err(e);
                }
            };
            for &(index, id) in &ids {
                set.id_to_attr.insert(id, index as usize);
            }
            if set.for_stat || ids.is_empty() {
                return Ok(true);
            }
            if !set.deliver(Record::EventId(EventIdRecord { ids })) {
                return Ok(false);
            }
        }
        Self::start_polling(this, lp, cpu)?;
        Ok(true)
    }
}
