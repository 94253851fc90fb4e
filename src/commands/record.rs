use super::{Command, parse_args};
use crate::cli::parse_duration;
use crate::environment::{self, MemoryMapping};
use crate::error::{Error, Result};
use crate::event::selection::{
    DEFAULT_CPU_HOTPLUG_INTERVAL, DEFAULT_DWARF_STACK_SIZE, DEFAULT_MAX_MMAP_PAGES,
    DEFAULT_MIN_MMAP_PAGES,
};
use crate::event::{EventSelectionSet, RecordSink};
use crate::io_loop::IOEventLoop;
use crate::perf::{
    DEFAULT_KERNEL_MMAP_NAME, PERF_RECORD_MISC_KERNEL, PERF_RECORD_MISC_USER,
    PERF_SAMPLE_BRANCH_ANY,
};
use crate::record::{
    BuildIdRecord, CommRecord, KernelSymbolRecord, MmapRecord, Record, SampleId,
};
use crate::record_file::features::NrCpus;
use crate::record_file::{AttrWithIds, RecordFileWriter};
use crate::symbols;
use clap::Parser;
use nix::sys::signal::Signal;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

const DEFAULT_EVENT: &str = "cpu-cycles";
const FALLBACK_EVENT: &str = "cpu-clock";

#[derive(Parser, Debug)]
#[command(name = "record")]
#[command(about = "Record samples of perf events into a perf.data file")]
struct RecordArgs {
    /// Events to sample, comma separated (default: cpu-cycles)
    #[arg(short = 'e', long = "event", value_delimiter = ',')]
    events: Vec<String>,

    /// Events scheduled together as one group, comma separated
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Processes to record, comma separated
    #[arg(short = 'p', long = "pid", value_delimiter = ',')]
    pids: Vec<u32>,

    /// Threads to record, comma separated
    #[arg(short = 't', long = "tid", value_delimiter = ',')]
    tids: Vec<u32>,

    /// Record every thread on every cpu
    #[arg(short = 'a', long = "all", conflicts_with_all = ["pids", "tids"])]
    system_wide: bool,

    /// Cpus to record on, e.g. 0-3,6 (default: all online cpus)
    #[arg(long)]
    cpu: Option<String>,

    /// Samples per second
    #[arg(short = 'F', long = "freq", conflicts_with = "period")]
    freq: Option<u64>,

    /// Events between samples
    #[arg(short = 'c', long = "period")]
    period: Option<u64>,

    /// Record frame pointer call chains
    #[arg(short = 'g', conflicts_with = "call_graph")]
    fp_call_graph: bool,

    /// Call chain method: fp, or dwarf[,stack_size]
    #[arg(long = "call-graph", value_parser = parse_call_graph)]
    call_graph: Option<CallGraph>,

    /// Record taken branches
    #[arg(short = 'b', long = "branch-any")]
    branch: bool,

    /// Do not follow threads created after recording starts
    #[arg(long)]
    no_inherit: bool,

    /// Stop after this long (e.g. 10s, 1m); default runs until interrupted
    #[arg(long, value_parser = parse_duration)]
    duration: Option<Duration>,

    /// How often to check for cpus going offline or online
    #[arg(long, value_parser = parse_duration, default_value = "2s")]
    cpu_hotplug_interval: Duration,

    /// Pages per mapped buffer, a power of two
    #[arg(short = 'm', long = "mmap-pages")]
    mmap_pages: Option<usize>,

    /// Output file
    #[arg(short = 'o', long, default_value = "perf.data")]
    output: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallGraph {
    FramePointer,
    Dwarf(u32),
}

fn parse_call_graph(s: &str) -> std::result::Result<CallGraph, String> {
    let mut parts = s.split(',');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("fp"), None, None) => Ok(CallGraph::FramePointer),
        (Some("dwarf"), None, None) => Ok(CallGraph::Dwarf(DEFAULT_DWARF_STACK_SIZE)),
        (Some("dwarf"), Some(size), None) => size
            .parse()
            .map(CallGraph::Dwarf)
            .map_err(|_| format!("invalid dwarf stack size '{size}'")),
        _ => Err(format!(
            "invalid call graph '{s}'. Expected fp, dwarf or dwarf,<stack size>"
        )),
    }
}

#[derive(Debug, Default)]
struct RecordStats {
    samples: u64,
    lost: u64,
    records: u64,
    /// User-space files seen in map records, for the build id feature.
    mapped_files: BTreeSet<String>,
}

impl RecordStats {
    fn account(&mut self, record: &Record) {
        self.records += 1;
        match record {
            Record::Sample(_) => self.samples += 1,
            Record::Lost(r) => self.lost += r.lost,
            Record::Mmap(r) if r.misc & PERF_RECORD_MISC_KERNEL == 0 => {
                self.mapped_files.insert(r.filename.clone());
            }
            Record::Mmap2(r) if r.misc & PERF_RECORD_MISC_KERNEL == 0 => {
                self.mapped_files.insert(r.filename.clone());
            }
            _ => {}
        }
    }
}

pub struct RecordCommand;

impl RecordCommand {
    pub fn create() -> Box<dyn Command> {
        Box::new(RecordCommand)
    }
}

impl Command for RecordCommand {
    fn name(&self) -> &'static str {
        "record"
    }

    fn short_help(&self) -> &'static str {
        "record samples of perf events"
    }

    fn run(&mut self, args: &[String]) -> Result<()> {
        let Some(args) = parse_args::<RecordArgs>(self.name(), args)? else {
            return Ok(());
        };
        record(&args)
    }
}

fn build_event_selection_set(args: &RecordArgs) -> Result<EventSelectionSet> {
    if !args.system_wide && args.pids.is_empty() && args.tids.is_empty() {
        return Err(Error::InvalidArgument(
            "No target to record. Use -p <pid>, -t <tid> or -a".to_string(),
        ));
    }
    let mut set = EventSelectionSet::new(false);
    for event in &args.events {
        set.add_event(event)?;
    }
    for group in &args.groups {
        let names: Vec<&str> = group.split(',').filter(|n| !n.is_empty()).collect();
        set.add_event_group(&names)?;
    }
    if set.is_empty()
        && let Err(e) = set.add_event(DEFAULT_EVENT)
    {
        log::info!("{DEFAULT_EVENT} is unavailable ({e}), sampling {FALLBACK_EVENT} instead");
        set.add_event(FALLBACK_EVENT)?;
    }

    match (args.freq, args.period) {
        (Some(freq), _) => set.set_sample_freq(freq),
        (None, Some(period)) => set.set_sample_period(period),
        (None, None) => set.use_default_sample_freq(),
    }
    set.set_inherit(!args.no_inherit);

    let call_graph = if args.fp_call_graph {
        Some(CallGraph::FramePointer)
    } else {
        args.call_graph
    };
    match call_graph {
        Some(CallGraph::FramePointer) => set.enable_fp_call_chain_sampling()?,
        Some(CallGraph::Dwarf(size)) => set.enable_dwarf_call_chain_sampling(size)?,
        None => {}
    }
    if args.branch {
        set.set_branch_sampling(PERF_SAMPLE_BRANCH_ANY)?;
    }

    if args.system_wide {
        set.set_system_wide();
    }
    for &pid in &args.pids {
        if !environment::process_exists(pid) {
            return Err(Error::InvalidArgument(format!("Process {pid} does not exist")));
        }
        set.add_monitored_process(pid);
    }
    for &tid in &args.tids {
        set.add_monitored_thread(tid as i32);
    }
    Ok(set)
}

/// SampleId suffix for records written by the recorder itself, routed to
/// the first event.
fn synthetic_sample_id(attrs: &[AttrWithIds]) -> SampleId {
    let Some(first) = attrs.first() else {
        return SampleId::default();
    };
    let mut sample_id = SampleId::new(&first.attr);
    let id = first.ids.first().copied().unwrap_or(0);
    sample_id.id = id;
    sample_id.identifier = id;
    sample_id
}

fn kernel_records(sample_id: &SampleId) -> Vec<Record> {
    let Some(start) = environment::kernel_start_address() else {
        log::warn!("kernel addresses are hidden, kernel samples will not be symbolized");
        return Vec::new();
    };
    let mut records = vec![Record::Mmap(MmapRecord {
        misc: PERF_RECORD_MISC_KERNEL,
        pid: u32::MAX,
        tid: u32::MAX,
        addr: start,
        len: u64::MAX - start,
        pgoff: start,
        filename: DEFAULT_KERNEL_MMAP_NAME.to_string(),
        sample_id: sample_id.clone(),
    })];
    if let Ok(kallsyms) = std::fs::read("/proc/kallsyms") {
        records.push(Record::KernelSymbol(KernelSymbolRecord { kallsyms }));
    }
    records
}

/// Comm and map records describing a process that was running before
/// recording started.
fn thread_records(
    sample_id: &SampleId,
    pid: u32,
    threads: &[(u32, String)],
    mappings: &[MemoryMapping],
) -> Vec<Record> {
    let mut records = Vec::with_capacity(threads.len() + mappings.len());
    let comm = |tid: u32, comm: &str| {
        Record::Comm(CommRecord {
            misc: 0,
            pid,
            tid,
            comm: comm.to_string(),
            sample_id: sample_id.clone(),
        })
    };
    let (main, others): (Vec<_>, Vec<_>) = threads.iter().partition(|(tid, _)| *tid == pid);
    for (tid, name) in &main {
        records.push(comm(*tid, name));
    }
    for m in mappings {
        records.push(Record::Mmap(MmapRecord {
            misc: PERF_RECORD_MISC_USER,
            pid,
            tid: pid,
            addr: m.start,
            len: m.end - m.start,
            pgoff: m.offset,
            filename: m.pathname.clone().unwrap_or_else(|| "//anon".to_string()),
            sample_id: sample_id.clone(),
        }));
    }
    for (tid, name) in &others {
        records.push(comm(*tid, name));
    }
    records
}

fn target_processes(args: &RecordArgs) -> Result<BTreeSet<u32>> {
    if args.system_wide {
        return Ok(environment::all_processes()?.into_iter().collect());
    }
    let mut pids: BTreeSet<u32> = args.pids.iter().copied().collect();
    pids.extend(args.tids.iter().filter_map(|&tid| environment::tgid_of(tid)));
    Ok(pids)
}

fn synthesize_existing_threads(args: &RecordArgs, sample_id: &SampleId) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for pid in target_processes(args)? {
        // Processes may exit while being scanned.
        let Ok(tids) = environment::thread_ids(pid) else {
            continue;
        };
        let threads: Vec<(u32, String)> = tids
            .into_iter()
            .filter_map(|tid| Some((tid, environment::thread_comm(pid, tid)?)))
            .collect();
        let mappings = environment::executable_mappings(pid).unwrap_or_default();
        records.extend(thread_records(sample_id, pid, &threads, &mappings));
    }
    Ok(records)
}

fn build_id_records(files: &BTreeSet<String>) -> Vec<BuildIdRecord> {
    files
        .iter()
        .filter(|f| f.starts_with('/'))
        .filter_map(|f| match symbols::read_build_id(Path::new(f)) {
            Ok(Some(build_id)) => Some(BuildIdRecord {
                misc: PERF_RECORD_MISC_USER,
                pid: u32::MAX,
                build_id,
                filename: f.clone(),
            }),
            Ok(None) => None,
            Err(e) => {
                log::debug!("no build id for {f}: {e}");
                None
            }
        })
        .collect()
}

fn record(args: &RecordArgs) -> Result<()> {
    environment::check_perf_paranoid(args.system_wide);
    let mut set = build_event_selection_set(args)?;
    let cpus = match &args.cpu {
        Some(list) => environment::parse_cpu_list(list)?,
        None => Vec::new(),
    };
    set.open_event_files(&cpus)?;
    let (min_pages, max_pages) = match args.mmap_pages {
        Some(pages) => (pages, pages),
        None => (DEFAULT_MIN_MMAP_PAGES, DEFAULT_MAX_MMAP_PAGES),
    };
    set.mmap_event_files(min_pages, max_pages)?;

    let mut writer = RecordFileWriter::create(&args.output)?;
    let attrs = set.attrs_with_ids();
    writer.write_attr_section(&attrs)?;

    let stats = Rc::new(RefCell::new(RecordStats::default()));
    let sample_id = synthetic_sample_id(&attrs);
    let mut synthesized = Vec::new();
    if set.need_kernel_symbol() {
        synthesized.extend(kernel_records(&sample_id));
    }
    synthesized.extend(synthesize_existing_threads(args, &sample_id)?);
    for r in &synthesized {
        stats.borrow_mut().account(r);
        writer.write_record(r)?;
    }
    log::debug!("synthesized {} records for existing threads", synthesized.len());

    let writer = Rc::new(RefCell::new(writer));
    let sink: RecordSink = {
        let writer = Rc::clone(&writer);
        let stats = Rc::clone(&stats);
        Box::new(move |record| {
            stats.borrow_mut().account(&record);
            match writer.borrow_mut().write_record(&record) {
                Ok(()) => true,
                Err(e) => {
                    log::error!("failed to write record: {e}");
                    false
                }
            }
        })
    };

    let set = Rc::new(RefCell::new(set));
    let mut lp = IOEventLoop::new();
    EventSelectionSet::prepare_to_read_mmap_event_data(&set, &mut lp, sink)?;
    let interval = if args.cpu_hotplug_interval.is_zero() {
        DEFAULT_CPU_HOTPLUG_INTERVAL
    } else {
        args.cpu_hotplug_interval
    };
    EventSelectionSet::handle_cpu_hotplug_events(&set, &mut lp, &cpus, interval)?;
    lp.add_signal_events(&[Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP], |lp| {
        lp.exit_loop();
        true
    })?;
    if let Some(duration) = args.duration {
        lp.add_periodic_event(duration, |lp| {
            lp.exit_loop();
            true
        })?;
    }

    let started = chrono::Local::now();
    eprintln!(
        "Recording to {}... Press Ctrl+C to stop.",
        args.output.display()
    );
    set.borrow().enable_events()?;
    let loop_ok = lp.run_loop()?;
    set.borrow().disable_events()?;
    let drained = set.borrow_mut().finish_read_mmap_event_data()?;
    if !loop_ok || !drained {
        return Err(Error::Io(std::io::Error::other(format!(
            "recording into {} stopped early",
            args.output.display()
        ))));
    }
    let event_descs = set.borrow().event_descs();
    drop(lp);
    drop(set);

    let mut writer = Rc::try_unwrap(writer)
        .map_err(|_| Error::Io(std::io::Error::other("record file is still in use")))?
        .into_inner();
    let stats = stats.take();

    writer.write_build_id_feature(&build_id_records(&stats.mapped_files))?;
    writer.write_hostname_feature(&environment::hostname())?;
    writer.write_osrelease_feature(&environment::os_release())?;
    writer.write_arch_feature(environment::arch())?;
    writer.write_cmdline_feature(&std::env::args().collect::<Vec<_>>())?;
    writer.write_nrcpus_feature(NrCpus {
        available: environment::possible_cpus().map(|c| c.len()).unwrap_or(0) as u32,
        online: environment::online_cpus().map(|c| c.len()).unwrap_or(0) as u32,
    })?;
    writer.write_event_desc_feature(&event_descs)?;
    if args.branch {
        writer.write_branch_stack_feature()?;
    }
    let mut meta = BTreeMap::new();
    meta.insert("rsperf_version".to_string(), env!("CARGO_PKG_VERSION").to_string());
    meta.insert("timestamp".to_string(), started.to_rfc3339());
    meta.insert("system_wide_collection".to_string(), args.system_wide.to_string());
    meta.insert(
        "event_type_info".to_string(),
        event_descs
            .iter()
            .map(|d| d.name.as_str())
            .collect::<Vec<_>>()
            .join(","),
    );
    writer.write_meta_info_feature(&meta)?;
    writer.close()?;

    let elapsed = chrono::Local::now() - started;
    eprintln!(
        "Recorded {} samples ({} records) in {:.1}s to {}",
        stats.samples,
        stats.records,
        elapsed.num_milliseconds() as f64 / 1000.0,
        args.output.display()
    );
    if stats.lost > 0 {
        eprintln!(
            "Lost {} samples; try a larger -m or a lower -F",
            stats.lost
        );
    }
    Ok(())
}
