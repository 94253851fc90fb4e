use super::{Command, parse_args};
use crate::error::{Error, Result};
use crate::event::event_type::event_name_for;
use crate::perf::{PERF_CONTEXT_KERNEL, PERF_CONTEXT_MAX, PERF_CONTEXT_USER};
use crate::record::{Record, SampleRecord};
use crate::record_file::RecordFileReader;
use crate::sample_tree::{SampleEntry, SampleTree, SortKey, compare_by};
use crate::symbols::DsoCache;
use clap::Parser;
use comfy_table::{Cell, CellAlignment, Table, presets};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "report")]
#[command(about = "Summarize samples recorded in a perf.data file")]
struct ReportArgs {
    /// Recorded file to read
    #[arg(short = 'i', long, default_value = "perf.data")]
    input: PathBuf,

    /// Keys rows are grouped by: comm, pid, tid, dso
    #[arg(long, value_delimiter = ',', default_value = "comm,pid,tid,dso", value_parser = parse_sort_key)]
    sort: Vec<SortKey>,

    /// Print the call graph of each row
    #[arg(short = 'g', long = "children")]
    call_graph: bool,

    /// Show the sample count of each row
    #[arg(short = 'n', long = "sample-count")]
    sample_count: bool,

    /// Directory searched for the recorded binaries
    #[arg(long)]
    symfs: Option<PathBuf>,

    /// Kernel symbols in /proc/kallsyms format, used instead of the recorded ones
    #[arg(long)]
    kallsyms: Option<PathBuf>,

    /// Hide rows below this overhead percentage
    #[arg(long, default_value_t = 0.0)]
    percent_limit: f64,
}

fn parse_sort_key(s: &str) -> std::result::Result<SortKey, String> {
    SortKey::parse(s).ok_or_else(|| format!("unknown sort key '{s}'. Expected comm, pid, tid or dso"))
}

pub struct ReportCommand;

impl ReportCommand {
    pub fn create() -> Box<dyn Command> {
        Box::new(ReportCommand)
    }
}

impl Command for ReportCommand {
    fn name(&self) -> &'static str {
        "report"
    }

    fn short_help(&self) -> &'static str {
        "report sample overhead by thread and binary"
    }

    fn run(&mut self, args: &[String]) -> Result<()> {
        let Some(args) = parse_args::<ReportArgs>(self.name(), args)? else {
            return Ok(());
        };
        report(&args)
    }
}

/// Builds rows from records, resolving call chains to symbol names when asked.
struct ReportBuilder {
    tree: SampleTree,
    dso: DsoCache,
    call_graph: bool,
    fixed_kallsyms: bool,
}

impl ReportBuilder {
    fn new(args: &ReportArgs) -> Result<Self> {
        let mut dso = DsoCache::new(args.symfs.clone());
        if let Some(path) = &args.kallsyms {
            dso.set_kallsyms(&std::fs::read_to_string(path)?);
        }
        Ok(ReportBuilder {
            tree: SampleTree::new(compare_by(args.sort.clone())),
            dso,
            call_graph: args.call_graph,
            fixed_kallsyms: args.kallsyms.is_some(),
        })
    }

    fn process_record(&mut self, record: Record) {
        match record {
            Record::Sample(s) => self.add_sample(&s),
            Record::KernelSymbol(k) if !self.fixed_kallsyms => {
                self.dso.set_kallsyms(&String::from_utf8_lossy(&k.kallsyms));
            }
            other => self.tree.thread_tree_mut().update(&other),
        }
    }

    fn add_sample(&mut self, s: &SampleRecord) {
        let (pid, tid) = (s.pid as i32, s.tid as i32);
        let period = s.period.max(1);
        if self.call_graph && !s.callchain.is_empty() {
            let chain = self.symbolize_call_chain(pid, s);
            self.tree
                .add_call_chain_sample(pid, tid, s.ip, s.time, period, &chain);
        } else {
            self.tree.add_sample(pid, tid, s.ip, s.time, period);
        }
    }

    /// Symbol names of a sample's call chain, outermost caller first.
    fn symbolize_call_chain(&mut self, pid: i32, s: &SampleRecord) -> Vec<String> {
        let mut in_kernel = s.in_kernel();
        let mut names = Vec::with_capacity(s.callchain.len());
        for &ip in &s.callchain {
            if ip >= PERF_CONTEXT_MAX {
                match ip {
                    PERF_CONTEXT_KERNEL => in_kernel = true,
                    PERF_CONTEXT_USER => in_kernel = false,
                    _ => {}
                }
                continue;
            }
            let map = self.tree.thread_tree_mut().find_map_in(pid, ip, in_kernel);
            names.push(self.dso.symbol_name(&map, ip));
        }
        // Consecutive frames in one function collapse to one.
        names.dedup();
        names.reverse();
        names
    }
}

fn event_names(reader: &RecordFileReader) -> Result<Vec<String>> {
    let descs = reader.event_desc()?;
    if !descs.is_empty() {
        return Ok(descs.into_iter().map(|d| d.name).collect());
    }
    Ok(reader
        .attrs()
        .iter()
        .map(|a| event_name_for(a.attr.type_, a.attr.config))
        .collect())
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

fn key_header(key: SortKey) -> &'static str {
    match key {
        SortKey::Comm => "Command",
        SortKey::Pid => "Pid",
        SortKey::Tid => "Tid",
        SortKey::Dso => "Shared Object",
    }
}

fn key_value(key: SortKey, entry: &SampleEntry) -> String {
    match key {
        SortKey::Comm => entry.comm.to_string(),
        SortKey::Pid => entry.pid.to_string(),
        SortKey::Tid => entry.tid.to_string(),
        SortKey::Dso => entry.map.filename.clone(),
    }
}

fn format_call_graph(entry: &SampleEntry) -> String {
    let mut out = String::new();
    entry.callchain.visit(|depth, node| {
        let indent = "  ".repeat(depth + 1);
        out.push_str(&format!(
            "{indent}{:.2}% {}\n",
            percent(node.total_period(), entry.period),
            node.chain.join(" -> ")
        ));
    });
    out
}

fn build_table(args: &ReportArgs, tree: &mut SampleTree) -> (Table, Vec<String>) {
    let total = tree.total_period();
    let mut table = Table::new();
    table.load_preset(presets::NOTHING);
    let mut header = vec!["Overhead"];
    if args.sample_count {
        header.push("Samples");
    }
    header.extend(args.sort.iter().map(|&k| key_header(k)));
    table.set_header(header);

    let mut graphs = Vec::new();
    tree.visit_all_samples(|entry| {
        let overhead = percent(entry.period, total);
        if overhead < args.percent_limit {
            return;
        }
        let mut row = vec![Cell::new(format!("{overhead:.2}%")).set_alignment(CellAlignment::Right)];
        if args.sample_count {
            row.push(Cell::new(entry.sample_count).set_alignment(CellAlignment::Right));
        }
        row.extend(args.sort.iter().map(|&k| Cell::new(key_value(k, entry))));
        table.add_row(row);
        if args.call_graph && !entry.callchain.is_empty() {
            graphs.push(format!(
                "{:.2}% {}\n{}",
                overhead,
                args.sort
                    .iter()
                    .map(|&k| key_value(k, entry))
                    .collect::<Vec<_>>()
                    .join(" "),
                format_call_graph(entry)
            ));
        }
    });
    (table, graphs)
}

fn report(args: &ReportArgs) -> Result<()> {
    if !(0.0..=100.0).contains(&args.percent_limit) {
        return Err(Error::InvalidArgument(format!(
            "percent limit {} is outside 0..100",
            args.percent_limit
        )));
    }
    let mut reader = RecordFileReader::open(&args.input)?;
    let mut builder = ReportBuilder::new(args)?;
    reader.read_data(true, |record| {
        builder.process_record(record);
        true
    })?;

    let cmdline = reader.cmdline()?;
    if !cmdline.is_empty() {
        println!("Cmdline: {}", cmdline.join(" "));
    }
    if let Some(arch) = reader.arch()? {
        println!("Arch: {arch}");
    }
    println!("Event: {}", event_names(&reader)?.join(", "));
    println!("Samples: {}", builder.tree.total_samples());
    println!("Event count: {}", builder.tree.total_period());
    println!();

    if builder.tree.is_empty() {
        eprintln!("No samples in {}", args.input.display());
        return Ok(());
    }
    let (table, graphs) = build_table(args, &mut builder.tree);
    println!("{table}");
    for graph in graphs {
        println!();
        print!("{graph}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::{PERF_RECORD_MISC_KERNEL, PERF_RECORD_MISC_USER};
    use crate::record::{CommRecord, MmapRecord};

    fn args(argv: &[&str]) -> ReportArgs {
        ReportArgs::try_parse_from(std::iter::once("report").chain(argv.iter().copied())).unwrap()
    }

    fn sample(pid: u32, ip: u64, period: u64, callchain: Vec<u64>) -> Record {
        Record::Sample(SampleRecord {
            misc: PERF_RECORD_MISC_USER,
            pid,
            tid: pid,
            ip,
            period,
            callchain,
            ..Default::default()
        })
    }

    fn feed(builder: &mut ReportBuilder) {
        builder.process_record(Record::Comm(CommRecord {
            pid: 7,
            tid: 7,
            comm: "app".to_string(),
            ..Default::default()
        }));
        builder.process_record(Record::Mmap(MmapRecord {
            misc: PERF_RECORD_MISC_USER,
            pid: 7,
            tid: 7,
            addr: 0x1000,
            len: 0x1000,
            filename: "libapp.so".to_string(),
            ..Default::default()
        }));
        builder.process_record(Record::Mmap(MmapRecord {
            misc: PERF_RECORD_MISC_KERNEL,
            addr: 0xffff0000,
            len: 0x10000,
            filename: crate::perf::DEFAULT_KERNEL_MMAP_NAME.to_string(),
            ..Default::default()
        }));
        builder.process_record(Record::KernelSymbol(crate::record::KernelSymbolRecord {
            kallsyms: b"ffff0000 T entry\nffff0800 T handler\n".to_vec(),
        }));
    }

    #[test]
    fn test_sort_keys() {
        let a = args(&[]);
        assert_eq!(
            a.sort,
            vec![SortKey::Comm, SortKey::Pid, SortKey::Tid, SortKey::Dso]
        );
        assert_eq!(args(&["--sort", "dso"]).sort, vec![SortKey::Dso]);
        assert!(ReportArgs::try_parse_from(["report", "--sort", "symbol"]).is_err());
    }

    #[test]
    fn test_rows_group_by_sort_keys() {
        let mut builder = ReportBuilder::new(&args(&["--sort", "comm,dso"])).unwrap();
        feed(&mut builder);
        builder.process_record(sample(7, 0x1100, 10, Vec::new()));
        builder.process_record(sample(7, 0x1200, 30, Vec::new()));
        builder.process_record(sample(7, 0x9000, 5, Vec::new()));

        let mut rows = Vec::new();
        builder.tree.visit_all_samples(|e| {
            rows.push((e.comm.to_string(), e.map.filename.clone(), e.period, e.sample_count))
        });
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], ("app".to_string(), "libapp.so".to_string(), 40, 2));
        assert_eq!(rows[1].2, 5);
    }

    #[test]
    fn test_call_chain_is_symbolized_outermost_first() {
        let mut builder = ReportBuilder::new(&args(&["-g"])).unwrap();
        feed(&mut builder);
        let chain = vec![PERF_CONTEXT_KERNEL, 0xffff0810, 0xffff0010, PERF_CONTEXT_USER, 0x1100];
        let Record::Sample(s) = sample(7, 0xffff0810, 1, chain) else {
            unreachable!()
        };
        assert_eq!(
            builder.symbolize_call_chain(7, &s),
            vec!["unknown", "entry", "handler"]
        );
    }

    #[test]
    fn test_table_respects_percent_limit() {
        let a = args(&["-n", "--percent-limit", "20", "--sort", "pid"]);
        let mut builder = ReportBuilder::new(&a).unwrap();
        feed(&mut builder);
        builder.process_record(sample(7, 0x1100, 90, Vec::new()));
        builder.process_record(sample(8, 0x1100, 10, Vec::new()));
        let (table, graphs) = build_table(&a, &mut builder.tree);
        let text = table.to_string();
        assert!(text.contains("90.00%"));
        assert!(!text.contains("10.00%"));
        assert!(graphs.is_empty());
        assert_eq!(percent(1, 0), 0.0);
    }
}
