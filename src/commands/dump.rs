use super::{Command, parse_args};
use crate::error::Result;
use crate::event::event_type::{event_name_for, sample_type_string};
use crate::perf::PerfEventAttr;
use crate::record_file::{AttrWithIds, RecordFileReader, SectionDesc, feature_name};
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dump")]
#[command(about = "Print the raw contents of a perf.data file")]
struct DumpArgs {
    /// Recorded file to print
    #[arg(default_value = "perf.data")]
    input: PathBuf,

    /// Print records in timestamp order instead of file order
    #[arg(long)]
    sorted: bool,
}

pub struct DumpCommand;

impl DumpCommand {
    pub fn create() -> Box<dyn Command> {
        Box::new(DumpCommand)
    }
}

impl Command for DumpCommand {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn short_help(&self) -> &'static str {
        "print header, features and records of a perf.data file"
    }

    fn run(&mut self, args: &[String]) -> Result<()> {
        let Some(args) = parse_args::<DumpArgs>(self.name(), args)? else {
            return Ok(());
        };
        let mut reader = RecordFileReader::open(&args.input)?;
        let stdout = io::stdout();
        let mut out = stdout.lock();
        dump_header(&mut out, &reader)?;
        dump_attrs(&mut out, reader.attrs())?;
        dump_features(&mut out, &reader)?;
        dump_records(&mut out, &mut reader, args.sorted)
    }
}

fn section(desc: &SectionDesc) -> String {
    format!("offset {:#x}, size {:#x}", desc.offset, desc.size)
}

fn dump_header(out: &mut impl Write, reader: &RecordFileReader) -> Result<()> {
    let header = reader.header();
    writeln!(out, "magic: {}", String::from_utf8_lossy(&header.magic))?;
    writeln!(out, "header_size: {}", header.header_size)?;
    writeln!(out, "attr_size: {}", header.attr_size)?;
    writeln!(out, "attrs: {}", section(&header.attrs))?;
    writeln!(out, "data: {}", section(&header.data))?;
    writeln!(out, "event_types: {}", section(&header.event_types))?;
    for id in header.feature_ids() {
        writeln!(out, "feature: {}", feature_name(id))?;
    }
    Ok(())
}

fn write_attr(out: &mut impl Write, attr: &PerfEventAttr) -> Result<()> {
    writeln!(
        out,
        "  type {}, config {}, name {}",
        attr.type_,
        attr.config,
        event_name_for(attr.type_, attr.config)
    )?;
    let sampling = if attr.freq() { "sample_freq" } else { "sample_period" };
    writeln!(out, "  {sampling} {}", attr.sample_period_or_freq)?;
    writeln!(
        out,
        "  sample_type {:#x} ({})",
        attr.sample_type,
        sample_type_string(attr.sample_type)
    )?;
    writeln!(out, "  read_format {:#x}", attr.read_format)?;
    writeln!(
        out,
        "  disabled {}, inherit {}, enable_on_exec {}, sample_id_all {}",
        u8::from(attr.disabled()),
        u8::from(attr.inherit()),
        u8::from(attr.enable_on_exec()),
        u8::from(attr.sample_id_all())
    )?;
    writeln!(
        out,
        "  exclude_user {}, exclude_kernel {}, exclude_hv {}, precise_ip {}",
        u8::from(attr.exclude_user()),
        u8::from(attr.exclude_kernel()),
        u8::from(attr.exclude_hv()),
        attr.precise_ip()
    )?;
    if attr.branch_sample_type != 0 {
        writeln!(out, "  branch_sample_type {:#x}", attr.branch_sample_type)?;
    }
    if attr.sample_stack_user != 0 {
        writeln!(
            out,
            "  sample_regs_user {:#x}, sample_stack_user {}",
            attr.sample_regs_user, attr.sample_stack_user
        )?;
    }
    Ok(())
}

fn dump_attrs(out: &mut impl Write, attrs: &[AttrWithIds]) -> Result<()> {
    for (i, a) in attrs.iter().enumerate() {
        writeln!(out, "attr {}:", i + 1)?;
        write_attr(out, &a.attr)?;
        let ids: Vec<String> = a.ids.iter().map(u64::to_string).collect();
        writeln!(out, "  ids: {}", ids.join(", "))?;
    }
    Ok(())
}

fn dump_features(out: &mut impl Write, reader: &RecordFileReader) -> Result<()> {
    let cmdline = reader.cmdline()?;
    if !cmdline.is_empty() {
        writeln!(out, "cmdline: {}", cmdline.join(" "))?;
    }
    for (label, value) in [
        ("hostname", reader.hostname()?),
        ("osrelease", reader.os_release()?),
        ("arch", reader.arch()?),
    ] {
        if let Some(value) = value {
            writeln!(out, "{label}: {value}")?;
        }
    }
    if let Some(n) = reader.nrcpus()? {
        writeln!(out, "nrcpus: online {}, available {}", n.online, n.available)?;
    }
    for b in reader.build_ids()? {
        writeln!(out, "build_id: pid {}, {} {}", b.pid as i32, b.build_id, b.filename)?;
    }
    for (key, value) in reader.meta_info()? {
        writeln!(out, "meta_info: {key} = {value}")?;
    }
    for desc in reader.event_desc()? {
        let ids: Vec<String> = desc.ids.iter().map(u64::to_string).collect();
        writeln!(out, "event_desc: {} ids [{}]", desc.name, ids.join(", "))?;
    }
    for file in reader.file_features()? {
        writeln!(
            out,
            "file: {} ({:?}, min_vaddr {:#x}, {} symbols)",
            file.path,
            file.dso_type,
            file.min_vaddr,
            file.symbols.len()
        )?;
        for sym in &file.symbols {
            writeln!(out, "  {:#x} {:#x} {}", sym.vaddr, sym.len, sym.name)?;
        }
    }
    Ok(())
}

fn dump_records(out: &mut impl Write, reader: &mut RecordFileReader, sorted: bool) -> Result<()> {
    let mut write_result = Ok(());
    reader.read_data(sorted, |record| {
        write_result = writeln!(out, "{record}");
        write_result.is_ok()
    })?;
    write_result.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::{PERF_SAMPLE_IP, PERF_SAMPLE_TID, PERF_TYPE_SOFTWARE};

    #[test]
    fn test_dump_attrs() {
        let mut attr = PerfEventAttr::new();
        attr.type_ = PERF_TYPE_SOFTWARE;
        attr.sample_type = PERF_SAMPLE_IP | PERF_SAMPLE_TID;
        attr.set_sample_freq(4000);
        let mut out = Vec::new();
        dump_attrs(
            &mut out,
            &[AttrWithIds {
                attr,
                ids: vec![3, 4],
            }],
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("attr 1:\n"));
        assert!(text.contains("sample_freq 4000"));
        assert!(text.contains("ids: 3, 4"));
    }

    #[test]
    fn test_dump_args() {
        let a = DumpArgs::try_parse_from(["dump"]).unwrap();
        assert_eq!(a.input, PathBuf::from("perf.data"));
        assert!(!a.sorted);
        let a = DumpArgs::try_parse_from(["dump", "--sorted", "x.data"]).unwrap();
        assert_eq!(a.input, PathBuf::from("x.data"));
        assert!(a.sorted);
    }
}
