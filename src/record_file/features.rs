//! Payload encodings of the feature sections.

use crate::error::{Error, Result};
use crate::perf::PerfEventAttr;
use crate::record::cursor::{ByteReader, ByteWriter, align};
use crate::record::{BuildIdRecord, Record, peek_header};
use std::collections::BTreeMap;

fn write_perf_string(w: &mut ByteWriter, s: &str) {
    let len = align(s.len() + 1, 64);
    w.write_u32(len as u32);
    w.write_fixed(s.as_bytes(), len);
}

fn read_perf_string(r: &mut ByteReader) -> Result<String> {
    let len = r.read_u32()? as usize;
    let bytes = r.read_bytes(len)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// String features (hostname, osrelease, arch, ...): u32 length followed by
/// the NUL-padded string, length aligned to 64.
pub fn encode_string(s: &str) -> Vec<u8> {
    let mut w = ByteWriter::new();
    write_perf_string(&mut w, s);
    w.into_inner()
}

pub fn decode_string(data: &[u8]) -> Result<String> {
    read_perf_string(&mut ByteReader::new(data))
}

pub fn encode_cmdline(args: &[String]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_u32(args.len() as u32);
    for arg in args {
        write_perf_string(&mut w, arg);
    }
    w.into_inner()
}

pub fn decode_cmdline(data: &[u8]) -> Result<Vec<String>> {
    let mut r = ByteReader::new(data);
    let argc = r.read_u32()?;
    let mut args = Vec::new();
    for _ in 0..argc {
        args.push(read_perf_string(&mut r)?);
    }
    Ok(args)
}

pub fn encode_build_ids(records: &[BuildIdRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(&Record::BuildId(record.clone()).encode());
    }
    out
}

pub fn decode_build_ids(data: &[u8]) -> Result<Vec<BuildIdRecord>> {
    let attr = PerfEventAttr::new();
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let header = peek_header(&data[pos..])?;
        let size = usize::from(header.size);
        let chunk = data
            .get(pos..pos + size)
            .filter(|_| size > 0)
            .ok_or_else(|| Error::corrupt(format!("build id record at {pos} exceeds feature")))?;
        match Record::decode(&attr, chunk)? {
            Record::BuildId(r) => records.push(r),
            other => {
                return Err(Error::corrupt(format!(
                    "unexpected {} record in build id feature",
                    other.type_name()
                )));
            }
        }
        pos += size;
    }
    Ok(records)
}

/// Meta info: a sequence of `key\0value\0` pairs.
pub fn encode_meta_info(info: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in info {
        out.extend_from_slice(key.as_bytes());
        out.push(0);
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}

pub fn decode_meta_info(data: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut parts = data.split(|&b| b == 0);
    let mut info = BTreeMap::new();
    let mut consumed = 0;
    while consumed < data.len() {
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            return Err(Error::corrupt("meta info ends inside a key/value pair"));
        };
        consumed += key.len() + value.len() + 2;
        if consumed > data.len() {
            return Err(Error::corrupt("meta info value is not terminated"));
        }
        info.insert(
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }
    Ok(info)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NrCpus {
    pub available: u32,
    pub online: u32,
}

pub fn encode_nrcpus(n: NrCpus) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(8);
    w.write_u32(n.available);
    w.write_u32(n.online);
    w.into_inner()
}

pub fn decode_nrcpus(data: &[u8]) -> Result<NrCpus> {
    let mut r = ByteReader::new(data);
    Ok(NrCpus {
        available: r.read_u32()?,
        online: r.read_u32()?,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventDesc {
    pub attr: PerfEventAttr,
    pub name: String,
    pub ids: Vec<u64>,
}

pub fn encode_event_desc(events: &[EventDesc]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_u32(events.len() as u32);
    w.write_u32(crate::perf::PERF_ATTR_SIZE as u32);
    for event in events {
        event.attr.write_to(&mut w);
        w.write_u32(event.ids.len() as u32);
        write_perf_string(&mut w, &event.name);
        w.write_u64_slice(&event.ids);
    }
    w.into_inner()
}

pub fn decode_event_desc(data: &[u8]) -> Result<Vec<EventDesc>> {
    let mut r = ByteReader::new(data);
    let nr = r.read_u32()?;
    let attr_size = r.read_u32()? as usize;
    let mut events = Vec::new();
    for _ in 0..nr {
        let attr = PerfEventAttr::from_bytes(r.read_bytes(attr_size)?)?;
        let nr_ids = r.read_u32()?;
        let name = read_perf_string(&mut r)?;
        let ids = r.read_u64_vec(u64::from(nr_ids))?;
        events.push(EventDesc { attr, name, ids });
    }
    Ok(events)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum DsoType {
    Kernel = 0,
    KernelModule = 1,
    #[default]
    ElfFile = 2,
    DexFile = 3,
    SymbolMapFile = 4,
    UnknownFile = 5,
}

impl DsoType {
    pub fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => DsoType::Kernel,
            1 => DsoType::KernelModule,
            2 => DsoType::ElfFile,
            3 => DsoType::DexFile,
            4 => DsoType::SymbolMapFile,
            5 => DsoType::UnknownFile,
            _ => return Err(Error::corrupt(format!("unknown dso type {v}"))),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSymbol {
    pub vaddr: u64,
    pub len: u32,
    pub name: String,
}

/// Per-binary symbol information stored in the FILE feature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFeature {
    pub path: String,
    pub dso_type: DsoType,
    pub min_vaddr: u64,
    pub symbols: Vec<FileSymbol>,
    pub dex_file_offsets: Vec<u64>,
    pub file_offset_of_min_vaddr: u64,
    pub memory_offset_of_min_vaddr: u64,
}

pub fn encode_file_feature(file: &FileFeature) -> Vec<u8> {
    let mut body = ByteWriter::new();
    body.write_padded_string(&file.path, 1);
    body.write_u32(file.dso_type as u32);
    body.write_u64(file.min_vaddr);
    body.write_u32(file.symbols.len() as u32);
    for sym in &file.symbols {
        body.write_u64(sym.vaddr);
        body.write_u32(sym.len);
        body.write_padded_string(&sym.name, 1);
    }
    match file.dso_type {
        DsoType::DexFile => {
            body.write_u32(file.dex_file_offsets.len() as u32);
            body.write_u64_slice(&file.dex_file_offsets);
        }
        DsoType::ElfFile => body.write_u64(file.file_offset_of_min_vaddr),
        DsoType::KernelModule => body.write_u64(file.memory_offset_of_min_vaddr),
        _ => {}
    }
    let body = body.into_inner();
    let mut w = ByteWriter::with_capacity(body.len() + 4);
    w.write_u32(body.len() as u32);
    w.write_bytes(&body);
    w.into_inner()
}

/// Decode every file entry of a FILE feature section.
pub fn decode_file_features(data: &[u8]) -> Result<Vec<FileFeature>> {
    let mut outer = ByteReader::new(data);
    let mut files = Vec::new();
    while !outer.is_empty() {
        let size = outer.read_u32()? as usize;
        let mut r = ByteReader::new(outer.read_bytes(size)?);
        let mut file = FileFeature {
            path: r.read_padded_string(1)?,
            dso_type: DsoType::from_u32(r.read_u32()?)?,
            min_vaddr: r.read_u64()?,
            ..Default::default()
        };
        let symbol_count = r.read_u32()?;
        for _ in 0..symbol_count {
            file.symbols.push(FileSymbol {
                vaddr: r.read_u64()?,
                len: r.read_u32()?,
                name: r.read_padded_string(1)?,
            });
        }
        match file.dso_type {
            DsoType::DexFile => {
                let count = r.read_u32()?;
                file.dex_file_offsets = r.read_u64_vec(u64::from(count))?;
            }
            DsoType::ElfFile => file.file_offset_of_min_vaddr = r.read_u64()?,
            DsoType::KernelModule => file.memory_offset_of_min_vaddr = r.read_u64()?,
            _ => {}
        }
        if !r.is_empty() {
            return Err(Error::corrupt(format!(
                "{} trailing bytes in file feature for {}",
                r.remaining(),
                file.path
            )));
        }
        files.push(file);
    }
    Ok(files)
}
