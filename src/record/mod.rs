//! Records of the sample stream, decoded from and encoded to the kernel's
//! binary layout.
//!
//! Decoding needs the attr of the event that produced a record: it decides
//! which optional fields a sample carries and whether other records end with
//! a sample-id suffix. Every read goes through a bounds-checked cursor, so a
//! truncated or size-lying record is reported as `Error::Corrupt`.

pub mod cache;
pub mod cursor;

use crate::build_id::{BUILD_ID_SIZE, BuildId};
use crate::error::{Error, Result};
use crate::perf::*;
use cursor::{ByteReader, ByteWriter, align};
use std::fmt;

pub use cache::RecordCache;

/// Largest payload that fits in one record; bigger records are written as
/// split pieces.
pub const MAX_RECORD_SIZE: usize = u16::MAX as usize;

const HEADER_SIZE: usize = PerfEventHeader::SIZE;

/// Fields appended to non-sample records when the attr has sample_id_all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleId {
    pub sample_id_all: bool,
    pub sample_type: u64,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub id: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub cpu_res: u32,
    pub identifier: u64,
}

impl SampleId {
    pub fn new(attr: &PerfEventAttr) -> Self {
        SampleId {
            sample_id_all: attr.sample_id_all(),
            sample_type: attr.sample_type,
            ..Default::default()
        }
    }

    fn has(&self, bit: u64) -> bool {
        self.sample_id_all && self.sample_type & bit != 0
    }

    fn read(attr: &PerfEventAttr, r: &mut ByteReader) -> Result<Self> {
        let mut s = SampleId::new(attr);
        if s.has(PERF_SAMPLE_TID) {
            s.pid = r.read_u32()?;
            s.tid = r.read_u32()?;
        }
        if s.has(PERF_SAMPLE_TIME) {
            s.time = r.read_u64()?;
        }
        if s.has(PERF_SAMPLE_ID) {
            s.id = r.read_u64()?;
        }
        if s.has(PERF_SAMPLE_STREAM_ID) {
            s.stream_id = r.read_u64()?;
        }
        if s.has(PERF_SAMPLE_CPU) {
            s.cpu = r.read_u32()?;
            s.cpu_res = r.read_u32()?;
        }
        if s.has(PERF_SAMPLE_IDENTIFIER) {
            s.identifier = r.read_u64()?;
        }
        Ok(s)
    }

    fn write(&self, w: &mut ByteWriter) {
        if self.has(PERF_SAMPLE_TID) {
            w.write_u32(self.pid);
            w.write_u32(self.tid);
        }
        if self.has(PERF_SAMPLE_TIME) {
            w.write_u64(self.time);
        }
        if self.has(PERF_SAMPLE_ID) {
            w.write_u64(self.id);
        }
        if self.has(PERF_SAMPLE_STREAM_ID) {
            w.write_u64(self.stream_id);
        }
        if self.has(PERF_SAMPLE_CPU) {
            w.write_u32(self.cpu);
            w.write_u32(self.cpu_res);
        }
        if self.has(PERF_SAMPLE_IDENTIFIER) {
            w.write_u64(self.identifier);
        }
    }

    /// Event id carried by the suffix, preferring IDENTIFIER over ID.
    pub fn event_id(&self) -> Option<u64> {
        if self.has(PERF_SAMPLE_IDENTIFIER) {
            Some(self.identifier)
        } else if self.has(PERF_SAMPLE_ID) {
            Some(self.id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MmapRecord {
    pub misc: u16,
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub filename: String,
    pub sample_id: SampleId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mmap2Record {
    pub misc: u16,
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub maj: u32,
    pub min: u32,
    pub ino: u64,
    pub ino_generation: u64,
    pub prot: u32,
    pub flags: u32,
    pub filename: String,
    pub sample_id: SampleId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommRecord {
    pub misc: u16,
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
    pub sample_id: SampleId,
}

/// Payload shared by fork and exit records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkExitRecord {
    pub misc: u16,
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
    pub sample_id: SampleId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LostRecord {
    pub misc: u16,
    pub id: u64,
    pub lost: u64,
    pub sample_id: SampleId,
}

/// Payload shared by throttle and unthrottle records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleRecord {
    pub misc: u16,
    pub time: u64,
    pub id: u64,
    pub stream_id: u64,
    pub sample_id: SampleId,
}

/// Counter values laid out according to an attr's read_format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadValues {
    pub time_enabled: u64,
    pub time_running: u64,
    /// (value, id) per counter; a single entry unless PERF_FORMAT_GROUP.
    pub values: Vec<(u64, u64)>,
}

impl ReadValues {
    /// Parse the buffer returned by read(2) on an event fd.
    pub fn from_bytes(read_format: u64, data: &[u8]) -> Result<Self> {
        Self::read(read_format, &mut ByteReader::new(data))
    }

    fn read(read_format: u64, r: &mut ByteReader) -> Result<Self> {
        let mut v = ReadValues::default();
        if read_format & PERF_FORMAT_GROUP != 0 {
            let nr = r.read_u64()?;
            if read_format & PERF_FORMAT_TOTAL_TIME_ENABLED != 0 {
                v.time_enabled = r.read_u64()?;
            }
            if read_format & PERF_FORMAT_TOTAL_TIME_RUNNING != 0 {
                v.time_running = r.read_u64()?;
            }
            for _ in 0..nr {
                let value = r.read_u64()?;
                let id = if read_format & PERF_FORMAT_ID != 0 {
                    r.read_u64()?
                } else {
                    0
                };
                v.values.push((value, id));
            }
        } else {
            let value = r.read_u64()?;
            if read_format & PERF_FORMAT_TOTAL_TIME_ENABLED != 0 {
                v.time_enabled = r.read_u64()?;
            }
            if read_format & PERF_FORMAT_TOTAL_TIME_RUNNING != 0 {
                v.time_running = r.read_u64()?;
            }
            let id = if read_format & PERF_FORMAT_ID != 0 {
                r.read_u64()?
            } else {
                0
            };
            v.values.push((value, id));
        }
        Ok(v)
    }

    fn write(&self, read_format: u64, w: &mut ByteWriter) {
        let with_id = read_format & PERF_FORMAT_ID != 0;
        if read_format & PERF_FORMAT_GROUP != 0 {
            w.write_u64(self.values.len() as u64);
            if read_format & PERF_FORMAT_TOTAL_TIME_ENABLED != 0 {
                w.write_u64(self.time_enabled);
            }
            if read_format & PERF_FORMAT_TOTAL_TIME_RUNNING != 0 {
                w.write_u64(self.time_running);
            }
            for &(value, id) in &self.values {
                w.write_u64(value);
                if with_id {
                    w.write_u64(id);
                }
            }
        } else {
            let (value, id) = self.values.first().copied().unwrap_or_default();
            w.write_u64(value);
            if read_format & PERF_FORMAT_TOTAL_TIME_ENABLED != 0 {
                w.write_u64(self.time_enabled);
            }
            if read_format & PERF_FORMAT_TOTAL_TIME_RUNNING != 0 {
                w.write_u64(self.time_running);
            }
            if with_id {
                w.write_u64(id);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadRecord {
    pub misc: u16,
    pub pid: u32,
    pub tid: u32,
    pub read_format: u64,
    pub values: ReadValues,
    pub sample_id: SampleId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchStackItem {
    pub from: u64,
    pub to: u64,
    pub flags: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegsUser {
    pub abi: u64,
    pub reg_mask: u64,
    pub regs: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackUser {
    pub data: Vec<u8>,
    pub dyn_size: u64,
}

/// A sample; only the fields selected by `sample_type` are meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleRecord {
    pub misc: u16,
    pub sample_type: u64,
    pub read_format: u64,
    pub identifier: u64,
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub addr: u64,
    pub id: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub cpu_res: u32,
    pub period: u64,
    pub read: ReadValues,
    pub callchain: Vec<u64>,
    pub raw: Vec<u8>,
    pub branch_stack: Vec<BranchStackItem>,
    pub regs_user: RegsUser,
    pub stack_user: StackUser,
}

impl SampleRecord {
    pub fn new(attr: &PerfEventAttr) -> Self {
        SampleRecord {
            sample_type: attr.sample_type,
            read_format: attr.read_format,
            regs_user: RegsUser {
                reg_mask: attr.sample_regs_user,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn has(&self, bit: u64) -> bool {
        self.sample_type & bit != 0
    }

    fn read(attr: &PerfEventAttr, misc: u16, r: &mut ByteReader) -> Result<Self> {
        let mut s = SampleRecord::new(attr);
        s.misc = misc;
        if s.has(PERF_SAMPLE_IDENTIFIER) {
            s.identifier = r.read_u64()?;
        }
        if s.has(PERF_SAMPLE_IP) {
            s.ip = r.read_u64()?;
        }
        if s.has(PERF_SAMPLE_TID) {
            s.pid = r.read_u32()?;
            s.tid = r.read_u32()?;
        }
        if s.has(PERF_SAMPLE_TIME) {
            s.time = r.read_u64()?;
        }
        if s.has(PERF_SAMPLE_ADDR) {
            s.addr = r.read_u64()?;
        }
        if s.has(PERF_SAMPLE_ID) {
            s.id = r.read_u64()?;
        }
        if s.has(PERF_SAMPLE_STREAM_ID) {
            s.stream_id = r.read_u64()?;
        }
        if s.has(PERF_SAMPLE_CPU) {
            s.cpu = r.read_u32()?;
            s.cpu_res = r.read_u32()?;
        }
        if s.has(PERF_SAMPLE_PERIOD) {
            s.period = r.read_u64()?;
        }
        if s.has(PERF_SAMPLE_READ) {
            s.read = ReadValues::read(s.read_format, r)?;
        }
        if s.has(PERF_SAMPLE_CALLCHAIN) {
            let nr = r.read_u64()?;
            s.callchain = r.read_u64_vec(nr)?;
        }
        if s.has(PERF_SAMPLE_RAW) {
            let size = r.read_u32()?;
            s.raw = r.read_bytes(size as usize)?.to_vec();
        }
        if s.has(PERF_SAMPLE_BRANCH_STACK) {
            let nr = r.read_u64()?;
            let words = r.read_u64_vec(nr.checked_mul(3).ok_or_else(|| {
                Error::corrupt(format!("branch stack of {nr} entries is too large"))
            })?)?;
            s.branch_stack = words
                .chunks_exact(3)
                .map(|c| BranchStackItem {
                    from: c[0],
                    to: c[1],
                    flags: c[2],
                })
                .collect();
        }
        if s.has(PERF_SAMPLE_REGS_USER) {
            s.regs_user.abi = r.read_u64()?;
            if s.regs_user.abi != 0 {
                let count = u64::from(s.regs_user.reg_mask.count_ones());
                s.regs_user.regs = r.read_u64_vec(count)?;
            }
        }
        if s.has(PERF_SAMPLE_STACK_USER) {
            let size = r.read_u64()?;
            if size != 0 {
                let len = usize::try_from(size)
                    .map_err(|_| Error::corrupt(format!("user stack of {size} bytes")))?;
                s.stack_user.data = r.read_bytes(len)?.to_vec();
                s.stack_user.dyn_size = r.read_u64()?;
            }
        }
        Ok(s)
    }

    fn write(&self, w: &mut ByteWriter) {
        if self.has(PERF_SAMPLE_IDENTIFIER) {
            w.write_u64(self.identifier);
        }
        if self.has(PERF_SAMPLE_IP) {
            w.write_u64(self.ip);
        }
        if self.has(PERF_SAMPLE_TID) {
            w.write_u32(self.pid);
            w.write_u32(self.tid);
        }
        if self.has(PERF_SAMPLE_TIME) {
            w.write_u64(self.time);
        }
        if self.has(PERF_SAMPLE_ADDR) {
            w.write_u64(self.addr);
        }
        if self.has(PERF_SAMPLE_ID) {
            w.write_u64(self.id);
        }
        if self.has(PERF_SAMPLE_STREAM_ID) {
            w.write_u64(self.stream_id);
        }
        if self.has(PERF_SAMPLE_CPU) {
            w.write_u32(self.cpu);
            w.write_u32(self.cpu_res);
        }
        if self.has(PERF_SAMPLE_PERIOD) {
            w.write_u64(self.period);
        }
        if self.has(PERF_SAMPLE_READ) {
            self.read.write(self.read_format, w);
        }
        if self.has(PERF_SAMPLE_CALLCHAIN) {
            w.write_u64(self.callchain.len() as u64);
            w.write_u64_slice(&self.callchain);
        }
        if self.has(PERF_SAMPLE_RAW) {
            w.write_u32(self.raw.len() as u32);
            w.write_bytes(&self.raw);
        }
        if self.has(PERF_SAMPLE_BRANCH_STACK) {
            w.write_u64(self.branch_stack.len() as u64);
            for item in &self.branch_stack {
                w.write_u64(item.from);
                w.write_u64(item.to);
                w.write_u64(item.flags);
            }
        }
        if self.has(PERF_SAMPLE_REGS_USER) {
            w.write_u64(self.regs_user.abi);
            if self.regs_user.abi != 0 {
                w.write_u64_slice(&self.regs_user.regs);
            }
        }
        if self.has(PERF_SAMPLE_STACK_USER) {
            w.write_u64(self.stack_user.data.len() as u64);
            if !self.stack_user.data.is_empty() {
                w.write_bytes(&self.stack_user.data);
                w.write_u64(self.stack_user.dyn_size);
            }
        }
    }

    pub fn in_kernel(&self) -> bool {
        self.misc & PERF_RECORD_MISC_CPUMODE_MASK == PERF_RECORD_MISC_KERNEL
    }

    /// Drop captured user stack beyond `len` bytes (rounded down to 8).
    /// Used after unwinding to avoid storing stack data nobody will read.
    pub fn trim_user_stack(&mut self, len: usize) {
        let len = len & !7;
        if len < self.stack_user.data.len() {
            self.stack_user.data.truncate(len);
        }
        self.stack_user.dyn_size = self.stack_user.dyn_size.min(self.stack_user.data.len() as u64);
    }

    /// Replace captured registers and stack with an unwound user call chain.
    pub fn replace_regs_and_stack_with_callchain(&mut self, user_ips: &[u64]) {
        if !self.has(PERF_SAMPLE_CALLCHAIN) {
            self.sample_type |= PERF_SAMPLE_CALLCHAIN;
            self.callchain.clear();
        }
        if !user_ips.is_empty() {
            if self.callchain.last() != Some(&PERF_CONTEXT_USER) {
                self.callchain.push(PERF_CONTEXT_USER);
            }
            self.callchain.extend_from_slice(user_ips);
        }
        self.sample_type &= !(PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER);
        self.regs_user = RegsUser {
            reg_mask: self.regs_user.reg_mask,
            ..Default::default()
        };
        self.stack_user = StackUser::default();
    }

    /// Event id of this sample, preferring IDENTIFIER over ID.
    pub fn event_id(&self) -> Option<u64> {
        if self.has(PERF_SAMPLE_IDENTIFIER) {
            Some(self.identifier)
        } else if self.has(PERF_SAMPLE_ID) {
            Some(self.id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildIdRecord {
    pub misc: u16,
    pub pid: u32,
    pub build_id: BuildId,
    pub filename: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelSymbolRecord {
    pub kallsyms: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DsoRecord {
    pub dso_type: u64,
    pub dso_id: u64,
    pub dso_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolRecord {
    pub addr: u64,
    pub len: u64,
    pub dso_id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TracingDataRecord {
    pub data: Vec<u8>,
}

/// Announces event ids of descriptors opened after recording started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventIdRecord {
    /// (index into the attr section, kernel event id)
    pub ids: Vec<(u64, u64)>,
}

/// One piece of a record too large for a single header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitRecord {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnknownRecord {
    pub type_: u32,
    pub misc: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Mmap(MmapRecord),
    Mmap2(Mmap2Record),
    Comm(CommRecord),
    Exit(ForkExitRecord),
    Fork(ForkExitRecord),
    Lost(LostRecord),
    Throttle(ThrottleRecord),
    Unthrottle(ThrottleRecord),
    Read(ReadRecord),
    Sample(SampleRecord),
    TracingData(TracingDataRecord),
    BuildId(BuildIdRecord),
    KernelSymbol(KernelSymbolRecord),
    Dso(DsoRecord),
    Symbol(SymbolRecord),
    Split(SplitRecord),
    SplitEnd,
    EventId(EventIdRecord),
    Unknown(UnknownRecord),
}

fn parse_header(data: &[u8]) -> Result<PerfEventHeader> {
    let mut r = ByteReader::new(data);
    let header = PerfEventHeader {
        type_: r.read_u32()?,
        misc: r.read_u16()?,
        size: r.read_u16()?,
    };
    Ok(header)
}

/// Read the header at the start of `data` without decoding the payload.
pub fn peek_header(data: &[u8]) -> Result<PerfEventHeader> {
    parse_header(data)
}

impl Record {
    /// Decode one record whose header size must match `data.len()`.
    pub fn decode(attr: &PerfEventAttr, data: &[u8]) -> Result<Record> {
        let header = parse_header(data)?;
        if usize::from(header.size) != data.len() {
            return Err(Error::corrupt(format!(
                "record type {} declares {} bytes but {} are available",
                header.type_,
                header.size,
                data.len()
            )));
        }
        Self::decode_body(attr, header, data)
    }

    /// Decode a record reassembled from split pieces; its length is the
    /// length of `data` rather than the header's 16-bit size field.
    pub fn decode_reassembled(attr: &PerfEventAttr, data: &[u8]) -> Result<Record> {
        let header = parse_header(data)?;
        Self::decode_body(attr, header, data)
    }

    fn decode_body(attr: &PerfEventAttr, header: PerfEventHeader, data: &[u8]) -> Result<Record> {
        let mut r = ByteReader::new(&data[HEADER_SIZE..]);
        let misc = header.misc;
        let record = match header.type_ {
            PERF_RECORD_MMAP => Record::Mmap(MmapRecord {
                misc,
                pid: r.read_u32()?,
                tid: r.read_u32()?,
                addr: r.read_u64()?,
                len: r.read_u64()?,
                pgoff: r.read_u64()?,
                filename: r.read_padded_string(8)?,
                sample_id: SampleId::read(attr, &mut r)?,
            }),
            PERF_RECORD_MMAP2 => Record::Mmap2(Mmap2Record {
                misc,
                pid: r.read_u32()?,
                tid: r.read_u32()?,
                addr: r.read_u64()?,
                len: r.read_u64()?,
                pgoff: r.read_u64()?,
                maj: r.read_u32()?,
                min: r.read_u32()?,
                ino: r.read_u64()?,
                ino_generation: r.read_u64()?,
                prot: r.read_u32()?,
                flags: r.read_u32()?,
                filename: r.read_padded_string(8)?,
                sample_id: SampleId::read(attr, &mut r)?,
            }),
            PERF_RECORD_COMM => Record::Comm(CommRecord {
                misc,
                pid: r.read_u32()?,
                tid: r.read_u32()?,
                comm: r.read_padded_string(8)?,
                sample_id: SampleId::read(attr, &mut r)?,
            }),
            PERF_RECORD_FORK | PERF_RECORD_EXIT => {
                let rec = ForkExitRecord {
                    misc,
                    pid: r.read_u32()?,
                    ppid: r.read_u32()?,
                    tid: r.read_u32()?,
                    ptid: r.read_u32()?,
                    time: r.read_u64()?,
                    sample_id: SampleId::read(attr, &mut r)?,
                };
                if header.type_ == PERF_RECORD_FORK {
                    Record::Fork(rec)
                } else {
                    Record::Exit(rec)
                }
            }
            PERF_RECORD_LOST => Record::Lost(LostRecord {
                misc,
                id: r.read_u64()?,
                lost: r.read_u64()?,
                sample_id: SampleId::read(attr, &mut r)?,
            }),
            PERF_RECORD_THROTTLE | PERF_RECORD_UNTHROTTLE => {
                let rec = ThrottleRecord {
                    misc,
                    time: r.read_u64()?,
                    id: r.read_u64()?,
                    stream_id: r.read_u64()?,
                    sample_id: SampleId::read(attr, &mut r)?,
                };
                if header.type_ == PERF_RECORD_THROTTLE {
                    Record::Throttle(rec)
                } else {
                    Record::Unthrottle(rec)
                }
            }
            PERF_RECORD_READ => Record::Read(ReadRecord {
                misc,
                pid: r.read_u32()?,
                tid: r.read_u32()?,
                read_format: attr.read_format,
                values: ReadValues::read(attr.read_format, &mut r)?,
                sample_id: SampleId::read(attr, &mut r)?,
            }),
            PERF_RECORD_SAMPLE => Record::Sample(SampleRecord::read(attr, misc, &mut r)?),
            PERF_RECORD_TRACING_DATA => {
                let size = r.read_u32()? as usize;
                let data = r.read_bytes(size)?.to_vec();
                r.skip(align(size, 64) - size)?;
                Record::TracingData(TracingDataRecord { data })
            }
            PERF_RECORD_BUILD_ID => {
                let pid = r.read_u32()?;
                let build_id = BuildId::from_bytes(r.read_bytes(align(BUILD_ID_SIZE, 8))?);
                let filename = r.read_padded_string(64)?;
                Record::BuildId(BuildIdRecord {
                    misc,
                    pid,
                    build_id,
                    filename,
                })
            }
            RSPERF_RECORD_KERNEL_SYMBOL => {
                let size = r.read_u32()? as usize;
                let kallsyms = r.read_bytes(size)?.to_vec();
                r.skip(align(size, 8) - size)?;
                Record::KernelSymbol(KernelSymbolRecord { kallsyms })
            }
            RSPERF_RECORD_DSO => Record::Dso(DsoRecord {
                dso_type: r.read_u64()?,
                dso_id: r.read_u64()?,
                dso_name: r.read_padded_string(8)?,
            }),
            RSPERF_RECORD_SYMBOL => Record::Symbol(SymbolRecord {
                addr: r.read_u64()?,
                len: r.read_u64()?,
                dso_id: r.read_u64()?,
                name: r.read_padded_string(8)?,
            }),
            RSPERF_RECORD_SPLIT => Record::Split(SplitRecord {
                data: r.read_bytes(r.remaining())?.to_vec(),
            }),
            RSPERF_RECORD_SPLIT_END => Record::SplitEnd,
            RSPERF_RECORD_EVENT_ID => {
                let count = r.read_u64()?;
                let words = r.read_u64_vec(count.checked_mul(2).ok_or_else(|| {
                    Error::corrupt(format!("event id record with {count} entries"))
                })?)?;
                Record::EventId(EventIdRecord {
                    ids: words.chunks_exact(2).map(|c| (c[0], c[1])).collect(),
                })
            }
            type_ => Record::Unknown(UnknownRecord {
                type_,
                misc,
                data: r.read_bytes(r.remaining())?.to_vec(),
            }),
        };
        if !r.is_empty() {
            return Err(Error::corrupt(format!(
                "{} unexpected trailing bytes in record type {}",
                r.remaining(),
                header.type_
            )));
        }
        Ok(record)
    }

    /// Encode into the binary layout. The header size is computed from the
    /// content; records longer than `MAX_RECORD_SIZE` get a size field of 0
    /// and must be written through `split_for_file`.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(64);
        w.write_u32(self.type_());
        w.write_u16(self.misc());
        w.write_u16(0);
        self.write_body(&mut w);
        let size = u16::try_from(w.len()).unwrap_or(0);
        w.set_u16_at(6, size);
        w.into_inner()
    }

    fn write_body(&self, w: &mut ByteWriter) {
        match self {
            Record::Mmap(r) => {
                w.write_u32(r.pid);
                w.write_u32(r.tid);
                w.write_u64(r.addr);
                w.write_u64(r.len);
                w.write_u64(r.pgoff);
                w.write_padded_string(&r.filename, 8);
                r.sample_id.write(w);
            }
            Record::Mmap2(r) => {
                w.write_u32(r.pid);
                w.write_u32(r.tid);
                w.write_u64(r.addr);
                w.write_u64(r.len);
                w.write_u64(r.pgoff);
                w.write_u32(r.maj);
                w.write_u32(r.min);
                w.write_u64(r.ino);
                w.write_u64(r.ino_generation);
                w.write_u32(r.prot);
                w.write_u32(r.flags);
                w.write_padded_string(&r.filename, 8);
                r.sample_id.write(w);
            }
            Record::Comm(r) => {
                w.write_u32(r.pid);
                w.write_u32(r.tid);
                w.write_padded_string(&r.comm, 8);
                r.sample_id.write(w);
            }
            Record::Fork(r) | Record::Exit(r) => {
                w.write_u32(r.pid);
                w.write_u32(r.ppid);
                w.write_u32(r.tid);
                w.write_u32(r.ptid);
                w.write_u64(r.time);
                r.sample_id.write(w);
            }
            Record::Lost(r) => {
                w.write_u64(r.id);
                w.write_u64(r.lost);
                r.sample_id.write(w);
            }
            Record::Throttle(r) | Record::Unthrottle(r) => {
                w.write_u64(r.time);
                w.write_u64(r.id);
                w.write_u64(r.stream_id);
                r.sample_id.write(w);
            }
            Record::Read(r) => {
                w.write_u32(r.pid);
                w.write_u32(r.tid);
                r.values.write(r.read_format, w);
                r.sample_id.write(w);
            }
            Record::Sample(r) => r.write(w),
            Record::TracingData(r) => {
                w.write_u32(r.data.len() as u32);
                w.write_fixed(&r.data, align(r.data.len(), 64));
            }
            Record::BuildId(r) => {
                w.write_u32(r.pid);
                w.write_fixed(r.build_id.as_bytes(), align(BUILD_ID_SIZE, 8));
                w.write_padded_string(&r.filename, 64);
            }
            Record::KernelSymbol(r) => {
                w.write_u32(r.kallsyms.len() as u32);
                w.write_fixed(&r.kallsyms, align(r.kallsyms.len(), 8));
            }
            Record::Dso(r) => {
                w.write_u64(r.dso_type);
                w.write_u64(r.dso_id);
                w.write_padded_string(&r.dso_name, 8);
            }
            Record::Symbol(r) => {
                w.write_u64(r.addr);
                w.write_u64(r.len);
                w.write_u64(r.dso_id);
                w.write_padded_string(&r.name, 8);
            }
            Record::Split(r) => w.write_bytes(&r.data),
            Record::SplitEnd => {}
            Record::EventId(r) => {
                w.write_u64(r.ids.len() as u64);
                for &(attr_id, event_id) in &r.ids {
                    w.write_u64(attr_id);
                    w.write_u64(event_id);
                }
            }
            Record::Unknown(r) => w.write_bytes(&r.data),
        }
    }

    /// Encode for storage: a single record, or a run of split pieces
    /// followed by a split-end marker when the record is too large.
    pub fn split_for_file(&self) -> Vec<Vec<u8>> {
        let data = self.encode();
        if data.len() <= MAX_RECORD_SIZE {
            return vec![data];
        }
        // Piece payloads stay 8-byte aligned.
        let chunk = (MAX_RECORD_SIZE - HEADER_SIZE) & !7;
        let mut out: Vec<Vec<u8>> = data
            .chunks(chunk)
            .map(|piece| Record::Split(SplitRecord { data: piece.to_vec() }).encode())
            .collect();
        out.push(Record::SplitEnd.encode());
        out
    }

    pub fn type_(&self) -> u32 {
        match self {
            Record::Mmap(_) => PERF_RECORD_MMAP,
            Record::Mmap2(_) => PERF_RECORD_MMAP2,
            Record::Comm(_) => PERF_RECORD_COMM,
            Record::Exit(_) => PERF_RECORD_EXIT,
            Record::Fork(_) => PERF_RECORD_FORK,
            Record::Lost(_) => PERF_RECORD_LOST,
            Record::Throttle(_) => PERF_RECORD_THROTTLE,
            Record::Unthrottle(_) => PERF_RECORD_UNTHROTTLE,
            Record::Read(_) => PERF_RECORD_READ,
            Record::Sample(_) => PERF_RECORD_SAMPLE,
            Record::TracingData(_) => PERF_RECORD_TRACING_DATA,
            Record::BuildId(_) => PERF_RECORD_BUILD_ID,
            Record::KernelSymbol(_) => RSPERF_RECORD_KERNEL_SYMBOL,
            Record::Dso(_) => RSPERF_RECORD_DSO,
            Record::Symbol(_) => RSPERF_RECORD_SYMBOL,
            Record::Split(_) => RSPERF_RECORD_SPLIT,
            Record::SplitEnd => RSPERF_RECORD_SPLIT_END,
            Record::EventId(_) => RSPERF_RECORD_EVENT_ID,
            Record::Unknown(r) => r.type_,
        }
    }

    pub fn misc(&self) -> u16 {
        match self {
            Record::Mmap(r) => r.misc,
            Record::Mmap2(r) => r.misc,
            Record::Comm(r) => r.misc,
            Record::Exit(r) | Record::Fork(r) => r.misc,
            Record::Lost(r) => r.misc,
            Record::Throttle(r) | Record::Unthrottle(r) => r.misc,
            Record::Read(r) => r.misc,
            Record::Sample(r) => r.misc,
            Record::BuildId(r) => r.misc,
            Record::Unknown(r) => r.misc,
            _ => 0,
        }
    }

    pub fn sample_id(&self) -> Option<&SampleId> {
        match self {
            Record::Mmap(r) => Some(&r.sample_id),
            Record::Mmap2(r) => Some(&r.sample_id),
            Record::Comm(r) => Some(&r.sample_id),
            Record::Exit(r) | Record::Fork(r) => Some(&r.sample_id),
            Record::Lost(r) => Some(&r.sample_id),
            Record::Throttle(r) | Record::Unthrottle(r) => Some(&r.sample_id),
            Record::Read(r) => Some(&r.sample_id),
            _ => None,
        }
    }

    pub fn is_sample(&self) -> bool {
        matches!(self, Record::Sample(_))
    }

    /// Time the record was generated: a sample's TIME field, otherwise the
    /// sample-id time (0 when absent).
    pub fn timestamp(&self) -> u64 {
        match self {
            Record::Sample(s) => s.time,
            _ => self.sample_id().map(|s| s.time).unwrap_or(0),
        }
    }

    pub fn cpu(&self) -> u32 {
        match self {
            Record::Sample(s) => s.cpu,
            _ => self.sample_id().map(|s| s.cpu).unwrap_or(0),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Record::Mmap(_) => "mmap",
            Record::Mmap2(_) => "mmap2",
            Record::Comm(_) => "comm",
            Record::Exit(_) => "exit",
            Record::Fork(_) => "fork",
            Record::Lost(_) => "lost",
            Record::Throttle(_) => "throttle",
            Record::Unthrottle(_) => "unthrottle",
            Record::Read(_) => "read",
            Record::Sample(_) => "sample",
            Record::TracingData(_) => "tracing_data",
            Record::BuildId(_) => "build_id",
            Record::KernelSymbol(_) => "kernel_symbol",
            Record::Dso(_) => "dso",
            Record::Symbol(_) => "symbol",
            Record::Split(_) => "split",
            Record::SplitEnd => "split_end",
            Record::EventId(_) => "event_id",
            Record::Unknown(_) => "unknown",
        }
    }
}

/// Byte offset of the event id in a sample record, header included.
pub fn id_offset_in_sample(sample_type: u64) -> Option<usize> {
    if sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
        return Some(HEADER_SIZE);
    }
    if sample_type & PERF_SAMPLE_ID == 0 {
        return None;
    }
    let before = [PERF_SAMPLE_IP, PERF_SAMPLE_TID, PERF_SAMPLE_TIME, PERF_SAMPLE_ADDR]
        .iter()
        .filter(|&&bit| sample_type & bit != 0)
        .count();
    Some(HEADER_SIZE + before * 8)
}

/// Distance from the end of a non-sample record back to its event id.
pub fn id_reverse_offset_in_sample_id(sample_type: u64) -> Option<usize> {
    if sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
        return Some(8);
    }
    if sample_type & PERF_SAMPLE_ID == 0 {
        return None;
    }
    let after = [PERF_SAMPLE_STREAM_ID, PERF_SAMPLE_CPU]
        .iter()
        .filter(|&&bit| sample_type & bit != 0)
        .count();
    Some(8 + after * 8)
}

/// Event id positions shared by every attr of a multi-event stream.
/// Returns `(offset in samples, reverse offset in other records)`.
pub fn common_id_positions(attrs: &[PerfEventAttr]) -> Result<(usize, usize)> {
    let mut common: Option<(usize, usize)> = None;
    for attr in attrs {
        let pos = id_offset_in_sample(attr.sample_type);
        let rpos = id_reverse_offset_in_sample_id(attr.sample_type);
        let (Some(pos), Some(rpos)) = (pos, rpos) else {
            return Err(Error::InvalidArgument(
                "event ids are required when recording multiple events".to_string(),
            ));
        };
        match common {
            None => common = Some((pos, rpos)),
            Some(c) if c != (pos, rpos) => {
                return Err(Error::InvalidArgument(
                    "events have different event id positions".to_string(),
                ));
            }
            Some(_) => {}
        }
    }
    common.ok_or_else(|| Error::InvalidArgument("no event attrs".to_string()))
}

/// Find the event id of a raw record without decoding it.
pub fn peek_event_id(data: &[u8], sample_pos: usize, reverse_pos: usize) -> Option<u64> {
    let header = parse_header(data).ok()?;
    if header.type_ >= PERF_RECORD_USER_DEFINED_TYPE_START {
        return None;
    }
    let offset = if header.type_ == PERF_RECORD_SAMPLE {
        sample_pos
    } else {
        data.len().checked_sub(reverse_pos)?
    };
    if offset < HEADER_SIZE {
        return None;
    }
    let bytes = data.get(offset..offset + 8)?;
    let mut b = [0u8; 8];
    b.copy_from_slice(bytes);
    Some(u64::from_ne_bytes(b))
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "record {}: type {}, misc 0x{:x}",
            self.type_name(),
            self.type_(),
            self.misc()
        )?;
        match self {
            Record::Mmap(r) => writeln!(
                f,
                "  pid {}, tid {}, addr 0x{:x}, len 0x{:x}, pgoff 0x{:x}, filename {}",
                r.pid, r.tid, r.addr, r.len, r.pgoff, r.filename
            )?,
            Record::Mmap2(r) => writeln!(
                f,
                "  pid {}, tid {}, addr 0x{:x}, len 0x{:x}, pgoff 0x{:x}, maj {}, min {}, ino {}, prot {}, flags {}, filename {}",
                r.pid, r.tid, r.addr, r.len, r.pgoff, r.maj, r.min, r.ino, r.prot, r.flags, r.filename
            )?,
            Record::Comm(r) => writeln!(f, "  pid {}, tid {}, comm {}", r.pid, r.tid, r.comm)?,
            Record::Fork(r) | Record::Exit(r) => writeln!(
                f,
                "  pid {}, ppid {}, tid {}, ptid {}",
                r.pid, r.ppid, r.tid, r.ptid
            )?,
            Record::Lost(r) => writeln!(f, "  id {}, lost {}", r.id, r.lost)?,
            Record::Throttle(r) | Record::Unthrottle(r) => {
                writeln!(f, "  time {}, id {}, stream_id {}", r.time, r.id, r.stream_id)?
            }
            Record::Read(r) => {
                writeln!(f, "  pid {}, tid {}", r.pid, r.tid)?;
                for (value, id) in &r.values.values {
                    writeln!(f, "  value {value}, id {id}")?;
                }
            }
            Record::Sample(s) => {
                writeln!(
                    f,
                    "  ip 0x{:x}, pid {}, tid {}, time {}, cpu {}, period {}, id {}",
                    s.ip, s.pid, s.tid, s.time, s.cpu, s.period, s.id
                )?;
                if !s.callchain.is_empty() {
                    writeln!(f, "  callchain nr={}", s.callchain.len())?;
                    for ip in &s.callchain {
                        writeln!(f, "    0x{ip:x}")?;
                    }
                }
                if !s.branch_stack.is_empty() {
                    writeln!(f, "  branch_stack nr={}", s.branch_stack.len())?;
                    for b in &s.branch_stack {
                        writeln!(f, "    from 0x{:x}, to 0x{:x}, flags 0x{:x}", b.from, b.to, b.flags)?;
                    }
                }
                if !s.stack_user.data.is_empty() {
                    writeln!(
                        f,
                        "  user_stack size {}, dyn_size {}",
                        s.stack_user.data.len(),
                        s.stack_user.dyn_size
                    )?;
                }
            }
            Record::TracingData(r) => writeln!(f, "  size {}", r.data.len())?,
            Record::BuildId(r) => writeln!(
                f,
                "  pid {}, build_id {}, filename {}",
                r.pid, r.build_id, r.filename
            )?,
            Record::KernelSymbol(r) => writeln!(f, "  kallsyms size {}", r.kallsyms.len())?,
            Record::Dso(r) => writeln!(
                f,
                "  dso_type {}, dso_id {}, dso_name {}",
                r.dso_type, r.dso_id, r.dso_name
            )?,
            Record::Symbol(r) => writeln!(
                f,
                "  name {}, addr 0x{:x}, len 0x{:x}, dso_id {}",
                r.name, r.addr, r.len, r.dso_id
            )?,
            Record::Split(r) => writeln!(f, "  size {}", r.data.len())?,
            Record::SplitEnd => {}
            Record::EventId(r) => {
                for (attr_id, event_id) in &r.ids {
                    writeln!(f, "  attr_id {attr_id}, event_id {event_id}")?;
                }
            }
            Record::Unknown(r) => writeln!(f, "  size {}", r.data.len())?,
        }
        if let Some(sid) = self.sample_id()
            && sid.sample_id_all
        {
            writeln!(
                f,
                "  sample_id: pid {}, tid {}, time {}, id {}, cpu {}",
                sid.pid, sid.tid, sid.time, sid.id, sid.cpu
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_SAMPLE_ID_BITS: [u64; 6] = [
        PERF_SAMPLE_TID,
        PERF_SAMPLE_TIME,
        PERF_SAMPLE_ID,
        PERF_SAMPLE_STREAM_ID,
        PERF_SAMPLE_CPU,
        PERF_SAMPLE_IDENTIFIER,
    ];

    fn attr_with(sample_type: u64, sample_id_all: bool) -> PerfEventAttr {
        let mut attr = PerfEventAttr::new();
        attr.sample_type = sample_type;
        attr.set_sample_id_all(sample_id_all);
        attr
    }

    fn filled_sample_id(attr: &PerfEventAttr) -> SampleId {
        SampleId {
            pid: 10,
            tid: 11,
            time: 1_000,
            id: 7,
            stream_id: 8,
            cpu: 3,
            identifier: 7,
            ..SampleId::new(attr)
        }
        .masked()
    }

    impl SampleId {
        // Zero fields that are not encoded so decoded values compare equal.
        fn masked(mut self) -> Self {
            if !self.has(PERF_SAMPLE_TID) {
                self.pid = 0;
                self.tid = 0;
            }
            if !self.has(PERF_SAMPLE_TIME) {
                self.time = 0;
            }
            if !self.has(PERF_SAMPLE_ID) {
                self.id = 0;
            }
            if !self.has(PERF_SAMPLE_STREAM_ID) {
                self.stream_id = 0;
            }
            if !self.has(PERF_SAMPLE_CPU) {
                self.cpu = 0;
            }
            if !self.has(PERF_SAMPLE_IDENTIFIER) {
                self.identifier = 0;
            }
            self
        }
    }

    fn non_sample_records(attr: &PerfEventAttr) -> Vec<Record> {
        let sid = filled_sample_id(attr);
        vec![
            Record::Mmap(MmapRecord {
                misc: PERF_RECORD_MISC_USER,
                pid: 1,
                tid: 2,
                addr: 0x40_0000,
                len: 0x1000,
                pgoff: 0,
                filename: "/system/bin/sh".to_string(),
                sample_id: sid.clone(),
            }),
            Record::Mmap2(Mmap2Record {
                misc: PERF_RECORD_MISC_USER,
                pid: 1,
                tid: 2,
                addr: 0x7f00_0000,
                len: 0x2000,
                pgoff: 0x1000,
                maj: 8,
                min: 1,
                ino: 1234,
                ino_generation: 2,
                prot: 5,
                flags: 2,
                filename: "/lib/libc.so".to_string(),
                sample_id: sid.clone(),
            }),
            Record::Comm(CommRecord {
                misc: 0,
                pid: 1,
                tid: 2,
                comm: "surfaceflinger".to_string(),
                sample_id: sid.clone(),
            }),
            Record::Fork(ForkExitRecord {
                misc: 0,
                pid: 3,
                ppid: 1,
                tid: 3,
                ptid: 1,
                time: 99,
                sample_id: sid.clone(),
            }),
            Record::Exit(ForkExitRecord {
                misc: 0,
                pid: 3,
                ppid: 1,
                tid: 3,
                ptid: 1,
                time: 100,
                sample_id: sid.clone(),
            }),
            Record::Lost(LostRecord {
                misc: 0,
                id: 7,
                lost: 42,
                sample_id: sid.clone(),
            }),
            Record::Throttle(ThrottleRecord {
                misc: 0,
                time: 5,
                id: 7,
                stream_id: 7,
                sample_id: sid,
            }),
        ]
    }

    #[test]
    fn test_non_sample_round_trip_for_every_sample_id_shape() {
        // Every subset of the sample-id bits, with and without sample_id_all.
        for mask in 0..(1u32 << ALL_SAMPLE_ID_BITS.len()) {
            let sample_type = ALL_SAMPLE_ID_BITS
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .fold(0, |acc, (_, bit)| acc | bit);
            for id_all in [false, true] {
                let attr = attr_with(sample_type, id_all);
                for record in non_sample_records(&attr) {
                    let bytes = record.encode();
                    assert_eq!(bytes.len() % 8, 0, "{} not aligned", record.type_name());
                    let decoded = Record::decode(&attr, &bytes).unwrap();
                    assert_eq!(decoded, record, "sample_type {sample_type:#x}");
                }
            }
        }
    }

    fn full_sample_attr() -> PerfEventAttr {
        let mut attr = attr_with(
            PERF_SAMPLE_IDENTIFIER
                | PERF_SAMPLE_IP
                | PERF_SAMPLE_TID
                | PERF_SAMPLE_TIME
                | PERF_SAMPLE_ADDR
                | PERF_SAMPLE_ID
                | PERF_SAMPLE_STREAM_ID
                | PERF_SAMPLE_CPU
                | PERF_SAMPLE_PERIOD
                | PERF_SAMPLE_READ
                | PERF_SAMPLE_CALLCHAIN
                | PERF_SAMPLE_RAW
                | PERF_SAMPLE_BRANCH_STACK
                | PERF_SAMPLE_REGS_USER
                | PERF_SAMPLE_STACK_USER,
            true,
        );
        attr.read_format =
            PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING | PERF_FORMAT_ID;
        attr.sample_regs_user = 0b1011;
        attr
    }

    fn full_sample(attr: &PerfEventAttr) -> SampleRecord {
        SampleRecord {
            misc: PERF_RECORD_MISC_USER,
            identifier: 5,
            ip: 0x1234,
            pid: 100,
            tid: 101,
            time: 777,
            addr: 0xdead,
            id: 5,
            stream_id: 5,
            cpu: 2,
            period: 4000,
            read: ReadValues {
                time_enabled: 10,
                time_running: 9,
                values: vec![(33, 5)],
            },
            callchain: vec![PERF_CONTEXT_USER, 0x1234, 0x1000],
            raw: vec![1, 2, 3, 4],
            branch_stack: vec![BranchStackItem {
                from: 1,
                to: 2,
                flags: 3,
            }],
            regs_user: RegsUser {
                abi: 2,
                reg_mask: attr.sample_regs_user,
                regs: vec![11, 12, 13],
            },
            stack_user: StackUser {
                data: vec![0xaa; 64],
                dyn_size: 48,
            },
            ..SampleRecord::new(attr)
        }
    }

    #[test]
    fn test_sample_round_trip() {
        let attr = full_sample_attr();
        let record = Record::Sample(full_sample(&attr));
        let bytes = record.encode();
        assert_eq!(Record::decode(&attr, &bytes).unwrap(), record);
    }

    #[test]
    fn test_sample_group_read_and_empty_optional_fields() {
        let mut attr = attr_with(
            PERF_SAMPLE_IP | PERF_SAMPLE_READ | PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER,
            false,
        );
        attr.read_format = PERF_FORMAT_GROUP | PERF_FORMAT_ID;
        attr.sample_regs_user = 0xff;
        let mut sample = SampleRecord::new(&attr);
        sample.ip = 1;
        sample.read.values = vec![(1, 10), (2, 11), (3, 12)];
        // abi 0 and empty stack mean the registers and stack data are absent.
        let record = Record::Sample(sample);
        let bytes = record.encode();
        assert_eq!(bytes.len(), 8 + 8 + (8 + 3 * 16) + 8 + 8);
        assert_eq!(Record::decode(&attr, &bytes).unwrap(), record);
    }

    #[test]
    fn test_sample_shrinks_after_trimming_stack() {
        let attr = full_sample_attr();
        let mut sample = full_sample(&attr);
        let before = Record::Sample(sample.clone()).encode();

        sample.trim_user_stack(20);
        let after = Record::Sample(sample.clone()).encode();
        assert_eq!(before.len() - after.len(), 64 - 16);
        assert_eq!(u16::from_ne_bytes([after[6], after[7]]) as usize, after.len());

        let Record::Sample(decoded) = Record::decode(&attr, &after).unwrap() else {
            panic!("expected sample");
        };
        assert_eq!(decoded.stack_user.data.len(), 16);
        assert_eq!(decoded.stack_user.dyn_size, 16);
    }

    #[test]
    fn test_replace_regs_and_stack_with_callchain() {
        let attr = full_sample_attr();
        let mut sample = full_sample(&attr);
        sample.replace_regs_and_stack_with_callchain(&[0x2000, 0x3000]);
        assert_eq!(sample.sample_type & PERF_SAMPLE_STACK_USER, 0);
        assert_eq!(
            sample.callchain,
            vec![PERF_CONTEXT_USER, 0x1234, 0x1000, PERF_CONTEXT_USER, 0x2000, 0x3000]
        );

        let mut new_attr = attr.clone();
        new_attr.sample_type = sample.sample_type;
        let record = Record::Sample(sample);
        assert_eq!(Record::decode(&new_attr, &record.encode()).unwrap(), record);
    }

    #[test]
    fn test_private_records_round_trip() {
        let attr = attr_with(PERF_SAMPLE_IP, true);
        let records = vec![
            Record::BuildId(BuildIdRecord {
                misc: PERF_RECORD_MISC_KERNEL,
                pid: u32::MAX,
                build_id: BuildId::from_bytes(&[1, 2, 3, 4, 5]),
                filename: "[kernel.kallsyms]".to_string(),
            }),
            Record::KernelSymbol(KernelSymbolRecord {
                kallsyms: b"ffffffff81000000 T _text\n".to_vec(),
            }),
            Record::Dso(DsoRecord {
                dso_type: 1,
                dso_id: 2,
                dso_name: "/system/lib64/libc.so".to_string(),
            }),
            Record::Symbol(SymbolRecord {
                addr: 0x100,
                len: 0x20,
                dso_id: 2,
                name: "malloc".to_string(),
            }),
            Record::TracingData(TracingDataRecord {
                data: vec![7; 100],
            }),
            Record::EventId(EventIdRecord {
                ids: vec![(0, 11), (1, 12)],
            }),
            Record::Unknown(UnknownRecord {
                type_: 40000,
                misc: 3,
                data: vec![9; 16],
            }),
        ];
        for record in records {
            let bytes = record.encode();
            assert_eq!(Record::decode(&attr, &bytes).unwrap(), record);
        }
        assert_eq!(
            Record::BuildId(BuildIdRecord {
                filename: "a".to_string(),
                ..Default::default()
            })
            .encode()
            .len(),
            8 + 4 + 24 + 64
        );
    }

    #[test]
    fn test_truncated_records_are_corrupt() {
        let attr = full_sample_attr();
        let mut records = non_sample_records(&attr);
        records.push(Record::Sample(full_sample(&attr)));
        records.push(Record::BuildId(BuildIdRecord {
            filename: "/bin/true".to_string(),
            ..Default::default()
        }));
        for record in records {
            let bytes = record.encode();
            for cut in 0..bytes.len() {
                let mut truncated = bytes[..cut].to_vec();
                if cut >= 8 {
                    // Also lie about the size so only the payload is short.
                    truncated[6..8].copy_from_slice(&(cut as u16).to_ne_bytes());
                }
                let err = Record::decode(&attr, &truncated);
                assert!(
                    matches!(err, Err(Error::Corrupt(_))),
                    "{} cut at {cut}",
                    record.type_name()
                );
            }
        }
    }

    #[test]
    fn test_size_lying_sample_counts() {
        let attr = attr_with(PERF_SAMPLE_CALLCHAIN, false);
        let mut w = ByteWriter::new();
        w.write_u32(PERF_RECORD_SAMPLE);
        w.write_u16(0);
        w.write_u16(24);
        w.write_u64(u64::MAX);
        w.write_u64(0);
        assert!(matches!(
            Record::decode(&attr, &w.into_inner()),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_are_corrupt() {
        let attr = attr_with(0, false);
        let mut bytes = Record::Lost(LostRecord::default()).encode();
        bytes.extend_from_slice(&[0; 8]);
        let len = bytes.len() as u16;
        bytes[6..8].copy_from_slice(&len.to_ne_bytes());
        assert!(Record::decode(&attr, &bytes).is_err());
    }

    #[test]
    fn test_split_large_record() {
        let record = Record::KernelSymbol(KernelSymbolRecord {
            kallsyms: vec![b'x'; 200_000],
        });
        let pieces = record.split_for_file();
        assert!(pieces.len() > 2);
        assert!(pieces.iter().all(|p| p.len() <= MAX_RECORD_SIZE));

        let attr = PerfEventAttr::new();
        let mut joined = Vec::new();
        for piece in &pieces {
            match Record::decode(&attr, piece).unwrap() {
                Record::Split(s) => joined.extend_from_slice(&s.data),
                Record::SplitEnd => {}
                other => panic!("unexpected {}", other.type_name()),
            }
        }
        assert_eq!(Record::decode_reassembled(&attr, &joined).unwrap(), record);
    }

    #[test]
    fn test_timestamp() {
        let attr = attr_with(PERF_SAMPLE_TIME | PERF_SAMPLE_TID, true);
        let records = non_sample_records(&attr);
        assert!(records.iter().all(|r| r.timestamp() == 1_000));

        let no_id_all = attr_with(PERF_SAMPLE_TIME, false);
        assert_eq!(non_sample_records(&no_id_all)[0].timestamp(), 0);

        let mut sample = SampleRecord::new(&attr);
        sample.time = 55;
        assert_eq!(Record::Sample(sample).timestamp(), 55);
    }

    #[test]
    fn test_id_positions() {
        let st = PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_ID | PERF_SAMPLE_CPU;
        assert_eq!(id_offset_in_sample(st), Some(8 + 24));
        assert_eq!(id_reverse_offset_in_sample_id(st), Some(16));
        assert_eq!(id_offset_in_sample(st | PERF_SAMPLE_IDENTIFIER), Some(8));
        assert_eq!(id_offset_in_sample(PERF_SAMPLE_IP), None);

        let attr = attr_with(st, true);
        let mut sample = SampleRecord::new(&attr);
        sample.id = 77;
        let bytes = Record::Sample(sample).encode();
        assert_eq!(peek_event_id(&bytes, 32, 16), Some(77));

        let mut comm = CommRecord {
            comm: "a".to_string(),
            sample_id: SampleId::new(&attr),
            ..Default::default()
        };
        comm.sample_id.id = 78;
        let bytes = Record::Comm(comm).encode();
        assert_eq!(peek_event_id(&bytes, 32, 16), Some(78));

        let other = attr_with(PERF_SAMPLE_IP | PERF_SAMPLE_ID, true);
        assert!(common_id_positions(&[attr.clone(), attr.clone()]).is_ok());
        assert!(common_id_positions(&[attr, other]).is_err());
    }
}
