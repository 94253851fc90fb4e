//! Kernel perf_event ABI: attribute struct, ring-buffer control page and
//! record/sample constants (from linux/perf_event.h).

use crate::error::{Error, Result};
use crate::record::cursor::{ByteReader, ByteWriter};

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;
pub const PERF_TYPE_HW_CACHE: u32 = 3;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
pub const PERF_COUNT_HW_BUS_CYCLES: u64 = 6;
pub const PERF_COUNT_HW_STALLED_CYCLES_FRONTEND: u64 = 7;
pub const PERF_COUNT_HW_STALLED_CYCLES_BACKEND: u64 = 8;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
pub const PERF_COUNT_SW_CPU_MIGRATIONS: u64 = 4;
pub const PERF_COUNT_SW_PAGE_FAULTS_MIN: u64 = 5;
pub const PERF_COUNT_SW_PAGE_FAULTS_MAJ: u64 = 6;
pub const PERF_COUNT_SW_ALIGNMENT_FAULTS: u64 = 7;
pub const PERF_COUNT_SW_EMULATION_FAULTS: u64 = 8;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;
pub const PERF_SAMPLE_READ: u64 = 1 << 4;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_ID: u64 = 1 << 6;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_PERIOD: u64 = 1 << 8;
pub const PERF_SAMPLE_STREAM_ID: u64 = 1 << 9;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;
pub const PERF_SAMPLE_BRANCH_STACK: u64 = 1 << 11;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
pub const PERF_SAMPLE_STACK_USER: u64 = 1 << 13;
pub const PERF_SAMPLE_IDENTIFIER: u64 = 1 << 16;

pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
pub const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
pub const PERF_FORMAT_ID: u64 = 1 << 2;
pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

pub const PERF_SAMPLE_BRANCH_USER: u64 = 1 << 0;
pub const PERF_SAMPLE_BRANCH_KERNEL: u64 = 1 << 1;
pub const PERF_SAMPLE_BRANCH_HV: u64 = 1 << 2;
pub const PERF_SAMPLE_BRANCH_ANY: u64 = 1 << 3;
pub const PERF_SAMPLE_BRANCH_ANY_CALL: u64 = 1 << 4;
pub const PERF_SAMPLE_BRANCH_ANY_RETURN: u64 = 1 << 5;
pub const PERF_SAMPLE_BRANCH_IND_CALL: u64 = 1 << 6;

pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_READ: u32 = 8;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_MMAP2: u32 = 10;

// Types shared with perf tooling for records that never come from the kernel.
pub const PERF_RECORD_USER_DEFINED_TYPE_START: u32 = 64;
pub const PERF_RECORD_TRACING_DATA: u32 = 66;
pub const PERF_RECORD_BUILD_ID: u32 = 67;

// Private record types live above every kernel and perf-tool type.
pub const RSPERF_RECORD_KERNEL_SYMBOL: u32 = 32769;
pub const RSPERF_RECORD_DSO: u32 = 32770;
pub const RSPERF_RECORD_SYMBOL: u32 = 32771;
pub const RSPERF_RECORD_SPLIT: u32 = 32772;
pub const RSPERF_RECORD_SPLIT_END: u32 = 32773;
pub const RSPERF_RECORD_EVENT_ID: u32 = 32774;

pub const PERF_RECORD_MISC_CPUMODE_MASK: u16 = 7;
pub const PERF_RECORD_MISC_KERNEL: u16 = 1;
pub const PERF_RECORD_MISC_USER: u16 = 2;

pub const PERF_CONTEXT_HV: u64 = (-32i64) as u64;
pub const PERF_CONTEXT_KERNEL: u64 = (-128i64) as u64;
pub const PERF_CONTEXT_USER: u64 = (-512i64) as u64;
pub const PERF_CONTEXT_MAX: u64 = (-4095i64) as u64;

pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

pub const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
pub const PERF_EVENT_IOC_SET_OUTPUT: libc::c_ulong = 0x2405;

pub const DEFAULT_KERNEL_MMAP_NAME: &str = "[kernel.kallsyms]";

/// Size of `perf_event_attr` as written by this crate (PERF_ATTR_SIZE_VER7).
pub const PERF_ATTR_SIZE: usize = 120;

/// perf_event_attr structure
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

macro_rules! attr_flag {
    ($get:ident, $set:ident, $bit:expr) => {
        pub fn $get(&self) -> bool {
            self.flags & (1 << $bit) != 0
        }

        pub fn $set(&mut self, val: bool) {
            if val {
                self.flags |= 1 << $bit;
            } else {
                self.flags &= !(1 << $bit);
            }
        }
    };
}

impl PerfEventAttr {
    const PRECISE_IP_SHIFT: u64 = 15;
    const PRECISE_IP_MASK: u64 = 3 << Self::PRECISE_IP_SHIFT;

    pub fn new() -> Self {
        PerfEventAttr {
            size: PERF_ATTR_SIZE as u32,
            ..Default::default()
        }
    }

    attr_flag!(disabled, set_disabled, 0);
    attr_flag!(inherit, set_inherit, 1);
    attr_flag!(exclude_user, set_exclude_user, 4);
    attr_flag!(exclude_kernel, set_exclude_kernel, 5);
    attr_flag!(exclude_hv, set_exclude_hv, 6);
    attr_flag!(mmap, set_mmap, 8);
    attr_flag!(comm, set_comm, 9);
    attr_flag!(freq, set_freq, 10);
    attr_flag!(enable_on_exec, set_enable_on_exec, 12);
    attr_flag!(watermark, set_watermark, 14);
    attr_flag!(sample_id_all, set_sample_id_all, 18);
    attr_flag!(exclude_host, set_exclude_host, 19);
    attr_flag!(exclude_guest, set_exclude_guest, 20);
    attr_flag!(exclude_callchain_user, set_exclude_callchain_user, 22);
    attr_flag!(mmap2, set_mmap2, 23);

    pub fn precise_ip(&self) -> u8 {
        ((self.flags & Self::PRECISE_IP_MASK) >> Self::PRECISE_IP_SHIFT) as u8
    }

    pub fn set_precise_ip(&mut self, level: u8) {
        self.flags = (self.flags & !Self::PRECISE_IP_MASK)
            | ((u64::from(level.min(3)) << Self::PRECISE_IP_SHIFT) & Self::PRECISE_IP_MASK);
    }

    pub fn set_sample_freq(&mut self, freq: u64) {
        self.set_freq(true);
        self.sample_period_or_freq = freq;
    }

    pub fn set_sample_period(&mut self, period: u64) {
        self.set_freq(false);
        self.sample_period_or_freq = period;
    }

    pub fn has_sample(&self, bit: u64) -> bool {
        self.sample_type & bit != 0
    }

    /// Serialize in the kernel layout.
    pub fn write_to(&self, w: &mut ByteWriter) {
        w.write_u32(self.type_);
        w.write_u32(self.size);
        w.write_u64(self.config);
        w.write_u64(self.sample_period_or_freq);
        w.write_u64(self.sample_type);
        w.write_u64(self.read_format);
        w.write_u64(self.flags);
        w.write_u32(self.wakeup_events_or_watermark);
        w.write_u32(self.bp_type);
        w.write_u64(self.config1);
        w.write_u64(self.config2);
        w.write_u64(self.branch_sample_type);
        w.write_u64(self.sample_regs_user);
        w.write_u32(self.sample_stack_user);
        w.write_u32(self.clockid as u32);
        w.write_u64(self.sample_regs_intr);
        w.write_u32(self.aux_watermark);
        w.write_u16(self.sample_max_stack);
        w.write_u16(self.__reserved_2);
        w.write_u32(self.aux_sample_size);
        w.write_u32(self.__reserved_3);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(PERF_ATTR_SIZE);
        self.write_to(&mut w);
        w.into_inner()
    }

    /// Parse an attr that may have been written by an older or newer kernel
    /// header. Missing trailing fields stay zero; extra bytes are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::corrupt(format!(
                "perf_event_attr too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = [0u8; PERF_ATTR_SIZE];
        let n = data.len().min(PERF_ATTR_SIZE);
        buf[..n].copy_from_slice(&data[..n]);

        let mut r = ByteReader::new(&buf);
        Ok(PerfEventAttr {
            type_: r.read_u32()?,
            size: r.read_u32()?,
            config: r.read_u64()?,
            sample_period_or_freq: r.read_u64()?,
            sample_type: r.read_u64()?,
            read_format: r.read_u64()?,
            flags: r.read_u64()?,
            wakeup_events_or_watermark: r.read_u32()?,
            bp_type: r.read_u32()?,
            config1: r.read_u64()?,
            config2: r.read_u64()?,
            branch_sample_type: r.read_u64()?,
            sample_regs_user: r.read_u64()?,
            sample_stack_user: r.read_u32()?,
            clockid: r.read_u32()? as i32,
            sample_regs_intr: r.read_u64()?,
            aux_watermark: r.read_u32()?,
            sample_max_stack: r.read_u16()?,
            __reserved_2: r.read_u16()?,
            aux_sample_size: r.read_u32()?,
            __reserved_3: r.read_u32()?,
        })
    }
}

/// perf_event_mmap_page header structure
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 928],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// perf_event_header for records in the ring buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

impl PerfEventHeader {
    pub const SIZE: usize = 8;
}

/// User register mask captured for DWARF call chains on this architecture.
pub fn supported_user_regs_mask() -> u64 {
    if cfg!(target_arch = "x86_64") {
        // Segment registers DS, ES, FS, GS are rejected by the kernel.
        ((1u64 << 24) - 1) & !((1 << 12) | (1 << 13) | (1 << 14) | (1 << 15))
    } else if cfg!(target_arch = "aarch64") {
        (1u64 << 33) - 1
    } else if cfg!(target_arch = "arm") {
        (1u64 << 16) - 1
    } else if cfg!(target_arch = "x86") {
        ((1u64 << 9) - 1) & !((1 << 12) | (1 << 13) | (1 << 14) | (1 << 15))
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_layout_size() {
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), PERF_ATTR_SIZE);
        assert_eq!(PerfEventAttr::new().to_bytes().len(), PERF_ATTR_SIZE);
        assert_eq!(std::mem::size_of::<PerfEventHeader>(), PerfEventHeader::SIZE);
    }

    #[test]
    fn test_mmap_page_data_head_offset() {
        assert_eq!(std::mem::offset_of!(PerfEventMmapPage, data_head), 1024);
    }

    #[test]
    fn test_flags() {
        let mut attr = PerfEventAttr::new();
        attr.set_sample_id_all(true);
        attr.set_enable_on_exec(true);
        attr.set_precise_ip(2);
        assert!(attr.sample_id_all());
        assert!(attr.enable_on_exec());
        assert!(!attr.disabled());
        assert_eq!(attr.precise_ip(), 2);
        assert_eq!(attr.flags, (1 << 18) | (1 << 12) | (2 << 15));

        attr.set_enable_on_exec(false);
        assert!(!attr.enable_on_exec());
    }

    #[test]
    fn test_attr_bytes_short_and_long() {
        let mut attr = PerfEventAttr::new();
        attr.type_ = PERF_TYPE_SOFTWARE;
        attr.sample_type = PERF_SAMPLE_IP | PERF_SAMPLE_TID;
        attr.sample_stack_user = 8192;
        let bytes = attr.to_bytes();
        assert_eq!(PerfEventAttr::from_bytes(&bytes).unwrap(), attr);

        // An attr from an older kernel keeps only the leading fields.
        let old = PerfEventAttr::from_bytes(&bytes[..64]).unwrap();
        assert_eq!(old.sample_type, attr.sample_type);
        assert_eq!(old.sample_stack_user, 0);

        assert!(PerfEventAttr::from_bytes(&bytes[..4]).is_err());
    }
}
