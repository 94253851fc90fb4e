//! perf.data container: file header, attr/id sections, data section and
//! feature sections.
//!
//! Layout written by [`RecordFileWriter`]:
//!
//! ```text
//! file header | id section | attr section | data section | feature descriptors | feature payloads
//! ```

pub mod features;
pub mod reader;
pub mod writer;

use crate::error::{Error, Result};
use crate::perf::{PERF_ATTR_SIZE, PerfEventAttr};
use crate::record::cursor::{ByteReader, ByteWriter};

pub use reader::RecordFileReader;
pub use writer::RecordFileWriter;

pub const PERF_MAGIC: &[u8; 8] = b"PERFILE2";

pub const FEAT_TRACING_DATA: u32 = 1;
pub const FEAT_BUILD_ID: u32 = 2;
pub const FEAT_HOSTNAME: u32 = 3;
pub const FEAT_OSRELEASE: u32 = 4;
pub const FEAT_VERSION: u32 = 5;
pub const FEAT_ARCH: u32 = 6;
pub const FEAT_NRCPUS: u32 = 7;
pub const FEAT_CPUDESC: u32 = 8;
pub const FEAT_CPUID: u32 = 9;
pub const FEAT_TOTAL_MEM: u32 = 10;
pub const FEAT_CMDLINE: u32 = 11;
pub const FEAT_EVENT_DESC: u32 = 12;
pub const FEAT_CPU_TOPOLOGY: u32 = 13;
pub const FEAT_NUMA_TOPOLOGY: u32 = 14;
pub const FEAT_BRANCH_STACK: u32 = 15;
pub const FEAT_PMU_MAPPINGS: u32 = 16;
pub const FEAT_GROUP_DESC: u32 = 17;
pub const FEAT_AUXTRACE: u32 = 18;
pub const FEAT_LAST_FEATURE: u32 = 19;

pub const FEAT_PRIVATE_START: u32 = 128;
pub const FEAT_FILE: u32 = 128;
pub const FEAT_META_INFO: u32 = 129;
pub const FEAT_DEBUG_UNWIND: u32 = 130;
pub const FEAT_DEBUG_UNWIND_FILE: u32 = 131;
pub const FEAT_FILE2: u32 = 132;
pub const FEAT_ETM_BRANCH_LIST: u32 = 133;
pub const FEAT_INIT_MAP: u32 = 134;
pub const FEAT_MAX_NUM: u32 = 256;

const FEATURE_NAMES: &[(u32, &str)] = &[
    (FEAT_TRACING_DATA, "tracing_data"),
    (FEAT_BUILD_ID, "build_id"),
    (FEAT_HOSTNAME, "hostname"),
    (FEAT_OSRELEASE, "osrelease"),
    (FEAT_VERSION, "version"),
    (FEAT_ARCH, "arch"),
    (FEAT_NRCPUS, "nrcpus"),
    (FEAT_CPUDESC, "cpudesc"),
    (FEAT_CPUID, "cpuid"),
    (FEAT_TOTAL_MEM, "total_mem"),
    (FEAT_CMDLINE, "cmdline"),
    (FEAT_EVENT_DESC, "event_desc"),
    (FEAT_CPU_TOPOLOGY, "cpu_topology"),
    (FEAT_NUMA_TOPOLOGY, "numa_topology"),
    (FEAT_BRANCH_STACK, "branch_stack"),
    (FEAT_PMU_MAPPINGS, "pmu_mappings"),
    (FEAT_GROUP_DESC, "group_desc"),
    (FEAT_AUXTRACE, "auxtrace"),
    (FEAT_FILE, "file"),
    (FEAT_META_INFO, "meta_info"),
    (FEAT_DEBUG_UNWIND, "debug_unwind"),
    (FEAT_DEBUG_UNWIND_FILE, "debug_unwind_file"),
    (FEAT_FILE2, "file2"),
    (FEAT_ETM_BRANCH_LIST, "etm_branch_list"),
    (FEAT_INIT_MAP, "init_map"),
];

pub fn feature_name(feature: u32) -> String {
    FEATURE_NAMES
        .iter()
        .find(|(id, _)| *id == feature)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("unknown_feature({feature})"))
}

pub fn feature_id(name: &str) -> Option<u32> {
    FEATURE_NAMES
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(id, _)| *id)
}

/// Absolute [offset, offset + size) range of a section in the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionDesc {
    pub offset: u64,
    pub size: u64,
}

impl SectionDesc {
    pub const SIZE: usize = 16;

    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }

    fn read(r: &mut ByteReader) -> Result<Self> {
        Ok(SectionDesc {
            offset: r.read_u64()?,
            size: r.read_u64()?,
        })
    }

    fn write(&self, w: &mut ByteWriter) {
        w.write_u64(self.offset);
        w.write_u64(self.size);
    }

    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        Self::read(&mut ByteReader::new(data))
    }

    pub(crate) fn to_bytes(self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(Self::SIZE);
        self.write(&mut w);
        w.into_inner()
    }

    fn overlaps(&self, other: &SectionDesc) -> bool {
        self.size != 0
            && other.size != 0
            && self.offset < other.offset.saturating_add(other.size)
            && other.offset < self.offset.saturating_add(self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: [u8; 8],
    pub header_size: u64,
    pub attr_size: u64,
    pub attrs: SectionDesc,
    pub data: SectionDesc,
    pub event_types: SectionDesc,
    pub features: [u8; (FEAT_MAX_NUM / 8) as usize],
}

impl Default for FileHeader {
    fn default() -> Self {
        FileHeader {
            magic: *PERF_MAGIC,
            header_size: Self::SIZE as u64,
            attr_size: FileAttr::SIZE as u64,
            attrs: SectionDesc::default(),
            data: SectionDesc::default(),
            event_types: SectionDesc::default(),
            features: [0; (FEAT_MAX_NUM / 8) as usize],
        }
    }
}

impl FileHeader {
    pub const SIZE: usize = 8 + 8 + 8 + 3 * SectionDesc::SIZE + (FEAT_MAX_NUM / 8) as usize;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let mut magic = [0u8; 8];
        magic.copy_from_slice(r.read_bytes(8)?);
        if &magic != PERF_MAGIC {
            return Err(Error::corrupt(format!(
                "bad magic {:?}, expected {:?}",
                String::from_utf8_lossy(&magic),
                String::from_utf8_lossy(PERF_MAGIC)
            )));
        }
        let header_size = r.read_u64()?;
        let attr_size = r.read_u64()?;
        let attrs = SectionDesc::read(&mut r)?;
        let data = SectionDesc::read(&mut r)?;
        let event_types = SectionDesc::read(&mut r)?;
        let mut features = [0u8; (FEAT_MAX_NUM / 8) as usize];
        let features_len = features.len();
        features.copy_from_slice(r.read_bytes(features_len)?);
        Ok(FileHeader {
            magic,
            header_size,
            attr_size,
            attrs,
            data,
            event_types,
            features,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(Self::SIZE);
        w.write_bytes(&self.magic);
        w.write_u64(self.header_size);
        w.write_u64(self.attr_size);
        self.attrs.write(&mut w);
        self.data.write(&mut w);
        self.event_types.write(&mut w);
        w.write_bytes(&self.features);
        w.into_inner()
    }

    pub fn set_feature(&mut self, feature: u32) {
        if feature < FEAT_MAX_NUM {
            self.features[(feature / 8) as usize] |= 1 << (feature % 8);
        }
    }

    pub fn has_feature(&self, feature: u32) -> bool {
        feature < FEAT_MAX_NUM && self.features[(feature / 8) as usize] & (1 << (feature % 8)) != 0
    }

    /// Features in ascending id order, matching the descriptor array order.
    pub fn feature_ids(&self) -> Vec<u32> {
        (0..FEAT_MAX_NUM).filter(|&f| self.has_feature(f)).collect()
    }

    /// Reject sections that exceed `file_len` or overlap each other.
    pub fn validate(&self, file_len: u64) -> Result<()> {
        if self.header_size < Self::SIZE as u64 {
            return Err(Error::corrupt(format!(
                "header size {} is smaller than {}",
                self.header_size,
                Self::SIZE
            )));
        }
        if self.attr_size <= SectionDesc::SIZE as u64 {
            return Err(Error::corrupt(format!("invalid attr size {}", self.attr_size)));
        }
        let header = SectionDesc {
            offset: 0,
            size: self.header_size,
        };
        let sections = [("header", header), ("attr", self.attrs), ("data", self.data)];
        for (name, section) in sections {
            match section.end() {
                Some(end) if end <= file_len => {}
                _ => {
                    return Err(Error::corrupt(format!(
                        "{} section [{}, +{}) exceeds file size {}",
                        name, section.offset, section.size, file_len
                    )));
                }
            }
        }
        for (i, (a_name, a)) in sections.iter().enumerate() {
            for (b_name, b) in &sections[i + 1..] {
                if a.overlaps(b) {
                    return Err(Error::corrupt(format!(
                        "{a_name} section overlaps {b_name} section"
                    )));
                }
            }
        }
        if self.attrs.size % self.attr_size != 0 {
            return Err(Error::corrupt(format!(
                "attr section size {} is not a multiple of attr size {}",
                self.attrs.size, self.attr_size
            )));
        }
        Ok(())
    }

    /// Offset of the feature descriptor array.
    pub fn feature_section_offset(&self) -> u64 {
        self.data.offset + self.data.size
    }
}

/// One attr entry: the event attr and the section listing its event ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttr {
    pub attr: PerfEventAttr,
    pub ids: SectionDesc,
}

impl FileAttr {
    pub const SIZE: usize = PERF_ATTR_SIZE + SectionDesc::SIZE;

    /// Parse an entry of `attr_size` bytes; attrs written by other kernels
    /// may be shorter or longer than ours.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let attr_len = data
            .len()
            .checked_sub(SectionDesc::SIZE)
            .ok_or_else(|| Error::corrupt(format!("file attr of {} bytes", data.len())))?;
        let attr = PerfEventAttr::from_bytes(&data[..attr_len])?;
        let ids = SectionDesc::parse(&data[attr_len..])?;
        Ok(FileAttr { attr, ids })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(Self::SIZE);
        self.attr.write_to(&mut w);
        self.ids.write(&mut w);
        w.into_inner()
    }
}

/// An event attr paired with the kernel ids of every descriptor opened for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrWithIds {
    pub attr: PerfEventAttr,
    pub ids: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(FileHeader::SIZE, 104);
        assert_eq!(FileAttr::SIZE, 136);
        let mut header = FileHeader::default();
        header.set_feature(FEAT_BUILD_ID);
        header.set_feature(FEAT_META_INFO);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), FileHeader::SIZE);
        let parsed = FileHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.feature_ids(), vec![FEAT_BUILD_ID, FEAT_META_INFO]);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = FileHeader::default().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(FileHeader::parse(&bytes), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_validate_sections() {
        let mut header = FileHeader::default();
        header.attrs = SectionDesc {
            offset: 104,
            size: 136,
        };
        header.data = SectionDesc {
            offset: 240,
            size: 100,
        };
        assert!(header.validate(340).is_ok());
        assert!(header.validate(339).is_err());

        let mut overlapping = header.clone();
        overlapping.data.offset = 200;
        assert!(overlapping.validate(1000).is_err());

        let mut overflow = header.clone();
        overflow.data.offset = u64::MAX;
        assert!(overflow.validate(u64::MAX).is_err());

        let mut ragged = header;
        ragged.attrs.size = 100;
        assert!(ragged.validate(1000).is_err());
    }

    #[test]
    fn test_feature_names() {
        assert_eq!(feature_name(FEAT_CMDLINE), "cmdline");
        assert_eq!(feature_id("meta_info"), Some(FEAT_META_INFO));
        assert_eq!(feature_name(200), "unknown_feature(200)");
    }
}
