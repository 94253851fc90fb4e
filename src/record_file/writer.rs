use super::features::{self, EventDesc, FileFeature, NrCpus};
use super::{AttrWithIds, FileAttr, FileHeader, SectionDesc};
use super::{FEAT_ARCH, FEAT_BRANCH_STACK, FEAT_BUILD_ID, FEAT_CMDLINE, FEAT_EVENT_DESC};
use super::{FEAT_FILE, FEAT_HOSTNAME, FEAT_META_INFO, FEAT_NRCPUS, FEAT_OSRELEASE};
use crate::error::{Error, Result};
use crate::record::{BuildIdRecord, Record};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Writes a perf.data file. The header is only known once every section
/// has been written, so it is written last by [`RecordFileWriter::close`].
pub struct RecordFileWriter {
    path: PathBuf,
    out: BufWriter<File>,
    attrs: SectionDesc,
    data: SectionDesc,
    /// Feature payloads keyed by feature id, written in id order on close.
    features: BTreeMap<u32, Vec<u8>>,
    attr_written: bool,
}

impl RecordFileWriter {
    /// Create (or replace) the file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        // Placeholder for the header.
        out.write_all(&[0u8; FileHeader::SIZE])?;
        Ok(RecordFileWriter {
            path: path.to_path_buf(),
            out,
            attrs: SectionDesc::default(),
            data: SectionDesc::default(),
            features: BTreeMap::new(),
            attr_written: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the id section followed by the attr section. Must be called
    /// exactly once, before any data.
    pub fn write_attr_section(&mut self, attrs: &[AttrWithIds]) -> Result<()> {
        if self.attr_written {
            return Err(Error::InvalidArgument(
                "attr section is already written".to_string(),
            ));
        }
        if attrs.is_empty() {
            return Err(Error::InvalidArgument("no event attrs to write".to_string()));
        }
        let mut offset = FileHeader::SIZE as u64;
        let mut file_attrs = Vec::with_capacity(attrs.len());
        for entry in attrs {
            for id in &entry.ids {
                self.out.write_all(&id.to_ne_bytes())?;
            }
            let size = (entry.ids.len() * 8) as u64;
            file_attrs.push(FileAttr {
                attr: entry.attr.clone(),
                ids: SectionDesc { offset, size },
            });
            offset += size;
        }
        self.attrs = SectionDesc {
            offset,
            size: (file_attrs.len() * FileAttr::SIZE) as u64,
        };
        for file_attr in &file_attrs {
            self.out.write_all(&file_attr.to_bytes())?;
        }
        self.data = SectionDesc {
            offset: self.attrs.offset + self.attrs.size,
            size: 0,
        };
        self.attr_written = true;
        Ok(())
    }

    /// Append raw, already-encoded records to the data section.
    pub fn write_data(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.attr_written {
            return Err(Error::InvalidArgument(
                "data written before the attr section".to_string(),
            ));
        }
        self.out.write_all(bytes)?;
        self.data.size += bytes.len() as u64;
        Ok(())
    }

    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        for piece in record.split_for_file() {
            self.write_data(&piece)?;
        }
        Ok(())
    }

    pub fn data_size(&self) -> u64 {
        self.data.size
    }

    /// Store a feature payload; a later call for the same id replaces it.
    pub fn write_feature(&mut self, feature: u32, payload: Vec<u8>) -> Result<()> {
        if feature >= super::FEAT_MAX_NUM {
            return Err(Error::InvalidArgument(format!("invalid feature id {feature}")));
        }
        self.features.insert(feature, payload);
        Ok(())
    }

    pub fn write_string_feature(&mut self, feature: u32, s: &str) -> Result<()> {
        self.write_feature(feature, features::encode_string(s))
    }

    pub fn write_hostname_feature(&mut self, hostname: &str) -> Result<()> {
        self.write_string_feature(FEAT_HOSTNAME, hostname)
    }

    pub fn write_osrelease_feature(&mut self, release: &str) -> Result<()> {
        self.write_string_feature(FEAT_OSRELEASE, release)
    }

    pub fn write_arch_feature(&mut self, arch: &str) -> Result<()> {
        self.write_string_feature(FEAT_ARCH, arch)
    }

    pub fn write_cmdline_feature(&mut self, args: &[String]) -> Result<()> {
        self.write_feature(FEAT_CMDLINE, features::encode_cmdline(args))
    }

    pub fn write_build_id_feature(&mut self, records: &[BuildIdRecord]) -> Result<()> {
        self.write_feature(FEAT_BUILD_ID, features::encode_build_ids(records))
    }

    pub fn write_nrcpus_feature(&mut self, n: NrCpus) -> Result<()> {
        self.write_feature(FEAT_NRCPUS, features::encode_nrcpus(n))
    }

    pub fn write_event_desc_feature(&mut self, events: &[EventDesc]) -> Result<()> {
        self.write_feature(FEAT_EVENT_DESC, features::encode_event_desc(events))
    }

    pub fn write_branch_stack_feature(&mut self) -> Result<()> {
        self.write_feature(FEAT_BRANCH_STACK, Vec::new())
    }

    pub fn write_meta_info_feature(&mut self, info: &BTreeMap<String, String>) -> Result<()> {
        self.write_feature(FEAT_META_INFO, features::encode_meta_info(info))
    }

    pub fn write_file_features(&mut self, files: &[FileFeature]) -> Result<()> {
        let mut payload = Vec::new();
        for file in files {
            payload.extend(features::encode_file_feature(file));
        }
        self.write_feature(FEAT_FILE, payload)
    }

    /// Write the feature sections and the final header.
    pub fn close(mut self) -> Result<()> {
        if !self.attr_written {
            return Err(Error::InvalidArgument(
                "record file closed without an attr section".to_string(),
            ));
        }
        let mut header = FileHeader {
            attrs: self.attrs,
            data: self.data,
            ..Default::default()
        };

        let descriptors_offset = self.data.offset + self.data.size;
        let mut payload_offset =
            descriptors_offset + (self.features.len() * SectionDesc::SIZE) as u64;
        for (&feature, payload) in &self.features {
            let desc = SectionDesc {
                offset: payload_offset,
                size: payload.len() as u64,
            };
            self.out.write_all(&desc.to_bytes())?;
            payload_offset += desc.size;
            header.set_feature(feature);
        }
        for payload in self.features.values() {
            self.out.write_all(payload)?;
        }

        self.out.seek(SeekFrom::Start(0))?;
        self.out.write_all(&header.to_bytes())?;
        self.out.flush()?;
        log::debug!(
            "Wrote {} ({} data bytes, {} features)",
            self.path.display(),
            self.data.size,
            self.features.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_file::FEAT_MAX_NUM;

    #[test]
    fn test_data_before_attrs_is_rejected() {
        let path = std::env::temp_dir().join(format!("rsperf_writer_order_{}.data", std::process::id()));
        let mut writer = RecordFileWriter::create(&path).unwrap();
        assert!(writer.write_data(&[0; 8]).is_err());
        assert!(writer.write_feature(FEAT_MAX_NUM, Vec::new()).is_err());
        assert!(writer.write_attr_section(&[]).is_err());
        writer
            .write_attr_section(&[AttrWithIds::default()])
            .unwrap();
        assert!(writer.write_attr_section(&[AttrWithIds::default()]).is_err());
        writer.close().unwrap();
        fs::remove_file(&path).unwrap();
    }
}
