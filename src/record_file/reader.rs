use super::features::{self, EventDesc, FileFeature, NrCpus};
use super::{AttrWithIds, FileAttr, FileHeader, SectionDesc};
use super::{FEAT_ARCH, FEAT_BUILD_ID, FEAT_CMDLINE, FEAT_EVENT_DESC, FEAT_FILE};
use super::{FEAT_HOSTNAME, FEAT_META_INFO, FEAT_NRCPUS, FEAT_OSRELEASE};
use crate::error::{Error, Result};
use crate::perf::{PERF_RECORD_USER_DEFINED_TYPE_START, PERF_SAMPLE_TIME, PerfEventAttr};
use crate::perf::{RSPERF_RECORD_SPLIT, RSPERF_RECORD_SPLIT_END};
use crate::record::cache::RecordCache;
use crate::record::{self, BuildIdRecord, Record, peek_header};
use memmap2::Mmap;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

fn record_bytes(data: &[u8], pos: usize, size: usize) -> Result<&[u8]> {
    data.get(pos..pos + size)
        .filter(|_| size >= 8)
        .ok_or_else(|| {
            Error::corrupt(format!(
                "record of {} bytes at data offset {} exceeds data section of {} bytes",
                size,
                pos,
                data.len()
            ))
        })
}

/// Reads a perf.data file through a read-only mapping. Every section is
/// bounds-checked against the file size when the file is opened.
pub struct RecordFileReader {
    path: PathBuf,
    map: Mmap,
    header: FileHeader,
    attrs: Vec<AttrWithIds>,
    features: BTreeMap<u32, SectionDesc>,
    id_to_attr: HashMap<u64, usize>,
    /// Where to find the event id when more than one attr is present.
    id_positions: Option<(usize, usize)>,
}

impl RecordFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < FileHeader::SIZE as u64 {
            return Err(Error::corrupt(format!(
                "{} is too small ({} bytes) to be a record file",
                path.display(),
                len
            )));
        }
        // SAFETY: the mapping is read-only and only accessed through
        // bounds-checked slices.
        let map = unsafe { Mmap::map(&file) }?;
        let header = FileHeader::parse(&map)?;
        header.validate(map.len() as u64)?;

        let mut reader = RecordFileReader {
            path: path.to_path_buf(),
            map,
            header,
            attrs: Vec::new(),
            features: BTreeMap::new(),
            id_to_attr: HashMap::new(),
            id_positions: None,
        };
        reader.read_attrs()?;
        reader.read_feature_descriptors()?;
        log::debug!(
            "Opened {}: {} attrs, {} data bytes, {} features",
            reader.path.display(),
            reader.attrs.len(),
            reader.header.data.size,
            reader.features.len()
        );
        Ok(reader)
    }

    fn section(&self, desc: SectionDesc) -> Result<&[u8]> {
        let start = usize::try_from(desc.offset).ok();
        let end = desc.end().and_then(|e| usize::try_from(e).ok());
        match (start, end) {
            (Some(start), Some(end)) if end <= self.map.len() => Ok(&self.map[start..end]),
            _ => Err(Error::corrupt(format!(
                "section [{}, +{}) exceeds file size {}",
                desc.offset,
                desc.size,
                self.map.len()
            ))),
        }
    }

    fn read_attrs(&mut self) -> Result<()> {
        let attr_size = self.header.attr_size as usize;
        let section = self.section(self.header.attrs)?;
        let mut file_attrs = Vec::new();
        for chunk in section.chunks_exact(attr_size) {
            file_attrs.push(FileAttr::parse(chunk)?);
        }
        if file_attrs.is_empty() {
            return Err(Error::corrupt("record file has no event attrs"));
        }

        let fixed = [
            (
                "header",
                SectionDesc {
                    offset: 0,
                    size: self.header.header_size,
                },
            ),
            ("attr", self.header.attrs),
            ("data", self.header.data),
        ];
        let mut attrs = Vec::with_capacity(file_attrs.len());
        for (index, file_attr) in file_attrs.iter().enumerate() {
            if file_attr.ids.size % 8 != 0 {
                return Err(Error::corrupt(format!(
                    "id section size {} is not a multiple of 8",
                    file_attr.ids.size
                )));
            }
            if let Some((name, _)) = fixed.iter().find(|(_, s)| s.overlaps(&file_attr.ids)) {
                return Err(Error::corrupt(format!(
                    "id section of attr {} overlaps the {} section",
                    index + 1,
                    name
                )));
            }
            if let Some(other) = file_attrs[..index]
                .iter()
                .position(|f| f.ids.overlaps(&file_attr.ids))
            {
                return Err(Error::corrupt(format!(
                    "id sections of attrs {} and {} overlap",
                    other + 1,
                    index + 1
                )));
            }
            let ids = self
                .section(file_attr.ids)?
                .chunks_exact(8)
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    u64::from_ne_bytes(b)
                })
                .collect();
            attrs.push(AttrWithIds {
                attr: file_attr.attr.clone(),
                ids,
            });
        }

        if attrs.len() > 1 {
            let list: Vec<PerfEventAttr> = attrs.iter().map(|a| a.attr.clone()).collect();
            self.id_positions = Some(record::common_id_positions(&list)?);
        }
        for (index, entry) in attrs.iter().enumerate() {
            for &id in &entry.ids {
                self.id_to_attr.insert(id, index);
            }
        }
        self.attrs = attrs;
        Ok(())
    }

    fn read_feature_descriptors(&mut self) -> Result<()> {
        let ids = self.header.feature_ids();
        let offset = self.header.feature_section_offset();
        let desc_section = SectionDesc {
            offset,
            size: (ids.len() * SectionDesc::SIZE) as u64,
        };
        let data = self.section(desc_section)?;
        let mut features: BTreeMap<u32, SectionDesc> = BTreeMap::new();
        for (feature, raw) in ids.into_iter().zip(data.chunks_exact(SectionDesc::SIZE)) {
            let desc = SectionDesc::parse(raw)?;
            if desc.size != 0 && desc.offset < desc_section.offset + desc_section.size {
                return Err(Error::corrupt(format!(
                    "feature {} overlaps the attr or data section",
                    super::feature_name(feature)
                )));
            }
            self.section(desc)?;
            if let Some((&other, _)) = features.iter().find(|(_, d)| d.overlaps(&desc)) {
                return Err(Error::corrupt(format!(
                    "feature {} overlaps feature {}",
                    super::feature_name(feature),
                    super::feature_name(other)
                )));
            }
            features.insert(feature, desc);
        }
        self.features = features;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn attrs(&self) -> &[AttrWithIds] {
        &self.attrs
    }

    pub fn feature_ids(&self) -> Vec<u32> {
        self.features.keys().copied().collect()
    }

    pub fn feature_section(&self, feature: u32) -> Option<&[u8]> {
        let desc = *self.features.get(&feature)?;
        self.section(desc).ok()
    }

    fn string_feature(&self, feature: u32) -> Result<Option<String>> {
        self.feature_section(feature)
            .map(features::decode_string)
            .transpose()
    }

    pub fn hostname(&self) -> Result<Option<String>> {
        self.string_feature(FEAT_HOSTNAME)
    }

    pub fn os_release(&self) -> Result<Option<String>> {
        self.string_feature(FEAT_OSRELEASE)
    }

    pub fn arch(&self) -> Result<Option<String>> {
        self.string_feature(FEAT_ARCH)
    }

    pub fn cmdline(&self) -> Result<Vec<String>> {
        Ok(self
            .feature_section(FEAT_CMDLINE)
            .map(features::decode_cmdline)
            .transpose()?
            .unwrap_or_default())
    }

    pub fn build_ids(&self) -> Result<Vec<BuildIdRecord>> {
        Ok(self
            .feature_section(FEAT_BUILD_ID)
            .map(features::decode_build_ids)
            .transpose()?
            .unwrap_or_default())
    }

    pub fn meta_info(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .feature_section(FEAT_META_INFO)
            .map(features::decode_meta_info)
            .transpose()?
            .unwrap_or_default())
    }

    pub fn nrcpus(&self) -> Result<Option<NrCpus>> {
        self.feature_section(FEAT_NRCPUS)
            .map(features::decode_nrcpus)
            .transpose()
    }

    pub fn event_desc(&self) -> Result<Vec<EventDesc>> {
        Ok(self
            .feature_section(FEAT_EVENT_DESC)
            .map(features::decode_event_desc)
            .transpose()?
            .unwrap_or_default())
    }

    pub fn file_features(&self) -> Result<Vec<FileFeature>> {
        Ok(self
            .feature_section(FEAT_FILE)
            .map(features::decode_file_features)
            .transpose()?
            .unwrap_or_default())
    }

    /// Whether every event stamps every record with a time, which is what
    /// makes sorting the data section meaningful.
    pub fn has_timestamp(&self) -> bool {
        self.attrs
            .iter()
            .all(|a| a.attr.sample_id_all() && a.attr.sample_type & PERF_SAMPLE_TIME != 0)
    }

    fn attr_for(&self, data: &[u8]) -> &PerfEventAttr {
        let mut index = 0;
        if let Some((sample_pos, reverse_pos)) = self.id_positions
            && let Some(id) = record::peek_event_id(data, sample_pos, reverse_pos)
            && let Some(&i) = self.id_to_attr.get(&id)
        {
            index = i;
        }
        &self.attrs[index].attr
    }

    /// Decode the record at `*pos` of the data section, reassembling split
    /// records, and advance `*pos` past it.
    fn read_record(&self, data: &[u8], pos: &mut usize) -> Result<Record> {
        let header = peek_header(&data[*pos..])?;
        let size = usize::from(header.size);

        if header.type_ != RSPERF_RECORD_SPLIT {
            let bytes = record_bytes(data, *pos, size)?;
            *pos += size;
            return Record::decode(self.attr_for(bytes), bytes);
        }

        let mut joined = Vec::new();
        loop {
            let header = peek_header(&data[*pos..])?;
            let size = usize::from(header.size);
            let bytes = record_bytes(data, *pos, size)?;
            *pos += size;
            match header.type_ {
                RSPERF_RECORD_SPLIT => joined.extend_from_slice(&bytes[8..]),
                RSPERF_RECORD_SPLIT_END => break,
                other => {
                    return Err(Error::corrupt(format!(
                        "split records are followed by record type {other} instead of split end"
                    )));
                }
            }
        }
        let attr = if peek_header(&joined)?.type_ < PERF_RECORD_USER_DEFINED_TYPE_START {
            self.attr_for(&joined)
        } else {
            &self.attrs[0].attr
        };
        Record::decode_reassembled(attr, &joined)
    }

    /// Decode every record of the data section, in file order or (when
    /// `sorted`) time order through a [`RecordCache`]. Stops early when the
    /// callback returns false.
    pub fn read_data<F>(&mut self, sorted: bool, mut callback: F) -> Result<()>
    where
        F: FnMut(Record) -> bool,
    {
        let start = self.header.data.offset as usize;
        let end = start + self.header.data.size as usize;
        let mut cache = if sorted {
            Some(RecordCache::with_defaults(self.has_timestamp()))
        } else {
            None
        };

        let mut pos = 0;
        while start + pos < end {
            let record = {
                let data = &self.map[start..end];
                self.read_record(data, &mut pos)?
            };
            if let Record::EventId(event_ids) = &record {
                for &(attr_index, id) in &event_ids.ids {
                    if (attr_index as usize) < self.attrs.len() {
                        self.id_to_attr.insert(id, attr_index as usize);
                    }
                }
            }
            match cache.as_mut() {
                Some(cache) => {
                    cache.push(record);
                    while let Some(r) = cache.pop() {
                        if !callback(r) {
                            return Ok(());
                        }
                    }
                }
                None => {
                    if !callback(record) {
                        return Ok(());
                    }
                }
            }
        }
        if let Some(mut cache) = cache {
            for r in cache.pop_all() {
                if !callback(r) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Collect every record in file order.
    pub fn read_all(&mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        self.read_data(false, |r| {
            records.push(r);
            true
        })?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_id::BuildId;
    use crate::perf::*;
    use crate::record::{CommRecord, EventIdRecord, KernelSymbolRecord, MmapRecord, SampleId};
    use crate::record::SampleRecord;
    use crate::record_file::writer::RecordFileWriter;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_path(name: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("rsperf_{}_{}_{}.data", name, std::process::id(), n))
    }

    fn test_attr(config: u64) -> PerfEventAttr {
        let mut attr = PerfEventAttr::new();
        attr.type_ = PERF_TYPE_SOFTWARE;
        attr.config = config;
        attr.sample_type = PERF_SAMPLE_IP
            | PERF_SAMPLE_TID
            | PERF_SAMPLE_TIME
            | PERF_SAMPLE_ID
            | PERF_SAMPLE_CPU
            | PERF_SAMPLE_PERIOD;
        attr.set_sample_id_all(true);
        attr
    }

    fn sample(attr: &PerfEventAttr, id: u64, time: u64, ip: u64) -> Record {
        let mut s = SampleRecord::new(attr);
        s.id = id;
        s.time = time;
        s.ip = ip;
        s.pid = 10;
        s.tid = 10;
        s.period = 1;
        Record::Sample(s)
    }

    fn comm(attr: &PerfEventAttr, id: u64, time: u64) -> Record {
        let mut sample_id = SampleId::new(attr);
        sample_id.id = id;
        sample_id.time = time;
        Record::Comm(CommRecord {
            pid: 10,
            tid: 10,
            comm: "app".to_string(),
            sample_id,
            ..Default::default()
        })
    }

    fn write_file(path: &Path, attrs: &[AttrWithIds], records: &[Record]) {
        let mut writer = RecordFileWriter::create(path).unwrap();
        writer.write_attr_section(attrs).unwrap();
        for r in records {
            writer.write_record(r).unwrap();
        }
        writer.write_hostname_feature("device").unwrap();
        writer.write_arch_feature("arm64").unwrap();
        writer
            .write_cmdline_feature(&["rsperf".to_string(), "record".to_string()])
            .unwrap();
        writer
            .write_build_id_feature(&[BuildIdRecord {
                pid: 10,
                build_id: BuildId::from_bytes(&[1; 20]),
                filename: "/bin/app".to_string(),
                ..Default::default()
            }])
            .unwrap();
        let mut meta = BTreeMap::new();
        meta.insert("clockid".to_string(), "monotonic".to_string());
        writer.write_meta_info_feature(&meta).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_write_then_read() {
        let path = temp_path("roundtrip");
        let attr = test_attr(PERF_COUNT_SW_CPU_CLOCK);
        let attrs = vec![AttrWithIds {
            attr: attr.clone(),
            ids: vec![1, 2],
        }];
        let records = vec![
            comm(&attr, 1, 5),
            sample(&attr, 1, 10, 0x100),
            sample(&attr, 2, 11, 0x200),
        ];
        write_file(&path, &attrs, &records);

        let mut reader = RecordFileReader::open(&path).unwrap();
        assert_eq!(reader.attrs(), &attrs[..]);
        let data_size: u64 = records.iter().map(|r| r.encode().len() as u64).sum();
        assert_eq!(reader.header().data.size, data_size);
        assert_eq!(reader.hostname().unwrap().as_deref(), Some("device"));
        assert_eq!(reader.arch().unwrap().as_deref(), Some("arm64"));
        assert_eq!(reader.os_release().unwrap(), None);
        assert_eq!(reader.cmdline().unwrap(), vec!["rsperf", "record"]);
        assert_eq!(reader.build_ids().unwrap().len(), 1);
        assert_eq!(reader.meta_info().unwrap()["clockid"], "monotonic");
        assert_eq!(
            reader.feature_ids(),
            vec![
                FEAT_BUILD_ID,
                FEAT_HOSTNAME,
                FEAT_ARCH,
                FEAT_CMDLINE,
                FEAT_META_INFO
            ]
        );
        assert_eq!(reader.read_all().unwrap(), records);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_routes_records_to_their_attr() {
        let path = temp_path("routing");
        let cycles = test_attr(PERF_COUNT_SW_CPU_CLOCK);
        let mut faults = test_attr(PERF_COUNT_SW_PAGE_FAULTS);
        faults.sample_type |= PERF_SAMPLE_CALLCHAIN;
        let attrs = vec![
            AttrWithIds {
                attr: cycles.clone(),
                ids: vec![1],
            },
            AttrWithIds {
                attr: faults.clone(),
                ids: vec![2],
            },
        ];
        let mut with_chain = SampleRecord::new(&faults);
        with_chain.id = 2;
        with_chain.callchain = vec![0x1, 0x2];
        let records = vec![
            sample(&cycles, 1, 1, 0x10),
            Record::Sample(with_chain),
            comm(&faults, 2, 3),
        ];
        write_file(&path, &attrs, &records);

        let mut reader = RecordFileReader::open(&path).unwrap();
        assert_eq!(reader.read_all().unwrap(), records);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_event_id_record_adds_ids() {
        let path = temp_path("event_id");
        let a = test_attr(PERF_COUNT_SW_CPU_CLOCK);
        let mut b = test_attr(PERF_COUNT_SW_PAGE_FAULTS);
        b.sample_type |= PERF_SAMPLE_ADDR;
        // ADDR comes before ID, so give both attrs IDENTIFIER to share positions.
        let mut a2 = a.clone();
        a2.sample_type |= PERF_SAMPLE_IDENTIFIER;
        b.sample_type |= PERF_SAMPLE_IDENTIFIER;
        let attrs = vec![
            AttrWithIds {
                attr: a2.clone(),
                ids: vec![1],
            },
            AttrWithIds {
                attr: b.clone(),
                ids: vec![2],
            },
        ];
        let mut late = SampleRecord::new(&b);
        late.identifier = 9;
        late.id = 9;
        late.addr = 0xabc;
        let records = vec![
            Record::EventId(EventIdRecord { ids: vec![(1, 9)] }),
            Record::Sample(late),
        ];
        write_file(&path, &attrs, &records);

        let mut reader = RecordFileReader::open(&path).unwrap();
        assert_eq!(reader.read_all().unwrap(), records);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_sorted_read() {
        let path = temp_path("sorted");
        let attr = test_attr(PERF_COUNT_SW_CPU_CLOCK);
        let attrs = vec![AttrWithIds {
            attr: attr.clone(),
            ids: vec![1],
        }];
        let records = vec![
            sample(&attr, 1, 30, 0x3),
            sample(&attr, 1, 10, 0x1),
            comm(&attr, 1, 10),
            sample(&attr, 1, 20, 0x2),
        ];
        write_file(&path, &attrs, &records);

        let mut reader = RecordFileReader::open(&path).unwrap();
        assert!(reader.has_timestamp());
        let mut seen = Vec::new();
        reader
            .read_data(true, |r| {
                seen.push((r.timestamp(), r.is_sample()));
                true
            })
            .unwrap();
        assert_eq!(seen, vec![(10, false), (10, true), (20, true), (30, true)]);

        let mut count = 0;
        reader
            .read_data(false, |_| {
                count += 1;
                count < 2
            })
            .unwrap();
        assert_eq!(count, 2);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_split_records_reassembled() {
        let path = temp_path("split");
        let attr = test_attr(PERF_COUNT_SW_CPU_CLOCK);
        let attrs = vec![AttrWithIds {
            attr: attr.clone(),
            ids: vec![1],
        }];
        let big = Record::KernelSymbol(KernelSymbolRecord {
            kallsyms: vec![b'k'; 150_000],
        });
        let records = vec![big, sample(&attr, 1, 1, 0x1)];
        write_file(&path, &attrs, &records);

        let mut reader = RecordFileReader::open(&path).unwrap();
        assert_eq!(reader.read_all().unwrap(), records);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_rejects_corrupt_files() {
        let path = temp_path("corrupt");
        let attr = test_attr(PERF_COUNT_SW_CPU_CLOCK);
        let attrs = vec![AttrWithIds {
            attr: attr.clone(),
            ids: vec![1],
        }];
        let records = vec![Record::Mmap(MmapRecord {
            filename: "/bin/app".to_string(),
            sample_id: SampleId::new(&attr),
            ..Default::default()
        })];
        write_file(&path, &attrs, &records);
        let good = fs::read(&path).unwrap();

        // Truncated: the feature payloads no longer fit.
        fs::write(&path, &good[..good.len() - 10]).unwrap();
        assert!(matches!(RecordFileReader::open(&path), Err(Error::Corrupt(_))));

        // Too short to hold a header.
        fs::write(&path, &good[..50]).unwrap();
        assert!(matches!(RecordFileReader::open(&path), Err(Error::Corrupt(_))));

        // Data section size beyond the end of the file.
        let mut header = FileHeader::parse(&good).unwrap();
        header.data.size = good.len() as u64;
        let mut bad = good.clone();
        bad[..FileHeader::SIZE].copy_from_slice(&header.to_bytes());
        fs::write(&path, &bad).unwrap();
        assert!(matches!(RecordFileReader::open(&path), Err(Error::Corrupt(_))));

        // A record whose size runs past the data section.
        let header = FileHeader::parse(&good).unwrap();
        let mut bad = good.clone();
        let size_at = header.data.offset as usize + 6;
        bad[size_at..size_at + 2].copy_from_slice(&1000u16.to_ne_bytes());
        fs::write(&path, &bad).unwrap();
        let mut reader = RecordFileReader::open(&path).unwrap();
        assert!(matches!(reader.read_all(), Err(Error::Corrupt(_))));

        // Wrong magic.
        let mut bad = good;
        bad[..8].copy_from_slice(b"PERFILE1");
        fs::write(&path, &bad).unwrap();
        assert!(matches!(RecordFileReader::open(&path), Err(Error::Corrupt(_))));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_rejects_overlapping_sections() {
        let path = temp_path("overlap");
        let attr = test_attr(PERF_COUNT_SW_CPU_CLOCK);
        let attrs = vec![
            AttrWithIds {
                attr: attr.clone(),
                ids: vec![1],
            },
            AttrWithIds {
                attr: attr.clone(),
                ids: vec![2],
            },
        ];
        write_file(&path, &attrs, &[sample(&attr, 1, 1, 0x10)]);
        let good = fs::read(&path).unwrap();
        let header = FileHeader::parse(&good).unwrap();
        let ids_desc_at = |i: usize| {
            header.attrs.offset as usize + (i + 1) * header.attr_size as usize
                - SectionDesc::SIZE
        };

        // First attr's ids point into the data section.
        let mut bad = good.clone();
        let at = ids_desc_at(0);
        let into_data = SectionDesc {
            offset: header.data.offset,
            size: 8,
        };
        bad[at..at + SectionDesc::SIZE].copy_from_slice(&into_data.to_bytes());
        fs::write(&path, &bad).unwrap();
        assert!(matches!(RecordFileReader::open(&path), Err(Error::Corrupt(_))));

        // Second attr reuses the first attr's id section.
        let mut bad = good.clone();
        let first = ids_desc_at(0);
        let second = ids_desc_at(1);
        let shared = good[first..first + SectionDesc::SIZE].to_vec();
        bad[second..second + SectionDesc::SIZE].copy_from_slice(&shared);
        fs::write(&path, &bad).unwrap();
        assert!(matches!(RecordFileReader::open(&path), Err(Error::Corrupt(_))));

        // Two feature descriptors point at the same payload.
        let mut bad = good.clone();
        let descs = header.feature_section_offset() as usize;
        let payload = good[descs..descs + SectionDesc::SIZE].to_vec();
        bad[descs + SectionDesc::SIZE..descs + 2 * SectionDesc::SIZE].copy_from_slice(&payload);
        fs::write(&path, &bad).unwrap();
        assert!(matches!(RecordFileReader::open(&path), Err(Error::Corrupt(_))));

        // The untouched file still opens.
        fs::write(&path, &good).unwrap();
        assert!(RecordFileReader::open(&path).is_ok());
        fs::remove_file(&path).unwrap();
    }
}
