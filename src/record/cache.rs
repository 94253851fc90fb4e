//! Reordering buffer for records that arrive from per-cpu ring buffers out
//! of global time order.

use super::Record;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub const DEFAULT_MIN_CACHE_SIZE: usize = 1000;
pub const DEFAULT_MIN_TIME_DIFF_NS: u64 = 1_000_000;

struct CachedRecord {
    time: u64,
    is_sample: bool,
    seq: u64,
    record: Record,
}

impl CachedRecord {
    fn key(&self) -> (u64, bool, u64) {
        // Non-sample records win ties so mmap/comm context precedes samples.
        (self.time, self.is_sample, self.seq)
    }
}

impl PartialEq for CachedRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for CachedRecord {}

impl PartialOrd for CachedRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CachedRecord {
    // Reversed so the max-heap yields the earliest record first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Emits records once at least `min_cache_size` are buffered and the
/// earliest one is `min_time_diff_ns` older than the newest timestamp seen.
pub struct RecordCache {
    has_timestamp: bool,
    min_cache_size: usize,
    min_time_diff_ns: u64,
    last_time: u64,
    next_seq: u64,
    queue: BinaryHeap<CachedRecord>,
}

impl RecordCache {
    pub fn new(has_timestamp: bool, min_cache_size: usize, min_time_diff_ns: u64) -> Self {
        RecordCache {
            has_timestamp,
            min_cache_size,
            min_time_diff_ns,
            last_time: 0,
            next_seq: 0,
            queue: BinaryHeap::new(),
        }
    }

    pub fn with_defaults(has_timestamp: bool) -> Self {
        Self::new(has_timestamp, DEFAULT_MIN_CACHE_SIZE, DEFAULT_MIN_TIME_DIFF_NS)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push(&mut self, record: Record) {
        let time = record.timestamp();
        if self.has_timestamp {
            self.last_time = self.last_time.max(time);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(CachedRecord {
            time,
            is_sample: record.is_sample(),
            seq,
            record,
        });
    }

    pub fn pop(&mut self) -> Option<Record> {
        if self.queue.len() < self.min_cache_size {
            return None;
        }
        let top = self.queue.peek()?;
        if self.has_timestamp && top.time.saturating_add(self.min_time_diff_ns) > self.last_time {
            return None;
        }
        self.queue.pop().map(|r| r.record)
    }

    /// Drain every buffered record in order, ignoring both thresholds.
    pub fn pop_all(&mut self) -> Vec<Record> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(r) = self.queue.pop() {
            out.push(r.record);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::{PERF_SAMPLE_TIME, PerfEventAttr};
    use crate::record::{MmapRecord, SampleId, SampleRecord};

    fn sample_at(time: u64) -> Record {
        let mut attr = PerfEventAttr::new();
        attr.sample_type = PERF_SAMPLE_TIME;
        let mut s = SampleRecord::new(&attr);
        s.time = time;
        Record::Sample(s)
    }

    fn mmap_at(time: u64) -> Record {
        let mut attr = PerfEventAttr::new();
        attr.sample_type = PERF_SAMPLE_TIME;
        attr.set_sample_id_all(true);
        let mut sample_id = SampleId::new(&attr);
        sample_id.time = time;
        Record::Mmap(MmapRecord {
            sample_id,
            ..Default::default()
        })
    }

    fn times(records: &[Record]) -> Vec<u64> {
        records.iter().map(|r| r.timestamp()).collect()
    }

    #[test]
    fn test_min_size_gate() {
        let mut cache = RecordCache::new(true, 3, 0);
        for t in [5, 1, 3] {
            cache.push(sample_at(t));
        }
        // The earliest record leaves once three are buffered; the next pop
        // is gated by the minimum size again.
        assert_eq!(cache.pop().map(|r| r.timestamp()), Some(1));
        assert!(cache.pop().is_none());
        assert_eq!(times(&cache.pop_all()), vec![3, 5]);
    }

    #[test]
    fn test_sorted_pops_without_size_gate() {
        let mut cache = RecordCache::new(true, 1, 0);
        for t in [5, 1, 3] {
            cache.push(sample_at(t));
        }
        let popped: Vec<u64> = std::iter::from_fn(|| cache.pop()).map(|r| r.timestamp()).collect();
        assert_eq!(popped, vec![1, 3, 5]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_time_diff_gate() {
        let mut cache = RecordCache::new(true, 1, 10);
        cache.push(sample_at(100));
        cache.push(sample_at(105));
        assert!(cache.pop().is_none());
        cache.push(sample_at(110));
        assert_eq!(cache.pop().map(|r| r.timestamp()), Some(100));
        assert!(cache.pop().is_none());
        assert_eq!(times(&cache.pop_all()), vec![105, 110]);
    }

    #[test]
    fn test_non_samples_first_at_equal_time() {
        let mut cache = RecordCache::new(true, 1, 0);
        cache.push(sample_at(7));
        cache.push(mmap_at(7));
        cache.push(sample_at(7));
        let all = cache.pop_all();
        assert!(!all[0].is_sample());
        assert!(all[1].is_sample() && all[2].is_sample());
    }

    #[test]
    fn test_insertion_order_tiebreak() {
        let mut cache = RecordCache::new(false, 0, 0);
        let mut a = SampleRecord::default();
        a.pid = 1;
        let mut b = SampleRecord::default();
        b.pid = 2;
        cache.push(Record::Sample(a));
        cache.push(Record::Sample(b));
        let Some(Record::Sample(first)) = cache.pop() else {
            panic!("expected sample");
        };
        assert_eq!(first.pid, 1);
    }
}
