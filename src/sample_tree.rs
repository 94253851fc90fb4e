//! Aggregation of samples into report rows.
//!
//! Rows are identified by a caller-supplied comparator: samples comparing
//! equal are merged by summing period and sample count. Each row can also
//! accumulate the call chains that led to it.

use crate::callchain::CallChainRoot;
use crate::record::Record;
use crate::thread_tree::{MapEntry, ThreadTree};
use std::cmp::Ordering;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub struct SampleEntry {
    pub pid: i32,
    pub tid: i32,
    /// Comm of the thread when the first sample of the row was added.
    pub comm: Rc<str>,
    pub ip: u64,
    pub time: u64,
    pub period: u64,
    pub sample_count: u64,
    pub map: Rc<MapEntry>,
    /// Call chains ending in this row, outermost frame first.
    pub callchain: CallChainRoot<String>,
}

pub type SampleComparator = Box<dyn Fn(&SampleEntry, &SampleEntry) -> Ordering>;

/// Row keys usable in a comparator built by [`compare_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Pid,
    Tid,
    Comm,
    Dso,
}

impl SortKey {
    pub fn parse(name: &str) -> Option<SortKey> {
        match name {
            "pid" => Some(SortKey::Pid),
            "tid" => Some(SortKey::Tid),
            "comm" => Some(SortKey::Comm),
            "dso" => Some(SortKey::Dso),
            _ => None,
        }
    }

    fn compare(self, a: &SampleEntry, b: &SampleEntry) -> Ordering {
        match self {
            SortKey::Pid => a.pid.cmp(&b.pid),
            SortKey::Tid => a.tid.cmp(&b.tid),
            SortKey::Comm => a.comm.cmp(&b.comm),
            SortKey::Dso => a.map.filename.cmp(&b.map.filename),
        }
    }
}

/// A comparator ordering rows by each key in turn.
pub fn compare_by(keys: Vec<SortKey>) -> SampleComparator {
    Box::new(move |a, b| {
        keys.iter()
            .map(|k| k.compare(a, b))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    })
}

pub struct SampleTree {
    threads: ThreadTree,
    compare: SampleComparator,
    /// Rows ordered by `compare`.
    samples: Vec<SampleEntry>,
    total_samples: u64,
    total_period: u64,
}

impl SampleTree {
    pub fn new(compare: SampleComparator) -> Self {
        SampleTree {
            threads: ThreadTree::new(),
            compare,
            samples: Vec::new(),
            total_samples: 0,
            total_period: 0,
        }
    }

    pub fn thread_tree(&self) -> &ThreadTree {
        &self.threads
    }

    pub fn thread_tree_mut(&mut self) -> &mut ThreadTree {
        &mut self.threads
    }

    pub fn add_process(&mut self, pid: i32, comm: &str) {
        self.threads.add_process(pid, comm);
    }

    pub fn add_kernel_map(&mut self, start_addr: u64, len: u64, pgoff: u64, time: u64, filename: &str) {
        self.threads.add_kernel_map(start_addr, len, pgoff, time, filename);
    }

    pub fn add_user_map(&mut self, pid: i32, start_addr: u64, len: u64, pgoff: u64, time: u64, filename: &str) {
        self.threads.add_user_map(pid, start_addr, len, pgoff, time, filename);
    }

    /// Add one sample and return the index of the row it was merged into.
    pub fn add_sample(&mut self, pid: i32, tid: i32, ip: u64, time: u64, period: u64) -> usize {
        let map = self.threads.find_map(pid, ip);
        let comm = self.threads.find_thread_or_new(pid, tid).comm.clone();
        self.insert(SampleEntry {
            pid,
            tid,
            comm,
            ip,
            time,
            period,
            sample_count: 1,
            map,
            callchain: CallChainRoot::new(),
        })
    }

    /// Add a sample together with the call chain that led to it.
    pub fn add_call_chain_sample(
        &mut self,
        pid: i32,
        tid: i32,
        ip: u64,
        time: u64,
        period: u64,
        chain: &[String],
    ) -> usize {
        let index = self.add_sample(pid, tid, ip, time, period);
        self.samples[index].callchain.add_call_chain(chain, period);
        index
    }

    fn insert(&mut self, value: SampleEntry) -> usize {
        self.total_samples += value.sample_count;
        self.total_period += value.period;
        match self
            .samples
            .binary_search_by(|probe| (self.compare)(probe, &value))
        {
            Ok(index) => {
                let row = &mut self.samples[index];
                row.period += value.period;
                row.sample_count += value.sample_count;
                index
            }
            Err(index) => {
                self.samples.insert(index, value);
                index
            }
        }
    }

    /// Feed thread/map records into the thread tree and samples into rows.
    pub fn process_record(&mut self, record: &Record) {
        match record {
            Record::Sample(s) => {
                self.add_sample(s.pid as i32, s.tid as i32, s.ip, s.time, s.period.max(1));
            }
            other => self.threads.update(other),
        }
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn total_period(&self) -> u64 {
        self.total_period
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Visit rows by period, heaviest first; ties keep comparator order.
    pub fn visit_all_samples(&mut self, mut callback: impl FnMut(&SampleEntry)) {
        for sample in &mut self.samples {
            sample.callchain.sort_by_period();
        }
        let mut order: Vec<&SampleEntry> = self.samples.iter().collect();
        order.sort_by(|a, b| b.period.cmp(&a.period).then_with(|| (self.compare)(a, b)));
        for sample in order {
            callback(sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_tree::KERNEL_PID;

    /// (pid, tid, map owner, map start, sample count)
    type Row = (i32, i32, i32, u64, u64);

    fn compare_rows() -> SampleComparator {
        Box::new(|a, b| {
            a.pid
                .cmp(&b.pid)
                .then(a.tid.cmp(&b.tid))
                .then(a.map.pid.cmp(&b.map.pid))
                .then(a.map.start_addr.cmp(&b.map.start_addr))
        })
    }

    fn tree() -> SampleTree {
        let mut tree = SampleTree::new(compare_rows());
        tree.add_user_map(1, 1, 10, 0, 0, "");
        tree.add_user_map(1, 11, 10, 0, 0, "");
        tree.add_user_map(2, 1, 20, 0, 0, "");
        tree.add_kernel_map(11, 20, 0, 0, "");
        tree
    }

    fn rows(tree: &mut SampleTree) -> Vec<Row> {
        let mut rows = Vec::new();
        tree.visit_all_samples(|s| {
            rows.push((s.pid, s.tid, s.map.pid, s.map.start_addr, s.sample_count))
        });
        rows
    }

    #[test]
    fn test_ip_in_map() {
        let mut t = tree();
        t.add_sample(1, 1, 1, 0, 0);
        t.add_sample(1, 1, 5, 0, 0);
        t.add_sample(1, 1, 10, 0, 0);
        assert_eq!(rows(&mut t), vec![(1, 1, 1, 1, 3)]);
        assert_eq!(t.total_samples(), 3);
    }

    #[test]
    fn test_different_pid_tid_and_map() {
        let mut t = tree();
        t.add_sample(1, 1, 1, 0, 0);
        t.add_sample(2, 2, 1, 0, 0);
        t.add_sample(1, 11, 1, 0, 0);
        t.add_sample(1, 1, 11, 0, 0);
        assert_eq!(
            rows(&mut t),
            vec![
                (1, 1, 1, 1, 1),
                (1, 1, 1, 11, 1),
                (1, 11, 1, 1, 1),
                (2, 2, 2, 1, 1),
            ]
        );
    }

    #[test]
    fn test_unmapped_samples_share_unknown_map() {
        let mut t = tree();
        t.add_sample(1, 1, 0, 0, 0);
        t.add_sample(1, 1, 31, 0, 0);
        t.add_sample(1, 1, 70, 0, 0);
        assert_eq!(rows(&mut t), vec![(1, 1, 1, 0, 3)]);
    }

    #[test]
    fn test_kernel_map() {
        let mut t = tree();
        t.add_sample(1, 1, 11, 0, 0);
        t.add_sample(1, 1, 21, 0, 0);
        assert_eq!(
            rows(&mut t),
            vec![(1, 1, KERNEL_PID, 11, 1), (1, 1, 1, 11, 1)]
        );
    }

    #[test]
    fn test_rows_sorted_by_period() {
        let mut t = tree();
        t.add_sample(1, 1, 1, 0, 1);
        t.add_sample(2, 2, 1, 0, 10);
        t.add_sample(1, 1, 2, 0, 1);
        let periods: Vec<(i32, u64)> = {
            let mut v = Vec::new();
            t.visit_all_samples(|s| v.push((s.pid, s.period)));
            v
        };
        assert_eq!(periods, vec![(2, 10), (1, 2)]);
        assert_eq!(t.total_period(), 12);
    }

    #[test]
    fn test_call_chains_accumulate_per_row() {
        let mut t = SampleTree::new(compare_by(vec![SortKey::Pid]));
        let chain = |frames: &[&str]| frames.iter().map(|f| f.to_string()).collect::<Vec<_>>();
        t.add_call_chain_sample(1, 1, 5, 0, 3, &chain(&["main", "work"]));
        let index = t.add_call_chain_sample(1, 2, 7, 0, 4, &chain(&["main", "idle"]));
        assert_eq!(t.len(), 1);
        let mut seen = 0;
        t.visit_all_samples(|s| {
            seen += 1;
            assert_eq!(s.period, 7);
            assert_eq!(s.callchain.children_period, 7);
            assert_eq!(s.callchain.children[0].children[0].chain, vec!["idle".to_string()]);
        });
        assert_eq!(seen, 1);
        assert_eq!(index, 0);
    }

    #[test]
    fn test_sort_keys() {
        assert_eq!(SortKey::parse("dso"), Some(SortKey::Dso));
        assert_eq!(SortKey::parse("symbol"), None);
        let mut t = SampleTree::new(compare_by(vec![SortKey::Comm]));
        t.thread_tree_mut().add_thread(1, 1, "a");
        t.thread_tree_mut().add_thread(2, 2, "a");
        t.thread_tree_mut().add_thread(3, 3, "b");
        t.add_sample(1, 1, 0, 0, 1);
        t.add_sample(2, 2, 0, 0, 1);
        t.add_sample(3, 3, 0, 0, 1);
        assert_eq!(t.len(), 2);
    }
}
