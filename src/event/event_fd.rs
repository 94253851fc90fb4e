//! Kernel event descriptors and their memory-mapped ring buffers.
//!
//! [`EventBackend`] and [`EventFile`] are the seam between the selection
//! set and the kernel: [`KernelBackend`] talks to `perf_event_open(2)`,
//! tests substitute an in-memory implementation.

use crate::environment;
use crate::error::{Error, Result};
use crate::perf::*;
use crate::record::ReadValues;
use libc::{c_int, c_ulong, pid_t, syscall, SYS_perf_event_open};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{fence, Ordering};

/// One counter reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterValue {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub id: u64,
}

impl CounterValue {
    /// Accumulate a reading taken from another descriptor of the same event.
    pub fn add(&mut self, other: &CounterValue) {
        self.value += other.value;
        self.time_enabled += other.time_enabled;
        self.time_running += other.time_running;
    }
}

/// An open descriptor for one (event, thread, cpu).
pub trait EventFile {
    /// Kernel-assigned id, as found in sample `ID`/`IDENTIFIER` fields.
    fn id(&self) -> u64;
    fn tid(&self) -> i32;
    fn cpu(&self) -> u32;
    /// Descriptor to poll for "data available" on the buffer it owns.
    fn raw_fd(&self) -> RawFd;
    fn enable(&self) -> Result<()>;
    fn disable(&self) -> Result<()>;
    fn read_counter(&self) -> Result<CounterValue>;
    /// Map a ring buffer of `pages` data pages owned by this descriptor.
    fn create_mapped_buffer(&mut self, pages: usize) -> Result<()>;
    /// Redirect this descriptor's records into the buffer owned by the
    /// descriptor `owner_fd` on the same cpu.
    fn share_mapped_buffer(&mut self, owner_fd: RawFd) -> Result<()>;
    fn destroy_mapped_buffer(&mut self);
    fn has_mapped_buffer(&self) -> bool;
    /// Append whatever the kernel has published since the last call to
    /// `out` and hand the space back to the kernel. Returns the byte count.
    fn read_mapped_data(&mut self, out: &mut Vec<u8>) -> Result<usize>;
}

/// Opens descriptors and answers kernel-support questions.
pub trait EventBackend {
    fn open(
        &self,
        attr: &PerfEventAttr,
        tid: i32,
        cpu: u32,
        group_leader: Option<&dyn EventFile>,
    ) -> Result<Box<dyn EventFile>>;

    /// Whether the kernel accepts `attr` at all, probed on the current process.
    fn is_supported(&self, attr: &PerfEventAttr) -> bool;

    fn online_cpus(&self) -> Result<Vec<u32>>;
}

fn perf_event_open(
    attr: &PerfEventAttr,
    pid: pid_t,
    cpu: c_int,
    group_fd: c_int,
) -> std::io::Result<OwnedFd> {
    // SAFETY: attr points to a valid perf_event_attr whose size field
    // matches the struct.
    let fd = unsafe {
        syscall(
            SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: the syscall returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as c_int) })
}

fn ioctl(fd: RawFd, request: c_ulong, arg: c_ulong) -> Result<()> {
    // SAFETY: perf ioctls take an integer argument and do not touch user memory.
    let ret = unsafe { libc::ioctl(fd, request as _, arg) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

struct MappedBuffer {
    base: *mut u8,
    mmap_size: usize,
    data_offset: usize,
    data_size: usize,
}

impl MappedBuffer {
    fn map(fd: RawFd, pages: usize) -> Result<Self> {
        if !pages.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "mmap page count {pages} is not a power of two"
            )));
        }
        let page_size = environment::page_size();
        let mmap_size = (1 + pages) * page_size;
        // SAFETY: mapping a perf fd with a length of 1 + 2^n pages, as the
        // kernel requires.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        let base = base as *mut u8;
        // SAFETY: the first page of the mapping is the control page.
        let page = unsafe { &*(base as *const PerfEventMmapPage) };
        // Kernels before 4.1 leave data_offset/data_size zero.
        let (data_offset, data_size) = if page.data_offset != 0 && page.data_size != 0 {
            (page.data_offset as usize, page.data_size as usize)
        } else {
            (page_size, pages * page_size)
        };
        Ok(MappedBuffer {
            base,
            mmap_size,
            data_offset,
            data_size,
        })
    }

    fn control(&self) -> *mut PerfEventMmapPage {
        self.base as *mut PerfEventMmapPage
    }

    fn read(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let control = self.control();
        // SAFETY: control points into our live mapping; head is written by
        // the kernel, so read it volatile.
        let head = unsafe { ptr::read_volatile(ptr::addr_of!((*control).data_head)) };
        // Pairs with the kernel's barrier before it publishes data_head.
        fence(Ordering::Acquire);
        // SAFETY: as above; only we write data_tail.
        let tail = unsafe { ptr::read_volatile(ptr::addr_of!((*control).data_tail)) };
        let available = head.wrapping_sub(tail) as usize;
        if available == 0 {
            return Ok(0);
        }
        if available > self.data_size {
            return Err(Error::corrupt(format!(
                "ring buffer reports {} bytes available in a {} byte buffer",
                available, self.data_size
            )));
        }
        let start = (tail % self.data_size as u64) as usize;
        let first = available.min(self.data_size - start);
        // SAFETY: both ranges lie within the data area of the mapping.
        unsafe {
            let data = self.base.add(self.data_offset);
            out.extend_from_slice(std::slice::from_raw_parts(data.add(start), first));
            out.extend_from_slice(std::slice::from_raw_parts(data, available - first));
        }
        // Finish reading the data before handing the space back.
        fence(Ordering::SeqCst);
        // SAFETY: data_tail is ours to write.
        unsafe {
            ptr::write_volatile(ptr::addr_of_mut!((*control).data_tail), head);
        }
        Ok(available)
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        // SAFETY: base/mmap_size came from a successful mmap.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mmap_size);
        }
    }
}

/// A descriptor returned by `perf_event_open`.
pub struct PerfEventFile {
    fd: OwnedFd,
    id: u64,
    tid: i32,
    cpu: u32,
    read_format: u64,
    buffer: Option<MappedBuffer>,
}

impl PerfEventFile {
    pub fn open(
        attr: &PerfEventAttr,
        tid: i32,
        cpu: u32,
        group_leader: Option<&dyn EventFile>,
    ) -> Result<Self> {
        if attr.read_format & PERF_FORMAT_ID == 0 {
            return Err(Error::InvalidArgument(
                "event attrs must request PERF_FORMAT_ID".to_string(),
            ));
        }
        let group_fd = group_leader.map_or(-1, |l| l.raw_fd());
        let fd = perf_event_open(attr, tid, cpu as c_int, group_fd).map_err(|e| {
            match e.raw_os_error() {
                Some(libc::EACCES) | Some(libc::EPERM) => Error::PermissionDenied(format!(
                    "perf_event_open for tid {tid} cpu {cpu}: {e}. Try: sudo sysctl kernel.perf_event_paranoid=-1"
                )),
                _ => Error::EventOpen(format!("tid {tid} cpu {cpu}: {e}")),
            }
        })?;
        let mut file = PerfEventFile {
            fd,
            id: 0,
            tid,
            cpu,
            read_format: attr.read_format,
            buffer: None,
        };
        // For a group member read(2) reports the member's own value and id.
        file.id = file.read_counter()?.id;
        Ok(file)
    }
}

impl EventFile for PerfEventFile {
    fn id(&self) -> u64 {
        self.id
    }

    fn tid(&self) -> i32 {
        self.tid
    }

    fn cpu(&self) -> u32 {
        self.cpu
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn enable(&self) -> Result<()> {
        ioctl(self.raw_fd(), PERF_EVENT_IOC_ENABLE, 0)
    }

    fn disable(&self) -> Result<()> {
        ioctl(self.raw_fd(), PERF_EVENT_IOC_DISABLE, 0)
    }

    fn read_counter(&self) -> Result<CounterValue> {
        let mut buf = [0u8; 64];
        let n = nix::unistd::read(self.raw_fd(), &mut buf)?;
        let values = ReadValues::from_bytes(self.read_format & !PERF_FORMAT_GROUP, &buf[..n])?;
        let (value, id) = values.values.first().copied().unwrap_or_default();
        Ok(CounterValue {
            value,
            time_enabled: values.time_enabled,
            time_running: values.time_running,
            id,
        })
    }

    fn create_mapped_buffer(&mut self, pages: usize) -> Result<()> {
        self.buffer = Some(MappedBuffer::map(self.raw_fd(), pages)?);
        Ok(())
    }

    fn share_mapped_buffer(&mut self, owner_fd: RawFd) -> Result<()> {
        ioctl(self.raw_fd(), PERF_EVENT_IOC_SET_OUTPUT, owner_fd as c_ulong)
    }

    fn destroy_mapped_buffer(&mut self) {
        self.buffer = None;
    }

    fn has_mapped_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    fn read_mapped_data(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.read(out),
            None => Ok(0),
        }
    }
}

/// The real kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelBackend;

impl EventBackend for KernelBackend {
    fn open(
        &self,
        attr: &PerfEventAttr,
        tid: i32,
        cpu: u32,
        group_leader: Option<&dyn EventFile>,
    ) -> Result<Box<dyn EventFile>> {
        Ok(Box::new(PerfEventFile::open(attr, tid, cpu, group_leader)?))
    }

    fn is_supported(&self, attr: &PerfEventAttr) -> bool {
        let mut probe = attr.clone();
        probe.set_disabled(true);
        probe.set_enable_on_exec(false);
        probe.set_inherit(false);
        match perf_event_open(&probe, 0, -1, -1) {
            Ok(_) => true,
            Err(e) => {
                log::debug!("kernel rejected probe attr (type {}, config {}): {e}", attr.type_, attr.config);
                false
            }
        }
    }

    fn online_cpus(&self) -> Result<Vec<u32>> {
        environment::online_cpus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_type::{create_default_attr, find_event_type};

    #[test]
    fn test_counter_add() {
        let mut total = CounterValue {
            value: 10,
            time_enabled: 5,
            time_running: 4,
            id: 1,
        };
        total.add(&CounterValue {
            value: 3,
            time_enabled: 2,
            time_running: 2,
            id: 9,
        });
        assert_eq!((total.value, total.time_enabled, total.time_running, total.id), (13, 7, 6, 1));
    }

    #[test]
    fn test_reject_bad_page_count() {
        assert!(MappedBuffer::map(-1, 3).is_err());
    }

    // Needs perf_event_paranoid <= 1 or CAP_PERFMON, so it is skipped when
    // the kernel refuses.
    #[test]
    fn test_open_task_clock_for_self() {
        let mut attr = create_default_attr(&find_event_type("task-clock").unwrap());
        attr.set_exclude_kernel(true);
        attr.set_exclude_hv(true);
        let backend = KernelBackend;
        if !backend.is_supported(&attr) {
            return;
        }
        let tid = nix::unistd::gettid().as_raw();
        let cpus = backend.online_cpus().unwrap();
        let Ok(mut file) = backend.open(&attr, tid, cpus[0], None) else {
            return;
        };
        assert_ne!(file.id(), 0);
        file.create_mapped_buffer(8).unwrap();
        assert!(file.has_mapped_buffer());
        let mut out = Vec::new();
        file.read_mapped_data(&mut out).unwrap();
        file.enable().unwrap();
        file.disable().unwrap();
        let counter = file.read_counter().unwrap();
        assert_eq!(counter.id, file.id());
    }
}
