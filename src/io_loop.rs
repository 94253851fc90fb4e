//! Single-threaded event loop over readable descriptors, signals and
//! periodic timers, built directly on poll(2).
//!
//! Every callback receives the loop itself, so it can register or remove
//! events and call [`IOEventLoop::exit_loop`] while it runs. A callback
//! returning `false` aborts the loop and [`IOEventLoop::run_loop`] reports
//! failure.

use crate::error::{Error, Result};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

pub type EventCallback = Box<dyn FnMut(&mut IOEventLoop) -> bool>;

/// Handle returned when an event is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventHandle(u64);

enum Source {
    Read(RawFd),
    Signal(SignalFd),
    Periodic { interval: Duration, deadline: Instant },
}

struct Event {
    source: Source,
    // Taken out while the callback runs.
    callback: Option<EventCallback>,
}

pub struct IOEventLoop {
    events: BTreeMap<EventHandle, Event>,
    next_handle: u64,
    exit_requested: bool,
    has_error: bool,
    saved_sigmask: Option<SigSet>,
}

impl Default for IOEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl IOEventLoop {
    pub fn new() -> Self {
        IOEventLoop {
            events: BTreeMap::new(),
            next_handle: 0,
            exit_requested: false,
            has_error: false,
            saved_sigmask: None,
        }
    }

    fn insert(&mut self, source: Source, callback: EventCallback) -> EventHandle {
        let handle = EventHandle(self.next_handle);
        self.next_handle += 1;
        self.events.insert(
            handle,
            Event {
                source,
                callback: Some(callback),
            },
        );
        handle
    }

    /// Call `callback` whenever `fd` becomes readable. The callback should
    /// consume what it needs; it is invoked again on the next poll if data
    /// remains.
    pub fn add_read_event(
        &mut self,
        fd: RawFd,
        callback: impl FnMut(&mut IOEventLoop) -> bool + 'static,
    ) -> Result<EventHandle> {
        if fd < 0 {
            return Err(Error::InvalidArgument(format!("invalid fd {fd}")));
        }
        Ok(self.insert(Source::Read(fd), Box::new(callback)))
    }

    /// Deliver `signal` to `callback` inside the loop instead of in signal
    /// context. The signal is blocked for the calling thread until the loop
    /// is dropped.
    pub fn add_signal_event(
        &mut self,
        signal: Signal,
        callback: impl FnMut(&mut IOEventLoop) -> bool + 'static,
    ) -> Result<EventHandle> {
        let mut mask = SigSet::empty();
        mask.add(signal);
        let mut old = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut old))?;
        if self.saved_sigmask.is_none() {
            self.saved_sigmask = Some(old);
        }
        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
        Ok(self.insert(Source::Signal(fd), Box::new(callback)))
    }

    pub fn add_signal_events<F>(&mut self, signals: &[Signal], callback: F) -> Result<()>
    where
        F: FnMut(&mut IOEventLoop) -> bool + Clone + 'static,
    {
        for &signal in signals {
            self.add_signal_event(signal, callback.clone())?;
        }
        Ok(())
    }

    /// Call `callback` every `interval`, starting one interval from now.
    pub fn add_periodic_event(
        &mut self,
        interval: Duration,
        callback: impl FnMut(&mut IOEventLoop) -> bool + 'static,
    ) -> Result<EventHandle> {
        if interval.is_zero() {
            return Err(Error::InvalidArgument(
                "periodic interval must be non-zero".to_string(),
            ));
        }
        let source = Source::Periodic {
            interval,
            deadline: Instant::now() + interval,
        };
        Ok(self.insert(source, Box::new(callback)))
    }

    /// Remove an event. Removing the event whose callback is running is
    /// allowed; it will not be dispatched again.
    pub fn del_event(&mut self, handle: EventHandle) -> bool {
        self.events.remove(&handle).is_some()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Stop dispatching after the current callback returns.
    pub fn exit_loop(&mut self) {
        self.exit_requested = true;
    }

    /// Run until a callback calls [`exit_loop`](Self::exit_loop), a
    /// callback fails, or no events remain. Returns `Ok(false)` if a
    /// callback reported failure.
    pub fn run_loop(&mut self) -> Result<bool> {
        self.exit_requested = false;
        self.has_error = false;
        while !self.exit_requested {
            if self.events.is_empty() {
                log::debug!("event loop has no events left");
                break;
            }
            let (mut pollfds, handles) = self.poll_set();
            let timeout = self.poll_timeout();
            // SAFETY: pollfds is a valid, exclusively borrowed array of the given length.
            let ret = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout,
                )
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            for (pfd, handle) in pollfds.iter().zip(handles) {
                if self.exit_requested {
                    break;
                }
                if pfd.revents & libc::POLLIN != 0 {
                    self.dispatch_ready(handle);
                } else if pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                    log::debug!("fd {} hung up, removing it from the loop", pfd.fd);
                    self.events.remove(&handle);
                }
            }
            if !self.exit_requested {
                self.dispatch_timers();
            }
        }
        Ok(!self.has_error)
    }

    fn poll_set(&self) -> (Vec<libc::pollfd>, Vec<EventHandle>) {
        let mut pollfds = Vec::new();
        let mut handles = Vec::new();
        for (&handle, event) in &self.events {
            let fd = match &event.source {
                Source::Read(fd) => *fd,
                Source::Signal(sfd) => sfd.as_raw_fd(),
                Source::Periodic { .. } => continue,
            };
            pollfds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
            handles.push(handle);
        }
        (pollfds, handles)
    }

    /// Milliseconds until the earliest timer, rounded up, or -1 for none.
    fn poll_timeout(&self) -> libc::c_int {
        let now = Instant::now();
        self.events
            .values()
            .filter_map(|e| match e.source {
                Source::Periodic { deadline, .. } => Some(deadline.saturating_duration_since(now)),
                _ => None,
            })
            .min()
            .map_or(-1, |d| {
                let ms = d.as_nanos().div_ceil(1_000_000);
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            })
    }

    fn dispatch_ready(&mut self, handle: EventHandle) {
        let times = match self.events.get_mut(&handle) {
            Some(Event {
                source: Source::Signal(sfd),
                ..
            }) => {
                let mut n = 0;
                while let Ok(Some(_)) = sfd.read_signal() {
                    n += 1;
                }
                n
            }
            Some(_) => 1,
            None => 0,
        };
        for _ in 0..times {
            if self.exit_requested || !self.dispatch(handle) {
                break;
            }
        }
    }

    fn dispatch_timers(&mut self) {
        let now = Instant::now();
        let due: Vec<EventHandle> = self
            .events
            .iter()
            .filter(|(_, e)| matches!(e.source, Source::Periodic { deadline, .. } if deadline <= now))
            .map(|(&h, _)| h)
            .collect();
        for handle in due {
            if self.exit_requested {
                break;
            }
            if let Some(Event {
                source: Source::Periodic { interval, deadline },
                ..
            }) = self.events.get_mut(&handle)
            {
                *deadline += *interval;
                if *deadline <= now {
                    *deadline = now + *interval;
                }
            }
            self.dispatch(handle);
        }
    }

    /// Run one callback. Returns false if the event is gone or the loop
    /// should stop.
    fn dispatch(&mut self, handle: EventHandle) -> bool {
        let Some(mut callback) = self.events.get_mut(&handle).and_then(|e| e.callback.take())
        else {
            return false;
        };
        let ok = callback(self);
        if let Some(event) = self.events.get_mut(&handle) {
            event.callback = Some(callback);
        }
        if !ok {
            self.has_error = true;
            self.exit_requested = true;
        }
        ok && self.events.contains_key(&handle)
    }
}

impl Drop for IOEventLoop {
    fn drop(&mut self) {
        self.events.clear();
        if let Some(mask) = self.saved_sigmask.take()
            && let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)
        {
            log::warn!("failed to restore signal mask: {e}");
        }
    }
}
