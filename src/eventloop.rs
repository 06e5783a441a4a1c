//! Event loop and poll-FD registry
//!
//! One iteration of the event loop waits on the backend's registered file
//! descriptors, bounded by the nearer of the caller's timeout and the next
//! transfer deadline. Readiness is handed to the backend, which reports
//! terminal transfers back through the context helpers; expired deadlines
//! are swept into asynchronous cancellations afterwards. The engine assumes
//! a single event-loop driver at a time and rejects a second concurrent
//! driver with [`Error::Busy`].

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, trace, warn};

use crate::context::Context;
use crate::scheduler::FlyingTransfers;
use crate::{Error, Result};

bitflags! {
    /// Readiness conditions a backend wants watched on a file descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

impl PollEvents {
    fn as_poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.contains(PollEvents::READABLE) {
            flags |= PollFlags::POLLIN;
        }
        if self.contains(PollEvents::WRITABLE) {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

/// A file descriptor the event loop multiplexes, with its event mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pollfd {
    pub fd: RawFd,
    pub events: PollEvents,
}

/// Observer callbacks fired whenever the watched descriptor set changes, so
/// embedders integrating the engine into their own loop can stay in sync.
#[derive(Default)]
pub(crate) struct PollfdNotifiers {
    added: Option<Box<dyn Fn(RawFd, PollEvents) + Send>>,
    removed: Option<Box<dyn Fn(RawFd) + Send>>,
}

/// Event-loop state: the in-flight transfer ordering and the watched
/// descriptor set. Guarded by one lock that is never held across backend
/// calls or user callbacks.
pub(crate) struct IoState {
    pub(crate) flying: FlyingTransfers,
    pollfds: Vec<Pollfd>,
}

impl IoState {
    pub(crate) fn new() -> IoState {
        IoState {
            flying: FlyingTransfers::new(),
            pollfds: Vec::new(),
        }
    }
}

/// Clears the concurrent-driver flag when an event-loop pass ends.
struct DriverGuard<'a>(&'a AtomicBool);

impl<'a> DriverGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<DriverGuard<'a>> {
        if flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }
        Ok(DriverGuard(flag))
    }
}

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Context {
    /// Run one event-loop iteration with a default 2-second timeout.
    pub fn poll(&self) -> Result<()> {
        self.poll_timeout(Duration::from_secs(2))
    }

    /// Run one event-loop iteration, waiting at most `timeout` for file
    /// descriptor readiness or the next transfer deadline.
    ///
    /// Returns without error on timeouts and interrupted system calls.
    /// Returns [`Error::Busy`] if another thread is already driving the
    /// event loop.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<()> {
        let _driver = DriverGuard::acquire(&self.inner.polling)?;

        let wait = match self.get_next_timeout() {
            Some(next) if next.is_zero() => {
                debug!("next timeout already expired");
                return self.sweep_timeouts();
            }
            Some(next) => next.min(timeout),
            None => timeout,
        };

        let watched: Vec<Pollfd> = self.inner.io.lock().unwrap().pollfds.clone();
        let mut fds: Vec<PollFd> = watched
            .iter()
            // SAFETY: the backend guarantees each registered fd stays open
            // until it calls remove_pollfd, which cannot happen while this
            // event-loop pass holds the driver guard.
            .map(|p| PollFd::new(unsafe { BorrowedFd::borrow_raw(p.fd) }, p.events.as_poll_flags()))
            .collect();

        trace!("poll() with timeout {:?}", wait);
        let ready = match poll(
            &mut fds,
            PollTimeout::try_from(wait).unwrap_or(PollTimeout::MAX),
        ) {
            Ok(0) => return self.sweep_timeouts(),
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => {
                error!("poll failed: {}", e);
                return Err(e.into());
            }
        };
        trace!("poll() reported {} ready fds", ready);

        let mut readable = Vec::new();
        let mut writable = Vec::new();
        for (pollfd, entry) in fds.iter().zip(&watched) {
            let revents = pollfd.revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP) {
                readable.push(entry.fd);
            }
            if revents.contains(PollFlags::POLLOUT) {
                writable.push(entry.fd);
            }
        }
        drop(fds);

        self.backend().handle_events(self, &readable, &writable)?;
        self.sweep_timeouts()
    }

    /// Time until the nearest transfer deadline, clamped at zero when it has
    /// already passed. `None` when nothing in flight can time out.
    ///
    /// Embedders driving their own loop combine this with
    /// [`Context::get_pollfds`] to bound their wait.
    pub fn get_next_timeout(&self) -> Option<Duration> {
        let io = self.inner.io.lock().unwrap();
        if io.flying.is_empty() {
            return None;
        }
        let next = io.flying.next_deadline()?;
        Some(next.saturating_duration_since(Instant::now()))
    }

    /// Latch every expired deadline and issue an asynchronous cancel for it.
    /// The timeout is reported to the user when the cancellation completes,
    /// which keeps completion single-path even if the kernel finishes the
    /// transfer concurrently with the cancel.
    pub(crate) fn sweep_timeouts(&self) -> Result<()> {
        let expired = {
            let mut io = self.inner.io.lock().unwrap();
            io.flying.expire(Instant::now())
        };

        for transfer in expired {
            if let Err(e) = self.cancel_transfer(&transfer) {
                warn!("async cancel failed: {}", e);
            }
        }
        Ok(())
    }

    // ---- poll-FD registry ------------------------------------------------

    /// Snapshot of the file descriptors the engine currently needs watched.
    pub fn get_pollfds(&self) -> Vec<Pollfd> {
        self.inner.io.lock().unwrap().pollfds.clone()
    }

    /// Install observer callbacks invoked whenever a descriptor is added to
    /// or removed from the watched set. Either may be `None` to uninstall.
    pub fn set_pollfd_notifiers(
        &self,
        added: Option<Box<dyn Fn(RawFd, PollEvents) + Send>>,
        removed: Option<Box<dyn Fn(RawFd) + Send>>,
    ) {
        let mut notifiers = self.inner.notifiers.lock().unwrap();
        notifiers.added = added;
        notifiers.removed = removed;
    }

    /// Register a file descriptor for the event loop to watch. Called by
    /// backends.
    pub fn add_pollfd(&self, fd: RawFd, events: PollEvents) {
        debug!("add fd {} events {:?}", fd, events);
        self.inner.io.lock().unwrap().pollfds.push(Pollfd { fd, events });

        let notifiers = self.inner.notifiers.lock().unwrap();
        if let Some(added) = &notifiers.added {
            added(fd, events);
        }
    }

    /// Remove a previously registered file descriptor. Called by backends.
    pub fn remove_pollfd(&self, fd: RawFd) {
        debug!("remove fd {}", fd);
        let found = {
            let mut io = self.inner.io.lock().unwrap();
            match io.pollfds.iter().position(|p| p.fd == fd) {
                Some(idx) => {
                    io.pollfds.remove(idx);
                    true
                }
                None => false,
            }
        };

        if !found {
            error!("couldn't find fd {} to remove", fd);
            return;
        }

        let notifiers = self.inner.notifiers.lock().unwrap();
        if let Some(removed) = &notifiers.removed {
            removed(fd);
        }
    }
}
