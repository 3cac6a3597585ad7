// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Epoll-based reactor with cross-thread bottom-halves.
//!
//! One loop services one thread: fd callbacks and bottom-halves all run on
//! whichever thread calls [`EventLoop::run`], so consumers (virtqueue
//! commits in particular) get single-threaded access to their state without
//! locks.  Other threads communicate by scheduling a bottom-half, which is
//! kicked through an eventfd; signals are never used.
//!
//! [`EventLoop::run`] makes exactly one pass: wait, dispatch fd events,
//! then drain every pending bottom-half.  It returns [`LoopStatus::Again`]
//! until a [`EventLoop::terminate`] has been observed; bottom-halves
//! scheduled before the terminate are guaranteed to run before the final
//! [`LoopStatus::Done`].

use std::collections::{HashMap, VecDeque};
use std::io::{Error, Result};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{error, Logger};

bitflags! {
    /// Readiness reported to fd handlers.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct Events: u32 {
        const READABLE = libc::EPOLLIN as u32;
        const WRITABLE = libc::EPOLLOUT as u32;
        const ERROR = libc::EPOLLERR as u32;
        const HANGUP = libc::EPOLLHUP as u32;
    }
}

/// Result of one [`EventLoop::run`] pass.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoopStatus {
    /// More work is expected; call `run` again.
    Again,
    /// The loop has terminated gracefully.
    Done,
}

type FdHandler = Arc<Mutex<Box<dyn FnMut(Events) + Send>>>;
type BottomHalf = Box<dyn FnOnce() + Send>;

pub struct EventLoop {
    log: Logger,
    epfd: OwnedFd,
    wake: OwnedFd,
    handlers: Mutex<HashMap<RawFd, FdHandler>>,
    bh_queue: Mutex<VecDeque<BottomHalf>>,
    terminating: AtomicBool,
    done: AtomicBool,
}

impl EventLoop {
    pub fn new(log: Logger) -> Result<Arc<Self>> {
        let epfd = unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(Error::last_os_error());
            }
            OwnedFd::from_raw_fd(fd)
        };
        let wake = unsafe {
            let fd = libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK);
            if fd < 0 {
                return Err(Error::last_os_error());
            }
            OwnedFd::from_raw_fd(fd)
        };

        let this = Self {
            log,
            epfd,
            wake,
            handlers: Mutex::new(HashMap::new()),
            bh_queue: Mutex::new(VecDeque::new()),
            terminating: AtomicBool::new(false),
            done: AtomicBool::new(false),
        };
        this.epoll_add(this.wake.as_raw_fd(), Events::READABLE)?;
        Ok(Arc::new(this))
    }

    fn epoll_add(&self, fd: RawFd, interest: Events) -> Result<()> {
        let mut ev = libc::epoll_event { events: interest.bits(), u64: fd as u64 };
        let res = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fd,
                &mut ev,
            )
        };
        if res != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Register a callback for readiness events on `fd`.
    ///
    /// The caller retains ownership of the fd and must deregister it before
    /// closing.  The callback runs on the loop thread.
    pub fn register_fd(
        &self,
        fd: RawFd,
        interest: Events,
        handler: Box<dyn FnMut(Events) + Send>,
    ) -> Result<()> {
        self.epoll_add(fd, interest)?;
        self.handlers.lock().unwrap().insert(fd, Arc::new(Mutex::new(handler)));
        Ok(())
    }

    pub fn deregister_fd(&self, fd: RawFd) {
        unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            );
        }
        self.handlers.lock().unwrap().remove(&fd);
    }

    fn kick(&self) {
        let val: u64 = 1;
        let res = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // A full eventfd counter still leaves the loop signalled.
        if res < 0 {
            let err = Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                error!(self.log, "event loop wakeup failed"; "error" => %err);
            }
        }
    }

    fn drain_wake(&self) {
        let mut buf = 0u64;
        loop {
            let res = unsafe {
                libc::read(
                    self.wake.as_raw_fd(),
                    &mut buf as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if res <= 0 {
                break;
            }
        }
    }

    /// Schedule a one-shot closure on the loop thread.
    ///
    /// Safe from any thread.  Bottom-halves run in FIFO order, exactly
    /// once, during the bottom-half phase of a `run` pass.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        self.bh_queue.lock().unwrap().push_back(Box::new(f));
        self.kick();
    }

    /// Request graceful termination.  Idempotent.
    pub fn terminate(&self) {
        self.terminating.store(true, Ordering::Release);
        self.kick();
    }

    fn drain_bh(&self) {
        loop {
            let batch = std::mem::take(&mut *self.bh_queue.lock().unwrap());
            if batch.is_empty() {
                return;
            }
            for bh in batch {
                bh();
            }
        }
    }

    /// One pass of the loop: wait for events (up to `timeout`, or forever
    /// if `None`), dispatch fd callbacks, then drain all bottom-halves.
    pub fn run(&self, timeout: Option<Duration>) -> Result<LoopStatus> {
        if self.done.load(Ordering::Acquire) {
            return Ok(LoopStatus::Done);
        }

        const MAX_EVENTS: usize = 32;
        let mut events: [MaybeUninit<libc::epoll_event>; MAX_EVENTS] =
            [const { MaybeUninit::uninit() }; MAX_EVENTS];

        let timeout_ms = match timeout {
            None => -1,
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
        };

        let nev = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr() as *mut libc::epoll_event,
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        let nev = if nev < 0 {
            let err = Error::last_os_error();
            match err.raw_os_error() {
                // A stray signal just shortens this pass
                Some(libc::EINTR) => 0,
                _ => return Err(err),
            }
        } else {
            nev as usize
        };

        for slot in events[..nev].iter() {
            let ev = unsafe { slot.assume_init_read() };
            let fd = ev.u64 as RawFd;
            if fd == self.wake.as_raw_fd() {
                self.drain_wake();
                continue;
            }
            let handler = self.handlers.lock().unwrap().get(&fd).cloned();
            if let Some(handler) = handler {
                (handler.lock().unwrap())(Events::from_bits_truncate(ev.events));
            }
        }

        self.drain_bh();

        if self.terminating.load(Ordering::Acquire) {
            // Anything scheduled before the terminate must still run
            self.drain_bh();
            self.done.store(true, Ordering::Release);
            return Ok(LoopStatus::Done);
        }
        Ok(LoopStatus::Again)
    }
}
