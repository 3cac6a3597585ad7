// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hand-off between event-loop threads and a user-driven worker.
//!
//! Virtqueue dequeue callbacks (producers, on event-loop threads) enqueue
//! parsed requests; a single worker thread drains them by alternating
//! [`RequestQueue::run`] (which blocks) with [`RequestQueue::dequeue`]
//! (which never does).  Completion calls may come from any thread: the
//! commit is re-marshaled onto the originating virtqueue's event loop so
//! used-ring and inflight writes stay on the thread that owns the ring.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use slog::{debug, Logger};

use crate::block;
use crate::common::GuestRegion;
use crate::device::DeviceQueue;
use crate::mem::MemCtx;
use crate::virtio::Chain;

/// Result of a [`RequestQueue::run`] pass.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunStatus {
    /// Requests are pending; call [`RequestQueue::dequeue`] until empty.
    Again,
    /// The queue was stopped and has drained.
    Done,
}

struct RqInner<T> {
    queue: VecDeque<T>,
    stopping: bool,
}

/// MPSC request channel with a blocking worker side.
///
/// Producer enqueues never block beyond the uncontended mutex; the consumer
/// side never blocks except inside [`RequestQueue::run`].
pub struct RequestQueue<T> {
    log: Logger,
    inner: Mutex<RqInner<T>>,
    cv: Condvar,
}

impl<T: Send> RequestQueue<T> {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self {
            log,
            inner: Mutex::new(RqInner { queue: VecDeque::new(), stopping: false }),
            cv: Condvar::new(),
        })
    }

    /// Producer side.  After [`RequestQueue::stop`] the item is handed
    /// back for the caller to cancel.
    pub(crate) fn enqueue(&self, item: T) -> Result<(), T> {
        let mut guard = self.inner.lock().unwrap();
        if guard.stopping {
            return Err(item);
        }
        guard.queue.push_back(item);
        drop(guard);
        self.cv.notify_all();
        Ok(())
    }

    /// Block until requests are pending ([`RunStatus::Again`]) or the
    /// queue has been stopped and drained ([`RunStatus::Done`]).
    ///
    /// Requests already in the worker's hands when `stop` arrives are
    /// allowed to complete; queued ones are still handed out until empty.
    pub fn run(&self) -> RunStatus {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if !guard.queue.is_empty() {
                return RunStatus::Again;
            }
            if guard.stopping {
                return RunStatus::Done;
            }
            guard = self.cv.wait(guard).unwrap();
        }
    }

    /// Non-blocking consumer pop.
    pub fn dequeue(&self) -> Option<T> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    /// Wake the worker and let `run` report `Done` once the queue drains.
    pub fn stop(&self) {
        let mut guard = self.inner.lock().unwrap();
        if !guard.stopping {
            guard.stopping = true;
            debug!(self.log, "request queue stopping";
                "pending" => guard.queue.len());
        }
        drop(guard);
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopping
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}

/// The payload of one guest request.
pub enum RequestKind {
    /// A parsed block operation and its payload regions.
    Block { op: block::Operation, regions: Vec<GuestRegion> },
    /// A filesystem request: raw readable and writable buffer runs, in
    /// chain order.  Parsing the FUSE framing is the backend's business.
    Fs { read: Vec<GuestRegion>, write: Vec<GuestRegion> },
}

pub(crate) struct Completion {
    pub(crate) dq: Arc<DeviceQueue>,
    pub(crate) chain: Chain,
    pub(crate) mem: Arc<MemCtx>,
}

/// A guest request in flight between the queue engine and a backend.
///
/// The backend owns the `Bio` only for the duration of processing and must
/// finish it with [`Bio::complete`] (or [`Bio::complete_with_len`] for fs
/// requests that produced output).  Dropping an unfinished `Bio` completes
/// it as [`block::Result::Canceled`] so the guest is never left hanging.
pub struct Bio {
    kind: RequestKind,
    token: Option<Completion>,
}

impl Bio {
    pub(crate) fn new(
        kind: RequestKind,
        dq: Arc<DeviceQueue>,
        chain: Chain,
        mem: Arc<MemCtx>,
    ) -> Self {
        Self { kind, token: Some(Completion { dq, chain, mem }) }
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// The guest memory snapshot pinned when this request was dequeued.
    /// Translations through it stay valid until the completion commits.
    pub fn mem(&self) -> &MemCtx {
        &self.token.as_ref().expect("bio not yet completed").mem
    }

    /// Finish the request.  Callable from any thread; the used-ring commit
    /// happens on the originating queue's event loop.
    pub fn complete(mut self, res: block::Result) {
        self.finish(res, None);
    }

    /// Finish with an explicit used-ring length (bytes written into the
    /// chain's writable buffers).
    pub fn complete_with_len(mut self, res: block::Result, len: u32) {
        self.finish(res, Some(len));
    }

    fn finish(&mut self, res: block::Result, len: Option<u32>) {
        if let Some(tok) = self.token.take() {
            tok.dq.complete_bio(tok.chain, tok.mem, res, len);
        }
    }
}

impl Drop for Bio {
    fn drop(&mut self) {
        if self.token.is_some() {
            self.finish(block::Result::Canceled, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::testutil::test_logger;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn produce_then_consume() {
        let rq = RequestQueue::<u32>::new(test_logger());
        assert!(rq.enqueue(1).is_ok());
        assert!(rq.enqueue(2).is_ok());

        assert_eq!(rq.run(), RunStatus::Again);
        assert_eq!(rq.dequeue(), Some(1));
        assert_eq!(rq.dequeue(), Some(2));
        assert_eq!(rq.dequeue(), None);
    }

    #[test]
    fn run_blocks_until_producer_arrives() {
        let rq = RequestQueue::<u32>::new(test_logger());

        let producer = {
            let rq = rq.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                rq.enqueue(7).unwrap();
            })
        };

        assert_eq!(rq.run(), RunStatus::Again);
        assert_eq!(rq.dequeue(), Some(7));
        producer.join().unwrap();
    }

    #[test]
    fn stop_drains_before_done() {
        let rq = RequestQueue::<u32>::new(test_logger());
        rq.enqueue(1).unwrap();
        rq.enqueue(2).unwrap();
        rq.stop();

        // Queued requests are still handed out after stop
        assert_eq!(rq.run(), RunStatus::Again);
        assert_eq!(rq.dequeue(), Some(1));
        assert_eq!(rq.run(), RunStatus::Again);
        assert_eq!(rq.dequeue(), Some(2));

        assert_eq!(rq.run(), RunStatus::Done);
    }

    #[test]
    fn enqueue_after_stop_is_refused() {
        let rq = RequestQueue::<u32>::new(test_logger());
        rq.stop();
        assert_eq!(rq.enqueue(9), Err(9));
        assert_eq!(rq.run(), RunStatus::Done);
    }

    #[test]
    fn stop_wakes_blocked_worker() {
        let rq = RequestQueue::<u32>::new(test_logger());
        let worker = {
            let rq = rq.clone();
            thread::spawn(move || rq.run())
        };
        thread::sleep(Duration::from_millis(50));
        rq.stop();
        assert_eq!(worker.join().unwrap(), RunStatus::Done);
    }
}
