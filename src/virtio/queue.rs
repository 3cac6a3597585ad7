// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Split virtqueue engine: descriptor chain walking and the avail/used
//! publish-consume protocol.
//!
//! A [`VirtQueue`] owns the device-side shadow state for one ring.  The
//! guest driver appends head indices to the avail ring; [`VirtQueue::pop_avail`]
//! walks the referenced descriptor chain into a [`Chain`] of validated
//! buffers.  Completions go back through [`VirtQueue::push_used`], which is
//! also the crash-recovery seam: the used ring publish and the inflight
//! table update are ordered so that a crash between them is repairable on
//! the next [`VirtQueue::attach`].
//!
//! Every protocol violation a (buggy or hostile) driver can produce marks
//! the queue broken.  The broken state is sticky: no further avail entries
//! are consumed and every subsequent operation fails.

use std::collections::VecDeque;
use std::mem::size_of;
use std::num::Wrapping;
use std::ops::ControlFlow;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use slog::{debug, error, info, warn, Logger};
use zerocopy::{FromBytes, FromZeroes};

use super::bits::*;
use super::inflight::InflightRegion;
use crate::common::{GuestAddr, GuestRegion};
use crate::mem::MemCtx;

#[usdt::provider(provider = "vhostd")]
mod probes {
    fn virtq_pop(qid: u16, head: u16, counter: u64) {}
    fn virtq_replay(qid: u16, head: u16, counter: u64) {}
    fn virtq_push(qid: u16, head: u16, len: u32) {}
    fn virtq_broken(qid: u16) {}
}

#[repr(C)]
#[derive(Copy, Clone, FromZeroes, FromBytes)]
struct RawDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, FromZeroes, FromBytes)]
struct RawUsed {
    id: u32,
    len: u32,
}

bitflags! {
    #[derive(Debug, Copy, Clone, Default)]
    pub struct DescFlag: u16 {
        const NEXT = VIRTQ_DESC_F_NEXT;
        const WRITE = VIRTQ_DESC_F_WRITE;
        const INDIRECT = VIRTQ_DESC_F_INDIRECT;
    }
}

/// Errors raised by virtqueue processing.
///
/// Everything except [`QueueError::Broken`] itself describes the violation
/// which broke the queue; `Broken` is what all subsequent operations report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("virtqueue is broken")]
    Broken,
    #[error("virtqueue is not attached to rings")]
    NotAttached,
    #[error("ring structure does not translate to mapped guest memory")]
    BadRingAddress,
    #[error("inflight region sized for {found} descriptors, queue has {expected}")]
    InflightMismatch { expected: u16, found: u64 },
    #[error("inflight used_idx {saved} cannot be reconciled with ring used_idx {ring}")]
    InflightCorrupt { ring: u16, saved: u16 },
    #[error("avail ring advanced by {count} slots, more than the queue size")]
    AvailOutOfRange { count: u16 },
    #[error("descriptor index {idx} out of bounds")]
    DescIndexOutOfBounds { idx: u16 },
    #[error("descriptor chain does not terminate within the queue size")]
    ChainTooLong,
    #[error("descriptor has both NEXT and INDIRECT set")]
    IndirectWithNext,
    #[error("indirect table length {len} is not a positive multiple of the descriptor size")]
    BadIndirectLen { len: u32 },
    #[error("indirect table contains an INDIRECT descriptor")]
    NestedIndirect,
    #[error("read-only descriptor follows a write-only descriptor")]
    OrderViolation,
    #[error("guest range {addr:?}+{len:#x} does not translate")]
    TranslationFault { addr: GuestAddr, len: usize },
}

/// One guest buffer emitted by the chain walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChainBuf {
    Readable(GuestAddr, u32),
    Writable(GuestAddr, u32),
}

impl ChainBuf {
    pub fn is_readable(&self) -> bool {
        matches!(self, ChainBuf::Readable(..))
    }

    pub fn is_writable(&self) -> bool {
        !self.is_readable()
    }

    pub fn region(&self) -> GuestRegion {
        match self {
            ChainBuf::Readable(addr, len) | ChainBuf::Writable(addr, len) => {
                GuestRegion(*addr, *len as usize)
            }
        }
    }
}

/// An ordered buffer vector walked out of one descriptor chain.
///
/// All read-only buffers precede all write-only buffers (the walk enforces
/// this).  Consumption is tracked as two queues of not-yet-used byte
/// ranges, one per direction: peeling off a request header, handing payload
/// regions to a backend, and dropping a status byte at the tail all just
/// shorten the front of the matching queue, so callers never mind buffer
/// boundaries.
#[derive(Debug)]
pub struct Chain {
    idx: Option<u16>,
    bufs: Vec<ChainBuf>,
    /// Readable bytes not yet consumed, in chain order
    read_left: VecDeque<GuestRegion>,
    /// Writable bytes not yet consumed, in chain order
    write_left: VecDeque<GuestRegion>,
    read_avail: usize,
    write_avail: usize,
    write_total: usize,
}

impl Chain {
    pub fn with_capacity(size: usize) -> Self {
        assert!(size <= u16::MAX as usize);
        Self {
            idx: None,
            bufs: Vec::with_capacity(size),
            read_left: VecDeque::new(),
            write_left: VecDeque::new(),
            read_avail: 0,
            write_avail: 0,
            write_total: 0,
        }
    }

    /// The head descriptor index, identifying this chain until it is pushed
    /// to the used ring.
    pub fn head(&self) -> Option<u16> {
        self.idx
    }

    pub fn bufs(&self) -> &[ChainBuf] {
        &self.bufs
    }

    fn push_buf(&mut self, buf: ChainBuf) {
        let GuestRegion(addr, len) = buf.region();
        // Empty buffers stay in the record but never enter a queue
        if len != 0 {
            if buf.is_writable() {
                self.write_left.push_back(GuestRegion(addr, len));
                self.write_avail += len;
                self.write_total += len;
            } else {
                self.read_left.push_back(GuestRegion(addr, len));
                self.read_avail += len;
            }
        }
        self.bufs.push(buf);
    }

    fn reset(&mut self) {
        self.idx = None;
        self.bufs.clear();
        self.read_left.clear();
        self.write_left.clear();
        self.read_avail = 0;
        self.write_avail = 0;
        self.write_total = 0;
    }

    fn take_head(&mut self) -> Option<u16> {
        self.idx.take()
    }

    /// Detach the first `len` bytes of `queue` as a region list, splitting
    /// the straddling range if needed.  The caller has already checked
    /// that `len` bytes remain.
    fn split_front(
        queue: &mut VecDeque<GuestRegion>,
        len: usize,
    ) -> Vec<GuestRegion> {
        let mut taken = Vec::new();
        let mut need = len;
        while need > 0 {
            let front = queue
                .front_mut()
                .expect("availability was checked before consuming");
            if front.1 > need {
                taken.push(GuestRegion(front.0, need));
                front.0 = front.0 + need;
                front.1 -= need;
                break;
            }
            need -= front.1;
            taken.push(queue.pop_front().unwrap());
        }
        taken
    }

    /// Copy a `T` out of the readable portion of the chain, advancing the
    /// read position.
    pub fn read<T: Copy>(&mut self, item: &mut T, mem: &MemCtx) -> bool {
        let item_sz = size_of::<T>();
        if self.read_avail < item_sz {
            return false;
        }
        // Safety: the target reference is valid by construction; it is
        // viewed as plain bytes so a value may span several buffers.
        let raw = unsafe {
            std::slice::from_raw_parts_mut(item as *mut T as *mut u8, item_sz)
        };
        self.read_avail -= item_sz;
        let mut done = 0;
        for GuestRegion(addr, rlen) in
            Self::split_front(&mut self.read_left, item_sz)
        {
            match mem.read_into(addr, &mut raw[done..], rlen) {
                Some(copied) if copied == rlen => done += copied,
                _ => return false,
            }
        }
        done == item_sz
    }

    /// Copy a `T` into the writable portion of the chain, advancing the
    /// write position.
    pub fn write<T: Copy>(&mut self, item: &T, mem: &MemCtx) -> bool {
        let item_sz = size_of::<T>();
        if self.write_avail < item_sz {
            return false;
        }
        // Safety: as in read() above.
        let raw = unsafe {
            std::slice::from_raw_parts(item as *const T as *const u8, item_sz)
        };
        self.write_avail -= item_sz;
        let mut done = 0;
        for GuestRegion(addr, rlen) in
            Self::split_front(&mut self.write_left, item_sz)
        {
            match mem.write_from(addr, &raw[done..], rlen) {
                Some(copied) if copied == rlen => done += copied,
                _ => return false,
            }
        }
        done == item_sz
    }

    /// Advance the write position without writing anything.
    pub fn write_skip(&mut self, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        if self.write_avail < len {
            return false;
        }
        self.write_avail -= len;
        Self::split_front(&mut self.write_left, len);
        true
    }

    /// Extract `len` bytes worth of readable guest regions, advancing the
    /// read position.
    pub fn readable_bufs(&mut self, len: usize) -> Option<Vec<GuestRegion>> {
        if len == 0 || self.read_avail < len {
            return None;
        }
        self.read_avail -= len;
        Some(Self::split_front(&mut self.read_left, len))
    }

    /// Extract `len` bytes worth of writable guest regions, advancing the
    /// write position.
    pub fn writable_bufs(&mut self, len: usize) -> Option<Vec<GuestRegion>> {
        if len == 0 || self.write_avail < len {
            return None;
        }
        self.write_avail -= len;
        Some(Self::split_front(&mut self.write_left, len))
    }

    pub fn remain_read_bytes(&self) -> usize {
        self.read_avail
    }

    pub fn remain_write_bytes(&self) -> usize {
        self.write_avail
    }

    /// Write-side bytes consumed so far; the natural `len` for the used
    /// ring entry.
    pub fn write_consumed(&self) -> u32 {
        (self.write_total - self.write_avail) as u32
    }
}

struct VqAvail {
    valid: bool,
    gpa_flags: GuestAddr,
    gpa_idx: GuestAddr,
    gpa_ring: GuestAddr,
    cur_avail_idx: Wrapping<u16>,

    // Descriptor table base, duplicated here so the walk needs only this lock
    gpa_desc: GuestAddr,

    // Monotonic submission stamp for the next fresh head
    next_counter: u64,
    // Heads to resubmit (ascending counter order) before consuming new avail
    replay: VecDeque<u16>,
}

impl VqAvail {
    fn reset(&mut self) {
        self.valid = false;
        self.gpa_flags = GuestAddr(0);
        self.gpa_idx = GuestAddr(0);
        self.gpa_ring = GuestAddr(0);
        self.gpa_desc = GuestAddr(0);
        self.cur_avail_idx = Wrapping(0);
        self.next_counter = 0;
        self.replay.clear();
    }
}

struct VqUsed {
    valid: bool,
    gpa_idx: GuestAddr,
    gpa_ring: GuestAddr,
    // Avail ring flags, where the driver parks VRING_AVAIL_F_NO_INTERRUPT
    gpa_suppress: GuestAddr,
    used_idx: Wrapping<u16>,
    notify: Option<Box<dyn Fn() + Send + Sync>>,
}

impl VqUsed {
    fn reset(&mut self) {
        self.valid = false;
        self.gpa_idx = GuestAddr(0);
        self.gpa_ring = GuestAddr(0);
        self.gpa_suppress = GuestAddr(0);
        self.used_idx = Wrapping(0);
    }

    fn intr_suppressed(&self, mem: &MemCtx) -> bool {
        match mem.read::<u16>(self.gpa_suppress) {
            Some(flags) => flags & VRING_AVAIL_F_NO_INTERRUPT != 0,
            None => true,
        }
    }
}

/// Why `dequeue_many` stopped consuming.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DequeueStop {
    /// No more pending avail entries.
    Drained,
    /// The callback asked to stop.
    Callback,
}

/// Device-side state for one split virtqueue.
pub struct VirtQueue {
    pub id: u16,
    pub size: u16,
    live: AtomicBool,
    broken: AtomicBool,
    outstanding: AtomicUsize,
    avail: Mutex<VqAvail>,
    used: Mutex<VqUsed>,
    inflight: Mutex<Option<Arc<InflightRegion>>>,
    log: Logger,
}

impl VirtQueue {
    pub fn new(id: u16, size: u16, log: Logger) -> Arc<Self> {
        assert!(size.is_power_of_two());
        assert!(size <= VIRTQ_MAX_SIZE);
        Arc::new(Self {
            id,
            size,
            live: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            avail: Mutex::new(VqAvail {
                valid: false,
                gpa_flags: GuestAddr(0),
                gpa_idx: GuestAddr(0),
                gpa_ring: GuestAddr(0),
                gpa_desc: GuestAddr(0),
                cur_avail_idx: Wrapping(0),
                next_counter: 0,
                replay: VecDeque::new(),
            }),
            used: Mutex::new(VqUsed {
                valid: false,
                gpa_idx: GuestAddr(0),
                gpa_ring: GuestAddr(0),
                gpa_suppress: GuestAddr(0),
                used_idx: Wrapping(0),
                notify: None,
            }),
            inflight: Mutex::new(None),
            log,
        })
    }

    /// Attach the queue to ring structures in guest memory and to its
    /// inflight region, then recover any outstanding requests.
    ///
    /// Ring base addresses must translate to mapped guest memory for their
    /// full extent.  If the previous incarnation of the server crashed
    /// between the used-ring publish and the inflight update, the drift is
    /// repaired here; all entries still marked inflight are queued for
    /// resubmission in ascending counter order and will be yielded by
    /// [`Self::pop_avail`] before any new avail entries.
    pub fn attach(
        &self,
        mem: &MemCtx,
        desc_gpa: GuestAddr,
        avail_gpa: GuestAddr,
        used_gpa: GuestAddr,
        inflight: Arc<InflightRegion>,
    ) -> Result<(), QueueError> {
        let size = self.size as usize;
        if inflight.desc_num() != u64::from(self.size) {
            return Err(QueueError::InflightMismatch {
                expected: self.size,
                found: inflight.desc_num(),
            });
        }

        // 16-bit flags + 16-bit idx precede each ring
        mem.readable_region(&GuestRegion(desc_gpa, VIRTQ_DESC_SIZE * size))
            .ok_or(QueueError::BadRingAddress)?;
        mem.readable_region(&GuestRegion(avail_gpa, 4 + 2 * size))
            .ok_or(QueueError::BadRingAddress)?;
        mem.writable_region(&GuestRegion(
            used_gpa,
            4 + VIRTQ_USED_ELEM_SIZE * size,
        ))
        .ok_or(QueueError::BadRingAddress)?;

        let ring_used: u16 =
            mem.read(used_gpa + 2).ok_or(QueueError::BadRingAddress)?;

        let saved = inflight.used_idx();
        if saved != ring_used {
            if saved.wrapping_add(1) == ring_used {
                // Crash landed between the used-ring publish and the
                // inflight commit: the last published element is complete
                // but still marked inflight.
                let slot = usize::from(ring_used.wrapping_sub(1) & (self.size - 1));
                let elem: RawUsed = mem
                    .read(used_gpa + 4 + slot * VIRTQ_USED_ELEM_SIZE)
                    .ok_or(QueueError::BadRingAddress)?;
                if elem.id < u32::from(self.size) {
                    inflight.clear(elem.id as u16);
                }
                inflight.set_used_idx(ring_used);
                warn!(self.log,
                    "repaired inflight region after interrupted commit";
                    "queue" => self.id,
                    "used_idx" => ring_used,
                    "head" => elem.id,
                );
            } else {
                return Err(QueueError::InflightCorrupt {
                    ring: ring_used,
                    saved,
                });
            }
        }

        let resubmit = inflight.resubmit_set();
        let n_resubmit = resubmit.len() as u16;
        if n_resubmit > 0 {
            info!(self.log, "resubmitting inflight requests";
                "queue" => self.id, "count" => n_resubmit);
        }

        let mut avail = self.avail.lock().unwrap();
        let mut used = self.used.lock().unwrap();

        avail.gpa_desc = desc_gpa;
        avail.gpa_flags = avail_gpa;
        avail.gpa_idx = avail_gpa + 2;
        avail.gpa_ring = avail_gpa + 4;
        // Entries covered by the inflight table were consumed by the
        // previous incarnation; they are replayed from the table, not
        // re-read from the ring.
        avail.cur_avail_idx = Wrapping(ring_used) + Wrapping(n_resubmit);
        avail.next_counter = inflight.max_counter() + 1;
        avail.replay = resubmit.iter().map(|ent| ent.head).collect();
        avail.valid = true;

        used.gpa_suppress = avail_gpa;
        used.gpa_idx = used_gpa + 2;
        used.gpa_ring = used_gpa + 4;
        used.used_idx = Wrapping(ring_used);
        used.valid = true;

        *self.inflight.lock().unwrap() = Some(inflight);
        self.outstanding.store(0, Ordering::Release);
        self.broken.store(false, Ordering::Release);
        self.live.store(true, Ordering::Release);
        Ok(())
    }

    /// Detach from the rings, dropping all shadow state.
    ///
    /// Outstanding buffer vectors become stale; callers which care about
    /// orderly shutdown wait for [`Self::outstanding`] to reach zero first.
    /// The inflight region itself is left untouched so the (possibly
    /// replacement) server can recover from it.
    pub fn release(&self) {
        let n = self.outstanding.swap(0, Ordering::AcqRel);
        if n != 0 {
            debug!(self.log, "released with requests outstanding";
                "queue" => self.id, "outstanding" => n);
        }
        let mut avail = self.avail.lock().unwrap();
        let mut used = self.used.lock().unwrap();
        avail.reset();
        used.reset();
        *self.inflight.lock().unwrap() = None;
        self.live.store(false, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Requests popped but not yet pushed to the used ring.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Set the guest notification hook invoked after used-ring publishes
    /// (unless the driver has suppressed interrupts).
    pub fn set_notify(&self, f: Box<dyn Fn() + Send + Sync>) {
        self.used.lock().unwrap().notify = Some(f);
    }

    fn fail(&self, err: QueueError) -> QueueError {
        if !self.broken.swap(true, Ordering::AcqRel) {
            probes::virtq_broken!(|| (self.id));
            error!(self.log, "marking virtqueue broken";
                "queue" => self.id, "error" => %err);
        }
        err
    }

    /// Pop the next pending chain, if any.
    ///
    /// Replayed chains (from inflight recovery) are yielded first, in
    /// ascending counter order; only once the replay queue is drained does
    /// consumption of new avail entries begin.  Fresh heads are recorded in
    /// the inflight region *before* the walk so that a crash at any later
    /// point replays them.
    pub fn pop_avail(
        &self,
        mem: &MemCtx,
    ) -> Result<Option<Chain>, QueueError> {
        if self.is_broken() {
            return Err(QueueError::Broken);
        }
        let mut avail = self.avail.lock().unwrap();
        if !avail.valid {
            return Err(QueueError::NotAttached);
        }
        let inflight = self.inflight.lock().unwrap().clone();

        if let Some(head) = avail.replay.pop_front() {
            let chain = match self.walk_chain(&avail, head, mem) {
                Ok(chain) => chain,
                // The entry stays inflight for the next recovery attempt.
                Err(e) => return Err(self.fail(e)),
            };
            if let Some(region) = inflight.as_ref() {
                probes::virtq_replay!(|| (self.id, head, region.counter(head)));
            }
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            return Ok(Some(chain));
        }

        let driver_idx: u16 = match mem.read(avail.gpa_idx) {
            Some(idx) => idx,
            None => {
                return Err(self.fail(QueueError::TranslationFault {
                    addr: avail.gpa_idx,
                    len: 2,
                }))
            }
        };
        let ndesc = Wrapping(driver_idx) - avail.cur_avail_idx;
        if ndesc.0 == 0 {
            return Ok(None);
        }
        if ndesc.0 > self.size {
            return Err(self.fail(QueueError::AvailOutOfRange { count: ndesc.0 }));
        }

        let read_idx = avail.cur_avail_idx.0 & (self.size - 1);
        fence(Ordering::Acquire);
        let head: u16 = match mem
            .read(avail.gpa_ring.offset::<u16>(read_idx as usize))
        {
            Some(head) => head,
            None => {
                return Err(self.fail(QueueError::TranslationFault {
                    addr: avail.gpa_ring,
                    len: 2,
                }))
            }
        };
        if head >= self.size {
            return Err(self.fail(QueueError::DescIndexOutOfBounds { idx: head }));
        }

        // Record ownership before walking: a crash after this point must
        // resubmit the head.
        let counter = avail.next_counter;
        if let Some(region) = inflight.as_ref() {
            region.record(head, counter);
        }

        match self.walk_chain(&avail, head, mem) {
            Ok(chain) => {
                if let Some(region) = inflight.as_ref() {
                    region.set_chain_len(
                        head,
                        u16::try_from(chain.bufs().len()).unwrap_or(u16::MAX),
                    );
                }
                avail.cur_avail_idx += Wrapping(1);
                avail.next_counter = counter + 1;
                self.outstanding.fetch_add(1, Ordering::AcqRel);
                probes::virtq_pop!(|| (self.id, head, counter));
                Ok(Some(chain))
            }
            Err(e) => {
                // The head never reached a backend; un-record it.
                if let Some(region) = inflight.as_ref() {
                    region.clear(head);
                }
                Err(self.fail(e))
            }
        }
    }

    /// Cooperatively consume pending chains until the ring is exhausted,
    /// the queue breaks, or the callback returns `ControlFlow::Break`.
    pub fn dequeue_many<F>(
        &self,
        mem: &MemCtx,
        mut cb: F,
    ) -> Result<DequeueStop, QueueError>
    where
        F: FnMut(Chain) -> ControlFlow<()>,
    {
        loop {
            match self.pop_avail(mem)? {
                None => return Ok(DequeueStop::Drained),
                Some(chain) => {
                    if cb(chain).is_break() {
                        return Ok(DequeueStop::Callback);
                    }
                }
            }
        }
    }

    /// Publish a completion to the used ring.
    ///
    /// The store sequence is the recovery seam: used element, release
    /// fence, `used.idx`, then the inflight entry is retired and the
    /// region's `used_idx` advanced (release-ordered).  A crash anywhere
    /// between the ring store and the region store leaves the region
    /// exactly one step behind with the entry already clear, which
    /// [`Self::attach`] repairs.
    pub fn push_used(
        &self,
        chain: &mut Chain,
        len: u32,
        mem: &MemCtx,
    ) -> Result<(), QueueError> {
        if self.is_broken() {
            return Err(QueueError::Broken);
        }
        let head = chain.take_head().expect("chain must have been popped");
        let mut used = self.used.lock().unwrap();
        if !used.valid {
            return Err(QueueError::NotAttached);
        }
        let inflight = self.inflight.lock().unwrap().clone();

        if let Some(region) = inflight.as_ref() {
            region.set_old_used_idx(used.used_idx.0);
        }

        let slot = usize::from(used.used_idx.0 & (self.size - 1));
        let elem = RawUsed { id: u32::from(head), len };
        if !mem.write(used.gpa_ring.offset::<RawUsed>(slot), &elem) {
            return Err(self.fail(QueueError::TranslationFault {
                addr: used.gpa_ring,
                len: VIRTQ_USED_ELEM_SIZE,
            }));
        }
        used.used_idx += Wrapping(1);
        fence(Ordering::Release);
        if !mem.write(used.gpa_idx, &used.used_idx.0) {
            return Err(self.fail(QueueError::TranslationFault {
                addr: used.gpa_idx,
                len: 2,
            }));
        }

        if let Some(region) = inflight.as_ref() {
            region.commit(head, used.used_idx.0);
        }

        probes::virtq_push!(|| (self.id, head, len));
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        if !used.intr_suppressed(mem) {
            if let Some(notify) = used.notify.as_ref() {
                notify();
            }
        }
        chain.reset();
        Ok(())
    }

    fn read_desc(
        &self,
        avail: &VqAvail,
        idx: u16,
        mem: &MemCtx,
    ) -> Result<RawDesc, QueueError> {
        let addr = avail.gpa_desc.offset::<RawDesc>(usize::from(idx));
        mem.read(addr).ok_or(QueueError::TranslationFault {
            addr,
            len: VIRTQ_DESC_SIZE,
        })
    }

    fn append_buf(
        &self,
        chain: &mut Chain,
        desc: &RawDesc,
        flags: DescFlag,
        seen_write: &mut bool,
        mem: &MemCtx,
    ) -> Result<(), QueueError> {
        let writable = flags.contains(DescFlag::WRITE);
        if writable {
            *seen_write = true;
        } else if *seen_write {
            return Err(QueueError::OrderViolation);
        }
        let addr = GuestAddr(desc.addr);
        let region = GuestRegion(addr, desc.len as usize);
        let translated = if writable {
            mem.writable_region(&region).is_some()
        } else {
            mem.readable_region(&region).is_some()
        };
        if !translated {
            return Err(QueueError::TranslationFault {
                addr,
                len: desc.len as usize,
            });
        }
        chain.push_buf(if writable {
            ChainBuf::Writable(addr, desc.len)
        } else {
            ChainBuf::Readable(addr, desc.len)
        });
        Ok(())
    }

    /// Walk the chain starting at `head` into a validated buffer vector.
    fn walk_chain(
        &self,
        avail: &VqAvail,
        head: u16,
        mem: &MemCtx,
    ) -> Result<Chain, QueueError> {
        if head >= self.size {
            return Err(QueueError::DescIndexOutOfBounds { idx: head });
        }
        let mut chain = Chain::with_capacity(4);
        chain.idx = Some(head);
        let mut seen_write = false;
        let mut idx = head;
        let mut count: u16 = 0;

        loop {
            let desc = self.read_desc(avail, idx, mem)?;
            let flags = DescFlag::from_bits_truncate(desc.flags);

            if flags.contains(DescFlag::INDIRECT) {
                if flags.contains(DescFlag::NEXT) {
                    return Err(QueueError::IndirectWithNext);
                }
                // An indirect table terminates the chain (virtio 2.4.5.3:
                // zero or more direct descriptors, then one INDIRECT).
                self.walk_indirect(&desc, mem, &mut chain, &mut seen_write)?;
                break;
            }

            self.append_buf(&mut chain, &desc, flags, &mut seen_write, mem)?;
            count += 1;

            if flags.contains(DescFlag::NEXT) {
                if count >= self.size {
                    return Err(QueueError::ChainTooLong);
                }
                if desc.next >= self.size {
                    return Err(QueueError::DescIndexOutOfBounds {
                        idx: desc.next,
                    });
                }
                idx = desc.next;
            } else {
                break;
            }
        }
        Ok(chain)
    }

    fn walk_indirect(
        &self,
        desc: &RawDesc,
        mem: &MemCtx,
        chain: &mut Chain,
        seen_write: &mut bool,
    ) -> Result<(), QueueError> {
        let byte_len = desc.len as usize;
        if byte_len == 0 || byte_len % VIRTQ_DESC_SIZE != 0 {
            return Err(QueueError::BadIndirectLen { len: desc.len });
        }
        let count = byte_len / VIRTQ_DESC_SIZE;
        if count > usize::from(self.size) {
            return Err(QueueError::ChainTooLong);
        }
        let table = mem
            .read_many::<RawDesc>(GuestAddr(desc.addr), count)
            .ok_or(QueueError::TranslationFault {
                addr: GuestAddr(desc.addr),
                len: byte_len,
            })?;

        let mut idx: usize = 0;
        let mut hops: usize = 0;
        loop {
            let ind = table.get(idx).ok_or(QueueError::DescIndexOutOfBounds {
                idx: idx as u16,
            })?;
            let flags = DescFlag::from_bits_truncate(ind.flags);
            if flags.contains(DescFlag::INDIRECT) {
                return Err(QueueError::NestedIndirect);
            }
            self.append_buf(chain, &ind, flags, seen_write, mem)?;

            if flags.contains(DescFlag::NEXT) {
                hops += 1;
                if hops >= count {
                    return Err(QueueError::ChainTooLong);
                }
                if usize::from(ind.next) >= count {
                    return Err(QueueError::DescIndexOutOfBounds {
                        idx: ind.next,
                    });
                }
                idx = usize::from(ind.next);
            } else {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::testutil::*;

    fn ro(addr: u64, len: u32) -> TestBuf {
        TestBuf { addr, len, write: false }
    }

    fn wo(addr: u64, len: u32) -> TestBuf {
        TestBuf { addr, len, write: true }
    }

    fn expect_bufs(chain: &Chain, bufs: &[TestBuf]) {
        assert_eq!(chain.bufs().len(), bufs.len());
        for (got, want) in chain.bufs().iter().zip(bufs.iter()) {
            assert_eq!(got.region(), GuestRegion(GuestAddr(want.addr), want.len as usize));
            assert_eq!(got.is_writable(), want.write);
        }
    }

    /// One chain in, one used entry out, with the committed length echoed.
    fn validate_chain(tvq: &mut TestVirtQueue, bufs: &[TestBuf], indirect: bool) {
        const LEN: u32 = 42;
        let head = if indirect {
            tvq.build_indirect_chain(bufs).0
        } else {
            tvq.build_chain(bufs)
        };
        tvq.publish_avail(head);

        let mut called = 0;
        let res = tvq.kick(|mut chain| {
            expect_bufs(&chain, bufs);
            called += 1;
            tvq.vq().push_used(&mut chain, LEN, tvq.mem()).unwrap();
            ControlFlow::Continue(())
        });
        assert_eq!(res.unwrap(), DequeueStop::Drained);
        assert_eq!(called, 1);

        let used = tvq.collect_used();
        assert_eq!(used, vec![(u32::from(head), LEN)]);
    }

    #[test]
    fn direct_descriptors() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        validate_chain(&mut tvq, &[wo(0xdeadf00d, 0x1000)], false);

        let many = [
            ro(0x1000, 0x1000),
            ro(0x2000, 0x2000),
            ro(0x8000, 0x4000),
            ro(0xf000, 0x1000),
        ];
        validate_chain(&mut tvq, &many, false);
    }

    #[test]
    fn indirect_descriptors() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        validate_chain(&mut tvq, &[ro(0xdeadf00d, 0x1000)], true);

        let many = [
            ro(0x1000, 0x1000),
            ro(0x2000, 0x2000),
            ro(0x8000, 0x4000),
            ro(0xf000, 0x1000),
        ];
        validate_chain(&mut tvq, &many, true);
    }

    #[test]
    fn mixed_descriptor_batches() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        let dir = [
            ro(0x1000, 0x1000),
            ro(0x2000, 0x2000),
            ro(0x8000, 0x4000),
            ro(0xf000, 0x1000),
        ];
        let ind = [
            ro(0x11000, 0x1000),
            ro(0x12000, 0x2000),
            ro(0x18000, 0x4000),
            ro(0x1f000, 0x1000),
        ];

        let h0 = tvq.build_chain(&dir);
        let (h1, _) = tvq.build_indirect_chain(&ind);
        let h2 = tvq.build_chain(&dir);
        tvq.publish_avail(h0);
        tvq.publish_avail(h1);
        tvq.publish_avail(h2);

        let expected: Vec<&[TestBuf]> = vec![&dir, &ind, &dir];
        let mut nchain = 0;
        let res = tvq.kick(|mut chain| {
            expect_bufs(&chain, expected[nchain]);
            tvq.vq()
                .push_used(&mut chain, nchain as u32, tvq.mem())
                .unwrap();
            nchain += 1;
            ControlFlow::Continue(())
        });
        assert_eq!(res.unwrap(), DequeueStop::Drained);
        assert_eq!(nchain, 3);

        let used = tvq.collect_used();
        assert_eq!(
            used,
            vec![(u32::from(h0), 0), (u32::from(h1), 1), (u32::from(h2), 2)]
        );
    }

    #[test]
    fn combined_direct_then_indirect_tail() {
        // virtio 2.4.5.3: zero or more chained direct descriptors followed
        // by a single INDIRECT is unusual but valid.
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        let dir = [
            ro(0x1000, 0x1000),
            ro(0x2000, 0x2000),
            ro(0x8000, 0x4000),
            ro(0xf000, 0x1000),
        ];
        let ind = [
            ro(0x11000, 0x1000),
            ro(0x12000, 0x2000),
            ro(0x18000, 0x4000),
            ro(0x1f000, 0x1000),
        ];
        let dir_head = tvq.build_chain(&dir);
        let (ind_head, _) = tvq.build_indirect_chain(&ind);
        tvq.connect_chains(dir_head, ind_head);
        tvq.publish_avail(dir_head);

        let mut all: Vec<TestBuf> = dir.to_vec();
        all.extend_from_slice(&ind);

        let mut called = 0;
        let res = tvq.kick(|mut chain| {
            expect_bufs(&chain, &all);
            called += 1;
            tvq.vq().push_used(&mut chain, 0, tvq.mem()).unwrap();
            ControlFlow::Continue(())
        });
        assert_eq!(res.unwrap(), DequeueStop::Drained);
        assert_eq!(called, 1);
    }

    #[test]
    fn oob_next_breaks_queue() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        let head = tvq.next_free_desc_num();
        tvq.set_desc(head, 0x1000, 0x100, VIRTQ_DESC_F_NEXT, tvq.size());
        tvq.publish_avail(head);

        let res = tvq.kick(|_| panic!("callback must not run"));
        assert_eq!(
            res.unwrap_err(),
            QueueError::DescIndexOutOfBounds { idx: tvq.size() }
        );
        assert!(tvq.vq().is_broken());
    }

    #[test]
    fn indirect_oob_next_breaks_queue() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        let bufs = [ro(0x1000, 0x1000), ro(0x2000, 0x1000)];
        let (head, table) = tvq.build_indirect_chain(&bufs);
        // Point the first table entry past the end of the table
        let mut d0 = tvq.get_indirect_desc(table, 0);
        d0.next = bufs.len() as u16;
        tvq.set_indirect_desc(table, 0, d0);

        tvq.publish_avail(head);
        let res = tvq.kick(|_| panic!("callback must not run"));
        assert!(res.is_err());
        assert!(tvq.vq().is_broken());
    }

    #[test]
    fn direct_loop_breaks_queue() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        let h1 = tvq.next_free_desc_num();
        let h2 = tvq.next_free_desc_num();
        let h3 = tvq.next_free_desc_num();
        tvq.set_desc(h1, 0x1000, 0x100, VIRTQ_DESC_F_NEXT, h2);
        tvq.set_desc(h2, 0x2000, 0x100, VIRTQ_DESC_F_NEXT, h3);
        tvq.set_desc(h3, 0x3000, 0x100, VIRTQ_DESC_F_NEXT, h2);

        tvq.publish_avail(h1);
        let res = tvq.kick(|_| panic!("callback must not run"));
        assert_eq!(res.unwrap_err(), QueueError::ChainTooLong);
        assert!(tvq.vq().is_broken());
    }

    #[test]
    fn indirect_loop_breaks_queue() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        let bufs = [ro(0x1000, 0x1000), ro(0x2000, 0x1000), ro(0x3000, 0x1000)];
        let (head, table) = tvq.build_indirect_chain(&bufs);
        let mut d2 = tvq.get_indirect_desc(table, 2);
        d2.flags |= VIRTQ_DESC_F_NEXT;
        d2.next = 1;
        tvq.set_indirect_desc(table, 2, d2);

        tvq.publish_avail(head);
        let res = tvq.kick(|_| panic!("callback must not run"));
        assert_eq!(res.unwrap_err(), QueueError::ChainTooLong);
        assert!(tvq.vq().is_broken());
    }

    #[test]
    fn next_and_indirect_together_break_queue() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        let bufs = [ro(0x1000, 0x1000), ro(0x2000, 0x1000), ro(0x3000, 0x1000)];
        let head = tvq.build_chain(&bufs);
        let mut desc = tvq.get_desc(head);
        desc.flags |= VIRTQ_DESC_F_INDIRECT;
        tvq.set_desc_raw(head, desc);

        tvq.publish_avail(head);
        let res = tvq.kick(|_| panic!("callback must not run"));
        assert_eq!(res.unwrap_err(), QueueError::IndirectWithNext);
        assert!(tvq.vq().is_broken());
    }

    #[test]
    fn unaligned_indirect_table_breaks_queue() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        let bufs = [ro(0x1000, 0x1000), ro(0x2000, 0x1000), ro(0x3000, 0x1000)];
        let (head, _) = tvq.build_indirect_chain(&bufs);
        let mut desc = tvq.get_desc(head);
        desc.len += 1;
        tvq.set_desc_raw(head, desc);

        tvq.publish_avail(head);
        let res = tvq.kick(|_| panic!("callback must not run"));
        assert!(matches!(
            res.unwrap_err(),
            QueueError::BadIndirectLen { .. }
        ));
        assert!(tvq.vq().is_broken());
    }

    #[test]
    fn nested_indirect_breaks_queue() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        let bufs = [ro(0x1000, 0x1000), ro(0x2000, 0x1000)];
        let (head, table) = tvq.build_indirect_chain(&bufs);
        let mut d1 = tvq.get_indirect_desc(table, 1);
        d1.flags |= VIRTQ_DESC_F_INDIRECT;
        tvq.set_indirect_desc(table, 1, d1);

        tvq.publish_avail(head);
        let res = tvq.kick(|_| panic!("callback must not run"));
        assert_eq!(res.unwrap_err(), QueueError::NestedIndirect);
        assert!(tvq.vq().is_broken());
    }

    #[test]
    fn unmapped_buffer_breaks_queue() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        // 0x9000_0000 is far outside the test guest memory
        let head = tvq.build_chain(&[ro(0x9000_0000, 0x1000)]);
        tvq.publish_avail(head);
        let res = tvq.kick(|_| panic!("callback must not run"));
        assert!(matches!(
            res.unwrap_err(),
            QueueError::TranslationFault { .. }
        ));
        assert!(tvq.vq().is_broken());
    }

    #[test]
    fn readable_after_writable_breaks_queue() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        let head =
            tvq.build_chain(&[ro(0x1000, 0x100), wo(0x2000, 0x100), ro(0x3000, 0x100)]);
        tvq.publish_avail(head);
        let res = tvq.kick(|_| panic!("callback must not run"));
        assert_eq!(res.unwrap_err(), QueueError::OrderViolation);
        assert!(tvq.vq().is_broken());
    }

    #[test]
    fn broken_queue_is_sticky() {
        let mut tvq = TestVirtQueue::new(DEFAULT_QUEUE_SIZE);

        let head = tvq.next_free_desc_num();
        tvq.set_desc(head, 0x1000, 0x100, VIRTQ_DESC_F_NEXT, tvq.size());
        tvq.publish_avail(head);
        assert!(tvq.kick(|_| panic!("must not run")).is_err());
        assert!(tvq.vq().is_broken());

        // A perfectly valid chain is also refused now
        let good = tvq.build_chain(&[ro(0x1000, 0x100)]);
        tvq.publish_avail(good);
        let res = tvq.kick(|_| panic!("must not run"));
        assert_eq!(res.unwrap_err(), QueueError::Broken);
        assert!(tvq.vq().is_broken());

        // ... and so is a commit
        let mut stale = Chain::with_capacity(1);
        stale.idx = Some(good);
        assert_eq!(
            tvq.vq().push_used(&mut stale, 0, tvq.mem()).unwrap_err(),
            QueueError::Broken
        );
    }

    #[test]
    fn used_ring_order_matches_publish_order() {
        let mut tvq = TestVirtQueue::new(64);

        let mut heads = Vec::new();
        for i in 0..8u32 {
            let head = tvq.build_chain(&[ro(0x1000 + u64::from(i) * 0x100, 0x100)]);
            tvq.publish_avail(head);
            heads.push(head);
        }

        let mut lens = Vec::new();
        let res = tvq.kick(|mut chain| {
            let len = 100 + lens.len() as u32;
            lens.push(len);
            tvq.vq().push_used(&mut chain, len, tvq.mem()).unwrap();
            ControlFlow::Continue(())
        });
        assert_eq!(res.unwrap(), DequeueStop::Drained);

        let used = tvq.collect_used();
        let expect: Vec<(u32, u32)> = heads
            .iter()
            .zip(lens.iter())
            .map(|(h, l)| (u32::from(*h), *l))
            .collect();
        assert_eq!(used, expect);
    }

    #[test]
    fn callback_abort_stops_consumption() {
        let mut tvq = TestVirtQueue::new(64);

        for i in 0..4u64 {
            let head = tvq.build_chain(&[ro(0x1000 + i * 0x100, 0x100)]);
            tvq.publish_avail(head);
        }

        let mut popped = Vec::new();
        let res = tvq.kick(|mut chain| {
            tvq.vq().push_used(&mut chain, 0, tvq.mem()).unwrap();
            popped.push(());
            ControlFlow::Break(())
        });
        assert_eq!(res.unwrap(), DequeueStop::Callback);
        assert_eq!(popped.len(), 1);

        // The remaining three are still pending
        let res = tvq.kick(|mut chain| {
            tvq.vq().push_used(&mut chain, 0, tvq.mem()).unwrap();
            popped.push(());
            ControlFlow::Continue(())
        });
        assert_eq!(res.unwrap(), DequeueStop::Drained);
        assert_eq!(popped.len(), 4);
    }

    #[test]
    fn attach_rejects_unmapped_rings() {
        let tvq = TestVirtQueue::new(16);
        let vq = VirtQueue::new(0, 16, crate::virtio::testutil::test_logger());
        let res = vq.attach(
            tvq.mem(),
            GuestAddr(0x4000_0000),
            GuestAddr(0x4001_0000),
            GuestAddr(0x4002_0000),
            tvq.inflight().clone(),
        );
        assert_eq!(res.unwrap_err(), QueueError::BadRingAddress);
    }

    #[test]
    fn chain_copy_helpers() {
        let mut tvq = TestVirtQueue::new(16);

        let req = [0x11u8, 0x22, 0x33, 0x44];
        let hdr_gpa = tvq.write_data(&req);
        let payload_gpa = tvq.alloc_data(64);
        let head = tvq.build_chain(&[
            ro(hdr_gpa, 4),
            wo(payload_gpa, 64),
        ]);
        tvq.publish_avail(head);

        let mut chain = tvq.vq().pop_avail(tvq.mem()).unwrap().unwrap();
        let mut got = [0u8; 4];
        assert!(chain.read(&mut got, tvq.mem()));
        assert_eq!(got, req);

        let reply = [0xaau8; 16];
        assert!(chain.write(&reply, tvq.mem()));
        assert!(chain.write_skip(64 - 16 - 1));
        assert!(chain.write(&0x55u8, tvq.mem()));
        let consumed = chain.write_consumed();
        assert_eq!(consumed, 64);

        tvq.vq().push_used(&mut chain, consumed, tvq.mem()).unwrap();

        assert_eq!(tvq.read_guest_mem(payload_gpa, 16), vec![0xaa; 16]);
        assert_eq!(tvq.read_guest_mem(payload_gpa + 63, 1), vec![0x55]);
    }
}
