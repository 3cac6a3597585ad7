// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test harness for building virtqueues backed by real guest memory.
//!
//! [`TestVirtQueue`] allocates anonymous guest memory, lays out the split
//! ring structures at fixed guest-physical addresses, and provides
//! driver-side helpers: writing descriptors (direct and indirect),
//! publishing heads on the avail ring, and reading back the used ring.
//! Payload buffers live in a low arena (`0x0..0x40000`), with one extra
//! region at `0xdeadf000` so chains can reference the traditional
//! `0xdeadf00d` address.

use std::ops::ControlFlow;
use std::sync::Arc;

use slog::{Drain, Logger};
use zerocopy::{FromBytes, FromZeroes};

use super::bits::*;
use super::inflight::InflightRegion;
use super::queue::{Chain, DequeueStop, QueueError, VirtQueue};
use crate::common::{round_up_p2, GuestAddr, PAGE_SIZE};
use crate::mem::{MapRegion, Mapping, MemCtx};

pub(crate) const DEFAULT_QUEUE_SIZE: u16 = 1024;

pub(crate) fn test_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!("component" => "test"))
}

/// 16-byte descriptor as the driver writes it.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromZeroes, FromBytes)]
pub(crate) struct RawDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// 8-byte used ring element.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromZeroes, FromBytes)]
struct RawUsedElem {
    id: u32,
    len: u32,
}

/// One buffer of a chain under construction.
#[derive(Copy, Clone, Debug)]
pub(crate) struct TestBuf {
    pub addr: u64,
    pub len: u32,
    pub write: bool,
}

impl TestBuf {
    fn flags(&self) -> u16 {
        if self.write {
            VIRTQ_DESC_F_WRITE
        } else {
            0
        }
    }
}

const ARENA_LEN: u64 = 0x40000;
const DESC_BASE: u64 = 0x100000;
const HIGH_BASE: u64 = 0xdeadf000;
const HIGH_LEN: usize = 0x2000;

pub(crate) struct TestVirtQueue {
    ctx: Arc<MemCtx>,
    regions: Vec<MapRegion>,
    vq: Arc<VirtQueue>,
    inflight: Arc<InflightRegion>,
    size: u16,
    desc_base: u64,
    avail_base: u64,
    used_base: u64,
    indir_end: u64,
    indir_cursor: u64,
    data_cursor: u64,
    next_free_desc: u16,
    avail_idx: u16,
    last_used: u16,
}

impl TestVirtQueue {
    pub fn new(size: u16) -> Self {
        let qsz = u64::from(size);
        let desc_base = DESC_BASE;
        let avail_base = desc_base + VIRTQ_DESC_SIZE as u64 * qsz;
        let used_base = round_up_p2(
            (avail_base + 4 + 2 * qsz) as usize,
            PAGE_SIZE,
        ) as u64;
        let indir_base = round_up_p2(
            (used_base + 4 + VIRTQ_USED_ELEM_SIZE as u64 * qsz) as usize,
            PAGE_SIZE,
        ) as u64;
        let indir_end = indir_base + ARENA_LEN;
        let total = round_up_p2(indir_end as usize, PAGE_SIZE);

        let low = Mapping::new_anon(total).expect("allocate test guest memory");
        let high = Mapping::new_anon(HIGH_LEN).expect("allocate high region");
        let regions = vec![
            MapRegion::new(0, total, low),
            MapRegion::new(HIGH_BASE, HIGH_LEN, high),
        ];
        let ctx = MemCtx::new(regions.clone()).unwrap();

        let inflight = InflightRegion::create(size).expect("inflight region");
        let vq = VirtQueue::new(0, size, test_logger());

        let tvq = Self {
            ctx,
            regions,
            vq,
            inflight,
            size,
            desc_base,
            avail_base,
            used_base,
            indir_end,
            indir_cursor: indir_base,
            data_cursor: 0,
            next_free_desc: 0,
            avail_idx: 0,
            last_used: 0,
        };
        tvq.attach();
        tvq
    }

    /// (Re)attach the queue to the ring structures, running recovery.
    pub fn attach(&self) {
        self.vq
            .attach(
                &self.ctx,
                GuestAddr(self.desc_base),
                GuestAddr(self.avail_base),
                GuestAddr(self.used_base),
                self.inflight.clone(),
            )
            .expect("attach test virtqueue");
    }

    /// Detach, as a crashing or disconnecting server would.
    pub fn release(&self) {
        self.vq.release();
    }

    pub fn vq(&self) -> &Arc<VirtQueue> {
        &self.vq
    }

    pub fn mem(&self) -> &MemCtx {
        &self.ctx
    }

    pub fn regions(&self) -> Vec<MapRegion> {
        self.regions.clone()
    }

    pub fn inflight(&self) -> &Arc<InflightRegion> {
        &self.inflight
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn ring_addrs(&self) -> (GuestAddr, GuestAddr, GuestAddr) {
        (
            GuestAddr(self.desc_base),
            GuestAddr(self.avail_base),
            GuestAddr(self.used_base),
        )
    }

    /// Allocate payload space in the data arena.
    pub fn alloc_data(&mut self, len: usize) -> u64 {
        let gpa = self.data_cursor;
        self.data_cursor += len as u64;
        assert!(self.data_cursor <= ARENA_LEN, "test data arena exhausted");
        gpa
    }

    /// Allocate payload space and fill it with `data`.
    pub fn write_data(&mut self, data: &[u8]) -> u64 {
        let gpa = self.alloc_data(data.len());
        assert_eq!(
            self.ctx.write_from(GuestAddr(gpa), data, data.len()),
            Some(data.len())
        );
        gpa
    }

    pub fn read_guest_mem(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        assert_eq!(
            self.ctx.read_into(GuestAddr(addr), &mut buf, len),
            Some(len)
        );
        buf
    }

    pub fn next_free_desc_num(&mut self) -> u16 {
        let num = self.next_free_desc % self.size;
        self.next_free_desc += 1;
        num
    }

    fn desc_gpa(&self, idx: u16) -> GuestAddr {
        GuestAddr(self.desc_base + u64::from(idx) * VIRTQ_DESC_SIZE as u64)
    }

    pub fn get_desc(&self, idx: u16) -> RawDesc {
        self.ctx.read::<RawDesc>(self.desc_gpa(idx)).unwrap()
    }

    pub fn set_desc_raw(&self, idx: u16, desc: RawDesc) {
        assert!(self.ctx.write(self.desc_gpa(idx), &desc));
    }

    pub fn set_desc(&self, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        self.set_desc_raw(idx, RawDesc { addr, len, flags, next });
    }

    /// Write a chain of direct descriptors, returning the head index.
    pub fn build_chain(&mut self, bufs: &[TestBuf]) -> u16 {
        assert!(!bufs.is_empty());
        let mut head = 0;
        let mut prev: Option<u16> = None;
        for (i, buf) in bufs.iter().enumerate() {
            let num = self.next_free_desc_num();
            if i == 0 {
                head = num;
            }
            self.set_desc(num, buf.addr, buf.len, buf.flags(), 0);
            if let Some(prev_idx) = prev {
                let mut pdesc = self.get_desc(prev_idx);
                pdesc.flags |= VIRTQ_DESC_F_NEXT;
                pdesc.next = num;
                self.set_desc_raw(prev_idx, pdesc);
            }
            prev = Some(num);
        }
        head
    }

    fn alloc_indirect_table(&mut self, count: usize) -> u64 {
        let gpa = self.indir_cursor;
        self.indir_cursor += (count * VIRTQ_DESC_SIZE) as u64;
        assert!(self.indir_cursor <= self.indir_end, "indirect arena exhausted");
        gpa
    }

    /// Write an indirect table for `bufs` plus the top-level descriptor
    /// referencing it.  Returns (head, table gpa).
    pub fn build_indirect_chain(&mut self, bufs: &[TestBuf]) -> (u16, u64) {
        assert!(!bufs.is_empty());
        let table = self.alloc_indirect_table(bufs.len());
        for (i, buf) in bufs.iter().enumerate() {
            let mut desc = RawDesc {
                addr: buf.addr,
                len: buf.len,
                flags: buf.flags(),
                next: 0,
            };
            if i + 1 < bufs.len() {
                desc.flags |= VIRTQ_DESC_F_NEXT;
                desc.next = (i + 1) as u16;
            }
            self.set_indirect_desc(table, i, desc);
        }

        let head = self.next_free_desc_num();
        self.set_desc(
            head,
            table,
            (bufs.len() * VIRTQ_DESC_SIZE) as u32,
            VIRTQ_DESC_F_INDIRECT,
            0,
        );
        (head, table)
    }

    pub fn get_indirect_desc(&self, table: u64, i: usize) -> RawDesc {
        self.ctx
            .read::<RawDesc>(GuestAddr(table + (i * VIRTQ_DESC_SIZE) as u64))
            .unwrap()
    }

    pub fn set_indirect_desc(&self, table: u64, i: usize, desc: RawDesc) {
        assert!(self
            .ctx
            .write(GuestAddr(table + (i * VIRTQ_DESC_SIZE) as u64), &desc));
    }

    /// Append an indirect chain after the tail of a direct chain.
    pub fn connect_chains(&self, dir_head: u16, indir_head: u16) -> u16 {
        let mut tail = dir_head;
        loop {
            let desc = self.get_desc(tail);
            if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            tail = desc.next;
        }
        let mut desc = self.get_desc(tail);
        desc.flags |= VIRTQ_DESC_F_NEXT;
        desc.next = indir_head;
        self.set_desc_raw(tail, desc);
        dir_head
    }

    /// Publish a head on the avail ring, as the guest driver would.
    pub fn publish_avail(&mut self, head: u16) {
        let slot = self.avail_base
            + 4
            + u64::from(self.avail_idx % self.size) * 2;
        self.avail_idx = self.avail_idx.wrapping_add(1);
        assert!(self.ctx.write(GuestAddr(slot), &head));
        assert!(self.ctx.write(GuestAddr(self.avail_base + 2), &self.avail_idx));
    }

    /// Drive the queue: consume pending chains through `cb`.
    pub fn kick<F>(&self, cb: F) -> Result<DequeueStop, QueueError>
    where
        F: FnMut(Chain) -> ControlFlow<()>,
    {
        self.vq.dequeue_many(&self.ctx, cb)
    }

    /// Read new used ring entries since the last call.
    pub fn collect_used(&mut self) -> Vec<(u32, u32)> {
        let idx: u16 = self.ctx.read(GuestAddr(self.used_base + 2)).unwrap();
        let mut entries = Vec::new();
        while self.last_used != idx {
            let slot = self.used_base
                + 4
                + u64::from(self.last_used % self.size)
                    * VIRTQ_USED_ELEM_SIZE as u64;
            let elem: RawUsedElem = self.ctx.read(GuestAddr(slot)).unwrap();
            entries.push((elem.id, elem.len));
            self.last_used = self.last_used.wrapping_add(1);
        }
        entries
    }

    /// The used ring producer index as the guest driver sees it.
    pub fn used_idx(&self) -> u16 {
        self.ctx.read(GuestAddr(self.used_base + 2)).unwrap()
    }
}
