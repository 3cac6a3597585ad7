// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Crash-persistent inflight tracking.
//!
//! The region is a shared-memory side table, indexed by head descriptor,
//! which outlives the server process: a replacement server maps the same
//! object (handed over by the hypervisor as an fd) and learns which heads
//! were consumed from the avail ring but never pushed to the used ring.
//! Entries carry a monotonic submission counter so recovery can resubmit
//! them in original arrival order.
//!
//! Only the device writes the region, so no locking is needed; the
//! `used_idx` store is release-ordered after the used-ring publish so a
//! crash-recovering reader observes at most one step of drift.
//!
//! On-disk layout (stable ABI):
//!
//! ```text
//! offset  size  field
//! 0       8     version (= 1)
//! 8       8     desc_num
//! 16      8     used_idx       (low 16 bits live)
//! 24      8     old_used_idx   (pre-publish snapshot)
//! 32      32    reserved
//! 64      24*N  { inflight u8, pad[7], counter u64, num u16, next u16, pad[4] }
//! ```

use std::io::{Error, ErrorKind, Result};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::mem::{create_memfd, Mapping, Prot};

pub const INFLIGHT_VERSION: u64 = 1;

const HDR_SIZE: usize = 64;
const DESC_SIZE: usize = 24;

const OFF_VERSION: usize = 0;
const OFF_DESC_NUM: usize = 8;
const OFF_USED_IDX: usize = 16;
const OFF_OLD_USED_IDX: usize = 24;

const DESC_OFF_INFLIGHT: usize = 0;
const DESC_OFF_COUNTER: usize = 8;
const DESC_OFF_NUM: usize = 16;
const DESC_OFF_NEXT: usize = 18;

/// An entry of the recovery resubmit set.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Resubmit {
    pub head: u16,
    pub counter: u64,
}

/// Memory-mapped inflight region shared with a future replacement server.
pub struct InflightRegion {
    mapping: Arc<Mapping>,
    fd: OwnedFd,
    desc_num: u16,
}

impl InflightRegion {
    /// Byte size of a region covering `desc_num` head descriptors.
    pub fn region_size(desc_num: u16) -> usize {
        HDR_SIZE + usize::from(desc_num) * DESC_SIZE
    }

    /// Create a fresh region backed by an anonymous shared memory object.
    pub fn create(desc_num: u16) -> Result<Arc<Self>> {
        let len = Self::region_size(desc_num);
        let fd = create_memfd("inflight-region", len)?;
        let mapping = Mapping::new(len, Prot::RW, &fd, 0)?;
        let region = Self { mapping, fd, desc_num };
        region.write_u64(OFF_VERSION, INFLIGHT_VERSION);
        region.write_u64(OFF_DESC_NUM, u64::from(desc_num));
        Ok(Arc::new(region))
    }

    /// Adopt an existing region (the reconnect hand-off path).
    ///
    /// The object must carry the expected version and descriptor count.
    pub fn from_fd(fd: OwnedFd, desc_num: u16) -> Result<Arc<Self>> {
        let len = Self::region_size(desc_num);
        let mapping = Mapping::new(len, Prot::RW, &fd, 0)?;
        let region = Self { mapping, fd, desc_num };
        let version = region.read_u64(OFF_VERSION);
        if version != INFLIGHT_VERSION {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("unsupported inflight region version {}", version),
            ));
        }
        let found = region.read_u64(OFF_DESC_NUM);
        if found != u64::from(desc_num) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "inflight region sized for {} descriptors, expected {}",
                    found, desc_num
                ),
            ));
        }
        Ok(Arc::new(region))
    }

    /// The fd backing this region, for handing to a replacement server.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn desc_num(&self) -> u64 {
        u64::from(self.desc_num)
    }

    fn read_u64(&self, off: usize) -> u64 {
        debug_assert!(off + 8 <= self.mapping.len());
        // Safety: off is within the mapping and 8-byte aligned by layout.
        unsafe {
            (self.mapping.raw_ptr().as_ptr().add(off) as *const u64)
                .read_volatile()
        }
    }

    fn write_u64(&self, off: usize, val: u64) {
        debug_assert!(off + 8 <= self.mapping.len());
        unsafe {
            (self.mapping.raw_ptr().as_ptr().add(off) as *mut u64)
                .write_volatile(val)
        }
    }

    fn desc_off(&self, head: u16) -> usize {
        assert!(head < self.desc_num);
        HDR_SIZE + usize::from(head) * DESC_SIZE
    }

    fn read_desc_u8(&self, head: u16, field: usize) -> u8 {
        unsafe {
            self.mapping
                .raw_ptr()
                .as_ptr()
                .add(self.desc_off(head) + field)
                .read_volatile()
        }
    }

    fn write_desc_u8(&self, head: u16, field: usize, val: u8) {
        unsafe {
            self.mapping
                .raw_ptr()
                .as_ptr()
                .add(self.desc_off(head) + field)
                .write_volatile(val)
        }
    }

    fn read_desc_u16(&self, head: u16, field: usize) -> u16 {
        unsafe {
            (self.mapping.raw_ptr().as_ptr().add(self.desc_off(head) + field)
                as *const u16)
                .read_volatile()
        }
    }

    fn write_desc_u16(&self, head: u16, field: usize, val: u16) {
        unsafe {
            (self.mapping.raw_ptr().as_ptr().add(self.desc_off(head) + field)
                as *mut u16)
                .write_volatile(val)
        }
    }

    fn read_desc_u64(&self, head: u16, field: usize) -> u64 {
        unsafe {
            (self.mapping.raw_ptr().as_ptr().add(self.desc_off(head) + field)
                as *const u64)
                .read_volatile()
        }
    }

    fn write_desc_u64(&self, head: u16, field: usize, val: u64) {
        unsafe {
            (self.mapping.raw_ptr().as_ptr().add(self.desc_off(head) + field)
                as *mut u64)
                .write_volatile(val)
        }
    }

    /// The device's authoritative copy of the used ring producer index.
    pub fn used_idx(&self) -> u16 {
        let val = self.read_u64(OFF_USED_IDX) as u16;
        fence(Ordering::Acquire);
        val
    }

    pub(crate) fn set_used_idx(&self, val: u16) {
        fence(Ordering::Release);
        self.write_u64(OFF_USED_IDX, u64::from(val));
    }

    pub fn old_used_idx(&self) -> u16 {
        self.read_u64(OFF_OLD_USED_IDX) as u16
    }

    pub(crate) fn set_old_used_idx(&self, val: u16) {
        self.write_u64(OFF_OLD_USED_IDX, u64::from(val));
    }

    pub fn is_inflight(&self, head: u16) -> bool {
        self.read_desc_u8(head, DESC_OFF_INFLIGHT) != 0
    }

    pub fn counter(&self, head: u16) -> u64 {
        self.read_desc_u64(head, DESC_OFF_COUNTER)
    }

    /// Number of buffers in the chain, recorded at submission.
    pub fn chain_len(&self, head: u16) -> u16 {
        self.read_desc_u16(head, DESC_OFF_NUM)
    }

    /// Mark `head` as owned by a backend.
    ///
    /// The counter is made visible before the inflight bit so recovery
    /// never observes a marked entry with a stale stamp.
    pub(crate) fn record(&self, head: u16, counter: u64) {
        self.write_desc_u64(head, DESC_OFF_COUNTER, counter);
        self.write_desc_u16(head, DESC_OFF_NUM, 0);
        self.write_desc_u16(head, DESC_OFF_NEXT, 0);
        fence(Ordering::Release);
        self.write_desc_u8(head, DESC_OFF_INFLIGHT, 1);
    }

    pub(crate) fn set_chain_len(&self, head: u16, num: u16) {
        self.write_desc_u16(head, DESC_OFF_NUM, num);
    }

    pub(crate) fn clear(&self, head: u16) {
        self.write_desc_u8(head, DESC_OFF_INFLIGHT, 0);
    }

    /// Commit a completion: retire the entry, then advance the region's
    /// `used_idx` with release ordering.
    ///
    /// The bit is cleared *before* the index store.  A crash between the
    /// two leaves `used_idx` one behind the ring with the bit already
    /// clear, which reattach repairs as a no-op; the reverse order would
    /// leave a window where a completed head still looks inflight and
    /// would be replayed twice.
    pub(crate) fn commit(&self, head: u16, used_idx: u16) {
        self.clear(head);
        self.set_used_idx(used_idx);
    }

    /// All entries still marked inflight, in ascending counter order.
    pub fn resubmit_set(&self) -> Vec<Resubmit> {
        let mut set = Vec::new();
        for head in 0..self.desc_num {
            if self.is_inflight(head) {
                set.push(Resubmit { head, counter: self.counter(head) });
            }
        }
        set.sort_by_key(|ent| ent.counter);
        set
    }

    /// Highest counter ever assigned in this region (zero if none).
    pub fn max_counter(&self) -> u64 {
        (0..self.desc_num).map(|head| self.counter(head)).max().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn set_inflight_raw(&self, head: u16, val: bool) {
        self.write_desc_u8(head, DESC_OFF_INFLIGHT, u8::from(val));
    }
}

// Safety: all access to the shared bytes goes through volatile operations on
// the owned mapping; no references escape.
unsafe impl Send for InflightRegion {}
unsafe impl Sync for InflightRegion {}
