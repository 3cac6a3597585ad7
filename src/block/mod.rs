// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block backend vocabulary: operations, results, and the backend trait.

use crate::common::GuestRegion;
use crate::mem::MemCtx;

mod in_memory;
pub use in_memory::InMemoryBackend;

pub type ByteOffset = u64;
pub type ByteLen = usize;

/// Operations a virtual block device issues to its backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Read `len` bytes from `offset` into the request's regions
    Read(ByteOffset, ByteLen),
    /// Write `len` bytes at `offset` from the request's regions
    Write(ByteOffset, ByteLen),
    /// Flush buffered writes to stable storage
    Flush,
}

impl Operation {
    pub const fn is_read(&self) -> bool {
        matches!(self, Operation::Read(..))
    }
    pub const fn is_write(&self) -> bool {
        matches!(self, Operation::Write(..))
    }
    pub const fn is_flush(&self) -> bool {
        matches!(self, Operation::Flush)
    }
}

/// Outcome of one request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Result {
    /// Request succeeded
    Success = 0,
    /// Backend indicated failure for the operation
    Failure,
    /// Operation not supported
    Unsupported,
    /// Request was abandoned (device torn down before processing)
    Canceled,
}

impl Result {
    pub const fn is_err(&self) -> bool {
        !matches!(self, Result::Success)
    }
}

/// Geometry and access mode of a backend.
#[derive(Default, Debug, Copy, Clone)]
pub struct DeviceInfo {
    /// Size (in bytes) per block
    pub block_size: u32,
    /// Device size in blocks
    pub total_blocks: u64,
    /// Is the device read-only
    pub read_only: bool,
}

impl DeviceInfo {
    pub fn capacity_bytes(&self) -> u64 {
        self.total_blocks * u64::from(self.block_size)
    }
}

/// A store which processes block operations against guest memory regions.
///
/// Implementations are driven from the user's worker thread; the engine
/// guarantees a region list that already passed translation at dequeue
/// time, pinned via the [`MemCtx`] snapshot carried by the request.
pub trait Backend: Send + Sync + 'static {
    fn info(&self) -> DeviceInfo;

    fn process(
        &self,
        op: &Operation,
        regions: &[GuestRegion],
        mem: &MemCtx,
    ) -> Result;
}
