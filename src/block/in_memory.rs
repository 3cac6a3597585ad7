// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Error, ErrorKind, Result};
use std::ops::Range;
use std::sync::{Arc, Mutex};

use crate::block;
use crate::common::GuestRegion;
use crate::mem::MemCtx;

/// Block backend over a plain byte vector.
///
/// Used by the tests and as the reference implementation of the
/// [`block::Backend`] contract.
pub struct InMemoryBackend {
    bytes: Mutex<Vec<u8>>,
    info: block::DeviceInfo,
}

impl InMemoryBackend {
    pub fn create(
        bytes: Vec<u8>,
        block_size: u32,
        read_only: bool,
    ) -> Result<Arc<Self>> {
        let len = bytes.len();
        if len == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "size cannot be 0"));
        }
        if len % block_size as usize != 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("size {} not a multiple of block size {}", len, block_size),
            ));
        }
        Ok(Arc::new(Self {
            bytes: Mutex::new(bytes),
            info: block::DeviceInfo {
                block_size,
                total_blocks: len as u64 / u64::from(block_size),
                read_only,
            },
        }))
    }

    /// Resolve a request against the backing store's bounds.
    fn byte_range(&self, offset: u64, len: usize) -> Result<Range<usize>> {
        let end = offset
            .checked_add(len as u64)
            .filter(|&end| end <= self.info.capacity_bytes())
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidInput, "request beyond end of device")
            })?;
        Ok(offset as usize..end as usize)
    }

    fn process_request(
        &self,
        op: &block::Operation,
        regions: &[GuestRegion],
        mem: &MemCtx,
    ) -> Result<()> {
        match op {
            block::Operation::Read(off, len) => {
                let span = self.byte_range(*off, *len)?;
                let bytes = self.bytes.lock().unwrap();
                copy_to_guest(&bytes[span], regions, mem)
            }
            block::Operation::Write(off, len) => {
                if self.info.read_only {
                    return Err(Error::new(
                        ErrorKind::PermissionDenied,
                        "backend is read-only",
                    ));
                }
                let span = self.byte_range(*off, *len)?;
                let mut bytes = self.bytes.lock().unwrap();
                copy_from_guest(&mut bytes[span], regions, mem)
            }
            block::Operation::Flush => Ok(()),
        }
    }
}

impl block::Backend for InMemoryBackend {
    fn info(&self) -> block::DeviceInfo {
        self.info
    }

    fn process(
        &self,
        op: &block::Operation,
        regions: &[GuestRegion],
        mem: &MemCtx,
    ) -> block::Result {
        match self.process_request(op, regions, mem) {
            Ok(()) => block::Result::Success,
            Err(_) => block::Result::Failure,
        }
    }
}

/// Scatter `data` across the request's guest regions.  The regions must
/// cover exactly `data.len()` bytes between them.
fn copy_to_guest(
    data: &[u8],
    regions: &[GuestRegion],
    mem: &MemCtx,
) -> Result<()> {
    let mut done: usize = 0;
    for &GuestRegion(addr, rlen) in regions {
        let end = done
            .checked_add(rlen)
            .filter(|&end| end <= data.len())
            .ok_or_else(region_mismatch)?;
        match mem.write_from(addr, &data[done..end], rlen) {
            Some(copied) if copied == rlen => done = end,
            _ => return Err(bad_guest_region()),
        }
    }
    if done != data.len() {
        return Err(region_mismatch());
    }
    Ok(())
}

/// Gather the request's guest regions into `data`.  The regions must
/// cover exactly `data.len()` bytes between them.
fn copy_from_guest(
    data: &mut [u8],
    regions: &[GuestRegion],
    mem: &MemCtx,
) -> Result<()> {
    let mut done: usize = 0;
    for &GuestRegion(addr, rlen) in regions {
        let end = done
            .checked_add(rlen)
            .filter(|&end| end <= data.len())
            .ok_or_else(region_mismatch)?;
        match mem.read_into(addr, &mut data[done..end], rlen) {
            Some(copied) if copied == rlen => done = end,
            _ => return Err(bad_guest_region()),
        }
    }
    if done != data.len() {
        return Err(region_mismatch());
    }
    Ok(())
}

fn region_mismatch() -> Error {
    Error::new(ErrorKind::InvalidInput, "regions do not match request length")
}

fn bad_guest_region() -> Error {
    Error::new(ErrorKind::Other, "guest region failed to translate")
}
