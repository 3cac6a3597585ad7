// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest memory mapping and translation.
//!
//! The hypervisor owns guest memory and hands this process a table of
//! (guest-physical range, fd, offset) entries.  Surrounding protocol code
//! turns that table into a [`MemCtx`] snapshot and installs it in the
//! device's [`AddressSpace`].  Consumers pin the current snapshot for the
//! lifetime of a request; a table update installs a new snapshot while the
//! old one stays alive until its last pin drops.

use std::io::{Error, ErrorKind, Result};
use std::marker::PhantomData;
use std::mem::{size_of, size_of_val};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{copy_nonoverlapping, NonNull};
use std::sync::{Arc, Mutex};

use crate::common::{GuestAddr, GuestRegion, PAGE_SIZE};

use zerocopy::FromBytes;

bitflags! {
    /// Memory protections applied to a mapping.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct Prot: u8 {
        const READ = libc::PROT_READ as u8;
        const WRITE = libc::PROT_WRITE as u8;
        const RW = (libc::PROT_READ | libc::PROT_WRITE) as u8;
    }
}

/// Create an anonymous shared memory object of `len` bytes.
pub(crate) fn create_memfd(name: &str, len: usize) -> Result<OwnedFd> {
    let cname = std::ffi::CString::new(name)
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "NUL in memfd name"))?;
    let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(fd)
}

/// An owned `mmap` of a shared file object.
///
/// No references into the contents are ever handed out; all access goes
/// through [`SubMapping`], which performs the protection checks.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    prot: Prot,
}

impl Mapping {
    /// Map `len` bytes of `fd` starting at `offset`.
    pub fn new(
        len: usize,
        prot: Prot,
        fd: &impl AsRawFd,
        offset: i64,
    ) -> Result<Arc<Self>> {
        // Safety: a NULL addr lets the OS pick a free range.  The caller is
        // responsible for keeping the underlying object untruncated for the
        // life of the Mapping.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::c_int::from(prot.bits()),
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .expect("mmap() result should be non-NULL");
        Ok(Arc::new(Self { ptr, len, prot }))
    }

    /// Map a fresh anonymous shared object, e.g. for test guest memory.
    pub fn new_anon(len: usize) -> Result<Arc<Self>> {
        let len = crate::common::round_up_p2(len, PAGE_SIZE);
        let fd = create_memfd("guest-mem", len)?;
        Self::new(len, Prot::RW, &fd, 0)
    }

    pub(crate) fn raw_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

// Safety: `Mapping` exposes no references to the underlying bytes.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// A borrowed window into a [`Mapping`].
pub struct SubMapping<'a> {
    backing: Arc<Mapping>,
    ptr: NonNull<u8>,
    len: usize,
    prot: Prot,
    _ctx: PhantomData<&'a MemCtx>,
}

impl<'a> SubMapping<'a> {
    fn new_base(base: &Arc<Mapping>) -> SubMapping<'a> {
        SubMapping {
            backing: base.clone(),
            ptr: base.ptr,
            len: base.len,
            prot: base.prot,
            _ctx: PhantomData,
        }
    }

    /// Narrow the window to `[offset, offset + length)` of its current span.
    pub fn subregion(
        &self,
        offset: usize,
        length: usize,
    ) -> Option<SubMapping<'a>> {
        let end = offset.checked_add(length)?;
        if self.len < end {
            return None;
        }
        // Safety: bounds were checked against the existing window, which in
        // turn lies within the backing allocation.
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        Some(SubMapping {
            backing: self.backing.clone(),
            ptr: NonNull::new(ptr).unwrap(),
            len: length,
            prot: self.prot,
            _ctx: PhantomData,
        })
    }

    /// Drop access rights not present in `prot_limit`.
    pub fn constrain_access(mut self, prot_limit: Prot) -> Self {
        self.prot = self.prot.intersection(prot_limit);
        self
    }

    fn check_read_access(&self) -> Result<()> {
        if !self.prot.contains(Prot::READ) {
            return Err(Error::new(ErrorKind::PermissionDenied, "no read access"));
        }
        Ok(())
    }

    fn check_write_access(&self) -> Result<()> {
        if !self.prot.contains(Prot::WRITE) {
            return Err(Error::new(ErrorKind::PermissionDenied, "no write access"));
        }
        Ok(())
    }

    /// Read a `T` from the start of the window.
    pub fn read<T: Copy + FromBytes>(&self) -> Result<T> {
        self.check_read_access()?;
        if self.len < size_of::<T>() {
            return Err(Error::new(ErrorKind::InvalidData, "buffer too small"));
        }
        let typed = self.ptr.as_ptr() as *const T;
        // Safety: the read was bounds-checked above, and `T: FromBytes`
        // guarantees any bit pattern is a valid value.
        Ok(unsafe { typed.read_unaligned() })
    }

    /// Fill `values` from the start of the window.
    pub fn read_many<T: Copy + FromBytes>(&self, values: &mut [T]) -> Result<()> {
        self.check_read_access()?;
        let copy_len = size_of_val(values);
        if self.len < copy_len {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "value larger than mapping",
            ));
        }
        let src = self.ptr.as_ptr() as *const u8;
        let dst = values.as_mut_ptr() as *mut u8;
        // Safety: `src` is valid for `copy_len` reads (checked above); `dst`
        // comes from a live mutable reference and cannot overlap a guest
        // mapping; byte alignment suits both.
        unsafe {
            copy_nonoverlapping(src, dst, copy_len);
        }
        Ok(())
    }

    /// Read bytes into `buf`, truncating at the end of the window.
    ///
    /// Returns the number of bytes read.
    pub fn read_bytes(&self, buf: &mut [u8]) -> Result<usize> {
        let read_len = usize::min(buf.len(), self.len);
        self.read_many(&mut buf[..read_len])?;
        Ok(read_len)
    }

    /// Write `value` at the start of the window.
    pub fn write<T: Copy>(&self, value: &T) -> Result<()> {
        self.check_write_access()?;
        if self.len < size_of::<T>() {
            return Err(Error::new(ErrorKind::InvalidData, "buffer too small"));
        }
        let typed = self.ptr.as_ptr() as *mut T;
        unsafe {
            typed.write_unaligned(*value);
        }
        Ok(())
    }

    /// Write `values` at the start of the window.
    pub fn write_many<T: Copy>(&self, values: &[T]) -> Result<()> {
        self.check_write_access()?;
        let copy_len = size_of_val(values);
        if self.len < copy_len {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "value larger than mapping",
            ));
        }
        let src = values.as_ptr() as *const u8;
        let dst = self.ptr.as_ptr();
        // Safety: mirror image of read_many() above.
        unsafe {
            copy_nonoverlapping(src, dst, copy_len);
        }
        Ok(())
    }

    /// Write bytes from `buf`, truncating at the end of the window.
    ///
    /// Returns the number of bytes written.
    pub fn write_bytes(&self, buf: &[u8]) -> Result<usize> {
        let write_len = usize::min(buf.len(), self.len);
        self.write_many(&buf[..write_len])?;
        Ok(write_len)
    }

    /// Write `val` to the first `count` bytes of the window (truncated).
    pub fn write_byte(&self, val: u8, count: usize) -> Result<usize> {
        self.check_write_access()?;
        let to_copy = usize::min(count, self.len);
        unsafe {
            self.ptr.as_ptr().write_bytes(val, to_copy);
        }
        Ok(to_copy)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn prot(&self) -> Prot {
        self.prot
    }
}

// Safety: `SubMapping` exposes no references to the underlying bytes.
unsafe impl Send for SubMapping<'_> {}
unsafe impl Sync for SubMapping<'_> {}

/// One entry of the guest-physical memory table.
#[derive(Clone)]
pub struct MapRegion {
    pub gpa: u64,
    pub len: usize,
    pub mapping: Arc<Mapping>,
}

impl MapRegion {
    pub fn new(gpa: u64, len: usize, mapping: Arc<Mapping>) -> Self {
        assert!(len <= mapping.len());
        Self { gpa, len, mapping }
    }
}

/// An immutable snapshot of the guest-physical memory layout.
///
/// Translation results borrow from the snapshot; holders of an
/// `Arc<MemCtx>` keep every mapping in the table alive.
pub struct MemCtx {
    regions: Vec<MapRegion>,
}

impl MemCtx {
    pub fn new(mut regions: Vec<MapRegion>) -> Result<Arc<Self>> {
        regions.sort_by_key(|r| r.gpa);
        for pair in regions.windows(2) {
            if pair[0].gpa + pair[0].len as u64 > pair[1].gpa {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "overlapping guest memory regions",
                ));
            }
        }
        Ok(Arc::new(Self { regions }))
    }

    /// Translate `[addr, addr + len)`, requiring the whole range to lie
    /// within a single region and `req_prot` to be permitted.
    fn region_covered(
        &self,
        addr: GuestAddr,
        len: usize,
        req_prot: Prot,
    ) -> Option<SubMapping<'_>> {
        let start = addr.0;
        let end = start.checked_add(len as u64)?;
        let idx = match self.regions.binary_search_by_key(&start, |r| r.gpa) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let region = &self.regions[idx];
        if start < region.gpa || end > region.gpa + region.len as u64 {
            return None;
        }
        let offset = (start - region.gpa) as usize;
        let sub = SubMapping::new_base(&region.mapping).subregion(offset, len)?;
        if sub.prot().contains(req_prot) {
            Some(sub)
        } else {
            None
        }
    }

    /// Read a typed value from a guest address.
    pub fn read<T: Copy + FromBytes>(&self, addr: GuestAddr) -> Option<T> {
        self.region_covered(addr, size_of::<T>(), Prot::READ)?.read().ok()
    }

    /// Read `count` consecutive `T`s starting at `base`.
    pub fn read_many<T: Copy + FromBytes>(
        &self,
        base: GuestAddr,
        count: usize,
    ) -> Option<MemMany<'_, T>> {
        let mapping =
            self.region_covered(base, size_of::<T>() * count, Prot::READ)?;
        Some(MemMany { mapping, count, phantom: PhantomData })
    }

    /// Write a typed value to a guest address.
    pub fn write<T: Copy>(&self, addr: GuestAddr, val: &T) -> bool {
        match self.region_covered(addr, size_of::<T>(), Prot::WRITE) {
            Some(mapping) => mapping.write(val).is_ok(),
            None => false,
        }
    }

    /// Copy up to `buf.len()` or `len` bytes (whichever is smaller) from
    /// guest memory into `buf`.
    pub fn read_into(
        &self,
        addr: GuestAddr,
        buf: &mut [u8],
        len: usize,
    ) -> Option<usize> {
        let len = usize::min(buf.len(), len);
        let mapping = self.region_covered(addr, len, Prot::READ)?;
        mapping.read_bytes(&mut buf[..len]).ok()
    }

    /// Copy up to `buf.len()` or `len` bytes (whichever is smaller) from
    /// `buf` into guest memory.
    pub fn write_from(
        &self,
        addr: GuestAddr,
        buf: &[u8],
        len: usize,
    ) -> Option<usize> {
        let len = usize::min(buf.len(), len);
        let mapping = self.region_covered(addr, len, Prot::WRITE)?;
        mapping.write_bytes(&buf[..len]).ok()
    }

    pub fn writable_region(&self, region: &GuestRegion) -> Option<SubMapping<'_>> {
        self.region_covered(region.0, region.1, Prot::WRITE)
    }

    pub fn readable_region(&self, region: &GuestRegion) -> Option<SubMapping<'_>> {
        self.region_covered(region.0, region.1, Prot::READ)
    }
}

/// A translated run of consecutive `T`s in guest memory.
pub struct MemMany<'a, T: Copy> {
    mapping: SubMapping<'a>,
    count: usize,
    phantom: PhantomData<T>,
}

impl<T: Copy + FromBytes> MemMany<'_, T> {
    /// Get the object at `pos`, if it is in range.
    pub fn get(&self, pos: usize) -> Option<T> {
        if pos < self.count {
            let sz = size_of::<T>();
            self.mapping.subregion(pos * sz, sz)?.read().ok()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }
}

/// The mutable, shared handle onto the current memory table.
///
/// `access()` pins the live snapshot for as long as the returned
/// `Arc<MemCtx>` is held.  `update()` atomically replaces the snapshot; the
/// old table is freed when its refcount reaches zero and no request still
/// holds a pending translation into it.
#[derive(Default)]
pub struct AddressSpace {
    current: Mutex<Option<Arc<MemCtx>>>,
}

impl AddressSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pin and return the current snapshot.
    pub fn access(&self) -> Option<Arc<MemCtx>> {
        self.current.lock().unwrap().clone()
    }

    /// Install a new memory table.
    pub fn update(&self, ctx: Arc<MemCtx>) {
        *self.current.lock().unwrap() = Some(ctx);
    }

    /// Tear down the table.  In-flight pins keep the old snapshot alive.
    pub fn clear(&self) {
        *self.current.lock().unwrap() = None;
    }
}
