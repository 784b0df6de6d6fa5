// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! Maps windows of physical address space into the process.
//!
//! On Linux this goes through `/dev/mem`, which requires `CAP_SYS_RAWIO` and
//! a kernel that doesn't restrict access to the ECAM range
//! (`CONFIG_STRICT_DEVMEM` / `iomem=relaxed`).
//!
//! SAFETY: Everything handed out by this module points at device memory.
//! All accesses must be volatile and stay inside the mapped length.

use crate::error::{DoeError, Result};
use nix::fcntl::{open, OFlag};
use nix::libc::off_t;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use once_cell::unsync::OnceCell;
use std::num::NonZeroUsize;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

pub const DEV_MEM_PATH: &str = "/dev/mem";

/// A source of physical memory mappings.
pub trait PhysicalMemory {
    /// Maps `length` bytes of physical memory starting at `base`.
    fn map(&self, base: u64, length: usize) -> Result<NonNull<u8>>;

    /// Removes a mapping created by [`PhysicalMemory::map`].
    ///
    /// # Safety
    ///
    /// `ptr` and `length` must come from a single successful `map()` call of
    /// this instance, and nothing may access the window afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, length: usize);
}

/// # Summary
///
/// Maps `length` bytes at physical address `base` and returns an owning
/// window. The window is unmapped when it is dropped, released or goes out
/// of scope on an error path.
pub fn map_physical<M: PhysicalMemory + ?Sized>(
    mem: &M,
    base: u64,
    length: usize,
) -> Result<MappedWindow<'_, M>> {
    let ptr = mem.map(base, length)?;
    trace!("mapped {length:#x} bytes at {base:#x} -> {ptr:p}");
    Ok(MappedWindow {
        mem,
        ptr,
        base,
        length,
    })
}

/// An owned mapping of a physical address range.
pub struct MappedWindow<'m, M: PhysicalMemory + ?Sized> {
    mem: &'m M,
    ptr: NonNull<u8>,
    base: u64,
    length: usize,
}

impl<'m, M: PhysicalMemory + ?Sized> MappedWindow<'m, M> {
    fn check(&self, offset: usize, width: usize) {
        assert!(
            offset % width == 0 && offset + width <= self.length,
            "access of {width} bytes at {offset:#x} outside of a {:#x} byte window",
            self.length
        );
    }

    /// Volatile 16-bit read at `offset` bytes into the window.
    ///
    /// # Panics
    ///
    /// Panics if the access is misaligned or outside the window.
    pub fn read_u16(&self, offset: usize) -> u16 {
        self.check(offset, 2);
        // SAFETY: In bounds and aligned, checked above.
        unsafe { self.ptr.as_ptr().add(offset).cast::<u16>().read_volatile() }
    }

    /// Volatile 32-bit read at `offset` bytes into the window.
    ///
    /// # Panics
    ///
    /// Panics if the access is misaligned or outside the window.
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        // SAFETY: In bounds and aligned, checked above.
        unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() }
    }

    /// Unmaps the window now.
    pub fn release(self) {
        drop(self)
    }

    /// Keeps the mapping alive for the rest of the process and returns its
    /// address. The mapping is never unmapped.
    pub fn promote(self) -> NonNull<u8> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl<M: PhysicalMemory + ?Sized> Drop for MappedWindow<'_, M> {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `length` come from `map()` and the window is
        // consumed here.
        unsafe { self.mem.unmap(self.ptr, self.length) };
        trace!("unmapped {:#x} bytes at {:#x}", self.length, self.base);
    }
}

/// Physical memory through the Linux `/dev/mem` character device.
///
/// The device is opened on the first mapping request and closed when this
/// instance is dropped. Existing mappings stay valid after that.
#[derive(Debug)]
pub struct DevMem {
    path: PathBuf,
    fd: OnceCell<OwnedFd>,
}

impl Default for DevMem {
    fn default() -> Self {
        DevMem::new(DEV_MEM_PATH)
    }
}

impl DevMem {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        DevMem {
            path: path.as_ref().to_path_buf(),
            fd: OnceCell::new(),
        }
    }

    fn fd(&self) -> Result<&OwnedFd> {
        self.fd.get_or_try_init(|| {
            let raw = open(&self.path, OFlag::O_RDWR | OFlag::O_SYNC, Mode::empty()).map_err(
                |errno| {
                    error!("Failed to open {:?}: {errno}", self.path);
                    DoeError::MapUnavailable {
                        path: self.path.clone(),
                        errno,
                    }
                },
            )?;
            debug!("Opened {:?}", self.path);
            // SAFETY: `open()` just handed us this descriptor.
            Ok(unsafe { OwnedFd::from_raw_fd(raw) })
        })
    }
}

impl PhysicalMemory for DevMem {
    fn map(&self, base: u64, length: usize) -> Result<NonNull<u8>> {
        let fd = self.fd()?;
        let failed = |errno| DoeError::MapFailed {
            base,
            length,
            errno,
        };

        let len = NonZeroUsize::new(length).ok_or_else(|| failed(nix::errno::Errno::EINVAL))?;
        let offset = off_t::try_from(base).map_err(|_| failed(nix::errno::Errno::EOVERFLOW))?;

        // SAFETY: A fresh shared mapping of a device file, no existing Rust
        // memory is aliased.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                offset,
            )
        }
        .map_err(failed)?;

        Ok(ptr.cast())
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, length: usize) {
        if let Err(e) = munmap(ptr.cast(), length) {
            warn!("munmap of {ptr:p} ({length:#x} bytes) failed: {e}");
        }
    }
}
