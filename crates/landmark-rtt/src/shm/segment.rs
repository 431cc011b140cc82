// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Anonymous shared memory segment handed to a child process by descriptor.
//!
//! Provides a safe wrapper around `shm_open`, `shm_unlink`, `ftruncate` and
//! `mmap` for a segment that has no name in the filesystem namespace by the
//! time anyone else could look for it.
//!
//! # Segment Lifecycle
//!
//! 1. `ShmSegment::create_anonymous()` opens `/landmark-rtt.<random>` with
//!    `O_EXCL`, unlinks it straight away, sizes and maps it
//! 2. The descriptor stays open; `try_clone_fd()` hands a duplicate to the
//!    child as its stdin, and the child maps the same pages
//! 3. `release()` (or drop) unmaps and closes
//!
//! When `shm_open` is not usable on the host (no `/dev/shm`, `ENOSYS`), the
//! segment is backed by an unnamed temporary file instead. The descriptor
//! handoff is identical.

use super::{Result, ShmError};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;

/// Name collisions tolerated before giving up.
pub const MAX_NAME_ATTEMPTS: usize = 16;

const NAME_PREFIX: &str = "/landmark-rtt.";

/// What the mapping is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Unlinked POSIX shared memory object.
    PosixShm,
    /// Unnamed temporary file.
    TempFile,
}

/// Shared mapping plus the descriptor that keeps it shareable.
///
/// Unmaps and closes on drop.
pub struct ShmSegment {
    /// Null once released
    ptr: *mut u8,
    size: usize,
    fd: Option<OwnedFd>,
    backing: Backing,
}

// SAFETY: the mapping is owned exclusively by this value; all access goes
// through `&self`/`&mut self`, so the borrow checker serialises it within
// this process. Cross-process access is ordered by child lifetimes.
unsafe impl Send for ShmSegment {}

impl ShmSegment {
    /// Create a zeroed, unnamed segment of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns error if neither POSIX shared memory nor a temporary file
    /// can be created and mapped, or if every random name collided.
    pub fn create_anonymous(size: usize) -> Result<Self> {
        match Self::open_posix_unlinked() {
            Ok(fd) => Self::map(fd, size, Backing::PosixShm),
            Err(ShmError::Unsupported(err)) => {
                tracing::warn!(
                    "POSIX shared memory unavailable ({}), falling back to a temporary file",
                    err
                );
                let fd = Self::open_tempfile()?;
                Self::map(fd, size, Backing::TempFile)
            }
            Err(e) => Err(e),
        }
    }

    /// Create a segment backed by an unnamed temporary file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or mapped.
    pub fn create_tempfile(size: usize) -> Result<Self> {
        let fd = Self::open_tempfile()?;
        Self::map(fd, size, Backing::TempFile)
    }

    fn open_posix_unlinked() -> Result<OwnedFd> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = random_name();
            let c_name =
                CString::new(name.as_str()).map_err(|_| ShmError::InvalidName(name.clone()))?;

            // SAFETY:
            // - c_name is a valid null-terminated CString created above
            // - O_CREAT|O_EXCL|O_RDWR creates a new object or fails if the name exists
            // - 0o600 is a valid permission mask
            // - shm_open returns a valid fd on success or -1 on error (checked below)
            let fd = unsafe {
                libc::shm_open(
                    c_name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    0o600, // Owner read/write only
                )
            };

            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EEXIST) => {
                        tracing::debug!("shm name collision on attempt {}: {}", attempt + 1, name);
                        continue;
                    }
                    Some(libc::ENOSYS | libc::ENOENT | libc::EOPNOTSUPP) => {
                        return Err(ShmError::Unsupported(err));
                    }
                    _ => return Err(ShmError::Allocation(err)),
                }
            }

            // SAFETY: fd was just returned by a successful shm_open and is owned by nobody else.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };

            // SAFETY:
            // - c_name is still a valid CString
            // - Unlinking only removes the name; the open fd keeps the object alive
            let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
            if ret < 0 {
                return Err(ShmError::Allocation(io::Error::last_os_error()));
            }

            return Ok(fd);
        }

        Err(ShmError::NameCollision {
            attempts: MAX_NAME_ATTEMPTS,
        })
    }

    fn open_tempfile() -> Result<OwnedFd> {
        let file: File = tempfile::tempfile().map_err(ShmError::Allocation)?;
        Ok(OwnedFd::from(file))
    }

    fn map(fd: OwnedFd, size: usize, backing: Backing) -> Result<Self> {
        let len = libc::off_t::try_from(size).map_err(|_| {
            ShmError::Allocation(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("segment size {size} does not fit in off_t"),
            ))
        })?;

        // SAFETY:
        // - fd is a valid, open, writable descriptor owned by `fd`
        // - ftruncate fails gracefully if len is too large
        let ret = unsafe { libc::ftruncate(fd.as_raw_fd(), len) };
        if ret < 0 {
            return Err(ShmError::Allocation(io::Error::last_os_error()));
        }

        // SAFETY:
        // - First argument is null, letting the kernel choose the address
        // - size matches the length set by ftruncate above
        // - MAP_SHARED makes writes visible to any process mapping the same object
        // - mmap returns MAP_FAILED on error (checked below)
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }

        // Fresh objects are zero-filled by ftruncate already; keep it explicit.
        // SAFETY: ptr is a valid writable mapping of exactly `size` bytes, not yet shared.
        unsafe {
            ptr::write_bytes(ptr.cast::<u8>(), 0, size);
        }

        Ok(Self {
            ptr: ptr.cast::<u8>(),
            size,
            fd: Some(fd),
            backing,
        })
    }

    /// Mapped bytes; empty once released.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        // SAFETY: ptr is a live mapping of `size` bytes owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    /// Mapped bytes, writable; empty once released.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.ptr.is_null() {
            return &mut [];
        }
        // SAFETY: ptr is a live mapping of `size` bytes, and &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    /// Duplicate the backing descriptor, e.g. to become a child's stdin.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::Released`] after release, or the `dup` failure.
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        let fd = self.fd.as_ref().ok_or(ShmError::Released)?;
        fd.try_clone().map_err(ShmError::Descriptor)
    }

    /// Unmap and close. Safe to call more than once.
    pub fn release(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY:
            // - self.ptr came from a successful mmap of exactly self.size bytes
            // - it is nulled right after, so munmap never runs twice on it
            unsafe {
                libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
            }
            self.ptr = ptr::null_mut();
        }
        self.fd = None;
    }

    #[inline]
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.ptr.is_null()
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn backing(&self) -> Backing {
        self.backing
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("size", &self.size)
            .field("backing", &self.backing)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Unpredictable object name, unique per process and call.
fn random_name() -> String {
    format!(
        "{NAME_PREFIX}{}.{:016x}",
        std::process::id(),
        fastrand::u64(..)
    )
}
