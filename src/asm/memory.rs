//! Executable memory management using mmap.
//!
//! Code is written while the mapping is read-write and then flipped to
//! read-execute. Installed code can still be patched afterwards through
//! [`ExecutableMemory::patch_word`], which updates one aligned machine word
//! with a single atomic store so a concurrently executing thread observes
//! either the old or the new bytes.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

static PATCH_LOCK: Mutex<()> = Mutex::new(());

/// Error type for memory operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
    #[error("write of {len} bytes at offset {offset} is out of bounds")]
    OutOfBounds { offset: usize, len: usize },
    #[error("patch offset {0} is not word aligned")]
    Misaligned(usize),
}

/// A block of executable memory allocated via mmap.
///
/// The memory is initially writable. Call `make_executable()` to make it
/// executable (and read-only) before calling the generated code.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a new block of memory with the given size.
    /// The memory is initially writable but not executable.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = Self::page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    /// Get the page size for the current system.
    fn page_size() -> usize {
        #[cfg(unix)]
        {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    /// Allocate memory using mmap.
    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // Plain heap memory; it will not be executable on most systems
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Get a pointer to the memory.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Start address of the mapping.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Get the size of the allocated memory.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `address` falls inside this mapping.
    pub fn contains(&self, address: usize) -> bool {
        address >= self.address() && address < self.address() + self.size
    }

    /// Write bytes to the memory at the given offset.
    /// Returns an error if the memory is executable or if the write would overflow.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        self.check_bounds(offset, data.len())?;

        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }

        Ok(())
    }

    /// Copy of `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.check_bounds(offset, len)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds { offset, len }),
        }
    }

    /// Make the memory executable (and read-only).
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        self.protect(0, self.size, Protection::ReadExecute)?;
        self.executable = true;
        Ok(())
    }

    /// Check if the memory is executable.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Atomically replace the aligned 8-byte word at `offset` with
    /// `update(old)`. Returns the previous word.
    ///
    /// While the store happens the containing page is mapped
    /// read-write-execute so other threads can keep running code on it.
    pub fn patch_word(
        &self,
        offset: usize,
        update: impl Fn(u64) -> u64,
    ) -> Result<u64, MemoryError> {
        if offset % 8 != 0 {
            return Err(MemoryError::Misaligned(offset));
        }
        self.check_bounds(offset, 8)?;
        // patchers must not flip a page back to read-execute under each other
        let _guard = PATCH_LOCK.lock();

        let page_size = Self::page_size();
        let page_start = offset & !(page_size - 1);
        if self.executable {
            self.protect(page_start, page_size, Protection::ReadWriteExecute)?;
        }

        // SAFETY: offset is in bounds and 8-byte aligned; the mapping is page aligned
        let word = unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU64) };
        let old = word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| Some(update(w)))
            .unwrap_or_else(|w| w);

        if self.executable {
            self.protect(page_start, page_size, Protection::ReadExecute)?;
        }
        Ok(old)
    }

    /// Read the aligned 8-byte word at `offset`.
    pub fn read_word(&self, offset: usize) -> Result<u64, MemoryError> {
        if offset % 8 != 0 {
            return Err(MemoryError::Misaligned(offset));
        }
        self.check_bounds(offset, 8)?;
        // SAFETY: checked above
        let word = unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU64) };
        Ok(word.load(Ordering::Acquire))
    }

    #[cfg(unix)]
    fn protect(&self, offset: usize, len: usize, prot: Protection) -> Result<(), MemoryError> {
        let flags = match prot {
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        };
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().add(offset) as *mut libc::c_void,
                len,
                flags,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn protect(&self, _offset: usize, _len: usize, _prot: Protection) -> Result<(), MemoryError> {
        Ok(())
    }

    /// Get a function pointer to the memory at `offset`.
    /// The memory must be executable.
    ///
    /// # Safety
    /// The caller must ensure that the memory contains valid machine code
    /// for the target architecture at `offset` and that `F` matches its ABI.
    pub unsafe fn as_fn<F>(&self, offset: usize) -> Option<F>
    where
        F: Copy,
    {
        if !self.executable || offset >= self.size {
            return None;
        }
        if std::mem::size_of::<F>() != std::mem::size_of::<fn()>() {
            return None;
        }
        let entry = unsafe { self.ptr.as_ptr().add(offset) } as *const u8;
        // SAFETY: caller guarantees the memory contains valid code
        Some(unsafe { std::mem::transmute_copy(&entry) })
    }
}

#[derive(Debug, Clone, Copy)]
enum Protection {
    ReadExecute,
    ReadWriteExecute,
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
        #[cfg(not(unix))]
        if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::page_size()) {
            unsafe {
                std::alloc::dealloc(self.ptr.as_ptr(), layout);
            }
        }
    }
}

// The mapping is owned; mutation after publication only goes through atomic
// word stores in patch_word.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}
