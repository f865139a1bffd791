//! Acquiring the contiguous shared byte range the pool is carved out of
//! (spec §2, §3.1, §5).
//!
//! Grounded on the teacher's `os.rs` (`os_page_size`, `os_mem_alloc`,
//! `unix_mmap`/`win_virtual_alloc`), generalized from private anonymous
//! pages, which is all a single-process global allocator needs, to
//! `MAP_SHARED` mappings a supervisor creates before forking workers
//! (spec §3.5), plus a named/file-backed variant for the on-disk layout
//! spec §6.2 describes.

use crate::error::SlabError;
use core::ptr::null_mut;

#[cfg(not(windows))]
use std::ffi::CString;

/// A mapped, page-aligned byte range, shared read-write by every process
/// that holds one. Dropping the last `Region` in a process unmaps it; the
/// underlying memory (and any other process's mapping of it) is untouched
/// until every process has done the same; this mirrors `ngx_shm_free`,
/// which only unmaps the calling process's view.
pub struct Region {
    ptr: *mut u8,
    len: usize,
    #[cfg(not(windows))]
    fd: Option<libc::c_int>,
    #[cfg(windows)]
    handle: Option<winapi::um::winnt::HANDLE>,
    /// `false` for a handle built with [`Region::from_raw_for_test`], whose
    /// `ptr` is borrowed from another `Region` that owns the actual mapping.
    owns_mapping: bool,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Size, in bytes, of the platform's native page (spec §3.2's `P`).
    pub fn os_page_size() -> usize {
        #[cfg(not(windows))]
        {
            let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if result > 0 {
                result as usize
            } else {
                4096
            }
        }
        #[cfg(windows)]
        {
            use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
            unsafe {
                let mut si: SYSTEM_INFO = std::mem::zeroed();
                GetSystemInfo(&mut si);
                if si.dwPageSize > 0 {
                    si.dwPageSize as usize
                } else {
                    4096
                }
            }
        }
    }

    /// Maps `len` bytes of anonymous memory shared between this process and
    /// any process that `fork()`s from it afterwards (the supervisor/worker
    /// model spec §3.5 assumes). `len` is rounded up to a whole number of
    /// pages.
    pub fn anonymous(len: usize) -> Result<Region, SlabError> {
        let page = Self::os_page_size();
        let len = round_up(len, page);
        #[cfg(not(windows))]
        {
            let ptr = unsafe {
                libc::mmap(
                    null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                log::warn!("mmap(MAP_SHARED|MAP_ANONYMOUS) failed: errno {}", errno::errno());
                return Err(SlabError::RegionInit("mmap(MAP_SHARED|MAP_ANONYMOUS) failed"));
            }
            Ok(Region { ptr: ptr as *mut u8, len, fd: None, owns_mapping: true })
        }
        #[cfg(windows)]
        {
            use winapi::shared::minwindef::DWORD;
            use winapi::um::handleapi::INVALID_HANDLE_VALUE;
            use winapi::um::memoryapi::{CreateFileMappingW, FILE_MAP_ALL_ACCESS, MapViewOfFile};
            use winapi::um::winnt::PAGE_READWRITE;
            let high = (len as u64 >> 32) as DWORD;
            let low = (len as u64 & 0xffff_ffff) as DWORD;
            let handle = unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    null_mut(),
                    PAGE_READWRITE,
                    high,
                    low,
                    null_mut(),
                )
            };
            if handle.is_null() {
                return Err(SlabError::RegionInit("CreateFileMappingW failed"));
            }
            let ptr = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, len) };
            if ptr.is_null() {
                unsafe { winapi::um::handleapi::CloseHandle(handle) };
                return Err(SlabError::RegionInit("MapViewOfFile failed"));
            }
            Ok(Region { ptr: ptr as *mut u8, len, handle: Some(handle), owns_mapping: true })
        }
    }

    /// Opens (creating if `create` is set) a named shared-memory object of
    /// `len` bytes, for the file-backed persisted layout of spec §6.2. Two
    /// processes that open the same `name` observe the same bytes.
    #[cfg(not(windows))]
    pub fn open_named(name: &str, len: usize, create: bool) -> Result<Region, SlabError> {
        let page = Self::os_page_size();
        let len = round_up(len, page);
        let cname = CString::new(name).map_err(|_| SlabError::RegionInit("name has an embedded NUL"))?;
        let mut flags = libc::O_RDWR;
        if create {
            flags |= libc::O_CREAT;
        }
        let fd = unsafe { libc::shm_open(cname.as_ptr(), flags, 0o600) };
        if fd < 0 {
            log::warn!("shm_open({}) failed: errno {}", name, errno::errno());
            return Err(SlabError::RegionInit("shm_open failed"));
        }
        if create {
            if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
                log::warn!("ftruncate({}, {}) failed: errno {}", name, len, errno::errno());
                unsafe { libc::close(fd) };
                return Err(SlabError::RegionInit("ftruncate failed"));
            }
        }
        let ptr = unsafe {
            libc::mmap(null_mut(), len, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED, fd, 0)
        };
        if ptr == libc::MAP_FAILED {
            log::warn!("mmap({}) failed: errno {}", name, errno::errno());
            unsafe { libc::close(fd) };
            return Err(SlabError::RegionInit("mmap of named shared memory failed"));
        }
        Ok(Region { ptr: ptr as *mut u8, len, fd: Some(fd), owns_mapping: true })
    }

    #[cfg(windows)]
    pub fn open_named(name: &str, len: usize, create: bool) -> Result<Region, SlabError> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;
        use winapi::shared::minwindef::{DWORD, FALSE};
        use winapi::um::handleapi::INVALID_HANDLE_VALUE;
        use winapi::um::memoryapi::{CreateFileMappingW, FILE_MAP_ALL_ACCESS, MapViewOfFile, OpenFileMappingW};
        use winapi::um::winnt::PAGE_READWRITE;
        let page = Self::os_page_size();
        let len = round_up(len, page);
        let mut wide: Vec<u16> = OsStr::new(name).encode_wide().collect();
        wide.push(0);
        let high = (len as u64 >> 32) as DWORD;
        let low = (len as u64 & 0xffff_ffff) as DWORD;
        let handle = unsafe {
            if create {
                CreateFileMappingW(INVALID_HANDLE_VALUE, null_mut(), PAGE_READWRITE, high, low, wide.as_ptr())
            } else {
                OpenFileMappingW(FILE_MAP_ALL_ACCESS, FALSE, wide.as_ptr())
            }
        };
        if handle.is_null() {
            return Err(SlabError::RegionInit("CreateFileMappingW/OpenFileMappingW failed"));
        }
        let ptr = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, len) };
        if ptr.is_null() {
            unsafe { winapi::um::handleapi::CloseHandle(handle) };
            return Err(SlabError::RegionInit("MapViewOfFile failed"));
        }
        Ok(Region { ptr: ptr as *mut u8, len, handle: Some(handle), owns_mapping: true })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address one past the last byte of the region (spec §3.1's "end").
    #[inline]
    pub fn end_addr(&self) -> usize {
        self.ptr as usize + self.len
    }

    /// Wraps an already-mapped range without taking ownership of the
    /// mapping, for tests standing in for a second process attaching to a
    /// region this one process already owns (a real worker would `fork()`
    /// and inherit the mapping instead; test harnesses can't fork a second
    /// handle onto the same pages, so this borrows the existing one).
    /// Dropping the returned `Region` does not unmap anything.
    ///
    /// # Safety
    /// `ptr` must remain validly mapped for `len` bytes for as long as the
    /// returned `Region` is used.
    #[cfg(any(test, feature = "test-util"))]
    pub unsafe fn from_raw_for_test(ptr: *mut u8, len: usize) -> Region {
        Region {
            ptr,
            len,
            #[cfg(not(windows))]
            fd: None,
            #[cfg(windows)]
            handle: None,
            owns_mapping: false,
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.ptr.is_null() || !self.owns_mapping {
            return;
        }
        #[cfg(not(windows))]
        {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
            if let Some(fd) = self.fd.take() {
                unsafe {
                    libc::close(fd);
                }
            }
        }
        #[cfg(windows)]
        {
            unsafe {
                winapi::um::memoryapi::UnmapViewOfFile(self.ptr as *mut winapi::ctypes::c_void);
            }
            if let Some(handle) = self.handle.take() {
                unsafe {
                    winapi::um::handleapi::CloseHandle(handle);
                }
            }
        }
    }
}

fn round_up(size: usize, align: usize) -> usize {
    if align == 0 {
        return size;
    }
    let rem = size % align;
    if rem == 0 {
        size
    } else {
        size + (align - rem)
    }
}
