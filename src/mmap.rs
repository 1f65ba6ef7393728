//! Memory-mapped file handling.
//!
//! Input images and their dependencies are read through a read-only private
//! mapping. The loader copies what it needs into the emulated address space,
//! so a mapping only lives as long as one image load.

use crate::Result;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// A memory-mapped file.
pub struct MappedFile {
    fd: libc::c_int,
    addr: *mut libc::c_void,
    size: usize,
}

impl MappedFile {
    /// Open a file and return a `MappedFile` object.
    pub fn open(path: &Path) -> Result<MappedFile> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null byte")
        })?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
        let stat_ret = unsafe { libc::fstat(fd, &mut statbuf as *mut libc::stat) };
        if stat_ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(err.into());
        }
        if (statbuf.st_mode & libc::S_IFMT) != libc::S_IFREG {
            unsafe {
                libc::close(fd);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )
            .into());
        }
        let size = statbuf.st_size as usize;
        if size == 0 {
            // mmap rejects empty mappings.
            return Ok(Self {
                fd,
                addr: std::ptr::null_mut(),
                size,
            });
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(err.into());
        }
        Ok(Self { fd, addr, size })
    }

    /// The file contents.
    pub fn data(&self) -> &[u8] {
        if self.addr.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Close the mapped file.
    fn close(&mut self) {
        unsafe {
            if !self.addr.is_null() {
                libc::munmap(self.addr, self.size);
            }
            libc::close(self.fd);
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        self.close();
    }
}
