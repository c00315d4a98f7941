//! Fallback for targets without io_uring. Every ring setup fails with ENOSYS.

use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use uring_core::sys::IoUringParams;
use uring_core::Errno;

use super::Kernel;

#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedKernel;

impl Kernel for UnsupportedKernel {
    fn setup(&self, _entries: u32, _params: &mut IoUringParams) -> Result<RawFd, Errno> {
        Err(Errno::ENOSYS)
    }

    unsafe fn enter(
        &self,
        _fd: RawFd,
        _to_submit: u32,
        _min_complete: u32,
        _flags: u32,
        _arg: *const libc::c_void,
        _argsz: usize,
    ) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    unsafe fn register(
        &self,
        _fd: RawFd,
        _opcode: u32,
        _arg: *const libc::c_void,
        _nr_args: u32,
    ) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    fn mmap_ring(&self, _fd: RawFd, _len: usize, _offset: u64) -> Result<NonNull<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn mmap_anonymous(&self, _len: usize, _huge: bool) -> Result<NonNull<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    unsafe fn munmap(&self, _ptr: NonNull<u8>, _len: usize) {}

    fn close(&self, _fd: RawFd) {}

    fn page_size(&self) -> usize {
        4096
    }
}
