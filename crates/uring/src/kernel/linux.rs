//! Linux implementation: raw `syscall(2)` for io_uring, libc for mappings.

use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

use uring_core::sys::IoUringParams;
use uring_core::Errno;

use super::Kernel;

#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxKernel;

#[inline]
fn check(ret: libc::c_long) -> Result<u32, Errno> {
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret as u32)
    }
}

impl Kernel for LinuxKernel {
    fn setup(&self, entries: u32, params: &mut IoUringParams) -> Result<RawFd, Errno> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_uring_setup,
                entries as libc::c_long,
                params as *mut IoUringParams,
            )
        };
        check(ret).map(|fd| fd as RawFd)
    }

    unsafe fn enter(
        &self,
        fd: RawFd,
        to_submit: u32,
        min_complete: u32,
        flags: u32,
        arg: *const libc::c_void,
        argsz: usize,
    ) -> Result<u32, Errno> {
        let ret = libc::syscall(
            libc::SYS_io_uring_enter,
            fd as libc::c_long,
            to_submit as libc::c_long,
            min_complete as libc::c_long,
            flags as libc::c_long,
            arg,
            argsz,
        );
        check(ret)
    }

    unsafe fn register(
        &self,
        fd: RawFd,
        opcode: u32,
        arg: *const libc::c_void,
        nr_args: u32,
    ) -> Result<u32, Errno> {
        let ret = libc::syscall(
            libc::SYS_io_uring_register,
            fd as libc::c_long,
            opcode as libc::c_long,
            arg,
            nr_args as libc::c_long,
        );
        check(ret)
    }

    fn mmap_ring(&self, fd: RawFd, len: usize, offset: u64) -> Result<NonNull<u8>, Errno> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        NonNull::new(ptr.cast()).ok_or(Errno::ENOMEM)
    }

    fn mmap_anonymous(&self, len: usize, huge: bool) -> Result<NonNull<u8>, Errno> {
        let mut flags = libc::MAP_SHARED | libc::MAP_ANONYMOUS;
        if huge {
            flags |= libc::MAP_HUGETLB;
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        NonNull::new(ptr.cast()).ok_or(Errno::ENOMEM)
    }

    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) {
        libc::munmap(ptr.as_ptr().cast(), len);
    }

    fn close(&self, fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn page_size(&self) -> usize {
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        }
    }
}
