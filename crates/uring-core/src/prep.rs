//! Operation encoders.
//!
//! Each `prep_*` call is a pure field setter over a freshly obtained slot.
//! `prep_rw` rewrites every field except `user_data`, so stale values left by
//! the previous occupant of a reused slot never reach the kernel. Set the
//! tag with [`Sqe::set_data`] after preparing.

use crate::sys::{op, op_flags, sqe_flags, KernelTimespec, Sqe};

impl Sqe {
    /// Shared header setter used by every verb.
    #[inline]
    pub fn prep_rw(&mut self, opcode: u8, fd: i32, addr: u64, len: u32, offset: u64) {
        let user_data = self.user_data;
        *self = Sqe {
            opcode,
            fd,
            off: offset,
            addr,
            len,
            user_data,
            ..Sqe::default()
        };
    }

    // ── Tag and flags ──

    #[inline]
    pub fn set_data(&mut self, data: u64) -> &mut Self {
        self.user_data = data;
        self
    }

    #[inline]
    pub fn set_flags(&mut self, flags: u8) -> &mut Self {
        self.flags = flags;
        self
    }

    #[inline]
    pub fn set_link(&mut self) -> &mut Self {
        self.flags |= sqe_flags::IO_LINK;
        self
    }

    #[inline]
    pub fn set_hardlink(&mut self) -> &mut Self {
        self.flags |= sqe_flags::IO_HARDLINK;
        self
    }

    #[inline]
    pub fn set_drain(&mut self) -> &mut Self {
        self.flags |= sqe_flags::IO_DRAIN;
        self
    }

    #[inline]
    pub fn set_async(&mut self) -> &mut Self {
        self.flags |= sqe_flags::ASYNC;
        self
    }

    #[inline]
    pub fn set_fixed_file(&mut self) -> &mut Self {
        self.flags |= sqe_flags::FIXED_FILE;
        self
    }

    #[inline]
    pub fn set_buffer_select(&mut self, group: u16) -> &mut Self {
        self.flags |= sqe_flags::BUFFER_SELECT;
        self.buf_index = group;
        self
    }

    #[inline]
    pub fn set_cqe_skip(&mut self) -> &mut Self {
        self.flags |= sqe_flags::CQE_SKIP_SUCCESS;
        self
    }

    /// Target a direct descriptor slot (`file_index` is 1-based on the wire).
    #[inline]
    pub fn set_target_fixed_file(&mut self, file_index: u32) -> &mut Self {
        self.splice_fd_in = (file_index + 1) as i32;
        self
    }

    // ── Union views ──

    #[inline]
    pub fn splice_off_in(&self) -> u64 {
        self.addr
    }

    #[inline]
    pub fn file_index(&self) -> u32 {
        self.splice_fd_in as u32
    }

    #[inline]
    pub fn poll32_events(&self) -> u32 {
        self.op_flags
    }

    // ── Verbs ──

    pub fn prep_nop(&mut self) {
        self.prep_rw(op::NOP, -1, 0, 0, 0);
    }

    pub fn prep_read(&mut self, fd: i32, buf: *mut u8, len: u32, offset: u64) {
        self.prep_rw(op::READ, fd, buf as u64, len, offset);
    }

    pub fn prep_write(&mut self, fd: i32, buf: *const u8, len: u32, offset: u64) {
        self.prep_rw(op::WRITE, fd, buf as u64, len, offset);
    }

    pub fn prep_readv(&mut self, fd: i32, iovecs: &[libc::iovec], offset: u64) {
        self.prep_rw(op::READV, fd, iovecs.as_ptr() as u64, iovecs.len() as u32, offset);
    }

    pub fn prep_readv2(&mut self, fd: i32, iovecs: &[libc::iovec], offset: u64, flags: i32) {
        self.prep_readv(fd, iovecs, offset);
        self.op_flags = flags as u32;
    }

    pub fn prep_writev(&mut self, fd: i32, iovecs: &[libc::iovec], offset: u64) {
        self.prep_rw(op::WRITEV, fd, iovecs.as_ptr() as u64, iovecs.len() as u32, offset);
    }

    pub fn prep_writev2(&mut self, fd: i32, iovecs: &[libc::iovec], offset: u64, flags: i32) {
        self.prep_writev(fd, iovecs, offset);
        self.op_flags = flags as u32;
    }

    pub fn prep_read_fixed(&mut self, fd: i32, buf: &mut [u8], offset: u64, buf_index: u16) {
        self.prep_rw(op::READ_FIXED, fd, buf.as_mut_ptr() as u64, buf.len() as u32, offset);
        self.buf_index = buf_index;
    }

    pub fn prep_write_fixed(&mut self, fd: i32, buf: &[u8], offset: u64, buf_index: u16) {
        self.prep_rw(op::WRITE_FIXED, fd, buf.as_ptr() as u64, buf.len() as u32, offset);
        self.buf_index = buf_index;
    }

    pub fn prep_readv_fixed(
        &mut self,
        fd: i32,
        iovecs: &[libc::iovec],
        offset: u64,
        flags: i32,
        buf_index: u16,
    ) {
        self.prep_readv2(fd, iovecs, offset, flags);
        self.opcode = op::READV_FIXED;
        self.buf_index = buf_index;
    }

    pub fn prep_writev_fixed(
        &mut self,
        fd: i32,
        iovecs: &[libc::iovec],
        offset: u64,
        flags: i32,
        buf_index: u16,
    ) {
        self.prep_writev2(fd, iovecs, offset, flags);
        self.opcode = op::WRITEV_FIXED;
        self.buf_index = buf_index;
    }

    pub fn prep_fsync(&mut self, fd: i32, fsync_flags: u32) {
        self.prep_rw(op::FSYNC, fd, 0, 0, 0);
        self.op_flags = fsync_flags;
    }

    /// Splice `nbytes` from `fd_in` at `off_in` into `fd_out` at `off_out`.
    /// An offset of `-1` means "current position" (required for pipes).
    pub fn prep_splice(
        &mut self,
        fd_in: i32,
        off_in: i64,
        fd_out: i32,
        off_out: i64,
        nbytes: u32,
        splice_flags: u32,
    ) {
        self.prep_rw(op::SPLICE, fd_out, 0, nbytes, off_out as u64);
        self.addr = off_in as u64;
        self.splice_fd_in = fd_in;
        self.op_flags = splice_flags;
    }

    pub fn prep_tee(&mut self, fd_in: i32, fd_out: i32, nbytes: u32, splice_flags: u32) {
        self.prep_rw(op::TEE, fd_out, 0, nbytes, 0);
        self.addr = 0;
        self.splice_fd_in = fd_in;
        self.op_flags = splice_flags;
    }

    pub fn prep_recvmsg(&mut self, fd: i32, msg: *mut libc::msghdr, flags: u32) {
        self.prep_rw(op::RECVMSG, fd, msg as u64, 1, 0);
        self.op_flags = flags;
    }

    pub fn prep_recvmsg_multishot(&mut self, fd: i32, msg: *mut libc::msghdr, flags: u32) {
        self.prep_recvmsg(fd, msg, flags);
        self.ioprio |= op_flags::RECV_MULTISHOT;
    }

    pub fn prep_sendmsg(&mut self, fd: i32, msg: *const libc::msghdr, flags: u32) {
        self.prep_rw(op::SENDMSG, fd, msg as u64, 1, 0);
        self.op_flags = flags;
    }

    pub fn prep_poll_add(&mut self, fd: i32, poll_mask: u32) {
        self.prep_rw(op::POLL_ADD, fd, 0, 0, 0);
        self.op_flags = poll_mask_to_wire(poll_mask);
    }

    pub fn prep_poll_multishot(&mut self, fd: i32, poll_mask: u32) {
        self.prep_poll_add(fd, poll_mask);
        self.len = op_flags::POLL_ADD_MULTI;
    }

    pub fn prep_poll_remove(&mut self, user_data: u64) {
        self.prep_rw(op::POLL_REMOVE, -1, 0, 0, 0);
        self.addr = user_data;
    }

    pub fn prep_poll_update(
        &mut self,
        old_user_data: u64,
        new_user_data: u64,
        poll_mask: u32,
        flags: u32,
    ) {
        self.prep_rw(op::POLL_REMOVE, -1, 0, flags, new_user_data);
        self.addr = old_user_data;
        self.op_flags = poll_mask_to_wire(poll_mask);
    }

    /// Timeout that fires after `ts`, or once `count` completions were posted.
    ///
    /// `ts` is read by the kernel at submission time and must stay valid
    /// until then.
    pub fn prep_timeout(&mut self, ts: &KernelTimespec, count: u32, flags: u32) {
        self.prep_rw(op::TIMEOUT, -1, ts as *const KernelTimespec as u64, 1, count as u64);
        self.op_flags = flags;
    }

    /// Timeout guarding the previous linked slot.
    pub fn prep_link_timeout(&mut self, ts: &KernelTimespec, flags: u32) {
        self.prep_rw(op::LINK_TIMEOUT, -1, ts as *const KernelTimespec as u64, 1, 0);
        self.op_flags = flags;
    }

    /// Cancel the in-flight operation tagged `user_data`.
    pub fn prep_cancel(&mut self, user_data: u64, flags: u32) {
        self.prep_rw(op::ASYNC_CANCEL, -1, user_data, 0, 0);
        self.op_flags = flags;
    }

    pub fn prep_close(&mut self, fd: i32) {
        self.prep_rw(op::CLOSE, fd, 0, 0, 0);
    }

    pub fn prep_accept(
        &mut self,
        fd: i32,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: i32,
    ) {
        self.prep_rw(op::ACCEPT, fd, addr as u64, 0, addrlen as u64);
        self.op_flags = flags as u32;
    }
}

#[inline]
fn poll_mask_to_wire(poll_mask: u32) -> u32 {
    if cfg!(target_endian = "big") {
        poll_mask.rotate_left(16)
    } else {
        poll_mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirty() -> Sqe {
        Sqe {
            opcode: 0xff,
            flags: 0xff,
            ioprio: 0xffff,
            fd: 77,
            off: u64::MAX,
            addr: u64::MAX,
            len: u32::MAX,
            op_flags: u32::MAX,
            user_data: 0xdead_beef,
            buf_index: 0xffff,
            personality: 0xffff,
            splice_fd_in: -5,
            addr3: u64::MAX,
            pad2: u64::MAX,
        }
    }

    #[test]
    fn test_prep_clears_stale_fields() {
        let mut sqe = dirty();
        sqe.prep_nop();
        assert_eq!(
            sqe,
            Sqe { opcode: op::NOP, fd: -1, user_data: 0xdead_beef, ..Sqe::default() }
        );
    }

    #[test]
    fn test_prep_readv_header() {
        let mut buf = [0u8; 32];
        let iov = [libc::iovec { iov_base: buf.as_mut_ptr().cast(), iov_len: buf.len() }];
        let mut sqe = dirty();
        sqe.prep_readv(3, &iov, 4096);
        sqe.set_data(9).set_link();

        assert_eq!(sqe.opcode, op::READV);
        assert_eq!(sqe.fd, 3);
        assert_eq!(sqe.addr, iov.as_ptr() as u64);
        assert_eq!(sqe.len, 1);
        assert_eq!(sqe.off, 4096);
        assert_eq!(sqe.flags, sqe_flags::IO_LINK);
        assert_eq!(sqe.user_data, 9);
        assert_eq!(sqe.buf_index, 0);
        assert_eq!(sqe.addr3, 0);
    }

    #[test]
    fn test_prep_splice_fields() {
        let mut sqe = dirty();
        sqe.prep_splice(4, 128, 5, -1, 65536, 0);
        assert_eq!(sqe.opcode, op::SPLICE);
        assert_eq!(sqe.fd, 5);
        assert_eq!(sqe.off, u64::MAX);
        assert_eq!(sqe.splice_off_in(), 128);
        assert_eq!(sqe.splice_fd_in, 4);
        assert_eq!(sqe.len, 65536);
        assert_eq!(sqe.op_flags, 0);
    }

    #[test]
    fn test_prep_fixed_variants() {
        let iov: [libc::iovec; 0] = [];
        let mut sqe = Sqe::default();
        sqe.prep_writev_fixed(7, &iov, 0, 0, 3);
        assert_eq!(sqe.opcode, op::WRITEV_FIXED);
        assert_eq!(sqe.buf_index, 3);

        let mut buf = [0u8; 8];
        sqe.prep_read_fixed(7, &mut buf, 16, 2);
        assert_eq!(sqe.opcode, op::READ_FIXED);
        assert_eq!(sqe.len, 8);
        assert_eq!(sqe.buf_index, 2);
    }

    #[test]
    fn test_prep_poll_variants() {
        let mut sqe = Sqe::default();
        sqe.prep_poll_multishot(3, libc::POLLIN as u32);
        assert_eq!(sqe.opcode, op::POLL_ADD);
        assert_eq!(sqe.len, op_flags::POLL_ADD_MULTI);

        sqe.prep_poll_update(1, 2, libc::POLLOUT as u32, op_flags::POLL_UPDATE_EVENTS);
        assert_eq!(sqe.opcode, op::POLL_REMOVE);
        assert_eq!(sqe.addr, 1);
        assert_eq!(sqe.off, 2);
        assert_eq!(sqe.len, op_flags::POLL_UPDATE_EVENTS);
    }

    #[test]
    fn test_prep_cancel_and_timeout() {
        let mut sqe = Sqe::default();
        sqe.prep_cancel(42, 0);
        assert_eq!(sqe.opcode, op::ASYNC_CANCEL);
        assert_eq!(sqe.addr, 42);

        let ts = KernelTimespec { tv_sec: 1, tv_nsec: 0 };
        sqe.prep_timeout(&ts, 3, 0);
        assert_eq!(sqe.opcode, op::TIMEOUT);
        assert_eq!(sqe.off, 3);
        assert_eq!(sqe.len, 1);
        assert_eq!(sqe.addr, &ts as *const KernelTimespec as u64);
    }

    #[test]
    fn test_recvmsg_multishot_sets_ioprio() {
        let mut sqe = dirty();
        sqe.prep_recvmsg_multishot(3, std::ptr::null_mut(), 0);
        assert_eq!(sqe.ioprio, op_flags::RECV_MULTISHOT);
    }
}
