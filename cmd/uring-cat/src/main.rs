//! uring-cat: write a file to stdout through one ring.
//!
//! A regular file going into a pipe is spliced, one pipe-buffer at a time,
//! without copying through user space. Anything else falls back to a linked
//! readv -> writev pair over a single buffer.
//!
//! Usage:
//!     ./target/release/uring-cat <file> | pv -r > /dev/null   # splice
//!     ./target/release/uring-cat <file> > copy                # fallback

use std::error::Error;
use std::fs::{File, Metadata};
use std::mem::ManuallyDrop;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, FromRawFd};

use uring::sys::setup_flags;
use uring::{kdebug, kwarn};
use uring::{Cqe, Errno, Ring, RingConfig, UringError};

const QUEUE_DEPTH: u32 = 2;
const BATCH_SIZE: u64 = 64 * 1024;

type BoxResult<T> = Result<T, Box<dyn Error>>;

/// Wait for the next completion and consume it.
fn reap(ring: &mut Ring) -> BoxResult<Cqe> {
    loop {
        match ring.wait_cqe() {
            Ok(cqe) => {
                ring.cqe_seen();
                return match cqe.error() {
                    Some(e) => Err(format!("completion {}: {}", cqe.user_data, e).into()),
                    None => Ok(cqe),
                };
            }
            Err(e) if e.is_retryable() => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn cat_splice(ring: &mut Ring, in_fd: i32, size: u64, out_fd: i32) -> BoxResult<()> {
    let pipe_size = unsafe { libc::fcntl(out_fd, libc::F_GETPIPE_SZ) };
    if pipe_size < 0 {
        return Err(format!("fcntl(F_GETPIPE_SZ): {}", Errno::last()).into());
    }
    kdebug!("splicing {} bytes, pipe buffer {}", size, pipe_size);

    let mut remaining = size;
    let mut off = 0u64;
    while remaining > 0 {
        let chunk = remaining.min(pipe_size as u64);
        let sqe = ring.get_sqe()?;
        sqe.prep_splice(in_fd, off as i64, out_fd, -1, chunk as u32, 0);
        sqe.set_data(off);
        ring.submit()?;

        let done = reap(ring)?.res as u64;
        if done == 0 {
            return Err(format!("unexpected end of input at offset {}", off).into());
        }
        remaining -= done.min(remaining);
        off += done;
    }
    Ok(())
}

fn cat_fallback(ring: &mut Ring, in_fd: i32, size: u64, out_fd: i32) -> BoxResult<()> {
    let mut buf = vec![0u8; BATCH_SIZE as usize];
    let mut remaining = size;
    let mut off = 0u64;

    while remaining > 0 {
        let chunk = remaining.min(BATCH_SIZE);
        let iov = [libc::iovec { iov_base: buf.as_mut_ptr().cast(), iov_len: chunk as usize }];

        let sqe = ring.get_sqe()?;
        sqe.prep_readv(in_fd, &iov, off);
        sqe.set_data(off).set_link();
        let sqe = ring.get_sqe()?;
        // u64::MAX: write at the current position, stdout may not seek.
        sqe.prep_writev(out_fd, &iov, u64::MAX);
        sqe.set_data(off);
        ring.submit()?;

        for _ in 0..2 {
            reap(ring)?;
        }
        off += chunk;
        remaining -= chunk;
    }
    Ok(())
}

fn is_fifo(meta: &Metadata) -> bool {
    meta.file_type().is_fifo()
}

fn open_ring() -> uring::Result<Ring> {
    let config = RingConfig::from_env().entries(QUEUE_DEPTH);
    match Ring::with_config(&config.clone().flag(setup_flags::NO_SQARRAY)) {
        Err(UringError::Setup(Errno::EINVAL)) => {
            kwarn!("NO_SQARRAY unsupported, falling back to an SQ index array");
            Ring::with_config(&config)
        }
        other => other,
    }
}

fn run(path: &str) -> BoxResult<()> {
    let input = File::open(path).map_err(|e| format!("open {}: {}", path, e))?;
    let in_meta = input.metadata()?;
    // Borrow stdout without taking ownership of descriptor 1.
    let stdout = ManuallyDrop::new(unsafe { File::from_raw_fd(libc::STDOUT_FILENO) });
    let out_meta = stdout.metadata()?;

    let mut ring = open_ring()?;
    let (in_fd, out_fd) = (input.as_raw_fd(), stdout.as_raw_fd());
    if in_meta.is_file() && is_fifo(&out_meta) {
        cat_splice(&mut ring, in_fd, in_meta.len(), out_fd)
    } else {
        cat_fallback(&mut ring, in_fd, in_meta.len(), out_fd)
    }
}

fn main() {
    uring::init_logging();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("{}: file", args.first().map_or("uring-cat", String::as_str));
        std::process::exit(1);
    }

    if let Err(e) = run(&args[1]) {
        eprintln!("uring-cat: {}", e);
        std::process::exit(1);
    }
}
