//! uring-cp: copy a file through one ring.
//!
//! Each chunk is a linked pair: readv from the source, then writev of the
//! same buffer to the destination at the same offset. Up to `QUEUE_DEPTH`
//! operations are in flight.
//!
//! When the read of a pair comes up short the kernel cancels the linked
//! write. What happens then is up to the ring's `CancelPolicy`
//! (`URING_CANCEL_POLICY`); unless told otherwise this tool resubmits the
//! whole pair a few times.
//!
//! Usage:
//!     ./target/release/uring-cp <infile> <outfile>

use std::error::Error;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::io::AsRawFd;

use uring::sys::setup_flags;
use uring::{kdebug, kinfo, kwarn};
use uring::{CancelAction, CancelPolicy, Cqe, DefaultKernel, Errno, Kernel, Ring, RingConfig, UringError};

const QUEUE_DEPTH: u32 = 64;
const BATCH_SIZE: u64 = 32 * 1024;
const DEFAULT_RESUBMITS: u32 = 8;

type BoxResult<T> = Result<T, Box<dyn Error>>;

/// One chunk of the file, owned until both halves of its pair completed.
struct Chunk {
    _buf: Vec<u8>,
    iov: libc::iovec,
    off: u64,
    /// Completions still outstanding for the current pair.
    pending: u8,
    retry: bool,
    attempts: u32,
}

impl Chunk {
    fn new(len: usize, off: u64) -> Box<Self> {
        let mut buf = vec![0u8; len];
        let iov = libc::iovec { iov_base: buf.as_mut_ptr().cast(), iov_len: len };
        Box::new(Self { _buf: buf, iov, off, pending: 0, retry: false, attempts: 0 })
    }
}

struct Copier<K: Kernel = DefaultKernel> {
    ring: Ring<K>,
    policy: CancelPolicy,
    in_fd: i32,
    out_fd: i32,
    /// Chunks by tag. Boxed so the iovec address survives slab growth.
    chunks: Vec<Option<Box<Chunk>>>,
    free: Vec<usize>,
    inflight: u32,
    resubmitted: u64,
}

impl<K: Kernel> Copier<K> {
    fn new(ring: Ring<K>, in_fd: i32, out_fd: i32) -> Self {
        Self {
            policy: ring.cancel_policy(),
            ring,
            in_fd,
            out_fd,
            chunks: Vec::new(),
            free: Vec::new(),
            inflight: 0,
            resubmitted: 0,
        }
    }

    fn insert(&mut self, chunk: Box<Chunk>) -> usize {
        match self.free.pop() {
            Some(tag) => {
                self.chunks[tag] = Some(chunk);
                tag
            }
            None => {
                self.chunks.push(Some(chunk));
                self.chunks.len() - 1
            }
        }
    }

    /// Queue the readv -> writev pair for chunk `tag`.
    fn queue_pair(&mut self, tag: usize) -> uring::Result<()> {
        let chunk = self.chunks[tag].as_mut().ok_or(UringError::InvalidConfig("empty slot"))?;
        let iov = std::slice::from_ref(&chunk.iov);

        let sqe = self.ring.get_sqe()?;
        sqe.prep_readv(self.in_fd, iov, chunk.off);
        sqe.set_data(tag as u64).set_link();

        let sqe = self.ring.get_sqe()?;
        sqe.prep_writev(self.out_fd, iov, chunk.off);
        sqe.set_data(tag as u64);

        chunk.pending = 2;
        self.inflight += 2;
        Ok(())
    }

    /// Account for one completion. Returns whether the pair went back in.
    fn handle(&mut self, cqe: Cqe) -> BoxResult<bool> {
        let tag = cqe.user_data as usize;
        let chunk = self
            .chunks
            .get_mut(tag)
            .and_then(Option::as_mut)
            .ok_or_else(|| format!("completion for unknown tag {}", tag))?;

        match self.policy.decide(&cqe, chunk.attempts) {
            CancelAction::Complete(_) => {}
            CancelAction::Resubmit => chunk.retry = true,
            CancelAction::Fail(e) => {
                return Err(format!("chunk at offset {}: {}", chunk.off, e).into());
            }
        }

        chunk.pending -= 1;
        if chunk.pending > 0 {
            return Ok(false);
        }
        if chunk.retry {
            chunk.retry = false;
            chunk.attempts += 1;
            kdebug!("resubmitting chunk at offset {} (attempt {})", chunk.off, chunk.attempts);
            self.resubmitted += 1;
            self.queue_pair(tag)?;
            return Ok(true);
        }

        self.chunks[tag] = None;
        self.free.push(tag);
        Ok(false)
    }

    fn copy(&mut self, mut remaining: u64) -> BoxResult<()> {
        let mut off = 0u64;
        while remaining > 0 || self.inflight > 0 {
            let before = self.inflight;
            while remaining > 0 && self.inflight + 2 <= QUEUE_DEPTH {
                let len = remaining.min(BATCH_SIZE);
                let tag = self.insert(Chunk::new(len as usize, off));
                self.queue_pair(tag)?;
                off += len;
                remaining -= len;
            }
            if self.inflight != before {
                self.ring.submit()?;
            }

            // Reap until another pair fits, or everything once the input is queued.
            while self.inflight > 0 && (remaining == 0 || self.inflight + 2 > QUEUE_DEPTH) {
                let cqe = match self.ring.wait_cqe() {
                    Ok(cqe) => cqe,
                    Err(e) if e.is_retryable() => continue,
                    Err(e) => return Err(e.into()),
                };
                self.ring.cqe_seen();
                self.inflight -= 1;
                if self.handle(cqe)? {
                    self.ring.submit()?;
                }
            }
        }
        Ok(())
    }
}

/// Byte size of a regular file or block device.
fn source_size(file: &mut File) -> std::io::Result<u64> {
    let meta = file.metadata()?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let size = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(size)
}

fn open_ring() -> uring::Result<Ring> {
    let mut config = RingConfig::from_env().entries(QUEUE_DEPTH);
    if std::env::var_os("URING_CANCEL_POLICY").is_none() {
        config = config.cancel_policy(CancelPolicy::Resubmit { max_attempts: DEFAULT_RESUBMITS });
    }
    match Ring::with_config(&config.clone().flag(setup_flags::NO_SQARRAY)) {
        Err(UringError::Setup(Errno::EINVAL)) => {
            // Kernels before 6.6 reject NO_SQARRAY.
            kwarn!("NO_SQARRAY unsupported, falling back to an SQ index array");
            Ring::with_config(&config)
        }
        other => other,
    }
}

fn run(input: &str, output: &str) -> BoxResult<()> {
    let mut src = File::open(input).map_err(|e| format!("open {}: {}", input, e))?;
    let dst = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .map_err(|e| format!("open {}: {}", output, e))?;
    let size = source_size(&mut src)?;

    let ring = open_ring()?;
    kinfo!("copying {} bytes, policy={}, sq={}", size, ring.cancel_policy(), ring.params().sq_entries);

    let mut copier = Copier::new(ring, src.as_raw_fd(), dst.as_raw_fd());
    copier.copy(size)?;

    kinfo!("done: {} bytes, {} pair(s) resubmitted", size, copier.resubmitted);
    Ok(())
}

fn main() {
    uring::init_logging();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("{}: infile outfile", args.first().map_or("uring-cp", String::as_str));
        std::process::exit(1);
    }

    if let Err(e) = run(&args[1], &args[2]) {
        eprintln!("uring-cp: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uring::sim::{Event, SimKernel};

    const IN_FD: i32 = 10;
    const OUT_FD: i32 = 11;

    fn copier(sim: &SimKernel, policy: CancelPolicy) -> Copier<SimKernel> {
        let config = RingConfig::new().entries(QUEUE_DEPTH).cancel_policy(policy);
        Copier::new(Ring::with_kernel(sim.clone(), &config).unwrap(), IN_FD, OUT_FD)
    }

    #[test]
    fn test_copy_longer_than_one_queue() {
        let sim = SimKernel::new();
        let mut copier = copier(&sim, CancelPolicy::Surface);

        // Three full queues of pairs plus a short tail.
        let pairs = 3 * QUEUE_DEPTH as u64 / 2;
        copier.copy(pairs * BATCH_SIZE + 1).unwrap();

        assert_eq!(copier.inflight, 0);
        assert_eq!(copier.resubmitted, 0);
        assert!(copier.chunks.iter().all(Option::is_none));
        // Slots are recycled, never more than one queue's worth alive.
        assert!(copier.chunks.len() <= QUEUE_DEPTH as usize / 2);

        let submitted: u32 = sim
            .enters()
            .iter()
            .map(|e| match e {
                Event::Enter { to_submit, .. } => *to_submit,
                _ => 0,
            })
            .sum();
        assert_eq!(submitted as u64, 2 * (pairs + 1));
    }

    #[test]
    fn test_read_failure_stops_the_copy() {
        let sim = SimKernel::new();
        sim.fail_fd(IN_FD, Errno::EIO);
        let mut copier = copier(&sim, CancelPolicy::Resubmit { max_attempts: 2 });

        let err = copier.copy(4 * BATCH_SIZE).unwrap_err();
        assert!(err.to_string().contains("EIO"), "{}", err);
    }
}
