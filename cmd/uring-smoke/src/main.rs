//! uring End-to-End Smoke Test
//!
//! Drives a real ring against the running kernel:
//!   Part A. Setup: geometry, features, teardown
//!   Part B. Submission: NOP round trip, full queue, peek
//!   Part C. Waiting: timeouts, signal mask
//!   Part D. Linked I/O: pipe write -> read, failed link, cancel policy
//!   Part E. Registered ring descriptor
//!   Part F. Setup variants: NO_SQARRAY, CQE32, NO_MMAP, SQPOLL
//!
//! Run: ./target/release/uring-smoke
//! Variants the kernel does not know are reported as SKIP.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use nix::sys::signal::SigSet;
use uring::sys::{features, setup_flags};
use uring::{CancelAction, CancelPolicy, Errno, Ring, RingConfig, UringError};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0, skipped: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn skip(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.skipped += 1;
        println!("  [{:2}] {:<52} SKIP: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}  Skipped: {}",
            self.total, self.passed, self.failed, self.skipped
        );
        println!("{}", LINE);
    }
}

/// Queue a NOP tagged `tag`.
fn push_nop(ring: &mut Ring, tag: u64) -> bool {
    match ring.get_sqe() {
        Ok(sqe) => {
            sqe.prep_nop();
            sqe.set_data(tag);
            true
        }
        Err(_) => false,
    }
}

/// Wait for and consume one completion.
fn reap(ring: &mut Ring) -> Option<uring::Cqe> {
    let cqe = ring.wait_cqe_timeout(Duration::from_secs(1)).ok()?;
    ring.cqe_seen();
    Some(cqe)
}

fn pipe() -> Option<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return None;
    }
    unsafe { Some((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

// ════════════════════════════════════════════════════════════
// Part A: Setup
// ════════════════════════════════════════════════════════════

fn test_setup(t: &mut TestRunner) -> Option<Ring> {
    t.section("Part A: Setup");

    // A1: create
    let ring = match Ring::with_config(&RingConfig::new().entries(8)) {
        Ok(ring) => { t.pass("io_uring_setup(8)"); ring }
        Err(e) => {
            t.fail("io_uring_setup(8)", &e.to_string());
            println!("       io_uring unavailable; nothing else to test.");
            return None;
        }
    };

    // A2: geometry
    let p = *ring.params();
    t.check(
        "sq_entries=8, cq_entries=16",
        p.sq_entries == 8 && p.cq_entries == 16,
        &format!("got sq={} cq={}", p.sq_entries, p.cq_entries),
    );
    t.check("ring descriptor present", ring.ring_fd().is_some(), "no fd");

    // A3: features
    println!("       features=0x{:x}", ring.features());
    t.check(
        "FEAT_SINGLE_MMAP",
        ring.features() & features::SINGLE_MMAP != 0,
        "kernel older than 5.4?",
    );
    t.check("FEAT_NODROP", ring.features() & features::NODROP != 0, "kernel older than 5.5?");

    // A4: impossible requests fail before touching the kernel
    let too_big = Ring::new(uring::sys::KERN_MAX_ENTRIES + 1);
    t.check(
        "entries > max rejected",
        matches!(too_big, Err(UringError::Setup(Errno::EINVAL))),
        &format!("{:?}", too_big.err()),
    );
    let zero = Ring::new(0);
    t.check("entries = 0 rejected", zero.is_err(), "accepted");

    Some(ring)
}

// ════════════════════════════════════════════════════════════
// Part B: Submission
// ════════════════════════════════════════════════════════════

fn test_submission(t: &mut TestRunner, ring: &mut Ring) {
    t.section("Part B: Submission");

    // B1: NOP round trip
    let queued = push_nop(ring, 0xdead_beef);
    let submitted = ring.submit();
    t.check("submit 1 NOP", queued && matches!(submitted, Ok(1)), &format!("{:?}", submitted));
    match reap(ring) {
        Some(cqe) => t.check(
            "NOP completion carries tag",
            cqe.user_data == 0xdead_beef && cqe.res == 0,
            &format!("user_data={:#x} res={}", cqe.user_data, cqe.res),
        ),
        None => t.fail("NOP completion carries tag", "no completion"),
    }

    // B2: fill the queue
    let capacity = ring.params().sq_entries;
    let mut pushed = 0;
    while push_nop(ring, pushed as u64) {
        pushed += 1;
    }
    t.check(
        "queue full at capacity",
        pushed == capacity && ring.sq_space_left() == 0,
        &format!("pushed {} of {}", pushed, capacity),
    );

    // B3: drain all of them
    let done = ring.submit_and_wait(capacity);
    t.check("submit_and_wait(capacity)", matches!(done, Ok(n) if n == capacity), &format!("{:?}", done));
    let mut tags = 0u64;
    let seen = ring.for_each_cqe(|cqe| tags |= 1 << cqe.user_data);
    ring.cq_advance(seen);
    t.check(
        "every tag completed once",
        seen == capacity && tags == (1u64 << capacity) - 1,
        &format!("seen={} tags={:#b}", seen, tags),
    );

    // B4: peek on an empty ring
    let empty = ring.peek();
    t.check("peek on empty ring", matches!(empty, Ok(None)), &format!("{:?}", empty));

    // B5: peek does not consume
    push_nop(ring, 7);
    let _ = ring.submit_and_wait(1);
    let first = ring.peek().ok().flatten().map(|c| c.user_data);
    let second = ring.peek().ok().flatten().map(|c| c.user_data);
    t.check(
        "peek twice returns the same completion",
        first == Some(7) && second == Some(7),
        &format!("{:?} / {:?}", first, second),
    );
    ring.cqe_seen();
    t.check("cqe_seen consumes it", ring.cq_ready() == 0, "still ready");
}

// ════════════════════════════════════════════════════════════
// Part C: Waiting
// ════════════════════════════════════════════════════════════

fn test_waiting(t: &mut TestRunner, ring: &mut Ring) {
    t.section("Part C: Waiting");

    // C1: timeout with nothing outstanding
    let start = Instant::now();
    let res = ring.wait_cqe_timeout(Duration::from_millis(20));
    let elapsed = start.elapsed();
    t.check(
        "wait_cqe_timeout expires",
        matches!(res, Err(UringError::Timeout)),
        &format!("{:?}", res),
    );
    t.check(
        "expired after the deadline",
        elapsed >= Duration::from_millis(15),
        &format!("{:?}", elapsed),
    );
    t.check("no sentinel left behind", ring.cq_ready() == 0, "completion visible");

    // C2: timeout beaten by a completion
    push_nop(ring, 11);
    let res = ring.submit_and_wait_timeout(1, Some(Duration::from_secs(1)), None);
    t.check(
        "submit_and_wait_timeout returns the NOP",
        matches!(res, Ok(Some(ref cqe)) if cqe.user_data == 11),
        &format!("{:?}", res),
    );
    if res.is_ok() {
        ring.cqe_seen();
    }

    // C3: signal mask passes through
    push_nop(ring, 12);
    let _ = ring.submit();
    let mask = SigSet::empty();
    let res = ring.wait_cqes(1, Some(Duration::from_secs(1)), Some(&mask));
    t.check(
        "wait_cqes with sigmask",
        matches!(res, Ok(Some(ref cqe)) if cqe.user_data == 12),
        &format!("{:?}", res),
    );
    if res.is_ok() {
        ring.cqe_seen();
    }
}

// ════════════════════════════════════════════════════════════
// Part D: Linked I/O
// ════════════════════════════════════════════════════════════

fn test_linked(t: &mut TestRunner, ring: &mut Ring) {
    t.section("Part D: Linked I/O");

    let Some((rx, tx)) = pipe() else {
        t.fail("pipe2()", &Errno::last().to_string());
        return;
    };

    // D1: write -> read through a pipe
    let msg = b"hello, ring";
    let mut buf = [0u8; 32];
    if let Ok(sqe) = ring.get_sqe() {
        sqe.prep_write(tx.as_raw_fd(), msg.as_ptr(), msg.len() as u32, 0);
        sqe.set_data(1).set_link();
    }
    if let Ok(sqe) = ring.get_sqe() {
        sqe.prep_read(rx.as_raw_fd(), buf.as_mut_ptr(), buf.len() as u32, 0);
        sqe.set_data(2);
    }
    let submitted = ring.submit_and_wait(2);
    t.check("submit linked write+read", matches!(submitted, Ok(2)), &format!("{:?}", submitted));
    let (a, b) = (reap(ring), reap(ring));
    t.check(
        "write then read in order",
        a.map(|c| c.user_data) == Some(1) && b.map(|c| c.user_data) == Some(2),
        &format!("{:?} {:?}", a, b),
    );
    let n = b.map_or(0, |c| c.res.max(0) as usize);
    t.check("read back the payload", &buf[..n] == msg, &format!("{} bytes", n));

    // D2: a failed head cancels its follower
    if let Ok(sqe) = ring.get_sqe() {
        sqe.prep_read(-1, buf.as_mut_ptr(), buf.len() as u32, 0);
        sqe.set_data(3).set_link();
    }
    push_nop(ring, 4);
    let _ = ring.submit_and_wait(2);
    let (head, tail) = (reap(ring), reap(ring));
    t.check(
        "failed head reports EBADF",
        head.and_then(|c| c.error()) == Some(Errno::EBADF),
        &format!("{:?}", head),
    );
    t.check(
        "follower completes ECANCELED",
        tail.and_then(|c| c.error()) == Some(Errno::ECANCELED),
        &format!("{:?}", tail),
    );

    // D3: policy verdicts for the canceled follower
    if let Some(cqe) = tail {
        let surface = CancelPolicy::Surface.decide(&cqe, 0);
        t.check(
            "Surface policy fails ECANCELED",
            surface == CancelAction::Fail(Errno::ECANCELED),
            &format!("{:?}", surface),
        );
        let retry = CancelPolicy::Resubmit { max_attempts: 2 };
        t.check(
            "Resubmit policy within budget",
            retry.decide(&cqe, 1) == CancelAction::Resubmit,
            "did not resubmit",
        );
        t.check(
            "Resubmit policy out of budget",
            retry.decide(&cqe, 2) == CancelAction::Fail(Errno::ECANCELED),
            "resubmitted",
        );
    }
}

// ════════════════════════════════════════════════════════════
// Part E: Registered ring descriptor
// ════════════════════════════════════════════════════════════

fn test_registered(t: &mut TestRunner, ring: &mut Ring) {
    t.section("Part E: Registered ring descriptor");

    let index = match ring.register_ring_fd() {
        Ok(index) => { t.pass("register_ring_fd"); index }
        Err(UringError::Register(Errno::EINVAL)) => {
            t.skip("register_ring_fd", "kernel older than 5.18");
            return;
        }
        Err(e) => { t.fail("register_ring_fd", &e.to_string()); return; }
    };
    println!("       registered index={}", index);

    let again = ring.register_ring_fd();
    t.check(
        "second register rejected",
        matches!(again, Err(UringError::Register(Errno::EEXIST))),
        &format!("{:?}", again),
    );

    push_nop(ring, 21);
    let _ = ring.submit();
    let cqe = reap(ring);
    t.check(
        "NOP through registered index",
        cqe.map(|c| c.user_data) == Some(21),
        &format!("{:?}", cqe),
    );

    let res = ring.unregister_ring_fd();
    t.check("unregister_ring_fd", res.is_ok(), &format!("{:?}", res));
    t.check("back to the plain descriptor", !ring.is_registered(), "still registered");
}

// ════════════════════════════════════════════════════════════
// Part F: Setup variants
// ════════════════════════════════════════════════════════════

/// Create a ring from `config`, SKIP if the kernel does not know a flag.
fn variant(t: &mut TestRunner, name: &str, config: RingConfig) -> Option<Ring> {
    match Ring::with_config(&config) {
        Ok(ring) => Some(ring),
        Err(UringError::Setup(Errno::EINVAL)) => { t.skip(name, "flag unsupported"); None }
        Err(UringError::Setup(e @ (Errno::EPERM | Errno::EACCES))) => {
            t.skip(name, &e.to_string());
            None
        }
        Err(e) => { t.fail(name, &e.to_string()); None }
    }
}

fn nop_round_trip(ring: &mut Ring, tag: u64) -> bool {
    push_nop(ring, tag) && ring.submit().is_ok() && reap(ring).map(|c| c.user_data) == Some(tag)
}

fn test_variants(t: &mut TestRunner) {
    t.section("Part F: Setup variants");

    let base = || RingConfig::new().entries(4);

    if let Some(mut ring) = variant(t, "NO_SQARRAY", base().flag(setup_flags::NO_SQARRAY)) {
        t.check("NO_SQARRAY NOP", nop_round_trip(&mut ring, 31), "round trip failed");
    }

    if let Some(mut ring) = variant(t, "CQE32", base().flag(setup_flags::CQE32)) {
        t.check("CQE32 geometry", ring.geometry().cqe_size() == 32, "cqe size");
        push_nop(&mut ring, 32);
        let _ = ring.submit_and_wait(1);
        let big = ring.big_cqe();
        t.check("CQE32 big completion", big.is_some(), "no extra words");
        ring.cqe_seen();
    }

    if let Some(mut ring) = variant(t, "NO_MMAP", base().flag(setup_flags::NO_MMAP)) {
        t.check("NO_MMAP NOP", nop_round_trip(&mut ring, 33), "round trip failed");
    }

    if let Some(mut ring) = variant(t, "CQSIZE=64", base().cq_entries(64)) {
        t.check("CQSIZE honored", ring.params().cq_entries == 64, "cq size");
        t.check("CQSIZE NOP", nop_round_trip(&mut ring, 34), "round trip failed");
    }

    if let Some(mut ring) = variant(t, "SQPOLL", base().sqpoll(true).sq_thread_idle_ms(10)) {
        t.check("SQPOLL NOP", nop_round_trip(&mut ring, 35), "round trip failed");
        // Let the poller idle and go to sleep, then submit again.
        std::thread::sleep(Duration::from_millis(50));
        t.check("SQPOLL NOP after idle", nop_round_trip(&mut ring, 36), "wakeup failed");
    }
}

fn main() {
    uring::init_logging();

    println!("uring smoke test");
    let mut t = TestRunner::new();

    if let Some(mut ring) = test_setup(&mut t) {
        test_submission(&mut t, &mut ring);
        test_waiting(&mut t, &mut ring);
        test_linked(&mut t, &mut ring);
        test_registered(&mut t, &mut ring);
        drop(ring);
        t.pass("teardown");
        test_variants(&mut t);
    }

    t.summary();
    std::process::exit(if t.failed == 0 { 0 } else { 1 });
}
