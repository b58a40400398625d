//! Test of recursive locking, ownership checks and lock timeouts

mod panic_handler;
mod utils;

use argon::{
    Error, Mutex, ThreadConfig, Timeout,
    portable_atomic::{AtomicU32, Ordering},
    scheduler::spawn,
    thread::{self, ThreadState},
    time,
};
use static_cell::ConstStaticCell;

use crate::utils::{Stack, check, exit_success, init_scheduler};

static OWNER_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
static CONTENDER_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());

static MUTEX: Mutex = Mutex::new("shared");
static STEP: AtomicU32 = AtomicU32::new(0);

fn main() {
    panic_handler::install();
    let scheduler = init_scheduler(100).expect("Failed to initialize the kernel");

    let _owner = spawn(
        owner,
        OWNER_STACK.take(),
        ThreadConfig::default().with_name("owner").with_priority(2),
    )
    .unwrap();

    scheduler.start();
}

fn owner() {
    let me = thread::current().unwrap();

    MUTEX.lock(Timeout::Forever).unwrap();
    MUTEX.lock(Timeout::NoWait).unwrap();
    check(MUTEX.lock_count() == 2, "locked twice");
    check(MUTEX.owner() == Some(me.id()), "owned by this thread");

    let contender = spawn(
        contender,
        CONTENDER_STACK.take(),
        ThreadConfig::default().with_name("contender").with_priority(3),
    )
    .unwrap();

    // The contender timed out once and is now waiting without a timeout
    time::sleep(5).unwrap();
    check(STEP.load(Ordering::Acquire) == 2, "contender timed out");
    check(contender.state() == ThreadState::Blocked, "contender waits");

    MUTEX.unlock().unwrap();
    check(contender.state() == ThreadState::Blocked, "one level is still held");
    check(MUTEX.is_locked(), "still locked");

    // Handing over to the contender preempts this thread
    MUTEX.unlock().unwrap();
    check(STEP.load(Ordering::Acquire) == 3, "contender got the mutex");
    check(!MUTEX.is_locked(), "unlocked by the contender");
    check(MUTEX.unlock() == Err(Error::NotOwner), "unlock of a free mutex");
    check(me.priority() == Ok(2), "inherited priority dropped");

    exit_success();
}

fn contender() {
    check(MUTEX.lock(Timeout::NoWait) == Err(Error::WouldBlock), "busy without waiting");
    STEP.store(1, Ordering::Release);

    let start = time::current_time();
    check(MUTEX.lock(Timeout::Ticks(3)) == Err(Error::Timeout), "lock timed out");
    check(time::current_time() - start >= 3, "waited for the timeout");
    check(MUTEX.unlock() == Err(Error::NotOwner), "not the owner");
    STEP.store(2, Ordering::Release);

    MUTEX.lock(Timeout::Forever).unwrap();
    check(MUTEX.lock_count() == 1, "fresh ownership");
    STEP.store(3, Ordering::Release);
    MUTEX.unlock().unwrap();
}
