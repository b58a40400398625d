//! Test of terminating threads blocked on a mutex and on a semaphore
//!
//! A terminated mutex waiter must stop lending its priority to the owner and must not
//! be handed the mutex; a terminated semaphore waiter must not swallow a token.

mod panic_handler;
mod utils;

use core::sync::atomic::{AtomicBool, Ordering};

use argon::{Mutex, Semaphore, ThreadConfig, Timeout, scheduler::spawn, thread, thread::ThreadState};
use static_cell::ConstStaticCell;

use crate::utils::{Stack, check, exit_success, init_scheduler};

static LOW_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
static MIDDLE_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
static HIGH_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
static WAITER_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());

static MUTEX: Mutex = Mutex::new("shared");
static SEMAPHORE: Semaphore = Semaphore::new("tokens", 0);
static MIDDLE_OWNED: AtomicBool = AtomicBool::new(false);
static HIGH_OWNED: AtomicBool = AtomicBool::new(false);
static TOKEN_TAKEN: AtomicBool = AtomicBool::new(false);

fn main() {
    panic_handler::install();
    let scheduler = init_scheduler(100).expect("Failed to initialize the kernel");

    let _low = spawn(
        low,
        LOW_STACK.take(),
        ThreadConfig::default().with_name("low").with_priority(1),
    )
    .unwrap();

    scheduler.start();
}

fn low() {
    let me = thread::current().unwrap();
    MUTEX.lock(Timeout::Forever).unwrap();

    // Both preempt and block on the mutex right away
    let _middle = spawn(
        || {
            MUTEX.lock(Timeout::Forever).unwrap();
            MIDDLE_OWNED.store(true, Ordering::SeqCst);
            MUTEX.unlock().unwrap();
        },
        MIDDLE_STACK.take(),
        ThreadConfig::default().with_name("middle").with_priority(3),
    )
    .unwrap();
    let high = spawn(
        || {
            MUTEX.lock(Timeout::Forever).unwrap();
            HIGH_OWNED.store(true, Ordering::SeqCst);
            MUTEX.unlock().unwrap();
        },
        HIGH_STACK.take(),
        ThreadConfig::default().with_name("high").with_priority(5),
    )
    .unwrap();
    check(me.priority() == Ok(5), "inherited from high");

    high.terminate().unwrap();
    check(high.state() == ThreadState::Done, "high terminated");
    check(me.priority() == Ok(3), "only middle is still waiting");

    MUTEX.unlock().unwrap();
    check(MIDDLE_OWNED.load(Ordering::SeqCst), "mutex handed to middle");
    check(!HIGH_OWNED.load(Ordering::SeqCst), "terminated thread never owned the mutex");
    check(me.priority() == Ok(1), "back to base priority");
    check(!MUTEX.is_locked(), "mutex released by middle");

    let waiter = spawn(
        || {
            SEMAPHORE.get(Timeout::Ticks(1000)).unwrap();
            TOKEN_TAKEN.store(true, Ordering::SeqCst);
        },
        WAITER_STACK.take(),
        ThreadConfig::default().with_name("waiter").with_priority(2),
    )
    .unwrap();
    check(waiter.state() == ThreadState::Blocked, "waiter blocked");
    waiter.terminate().unwrap();

    SEMAPHORE.put().unwrap();
    check(SEMAPHORE.count() == 1, "token kept for a live thread");
    check(!TOKEN_TAKEN.load(Ordering::SeqCst), "terminated waiter did not run");

    exit_success();
}
