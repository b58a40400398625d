//! Test of priority inheritance through a chain of two mutexes
//!
//! `low` holds `FIRST`, `middle` holds `SECOND` and waits for `FIRST`, and `high` waits
//! for `SECOND`. `low` must inherit the priority of `high`, so the bystander with a
//! priority between them cannot run before the chain is resolved.

mod panic_handler;
mod utils;

use core::cell::RefCell;

use argon::{Mutex, ThreadConfig, Timeout, scheduler::spawn, thread};
use heapless::Vec;
use static_cell::ConstStaticCell;

use crate::utils::{Stack, check, exit_failure, exit_success, init_scheduler};

static LOW_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
static MIDDLE_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
static HIGH_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
static BYSTANDER_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());

static FIRST: Mutex = Mutex::new("first");
static SECOND: Mutex = Mutex::new("second");

static TRACE: critical_section::Mutex<RefCell<Vec<&'static str, 8>>> =
    critical_section::Mutex::new(RefCell::new(Vec::new()));

fn main() {
    panic_handler::install();
    let scheduler = init_scheduler(1000).expect("Failed to initialize the kernel");

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
    FIRST.lock(Timeout::Forever).unwrap();

    spawn(
        middle,
        MIDDLE_STACK.take(),
        ThreadConfig::default().with_name("middle").with_priority(2),
    )
    .unwrap();
    check(me.priority() == Ok(2), "inherited from middle");
    check(me.base_priority() == Ok(1), "base priority unchanged");

    spawn(
        high,
        HIGH_STACK.take(),
        ThreadConfig::default().with_name("high").with_priority(4),
    )
    .unwrap();
    check(me.priority() == Ok(4), "inherited from high through middle");

    // Would preempt this thread without inheritance
    spawn(
        bystander,
        BYSTANDER_STACK.take(),
        ThreadConfig::default().with_name("bystander").with_priority(3),
    )
    .unwrap();

    record("low");
    FIRST.unlock().unwrap();
    check(me.priority() == Ok(1), "inheritance ended");

    critical_section::with(|cs| {
        let trace = TRACE.borrow_ref(cs);
        if trace[..] != ["low", "middle", "high", "bystander"] {
            eprintln!("{:?}", trace);
            exit_failure("wrong execution order");
        }
    });

    exit_success();
}

fn middle() {
    SECOND.lock(Timeout::Forever).unwrap();
    FIRST.lock(Timeout::Forever).unwrap();

    let me = thread::current().unwrap();
    check(me.priority() == Ok(4), "still boosted by high");

    record("middle");
    FIRST.unlock().unwrap();
    SECOND.unlock().unwrap();
}

fn high() {
    SECOND.lock(Timeout::Forever).unwrap();
    record("high");
    SECOND.unlock().unwrap();
}

fn bystander() {
    record("bystander");
}

fn record(name: &'static str) {
    critical_section::with(|cs| {
        TRACE.borrow_ref_mut(cs).push(name).unwrap();
    });
}
