//! Test of semaphore wakeup order, timeouts and signaling from interrupt context

mod panic_handler;
mod utils;

use core::cell::RefCell;

use argon::{Error, Semaphore, ThreadConfig, Timeout, scheduler::spawn, time};
use argon_host::raise_interrupt;
use heapless::Vec;
use static_cell::ConstStaticCell;

use crate::utils::{Stack, check, exit_failure, exit_success, init_scheduler};

static COORDINATOR_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
static WAITER_STACKS: [ConstStaticCell<Stack<4096>>; 4] =
    [const { ConstStaticCell::new(Stack::new()) }; 4];

static SEMAPHORE: Semaphore = Semaphore::new("tokens", 0);
static SIGNAL: Semaphore = Semaphore::new("signal", 0);

static TRACE: critical_section::Mutex<RefCell<Vec<&'static str, 8>>> =
    critical_section::Mutex::new(RefCell::new(Vec::new()));

fn main() {
    panic_handler::install();
    let scheduler = init_scheduler(100).expect("Failed to initialize the kernel");

    let _coordinator = spawn(
        coordinator,
        COORDINATOR_STACK.take(),
        ThreadConfig::default().with_name("coordinator").with_priority(1),
    )
    .unwrap();

    scheduler.start();
}

fn coordinator() {
    // Each waiter preempts this thread and blocks right away
    for (index, (name, priority)) in [("first", 2), ("second", 4), ("third", 4)]
        .into_iter()
        .enumerate()
    {
        spawn(
            move || {
                SEMAPHORE.get(Timeout::Forever).unwrap();
                record(name);
            },
            WAITER_STACKS[index].take(),
            ThreadConfig::default().with_name(name).with_priority(priority),
        )
        .unwrap();
    }

    for _ in 0..3 {
        SEMAPHORE.put().unwrap();
    }
    check(SEMAPHORE.count() == 0, "tokens were handed over");
    expect_trace(&["second", "third", "first"]);

    // Tokens accumulate without waiters
    SEMAPHORE.put().unwrap();
    SEMAPHORE.put().unwrap();
    check(SEMAPHORE.count() == 2, "two tokens");
    SEMAPHORE.get(Timeout::NoWait).unwrap();
    SEMAPHORE.get(Timeout::Ticks(5)).unwrap();
    check(SEMAPHORE.get(Timeout::NoWait) == Err(Error::WouldBlock), "no token left");

    let start = time::current_time();
    check(SEMAPHORE.get(Timeout::Ticks(2)) == Err(Error::Timeout), "timed out");
    check(time::current_time() - start >= 2, "waited for the timeout");

    // Signaling from an interrupt handler
    spawn(
        || {
            SIGNAL.get(Timeout::Forever).unwrap();
            record("signaled");
        },
        WAITER_STACKS[3].take(),
        ThreadConfig::default().with_name("signaled").with_priority(2),
    )
    .unwrap();
    check(
        raise_interrupt(|| SIGNAL.get(Timeout::Forever)) == Err(Error::NotFromInterrupt),
        "no blocking in interrupt context",
    );
    raise_interrupt(|| SIGNAL.put()).unwrap();
    expect_trace(&["second", "third", "first", "signaled"]);

    exit_success();
}

fn record(name: &'static str) {
    critical_section::with(|cs| {
        TRACE.borrow_ref_mut(cs).push(name).unwrap();
    });
}

fn expect_trace(expected: &[&str]) {
    critical_section::with(|cs| {
        let trace = TRACE.borrow_ref(cs);
        if trace[..] != *expected {
            eprintln!("{:?}", trace);
            exit_failure("wrong wakeup order");
        }
    });
}
