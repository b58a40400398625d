//! Test of context switches requested inside a critical section

mod panic_handler;
mod utils;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use argon::{Semaphore, ThreadConfig, Timeout, scheduler::spawn};
use static_cell::ConstStaticCell;

use crate::utils::{Stack, check, exit_success, init_scheduler};

static LOW_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
static HIGH_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());

static SEMAPHORE: Semaphore = Semaphore::new("wakeup", 0);
static IN_SECTION: AtomicBool = AtomicBool::new(false);
static WAKEUPS: AtomicU32 = AtomicU32::new(0);

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
    let _high = spawn(
        high,
        HIGH_STACK.take(),
        ThreadConfig::default().with_name("high").with_priority(2),
    )
    .unwrap();
    check(WAKEUPS.load(Ordering::SeqCst) == 0, "high is waiting");

    critical_section::with(|_| {
        IN_SECTION.store(true, Ordering::SeqCst);
        SEMAPHORE.put().unwrap();
        check(WAKEUPS.load(Ordering::SeqCst) == 0, "no switch inside the section");
        IN_SECTION.store(false, Ordering::SeqCst);
    });
    check(WAKEUPS.load(Ordering::SeqCst) == 1, "high ran when the section ended");

    // Only the outermost section performs the switch
    critical_section::with(|_| {
        IN_SECTION.store(true, Ordering::SeqCst);
        critical_section::with(|_| SEMAPHORE.put().unwrap());
        check(WAKEUPS.load(Ordering::SeqCst) == 1, "no switch after the inner section");
        IN_SECTION.store(false, Ordering::SeqCst);
    });
    check(WAKEUPS.load(Ordering::SeqCst) == 2, "high ran after the outer section");

    exit_success();
}

fn high() {
    loop {
        SEMAPHORE.get(Timeout::Forever).unwrap();
        check(!IN_SECTION.load(Ordering::SeqCst), "woken outside of the section");
        WAKEUPS.fetch_add(1, Ordering::SeqCst);
    }
}
