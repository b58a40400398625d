//! Test of thread diagnostics: kernel state, CPU load, stack use and the thread report

mod panic_handler;
mod utils;

use argon::{
    ThreadConfig,
    scheduler::{self, spawn},
    thread::{self, ThreadState},
    time,
};
use static_cell::ConstStaticCell;

use crate::utils::{Stack, check, exit_success, init_scheduler};

static WORKER_STACK: ConstStaticCell<Stack<8192>> = ConstStaticCell::new(Stack::new());

/// Ticks per load window at 100 Hz.
const WINDOW: u64 = 100;

fn main() {
    panic_handler::install();
    let scheduler = init_scheduler(100).expect("Failed to initialize the kernel");
    check(!scheduler::is_running(), "not running before start");

    // Captured by the closure, so copied onto the kernel stack
    let payload = [7u8; 200];
    let _worker = spawn(
        move || worker(payload),
        WORKER_STACK.take(),
        ThreadConfig::default().with_name("worker").with_priority(2),
    )
    .unwrap();

    scheduler.start();
}

fn worker(payload: [u8; 200]) {
    check(scheduler::is_running(), "running after start");
    check(payload.iter().all(|byte| *byte == 7), "payload intact");
    let micros = time::current_micros().unwrap();
    check(micros % 10_000 == 0, "10 ms per tick");
    check(micros / 10_000 <= time::current_time(), "microseconds follow the tick count");

    let me = thread::current().unwrap();
    let used = me.stack_used().unwrap();
    check(used >= payload.len() && used < 8192, "closure counted as used stack");

    // Busy for two full windows
    let start = time::current_time();
    while time::current_time() < start + 2 * WINDOW {
        core::hint::spin_loop();
    }
    check(me.load().unwrap() >= 900, "busy thread load");
    check(scheduler::system_load().unwrap() >= 900, "busy system load");

    // Idle for two full windows
    time::sleep(2 * WINDOW).unwrap();
    check(me.load().unwrap() <= 100, "sleeping thread load");
    check(scheduler::system_load().unwrap() <= 100, "idle system load");

    let report = thread::report().unwrap();
    check(report.len() == 2, "idle and worker reported");
    check(report[0].name == "idle" && report[0].stack_size == 0, "idle thread first");
    let status = &report[1];
    check(status.id == me.id() && status.name == "worker", "worker reported");
    check(status.state == ThreadState::Running, "worker running");
    check(status.priority == 2, "worker priority");
    check(status.stack_size == 8192, "worker stack size");
    check(status.stack_used == used, "stack use unchanged on the host");

    exit_success();
}
