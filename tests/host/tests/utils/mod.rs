#![allow(dead_code)]

use std::{process, thread, time::Duration};

use argon::scheduler::{Scheduler, SchedulerConfig};

pub use argon_host::Stack;

/// Initializes the kernel with logging and a watchdog that fails tests that hang.
pub fn init_scheduler(tick_freq: u32) -> Option<Scheduler> {
    argon_host::init_logger(log::LevelFilter::Info);
    start_watchdog(Duration::from_secs(10));

    argon_host::init_scheduler(SchedulerConfig::default().with_tick_freq(tick_freq))
}

fn start_watchdog(limit: Duration) {
    thread::spawn(move || {
        thread::sleep(limit);
        eprintln!("Test did not finish within {:?}", limit);
        process::exit(1);
    });
}

pub fn exit_success() -> ! {
    process::exit(0)
}

pub fn exit_failure(reason: &str) -> ! {
    eprintln!("FAILED: {}", reason);
    process::exit(1)
}

/// Exits with failure unless `condition` holds.
pub fn check(condition: bool, what: &str) {
    if !condition {
        exit_failure(what);
    }
}
