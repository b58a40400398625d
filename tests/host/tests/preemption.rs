// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test of preemption by a higher-priority thread

mod panic_handler;
mod utils;

use core::cell::RefCell;

use argon::{
    ThreadConfig,
    scheduler::spawn,
    thread::{self, ThreadState},
};
use critical_section::Mutex;
use heapless::Vec;
use static_cell::ConstStaticCell;

use crate::utils::{Stack, check, exit_failure, exit_success, init_scheduler};

static THREAD_LOW_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
static THREAD_HIGH_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());

static NUMBERS: Mutex<RefCell<Vec<i32, 2000>>> = Mutex::new(RefCell::new(Vec::new()));

fn main() {
    panic_handler::install();
    let scheduler = init_scheduler(1000).expect("Failed to initialize the kernel");

    let _thread_low = spawn(
        thread_low,
        THREAD_LOW_STACK.take(),
        ThreadConfig::default().with_name("low").with_priority(1),
    )
    .unwrap();

    scheduler.start();
}

fn thread_low() {
    // Runs to completion before `spawn` returns
    let high = spawn(
        thread_high,
        THREAD_HIGH_STACK.take(),
        ThreadConfig::default().with_name("high").with_priority(2),
    )
    .unwrap();
    check(high.state() == ThreadState::Done, "high-priority thread finished");

    for i in 1000..2000 {
        put_number(i);
    }

    let me = thread::current().unwrap();
    check(me.name() == Ok("low"), "thread name");

    critical_section::with(|cs| {
        let numbers = NUMBERS.borrow_ref(cs);
        if !numbers.iter().cloned().eq(0..2000) {
            // Wrong order means the low-priority thread was not preempted
            eprintln!("{:?}", numbers);
            exit_failure("numbers out of order");
        }
    });

    exit_success();
}

fn thread_high() {
    for i in 0..1000 {
        put_number(i);
    }
}

fn put_number(num: i32) {
    critical_section::with(|cs| {
        let mut numbers = NUMBERS.borrow_ref_mut(cs);
        numbers.push(num).unwrap();
    });
}
