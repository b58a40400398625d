//! Test of periodic and one-shot timers dispatched by a run loop

mod panic_handler;
mod utils;

use core::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};

use argon::{
    Error, RunLoop, ThreadConfig, Timer, TimerMode, scheduler::spawn, time,
};
use heapless::Vec;
use static_cell::ConstStaticCell;

use crate::utils::{Stack, check, exit_failure, exit_success, init_scheduler};

static DISPATCHER_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());

static RUN_LOOP: RunLoop = RunLoop::new("timers");
static PERIODIC: Timer = Timer::new("periodic", TimerMode::Periodic, 5, &on_periodic);
static ONE_SHOT: Timer = Timer::new("one-shot", TimerMode::OneShot, 12, &on_one_shot);
static FINISH: Timer = Timer::new("finish", TimerMode::OneShot, 3, &on_finish);

static WAKEUPS: critical_section::Mutex<RefCell<Vec<u64, 8>>> =
    critical_section::Mutex::new(RefCell::new(Vec::new()));
static ONE_SHOT_FIRED: AtomicU32 = AtomicU32::new(0);

fn main() {
    panic_handler::install();
    let scheduler = init_scheduler(100).expect("Failed to initialize the kernel");

    let _dispatcher = spawn(
        dispatcher,
        DISPATCHER_STACK.take(),
        ThreadConfig::default().with_name("dispatcher").with_priority(2),
    )
    .unwrap();

    scheduler.start();
}

fn dispatcher() {
    check(FINISH.start() == Err(Error::InvalidState), "no run loop to attach to");

    PERIODIC.attach(&RUN_LOOP).unwrap();
    PERIODIC.start().unwrap();
    ONE_SHOT.attach(&RUN_LOOP).unwrap();
    ONE_SHOT.start().unwrap();
    let first = PERIODIC.wakeup_time().unwrap();

    RUN_LOOP.run().unwrap();
    check(!RUN_LOOP.is_running(), "run loop returned");

    // The second callback stretched the period from 5 to 8 ticks
    critical_section::with(|cs| {
        let wakeups = WAKEUPS.borrow_ref(cs);
        if wakeups[..] != [first, first + 5, first + 13, first + 21] {
            eprintln!("first = {}, wakeups = {:?}", first, wakeups);
            exit_failure("periodic timer left its grid");
        }
    });
    check(!PERIODIC.is_active(), "periodic timer stopped itself");
    check(PERIODIC.delay() == 8, "new delay kept");

    check(ONE_SHOT_FIRED.load(Ordering::Acquire) == 1, "one-shot fired once");
    check(!ONE_SHOT.is_active(), "one-shot disarmed after firing");
    check(ONE_SHOT.stop() == Err(Error::InvalidState), "inactive timer cannot be stopped");

    FINISH.delete().unwrap();
    check(FINISH.start() == Err(Error::ObjectDeleted), "deleted timer");

    exit_success();
}

fn on_periodic(timer: &Timer) {
    let Some(wakeup) = timer.wakeup_time() else {
        exit_failure("periodic timer inactive in its callback");
    };
    check(time::current_time() >= wakeup, "fired early");

    let count = critical_section::with(|cs| {
        let mut wakeups = WAKEUPS.borrow_ref_mut(cs);
        wakeups.push(wakeup).unwrap();
        wakeups.len()
    });

    match count {
        2 => PERIODIC.set_delay(8).unwrap(),
        4 => {
            timer.stop().unwrap();
            // Attached to the run loop of this thread
            FINISH.start().unwrap();
        }
        _ => {}
    }
}

fn on_one_shot(_timer: &Timer) {
    ONE_SHOT_FIRED.fetch_add(1, Ordering::AcqRel);
}

fn on_finish(_timer: &Timer) {
    match RunLoop::current() {
        Some(run_loop) => run_loop.stop().unwrap(),
        None => exit_failure("callback outside of the run loop"),
    }
}
