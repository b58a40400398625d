//! Test of stack overflow detection by canary

mod utils;

use std::process;

use argon::{ThreadConfig, arch::yield_now, scheduler::spawn};
use static_cell::ConstStaticCell;

use crate::utils::{Stack, exit_failure, init_scheduler};

static VICTIM_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());

fn main() {
    std::panic::set_hook(Box::new(|info| {
        let message = info.payload_as_str().unwrap_or_default();
        if message.starts_with("Stack overflow detected") {
            process::exit(0);
        }

        eprintln!("{}", info);
        process::exit(1);
    }));

    let scheduler = init_scheduler(100).expect("Failed to initialize the kernel");

    // Host threads run on their own stacks, so an overflow is simulated by
    // overwriting the lowest word of the kernel stack
    let stack = VICTIM_STACK.take();
    let bottom = core::ptr::from_mut(stack).cast::<u32>() as usize;

    let _victim = spawn(
        move || {
            unsafe { (bottom as *mut u32).write_volatile(0) };
            yield_now();
            exit_failure("overflow went unnoticed");
        },
        stack,
        ThreadConfig::default().with_name("victim"),
    )
    .unwrap();

    scheduler.start();
}
