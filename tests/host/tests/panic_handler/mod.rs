//! Kernel threads run on their own OS threads, where a panic would only stop that
//! thread and leave the test hanging. Tests with `mod panic_handler;` call [`install`]
//! to turn any panic into a failed test instead.

use std::process;

pub fn install() {
    std::panic::set_hook(Box::new(|info| {
        eprintln!("{}", info);
        process::exit(1);
    }));
}
