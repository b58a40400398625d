//! `embedded-hal`-compatible delay that lets other threads run instead of busy looping.
//! The precision is limited by the tick frequency of the scheduler (usually a millisecond or more).

use argon::{Error, arch, scheduler::get_config, time};

#[derive(Clone)]
pub struct Delay {
    tick_freq: u32,
}

impl Delay {
    pub fn new() -> Result<Self, Error> {
        let tick_freq = get_config()?.tick_freq;

        Ok(Self { tick_freq })
    }

    pub fn delay_ticks(&mut self, ticks: u64) {
        let wakeup = time::current_time().saturating_add(ticks);
        if time::sleep_until(wakeup).is_err() {
            // Not a sleepable thread (e.g. before the scheduler starts)
            while time::current_time() < wakeup {
                arch::yield_now();
            }
        }
    }
}

/// Ticks covering `amount` units of `1 / per_second` seconds, rounded up.
fn to_ticks(amount: u32, per_second: u64, tick_freq: u32) -> u64 {
    (u64::from(amount) * u64::from(tick_freq)).div_ceil(per_second)
}

impl embedded_hal::delay::DelayNs for Delay {
    fn delay_ns(&mut self, ns: u32) {
        self.delay_ticks(to_ticks(ns, 1_000_000_000, self.tick_freq));
    }

    fn delay_us(&mut self, us: u32) {
        self.delay_ticks(to_ticks(us, 1_000_000, self.tick_freq));
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay_ticks(to_ticks(ms, 1_000, self.tick_freq));
    }
}
