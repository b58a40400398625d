//! Time management and sleeping.
//!
//! Time is represented as the number of ticks since the start of the scheduler.

use core::sync::atomic::Ordering;

use portable_atomic::AtomicU64;

use crate::{Error, scheduler};

static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

/// Retrieves current time (in ticks).
pub fn current_time() -> u64 {
    TICK_COUNT.load(Ordering::Acquire)
}

/// Advances the time base by one tick and returns the new time.
pub(crate) fn advance() -> u64 {
    TICK_COUNT.fetch_add(1, Ordering::AcqRel) + 1
}

/// Blocks the current thread until the specified time.
pub fn sleep_until(time: u64) -> Result<(), Error> {
    scheduler::sleep_current_until(time)
}

/// Blocks the current thread for the given number of ticks.
pub fn sleep(ticks: u64) -> Result<(), Error> {
    sleep_until(current_time().saturating_add(ticks))
}

/// Microseconds since the start of the scheduler, at the resolution of one tick.
pub fn current_micros() -> Result<u64, Error> {
    Ok(ticks_to_us(current_time(), scheduler::get_config()?.tick_freq))
}

/// Converts milliseconds into ticks (rounding up) using the configured tick frequency.
pub fn millis_to_ticks(ms: u64) -> Result<u64, Error> {
    Ok(ms_to_ticks(ms, scheduler::get_config()?.tick_freq))
}

/// Converts ticks into milliseconds (rounding down) using the configured tick frequency.
pub fn ticks_to_millis(ticks: u64) -> Result<u64, Error> {
    Ok(ticks_to_ms(ticks, scheduler::get_config()?.tick_freq))
}

fn ms_to_ticks(ms: u64, tick_freq: u32) -> u64 {
    (ms.saturating_mul(tick_freq as u64)).div_ceil(1000)
}

fn ticks_to_ms(ticks: u64, tick_freq: u32) -> u64 {
    ticks.saturating_mul(1000) / tick_freq as u64
}

fn ticks_to_us(ticks: u64, tick_freq: u32) -> u64 {
    ticks.saturating_mul(1_000_000) / tick_freq as u64
}
