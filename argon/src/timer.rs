//! One-shot and periodic timers.
//!
//! Active timers are kept in a single list sorted by wakeup time. A timer belongs to a
//! [`RunLoop`], which invokes its callback on the run loop's thread once the wakeup
//! time has passed.
//!
//! A periodic timer keeps its place in the list while its callback runs, so it can
//! always be rescheduled afterwards even when other timers filled the list meanwhile.

use core::cell::RefCell;

use critical_section::{CriticalSection, Mutex};
use heapless::Vec;

use crate::{
    Error,
    log_wrapper::{debug, log_warn, trace},
    run_loop::RunLoop,
    scheduler, time,
};

/// Maximum number of simultaneously active timers.
pub const MAX_ACTIVE_TIMERS: usize = 32;

static ACTIVE_TIMERS: Mutex<RefCell<TimerTable>> = Mutex::new(RefCell::new(TimerTable::new()));

/// Callback invoked with the timer that fired.
pub type TimerCallback = &'static (dyn Fn(&Timer) + Sync);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerMode {
    OneShot,
    /// Fires every `delay` ticks, measured from the previous scheduled wakeup.
    Periodic,
}

#[derive(Clone, Copy)]
struct TimerEntry {
    wakeup: u64,
    timer: &'static Timer,
    run_loop: &'static RunLoop,
}

/// Active timers sorted by wakeup (FIFO among equal wakeups), plus the number of
/// places held for periodic timers whose callback is running.
struct TimerTable {
    entries: Vec<TimerEntry, MAX_ACTIVE_TIMERS>,
    reserved: usize,
}

impl TimerTable {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
            reserved: 0,
        }
    }

    /// Inserts an entry, consuming a held place if `reserved` is set.
    fn insert(&mut self, entry: TimerEntry, reserved: bool) -> Result<(), Error> {
        if reserved {
            self.release();
        } else if self.entries.len() + self.reserved >= MAX_ACTIVE_TIMERS {
            log_warn!("Too many active timers");
            return Err(Error::ResourceExhausted);
        }

        let index = self
            .entries
            .iter()
            .position(|other| other.wakeup > entry.wakeup)
            .unwrap_or(self.entries.len());
        self.entries
            .insert(index, entry)
            .map_err(|_| Error::ResourceExhausted)
    }

    fn remove(&mut self, timer: &Timer) -> bool {
        let Some(index) = self
            .entries
            .iter()
            .position(|entry| core::ptr::eq(entry.timer, timer))
        else {
            return false;
        };
        self.entries.remove(index);
        true
    }

    fn contains(&self, timer: &Timer) -> bool {
        self.entries
            .iter()
            .any(|entry| core::ptr::eq(entry.timer, timer))
    }

    /// Removes the first entry of `run_loop` if it is due at `now`.
    fn pop_expired(&mut self, run_loop: &RunLoop, now: u64) -> Option<TimerEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| core::ptr::eq(entry.run_loop, run_loop))?;
        if self.entries[index].wakeup > now {
            return None;
        }
        Some(self.entries.remove(index))
    }

    fn reserve(&mut self) {
        self.reserved += 1;
    }

    fn release(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }
}

pub struct Timer {
    name: &'static str,
    mode: TimerMode,
    callback: TimerCallback,
    inner: Mutex<RefCell<TimerInner>>,
}

struct TimerInner {
    delay: u64,
    wakeup: u64,
    active: bool,
    /// The callback is running.
    firing: bool,
    /// Holds a place in the active list until rescheduled after its callback.
    reserved: bool,
    run_loop: Option<&'static RunLoop>,
    deleted: bool,
}

impl Timer {
    pub const fn new(name: &'static str, mode: TimerMode, delay: u64, callback: TimerCallback) -> Self {
        Self {
            name,
            mode,
            callback,
            inner: Mutex::new(RefCell::new(TimerInner {
                delay,
                wakeup: 0,
                active: false,
                firing: false,
                reserved: false,
                run_loop: None,
                deleted: false,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    /// Makes `run_loop` invoke the callback of this timer. Not allowed while active.
    pub fn attach(&self, run_loop: &'static RunLoop) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted || run_loop.is_deleted(cs) {
                return Err(Error::ObjectDeleted);
            }
            if inner.active {
                return Err(Error::InvalidState);
            }
            inner.run_loop = Some(run_loop);
            Ok(())
        })
    }

    /// Arms the timer to fire `delay` ticks from now, restarting it if already active.
    ///
    /// A timer without a run loop is attached to the run loop of the calling thread.
    /// Fails with [`Error::InvalidState`] if there is none.
    pub fn start(&'static self) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            if inner.delay == 0 {
                return Err(Error::InvalidParameter);
            }
            let run_loop = inner
                .run_loop
                .or_else(|| scheduler::current_run_loop(cs))
                .ok_or(Error::InvalidState)?;
            inner.run_loop = Some(run_loop);
            drop(inner);

            self.arm(cs, run_loop)
        })
    }

    /// Disarms the timer. Fails with [`Error::InvalidState`] if it is not active.
    pub fn stop(&self) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            if !inner.active {
                return Err(Error::InvalidState);
            }
            inner.active = false;
            drop(inner);

            remove_entry(cs, self);
            Ok(())
        })
    }

    /// Changes the delay. An active timer is restarted with it, except from inside its
    /// own callback where only the following periods change.
    pub fn set_delay(&'static self, delay: u64) -> Result<(), Error> {
        if delay == 0 {
            return Err(Error::InvalidParameter);
        }

        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            inner.delay = delay;
            let rearm = inner.run_loop.filter(|_| inner.active && !inner.firing);
            drop(inner);

            match rearm {
                Some(run_loop) => self.arm(cs, run_loop),
                None => Ok(()),
            }
        })
    }

    pub fn is_active(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).active)
    }

    pub fn delay(&self) -> u64 {
        critical_section::with(|cs| self.inner.borrow_ref(cs).delay)
    }

    /// Absolute tick at which an active timer fires next.
    pub fn wakeup_time(&self) -> Option<u64> {
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            inner.active.then_some(inner.wakeup)
        })
    }

    /// Disarms the timer for good. All later operations fail with [`Error::ObjectDeleted`].
    pub fn delete(&self) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            inner.deleted = true;
            inner.active = false;
            drop(inner);

            remove_entry(cs, self);
            Ok(())
        })?;

        debug!("Timer {} deleted", self.name);
        Ok(())
    }

    /// (Re)inserts the timer at `now + delay` and lets the run loop recompute its deadline.
    ///
    /// Fails with [`Error::ObjectDeleted`] if `run_loop` was deleted.
    fn arm(&'static self, cs: CriticalSection<'_>, run_loop: &'static RunLoop) -> Result<(), Error> {
        if run_loop.is_deleted(cs) {
            return Err(Error::ObjectDeleted);
        }
        remove_entry(cs, self);

        let mut inner = self.inner.borrow_ref_mut(cs);
        let wakeup = time::current_time().saturating_add(inner.delay);
        let reserved = core::mem::take(&mut inner.reserved);
        if let Err(err) = insert_entry(cs, wakeup, self, run_loop, reserved) {
            inner.active = false;
            return Err(err);
        }
        inner.wakeup = wakeup;
        inner.active = true;
        drop(inner);

        run_loop.notify(cs);
        Ok(())
    }
}

fn insert_entry(
    cs: CriticalSection<'_>,
    wakeup: u64,
    timer: &'static Timer,
    run_loop: &'static RunLoop,
    reserved: bool,
) -> Result<(), Error> {
    ACTIVE_TIMERS.borrow_ref_mut(cs).insert(
        TimerEntry {
            wakeup,
            timer,
            run_loop,
        },
        reserved,
    )
}

fn remove_entry(cs: CriticalSection<'_>, timer: &Timer) -> bool {
    ACTIVE_TIMERS.borrow_ref_mut(cs).remove(timer)
}

/// Earliest wakeup among the timers of `run_loop`.
pub(crate) fn next_wakeup(cs: CriticalSection<'_>, run_loop: &RunLoop) -> Option<u64> {
    ACTIVE_TIMERS
        .borrow_ref(cs)
        .entries
        .iter()
        .find(|entry| core::ptr::eq(entry.run_loop, run_loop))
        .map(|entry| entry.wakeup)
}

/// Disarms every timer of a run loop being deleted.
pub(crate) fn cancel_all(cs: CriticalSection<'_>, run_loop: &RunLoop) {
    let mut timers = ACTIVE_TIMERS.borrow_ref_mut(cs);
    for entry in timers.entries.iter() {
        if core::ptr::eq(entry.run_loop, run_loop) {
            let mut inner = entry.timer.inner.borrow_ref_mut(cs);
            inner.active = false;
            inner.run_loop = None;
        }
    }
    timers
        .entries
        .retain(|entry| !core::ptr::eq(entry.run_loop, run_loop));
}

/// Invokes the callbacks of the expired timers of `run_loop` in wakeup order.
pub(crate) fn fire_expired(run_loop: &'static RunLoop) {
    let now = time::current_time();

    loop {
        let expired = critical_section::with(|cs| {
            let mut timers = ACTIVE_TIMERS.borrow_ref_mut(cs);
            let entry = timers.pop_expired(run_loop, now)?;

            let mut inner = entry.timer.inner.borrow_ref_mut(cs);
            inner.firing = true;
            match entry.timer.mode {
                TimerMode::OneShot => inner.active = false,
                TimerMode::Periodic => {
                    timers.reserve();
                    inner.reserved = true;
                }
            }
            Some(entry)
        });
        let Some(entry) = expired else {
            break;
        };

        trace!("Timer {} fired", entry.timer.name);
        (entry.timer.callback)(entry.timer);

        critical_section::with(|cs| {
            let mut inner = entry.timer.inner.borrow_ref_mut(cs);
            inner.firing = false;
            let reserved = core::mem::take(&mut inner.reserved);

            // Skipped if the callback stopped or restarted the timer
            let restarted = ACTIVE_TIMERS.borrow_ref(cs).contains(entry.timer);
            if entry.timer.mode == TimerMode::Periodic && inner.active && !restarted {
                let wakeup = next_periodic_wakeup(entry.wakeup, inner.delay, time::current_time());
                match insert_entry(cs, wakeup, entry.timer, entry.run_loop, reserved) {
                    Ok(()) => inner.wakeup = wakeup,
                    Err(_) => {
                        log_warn!("Timer {} could not be rescheduled", entry.timer.name);
                        inner.active = false;
                    }
                }
            } else if reserved {
                ACTIVE_TIMERS.borrow_ref_mut(cs).release();
            }
        });
    }
}

/// Next wakeup of a periodic timer scheduled at `previous`, on the grid
/// `previous + k * delay`.
///
/// When the callback overran one or more periods, the latest missed grid point is
/// returned so that the timer fires once immediately instead of once per missed period.
fn next_periodic_wakeup(previous: u64, delay: u64, now: u64) -> u64 {
    let next = previous.saturating_add(delay);
    if next > now {
        next
    } else {
        previous + (now - previous) / delay * delay
    }
}
