//! Counting semaphore.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::{Error, Timeout, log_wrapper::info, scheduler, wait::WaitList};

/// Counting semaphore whose waiters are served by priority, FIFO among equals.
///
/// [`Semaphore::put`] hands the token straight to a waiter when there is one, so the
/// count only grows while nobody waits.
pub struct Semaphore {
    name: &'static str,
    inner: Mutex<RefCell<SemaphoreInner>>,
}

struct SemaphoreInner {
    count: u32,
    waiters: WaitList<()>,
    deleted: bool,
}

impl Semaphore {
    pub const fn new(name: &'static str, count: u32) -> Self {
        Self {
            name,
            inner: Mutex::new(RefCell::new(SemaphoreInner {
                count,
                waiters: WaitList::new(),
                deleted: false,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Takes a token, blocking for at most `timeout` while none is available.
    pub fn get(&self, timeout: Timeout) -> Result<(), Error> {
        let waiting = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }

            if inner.count > 0 {
                inner.count -= 1;
                return Ok(None);
            }
            if timeout.is_no_wait() {
                return Err(Error::WouldBlock);
            }

            let me = scheduler::prepare_block(cs)?;
            inner.waiters.push(cs, me, ())?;
            scheduler::block_current(cs, timeout);

            Ok(Some(me))
        })?;

        let Some(me) = waiting else {
            return Ok(());
        };

        let result = scheduler::wait_for_wake();
        if result.is_err() {
            critical_section::with(|cs| {
                self.inner.borrow_ref_mut(cs).waiters.remove(me);
            });
        }

        result
    }

    /// Returns a token. Callable from interrupt context.
    pub fn put(&self) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }

            match inner.waiters.pop_wakeable(cs) {
                Some(waiter) => {
                    scheduler::wake(cs, waiter.thread, Ok(()));
                }
                None => {
                    inner.count = inner
                        .count
                        .checked_add(1)
                        .ok_or(Error::ResourceExhausted)?;
                }
            }

            Ok(())
        })?;

        scheduler::reschedule();
        Ok(())
    }

    pub fn count(&self) -> u32 {
        critical_section::with(|cs| self.inner.borrow_ref(cs).count)
    }

    /// Wakes every waiter with [`Error::ObjectDeleted`]. All later operations fail with it too.
    pub fn delete(&self) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            inner.deleted = true;
            inner.count = 0;

            for waiter in inner.waiters.drain() {
                scheduler::wake(cs, waiter.thread, Err(Error::ObjectDeleted));
            }

            Ok(())
        })?;

        info!("Semaphore {} deleted", self.name);
        scheduler::reschedule();
        Ok(())
    }
}
