//! Recursive mutex with priority inheritance.
//!
//! While a thread waits for a mutex, the owner runs at no less than the waiter's
//! priority. The inherited priority is tracked per mutex, so releasing one of several
//! owned mutexes keeps what the others still require.

use core::cell::RefCell;

use crate::{
    Error, Timeout, arch,
    log_wrapper::{debug, info},
    scheduler,
    thread::ThreadId,
    wait::WaitList,
};

pub struct Mutex {
    name: &'static str,
    inner: critical_section::Mutex<RefCell<MutexInner>>,
}

struct MutexInner {
    owner: Option<ThreadId>,
    count: u32,
    waiters: WaitList<()>,
    deleted: bool,
}

impl Mutex {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: critical_section::Mutex::new(RefCell::new(MutexInner {
                owner: None,
                count: 0,
                waiters: WaitList::new(),
                deleted: false,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Key identifying this mutex in the inherited priorities of its owner.
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Acquires the mutex, blocking for at most `timeout`.
    ///
    /// A thread that already owns the mutex may lock it again; it must then unlock it
    /// as many times.
    pub fn lock(&self, timeout: Timeout) -> Result<(), Error> {
        if arch::in_interrupt() {
            return Err(Error::NotFromInterrupt);
        }

        let waiting = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            let me = scheduler::current_id(cs)?;

            let owner = inner.owner;
            match owner {
                None => {
                    inner.owner = Some(me);
                    inner.count = 1;
                    Ok(None)
                }
                Some(owner) if owner == me => {
                    inner.count = inner
                        .count
                        .checked_add(1)
                        .ok_or(Error::ResourceExhausted)?;
                    Ok(None)
                }
                Some(owner) => {
                    if timeout.is_no_wait() {
                        return Err(Error::WouldBlock);
                    }

                    let me = scheduler::prepare_block(cs)?;
                    inner.waiters.push(cs, me, ())?;
                    drop(inner);

                    let priority = scheduler::priority_of(cs, me).unwrap_or(0);
                    scheduler::raise_priority(cs, owner, self.key(), priority);
                    scheduler::set_waiting_on(cs, me, Some((self.key(), owner)));
                    scheduler::block_current(cs, timeout);

                    Ok(Some(me))
                }
            }
        })?;

        let Some(me) = waiting else {
            return Ok(());
        };

        let result = scheduler::wait_for_wake();
        if result.is_err() {
            // Timed out or deleted: ownership was not transferred
            critical_section::with(|cs| {
                scheduler::set_waiting_on(cs, me, None);
                let mut inner = self.inner.borrow_ref_mut(cs);
                inner.waiters.remove(me);
                let owner = inner.owner;
                let remaining = inner.waiters.highest_priority(cs);
                drop(inner);

                if let Some(owner) = owner {
                    scheduler::set_boost(cs, owner, self.key(), remaining);
                }
            });
            scheduler::reschedule();
        }

        result
    }

    /// Releases one level of ownership.
    ///
    /// Unlocking a mutex the caller does not own is a programming error reported as
    /// [`Error::NotOwner`].
    pub fn unlock(&self) -> Result<(), Error> {
        if arch::in_interrupt() {
            return Err(Error::NotFromInterrupt);
        }

        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            let me = scheduler::current_id(cs)?;
            if inner.owner != Some(me) {
                return Err(Error::NotOwner);
            }

            inner.count -= 1;
            if inner.count > 0 {
                return Ok(());
            }

            // Drops what this mutex made the owner inherit
            scheduler::set_boost(cs, me, self.key(), None);

            match inner.waiters.pop_wakeable(cs) {
                Some(next) => {
                    inner.owner = Some(next.thread);
                    inner.count = 1;
                    let remaining = inner.waiters.highest_priority(cs);

                    scheduler::set_waiting_on(cs, next.thread, None);
                    for waiter in inner.waiters.threads() {
                        scheduler::set_waiting_on(cs, waiter, Some((self.key(), next.thread)));
                    }
                    scheduler::set_boost(cs, next.thread, self.key(), remaining);
                    scheduler::wake(cs, next.thread, Ok(()));

                    debug!("Mutex {} handed over to thread #{}", self.name, next.thread.slot);
                }
                None => {
                    inner.owner = None;
                }
            }

            Ok(())
        })?;

        scheduler::reschedule();
        Ok(())
    }

    /// Thread currently owning the mutex.
    pub fn owner(&self) -> Option<ThreadId> {
        critical_section::with(|cs| self.inner.borrow_ref(cs).owner)
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Recursion depth of the current owner, 0 when unlocked.
    pub fn lock_count(&self) -> u32 {
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

            if let Some(owner) = inner.owner.take() {
                scheduler::set_boost(cs, owner, self.key(), None);
            }
            inner.count = 0;

            for waiter in inner.waiters.drain() {
                scheduler::set_waiting_on(cs, waiter.thread, None);
                scheduler::wake(cs, waiter.thread, Err(Error::ObjectDeleted));
            }

            Ok(())
        })?;

        info!("Mutex {} deleted", self.name);
        scheduler::reschedule();
        Ok(())
    }
}
