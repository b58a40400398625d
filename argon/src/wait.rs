//! Priority-ordered wait list shared by the synchronization objects.

use critical_section::CriticalSection;
use heapless::Vec;

use crate::{
    Error,
    scheduler::{self, MAX_NUM_THREADS},
    thread::ThreadId,
};

/// A blocked thread and the data it exchanges with the waking party.
pub(crate) struct Waiter<P> {
    pub(crate) thread: ThreadId,
    pub(crate) payload: P,
}

/// Waiters in arrival order.
///
/// The next waiter is chosen when the list is serviced, by the current effective
/// priority of each thread, so priority changes while waiting are honored.
pub(crate) struct WaitList<P> {
    waiters: Vec<Waiter<P>, MAX_NUM_THREADS>,
}

impl<P> WaitList<P> {
    pub(crate) const fn new() -> Self {
        Self {
            waiters: Vec::new(),
        }
    }

    /// Appends a waiter. Entries left behind by terminated threads are dropped when the
    /// list is full.
    pub(crate) fn push(
        &mut self,
        cs: CriticalSection<'_>,
        thread: ThreadId,
        payload: P,
    ) -> Result<(), Error> {
        if self.waiters.is_full() {
            self.waiters
                .retain(|waiter| scheduler::thread_exists(cs, waiter.thread));
        }
        self.waiters
            .push(Waiter { thread, payload })
            .map_err(|_| Error::ResourceExhausted)
    }

    pub(crate) fn remove(&mut self, thread: ThreadId) -> Option<Waiter<P>> {
        let index = self
            .waiters
            .iter()
            .position(|waiter| waiter.thread == thread)?;
        Some(self.waiters.remove(index))
    }

    pub(crate) fn threads(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.waiters.iter().map(|waiter| waiter.thread)
    }

    /// Index of the waiter with the highest priority, the earliest among equals.
    /// Waiters for which `priority_of` returns `None` are skipped.
    fn position_of_next(&self, priority_of: impl Fn(ThreadId) -> Option<u8>) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for (index, waiter) in self.waiters.iter().enumerate() {
            let Some(priority) = priority_of(waiter.thread) else {
                continue;
            };
            if best.is_none_or(|(_, best_priority)| priority > best_priority) {
                best = Some((index, priority));
            }
        }
        best.map(|(index, _)| index)
    }

    fn pop_next(&mut self, priority_of: impl Fn(ThreadId) -> Option<u8>) -> Option<Waiter<P>> {
        let index = self.position_of_next(priority_of)?;
        Some(self.waiters.remove(index))
    }

    /// Removes and returns the next waiter that is still blocked.
    ///
    /// Entries of threads that no longer exist are dropped. Threads woken by a timeout
    /// are left in place; they remove themselves when they run.
    pub(crate) fn pop_wakeable(&mut self, cs: CriticalSection<'_>) -> Option<Waiter<P>> {
        self.waiters
            .retain(|waiter| scheduler::thread_exists(cs, waiter.thread));
        self.pop_next(|thread| scheduler::waiting_priority(cs, thread))
    }

    /// Highest priority among the waiters that are still blocked.
    pub(crate) fn highest_priority(&self, cs: CriticalSection<'_>) -> Option<u8> {
        self.waiters
            .iter()
            .filter_map(|waiter| scheduler::waiting_priority(cs, waiter.thread))
            .max()
    }

    /// Empties the list, returning the waiters in arrival order.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Waiter<P>> {
        core::mem::take(&mut self.waiters).into_iter()
    }
}

/// Pointer to a value slot on the stack of a blocked thread.
///
/// The slot outlives the wait: its owner only leaves the wait after removing itself
/// from the list, in a critical section, and a slot is only accessed inside one while
/// its owner is still blocked.
pub(crate) struct Slot<T>(*mut Option<T>);

// SAFETY: see the type documentation, accesses are serialized by critical sections
unsafe impl<T: Send> Send for Slot<T> {}

impl<T> Slot<T> {
    pub(crate) fn new(slot: &mut Option<T>) -> Self {
        Self(slot)
    }

    /// # Safety
    /// The owning thread must still be blocked on the list this slot was taken from.
    pub(crate) unsafe fn take(&self) -> Option<T> {
        unsafe { (*self.0).take() }
    }

    /// # Safety
    /// The owning thread must still be blocked on the list this slot was taken from.
    pub(crate) unsafe fn put(&self, value: T) {
        unsafe {
            *self.0 = Some(value);
        }
    }
}
