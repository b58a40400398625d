//! Unbuffered rendezvous channel.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::{
    Error, Timeout,
    log_wrapper::info,
    scheduler,
    wait::{Slot, WaitList},
};

/// Synchronous channel without storage.
///
/// A send completes only once a receiver has taken the value, and the value moves from
/// the sender to the receiver inside one critical section, so no other thread ever
/// observes a half-done transfer.
pub struct Channel<T> {
    name: &'static str,
    inner: Mutex<RefCell<ChannelInner<T>>>,
}

struct ChannelInner<T> {
    senders: WaitList<Slot<T>>,
    receivers: WaitList<Slot<T>>,
    deleted: bool,
}

impl<T> Channel<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(RefCell::new(ChannelInner {
                senders: WaitList::new(),
                receivers: WaitList::new(),
                deleted: false,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Passes `value` to a receiver, waiting for at most `timeout` for one to arrive.
    ///
    /// With a zero timeout, succeeds only if a receiver is already waiting. The value is
    /// dropped when the send fails.
    pub fn send(&self, value: T, timeout: Timeout) -> Result<(), Error> {
        let mut outgoing = Some(value);

        let waiting = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }

            if let Some(receiver) = inner.receivers.pop_wakeable(cs) {
                if let Some(value) = outgoing.take() {
                    // SAFETY: the receiver is still blocked, so its slot is alive
                    unsafe { receiver.payload.put(value) };
                }
                scheduler::wake(cs, receiver.thread, Ok(()));
                return Ok(None);
            }

            if timeout.is_no_wait() {
                return Err(Error::WouldBlock);
            }

            let me = scheduler::prepare_block(cs)?;
            inner.senders.push(cs, me, Slot::new(&mut outgoing))?;
            scheduler::block_current(cs, timeout);

            Ok(Some(me))
        })?;

        let Some(me) = waiting else {
            scheduler::reschedule();
            return Ok(());
        };

        let result = scheduler::wait_for_wake();
        if result.is_err() {
            critical_section::with(|cs| {
                self.inner.borrow_ref_mut(cs).senders.remove(me);
            });
        }

        result
    }

    /// Takes a value from a sender, waiting for at most `timeout` for one to arrive.
    pub fn receive(&self, timeout: Timeout) -> Result<T, Error> {
        let mut incoming: Option<T> = None;

        let waiting = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }

            if let Some(sender) = inner.senders.pop_wakeable(cs) {
                // SAFETY: the sender is still blocked, so its slot is alive
                incoming = unsafe { sender.payload.take() };
                scheduler::wake(cs, sender.thread, Ok(()));
                return Ok(None);
            }

            if timeout.is_no_wait() {
                return Err(Error::WouldBlock);
            }

            let me = scheduler::prepare_block(cs)?;
            inner.receivers.push(cs, me, Slot::new(&mut incoming))?;
            scheduler::block_current(cs, timeout);

            Ok(Some(me))
        })?;

        if let Some(me) = waiting {
            let result = scheduler::wait_for_wake();
            if let Err(err) = result {
                critical_section::with(|cs| {
                    self.inner.borrow_ref_mut(cs).receivers.remove(me);
                });
                return Err(err);
            }
        } else {
            scheduler::reschedule();
        }

        incoming.take().ok_or(Error::InvalidState)
    }

    /// Wakes every blocked thread with [`Error::ObjectDeleted`]. All later operations fail with it too.
    pub fn delete(&self) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            inner.deleted = true;

            for waiter in inner.senders.drain() {
                scheduler::wake(cs, waiter.thread, Err(Error::ObjectDeleted));
            }
            for waiter in inner.receivers.drain() {
                scheduler::wake(cs, waiter.thread, Err(Error::ObjectDeleted));
            }

            Ok(())
        })?;

        info!("Channel {} deleted", self.name);
        scheduler::reschedule();
        Ok(())
    }
}
