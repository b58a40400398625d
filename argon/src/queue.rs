//! Bounded blocking queue.
//!
//! Elements are moved, not copied through a byte buffer: a sender facing a blocked
//! receiver hands the element over directly, and a receiver that frees a slot pulls the
//! element of the first blocked sender into the buffer, so FIFO order always holds.
//!
//! A queue attached to a [`RunLoop`] either passes its elements to a handler on the
//! loop's thread or, when attached without one, makes [`RunLoop::run`] return
//! [`RunLoopExit::QueueReceived`](crate::run_loop::RunLoopExit::QueueReceived).

use core::cell::RefCell;

use critical_section::{CriticalSection, Mutex};
use heapless::Deque;

use crate::{
    Error, Timeout,
    log_wrapper::{debug, info},
    run_loop::{Dispatch, RunLoop, RunLoopSource},
    scheduler,
    wait::{Slot, WaitList},
};

/// Handler invoked by a run loop with each element received from an attached queue.
pub type QueueHandler<T> = &'static (dyn Fn(T) + Sync);

/// Identity of a queue, as reported by a run loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueueId(usize);

pub struct Queue<T: 'static, const N: usize> {
    name: &'static str,
    inner: Mutex<RefCell<QueueInner<T, N>>>,
}

struct QueueInner<T: 'static, const N: usize> {
    buffer: Deque<T, N>,
    senders: WaitList<Slot<T>>,
    receivers: WaitList<Slot<T>>,
    attachment: Option<Attachment<T>>,
    deleted: bool,
}

struct Attachment<T: 'static> {
    run_loop: &'static RunLoop,
    source: usize,
    /// Without a handler, the thread running the loop receives the elements.
    handler: Option<QueueHandler<T>>,
}

impl<T: 'static, const N: usize> QueueInner<T, N> {
    /// Pops the oldest element and refills the freed slot from a blocked sender.
    fn take_item(&mut self, cs: CriticalSection<'_>) -> Option<T> {
        let item = self.buffer.pop_front()?;

        if let Some(sender) = self.senders.pop_wakeable(cs) {
            // SAFETY: the sender is still blocked, so its slot is alive
            if let Some(pending) = unsafe { sender.payload.take() } {
                // One slot was just freed
                let _ = self.buffer.push_back(pending);
            }
            scheduler::wake(cs, sender.thread, Ok(()));
        }

        Some(item)
    }

    fn flag_run_loop(&self, cs: CriticalSection<'_>) {
        if let Some(attachment) = &self.attachment {
            attachment.run_loop.flag_source(cs, attachment.source);
        }
    }
}

impl<T: 'static, const N: usize> Queue<T, N> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(RefCell::new(QueueInner {
                buffer: Deque::new(),
                senders: WaitList::new(),
                receivers: WaitList::new(),
                attachment: None,
                deleted: false,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn id(&self) -> QueueId {
        QueueId(self as *const Self as usize)
    }

    /// Appends `item`, blocking for at most `timeout` while the queue is full.
    ///
    /// Fails with [`Error::QueueFull`] when the queue is full and `timeout` is zero.
    /// The item is dropped when the send fails.
    pub fn send(&self, item: T, timeout: Timeout) -> Result<(), Error> {
        let mut pending = Some(item);

        let waiting = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }

            if let Some(receiver) = inner.receivers.pop_wakeable(cs) {
                if let Some(item) = pending.take() {
                    // SAFETY: the receiver is still blocked, so its slot is alive
                    unsafe { receiver.payload.put(item) };
                }
                scheduler::wake(cs, receiver.thread, Ok(()));
                return Ok(None);
            }

            if !inner.buffer.is_full() {
                if let Some(item) = pending.take() {
                    let _ = inner.buffer.push_back(item);
                }
                inner.flag_run_loop(cs);
                return Ok(None);
            }

            if timeout.is_no_wait() {
                return Err(Error::QueueFull);
            }

            let me = scheduler::prepare_block(cs)?;
            inner.senders.push(cs, me, Slot::new(&mut pending))?;
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

    /// Removes the oldest element, blocking for at most `timeout` while the queue is empty.
    ///
    /// Fails with [`Error::QueueEmpty`] when the queue is empty and `timeout` is zero.
    pub fn receive(&self, timeout: Timeout) -> Result<T, Error> {
        let mut incoming: Option<T> = None;

        let waiting = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }

            if let Some(item) = inner.take_item(cs) {
                return Ok(Err(item));
            }

            // Only reachable with a zero-capacity queue
            if let Some(sender) = inner.senders.pop_wakeable(cs) {
                // SAFETY: the sender is still blocked, so its slot is alive
                let item = unsafe { sender.payload.take() };
                scheduler::wake(cs, sender.thread, Ok(()));
                if let Some(item) = item {
                    return Ok(Err(item));
                }
            }

            if timeout.is_no_wait() {
                return Err(Error::QueueEmpty);
            }

            let me = scheduler::prepare_block(cs)?;
            inner.receivers.push(cs, me, Slot::new(&mut incoming))?;
            scheduler::block_current(cs, timeout);

            Ok(Ok(me))
        })?;

        let me = match waiting {
            Ok(me) => me,
            Err(item) => {
                scheduler::reschedule();
                return Ok(item);
            }
        };

        let result = scheduler::wait_for_wake();
        if let Err(err) = result {
            critical_section::with(|cs| {
                self.inner.borrow_ref_mut(cs).receivers.remove(me);
            });
            return Err(err);
        }

        incoming.take().ok_or(Error::InvalidState)
    }

    /// Number of buffered elements.
    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).buffer.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).buffer.is_full())
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Detaches the queue from its run loop, if any.
    pub fn detach(&self) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if let Some(attachment) = inner.attachment.take() {
                attachment.run_loop.unregister_source(cs, attachment.source);
            }
        });
    }

    /// Drops buffered elements and wakes every blocked thread with [`Error::ObjectDeleted`].
    /// All later operations fail with it too.
    pub fn delete(&self) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            inner.deleted = true;
            inner.buffer.clear();

            if let Some(attachment) = inner.attachment.take() {
                attachment.run_loop.unregister_source(cs, attachment.source);
            }
            for waiter in inner.senders.drain() {
                scheduler::wake(cs, waiter.thread, Err(Error::ObjectDeleted));
            }
            for waiter in inner.receivers.drain() {
                scheduler::wake(cs, waiter.thread, Err(Error::ObjectDeleted));
            }

            Ok(())
        })?;

        info!("Queue {} deleted", self.name);
        scheduler::reschedule();
        Ok(())
    }
}

impl<T: Send + 'static, const N: usize> Queue<T, N> {
    /// Lets `run_loop` receive the elements of this queue and pass them to `handler`,
    /// one element per run loop iteration.
    ///
    /// Fails with [`Error::InvalidState`] if the queue is attached to another run loop.
    pub fn attach(&'static self, run_loop: &'static RunLoop, handler: QueueHandler<T>) -> Result<(), Error> {
        critical_section::with(|cs| self.attach_in(cs, run_loop, Some(handler)))
    }

    /// Attaches the queue to the run loop of the calling thread.
    pub fn attach_current(&'static self, handler: QueueHandler<T>) -> Result<(), Error> {
        critical_section::with(|cs| {
            let run_loop = scheduler::current_run_loop(cs).ok_or(Error::InvalidState)?;
            self.attach_in(cs, run_loop, Some(handler))
        })
    }

    /// Makes `run_loop` return [`RunLoopExit::QueueReceived`] with the
    /// [`id`](Queue::id) of this queue while it holds elements, for the calling thread
    /// to [`receive`](Queue::receive) them.
    ///
    /// [`RunLoopExit::QueueReceived`]: crate::run_loop::RunLoopExit::QueueReceived
    pub fn attach_without_handler(&'static self, run_loop: &'static RunLoop) -> Result<(), Error> {
        critical_section::with(|cs| self.attach_in(cs, run_loop, None))
    }

    fn attach_in(
        &'static self,
        cs: CriticalSection<'_>,
        run_loop: &'static RunLoop,
        handler: Option<QueueHandler<T>>,
    ) -> Result<(), Error> {
        let mut inner = self.inner.borrow_ref_mut(cs);
        if inner.deleted {
            return Err(Error::ObjectDeleted);
        }

        match inner.attachment.as_mut() {
            Some(attachment) if core::ptr::eq(attachment.run_loop, run_loop) => {
                attachment.handler = handler;
            }
            Some(_) => return Err(Error::InvalidState),
            None => {
                let source = run_loop.register_source(cs, self)?;
                inner.attachment = Some(Attachment {
                    run_loop,
                    source,
                    handler,
                });
                debug!("Queue {} attached to run loop {}", self.name, run_loop.name());
            }
        }

        // Elements sent before attaching are dispatched too
        if !inner.buffer.is_empty() {
            inner.flag_run_loop(cs);
        }

        Ok(())
    }
}

impl<T: Send + 'static, const N: usize> RunLoopSource for Queue<T, N> {
    fn dispatch(&self) -> Dispatch {
        let event = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let Some(attachment) = inner.attachment.as_ref() else {
                return Ok(None);
            };
            let Some(handler) = attachment.handler else {
                return Err(inner.buffer.len());
            };
            let Some(item) = inner.take_item(cs) else {
                return Ok(None);
            };
            Ok(Some((handler, item, !inner.buffer.is_empty())))
        });
        scheduler::reschedule();

        match event {
            Ok(Some((handler, item, more))) => {
                handler(item);
                Dispatch::Handled(more)
            }
            Ok(None) | Err(0) => Dispatch::Handled(false),
            // The thread running the loop receives one element; a second one keeps
            // the queue flagged
            Err(len) => Dispatch::Received {
                queue: self.id(),
                more: len > 1,
            },
        }
    }

    fn detach(&self) {
        Queue::detach(self);
    }
}
