//! Single-threaded event dispatcher.
//!
//! A run loop runs on the thread that calls [`RunLoop::run`] and turns timer expiries,
//! queue elements, deferred functions, and signals into callback invocations on that
//! thread. While nothing is pending it blocks until the earliest timer wakeup.
//!
//! Each iteration fires the expired timers, dispatches one element from every flagged
//! queue, runs one deferred function, delivers accumulated signals, and then checks for
//! a stop request. A queue attached without a handler ends the run instead, so that
//! the calling thread receives from it itself.

use core::{cell::RefCell, ops::ControlFlow};

use critical_section::{CriticalSection, Mutex};
use heapless::Deque;

use crate::{
    Error, Timeout,
    log_wrapper::{debug, info},
    queue::QueueId,
    scheduler,
    thread::ThreadId,
    time, timer,
};

pub const MAX_RUN_LOOP_SOURCES: usize = 16;
pub const RUN_LOOP_FUNCTION_QUEUE_SIZE: usize = 8;

/// Function queued with [`RunLoop::perform`].
pub type RunLoopFunction = &'static (dyn Fn() + Sync);
/// Handler receiving the signal bits accumulated since the previous iteration.
pub type SignalHandler = &'static (dyn Fn(u32) + Sync);

/// Why [`RunLoop::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunLoopExit {
    /// [`RunLoop::stop`] was called.
    Stopped,
    /// An element is waiting in a queue attached without a handler.
    QueueReceived(QueueId),
}

/// Outcome of dispatching a source.
pub(crate) enum Dispatch {
    /// At most one event was handled; `true` while more remain.
    Handled(bool),
    /// Events are left for the thread running the loop.
    Received { queue: QueueId, more: bool },
}

/// Event source dispatched by a run loop, such as an attached queue.
pub(crate) trait RunLoopSource: Sync {
    fn dispatch(&self) -> Dispatch;
    /// Breaks the link to the run loop.
    fn detach(&self);
}

pub struct RunLoop {
    name: &'static str,
    inner: Mutex<RefCell<RunLoopInner>>,
}

struct RunLoopInner {
    thread: Option<ThreadId>,
    /// Nesting depth of `run` calls on the owning thread.
    depth: u32,
    stop: bool,
    /// The owning thread is blocked waiting for an event.
    waiting: Option<ThreadId>,
    sources: [Option<&'static dyn RunLoopSource>; MAX_RUN_LOOP_SOURCES],
    pending_sources: u32,
    functions: Deque<RunLoopFunction, RUN_LOOP_FUNCTION_QUEUE_SIZE>,
    signals: Option<u32>,
    signal_handler: Option<SignalHandler>,
    deleted: bool,
}

impl RunLoopInner {
    fn wake(&mut self, cs: CriticalSection<'_>) {
        if let Some(thread) = self.waiting.take() {
            scheduler::wake(cs, thread, Ok(()));
        }
    }

    fn has_pending_work(&self) -> bool {
        self.pending_sources != 0 || !self.functions.is_empty() || self.signals.is_some()
    }
}

impl RunLoop {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(RefCell::new(RunLoopInner {
                thread: None,
                depth: 0,
                stop: false,
                waiting: None,
                sources: [None; MAX_RUN_LOOP_SOURCES],
                pending_sources: 0,
                functions: Deque::new(),
                signals: None,
                signal_handler: None,
                deleted: false,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The run loop running on the calling thread, if any.
    pub fn current() -> Option<&'static RunLoop> {
        critical_section::with(scheduler::current_run_loop)
    }

    /// Runs the loop on the calling thread until [`RunLoop::stop`] is called or an
    /// element arrives in a queue attached without a handler.
    pub fn run(&'static self) -> Result<RunLoopExit, Error> {
        self.run_for(Timeout::Forever)
    }

    /// Runs the loop until it exits like [`RunLoop::run`], or until `timeout` elapses,
    /// which is reported as [`Error::Timeout`].
    ///
    /// The loop may be run again from one of its own callbacks. It fails with
    /// [`Error::InvalidState`] if it is running on another thread or if the calling
    /// thread already runs a different loop.
    pub fn run_for(&'static self, timeout: Timeout) -> Result<RunLoopExit, Error> {
        let started_at = time::current_time();
        let deadline = match timeout {
            Timeout::Forever => None,
            Timeout::NoWait => Some(started_at),
            Timeout::Ticks(ticks) => Some(started_at.saturating_add(ticks)),
        };

        let me = critical_section::with(|cs| {
            let me = scheduler::prepare_block(cs)?;
            if let Some(other) = scheduler::current_run_loop(cs)
                && !core::ptr::eq(other, self)
            {
                return Err(Error::InvalidState);
            }

            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            if inner.depth > 0 && inner.thread != Some(me) {
                return Err(Error::InvalidState);
            }

            if inner.depth == 0 {
                inner.thread = Some(me);
                inner.stop = false;
                scheduler::set_run_loop(cs, me, Some(self));
            }
            inner.depth += 1;

            Ok(me)
        })?;

        info!("Run loop {} running", self.name);
        let result = self.iterate(me, deadline);

        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.depth -= 1;
            if inner.depth == 0 {
                inner.thread = None;
                scheduler::set_run_loop(cs, me, None);
            }
        });
        info!("Run loop {} stopped", self.name);

        result
    }

    fn iterate(&'static self, me: ThreadId, deadline: Option<u64>) -> Result<RunLoopExit, Error> {
        loop {
            timer::fire_expired(self);
            if let Some(queue) = self.dispatch_sources() {
                return Ok(RunLoopExit::QueueReceived(queue));
            }
            self.perform_one();
            self.deliver_signals();

            let step = critical_section::with(|cs| {
                let mut inner = self.inner.borrow_ref_mut(cs);
                if inner.stop {
                    return ControlFlow::Break(Ok(RunLoopExit::Stopped));
                }

                let now = time::current_time();
                if let Some(deadline) = deadline
                    && now >= deadline
                {
                    return ControlFlow::Break(Err(Error::Timeout));
                }

                if inner.has_pending_work() {
                    return ControlFlow::Continue(false);
                }

                // Sleep no longer than until the next timer or the deadline
                let wake_at = match (timer::next_wakeup(cs, self), deadline) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                let timeout = match wake_at {
                    Some(wake_at) if wake_at <= now => return ControlFlow::Continue(false),
                    Some(wake_at) => Timeout::Ticks(wake_at - now),
                    None => Timeout::Forever,
                };

                // The thread passed `prepare_block` when entering `run_for`
                inner.waiting = Some(me);
                scheduler::block_current(cs, timeout);
                ControlFlow::Continue(true)
            });

            match step {
                ControlFlow::Break(result) => return result,
                ControlFlow::Continue(true) => {
                    let _ = scheduler::wait_for_wake();
                    critical_section::with(|cs| {
                        self.inner.borrow_ref_mut(cs).waiting = None;
                    });
                }
                ControlFlow::Continue(false) => {}
            }
        }
    }

    /// Dispatches every flagged source, stopping at the first one whose events are
    /// left for the thread running the loop.
    fn dispatch_sources(&self) -> Option<QueueId> {
        let pending = critical_section::with(|cs| {
            core::mem::take(&mut self.inner.borrow_ref_mut(cs).pending_sources)
        });

        for index in 0..MAX_RUN_LOOP_SOURCES {
            let bit = 1 << index;
            if pending & bit == 0 {
                continue;
            }

            let source = critical_section::with(|cs| self.inner.borrow_ref(cs).sources[index]);
            let Some(source) = source else {
                continue;
            };

            match source.dispatch() {
                Dispatch::Handled(false) => {}
                Dispatch::Handled(true) => self.reflag(bit),
                Dispatch::Received { queue, more } => {
                    // Sources not visited yet keep their flag for the next run
                    let unvisited = pending & u32::MAX.checked_shl(index as u32 + 1).unwrap_or(0);
                    self.reflag(unvisited | if more { bit } else { 0 });
                    return Some(queue);
                }
            }
        }

        None
    }

    fn reflag(&self, bits: u32) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            // Only sources that are still registered
            let registered = inner
                .sources
                .iter()
                .enumerate()
                .filter(|(_, source)| source.is_some())
                .fold(0u32, |mask, (index, _)| mask | 1 << index);
            inner.pending_sources |= bits & registered;
        });
    }

    fn perform_one(&self) {
        let function =
            critical_section::with(|cs| self.inner.borrow_ref_mut(cs).functions.pop_front());
        if let Some(function) = function {
            function();
        }
    }

    fn deliver_signals(&self) {
        let (signals, handler) = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            (inner.signals.take(), inner.signal_handler)
        });
        if let (Some(signals), Some(handler)) = (signals, handler) {
            handler(signals);
        }
    }

    /// Asks the loop to return from [`RunLoop::run`] at the end of the current iteration.
    /// Callable from interrupt context.
    pub fn stop(&self) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            inner.stop = true;
            inner.wake(cs);
            Ok(())
        })?;

        scheduler::reschedule();
        Ok(())
    }

    /// Wakes the loop and passes `bits` to its signal handler. Bits of signals sent
    /// before the handler runs are combined. Callable from interrupt context.
    pub fn signal(&self, bits: u32) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            inner.signals = Some(inner.signals.unwrap_or(0) | bits);
            inner.wake(cs);
            Ok(())
        })?;

        scheduler::reschedule();
        Ok(())
    }

    pub fn set_signal_handler(&self, handler: SignalHandler) {
        critical_section::with(|cs| {
            self.inner.borrow_ref_mut(cs).signal_handler = Some(handler);
        });
    }

    /// Queues `function` to be called once on the loop's thread.
    ///
    /// Fails with [`Error::QueueFull`] when too many functions are pending.
    /// Callable from interrupt context.
    pub fn perform(&self, function: RunLoopFunction) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            inner
                .functions
                .push_back(function)
                .map_err(|_| Error::QueueFull)?;
            inner.wake(cs);
            Ok(())
        })?;

        scheduler::reschedule();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).depth > 0)
    }

    /// Detaches all queues and timers. Not allowed while running.
    pub fn delete(&self) -> Result<(), Error> {
        let sources = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.deleted {
                return Err(Error::ObjectDeleted);
            }
            if inner.depth > 0 {
                return Err(Error::InvalidState);
            }
            inner.deleted = true;
            inner.functions.clear();
            inner.signals = None;
            inner.pending_sources = 0;
            drop(inner);

            timer::cancel_all(cs, self);
            Ok(self.inner.borrow_ref(cs).sources)
        })?;

        for source in sources.into_iter().flatten() {
            source.detach();
        }

        debug!("Run loop {} deleted", self.name);
        Ok(())
    }

    pub(crate) fn is_deleted(&self, cs: CriticalSection<'_>) -> bool {
        self.inner.borrow_ref(cs).deleted
    }

    /// Registers an event source and returns its index.
    pub(crate) fn register_source(
        &self,
        cs: CriticalSection<'_>,
        source: &'static dyn RunLoopSource,
    ) -> Result<usize, Error> {
        let mut inner = self.inner.borrow_ref_mut(cs);
        if inner.deleted {
            return Err(Error::ObjectDeleted);
        }
        let index = inner
            .sources
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ResourceExhausted)?;
        inner.sources[index] = Some(source);
        Ok(index)
    }

    pub(crate) fn unregister_source(&self, cs: CriticalSection<'_>, index: usize) {
        let mut inner = self.inner.borrow_ref_mut(cs);
        inner.sources[index] = None;
        inner.pending_sources &= !(1 << index);
    }

    /// Marks a source as having pending events and wakes the loop.
    pub(crate) fn flag_source(&self, cs: CriticalSection<'_>, index: usize) {
        let mut inner = self.inner.borrow_ref_mut(cs);
        inner.pending_sources |= 1 << index;
        inner.wake(cs);
    }

    /// Wakes the loop so that it recomputes its deadline.
    pub(crate) fn notify(&self, cs: CriticalSection<'_>) {
        self.inner.borrow_ref_mut(cs).wake(cs);
    }
}
