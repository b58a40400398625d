//! Preemptive multitasking kernel for embedded Rust (architecture-independent part).
//!
//! Threads are scheduled by fixed priority with round-robin among equals.
//! Synchronization is built on a single scheduler-level block/wake mechanism:
//! [`Mutex`] (recursive, with priority inheritance), [`Semaphore`], the bounded
//! [`Queue`], and the unbuffered [`Channel`]. [`Timer`]s and queue events are
//! dispatched to user code by a [`RunLoop`].
//!
//! The architecture-dependent part (context switching, tick interrupt) lives in a
//! separate port crate that implements the functions declared in [`arch`].

#![no_std]

pub mod arch;
pub mod channel;
mod log_wrapper;
pub mod mutex;
pub mod queue;
pub mod run_loop;
pub mod scheduler;
pub mod semaphore;
pub mod thread;
pub mod time;
pub mod timer;
mod wait;


pub use portable_atomic;

pub use channel::Channel;
pub use mutex::Mutex;
pub use queue::Queue;
pub use run_loop::{RunLoop, RunLoopExit};
pub use scheduler::{Scheduler, SchedulerConfig, spawn};
pub use semaphore::Semaphore;
pub use thread::{ThreadConfig, ThreadHandle};
pub use timer::{Timer, TimerMode};

/// Status of a failed kernel operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The timeout elapsed before the operation could complete.
    Timeout,
    /// The operation would have to block but no timeout was given.
    WouldBlock,
    /// The queue has no free slot.
    QueueFull,
    /// The queue holds no element.
    QueueEmpty,
    InvalidParameter,
    /// The calling thread does not own the mutex.
    NotOwner,
    /// The object was deleted, possibly while the caller was waiting on it.
    ObjectDeleted,
    /// A fixed-size kernel table is full.
    ResourceExhausted,
    /// The kernel is not initialized or not started yet.
    NotInitialized,
    /// The object or thread is in a state that does not allow the operation.
    InvalidState,
    /// A blocking operation was called from interrupt context.
    NotFromInterrupt,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let description = match self {
            Error::Timeout => "timeout",
            Error::WouldBlock => "operation would block",
            Error::QueueFull => "queue is full",
            Error::QueueEmpty => "queue is empty",
            Error::InvalidParameter => "invalid parameter",
            Error::NotOwner => "caller is not the owner",
            Error::ObjectDeleted => "object was deleted",
            Error::ResourceExhausted => "kernel resources exhausted",
            Error::NotInitialized => "kernel not initialized",
            Error::InvalidState => "invalid state",
            Error::NotFromInterrupt => "not allowed from interrupt context",
        };
        f.write_str(description)
    }
}

impl core::error::Error for Error {}

/// How long a blocking operation may wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Timeout {
    /// Fail immediately instead of blocking.
    NoWait,
    /// Wait for at most the given number of ticks. `Ticks(0)` is the same as `NoWait`.
    Ticks(u64),
    Forever,
}

impl Timeout {
    /// Converts a duration in milliseconds into a tick timeout, rounding up.
    pub fn millis(ms: u64) -> Result<Self, Error> {
        Ok(Timeout::Ticks(time::millis_to_ticks(ms)?))
    }

    pub(crate) fn is_no_wait(&self) -> bool {
        matches!(self, Timeout::NoWait | Timeout::Ticks(0))
    }
}
