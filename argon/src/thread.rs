//! Thread manipulation functions.

use heapless::Vec;

use crate::{
    Error,
    scheduler::{self, MAX_NUM_THREADS},
};

/// Identifier of a thread.
///
/// The serial number makes an identifier unique even after the slot of a finished
/// thread has been recycled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThreadId {
    pub(crate) slot: usize,
    pub(crate) serial: u32,
}

impl ThreadId {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThreadState {
    Ready,
    Running,
    /// Waiting on a synchronization object, possibly with a timeout.
    Blocked,
    Sleeping,
    Suspended,
    /// Finished or terminated.
    Done,
}

/// Snapshot of a thread for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThreadStatus {
    pub id: ThreadId,
    pub name: &'static str,
    pub state: ThreadState,
    /// Effective priority.
    pub priority: u8,
    /// Share of the CPU in the last load window, in permille.
    pub load: u32,
    /// Deepest use of the stack so far, in bytes.
    pub stack_used: usize,
    /// 0 for the idle thread, which runs on the stack of the context that started the kernel.
    pub stack_size: usize,
}

/// Handle object for a thread.
///
/// This is just a surrogate for a thread ID.
/// Dropping this has no effect on the actual thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadHandle {
    pub(crate) id: ThreadId,
}

impl ThreadHandle {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> Result<&'static str, Error> {
        scheduler::thread_name(self.id)
    }

    /// Effective priority, including any priority inherited through mutexes.
    pub fn priority(&self) -> Result<u8, Error> {
        scheduler::thread_priority(self.id).map(|(_, effective)| effective)
    }

    /// Priority assigned at creation or by [`ThreadHandle::set_priority`].
    pub fn base_priority(&self) -> Result<u8, Error> {
        scheduler::thread_priority(self.id).map(|(base, _)| base)
    }

    pub fn state(&self) -> ThreadState {
        scheduler::thread_state(self.id)
    }

    /// Share of the CPU the thread used in the last load window, in permille.
    pub fn load(&self) -> Result<u32, Error> {
        self.status().map(|status| status.load)
    }

    /// Deepest use of the thread's stack so far, in bytes.
    pub fn stack_used(&self) -> Result<usize, Error> {
        self.status().map(|status| status.stack_used)
    }

    pub fn status(&self) -> Result<ThreadStatus, Error> {
        scheduler::thread_status(self.id)
    }

    /// Changes the base priority. The effective priority never drops below an inherited one.
    pub fn set_priority(&self, priority: u8) -> Result<(), Error> {
        scheduler::set_thread_priority(self.id, priority)
    }

    /// Removes the thread from scheduling until [`ThreadHandle::resume`] is called.
    ///
    /// A thread blocked on an object cannot be suspended.
    pub fn suspend(&self) -> Result<(), Error> {
        scheduler::suspend_thread(self.id)
    }

    /// Makes a suspended or sleeping thread ready again.
    pub fn resume(&self) -> Result<(), Error> {
        scheduler::resume_thread(self.id)
    }

    /// Stops the thread for good. Mutexes it owns stay locked.
    pub fn terminate(&self) -> Result<(), Error> {
        scheduler::terminate_thread(self.id)
    }
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ThreadConfig {
    pub(crate) priority: u8,
    pub(crate) name: &'static str,
    pub(crate) suspended: bool,
}

impl ThreadConfig {
    /// Sets thread priority.
    ///
    /// Higher value means higher priority. Valid values are 1 to [`scheduler::MAX_PRIORITY`]. Default value is 1.
    pub fn with_priority(self, priority: u8) -> Self {
        Self { priority, ..self }
    }

    /// Sets the name shown in diagnostics.
    pub fn with_name(self, name: &'static str) -> Self {
        Self { name, ..self }
    }

    /// Creates the thread in the suspended state.
    pub fn suspended(self) -> Self {
        Self {
            suspended: true,
            ..self
        }
    }
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            priority: 1,
            name: "thread",
            suspended: false,
        }
    }
}

/// Status of every existing thread, the idle thread first.
pub fn report() -> Result<Vec<ThreadStatus, MAX_NUM_THREADS>, Error> {
    scheduler::thread_report()
}

/// Returns the handle of the calling thread.
pub fn current() -> Result<ThreadHandle, Error> {
    critical_section::with(|cs| scheduler::current_id(cs)).map(|id| ThreadHandle { id })
}
