//! Support for asynchronous (`async`/`await`) code

use core::{
    pin::pin,
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};

use argon::{Semaphore, Timeout, arch, scheduler::MAX_NUM_THREADS, thread};

/// Wakeup signal of each thread slot. A wakeup meant for a finished thread only
/// causes one extra poll in the next thread using the slot.
static WAKE_SIGNALS: [Semaphore; MAX_NUM_THREADS] =
    [const { Semaphore::new("block_on", 0) }; MAX_NUM_THREADS];

const RAW_WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
    raw_waker_clone,
    raw_waker_wake,
    raw_waker_wake_by_ref,
    raw_waker_drop,
);

/// Executes a `Future` and blocks the current thread until it completes.
///
/// The thread sleeps between polls, until the future's waker is invoked.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let slot = thread::current().map(|handle| handle.id().slot());

    let waker = match slot {
        // SAFETY: the data is a slot index, valid for as long as the waker lives
        Ok(slot) => unsafe { Waker::from_raw(RawWaker::new(slot as *const (), &RAW_WAKER_VTABLE)) },
        Err(_) => Waker::noop().clone(),
    };
    let mut context = Context::from_waker(&waker);

    let mut fut = pin!(fut);

    loop {
        match fut.as_mut().poll(&mut context) {
            Poll::Ready(ret) => break ret,
            Poll::Pending => {
                let waited = slot.map(|slot| WAKE_SIGNALS[slot].get(Timeout::Forever));
                if !matches!(waited, Ok(Ok(()))) {
                    // Cannot block here, poll again after others had a chance to run
                    arch::yield_now();
                }
            }
        }
    }
}

unsafe fn raw_waker_clone(data: *const ()) -> RawWaker {
    RawWaker::new(data, &RAW_WAKER_VTABLE)
}

unsafe fn raw_waker_wake(data: *const ()) {
    unsafe { raw_waker_wake_by_ref(data) }
}

unsafe fn raw_waker_wake_by_ref(data: *const ()) {
    if let Some(signal) = WAKE_SIGNALS.get(data as usize) {
        // A saturated count still wakes the thread
        let _ = signal.put();
    }
}

unsafe fn raw_waker_drop(_data: *const ()) {}
