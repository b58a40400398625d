//! Hosted port of the argon kernel, for tests and demos on a development machine.
//!
//! Every kernel thread is backed by an OS thread, but only the holder of the baton
//! runs kernel code; a context switch passes the baton and parks the previous holder.
//! The tick comes from a separate OS thread, which plays the role of the tick
//! interrupt, and [`raise_interrupt`] runs a closure in interrupt context.
//!
//! An interrupt cannot stop a thread in the middle of its work. A switch it requests
//! takes effect at the next kernel call of the running thread, at a
//! [`preemption_point`], or immediately when the idle thread is running.
//!
//! The port also provides the critical section implementation. A switch requested by a
//! thread inside a critical section is held back until the outermost section ends, the
//! way a pended PendSV waits for interrupts to be unmasked.

use std::{
    cell::Cell,
    io::Write as _,
    sync::{
        Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use argon::{
    arch::StackAllocation,
    scheduler::{self, Scheduler, SchedulerConfig},
    time,
};
use critical_section::RawRestoreState;

/// Context token of the thread that calls [`Scheduler::start`].
const IDLE_TOKEN: usize = usize::MAX;
/// Stack pointers handed out are aligned like on x86-64 and AArch64.
const STACK_ALIGN: usize = 16;

/// Token of the thread allowed to run.
static BATON: Mutex<usize> = Mutex::new(IDLE_TOKEN);
static BATON_PASSED: Condvar = Condvar::new();

/// A context switch was requested from interrupt context.
static PENDING: Mutex<bool> = Mutex::new(false);
static PENDING_RAISED: Condvar = Condvar::new();

static TICK_PERIOD_NANOS: AtomicU64 = AtomicU64::new(1_000_000);

/// Held by the OS thread inside a critical section, like masked interrupts.
static GLOBAL_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    /// Token of the kernel thread backed by this OS thread; `None` in interrupt context.
    static CONTEXT: Cell<Option<usize>> = const { Cell::new(None) };
    static GLOBAL_GUARD: Cell<Option<MutexGuard<'static, ()>>> = const { Cell::new(None) };
    /// Depth of nested critical sections entered by this OS thread.
    static NESTING: Cell<u32> = const { Cell::new(0) };
    /// A context switch was requested inside a critical section.
    static DEFERRED_SWITCH: Cell<bool> = const { Cell::new(false) };
}

struct HostCriticalSection;
critical_section::set_impl!(HostCriticalSection);

unsafe impl critical_section::Impl for HostCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let depth = NESTING.get();
        if depth == 0 {
            let guard = GLOBAL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
            GLOBAL_GUARD.set(Some(guard));
        }
        NESTING.set(depth + 1);
    }

    unsafe fn release(_restore_state: RawRestoreState) {
        let depth = NESTING.get().saturating_sub(1);
        NESTING.set(depth);
        if depth > 0 {
            return;
        }

        drop(GLOBAL_GUARD.take());
        if DEFERRED_SWITCH.replace(false) {
            _argon_yield_now();
        }
    }
}

/// Initializes the kernel. The calling OS thread becomes the idle thread.
///
/// The clock frequency has no meaning on the host; the tick period is derived from
/// `config.tick_freq` alone.
pub fn init_scheduler(config: SchedulerConfig) -> Option<Scheduler> {
    let scheduler = unsafe { Scheduler::init(0, config)? };
    CONTEXT.set(Some(IDLE_TOKEN));
    Some(scheduler)
}

/// Runs `handler` in interrupt context and returns once it has finished.
///
/// A context switch requested by the handler happens before this returns, as it would
/// on exception return. Must not be called inside a critical section, which masks the
/// interrupt.
pub fn raise_interrupt<R: Send>(handler: impl FnOnce() -> R + Send) -> R {
    let result = thread::scope(|scope| match scope.spawn(handler).join() {
        Ok(result) => result,
        Err(payload) => std::panic::resume_unwind(payload),
    });

    preemption_point();
    result
}

/// Performs a context switch requested from interrupt context, if any.
///
/// Long computations without kernel calls can call this to be preemptible.
pub fn preemption_point() {
    if CONTEXT.get().is_some() && take_pending() {
        _argon_yield_now();
    }
}

fn take_pending() -> bool {
    let mut pending = PENDING.lock().unwrap_or_else(PoisonError::into_inner);
    core::mem::take(&mut *pending)
}

fn raise_pending() {
    let mut pending = PENDING.lock().unwrap_or_else(PoisonError::into_inner);
    *pending = true;
    PENDING_RAISED.notify_all();
}

fn pass_baton(to: usize) {
    let mut baton = BATON.lock().unwrap_or_else(PoisonError::into_inner);
    *baton = to;
    BATON_PASSED.notify_all();
}

fn wait_for_baton(token: usize) {
    let baton = BATON.lock().unwrap_or_else(PoisonError::into_inner);
    let _baton = BATON_PASSED
        .wait_while(baton, |holder| *holder != token)
        .unwrap_or_else(PoisonError::into_inner);
}

/// INTERNAL USE ONLY
#[unsafe(no_mangle)]
pub fn _argon_setup(_clock_freq: u32, tick_freq: u32) {
    TICK_PERIOD_NANOS.store(1_000_000_000 / u64::from(tick_freq.max(1)), Ordering::Relaxed);
}

/// INTERNAL USE ONLY
#[unsafe(no_mangle)]
pub fn _argon_start_timer() {
    let period = Duration::from_nanos(TICK_PERIOD_NANOS.load(Ordering::Relaxed));
    let spawned = thread::Builder::new()
        .name("argon-tick".into())
        .spawn(move || {
            loop {
                thread::sleep(period);
                scheduler::handle_tick();
            }
        });
    if let Err(err) = spawned {
        panic!("Failed to start the tick thread: {}", err);
    }
}

/// INTERNAL USE ONLY
#[unsafe(no_mangle)]
pub fn _argon_yield_now() {
    let Some(me) = CONTEXT.get() else {
        // Deferred until the running thread reaches a switch point
        raise_pending();
        return;
    };
    if NESTING.get() > 0 {
        // Performed when the outermost critical section is left
        DEFERRED_SWITCH.set(true);
        return;
    }

    let next = unsafe { scheduler::select_thread(me) };
    if next != me {
        pass_baton(next);
        wait_for_baton(me);
    }
}

/// INTERNAL USE ONLY
///
/// Only the closure is placed on the kernel stack; the thread itself executes on the
/// stack of its OS thread. The address of the closure doubles as the context token.
#[unsafe(no_mangle)]
pub fn _argon_init_stack(sp: *mut u8, pc: usize, arg: *const u8, arg_size: usize) -> *mut u8 {
    let token = unsafe { place_closure(sp, arg, arg_size) };

    // SAFETY: `pc` is the address of an `extern "C" fn(*mut F) -> !`
    let entry = unsafe { core::mem::transmute::<usize, extern "C" fn(usize) -> !>(pc) };
    let spawned = thread::Builder::new()
        .name(format!("argon-{:x}", token))
        .spawn(move || {
            CONTEXT.set(Some(token));
            wait_for_baton(token);
            entry(token)
        });
    if let Err(err) = spawned {
        panic!("Failed to create a host thread: {}", err);
    }

    token as *mut u8
}

/// Copies the closure below `top` and returns its aligned address.
unsafe fn place_closure(top: *mut u8, arg: *const u8, arg_size: usize) -> usize {
    let address = (top as usize - arg_size) & !(STACK_ALIGN - 1);
    unsafe {
        core::ptr::copy(arg, address as *mut u8, arg_size);
    }
    address
}

/// INTERNAL USE ONLY
#[unsafe(no_mangle)]
pub fn _argon_wait_for_interrupt() {
    let period = Duration::from_nanos(TICK_PERIOD_NANOS.load(Ordering::Relaxed));
    let pending = PENDING.lock().unwrap_or_else(PoisonError::into_inner);
    let (mut pending, _) = PENDING_RAISED
        .wait_timeout_while(pending, period, |pending| !*pending)
        .unwrap_or_else(PoisonError::into_inner);

    if core::mem::take(&mut *pending) {
        drop(pending);
        _argon_yield_now();
    }
}

/// INTERNAL USE ONLY
#[unsafe(no_mangle)]
pub fn _argon_in_interrupt() -> bool {
    CONTEXT.get().is_none()
}

/// Thread stack. On the host it only holds the closure of the thread and the stack
/// canary.
#[repr(C, align(16))]
pub struct Stack<const N: usize>([u8; N]);

impl<const N: usize> Stack<N> {
    pub const fn new() -> Self {
        Self([0u8; N])
    }
}

impl<const N: usize> Default for Stack<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> StackAllocation for &'static mut Stack<N> {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Logger printing kernel log records to standard error, stamped with the tick count.
pub struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

/// Installs [`StderrLogger`]. Does nothing if a logger is already installed.
pub fn init_logger(level: log::LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(
                stderr,
                "{:>8} [{}] {}: {}",
                time::current_time(),
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
