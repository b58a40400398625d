use core::{cell::RefCell, mem::ManuallyDrop, sync::atomic::Ordering};

use critical_section::{CriticalSection, Mutex};
use heapless::{Deque, Vec};
use portable_atomic::AtomicBool;

use crate::{
    Error, Timeout,
    arch::{self, StackAllocation},
    log_wrapper::{debug, info, log_warn, trace},
    run_loop::RunLoop,
    thread::{ThreadConfig, ThreadHandle, ThreadId, ThreadState, ThreadStatus},
    time,
};

/// Maximum number of threads, including the idle thread.
pub const MAX_NUM_THREADS: usize = 16;
/// Highest thread priority. Priority 0 belongs to the idle thread.
pub const MAX_PRIORITY: u8 = 31;
pub(crate) const IDLE_PRIORITY: u8 = 0;

const IDLE_SLOT: usize = 0;
const NUM_PRIORITIES: usize = MAX_PRIORITY as usize + 1;
/// Room kept below the closure for the initial frame and the first calls of a thread.
const MIN_STACK_SIZE: usize = 256;
#[cfg(feature = "stack-canary")]
const STACK_CANARY: u32 = 0xC0DE_CAFE;
#[cfg(feature = "stack-canary")]
const CANARY_SIZE: usize = core::mem::size_of::<u32>();
#[cfg(not(feature = "stack-canary"))]
const CANARY_SIZE: usize = 0;
/// Written over a whole stack at spawn, to find how deep the thread has used it.
const STACK_FILL: u8 = 0xBA;
/// Length of the window over which CPU load is measured.
const LOAD_SAMPLE_PERIOD_MS: u64 = 1000;

static KERNEL: Mutex<RefCell<Option<KernelState>>> = Mutex::new(RefCell::new(None));
/// Set when a thread of higher priority than the running one became ready.
static NEEDS_RESCHEDULE: AtomicBool = AtomicBool::new(false);
static STARTED: AtomicBool = AtomicBool::new(false);

/// Thread Control Block (TCB)
struct ThreadInfo {
    serial: u32,
    name: &'static str,
    stack_pointer: usize,
    /// Lowest address of the stack, where the canary lives. 0 for the idle thread.
    stack_bottom: usize,
    stack_size: usize,
    base_priority: u8,
    /// Effective priority, `max(base_priority, boosts)`.
    priority: u8,
    state: ThreadState,
    wakeup: Option<u64>,
    wake_status: Result<(), Error>,
    /// Priorities inherited from the waiters of each mutex this thread owns.
    boosts: Vec<PriorityBoost, MAX_NUM_THREADS>,
    /// Mutex this thread is blocked on and its owner.
    waiting_on: Option<(usize, ThreadId)>,
    run_loop: Option<&'static RunLoop>,
    /// Ticks during which the thread was running in the current load window.
    load_ticks: u64,
    /// Share of the CPU in the last complete load window, in permille.
    load: u32,
}

#[derive(Clone, Copy, Debug)]
struct PriorityBoost {
    mutex: usize,
    priority: u8,
}

impl ThreadInfo {
    fn effective_priority(&self) -> u8 {
        self.boosts
            .iter()
            .map(|boost| boost.priority)
            .fold(self.base_priority, u8::max)
    }
}

/// Per-priority FIFO buckets of ready threads with a bitmap of the non-empty ones.
#[derive(Clone, Debug)]
struct ReadyQueues {
    buckets: [Deque<usize, MAX_NUM_THREADS>; NUM_PRIORITIES],
    mask: u32,
}

impl ReadyQueues {
    const fn new() -> Self {
        Self {
            buckets: [const { Deque::new() }; NUM_PRIORITIES],
            mask: 0,
        }
    }

    fn push_back(&mut self, priority: u8, slot: usize) {
        // A slot is queued at most once, so a bucket never overflows
        self.buckets[priority as usize]
            .push_back(slot)
            .unwrap_or_else(|_| unreachable!());
        self.mask |= 1 << priority;
    }

    fn remove(&mut self, priority: u8, slot: usize) {
        let bucket = &mut self.buckets[priority as usize];
        let mut filtered = Deque::new();
        for elem in bucket.iter() {
            if *elem != slot {
                filtered
                    .push_back(*elem)
                    .unwrap_or_else(|_| unreachable!());
            }
        }
        *bucket = filtered;

        if bucket.is_empty() {
            self.mask &= !(1 << priority);
        }
    }

    fn highest_priority(&self) -> Option<u8> {
        if self.mask == 0 {
            None
        } else {
            Some((u32::BITS - 1 - self.mask.leading_zeros()) as u8)
        }
    }

    fn pop_highest(&mut self) -> Option<usize> {
        let priority = self.highest_priority()?;
        let bucket = &mut self.buckets[priority as usize];
        let slot = bucket.pop_front();
        if bucket.is_empty() {
            self.mask &= !(1 << priority);
        }
        slot
    }

    fn has_ready_at(&self, priority: u8) -> bool {
        self.mask & (1 << priority) != 0
    }
}

struct KernelState {
    threads: [Option<ThreadInfo>; MAX_NUM_THREADS],
    ready: ReadyQueues,
    /// Threads with a wakeup time, sorted by that time (FIFO among equal times).
    sleeping: Vec<(u64, usize), MAX_NUM_THREADS>,
    current: usize,
    next_serial: u32,
    /// Length of a load window in ticks.
    load_window: u64,
    load_window_start: u64,
    /// Share of the CPU not spent in the idle thread, in permille.
    system_load: u32,
    config: SchedulerConfig,
}

impl KernelState {
    fn new(config: SchedulerConfig) -> Self {
        let mut threads = [const { None }; MAX_NUM_THREADS];
        // The context calling `Scheduler::start` becomes the idle thread
        threads[IDLE_SLOT] = Some(ThreadInfo {
            serial: 0,
            name: "idle",
            stack_pointer: 0,
            stack_bottom: 0,
            stack_size: 0,
            base_priority: IDLE_PRIORITY,
            priority: IDLE_PRIORITY,
            state: ThreadState::Running,
            wakeup: None,
            wake_status: Ok(()),
            boosts: Vec::new(),
            waiting_on: None,
            run_loop: None,
            load_ticks: 0,
            load: 0,
        });

        let load_window = (u64::from(config.tick_freq) * LOAD_SAMPLE_PERIOD_MS / 1000).max(1);
        Self {
            threads,
            ready: ReadyQueues::new(),
            sleeping: Vec::new(),
            current: IDLE_SLOT,
            next_serial: 1,
            load_window,
            load_window_start: 0,
            system_load: 0,
            config,
        }
    }

    fn thread(&self, id: ThreadId) -> Option<&ThreadInfo> {
        self.threads
            .get(id.slot)?
            .as_ref()
            .filter(|thread| thread.serial == id.serial)
    }

    fn thread_mut(&mut self, id: ThreadId) -> Option<&mut ThreadInfo> {
        self.threads
            .get_mut(id.slot)?
            .as_mut()
            .filter(|thread| thread.serial == id.serial)
    }

    fn id_of(&self, slot: usize) -> Option<ThreadId> {
        self.threads[slot].as_ref().map(|thread| ThreadId {
            slot,
            serial: thread.serial,
        })
    }

    fn current_id(&self) -> ThreadId {
        self.id_of(self.current).unwrap_or(ThreadId {
            slot: self.current,
            serial: u32::MAX,
        })
    }

    fn current_priority(&self) -> u8 {
        self.threads[self.current]
            .as_ref()
            .map_or(IDLE_PRIORITY, |thread| thread.priority)
    }

    fn make_ready(&mut self, slot: usize) {
        let Some(thread) = self.threads[slot].as_mut() else {
            return;
        };
        thread.state = ThreadState::Ready;
        let priority = thread.priority;
        self.ready.push_back(priority, slot);

        if slot != self.current && priority > self.current_priority() {
            NEEDS_RESCHEDULE.store(true, Ordering::Release);
        }
    }

    /// Detaches a thread from the ready buckets and the sleeping list.
    fn unschedule(&mut self, slot: usize) {
        let Some(thread) = self.threads[slot].as_mut() else {
            return;
        };
        let was_ready = thread.state == ThreadState::Ready;
        let priority = thread.priority;
        let had_wakeup = thread.wakeup.take().is_some();

        if was_ready {
            self.ready.remove(priority, slot);
        }
        if had_wakeup {
            self.remove_sleeping(slot);
        }
    }

    fn insert_sleeping(&mut self, wakeup: u64, slot: usize) {
        let index = self
            .sleeping
            .iter()
            .position(|(time, _)| *time > wakeup)
            .unwrap_or(self.sleeping.len());
        // Every thread occupies at most one entry
        self.sleeping
            .insert(index, (wakeup, slot))
            .unwrap_or_else(|_| unreachable!());
    }

    fn remove_sleeping(&mut self, slot: usize) {
        self.sleeping.retain(|(_, elem)| *elem != slot);
    }

    fn set_effective_priority(&mut self, slot: usize, priority: u8) {
        let Some(thread) = self.threads[slot].as_mut() else {
            return;
        };
        let old = thread.priority;
        if old == priority {
            return;
        }
        thread.priority = priority;
        let state = thread.state;

        if state == ThreadState::Ready {
            self.ready.remove(old, slot);
            self.ready.push_back(priority, slot);
        }

        if slot == self.current {
            if self.ready.highest_priority().is_some_and(|p| p > priority) {
                NEEDS_RESCHEDULE.store(true, Ordering::Release);
            }
        } else if state == ThreadState::Ready && priority > self.current_priority() {
            NEEDS_RESCHEDULE.store(true, Ordering::Release);
        }
    }

    fn recompute_priority(&mut self, slot: usize) {
        if let Some(thread) = self.threads[slot].as_ref() {
            let priority = thread.effective_priority();
            self.set_effective_priority(slot, priority);
        }
    }

    fn set_boost(&mut self, id: ThreadId, mutex: usize, priority: Option<u8>) {
        let Some(thread) = self.thread_mut(id) else {
            return;
        };
        thread.boosts.retain(|boost| boost.mutex != mutex);
        if let Some(priority) = priority
            && priority > thread.base_priority
        {
            // A slot was just freed by `retain` or the entry did not exist before
            let _ = thread.boosts.push(PriorityBoost { mutex, priority });
        }
        self.recompute_priority(id.slot);
    }

    /// Highest effective priority among the threads blocked on `mutex`.
    fn highest_waiter_on(&self, mutex: usize) -> Option<u8> {
        self.threads
            .iter()
            .flatten()
            .filter(|thread| {
                thread.state == ThreadState::Blocked
                    && thread.waiting_on.is_some_and(|(key, _)| key == mutex)
            })
            .map(|thread| thread.priority)
            .max()
    }

    fn reserve_slot(&mut self, config: &ThreadConfig) -> Result<ThreadId, Error> {
        let Some(slot) = (0..MAX_NUM_THREADS).find(|slot| self.threads[*slot].is_none()) else {
            return Err(Error::ResourceExhausted);
        };

        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);

        // Parked as suspended until its stack is ready
        self.threads[slot] = Some(ThreadInfo {
            serial,
            name: config.name,
            stack_pointer: 0,
            stack_bottom: 0,
            stack_size: 0,
            base_priority: config.priority,
            priority: config.priority,
            state: ThreadState::Suspended,
            wakeup: None,
            wake_status: Ok(()),
            boosts: Vec::new(),
            waiting_on: None,
            run_loop: None,
            load_ticks: 0,
            load: 0,
        });

        Ok(ThreadId { slot, serial })
    }

    fn release(&mut self, slot: usize) {
        self.unschedule(slot);
        self.threads[slot] = None;
    }

    /// Charges the tick to the running thread and closes the load window once it is full.
    fn account_load(&mut self, now: u64) {
        if let Some(current) = self.threads[self.current].as_mut() {
            current.load_ticks += 1;
        }

        let elapsed = now.saturating_sub(self.load_window_start);
        if elapsed < self.load_window {
            return;
        }
        self.load_window_start = now;

        for thread in self.threads.iter_mut().flatten() {
            thread.load = (thread.load_ticks * 1000 / elapsed).min(1000) as u32;
            thread.load_ticks = 0;
        }
        let idle = self.threads[IDLE_SLOT]
            .as_ref()
            .map_or(0, |thread| thread.load);
        self.system_load = 1000 - idle;
    }

    fn status(&self, slot: usize) -> Option<ThreadStatus> {
        let thread = self.threads[slot].as_ref()?;
        Some(ThreadStatus {
            id: ThreadId {
                slot,
                serial: thread.serial,
            },
            name: thread.name,
            state: thread.state,
            priority: thread.priority,
            load: thread.load,
            // SAFETY: the stack is owned by the thread until its slot is released
            stack_used: unsafe { stack_used(thread.stack_bottom, thread.stack_size) },
            stack_size: thread.stack_size,
        })
    }
}

/// Number of bytes of a stack that have been written since spawn.
///
/// The stack is scanned upwards from above the canary for the first byte that differs
/// from the fill pattern. With a broken canary, the whole stack counts as used.
///
/// # Safety
/// `bottom..bottom + size` must be a stack handed to [`spawn`], or `size` must be 0.
unsafe fn stack_used(bottom: usize, size: usize) -> usize {
    if size <= CANARY_SIZE {
        return 0;
    }

    #[cfg(feature = "stack-canary")]
    if unsafe { (bottom as *const u32).read_unaligned() } != STACK_CANARY {
        return size;
    }

    let stack = unsafe { core::slice::from_raw_parts(bottom as *const u8, size) };
    used_bytes(&stack[CANARY_SIZE..])
}

fn used_bytes(stack: &[u8]) -> usize {
    let untouched = stack.iter().take_while(|byte| **byte == STACK_FILL).count();
    stack.len() - untouched
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct SchedulerConfig {
    pub tick_freq: u32,
}

impl SchedulerConfig {
    pub fn with_tick_freq(self, tick_freq: u32) -> Self {
        Self { tick_freq, ..self }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_freq: 1000 }
    }
}

pub struct Scheduler {
    clock_freq: u32,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Initializes the kernel state. Returns `None` if it is already initialized.
    ///
    /// # Safety
    /// Must be called once, from the context that later calls [`Scheduler::start`].
    /// Port crates provide a safe wrapper.
    pub unsafe fn init(clock_freq: u32, config: SchedulerConfig) -> Option<Self> {
        if config.tick_freq == 0 {
            return None;
        }

        let initialized = critical_section::with(|cs| {
            let mut state = KERNEL.borrow_ref_mut(cs);
            if state.is_some() {
                // Kernel is already initialized
                false
            } else {
                *state = Some(KernelState::new(config.clone()));
                true
            }
        });

        initialized.then_some(Scheduler { clock_freq, config })
    }

    /// Starts the tick and dispatches threads. The calling context becomes the idle thread.
    pub fn start(&self) -> ! {
        unsafe {
            arch::_argon_setup(self.clock_freq, self.config.tick_freq);
        }

        STARTED.store(true, Ordering::Release);

        unsafe {
            arch::_argon_start_timer();
        }

        info!("Kernel started");

        // Give the CPU to the threads spawned before start
        arch::yield_now();

        loop {
            trace!("Idle");
            unsafe {
                arch::_argon_wait_for_interrupt();
            }
        }
    }

    pub fn spawn<F: FnOnce() + Send + 'static, S: StackAllocation>(
        &self,
        func: F,
        stack: S,
        config: ThreadConfig,
    ) -> Result<ThreadHandle, Error> {
        spawn(func, stack, config)
    }
}

/// Creates a thread running `func` on `stack`.
pub fn spawn<F: FnOnce() + Send + 'static, S: StackAllocation>(
    func: F,
    stack: S,
    config: ThreadConfig,
) -> Result<ThreadHandle, Error> {
    if config.priority == IDLE_PRIORITY || config.priority > MAX_PRIORITY {
        return Err(Error::InvalidParameter);
    }
    if arch::in_interrupt() {
        return Err(Error::NotFromInterrupt);
    }

    // The stack is owned by the thread from now on
    let mut stack = ManuallyDrop::new(stack);
    let stack = stack.as_mut_slice();
    if stack.len() < core::mem::size_of::<F>() + MIN_STACK_SIZE {
        return Err(Error::InvalidParameter);
    }

    let id = critical_section::with(|cs| with_kernel(cs, |state| state.reserve_slot(&config)))??;

    stack.fill(STACK_FILL);
    let stack_size = stack.len();
    let stack_range = stack.as_mut_ptr_range();
    let stack_bottom = stack_range.start as usize;
    #[cfg(feature = "stack-canary")]
    unsafe {
        stack_range.start.cast::<u32>().write_unaligned(STACK_CANARY);
    }

    // The closure is moved onto the new stack byte by byte and dropped by the thread itself
    let func = ManuallyDrop::new(func);
    let initial_sp = unsafe {
        arch::_argon_init_stack(
            stack_range.end,
            (thread_entry::<F> as extern "C" fn(*mut F) -> !) as usize,
            &*func as *const F as *const u8,
            core::mem::size_of::<F>(),
        )
    };

    critical_section::with(|cs| {
        with_kernel(cs, |state| {
            if let Some(thread) = state.thread_mut(id) {
                thread.stack_pointer = initial_sp as usize;
                thread.stack_bottom = stack_bottom;
                thread.stack_size = stack_size;
            }
            if !config.suspended {
                state.make_ready(id.slot);
            }
        })
    })?;

    info!(
        "Thread {} #{} created (priority {})",
        config.name, id.slot, config.priority
    );
    debug!(
        "Stack from={} to={}",
        stack_bottom,
        stack_range.end as usize
    );

    // Preempt if the new thread has higher priority
    reschedule();

    Ok(ThreadHandle { id })
}

/// Returns the configuration the kernel was initialized with.
pub fn get_config() -> Result<SchedulerConfig, Error> {
    critical_section::with(|cs| with_kernel(cs, |state| state.config.clone()))
}

/// Whether [`Scheduler::start`] has been called.
pub fn is_running() -> bool {
    STARTED.load(Ordering::Acquire)
}

/// Share of the CPU spent outside the idle thread during the last complete load
/// window of one second, in permille.
pub fn system_load() -> Result<u32, Error> {
    critical_section::with(|cs| with_kernel(cs, |state| state.system_load))
}

/// Status of every thread, the idle thread included, in slot order.
pub fn thread_report() -> Result<Vec<ThreadStatus, MAX_NUM_THREADS>, Error> {
    critical_section::with(|cs| {
        with_kernel(cs, |state| {
            (0..MAX_NUM_THREADS)
                .filter_map(|slot| state.status(slot))
                .collect()
        })
    })
}

/// Chooses the thread to run next. Called by the port's context switch handler
/// with the stack pointer of the interrupted thread.
pub unsafe extern "C" fn select_thread(orig_sp: usize) -> usize {
    NEEDS_RESCHEDULE.store(false, Ordering::Release);

    let next_sp = critical_section::with(|cs| {
        let mut state = KERNEL.borrow_ref_mut(cs);
        let Some(state) = state.as_mut() else {
            panic!("Kernel not initialized")
        };

        let orig_slot = state.current;
        // Original thread may be removed from the thread list, so this is conditional
        if let Some(orig) = state.threads[orig_slot].as_mut() {
            orig.stack_pointer = orig_sp;

            #[cfg(feature = "stack-canary")]
            if orig.stack_bottom != 0
                && unsafe { (orig.stack_bottom as *const u32).read_unaligned() } != STACK_CANARY
            {
                panic!("Stack overflow detected in thread {}", orig.name);
            }

            if orig.state == ThreadState::Running {
                orig.state = ThreadState::Ready;
                let priority = orig.priority;
                state.ready.push_back(priority, orig_slot);
            }
        }

        // The idle thread never blocks, so some thread is always ready
        let Some(next_slot) = state.ready.pop_highest() else {
            unreachable!()
        };
        state.current = next_slot;

        let Some(next) = state.threads[next_slot].as_mut() else {
            unreachable!()
        };
        next.state = ThreadState::Running;
        next.stack_pointer
    });
    trace!("Context switch: orig_sp = {}, next_sp = {}", orig_sp, next_sp);
    next_sp
}

/// Advances the time base and wakes threads whose wakeup time has come.
/// Called by the port's tick interrupt handler.
pub fn handle_tick() {
    if !STARTED.load(Ordering::Acquire) {
        return;
    }

    let switch = critical_section::with(|cs| {
        let now = time::advance();

        let mut state = KERNEL.borrow_ref_mut(cs);
        let Some(state) = state.as_mut() else {
            return false;
        };

        while let Some(&(wakeup, slot)) = state.sleeping.first() {
            if wakeup > now {
                break;
            }
            state.sleeping.remove(0);

            let wake = match state.threads[slot].as_mut() {
                Some(thread) => {
                    thread.wakeup = None;
                    match thread.state {
                        ThreadState::Sleeping => true,
                        ThreadState::Blocked => {
                            thread.wake_status = Err(Error::Timeout);
                            true
                        }
                        _ => false,
                    }
                }
                None => false,
            };
            if wake {
                state.make_ready(slot);
            }
        }

        state.account_load(now);

        #[cfg(feature = "round-robin")]
        if let Some(current) = state.threads[state.current].as_ref()
            && current.state == ThreadState::Running
            && state.ready.has_ready_at(current.priority)
        {
            NEEDS_RESCHEDULE.store(true, Ordering::Release);
        }

        NEEDS_RESCHEDULE.load(Ordering::Acquire)
    });

    if switch {
        arch::yield_now();
    }
}

/// Yields if a thread of higher priority became ready since the last switch.
///
/// From interrupt context, the switch is only requested and the flag stays set for the
/// interrupted thread to pick up.
pub(crate) fn reschedule() {
    if !STARTED.load(Ordering::Acquire) {
        return;
    }

    if arch::in_interrupt() {
        if NEEDS_RESCHEDULE.load(Ordering::Acquire) {
            arch::yield_now();
        }
    } else if NEEDS_RESCHEDULE.swap(false, Ordering::AcqRel) {
        arch::yield_now();
    }
}

fn with_kernel<R>(
    cs: CriticalSection<'_>,
    f: impl FnOnce(&mut KernelState) -> R,
) -> Result<R, Error> {
    let mut state = KERNEL.borrow_ref_mut(cs);
    let state = state.as_mut().ok_or(Error::NotInitialized)?;
    Ok(f(state))
}

pub(crate) fn current_id(cs: CriticalSection<'_>) -> Result<ThreadId, Error> {
    with_kernel(cs, |state| state.current_id())
}

/// Checks that the caller may block and returns its identifier.
pub(crate) fn prepare_block(cs: CriticalSection<'_>) -> Result<ThreadId, Error> {
    if arch::in_interrupt() {
        return Err(Error::NotFromInterrupt);
    }
    if !STARTED.load(Ordering::Acquire) {
        return Err(Error::NotInitialized);
    }

    with_kernel(cs, |state| {
        if state.current == IDLE_SLOT {
            Err(Error::InvalidState)
        } else {
            Ok(state.current_id())
        }
    })?
}

/// Marks the calling thread blocked. It stops running at the next [`wait_for_wake`].
///
/// The caller must have passed [`prepare_block`] in the same critical section.
pub(crate) fn block_current(cs: CriticalSection<'_>, timeout: Timeout) {
    let now = time::current_time();
    let _ = with_kernel(cs, |state| {
        let slot = state.current;
        let Some(thread) = state.threads[slot].as_mut() else {
            return;
        };
        thread.state = ThreadState::Blocked;
        thread.wake_status = Ok(());

        let wakeup = match timeout {
            Timeout::Ticks(ticks) if ticks > 0 => Some(now.saturating_add(ticks)),
            _ => None,
        };
        thread.wakeup = wakeup;
        if let Some(wakeup) = wakeup {
            state.insert_sleeping(wakeup, slot);
        }
    });

    trace!("Thread #{} blocked", current_slot(cs));
}

fn current_slot(cs: CriticalSection<'_>) -> usize {
    with_kernel(cs, |state| state.current).unwrap_or(IDLE_SLOT)
}

/// Gives up the CPU after [`block_current`] and returns the status the thread was woken with.
pub(crate) fn wait_for_wake() -> Result<(), Error> {
    arch::yield_now();

    critical_section::with(|cs| {
        with_kernel(cs, |state| {
            let slot = state.current;
            state.threads[slot]
                .as_mut()
                .map_or(Ok(()), |thread| {
                    core::mem::replace(&mut thread.wake_status, Ok(()))
                })
        })
    })?
}

/// Makes a blocked thread ready with the given status.
///
/// Returns `false` if the thread no longer exists or is not blocked (e.g. its timeout fired).
pub(crate) fn wake(cs: CriticalSection<'_>, id: ThreadId, status: Result<(), Error>) -> bool {
    with_kernel(cs, |state| {
        let Some(thread) = state.thread_mut(id) else {
            return false;
        };
        if thread.state != ThreadState::Blocked {
            return false;
        }
        thread.wake_status = status;
        if thread.wakeup.take().is_some() {
            state.remove_sleeping(id.slot);
        }
        state.make_ready(id.slot);

        trace!("Thread #{} woken", id.slot);
        true
    })
    .unwrap_or(false)
}

/// Effective priority of a thread that is still blocked, `None` otherwise.
pub(crate) fn waiting_priority(cs: CriticalSection<'_>, id: ThreadId) -> Option<u8> {
    with_kernel(cs, |state| {
        state
            .thread(id)
            .filter(|thread| thread.state == ThreadState::Blocked)
            .map(|thread| thread.priority)
    })
    .ok()
    .flatten()
}

pub(crate) fn priority_of(cs: CriticalSection<'_>, id: ThreadId) -> Option<u8> {
    with_kernel(cs, |state| state.thread(id).map(|thread| thread.priority))
        .ok()
        .flatten()
}

pub(crate) fn thread_exists(cs: CriticalSection<'_>, id: ThreadId) -> bool {
    with_kernel(cs, |state| state.thread(id).is_some()).unwrap_or(false)
}

/// Raises the priority `owner` inherits through `mutex` to at least `priority`, and
/// follows the chain of mutexes the owner itself is blocked on.
pub(crate) fn raise_priority(cs: CriticalSection<'_>, owner: ThreadId, mutex: usize, priority: u8) {
    let _ = with_kernel(cs, |state| {
        let (mut target, mut mutex, mut priority) = (owner, mutex, priority);

        // Bounded by the number of threads, as the chain cannot be longer
        for _ in 0..MAX_NUM_THREADS {
            let Some(thread) = state.thread_mut(target) else {
                break;
            };

            match thread.boosts.iter_mut().find(|boost| boost.mutex == mutex) {
                Some(boost) => boost.priority = boost.priority.max(priority),
                None => {
                    if thread
                        .boosts
                        .push(PriorityBoost { mutex, priority })
                        .is_err()
                    {
                        log_warn!("Too many inherited priorities for thread {}", thread.name);
                    }
                }
            }

            let effective = thread.effective_priority();
            if effective <= thread.priority {
                break;
            }
            let next = thread.waiting_on;
            debug!(
                "Thread {} inherits priority {}",
                thread.name, effective
            );
            state.set_effective_priority(target.slot, effective);

            match next {
                Some((next_mutex, next_owner)) => {
                    target = next_owner;
                    mutex = next_mutex;
                    priority = effective;
                }
                None => break,
            }
        }
    });
}

/// Replaces (or with `None` removes) the priority `thread` inherits through `mutex`
/// and recomputes its effective priority.
pub(crate) fn set_boost(
    cs: CriticalSection<'_>,
    thread: ThreadId,
    mutex: usize,
    priority: Option<u8>,
) {
    let _ = with_kernel(cs, |state| state.set_boost(thread, mutex, priority));
}

pub(crate) fn set_waiting_on(
    cs: CriticalSection<'_>,
    thread: ThreadId,
    waiting_on: Option<(usize, ThreadId)>,
) {
    let _ = with_kernel(cs, |state| {
        if let Some(info) = state.thread_mut(thread) {
            info.waiting_on = waiting_on;
        }
    });
}

pub(crate) fn current_run_loop(cs: CriticalSection<'_>) -> Option<&'static RunLoop> {
    with_kernel(cs, |state| {
        state.threads[state.current]
            .as_ref()
            .and_then(|thread| thread.run_loop)
    })
    .ok()
    .flatten()
}

pub(crate) fn set_run_loop(cs: CriticalSection<'_>, id: ThreadId, run_loop: Option<&'static RunLoop>) {
    let _ = with_kernel(cs, |state| {
        if let Some(thread) = state.thread_mut(id) {
            thread.run_loop = run_loop;
        }
    });
}

pub(crate) fn sleep_current_until(wakeup: u64) -> Result<(), Error> {
    let should_block = critical_section::with(|cs| {
        let id = prepare_block(cs)?;
        if wakeup <= time::current_time() {
            return Ok(false);
        }

        with_kernel(cs, |state| {
            if let Some(thread) = state.thread_mut(id) {
                thread.state = ThreadState::Sleeping;
                thread.wakeup = Some(wakeup);
            }
            state.insert_sleeping(wakeup, id.slot);
        })?;

        Ok(true)
    })?;

    if should_block {
        arch::yield_now();
    }

    Ok(())
}

pub(crate) fn thread_name(id: ThreadId) -> Result<&'static str, Error> {
    critical_section::with(|cs| {
        with_kernel(cs, |state| {
            state
                .thread(id)
                .map(|thread| thread.name)
                .ok_or(Error::InvalidState)
        })
    })?
}

pub(crate) fn thread_priority(id: ThreadId) -> Result<(u8, u8), Error> {
    critical_section::with(|cs| {
        with_kernel(cs, |state| {
            state
                .thread(id)
                .map(|thread| (thread.base_priority, thread.priority))
                .ok_or(Error::InvalidState)
        })
    })?
}

pub(crate) fn thread_status(id: ThreadId) -> Result<ThreadStatus, Error> {
    critical_section::with(|cs| {
        with_kernel(cs, |state| {
            state
                .thread(id)
                .and_then(|_| state.status(id.slot))
                .ok_or(Error::InvalidState)
        })
    })?
}

pub(crate) fn thread_state(id: ThreadId) -> ThreadState {
    critical_section::with(|cs| {
        with_kernel(cs, |state| {
            state
                .thread(id)
                .map_or(ThreadState::Done, |thread| thread.state)
        })
    })
    .unwrap_or(ThreadState::Done)
}

pub(crate) fn set_thread_priority(id: ThreadId, priority: u8) -> Result<(), Error> {
    if priority == IDLE_PRIORITY || priority > MAX_PRIORITY || id.slot == IDLE_SLOT {
        return Err(Error::InvalidParameter);
    }

    critical_section::with(|cs| {
        let waiting_on = with_kernel(cs, |state| {
            let Some(thread) = state.thread_mut(id) else {
                return Err(Error::InvalidState);
            };
            thread.base_priority = priority;
            let waiting_on = thread.waiting_on;
            state.recompute_priority(id.slot);

            let effective = state.thread(id).map_or(priority, |thread| thread.priority);
            Ok(waiting_on.map(|(mutex, owner)| (mutex, owner, effective)))
        })??;

        // A blocked waiter passes its new priority on to the mutex owner
        if let Some((mutex, owner, effective)) = waiting_on {
            raise_priority(cs, owner, mutex, effective);
        }

        Ok(())
    })?;

    reschedule();
    Ok(())
}

pub(crate) fn suspend_thread(id: ThreadId) -> Result<(), Error> {
    if id.slot == IDLE_SLOT {
        return Err(Error::InvalidParameter);
    }

    let is_current = critical_section::with(|cs| {
        with_kernel(cs, |state| {
            let is_current = id.slot == state.current;
            let Some(thread_state) = state.thread(id).map(|thread| thread.state) else {
                return Err(Error::InvalidState);
            };
            match thread_state {
                ThreadState::Blocked => return Err(Error::InvalidState),
                ThreadState::Suspended => return Ok(false),
                _ => {}
            }

            state.unschedule(id.slot);
            if let Some(thread) = state.thread_mut(id) {
                thread.state = ThreadState::Suspended;
            }
            debug!("Thread #{} suspended", id.slot);

            Ok(is_current)
        })?
    })?;

    if is_current {
        if arch::in_interrupt() {
            NEEDS_RESCHEDULE.store(true, Ordering::Release);
        }
        arch::yield_now();
    }

    Ok(())
}

pub(crate) fn resume_thread(id: ThreadId) -> Result<(), Error> {
    critical_section::with(|cs| {
        with_kernel(cs, |state| {
            let Some(thread_state) = state.thread(id).map(|thread| thread.state) else {
                return Err(Error::InvalidState);
            };
            match thread_state {
                ThreadState::Suspended | ThreadState::Sleeping => {
                    state.unschedule(id.slot);
                    state.make_ready(id.slot);
                    debug!("Thread #{} resumed", id.slot);
                    Ok(())
                }
                ThreadState::Ready | ThreadState::Running => Ok(()),
                ThreadState::Blocked | ThreadState::Done => Err(Error::InvalidState),
            }
        })?
    })?;

    reschedule();
    Ok(())
}

pub(crate) fn terminate_thread(id: ThreadId) -> Result<(), Error> {
    if id.slot == IDLE_SLOT {
        return Err(Error::InvalidParameter);
    }

    let is_current = critical_section::with(|cs| {
        with_kernel(cs, |state| {
            if state.thread(id).is_none() {
                return Err(Error::InvalidState);
            }
            Ok(id.slot == state.current)
        })?
    })?;

    if is_current {
        exit_current();
    }

    critical_section::with(|cs| {
        with_kernel(cs, |state| {
            let waiting_on = state.thread(id).and_then(|thread| thread.waiting_on);
            state.release(id.slot);

            // The owner no longer inherits the priority of the terminated waiter
            if let Some((mutex, owner)) = waiting_on {
                let remaining = state.highest_waiter_on(mutex);
                state.set_boost(owner, mutex, remaining);
            }
        })
    })?;
    info!("Thread #{} terminated", id.slot);

    reschedule();

    Ok(())
}

fn exit_current() -> ! {
    critical_section::with(|cs| {
        let _ = with_kernel(cs, |state| {
            let slot = state.current;
            if let Some(thread) = state.threads[slot].as_ref() {
                info!("Thread {} #{} finished", thread.name, slot);
            }
            state.release(slot);
        });
    });

    loop {
        arch::yield_now();
    }
}

extern "C" fn thread_entry<F: FnOnce()>(func: *mut F) -> ! {
    // SAFETY: `spawn` copied a valid `F` here and gave up ownership of it
    let func = unsafe { func.read_unaligned() };
    func();

    exit_current()
}
