//! Interface for architecture-dependent functions implemented in separate crates.

unsafe extern "Rust" {
    /// INTERNAL USE ONLY
    pub unsafe fn _argon_setup(clock_freq: u32, tick_freq: u32);
    /// INTERNAL USE ONLY
    pub unsafe fn _argon_start_timer();
    /// INTERNAL USE ONLY
    pub unsafe fn _argon_yield_now();
    /// INTERNAL USE ONLY
    pub unsafe fn _argon_init_stack(
        sp: *mut u8,
        pc: usize,
        arg: *const u8,
        arg_size: usize,
    ) -> *mut u8;
    /// INTERNAL USE ONLY
    pub unsafe fn _argon_wait_for_interrupt();
    /// INTERNAL USE ONLY
    pub unsafe fn _argon_in_interrupt() -> bool;
}

/// Incurs a context switch and yields the CPU to another thread.
///
/// Called from an interrupt handler, the switch is deferred until the handler returns.
pub fn yield_now() {
    unsafe {
        _argon_yield_now();
    }
}

/// Whether the caller runs in interrupt context.
pub fn in_interrupt() -> bool {
    unsafe { _argon_in_interrupt() }
}

/// Trait for a stack allocation that meets architecture-specific requirements such as alignment.
/// Modeled after `rp2040_hal`. https://docs.rs/rp2040-hal/0.11.0/rp2040_hal/multicore/struct.StackAllocation.html
pub trait StackAllocation {
    fn as_mut_slice(&mut self) -> &mut [u8];
}
