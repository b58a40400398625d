//! Cortex-M port of the argon kernel.
//!
//! Context switches happen in the PendSV handler, which has the lowest exception
//! priority so that a switch requested by an interrupt handler takes effect when the
//! last nested handler returns. SysTick drives the kernel tick.
//!
//! Supports Armv6-M (thumbv6m), Armv7-M and Armv8-M, with or without an FPU.

#![no_std]

use cortex_m::{
    peripheral::{
        SCB, SYST,
        scb::{SystemHandler, VectActive},
        syst::SystClkSource,
    },
    register::control::Spsel,
};
use argon::{
    arch::StackAllocation,
    scheduler::{Scheduler, SchedulerConfig},
};

/// Exception frame stacked by the hardware on exception entry.
#[repr(C, align(8))]
#[derive(Clone, Debug)]
struct HardwareSavedRegisters {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

impl HardwareSavedRegisters {
    /// Frame that starts executing `pc` with `r0` as its first argument.
    fn entry(pc: u32, r0: u32) -> Self {
        Self {
            r0,
            r1: 0,
            r2: 0,
            r3: 0,
            r12: 0,
            lr: 0,
            pc,
            xpsr: 1 << 24, // Thumb
        }
    }
}

/// Registers pushed by PendSV itself.
#[repr(C, align(8))]
#[derive(Clone, Debug)]
struct SoftwareSavedRegisters {
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    exc_return: u32,
}

impl SoftwareSavedRegisters {
    fn initial() -> Self {
        Self {
            r4: 0,
            r5: 0,
            r6: 0,
            r7: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            // Return to thread mode on PSP, basic frame
            exc_return: 0xFFFF_FFFD,
        }
    }
}

/// Initializes the kernel. Taking the SysTick and SCB peripherals guarantees that
/// nothing else configures them.
pub fn init_scheduler(
    _syst: SYST,
    _scb: SCB,
    clock_freq: u32,
    config: SchedulerConfig,
) -> Option<Scheduler> {
    unsafe { Scheduler::init(clock_freq, config) }
}

#[cfg(all(not(target_has_atomic), target_abi = "eabi"))] // thumbv6m
#[unsafe(no_mangle)]
#[unsafe(naked)]
extern "C" fn PendSV() {
    // R0-R3, R12, LR, PC and xPSR are already on the process stack
    core::arch::naked_asm!(
        "mrs r0, psp",
        // Armv6-M can only push low registers through SP, so borrow SP for the PSP
        "mov r1, sp",
        "mov sp, r0",
        "sub sp, #8",   // Same 40-byte frame as the other variants
        "push {{r4-r7}}",
        "mov r4, r8",
        "mov r5, r9",
        "mov r6, r10",
        "mov r7, r11",
        "push {{r4-r7}}",
        "mov r0, sp",
        "mov sp, r1",

        "push {{lr}}",
        "bl {select_thread}",   // R0: saved PSP in, next PSP out
        "pop {{r2}}",           // EXC_RETURN

        "mov r1, sp",
        "mov sp, r0",
        "pop {{r4-r7}}",
        "mov r8, r4",
        "mov r9, r5",
        "mov r10, r6",
        "mov r11, r7",
        "pop {{r4-r7}}",
        "add sp, #8",
        "mov r0, sp",
        "mov sp, r1",
        "msr psp, r0",

        "bx r2",
        select_thread = sym argon::scheduler::select_thread,
    );
}

#[cfg(all(target_has_atomic, target_abi = "eabi"))] // Armv7-M and later without FPU
#[unsafe(no_mangle)]
#[unsafe(naked)]
extern "C" fn PendSV() {
    core::arch::naked_asm!(
        "mrs r0, psp",
        "sub r0, #4",   // Alignment padding
        "stmdb r0!, {{r4-r11,lr}}",

        "bl {select_thread}",

        "ldmia r0!, {{r4-r11,lr}}",
        "add r0, #4",
        "msr psp, r0",

        "bx lr",
        select_thread = sym argon::scheduler::select_thread,
    );
}

/// With an FPU, S16-S31 are saved only for threads whose frame contains FP state,
/// following the Armv8-M User Guide context switch example.
#[cfg(target_abi = "eabihf")]
#[unsafe(no_mangle)]
#[unsafe(naked)]
extern "C" fn PendSV() {
    core::arch::naked_asm!(
        "mrs r0, psp",

        // FType bit of EXC_RETURN is 0 when the frame includes FP registers
        "tst lr, #0x00000010",
        "it eq",
        "vstmdbeq r0!, {{s16-s31}}",

        "sub r0, #4",
        "stmdb r0!, {{r4-r11,lr}}",

        "bl {select_thread}",

        "ldmia r0!, {{r4-r11,lr}}",
        "add r0, #4",

        "tst lr, #0x00000010",
        "it eq",
        "vldmiaeq r0!, {{s16-s31}}",

        "msr psp, r0",

        "bx lr",
        select_thread = sym argon::scheduler::select_thread,
    );
}

#[cortex_m_rt::exception]
fn SysTick() {
    argon::scheduler::handle_tick();
}

/// INTERNAL USE ONLY
#[unsafe(no_mangle)]
pub fn _argon_setup(clock_freq: u32, tick_freq: u32) {
    let peripherals = unsafe { cortex_m::Peripherals::steal() };
    let mut scb = peripherals.SCB;
    let mut syst = peripherals.SYST;

    // The caller continues as the idle thread on the process stack
    critical_section::with(|_| unsafe {
        cortex_m::register::psp::write(cortex_m::register::msp::read());

        let mut control = cortex_m::register::control::read();
        control.set_spsel(Spsel::Psp);
        cortex_m::register::control::write(control);
        cortex_m::asm::isb();
    });

    // `set_priority` is a read-modify-write on Armv6-M
    critical_section::with(|_| unsafe {
        scb.set_priority(SystemHandler::PendSV, 255);
        scb.set_priority(SystemHandler::SysTick, 255);
    });

    // SysTick reload value is 24 bits wide
    let reload = clock_freq / tick_freq;
    assert!(reload > 0 && reload <= 0x00FF_FFFF);
    syst.set_clock_source(SystClkSource::Core);
    syst.set_reload(reload - 1);
    syst.clear_current();
    syst.enable_interrupt();
}

/// INTERNAL USE ONLY
#[unsafe(no_mangle)]
pub fn _argon_start_timer() {
    let peripherals = unsafe { cortex_m::Peripherals::steal() };
    let mut syst = peripherals.SYST;
    syst.enable_counter();
}

/// INTERNAL USE ONLY
#[unsafe(no_mangle)]
pub fn _argon_yield_now() {
    SCB::set_pendsv();
    // Take PendSV right away when called from thread mode
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// INTERNAL USE ONLY
#[unsafe(no_mangle)]
pub fn _argon_init_stack(sp: *mut u8, pc: usize, arg: *const u8, arg_size: usize) -> *mut u8 {
    unsafe {
        let sp = align_down(sp);
        // The closure goes to the top, the thread entry receives its address in R0
        let sp = push_to_stack(sp, arg, arg_size);
        let frame = HardwareSavedRegisters::entry(pc as u32, sp as u32);
        let sp = push_to_stack(
            sp,
            &frame as *const _ as *const u8,
            core::mem::size_of::<HardwareSavedRegisters>(),
        );
        let saved = SoftwareSavedRegisters::initial();
        push_to_stack(
            sp,
            &saved as *const _ as *const u8,
            core::mem::size_of::<SoftwareSavedRegisters>(),
        )
    }
}

/// INTERNAL USE ONLY
#[unsafe(no_mangle)]
pub fn _argon_wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// INTERNAL USE ONLY
#[unsafe(no_mangle)]
pub fn _argon_in_interrupt() -> bool {
    SCB::vect_active() != VectActive::ThreadMode
}

fn align_down(sp: *mut u8) -> *mut u8 {
    sp.wrapping_sub(sp as usize % 8)
}

/// Copies `obj_size` bytes below `sp`, keeping 8-byte alignment.
unsafe fn push_to_stack(sp: *mut u8, obj: *const u8, obj_size: usize) -> *mut u8 {
    unsafe {
        let sp = sp.byte_sub(obj_size.next_multiple_of(8));
        core::ptr::copy(obj, sp, obj_size);
        sp
    }
}

/// Thread stack aligned at 8 bytes, as the AAPCS requires at public interfaces.
///
/// Modeled after [rp2040-hal](https://docs.rs/rp2040-hal/0.11.0/rp2040_hal/multicore/struct.Stack.html).
#[repr(align(8))]
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

