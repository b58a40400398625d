//! Utilities built on the argon kernel: an `embedded-hal` delay and an executor for
//! `async` code.

#![no_std]

pub mod delay;
pub mod futures;
