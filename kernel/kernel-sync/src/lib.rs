//! # Kernel Synchronization Primitives
//!
//! The kernel runs on one CPU but is preemptible: a timer interrupt can
//! switch tasks in the middle of kernel code, so shared structures still
//! need mutual exclusion. Everything here is a short, bounded spin; no
//! primitive in this crate ever sleeps or yields.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
