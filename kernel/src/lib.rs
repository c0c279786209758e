//! Copy-on-write virtual memory core.
//!
//! Four-level page tables over simulated physical memory, a COW fork built
//! on a handful of kernel primitives, the user-level fault handler that
//! resolves COW writes, a frame-pointer stack walker and the monitor
//! commands that inspect and edit mappings.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod backtrace;
pub mod memory;
pub mod monitor;
pub mod process;
pub mod trap;
