//! Ferron kernel library
//!
//! The microkernel core: per-address-space virtual memory with
//! copy-on-write anonymous objects, port/connection message passing,
//! and the security-token layer authorizing both. Architecture trap
//! handlers, the scheduler, filesystems and drivers are external
//! collaborators; only their interfaces appear here.

#![no_std]

extern crate alloc;

// On bare-metal targets use the kernel heap allocator. On host
// (x86_64-unknown-linux-gnu) for testing, delegate to the system
// allocator so that test code using Vec/String/alloc compiles and runs.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod error;
pub mod ipc;
pub mod logger;
pub mod mm;
pub mod process;
pub mod security;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod timer;
