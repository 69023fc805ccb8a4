//! Synchronization primitives shared across subsystems.

pub mod wait;

pub use wait::{WaitQueue, WaitToken};
