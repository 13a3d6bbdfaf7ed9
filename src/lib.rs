//! `keel` is a small preemptive, priority-based real-time kernel core for
//! single-core microcontrollers.
//!
//! The kernel provides the classical primitives needed to structure
//! concurrent firmware: threads and a strict-priority scheduler
//! ([`kernel::thread`], [`kernel::state`]), a tick-driven clock pair
//! ([`kernel::clock`]), and the synchronisation and communication objects
//! built on one shared wait-list discipline — mutexes with the full POSIX
//! type/protocol/robustness matrix ([`kernel::mutex`]), condition
//! variables ([`kernel::condvar`]), counting and binary semaphores
//! ([`kernel::semaphore`]), event flags ([`kernel::eventflags`]),
//! per-thread signal flags ([`kernel::sig`]), fixed-block memory pools
//! ([`kernel::mempool`]), priority message queues ([`kernel::mqueue`]),
//! and software timers ([`kernel::timer`]).
//!
//! The CPU-specific mechanics — interrupt masking, context switching,
//! stack layout — live behind the [`kernel::Port`] trait family; this
//! crate contains no architecture-specific code.
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

#[macro_use]
pub mod kernel;
pub mod utils;

/// The prelude module.
pub mod prelude {
    #[doc(no_inline)]
    pub use crate::{kernel::Kernel, utils::Init};
}
