//! The RTOS kernel core.
//!
//! # Contexts
//!
//! Code runs in one of the following contexts:
//!
//!  - **Thread context** — the normal context of application threads. All
//!    kernel services are available.
//!
//!  - **Handler context** — inside an interrupt handler
//!    ([`Port::in_handler_mode`] returns `true`). Services that suspend the
//!    calling thread are not available and fail with
//!    [`ResultCode::Perm`].
//!
//!  - **Scheduler-locked context** — a thread context with the scheduler
//!    lock held ([`scheduler::lock`]). Like the handler context, blocking
//!    services are unavailable.
//!
//! A context in which blocking services are available is called *waitable*.
//!
//! # System types
//!
//! The kernel is generic over a *system type* implementing [`Port`] (the
//! CPU port capability record), [`PortTimer`], and [`KernelCfg`] (the static
//! configuration and the [`State`] singleton). [`Kernel`] is a blanket alias
//! for the three.
use crate::utils::Init;

#[macro_use]
pub mod error;
mod utils;

#[cfg(test)]
#[macro_use]
pub(crate) mod sim;

pub mod clock;
pub mod condvar;
pub mod eventflags;
pub mod mempool;
pub mod mqueue;
pub mod mutex;
pub mod semaphore;
pub mod sig;
pub mod state;
pub mod thread;
pub mod timer;

mod timeout;
mod wait;

pub use self::{
    clock::{rtclock, sysclock, SubtickSample, SysclockSample, Tick, TickDelta},
    condvar::{CondVar, CondVarAttr},
    error::{PermError, ResultCode, WaitError},
    eventflags::{EventFlags, EventFlagsAttr},
    mempool::{MemPool, MemPoolAttr, PoolStorage},
    mqueue::{MQueue, MQueueAttr, MsgPrio, QueueStorage},
    mutex::{Mutex, MutexAttr, MutexProtocol, MutexRobustness, MutexType},
    semaphore::{Semaphore, SemaphoreAttr, SemaphoreCount, MAX_COUNT_VALUE},
    state::{reschedule, scheduler, State},
    thread::{
        priority, this_thread, thread_entry_trampoline, Priority, Stack, Thread, ThreadAttr,
        ThreadState,
    },
    timer::{Timer, TimerAttr, TimerRun},
};

/// Type of a variable holding a flags mask.
///
/// Both thread signal flags and event flags use this definition.
pub type FlagsMask = u32;

bitflags::bitflags! {
    /// Mode bits for the flag wait services ([`EventFlags::wait`],
    /// [`sig::sig_wait`], and their variants).
    ///
    /// Exactly one of [`ALL`](Self::ALL) and [`ANY`](Self::ANY) must be
    /// specified.
    pub struct FlagsMode: u32 {
        /// Wait until every bit in the mask is raised.
        const ALL = 1;

        /// Wait until at least one bit in the mask is raised.
        const ANY = 2;

        /// Atomically clear the matched bits when the wait completes.
        const CLEAR = 4;
    }
}

impl FlagsMode {
    /// Check that exactly one of `ALL` and `ANY` is present.
    pub(super) fn is_well_formed(self) -> bool {
        self.contains(Self::ALL) != self.contains(Self::ANY)
    }
}

/// Represents "system" types having sufficient trait `impl`s to instantiate
/// the kernel.
pub trait Kernel: Port + PortTimer + KernelCfg {}
impl<T: Port + PortTimer + KernelCfg> Kernel for T {}

/// The interface the kernel consumes from a CPU port.
///
/// # Safety
///
/// The implementation must uphold the documented contract of every method;
/// the kernel builds its memory-safety argument (in particular, the
/// uniqueness of the CPU Lock token) on it.
pub unsafe trait Port: Sized + 'static {
    /// The saved interrupt status word, returned by
    /// [`interrupts_mask`](Self::interrupts_mask) and accepted by
    /// [`interrupts_restore`](Self::interrupts_restore).
    type InterruptStatus: Copy + Send + 'static;

    /// Port-specific per-thread state (saved context, stack pointer). This
    /// is placed at the beginning of [`Thread`] so that assembler code can
    /// refer to it easily.
    type PortThreadState: Send + Sync + Init + 'static;

    /// Mask interrupts at and below the kernel priority, returning the
    /// previous status.
    ///
    /// # Safety
    ///
    /// Only the kernel may drive the CPU Lock state.
    unsafe fn interrupts_mask() -> Self::InterruptStatus;

    /// Restore the interrupt status saved by a matching
    /// [`interrupts_mask`](Self::interrupts_mask) call.
    ///
    /// # Safety
    ///
    /// `status` must originate from the matching `interrupts_mask` call.
    unsafe fn interrupts_restore(status: Self::InterruptStatus);

    /// Check whether interrupts are currently masked by
    /// [`interrupts_mask`](Self::interrupts_mask).
    fn interrupts_masked() -> bool;

    /// Check whether the CPU is currently executing an exception handler.
    fn in_handler_mode() -> bool;

    /// Pend a context switch. The switch happens when the pended handler
    /// runs (immediately if the current context permits, or upon return
    /// from the innermost interrupt handler). The handler must call
    /// [`state::reschedule`] and then restore the context of
    /// [`State::running_thread`].
    ///
    /// # Safety
    ///
    /// The CPU Lock must be inactive.
    unsafe fn context_switch_request();

    /// Prepare the stack and saved context of a thread so that when the
    /// port dispatches it for the first time, execution starts at
    /// [`thread::thread_entry_trampoline`] (or an equivalent provided by
    /// the port).
    ///
    /// # Safety
    ///
    /// The CPU Lock must be active, and `thread` must not be currently
    /// executing.
    unsafe fn stack_init(thread: &'static Thread<Self>)
    where
        Self: Kernel;

    /// Transfer control to the specified thread, discarding the current
    /// execution context. Used to start the scheduler and to leave an
    /// exiting thread.
    ///
    /// # Safety
    ///
    /// The CPU Lock must be active. It is released by the dispatcher.
    unsafe fn dispatch_to(thread: &'static Thread<Self>) -> !
    where
        Self: Kernel;

    /// Wait for an interrupt. Called by the idle thread body.
    ///
    /// # Safety
    ///
    /// The CPU Lock must be inactive.
    unsafe fn idle_wait();
}

/// The interface the kernel consumes from the port's tick timer, beyond the
/// periodic call to [`clock::systick_handler`].
pub unsafe trait PortTimer: Sized + 'static {
    /// Sample the sub-tick state of the tick timer for high-resolution
    /// timestamping. Ports without a readable tick counter can use the
    /// default implementation, which reports no sub-tick information.
    fn subtick_sample() -> clock::SubtickSample {
        clock::SubtickSample {
            cycles: 0,
            divisor: 0,
            core_frequency_hz: 0,
        }
    }
}

/// Associates a system type with its kernel state and build-time
/// configuration.
///
/// # Safety
///
/// [`state`](Self::state) must return the same object every time, and that
/// object must not be shared with another system type.
pub unsafe trait KernelCfg: Port {
    /// The tick interrupt frequency in hertz.
    const TICK_FREQUENCY_HZ: u32 = 1000;

    /// Priority pre-scaler. Widens the priority range from 16 levels
    /// (shift 0) up to 128 levels (shift 3).
    const PRIORITY_SHIFT: u32 = 0;

    /// The stack size the port should reserve for the main thread.
    const MAIN_STACK_SIZE_BYTES: usize = 400;

    /// Per-thread user storage, reachable via [`Thread::user_storage`].
    /// Use `()` unless the application opts into a custom aggregate.
    type UserStorage: Init + 'static;

    /// Get the kernel state singleton.
    fn state() -> &'static State<Self>;
}
