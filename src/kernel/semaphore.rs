//! Semaphores.
//!
//! A semaphore maintains a count of permits in `0 ..= max_count`. [`wait`]
//! acquires a permit, possibly blocking; [`post`] releases one, handing it
//! directly to the longest-waiting thread when one is present (the count
//! is left untouched in that case, so an unrelated `try_wait` cannot steal
//! the permit from the woken thread).
//!
//! [`post`]: Semaphore::post
//! [`wait`]: Semaphore::wait
use core::{fmt, ptr};

use super::{
    clock::TickDelta,
    error::{PermError, WaitError},
    state::expect_waitable_context,
    thread,
    utils::{lock_cpu, CpuLockCell},
    wait::{QueueOrder, WaitPayload, WaitQueue},
    Kernel, KernelCfg,
};
use crate::utils::Init;

/// Type of semaphore counts. Signed, matching POSIX `sem_getvalue`
/// conventions; kernel invariants keep it non-negative.
pub type SemaphoreCount = i16;

/// The largest permitted `max_count`.
pub const MAX_COUNT_VALUE: SemaphoreCount = 0x7FFF;

/// Semaphore attributes.
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreAttr {
    pub name: &'static str,
    pub initial_count: SemaphoreCount,
    pub max_count: SemaphoreCount,
}

impl SemaphoreAttr {
    /// Attributes of a counting semaphore with the given initial count and
    /// the largest possible maximum.
    pub const fn counting(initial_count: SemaphoreCount) -> Self {
        Self {
            name: "-",
            initial_count,
            max_count: MAX_COUNT_VALUE,
        }
    }

    /// Attributes of a binary semaphore: the count is 0 or 1.
    pub const fn binary(initial_count: SemaphoreCount) -> Self {
        Self {
            name: "-",
            initial_count,
            max_count: 1,
        }
    }

    pub const fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub const fn max_count(mut self, max_count: SemaphoreCount) -> Self {
        self.max_count = max_count;
        self
    }
}

impl Init for SemaphoreAttr {
    const INIT: Self = Self::counting(0);
}

/// A semaphore control block. Compares equal by identity.
pub struct Semaphore<System: KernelCfg> {
    name: &'static str,
    initial_count: SemaphoreCount,
    max_count: SemaphoreCount,
    count: CpuLockCell<System, SemaphoreCount>,
    wait_queue: WaitQueue<System>,
}

impl<System: KernelCfg> Semaphore<System> {
    /// Construct a semaphore control block.
    ///
    /// # Panics
    ///
    /// Panics when `max_count` is outside `1 ..= 0x7FFF` or
    /// `initial_count` is outside `0 ..= max_count`. (Construction-time
    /// violations trap; operations report error codes.)
    pub const fn new(attr: SemaphoreAttr) -> Self {
        assert!(attr.max_count >= 1 && attr.max_count <= MAX_COUNT_VALUE);
        assert!(attr.initial_count >= 0 && attr.initial_count <= attr.max_count);
        Self {
            name: if attr.name.is_empty() { "-" } else { attr.name },
            initial_count: attr.initial_count,
            max_count: attr.max_count,
            count: CpuLockCell::new(attr.initial_count),
            wait_queue: WaitQueue::new(QueueOrder::Fifo),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The count the semaphore was created with (restored by
    /// [`reset`](Self::reset)).
    pub fn initial_value(&self) -> SemaphoreCount {
        self.initial_count
    }

    /// The inclusive upper bound of the count.
    pub fn max_value(&self) -> SemaphoreCount {
        self.max_count
    }
}

impl<System: KernelCfg> PartialEq for Semaphore<System> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl<System: KernelCfg> Eq for Semaphore<System> {}

impl<System: KernelCfg> fmt::Debug for Semaphore<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .finish()
    }
}

define_error! {
    /// Error type for [`Semaphore::post`].
    pub enum PostSemaphoreError {
        /// The maximum count would be exceeded.
        Overflow,
    }
}

define_error! {
    /// Error type for [`Semaphore::wait`].
    pub enum WaitSemaphoreError {
        Perm,
        Interrupted,
    }
}

define_error! {
    /// Error type for [`Semaphore::try_wait`].
    pub enum TryWaitSemaphoreError {
        WouldBlock,
    }
}

define_error! {
    /// Error type for [`Semaphore::timed_wait`].
    pub enum TimedWaitSemaphoreError {
        Perm,
        Interrupted,
        TimedOut,
    }
}

impl<System: Kernel> Semaphore<System> {
    /// Release a permit. If threads are blocked in [`wait`](Self::wait),
    /// the longest-waiting one receives the permit directly and the count
    /// stays unchanged; otherwise the count is incremented.
    ///
    /// Safe to call from an interrupt handler.
    pub fn post(&'static self) -> Result<(), PostSemaphoreError> {
        let mut lock = match lock_cpu::<System>() {
            Ok(lock) => lock,
            // Inside a kernel critical section; unreachable from user code
            Err(PermError::Perm) => return Err(PostSemaphoreError::Overflow),
        };

        if self
            .wait_queue
            .wake_up_one_result(lock.borrow_mut(), Ok(()))
            .is_some()
        {
            // The permit went straight to the woken thread
            thread::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        let count = self.count.get(&*lock);
        if count >= self.max_count {
            return Err(PostSemaphoreError::Overflow);
        }
        self.count.replace(&mut *lock, count + 1);
        Ok(())
    }

    /// Acquire a permit, blocking the calling thread until one is
    /// available.
    pub fn wait(&'static self) -> Result<(), WaitSemaphoreError> {
        expect_waitable_context::<System>()
            .map_err(|PermError::Perm| WaitSemaphoreError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| WaitSemaphoreError::Perm)?;

        if poll_core(self.count.write(&mut *lock)) {
            return Ok(());
        }

        // The wake-upper hands the permit over, completing the operation
        match self.wait_queue.wait(lock.borrow_mut(), WaitPayload::Semaphore) {
            Ok(_) => Ok(()),
            Err(WaitError::Interrupted) => Err(WaitSemaphoreError::Interrupted),
            Err(_) => unreachable!(),
        }
    }

    /// Non-blocking version of [`wait`](Self::wait). Returns
    /// `Err(WouldBlock)` when no permit is available.
    ///
    /// Safe to call from an interrupt handler.
    pub fn try_wait(&'static self) -> Result<(), TryWaitSemaphoreError> {
        let mut lock = match lock_cpu::<System>() {
            Ok(lock) => lock,
            Err(PermError::Perm) => return Err(TryWaitSemaphoreError::WouldBlock),
        };
        if poll_core(self.count.write(&mut *lock)) {
            Ok(())
        } else {
            Err(TryWaitSemaphoreError::WouldBlock)
        }
    }

    /// [`wait`](Self::wait) with a timeout, in ticks.
    pub fn timed_wait(&'static self, ticks: TickDelta) -> Result<(), TimedWaitSemaphoreError> {
        expect_waitable_context::<System>()
            .map_err(|PermError::Perm| TimedWaitSemaphoreError::Perm)?;
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| TimedWaitSemaphoreError::Perm)?;

        if poll_core(self.count.write(&mut *lock)) {
            return Ok(());
        }

        let at = System::state()
            .sysclock
            .count
            .get(&*lock)
            .wrapping_add(ticks as u64);
        match self
            .wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Semaphore, at)
        {
            Ok(_) => Ok(()),
            Err(WaitError::Interrupted) => Err(TimedWaitSemaphoreError::Interrupted),
            Err(WaitError::TimedOut) => Err(TimedWaitSemaphoreError::TimedOut),
            Err(_) => unreachable!(),
        }
    }

    /// Get the current count.
    pub fn value(&'static self) -> SemaphoreCount {
        match lock_cpu::<System>() {
            Ok(lock) => self.count.get(&*lock),
            Err(PermError::Perm) => 0,
        }
    }

    /// Restore the count to its initial value and wake every blocked
    /// thread with [`Interrupted`](super::ResultCode::Interrupted), so that
    /// no waiter is left sleeping on a count it can no longer observe.
    pub fn reset(&'static self) {
        if let Ok(mut lock) = lock_cpu::<System>() {
            self.count.replace(&mut *lock, self.initial_count);
            if self
                .wait_queue
                .wake_up_all_result(lock.borrow_mut(), Err(WaitError::Interrupted))
            {
                thread::unlock_cpu_and_check_preemption(lock);
            }
        }
    }
}

/// Check if the current count permits a non-blocking acquisition; if so,
/// take one permit and return `true`.
#[inline]
fn poll_core(count: &mut SemaphoreCount) -> bool {
    if *count > 0 {
        *count -= 1;
        true
    } else {
        false
    }
}
