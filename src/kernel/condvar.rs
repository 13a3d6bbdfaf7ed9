//! Condition variables.
//!
//! A condition variable works together with a caller-supplied [`Mutex`]
//! guarding the predicate. [`CondVar::wait`] atomically enqueues the
//! caller, releases the mutex, and parks; once woken (by [`CondVar::signal`],
//! [`CondVar::broadcast`], or a timeout) it reacquires the mutex before
//! returning. Waiters are woken highest-priority first, FIFO among equal
//! priorities, and contend for the mutex in that same order.
use core::{fmt, ptr};

use super::{
    clock::TickDelta,
    error::{PermError, WaitError},
    mutex::{InnerLockError, Mutex},
    state::{expect_thread_context, expect_waitable_context},
    thread,
    utils::lock_cpu,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    Kernel, KernelCfg,
};
use crate::utils::Init;

/// Condition variable attributes.
#[derive(Debug, Clone, Copy)]
pub struct CondVarAttr {
    pub name: &'static str,
}

impl CondVarAttr {
    pub const fn new() -> Self {
        Self { name: "-" }
    }

    pub const fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

impl Init for CondVarAttr {
    const INIT: Self = Self::new();
}

impl Default for CondVarAttr {
    fn default() -> Self {
        Self::new()
    }
}

/// A condition variable control block. Compares equal by identity.
pub struct CondVar<System: KernelCfg> {
    name: &'static str,
    wait_queue: WaitQueue<System>,
}

impl<System: KernelCfg> CondVar<System> {
    pub const fn new(attr: CondVarAttr) -> Self {
        Self {
            name: if attr.name.is_empty() { "-" } else { attr.name },
            wait_queue: WaitQueue::new(QueueOrder::ThreadPriority),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<System: KernelCfg> PartialEq for CondVar<System> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl<System: KernelCfg> Eq for CondVar<System> {}

impl<System: KernelCfg> fmt::Debug for CondVar<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CondVar")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .finish()
    }
}

define_error! {
    /// Error type for [`CondVar::wait`].
    pub enum WaitCondVarError {
        /// Called from a non-waitable context, or the caller does not own
        /// the mutex (with a lock count of one).
        Perm,
        Inval,
        Interrupted,
        /// Reported by the mutex reacquisition; the caller owns the mutex.
        OwnerDead,
        NotRecoverable,
    }
}

define_error! {
    /// Error type for [`CondVar::timed_wait`].
    pub enum TimedWaitCondVarError {
        Perm,
        Inval,
        Interrupted,
        TimedOut,
        OwnerDead,
        NotRecoverable,
    }
}

define_error! {
    /// Error type for [`CondVar::signal`] and [`CondVar::broadcast`].
    pub enum SignalCondVarError {
        Perm,
    }
}

impl<System: Kernel> CondVar<System> {
    /// Atomically release `mutex` and block until the condition variable
    /// is signalled, then reacquire `mutex`.
    ///
    /// The caller must own `mutex` with a lock count of exactly one.
    pub fn wait(&'static self, mutex: &'static Mutex<System>) -> Result<(), WaitCondVarError> {
        self.wait_inner(mutex, None).map_err(|e| match e {
            TimedWaitCondVarError::Perm => WaitCondVarError::Perm,
            TimedWaitCondVarError::Inval => WaitCondVarError::Inval,
            TimedWaitCondVarError::Interrupted => WaitCondVarError::Interrupted,
            TimedWaitCondVarError::OwnerDead => WaitCondVarError::OwnerDead,
            TimedWaitCondVarError::NotRecoverable => WaitCondVarError::NotRecoverable,
            TimedWaitCondVarError::TimedOut => unreachable!(),
        })
    }

    /// [`wait`](Self::wait) with a timeout on the condition (the mutex
    /// reacquisition itself is not bounded, per POSIX).
    pub fn timed_wait(
        &'static self,
        mutex: &'static Mutex<System>,
        ticks: TickDelta,
    ) -> Result<(), TimedWaitCondVarError> {
        self.wait_inner(mutex, Some(ticks))
    }

    /// Wake up the highest-priority, longest-waiting thread, if any.
    pub fn signal(&'static self) -> Result<(), SignalCondVarError> {
        expect_thread_context::<System>().map_err(|PermError::Perm| SignalCondVarError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| SignalCondVarError::Perm)?;
        if self.wait_queue.wake_up_one(lock.borrow_mut()) {
            thread::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Wake up every waiting thread. The woken threads reacquire the mutex
    /// in their unpark order.
    pub fn broadcast(&'static self) -> Result<(), SignalCondVarError> {
        expect_thread_context::<System>().map_err(|PermError::Perm| SignalCondVarError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| SignalCondVarError::Perm)?;
        if self.wait_queue.wake_up_all(lock.borrow_mut()) {
            thread::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Are there threads waiting on this condition variable?
    pub fn are_waiting(&'static self) -> bool {
        match lock_cpu::<System>() {
            Ok(mut lock) => !self.wait_queue.is_empty(lock.borrow_mut()),
            Err(PermError::Perm) => false,
        }
    }

    /// The release-enqueue-park-relock sequence shared by both wait
    /// flavours. Everything up to the park happens inside one CPU Lock
    /// critical section, so a signal can never slip between the mutex
    /// release and the enqueue.
    fn wait_inner(
        &'static self,
        mutex: &'static Mutex<System>,
        ticks: Option<TickDelta>,
    ) -> Result<(), TimedWaitCondVarError> {
        expect_waitable_context::<System>()
            .map_err(|PermError::Perm| TimedWaitCondVarError::Perm)?;
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| TimedWaitCondVarError::Perm)?;
        let cur = System::state().running_thread().unwrap();

        if !mutex.condvar_release(lock.borrow_mut(), cur) {
            return Err(TimedWaitCondVarError::Perm);
        }

        let cond_result = match ticks {
            None => self.wait_queue.wait(lock.borrow_mut(), WaitPayload::CondVar),
            Some(ticks) => {
                let at = System::state()
                    .sysclock
                    .count
                    .get(&*lock)
                    .wrapping_add(ticks as u64);
                self.wait_queue
                    .wait_timeout(lock.borrow_mut(), WaitPayload::CondVar, at)
            }
        };

        // Reacquire the mutex before reporting anything. A cancellation
        // arriving mid-relock may not leave us without the lock, so retry;
        // it is reported once the lock is held again.
        let mut relock_interrupted = false;
        let relock = loop {
            match mutex.lock_full(lock.borrow_mut(), cur, None) {
                Err(InnerLockError::Wait(WaitError::Interrupted)) => {
                    relock_interrupted = true;
                }
                other => break other,
            }
        };

        match relock {
            Err(InnerLockError::NotRecoverable)
            | Err(InnerLockError::Wait(WaitError::NotRecoverable)) => {
                return Err(TimedWaitCondVarError::NotRecoverable)
            }
            Err(InnerLockError::Inval) => return Err(TimedWaitCondVarError::Inval),
            // The caller held this mutex moments ago; a deadlock or
            // recursion overflow cannot appear during the reacquisition
            Err(InnerLockError::Deadlock)
            | Err(InnerLockError::Again)
            | Err(InnerLockError::Wait(_)) => unreachable!(),
            Ok(true) => return Err(TimedWaitCondVarError::OwnerDead),
            Ok(false) => {}
        }

        if relock_interrupted {
            return Err(TimedWaitCondVarError::Interrupted);
        }
        match cond_result {
            Ok(_) => Ok(()),
            Err(WaitError::Interrupted) => Err(TimedWaitCondVarError::Interrupted),
            Err(WaitError::TimedOut) => Err(TimedWaitCondVarError::TimedOut),
            Err(_) => unreachable!(),
        }
    }
}
