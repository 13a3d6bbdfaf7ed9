//! Mutexes.
//!
//! A mutex is configured by three orthogonal axes, fixed at construction:
//!
//!  - **Type** ([`MutexType`]): what happens when the owner locks again —
//!    block (`Normal`), fail with `Deadlock` (`ErrorCheck`), or count
//!    (`Recursive`).
//!  - **Protocol** ([`MutexProtocol`]): how priority inversion is bounded —
//!    not at all (`None`), by [priority inheritance] (`Inherit`), or by an
//!    immediate [priority ceiling] (`Protect`).
//!  - **Robustness** ([`MutexRobustness`]): what happens when the owner
//!    terminates while holding the lock — waiters stall (`Stalled`), or
//!    the next acquirer is handed the lock with
//!    [`OwnerDead`](super::ResultCode::OwnerDead) and repairs the protected
//!    state (`Robust`).
//!
//! Unlocking hands the ownership directly to the highest-priority,
//! longest-waiting thread, so an unrelated thread can never steal the lock
//! between the wake-up and the resumption of the waiter.
//!
//! [priority inheritance]: https://en.wikipedia.org/wiki/Priority_inheritance
//! [priority ceiling]: https://en.wikipedia.org/wiki/Priority_ceiling_protocol
use core::{fmt, ptr};

use super::{
    clock::TickDelta,
    error::{PermError, WaitError},
    state::{expect_thread_context, expect_waitable_context},
    thread,
    thread::{priority, Priority, Thread, ThreadState},
    utils::{lock_cpu, CpuLockCell, CpuLockGuardBorrowMut},
    wait,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    Kernel, KernelCfg,
};
use crate::utils::{
    intrusive_list::{Ident, ListAccessorCell, Static, StaticLink},
    Init,
};

/// Type of mutex behaviour on a relock by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    /// Relocking by the owner blocks the owner on itself. (POSIX leaves
    /// this undefined for `PTHREAD_MUTEX_NORMAL`; blocking is the common
    /// realisation and the one adopted here.)
    Normal,
    /// Relocking by the owner fails with `Deadlock`; unlocking by a
    /// non-owner fails with `Perm`.
    ErrorCheck,
    /// Relocking by the owner increments a lock count; the mutex is
    /// released when the count returns to zero.
    Recursive,
}

/// Type of mutex locking protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    /// Locking the mutex does not affect the priority of the owner.
    None,
    /// While threads are blocked on the mutex, the owner executes at the
    /// highest of its own and their priorities, transitively through any
    /// mutex the owner itself is blocked on.
    Inherit,
    /// The owner executes at the mutex's priority ceiling for the whole
    /// duration of the ownership.
    Protect,
}

/// Type of mutex robustness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexRobustness {
    /// No special action when the owner terminates while holding the
    /// lock; subsequent lockers block indefinitely.
    Stalled,
    /// The termination of the owner is reported to the next acquirer by
    /// [`OwnerDead`](super::ResultCode::OwnerDead).
    Robust,
}

/// Type of the mutex recursion counter.
pub type MutexCount = u16;

/// Mutex attributes.
#[derive(Debug, Clone, Copy)]
pub struct MutexAttr {
    pub name: &'static str,
    pub mutex_type: MutexType,
    pub protocol: MutexProtocol,
    pub robustness: MutexRobustness,
    /// The priority ceiling. Only used (and then required to be a valid
    /// priority) when `protocol` is [`MutexProtocol::Protect`].
    pub priority_ceiling: Priority,
}

impl MutexAttr {
    pub const fn new() -> Self {
        Self {
            name: "-",
            mutex_type: MutexType::Normal,
            protocol: MutexProtocol::None,
            robustness: MutexRobustness::Stalled,
            priority_ceiling: priority::NONE,
        }
    }

    /// Attributes of a recursive mutex.
    pub const fn recursive() -> Self {
        Self {
            mutex_type: MutexType::Recursive,
            ..Self::new()
        }
    }

    pub const fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub const fn mutex_type(mut self, mutex_type: MutexType) -> Self {
        self.mutex_type = mutex_type;
        self
    }

    pub const fn protocol(mut self, protocol: MutexProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub const fn robustness(mut self, robustness: MutexRobustness) -> Self {
        self.robustness = robustness;
        self
    }

    pub const fn priority_ceiling(mut self, ceiling: Priority) -> Self {
        self.priority_ceiling = ceiling;
        self
    }
}

impl Init for MutexAttr {
    const INIT: Self = Self::new();
}

impl Default for MutexAttr {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutex control block. Mutexes compare equal by identity.
pub struct Mutex<System: KernelCfg> {
    name: &'static str,
    mutex_type: MutexType,
    protocol: MutexProtocol,
    robustness: MutexRobustness,

    ceiling: CpuLockCell<System, Priority>,

    owner: CpuLockCell<System, Option<&'static Thread<System>>>,

    /// Lock count. Non-zero iff `owner` is `Some(_)`; greater than one
    /// only for recursive mutexes.
    count: CpuLockCell<System, MutexCount>,

    /// The previous owner terminated while holding the lock, and the
    /// protected state has not been marked consistent yet.
    owner_died: CpuLockCell<System, bool>,

    /// The protected state was abandoned for good: an inconsistent mutex
    /// was unlocked without `consistent`.
    unrecoverable: CpuLockCell<System, bool>,

    /// Membership link in the owner's `owned_mutexes` list.
    pub(super) owner_link: CpuLockCell<System, Option<StaticLink<Self>>>,

    /// Threads blocked in `lock`, in priority order.
    wait_queue: WaitQueue<System>,
}

/// Get a `ListAccessorCell` for the list of mutexes owned by `$thread`.
macro_rules! owned_list_accessor {
    ($thread:expr, $key:expr) => {
        ListAccessorCell::new(
            &$thread.owned_mutexes,
            &Static,
            |m: &Mutex<System>| &m.owner_link,
            $key,
        )
    };
}

impl<System: KernelCfg> Mutex<System> {
    pub const fn new(attr: MutexAttr) -> Self {
        Self {
            name: if attr.name.is_empty() { "-" } else { attr.name },
            mutex_type: attr.mutex_type,
            protocol: attr.protocol,
            robustness: attr.robustness,
            ceiling: CpuLockCell::new(attr.priority_ceiling),
            owner: CpuLockCell::new(None),
            count: CpuLockCell::new(0),
            owner_died: CpuLockCell::new(false),
            unrecoverable: CpuLockCell::new(false),
            owner_link: CpuLockCell::new(None),
            wait_queue: WaitQueue::new(QueueOrder::ThreadPriority),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mutex_type(&self) -> MutexType {
        self.mutex_type
    }

    pub fn protocol(&self) -> MutexProtocol {
        self.protocol
    }

    pub fn robustness(&self) -> MutexRobustness {
        self.robustness
    }
}

impl<System: KernelCfg> PartialEq for Mutex<System> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl<System: KernelCfg> Eq for Mutex<System> {}

impl<System: KernelCfg> fmt::Debug for Mutex<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .finish()
    }
}

define_error! {
    /// Error type for [`Mutex::lock`].
    pub enum LockMutexError {
        Perm,
        /// The protocol is `Protect` and the caller's priority is higher
        /// than the ceiling (or the ceiling is not a valid priority).
        Inval,
        /// The type is `ErrorCheck` and the caller already owns the mutex.
        Deadlock,
        /// The maximum number of recursive locks has been exceeded.
        WouldBlock,
        Interrupted,
        /// The previous owner terminated while holding the lock. **The
        /// caller received the ownership** and should restore the protected
        /// state and call [`Mutex::consistent`].
        OwnerDead,
        NotRecoverable,
    }
}

define_error! {
    /// Error type for [`Mutex::try_lock`].
    pub enum TryLockMutexError {
        Perm,
        Inval,
        Deadlock,
        /// The mutex is locked by another thread (or the maximum number of
        /// recursive locks has been exceeded).
        WouldBlock,
        OwnerDead,
        NotRecoverable,
    }
}

define_error! {
    /// Error type for [`Mutex::timed_lock`].
    pub enum TimedLockMutexError {
        Perm,
        Inval,
        Deadlock,
        WouldBlock,
        Interrupted,
        TimedOut,
        OwnerDead,
        NotRecoverable,
    }
}

define_error! {
    /// Error type for [`Mutex::unlock`].
    pub enum UnlockMutexError {
        /// The caller does not own the mutex, or the call was made from an
        /// interrupt handler.
        Perm,
    }
}

define_error! {
    /// Error type for [`Mutex::consistent`].
    pub enum MarkConsistentMutexError {
        Perm,
        /// The mutex is not robust or does not protect an inconsistent
        /// state.
        Inval,
    }
}

define_error! {
    /// Error type for [`Mutex::set_prio_ceiling`].
    pub enum SetMutexCeilingError {
        Perm,
        Inval,
    }
}

define_error! {
    /// Error type for [`Mutex::reset`].
    pub enum ResetMutexError {
        Perm,
    }
}

/// The outcome of a non-blocking lock attempt.
enum LockCore {
    /// The caller received the ownership. `owner_died` tells whether the
    /// previous owner abandoned the mutex.
    Acquired { owner_died: bool },
    /// A recursive relock; the count was incremented.
    Recursed,
    /// The caller must block.
    Block,
}

enum LockCoreError {
    Inval,
    Deadlock,
    /// Recursion counter exhausted.
    Again,
    NotRecoverable,
}

/// The combined failure modes of a full (possibly blocking) lock
/// operation, before translation into an operation-specific error type.
pub(super) enum InnerLockError {
    Inval,
    Deadlock,
    Again,
    NotRecoverable,
    Wait(WaitError),
}

impl<System: Kernel> Mutex<System> {
    /// Lock the mutex, blocking the calling thread until it is able to do
    /// so.
    ///
    /// An abandoned robust mutex can still be locked; the method then
    /// returns `Err(OwnerDead)` **with the caller owning the mutex**.
    pub fn lock(&'static self) -> Result<(), LockMutexError> {
        expect_waitable_context::<System>().map_err(|PermError::Perm| LockMutexError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| LockMutexError::Perm)?;
        let cur = System::state().running_thread().unwrap();

        match self.lock_full(lock.borrow_mut(), cur, None) {
            Ok(false) => Ok(()),
            Ok(true) => Err(LockMutexError::OwnerDead),
            Err(e) => Err(match e {
                InnerLockError::Inval => LockMutexError::Inval,
                InnerLockError::Deadlock => LockMutexError::Deadlock,
                InnerLockError::Again => LockMutexError::WouldBlock,
                InnerLockError::NotRecoverable => LockMutexError::NotRecoverable,
                InnerLockError::Wait(WaitError::Interrupted) => LockMutexError::Interrupted,
                InnerLockError::Wait(WaitError::NotRecoverable) => {
                    LockMutexError::NotRecoverable
                }
                InnerLockError::Wait(_) => unreachable!(),
            }),
        }
    }

    /// [`lock`](Self::lock) with a timeout, in ticks.
    pub fn timed_lock(&'static self, ticks: TickDelta) -> Result<(), TimedLockMutexError> {
        expect_waitable_context::<System>()
            .map_err(|PermError::Perm| TimedLockMutexError::Perm)?;
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| TimedLockMutexError::Perm)?;
        let cur = System::state().running_thread().unwrap();

        match self.lock_full(lock.borrow_mut(), cur, Some(ticks)) {
            Ok(false) => Ok(()),
            Ok(true) => Err(TimedLockMutexError::OwnerDead),
            Err(e) => Err(match e {
                InnerLockError::Inval => TimedLockMutexError::Inval,
                InnerLockError::Deadlock => TimedLockMutexError::Deadlock,
                InnerLockError::Again => TimedLockMutexError::WouldBlock,
                InnerLockError::NotRecoverable => TimedLockMutexError::NotRecoverable,
                InnerLockError::Wait(WaitError::Interrupted) => TimedLockMutexError::Interrupted,
                InnerLockError::Wait(WaitError::TimedOut) => TimedLockMutexError::TimedOut,
                InnerLockError::Wait(WaitError::NotRecoverable) => {
                    TimedLockMutexError::NotRecoverable
                }
                InnerLockError::Wait(WaitError::OwnerDead) => unreachable!(),
            }),
        }
    }

    /// Non-blocking version of [`lock`](Self::lock). Returns
    /// `Err(WouldBlock)` when the mutex is held by another thread.
    ///
    /// A mutex lock needs an owning thread, so unlike the semaphore
    /// services this one is disallowed in a handler context.
    pub fn try_lock(&'static self) -> Result<(), TryLockMutexError> {
        expect_thread_context::<System>().map_err(|PermError::Perm| TryLockMutexError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| TryLockMutexError::Perm)?;
        let cur = System::state().running_thread().unwrap();

        match self.lock_core(lock.borrow_mut(), cur) {
            Ok(LockCore::Acquired { owner_died: false }) | Ok(LockCore::Recursed) => Ok(()),
            Ok(LockCore::Acquired { owner_died: true }) => Err(TryLockMutexError::OwnerDead),
            Ok(LockCore::Block) => Err(TryLockMutexError::WouldBlock),
            Err(e) => Err(match e {
                LockCoreError::Inval => TryLockMutexError::Inval,
                LockCoreError::Deadlock => TryLockMutexError::Deadlock,
                LockCoreError::Again => TryLockMutexError::WouldBlock,
                LockCoreError::NotRecoverable => TryLockMutexError::NotRecoverable,
            }),
        }
    }

    /// Unlock the mutex.
    ///
    /// On the final unlock the ownership is handed to the
    /// highest-priority, longest-waiting thread, and the caller's
    /// effective priority is restored.
    pub fn unlock(&'static self) -> Result<(), UnlockMutexError> {
        expect_thread_context::<System>().map_err(|PermError::Perm| UnlockMutexError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| UnlockMutexError::Perm)?;
        let cur = System::state().running_thread().unwrap();

        match self.owner.get(&*lock) {
            Some(owner) if ptr::eq(owner, cur) => {}
            _ => return Err(UnlockMutexError::Perm),
        }

        let count = self.count.get(&*lock);
        if count > 1 {
            self.count.replace(&mut *lock, count - 1);
            return Ok(());
        }

        self.release(lock.borrow_mut(), cur);
        thread::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get the mutex's priority ceiling.
    pub fn prio_ceiling(&'static self) -> Priority {
        match lock_cpu::<System>() {
            Ok(lock) => self.ceiling.get(&*lock),
            Err(PermError::Perm) => priority::NONE,
        }
    }

    /// Change the mutex's priority ceiling, returning the previous one.
    pub fn set_prio_ceiling(
        &'static self,
        ceiling: Priority,
    ) -> Result<Priority, SetMutexCeilingError> {
        expect_thread_context::<System>()
            .map_err(|PermError::Perm| SetMutexCeilingError::Perm)?;
        if ceiling < priority::LOWEST || ceiling > priority::highest::<System>() {
            return Err(SetMutexCeilingError::Inval);
        }
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| SetMutexCeilingError::Perm)?;
        Ok(self.ceiling.replace(&mut *lock, ceiling))
    }

    /// Mark the state protected by the mutex as consistent again after the
    /// previous owner terminated while holding the lock.
    ///
    /// The caller must be the thread that acquired the mutex with
    /// `Err(OwnerDead)`.
    pub fn consistent(&'static self) -> Result<(), MarkConsistentMutexError> {
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| MarkConsistentMutexError::Perm)?;
        if self.robustness != MutexRobustness::Robust || !self.owner_died.get(&*lock) {
            return Err(MarkConsistentMutexError::Inval);
        }
        match (System::state().running_thread(), self.owner.get(&*lock)) {
            (Some(cur), Some(owner)) if ptr::eq(cur, owner) => {}
            _ => return Err(MarkConsistentMutexError::Perm),
        }
        self.owner_died.replace(&mut *lock, false);
        Ok(())
    }

    /// Get the owner thread, or `None` if the mutex is not locked.
    pub fn owner(&'static self) -> Option<&'static Thread<System>> {
        match lock_cpu::<System>() {
            Ok(lock) => self.owner.get(&*lock),
            Err(PermError::Perm) => None,
        }
    }

    /// Get a flag indicating whether the mutex is currently locked.
    pub fn is_locked(&'static self) -> bool {
        self.owner().is_some()
    }

    /// Get the current lock count.
    pub fn count(&'static self) -> MutexCount {
        match lock_cpu::<System>() {
            Ok(lock) => self.count.get(&*lock),
            Err(PermError::Perm) => 0,
        }
    }

    /// Forcibly reinitialise the mutex: the ownership is revoked, the
    /// robustness flags are cleared, and every blocked thread is woken
    /// with [`Interrupted`](super::ResultCode::Interrupted).
    pub fn reset(&'static self) -> Result<(), ResetMutexError> {
        expect_thread_context::<System>().map_err(|PermError::Perm| ResetMutexError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| ResetMutexError::Perm)?;

        if let Some(owner) = self.owner.replace(&mut *lock, None) {
            owned_list_accessor!(owner, lock.borrow_mut()).remove(Ident(self));
            self.count.replace(&mut *lock, 0);
            recompute_effective_priority(lock.borrow_mut(), owner);
        }
        self.owner_died.replace(&mut *lock, false);
        self.unrecoverable.replace(&mut *lock, false);
        self.wait_queue
            .wake_up_all_result(lock.borrow_mut(), Err(WaitError::Interrupted));

        thread::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// The non-blocking part of the lock services.
    fn lock_core(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        cur: &'static Thread<System>,
    ) -> Result<LockCore, LockCoreError> {
        if self.unrecoverable.get(&**lock) {
            return Err(LockCoreError::NotRecoverable);
        }

        if self.protocol == MutexProtocol::Protect {
            let ceiling = self.ceiling.get(&**lock);
            if ceiling < priority::LOWEST || ceiling > priority::highest::<System>() {
                return Err(LockCoreError::Inval);
            }
            if cur.base_priority.get(&**lock) > ceiling {
                return Err(LockCoreError::Inval);
            }
        }

        match self.owner.get(&**lock) {
            None => {
                self.owner.replace(&mut **lock, Some(cur));
                self.count.replace(&mut **lock, 1);
                owned_list_accessor!(cur, lock.borrow_mut()).push_back(Ident(self));
                if self.protocol == MutexProtocol::Protect {
                    recompute_effective_priority(lock.borrow_mut(), cur);
                }
                Ok(LockCore::Acquired {
                    owner_died: self.owner_died.get(&**lock),
                })
            }
            Some(owner) if ptr::eq(owner, cur) => match self.mutex_type {
                MutexType::Recursive => {
                    let count = self.count.get(&**lock);
                    if count == MutexCount::MAX {
                        Err(LockCoreError::Again)
                    } else {
                        self.count.replace(&mut **lock, count + 1);
                        Ok(LockCore::Recursed)
                    }
                }
                MutexType::ErrorCheck => Err(LockCoreError::Deadlock),
                // Self-deadlock by blocking
                MutexType::Normal => Ok(LockCore::Block),
            },
            Some(_) => Ok(LockCore::Block),
        }
    }

    /// The full lock operation: try to acquire, block (with an optional
    /// timeout) when contended, boosting the owner chain when the protocol
    /// asks for it. Returns `Ok(owner_died)` once the caller owns the
    /// mutex.
    ///
    /// Shared with the condition variable, which re-locks the associated
    /// mutex while already inside the kernel critical section.
    pub(super) fn lock_full(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        cur: &'static Thread<System>,
        ticks: Option<TickDelta>,
    ) -> Result<bool, InnerLockError> {
        match self.lock_core(lock.borrow_mut(), cur) {
            Ok(LockCore::Acquired { owner_died }) => return Ok(owner_died),
            Ok(LockCore::Recursed) => return Ok(false),
            Ok(LockCore::Block) => {}
            Err(e) => {
                return Err(match e {
                    LockCoreError::Inval => InnerLockError::Inval,
                    LockCoreError::Deadlock => InnerLockError::Deadlock,
                    LockCoreError::Again => InnerLockError::Again,
                    LockCoreError::NotRecoverable => InnerLockError::NotRecoverable,
                })
            }
        }

        if self.protocol == MutexProtocol::Inherit {
            let waiter_pri = cur.effective_priority.get(&**lock);
            boost_owner_chain(lock.borrow_mut(), self, waiter_pri);
        }

        let result = match ticks {
            None => self
                .wait_queue
                .wait(lock.borrow_mut(), WaitPayload::Mutex(self)),
            Some(ticks) => {
                let at = System::state()
                    .sysclock
                    .count
                    .get(&**lock)
                    .wrapping_add(ticks as u64);
                self.wait_queue
                    .wait_timeout(lock.borrow_mut(), WaitPayload::Mutex(self), at)
            }
        };

        match result {
            // The unlocker handed us the ownership
            Ok(_) => Ok(false),
            // Ditto, but the previous owner died holding the lock
            Err(WaitError::OwnerDead) => Ok(true),
            Err(e) => {
                // The wait ended without an ownership transfer; the boost
                // the caller may have applied to the owner must be
                // re-derived from the remaining waiters
                if self.protocol == MutexProtocol::Inherit {
                    if let Some(owner) = self.owner.get(&**lock) {
                        recompute_effective_priority(lock.borrow_mut(), owner);
                    }
                }
                Err(InnerLockError::Wait(e))
            }
        }
    }

    /// Release the mutex on behalf of a condition-variable wait. Returns
    /// `false` (doing nothing) unless `cur` owns the mutex with a lock
    /// count of exactly one.
    pub(super) fn condvar_release(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        cur: &'static Thread<System>,
    ) -> bool {
        match self.owner.get(&**lock) {
            Some(owner) if ptr::eq(owner, cur) => {}
            _ => return false,
        }
        if self.count.get(&**lock) != 1 {
            return false;
        }
        self.release(lock.borrow_mut(), cur);
        true
    }

    /// Release the mutex held by `owner_thread` (count already at its
    /// final decrement), handing the ownership to the next waiter.
    fn release(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        owner_thread: &'static Thread<System>,
    ) {
        owned_list_accessor!(owner_thread, lock.borrow_mut()).remove(Ident(self));

        if self.owner_died.get(&**lock) {
            // Unlocked while inconsistent: the protected state can no
            // longer be trusted by anyone
            self.owner_died.replace(&mut **lock, false);
            self.unrecoverable.replace(&mut **lock, true);
            self.owner.replace(&mut **lock, None);
            self.count.replace(&mut **lock, 0);
            self.wait_queue
                .wake_up_all_result(lock.borrow_mut(), Err(WaitError::NotRecoverable));
        } else {
            self.transfer_to_next_waiter(lock.borrow_mut());
        }

        recompute_effective_priority(lock, owner_thread);
    }

    /// Hand the ownership to the front of the wait queue, or leave the
    /// mutex unlocked when nobody is waiting.
    fn transfer_to_next_waiter(&'static self, mut lock: CpuLockGuardBorrowMut<'_, System>) {
        let result = if self.owner_died.get(&**lock) {
            Err(WaitError::OwnerDead)
        } else {
            Ok(())
        };

        if let Some(next) = self.wait_queue.wake_up_one_result(lock.borrow_mut(), result) {
            self.owner.replace(&mut **lock, Some(next));
            self.count.replace(&mut **lock, 1);
            owned_list_accessor!(next, lock.borrow_mut()).push_back(Ident(self));
            if self.protocol != MutexProtocol::None {
                // `Protect`: assume the ceiling; `Inherit`: inherit from
                // the remaining waiters
                recompute_effective_priority(lock, next);
            }
        } else {
            self.owner.replace(&mut **lock, None);
            self.count.replace(&mut **lock, 0);
        }
    }
}

/// Walk the chain of owners blocking `waiter_pri` and raise their
/// effective priorities, transitively through any `Inherit` mutex an owner
/// is itself blocked on. Wait-queue positions are never changed.
fn boost_owner_chain<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    mutex: &'static Mutex<System>,
    waiter_pri: Priority,
) {
    let mut mutex = mutex;
    loop {
        if mutex.protocol != MutexProtocol::Inherit {
            break;
        }
        let owner = match mutex.owner.get(&**lock) {
            Some(owner) => owner,
            None => break,
        };
        if owner.effective_priority.get(&**lock) >= waiter_pri {
            break;
        }
        thread::set_effective_priority(lock.borrow_mut(), owner, waiter_pri);

        if owner.st.get(&**lock) != ThreadState::Waiting {
            break;
        }
        let next = wait::with_current_wait_payload(lock.borrow_mut(), owner, |p| match p {
            Some(WaitPayload::Mutex(m)) => Some(*m),
            _ => None,
        });
        match next {
            Some(m) => mutex = m,
            None => break,
        }
    }
}

/// Re-derive a thread's effective priority from its base priority and the
/// mutexes it owns: the ceiling of every owned `Protect` mutex and the
/// highest waiter priority of every owned `Inherit` mutex.
pub(super) fn recompute_effective_priority<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    thread_cb: &'static Thread<System>,
) {
    let mut new_pri = thread_cb.base_priority.get(&**lock);

    let mut cursor = thread_cb.owned_mutexes.read(&**lock).first;
    while let Some(Ident(m)) = cursor {
        match m.protocol {
            MutexProtocol::Protect => {
                new_pri = new_pri.max(m.ceiling.get(&**lock));
            }
            MutexProtocol::Inherit => {
                if let Some(waiter) = m.wait_queue.first_waiter_thread(lock.borrow_mut()) {
                    new_pri = new_pri.max(waiter.effective_priority.get(&**lock));
                }
            }
            MutexProtocol::None => {}
        }
        cursor = m.owner_link.get(&**lock).unwrap().next;
    }

    thread::set_effective_priority(lock, thread_cb, new_pri);
}

/// Called on thread termination: abandon every mutex the thread still
/// holds. Robust mutexes are handed to their next waiter (or left free)
/// with the inconsistency flag raised; stalled mutexes stay locked by the
/// dead thread, per POSIX.
pub(super) fn abandon_held_mutexes<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    thread_cb: &'static Thread<System>,
) {
    loop {
        // Only robust mutexes leave the list; remember where to continue
        let mut cursor = thread_cb.owned_mutexes.read(&**lock).first;
        let mutex = loop {
            match cursor {
                Some(Ident(m)) if m.robustness == MutexRobustness::Robust => break Some(m),
                Some(Ident(m)) => cursor = m.owner_link.get(&**lock).unwrap().next,
                None => break None,
            }
        };
        let mutex = match mutex {
            Some(m) => m,
            None => break,
        };

        owned_list_accessor!(thread_cb, lock.borrow_mut()).remove(Ident(mutex));
        mutex.owner.replace(&mut **lock, None);
        mutex.count.replace(&mut **lock, 0);
        mutex.owner_died.replace(&mut **lock, true);
        mutex.transfer_to_next_waiter(lock.borrow_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::super::{sim, Thread, ThreadAttr};
    use super::*;

    fn noop(_: usize) -> usize {
        0
    }

    #[test]
    fn recursive_lock_count_sequence() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static MX: Mutex<S> = Mutex::new(MutexAttr::recursive());
        sim::boot::<S>(&MAIN, &IDLE);

        assert!(!MX.is_locked());
        assert_eq!(MX.count(), 0);

        MX.lock().unwrap();
        assert_eq!(MX.count(), 1);
        MX.lock().unwrap();
        assert_eq!(MX.count(), 2);
        MX.lock().unwrap();
        assert_eq!(MX.count(), 3);
        assert!(core::ptr::eq(MX.owner().unwrap(), &MAIN));

        MX.unlock().unwrap();
        assert_eq!(MX.count(), 2);
        MX.unlock().unwrap();
        assert_eq!(MX.count(), 1);
        assert!(MX.owner().is_some());
        MX.unlock().unwrap();
        assert_eq!(MX.count(), 0);
        assert!(MX.owner().is_none());

        // One unlock too many
        assert_eq!(MX.unlock(), Err(UnlockMutexError::Perm));
    }

    #[test]
    fn errorcheck_relock_deadlocks() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static MX: Mutex<S> =
            Mutex::new(MutexAttr::new().mutex_type(MutexType::ErrorCheck));
        sim::boot::<S>(&MAIN, &IDLE);

        MX.lock().unwrap();
        assert_eq!(MX.lock(), Err(LockMutexError::Deadlock));
        assert_eq!(MX.try_lock(), Err(TryLockMutexError::Deadlock));
        MX.unlock().unwrap();
    }

    #[test]
    fn normal_relock_blocks() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static MX: Mutex<S> = Mutex::new(MutexAttr::new());
        sim::boot::<S>(&MAIN, &IDLE);

        MX.lock().unwrap();
        // A `normal` mutex self-blocks; the non-blocking probe reports it
        assert_eq!(MX.try_lock(), Err(TryLockMutexError::WouldBlock));
        MX.unlock().unwrap();
    }

    #[test]
    fn lock_unlock_is_effect_free() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static MX: Mutex<S> = Mutex::new(MutexAttr::new());
        sim::boot::<S>(&MAIN, &IDLE);

        let prio_before = MAIN.sched_prio();
        MX.lock().unwrap();
        MX.unlock().unwrap();
        assert_eq!(MX.count(), 0);
        assert!(MX.owner().is_none());
        assert_eq!(MAIN.sched_prio(), prio_before);
        {
            let lock = lock_cpu::<S>().unwrap();
            assert_eq!(
                MAIN.effective_priority.get(&*lock),
                MAIN.base_priority.get(&*lock)
            );
        }
    }

    #[test]
    fn ceiling_boosts_owner() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let mx: &'static Mutex<S> = std::boxed::Box::leak(std::boxed::Box::new(Mutex::new(
            MutexAttr::new()
                .protocol(MutexProtocol::Protect)
                .priority_ceiling(priority::high::<S>()),
        )));

        mx.lock().unwrap();
        {
            let lock = lock_cpu::<S>().unwrap();
            assert_eq!(MAIN.effective_priority.get(&*lock), priority::high::<S>());
            assert_eq!(MAIN.base_priority.get(&*lock), priority::normal::<S>());
        }
        mx.unlock().unwrap();
        {
            let lock = lock_cpu::<S>().unwrap();
            assert_eq!(MAIN.effective_priority.get(&*lock), priority::normal::<S>());
        }
    }

    #[test]
    fn ceiling_below_caller_rejected() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let mx: &'static Mutex<S> = std::boxed::Box::leak(std::boxed::Box::new(Mutex::new(
            MutexAttr::new()
                .protocol(MutexProtocol::Protect)
                .priority_ceiling(priority::LOWEST),
        )));
        // The caller's priority exceeds the ceiling
        assert_eq!(mx.lock(), Err(LockMutexError::Inval));

        // A `Protect` mutex without a ceiling is unusable
        static NO_CEILING: Mutex<S> =
            Mutex::new(MutexAttr::new().protocol(MutexProtocol::Protect));
        assert_eq!(NO_CEILING.lock(), Err(LockMutexError::Inval));
    }

    #[test]
    fn inheritance_boost_and_restore() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static MX: Mutex<S> = Mutex::new(MutexAttr::new().protocol(MutexProtocol::Inherit));
        sim::boot::<S>(&MAIN, &IDLE);

        MX.lock().unwrap();

        // A high-priority thread arrives at the lock
        {
            let mut lock = lock_cpu::<S>().unwrap();
            boost_owner_chain(lock.borrow_mut(), &MX, 12);
            assert_eq!(MAIN.effective_priority.get(&*lock), 12);
            assert_eq!(MAIN.base_priority.get(&*lock), priority::normal::<S>());
        }

        // With no waiters left, the unlock restores the base priority
        MX.unlock().unwrap();
        {
            let lock = lock_cpu::<S>().unwrap();
            assert_eq!(MAIN.effective_priority.get(&*lock), priority::normal::<S>());
        }
    }

    #[test]
    fn robust_owner_death_and_recovery() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static MX: Mutex<S> =
            Mutex::new(MutexAttr::new().robustness(MutexRobustness::Robust));
        sim::boot::<S>(&MAIN, &IDLE);

        // The owner terminates while holding the lock
        MX.lock().unwrap();
        {
            let mut lock = lock_cpu::<S>().unwrap();
            abandon_held_mutexes(lock.borrow_mut(), &MAIN);
        }
        assert!(MX.owner().is_none());

        // The next acquirer is handed the lock and told to repair
        assert_eq!(MX.lock(), Err(LockMutexError::OwnerDead));
        assert!(core::ptr::eq(MX.owner().unwrap(), &MAIN));

        // Repair, release, and the mutex is ordinary again
        MX.consistent().unwrap();
        MX.unlock().unwrap();
        assert_eq!(MX.lock(), Ok(()));
        MX.unlock().unwrap();
    }

    #[test]
    fn robust_unlock_without_repair_is_fatal() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static MX: Mutex<S> =
            Mutex::new(MutexAttr::new().robustness(MutexRobustness::Robust));
        sim::boot::<S>(&MAIN, &IDLE);

        MX.lock().unwrap();
        {
            let mut lock = lock_cpu::<S>().unwrap();
            abandon_held_mutexes(lock.borrow_mut(), &MAIN);
        }
        assert_eq!(MX.lock(), Err(LockMutexError::OwnerDead));

        // Unlocking without `consistent` abandons the state for good
        MX.unlock().unwrap();
        assert_eq!(MX.lock(), Err(LockMutexError::NotRecoverable));
        assert_eq!(MX.try_lock(), Err(TryLockMutexError::NotRecoverable));
    }

    #[test]
    fn consistent_validates() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static PLAIN: Mutex<S> = Mutex::new(MutexAttr::new());
        static ROBUST: Mutex<S> =
            Mutex::new(MutexAttr::new().robustness(MutexRobustness::Robust));
        sim::boot::<S>(&MAIN, &IDLE);

        // Not robust
        assert_eq!(PLAIN.consistent(), Err(MarkConsistentMutexError::Inval));
        // Robust but not inconsistent
        assert_eq!(ROBUST.consistent(), Err(MarkConsistentMutexError::Inval));
    }

    #[test]
    fn timed_lock_uncontended() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static MX: Mutex<S> = Mutex::new(MutexAttr::new());
        sim::boot::<S>(&MAIN, &IDLE);

        assert_eq!(MX.timed_lock(10), Ok(()));
        MX.unlock().unwrap();
    }

    #[test]
    fn lock_rejected_in_handler_mode() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static MX: Mutex<S> = Mutex::new(MutexAttr::new());
        sim::boot::<S>(&MAIN, &IDLE);

        sim::with_handler_mode::<S>(|| {
            assert_eq!(MX.lock(), Err(LockMutexError::Perm));
            assert_eq!(MX.try_lock(), Err(TryLockMutexError::Perm));
            assert_eq!(MX.unlock(), Err(UnlockMutexError::Perm));
        });
    }

    #[test]
    fn set_prio_ceiling() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let mx: &'static Mutex<S> = std::boxed::Box::leak(std::boxed::Box::new(Mutex::new(
            MutexAttr::new()
                .protocol(MutexProtocol::Protect)
                .priority_ceiling(priority::high::<S>()),
        )));
        assert_eq!(mx.prio_ceiling(), priority::high::<S>());
        assert_eq!(
            mx.set_prio_ceiling(priority::realtime::<S>()),
            Ok(priority::high::<S>())
        );
        assert_eq!(mx.prio_ceiling(), priority::realtime::<S>());
        assert_eq!(
            mx.set_prio_ceiling(priority::NONE),
            Err(SetMutexCeilingError::Inval)
        );
    }

    #[test]
    fn reset_revokes_ownership() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static MX: Mutex<S> = Mutex::new(MutexAttr::recursive());
        sim::boot::<S>(&MAIN, &IDLE);

        MX.lock().unwrap();
        MX.lock().unwrap();
        MX.reset().unwrap();
        assert!(MX.owner().is_none());
        assert_eq!(MX.count(), 0);
        assert_eq!(MX.lock(), Ok(()));
        MX.unlock().unwrap();
    }
}
