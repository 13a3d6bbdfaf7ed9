//! Wait lists: the blocking-primitive pattern shared by every waitable
//! object.
//!
//! A blocking service creates a [`Wait`] descriptor *on the waiting
//! thread's stack*, links it into the object's [`WaitQueue`], and parks the
//! thread. A wake-upper (an event arrival, the tick engine, or an explicit
//! interruption) unlinks the descriptor, records the wake reason in the
//! thread's [`ThreadWait`] state, and makes the thread Ready again. Because
//! the descriptor only lives for the duration of the blocking call, no
//! allocation is ever needed.
use core::{fmt, ops, pin::Pin, ptr::NonNull, sync::atomic::AtomicU32};

use super::{
    clock::Tick,
    error::WaitError,
    mutex, thread,
    thread::{Thread, ThreadState},
    timeout,
    timeout::{Timeout, TimeoutQueue},
    utils::{CpuLockCell, CpuLockGuardBorrowMut},
    FlagsMask, FlagsMode, Kernel, KernelCfg,
};
use crate::utils::{
    intrusive_list::{self, ListAccessorCell, ListHead},
    Init,
};

// Type definitions and trait implementations for wait lists
// ---------------------------------------------------------------------------

/// A reference to a [`Wait`].
pub(super) struct WaitRef<System: KernelCfg>(NonNull<Wait<System>>);

// Safety: `Wait` is `Send + Sync`
unsafe impl<System: KernelCfg> Send for WaitRef<System> {}
unsafe impl<System: KernelCfg> Sync for WaitRef<System> {}

impl<System: KernelCfg> Clone for WaitRef<System> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<System: KernelCfg> Copy for WaitRef<System> {}

impl<System: KernelCfg> fmt::Debug for WaitRef<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl<System: KernelCfg> PartialEq for WaitRef<System> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<System: KernelCfg> Eq for WaitRef<System> {}

/// A virtual "pool" dereferencing raw element references. Lets
/// [`ListAccessorCell`] traverse lists whose elements live on various
/// threads' stacks.
pub(in crate::kernel) struct UnsafeStatic {
    _nonexhaustive: (),
}

impl UnsafeStatic {
    /// Construct an `UnsafeStatic`.
    ///
    /// # Safety
    ///
    /// All pointees to be accessed through the constructed `UnsafeStatic`
    /// must be valid.
    pub(in crate::kernel) const unsafe fn new() -> &'static Self {
        &Self { _nonexhaustive: () }
    }
}

impl<System: KernelCfg> ops::Index<WaitRef<System>> for UnsafeStatic {
    type Output = Wait<System>;

    fn index(&self, index: WaitRef<System>) -> &Self::Output {
        // Safety: per the `UnsafeStatic::new` contract, the pointee is valid
        unsafe { &*index.0.as_ptr() }
    }
}

/// Get a `ListAccessorCell` used to access a wait queue.
///
/// # Safety
///
/// All elements of `$list` must be extant.
macro_rules! wait_queue_accessor {
    ($list:expr, $key:expr) => {
        ListAccessorCell::new(
            $list,
            UnsafeStatic::new(),
            |wait: &Wait<_>| &wait.link,
            $key,
        )
    };
}

// ---------------------------------------------------------------------------

/// A wait object describing *which thread* is waiting on *what condition*.
///
/// # Lifetime
///
/// Constructed by a blocking service on the waiting thread's stack and only
/// survives until that service returns, so a `Wait` can expire only when
/// the thread is not waiting anymore. [`abandon_wait`] unlinks it when the
/// thread is killed mid-wait.
pub(super) struct Wait<System: KernelCfg> {
    /// The thread that is waiting for something.
    thread: &'static Thread<System>,

    /// Forms a linked list headed by `WaitQueue::waits`.
    link: CpuLockCell<System, Option<intrusive_list::Link<WaitRef<System>>>>,

    /// The containing [`WaitQueue`], if any.
    wait_queue: Option<&'static WaitQueue<System>>,

    payload: WaitPayload<System>,
}

/// Condition-specific state attached to a [`Wait`]. The wake-upper uses it
/// to evaluate wake conditions and to hand results to the waiter.
pub(super) enum WaitPayload<System: KernelCfg> {
    /// A plain suspension ([`this_thread::wait`], the clock sleeps).
    /// [`Thread::wakeup`] resumes it normally.
    ///
    /// [`this_thread::wait`]: super::thread::this_thread::wait
    Park,
    /// Waiting for another thread's termination.
    Join,
    /// Waiting for a semaphore token. The poster hands the token directly
    /// to the waiter.
    Semaphore,
    /// Waiting for the ownership of a mutex. Used to follow priority
    /// inheritance chains.
    Mutex(&'static mutex::Mutex<System>),
    /// Waiting on a condition variable.
    CondVar,
    /// Waiting for event-flag bits. The raiser evaluates the predicate and
    /// stores the observed word into `orig`.
    EventFlags {
        bits: FlagsMask,
        mode: FlagsMode,
        orig: AtomicU32,
    },
    /// Waiting for thread signal flags; like `EventFlags` but on the
    /// thread's private word.
    SigFlags {
        mask: FlagsMask,
        mode: FlagsMode,
        orig: AtomicU32,
    },
    /// Waiting for a free block in a memory pool. The waiter re-polls.
    MemPool,
    /// Waiting for queue space in a message queue. The waiter re-polls.
    MQueueSend,
    /// Waiting for a message in a message queue. The waiter re-polls.
    MQueueRecv,
}

/// A queue of wait objects ([`Wait`]) waiting on a particular waitable
/// object.
pub(super) struct WaitQueue<System: KernelCfg> {
    /// Wait objects waiting on the object associated with this queue. The
    /// waiting threads (`Wait::thread`) must be in the Waiting state.
    ///
    /// All elements of this linked list must be valid.
    waits: CpuLockCell<System, ListHead<WaitRef<System>>>,

    order: QueueOrder,
}

impl<System: KernelCfg> Init for WaitQueue<System> {
    const INIT: Self = Self::new(QueueOrder::Fifo);
}

/// Specifies the sorting order of a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum QueueOrder {
    /// The wait queue is processed in a FIFO order.
    Fifo,
    /// The wait queue is processed in a thread priority order; threads of
    /// the same priority follow a FIFO order.
    ThreadPriority,
}

/// The wait state of a thread.
pub(super) struct ThreadWait<System: KernelCfg> {
    /// The wait object describing the ongoing Waiting state of the thread.
    /// `None` iff the thread is not in the Waiting state.
    ///
    /// The pointee must be valid.
    current_wait: CpuLockCell<System, Option<WaitRef<System>>>,

    /// The timeout registered by the ongoing timed wait, if any. Tracked
    /// so that killing the thread can unlink the timeout node from the
    /// deadline queue.
    current_timeout: CpuLockCell<System, Option<timeout::TimeoutRef<System>>>,

    /// The result of the last wait operation, set by the wake-upper.
    wait_result: CpuLockCell<System, Result<(), WaitError>>,
}

impl<System: KernelCfg> Init for ThreadWait<System> {
    const INIT: Self = Self {
        current_wait: Init::INIT,
        current_timeout: Init::INIT,
        wait_result: CpuLockCell::new(Ok(())),
    };
}

impl<System: KernelCfg> WaitQueue<System> {
    pub(super) const fn new(order: QueueOrder) -> Self {
        Self {
            waits: CpuLockCell::new(ListHead::new()),
            order,
        }
    }
}

/// Observe and consume a pending cancellation request on the current
/// thread. Every blocking service calls this before parking.
fn take_cancellation<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
) -> Result<(), WaitError> {
    let thread = System::state().running_thread().unwrap();
    if thread.cancel_pending.replace(&mut **lock, false) {
        Err(WaitError::Interrupted)
    } else {
        Ok(())
    }
}

impl<System: Kernel> WaitQueue<System> {
    /// Is the queue empty?
    pub(super) fn is_empty(&self, lock: CpuLockGuardBorrowMut<'_, System>) -> bool {
        self.waits.read(&**lock).is_empty()
    }

    /// The thread at the front of the queue (the next to be woken).
    pub(super) fn first_waiter_thread(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
    ) -> Option<&'static Thread<System>> {
        // Safety: All elements of `self.waits` are extant.
        let front = unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) }.front()?;
        // Safety: `front` is in `self.waits`, so the pointee is valid
        Some(unsafe { front.0.as_ref() }.thread)
    }

    /// Insert a wait object pertaining to the currently running thread into
    /// `self`, transitioning the thread into the Waiting state.
    ///
    /// The current context must be waitable (this method doesn't check
    /// that). The caller should use `expect_waitable_context` to do that.
    #[inline]
    pub(super) fn wait(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        payload: WaitPayload<System>,
    ) -> Result<WaitPayload<System>, WaitError> {
        take_cancellation(lock.borrow_mut())?;
        let wait = Wait {
            thread: System::state().running_thread().unwrap(),
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload,
        };

        self.wait_inner(lock, &wait)?;

        Ok(wait.payload)
    }

    /// [`Self::wait`] with a deadline on the tick clock. A timeout node is
    /// kept on the waiting thread's stack next to the wait object and
    /// registered with the tick engine for the duration of the wait.
    #[inline]
    pub(super) fn wait_timeout(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        payload: WaitPayload<System>,
        at: Tick,
    ) -> Result<WaitPayload<System>, WaitError> {
        take_cancellation(lock.borrow_mut())?;
        let thread = System::state().running_thread().unwrap();
        let wait = Wait {
            thread,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload,
        };

        let timeout = Timeout::new(at, thread);
        // Safety: `timeout` is not moved for the rest of this function
        let timeout = unsafe { Pin::new_unchecked(&timeout) };
        timeout::insert_timeout(
            lock.borrow_mut(),
            &System::state().sysclock.deadlines,
            timeout,
        );

        let result = self.wait_inner(lock.borrow_mut(), &wait);
        timeout::remove_timeout(lock, timeout);

        result.map(|()| wait.payload)
    }

    /// The core portion of `Self::wait`.
    ///
    /// Passing `WaitPayload` by value is expensive, so moving it into and
    /// out of `Wait` is done in the `#[inline]` outer methods.
    fn wait_inner(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        wait: &Wait<System>,
    ) -> Result<(), WaitError> {
        let thread = wait.thread;
        let wait_ref = WaitRef(wait.into());

        debug_assert!(core::ptr::eq(
            wait.thread,
            System::state().running_thread().unwrap()
        ));
        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        // Find the insertion position
        let insert_at = match self.order {
            QueueOrder::Fifo => {
                // FIFO order - insert at the back
                None
            }
            QueueOrder::ThreadPriority => {
                let cur_pri = thread.effective_priority.get(&**lock);
                let mut insert_at = None;
                let mut cursor = self.waits.read(&**lock).last;
                while let Some(c) = cursor {
                    // Safety: `c` is in `self.waits`, so the pointee is valid
                    let c_wait = unsafe { c.0.as_ref() };
                    // Move past waiters of strictly lower priority; stop at
                    // an equal one (FIFO among equals)
                    if c_wait.thread.effective_priority.get(&**lock) < cur_pri {
                        insert_at = Some(c);
                        cursor = c_wait.link.get(&**lock).unwrap().prev;
                    } else {
                        break;
                    }
                }
                insert_at
            }
        };

        // Safety: All elements of `self.waits` are extant.
        let mut accessor = unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) };
        accessor.insert(wait_ref, insert_at);

        // Set `thread.wait.current_wait`
        thread.wait.current_wait.replace(&mut **lock, Some(wait_ref));

        // Transition the thread into Waiting. This statement completes when
        // the thread is woken up.
        thread::wait_until_woken_up(lock.borrow_mut());

        // `wait_ref` should have been removed from the wait queue by a
        // wake-upper by now
        debug_assert!(wait.link.read(&**lock).is_none());
        debug_assert!(thread.wait.current_wait.get(&**lock).is_none());

        thread.wait.wait_result.get(&**lock)
    }

    /// Wake up up to one waiting thread with the given wait result. Returns
    /// the woken thread.
    ///
    /// This method may make a thread Ready but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_one_result(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        result: Result<(), WaitError>,
    ) -> Option<&'static Thread<System>> {
        // Safety: All elements of `self.waits` are extant.
        let wait_ref =
            unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) }.pop_front()?;

        // Safety: `wait_ref` was in `self.waits`, so the pointee is valid
        let wait = unsafe { wait_ref.0.as_ref() };
        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        let thread = wait.thread;
        complete_wait(lock.borrow_mut(), wait, result);
        Some(thread)
    }

    /// Wake up up to one waiting thread. Returns `true` on success.
    pub(super) fn wake_up_one(&self, lock: CpuLockGuardBorrowMut<'_, System>) -> bool {
        self.wake_up_one_result(lock, Ok(())).is_some()
    }

    /// Wake up all waiting threads with the given wait result. Returns
    /// `true` if at least one thread was woken.
    pub(super) fn wake_up_all_result(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        result: Result<(), WaitError>,
    ) -> bool {
        self.wake_up_one_result(lock.borrow_mut(), result).is_some() && {
            while self.wake_up_one_result(lock.borrow_mut(), result).is_some() {}
            true
        }
    }

    /// Wake up all waiting threads normally.
    pub(super) fn wake_up_all(&self, lock: CpuLockGuardBorrowMut<'_, System>) -> bool {
        self.wake_up_all_result(lock, Ok(()))
    }

    /// Conditionally wake up waiting threads, in enqueue order. `cond` may
    /// mutate per-wait state (e.g. store the observed flag word).
    ///
    /// This method may make threads Ready but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_all_conditional(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        mut cond: impl FnMut(&WaitPayload<System>) -> bool,
    ) -> bool {
        let mut woke_up_any = false;

        // Safety: All elements of `self.waits` are extant.
        let mut cur = unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) }.front();

        while let Some(wait_ref) = cur {
            // Find the next wait object before we possibly unlink `wait_ref`
            // Safety: All elements of `self.waits` are extant.
            cur = unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) }.next(wait_ref);

            // Safety: `wait_ref` is in `self.waits`, so the pointee is valid
            let wait = unsafe { wait_ref.0.as_ref() };
            debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

            if !cond(&wait.payload) {
                continue;
            }

            // Safety: All elements of `self.waits` are extant.
            unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) }.remove(wait_ref);
            complete_wait(lock.borrow_mut(), wait, Ok(()));
            woke_up_any = true;
        }

        woke_up_any
    }
}

/// Park the currently running thread without joining any wait queue. The
/// only ways out are [`interrupt_thread`] and [`Thread::wakeup`].
///
/// The current context must be waitable (this function doesn't check that).
#[inline]
pub(super) fn wait_no_queue<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    payload: WaitPayload<System>,
) -> Result<WaitPayload<System>, WaitError> {
    take_cancellation(lock.borrow_mut())?;
    let wait = Wait {
        thread: System::state().running_thread().unwrap(),
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload,
    };

    wait_no_queue_inner(lock, &wait)?;

    Ok(wait.payload)
}

/// [`wait_no_queue`] with a deadline on the specified clock's deadline
/// queue. Implements the clock sleeps.
#[inline]
pub(super) fn wait_no_queue_timeout<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    payload: WaitPayload<System>,
    queue: &'static TimeoutQueue<System>,
    at: Tick,
) -> Result<WaitPayload<System>, WaitError> {
    take_cancellation(lock.borrow_mut())?;
    let thread = System::state().running_thread().unwrap();
    let wait = Wait {
        thread,
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload,
    };

    let timeout = Timeout::new(at, thread);
    // Safety: `timeout` is not moved for the rest of this function
    let timeout = unsafe { Pin::new_unchecked(&timeout) };
    timeout::insert_timeout(lock.borrow_mut(), queue, timeout);

    let result = wait_no_queue_inner(lock.borrow_mut(), &wait);
    timeout::remove_timeout(lock, timeout);

    result.map(|()| wait.payload)
}

/// The core portion of [`wait_no_queue`].
fn wait_no_queue_inner<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    wait: &Wait<System>,
) -> Result<(), WaitError> {
    let thread = wait.thread;
    let wait_ref = WaitRef(wait.into());

    debug_assert!(core::ptr::eq(
        wait.thread,
        System::state().running_thread().unwrap()
    ));
    debug_assert!(wait.wait_queue.is_none());

    thread.wait.current_wait.replace(&mut **lock, Some(wait_ref));

    // Transition the thread into Waiting. This statement completes when
    // the thread is woken up.
    thread::wait_until_woken_up(lock.borrow_mut());

    debug_assert!(thread.wait.current_wait.get(&**lock).is_none());

    thread.wait.wait_result.get(&**lock)
}

/// Call the given closure with a reference to the current wait payload of
/// the specified thread.
///
/// The wait object might get deallocated when the thread resumes; this
/// function provides access while ensuring the reference doesn't escape.
pub(super) fn with_current_wait_payload<System: Kernel, R>(
    lock: CpuLockGuardBorrowMut<'_, System>,
    thread: &Thread<System>,
    f: impl FnOnce(Option<&WaitPayload<System>>) -> R,
) -> R {
    let wait_ref = thread.wait.current_wait.get(&**lock);

    // Safety: `wait_ref`, when present, points to an existing `Wait`
    let payload = wait_ref.map(|r| &unsafe { &*r.0.as_ptr() }.payload);

    f(payload)
}

/// Check whether the thread's last wait ended by timeout.
pub(super) fn last_wake_was_timeout<System: Kernel>(
    lock: &super::utils::CpuLockGuard<System>,
    thread: &Thread<System>,
) -> bool {
    thread.wait.wait_result.get(&**lock) == Err(WaitError::TimedOut)
}

/// Deassociate the specified wait object from its waiting thread
/// (`wait.thread`) and wake the thread up.
///
/// This function doesn't remove `wait` from `WaitQueue::waits`; the caller
/// must have done that already.
fn complete_wait<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    wait: &Wait<System>,
    wait_result: Result<(), WaitError>,
) {
    let thread = wait.thread;

    debug_assert_eq!(
        thread.wait.current_wait.get(&**lock),
        Some(WaitRef(wait.into()))
    );
    thread.wait.current_wait.replace(&mut **lock, None);

    // Unlink any timeout registered for this wait so the deadline queue
    // never references a stack frame that is about to resume
    if let Some(timeout_ref) = thread.wait.current_timeout.get(&**lock) {
        timeout::remove_timeout_ref(lock.borrow_mut(), timeout_ref);
    }

    let _ = thread.wait.wait_result.replace(&mut **lock, wait_result);

    debug_assert_eq!(thread.st.get(&**lock), ThreadState::Waiting);

    // Make the thread Ready. The wait state is fully cleaned up at this
    // point, so the thread is ready to resume from where it blocked.
    thread::make_ready(lock, thread);
}

/// Interrupt any ongoing wait operation of the thread, waking it with the
/// given result. Returns `false` if the thread is not in the Waiting state.
///
/// This function may make the thread Ready but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(super) fn interrupt_thread<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    thread: &'static Thread<System>,
    wait_result: Result<(), WaitError>,
) -> bool {
    if thread.st.get(&**lock) != ThreadState::Waiting {
        return false;
    }

    // The thread is Waiting, so `current_wait` must be `Some(_)`
    let wait_ref = thread.wait.current_wait.get(&**lock).unwrap();

    // Safety: `wait_ref` points to an existing `Wait`
    let wait = unsafe { wait_ref.0.as_ref() };

    // Remove `wait` from the wait queue it belongs to
    if let Some(wait_queue) = wait.wait_queue {
        unsafe { wait_queue_accessor!(&wait_queue.waits, lock.borrow_mut()) }.remove(wait_ref);
    }

    complete_wait(lock.borrow_mut(), wait, wait_result);

    true
}

/// Unlink the wait state of a thread that is being killed mid-wait. Unlike
/// [`interrupt_thread`], the thread is *not* made Ready.
pub(super) fn abandon_wait<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    thread: &'static Thread<System>,
) {
    debug_assert_eq!(thread.st.get(&**lock), ThreadState::Waiting);

    if let Some(wait_ref) = thread.wait.current_wait.replace(&mut **lock, None) {
        // Safety: `wait_ref` points to an existing `Wait`
        let wait = unsafe { wait_ref.0.as_ref() };
        if let Some(wait_queue) = wait.wait_queue {
            unsafe { wait_queue_accessor!(&wait_queue.waits, lock.borrow_mut()) }.remove(wait_ref);
        }
    }

    if let Some(timeout_ref) = thread.wait.current_timeout.get(&**lock) {
        timeout::remove_timeout_ref(lock.borrow_mut(), timeout_ref);
    }
}

/// Record in the thread's wait state that a timeout node was registered
/// (or, with `None`, deregistered) on its behalf.
pub(super) fn set_current_timeout<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    thread: &Thread<System>,
    timeout_ref: Option<timeout::TimeoutRef<System>>,
) {
    thread.wait.current_timeout.replace(&mut **lock, timeout_ref);
}
