//! Timeout nodes and deadline queues (internal use only).
//!
//! A timed blocking service creates a [`Timeout`] node on the waiting
//! thread's stack and registers it with the owning clock's
//! [`TimeoutQueue`], which keeps its nodes sorted by deadline (FIFO among
//! equal deadlines). The tick handler walks the queue head and wakes every
//! waiter whose deadline has passed with
//! [`WaitError::TimedOut`](super::error::WaitError::TimedOut).
//!
//! A node must never outlive its registration: `Timeout` is `!Unpin` and
//! its destructor panics if the node is still linked. The registration is
//! removed by the waking paths (`complete_wait`, `abandon_wait`) and,
//! idempotently, by the blocking service before it returns.
use core::{
    fmt,
    marker::PhantomPinned,
    ops,
    pin::Pin,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use super::{
    clock::Tick,
    error::WaitError,
    thread::Thread,
    utils::{CpuLockCell, CpuLockGuardBorrowMut},
    wait::{self, UnsafeStatic},
    Kernel, KernelCfg,
};
use crate::utils::{
    intrusive_list::{self, ListAccessorCell, ListHead},
    Init,
};

/// A deadline registration for one thread.
pub(super) struct Timeout<System: KernelCfg> {
    /// The absolute deadline, in the owning clock's ticks.
    at: Tick,

    /// The thread to wake when the deadline passes.
    thread: &'static Thread<System>,

    /// The queue this node is currently linked into, if any.
    queue: CpuLockCell<System, Option<&'static TimeoutQueue<System>>>,

    /// Forms a linked list headed by `TimeoutQueue::head`.
    link: CpuLockCell<System, Option<intrusive_list::Link<TimeoutRef<System>>>>,

    /// Mirrors `link.is_some()`, readable without the CPU Lock. Checked by
    /// the destructor.
    linked: AtomicBool,

    _pin: PhantomPinned,
}

impl<System: KernelCfg> Timeout<System> {
    pub(super) fn new(at: Tick, thread: &'static Thread<System>) -> Self {
        Self {
            at,
            thread,
            queue: CpuLockCell::new(None),
            link: CpuLockCell::new(None),
            linked: AtomicBool::new(false),
            _pin: PhantomPinned,
        }
    }
}

impl<System: KernelCfg> Drop for Timeout<System> {
    #[inline]
    fn drop(&mut self) {
        if self.linked.load(Ordering::Relaxed) {
            // The node is still in a deadline queue. Dropping it now would
            // leave the queue referencing freed stack memory. The owner of
            // the `Timeout` is responsible for unregistering it first.
            panic!("timeout is still linked");
        }
    }
}

/// A reference to a [`Timeout`].
pub(super) struct TimeoutRef<System: KernelCfg>(NonNull<Timeout<System>>);

// Safety: `Timeout` is `Send + Sync`
unsafe impl<System: KernelCfg> Send for TimeoutRef<System> {}
unsafe impl<System: KernelCfg> Sync for TimeoutRef<System> {}

impl<System: KernelCfg> Clone for TimeoutRef<System> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<System: KernelCfg> Copy for TimeoutRef<System> {}

impl<System: KernelCfg> fmt::Debug for TimeoutRef<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TimeoutRef").field(&self.0).finish()
    }
}

impl<System: KernelCfg> PartialEq for TimeoutRef<System> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<System: KernelCfg> Eq for TimeoutRef<System> {}

impl<System: KernelCfg> ops::Index<TimeoutRef<System>> for UnsafeStatic {
    type Output = Timeout<System>;

    fn index(&self, index: TimeoutRef<System>) -> &Self::Output {
        // Safety: per the `UnsafeStatic::new` contract, the pointee is valid
        unsafe { &*index.0.as_ptr() }
    }
}

/// Get a `ListAccessorCell` used to access a deadline queue.
///
/// # Safety
///
/// All elements of `$queue` must be extant.
macro_rules! timeout_queue_accessor {
    ($queue:expr, $key:expr) => {
        ListAccessorCell::new(
            &$queue.head,
            UnsafeStatic::new(),
            |timeout: &Timeout<_>| &timeout.link,
            $key,
        )
    };
}

/// A deadline-ordered queue of [`Timeout`] nodes. Each clock owns one.
pub(super) struct TimeoutQueue<System: KernelCfg> {
    /// Nodes sorted by `Timeout::at`, ascending; FIFO among equal
    /// deadlines.
    ///
    /// All elements of this linked list must be valid.
    head: CpuLockCell<System, ListHead<TimeoutRef<System>>>,
}

impl<System: KernelCfg> Init for TimeoutQueue<System> {
    const INIT: Self = Self {
        head: CpuLockCell::new(ListHead::new()),
    };
}

/// Register `timeout` with `queue`, and record it in the owning thread's
/// wait state so that killing the thread can unlink it.
pub(super) fn insert_timeout<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    queue: &'static TimeoutQueue<System>,
    timeout: Pin<&Timeout<System>>,
) {
    // For each `Timeout` there can be at most one queue entry pointing to
    // it; two entries would leave a dangling one behind after the first
    // removal.
    assert!(
        !timeout.linked.load(Ordering::Relaxed),
        "timeout is already registered",
    );

    let timeout_ref = TimeoutRef(NonNull::from(timeout.get_ref()));

    // Scan from the back for the insertion position: past every node with
    // a later deadline, stopping at one that expires no later than ours
    // (FIFO among equal deadlines)
    let mut insert_at = None;
    let mut cursor = queue.head.read(&**lock).last;
    while let Some(c) = cursor {
        // Safety: `c` is in `queue.head`, so the pointee is valid
        let c_timeout = unsafe { c.0.as_ref() };
        if c_timeout.at > timeout.at {
            insert_at = Some(c);
            cursor = c_timeout.link.get(&**lock).unwrap().prev;
        } else {
            break;
        }
    }

    // Safety: All elements of `queue.head` are extant.
    unsafe { timeout_queue_accessor!(queue, lock.borrow_mut()) }.insert(timeout_ref, insert_at);

    timeout.queue.replace(&mut **lock, Some(queue));
    timeout.linked.store(true, Ordering::Relaxed);
    wait::set_current_timeout(lock, timeout.thread, Some(timeout_ref));
}

/// Unregister the specified `Timeout`. Does nothing if it's not registered.
pub(super) fn remove_timeout<System: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, System>,
    timeout: Pin<&Timeout<System>>,
) {
    remove_timeout_inner(lock, timeout.get_ref());
}

/// [`remove_timeout`] through a [`TimeoutRef`] held in a thread's wait
/// state.
pub(super) fn remove_timeout_ref<System: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, System>,
    timeout_ref: TimeoutRef<System>,
) {
    // Safety: registered nodes are valid, and only registered refs are
    // retained in `ThreadWait::current_timeout`
    remove_timeout_inner(lock, unsafe { timeout_ref.0.as_ref() });
}

fn remove_timeout_inner<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    timeout: &Timeout<System>,
) {
    if !timeout.linked.load(Ordering::Relaxed) {
        return;
    }

    let queue = timeout.queue.replace(&mut **lock, None).unwrap();
    let timeout_ref = TimeoutRef(NonNull::from(timeout));

    // Safety: All elements of `queue.head` are extant.
    unsafe { timeout_queue_accessor!(queue, lock.borrow_mut()) }.remove(timeout_ref);

    timeout.linked.store(false, Ordering::Relaxed);
    wait::set_current_timeout(lock, timeout.thread, None);
}

/// Wake every waiter whose deadline has passed. Called by the tick
/// handlers with the current tick count of the owning clock.
///
/// Returns `true` if at least one thread was woken.
pub(super) fn expire_elapsed<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    queue: &'static TimeoutQueue<System>,
    now: Tick,
) -> bool {
    let mut woke_up_any = false;

    loop {
        let front = match queue.head.read(&**lock).first {
            Some(front) => front,
            None => break,
        };

        // Safety: `front` is in `queue.head`, so the pointee is valid
        let timeout = unsafe { front.0.as_ref() };
        if timeout.at > now {
            // The queue is sorted; nothing further along has expired either
            break;
        }

        let thread = timeout.thread;
        remove_timeout_inner(lock.borrow_mut(), timeout);
        wait::interrupt_thread(lock.borrow_mut(), thread, Err(WaitError::TimedOut));
        woke_up_any = true;
    }

    woke_up_any
}
