//! The thread ready set (internal use only): per-priority FIFO queues plus
//! an occupancy bitmap.
use super::super::{
    utils::{CpuLockCell, CpuLockGuardBorrowMut},
    Kernel, KernelCfg,
};
use super::Thread;
use crate::utils::{
    intrusive_list::{Ident, ListAccessorCell, Static, StaticListHead},
    FixedPrioBitmap, Init, PrioBitmap,
};

/// The hard upper bound of priority levels, reached with
/// `PRIORITY_SHIFT == 3`. Only the first `16 << PRIORITY_SHIFT` levels are
/// ever occupied.
pub(in crate::kernel) const MAX_PRIORITY_LEVELS: usize = 128;

type Bitmap = FixedPrioBitmap<usize, { MAX_PRIORITY_LEVELS / (usize::BITS as usize) }>;

/// Get a `ListAccessorCell` used to access one priority level's queue.
macro_rules! list_accessor {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new($head, &Static, |t: &Thread<System>| &t.link, $key)
    };
}

/// The ready set. Tracks every thread in the Ready state, keyed by
/// effective priority; FIFO within one priority level.
///
/// Invariant: `!queues[i].is_empty() == bitmap.get(i)`.
pub(in crate::kernel) struct BitmapQueue<System: KernelCfg> {
    queues: [CpuLockCell<System, StaticListHead<Thread<System>>>; MAX_PRIORITY_LEVELS],
    bitmap: CpuLockCell<System, Bitmap>,
}

impl<System: KernelCfg> Init for BitmapQueue<System> {
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

impl<System: Kernel> BitmapQueue<System> {
    /// Insert `thread` at the back of the queue for its effective priority.
    pub(in crate::kernel) fn push_back(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        thread: &'static Thread<System>,
    ) {
        let pri = thread.effective_priority.get(&**lock.borrow_mut()) as usize;
        list_accessor!(&self.queues[pri], lock.borrow_mut()).push_back(Ident(thread));
        self.bitmap.write(&mut **lock).set(pri);
    }

    /// Remove `thread` from the ready set (e.g. when it is killed).
    pub(in crate::kernel) fn remove(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        thread: &'static Thread<System>,
    ) {
        let pri = thread.effective_priority.get(&**lock.borrow_mut()) as usize;
        let is_empty = {
            let mut accessor = list_accessor!(&self.queues[pri], lock.borrow_mut());
            accessor.remove(Ident(thread));
            accessor.is_empty()
        };
        if is_empty {
            self.bitmap.write(&mut **lock).clear(pri);
        }
    }

    /// The highest priority level with at least one ready thread.
    pub(in crate::kernel) fn find_highest(
        &self,
        lock: CpuLockGuardBorrowMut<'_, System>,
    ) -> Option<usize> {
        self.bitmap.read(&**lock).find_set_highest()
    }

    /// Dequeue the thread at the front of the specified priority level.
    pub(in crate::kernel) fn pop_front_at(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        pri: usize,
    ) -> Option<&'static Thread<System>> {
        let (thread, is_empty) = {
            let mut accessor = list_accessor!(&self.queues[pri], lock.borrow_mut());
            let thread = accessor.pop_front();
            (thread, accessor.is_empty())
        };
        if is_empty {
            self.bitmap.write(&mut **lock).clear(pri);
        }
        thread.map(|t| t.0)
    }

    /// Reposition `thread` after a change of its effective priority from
    /// `old_pri` to `new_pri`. The thread joins the back of its new level.
    pub(in crate::kernel) fn reorder(
        &self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        thread: &'static Thread<System>,
        new_pri: usize,
        old_pri: usize,
    ) {
        debug_assert_ne!(new_pri, old_pri);

        let old_empty = {
            let mut accessor = list_accessor!(&self.queues[old_pri], lock.borrow_mut());
            accessor.remove(Ident(thread));
            accessor.is_empty()
        };
        list_accessor!(&self.queues[new_pri], lock.borrow_mut()).push_back(Ident(thread));

        let bitmap = self.bitmap.write(&mut **lock);
        bitmap.set(new_pri);
        if old_empty {
            bitmap.clear(old_pri);
        }
    }
}
