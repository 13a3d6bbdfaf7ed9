//! The CPU Lock: the kernel's interrupt critical section, and cells keyed
//! by it.
//!
//! Every piece of mutable kernel state lives in a [`CpuLockCell`], which can
//! only be read or written while holding [`CpuLockGuard`] — proof that
//! interrupts at or below the kernel level are masked. The guard saves the
//! port's interrupt status word on entry and restores it on drop.
use core::{fmt, marker::PhantomData, ops};

use super::{error::PermError, Kernel, Port};
use crate::utils::{intrusive_list::CellLike, Init};

#[non_exhaustive]
pub(super) struct CpuLockToken<System> {
    _phantom: PhantomData<System>,
}

#[derive(Clone, Copy)]
pub(super) struct CpuLockKeyhole<System> {
    _phantom: PhantomData<System>,
}

impl<System> fmt::Debug for CpuLockKeyhole<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CpuLockKeyhole").finish()
    }
}

// This is safe because `CpuLockToken` can only be borrowed from
// `CpuLockGuard`, and there is at most one `CpuLockGuard` at any point of
// time (`lock_cpu` fails when interrupts are already masked)
unsafe impl<System> tokenlock::Token<CpuLockKeyhole<System>> for CpuLockToken<System> {
    fn eq_id(&self, _: &CpuLockKeyhole<System>) -> bool {
        true
    }
}

impl<System> Init for CpuLockKeyhole<System> {
    const INIT: Self = Self {
        _phantom: PhantomData,
    };
}

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub(super) struct CpuLockCell<System, T: ?Sized>(tokenlock::TokenLock<T, CpuLockKeyhole<System>>);

impl<System, T> CpuLockCell<System, T> {
    pub(super) const fn new(x: T) -> Self {
        Self(tokenlock::TokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<System: Kernel, T: fmt::Debug> fmt::Debug for CpuLockCell<System, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(lock) = lock_cpu::<System>() {
            f.debug_tuple("CpuLockCell").field(self.0.read(&*lock)).finish()
        } else {
            write!(f, "CpuLockCell(< locked >)")
        }
    }
}

impl<System, T: Init> Init for CpuLockCell<System, T> {
    const INIT: Self = Self(Init::INIT);
}

impl<System, T> ops::Deref for CpuLockCell<System, T> {
    type Target = tokenlock::TokenLock<T, CpuLockKeyhole<System>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<System, T> ops::DerefMut for CpuLockCell<System, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<'a, Element: Clone, System: Kernel> CellLike<&'a mut CpuLockGuard<System>>
    for CpuLockCell<System, Element>
{
    type Target = Element;

    fn get(&self, key: &&'a mut CpuLockGuard<System>) -> Self::Target {
        self.read(&***key).clone()
    }
    fn set(&self, key: &mut &'a mut CpuLockGuard<System>, value: Self::Target) {
        self.replace(&mut ***key, value);
    }
}

/// Attempt to enter the CPU Lock and get an RAII guard. Returns
/// `Err(Perm)` if interrupts are already masked — in that case someone
/// upstack already holds the lock.
pub(super) fn lock_cpu<System: Kernel>() -> Result<CpuLockGuard<System>, PermError> {
    if System::interrupts_masked() {
        return Err(PermError::Perm);
    }

    // Safety: The CPU Lock is currently inactive, and it's us (the kernel)
    // who are going to control its duration
    let status = unsafe { System::interrupts_mask() };

    Ok(CpuLockGuard {
        token: CpuLockToken {
            _phantom: PhantomData,
        },
        status,
    })
}

/// RAII guard for the CPU Lock.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub(super) struct CpuLockGuard<System: Port> {
    token: CpuLockToken<System>,
    status: System::InterruptStatus,
}

/// A mutable borrow of a [`CpuLockGuard`]. Passing this around (reborrowed
/// with [`CpuLockGuard::borrow_mut`]) lets nested calls use the lock without
/// consuming it.
pub(super) type CpuLockGuardBorrowMut<'a, System> = &'a mut CpuLockGuard<System>;

impl<System: Kernel> CpuLockGuard<System> {
    /// Reborrow the guard for a nested call.
    pub(super) fn borrow_mut(&mut self) -> CpuLockGuardBorrowMut<'_, System> {
        self
    }

    /// Dissolve the guard without restoring the interrupt status. Used on
    /// the thread-exit path, which never returns to the caller.
    pub(super) fn forget(self) {
        core::mem::forget(self);
    }

    /// Run `f` with the CPU Lock released, re-entering it before returning.
    /// Used to open a window for a pended context switch (or, in the timer
    /// fallback path, to keep a callback out of the critical section).
    pub(super) fn temporarily_release(&mut self, f: impl FnOnce()) {
        // Safety: the guard's saved status is consumed here and replaced by
        // the status of the re-entry below, keeping the pairing intact
        unsafe { System::interrupts_restore(self.status) };
        f();
        // Safety: the CPU Lock is inactive at this point
        self.status = unsafe { System::interrupts_mask() };
    }
}

impl<System: Port> Drop for CpuLockGuard<System> {
    fn drop(&mut self) {
        // Safety: The CPU Lock is currently active, and it's us (the kernel)
        // who are currently controlling it
        unsafe {
            System::interrupts_restore(self.status);
        }
    }
}

impl<System: Kernel> ops::Deref for CpuLockGuard<System> {
    type Target = CpuLockToken<System>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<System: Kernel> ops::DerefMut for CpuLockGuard<System> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
