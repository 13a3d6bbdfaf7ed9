//! Thread signal flags.
//!
//! Every thread carries a private 32-bit flag word. Any thread (or an
//! interrupt handler) may [`raise`] bits on it; only the owning thread can
//! wait on its own word ([`sig_wait`] and variants, also reachable through
//! [`this_thread`](super::thread::this_thread)).
//!
//! Raising flags additionally interrupts a plain sleep
//! ([`sysclock::sleep_for`](super::clock::sysclock::sleep_for) and
//! friends) of the target thread, which then reports
//! [`ResultCode::Interrupted`](super::ResultCode::Interrupted).
use core::sync::atomic::{AtomicU32, Ordering};

use super::{
    clock::TickDelta,
    error::{PermError, WaitError},
    state::expect_waitable_context,
    thread::{Thread, ThreadState},
    utils::{lock_cpu, CpuLockGuardBorrowMut},
    wait,
    wait::WaitPayload,
    FlagsMask, FlagsMode, Kernel,
};

define_error! {
    /// Error type for [`Thread::sig_raise`](super::Thread::sig_raise).
    pub enum RaiseSigError {
        Perm,
        Inval,
    }
}

define_error! {
    /// Error type for [`Thread::sig_clear`](super::Thread::sig_clear).
    pub enum ClearSigError {
        Perm,
        Inval,
    }
}

define_error! {
    /// Error type for [`sig_wait`].
    pub enum SigWaitError {
        Perm,
        Inval,
        Interrupted,
    }
}

define_error! {
    /// Error type for [`try_sig_wait`].
    pub enum TrySigWaitError {
        Inval,
        WouldBlock,
    }
}

define_error! {
    /// Error type for [`timed_sig_wait`].
    pub enum TimedSigWaitError {
        Perm,
        Inval,
        Interrupted,
        TimedOut,
    }
}

/// Given a wait condition `(mask, mode)`, check if the flag word `word`
/// satisfies it.
///
/// A zero mask means "any flag". On success, clears the matched bits if
/// requested and returns the word as observed at the moment of the match.
fn poll_core(word: &mut FlagsMask, mask: FlagsMask, mode: FlagsMode) -> Option<FlagsMask> {
    let success = if mask == 0 {
        *word != 0
    } else if mode.contains(FlagsMode::ALL) {
        (*word & mask) == mask
    } else {
        (*word & mask) != 0
    };

    if success {
        let original = *word;
        if mode.contains(FlagsMode::CLEAR) {
            if mask == 0 {
                *word = 0;
            } else {
                *word &= !mask;
            }
        }
        Some(original)
    } else {
        None
    }
}

/// Implements [`Thread::sig_raise`](super::Thread::sig_raise): OR the mask
/// into the thread's flag word, waking the thread if its pending flag wait
/// is now satisfied (or interrupting its sleep). Returns the previous word.
///
/// Safe to call from an interrupt handler.
pub(super) fn raise<System: Kernel>(
    thread: &'static Thread<System>,
    mask: FlagsMask,
) -> Result<FlagsMask, RaiseSigError> {
    if mask == 0 {
        return Err(RaiseSigError::Inval);
    }
    let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| RaiseSigError::Perm)?;
    let previous = raise_with_lock(lock.borrow_mut(), thread, mask);
    super::thread::unlock_cpu_and_check_preemption(lock);
    Ok(previous)
}

/// The body of [`raise`], for callers already inside the CPU Lock critical
/// section (the timer dispatcher). The caller is responsible for the
/// preemption check.
pub(super) fn raise_with_lock<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    thread: &'static Thread<System>,
    mask: FlagsMask,
) -> FlagsMask {
    let previous = thread.sig_flags.get(&**lock);
    thread.sig_flags.replace(&mut **lock, previous | mask);

    if thread.st.get(&**lock) == ThreadState::Waiting {
        // What is the thread blocked on?
        enum Pending {
            SigFlags(FlagsMask, FlagsMode),
            Sleep,
            Other,
        }
        let pending = wait::with_current_wait_payload(lock.borrow_mut(), thread, |p| match p {
            Some(WaitPayload::SigFlags { mask, mode, .. }) => Pending::SigFlags(*mask, *mode),
            Some(WaitPayload::Park) => Pending::Sleep,
            _ => Pending::Other,
        });

        match pending {
            Pending::SigFlags(wait_mask, wait_mode) => {
                let mut word = thread.sig_flags.get(&**lock);
                if let Some(observed) = poll_core(&mut word, wait_mask, wait_mode) {
                    thread.sig_flags.replace(&mut **lock, word);
                    wait::with_current_wait_payload(lock.borrow_mut(), thread, |p| {
                        if let Some(WaitPayload::SigFlags { orig, .. }) = p {
                            orig.store(observed, Ordering::Relaxed);
                        }
                    });
                    wait::interrupt_thread(lock.borrow_mut(), thread, Ok(()));
                }
            }
            Pending::Sleep => {
                // A raised signal cuts a sleep short
                wait::interrupt_thread(lock.borrow_mut(), thread, Err(WaitError::Interrupted));
            }
            Pending::Other => {}
        }
    }

    previous
}

/// Implements [`Thread::sig_clear`](super::Thread::sig_clear): AND-NOT the
/// mask out of the thread's flag word. Returns the previous word.
pub(super) fn clear<System: Kernel>(
    thread: &'static Thread<System>,
    mask: FlagsMask,
) -> Result<FlagsMask, ClearSigError> {
    if mask == 0 {
        return Err(ClearSigError::Inval);
    }
    let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| ClearSigError::Perm)?;
    let previous = thread.sig_flags.get(&*lock);
    thread.sig_flags.replace(&mut *lock, previous & !mask);
    Ok(previous)
}

/// Implements [`Thread::sig_get`](super::Thread::sig_get): non-blocking
/// read of the selected flags, optionally clearing them. A zero mask
/// selects the whole word.
pub(super) fn get<System: Kernel>(
    thread: &'static Thread<System>,
    mask: FlagsMask,
    mode: FlagsMode,
) -> FlagsMask {
    let mut lock = match lock_cpu::<System>() {
        Ok(lock) => lock,
        Err(PermError::Perm) => return 0,
    };
    let word = thread.sig_flags.get(&*lock);
    let selected = if mask == 0 { word } else { word & mask };
    if mode.contains(FlagsMode::CLEAR) {
        thread.sig_flags.replace(&mut *lock, word & !selected);
    }
    selected
}

/// Wait until the current thread's signal flags satisfy `(mask, mode)`.
/// Returns the flag word observed at the moment the condition held.
pub fn sig_wait<System: Kernel>(
    mask: FlagsMask,
    mode: FlagsMode,
) -> Result<FlagsMask, SigWaitError> {
    if !mode.is_well_formed() {
        return Err(SigWaitError::Inval);
    }
    expect_waitable_context::<System>().map_err(|PermError::Perm| SigWaitError::Perm)?;
    let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| SigWaitError::Perm)?;

    if let Some(observed) = poll_current(lock.borrow_mut(), mask, mode) {
        return Ok(observed);
    }

    match wait::wait_no_queue(
        lock.borrow_mut(),
        WaitPayload::SigFlags {
            mask,
            mode,
            orig: AtomicU32::new(0),
        },
    ) {
        Ok(WaitPayload::SigFlags { orig, .. }) => Ok(orig.load(Ordering::Relaxed)),
        Ok(_) => unreachable!(),
        Err(WaitError::Interrupted) => Err(SigWaitError::Interrupted),
        Err(_) => unreachable!(),
    }
}

/// Non-blocking version of [`sig_wait`]. Returns `Err(WouldBlock)` if the
/// condition does not currently hold.
pub fn try_sig_wait<System: Kernel>(
    mask: FlagsMask,
    mode: FlagsMode,
) -> Result<FlagsMask, TrySigWaitError> {
    if !mode.is_well_formed() {
        return Err(TrySigWaitError::Inval);
    }
    let mut lock = match lock_cpu::<System>() {
        Ok(lock) => lock,
        Err(PermError::Perm) => return Err(TrySigWaitError::WouldBlock),
    };
    poll_current(lock.borrow_mut(), mask, mode).ok_or(TrySigWaitError::WouldBlock)
}

/// [`sig_wait`] with a timeout, in ticks.
pub fn timed_sig_wait<System: Kernel>(
    mask: FlagsMask,
    mode: FlagsMode,
    ticks: TickDelta,
) -> Result<FlagsMask, TimedSigWaitError> {
    if !mode.is_well_formed() {
        return Err(TimedSigWaitError::Inval);
    }
    expect_waitable_context::<System>().map_err(|PermError::Perm| TimedSigWaitError::Perm)?;
    let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| TimedSigWaitError::Perm)?;

    if let Some(observed) = poll_current(lock.borrow_mut(), mask, mode) {
        return Ok(observed);
    }

    let state = System::state();
    let at = state.sysclock.count.get(&*lock).wrapping_add(ticks as u64);
    match wait::wait_no_queue_timeout(
        lock.borrow_mut(),
        WaitPayload::SigFlags {
            mask,
            mode,
            orig: AtomicU32::new(0),
        },
        &state.sysclock.deadlines,
        at,
    ) {
        Ok(WaitPayload::SigFlags { orig, .. }) => Ok(orig.load(Ordering::Relaxed)),
        Ok(_) => unreachable!(),
        Err(WaitError::Interrupted) => Err(TimedSigWaitError::Interrupted),
        Err(WaitError::TimedOut) => Err(TimedSigWaitError::TimedOut),
        Err(_) => unreachable!(),
    }
}

/// Poll the current thread's flag word against `(mask, mode)`.
fn poll_current<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    mask: FlagsMask,
    mode: FlagsMode,
) -> Option<FlagsMask> {
    let thread = System::state().running_thread()?;
    let mut word = thread.sig_flags.get(&**lock);
    let observed = poll_core(&mut word, mask, mode)?;
    thread.sig_flags.replace(&mut **lock, word);
    Some(observed)
}

#[cfg(test)]
mod tests {
    use super::super::{clock, sim, Thread, ThreadAttr};
    use super::*;

    fn noop(_: usize) -> usize {
        0
    }

    #[test]
    fn raise_wakes_waiter() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        sim::queue_isr::<S>(|| {
            assert_eq!(MAIN.sig_raise(0x1), Ok(0));
        });
        assert_eq!(sig_wait::<S>(0x1, FlagsMode::ANY), Ok(0x1));
    }

    #[test]
    fn wait_with_clear_consumes() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        sim::queue_isr::<S>(|| {
            MAIN.sig_raise(0x5).unwrap();
        });
        assert_eq!(
            sig_wait::<S>(0x1, FlagsMode::ANY | FlagsMode::CLEAR),
            Ok(0x5)
        );
        // Only the masked bit was cleared
        assert_eq!(MAIN.sig_get(0, FlagsMode::ANY), 0x4);
    }

    #[test]
    fn all_mode_needs_every_bit() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        MAIN.sig_raise(0x1).unwrap();
        assert_eq!(
            try_sig_wait::<S>(0x3, FlagsMode::ALL),
            Err(TrySigWaitError::WouldBlock)
        );
        assert_eq!(MAIN.sig_raise(0x2), Ok(0x1));
        assert_eq!(try_sig_wait::<S>(0x3, FlagsMode::ALL), Ok(0x3));
    }

    #[test]
    fn timed_wait_expires() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        for _ in 0..5 {
            sim::queue_isr::<S>(|| clock::systick_handler::<S>());
        }
        assert_eq!(
            timed_sig_wait::<S>(0x1, FlagsMode::ANY, 5),
            Err(TimedSigWaitError::TimedOut)
        );
    }

    #[test]
    fn clear_and_get_report_previous() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        assert_eq!(MAIN.sig_raise(0xF0), Ok(0));
        assert_eq!(MAIN.sig_clear(0x30), Ok(0xF0));
        assert_eq!(MAIN.sig_get(0xFF, FlagsMode::ANY), 0xC0);

        // Get-with-clear consumes the selected bits
        assert_eq!(MAIN.sig_get(0x40, FlagsMode::ANY | FlagsMode::CLEAR), 0x40);
        assert_eq!(MAIN.sig_get(0, FlagsMode::ANY), 0x80);
    }

    #[test]
    fn zero_masks_and_bad_modes_rejected() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        assert_eq!(MAIN.sig_raise(0), Err(RaiseSigError::Inval));
        assert_eq!(MAIN.sig_clear(0), Err(ClearSigError::Inval));
        assert_eq!(
            sig_wait::<S>(0x1, FlagsMode::CLEAR),
            Err(SigWaitError::Inval)
        );
        assert_eq!(
            try_sig_wait::<S>(0x1, FlagsMode::ALL | FlagsMode::ANY),
            Err(TrySigWaitError::Inval)
        );
    }

    #[test]
    fn zero_mask_waits_for_any_flag() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        assert_eq!(
            try_sig_wait::<S>(0, FlagsMode::ANY),
            Err(TrySigWaitError::WouldBlock)
        );
        MAIN.sig_raise(0x8).unwrap();
        assert_eq!(try_sig_wait::<S>(0, FlagsMode::ANY | FlagsMode::CLEAR), Ok(0x8));
        assert_eq!(MAIN.sig_get(0, FlagsMode::ANY), 0);
    }
}
