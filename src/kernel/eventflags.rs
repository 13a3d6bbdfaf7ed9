//! Event flags.
//!
//! An event-flag object is a 32-bit word of flags that can be raised,
//! cleared, and waited on. A wait names a mask and a mode: *all* or *any*
//! of the masked bits, optionally *clearing* the matched bits at the
//! moment the wait completes. Raising is monotone until a waiter (or an
//! explicit [`clear`](EventFlags::clear)) consumes the bits; clears
//! performed on behalf of waiters are serialised under the CPU Lock, in
//! enqueue order.
use core::{fmt, ptr, sync::atomic::Ordering};

use super::{
    clock::TickDelta,
    error::{PermError, WaitError},
    state::expect_waitable_context,
    thread,
    utils::{lock_cpu, CpuLockCell},
    wait::{QueueOrder, WaitPayload, WaitQueue},
    FlagsMask, FlagsMode, Kernel, KernelCfg,
};
use crate::utils::Init;

/// Event flags attributes.
#[derive(Debug, Clone, Copy)]
pub struct EventFlagsAttr {
    pub name: &'static str,
    /// The bits raised at construction.
    pub initial: FlagsMask,
}

impl EventFlagsAttr {
    pub const fn new() -> Self {
        Self {
            name: "-",
            initial: 0,
        }
    }

    pub const fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub const fn initial(mut self, initial: FlagsMask) -> Self {
        self.initial = initial;
        self
    }
}

impl Init for EventFlagsAttr {
    const INIT: Self = Self::new();
}

impl Default for EventFlagsAttr {
    fn default() -> Self {
        Self::new()
    }
}

/// An event-flags control block. Compares equal by identity.
pub struct EventFlags<System: KernelCfg> {
    name: &'static str,
    flags: CpuLockCell<System, FlagsMask>,
    wait_queue: WaitQueue<System>,
}

impl<System: KernelCfg> EventFlags<System> {
    pub const fn new(attr: EventFlagsAttr) -> Self {
        Self {
            name: if attr.name.is_empty() { "-" } else { attr.name },
            flags: CpuLockCell::new(attr.initial),
            wait_queue: WaitQueue::new(QueueOrder::Fifo),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<System: KernelCfg> PartialEq for EventFlags<System> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl<System: KernelCfg> Eq for EventFlags<System> {}

impl<System: KernelCfg> fmt::Debug for EventFlags<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventFlags")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .finish()
    }
}

define_error! {
    /// Error type for [`EventFlags::raise`] and [`EventFlags::clear`].
    pub enum UpdateEventFlagsError {
        Inval,
    }
}

define_error! {
    /// Error type for [`EventFlags::wait`].
    pub enum WaitEventFlagsError {
        Perm,
        Inval,
        Interrupted,
    }
}

define_error! {
    /// Error type for [`EventFlags::try_wait`].
    pub enum TryWaitEventFlagsError {
        Inval,
        WouldBlock,
    }
}

define_error! {
    /// Error type for [`EventFlags::timed_wait`].
    pub enum TimedWaitEventFlagsError {
        Perm,
        Inval,
        Interrupted,
        TimedOut,
    }
}

impl<System: Kernel> EventFlags<System> {
    /// Raise the specified bits and wake every waiter whose condition is
    /// now satisfied, in enqueue order. A waiter that asked for clearing
    /// consumes its matched bits before the next waiter is evaluated.
    ///
    /// Safe to call from an interrupt handler.
    pub fn raise(&'static self, bits: FlagsMask) -> Result<(), UpdateEventFlagsError> {
        if bits == 0 {
            return Err(UpdateEventFlagsError::Inval);
        }
        let mut lock = match lock_cpu::<System>() {
            Ok(lock) => lock,
            Err(PermError::Perm) => return Err(UpdateEventFlagsError::Inval),
        };

        let mut flags = self.flags.get(&*lock);

        // Return early if no bits will change; no waiter can become newly
        // satisfied then
        if (flags | bits) == flags {
            return Ok(());
        }

        flags |= bits;

        // Wake threads whose wake-up conditions are now fulfilled. A waiter
        // requesting `CLEAR` consumes bits from `flags` via `poll_core`.
        let woke_up_any =
            self.wait_queue
                .wake_up_all_conditional(lock.borrow_mut(), |payload| match payload {
                    WaitPayload::EventFlags { bits, mode, orig } => {
                        if let Some(observed) = poll_core(&mut flags, *bits, *mode) {
                            orig.store(observed, Ordering::Relaxed);
                            true
                        } else {
                            false
                        }
                    }
                    _ => unreachable!(),
                });

        self.flags.replace(&mut *lock, flags);

        if woke_up_any {
            thread::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Clear the specified bits.
    pub fn clear(&'static self, bits: FlagsMask) -> Result<(), UpdateEventFlagsError> {
        let mut lock = match lock_cpu::<System>() {
            Ok(lock) => lock,
            Err(PermError::Perm) => return Err(UpdateEventFlagsError::Inval),
        };
        self.flags.replace_with(&mut *lock, |f| *f & !bits);
        Ok(())
    }

    /// Non-blocking read of the selected bits, optionally clearing them.
    /// A zero mask selects the whole word. The wait predicate is not
    /// evaluated; this is a plain peek.
    pub fn get(&'static self, mask: FlagsMask, mode: FlagsMode) -> FlagsMask {
        let mut lock = match lock_cpu::<System>() {
            Ok(lock) => lock,
            Err(PermError::Perm) => return 0,
        };
        let word = self.flags.get(&*lock);
        let selected = if mask == 0 { word } else { word & mask };
        if mode.contains(FlagsMode::CLEAR) {
            self.flags.replace(&mut *lock, word & !selected);
        }
        selected
    }

    /// Wait for all or any of the specified bits to be raised, optionally
    /// clearing the matched bits. Returns the flag word as observed at the
    /// moment the condition held (before any clearing).
    pub fn wait(
        &'static self,
        bits: FlagsMask,
        mode: FlagsMode,
    ) -> Result<FlagsMask, WaitEventFlagsError> {
        if !mode.is_well_formed() {
            return Err(WaitEventFlagsError::Inval);
        }
        expect_waitable_context::<System>()
            .map_err(|PermError::Perm| WaitEventFlagsError::Perm)?;
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| WaitEventFlagsError::Perm)?;

        if let Some(observed) = self.poll_with_lock(&mut lock, bits, mode) {
            return Ok(observed);
        }

        match self.wait_queue.wait(
            lock.borrow_mut(),
            WaitPayload::EventFlags {
                bits,
                mode,
                orig: Init::INIT,
            },
        ) {
            Ok(WaitPayload::EventFlags { orig, .. }) => Ok(orig.load(Ordering::Relaxed)),
            Ok(_) => unreachable!(),
            Err(WaitError::Interrupted) => Err(WaitEventFlagsError::Interrupted),
            Err(_) => unreachable!(),
        }
    }

    /// Non-blocking version of [`wait`](Self::wait). Returns
    /// `Err(WouldBlock)` when the condition does not currently hold.
    ///
    /// Safe to call from an interrupt handler.
    pub fn try_wait(
        &'static self,
        bits: FlagsMask,
        mode: FlagsMode,
    ) -> Result<FlagsMask, TryWaitEventFlagsError> {
        if !mode.is_well_formed() {
            return Err(TryWaitEventFlagsError::Inval);
        }
        let mut lock = match lock_cpu::<System>() {
            Ok(lock) => lock,
            Err(PermError::Perm) => return Err(TryWaitEventFlagsError::WouldBlock),
        };
        self.poll_with_lock(&mut lock, bits, mode)
            .ok_or(TryWaitEventFlagsError::WouldBlock)
    }

    /// [`wait`](Self::wait) with a timeout, in ticks.
    pub fn timed_wait(
        &'static self,
        bits: FlagsMask,
        mode: FlagsMode,
        ticks: TickDelta,
    ) -> Result<FlagsMask, TimedWaitEventFlagsError> {
        if !mode.is_well_formed() {
            return Err(TimedWaitEventFlagsError::Inval);
        }
        expect_waitable_context::<System>()
            .map_err(|PermError::Perm| TimedWaitEventFlagsError::Perm)?;
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| TimedWaitEventFlagsError::Perm)?;

        if let Some(observed) = self.poll_with_lock(&mut lock, bits, mode) {
            return Ok(observed);
        }

        let at = System::state()
            .sysclock
            .count
            .get(&*lock)
            .wrapping_add(ticks as u64);
        match self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::EventFlags {
                bits,
                mode,
                orig: Init::INIT,
            },
            at,
        ) {
            Ok(WaitPayload::EventFlags { orig, .. }) => Ok(orig.load(Ordering::Relaxed)),
            Ok(_) => unreachable!(),
            Err(WaitError::Interrupted) => Err(TimedWaitEventFlagsError::Interrupted),
            Err(WaitError::TimedOut) => Err(TimedWaitEventFlagsError::TimedOut),
            Err(_) => unreachable!(),
        }
    }

    /// The currently raised bits.
    pub fn flags(&'static self) -> FlagsMask {
        self.get(0, FlagsMode::ANY)
    }

    /// Are there threads waiting on this object?
    pub fn are_waiting(&'static self) -> bool {
        match lock_cpu::<System>() {
            Ok(mut lock) => !self.wait_queue.is_empty(lock.borrow_mut()),
            Err(PermError::Perm) => false,
        }
    }

    fn poll_with_lock(
        &'static self,
        lock: &mut super::utils::CpuLockGuard<System>,
        bits: FlagsMask,
        mode: FlagsMode,
    ) -> Option<FlagsMask> {
        poll_core(self.flags.write(&mut **lock), bits, mode)
    }
}

/// Given a wait condition `(bits, mode)`, check if the flag word satisfies
/// it. On success, clears the matched bits if requested and returns the
/// word as observed at the moment of the match.
fn poll_core(flags: &mut FlagsMask, bits: FlagsMask, mode: FlagsMode) -> Option<FlagsMask> {
    let success = if bits == 0 {
        *flags != 0
    } else if mode.contains(FlagsMode::ALL) {
        (*flags & bits) == bits
    } else {
        (*flags & bits) != 0
    };

    if success {
        let original = *flags;
        if mode.contains(FlagsMode::CLEAR) {
            if bits == 0 {
                *flags = 0;
            } else {
                *flags &= !bits;
            }
        }
        Some(original)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::super::{clock, sim, Thread, ThreadAttr};
    use super::*;

    fn noop(_: usize) -> usize {
        0
    }

    #[test]
    fn raise_clear_roundtrip() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static EV: EventFlags<S> = EventFlags::new(EventFlagsAttr::new());
        sim::boot::<S>(&MAIN, &IDLE);

        assert_eq!(EV.flags(), 0);
        EV.raise(0x5).unwrap();
        assert_eq!(EV.flags(), 0x5);
        EV.clear(0x5).unwrap();
        assert_eq!(EV.flags(), 0);

        assert_eq!(EV.raise(0), Err(UpdateEventFlagsError::Inval));
    }

    #[test]
    fn get_with_clear() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static EV: EventFlags<S> = EventFlags::new(EventFlagsAttr::new());
        sim::boot::<S>(&MAIN, &IDLE);

        EV.raise(0x7).unwrap();
        assert_eq!(EV.get(0x3, FlagsMode::ANY | FlagsMode::CLEAR), 0x3);
        assert_eq!(EV.flags(), 0x4);
    }

    #[test]
    fn wait_satisfied_immediately() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static EV: EventFlags<S> = EventFlags::new(EventFlagsAttr::new().initial(0x3));
        sim::boot::<S>(&MAIN, &IDLE);

        assert_eq!(EV.wait(0x1, FlagsMode::ANY | FlagsMode::CLEAR), Ok(0x3));
        assert_eq!(EV.flags(), 0x2);
    }

    #[test]
    fn isr_raise_wakes_waiter() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static EV: EventFlags<S> = EventFlags::new(EventFlagsAttr::new());
        sim::boot::<S>(&MAIN, &IDLE);

        sim::queue_isr::<S>(|| EV.raise(0x1).unwrap());
        assert_eq!(EV.wait(0x1, FlagsMode::ANY | FlagsMode::CLEAR), Ok(0x1));
        // The waiter's clear consumed the bit
        assert_eq!(EV.flags(), 0);
    }

    #[test]
    fn all_mode_needs_every_bit() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static EV: EventFlags<S> = EventFlags::new(EventFlagsAttr::new());
        sim::boot::<S>(&MAIN, &IDLE);

        EV.raise(0x1).unwrap();
        assert_eq!(
            EV.try_wait(0x3, FlagsMode::ALL),
            Err(TryWaitEventFlagsError::WouldBlock)
        );
        EV.raise(0x2).unwrap();
        assert_eq!(EV.try_wait(0x3, FlagsMode::ALL), Ok(0x3));
    }

    #[test]
    fn timed_wait_expires() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static EV: EventFlags<S> = EventFlags::new(EventFlagsAttr::new());
        sim::boot::<S>(&MAIN, &IDLE);

        for _ in 0..4 {
            sim::queue_isr::<S>(|| clock::systick_handler::<S>());
        }
        assert_eq!(
            EV.timed_wait(0x1, FlagsMode::ANY, 4),
            Err(TimedWaitEventFlagsError::TimedOut)
        );
    }

    #[test]
    fn malformed_mode_rejected() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static EV: EventFlags<S> = EventFlags::new(EventFlagsAttr::new());
        sim::boot::<S>(&MAIN, &IDLE);

        assert_eq!(
            EV.wait(0x1, FlagsMode::CLEAR),
            Err(WaitEventFlagsError::Inval)
        );
        assert_eq!(
            EV.try_wait(0x1, FlagsMode::ALL | FlagsMode::ANY),
            Err(TryWaitEventFlagsError::Inval)
        );
        assert!(!EV.are_waiting());
    }
}
