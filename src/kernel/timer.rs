//! User software timers.
//!
//! A timer fires a user callback after a delay, once
//! ([`TimerRun::Once`]) or repeatedly ([`TimerRun::Periodic`]). Callbacks
//! run in the *timer-dispatch context* with the scheduler locked:
//! normally that is a dedicated high-priority thread running
//! [`dispatch_loop`]; when no such thread was set up, the tick handler
//! dispatches directly as a fallback.
use core::{fmt, ptr};

use super::{
    clock::{Tick, TickDelta},
    error::PermError,
    sig,
    state::{expect_thread_context, scheduler},
    thread::Thread,
    utils::{lock_cpu, CpuLockCell, CpuLockGuardBorrowMut},
    FlagsMask, FlagsMode, Kernel, KernelCfg,
};
use crate::utils::{
    intrusive_list::{Ident, ListAccessorCell, Static, StaticLink, StaticListHead},
    Init,
};

/// The signal bit used to nudge the dispatch thread. Reserved out of the
/// range applications would plausibly use.
const DISPATCH_SIG: FlagsMask = 1 << 31;

/// Timer run mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRun {
    /// Fire once, at `start time + duration`.
    Once,
    /// Re-arm after each firing, with the start duration as the period.
    Periodic,
}

/// Timer attributes.
#[derive(Debug, Clone, Copy)]
pub struct TimerAttr {
    pub name: &'static str,
    pub run: TimerRun,
}

impl TimerAttr {
    /// Attributes of a one-shot timer.
    pub const fn once() -> Self {
        Self {
            name: "-",
            run: TimerRun::Once,
        }
    }

    /// Attributes of a periodic timer.
    pub const fn periodic() -> Self {
        Self {
            name: "-",
            run: TimerRun::Periodic,
        }
    }

    pub const fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

impl Init for TimerAttr {
    const INIT: Self = Self::once();
}

/// Where a timer currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPhase {
    /// Not scheduled.
    Idle,
    /// On the armed list, waiting for its deadline.
    Armed,
    /// Expired; on the dispatch list, waiting for its callback to run.
    Pending,
}

/// The kernel-global timer state, owned by [`State`](super::State).
pub(super) struct TimerState<System: KernelCfg> {
    /// Armed timers, sorted by deadline (FIFO among equal deadlines).
    armed: CpuLockCell<System, StaticListHead<TimerListNode<System>>>,

    /// Expired timers awaiting dispatch by the dispatch thread.
    expired: CpuLockCell<System, StaticListHead<TimerListNode<System>>>,

    /// The registered dispatch thread, if any.
    dispatch_thread: CpuLockCell<System, Option<&'static Thread<System>>>,
}

impl<System: KernelCfg> Init for TimerState<System> {
    const INIT: Self = Self {
        armed: CpuLockCell::new(StaticListHead::new()),
        expired: CpuLockCell::new(StaticListHead::new()),
        dispatch_thread: CpuLockCell::new(None),
    };
}

type TimerListNode<System> = Timer<System>;

/// Get a `ListAccessorCell` used to access a timer list.
macro_rules! timer_list_accessor {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new($head, &Static, |t: &Timer<System>| &t.link, $key)
    };
}

/// A timer control block. Compares equal by identity.
pub struct Timer<System: KernelCfg> {
    name: &'static str,
    entry: fn(usize),
    entry_arg: usize,
    run: TimerRun,

    period: CpuLockCell<System, TickDelta>,
    at: CpuLockCell<System, Tick>,
    phase: CpuLockCell<System, TimerPhase>,
    link: CpuLockCell<System, Option<StaticLink<Self>>>,
}

impl<System: KernelCfg> Timer<System> {
    pub const fn new(attr: TimerAttr, entry: fn(usize), entry_arg: usize) -> Self {
        Self {
            name: if attr.name.is_empty() { "-" } else { attr.name },
            entry,
            entry_arg,
            run: attr.run,
            period: CpuLockCell::new(0),
            at: CpuLockCell::new(0),
            phase: CpuLockCell::new(TimerPhase::Idle),
            link: CpuLockCell::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn run_mode(&self) -> TimerRun {
        self.run
    }
}

impl<System: KernelCfg> PartialEq for Timer<System> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl<System: KernelCfg> Eq for Timer<System> {}

impl<System: KernelCfg> fmt::Debug for Timer<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timer")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .finish()
    }
}

define_error! {
    /// Error type for [`Timer::start`].
    pub enum StartTimerError {
        Perm,
        Inval,
    }
}

define_error! {
    /// Error type for [`Timer::stop`].
    pub enum StopTimerError {
        Perm,
        /// The timer is not running.
        WouldBlock,
    }
}

impl<System: Kernel> Timer<System> {
    /// Start the timer: fire after `ticks` ticks (and, for a periodic
    /// timer, every `ticks` ticks thereafter). Restarting an armed timer
    /// re-arms it to the new deadline.
    pub fn start(&'static self, ticks: TickDelta) -> Result<(), StartTimerError> {
        expect_thread_context::<System>().map_err(|PermError::Perm| StartTimerError::Perm)?;
        if ticks == 0 {
            return Err(StartTimerError::Inval);
        }
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| StartTimerError::Perm)?;
        let state = System::state();

        self.unlink(lock.borrow_mut());

        let at = state.sysclock.count.get(&*lock).wrapping_add(ticks as Tick);
        self.period.replace(&mut *lock, ticks);
        self.arm(lock.borrow_mut(), at);
        Ok(())
    }

    /// Stop the timer. Idempotent in effect, but reports `WouldBlock` when
    /// the timer was not running.
    pub fn stop(&'static self) -> Result<(), StopTimerError> {
        expect_thread_context::<System>().map_err(|PermError::Perm| StopTimerError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| StopTimerError::Perm)?;

        if self.phase.get(&*lock) == TimerPhase::Idle {
            return Err(StopTimerError::WouldBlock);
        }
        self.unlink(lock.borrow_mut());
        Ok(())
    }

    /// Is the timer scheduled (armed or awaiting dispatch)?
    pub fn is_running(&'static self) -> bool {
        match lock_cpu::<System>() {
            Ok(lock) => self.phase.get(&*lock) != TimerPhase::Idle,
            Err(PermError::Perm) => false,
        }
    }

    /// Remove the timer from whichever list holds it.
    fn unlink(&'static self, mut lock: CpuLockGuardBorrowMut<'_, System>) {
        let state = System::state();
        match self.phase.replace(&mut **lock, TimerPhase::Idle) {
            TimerPhase::Idle => {}
            TimerPhase::Armed => {
                timer_list_accessor!(&state.timers.armed, lock.borrow_mut()).remove(Ident(self));
            }
            TimerPhase::Pending => {
                timer_list_accessor!(&state.timers.expired, lock.borrow_mut())
                    .remove(Ident(self));
            }
        }
    }

    /// Insert the timer into the armed list, keeping it deadline-sorted.
    fn arm(&'static self, mut lock: CpuLockGuardBorrowMut<'_, System>, at: Tick) {
        let state = System::state();
        self.at.replace(&mut **lock, at);

        let mut insert_at = None;
        let mut cursor = state.timers.armed.read(&**lock).last;
        while let Some(Ident(t)) = cursor {
            if t.at.get(&**lock) > at {
                insert_at = Some(Ident(t));
                cursor = t.link.get(&**lock).unwrap().prev;
            } else {
                break;
            }
        }
        timer_list_accessor!(&state.timers.armed, lock.borrow_mut())
            .insert(Ident(self), insert_at);

        self.phase.replace(&mut **lock, TimerPhase::Armed);
    }
}

/// Expire elapsed timers. Called by the tick handler.
///
/// With a dispatch thread registered, expired timers are moved to the
/// dispatch list and the thread is nudged; their callbacks (and the
/// re-arming of periodic timers) happen there. Otherwise the callback runs
/// right here, under the scheduler lock, with interrupts briefly enabled.
pub(super) fn process_tick<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    now: Tick,
) {
    let state = System::state();
    let mut nudge = false;

    loop {
        let front = match state.timers.armed.read(&**lock).first {
            Some(Ident(t)) => t,
            None => break,
        };
        if front.at.get(&**lock) > now {
            break;
        }

        timer_list_accessor!(&state.timers.armed, lock.borrow_mut()).remove(Ident(front));

        if state.timers.dispatch_thread.get(&**lock).is_some() {
            front.phase.replace(&mut **lock, TimerPhase::Pending);
            timer_list_accessor!(&state.timers.expired, lock.borrow_mut()).push_back(Ident(front));
            nudge = true;
        } else {
            // Fallback dispatch: no timer thread was set up
            front.phase.replace(&mut **lock, TimerPhase::Idle);
            let status = scheduler::lock::<System>();
            lock.temporarily_release(|| (front.entry)(front.entry_arg));
            scheduler::unlock::<System>(status);

            if front.run == TimerRun::Periodic {
                let next = front.at.get(&**lock).wrapping_add(front.period.get(&**lock) as Tick);
                front.arm(lock.borrow_mut(), next);
            }
        }
    }

    if nudge {
        if let Some(dispatcher) = state.timers.dispatch_thread.get(&**lock) {
            let _ = sig::raise_with_lock(lock.borrow_mut(), dispatcher, DISPATCH_SIG);
        }
    }
}

/// The body of a timer-dispatch thread. Registers the calling thread as
/// the dispatcher, then loops forever running expired timer callbacks
/// under the scheduler lock.
///
/// Run this in a dedicated high-priority thread (conventionally at
/// [`priority::isr`](super::thread::priority::isr)) to keep timer
/// callbacks out of the interrupt handler.
pub fn dispatch_loop<System: Kernel>() -> ! {
    let state = System::state();

    {
        let mut lock = lock_cpu::<System>().expect("CPU Lock must be inactive");
        let cur = state.running_thread().expect("no running thread");
        state.timers.dispatch_thread.replace(&mut *lock, Some(cur));
    }

    loop {
        let _ = sig::sig_wait::<System>(DISPATCH_SIG, FlagsMode::ANY | FlagsMode::CLEAR);

        loop {
            let (entry, entry_arg);
            {
                let mut lock = lock_cpu::<System>().expect("CPU Lock must be inactive");
                let front = match state.timers.expired.read(&*lock).first {
                    Some(Ident(t)) => t,
                    None => break,
                };
                timer_list_accessor!(&state.timers.expired, lock.borrow_mut())
                    .remove(Ident(front));

                if front.run == TimerRun::Periodic {
                    let next = front
                        .at
                        .get(&*lock)
                        .wrapping_add(front.period.get(&*lock) as Tick);
                    front.arm(lock.borrow_mut(), next);
                } else {
                    front.phase.replace(&mut *lock, TimerPhase::Idle);
                }

                entry = front.entry;
                entry_arg = front.entry_arg;
            }

            let status = scheduler::lock::<System>();
            entry(entry_arg);
            scheduler::unlock::<System>(status);
        }
    }
}
