//! The system clock, the real-time clock, and the tick engine.
//!
//! The *system clock* ([`sysclock`]) counts tick interrupts since boot. It
//! is steady: the count is monotone ascending and never adjusted. With a
//! port that can sample the tick timer's internal counter, it provides
//! timestamps at CPU-cycle resolution.
//!
//! The *real-time clock* ([`rtclock`]) counts seconds since the POSIX
//! epoch. It may be adjusted to match a reference clock, so it is **not**
//! steady; it is used for wall-time sleeps only.
//!
//! Each clock owns a deadline queue. The periodic interrupt handlers
//! ([`systick_handler`], [`rtc_handler`]) advance the counts, wake expired
//! waiters, expire user timers, and pend a reschedule when a woken thread
//! outranks the running one.
use num_integer::Integer;

use super::{
    error::{PermError, WaitError},
    state::expect_waitable_context,
    thread, timeout, timer,
    utils::{lock_cpu, CpuLockCell},
    wait,
    wait::WaitPayload,
    Kernel, KernelCfg, PortTimer,
};
use crate::utils::Init;

/// Type of tick (and second) counts.
pub type Tick = u64;

/// Type of durations, in ticks or in seconds.
pub type TickDelta = u32;

/// Per-clock state: a monotone counter and a deadline queue.
pub(super) struct ClockQueueState<System: KernelCfg> {
    pub(super) count: CpuLockCell<System, Tick>,
    pub(super) deadlines: timeout::TimeoutQueue<System>,
}

impl<System: KernelCfg> Init for ClockQueueState<System> {
    const INIT: Self = Self {
        count: CpuLockCell::new(0),
        deadlines: Init::INIT,
    };
}

/// A detailed system-clock timestamp: the tick count plus the sub-tick
/// state of the tick timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysclockSample {
    /// Count of ticks since boot.
    pub ticks: Tick,
    /// Count of timer cycles since the last reload.
    pub cycles: u32,
    /// The timer reload value.
    pub divisor: u32,
    /// CPU clock frequency, in hertz.
    pub core_frequency_hz: u32,
}

/// The sub-tick part of a [`SysclockSample`], supplied by the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubtickSample {
    pub cycles: u32,
    pub divisor: u32,
    pub core_frequency_hz: u32,
}

define_error! {
    /// Error type for the clock sleeps.
    ///
    /// Following POSIX usage, a sleep that lasted its entire duration
    /// reports `TimedOut`; this is the *normal* outcome of
    /// [`sysclock::sleep_for`].
    pub enum SleepError {
        Perm,
        Interrupted,
        TimedOut,
    }
}

/// Common implementation of the clock sleeps.
///
/// `succeed_on_event` selects the `wait_for` flavour, where a plain
/// [`Thread::wakeup`](super::Thread::wakeup) completes the wait
/// successfully instead of interrupting it.
fn sleep_on<System: Kernel>(
    pick_clock: fn(&'static super::State<System>) -> &'static ClockQueueState<System>,
    duration: TickDelta,
    succeed_on_event: bool,
) -> Result<(), SleepError> {
    expect_waitable_context::<System>().map_err(|PermError::Perm| SleepError::Perm)?;
    let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| SleepError::Perm)?;

    let clock = pick_clock(System::state());
    let at = clock.count.get(&*lock).wrapping_add(duration as Tick);

    match wait::wait_no_queue_timeout(
        lock.borrow_mut(),
        WaitPayload::Park,
        &clock.deadlines,
        at,
    ) {
        // Woken by an event (`Thread::wakeup`) before the deadline
        Ok(_) => {
            if succeed_on_event {
                Ok(())
            } else {
                Err(SleepError::Interrupted)
            }
        }
        Err(WaitError::TimedOut) => Err(SleepError::TimedOut),
        Err(WaitError::Interrupted) => Err(SleepError::Interrupted),
        Err(_) => unreachable!(),
    }
}

/// The tick-derived steady clock.
pub mod sysclock {
    use super::*;

    /// Tell the current time: the number of ticks since boot.
    ///
    /// # Panics
    ///
    /// Panics when called with the CPU Lock already held (a kernel
    /// critical section cannot nest this service).
    pub fn now<System: Kernel>() -> Tick {
        let lock = lock_cpu::<System>().expect("CPU Lock must be inactive");
        System::state().sysclock.count.get(&*lock)
    }

    /// Tell the detailed current time, including the sub-tick cycle count
    /// sampled from the port's tick timer.
    pub fn now_details<System: Kernel>() -> SysclockSample {
        let ticks = now::<System>();
        let sub = System::subtick_sample();
        SysclockSample {
            ticks,
            cycles: sub.cycles,
            divisor: sub.divisor,
            core_frequency_hz: sub.core_frequency_hz,
        }
    }

    /// Convert microseconds to ticks, rounding up.
    pub fn ticks_cast<System: KernelCfg>(microsec: u64) -> TickDelta {
        let numerator = (microsec as u128) * (System::TICK_FREQUENCY_HZ as u128);
        numerator.div_ceil(1_000_000u128) as TickDelta
    }

    /// Convert nanoseconds to ticks, rounding up. The nanosecond
    /// counterpart of [`ticks_cast`], for callers needing sub-microsecond
    /// deadlines.
    pub fn ticks_cast_ns<System: KernelCfg>(nanosec: u64) -> TickDelta {
        let numerator = (nanosec as u128) * (System::TICK_FREQUENCY_HZ as u128);
        numerator.div_ceil(1_000_000_000u128) as TickDelta
    }

    /// Put the current thread to sleep for the given number of ticks.
    ///
    /// Returns `Err(TimedOut)` when the sleep lasted the entire duration
    /// (the normal outcome), `Err(Interrupted)` when the sleep was cut
    /// short by a signal, a wake-up, or cancellation, and `Err(Perm)` in a
    /// non-waitable context.
    pub fn sleep_for<System: Kernel>(ticks: TickDelta) -> Result<(), SleepError> {
        sleep_on::<System>(|state| &state.sysclock, ticks, false)
    }

    /// Wait for an event with a timeout. Like [`sleep_for`], but a plain
    /// [`Thread::wakeup`](super::super::Thread::wakeup) completes the wait
    /// with `Ok(())`.
    pub fn wait_for<System: Kernel>(ticks: TickDelta) -> Result<(), SleepError> {
        sleep_on::<System>(|state| &state.sysclock, ticks, true)
    }
}

/// The seconds-counting wall clock.
pub mod rtclock {
    use super::*;

    /// Tell the current time: seconds since January 1st, 1970 00:00:00 (or
    /// since boot, if the clock was never initialised).
    ///
    /// # Panics
    ///
    /// Panics when called with the CPU Lock already held.
    pub fn now<System: Kernel>() -> Tick {
        let lock = lock_cpu::<System>().expect("CPU Lock must be inactive");
        System::state().rtclock.count.get(&*lock)
    }

    /// Initialise the clock with the current number of seconds since the
    /// epoch, typically read from a battery-backed RTC at startup.
    pub fn initialize<System: Kernel>(epoch_seconds: Tick) -> Result<(), PermError> {
        let mut lock = lock_cpu::<System>()?;
        System::state().rtclock.count.replace(&mut *lock, epoch_seconds);
        Ok(())
    }

    /// Put the current thread to sleep for the given number of seconds.
    /// Reports like [`sysclock::sleep_for`].
    pub fn sleep_for<System: Kernel>(secs: TickDelta) -> Result<(), SleepError> {
        sleep_on::<System>(|state| &state.rtclock, secs, false)
    }
}

/// The tick interrupt handler. The port must call this from the periodic
/// tick interrupt, with the CPU Lock inactive, at
/// [`KernelCfg::TICK_FREQUENCY_HZ`].
pub fn systick_handler<System: Kernel>() {
    let mut lock = lock_cpu::<System>().expect("CPU Lock must be inactive");
    let state = System::state();

    let now = state.sysclock.count.get(&*lock).wrapping_add(1);
    state.sysclock.count.replace(&mut *lock, now);

    timeout::expire_elapsed(lock.borrow_mut(), &state.sysclock.deadlines, now);
    timer::process_tick(lock.borrow_mut(), now);

    // A woken thread may outrank the interrupted one
    thread::unlock_cpu_and_check_preemption(lock);
}

/// The per-second RTC interrupt handler. The port must call this from the
/// RTC interrupt, with the CPU Lock inactive.
pub fn rtc_handler<System: Kernel>() {
    let mut lock = lock_cpu::<System>().expect("CPU Lock must be inactive");
    let state = System::state();

    let now = state.rtclock.count.get(&*lock).wrapping_add(1);
    state.rtclock.count.replace(&mut *lock, now);

    timeout::expire_elapsed(lock.borrow_mut(), &state.rtclock.deadlines, now);

    thread::unlock_cpu_and_check_preemption(lock);
}
