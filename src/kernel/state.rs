//! The kernel state singleton and the scheduler service.
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use super::{
    clock, error::PermError, thread, thread::readyqueue::BitmapQueue, thread::Thread, timer,
    utils::{lock_cpu, CpuLockCell}, Kernel, KernelCfg,
};
use crate::utils::Init;

/// The process-wide kernel state of one system type.
///
/// Exactly one instance exists per system type; [`KernelCfg::state`] returns
/// it. It must be initialised by [`scheduler::initialize`] before any other
/// kernel object is operated on.
pub struct State<System: KernelCfg> {
    /// The currently running thread, or, in a handler context, the
    /// interrupted thread. `null` until the scheduler picks the first
    /// thread.
    running_thread: AtomicPtr<Thread<System>>,

    /// The idle thread registered by [`scheduler::initialize`].
    idle_thread: AtomicPtr<Thread<System>>,

    /// Set by [`scheduler::start`]. Never cleared.
    started: AtomicBool,

    /// The scheduler lock nesting depth. While non-zero, no context switch
    /// takes place.
    lock_depth: AtomicU32,

    /// A reschedule was requested while the scheduler was locked. Checked
    /// by the outermost [`scheduler::unlock`].
    pub(super) switch_pending: CpuLockCell<System, bool>,

    /// The ready set: per-priority FIFO queues plus an occupancy bitmap.
    pub(super) ready_queue: BitmapQueue<System>,

    /// Tick clock state: tick counter and deadline queue.
    pub(super) sysclock: clock::ClockQueueState<System>,

    /// Real-time clock state: seconds counter and deadline queue.
    pub(super) rtclock: clock::ClockQueueState<System>,

    /// User timer state.
    pub(super) timers: timer::TimerState<System>,
}

impl<System: KernelCfg> State<System> {
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<System: KernelCfg> Init for State<System> {
    const INIT: Self = Self {
        running_thread: Init::INIT,
        idle_thread: Init::INIT,
        started: Init::INIT,
        lock_depth: AtomicU32::new(0),
        switch_pending: Init::INIT,
        ready_queue: Init::INIT,
        sysclock: Init::INIT,
        rtclock: Init::INIT,
        timers: Init::INIT,
    };
}

impl<System: KernelCfg> Default for State<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<System: Kernel> State<System> {
    /// Get the currently running thread. In a handler context, this is the
    /// interrupted thread (if any).
    pub fn running_thread(&self) -> Option<&'static Thread<System>> {
        let ptr = self.running_thread.load(Ordering::Relaxed) as *const Thread<System>;
        // Safety: The pointer was derived from a `&'static` in
        // `set_running_thread`
        unsafe { ptr.as_ref() }
    }

    pub(super) fn set_running_thread(&self, thread: Option<&'static Thread<System>>) {
        let ptr = thread.map_or(core::ptr::null_mut(), |t| t as *const _ as *mut _);
        self.running_thread.store(ptr, Ordering::Relaxed);
    }

    pub(super) fn idle_thread(&self) -> Option<&'static Thread<System>> {
        let ptr = self.idle_thread.load(Ordering::Relaxed) as *const Thread<System>;
        // Safety: Ditto
        unsafe { ptr.as_ref() }
    }

    pub(super) fn scheduler_locked(&self) -> bool {
        self.lock_depth.load(Ordering::Relaxed) != 0
    }

    /// Drop the scheduler lock unconditionally. Used on the thread-exit
    /// path, which cannot leave the scheduler locked behind.
    pub(super) fn force_scheduler_unlocked(&self) {
        self.lock_depth.store(0, Ordering::Relaxed);
    }
}

/// If the current context is not a thread context, return `Err(Perm)`.
pub(super) fn expect_thread_context<System: Kernel>() -> Result<(), PermError> {
    if System::in_handler_mode() {
        Err(PermError::Perm)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable (a thread context with the
/// scheduler unlocked), return `Err(Perm)`.
pub(super) fn expect_waitable_context<System: Kernel>() -> Result<(), PermError> {
    if System::in_handler_mode() || System::state().scheduler_locked() {
        Err(PermError::Perm)
    } else {
        Ok(())
    }
}

/// Test-only: mark the scheduler started and make the first scheduling
/// decision without dispatching (the simulator has no contexts to switch).
#[cfg(test)]
pub(crate) fn start_for_test<System: Kernel>() {
    let state = System::state();
    state.started.store(true, Ordering::Relaxed);
    let mut lock = lock_cpu::<System>().expect("CPU Lock must be inactive");
    thread::choose_next_running_thread(lock.borrow_mut());
}

/// Entry point for the port's context-switch handler.
///
/// The handler must save the context of the thread that was running, call
/// this function with the CPU Lock inactive, and then restore the context
/// of the new [`State::running_thread`].
pub fn reschedule<System: Kernel>() {
    let mut lock = lock_cpu::<System>().expect("CPU Lock must be inactive");
    thread::choose_next_running_thread(lock.borrow_mut());
}

/// The scheduler service.
pub mod scheduler {
    use super::*;

    /// The scheduler lock status returned by [`lock`] and accepted by
    /// [`unlock`] — the previous nesting depth.
    pub type SchedulerStatus = u32;

    define_error! {
        /// Error type for [`scheduler::initialize`](initialize).
        pub enum InitializeError {
            Perm,
            Inval,
        }
    }

    /// Register the main and idle threads and make them ready.
    ///
    /// This must be called exactly once, before any kernel object is used.
    /// `idle` must have priority [`priority::IDLE`](super::thread::priority::IDLE)
    /// (or none, in which case it is assigned); its entry function should
    /// loop on [`Port::idle_wait`](crate::kernel::Port::idle_wait). The
    /// stacks are supplied by the caller; the port sizes the main stack
    /// according to [`KernelCfg::MAIN_STACK_SIZE_BYTES`].
    ///
    /// [`KernelCfg::MAIN_STACK_SIZE_BYTES`]: crate::kernel::KernelCfg::MAIN_STACK_SIZE_BYTES
    pub fn initialize<System: Kernel>(
        main: &'static Thread<System>,
        idle: &'static Thread<System>,
    ) -> Result<(), InitializeError> {
        expect_thread_context::<System>().map_err(|PermError::Perm| InitializeError::Perm)?;

        if System::PRIORITY_SHIFT > 3 || started::<System>() {
            return Err(InitializeError::Inval);
        }

        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| InitializeError::Perm)?;
        let state = System::state();

        if state.idle_thread().is_some() {
            return Err(InitializeError::Inval);
        }

        thread::activate(lock.borrow_mut(), idle, Some(thread::priority::IDLE))
            .map_err(|_| InitializeError::Inval)?;
        thread::activate(lock.borrow_mut(), main, None).map_err(|_| InitializeError::Inval)?;

        state
            .idle_thread
            .store(idle as *const _ as *mut _, Ordering::Relaxed);

        Ok(())
    }

    /// Start the scheduler: transfer control to the highest-priority ready
    /// thread. Never returns.
    ///
    /// # Panics
    ///
    /// Panics if called from a handler context or before [`initialize`].
    pub fn start<System: Kernel>() -> ! {
        assert!(!System::in_handler_mode(), "must be started from a thread context");

        let state = System::state();
        assert!(state.idle_thread().is_some(), "scheduler is not initialized");

        let mut lock = lock_cpu::<System>().expect("CPU Lock must be inactive");
        state.started.store(true, Ordering::Relaxed);

        thread::choose_next_running_thread(lock.borrow_mut());
        let first = state.running_thread().expect("no runnable thread");

        // The dispatcher takes over the CPU Lock and releases it when the
        // first thread starts running
        lock.forget();

        // Safety: CPU Lock active
        unsafe { System::dispatch_to(first) }
    }

    /// Check if the scheduler was started.
    pub fn started<System: Kernel>() -> bool {
        System::state().started.load(Ordering::Relaxed)
    }

    /// Check if the scheduler is locked.
    pub fn locked<System: Kernel>() -> bool {
        System::state().scheduler_locked()
    }

    /// Lock the scheduler, suspending context switches until the matching
    /// [`unlock`]. Nestable; returns the previous status.
    pub fn lock<System: Kernel>() -> SchedulerStatus {
        System::state().lock_depth.fetch_add(1, Ordering::Relaxed)
    }

    /// Restore the scheduler status saved by [`lock`]. The outermost call
    /// re-enables rescheduling and performs any switch that became pending
    /// while the scheduler was locked.
    pub fn unlock<System: Kernel>(status: SchedulerStatus) {
        let state = System::state();
        state.lock_depth.store(status, Ordering::Relaxed);

        if status != 0 {
            return;
        }

        if let Ok(mut lock) = lock_cpu::<System>() {
            if state.switch_pending.replace(&mut *lock, false) {
                thread::unlock_cpu_and_check_preemption(lock);
            }
        }
    }

    /// Check if the CPU is in handler mode.
    pub fn in_handler_mode<System: Kernel>() -> bool {
        System::in_handler_mode()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{
        sim,
        thread::{priority, this_thread},
        Thread, ThreadAttr, ThreadState,
    };
    use super::*;

    fn noop(_: usize) -> usize {
        0
    }

    #[test]
    fn lock_is_nestable() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        assert!(!scheduler::locked::<S>());
        let outer = scheduler::lock::<S>();
        assert_eq!(outer, 0);
        assert!(scheduler::locked::<S>());

        let inner = scheduler::lock::<S>();
        assert_eq!(inner, 1);
        scheduler::unlock::<S>(inner);
        assert!(scheduler::locked::<S>());

        scheduler::unlock::<S>(outer);
        assert!(!scheduler::locked::<S>());
    }

    #[test]
    fn preemption_deferred_while_locked() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static HIGH: Thread<S> = Thread::new(
            ThreadAttr::new().priority(10).stack(sim::dummy_stack()),
            noop,
            0,
        );
        sim::boot::<S>(&MAIN, &IDLE);

        let status = scheduler::lock::<S>();

        // The newly readied higher-priority thread must not run yet
        HIGH.start().unwrap();
        assert_eq!(MAIN.state(), ThreadState::Running);
        assert_eq!(HIGH.state(), ThreadState::Ready);

        // The outermost unlock performs the pending switch
        scheduler::unlock::<S>(status);
        assert!(core::ptr::eq(S::state().running_thread().unwrap(), &HIGH));
        assert_eq!(MAIN.state(), ThreadState::Ready);
    }

    #[test]
    fn blocking_rejected_while_locked() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let status = scheduler::lock::<S>();
        assert_eq!(
            this_thread::wait::<S>(),
            Err(super::super::thread::WaitThreadError::Perm)
        );
        scheduler::unlock::<S>(status);
    }

    #[test]
    fn initialize_validates() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);

        assert!(!scheduler::started::<S>());
        sim::boot::<S>(&MAIN, &IDLE);
        assert!(scheduler::started::<S>());

        // A second initialisation is rejected
        assert_eq!(
            scheduler::initialize::<S>(&MAIN, &IDLE),
            Err(scheduler::InitializeError::Inval)
        );

        // ... and so is one from a handler
        sim::with_handler_mode::<S>(|| {
            assert_eq!(
                scheduler::initialize::<S>(&MAIN, &IDLE),
                Err(scheduler::InitializeError::Perm)
            );
            assert!(scheduler::in_handler_mode::<S>());
        });
    }

    #[test]
    fn idle_priority_forced() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        // The idle attribute may carry no priority; `initialize` forces it
        static IDLE: Thread<S> = Thread::new(
            ThreadAttr::new().priority(priority::NONE).stack(sim::dummy_stack()),
            noop,
            0,
        );
        sim::boot::<S>(&MAIN, &IDLE);
        assert_eq!(IDLE.sched_prio(), priority::IDLE);
    }
}
