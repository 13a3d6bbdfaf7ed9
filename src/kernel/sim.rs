//! A hosted simulator port for unit tests.
//!
//! Each test declares its own system type with [`sim_system!`], giving it
//! an isolated `State` singleton, so tests can run in parallel. The test
//! body plays the role of the running thread's code; interrupt activity is
//! modelled by *deferred actions*: closures queued with [`queue_isr`] that
//! the simulator pops and runs (in handler mode) whenever the kernel pends
//! a context switch. A blocked "thread" therefore wakes exactly the way it
//! would on hardware — from an interrupt that fires while it is parked.
use std::{boxed::Box, prelude::v1::*, sync::Mutex, vec::Vec};

use super::{state, thread::Stack, thread::ThreadState, Kernel};

type Action = Box<dyn FnOnce() + Send>;

/// The per-system simulator state.
pub(crate) struct SimState {
    pub masked: core::sync::atomic::AtomicBool,
    pub handler: core::sync::atomic::AtomicBool,
    actions: Mutex<Vec<Action>>,
}

impl SimState {
    pub const fn new() -> Self {
        Self {
            masked: core::sync::atomic::AtomicBool::new(false),
            handler: core::sync::atomic::AtomicBool::new(false),
            actions: Mutex::new(Vec::new()),
        }
    }
}

/// Queue a closure to run as a simulated interrupt at the next context
/// switch opportunity.
pub(crate) fn queue_isr<System: Kernel + HasSimState>(f: impl FnOnce() + Send + 'static) {
    System::sim().actions.lock().unwrap().push(Box::new(f));
}

/// Glue implemented by `sim_system!`-generated types.
pub(crate) trait HasSimState {
    fn sim() -> &'static SimState;
}

/// The simulator's realisation of a pended context switch: run one queued
/// "interrupt", then make the scheduling decision.
pub(crate) fn run_switch<System: Kernel + HasSimState>() {
    use core::sync::atomic::Ordering;

    let sim = System::sim();
    let action = {
        let mut actions = sim.actions.lock().unwrap();
        if actions.is_empty() {
            None
        } else {
            Some(actions.remove(0))
        }
    };

    match action {
        Some(action) => {
            // Nested switches (an interrupt waking a higher-priority
            // thread) re-enter this function, so save-and-restore rather
            // than set-and-clear
            let prev = sim.handler.swap(true, Ordering::Relaxed);
            action();
            sim.handler.store(prev, Ordering::Relaxed);
        }
        None => {
            // Detect the point where nothing can ever happen again: no
            // interrupts are queued, and the test thread is parked with
            // nothing but the idle thread left to run
            let state = System::state();
            let stuck = match state.running_thread() {
                Some(t) if t.state() == ThreadState::Waiting => true,
                Some(t)
                    if state
                        .idle_thread()
                        .map_or(false, |idle| core::ptr::eq(idle, t)) =>
                {
                    let mut lock =
                        super::utils::lock_cpu::<System>().expect("CPU Lock must be inactive");
                    let highest = state.ready_queue.find_highest(lock.borrow_mut());
                    highest.map_or(true, |p| p <= super::thread::priority::IDLE as usize)
                }
                _ => false,
            };
            if stuck {
                panic!("simulated deadlock: thread parked with no pending interrupts");
            }
        }
    }

    state::reschedule::<System>();
}

/// Initialise the scheduler with the given main/idle control blocks and
/// make the first scheduling decision. The calling test then acts as the
/// main thread.
pub(crate) fn boot<System: Kernel>(
    main: &'static super::Thread<System>,
    idle: &'static super::Thread<System>,
) {
    state::scheduler::initialize::<System>(main, idle).unwrap();
    state::start_for_test::<System>();
    assert!(core::ptr::eq(
        System::state().running_thread().unwrap(),
        main
    ));
}

/// A stack placeholder for simulated threads; the region is never touched
/// (the simulator's `stack_init` is a no-op and simulated threads never
/// execute).
pub(crate) const fn dummy_stack() -> Stack {
    // Safety: see above — the bogus region is never dereferenced
    unsafe { Stack::new(0x1000 as *mut u8, 1024) }
}

/// Run `f` with the simulated CPU in handler mode.
pub(crate) fn with_handler_mode<System: Kernel + HasSimState>(f: impl FnOnce()) {
    use core::sync::atomic::Ordering;
    System::sim().handler.store(true, Ordering::Relaxed);
    f();
    System::sim().handler.store(false, Ordering::Relaxed);
}

/// Declare a simulator system type with its own isolated kernel state.
macro_rules! sim_system {
    ($name:ident) => {
        sim_system!($name, 0);
    };
    ($name:ident, shift = $shift:expr) => {
        sim_system!($name, $shift);
    };
    ($name:ident, $shift:expr) => {
        struct $name;

        impl $crate::kernel::sim::HasSimState for $name {
            fn sim() -> &'static $crate::kernel::sim::SimState {
                static SIM: $crate::kernel::sim::SimState = $crate::kernel::sim::SimState::new();
                &SIM
            }
        }

        unsafe impl $crate::kernel::Port for $name {
            type InterruptStatus = bool;
            type PortThreadState = ();

            unsafe fn interrupts_mask() -> bool {
                use $crate::kernel::sim::HasSimState;
                Self::sim()
                    .masked
                    .swap(true, core::sync::atomic::Ordering::Relaxed)
            }

            unsafe fn interrupts_restore(status: bool) {
                use $crate::kernel::sim::HasSimState;
                Self::sim()
                    .masked
                    .store(status, core::sync::atomic::Ordering::Relaxed);
            }

            fn interrupts_masked() -> bool {
                use $crate::kernel::sim::HasSimState;
                Self::sim()
                    .masked
                    .load(core::sync::atomic::Ordering::Relaxed)
            }

            fn in_handler_mode() -> bool {
                use $crate::kernel::sim::HasSimState;
                Self::sim()
                    .handler
                    .load(core::sync::atomic::Ordering::Relaxed)
            }

            unsafe fn context_switch_request() {
                $crate::kernel::sim::run_switch::<Self>();
            }

            unsafe fn stack_init(_thread: &'static $crate::kernel::Thread<Self>) {}

            unsafe fn dispatch_to(_thread: &'static $crate::kernel::Thread<Self>) -> ! {
                unreachable!("the simulator cannot dispatch contexts")
            }

            unsafe fn idle_wait() {
                panic!("simulated deadlock: the system went idle");
            }
        }

        unsafe impl $crate::kernel::PortTimer for $name {}

        unsafe impl $crate::kernel::KernelCfg for $name {
            const PRIORITY_SHIFT: u32 = $shift;
            type UserStorage = ();

            fn state() -> &'static $crate::kernel::State<Self> {
                static STATE: $crate::kernel::State<$name> = $crate::kernel::State::new();
                &STATE
            }
        }
    };
}
