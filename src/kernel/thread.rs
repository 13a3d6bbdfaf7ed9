//! Threads.
//!
//! # Thread states
//!
//! A thread is in exactly one of the following states:
//!
//!  - **Undefined** — the control block was never constructed properly.
//!  - **Inactive** — constructed, not started yet.
//!  - **Ready** — runnable, queued in the ready set.
//!  - **Running** — currently scheduled to the CPU.
//!  - **Waiting** — blocked by one of the blocking services.
//!  - **Terminated** — exited or killed; waiting to be joined.
//!  - **Destroyed** — joined or detached-and-terminated; the control block
//!    (and the stack) may be reused by the owner.
//!
//! Transitions are performed under the CPU Lock. `Ready ⇄ Running` is the
//! scheduler's business ([`choose_next_running_thread`]); `Running →
//! Waiting` happens only through the blocking services; `Waiting → Ready`
//! is performed by wake-uppers (event arrival, timeout, interruption).
pub(in crate::kernel) mod readyqueue;

use core::{cell::UnsafeCell, convert::Infallible, fmt, ptr};

use super::{
    error::{PermError, WaitError},
    mutex, sig,
    state::{expect_thread_context, expect_waitable_context, scheduler},
    utils::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockGuardBorrowMut},
    wait,
    wait::WaitPayload,
    FlagsMask, Kernel, KernelCfg,
};
use crate::utils::{
    intrusive_list::{StaticLink, StaticListHead},
    Init,
};

/// Type of a variable holding a thread priority. Higher values represent
/// higher urgency; the levels usable by applications are
/// `priority::LOWEST ..= priority::highest::<System>()`.
pub type Priority = u8;

/// Thread priority levels.
///
/// The number of levels is `16 << PRIORITY_SHIFT` (16 by default, up to
/// 128). The two topmost levels and level 1 are reserved.
pub mod priority {
    use super::super::KernelCfg;
    use super::Priority;

    /// Undefined; a thread attribute with this priority receives
    /// [`normal`] when started.
    pub const NONE: Priority = 0;

    /// Reserved for the idle thread.
    pub const IDLE: Priority = 1;

    /// Lowest level available for user code.
    pub const LOWEST: Priority = 2;

    pub fn low<System: KernelCfg>() -> Priority {
        2 << System::PRIORITY_SHIFT
    }

    pub fn below_normal<System: KernelCfg>() -> Priority {
        4 << System::PRIORITY_SHIFT
    }

    /// Default priority.
    pub fn normal<System: KernelCfg>() -> Priority {
        6 << System::PRIORITY_SHIFT
    }

    pub fn above_normal<System: KernelCfg>() -> Priority {
        8 << System::PRIORITY_SHIFT
    }

    pub fn high<System: KernelCfg>() -> Priority {
        10 << System::PRIORITY_SHIFT
    }

    pub fn realtime<System: KernelCfg>() -> Priority {
        12 << System::PRIORITY_SHIFT
    }

    /// Highest level available for user code.
    pub fn highest<System: KernelCfg>() -> Priority {
        ((16 << System::PRIORITY_SHIFT) - 3) as Priority
    }

    /// Reserved for an ISR deferred-work thread.
    pub fn isr<System: KernelCfg>() -> Priority {
        ((16 << System::PRIORITY_SHIFT) - 2) as Priority
    }

    /// Reserved; marks a scheduling error.
    pub fn error<System: KernelCfg>() -> Priority {
        ((16 << System::PRIORITY_SHIFT) - 1) as Priority
    }

    /// The total number of priority levels.
    pub fn levels<System: KernelCfg>() -> usize {
        16 << System::PRIORITY_SHIFT
    }
}

/// A thread's stack region. The kernel never touches the memory itself;
/// it is handed to the port's stack initialiser.
#[derive(Clone, Copy)]
pub struct Stack {
    base: *mut u8,
    size: usize,
}

// Safety: `Stack` is an inert (base, size) pair; the region is only
// accessed by the port and by the thread it belongs to
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Construct a `Stack` from a raw region.
    ///
    /// # Safety
    ///
    /// The region `base ..= base + size` must be valid for the whole life
    /// of the thread using it and must not be used for anything else.
    pub const unsafe fn new(base: *mut u8, size: usize) -> Self {
        Self { base, size }
    }

    /// A zero-sized placeholder. A thread cannot be started with it.
    pub const fn empty() -> Self {
        Self {
            base: core::ptr::null_mut(),
            size: 0,
        }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Init for Stack {
    const INIT: Self = Self::empty();
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

/// Thread attributes: name, stack region, and initial priority.
#[derive(Debug, Clone, Copy)]
pub struct ThreadAttr {
    pub name: &'static str,
    pub priority: Priority,
    pub stack: Stack,
}

impl ThreadAttr {
    pub const fn new() -> Self {
        Self {
            name: "-",
            priority: priority::NONE,
            stack: Stack::empty(),
        }
    }

    pub const fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub const fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub const fn stack(mut self, stack: Stack) -> Self {
        self.stack = stack;
        self
    }
}

impl Init for ThreadAttr {
    const INIT: Self = Self::new();
}

impl Default for ThreadAttr {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread state machine. See the [module documentation](self).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Undefined,
    Inactive,
    Ready,
    Running,
    Waiting,
    Terminated,
    Destroyed,
}

impl Init for ThreadState {
    const INIT: Self = Self::Undefined;
}

/// A thread control block.
///
/// Constructed by the caller (usually in a `static`) and started with
/// [`Thread::start`]. Threads compare equal by identity.
#[repr(C)]
pub struct Thread<System: KernelCfg> {
    /// Port-specific per-thread state (saved context). Guaranteed to be
    /// placed at the beginning of the struct so that assembler code can
    /// refer to it easily.
    pub port_state: System::PortThreadState,

    pub(super) name: &'static str,
    pub(super) stack: Stack,
    pub(super) entry: fn(usize) -> usize,
    pub(super) entry_arg: usize,

    pub(super) st: CpuLockCell<System, ThreadState>,

    /// The priority assigned by the application.
    pub(super) base_priority: CpuLockCell<System, Priority>,

    /// The priority the scheduler sees: the base priority possibly boosted
    /// by mutex protocols (inheritance or ceiling).
    pub(super) effective_priority: CpuLockCell<System, Priority>,

    /// Membership link in the ready set.
    pub(super) link: CpuLockCell<System, Option<StaticLink<Self>>>,

    /// The wait state of the thread.
    pub(super) wait: wait::ThreadWait<System>,

    /// The thread's private signal-flag word.
    pub(super) sig_flags: CpuLockCell<System, FlagsMask>,

    /// The thread blocked in `join` on this thread, if any.
    pub(super) joiner: CpuLockCell<System, Option<&'static Thread<System>>>,

    pub(super) detached: CpuLockCell<System, bool>,

    /// A deferred cancellation request; observed by the next blocking call.
    pub(super) cancel_pending: CpuLockCell<System, bool>,

    pub(super) exit_value: CpuLockCell<System, usize>,

    /// The mutexes currently owned by this thread, used to restore the
    /// effective priority on unlock and to handle robustness on
    /// termination.
    pub(super) owned_mutexes: CpuLockCell<System, StaticListHead<mutex::Mutex<System>>>,

    user_storage: UnsafeCell<System::UserStorage>,
}

// Safety: the user storage is only ever accessed through the raw pointer
// returned by `user_storage`, by the thread it belongs to
unsafe impl<System: KernelCfg> Sync for Thread<System> where System::UserStorage: Send {}

impl<System: KernelCfg> Thread<System> {
    /// Construct a thread control block. The thread does not run until
    /// [`start`](Self::start) is called.
    pub const fn new(attr: ThreadAttr, entry: fn(usize) -> usize, entry_arg: usize) -> Self {
        Self {
            port_state: Init::INIT,
            name: if attr.name.is_empty() { "-" } else { attr.name },
            stack: attr.stack,
            entry,
            entry_arg,
            st: CpuLockCell::new(ThreadState::Inactive),
            base_priority: CpuLockCell::new(attr.priority),
            effective_priority: CpuLockCell::new(attr.priority),
            link: CpuLockCell::new(None),
            wait: wait::ThreadWait::INIT,
            sig_flags: CpuLockCell::new(0),
            joiner: CpuLockCell::new(None),
            detached: CpuLockCell::new(false),
            cancel_pending: CpuLockCell::new(false),
            exit_value: CpuLockCell::new(0),
            owned_mutexes: CpuLockCell::new(StaticListHead::new()),
            user_storage: UnsafeCell::new(Init::INIT),
        }
    }

    /// Get the thread's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the argument passed to the entry function.
    pub fn entry_arg(&self) -> usize {
        self.entry_arg
    }

    /// Get the address of the per-thread user storage.
    ///
    /// The storage is meant to be accessed only by the thread it belongs
    /// to; the kernel performs no synchronisation on it.
    pub fn user_storage(&self) -> *mut System::UserStorage {
        self.user_storage.get()
    }
}

impl<System: KernelCfg> PartialEq for Thread<System> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl<System: KernelCfg> Eq for Thread<System> {}

impl<System: KernelCfg> fmt::Debug for Thread<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .finish()
    }
}

define_error! {
    /// Error type for [`Thread::start`].
    pub enum StartThreadError {
        Perm,
        Inval,
        /// The thread was already started and has not terminated yet.
        Busy,
    }
}

define_error! {
    /// Error type for [`Thread::cancel`].
    pub enum CancelThreadError {
        Perm,
    }
}

define_error! {
    /// Error type for [`Thread::join`].
    pub enum JoinThreadError {
        Perm,
        Inval,
        Deadlock,
        Interrupted,
    }
}

define_error! {
    /// Error type for [`Thread::detach`].
    pub enum DetachThreadError {
        Perm,
        Inval,
    }
}

define_error! {
    /// Error type for [`Thread::kill`].
    pub enum KillThreadError {
        Perm,
        Inval,
    }
}

define_error! {
    /// Error type for [`Thread::set_sched_prio`].
    pub enum SetThreadPrioError {
        Perm,
        Inval,
    }
}

define_error! {
    /// Error type for [`this_thread::exit`].
    pub enum ExitThreadError {
        Perm,
    }
}

define_error! {
    /// Error type for [`this_thread::wait`].
    pub enum WaitThreadError {
        Perm,
        Interrupted,
    }
}

impl<System: Kernel> Thread<System> {
    /// Start the execution of the thread.
    ///
    /// The thread must be Inactive, or Terminated/Destroyed for reuse. If
    /// the attribute carried no priority, [`priority::normal`] is assigned.
    pub fn start(&'static self) -> Result<(), StartThreadError> {
        expect_thread_context::<System>().map_err(|PermError::Perm| StartThreadError::Perm)?;
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| StartThreadError::Perm)?;
        activate(lock.borrow_mut(), self, None)?;
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get the thread's scheduler state.
    pub fn state(&'static self) -> ThreadState {
        match lock_cpu::<System>() {
            Ok(lock) => self.st.get(&*lock),
            // Interrupts are already masked; someone upstack is inside a
            // kernel critical section and cannot be calling this
            Err(PermError::Perm) => ThreadState::Undefined,
        }
    }

    /// Request the cancellation of the thread. The request is deferred: it
    /// becomes visible at the thread's next blocking call, which returns
    /// [`ResultCode::Interrupted`](super::ResultCode::Interrupted).
    pub fn cancel(&'static self) -> Result<(), CancelThreadError> {
        expect_thread_context::<System>().map_err(|PermError::Perm| CancelThreadError::Perm)?;
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| CancelThreadError::Perm)?;
        self.cancel_pending.replace(&mut *lock, true);
        Ok(())
    }

    /// Check if a cancellation request is pending on the thread.
    pub fn interrupted(&'static self) -> bool {
        match lock_cpu::<System>() {
            Ok(lock) => self.cancel_pending.get(&*lock),
            Err(PermError::Perm) => false,
        }
    }

    /// Wait for the thread to terminate and reap it, returning its exit
    /// value. The storage may be reused afterwards.
    pub fn join(&'static self) -> Result<usize, JoinThreadError> {
        expect_waitable_context::<System>().map_err(|PermError::Perm| JoinThreadError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| JoinThreadError::Perm)?;

        let cur = System::state().running_thread().unwrap();
        if ptr::eq(cur, self) {
            return Err(JoinThreadError::Deadlock);
        }
        if self.detached.get(&*lock) {
            return Err(JoinThreadError::Inval);
        }

        match self.st.get(&*lock) {
            ThreadState::Terminated => {}
            ThreadState::Undefined | ThreadState::Inactive | ThreadState::Destroyed => {
                return Err(JoinThreadError::Inval);
            }
            ThreadState::Ready | ThreadState::Running | ThreadState::Waiting => {
                if self.joiner.get(&*lock).is_some() {
                    // Only one thread may wait for another's termination
                    return Err(JoinThreadError::Inval);
                }
                self.joiner.replace(&mut *lock, Some(cur));

                match wait::wait_no_queue(lock.borrow_mut(), WaitPayload::Join) {
                    Ok(_) => {}
                    Err(e) => {
                        // Renounce the joiner slot before reporting
                        if self.joiner.get(&*lock) == Some(cur) {
                            self.joiner.replace(&mut *lock, None);
                        }
                        return Err(match e {
                            WaitError::Interrupted => JoinThreadError::Interrupted,
                            _ => unreachable!(),
                        });
                    }
                }
            }
        }

        debug_assert_eq!(self.st.get(&*lock), ThreadState::Terminated);
        let value = self.exit_value.get(&*lock);
        self.st.replace(&mut *lock, ThreadState::Destroyed);
        Ok(value)
    }

    /// Mark the thread as detached: when it terminates, its control block
    /// transitions straight to Destroyed with no join necessary.
    pub fn detach(&'static self) -> Result<(), DetachThreadError> {
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| DetachThreadError::Perm)?;
        if self.joiner.get(&*lock).is_some() {
            return Err(DetachThreadError::Inval);
        }
        match self.st.get(&*lock) {
            ThreadState::Undefined | ThreadState::Destroyed => Err(DetachThreadError::Inval),
            ThreadState::Terminated => {
                self.st.replace(&mut *lock, ThreadState::Destroyed);
                Ok(())
            }
            _ => {
                self.detached.replace(&mut *lock, true);
                Ok(())
            }
        }
    }

    /// Force the termination of the thread. Killing the current thread is
    /// equivalent to exiting with value 0.
    pub fn kill(&'static self) -> Result<(), KillThreadError> {
        expect_thread_context::<System>().map_err(|PermError::Perm| KillThreadError::Perm)?;

        let state = System::state();
        if let Some(idle) = state.idle_thread() {
            if ptr::eq(idle, self) {
                return Err(KillThreadError::Inval);
            }
        }
        if let Some(cur) = state.running_thread() {
            if ptr::eq(cur, self) {
                match exit_current_thread::<System>(0)
                    .map_err(|ExitThreadError::Perm| KillThreadError::Perm)?
                {
                }
            }
        }

        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| KillThreadError::Perm)?;
        match self.st.get(&*lock) {
            ThreadState::Undefined => return Err(KillThreadError::Inval),
            ThreadState::Inactive | ThreadState::Terminated | ThreadState::Destroyed => {
                return Ok(())
            }
            ThreadState::Waiting => {
                wait::abandon_wait(lock.borrow_mut(), self);
            }
            ThreadState::Ready => {
                state.ready_queue.remove(lock.borrow_mut(), self);
            }
            // On a single core another thread cannot be Running
            ThreadState::Running => unreachable!(),
        }
        terminate_thread(lock.borrow_mut(), self);
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Wake the thread up.
    ///
    /// A thread suspended in [`this_thread::wait`] or a clock wait resumes
    /// normally; any other ongoing blocking call is interrupted and returns
    /// [`ResultCode::Interrupted`](super::ResultCode::Interrupted). Does
    /// nothing if the thread is not waiting.
    ///
    /// Safe to call from an interrupt handler.
    pub fn wakeup(&'static self) {
        if let Ok(mut lock) = lock_cpu::<System>() {
            if self.st.get(&*lock) == ThreadState::Waiting {
                let is_parked = wait::with_current_wait_payload(lock.borrow_mut(), self, |p| {
                    matches!(p, Some(WaitPayload::Park))
                });
                let result = if is_parked {
                    Ok(())
                } else {
                    Err(WaitError::Interrupted)
                };
                let _ = wait::interrupt_thread(lock.borrow_mut(), self, result);
                unlock_cpu_and_check_preemption(lock);
            }
        }
    }

    /// Get the thread's assigned (base) scheduling priority.
    pub fn sched_prio(&'static self) -> Priority {
        match lock_cpu::<System>() {
            Ok(lock) => self.base_priority.get(&*lock),
            Err(PermError::Perm) => priority::NONE,
        }
    }

    /// Change the thread's scheduling priority. The effective priority is
    /// recomputed, honouring any boost from owned mutexes.
    pub fn set_sched_prio(&'static self, prio: Priority) -> Result<(), SetThreadPrioError> {
        expect_thread_context::<System>().map_err(|PermError::Perm| SetThreadPrioError::Perm)?;
        if prio < priority::LOWEST || prio > priority::highest::<System>() {
            return Err(SetThreadPrioError::Inval);
        }
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| SetThreadPrioError::Perm)?;
        self.base_priority.replace(&mut *lock, prio);
        mutex::recompute_effective_priority(lock.borrow_mut(), self);
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Raise the thread's signal flags. See [`sig`].
    pub fn sig_raise(&'static self, mask: FlagsMask) -> Result<FlagsMask, sig::RaiseSigError> {
        sig::raise(self, mask)
    }

    /// Clear the thread's signal flags. See [`sig`].
    pub fn sig_clear(&'static self, mask: FlagsMask) -> Result<FlagsMask, sig::ClearSigError> {
        sig::clear(self, mask)
    }

    /// Get (and optionally clear) the thread's signal flags. See [`sig`].
    pub fn sig_get(&'static self, mask: FlagsMask, mode: super::FlagsMode) -> FlagsMask {
        sig::get(self, mask, mode)
    }
}

/// The function a port arranges to run when a thread is dispatched for the
/// first time. Calls the entry function and exits with its return value.
pub fn thread_entry_trampoline<System: Kernel>(thread: &'static Thread<System>) -> ! {
    let value = (thread.entry)(thread.entry_arg);
    match this_thread::exit::<System>(value) {
        Ok(never) => match never {},
        // `exit` only fails in a handler context; a thread body is not one
        Err(ExitThreadError::Perm) => unreachable!(),
    }
}

/// Resolve the priority a thread starts with: `forced` (for the reserved
/// system threads), the attribute priority, or the default.
///
/// Returns `Err(Inval)` for out-of-range priorities.
fn resolve_start_priority<System: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, System>,
    thread: &'static Thread<System>,
    forced: Option<Priority>,
) -> Result<Priority, StartThreadError> {
    if let Some(p) = forced {
        return Ok(p);
    }
    let p = match thread.base_priority.get(&**lock) {
        priority::NONE => priority::normal::<System>(),
        p => p,
    };
    if p < priority::LOWEST || p > priority::highest::<System>() {
        return Err(StartThreadError::Inval);
    }
    Ok(p)
}

/// Make a thread runnable for the first time (or for reuse). Used by
/// `Thread::start` and by `scheduler::initialize` (which forces the
/// reserved priorities).
pub(super) fn activate<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    thread: &'static Thread<System>,
    forced_priority: Option<Priority>,
) -> Result<(), StartThreadError> {
    match thread.st.get(&**lock) {
        ThreadState::Inactive | ThreadState::Terminated | ThreadState::Destroyed => {}
        _ => return Err(StartThreadError::Busy),
    }
    if thread.stack.size() == 0 {
        return Err(StartThreadError::Inval);
    }

    let pri = resolve_start_priority(lock.borrow_mut(), thread, forced_priority)?;
    thread.base_priority.replace(&mut **lock, pri);
    thread.effective_priority.replace(&mut **lock, pri);
    thread.sig_flags.replace(&mut **lock, 0);
    thread.joiner.replace(&mut **lock, None);
    thread.detached.replace(&mut **lock, false);
    thread.cancel_pending.replace(&mut **lock, false);

    // Safety: CPU Lock active, the thread is not executing
    unsafe { System::stack_init(thread) };

    make_ready(lock, thread);
    Ok(())
}

/// Transition the thread into the Ready state and enqueue it.
///
/// Doesn't do any cleanup for a previous state; callers are responsible
/// for dequeuing the thread from wherever it was.
pub(super) fn make_ready<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    thread: &'static Thread<System>,
) {
    thread.st.replace(&mut **lock, ThreadState::Ready);
    System::state().ready_queue.push_back(lock, thread);
}

/// Relinquish the CPU Lock. After that, if there's a ready thread with a
/// priority higher than the running one, pend a context switch.
///
/// Services that transition a thread into the Ready state call this before
/// returning to the caller. With the scheduler locked, the switch is
/// remembered in `switch_pending` instead.
pub(super) fn unlock_cpu_and_check_preemption<System: Kernel>(mut lock: CpuLockGuard<System>) {
    let state = System::state();

    if state.scheduler_locked() {
        state.switch_pending.replace(&mut *lock, true);
        return;
    }

    let prev_pri = state.running_thread().and_then(|t| {
        if t.st.get(&*lock) == ThreadState::Running {
            Some(t.effective_priority.get(&*lock) as usize)
        } else {
            None
        }
    });
    let next_pri = state.ready_queue.find_highest(lock.borrow_mut());

    // Relinquish the CPU Lock
    drop(lock);

    let preempt = match (prev_pri, next_pri) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(p), Some(n)) => n > p,
    };

    if preempt && scheduler::started::<System>() {
        // Safety: CPU Lock inactive
        unsafe { System::context_switch_request() };
    }
}

/// The scheduling decision: pick the highest-priority ready thread and make
/// it Running, preserving the current thread when it is of equal or higher
/// priority. Called from the port's context-switch handler by way of
/// [`state::reschedule`].
pub(super) fn choose_next_running_thread<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
) {
    let state = System::state();

    if state.scheduler_locked() {
        // No decisions while the scheduler is locked. The outermost
        // `scheduler::unlock` gets us called again.
        state.switch_pending.replace(&mut **lock, true);
        return;
    }

    let prev = state.running_thread();
    let prev_pri = match prev {
        Some(t) if t.st.get(&**lock) == ThreadState::Running => {
            Some(t.effective_priority.get(&**lock) as usize)
        }
        _ => None,
    };

    let next_pri = match state.ready_queue.find_highest(lock.borrow_mut()) {
        Some(p) => p,
        None => return,
    };
    if let Some(p) = prev_pri {
        // A thread of equal priority does not take over the current one;
        // round-robin happens only through `this_thread::yield_now`
        if p >= next_pri {
            return;
        }
    }

    let next = state
        .ready_queue
        .pop_front_at(lock.borrow_mut(), next_pri)
        .unwrap();
    next.st.replace(&mut **lock, ThreadState::Running);

    if let Some(prev_t) = prev {
        match prev_t.st.get(&**lock) {
            // Preempted: back to the ready set, at the tail of its level
            ThreadState::Running => make_ready(lock.borrow_mut(), prev_t),
            // Blocked, yielded (already queued), or terminated
            _ => {}
        }
    }

    state.set_running_thread(Some(next));
}

/// Transition the currently running thread into the Waiting state. Returns
/// when woken up.
///
/// The current context must be waitable (this function doesn't check that).
pub(super) fn wait_until_woken_up<System: Kernel>(lock: CpuLockGuardBorrowMut<'_, System>) {
    debug_assert_eq!(expect_waitable_context::<System>(), Ok(()));

    let running = System::state().running_thread().unwrap();
    debug_assert_eq!(running.st.get(&**lock), ThreadState::Running);
    running.st.replace(&mut **lock, ThreadState::Waiting);

    loop {
        // Pend a context switch with interrupts briefly enabled so that it
        // can be taken. Execution resumes here when the thread is
        // dispatched again.
        lock.temporarily_release(|| {
            // Safety: CPU Lock inactive inside `temporarily_release`
            unsafe { System::context_switch_request() }
        });

        if running.st.get(&**lock) == ThreadState::Running {
            break;
        }
    }
}

/// Change a thread's effective priority, repositioning it in the ready set
/// if necessary. A Waiting thread keeps its wait-queue position (priority
/// inheritance never reorders wait queues).
pub(super) fn set_effective_priority<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    thread: &'static Thread<System>,
    new: Priority,
) {
    let old = thread.effective_priority.get(&**lock);
    if old == new {
        return;
    }
    thread.effective_priority.replace(&mut **lock, new);
    if thread.st.get(&**lock) == ThreadState::Ready {
        System::state()
            .ready_queue
            .reorder(lock, thread, new as usize, old as usize);
    }
}

/// Terminate a thread that is in no queue: release its mutexes, then wake
/// its joiner or destroy it.
fn terminate_thread<System: Kernel>(
    mut lock: CpuLockGuardBorrowMut<'_, System>,
    thread: &'static Thread<System>,
) {
    mutex::abandon_held_mutexes(lock.borrow_mut(), thread);

    if thread.detached.get(&**lock) {
        thread.st.replace(&mut **lock, ThreadState::Destroyed);
    } else {
        thread.st.replace(&mut **lock, ThreadState::Terminated);
        if let Some(joiner) = thread.joiner.replace(&mut **lock, None) {
            let _ = wait::interrupt_thread(lock.borrow_mut(), joiner, Ok(()));
        }
    }
}

/// Implements [`this_thread::exit`].
pub(super) fn exit_current_thread<System: Kernel>(
    value: usize,
) -> Result<Infallible, ExitThreadError> {
    if System::in_handler_mode() {
        return Err(ExitThreadError::Perm);
    }

    let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| ExitThreadError::Perm)?;
    let state = System::state();

    // An exiting thread cannot keep the scheduler locked
    state.force_scheduler_unlocked();

    let running = state.running_thread().expect("no running thread");
    running.exit_value.replace(&mut *lock, value);
    terminate_thread(lock.borrow_mut(), running);
    state.set_running_thread(None);

    choose_next_running_thread(lock.borrow_mut());
    let next = state.running_thread().expect("no runnable thread");

    // The dispatcher takes over the CPU Lock
    lock.forget();

    // Safety: CPU Lock active; the current execution context is dead and
    // will never be resumed
    unsafe { System::dispatch_to(next) }
}

/// Services operating on the current thread.
pub mod this_thread {
    use super::*;

    /// Get the currently running thread. In a handler context, this is the
    /// interrupted thread (if any).
    pub fn current<System: Kernel>() -> Option<&'static Thread<System>> {
        System::state().running_thread()
    }

    /// Relinquish the CPU to the next ready thread of the same priority.
    /// The current thread moves to the tail of its priority level. No-op
    /// when the scheduler is locked or not started, or in a handler.
    pub fn yield_now<System: Kernel>() {
        if System::in_handler_mode()
            || !scheduler::started::<System>()
            || System::state().scheduler_locked()
        {
            return;
        }
        let mut lock = match lock_cpu::<System>() {
            Ok(lock) => lock,
            Err(PermError::Perm) => return,
        };
        let running = System::state().running_thread().unwrap();
        // Joining the tail of its own level; `choose_next_running_thread`
        // will pick the level's front, which is another thread if one is
        // ready
        make_ready(lock.borrow_mut(), running);
        drop(lock);
        // Safety: CPU Lock inactive
        unsafe { System::context_switch_request() };
    }

    /// Terminate the current thread with the given exit value.
    pub fn exit<System: Kernel>(value: usize) -> Result<Infallible, ExitThreadError> {
        exit_current_thread::<System>(value)
    }

    /// Suspend the current thread until [`Thread::wakeup`] is called on it.
    /// Returns `Err(Interrupted)` if woken by a signal or cancelled.
    pub fn wait<System: Kernel>() -> Result<(), WaitThreadError> {
        expect_waitable_context::<System>().map_err(|PermError::Perm| WaitThreadError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| WaitThreadError::Perm)?;
        match wait::wait_no_queue(lock.borrow_mut(), WaitPayload::Park) {
            Ok(_) => Ok(()),
            Err(WaitError::Interrupted) => Err(WaitThreadError::Interrupted),
            Err(_) => unreachable!(),
        }
    }

    /// Check if the previous wait ended because its entire duration
    /// elapsed.
    pub fn is_timeout<System: Kernel>() -> bool {
        if let (Some(t), Ok(lock)) = (current::<System>(), lock_cpu::<System>()) {
            wait::last_wake_was_timeout(&lock, t)
        } else {
            false
        }
    }

    pub use super::super::sig::{sig_wait, timed_sig_wait, try_sig_wait};
}

#[cfg(test)]
mod tests {
    use super::super::sim;
    use super::*;

    fn noop(_: usize) -> usize {
        0
    }

    #[test]
    fn priority_ladder_shift_0() {
        sim_system!(S);
        assert_eq!(priority::NONE, 0);
        assert_eq!(priority::IDLE, 1);
        assert_eq!(priority::LOWEST, 2);
        assert_eq!(priority::normal::<S>(), 6);
        assert_eq!(priority::high::<S>(), 10);
        assert_eq!(priority::highest::<S>(), 13);
        assert_eq!(priority::isr::<S>(), 14);
        assert_eq!(priority::error::<S>(), 15);
        assert_eq!(priority::levels::<S>(), 16);
    }

    #[test]
    fn priority_ladder_shift_3() {
        sim_system!(S, shift = 3);
        assert_eq!(priority::normal::<S>(), 48);
        assert_eq!(priority::highest::<S>(), 125);
        assert_eq!(priority::isr::<S>(), 126);
        assert_eq!(priority::error::<S>(), 127);
        assert_eq!(priority::levels::<S>(), 128);
    }

    #[test]
    fn boot_selects_main() {
        sim_system!(S);
        static MAIN: Thread<S> =
            Thread::new(ThreadAttr::new().name("main").stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> =
            Thread::new(ThreadAttr::new().name("idle").stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        assert_eq!(MAIN.state(), ThreadState::Running);
        assert_eq!(IDLE.state(), ThreadState::Ready);
        assert_eq!(MAIN.sched_prio(), priority::normal::<S>());
        assert_eq!(IDLE.sched_prio(), priority::IDLE);
        assert_eq!(MAIN.name(), "main");
        assert!(core::ptr::eq(this_thread::current::<S>().unwrap(), &MAIN));
        assert!(MAIN == MAIN);
        assert!(MAIN != IDLE);
    }

    #[test]
    fn higher_priority_thread_preempts() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let high: &'static Thread<S> = std::boxed::Box::leak(std::boxed::Box::new(Thread::new(
            ThreadAttr::new()
                .name("high")
                .priority(priority::high::<S>())
                .stack(sim::dummy_stack()),
            noop,
            0,
        )));
        high.start().unwrap();

        // The higher-priority thread took over; the old running thread
        // rejoined the ready set
        assert!(core::ptr::eq(S::state().running_thread().unwrap(), high));
        assert_eq!(MAIN.state(), ThreadState::Ready);
    }

    #[test]
    fn equal_priority_is_fifo_with_yield() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static PEER: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        PEER.start().unwrap();
        // Equal priority does not preempt
        assert_eq!(MAIN.state(), ThreadState::Running);

        // A voluntary yield moves the current thread to the tail of its
        // level; the peer runs next
        this_thread::yield_now::<S>();
        assert!(core::ptr::eq(S::state().running_thread().unwrap(), &PEER));
        assert_eq!(MAIN.state(), ThreadState::Ready);

        this_thread::yield_now::<S>();
        assert!(core::ptr::eq(S::state().running_thread().unwrap(), &MAIN));
    }

    #[test]
    fn start_validates() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        // Reserved priorities are rejected
        let bad: &'static Thread<S> = std::boxed::Box::leak(std::boxed::Box::new(Thread::new(
            ThreadAttr::new()
                .priority(priority::isr::<S>())
                .stack(sim::dummy_stack()),
            noop,
            0,
        )));
        assert_eq!(bad.start(), Err(StartThreadError::Inval));

        // A missing stack is rejected
        let no_stack: &'static Thread<S> =
            std::boxed::Box::leak(std::boxed::Box::new(Thread::new(ThreadAttr::new(), noop, 0)));
        assert_eq!(no_stack.start(), Err(StartThreadError::Inval));

        // Starting a live thread again is rejected
        static PEER: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        PEER.start().unwrap();
        assert_eq!(PEER.start(), Err(StartThreadError::Busy));
    }

    #[test]
    fn join_errors() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static NEVER: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        assert_eq!(MAIN.join(), Err(JoinThreadError::Deadlock));
        assert_eq!(NEVER.join(), Err(JoinThreadError::Inval));
    }

    #[test]
    fn kill_then_join_reaps() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static VICTIM: Thread<S> = Thread::new(
            ThreadAttr::new()
                .priority(priority::LOWEST)
                .stack(sim::dummy_stack()),
            noop,
            0,
        );
        sim::boot::<S>(&MAIN, &IDLE);

        VICTIM.start().unwrap();
        assert_eq!(VICTIM.state(), ThreadState::Ready);

        VICTIM.kill().unwrap();
        assert_eq!(VICTIM.state(), ThreadState::Terminated);

        // The victim never ran, so the exit value is the default
        assert_eq!(VICTIM.join(), Ok(0));
        assert_eq!(VICTIM.state(), ThreadState::Destroyed);

        // The control block can be reused now
        VICTIM.start().unwrap();
        assert_eq!(VICTIM.state(), ThreadState::Ready);
    }

    #[test]
    fn kill_idle_rejected() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        assert_eq!(IDLE.kill(), Err(KillThreadError::Inval));
    }

    #[test]
    fn detach_then_kill_destroys() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static VICTIM: Thread<S> = Thread::new(
            ThreadAttr::new()
                .priority(priority::LOWEST)
                .stack(sim::dummy_stack()),
            noop,
            0,
        );
        sim::boot::<S>(&MAIN, &IDLE);

        VICTIM.start().unwrap();
        VICTIM.detach().unwrap();
        VICTIM.kill().unwrap();
        assert_eq!(VICTIM.state(), ThreadState::Destroyed);
        assert_eq!(VICTIM.join(), Err(JoinThreadError::Inval));
    }

    #[test]
    fn cancellation_is_deferred_to_blocking_call() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        MAIN.cancel().unwrap();
        assert!(MAIN.interrupted());

        // The request surfaces at the next blocking call, without parking
        assert_eq!(this_thread::wait::<S>(), Err(WaitThreadError::Interrupted));

        // ... and is consumed by it
        assert!(!MAIN.interrupted());
    }

    #[test]
    fn set_sched_prio() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        MAIN.set_sched_prio(priority::high::<S>()).unwrap();
        assert_eq!(MAIN.sched_prio(), priority::high::<S>());

        assert_eq!(
            MAIN.set_sched_prio(priority::IDLE),
            Err(SetThreadPrioError::Inval)
        );
        assert_eq!(
            MAIN.set_sched_prio(priority::error::<S>()),
            Err(SetThreadPrioError::Inval)
        );
    }

    #[test]
    fn wait_and_wakeup() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        sim::queue_isr::<S>(|| MAIN.wakeup());
        assert_eq!(this_thread::wait::<S>(), Ok(()));

        // Waking a thread that is not waiting is a no-op
        MAIN.wakeup();
        assert_eq!(MAIN.state(), ThreadState::Running);
    }
}
