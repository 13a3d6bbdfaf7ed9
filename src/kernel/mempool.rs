//! Fixed-block memory pools.
//!
//! A pool hands out blocks of one fixed size from a caller-provided
//! storage region. Free blocks are threaded into an intrusive singly
//! linked list (the links live inside the free blocks themselves, as byte
//! offsets into the region), so the pool needs no bookkeeping storage of
//! its own. [`alloc`](MemPool::alloc) blocks in FIFO order when the pool
//! is exhausted; [`free`](MemPool::free) wakes the longest-waiting thread,
//! which re-polls the free list.
use core::{fmt, mem, ptr};

use super::{
    clock::TickDelta,
    error::{PermError, WaitError},
    state::expect_waitable_context,
    thread,
    utils::{lock_cpu, CpuLockCell, CpuLockGuardBorrowMut},
    wait::{QueueOrder, WaitPayload, WaitQueue},
    Kernel, KernelCfg,
};

/// A caller-provided storage region backing a [`MemPool`].
#[derive(Clone, Copy)]
pub struct PoolStorage {
    addr: *mut u8,
    size: usize,
}

// Safety: an inert (addr, size) pair; the region is only accessed under
// the pool's discipline
unsafe impl Send for PoolStorage {}
unsafe impl Sync for PoolStorage {}

impl PoolStorage {
    /// Construct a `PoolStorage` from a raw region.
    ///
    /// # Safety
    ///
    /// The region must be valid, writable, at least pointer-aligned, and
    /// used by nothing but the pool for the pool's whole life.
    pub const unsafe fn new(addr: *mut u8, size: usize) -> Self {
        Self { addr, size }
    }

    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for PoolStorage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PoolStorage")
            .field("addr", &self.addr)
            .field("size", &self.size)
            .finish()
    }
}

/// Memory pool attributes.
#[derive(Debug, Clone, Copy)]
pub struct MemPoolAttr {
    pub name: &'static str,
    pub storage: PoolStorage,
}

impl MemPoolAttr {
    pub const fn new(storage: PoolStorage) -> Self {
        Self { name: "-", storage }
    }

    pub const fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

/// Offset-encoded terminator of the free list.
const FREE_LIST_END: usize = usize::MAX;

/// A memory pool control block. Compares equal by identity.
pub struct MemPool<System: KernelCfg> {
    name: &'static str,
    storage: PoolStorage,
    /// The block size as requested.
    block_size: usize,
    /// The block stride: `block_size` rounded up to pointer alignment, so
    /// that a free-list link fits into any free block.
    padded_size: usize,
    block_count: usize,

    /// Offset of the first free block, or `FREE_LIST_END`. The free list
    /// is built lazily on first use (links cannot be written in a `const`
    /// constructor).
    free_head: CpuLockCell<System, usize>,
    initialized: CpuLockCell<System, bool>,

    /// The number of blocks currently handed out.
    allocated: CpuLockCell<System, usize>,

    wait_queue: WaitQueue<System>,
}

impl<System: KernelCfg> MemPool<System> {
    /// Construct a pool of `block_count` blocks of `block_size` bytes in
    /// `attr.storage`.
    ///
    /// # Panics
    ///
    /// Panics when either parameter is zero or the storage region is too
    /// small: it must hold `block_count` blocks of `block_size` bytes
    /// rounded up to pointer alignment.
    pub const fn new(attr: MemPoolAttr, block_count: usize, block_size: usize) -> Self {
        assert!(block_count > 0 && block_size > 0);
        let align = mem::size_of::<usize>();
        let padded_size = (block_size + align - 1) & !(align - 1);
        assert!(attr.storage.size >= padded_size * block_count);

        Self {
            name: if attr.name.is_empty() { "-" } else { attr.name },
            storage: attr.storage,
            block_size,
            padded_size,
            block_count,
            free_head: CpuLockCell::new(FREE_LIST_END),
            initialized: CpuLockCell::new(false),
            allocated: CpuLockCell::new(0),
            wait_queue: WaitQueue::new(QueueOrder::Fifo),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The block size, as requested at construction.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The total number of blocks.
    pub fn capacity(&self) -> usize {
        self.block_count
    }

    /// The start of the backing storage region.
    pub fn pool_address(&self) -> *mut u8 {
        self.storage.addr
    }
}

impl<System: KernelCfg> PartialEq for MemPool<System> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl<System: KernelCfg> Eq for MemPool<System> {}

impl<System: KernelCfg> fmt::Debug for MemPool<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemPool")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .finish()
    }
}

define_error! {
    /// Error type for [`MemPool::alloc`].
    pub enum AllocMemPoolError {
        Perm,
        Interrupted,
    }
}

define_error! {
    /// Error type for [`MemPool::try_alloc`].
    pub enum TryAllocMemPoolError {
        WouldBlock,
    }
}

define_error! {
    /// Error type for [`MemPool::timed_alloc`].
    pub enum TimedAllocMemPoolError {
        Perm,
        Interrupted,
        TimedOut,
    }
}

define_error! {
    /// Error type for [`MemPool::free`].
    pub enum FreeMemPoolError {
        /// The pointer does not address a block of this pool.
        Inval,
    }
}

impl<System: Kernel> MemPool<System> {
    /// Allocate a block, blocking the calling thread until one is
    /// available.
    pub fn alloc(&'static self) -> Result<*mut u8, AllocMemPoolError> {
        expect_waitable_context::<System>().map_err(|PermError::Perm| AllocMemPoolError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| AllocMemPoolError::Perm)?;

        loop {
            if let Some(block) = self.poll_alloc(lock.borrow_mut()) {
                return Ok(block);
            }
            // A `free` wakes us up; another thread (or an ISR `try_alloc`)
            // may beat us to the block, so re-poll
            match self.wait_queue.wait(lock.borrow_mut(), WaitPayload::MemPool) {
                Ok(_) => {}
                Err(WaitError::Interrupted) => return Err(AllocMemPoolError::Interrupted),
                Err(_) => unreachable!(),
            }
        }
    }

    /// Non-blocking version of [`alloc`](Self::alloc). Returns
    /// `Err(WouldBlock)` when no block is free.
    ///
    /// Safe to call from an interrupt handler.
    pub fn try_alloc(&'static self) -> Result<*mut u8, TryAllocMemPoolError> {
        let mut lock = match lock_cpu::<System>() {
            Ok(lock) => lock,
            Err(PermError::Perm) => return Err(TryAllocMemPoolError::WouldBlock),
        };
        self.poll_alloc(lock.borrow_mut())
            .ok_or(TryAllocMemPoolError::WouldBlock)
    }

    /// [`alloc`](Self::alloc) with a timeout, in ticks.
    pub fn timed_alloc(&'static self, ticks: TickDelta) -> Result<*mut u8, TimedAllocMemPoolError> {
        expect_waitable_context::<System>()
            .map_err(|PermError::Perm| TimedAllocMemPoolError::Perm)?;
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| TimedAllocMemPoolError::Perm)?;

        let at = System::state()
            .sysclock
            .count
            .get(&*lock)
            .wrapping_add(ticks as u64);

        loop {
            if let Some(block) = self.poll_alloc(lock.borrow_mut()) {
                return Ok(block);
            }
            match self
                .wait_queue
                .wait_timeout(lock.borrow_mut(), WaitPayload::MemPool, at)
            {
                Ok(_) => {}
                Err(WaitError::Interrupted) => return Err(TimedAllocMemPoolError::Interrupted),
                Err(WaitError::TimedOut) => return Err(TimedAllocMemPoolError::TimedOut),
                Err(_) => unreachable!(),
            }
        }
    }

    /// Return a block to the pool, waking the longest-waiting allocator if
    /// any.
    ///
    /// Safe to call from an interrupt handler.
    pub fn free(&'static self, block: *mut u8) -> Result<(), FreeMemPoolError> {
        let mut lock = match lock_cpu::<System>() {
            Ok(lock) => lock,
            Err(PermError::Perm) => return Err(FreeMemPoolError::Inval),
        };

        let offset = (block as usize).wrapping_sub(self.storage.addr as usize);
        if offset >= self.padded_size * self.block_count || offset % self.padded_size != 0 {
            return Err(FreeMemPoolError::Inval);
        }

        let head = self.free_head.get(&*lock);
        // Safety: `offset` addresses a block inside the storage region
        unsafe { self.write_link(offset, head) };
        self.free_head.replace(&mut *lock, offset);
        self.allocated
            .replace_with(&mut *lock, |n| n.saturating_sub(1));

        if self.wait_queue.wake_up_one(lock.borrow_mut()) {
            thread::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// The number of blocks currently allocated.
    pub fn count(&'static self) -> usize {
        match lock_cpu::<System>() {
            Ok(lock) => self.allocated.get(&*lock),
            Err(PermError::Perm) => 0,
        }
    }

    /// Is every block free?
    pub fn is_empty(&'static self) -> bool {
        self.count() == 0
    }

    /// Is every block allocated?
    pub fn is_full(&'static self) -> bool {
        self.count() == self.block_count
    }

    /// Return every block to the free list and wake all blocked
    /// allocators (they will re-poll and succeed).
    pub fn reset(&'static self) {
        if let Ok(mut lock) = lock_cpu::<System>() {
            self.build_free_list(lock.borrow_mut());
            self.allocated.replace(&mut *lock, 0);
            if self.wait_queue.wake_up_all(lock.borrow_mut()) {
                thread::unlock_cpu_and_check_preemption(lock);
            }
        }
    }

    /// Pop the first free block, building the free list on first use.
    fn poll_alloc(&'static self, mut lock: CpuLockGuardBorrowMut<'_, System>) -> Option<*mut u8> {
        if !self.initialized.replace(&mut **lock, true) {
            self.build_free_list(lock.borrow_mut());
        }

        let head = self.free_head.get(&**lock);
        if head == FREE_LIST_END {
            return None;
        }

        // Safety: `head` was placed on the free list, so it addresses a
        // valid free block holding a link
        let next = unsafe { self.read_link(head) };
        self.free_head.replace(&mut **lock, next);
        self.allocated.replace_with(&mut **lock, |n| *n + 1);

        // Safety: in-bounds offset into the storage region
        Some(unsafe { self.storage.addr.add(head) })
    }

    /// Thread the whole region into one free list.
    fn build_free_list(&'static self, mut lock: CpuLockGuardBorrowMut<'_, System>) {
        self.initialized.replace(&mut **lock, true);
        for i in 0..self.block_count {
            let offset = i * self.padded_size;
            let next = if i + 1 == self.block_count {
                FREE_LIST_END
            } else {
                offset + self.padded_size
            };
            // Safety: `offset` is in bounds and pointer-aligned
            unsafe { self.write_link(offset, next) };
        }
        self.free_head.replace(&mut **lock, 0);
    }

    /// # Safety
    ///
    /// `offset` must address a block inside the storage region.
    unsafe fn write_link(&self, offset: usize, next: usize) {
        // Safety: forwarded to the caller
        unsafe { ptr::write(self.storage.addr.add(offset) as *mut usize, next) };
    }

    /// # Safety
    ///
    /// `offset` must address a free block holding a link.
    unsafe fn read_link(&self, offset: usize) -> usize {
        // Safety: forwarded to the caller
        unsafe { ptr::read(self.storage.addr.add(offset) as *const usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{clock, sim, Thread, ThreadAttr};
    use super::*;
    use std::prelude::v1::*;

    fn noop(_: usize) -> usize {
        0
    }

    fn leak_storage(bytes: usize) -> PoolStorage {
        let buf: &'static mut Vec<u8> = Box::leak(Box::new(vec![0u8; bytes]));
        // Safety: the region is leaked, writable, and dedicated to the pool
        unsafe { PoolStorage::new(buf.as_mut_ptr(), bytes) }
    }

    #[test]
    fn alloc_free_invariants() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let storage = leak_storage(4 * 16);
        let pool: &'static MemPool<S> =
            Box::leak(Box::new(MemPool::new(MemPoolAttr::new(storage), 4, 10)));

        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.block_size(), 10);
        assert!(pool.is_empty());

        let base = pool.pool_address() as usize;
        let mut blocks = Vec::new();
        for i in 0..4 {
            let p = pool.try_alloc().unwrap();
            // Every block lies in the backing buffer at a block-aligned
            // offset
            let offset = p as usize - base;
            assert!(offset < 4 * 16);
            assert_eq!(offset % 16, 0);
            assert_eq!(pool.count(), i + 1);
            assert!(!blocks.contains(&p));
            blocks.push(p);
        }
        assert!(pool.is_full());
        assert_eq!(pool.try_alloc(), Err(TryAllocMemPoolError::WouldBlock));

        // A pointer from outside the pool is rejected
        let mut bogus = 0u8;
        assert_eq!(
            pool.free(&mut bogus as *mut u8),
            Err(FreeMemPoolError::Inval)
        );
        // ... and so is a misaligned one
        assert_eq!(
            pool.free((base + 3) as *mut u8),
            Err(FreeMemPoolError::Inval)
        );

        for (i, p) in blocks.into_iter().enumerate() {
            pool.free(p).unwrap();
            assert_eq!(pool.count(), 3 - i);
        }
        assert!(pool.is_empty());
    }

    #[test]
    fn blocking_alloc_woken_by_free() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let storage = leak_storage(2 * 8);
        let pool: &'static MemPool<S> =
            Box::leak(Box::new(MemPool::new(MemPoolAttr::new(storage), 2, 8)));

        let a = pool.alloc().unwrap() as usize;
        let _b = pool.alloc().unwrap();
        assert!(pool.is_full());

        // An interrupt frees a block while the allocator is parked
        sim::queue_isr::<S>(move || pool.free(a as *mut u8).unwrap());
        let c = pool.alloc().unwrap();
        assert_eq!(c as usize, a);
    }

    #[test]
    fn timed_alloc_expires() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let storage = leak_storage(8);
        let pool: &'static MemPool<S> =
            Box::leak(Box::new(MemPool::new(MemPoolAttr::new(storage), 1, 8)));

        pool.alloc().unwrap();
        for _ in 0..3 {
            sim::queue_isr::<S>(|| clock::systick_handler::<S>());
        }
        assert_eq!(pool.timed_alloc(3), Err(TimedAllocMemPoolError::TimedOut));
    }

    #[test]
    fn reset_reclaims_everything() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let storage = leak_storage(3 * 8);
        let pool: &'static MemPool<S> =
            Box::leak(Box::new(MemPool::new(MemPoolAttr::new(storage), 3, 8)));

        pool.try_alloc().unwrap();
        pool.try_alloc().unwrap();
        pool.reset();
        assert_eq!(pool.count(), 0);
        for _ in 0..3 {
            pool.try_alloc().unwrap();
        }
    }

    #[test]
    #[should_panic]
    fn undersized_storage_rejected() {
        sim_system!(S);
        let storage = leak_storage(8);
        // Two 8-byte blocks cannot fit in 8 bytes
        let _ = MemPool::<S>::new(MemPoolAttr::new(storage), 2, 8);
    }
}
