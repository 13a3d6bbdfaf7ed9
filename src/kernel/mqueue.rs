//! Priority message queues.
//!
//! A bounded queue of fixed-size messages, each tagged with a priority.
//! Messages are received highest-priority first, FIFO among equal
//! priorities. Senders block (FIFO) when the queue is full, receivers
//! block (FIFO) when it is empty; at most one of the two wait lists can be
//! non-empty at any moment.
//!
//! The caller provides the storage region; [`MQueue::storage_size`]
//! computes the size it must have for a given capacity and message size.
//! The region holds a slot header array (free-list/order links, lengths,
//! priorities) followed by the payload slots.
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

/// Type of message priorities. Higher values are delivered first.
pub type MsgPrio = u8;

/// A caller-provided storage region backing a [`MQueue`].
#[derive(Clone, Copy)]
pub struct QueueStorage {
    addr: *mut u8,
    size: usize,
}

// Safety: an inert (addr, size) pair; the region is only accessed under
// the queue's discipline
unsafe impl Send for QueueStorage {}
unsafe impl Sync for QueueStorage {}

impl QueueStorage {
    /// Construct a `QueueStorage` from a raw region.
    ///
    /// # Safety
    ///
    /// The region must be valid, writable, pointer-aligned, and used by
    /// nothing but the queue for the queue's whole life.
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

impl fmt::Debug for QueueStorage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueStorage")
            .field("addr", &self.addr)
            .field("size", &self.size)
            .finish()
    }
}

/// Message queue attributes.
#[derive(Debug, Clone, Copy)]
pub struct MQueueAttr {
    pub name: &'static str,
    pub storage: QueueStorage,
}

impl MQueueAttr {
    pub const fn new(storage: QueueStorage) -> Self {
        Self { name: "-", storage }
    }

    pub const fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

/// Per-slot metadata kept in the storage region.
#[repr(C)]
#[derive(Clone, Copy)]
struct SlotHeader {
    /// The next slot in whichever index list this slot is on (the free
    /// list or the message order), or [`SLOT_END`].
    next: u16,
    /// The payload length of the stored message.
    len: u16,
    /// The message priority.
    prio: MsgPrio,
}

/// Index-list terminator.
const SLOT_END: u16 = u16::MAX;

/// A message queue control block. Compares equal by identity.
pub struct MQueue<System: KernelCfg> {
    name: &'static str,
    storage: QueueStorage,
    capacity: usize,
    msg_size: usize,

    /// The first free slot, or `SLOT_END`. Built lazily on first use.
    free_head: CpuLockCell<System, u16>,
    initialized: CpuLockCell<System, bool>,

    /// The stored messages, linked through their headers in delivery
    /// order: descending priority, FIFO among equals.
    msg_head: CpuLockCell<System, u16>,

    /// The number of stored messages.
    count: CpuLockCell<System, usize>,

    /// Threads blocked in `send` (queue full), in FIFO order.
    send_wait: WaitQueue<System>,

    /// Threads blocked in `receive` (queue empty), in FIFO order.
    recv_wait: WaitQueue<System>,
}

impl<System: KernelCfg> MQueue<System> {
    /// The storage size required for `capacity` messages of `msg_size`
    /// bytes.
    pub const fn storage_size(capacity: usize, msg_size: usize) -> usize {
        let headers = capacity * mem::size_of::<SlotHeader>();
        let align = mem::size_of::<usize>();
        let headers = (headers + align - 1) & !(align - 1);
        headers + capacity * msg_size
    }

    /// Construct a queue of `capacity` messages of `msg_size` bytes in
    /// `attr.storage`.
    ///
    /// # Panics
    ///
    /// Panics when either parameter is zero, `capacity` exceeds `65534`,
    /// or the storage region is smaller than
    /// [`storage_size`](Self::storage_size) asks for.
    pub const fn new(attr: MQueueAttr, capacity: usize, msg_size: usize) -> Self {
        assert!(capacity > 0 && msg_size > 0);
        assert!(capacity < SLOT_END as usize);
        assert!(attr.storage.size >= Self::storage_size(capacity, msg_size));

        Self {
            name: if attr.name.is_empty() { "-" } else { attr.name },
            storage: attr.storage,
            capacity,
            msg_size,
            free_head: CpuLockCell::new(SLOT_END),
            initialized: CpuLockCell::new(false),
            msg_head: CpuLockCell::new(SLOT_END),
            count: CpuLockCell::new(0),
            send_wait: WaitQueue::new(QueueOrder::Fifo),
            recv_wait: WaitQueue::new(QueueOrder::Fifo),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The maximum number of stored messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The fixed message size, in bytes.
    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    fn header_ptr(&self, slot: u16) -> *mut SlotHeader {
        // Safety of arithmetic: `slot < capacity`, checked by the callers
        unsafe { (self.storage.addr as *mut SlotHeader).add(slot as usize) }
    }

    fn payload_ptr(&self, slot: u16) -> *mut u8 {
        let headers = self.capacity * mem::size_of::<SlotHeader>();
        let align = mem::size_of::<usize>();
        let headers = (headers + align - 1) & !(align - 1);
        unsafe { self.storage.addr.add(headers + slot as usize * self.msg_size) }
    }

    fn read_header(&self, slot: u16) -> SlotHeader {
        // Safety: in-bounds, aligned, initialised by `build_free_list`
        unsafe { ptr::read(self.header_ptr(slot)) }
    }

    fn write_header(&self, slot: u16, header: SlotHeader) {
        // Safety: in-bounds and aligned
        unsafe { ptr::write(self.header_ptr(slot), header) };
    }
}

impl<System: KernelCfg> PartialEq for MQueue<System> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl<System: KernelCfg> Eq for MQueue<System> {}

impl<System: KernelCfg> fmt::Debug for MQueue<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MQueue")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .finish()
    }
}

define_error! {
    /// Error type for [`MQueue::send`].
    pub enum SendMQueueError {
        Perm,
        /// The message is longer than the queue's message size.
        MsgSize,
        Interrupted,
    }
}

define_error! {
    /// Error type for [`MQueue::try_send`].
    pub enum TrySendMQueueError {
        MsgSize,
        WouldBlock,
    }
}

define_error! {
    /// Error type for [`MQueue::timed_send`].
    pub enum TimedSendMQueueError {
        Perm,
        MsgSize,
        Interrupted,
        TimedOut,
    }
}

define_error! {
    /// Error type for [`MQueue::receive`].
    pub enum ReceiveMQueueError {
        Perm,
        /// The buffer is smaller than the queue's message size.
        MsgSize,
        /// A stored message failed its integrity check.
        BadMsg,
        Interrupted,
    }
}

define_error! {
    /// Error type for [`MQueue::try_receive`].
    pub enum TryReceiveMQueueError {
        MsgSize,
        BadMsg,
        WouldBlock,
    }
}

define_error! {
    /// Error type for [`MQueue::timed_receive`].
    pub enum TimedReceiveMQueueError {
        Perm,
        MsgSize,
        BadMsg,
        Interrupted,
        TimedOut,
    }
}

impl<System: Kernel> MQueue<System> {
    /// Enqueue a copy of `msg` with the given priority, blocking the
    /// calling thread while the queue is full. Wakes a blocked receiver.
    pub fn send(&'static self, msg: &[u8], prio: MsgPrio) -> Result<(), SendMQueueError> {
        if msg.len() > self.msg_size {
            return Err(SendMQueueError::MsgSize);
        }
        expect_waitable_context::<System>().map_err(|PermError::Perm| SendMQueueError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| SendMQueueError::Perm)?;

        loop {
            if self.poll_send(lock.borrow_mut(), msg, prio) {
                thread::unlock_cpu_and_check_preemption(lock);
                return Ok(());
            }
            match self
                .send_wait
                .wait(lock.borrow_mut(), WaitPayload::MQueueSend)
            {
                Ok(_) => {}
                Err(WaitError::Interrupted) => return Err(SendMQueueError::Interrupted),
                Err(_) => unreachable!(),
            }
        }
    }

    /// Non-blocking version of [`send`](Self::send).
    ///
    /// Safe to call from an interrupt handler.
    pub fn try_send(&'static self, msg: &[u8], prio: MsgPrio) -> Result<(), TrySendMQueueError> {
        if msg.len() > self.msg_size {
            return Err(TrySendMQueueError::MsgSize);
        }
        let mut lock = match lock_cpu::<System>() {
            Ok(lock) => lock,
            Err(PermError::Perm) => return Err(TrySendMQueueError::WouldBlock),
        };
        if self.poll_send(lock.borrow_mut(), msg, prio) {
            thread::unlock_cpu_and_check_preemption(lock);
            Ok(())
        } else {
            Err(TrySendMQueueError::WouldBlock)
        }
    }

    /// [`send`](Self::send) with a timeout, in ticks.
    pub fn timed_send(
        &'static self,
        msg: &[u8],
        prio: MsgPrio,
        ticks: TickDelta,
    ) -> Result<(), TimedSendMQueueError> {
        if msg.len() > self.msg_size {
            return Err(TimedSendMQueueError::MsgSize);
        }
        expect_waitable_context::<System>()
            .map_err(|PermError::Perm| TimedSendMQueueError::Perm)?;
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| TimedSendMQueueError::Perm)?;

        let at = System::state()
            .sysclock
            .count
            .get(&*lock)
            .wrapping_add(ticks as u64);

        loop {
            if self.poll_send(lock.borrow_mut(), msg, prio) {
                thread::unlock_cpu_and_check_preemption(lock);
                return Ok(());
            }
            match self
                .send_wait
                .wait_timeout(lock.borrow_mut(), WaitPayload::MQueueSend, at)
            {
                Ok(_) => {}
                Err(WaitError::Interrupted) => return Err(TimedSendMQueueError::Interrupted),
                Err(WaitError::TimedOut) => return Err(TimedSendMQueueError::TimedOut),
                Err(_) => unreachable!(),
            }
        }
    }

    /// Dequeue the highest-priority, oldest message into `buf`, blocking
    /// the calling thread while the queue is empty. Wakes a blocked
    /// sender. Returns the payload length and the message priority.
    pub fn receive(&'static self, buf: &mut [u8]) -> Result<(usize, MsgPrio), ReceiveMQueueError> {
        if buf.len() < self.msg_size {
            return Err(ReceiveMQueueError::MsgSize);
        }
        expect_waitable_context::<System>()
            .map_err(|PermError::Perm| ReceiveMQueueError::Perm)?;
        let mut lock = lock_cpu::<System>().map_err(|PermError::Perm| ReceiveMQueueError::Perm)?;

        loop {
            match self.poll_receive(lock.borrow_mut(), buf) {
                Ok(Some(received)) => {
                    thread::unlock_cpu_and_check_preemption(lock);
                    return Ok(received);
                }
                Ok(None) => {}
                Err(BadMsg) => return Err(ReceiveMQueueError::BadMsg),
            }
            match self
                .recv_wait
                .wait(lock.borrow_mut(), WaitPayload::MQueueRecv)
            {
                Ok(_) => {}
                Err(WaitError::Interrupted) => return Err(ReceiveMQueueError::Interrupted),
                Err(_) => unreachable!(),
            }
        }
    }

    /// Non-blocking version of [`receive`](Self::receive).
    ///
    /// Safe to call from an interrupt handler.
    pub fn try_receive(
        &'static self,
        buf: &mut [u8],
    ) -> Result<(usize, MsgPrio), TryReceiveMQueueError> {
        if buf.len() < self.msg_size {
            return Err(TryReceiveMQueueError::MsgSize);
        }
        let mut lock = match lock_cpu::<System>() {
            Ok(lock) => lock,
            Err(PermError::Perm) => return Err(TryReceiveMQueueError::WouldBlock),
        };
        match self.poll_receive(lock.borrow_mut(), buf) {
            Ok(Some(received)) => {
                thread::unlock_cpu_and_check_preemption(lock);
                Ok(received)
            }
            Ok(None) => Err(TryReceiveMQueueError::WouldBlock),
            Err(BadMsg) => Err(TryReceiveMQueueError::BadMsg),
        }
    }

    /// [`receive`](Self::receive) with a timeout, in ticks.
    pub fn timed_receive(
        &'static self,
        buf: &mut [u8],
        ticks: TickDelta,
    ) -> Result<(usize, MsgPrio), TimedReceiveMQueueError> {
        if buf.len() < self.msg_size {
            return Err(TimedReceiveMQueueError::MsgSize);
        }
        expect_waitable_context::<System>()
            .map_err(|PermError::Perm| TimedReceiveMQueueError::Perm)?;
        let mut lock =
            lock_cpu::<System>().map_err(|PermError::Perm| TimedReceiveMQueueError::Perm)?;

        let at = System::state()
            .sysclock
            .count
            .get(&*lock)
            .wrapping_add(ticks as u64);

        loop {
            match self.poll_receive(lock.borrow_mut(), buf) {
                Ok(Some(received)) => {
                    thread::unlock_cpu_and_check_preemption(lock);
                    return Ok(received);
                }
                Ok(None) => {}
                Err(BadMsg) => return Err(TimedReceiveMQueueError::BadMsg),
            }
            match self
                .recv_wait
                .wait_timeout(lock.borrow_mut(), WaitPayload::MQueueRecv, at)
            {
                Ok(_) => {}
                Err(WaitError::Interrupted) => return Err(TimedReceiveMQueueError::Interrupted),
                Err(WaitError::TimedOut) => return Err(TimedReceiveMQueueError::TimedOut),
                Err(_) => unreachable!(),
            }
        }
    }

    /// The number of currently stored messages.
    pub fn length(&'static self) -> usize {
        match lock_cpu::<System>() {
            Ok(lock) => self.count.get(&*lock),
            Err(PermError::Perm) => 0,
        }
    }

    pub fn is_empty(&'static self) -> bool {
        self.length() == 0
    }

    pub fn is_full(&'static self) -> bool {
        self.length() == self.capacity
    }

    /// Discard every stored message and wake all blocked senders with
    /// [`Interrupted`](super::ResultCode::Interrupted). Blocked receivers
    /// are left waiting: they will see an empty queue and keep blocking
    /// per their original discipline.
    pub fn reset(&'static self) {
        if let Ok(mut lock) = lock_cpu::<System>() {
            self.build_free_list(lock.borrow_mut());
            self.msg_head.replace(&mut *lock, SLOT_END);
            self.count.replace(&mut *lock, 0);
            if self
                .send_wait
                .wake_up_all_result(lock.borrow_mut(), Err(WaitError::Interrupted))
            {
                thread::unlock_cpu_and_check_preemption(lock);
            }
        }
    }

    /// Store a message if a slot is free, inserting it into the delivery
    /// order and waking one receiver. Returns `false` when full.
    fn poll_send(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        msg: &[u8],
        prio: MsgPrio,
    ) -> bool {
        self.ensure_initialized(lock.borrow_mut());

        let slot = self.free_head.get(&**lock);
        if slot == SLOT_END {
            return false;
        }
        self.free_head.replace(&mut **lock, self.read_header(slot).next);

        // Safety: the payload slot is in bounds and disjoint from `msg`
        unsafe {
            ptr::copy_nonoverlapping(msg.as_ptr(), self.payload_ptr(slot), msg.len());
        }

        // Find the insertion position: after every message of equal or
        // higher priority
        let mut prev = SLOT_END;
        let mut cursor = self.msg_head.get(&**lock);
        while cursor != SLOT_END {
            let header = self.read_header(cursor);
            if header.prio < prio {
                break;
            }
            prev = cursor;
            cursor = header.next;
        }

        self.write_header(
            slot,
            SlotHeader {
                next: cursor,
                len: msg.len() as u16,
                prio,
            },
        );
        if prev == SLOT_END {
            self.msg_head.replace(&mut **lock, slot);
        } else {
            let mut prev_header = self.read_header(prev);
            prev_header.next = slot;
            self.write_header(prev, prev_header);
        }

        self.count.replace_with(&mut **lock, |n| *n + 1);

        self.recv_wait.wake_up_one(lock);
        true
    }

    /// Extract the front message into `buf`, waking one sender. Returns
    /// `Ok(None)` when the queue is empty.
    fn poll_receive(
        &'static self,
        mut lock: CpuLockGuardBorrowMut<'_, System>,
        buf: &mut [u8],
    ) -> Result<Option<(usize, MsgPrio)>, BadMsg> {
        self.ensure_initialized(lock.borrow_mut());

        let slot = self.msg_head.get(&**lock);
        if slot == SLOT_END {
            return Ok(None);
        }

        let header = self.read_header(slot);
        if header.len as usize > self.msg_size {
            return Err(BadMsg);
        }

        self.msg_head.replace(&mut **lock, header.next);

        // Safety: the payload slot is in bounds and disjoint from `buf`
        unsafe {
            ptr::copy_nonoverlapping(self.payload_ptr(slot), buf.as_mut_ptr(), header.len as usize);
        }

        // Return the slot to the free list
        self.write_header(
            slot,
            SlotHeader {
                next: self.free_head.get(&**lock),
                len: 0,
                prio: 0,
            },
        );
        self.free_head.replace(&mut **lock, slot);
        self.count.replace_with(&mut **lock, |n| n.saturating_sub(1));

        self.send_wait.wake_up_one(lock);
        Ok(Some((header.len as usize, header.prio)))
    }

    fn ensure_initialized(&'static self, mut lock: CpuLockGuardBorrowMut<'_, System>) {
        if !self.initialized.replace(&mut **lock, true) {
            self.build_free_list(lock);
        }
    }

    /// Chain every slot into the free list.
    fn build_free_list(&'static self, mut lock: CpuLockGuardBorrowMut<'_, System>) {
        self.initialized.replace(&mut **lock, true);
        for i in 0..self.capacity {
            let next = if i + 1 == self.capacity {
                SLOT_END
            } else {
                (i + 1) as u16
            };
            self.write_header(
                i as u16,
                SlotHeader {
                    next,
                    len: 0,
                    prio: 0,
                },
            );
        }
        self.free_head.replace(&mut **lock, 0);
    }
}

/// Marker for a failed message integrity check.
struct BadMsg;

#[cfg(test)]
mod tests {
    use super::super::{clock, sim, Thread, ThreadAttr};
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::prelude::v1::*;

    fn noop(_: usize) -> usize {
        0
    }

    fn leak_storage(bytes: usize) -> QueueStorage {
        let buf: &'static mut Vec<u8> = Box::leak(Box::new(vec![0u8; bytes]));
        // Safety: the region is leaked, writable, and dedicated to the queue
        unsafe { QueueStorage::new(buf.as_mut_ptr(), bytes) }
    }

    fn leak_queue<System: crate::kernel::Kernel>(
        capacity: usize,
        msg_size: usize,
    ) -> &'static MQueue<System> {
        let storage = leak_storage(MQueue::<System>::storage_size(capacity, msg_size));
        Box::leak(Box::new(MQueue::new(
            MQueueAttr::new(storage),
            capacity,
            msg_size,
        )))
    }

    #[test]
    fn priority_then_fifo_order() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let q = leak_queue::<S>(4, 4);
        q.try_send(b"aaa", 3).unwrap();
        q.try_send(b"bbb", 7).unwrap();
        q.try_send(b"ccc", 3).unwrap();
        assert_eq!(q.length(), 3);

        let mut buf = [0u8; 4];
        assert_eq!(q.try_receive(&mut buf), Ok((3, 7)));
        assert_eq!(&buf[..3], b"bbb");
        assert_eq!(q.try_receive(&mut buf), Ok((3, 3)));
        assert_eq!(&buf[..3], b"aaa");
        assert_eq!(q.try_receive(&mut buf), Ok((3, 3)));
        assert_eq!(&buf[..3], b"ccc");
        assert!(q.is_empty());
    }

    #[test]
    fn size_checks() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let q = leak_queue::<S>(2, 4);
        assert_eq!(q.msg_size(), 4);
        assert_eq!(q.capacity(), 2);

        assert_eq!(q.try_send(b"12345", 0), Err(TrySendMQueueError::MsgSize));
        assert_eq!(q.send(b"12345", 0), Err(SendMQueueError::MsgSize));

        q.try_send(b"1234", 0).unwrap();
        let mut small = [0u8; 3];
        assert_eq!(
            q.try_receive(&mut small),
            Err(TryReceiveMQueueError::MsgSize)
        );
    }

    #[test]
    fn full_and_empty_probes() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let q = leak_queue::<S>(2, 2);
        let mut buf = [0u8; 2];
        assert_eq!(q.try_receive(&mut buf), Err(TryReceiveMQueueError::WouldBlock));

        q.try_send(b"a", 0).unwrap();
        q.try_send(b"b", 0).unwrap();
        assert!(q.is_full());
        assert_eq!(q.try_send(b"c", 0), Err(TrySendMQueueError::WouldBlock));
    }

    #[test]
    fn blocking_receive_woken_by_isr_send() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let q = leak_queue::<S>(2, 4);
        sim::queue_isr::<S>(move || q.try_send(b"ping", 5).unwrap());

        let mut buf = [0u8; 4];
        assert_eq!(q.receive(&mut buf), Ok((4, 5)));
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn timed_send_expires_when_full() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let q = leak_queue::<S>(1, 2);
        q.try_send(b"x", 0).unwrap();

        for _ in 0..3 {
            sim::queue_isr::<S>(|| clock::systick_handler::<S>());
        }
        assert_eq!(
            q.timed_send(b"y", 0, 3),
            Err(TimedSendMQueueError::TimedOut)
        );
    }

    #[test]
    fn reset_empties_and_wakes_senders() {
        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        sim::boot::<S>(&MAIN, &IDLE);

        let q = leak_queue::<S>(1, 2);
        q.try_send(b"x", 0).unwrap();

        // A blocked sender is woken with `Interrupted` when the queue is
        // reset
        sim::queue_isr::<S>(move || q.reset());
        assert_eq!(q.send(b"y", 0), Err(SendMQueueError::Interrupted));
        assert!(q.is_empty());
    }

    /// Model test: any send sequence is received in descending priority,
    /// FIFO among equal priorities.
    #[quickcheck]
    fn model(messages: Vec<u8>) {
        let _ = env_logger::builder().is_test(true).try_init();

        sim_system!(S);
        static MAIN: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        static IDLE: Thread<S> = Thread::new(ThreadAttr::new().stack(sim::dummy_stack()), noop, 0);
        // The simulator state is per-system-type but `quickcheck` reruns
        // this function; boot only once
        static BOOTED: std::sync::Once = std::sync::Once::new();
        BOOTED.call_once(|| sim::boot::<S>(&MAIN, &IDLE));

        let messages: Vec<u8> = messages.into_iter().take(16).collect();
        log::debug!("messages = {:?}", messages);

        let q = leak_queue::<S>(16, 1);
        for (i, prio) in messages.iter().enumerate() {
            q.try_send(&[i as u8], *prio).unwrap();
        }

        // The reference order: stable sort by descending priority
        let mut expected: Vec<(u8, u8)> = messages
            .iter()
            .enumerate()
            .map(|(i, prio)| (*prio, i as u8))
            .collect();
        expected.sort_by_key(|(prio, _)| core::cmp::Reverse(*prio));

        for (prio, index) in expected {
            let mut buf = [0u8; 1];
            assert_eq!(q.try_receive(&mut buf), Ok((1, prio)));
            assert_eq!(buf[0], index);
        }
        assert!(q.is_empty());
    }
}
