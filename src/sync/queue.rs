//! # Message Queue
//!
//! Fixed capacity, fixed item size, copy-in/copy-out FIFO. Storage is one
//! circular byte buffer:
//!
//! ```text
//!   storage: [ slot0 | slot1 | slot2 | slot3 ]
//!                      ▲head            ▲head + len (mod capacity)
//! ```
//!
//! `len + spaces == capacity` holds after every operation. Items are
//! copied, so nothing in the queue borrows from the sender.

use alloc::boxed::Box;
use alloc::vec;

use crate::arch::Port;
use crate::config::OBJECT_OVERHEAD;
use crate::error::{KernelError, Result};
use crate::isr::IsrContext;
use crate::kernel::{Kernel, TaskContext, Wait};
use crate::sync::{QueueId, WaitList};
use crate::task::{CoreId, WaitObject, WakeOutcome};
use crate::time::Timeout;

/// A value that can travel through a queue as a fixed number of bytes.
pub trait QueueItem: Sized {
    /// Encoded size; must equal the queue's item size.
    const SIZE: usize;

    fn encode(&self, out: &mut [u8]);
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_queue_item {
    ($($t:ty),*) => {
        $(
            impl QueueItem for $t {
                const SIZE: usize = core::mem::size_of::<$t>();

                fn encode(&self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; core::mem::size_of::<$t>()];
                    raw.copy_from_slice(bytes);
                    <$t>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_queue_item!(u8, u16, u32, u64, i8, i16, i32, i64);

impl<const N: usize> QueueItem for [u8; N] {
    const SIZE: usize = N;

    fn encode(&self, out: &mut [u8]) {
        out.copy_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; N];
        raw.copy_from_slice(bytes);
        raw
    }
}

pub(crate) fn encode_item<T: QueueItem>(item: &T) -> Box<[u8]> {
    let mut bytes = vec![0u8; T::SIZE].into_boxed_slice();
    item.encode(&mut bytes);
    bytes
}

#[derive(Debug)]
pub struct QueueControlBlock {
    storage: Box<[u8]>,
    item_size: usize,
    capacity: usize,
    head: usize,
    len: usize,
    /// Tasks blocked in receive; only non-empty while the queue is empty.
    pub receivers: WaitList,
    /// Tasks blocked in send, each with its item parked on its TCB.
    pub senders: WaitList,
}

/// Bytes of ring storage for `capacity` items of `item_size` bytes.
pub(crate) fn storage_bytes(capacity: usize, item_size: usize) -> Result<usize> {
    capacity
        .checked_mul(item_size)
        .ok_or(KernelError::ResourceExhausted)
}

impl QueueControlBlock {
    pub fn new(capacity: usize, item_size: usize) -> Result<Self> {
        Ok(Self {
            storage: vec![0u8; storage_bytes(capacity, item_size)?].into_boxed_slice(),
            item_size,
            capacity,
            head: 0,
            len: 0,
            receivers: WaitList::new(),
            senders: WaitList::new(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    #[inline]
    pub fn spaces(&self) -> usize {
        self.capacity - self.len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    fn slot(&self, index: usize) -> core::ops::Range<usize> {
        let start = (index % self.capacity) * self.item_size;
        start..start + self.item_size
    }

    /// Copy `item` into the tail slot. The caller checks for space.
    pub fn push(&mut self, item: &[u8]) {
        debug_assert!(!self.is_full());
        let range = self.slot(self.head + self.len);
        self.storage[range].copy_from_slice(item);
        self.len += 1;
    }

    /// Copy the head slot out.
    pub fn pop(&mut self) -> Option<Box<[u8]>> {
        let item = self.peek()?.into();
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
        Some(item)
    }

    pub fn peek(&self) -> Option<&[u8]> {
        if self.is_empty() {
            None
        } else {
            Some(&self.storage[self.slot(self.head)])
        }
    }
}

impl<P: Port> Kernel<P> {
    pub fn queue_create(&mut self, capacity: usize, item_size: usize) -> Result<QueueId> {
        if capacity == 0 || item_size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let bytes = storage_bytes(capacity, item_size)?
            .checked_add(OBJECT_OVERHEAD)
            .ok_or(KernelError::ResourceExhausted)?;
        self.heap.reserve(bytes)?;
        match QueueControlBlock::new(capacity, item_size) {
            Ok(qcb) => Ok(self.queues.insert(qcb)),
            Err(e) => {
                self.heap.release(bytes);
                Err(e)
            }
        }
    }

    pub fn queue_destroy(&mut self, id: QueueId) -> Result<()> {
        let qcb = self.queues.get(id).ok_or(KernelError::InvalidState)?;
        if !qcb.receivers.is_empty() || !qcb.senders.is_empty() {
            log::error!("queue {:?} destroyed with blocked tasks", id);
            return Err(KernelError::InvalidState);
        }
        let bytes = qcb.storage.len() + OBJECT_OVERHEAD;
        self.queues.remove(id);
        self.heap.release(bytes);
        Ok(())
    }

    /// Items currently stored.
    pub fn messages_waiting(&self, id: QueueId) -> Result<usize> {
        Ok(self.queue_ref(id)?.len())
    }

    /// Free slots.
    pub fn spaces_available(&self, id: QueueId) -> Result<usize> {
        Ok(self.queue_ref(id)?.spaces())
    }

    pub(crate) fn queue_ref(&self, id: QueueId) -> Result<&QueueControlBlock> {
        self.queues.get(id).ok_or(KernelError::InvalidState)
    }

    fn check_item_size(&self, id: QueueId, size: usize) -> Result<()> {
        if self.queue_ref(id)?.item_size != size {
            log::warn!("queue {:?}: item of {} bytes does not fit", id, size);
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    /// Hand `item` to the best receiver or store it. `Ok(None)` when the
    /// queue is full, otherwise whether a task outranking `local` woke.
    pub(crate) fn queue_put(
        &mut self,
        id: QueueId,
        item: &[u8],
        local: Option<CoreId>,
    ) -> Result<Option<bool>> {
        self.check_item_size(id, item.len())?;
        let qcb = &mut self.queues[id];
        if let Some(receiver) = qcb.receivers.pop() {
            let outcome = WakeOutcome::Delivered(item.into());
            return Ok(Some(self.make_ready(receiver, Some(outcome), local)));
        }
        if qcb.is_full() {
            return Ok(None);
        }
        qcb.push(item);
        Ok(Some(false))
    }

    /// Take the head item. The freed slot is filled at once from the best
    /// blocked sender. `Ok(None)` when empty.
    pub(crate) fn queue_get(
        &mut self,
        id: QueueId,
        local: Option<CoreId>,
    ) -> Result<Option<(Box<[u8]>, bool)>> {
        let qcb = self.queues.get_mut(id).ok_or(KernelError::InvalidState)?;
        let Some(item) = qcb.pop() else {
            return Ok(None);
        };
        let mut woken = false;
        if let Some(sender) = qcb.senders.pop() {
            if let Some(parked) = self.tasks.get_mut(sender).and_then(|t| t.wait.pending_item.take()) {
                self.queues[id].push(&parked);
            }
            woken = self.make_ready(sender, Some(WakeOutcome::Granted), local);
        }
        Ok(Some((item, woken)))
    }
}

impl<'k, P: Port> TaskContext<'k, P> {
    /// Copy `item` to the back of the queue, waiting at most `timeout` for
    /// a free slot.
    pub fn queue_send<T: QueueItem>(&mut self, queue: QueueId, item: &T, timeout: Timeout) -> Result<Wait<()>> {
        self.queue_send_bytes(queue, &encode_item(item), timeout)
    }

    pub fn queue_send_bytes(&mut self, queue: QueueId, item: &[u8], timeout: Timeout) -> Result<Wait<()>> {
        let id = self.kernel.running_task(self.core)?;
        if self.kernel.queue_put(queue, item, Some(self.core))?.is_some() {
            self.kernel.reschedule(self.core);
            self.kernel.settle();
            return Ok(Wait::Ready(()));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        let prio = self.kernel.tasks[id].effective_priority;
        self.kernel
            .block_current(self.core, WaitObject::QueueSend(queue), timeout)?;
        self.kernel.tasks[id].wait.pending_item = Some(item.into());
        let seq = self.kernel.next_seq();
        self.kernel.queues[queue].senders.insert(id, prio, seq);
        self.kernel.reschedule(self.core);
        self.kernel.settle();
        Ok(Wait::Blocked)
    }

    /// Take the item at the front of the queue, waiting at most `timeout`
    /// for one to arrive.
    pub fn queue_receive<T: QueueItem>(&mut self, queue: QueueId, timeout: Timeout) -> Result<Wait<T>> {
        self.kernel.check_item_size(queue, T::SIZE)?;
        Ok(match self.queue_receive_bytes(queue, timeout)? {
            Wait::Ready(bytes) => Wait::Ready(T::decode(&bytes)),
            Wait::Blocked => Wait::Blocked,
        })
    }

    pub fn queue_receive_bytes(&mut self, queue: QueueId, timeout: Timeout) -> Result<Wait<Box<[u8]>>> {
        let id = self.kernel.running_task(self.core)?;
        if let Some((item, _)) = self.kernel.queue_get(queue, Some(self.core))? {
            self.kernel.reschedule(self.core);
            self.kernel.settle();
            return Ok(Wait::Ready(item));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        let prio = self.kernel.tasks[id].effective_priority;
        self.kernel
            .block_current(self.core, WaitObject::QueueReceive(queue), timeout)?;
        let seq = self.kernel.next_seq();
        self.kernel.queues[queue].receivers.insert(id, prio, seq);
        self.kernel.reschedule(self.core);
        self.kernel.settle();
        Ok(Wait::Blocked)
    }

    /// Collect the item delivered to a receive that returned
    /// [`Wait::Blocked`].
    ///
    /// A delivered item of another size stays with the task.
    pub fn finish_receive<T: QueueItem>(&mut self) -> Result<T> {
        let id = self.kernel.running_task(self.core)?;
        if let Some(WakeOutcome::Delivered(bytes)) = &self.kernel.tasks[id].wait.outcome {
            if bytes.len() != T::SIZE {
                return Err(KernelError::InvalidArgument);
            }
        }
        let bytes = self.finish_receive_bytes()?;
        Ok(T::decode(&bytes))
    }

    pub fn finish_receive_bytes(&mut self) -> Result<Box<[u8]>> {
        match self.take_outcome()? {
            WakeOutcome::Delivered(bytes) => Ok(bytes),
            WakeOutcome::TimedOut => Err(KernelError::Timeout),
            WakeOutcome::Granted => Err(KernelError::InvalidState),
        }
    }

    /// Copy of the front item without removing it; `Err(WouldBlock)` when
    /// the queue is empty.
    pub fn queue_peek<T: QueueItem>(&self, queue: QueueId) -> Result<T> {
        self.kernel.check_item_size(queue, T::SIZE)?;
        self.kernel
            .queue_ref(queue)?
            .peek()
            .map(T::decode)
            .ok_or(KernelError::WouldBlock)
    }
}

impl<'k, P: Port> IsrContext<'k, P> {
    /// Send without waiting; `Err(WouldBlock)` when full.
    pub fn queue_send_from_isr<T: QueueItem>(&mut self, queue: QueueId, item: &T, woken: &mut bool) -> Result<()> {
        self.queue_send_bytes_from_isr(queue, &encode_item(item), woken)
    }

    pub fn queue_send_bytes_from_isr(&mut self, queue: QueueId, item: &[u8], woken: &mut bool) -> Result<()> {
        match self.kernel.queue_put(queue, item, Some(self.core))? {
            Some(preempt) => {
                *woken |= preempt;
                Ok(())
            }
            None => Err(KernelError::WouldBlock),
        }
    }

    /// Receive without waiting; `Err(WouldBlock)` when empty.
    pub fn queue_receive_from_isr<T: QueueItem>(&mut self, queue: QueueId, woken: &mut bool) -> Result<T> {
        self.kernel.check_item_size(queue, T::SIZE)?;
        match self.kernel.queue_get(queue, Some(self.core))? {
            Some((bytes, preempt)) => {
                *woken |= preempt;
                Ok(T::decode(&bytes))
            }
            None => Err(KernelError::WouldBlock),
        }
    }
}
