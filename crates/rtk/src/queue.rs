//! Bounded FIFO message queue.
//!
//! Items are cloned in from the sender's value and moved out to the
//! receiver. Tasks blocked on a full queue wait on its send list, tasks
//! blocked on an empty one on its receive list; both lists are ordered by
//! priority, then arrival.

use core::fmt;

use alloc::vec::Vec;

use crate::context::{IsrContext, TaskContext};
use crate::critical::CriticalCell;
use crate::error::KernelError;
use crate::interrupt::SwitchRequest;
use crate::registry::{Channel, ObjectId, WaitCondition};
use crate::sync::Arc;
use crate::task::Wait;
use crate::time::Timeout;
use crate::trace::{object_payload, records};

/// A non-blocking send found the queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

impl fmt::Display for Full {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue full")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Full {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum End {
    Back,
    Front,
}

/// Fixed-capacity circular buffer.
struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Result<Self, KernelError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| KernelError::ResourceExhausted("queue storage"))?;
        slots.resize_with(capacity, || None);
        Ok(Self {
            slots,
            head: 0,
            len: 0,
        })
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn push(&mut self, item: T, end: End) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        let cap = self.capacity();
        let slot = match end {
            End::Back => (self.head + self.len) % cap,
            End::Front => {
                self.head = (self.head + cap - 1) % cap;
                self.head
            }
        };
        self.slots[slot] = Some(item);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        item
    }

    fn front(&self) -> Option<&T> {
        if self.len == 0 {
            None
        } else {
            self.slots[self.head].as_ref()
        }
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.len = 0;
    }
}

struct QueueShared<T> {
    id: ObjectId,
    ring: CriticalCell<Ring<T>>,
}

/// Handle to a message queue; clones refer to the same queue.
pub struct Queue<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.shared.id)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<T> Queue<T> {
    /// Creates a queue holding up to `capacity` items.
    pub fn new(capacity: usize) -> Result<Self, KernelError> {
        if capacity == 0 {
            return Err(KernelError::InvalidParameter(
                "queue capacity must be non-zero",
            ));
        }
        Ok(Self {
            shared: Arc::new(QueueShared {
                id: ObjectId::next(),
                ring: CriticalCell::new(Ring::with_capacity(capacity)?),
            }),
        })
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.shared.id
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring.with(|ring| ring.capacity())
    }

    /// Items currently stored.
    pub fn len(&self) -> usize {
        self.shared.ring.with(|ring| ring.len)
    }

    /// Free slots.
    pub fn spaces(&self) -> usize {
        self.shared.ring.with(|ring| ring.capacity() - ring.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.shared.ring.with(|ring| ring.is_full())
    }

    fn emit(&self, sched: &crate::scheduler::Scheduler, record: u8) {
        let len = self.shared.ring.with(|ring| ring.len) as u32;
        sched.emit(record, &object_payload(self.id().raw(), len));
    }

    /// Stores `item`, blocking while the queue is full.
    pub(crate) fn post(
        &self,
        ctx: &mut TaskContext<'_>,
        item: T,
        end: End,
        timeout: Timeout,
    ) -> Wait<()> {
        let channel = Channel::Send(self.id());
        let prior = ctx.resume_wait(channel);
        let stored = self.shared.ring.with(|ring| ring.push(item, end)).is_ok();
        if stored {
            ctx.wake_one(Channel::Receive(self.id()), 0);
            self.emit(ctx.sched, records::queue::SEND);
            return Wait::Done(());
        }
        self.emit(ctx.sched, records::queue::SEND_FAILED);
        ctx.block_on(channel, prior, timeout, WaitCondition::Always)
    }

    pub(crate) fn post_from_isr(
        &self,
        isr: &mut IsrContext<'_>,
        item: T,
        end: End,
    ) -> Result<SwitchRequest, Full> {
        if self.shared.ring.with(|ring| ring.push(item, end)).is_err() {
            log::warn!("queue {:?} full in interrupt context", self.id());
            self.emit(isr.sched, records::queue::SEND_FAILED);
            return Err(Full);
        }
        self.emit(isr.sched, records::queue::SEND);
        Ok(isr.wake_one(Channel::Receive(self.id()), 0))
    }

    /// Takes the oldest item, blocking while the queue is empty.
    pub fn receive(&self, ctx: &mut TaskContext<'_>, timeout: Timeout) -> Wait<T> {
        let channel = Channel::Receive(self.id());
        let prior = ctx.resume_wait(channel);
        match self.shared.ring.with(|ring| ring.pop()) {
            Some(item) => {
                ctx.wake_one(Channel::Send(self.id()), 0);
                self.emit(ctx.sched, records::queue::RECEIVE);
                Wait::Done(item)
            }
            None => {
                self.emit(ctx.sched, records::queue::RECEIVE_FAILED);
                ctx.block_on(channel, prior, timeout, WaitCondition::Always)
            }
        }
    }

    /// Takes the oldest item if there is one.
    pub fn receive_from_isr(&self, isr: &mut IsrContext<'_>) -> Option<(T, SwitchRequest)> {
        let item = self.shared.ring.with(|ring| ring.pop())?;
        self.emit(isr.sched, records::queue::RECEIVE);
        Some((item, isr.wake_one(Channel::Send(self.id()), 0)))
    }

    /// Empties the queue and lets one blocked sender retry.
    pub fn reset(&self, ctx: &mut TaskContext<'_>) {
        self.shared.ring.with(|ring| ring.clear());
        ctx.wake_one(Channel::Send(self.id()), 0);
    }

    /// Tasks blocked sending to this queue.
    pub fn blocked_senders(&self, ctx: &TaskContext<'_>) -> usize {
        ctx.sched.waiter_count(Channel::Send(self.id()))
    }

    /// Tasks blocked receiving from this queue.
    pub fn blocked_receivers(&self, ctx: &TaskContext<'_>) -> usize {
        ctx.sched.waiter_count(Channel::Receive(self.id()))
    }

    /// Loads items before any task runs; stops when full.
    pub(crate) fn preload(&self, mut item: impl FnMut() -> T, count: usize) {
        self.shared.ring.with(|ring| {
            for _ in 0..count {
                if ring.push(item(), End::Back).is_err() {
                    break;
                }
            }
        });
    }
}

impl<T: Clone> Queue<T> {
    /// Copies `item` to the back of the queue.
    pub fn send(&self, ctx: &mut TaskContext<'_>, item: &T, timeout: Timeout) -> Wait<()> {
        self.post(ctx, item.clone(), End::Back, timeout)
    }

    /// Copies `item` to the front, ahead of everything already queued.
    pub fn send_to_front(
        &self,
        ctx: &mut TaskContext<'_>,
        item: &T,
        timeout: Timeout,
    ) -> Wait<()> {
        self.post(ctx, item.clone(), End::Front, timeout)
    }

    pub fn send_from_isr(&self, isr: &mut IsrContext<'_>, item: &T) -> Result<SwitchRequest, Full> {
        self.post_from_isr(isr, item.clone(), End::Back)
    }

    pub fn send_to_front_from_isr(
        &self,
        isr: &mut IsrContext<'_>,
        item: &T,
    ) -> Result<SwitchRequest, Full> {
        self.post_from_isr(isr, item.clone(), End::Front)
    }

    /// Mailbox write for single-slot queues: replaces the stored item, never blocks.
    pub fn overwrite(&self, ctx: &mut TaskContext<'_>, item: &T) {
        debug_assert_eq!(self.capacity(), 1, "overwrite is for single-slot queues");
        self.replace_front(item.clone());
        ctx.wake_one(Channel::Receive(self.id()), 0);
        self.emit(ctx.sched, records::queue::SEND);
    }

    pub fn overwrite_from_isr(&self, isr: &mut IsrContext<'_>, item: &T) -> SwitchRequest {
        debug_assert_eq!(self.capacity(), 1, "overwrite is for single-slot queues");
        self.replace_front(item.clone());
        self.emit(isr.sched, records::queue::SEND);
        isr.wake_one(Channel::Receive(self.id()), 0)
    }

    fn replace_front(&self, item: T) {
        self.shared.ring.with(|ring| {
            if ring.is_full() {
                ring.pop();
            }
            // Cannot fail: a slot was just freed if none was.
            let _ = ring.push(item, End::Back);
        });
    }

    /// Copies the oldest item without removing it, blocking while empty.
    pub fn peek(&self, ctx: &mut TaskContext<'_>, timeout: Timeout) -> Wait<T> {
        let channel = Channel::Receive(self.id());
        let prior = ctx.resume_wait(channel);
        match self.shared.ring.with(|ring| ring.front().cloned()) {
            Some(item) => {
                // The item stays, so another receiver may proceed too.
                ctx.wake_one(Channel::Receive(self.id()), 0);
                self.emit(ctx.sched, records::queue::PEEK);
                Wait::Done(item)
            }
            None => ctx.block_on(channel, prior, timeout, WaitCondition::Always),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_wraps_around() {
        let mut ring = Ring::with_capacity(3).unwrap();
        for v in 1..=3 {
            ring.push(v, End::Back).unwrap();
        }
        assert_eq!(ring.push(4, End::Back), Err(4));
        assert_eq!(ring.pop(), Some(1));
        ring.push(4, End::Back).unwrap();
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), Some(4));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn front_insertion_jumps_the_line() {
        let mut ring = Ring::with_capacity(4).unwrap();
        ring.push(1, End::Back).unwrap();
        ring.push(2, End::Back).unwrap();
        ring.push(0, End::Front).unwrap();
        assert_eq!(ring.front(), Some(&0));
        assert_eq!(ring.pop(), Some(0));
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            Queue::<u8>::new(0),
            Err(KernelError::InvalidParameter(_))
        ));
    }

    #[test]
    fn preload_stops_at_capacity() {
        let queue = Queue::new(2).unwrap();
        queue.preload(|| (), 5);
        assert_eq!(queue.len(), 2);
        assert!(queue.is_full());
        assert_eq!(queue.spaces(), 0);
    }
}
