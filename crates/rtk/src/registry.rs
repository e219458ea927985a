//! Ready, delayed and wait registries.
//!
//! Every live task is in exactly one place: a ready level, the delayed
//! registry (pure time waits) or the wait list of one channel. A timed wait
//! on an object keeps its deadline on the wait-list entry.

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::collections::{BTreeSet, VecDeque};
use alloc::vec::Vec;

use crate::task::{Priority, TaskId};
use crate::time::Tick;

/// Identity of a kernel object (queue, mutex, event group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ObjectId(u32);

static NEXT_OBJECT: AtomicU32 = AtomicU32::new(1);

impl ObjectId {
    pub(crate) fn next() -> Self {
        ObjectId(NEXT_OBJECT.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) const fn raw(self) -> u32 {
        self.0
    }
}

/// What a blocked task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Channel {
    /// Time only; lives in the delayed registry.
    Delay,
    /// Space in a queue.
    Send(ObjectId),
    /// An item in a queue.
    Receive(ObjectId),
    /// Ownership of a mutex; waiters donate their priority to the holder.
    Mutex(ObjectId),
    Bits(ObjectId),
    Notify(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitCondition {
    Always,
    Bits {
        mask: u32,
        all: bool,
        clear_on_exit: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Pending,
    /// Woken by the object, with a value some objects hand over.
    Signaled(u32),
    TimedOut,
}

/// Per-task record of the wait in progress, consumed when the task re-issues
/// its blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaitRecord {
    pub(crate) channel: Channel,
    pub(crate) deadline: Option<Tick>,
    pub(crate) outcome: WaitOutcome,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Waiter {
    pub(crate) task: TaskId,
    pub(crate) priority: Priority,
    /// Arrival order; breaks ties between equal priorities.
    pub(crate) seq: u64,
    pub(crate) deadline: Option<Tick>,
    pub(crate) condition: WaitCondition,
}

impl Waiter {
    fn goes_before(&self, other: &Waiter) -> bool {
        self.priority > other.priority || (self.priority == other.priority && self.seq < other.seq)
    }
}

/// Waiters ordered by priority (descending), then arrival.
#[derive(Debug, Default)]
pub(crate) struct WaitList {
    entries: Vec<Waiter>,
}

impl WaitList {
    pub(crate) fn insert(&mut self, waiter: Waiter) {
        let at = self
            .entries
            .iter()
            .position(|e| waiter.goes_before(e))
            .unwrap_or(self.entries.len());
        self.entries.insert(at, waiter);
    }

    pub(crate) fn remove(&mut self, task: TaskId) -> Option<Waiter> {
        let at = self.entries.iter().position(|e| e.task == task)?;
        Some(self.entries.remove(at))
    }

    pub(crate) fn pop_front(&mut self) -> Option<Waiter> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Re-sorts `task` after its effective priority changed; keeps its arrival slot.
    pub(crate) fn reprioritize(&mut self, task: TaskId, priority: Priority) {
        if let Some(mut waiter) = self.remove(task) {
            waiter.priority = priority;
            self.insert(waiter);
        }
    }

    pub(crate) fn highest_priority(&self) -> Option<Priority> {
        self.entries.first().map(|e| e.priority)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Waiter> {
        self.entries.iter()
    }

    #[cfg(test)]
    pub(crate) fn tasks(&self) -> Vec<TaskId> {
        self.entries.iter().map(|e| e.task).collect()
    }

    pub(crate) fn expired(&self, now: Tick) -> Vec<TaskId> {
        self.entries
            .iter()
            .filter(|e| e.deadline.is_some_and(|d| d <= now))
            .map(|e| e.task)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bitmap of non-empty priority levels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadySet {
    bits: u64,
}

impl ReadySet {
    pub(crate) fn insert(&mut self, level: u8) {
        self.bits |= 1u64 << level;
    }

    pub(crate) fn remove(&mut self, level: u8) {
        self.bits &= !(1u64 << level);
    }

    pub(crate) fn highest(&self) -> Option<u8> {
        if self.bits == 0 {
            None
        } else {
            Some((63 - self.bits.leading_zeros()) as u8)
        }
    }
}

/// One FIFO per priority level.
#[derive(Debug)]
pub(crate) struct ReadyLists {
    levels: Vec<VecDeque<TaskId>>,
    set: ReadySet,
}

impl ReadyLists {
    pub(crate) fn new(levels: u8) -> Self {
        Self {
            levels: (0..levels).map(|_| VecDeque::new()).collect(),
            set: ReadySet::default(),
        }
    }

    pub(crate) fn push_back(&mut self, priority: Priority, task: TaskId) {
        let level = priority.0;
        self.levels[level as usize].push_back(task);
        self.set.insert(level);
    }

    pub(crate) fn remove(&mut self, priority: Priority, task: TaskId) -> bool {
        let level = priority.0;
        let queue = &mut self.levels[level as usize];
        let Some(at) = queue.iter().position(|t| *t == task) else {
            return false;
        };
        queue.remove(at);
        if queue.is_empty() {
            self.set.remove(level);
        }
        true
    }

    /// Head of the highest non-empty level, rotated to the back of its level.
    pub(crate) fn select(&mut self) -> Option<TaskId> {
        let level = self.set.highest()?;
        let queue = &mut self.levels[level as usize];
        let task = queue.pop_front()?;
        queue.push_back(task);
        Some(task)
    }

    pub(crate) fn highest(&self) -> Option<Priority> {
        self.set.highest().map(Priority)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, priority: Priority, task: TaskId) -> bool {
        self.levels[priority.0 as usize].contains(&task)
    }
}

/// Tasks waiting for time only, ordered by wake tick.
#[derive(Debug, Default)]
pub(crate) struct DelayedList {
    entries: BTreeSet<(Tick, TaskId)>,
}

impl DelayedList {
    pub(crate) fn insert(&mut self, wake_at: Tick, task: TaskId) {
        self.entries.insert((wake_at, task));
    }

    pub(crate) fn remove(&mut self, wake_at: Tick, task: TaskId) -> bool {
        self.entries.remove(&(wake_at, task))
    }

    /// Removes and returns every task due at or before `now`, earliest first.
    pub(crate) fn expire(&mut self, now: Tick) -> Vec<TaskId> {
        let mut due = Vec::new();
        while let Some(&(wake_at, task)) = self.entries.first() {
            if wake_at > now {
                break;
            }
            self.entries.remove(&(wake_at, task));
            due.push(task);
        }
        due
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, task: TaskId) -> bool {
        self.entries.iter().any(|(_, t)| *t == task)
    }
}
