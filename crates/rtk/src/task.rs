//! Tasks: identity, priority, configuration and the per-task control block.

use core::fmt;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::context::TaskContext;
use crate::error::KernelError;
use crate::notify::NotifyState;
use crate::registry::{ObjectId, WaitRecord};
use crate::time::Tick;

/// Longest task or timer name kept, in bytes.
pub const MAX_NAME_LEN: usize = 16;

/// Bounded name; longer names are truncated at a character boundary.
pub type Name = heapless::String<MAX_NAME_LEN>;

pub(crate) fn bounded_name(name: &str) -> Name {
    let mut out = Name::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Value written over every new stack.
pub const STACK_FILL: u8 = 0xA5;
/// Bytes at the stack limit that must keep [`STACK_FILL`].
pub const STACK_GUARD_LEN: usize = 16;

/// Handle of a task within one kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskId(pub u16);

impl TaskId {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Scheduling priority; larger values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Priority(pub u8);

impl Priority {
    /// Lowest level, shared with the idle activity.
    pub const IDLE: Priority = Priority(0);

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Priority(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Suspended,
    Deleted,
}

impl TaskState {
    fn letter(self) -> char {
        match self {
            TaskState::Running => 'X',
            TaskState::Ready => 'R',
            TaskState::Blocked => 'B',
            TaskState::Suspended => 'S',
            TaskState::Deleted => 'D',
        }
    }
}

/// What a task body asks of the scheduler when its step returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// Stay ready; the scheduler picks the next step.
    Continue,
    /// Let another ready task of the same priority run first.
    Yield,
    /// A blocking call returned [`Wait::Blocked`].
    Blocked,
    /// Delete the task.
    Exit,
}

/// Outcome of a blocking call.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait<T> {
    Done(T),
    /// The caller is now blocked; return [`TaskAction::Blocked`] and issue
    /// the same call again when resumed.
    Blocked,
    /// The wait budget ran out.
    TimedOut,
}

impl<T> Wait<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Wait::Done(_))
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Wait::Blocked)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Wait::TimedOut)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Wait::Done(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Wait<U> {
        match self {
            Wait::Done(value) => Wait::Done(f(value)),
            Wait::Blocked => Wait::Blocked,
            Wait::TimedOut => Wait::TimedOut,
        }
    }
}

/// Step function of a task; its captured state is the task's saved context.
pub type TaskBody = Box<dyn FnMut(&mut TaskContext<'_>) -> TaskAction + Send>;

/// Parameters for creating a task.
pub struct TaskConfig {
    pub name: Name,
    pub priority: Priority,
    /// Falls back to the kernel's `minimal_stack_size`.
    pub stack_size: Option<usize>,
    pub(crate) body: TaskBody,
}

impl TaskConfig {
    pub fn new<F>(name: &str, priority: Priority, body: F) -> Self
    where
        F: FnMut(&mut TaskContext<'_>) -> TaskAction + Send + 'static,
    {
        Self {
            name: bounded_name(name),
            priority,
            stack_size: None,
            body: Box::new(body),
        }
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl fmt::Debug for TaskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskConfig")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

/// Snapshot of one task, as returned by
/// [`Kernel::task_list`](crate::kernel::Kernel::task_list).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TaskStatus {
    pub id: TaskId,
    pub name: Name,
    pub state: TaskState,
    pub base_priority: Priority,
    pub priority: Priority,
    /// Stack bytes never touched since creation.
    pub stack_high_water: usize,
    pub steps: u64,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16}{:>3}{:>4}{:>7}{:>4}",
            self.name.as_str(),
            self.state.letter(),
            self.priority.0,
            self.stack_high_water,
            self.id.0
        )
    }
}

/// A task's stack region. The lowest [`STACK_GUARD_LEN`] bytes are the guard.
pub(crate) struct Stack {
    bytes: Vec<u8>,
}

impl Stack {
    pub(crate) fn allocate(size: usize) -> Result<Self, KernelError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| KernelError::ResourceExhausted("task stack"))?;
        bytes.resize(size, STACK_FILL);
        Ok(Self { bytes })
    }

    pub(crate) const fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn guard_intact(&self) -> bool {
        let guard = STACK_GUARD_LEN.min(self.bytes.len());
        self.bytes[..guard].iter().all(|b| *b == STACK_FILL)
    }

    pub(crate) fn high_water_mark(&self) -> usize {
        self.bytes.iter().take_while(|b| **b == STACK_FILL).count()
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Bookkeeping carried across context switches.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SavedContext {
    pub(crate) switches_in: u64,
    pub(crate) steps: u64,
    pub(crate) last_run: Tick,
}

/// Task control block.
pub(crate) struct Tcb {
    pub(crate) id: TaskId,
    pub(crate) name: Name,
    pub(crate) base_priority: Priority,
    /// Derived from `base_priority` and the waiters of held mutexes.
    pub(crate) priority: Priority,
    pub(crate) state: TaskState,
    pub(crate) stack: Stack,
    /// Taken out while the task runs a step.
    pub(crate) body: Option<TaskBody>,
    pub(crate) context: SavedContext,
    pub(crate) wait: Option<WaitRecord>,
    /// Key in the delayed registry.
    pub(crate) wake_at: Option<Tick>,
    pub(crate) notify_value: u32,
    pub(crate) notify_state: NotifyState,
    pub(crate) held: Vec<ObjectId>,
    /// Heap budget charged at creation.
    pub(crate) footprint: usize,
}

impl Tcb {
    pub(crate) fn new(id: TaskId, config: TaskConfig, stack: Stack, footprint: usize) -> Self {
        Self {
            id,
            name: config.name,
            base_priority: config.priority,
            priority: config.priority,
            state: TaskState::Ready,
            stack,
            body: Some(config.body),
            context: SavedContext::default(),
            wait: None,
            wake_at: None,
            notify_value: 0,
            notify_state: NotifyState::NotPending,
            held: Vec::new(),
            footprint,
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        TaskStatus {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            base_priority: self.base_priority,
            priority: self.priority,
            stack_high_water: self.stack.high_water_mark(),
            steps: self.context.steps,
        }
    }
}
