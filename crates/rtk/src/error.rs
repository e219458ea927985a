use core::fmt;

use crate::task::TaskId;

/// Kernel-level failures.
///
/// Timeouts are not errors; blocking calls report them as
/// [`Wait::TimedOut`](crate::task::Wait::TimedOut).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Backing storage for a task, queue or timer could not be allocated.
    ResourceExhausted(&'static str),
    InvalidParameter(&'static str),
    /// A primitive or task was used in a state that forbids the operation.
    InvalidState(&'static str),
    /// A task overran its stack; the kernel has halted.
    StackOverflow { task: TaskId },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::ResourceExhausted(what) => write!(f, "resource exhausted: {what}"),
            KernelError::InvalidParameter(what) => write!(f, "invalid parameter: {what}"),
            KernelError::InvalidState(what) => write!(f, "invalid state: {what}"),
            KernelError::StackOverflow { task } => {
                write!(f, "stack overflow in task {task}; kernel halted")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for KernelError {}

pub type KernelResult<T> = Result<T, KernelError>;
