//! Binary and counting semaphores, built on a queue of `()` items whose
//! occupied count is the semaphore count.

use crate::context::{IsrContext, TaskContext};
use crate::error::KernelError;
use crate::interrupt::SwitchRequest;
use crate::queue::{End, Full, Queue};
use crate::task::Wait;
use crate::time::Timeout;

#[derive(Debug, Clone)]
pub struct Semaphore {
    queue: Queue<()>,
}

impl Semaphore {
    /// A binary semaphore, created empty: the first `take` blocks until a `give`.
    pub fn binary() -> Result<Self, KernelError> {
        Self::counting(1, 0)
    }

    /// A counting semaphore holding at most `max` counts, starting at `initial`.
    pub fn counting(max: usize, initial: usize) -> Result<Self, KernelError> {
        if initial > max {
            return Err(KernelError::InvalidParameter(
                "initial count exceeds maximum",
            ));
        }
        let queue = Queue::new(max)?;
        queue.preload(|| (), initial);
        Ok(Self { queue })
    }

    /// Adds one count. Fails without blocking when already at the maximum.
    pub fn give(&self, ctx: &mut TaskContext<'_>) -> Result<(), Full> {
        match self.queue.post(ctx, (), End::Back, Timeout::NoWait) {
            Wait::Done(()) => Ok(()),
            Wait::Blocked | Wait::TimedOut => Err(Full),
        }
    }

    pub fn give_from_isr(&self, isr: &mut IsrContext<'_>) -> Result<SwitchRequest, Full> {
        self.queue.post_from_isr(isr, (), End::Back)
    }

    /// Takes one count, blocking while there is none.
    pub fn take(&self, ctx: &mut TaskContext<'_>, timeout: Timeout) -> Wait<()> {
        self.queue.receive(ctx, timeout)
    }

    pub fn take_from_isr(&self, isr: &mut IsrContext<'_>) -> Option<SwitchRequest> {
        self.queue.receive_from_isr(isr).map(|((), switch)| switch)
    }

    pub fn count(&self) -> usize {
        self.queue.len()
    }

    pub fn max_count(&self) -> usize {
        self.queue.capacity()
    }
}
