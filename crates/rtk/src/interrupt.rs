//! Interrupt sources, handlers and the switch-request value.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::context::IsrContext;
use crate::error::KernelError;

/// An interrupt source number, as wired by the integrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Irq(pub u16);

impl fmt::Display for Irq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IRQ{}", self.0)
    }
}

/// Whether an interrupt-context call readied a task that outranks the
/// interrupted one.
///
/// Handlers fold the values of every call they make with `|` and return the
/// result; the interrupt epilogue reads it once.
#[must_use]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchRequest(bool);

impl SwitchRequest {
    pub const NONE: SwitchRequest = SwitchRequest(false);
    pub const REQUIRED: SwitchRequest = SwitchRequest(true);

    pub const fn is_required(self) -> bool {
        self.0
    }
}

impl From<bool> for SwitchRequest {
    fn from(required: bool) -> Self {
        SwitchRequest(required)
    }
}

impl BitOr for SwitchRequest {
    type Output = SwitchRequest;

    fn bitor(self, rhs: SwitchRequest) -> SwitchRequest {
        SwitchRequest(self.0 || rhs.0)
    }
}

impl BitOrAssign for SwitchRequest {
    fn bitor_assign(&mut self, rhs: SwitchRequest) {
        self.0 |= rhs.0;
    }
}

/// Interrupt service routine.
pub type IsrHandler = Box<dyn FnMut(&mut IsrContext<'_>) -> SwitchRequest + Send>;

/// Vector table: one handler per source.
#[derive(Default)]
pub(crate) struct InterruptTable {
    handlers: BTreeMap<Irq, IsrHandler>,
}

impl InterruptTable {
    pub(crate) fn register(&mut self, irq: Irq, handler: IsrHandler) -> Result<(), KernelError> {
        if self.handlers.contains_key(&irq) {
            return Err(KernelError::InvalidState(
                "interrupt source already has a handler",
            ));
        }
        self.handlers.insert(irq, handler);
        Ok(())
    }

    /// Takes the handler out while it runs so it can borrow the scheduler.
    pub(crate) fn take(&mut self, irq: Irq) -> Option<IsrHandler> {
        self.handlers.remove(&irq)
    }

    pub(crate) fn restore(&mut self, irq: Irq, handler: IsrHandler) {
        self.handlers.insert(irq, handler);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}
