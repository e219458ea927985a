//! Critical sections.
//!
//! Primitive state lives in a [`CriticalCell`]; every access runs inside
//! `critical_section::with`, which masks interrupts on a target and takes the
//! host-wide lock under `std`. Sections nest.

use core::cell::RefCell;

pub(crate) struct CriticalCell<T> {
    inner: critical_section::Mutex<RefCell<T>>,
}

impl<T> CriticalCell<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            inner: critical_section::Mutex::new(RefCell::new(value)),
        }
    }

    /// Runs `f` with exclusive access to the value.
    ///
    /// `f` must not re-enter the same cell.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|cs| {
            let mut guard = self.inner.borrow_ref_mut(cs);
            f(&mut guard)
        })
    }
}

/// Runs `f` with preemption masked.
pub(crate) fn enter<R>(f: impl FnOnce() -> R) -> R {
    critical_section::with(|_| f())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_keep_state_between_sections() {
        let cell = CriticalCell::new(0u32);
        cell.with(|v| *v += 2);
        cell.with(|v| *v *= 5);
        assert_eq!(cell.with(|v| *v), 10);
    }

    #[test]
    fn sections_nest_across_cells() {
        let outer = CriticalCell::new(1u8);
        let inner = CriticalCell::new(2u8);
        let sum = outer.with(|a| enter(|| inner.with(|b| *a + *b)));
        assert_eq!(sum, 3);
    }
}
