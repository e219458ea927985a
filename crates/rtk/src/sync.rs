//! Platform abstraction for locks that are held outside critical sections.
//!
//! With `std` the lock is a `parking_lot::Mutex`, which never poisons; on
//! `no_std` targets (`lock-free`) it is a `spin::Mutex`.

pub use alloc::sync::Arc;

#[cfg(feature = "std")]
pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;
#[cfg(not(feature = "std"))]
pub type MutexGuard<'a, T> = spin::MutexGuard<'a, T>;

/// Platform-agnostic mutex wrapper.
pub struct Mutex<T> {
    #[cfg(feature = "std")]
    inner: parking_lot::Mutex<T>,
    #[cfg(not(feature = "std"))]
    inner: spin::Mutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            #[cfg(feature = "std")]
            inner: parking_lot::Mutex::new(value),
            #[cfg(not(feature = "std"))]
            inner: spin::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
