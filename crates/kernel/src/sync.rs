//! Platform locking for the kernel's critical section.
//!
//! On a single-core target every kernel-state mutation happens with
//! interrupts masked. On the host that critical section is one mutex around
//! the whole kernel state: `std::sync::Mutex` with the `std` feature,
//! `spin::Mutex` without it.

#[cfg(not(feature = "std"))]
pub use alloc::sync::Arc;
#[cfg(feature = "std")]
pub use std::sync::Arc;

#[cfg(feature = "std")]
pub type MutexGuard<'a, T> = std::sync::MutexGuard<'a, T>;
#[cfg(not(feature = "std"))]
pub type MutexGuard<'a, T> = spin::MutexGuard<'a, T>;

/// Platform-agnostic mutex standing in for the interrupt mask.
pub struct Mutex<T> {
    #[cfg(feature = "std")]
    inner: std::sync::Mutex<T>,
    #[cfg(not(feature = "std"))]
    inner: spin::Mutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            #[cfg(feature = "std")]
            inner: std::sync::Mutex::new(value),
            #[cfg(not(feature = "std"))]
            inner: spin::Mutex::new(value),
        }
    }

    /// Enters the critical section.
    ///
    /// # Panics
    ///
    /// With `std`, panics if a previous holder panicked. A poisoned kernel
    /// state is unrecoverable; there is no point limping on.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        #[cfg(feature = "std")]
        {
            self.inner.lock().expect("kernel state poisoned")
        }
        #[cfg(not(feature = "std"))]
        {
            self.inner.lock()
        }
    }
}
