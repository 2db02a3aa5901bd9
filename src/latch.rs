//! Hybrid latch with optimistic versioning.
//!
//! The key difference from a standard `RwLock` is the ability of acquiring
//! optimistic read access without performing any writes to memory. This mode
//! of access is called optimistic because writers are not blocked by it and
//! may perform writes while optimistic access is still in place.
//!
//! Those reads would normally result in undefined behavior, but can be made
//! safe by correctly validating each optimistic access before allowing any
//! side effects to happen. The validation is performed through the
//! [`OptimisticGuard::recheck`] method that returns [`error::Error::Unwind`]
//! if any writes could have taken place since the acquisition of the
//! optimistic access.
//!
//! We refer to unwinding as the premature return from a function that
//! performed invalid accesses with the error variant
//! [`error::Error::Unwind`]. The `?` operator is a very ergonomic way to
//! perform this kind of validation:
//!
//! ```
//! use swipbuf::latch::HybridLatch;
//! use swipbuf::error;
//!
//! let latch = HybridLatch::new(10usize);
//! let mut guard = latch.optimistic_or_spin();
//!
//! loop {
//!     let access = || {
//!         let n = *guard;
//!         guard.recheck()?; // validation
//!         println!("n is {}", n); // side effect
//!         error::Result::Ok(())
//!     };
//!
//!     match access() {
//!         Ok(_) => break,
//!         Err(_) => {
//!             // Access was invalidated by some write from another thread,
//!             // acquire a new guard and retry
//!             guard = latch.optimistic_or_spin();
//!             continue;
//!         }
//!     }
//! }
//! ```
//!
//! Guards carry two type parameters: the mapped target `T` and the unmapped
//! root `U` stored in the latch (`U = T` until [`OptimisticGuard::map`] or
//! [`ExclusiveGuard::map`] narrows the guard to a part of the protected
//! value). Validation always happens against the root latch, so a guard
//! mapped to a single field keeps protecting against any write to the whole
//! value.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use parking_lot_core::SpinWait;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error;

/// A hybrid latch that uses versioning to enable optimistic, shared or
/// exclusive access to the underlying data.
pub struct HybridLatch<T: ?Sized> {
    version: AtomicUsize,
    lock: RwLock<()>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for HybridLatch<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for HybridLatch<T> {}

impl<T> HybridLatch<T> {
    /// Creates a new instance of a `HybridLatch<T>` which is unlocked.
    #[inline]
    pub fn new(data: T) -> HybridLatch<T> {
        HybridLatch {
            version: AtomicUsize::new(0),
            lock: RwLock::new(()),
            data: UnsafeCell::new(data),
        }
    }

    /// Locks this `HybridLatch` with exclusive write access, blocking the
    /// thread until it can be acquired.
    #[inline]
    pub fn exclusive(&self) -> ExclusiveGuard<'_, T> {
        let guard = self.lock.write();
        let version = self.version.load(Ordering::Relaxed) + 1;
        self.version.store(version, Ordering::Release);
        ExclusiveGuard {
            latch: self,
            guard,
            data: self.data.get(),
            version,
        }
    }

    /// Tries to lock this `HybridLatch` with exclusive write access without
    /// blocking.
    #[inline]
    pub fn try_exclusive(&self) -> Option<ExclusiveGuard<'_, T>> {
        let guard = self.lock.try_write()?;
        let version = self.version.load(Ordering::Relaxed) + 1;
        self.version.store(version, Ordering::Release);
        Some(ExclusiveGuard {
            latch: self,
            guard,
            data: self.data.get(),
            version,
        })
    }

    /// Locks this `HybridLatch` with shared read access, blocking the thread
    /// until it can be acquired. Reads from shared access do not need to be
    /// validated.
    #[inline]
    pub fn shared(&self) -> SharedGuard<'_, T> {
        let guard = self.lock.read();
        let version = self.version.load(Ordering::Relaxed);
        SharedGuard {
            latch: self,
            guard,
            data: self.data.get(),
            version,
        }
    }

    /// Acquires optimistic read access, spinning while the latch is
    /// exclusively locked.
    ///
    /// Optimistic access must be validated before performing any action based
    /// on a read of the underlying data. See [`OptimisticGuard::recheck`].
    #[inline(never)]
    pub fn optimistic_or_spin(&self) -> OptimisticGuard<'_, T> {
        let mut version = self.version.load(Ordering::Acquire);
        if (version & 1) == 1 {
            let mut spinwait = SpinWait::new();
            loop {
                version = self.version.load(Ordering::Acquire);
                if (version & 1) == 1 {
                    let result = spinwait.spin();
                    if !result {
                        spinwait.reset();
                    }
                    continue;
                } else {
                    break;
                }
            }
        }

        OptimisticGuard {
            latch: self,
            data: self.data.get(),
            version,
        }
    }

    /// Tries to acquire optimistic read access, unwinding on contention.
    #[inline]
    pub fn optimistic_or_unwind(&self) -> error::Result<OptimisticGuard<'_, T>> {
        let version = self.version.load(Ordering::Acquire);
        if (version & 1) == 1 {
            return Err(error::Error::Unwind);
        }

        Ok(OptimisticGuard {
            latch: self,
            data: self.data.get(),
            version,
        })
    }

    #[inline]
    pub fn is_exclusively_latched(&self) -> bool {
        (self.version.load(Ordering::Acquire) & 1) == 1
    }
}

impl<T: ?Sized> HybridLatch<T> {
    /// Raw pointer to the protected data.
    ///
    /// Reads or writes through it are only sound under the access protocol
    /// the caller has established elsewhere (e.g. atomics in the protected
    /// value, or an external mutex serializing all parties).
    #[inline]
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

impl<T> std::convert::AsMut<T> for HybridLatch<T> {
    #[inline]
    fn as_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

/// Trait to allow using any guard when only read access is needed.
pub trait HybridGuard<T: ?Sized, U: ?Sized = T> {
    /// Allows read access to the underlying data, which must be validated
    /// before any side effects.
    fn inner(&self) -> &T;

    /// Validates any accesses performed through this guard.
    fn recheck(&self) -> error::Result<()>;

    /// Returns a reference to the original `HybridLatch`.
    fn latch(&self) -> &HybridLatch<U>;
}

/// Structure used to perform optimistic accesses and validation.
pub struct OptimisticGuard<'a, T: ?Sized, U: ?Sized = T> {
    latch: &'a HybridLatch<U>,
    data: *const T,
    version: usize,
}

unsafe impl<'a, T: ?Sized + Sync, U: ?Sized + Sync> Sync for OptimisticGuard<'a, T, U> {}

impl<'a, T: ?Sized, U: ?Sized> OptimisticGuard<'a, T, U> {
    /// Validates all optimistic accesses since the creation of the guard,
    /// if validation fails an [`error::Error::Unwind`] is returned to signal
    /// that the stack should be unwinded (by conditional returns) to a safe
    /// state.
    #[inline]
    pub fn recheck(&self) -> error::Result<()> {
        if self.version != self.latch.version.load(Ordering::Acquire) {
            return Err(error::Error::Unwind);
        }
        Ok(())
    }

    /// Tries to acquire exclusive access at the observed version, blocking on
    /// the underlying lock if some other thread holds it.
    ///
    /// Must not be used while already holding any other latch or mutex, see
    /// [`OptimisticGuard::try_to_exclusive`] for those cases.
    #[inline]
    pub fn to_exclusive(self) -> error::Result<ExclusiveGuard<'a, T, U>> {
        let new_version = self.version + 1;
        let expected = self.version;
        let locked = self.latch.lock.write();
        if self
            .latch
            .version
            .compare_exchange(expected, new_version, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            drop(locked);
            return Err(error::Error::Unwind);
        }

        Ok(ExclusiveGuard {
            latch: self.latch,
            guard: locked,
            data: self.data as *mut T,
            version: new_version,
        })
    }

    /// Tries to acquire exclusive access at the observed version without ever
    /// blocking, unwinding on any contention.
    #[inline]
    pub fn try_to_exclusive(self) -> error::Result<ExclusiveGuard<'a, T, U>> {
        let new_version = self.version + 1;
        let expected = self.version;
        let locked = match self.latch.lock.try_write() {
            Some(locked) => locked,
            None => return Err(error::Error::Unwind),
        };
        if self
            .latch
            .version
            .compare_exchange(expected, new_version, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            drop(locked);
            return Err(error::Error::Unwind);
        }

        Ok(ExclusiveGuard {
            latch: self.latch,
            guard: locked,
            data: self.data as *mut T,
            version: new_version,
        })
    }

    /// Tries to acquire shared access after validation of all previous
    /// optimistic accesses on this guard.
    #[inline]
    pub fn to_shared(self) -> error::Result<SharedGuard<'a, T, U>> {
        if let Some(guard) = self.latch.lock.try_read() {
            if self.version != self.latch.version.load(Ordering::Relaxed) {
                return Err(error::Error::Unwind);
            }

            Ok(SharedGuard {
                latch: self.latch,
                guard,
                data: self.data,
                version: self.version,
            })
        } else {
            Err(error::Error::Unwind)
        }
    }

    /// Narrows the guard to a part of the protected value. The selector may
    /// itself unwind; the mapping is validated before the new guard is
    /// returned.
    #[inline]
    pub fn map<V: ?Sized, F>(guard: Self, f: F) -> error::Result<OptimisticGuard<'a, V, U>>
    where
        F: FnOnce(&T) -> error::Result<&V>,
    {
        let data = f(unsafe { &*guard.data })? as *const V;
        guard.recheck()?;
        Ok(OptimisticGuard {
            latch: guard.latch,
            data,
            version: guard.version,
        })
    }

    /// Returns a reference to the original `HybridLatch`.
    pub fn latch(&self) -> &'a HybridLatch<U> {
        self.latch
    }
}

impl<'a, T: ?Sized, U: ?Sized> std::ops::Deref for OptimisticGuard<'a, T, U> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.data }
    }
}

impl<'a, T: ?Sized, U: ?Sized> HybridGuard<T, U> for OptimisticGuard<'a, T, U> {
    fn inner(&self) -> &T {
        self
    }
    fn recheck(&self) -> error::Result<()> {
        self.recheck()
    }
    fn latch(&self) -> &HybridLatch<U> {
        self.latch()
    }
}

/// RAII structure used to release the exclusive write access of a latch when
/// dropped.
pub struct ExclusiveGuard<'a, T: ?Sized, U: ?Sized = T> {
    latch: &'a HybridLatch<U>,
    #[allow(dead_code)]
    guard: RwLockWriteGuard<'a, ()>,
    data: *mut T,
    version: usize,
}

unsafe impl<'a, T: ?Sized + Sync, U: ?Sized + Sync> Sync for ExclusiveGuard<'a, T, U> {}

impl<'a, T: ?Sized, U: ?Sized> ExclusiveGuard<'a, T, U> {
    /// A sanity assertion, exclusive guards do not need to be validated.
    #[inline]
    pub fn recheck(&self) {
        assert!(self.version == self.latch.version.load(Ordering::Relaxed));
    }

    /// Unlocks the `HybridLatch` returning an [`OptimisticGuard`] at the new
    /// version.
    #[inline]
    pub fn unlock(self) -> OptimisticGuard<'a, T, U> {
        let new_version = self.version + 1;
        let latch = self.latch;
        let data = self.data;
        // The version is incremented in drop
        drop(self);
        OptimisticGuard {
            latch,
            data,
            version: new_version,
        }
    }

    /// Narrows the guard to a part of the protected value.
    #[inline]
    pub fn map<V: ?Sized, F>(guard: Self, f: F) -> ExclusiveGuard<'a, V, U>
    where
        F: FnOnce(&mut T) -> &mut V,
    {
        let data = f(unsafe { &mut *guard.data }) as *mut V;
        let latch = guard.latch;
        let version = guard.version;
        let lock_guard = unsafe { std::ptr::read(&guard.guard) };
        std::mem::forget(guard);
        ExclusiveGuard {
            latch,
            guard: lock_guard,
            data,
            version,
        }
    }

    /// Mutable access to the unmapped root value of the latch.
    #[inline]
    pub fn as_unmapped_mut(&mut self) -> &mut U {
        unsafe { &mut *self.latch.data_ptr() }
    }

    /// Returns a reference to the original `HybridLatch`.
    pub fn latch(&self) -> &'a HybridLatch<U> {
        self.latch
    }
}

impl<'a, T: ?Sized, U: ?Sized> Drop for ExclusiveGuard<'a, T, U> {
    #[inline]
    fn drop(&mut self) {
        let new_version = self.version + 1;
        self.latch.version.store(new_version, Ordering::Release);
    }
}

impl<'a, T: ?Sized, U: ?Sized> std::ops::Deref for ExclusiveGuard<'a, T, U> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.data }
    }
}

impl<'a, T: ?Sized, U: ?Sized> std::ops::DerefMut for ExclusiveGuard<'a, T, U> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data }
    }
}

impl<'a, T: ?Sized, U: ?Sized> std::convert::AsMut<T> for ExclusiveGuard<'a, T, U> {
    #[inline]
    fn as_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data }
    }
}

impl<'a, T: ?Sized, U: ?Sized> HybridGuard<T, U> for ExclusiveGuard<'a, T, U> {
    fn inner(&self) -> &T {
        self
    }
    fn recheck(&self) -> error::Result<()> {
        self.recheck();
        Ok(())
    }
    fn latch(&self) -> &HybridLatch<U> {
        self.latch()
    }
}

/// RAII structure used to release the shared read access of a latch when
/// dropped.
pub struct SharedGuard<'a, T: ?Sized, U: ?Sized = T> {
    latch: &'a HybridLatch<U>,
    #[allow(dead_code)]
    guard: RwLockReadGuard<'a, ()>,
    data: *const T,
    version: usize,
}

unsafe impl<'a, T: ?Sized + Sync, U: ?Sized + Sync> Sync for SharedGuard<'a, T, U> {}

impl<'a, T: ?Sized, U: ?Sized> SharedGuard<'a, T, U> {
    /// A sanity assertion, shared guards do not need to be validated.
    #[inline]
    pub fn recheck(&self) {
        assert!(self.version == self.latch.version.load(Ordering::Relaxed));
    }

    /// Unlocks the `HybridLatch` returning an [`OptimisticGuard`] at the
    /// current version.
    #[inline]
    pub fn unlock(self) -> OptimisticGuard<'a, T, U> {
        OptimisticGuard {
            latch: self.latch,
            data: self.data,
            version: self.version,
        }
    }

    /// Returns a reference to the original `HybridLatch`.
    pub fn latch(&self) -> &'a HybridLatch<U> {
        self.latch
    }
}

impl<'a, T: ?Sized, U: ?Sized> std::ops::Deref for SharedGuard<'a, T, U> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.data }
    }
}

impl<'a, T: ?Sized, U: ?Sized> HybridGuard<T, U> for SharedGuard<'a, T, U> {
    fn inner(&self) -> &T {
        self
    }
    fn recheck(&self) -> error::Result<()> {
        self.recheck();
        Ok(())
    }
    fn latch(&self) -> &HybridLatch<U> {
        self.latch()
    }
}
