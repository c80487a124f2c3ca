//! Reader/writer lock with explicit upgrade and downgrade transitions.
//!
//! Semantics follow the kernel's `lck_rw` family rather than
//! `std::sync::RwLock`:
//! - [`SharedGuard::try_upgrade`] may fail. On failure the shared hold has
//!   already been released and the caller holds nothing.
//! - [`ExclusiveGuard::downgrade`] never fails and never lets a writer in
//!   between.
//! - A pending writer or upgrader blocks new readers.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::mem;
use std::ops::{Deref, DerefMut};

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    upgrading: bool,
    waiting_writers: usize,
}

impl LockState {
    fn readers_may_enter(&self) -> bool {
        !self.writer && !self.upgrading && self.waiting_writers == 0
    }
}

pub struct RwLock<T> {
    state: Mutex<LockState>,
    changed: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `state` exactly like a standard
// reader/writer lock: shared guards hand out `&T`, the exclusive guard `&mut T`.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            changed: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> SharedGuard<'_, T> {
        let mut state = self.state.lock();
        while !state.readers_may_enter() {
            self.changed.wait(&mut state);
        }
        state.readers += 1;
        SharedGuard { lock: self }
    }

    pub fn write(&self) -> ExclusiveGuard<'_, T> {
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while state.writer || state.upgrading || state.readers > 0 {
            self.changed.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = true;
        ExclusiveGuard { lock: self }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn release_shared(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            self.changed.notify_all();
        }
    }

    fn release_exclusive(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        self.changed.notify_all();
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Shared access; released on drop.
pub struct SharedGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<'a, T> SharedGuard<'a, T> {
    /// Attempts to convert this shared hold into exclusive access.
    ///
    /// Fails when another reader is already upgrading. In that case the
    /// shared hold is released and `None` is returned; anything read under it
    /// must be treated as possibly stale.
    pub fn try_upgrade(self) -> Option<ExclusiveGuard<'a, T>> {
        let lock = self.lock;
        mem::forget(self);

        let mut state = lock.state.lock();
        state.readers -= 1;
        if state.upgrading {
            lock.changed.notify_all();
            return None;
        }
        state.upgrading = true;
        while state.readers > 0 {
            lock.changed.wait(&mut state);
        }
        state.upgrading = false;
        state.writer = true;
        Some(ExclusiveGuard { lock })
    }
}

impl<T> Deref for SharedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a shared hold excludes writers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for SharedGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

/// Exclusive access; released on drop.
pub struct ExclusiveGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<'a, T> ExclusiveGuard<'a, T> {
    /// Converts to a shared hold without letting any writer in between.
    pub fn downgrade(self) -> SharedGuard<'a, T> {
        let lock = self.lock;
        mem::forget(self);

        let mut state = lock.state.lock();
        state.writer = false;
        state.readers += 1;
        lock.changed.notify_all();
        SharedGuard { lock }
    }
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the exclusive hold excludes every other guard.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the exclusive hold excludes every other guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_multiple_readers_coexist() {
        let lock = RwLock::new(5);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 10);
    }

    #[test]
    fn test_write_then_read() {
        let lock = RwLock::new(Vec::new());
        lock.write().push(1);
        lock.write().push(2);
        assert_eq!(*lock.read(), vec![1, 2]);
    }

    #[test]
    fn test_sole_reader_upgrade_succeeds() {
        let lock = RwLock::new(0);
        let shared = lock.read();
        let mut exclusive = shared.try_upgrade().expect("sole reader upgrades");
        *exclusive = 7;
        drop(exclusive);
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn test_downgrade_keeps_value_visible() {
        let lock = RwLock::new(1);
        let mut exclusive = lock.write();
        *exclusive = 2;
        let shared = exclusive.downgrade();
        assert_eq!(*shared, 2);
        let other = lock.read();
        assert_eq!(*other, 2);
    }

    #[test]
    fn test_second_upgrader_fails_and_releases() {
        let lock = Arc::new(RwLock::new(0u32));
        let barrier = Arc::new(Barrier::new(2));
        let first = lock.read();

        let waiter = {
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let shared = lock.read();
                barrier.wait();
                // Blocks until the main thread's shared hold is gone.
                let mut exclusive = shared.try_upgrade().expect("first upgrader wins");
                *exclusive += 1;
            })
        };

        barrier.wait();
        // Wait until the other thread is registered as upgrading.
        loop {
            if lock.state.lock().upgrading {
                break;
            }
            thread::yield_now();
        }
        assert!(first.try_upgrade().is_none());

        waiter.join().unwrap();
        assert_eq!(*lock.read(), 1);
    }

    #[test]
    fn test_concurrent_writers_are_exclusive() {
        let lock = Arc::new(RwLock::new(0usize));
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let mut guard = lock.write();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    *guard += 1;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.read(), 1600);
    }

    #[test]
    fn test_mixed_readers_writers_and_upgrades() {
        let lock = Arc::new(RwLock::new(0usize));
        let mut handles = vec![];

        for i in 0..6 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                let mut upgraded = 0;
                for _ in 0..100 {
                    if i % 2 == 0 {
                        let shared = lock.read();
                        if let Some(mut exclusive) = shared.try_upgrade() {
                            *exclusive += 1;
                            upgraded += 1;
                        }
                    } else {
                        *lock.write() += 1;
                    }
                }
                upgraded
            }));
        }
        let upgrades: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(*lock.read(), 300 + upgrades);
    }
}
