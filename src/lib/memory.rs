//! Pre-allocated tensor slab pools.
//!
//! Inference batches reuse fixed-shape buffers instead of allocating per
//! batch. A [`MemoryManager`] owns a fixed set of slabs sized for one batch
//! each; callers register once at startup and then acquire/release around
//! every batch. Acquisition is scoped: the [`SlabGuard`] returns its slab on
//! drop, so abnormal exits cannot leak pool capacity.

use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::{Result, SquallError};

struct PoolState<T> {
    slabs: Vec<Vec<T>>,
}

/// A pool of identically sized, pre-allocated slabs.
pub struct MemoryManager<T> {
    state: Mutex<PoolState<T>>,
    available: Condvar,
    num_slabs: usize,
    users: AtomicUsize,
}

impl<T: Default + Clone> MemoryManager<T> {
    /// Pre-allocate `num_slabs` slabs of `slab_len` elements each.
    #[must_use]
    pub fn new(num_slabs: usize, slab_len: usize) -> Self {
        let slabs = (0..num_slabs).map(|_| vec![T::default(); slab_len]).collect();
        Self {
            state: Mutex::new(PoolState { slabs }),
            available: Condvar::new(),
            num_slabs,
            users: AtomicUsize::new(0),
        }
    }

    /// Register one concurrent user of the pool.
    ///
    /// # Errors
    ///
    /// Returns [`SquallError::PoolExhausted`] when more users register than
    /// there are slabs; that configuration would eventually deadlock in
    /// `acquire`, so it is rejected up front.
    pub fn register_user(&self) -> Result<()> {
        let users = self.users.fetch_add(1, Ordering::SeqCst) + 1;
        if users > self.num_slabs {
            return Err(SquallError::PoolExhausted { users, slabs: self.num_slabs });
        }
        Ok(())
    }

    /// Take a slab, blocking until one is free.
    pub fn acquire(&self) -> SlabGuard<'_, T> {
        let mut state = self.state.lock();
        while state.slabs.is_empty() {
            self.available.wait(&mut state);
        }
        let slab = state.slabs.pop().expect("pool has a slab");
        SlabGuard { pool: self, slab: Some(slab) }
    }

    fn release(&self, slab: Vec<T>) {
        self.state.lock().slabs.push(slab);
        self.available.notify_one();
    }

    /// Number of slabs currently free.
    pub fn free_slabs(&self) -> usize {
        self.state.lock().slabs.len()
    }
}

/// Scoped slab handle; returns the slab to the pool on drop.
pub struct SlabGuard<'a, T: Default + Clone> {
    pool: &'a MemoryManager<T>,
    slab: Option<Vec<T>>,
}

impl<T: Default + Clone> Deref for SlabGuard<'_, T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Vec<T> {
        self.slab.as_ref().expect("slab present until drop")
    }
}

impl<T: Default + Clone> DerefMut for SlabGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        self.slab.as_mut().expect("slab present until drop")
    }
}

impl<T: Default + Clone> Drop for SlabGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(slab) = self.slab.take() {
            self.pool.release(slab);
        }
    }
}
