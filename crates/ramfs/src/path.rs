//! Bump and reclaim allocation of small unique ids.
//!
//! Used for qid paths and for connection ids. Freed ids go to a reclaim set
//! which is drained before the counter moves, so the counter only grows while
//! the number of live ids does.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use num_traits::{Bounded, One};

use crate::{error::Error, utils::Result};

#[derive(Debug)]
struct State<T> {
    next: T,
    free: BTreeSet<T>,
}

#[derive(Debug)]
pub struct IdAllocator<T> {
    state: Mutex<State<T>>,
}

/// Allocator of qid paths.
pub type PathAllocator = IdAllocator<u64>;

impl<T> IdAllocator<T>
where
    T: Copy + Ord + Bounded + One + std::ops::Add<Output = T>,
{
    pub fn new() -> Self {
        Self::starting_at(T::min_value())
    }

    pub fn starting_at(next: T) -> Self {
        IdAllocator {
            state: Mutex::new(State {
                next,
                free: BTreeSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out an id, preferring reclaimed ones.
    ///
    /// The maximum value of `T` is never issued; reaching it means the id
    /// space is exhausted.
    pub fn alloc(&self) -> Result<T> {
        let mut state = self.lock();

        if let Some(id) = state.free.pop_first() {
            return Ok(id);
        }

        let id = state.next;
        if id == T::max_value() {
            return Err(Error::ResourceExhausted);
        }
        state.next = id + T::one();
        Ok(id)
    }

    /// Return an id for reuse.
    pub fn release(&self, id: T) {
        self.lock().free.insert(id);
    }

    /// Whether `id` currently sits in the reclaim set.
    pub fn is_reclaimed(&self, id: T) -> bool {
        self.lock().free.contains(&id)
    }

    pub fn reclaimed(&self) -> Vec<T> {
        self.lock().free.iter().copied().collect()
    }
}

impl<T> Default for IdAllocator<T>
where
    T: Copy + Ord + Bounded + One + std::ops::Add<Output = T>,
{
    fn default() -> Self {
        Self::new()
    }
}
