use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::core::sync::lock_unpoisoned;

/// An item popped together with the number of items still queued behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRemaining<T> {
    pub value: T,
    pub remaining: usize,
}

/// Unbounded multi-producer multi-consumer FIFO with blocking pop.
///
/// Items come out in exactly the order they were pushed; with several
/// consumers each item is delivered to exactly one of them.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        lock_unpoisoned(&self.items).push_back(item);
        self.available.notify_one();
    }

    /// Blocks until an item is available.
    pub fn pop(&self) -> T {
        self.pop_with_remaining().value
    }

    /// Blocks until an item is available and reports the remaining depth
    /// observed atomically with the removal.
    pub fn pop_with_remaining(&self) -> ValueRemaining<T> {
        let mut items = lock_unpoisoned(&self.items);
        loop {
            if let Some(value) = items.pop_front() {
                return ValueRemaining {
                    value,
                    remaining: items.len(),
                };
            }
            items = self.wait(items);
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        lock_unpoisoned(&self.items).pop_front()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = lock_unpoisoned(&self.items);
        loop {
            if let Some(value) = items.pop_front() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            items = match self.available.wait_timeout(items, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything currently queued, without blocking.
    pub fn drain(&self) -> Vec<T> {
        lock_unpoisoned(&self.items).drain(..).collect()
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, VecDeque<T>>) -> MutexGuard<'a, VecDeque<T>> {
        match self.available.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
