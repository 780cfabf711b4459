//! Bounded free-list of boxed values
//!
//! Lets a hot path reuse heap allocations instead of going through the
//! allocator for every message. Both ends are lock-free.

use crossbeam::queue::ArrayQueue;

pub struct Pool<T> {
    slots: ArrayQueue<Box<T>>,
}

impl<T> Pool<T> {
    /// Pool that retains at most `capacity` boxes (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Reuse a previously returned box, if any
    pub fn take(&self) -> Option<Box<T>> {
        self.slots.pop()
    }

    /// Return a box for reuse; it is dropped if the pool is full
    pub fn give(&self, item: Box<T>) {
        let _ = self.slots.push(item);
    }

    /// Boxes currently available
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("len", &self.slots.len())
            .field("capacity", &self.slots.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuses_allocation() {
        let pool = Pool::new(2);
        let item = Box::new(5u64);
        let addr = &*item as *const u64;

        pool.give(item);
        let again = pool.take().unwrap();
        assert_eq!(&*again as *const u64, addr);
        assert!(pool.take().is_none());
    }

    #[test]
    fn test_full_pool_drops_extra() {
        let pool = Pool::new(1);
        pool.give(Box::new(1));
        pool.give(Box::new(2));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.take().map(|b| *b), Some(1));
    }
}
