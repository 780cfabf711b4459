//! Bounded lock-free SPSC queue of boxed items with pollable wakeups
//!
//! The ring is an array of `AtomicPtr<T>` cells. A null cell is free. The
//! producer CASes a pointer into the cell at `write_idx`, the consumer takes
//! it out at `read_idx`; each side owns its index outright, so neither needs
//! to be atomic.
//!
//! Two [`FdSem`]s carry the wakeups:
//!
//! - `write_fdsem` is posted by the producer after every push ("item ready")
//!   and is what the consumer polls.
//! - `read_fdsem` is posted by the consumer after every pop ("slot free")
//!   and is what a producer with a pending local list polls.
//!
//! `post()` never blocks. When the ring is full it parks the item on the
//! producer's local list, which is flushed in FIFO order before any later
//! push so the consumer never sees items out of order.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering::SeqCst};
use std::sync::Arc;

use crate::config::{OverflowPolicy, DEFAULT_QUEUE_CAPACITY};
use crate::error::{MqError, MqResult};
use crate::sync::{FdSem, RateLimit};

/// Ring capacity used when 0 is requested
pub const DEFAULT_CAPACITY: usize = DEFAULT_QUEUE_CAPACITY;

struct Shared<T> {
    cells: Box<[AtomicPtr<T>]>,
    mask: usize,
    /// Posted by the consumer after a pop
    read_fdsem: FdSem,
    /// Posted by the producer after a push
    write_fdsem: FdSem,
    _marker: PhantomData<T>,
}

// SAFETY: cells only ever hold pointers from `Box::into_raw`, and each
// pointer is owned by exactly one side at a time (handed over via CAS).
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn cell(&self, idx: usize) -> &AtomicPtr<T> {
        &self.cells[idx & self.mask]
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        for cell in self.cells.iter() {
            let p = cell.swap(ptr::null_mut(), SeqCst);
            if !p.is_null() {
                // SAFETY: non-null cells hold a leaked Box nobody else owns now
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

/// Create a producer/consumer pair around a ring of `capacity` cells
///
/// `capacity` must be a power of two; 0 selects [`DEFAULT_CAPACITY`].
pub fn channel<T: Send>(
    capacity: usize,
    localq_limit: usize,
    policy: OverflowPolicy,
) -> MqResult<(Producer<T>, Consumer<T>)> {
    let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
    if !capacity.is_power_of_two() {
        return Err(MqError::InvalidCapacity(capacity));
    }

    let cells: Box<[AtomicPtr<T>]> = (0..capacity)
        .map(|_| AtomicPtr::new(ptr::null_mut()))
        .collect();

    let shared = Arc::new(Shared {
        cells,
        mask: capacity - 1,
        read_fdsem: FdSem::new()?,
        write_fdsem: FdSem::new()?,
        _marker: PhantomData,
    });

    log::debug!(
        "asyncq created: capacity={} localq_limit={} policy={:?}",
        capacity,
        localq_limit,
        policy
    );

    Ok((
        Producer {
            shared: Arc::clone(&shared),
            write_idx: 0,
            localq: VecDeque::new(),
            localq_limit,
            policy,
            waiting_for_post: false,
            overrun_log: RateLimit::default(),
        },
        Consumer { shared, read_idx: 0 },
    ))
}

/// Writing half. Exactly one thread may use it at a time.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    write_idx: usize,
    /// Items that did not fit in the ring, oldest first
    localq: VecDeque<Box<T>>,
    localq_limit: usize,
    policy: OverflowPolicy,
    /// Registered on `read_fdsem` by `write_before_poll()`
    waiting_for_post: bool,
    overrun_log: RateLimit,
}

impl<T: Send> Producer<T> {
    /// Ring capacity
    pub fn capacity(&self) -> usize {
        self.shared.cells.len()
    }

    fn push_ring(&mut self, item: Box<T>, wait: bool) -> Result<(), Box<T>> {
        let p = Box::into_raw(item);
        let cell = self.shared.cell(self.write_idx);

        if cell
            .compare_exchange(ptr::null_mut(), p, SeqCst, SeqCst)
            .is_err()
        {
            if !wait {
                // SAFETY: the CAS failed, so `p` was never published
                return Err(unsafe { Box::from_raw(p) });
            }

            loop {
                self.shared.read_fdsem.wait();
                if cell
                    .compare_exchange(ptr::null_mut(), p, SeqCst, SeqCst)
                    .is_ok()
                {
                    break;
                }
            }
        }

        self.write_idx = self.write_idx.wrapping_add(1);
        self.shared.write_fdsem.post();
        Ok(())
    }

    /// Move locally queued items into the ring, oldest first
    ///
    /// Returns `true` once the local list is empty.
    pub fn flush(&mut self, wait: bool) -> bool {
        while let Some(item) = self.localq.pop_front() {
            if let Err(item) = self.push_ring(item, wait) {
                self.localq.push_front(item);
                return false;
            }
        }
        true
    }

    /// Push an item, blocking for a free slot if `wait` is set
    ///
    /// The local list is flushed first; if that fails the item is handed
    /// back untouched.
    pub fn push(&mut self, item: Box<T>, wait: bool) -> Result<(), Box<T>> {
        if !self.flush(wait) {
            return Err(item);
        }
        self.push_ring(item, wait)
    }

    /// Enqueue without blocking, parking the item locally if the ring is full
    ///
    /// Fails only when the local list is at its limit and the policy is
    /// [`OverflowPolicy::Reject`].
    pub fn post(&mut self, item: Box<T>) -> Result<(), Box<T>> {
        let item = if self.flush(false) {
            match self.push_ring(item, false) {
                Ok(()) => return Ok(()),
                Err(item) => item,
            }
        } else {
            item
        };

        if self.localq.len() >= self.localq_limit {
            return match self.policy {
                OverflowPolicy::Reject => {
                    if self.overrun_log.check() {
                        log::warn!(
                            "Queue overrun, local list full ({} items), rejecting",
                            self.localq.len()
                        );
                    }
                    Err(item)
                }
                OverflowPolicy::Block => self.push(item, true),
            };
        }

        if self.overrun_log.check() {
            log::warn!("Queue overrun, queuing locally");
        }
        self.localq.push_back(item);

        // Arm the "slot free" wakeup so the producing loop flushes the list
        if !self.waiting_for_post {
            self.write_before_poll();
        }
        Ok(())
    }

    /// Items parked on the local list
    pub fn pending_local(&self) -> usize {
        self.localq.len()
    }

    /// Descriptor that becomes readable when the consumer frees a slot
    pub fn write_fd(&self) -> RawFd {
        self.shared.read_fdsem.fd()
    }

    /// Flush what fits; if items remain, register for a "slot free" wakeup
    ///
    /// Already registered producers only flush, so each registration is
    /// matched by exactly one `write_after_poll()`.
    pub fn write_before_poll(&mut self) {
        if self.waiting_for_post {
            self.flush(false);
            return;
        }

        loop {
            if self.flush(false) {
                break;
            }
            if !self.shared.read_fdsem.before_poll() {
                self.waiting_for_post = true;
                break;
            }
        }
    }

    pub fn write_after_poll(&mut self) {
        if self.waiting_for_post {
            self.shared.read_fdsem.after_poll();
            self.waiting_for_post = false;
        }
    }
}

impl<T> std::fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("write_idx", &self.write_idx)
            .field("pending_local", &self.localq.len())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Reading half. Exactly one thread may use it at a time.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    read_idx: usize,
}

impl<T: Send> Consumer<T> {
    /// Take the next item, blocking until one arrives if `wait` is set
    pub fn pop(&mut self, wait: bool) -> Option<Box<T>> {
        let cell = self.shared.cell(self.read_idx);

        let mut p = cell.load(SeqCst);
        if p.is_null() {
            if !wait {
                return None;
            }
            loop {
                self.shared.write_fdsem.wait();
                p = cell.load(SeqCst);
                if !p.is_null() {
                    break;
                }
            }
        }

        let taken = cell.compare_exchange(p, ptr::null_mut(), SeqCst, SeqCst);
        assert!(taken.is_ok(), "asyncq cell changed under a single reader");

        self.read_idx = self.read_idx.wrapping_add(1);
        self.shared.read_fdsem.post();

        // SAFETY: the CAS transferred ownership of the leaked Box to us
        Some(unsafe { Box::from_raw(p) })
    }

    /// Descriptor that becomes readable when the producer pushes
    pub fn read_fd(&self) -> RawFd {
        self.shared.write_fdsem.fd()
    }

    /// Returns `true` if an item is ready (do not poll), `false` once
    /// registered for a wakeup on [`read_fd`](Self::read_fd)
    pub fn read_before_poll(&mut self) -> bool {
        let cell = self.shared.cell(self.read_idx);
        loop {
            if !cell.load(SeqCst).is_null() {
                return true;
            }
            if !self.shared.write_fdsem.before_poll() {
                return false;
            }
        }
    }

    pub fn read_after_poll(&mut self) {
        self.shared.write_fdsem.after_poll();
    }
}

impl<T> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("read_idx", &self.read_idx)
            .finish()
    }
}
