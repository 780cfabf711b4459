//! Recursive lock with wait/signal/accept, guarding a threaded mainloop
//!
//! `std::sync::Mutex` is neither recursive nor usable with explicit
//! lock/unlock calls spread across callbacks, so the lock is modelled as an
//! owner + depth pair behind a mutex, with condition variables for handing
//! it over and for the wait/signal/accept handshake.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
    /// Bumped by every `signal()`; waiters sleep until it changes
    signal_seq: u64,
    n_waiting: usize,
    n_waiting_for_accept: usize,
}

#[derive(Debug, Default)]
pub(crate) struct BigLock {
    state: Mutex<LockState>,
    released: Condvar,
    cond: Condvar,
    accept_cond: Condvar,
}

impl BigLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_on<'a>(
        &self,
        condvar: &Condvar,
        guard: MutexGuard<'a, LockState>,
    ) -> MutexGuard<'a, LockState> {
        condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn assert_owned(&self, st: &LockState, op: &str) {
        assert_eq!(
            st.owner,
            Some(thread::current().id()),
            "{}() by a thread that does not hold the mainloop lock",
            op
        );
    }

    /// Give up every recursion level; returns the depth to restore
    fn release<'a>(&self, mut st: MutexGuard<'a, LockState>) -> (MutexGuard<'a, LockState>, usize) {
        let depth = st.depth;
        st.owner = None;
        st.depth = 0;
        self.released.notify_one();
        (st, depth)
    }

    fn reacquire<'a>(
        &self,
        mut st: MutexGuard<'a, LockState>,
        depth: usize,
    ) -> MutexGuard<'a, LockState> {
        while st.owner.is_some() {
            st = self.wait_on(&self.released, st);
        }
        st.owner = Some(thread::current().id());
        st.depth = depth;
        st
    }

    pub(crate) fn lock(&self) {
        let me = thread::current().id();
        let mut st = self.state();
        if st.owner == Some(me) {
            st.depth += 1;
            return;
        }
        let _st = self.reacquire(st, 1);
    }

    pub(crate) fn unlock(&self) {
        let mut st = self.state();
        self.assert_owned(&st, "unlock");
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = None;
            self.released.notify_one();
        }
    }

    #[cfg(test)]
    pub(crate) fn held_by_current(&self) -> bool {
        self.state().owner == Some(thread::current().id())
    }

    /// Release the lock until the next `signal()`, then take it back
    pub(crate) fn wait(&self) {
        let st = self.state();
        self.assert_owned(&st, "wait");

        let (mut st, depth) = self.release(st);
        st.n_waiting += 1;
        let seq = st.signal_seq;
        while st.signal_seq == seq {
            st = self.wait_on(&self.cond, st);
        }
        st.n_waiting -= 1;

        let _st = self.reacquire(st, depth);
    }

    /// Wake every waiter; optionally block until one of them calls `accept()`
    pub(crate) fn signal(&self, wait_for_accept: bool) {
        let mut st = self.state();
        self.assert_owned(&st, "signal");

        st.signal_seq = st.signal_seq.wrapping_add(1);
        self.cond.notify_all();

        if !wait_for_accept {
            return;
        }

        st.n_waiting_for_accept += 1;
        let (mut st, depth) = self.release(st);
        while st.n_waiting_for_accept > 0 {
            st = self.wait_on(&self.accept_cond, st);
        }
        let _st = self.reacquire(st, depth);
    }

    /// Let a `signal(true)` caller continue
    pub(crate) fn accept(&self) {
        let mut st = self.state();
        self.assert_owned(&st, "accept");
        assert!(
            st.n_waiting_for_accept > 0,
            "accept() without a pending signal"
        );
        st.n_waiting_for_accept -= 1;
        self.accept_cond.notify_all();
    }

    /// Threads currently blocked in `wait()`
    #[cfg(test)]
    pub(crate) fn waiters(&self) -> usize {
        self.state().n_waiting
    }
}
