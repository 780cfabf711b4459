//! Binary semaphore whose blocking side is a pollable file descriptor
//!
//! The fast path is purely atomic: `post()` only touches the kernel object
//! when some thread has registered itself in `waiting`. The blocking side
//! either sleeps in `read()` (`wait()`) or hands the descriptor to an external
//! `poll()` loop bracketed by `before_poll()` / `after_poll()`.
//!
//! Repeated posts without an intervening wait collapse into one pending
//! wakeup. This is an event flag, not a counting semaphore.
//!
//! All atomics use `SeqCst`: the protocol relies on the store to `signalled`
//! in `post()` being ordered before the load of `waiting`, and on the waiter's
//! increment of `waiting` being ordered before its re-check of `signalled`.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering::SeqCst};

use super::wakefd::WakeFd;
use crate::error::MqResult;

/// fd-backed binary semaphore
#[derive(Debug)]
pub struct FdSem {
    wake: WakeFd,
    /// Threads currently blocked in `wait()` or registered via `before_poll()`
    waiting: AtomicI64,
    /// One pending wakeup
    signalled: AtomicBool,
    /// Tokens written to the kernel object and not yet drained
    in_pipe: AtomicI64,
}

impl FdSem {
    /// Create a semaphore backed by an eventfd, or a pipe if eventfd fails
    pub fn new() -> MqResult<Self> {
        Ok(Self::with_wake(WakeFd::new(false)?))
    }

    /// Create a semaphore backed by a pipe pair
    pub fn with_pipe() -> MqResult<Self> {
        Ok(Self::with_wake(WakeFd::pipe(false)?))
    }

    fn with_wake(wake: WakeFd) -> Self {
        Self {
            wake,
            waiting: AtomicI64::new(0),
            signalled: AtomicBool::new(false),
            in_pipe: AtomicI64::new(0),
        }
    }

    /// Descriptor to poll for readability while registered as waiting
    pub fn fd(&self) -> RawFd {
        self.wake.fd()
    }

    /// Raise the flag; write a wake token only if someone is waiting
    pub fn post(&self) {
        if self.signalled.compare_exchange(false, true, SeqCst, SeqCst).is_err() {
            return;
        }
        if self.waiting.load(SeqCst) <= 0 {
            return;
        }

        self.in_pipe.fetch_add(1, SeqCst);
        loop {
            match self.wake.write_token() {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => fatal("write to", e),
            }
        }
    }

    /// Block until the flag is raised, then clear it
    pub fn wait(&self) {
        self.flush();

        if self.take_signal() {
            return;
        }

        self.waiting.fetch_add(1, SeqCst);
        while !self.take_signal() {
            let tokens = self.read_blocking();
            self.in_pipe.fetch_sub(tokens, SeqCst);
        }
        let prev = self.waiting.fetch_sub(1, SeqCst);
        assert!(prev >= 1, "fdsem waiting counter underflow");
    }

    /// Non-blocking variant of `wait()`. Returns `true` if a pending post was consumed.
    pub fn try_wait(&self) -> bool {
        self.flush();
        self.take_signal()
    }

    /// Register intent to wait before polling `fd()`
    ///
    /// Returns `true` if the flag was already raised (and has been consumed);
    /// in that case nothing was registered and the caller must not poll.
    /// Returns `false` once registered: poll, then call `after_poll()`.
    pub fn before_poll(&self) -> bool {
        self.flush();

        if self.take_signal() {
            return true;
        }

        self.waiting.fetch_add(1, SeqCst);

        if self.take_signal() {
            let prev = self.waiting.fetch_sub(1, SeqCst);
            assert!(prev >= 1, "fdsem waiting counter underflow");
            return true;
        }

        false
    }

    /// Unregister after polling. Returns `true` if a post arrived meanwhile.
    pub fn after_poll(&self) -> bool {
        let prev = self.waiting.fetch_sub(1, SeqCst);
        assert!(prev >= 1, "after_poll() without a matching before_poll()");

        self.flush();
        self.take_signal()
    }

    fn take_signal(&self) -> bool {
        self.signalled
            .compare_exchange(true, false, SeqCst, SeqCst)
            .is_ok()
    }

    /// Drain exactly the tokens still outstanding in the kernel object
    fn flush(&self) {
        if self.in_pipe.load(SeqCst) <= 0 {
            return;
        }

        loop {
            let tokens = self.read_blocking();
            if self.in_pipe.fetch_sub(tokens, SeqCst) <= tokens {
                break;
            }
        }
    }

    fn read_blocking(&self) -> i64 {
        loop {
            match self.wake.read_tokens() {
                Ok(n) => return n as i64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => fatal("read from", e),
            }
        }
    }
}

/// The messaging fabric cannot operate without its wake primitive
fn fatal(op: &str, err: io::Error) -> ! {
    log::error!("Invalid {} fdsem wake descriptor: {}", op, err);
    std::process::abort();
}
