//! Mainloop running on its own thread
//!
//! The loop thread holds the big lock at all times except while blocked in
//! `poll()`. Other threads take the lock to call into the loop's API or to
//! touch state shared with its callbacks, and use `wait()` / `signal()` to
//! hand results back and forth:
//!
//! ```ignore
//! let mut ml = ThreadedMainloop::new()?;
//! ml.start()?;
//!
//! ml.lock();
//! let signaller = ml.signaller();
//! once(ml.api(), move |_| {
//!     // runs on the loop thread, lock held
//!     signaller.signal(false);
//! });
//! ml.wait();
//! ml.unlock();
//!
//! ml.stop();
//! ```
//!
//! Calling `lock()`, `wait()` or `stop()` from the loop thread itself would
//! deadlock and panics instead; `once_unlocked()` is the way to run code on
//! the loop thread without the lock.

use std::ffi::CString;
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::api::{self, MainloopApi};
use super::biglock::BigLock;
use super::poll::{sys_poll, Mainloop};
use crate::error::{MqError, MqResult};

/// Thread name used when none was set
pub const DEFAULT_THREAD_NAME: &str = "threaded-ml";

/// Linux limits thread names to 15 bytes
const MAX_THREAD_NAME: usize = 15;

/// Wakes threads blocked in [`ThreadedMainloop::wait`]; usable from loop callbacks
#[derive(Clone)]
pub struct Signaller {
    lock: Arc<BigLock>,
}

impl Signaller {
    /// Must be called with the lock held (always true inside loop callbacks)
    pub fn signal(&self, wait_for_accept: bool) {
        self.lock.signal(wait_for_accept);
    }
}

impl std::fmt::Debug for Signaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signaller").finish_non_exhaustive()
    }
}

pub struct ThreadedMainloop {
    mainloop: Arc<Mainloop>,
    lock: Arc<BigLock>,
    in_once_unlocked: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    name: String,
}

impl ThreadedMainloop {
    pub fn new() -> MqResult<Self> {
        let mainloop = Arc::new(Mainloop::new()?);
        let lock = Arc::new(BigLock::new());

        // The loop thread only lets go of the lock while waiting for events
        let poll_lock = Arc::clone(&lock);
        mainloop.set_poll_func(Some(Box::new(
            move |fds: &mut [libc::pollfd], timeout: i32| {
                poll_lock.unlock();
                let result = sys_poll(fds, timeout);
                poll_lock.lock();
                result
            },
        )));

        Ok(Self {
            mainloop,
            lock,
            in_once_unlocked: Arc::new(AtomicBool::new(false)),
            thread: None,
            name: DEFAULT_THREAD_NAME.to_string(),
        })
    }

    fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn in_worker(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|t| t.thread().id() == thread::current().id())
    }

    /// Spawn the loop thread
    pub fn start(&mut self) -> MqResult<()> {
        assert!(!self.is_running(), "start() on a loop that is already running");

        let mainloop = Arc::clone(&self.mainloop);
        let lock = Arc::clone(&self.lock);

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                block_signals();

                lock.lock();
                match mainloop.run() {
                    Ok(retval) => log::debug!("Threaded mainloop exited with {}", retval),
                    Err(e) => log::error!("Threaded mainloop failed: {}", e),
                }
                lock.unlock();
            })
            .map_err(|e| MqError::ThreadSpawn {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        log::info!("Started mainloop thread '{}'", self.name);
        self.thread = Some(handle);
        Ok(())
    }

    /// Quit the loop and join its thread. No-op if not running.
    pub fn stop(&mut self) {
        if !self.is_running() {
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
            return;
        }
        assert!(!self.in_worker(), "stop() called from the mainloop thread");

        self.lock.lock();
        self.mainloop.quit(0);
        self.lock.unlock();

        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Mainloop thread '{}' panicked", self.name);
            }
        }
    }

    fn assert_may_lock(&self, op: &str) {
        assert!(
            !self.in_worker() || self.in_once_unlocked.load(Ordering::SeqCst),
            "{}() called from the mainloop thread",
            op
        );
    }

    /// Take the big lock (recursive)
    pub fn lock(&self) {
        self.assert_may_lock("lock");
        self.lock.lock();
    }

    pub fn unlock(&self) {
        self.assert_may_lock("unlock");
        self.lock.unlock();
    }

    /// Release the lock until the loop thread signals, then retake it
    pub fn wait(&self) {
        assert!(!self.in_worker(), "wait() called from the mainloop thread");
        self.lock.wait();
    }

    /// Wake threads blocked in `wait()`; with `wait_for_accept`, block until
    /// one of them calls `accept()`
    pub fn signal(&self, wait_for_accept: bool) {
        self.lock.signal(wait_for_accept);
    }

    /// Handle for signalling from loop callbacks
    pub fn signaller(&self) -> Signaller {
        Signaller {
            lock: Arc::clone(&self.lock),
        }
    }

    /// Release a `signal(true)` caller
    pub fn accept(&self) {
        assert!(!self.in_worker(), "accept() called from the mainloop thread");
        self.lock.accept();
    }

    /// Whether the caller is the loop thread
    pub fn in_thread(&self) -> bool {
        self.in_worker()
    }

    pub fn retval(&self) -> i32 {
        self.mainloop.retval()
    }

    /// API of the wrapped loop. Call with the lock held once started.
    pub fn api(&self) -> &dyn MainloopApi {
        self.mainloop.api()
    }

    /// Shared handle to the wrapped loop
    pub fn mainloop(&self) -> Arc<Mainloop> {
        Arc::clone(&self.mainloop)
    }

    /// Name for the loop thread; renames it if already running
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();

        if let Some(handle) = self.thread.as_ref() {
            let truncated = truncate_name(name);
            match CString::new(truncated) {
                Ok(cname) => {
                    // SAFETY: valid pthread handle of a live thread, NUL-terminated name
                    let r = unsafe { libc::pthread_setname_np(handle.as_pthread_t(), cname.as_ptr()) };
                    if r != 0 {
                        log::warn!("Failed to rename mainloop thread to '{}': errno {}", name, r);
                    }
                }
                Err(_) => log::warn!("Thread name {:?} contains a NUL byte", name),
            }
        }
    }

    /// Run `callback` on the loop thread with the lock released
    pub fn once_unlocked<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            !self.in_worker(),
            "once_unlocked() called from the mainloop thread"
        );

        let lock = Arc::clone(&self.lock);
        let flag = Arc::clone(&self.in_once_unlocked);

        api::once(self.mainloop.api(), move |_| {
            flag.store(true, Ordering::SeqCst);
            lock.unlock();

            callback();

            lock.lock();
            flag.store(false, Ordering::SeqCst);
        });
    }
}

impl Drop for ThreadedMainloop {
    fn drop(&mut self) {
        if !self.in_worker() {
            self.stop();
        }
    }
}

impl std::fmt::Debug for ThreadedMainloop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedMainloop")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_THREAD_NAME {
        return name;
    }
    let mut end = MAX_THREAD_NAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Deliver process signals to other threads, keeping a trapped SIGSYS
fn block_signals() {
    // SAFETY: the sigset and sigaction structs are plain data, initialised by
    // the libc calls before use
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        let mut prev: libc::sigset_t = std::mem::zeroed();
        let mut sa: libc::sigaction = std::mem::zeroed();

        libc::sigfillset(&mut mask);

        if libc::pthread_sigmask(libc::SIG_SETMASK, std::ptr::null(), &mut prev) == 0
            && libc::sigismember(&prev, libc::SIGSYS) == 0
            && libc::sigaction(libc::SIGSYS, std::ptr::null(), &mut sa) == 0
            && sa.sa_sigaction != libc::SIG_DFL
        {
            libc::sigdelset(&mut mask, libc::SIGSYS);
        }

        libc::pthread_sigmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_start_signal_stop() {
        let mut ml = ThreadedMainloop::new().unwrap();
        ml.start().unwrap();
        assert!(!ml.in_thread());

        let done = Arc::new(AtomicBool::new(false));
        let thread_name = Arc::new(Mutex::new(None));

        ml.lock();
        {
            let (done, thread_name) = (done.clone(), thread_name.clone());
            let signaller = ml.signaller();
            api::once(ml.api(), move |_| {
                *thread_name.lock().unwrap() = thread::current().name().map(str::to_string);
                done.store(true, Ordering::SeqCst);
                signaller.signal(false);
            });
        }
        while !done.load(Ordering::SeqCst) {
            ml.wait();
        }
        ml.unlock();

        assert_eq!(
            thread_name.lock().unwrap().as_deref(),
            Some(DEFAULT_THREAD_NAME)
        );

        ml.stop();
        assert_eq!(ml.retval(), 0);
    }

    #[test]
    fn test_signal_waits_for_accept() {
        let mut ml = ThreadedMainloop::new().unwrap();
        ml.set_name("accept-ml");
        ml.start().unwrap();

        let value = Arc::new(AtomicUsize::new(0));
        let after_accept = Arc::new(AtomicUsize::new(0));

        ml.lock();
        {
            let (value, after_accept) = (value.clone(), after_accept.clone());
            let signaller = ml.signaller();
            api::once(ml.api(), move |_| {
                value.store(42, Ordering::SeqCst);
                signaller.signal(true);
                // The waiter has consumed `value` by now
                after_accept.store(value.load(Ordering::SeqCst), Ordering::SeqCst);
            });
        }
        while value.load(Ordering::SeqCst) == 0 {
            ml.wait();
        }
        value.store(7, Ordering::SeqCst);
        ml.accept();
        ml.unlock();

        ml.stop();
        assert_eq!(after_accept.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_once_unlocked_releases_lock() {
        let mut ml = ThreadedMainloop::new().unwrap();
        ml.start().unwrap();

        let (started_tx, started_rx) = crossbeam::channel::bounded(1);
        let (resume_tx, resume_rx) = crossbeam::channel::bounded::<()>(1);

        ml.once_unlocked(move || {
            started_tx.send(()).unwrap();
            resume_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        });

        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // The loop thread is inside the callback; the lock must be free
        ml.lock();
        ml.unlock();
        resume_tx.send(()).unwrap();

        ml.stop();
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let mut ml = ThreadedMainloop::new().unwrap();
        ml.stop();
        assert!(!ml.in_thread());
    }

    #[test]
    fn test_truncate_name() {
        assert_eq!(truncate_name("short"), "short");
        assert_eq!(truncate_name("a-very-long-thread-name"), "a-very-long-thr");
    }
}
