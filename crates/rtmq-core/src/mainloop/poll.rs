//! `poll(2)`-based mainloop
//!
//! One iteration is `prepare()` → `poll()` → `dispatch()`:
//!
//! ```text
//! Passive --prepare--> Prepared --poll--> Polling --> Polled --dispatch--> Passive
//!     \___________________ quit requested at any step ___________________/--> Quit
//! ```
//!
//! Enabled defer events starve the poll: while any is enabled the loop does
//! not block and only defer callbacks are dispatched. Otherwise the poll
//! timeout is bounded by the earliest armed timer.
//!
//! Callbacks always run with the loop's internal lock released, so they may
//! create, modify and free events (including their own) and call `quit()`.
//! Freed events are only reclaimed in `prepare()`, where their destroy
//! callbacks run.

use std::io;
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::api::{
    DeferCallback, DeferEvent, DestroyCallback, IoCallback, IoEvent, IoEventFlags, MainloopApi,
    TimeCallback, TimeEvent,
};
use crate::error::{MqError, MqResult};
use crate::sync::wakefd::WakeFd;

/// Replacement for `poll(2)`: receives the pollfd set and a timeout in
/// milliseconds (-1 = infinite), returns the number of ready descriptors
pub type PollFunc = Box<dyn FnMut(&mut [libc::pollfd], i32) -> io::Result<usize> + Send>;

/// Plain `poll(2)` on a pollfd slice
pub(crate) fn sys_poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    // SAFETY: pointer and length describe a live, exclusively borrowed slice
    let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if r < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(r as usize)
    }
}

/// Round up to whole milliseconds; `None` is an infinite wait
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_micros().div_ceil(1000);
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Passive,
    Prepared,
    Polling,
    Polled,
    Quit,
}

struct Entry<C, S> {
    id: u64,
    dead: bool,
    callback: Option<C>,
    destroy: Option<DestroyCallback>,
    state: S,
}

struct IoState {
    fd: RawFd,
    events: IoEventFlags,
    /// Slot in the pollfd array as of the last rebuild
    pollfd: Option<usize>,
}

struct TimeState {
    deadline: Option<Instant>,
}

struct DeferState {
    enabled: bool,
}

type IoEntry = Entry<IoCallback, IoState>;
type TimeEntry = Entry<TimeCallback, TimeState>;
type DeferEntry = Entry<DeferCallback, DeferState>;

fn find<'a, C, S>(list: &'a mut [Entry<C, S>], id: u64, kind: &str) -> &'a mut Entry<C, S> {
    match list.iter_mut().find(|e| e.id == id) {
        Some(entry) => entry,
        None => panic!("{} event {} used after it was reclaimed", kind, id),
    }
}

fn split_dead<C, S>(list: &mut Vec<Entry<C, S>>) -> Vec<Entry<C, S>> {
    let (dead, live) = std::mem::take(list).into_iter().partition(|e| e.dead);
    *list = live;
    dead
}

/// Events removed from the loop, destroyed outside the lock
struct Reaped {
    io: Vec<IoEntry>,
    time: Vec<TimeEntry>,
    defer: Vec<DeferEntry>,
}

impl Reaped {
    fn destroy(self, api: &dyn MainloopApi) {
        let destroys = self
            .io
            .into_iter()
            .filter_map(|e| e.destroy)
            .chain(self.time.into_iter().filter_map(|e| e.destroy))
            .chain(self.defer.into_iter().filter_map(|e| e.destroy));

        for destroy in destroys {
            destroy(api);
        }
    }
}

struct Inner {
    io_events: Vec<IoEntry>,
    time_events: Vec<TimeEntry>,
    defer_events: Vec<DeferEntry>,
    next_id: u64,

    n_enabled_defer: usize,
    n_enabled_time: usize,
    io_scan: bool,
    time_scan: bool,
    defer_scan: bool,

    rebuild_pollfds: bool,
    pollfds: Vec<libc::pollfd>,
    prepared_timeout: Option<Duration>,
    poll_ret: usize,

    state: State,
    quit: bool,
    retval: i32,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn reap(&mut self) -> Reaped {
        let io = if self.io_scan {
            self.io_scan = false;
            split_dead(&mut self.io_events)
        } else {
            Vec::new()
        };
        let time = if self.time_scan {
            self.time_scan = false;
            split_dead(&mut self.time_events)
        } else {
            Vec::new()
        };
        let defer = if self.defer_scan {
            self.defer_scan = false;
            split_dead(&mut self.defer_events)
        } else {
            Vec::new()
        };
        Reaped { io, time, defer }
    }

    fn rebuild_pollfds(&mut self, wakeup_fd: RawFd) {
        self.pollfds.clear();
        self.pollfds.push(libc::pollfd {
            fd: wakeup_fd,
            events: libc::POLLIN,
            revents: 0,
        });

        for e in self.io_events.iter_mut() {
            if e.dead {
                e.state.pollfd = None;
                continue;
            }
            e.state.pollfd = Some(self.pollfds.len());
            self.pollfds.push(libc::pollfd {
                fd: e.state.fd,
                events: e.state.events.to_poll(),
                revents: 0,
            });
        }

        self.rebuild_pollfds = false;
    }

    /// Time until the earliest armed timer; `None` if none is armed
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        if self.n_enabled_time == 0 {
            return None;
        }
        self.time_events
            .iter()
            .filter(|e| !e.dead)
            .filter_map(|e| e.state.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

/// Single-threaded event loop over `poll(2)`
///
/// The API may be called from any thread; a blocked `poll()` is woken
/// whenever the event set changes.
pub struct Mainloop {
    inner: Mutex<Inner>,
    wakeup: WakeFd,
    poll_func: Mutex<Option<PollFunc>>,
}

impl Mainloop {
    pub fn new() -> MqResult<Self> {
        let wakeup = WakeFd::new(true)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                io_events: Vec::new(),
                time_events: Vec::new(),
                defer_events: Vec::new(),
                next_id: 0,
                n_enabled_defer: 0,
                n_enabled_time: 0,
                io_scan: false,
                time_scan: false,
                defer_scan: false,
                rebuild_pollfds: true,
                pollfds: Vec::new(),
                prepared_timeout: None,
                poll_ret: 0,
                state: State::Passive,
                quit: false,
                retval: 0,
            }),
            wakeup,
            poll_func: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This loop as a backend-neutral API
    pub fn api(&self) -> &dyn MainloopApi {
        self
    }

    /// Interrupt a blocking `poll()`
    pub fn wakeup(&self) {
        match self.wakeup.write_token() {
            Ok(()) => {}
            // Full pipe: a wakeup is already pending
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::error!("Failed to wake up mainloop: {}", e),
        }
    }

    /// Reclaim freed events, then compute the poll timeout
    ///
    /// `timeout` caps the wait; `None` lets timers alone decide.
    pub fn prepare(&self, timeout: Option<Duration>) -> MqResult<()> {
        let reaped = {
            let mut inner = self.lock();
            assert_eq!(
                inner.state,
                State::Passive,
                "prepare() outside the passive state"
            );
            self.wakeup.drain();
            inner.reap()
        };
        reaped.destroy(self);

        let mut inner = self.lock();
        if inner.quit {
            inner.state = State::Quit;
            return Err(MqError::Quit(inner.retval));
        }

        if inner.n_enabled_defer == 0 {
            if inner.rebuild_pollfds {
                inner.rebuild_pollfds(self.wakeup.fd());
            }

            let next = inner.next_timeout(Instant::now());
            inner.prepared_timeout = match (next, timeout) {
                (Some(next), Some(cap)) => Some(next.min(cap)),
                (next, cap) => next.or(cap),
            };
        }

        inner.state = State::Prepared;
        Ok(())
    }

    /// Wait for IO, a timer, or a wakeup. Returns the ready descriptor count.
    pub fn poll(&self) -> MqResult<usize> {
        let (mut pollfds, timeout) = {
            let mut inner = self.lock();
            assert_eq!(
                inner.state,
                State::Prepared,
                "poll() without a preceding prepare()"
            );

            if inner.quit {
                inner.state = State::Quit;
                return Err(MqError::Quit(inner.retval));
            }

            inner.state = State::Polling;

            if inner.n_enabled_defer > 0 {
                inner.poll_ret = 0;
                inner.state = State::Polled;
                return Ok(0);
            }

            if inner.rebuild_pollfds {
                inner.rebuild_pollfds(self.wakeup.fd());
            }

            (
                std::mem::take(&mut inner.pollfds),
                timeout_ms(inner.prepared_timeout),
            )
        };

        let result = {
            let mut poll_func = self
                .poll_func
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match poll_func.as_mut() {
                Some(poll_func) => poll_func(&mut pollfds, timeout),
                None => sys_poll(&mut pollfds, timeout),
            }
        };

        let mut inner = self.lock();
        inner.pollfds = pollfds;

        match result {
            Ok(n) => {
                inner.poll_ret = n;
                inner.state = State::Polled;
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                inner.poll_ret = 0;
                inner.state = State::Polled;
                Ok(0)
            }
            Err(e) => {
                log::error!("poll(): {}", e);
                inner.poll_ret = 0;
                inner.state = State::Passive;
                Err(e.into())
            }
        }
    }

    /// Run the callbacks for whatever became ready. Returns how many ran.
    pub fn dispatch(&self) -> MqResult<usize> {
        let (defer_pending, time_pending, poll_ret) = {
            let inner = self.lock();
            assert_eq!(
                inner.state,
                State::Polled,
                "dispatch() without a preceding poll()"
            );
            (inner.n_enabled_defer > 0, inner.n_enabled_time > 0, inner.poll_ret)
        };

        let mut dispatched = 0;
        if defer_pending {
            dispatched += self.dispatch_defer();
        } else {
            if time_pending {
                dispatched += self.dispatch_timeout();
            }
            if poll_ret > 0 && !self.lock().quit {
                dispatched += self.dispatch_pollfds(poll_ret);
            }
        }

        let mut inner = self.lock();
        if inner.quit {
            inner.state = State::Quit;
            return Err(MqError::Quit(inner.retval));
        }
        inner.state = State::Passive;
        Ok(dispatched)
    }

    fn dispatch_defer(&self) -> usize {
        let mut dispatched = 0;
        let mut idx = 0;

        loop {
            let (id, mut callback) = {
                let mut inner = self.lock();
                if inner.quit || idx >= inner.defer_events.len() {
                    break;
                }
                let e = &mut inner.defer_events[idx];
                idx += 1;
                if e.dead || !e.state.enabled {
                    continue;
                }
                match e.callback.take() {
                    Some(callback) => (e.id, callback),
                    None => continue,
                }
            };

            callback(self, DeferEvent(id));
            dispatched += 1;

            let mut inner = self.lock();
            if let Some(e) = inner.defer_events.iter_mut().find(|e| e.id == id) {
                e.callback = Some(callback);
            }
        }

        dispatched
    }

    fn dispatch_timeout(&self) -> usize {
        let now = Instant::now();
        let mut dispatched = 0;
        let mut idx = 0;

        loop {
            let (id, deadline, mut callback) = {
                let mut inner = self.lock();
                if inner.quit || idx >= inner.time_events.len() {
                    break;
                }
                let inner = &mut *inner;
                let e = &mut inner.time_events[idx];
                idx += 1;
                let Some(deadline) = e.state.deadline else {
                    continue;
                };
                if e.dead || deadline > now {
                    continue;
                }
                let Some(callback) = e.callback.take() else {
                    continue;
                };

                // Timers are one-shot: disarm before the callback may re-arm
                e.state.deadline = None;
                inner.n_enabled_time -= 1;
                (e.id, deadline, callback)
            };

            callback(self, TimeEvent(id), deadline);
            dispatched += 1;

            let mut inner = self.lock();
            if let Some(e) = inner.time_events.iter_mut().find(|e| e.id == id) {
                e.callback = Some(callback);
            }
        }

        dispatched
    }

    fn dispatch_pollfds(&self, poll_ret: usize) -> usize {
        let mut remaining = poll_ret;
        let mut dispatched = 0;
        let mut idx = 0;

        loop {
            let (id, fd, flags, mut callback) = {
                let mut inner = self.lock();
                if remaining == 0 || inner.quit || idx >= inner.io_events.len() {
                    break;
                }
                let inner = &mut *inner;
                let e = &mut inner.io_events[idx];
                idx += 1;
                if e.dead {
                    continue;
                }
                let Some(slot) = e.state.pollfd else {
                    continue;
                };
                let Some(pollfd) = inner.pollfds.get_mut(slot) else {
                    continue;
                };
                if pollfd.revents == 0 {
                    continue;
                }
                let flags = IoEventFlags::from_poll(pollfd.revents);
                pollfd.revents = 0;

                let Some(callback) = e.callback.take() else {
                    continue;
                };
                (e.id, e.state.fd, flags, callback)
            };

            callback(self, IoEvent(id), fd, flags);
            dispatched += 1;
            remaining -= 1;

            let mut inner = self.lock();
            if let Some(e) = inner.io_events.iter_mut().find(|e| e.id == id) {
                e.callback = Some(callback);
            }
        }

        dispatched
    }

    /// One full prepare/poll/dispatch cycle
    pub fn iterate(&self, block: bool) -> MqResult<usize> {
        let timeout = if block { None } else { Some(Duration::ZERO) };
        self.prepare(timeout)?;
        self.poll()?;
        self.dispatch()
    }

    /// Iterate until `quit()`; returns the value passed to it
    pub fn run(&self) -> MqResult<i32> {
        loop {
            match self.iterate(true) {
                Ok(_) => {}
                Err(MqError::Quit(retval)) => return Ok(retval),
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop the loop at the next step boundary
    pub fn quit(&self, retval: i32) {
        {
            let mut inner = self.lock();
            inner.quit = true;
            inner.retval = retval;
        }
        self.wakeup();
    }

    /// Value passed to `quit()`
    pub fn retval(&self) -> i32 {
        self.lock().retval
    }

    /// Replace `poll(2)`, e.g. to release a lock around the wait
    pub fn set_poll_func(&self, poll_func: Option<PollFunc>) {
        *self
            .poll_func
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = poll_func;
    }
}

impl MainloopApi for Mainloop {
    fn io_new(&self, fd: RawFd, events: IoEventFlags, callback: IoCallback) -> IoEvent {
        assert!(fd >= 0, "io_new() with invalid fd {}", fd);
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id();
            inner.io_events.push(Entry {
                id,
                dead: false,
                callback: Some(callback),
                destroy: None,
                state: IoState {
                    fd,
                    events,
                    pollfd: None,
                },
            });
            inner.rebuild_pollfds = true;
            id
        };
        self.wakeup();
        IoEvent(id)
    }

    fn io_enable(&self, event: IoEvent, events: IoEventFlags) {
        {
            let mut inner = self.lock();
            let e = find(&mut inner.io_events, event.0, "io");
            assert!(!e.dead, "io_enable() on a freed event");
            if e.state.events == events {
                return;
            }
            e.state.events = events;
            inner.rebuild_pollfds = true;
        }
        self.wakeup();
    }

    fn io_free(&self, event: IoEvent) {
        {
            let mut inner = self.lock();
            let e = find(&mut inner.io_events, event.0, "io");
            assert!(!e.dead, "io_free() on a freed event");
            e.dead = true;
            inner.io_scan = true;
            inner.rebuild_pollfds = true;
        }
        self.wakeup();
    }

    fn io_set_destroy(&self, event: IoEvent, callback: Option<DestroyCallback>) {
        let mut inner = self.lock();
        find(&mut inner.io_events, event.0, "io").destroy = callback;
    }

    fn time_new(&self, deadline: Option<Instant>, callback: TimeCallback) -> TimeEvent {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id();
            inner.time_events.push(Entry {
                id,
                dead: false,
                callback: Some(callback),
                destroy: None,
                state: TimeState { deadline },
            });
            if deadline.is_some() {
                inner.n_enabled_time += 1;
            }
            id
        };
        if deadline.is_some() {
            self.wakeup();
        }
        TimeEvent(id)
    }

    fn time_restart(&self, event: TimeEvent, deadline: Option<Instant>) {
        {
            let mut inner = self.lock();
            let e = find(&mut inner.time_events, event.0, "time");
            assert!(!e.dead, "time_restart() on a freed event");
            let was_enabled = e.state.deadline.is_some();
            e.state.deadline = deadline;

            match (was_enabled, deadline.is_some()) {
                (true, false) => inner.n_enabled_time -= 1,
                (false, true) => inner.n_enabled_time += 1,
                _ => {}
            }
        }
        if deadline.is_some() {
            self.wakeup();
        }
    }

    fn time_free(&self, event: TimeEvent) {
        let mut inner = self.lock();
        let e = find(&mut inner.time_events, event.0, "time");
        assert!(!e.dead, "time_free() on a freed event");
        e.dead = true;
        let was_enabled = e.state.deadline.take().is_some();
        inner.time_scan = true;
        if was_enabled {
            inner.n_enabled_time -= 1;
        }
    }

    fn time_set_destroy(&self, event: TimeEvent, callback: Option<DestroyCallback>) {
        let mut inner = self.lock();
        let e = find(&mut inner.time_events, event.0, "time");
        assert!(!e.dead, "time_set_destroy() on a freed event");
        e.destroy = callback;
    }

    fn defer_new(&self, callback: DeferCallback) -> DeferEvent {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id();
            inner.defer_events.push(Entry {
                id,
                dead: false,
                callback: Some(callback),
                destroy: None,
                state: DeferState { enabled: true },
            });
            inner.n_enabled_defer += 1;
            id
        };
        self.wakeup();
        DeferEvent(id)
    }

    fn defer_enable(&self, event: DeferEvent, enabled: bool) {
        let wake = {
            let mut inner = self.lock();
            let e = find(&mut inner.defer_events, event.0, "defer");
            assert!(!e.dead, "defer_enable() on a freed event");
            let was_enabled = e.state.enabled;
            e.state.enabled = enabled;

            match (was_enabled, enabled) {
                (true, false) => {
                    inner.n_enabled_defer -= 1;
                    false
                }
                (false, true) => {
                    inner.n_enabled_defer += 1;
                    true
                }
                _ => false,
            }
        };
        if wake {
            self.wakeup();
        }
    }

    fn defer_free(&self, event: DeferEvent) {
        let mut inner = self.lock();
        let e = find(&mut inner.defer_events, event.0, "defer");
        assert!(!e.dead, "defer_free() on a freed event");
        e.dead = true;
        let was_enabled = std::mem::replace(&mut e.state.enabled, false);
        inner.defer_scan = true;
        if was_enabled {
            inner.n_enabled_defer -= 1;
        }
    }

    fn defer_set_destroy(&self, event: DeferEvent, callback: Option<DestroyCallback>) {
        let mut inner = self.lock();
        let e = find(&mut inner.defer_events, event.0, "defer");
        assert!(!e.dead, "defer_set_destroy() on a freed event");
        e.destroy = callback;
    }

    fn quit(&self, retval: i32) {
        Mainloop::quit(self, retval);
    }
}

impl Drop for Mainloop {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        let reaped = Reaped {
            io: std::mem::take(&mut inner.io_events),
            time: std::mem::take(&mut inner.time_events),
            defer: std::mem::take(&mut inner.defer_events),
        };
        inner.n_enabled_defer = 0;
        inner.n_enabled_time = 0;
        reaped.destroy(&*self);
    }
}

impl std::fmt::Debug for Mainloop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Mainloop")
            .field("state", &inner.state)
            .field("io_events", &inner.io_events.len())
            .field("time_events", &inner.time_events.len())
            .field("defer_events", &inner.defer_events.len())
            .field("quit", &inner.quit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn test_timeout_rounds_up_to_millis() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1500))), 2);
    }

    #[test]
    fn test_defer_runs_without_blocking() {
        let ml = Mainloop::new().unwrap();
        let runs = counter();

        let event = {
            let runs = runs.clone();
            ml.defer_new(Box::new(move |_: &dyn MainloopApi, _: DeferEvent| {
                runs.fetch_add(1, Ordering::SeqCst);
            }))
        };

        assert_eq!(ml.iterate(true).unwrap(), 1);
        assert_eq!(ml.iterate(true).unwrap(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        ml.defer_enable(event, false);
        assert_eq!(ml.iterate(false).unwrap(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_timer_fires_once_at_deadline() {
        let ml = Mainloop::new().unwrap();
        let fired = counter();
        let start = Instant::now();
        let deadline = start + Duration::from_millis(30);

        {
            let fired = fired.clone();
            ml.time_new(
                Some(deadline),
                Box::new(move |_: &dyn MainloopApi, _: TimeEvent, at: Instant| {
                    assert_eq!(at, deadline);
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        while fired.load(Ordering::SeqCst) == 0 {
            ml.iterate(true).unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(30));

        assert_eq!(ml.iterate(false).unwrap(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_restart_from_callback() {
        let ml = Mainloop::new().unwrap();
        let fired = counter();

        {
            let fired = fired.clone();
            ml.time_new(
                Some(Instant::now()),
                Box::new(move |api: &dyn MainloopApi, e: TimeEvent, _: Instant| {
                    if fired.fetch_add(1, Ordering::SeqCst) < 2 {
                        api.time_restart(e, Some(Instant::now() + Duration::from_millis(1)));
                    } else {
                        api.quit(3);
                    }
                }),
            );
        }

        assert_eq!(ml.run().unwrap(), 3);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_io_event_reports_input() {
        let ml = Mainloop::new().unwrap();
        let pipe = WakeFd::pipe(true).unwrap();
        let seen = Arc::new(Mutex::new(None));

        {
            let seen = seen.clone();
            ml.io_new(
                pipe.fd(),
                IoEventFlags::INPUT,
                Box::new(move |api: &dyn MainloopApi, _: IoEvent, fd: RawFd, flags: IoEventFlags| {
                    *seen.lock().unwrap() = Some((fd, flags));
                    api.quit(0);
                }),
            );
        }

        pipe.write_token().unwrap();
        assert_eq!(ml.run().unwrap(), 0);
        assert_eq!(*seen.lock().unwrap(), Some((pipe.fd(), IoEventFlags::INPUT)));
    }

    #[test]
    fn test_free_reclaims_at_next_prepare() {
        let ml = Mainloop::new().unwrap();
        let destroyed = Arc::new(AtomicBool::new(false));

        let event = ml.defer_new(Box::new(|api: &dyn MainloopApi, e: DeferEvent| {
            api.defer_free(e);
        }));
        {
            let destroyed = destroyed.clone();
            ml.defer_set_destroy(
                event,
                Some(Box::new(move |_: &dyn MainloopApi| {
                    destroyed.store(true, Ordering::SeqCst);
                })),
            );
        }

        ml.iterate(false).unwrap();
        assert!(!destroyed.load(Ordering::SeqCst));

        ml.iterate(false).unwrap();
        assert!(destroyed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_quit_from_other_thread_wakes_poll() {
        let ml = Arc::new(Mainloop::new().unwrap());

        let quitter = {
            let ml = ml.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                ml.quit(7);
            })
        };

        assert_eq!(ml.run().unwrap(), 7);
        assert_eq!(ml.retval(), 7);
        quitter.join().unwrap();
    }

    #[test]
    fn test_once_runs_exactly_once() {
        let ml = Mainloop::new().unwrap();
        let runs = counter();

        {
            let runs = runs.clone();
            crate::mainloop::api::once(ml.api(), move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }

        for _ in 0..3 {
            ml.iterate(false).unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_runs_destroy_callbacks() {
        let destroyed = counter();
        {
            let ml = Mainloop::new().unwrap();
            let event = ml.time_new(
                None,
                Box::new(|_: &dyn MainloopApi, _: TimeEvent, _: Instant| {}),
            );
            let destroyed = destroyed.clone();
            ml.time_set_destroy(
                event,
                Some(Box::new(move |_: &dyn MainloopApi| {
                    destroyed.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_custom_poll_func() {
        let ml = Mainloop::new().unwrap();
        let calls = counter();

        {
            let calls = calls.clone();
            ml.set_poll_func(Some(Box::new(move |fds: &mut [libc::pollfd], timeout: i32| {
                calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(timeout, 0);
                sys_poll(fds, timeout)
            })));
        }

        ml.iterate(false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "without a preceding poll")]
    fn test_dispatch_out_of_order_panics() {
        let ml = Mainloop::new().unwrap();
        ml.prepare(None).unwrap();
        let _ = ml.dispatch();
    }
}
