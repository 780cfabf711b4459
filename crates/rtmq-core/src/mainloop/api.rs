//! Backend-neutral mainloop interface
//!
//! Code that needs IO readiness, timers or deferred work talks to a
//! `&dyn MainloopApi` and never to a concrete loop, so the same objects run
//! on the plain poll loop or on the threaded one.
//!
//! Events are referred to by small copyable handles. The loop owns the
//! event itself; `*_free()` marks it dead and the loop reclaims it, running
//! its destroy callback, at the next iteration boundary.

use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::time::Instant;

/// IO conditions an event waits for or reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IoEventFlags(u8);

impl IoEventFlags {
    pub const NULL: Self = Self(0);
    pub const INPUT: Self = Self(1);
    pub const OUTPUT: Self = Self(2);
    pub const HANGUP: Self = Self(4);
    pub const ERROR: Self = Self(8);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `poll(2)` event mask
    pub fn to_poll(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(Self::INPUT) {
            events |= libc::POLLIN;
        }
        if self.contains(Self::OUTPUT) {
            events |= libc::POLLOUT;
        }
        if self.contains(Self::HANGUP) {
            events |= libc::POLLHUP;
        }
        if self.contains(Self::ERROR) {
            events |= libc::POLLERR;
        }
        events
    }

    /// Flags from `poll(2)` revents
    pub fn from_poll(revents: libc::c_short) -> Self {
        let mut flags = Self::NULL;
        if revents & libc::POLLIN != 0 {
            flags |= Self::INPUT;
        }
        if revents & libc::POLLOUT != 0 {
            flags |= Self::OUTPUT;
        }
        if revents & libc::POLLHUP != 0 {
            flags |= Self::HANGUP;
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            flags |= Self::ERROR;
        }
        flags
    }
}

impl BitOr for IoEventFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for IoEventFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Handle to an IO event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoEvent(pub(crate) u64);

/// Handle to a timer event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeEvent(pub(crate) u64);

/// Handle to a deferred event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeferEvent(pub(crate) u64);

pub type IoCallback = Box<dyn FnMut(&dyn MainloopApi, IoEvent, RawFd, IoEventFlags) + Send>;
/// Receives the deadline the timer was armed for
pub type TimeCallback = Box<dyn FnMut(&dyn MainloopApi, TimeEvent, Instant) + Send>;
pub type DeferCallback = Box<dyn FnMut(&dyn MainloopApi, DeferEvent) + Send>;
/// Runs once when a freed event is reclaimed
pub type DestroyCallback = Box<dyn FnOnce(&dyn MainloopApi) + Send>;

/// Operations every mainloop backend provides
///
/// Using a handle after it has been freed is a contract violation and
/// panics.
pub trait MainloopApi: Send + Sync {
    /// Watch `fd` for `events`
    fn io_new(&self, fd: RawFd, events: IoEventFlags, callback: IoCallback) -> IoEvent;
    /// Change the watched conditions
    fn io_enable(&self, event: IoEvent, events: IoEventFlags);
    fn io_free(&self, event: IoEvent);
    fn io_set_destroy(&self, event: IoEvent, callback: Option<DestroyCallback>);

    /// Timer firing once at `deadline`; `None` creates it disarmed
    fn time_new(&self, deadline: Option<Instant>, callback: TimeCallback) -> TimeEvent;
    /// Re-arm, or disarm with `None`
    fn time_restart(&self, event: TimeEvent, deadline: Option<Instant>);
    fn time_free(&self, event: TimeEvent);
    fn time_set_destroy(&self, event: TimeEvent, callback: Option<DestroyCallback>);

    /// Callback run on every iteration while enabled; created enabled
    fn defer_new(&self, callback: DeferCallback) -> DeferEvent;
    fn defer_enable(&self, event: DeferEvent, enabled: bool);
    fn defer_free(&self, event: DeferEvent);
    fn defer_set_destroy(&self, event: DeferEvent, callback: Option<DestroyCallback>);

    /// Ask the loop to stop with `retval`
    fn quit(&self, retval: i32);
}

/// Run `callback` once on the loop's next iteration
pub fn once<F>(api: &dyn MainloopApi, callback: F)
where
    F: FnOnce(&dyn MainloopApi) + Send + 'static,
{
    let mut callback = Some(callback);
    api.defer_new(Box::new(move |api: &dyn MainloopApi, event: DeferEvent| {
        if let Some(callback) = callback.take() {
            callback(api);
        }
        api.defer_free(event);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_poll_mapping() {
        let flags = IoEventFlags::INPUT | IoEventFlags::OUTPUT;
        let events = flags.to_poll();
        assert_eq!(events, libc::POLLIN | libc::POLLOUT);
        assert_eq!(IoEventFlags::from_poll(events), flags);
    }

    #[test]
    fn test_nval_reported_as_error() {
        let flags = IoEventFlags::from_poll(libc::POLLNVAL);
        assert!(flags.contains(IoEventFlags::ERROR));
        assert!(!flags.contains(IoEventFlags::INPUT));
    }

    #[test]
    fn test_null_contained_everywhere() {
        assert!(IoEventFlags::INPUT.contains(IoEventFlags::NULL));
        assert!(IoEventFlags::NULL.is_empty());
    }
}
