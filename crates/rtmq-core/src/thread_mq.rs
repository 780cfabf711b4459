//! Message queue pair between a control loop and an IO thread's loop
//!
//! `inq` carries messages from the main loop to the IO thread, `outq` the
//! other way. Each queue's read side is hooked into the consuming loop as
//! an IO event, and its write side into the producing loop so that messages
//! parked on a full ring get flushed as soon as the reader frees a slot.
//!
//! An object-less [`MESSAGE_SHUTDOWN`] makes the receiving loop quit with 0.

use std::cell::RefCell;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::config::QueueConfig;
use crate::error::MqResult;
use crate::mainloop::{IoCallback, IoEvent, IoEventFlags, MainloopApi};
use crate::msg::{self, MsgReceiver, MsgSender, MESSAGE_SHUTDOWN};

thread_local! {
    static CURRENT: RefCell<Option<ThreadMqHandle>> = const { RefCell::new(None) };
}

type SharedReceiver = Arc<Mutex<MsgReceiver>>;

fn lock_receiver(rx: &SharedReceiver) -> MutexGuard<'_, MsgReceiver> {
    rx.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drain a queue from its loop; re-register before returning
fn read_callback(rx: SharedReceiver) -> IoCallback {
    Box::new(
        move |api: &dyn MainloopApi, _: IoEvent, _: i32, events: IoEventFlags| {
            if !events.contains(IoEventFlags::INPUT) {
                log::warn!("Unexpected events {:?} on message queue fd", events);
            }

            let mut rx = lock_receiver(&rx);
            rx.read_after_poll();

            loop {
                while let Some(envelope) = rx.get(false) {
                    if envelope.object().is_none() && envelope.code() == MESSAGE_SHUTDOWN {
                        rx.done(0);
                        api.quit(0);
                        break;
                    }

                    let ret = envelope.dispatch();
                    rx.done(ret);
                }

                // Only leave once registered, so the next after_poll balances
                if !rx.read_before_poll() {
                    break;
                }
            }
        },
    )
}

/// Flush the writer's overflow list once the reader has made room
fn write_callback(tx: MsgSender) -> IoCallback {
    Box::new(
        move |_: &dyn MainloopApi, _: IoEvent, _: i32, _: IoEventFlags| {
            tx.write_after_poll();
            tx.write_before_poll();
        },
    )
}

struct Events {
    read_main: IoEvent,
    write_main: IoEvent,
    read_thread: IoEvent,
    write_thread: IoEvent,
}

/// The queue pair plus its registrations in both loops
///
/// Owned by the main side. The IO thread gets a [`ThreadMqHandle`].
pub struct ThreadMq {
    main_api: Arc<dyn MainloopApi>,
    thread_api: Arc<dyn MainloopApi>,
    inq: MsgSender,
    outq: MsgSender,
    outq_rx: SharedReceiver,
    events: Option<Events>,
}

impl ThreadMq {
    /// Create both queues and register their descriptors with the two loops
    pub fn new(
        main_api: Arc<dyn MainloopApi>,
        thread_api: Arc<dyn MainloopApi>,
        config: &QueueConfig,
    ) -> MqResult<Self> {
        let (inq, inq_rx) = msg::channel(config)?;
        let (outq, outq_rx) = msg::channel(config)?;
        let inq_rx = Arc::new(Mutex::new(inq_rx));
        let outq_rx = Arc::new(Mutex::new(outq_rx));

        let (read_main, write_thread) = {
            let mut rx = lock_receiver(&outq_rx);
            let ready = rx.read_before_poll();
            assert!(!ready, "fresh outq already has messages");
            outq.write_before_poll();

            let read_main =
                main_api.io_new(rx.read_fd(), IoEventFlags::INPUT, read_callback(outq_rx.clone()));
            let write_thread = thread_api.io_new(
                outq.write_fd(),
                IoEventFlags::INPUT,
                write_callback(outq.clone()),
            );
            (read_main, write_thread)
        };

        let (read_thread, write_main) = {
            let mut rx = lock_receiver(&inq_rx);
            let ready = rx.read_before_poll();
            assert!(!ready, "fresh inq already has messages");
            inq.write_before_poll();

            let read_thread =
                thread_api.io_new(rx.read_fd(), IoEventFlags::INPUT, read_callback(inq_rx.clone()));
            let write_main = main_api.io_new(
                inq.write_fd(),
                IoEventFlags::INPUT,
                write_callback(inq.clone()),
            );
            (read_thread, write_main)
        };

        log::debug!("Thread message queues registered");

        Ok(Self {
            main_api,
            thread_api,
            inq,
            outq,
            outq_rx,
            events: Some(Events {
                read_main,
                write_main,
                read_thread,
                write_thread,
            }),
        })
    }

    /// Main → IO thread
    pub fn inq(&self) -> &MsgSender {
        &self.inq
    }

    /// IO thread → main
    pub fn outq(&self) -> &MsgSender {
        &self.outq
    }

    /// Handle to install on the IO thread
    pub fn handle(&self) -> ThreadMqHandle {
        ThreadMqHandle {
            inq: self.inq.clone(),
            outq: self.outq.clone(),
        }
    }

    /// Handle installed on the calling thread, if any
    pub fn current() -> Option<ThreadMqHandle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Dispatch what is left in `outq` and unregister from both loops
    ///
    /// Call from the main side once the IO thread has stopped. If `outq` is
    /// being dispatched right now (`done()` reached from a message handler)
    /// the flush is skipped.
    pub fn done(&mut self) {
        let rx = match self.outq_rx.try_lock() {
            Ok(rx) => Some(rx),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        if let Some(mut rx) = rx {
            if !rx.dispatching() {
                rx.flush(true);
            }
        }

        if let Some(events) = self.events.take() {
            self.main_api.io_free(events.read_main);
            self.main_api.io_free(events.write_main);
            self.thread_api.io_free(events.read_thread);
            self.thread_api.io_free(events.write_thread);
            log::debug!("Thread message queues unregistered");
        }
    }
}

impl Drop for ThreadMq {
    fn drop(&mut self) {
        self.done();
    }
}

impl std::fmt::Debug for ThreadMq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadMq")
            .field("registered", &self.events.is_some())
            .finish()
    }
}

/// The queues as seen from the IO thread
#[derive(Clone, Debug)]
pub struct ThreadMqHandle {
    /// Main → IO thread
    pub inq: MsgSender,
    /// IO thread → main
    pub outq: MsgSender,
}

impl ThreadMqHandle {
    /// Make this handle [`ThreadMq::current`] for the calling thread
    ///
    /// Panics if one is already installed.
    pub fn install(self) {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            assert!(current.is_none(), "a thread_mq is already installed on this thread");
            *current = Some(self);
        });
    }

    /// Remove the calling thread's handle
    pub fn uninstall() -> Option<ThreadMqHandle> {
        CURRENT.with(|current| current.borrow_mut().take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::Mainloop;
    use crate::msg::{MemChunk, Message, MsgObject, Payload};
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::thread;

    const PING: i32 = 1;
    const PONG: i32 = 2;

    #[derive(Default)]
    struct MainSide {
        pongs: AtomicI32,
    }

    impl MsgObject for MainSide {
        fn process_msg(&self, code: i32, _: Option<&mut Payload>, _: i64, _: Option<&MemChunk>) -> i32 {
            if code == PONG {
                self.pongs.fetch_add(1, Ordering::SeqCst);
            }
            0
        }
    }

    struct IoSide {
        main: Arc<MainSide>,
    }

    impl MsgObject for IoSide {
        fn process_msg(&self, code: i32, userdata: Option<&mut Payload>, _: i64, _: Option<&MemChunk>) -> i32 {
            if code != PING {
                return -1;
            }
            let tmq = ThreadMq::current().expect("thread_mq installed on the IO thread");
            tmq.outq.post(Message::new(PONG).to(self.main.clone())).unwrap();

            userdata
                .and_then(|d| d.downcast_mut::<i32>())
                .map(|v| *v * 2)
                .unwrap_or(0)
        }
    }

    fn loops() -> (Arc<Mainloop>, Arc<Mainloop>) {
        (
            Arc::new(Mainloop::new().unwrap()),
            Arc::new(Mainloop::new().unwrap()),
        )
    }

    #[test]
    fn test_round_trip_and_shutdown() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (main_ml, io_ml) = loops();
        let mut tmq = ThreadMq::new(main_ml.clone(), io_ml.clone(), &QueueConfig::with_capacity(4)).unwrap();

        let handle = tmq.handle();
        let io_thread = thread::spawn(move || {
            handle.clone().install();
            let retval = io_ml.run().unwrap();
            handle.outq.post(Message::shutdown()).unwrap();
            // Our loop no longer flushes parked messages; push them through
            assert!(handle.outq.flush_local(true));
            ThreadMqHandle::uninstall();
            retval
        });

        let main_side = Arc::new(MainSide::default());
        let io_side: Arc<dyn MsgObject> = Arc::new(IoSide {
            main: main_side.clone(),
        });

        let reply = tmq.inq().send(Message::new(PING).to(io_side.clone()).with_data(21i32)).unwrap();
        assert_eq!(reply.ret, 42);

        for _ in 0..5 {
            tmq.inq().post(Message::new(PING).to(io_side.clone())).unwrap();
        }
        tmq.inq().post(Message::shutdown()).unwrap();

        assert_eq!(main_ml.run().unwrap(), 0);
        assert_eq!(io_thread.join().unwrap(), 0);
        assert_eq!(main_side.pongs.load(Ordering::SeqCst), 6);

        tmq.done();
    }

    #[test]
    fn test_parked_messages_flushed_by_write_event() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (main_ml, io_ml) = loops();
        let mut tmq = ThreadMq::new(main_ml.clone(), io_ml.clone(), &QueueConfig::with_capacity(1)).unwrap();

        let main_side = Arc::new(MainSide::default());
        let io_side: Arc<dyn MsgObject> = Arc::new(IoSide {
            main: main_side.clone(),
        });

        // Everything but the first message is parked before the IO loop runs
        for _ in 0..3 {
            tmq.inq().post(Message::new(PING).to(io_side.clone())).unwrap();
        }
        tmq.inq().post(Message::shutdown()).unwrap();
        assert_eq!(tmq.inq().pending_local(), 3);

        let handle = tmq.handle();
        let io_thread = thread::spawn(move || {
            handle.clone().install();
            let retval = io_ml.run().unwrap();
            handle.outq.post(Message::shutdown()).unwrap();
            assert!(handle.outq.flush_local(true));
            ThreadMqHandle::uninstall();
            retval
        });

        assert_eq!(main_ml.run().unwrap(), 0);
        assert_eq!(io_thread.join().unwrap(), 0);
        assert_eq!(tmq.inq().pending_local(), 0);
        assert_eq!(main_side.pongs.load(Ordering::SeqCst), 3);

        tmq.done();
    }

    #[test]
    fn test_messages_behind_shutdown_still_dispatched() {
        let (main_ml, io_ml) = loops();
        let tmq = ThreadMq::new(main_ml, io_ml.clone(), &QueueConfig::default()).unwrap();
        let main_side = Arc::new(MainSide::default());

        tmq.inq().post(Message::new(PONG).to(main_side.clone())).unwrap();
        tmq.inq().post(Message::shutdown()).unwrap();
        tmq.inq().post(Message::new(PONG).to(main_side.clone())).unwrap();

        assert_eq!(io_ml.run().unwrap(), 0);
        assert_eq!(main_side.pongs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_done_flushes_outq() {
        let (main_ml, io_ml) = loops();
        let mut tmq = ThreadMq::new(main_ml, io_ml, &QueueConfig::default()).unwrap();
        let main_side = Arc::new(MainSide::default());

        tmq.outq().post(Message::new(PONG).to(main_side.clone())).unwrap();
        tmq.outq().post(Message::new(PONG).to(main_side.clone())).unwrap();
        assert_eq!(main_side.pongs.load(Ordering::SeqCst), 0);

        tmq.done();
        assert_eq!(main_side.pongs.load(Ordering::SeqCst), 2);

        // Second call is a no-op
        tmq.done();
    }

    #[test]
    fn test_current_is_thread_local() {
        let (main_ml, io_ml) = loops();
        let tmq = ThreadMq::new(main_ml, io_ml, &QueueConfig::default()).unwrap();

        let handle = tmq.handle();
        thread::spawn(move || {
            assert!(ThreadMq::current().is_none());
            handle.install();
            assert!(ThreadMq::current().is_some());
            assert!(ThreadMqHandle::uninstall().is_some());
            assert!(ThreadMq::current().is_none());
        })
        .join()
        .unwrap();

        assert!(ThreadMq::current().is_none());
    }

    #[test]
    #[should_panic(expected = "already installed")]
    fn test_double_install_panics() {
        let (main_ml, io_ml) = loops();
        let tmq = ThreadMq::new(main_ml, io_ml, &QueueConfig::default()).unwrap();
        tmq.handle().install();
        tmq.handle().install();
    }
}
