//! Typed message queue with asynchronous and synchronous delivery
//!
//! Many writers, one reader. Writers share a [`MsgSender`] (cheap to clone)
//! and are serialised by a mutex that only the writing side ever takes; the
//! reader owns the [`MsgReceiver`] and never blocks on a lock.
//!
//! - [`MsgSender::post`] enqueues and returns immediately. When the receiver
//!   is done with the message its free callback runs on the receiver thread.
//! - [`MsgSender::send`] enqueues and blocks until the receiver calls
//!   [`MsgReceiver::done`], returning the result code and the payload.
//!
//! Envelopes and reply channels are recycled through per-queue pools so a
//! steady stream of messages does not touch the allocator.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use super::memblock::MemChunk;
use super::object::{FreeCb, MsgObject, MsgObjectRef, Payload};
use crate::config::QueueConfig;
use crate::error::{MqError, MqResult};
use crate::queue::{asyncq, Consumer, Pool, Producer};

/// Reserved code: with no target object, asks the receiving loop to quit
pub const MESSAGE_SHUTDOWN: i32 = -1;

/// How often a blocked `send()` re-checks whether the receiver went away
const DISCONNECT_CHECK: Duration = Duration::from_millis(100);

/// A message under construction
pub struct Message {
    code: i32,
    object: Option<MsgObjectRef>,
    userdata: Option<Payload>,
    free_cb: Option<FreeCb>,
    offset: i64,
    chunk: Option<MemChunk>,
}

impl Message {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            object: None,
            userdata: None,
            free_cb: None,
            offset: 0,
            chunk: None,
        }
    }

    /// Object-less [`MESSAGE_SHUTDOWN`]
    pub fn shutdown() -> Self {
        Self::new(MESSAGE_SHUTDOWN)
    }

    /// Target object; without one the message dispatches to nothing
    pub fn to(mut self, object: MsgObjectRef) -> Self {
        self.object = Some(object);
        self
    }

    pub fn with_data<T: Any + Send>(self, data: T) -> Self {
        self.with_payload(Box::new(data))
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.userdata = Some(payload);
        self
    }

    /// Called with the payload when a posted message is released.
    /// Ignored by `send()`, which hands the payload back instead.
    pub fn free_cb(mut self, free_cb: FreeCb) -> Self {
        self.free_cb = Some(free_cb);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn chunk(mut self, chunk: MemChunk) -> Self {
        self.chunk = Some(chunk);
        self
    }
}

/// Completion handed back to a synchronous sender. The reply channel's
/// sending half travels with it so the slot can be pooled again.
struct Completion {
    ret: i32,
    userdata: Option<Payload>,
    tx: Sender<Completion>,
}

/// Pooled reply channel. `tx` is `None` while lent to an in-flight envelope.
struct ReplySlot {
    tx: Option<Sender<Completion>>,
    rx: Receiver<Completion>,
}

/// Result of a synchronous [`MsgSender::send`]
pub struct Reply {
    /// Value passed to [`MsgReceiver::done`]
    pub ret: i32,
    /// Payload as left by the receiver
    pub userdata: Option<Payload>,
}

impl Reply {
    /// Take the payload back as `T`, if it is one
    pub fn take_data<T: 'static>(&mut self) -> Option<T> {
        let data = self.userdata.take()?;
        match data.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(data) => {
                self.userdata = Some(data);
                None
            }
        }
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply")
            .field("ret", &self.ret)
            .field("has_userdata", &self.userdata.is_some())
            .finish()
    }
}

/// A queued message as seen by the receiver
pub struct Envelope {
    code: i32,
    object: Option<MsgObjectRef>,
    userdata: Option<Payload>,
    free_cb: Option<FreeCb>,
    offset: i64,
    chunk: Option<MemChunk>,
    reply: Option<Sender<Completion>>,
}

impl Envelope {
    fn fill(&mut self, msg: Message, reply: Option<Sender<Completion>>) {
        self.code = msg.code;
        self.object = msg.object;
        self.userdata = msg.userdata;
        self.free_cb = if reply.is_some() { None } else { msg.free_cb };
        self.offset = msg.offset;
        self.chunk = msg.chunk;
        self.reply = reply;
    }

    fn from_message(msg: Message, reply: Option<Sender<Completion>>) -> Box<Self> {
        let mut envelope = Box::new(Self {
            code: 0,
            object: None,
            userdata: None,
            free_cb: None,
            offset: 0,
            chunk: None,
            reply: None,
        });
        envelope.fill(msg, reply);
        envelope
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn object(&self) -> Option<&MsgObjectRef> {
        self.object.as_ref()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn chunk(&self) -> Option<&MemChunk> {
        self.chunk.as_ref()
    }

    pub fn userdata_mut(&mut self) -> Option<&mut Payload> {
        self.userdata.as_mut()
    }

    /// Payload downcast to `T`
    pub fn data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.userdata.as_mut()?.downcast_mut::<T>()
    }

    /// Whether a sender is blocked waiting for this message
    pub fn is_sync(&self) -> bool {
        self.reply.is_some()
    }

    /// Deliver to the target object; 0 when there is none
    pub fn dispatch(&mut self) -> i32 {
        dispatch(
            self.object.as_deref(),
            self.code,
            self.userdata.as_mut(),
            self.offset,
            self.chunk.as_ref(),
        )
    }

    /// Run the free callback and drop every reference held
    fn release(&mut self) {
        if let Some(data) = self.userdata.take() {
            match self.free_cb {
                Some(free_cb) => free_cb(data),
                None => drop(data),
            }
        }
        self.free_cb = None;
        self.object = None;
        self.chunk = None;
        self.reply = None;
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        self.release();
    }
}

/// Call `object.process_msg(...)`; 0 when there is no object
pub fn dispatch(
    object: Option<&dyn MsgObject>,
    code: i32,
    userdata: Option<&mut Payload>,
    offset: i64,
    chunk: Option<&MemChunk>,
) -> i32 {
    match object {
        Some(object) => object.process_msg(code, userdata, offset, chunk),
        None => 0,
    }
}

struct SenderInner {
    producer: Mutex<Producer<Envelope>>,
    items: Arc<Pool<Envelope>>,
    replies: Pool<ReplySlot>,
    closed: Arc<AtomicBool>,
}

/// Writing side of a message queue; clone freely across threads
#[derive(Clone)]
pub struct MsgSender {
    inner: Arc<SenderInner>,
}

impl MsgSender {
    fn producer(&self) -> MutexGuard<'_, Producer<Envelope>> {
        self.inner
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn envelope(&self, msg: Message, reply: Option<Sender<Completion>>) -> Box<Envelope> {
        match self.inner.items.take() {
            Some(mut envelope) => {
                envelope.fill(msg, reply);
                envelope
            }
            None => Envelope::from_message(msg, reply),
        }
    }

    fn reply_slot(&self) -> (Box<ReplySlot>, Sender<Completion>) {
        if let Some(mut slot) = self.inner.replies.take() {
            if let Some(tx) = slot.tx.take() {
                return (slot, tx);
            }
        }
        let (tx, rx) = crossbeam::channel::bounded(1);
        (Box::new(ReplySlot { tx: None, rx }), tx)
    }

    /// Enqueue without waiting
    ///
    /// Fails with [`MqError::QueueOverrun`] only if the ring and the
    /// overflow list are full under [`OverflowPolicy::Reject`]; the message
    /// is released (free callback included) in that case.
    ///
    /// [`OverflowPolicy::Reject`]: crate::config::OverflowPolicy::Reject
    pub fn post(&self, msg: Message) -> MqResult<()> {
        let envelope = self.envelope(msg, None);
        let result = self.producer().post(envelope);

        match result {
            Ok(()) => Ok(()),
            Err(mut envelope) => {
                envelope.release();
                self.inner.items.give(envelope);
                Err(MqError::QueueOverrun)
            }
        }
    }

    /// Enqueue and block until the receiver completes the message
    pub fn send(&self, msg: Message) -> MqResult<Reply> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MqError::Disconnected);
        }

        let (mut slot, tx) = self.reply_slot();
        let envelope = self.envelope(msg, Some(tx));
        let result = self.producer().push(envelope, true);

        if let Err(mut envelope) = result {
            envelope.release();
            self.inner.items.give(envelope);
            return Err(MqError::QueueOverrun);
        }

        loop {
            match slot.rx.recv_timeout(DISCONNECT_CHECK) {
                Ok(completion) => {
                    slot.tx = Some(completion.tx);
                    self.inner.replies.give(slot);
                    return Ok(Reply {
                        ret: completion.ret,
                        userdata: completion.userdata,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(MqError::Disconnected),
                Err(RecvTimeoutError::Timeout) => {
                    if self.inner.closed.load(Ordering::Acquire) {
                        return Err(MqError::Disconnected);
                    }
                }
            }
        }
    }

    /// Readable when the receiver frees a slot
    pub fn write_fd(&self) -> RawFd {
        self.producer().write_fd()
    }

    pub fn write_before_poll(&self) {
        self.producer().write_before_poll();
    }

    pub fn write_after_poll(&self) {
        self.producer().write_after_poll();
    }

    /// Try to move locally parked messages into the ring
    pub fn flush_local(&self, wait: bool) -> bool {
        self.producer().flush(wait)
    }

    /// Messages parked on the writer's overflow list
    pub fn pending_local(&self) -> usize {
        self.producer().pending_local()
    }
}

impl std::fmt::Debug for MsgSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgSender")
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Reading side of a message queue; owned by exactly one thread
pub struct MsgReceiver {
    consumer: Consumer<Envelope>,
    items: Arc<Pool<Envelope>>,
    closed: Arc<AtomicBool>,
    /// Message between `get()` and `done()`
    current: Option<Box<Envelope>>,
}

impl MsgReceiver {
    /// Fetch the next message and make it current
    ///
    /// Panics if a message is already current.
    pub fn get(&mut self, wait: bool) -> Option<&mut Envelope> {
        assert!(
            self.current.is_none(),
            "get() while a message is still being dispatched"
        );
        self.current = self.consumer.pop(wait);
        self.current.as_deref_mut()
    }

    /// Finish the current message
    ///
    /// A synchronous sender is woken with `ret` and its payload. A posted
    /// message has its free callback run and its references dropped.
    pub fn done(&mut self, ret: i32) {
        let Some(mut envelope) = self.current.take() else {
            panic!("done() without a current message");
        };

        match envelope.reply.take() {
            Some(tx) => {
                let userdata = envelope.userdata.take();
                envelope.release();
                let back = tx.clone();
                // The sender may have given up after a disconnect check
                let _ = tx.send(Completion {
                    ret,
                    userdata,
                    tx: back,
                });
            }
            None => envelope.release(),
        }

        self.items.give(envelope);
    }

    /// Whether a message is between `get()` and `done()`
    pub fn dispatching(&self) -> bool {
        self.current.is_some()
    }

    /// Dispatch one message if available. Returns `true` if one was handled.
    pub fn process_one(&mut self) -> bool {
        let Some(envelope) = self.get(false) else {
            return false;
        };
        let ret = envelope.dispatch();
        self.done(ret);
        true
    }

    /// Block, dispatching every message, until one with `code` has been handled
    pub fn wait_for(&mut self, code: i32) {
        loop {
            let (got, ret) = match self.get(true) {
                Some(envelope) => (envelope.code(), envelope.dispatch()),
                None => continue,
            };
            self.done(ret);

            if got == code {
                return;
            }
        }
    }

    /// Drain everything queued. With `run` unset nothing is dispatched and
    /// synchronous senders receive -1.
    pub fn flush(&mut self, run: bool) {
        while let Some(envelope) = self.get(false) {
            let ret = if run { envelope.dispatch() } else { -1 };
            self.done(ret);
        }
    }

    /// Readable when a writer pushes
    pub fn read_fd(&self) -> RawFd {
        self.consumer.read_fd()
    }

    /// `true` if a message is ready and the caller must not poll
    pub fn read_before_poll(&mut self) -> bool {
        self.consumer.read_before_poll()
    }

    pub fn read_after_poll(&mut self) {
        self.consumer.read_after_poll();
    }
}

impl Drop for MsgReceiver {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.current = None;
        // Dropping undelivered envelopes wakes their senders with Disconnected
        while self.consumer.pop(false).is_some() {}
    }
}

impl std::fmt::Debug for MsgReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgReceiver")
            .field("dispatching", &self.current.is_some())
            .finish()
    }
}

/// Create a message queue
pub fn channel(config: &QueueConfig) -> MqResult<(MsgSender, MsgReceiver)> {
    let (producer, consumer) = asyncq::channel(
        config.capacity,
        config.localq_limit,
        config.overflow_policy,
    )?;

    let items = Arc::new(Pool::new(config.item_pool_size));
    let closed = Arc::new(AtomicBool::new(false));

    let sender = MsgSender {
        inner: Arc::new(SenderInner {
            producer: Mutex::new(producer),
            items: Arc::clone(&items),
            replies: Pool::new(config.item_pool_size),
            closed: Arc::clone(&closed),
        }),
    };
    let receiver = MsgReceiver {
        consumer,
        items,
        closed,
        current: None,
    };

    Ok((sender, receiver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::msg::MemBlock;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        codes: Mutex<Vec<i32>>,
        bytes: Mutex<Vec<u8>>,
    }

    impl MsgObject for Recorder {
        fn process_msg(
            &self,
            code: i32,
            userdata: Option<&mut Payload>,
            _offset: i64,
            chunk: Option<&MemChunk>,
        ) -> i32 {
            self.codes.lock().unwrap().push(code);
            if let Some(value) = userdata.and_then(|d| d.downcast_mut::<u32>()) {
                *value += 1;
            }
            if let Some(chunk) = chunk {
                self.bytes.lock().unwrap().extend_from_slice(chunk.as_slice());
            }
            code * 10
        }
    }

    fn queue(capacity: usize) -> (MsgSender, MsgReceiver) {
        channel(&QueueConfig::with_capacity(capacity)).unwrap()
    }

    #[test]
    fn test_send_returns_done_value() {
        let (tx, mut rx) = queue(8);
        let recorder = Arc::new(Recorder::default());

        let receiver = thread::spawn(move || {
            let envelope = rx.get(true).unwrap();
            assert_eq!(envelope.code(), 7);
            assert!(envelope.is_sync());
            thread::sleep(Duration::from_millis(30));
            let ret = envelope.dispatch();
            rx.done(ret);
        });

        let mut reply = tx
            .send(Message::new(7).to(recorder.clone()).with_data(41u32))
            .unwrap();
        assert_eq!(reply.ret, 70);
        assert_eq!(reply.take_data::<u32>(), Some(42));
        receiver.join().unwrap();
    }

    #[test]
    fn test_send_without_object_returns_zero() {
        let (tx, mut rx) = queue(8);
        let receiver = thread::spawn(move || rx.wait_for(3));

        assert_eq!(tx.send(Message::new(3)).unwrap().ret, 0);
        receiver.join().unwrap();
    }

    #[test]
    fn test_post_dispatches_in_order() {
        let (tx, mut rx) = queue(4);
        let recorder = Arc::new(Recorder::default());

        for code in 1..=10 {
            tx.post(Message::new(code).to(recorder.clone())).unwrap();
        }

        while recorder.codes.lock().unwrap().len() < 10 {
            if !rx.process_one() {
                tx.flush_local(false);
            }
        }
        assert_eq!(*recorder.codes.lock().unwrap(), (1..=10).collect::<Vec<_>>());
    }

    /// Records `(code, offset)` pairs in arrival order
    #[derive(Default)]
    struct ArrivalLog {
        seen: Mutex<Vec<(i32, i64)>>,
    }

    impl MsgObject for ArrivalLog {
        fn process_msg(&self, code: i32, _: Option<&mut Payload>, offset: i64, _: Option<&MemChunk>) -> i32 {
            self.seen.lock().unwrap().push((code, offset));
            0
        }
    }

    #[test]
    fn test_concurrent_writers_keep_per_writer_order() {
        const WRITERS: i32 = 4;
        const PER_WRITER: i64 = 50;

        let (tx, mut rx) = queue(8);
        let log = Arc::new(ArrivalLog::default());
        let total = (WRITERS as i64 * PER_WRITER) as usize;

        let reader = thread::spawn(move || {
            for _ in 0..total {
                let envelope = rx.get(true).unwrap();
                let ret = envelope.dispatch();
                rx.done(ret);
            }
            rx
        });

        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let tx = tx.clone();
                let log: MsgObjectRef = log.clone();
                thread::spawn(move || {
                    for seq in 0..PER_WRITER {
                        let msg = Message::new(writer).to(log.clone()).offset(seq);
                        // Every tenth message is synchronous, the last one included,
                        // so nothing stays parked once all writers are done
                        if seq % 10 == 9 {
                            assert_eq!(tx.send(msg).unwrap().ret, 0);
                        } else {
                            tx.post(msg).unwrap();
                        }
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        let mut rx = reader.join().unwrap();
        assert!(!rx.process_one());
        assert_eq!(tx.pending_local(), 0);

        let seen = log.seen.lock().unwrap();
        assert_eq!(seen.len(), total);
        for writer in 0..WRITERS {
            let offsets: Vec<i64> = seen
                .iter()
                .filter(|(code, _)| *code == writer)
                .map(|(_, offset)| *offset)
                .collect();
            assert_eq!(offsets, (0..PER_WRITER).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_free_cb_runs_on_done() {
        static FREED: AtomicUsize = AtomicUsize::new(0);
        fn count_free(_: Payload) {
            FREED.fetch_add(1, Ordering::SeqCst);
        }

        let (tx, mut rx) = queue(4);
        tx.post(Message::new(1).with_data(5u32).free_cb(count_free))
            .unwrap();
        assert_eq!(FREED.load(Ordering::SeqCst), 0);

        assert!(rx.process_one());
        assert_eq!(FREED.load(Ordering::SeqCst), 1);
        assert!(!rx.process_one());
    }

    #[test]
    fn test_wait_for_dispatches_intervening() {
        let (tx, mut rx) = queue(8);
        let recorder = Arc::new(Recorder::default());

        for code in 1..=4 {
            tx.post(Message::new(code).to(recorder.clone())).unwrap();
        }

        rx.wait_for(3);
        assert_eq!(*recorder.codes.lock().unwrap(), vec![1, 2, 3]);

        assert!(rx.process_one());
        assert!(!rx.process_one());
        assert_eq!(*recorder.codes.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_flush_without_run_fails_senders() {
        let (tx, mut rx) = queue(8);
        let recorder = Arc::new(Recorder::default());

        let sender = {
            let recorder = recorder.clone();
            thread::spawn(move || tx.send(Message::new(9).to(recorder)).unwrap().ret)
        };

        while !sender.is_finished() {
            rx.flush(false);
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(sender.join().unwrap(), -1);
        assert!(recorder.codes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_memchunk_transit() {
        let (tx, mut rx) = queue(4);
        let recorder = Arc::new(Recorder::default());
        let block = MemBlock::new_shared(vec![1u8, 2, 3, 4, 5]);

        tx.post(
            Message::new(2)
                .to(recorder.clone())
                .chunk(MemChunk::new(block, 1, 3))
                .offset(128),
        )
        .unwrap();

        let envelope = rx.get(false).unwrap();
        assert_eq!(envelope.offset(), 128);
        assert_eq!(envelope.chunk().map(|c| c.length()), Some(3));
        let ret = envelope.dispatch();
        rx.done(ret);

        assert_eq!(*recorder.bytes.lock().unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_disconnected_when_receiver_drops() {
        let (tx, mut rx) = queue(4);

        let receiver = thread::spawn(move || {
            assert!(rx.get(true).is_some());
            drop(rx);
        });

        assert!(matches!(tx.send(Message::new(1)), Err(MqError::Disconnected)));
        receiver.join().unwrap();
        assert!(matches!(tx.send(Message::new(2)), Err(MqError::Disconnected)));
    }

    #[test]
    fn test_overrun_rejects_post() {
        let config = QueueConfig {
            capacity: 1,
            localq_limit: 0,
            overflow_policy: OverflowPolicy::Reject,
            item_pool_size: 4,
        };
        let (tx, _rx) = channel(&config).unwrap();

        tx.post(Message::new(1)).unwrap();
        assert!(matches!(tx.post(Message::new(2)), Err(MqError::QueueOverrun)));
    }

    #[test]
    fn test_dispatching_flag() {
        let (tx, mut rx) = queue(4);
        tx.post(Message::new(1)).unwrap();

        assert!(!rx.dispatching());
        assert!(rx.get(false).is_some());
        assert!(rx.dispatching());
        rx.done(0);
        assert!(!rx.dispatching());
    }

    #[test]
    #[should_panic(expected = "still being dispatched")]
    fn test_get_while_current_panics() {
        let (tx, mut rx) = queue(4);
        tx.post(Message::new(1)).unwrap();
        tx.post(Message::new(2)).unwrap();

        let _ = rx.get(false).is_some();
        let _ = rx.get(false).is_some();
    }

    #[test]
    #[should_panic(expected = "without a current message")]
    fn test_done_without_current_panics() {
        let (_tx, mut rx) = queue(4);
        rx.done(0);
    }
}
