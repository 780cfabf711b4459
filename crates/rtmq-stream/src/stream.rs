//! Playback stream objects on either side of the thread queues
//!
//! [`SinkStream`] lives on the IO thread. It receives audio chunks and
//! control messages over `inq`, "plays" buffered bytes from a timer on the
//! IO loop, and reports back over `outq`. [`StreamController`] is its
//! counterpart on the main loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use rtmq_core::mainloop::{MainloopApi, TimeEvent};
use rtmq_core::msg::{MemChunk, Message, MsgObject, MsgObjectRef, Payload};
use rtmq_core::ThreadMq;

/// Messages understood by [`SinkStream`]
pub mod sink_msg {
    /// Post; payload `f32` linear gain
    pub const SET_VOLUME: i32 = 1;
    /// Send; payload `u64` receives the buffered duration in microseconds
    pub const GET_LATENCY: i32 = 2;
    /// Post; memchunk of s16le samples
    pub const WRITE: i32 = 3;
    /// Send; payload `bool` (true = suspend)
    pub const SUSPEND: i32 = 4;
}

/// Messages understood by [`StreamController`]
pub mod controller_msg {
    /// Offset carries the total bytes played
    pub const PROGRESS: i32 = 1;
    /// Offset carries the total bytes played at suspend time
    pub const SUSPENDED: i32 = 2;
}

#[derive(Debug, Default)]
struct SinkState {
    volume: f32,
    /// Written but not yet played
    buffered: u64,
    played: u64,
    written: u64,
    /// Peak absolute sample after gain
    peak: i32,
    suspended: bool,
}

/// IO-thread side of the stream
pub struct SinkStream {
    controller: MsgObjectRef,
    bytes_per_second: u64,
    state: Mutex<SinkState>,
    timer: Mutex<Option<(Arc<dyn MainloopApi>, TimeEvent)>>,
    tick: Duration,
}

impl SinkStream {
    pub fn new(controller: MsgObjectRef, bytes_per_second: u64, tick: Duration) -> Self {
        Self {
            controller,
            bytes_per_second,
            state: Mutex::new(SinkState {
                volume: 1.0,
                ..SinkState::default()
            }),
            timer: Mutex::new(None),
            tick,
        }
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the playback timer on the IO thread's loop
    pub fn attach(self: &Arc<Self>, api: Arc<dyn MainloopApi>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let tick = self.tick;

        let event = api.time_new(
            Some(Instant::now() + tick),
            Box::new(move |api: &dyn MainloopApi, event: TimeEvent, deadline: Instant| {
                let Some(sink) = weak.upgrade() else {
                    return;
                };
                sink.play(tick);
                if !sink.state().suspended {
                    api.time_restart(event, Some(deadline + tick));
                }
            }),
        );

        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some((api, event));
    }

    /// Remove the playback timer
    pub fn detach(&self) {
        if let Some((api, event)) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            api.time_free(event);
        }
    }

    /// Consume one tick worth of buffered bytes
    fn play(&self, elapsed: Duration) {
        let played = {
            let mut state = self.state();
            if state.suspended || state.buffered == 0 {
                return;
            }
            let budget = (self.bytes_per_second as u128 * elapsed.as_micros() / 1_000_000) as u64;
            let consumed = budget.min(state.buffered);
            state.buffered -= consumed;
            state.played += consumed;
            state.played
        };

        self.notify(controller_msg::PROGRESS, played);
    }

    fn notify(&self, code: i32, played: u64) {
        let Some(tmq) = ThreadMq::current() else {
            log::trace!("No thread_mq installed, dropping notification {}", code);
            return;
        };
        let msg = Message::new(code)
            .to(self.controller.clone())
            .offset(played as i64);
        if let Err(e) = tmq.outq.post(msg) {
            log::warn!("Failed to notify controller: {}", e);
        }
    }

    fn write(&self, chunk: &MemChunk) {
        let mut state = self.state();
        let volume = state.volume;

        let peak = chunk
            .as_slice()
            .chunks_exact(2)
            .map(|b| {
                let sample = f32::from(i16::from_le_bytes([b[0], b[1]])) * volume;
                (sample as i32).abs()
            })
            .max()
            .unwrap_or(0);

        state.peak = state.peak.max(peak);
        state.buffered += chunk.length() as u64;
        state.written += chunk.length() as u64;
    }

    fn latency_usec(&self) -> u64 {
        let buffered = self.state().buffered;
        if self.bytes_per_second == 0 {
            return 0;
        }
        (buffered as u128 * 1_000_000 / self.bytes_per_second as u128) as u64
    }

    fn suspend(&self, suspend: bool) {
        let played = {
            let mut state = self.state();
            if state.suspended == suspend {
                return;
            }
            state.suspended = suspend;
            state.played
        };

        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((api, event)) = timer.as_ref() {
            let deadline = if suspend { None } else { Some(Instant::now() + self.tick) };
            api.time_restart(*event, deadline);
        }
        drop(timer);

        if suspend {
            log::info!("Sink suspended after {} bytes", played);
            self.notify(controller_msg::SUSPENDED, played);
        } else {
            log::info!("Sink resumed");
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.state().written
    }

    pub fn peak(&self) -> i32 {
        self.state().peak
    }
}

impl MsgObject for SinkStream {
    fn process_msg(
        &self,
        code: i32,
        userdata: Option<&mut Payload>,
        _offset: i64,
        chunk: Option<&MemChunk>,
    ) -> i32 {
        match code {
            sink_msg::SET_VOLUME => match userdata.and_then(|d| d.downcast_mut::<f32>()) {
                Some(volume) => {
                    self.state().volume = *volume;
                    log::debug!("Sink volume set to {:.2}", volume);
                    0
                }
                None => -1,
            },
            sink_msg::GET_LATENCY => match userdata.and_then(|d| d.downcast_mut::<u64>()) {
                Some(latency) => {
                    *latency = self.latency_usec();
                    0
                }
                None => -1,
            },
            sink_msg::WRITE => match chunk {
                Some(chunk) => {
                    self.write(chunk);
                    0
                }
                None => -1,
            },
            sink_msg::SUSPEND => match userdata.and_then(|d| d.downcast_mut::<bool>()) {
                Some(suspend) => {
                    self.suspend(*suspend);
                    0
                }
                None => -1,
            },
            _ => {
                log::warn!("Sink received unknown message {}", code);
                -1
            }
        }
    }
}

/// Main-loop side of the stream
#[derive(Debug, Default)]
pub struct StreamController {
    played: AtomicU64,
    progress_messages: AtomicU64,
    suspended: AtomicBool,
}

impl StreamController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_played(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }

    pub fn progress_messages(&self) -> u64 {
        self.progress_messages.load(Ordering::Relaxed)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }
}

impl MsgObject for StreamController {
    fn process_msg(
        &self,
        code: i32,
        _userdata: Option<&mut Payload>,
        offset: i64,
        _chunk: Option<&MemChunk>,
    ) -> i32 {
        match code {
            controller_msg::PROGRESS => {
                self.played.fetch_max(offset as u64, Ordering::Relaxed);
                self.progress_messages.fetch_add(1, Ordering::Relaxed);
                0
            }
            controller_msg::SUSPENDED => {
                self.played.fetch_max(offset as u64, Ordering::Relaxed);
                self.suspended.store(true, Ordering::Relaxed);
                log::info!("Stream suspended at {} bytes", offset);
                0
            }
            _ => -1,
        }
    }
}
