//! rtmq-stream - plays a generated tone through a sink on an IO thread
//!
//! The main thread owns the control loop and pushes audio chunks and
//! control messages over `inq`. The IO thread runs its own loop, consumes
//! the buffer on a timer and reports progress over `outq`.

mod config;
mod stream;

use std::f32::consts::TAU;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rtmq_core::config::load_config;
use rtmq_core::mainloop::{Mainloop, MainloopApi, TimeEvent};
use rtmq_core::msg::{MemBlock, MemChunk, Message, MsgObjectRef};
use rtmq_core::{ThreadMq, ThreadMqHandle};

use config::{default_stream_config_path, StreamConfig};
use stream::{sink_msg, SinkStream, StreamController};

const TONE_HZ: f32 = 440.0;

/// One chunk of an s16le sine, continuing at `frame`
fn tone_chunk(config: &StreamConfig, frame: &mut u64) -> MemChunk {
    let channels = usize::from(config.channels.max(1));
    let frames = config.chunk_bytes / (2 * channels);
    let mut data = Vec::with_capacity(frames * channels * 2);

    for _ in 0..frames {
        let t = *frame as f32 / config.sample_rate as f32;
        let sample = ((TAU * TONE_HZ * t).sin() * f32::from(i16::MAX) * 0.5) as i16;
        for _ in 0..channels {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        *frame += 1;
    }

    MemChunk::whole(MemBlock::new_shared(data))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_stream_config_path);
    let config: StreamConfig = load_config(&config_path);
    log::info!(
        "Streaming {} chunks of {} bytes at {} Hz x {} (queue capacity {})",
        config.chunks,
        config.chunk_bytes,
        config.sample_rate,
        config.channels,
        config.queue.effective_capacity()
    );

    let main_ml = Arc::new(Mainloop::new().context("Failed to create control loop")?);
    let io_ml = Arc::new(Mainloop::new().context("Failed to create IO loop")?);
    let mut tmq = ThreadMq::new(main_ml.clone(), io_ml.clone(), &config.queue)
        .context("Failed to set up thread message queues")?;

    let controller = Arc::new(StreamController::new());
    let tick = Duration::from_millis(config.tick_ms.max(1));
    let sink = Arc::new(SinkStream::new(controller.clone(), config.bytes_per_second(), tick));
    sink.attach(io_ml.clone());

    let io_thread = {
        let handle = tmq.handle();
        let io_ml = io_ml.clone();
        let sink = sink.clone();
        thread::Builder::new()
            .name(config.io_thread_name.clone())
            .spawn(move || {
                handle.clone().install();
                let retval = io_ml.run().unwrap_or_else(|e| {
                    log::error!("IO loop failed: {}", e);
                    -1
                });
                sink.detach();

                if let Err(e) = handle.outq.post(Message::shutdown()) {
                    log::error!("Failed to post shutdown to control loop: {}", e);
                }
                // Our loop is gone; anything parked locally must go now
                handle.outq.flush_local(true);
                ThreadMqHandle::uninstall();
                retval
            })
            .context("Failed to spawn IO thread")?
    };

    let progress_interval = Duration::from_millis(config.progress_interval_ms.max(1));
    let progress = {
        let controller = controller.clone();
        main_ml.time_new(
            Some(Instant::now() + progress_interval),
            Box::new(move |api: &dyn MainloopApi, event: TimeEvent, deadline: Instant| {
                log::info!(
                    "Played {} bytes ({} progress reports)",
                    controller.bytes_played(),
                    controller.progress_messages()
                );
                api.time_restart(event, Some(deadline + progress_interval));
            }),
        )
    };

    let sink_obj: MsgObjectRef = sink.clone();

    tmq.inq()
        .post(Message::new(sink_msg::SET_VOLUME).to(sink_obj.clone()).with_data(config.volume))
        .context("Failed to set volume")?;

    let mut frame = 0u64;
    for _ in 0..config.chunks {
        let chunk = tone_chunk(&config, &mut frame);
        tmq.inq()
            .post(Message::new(sink_msg::WRITE).to(sink_obj.clone()).chunk(chunk))
            .context("Failed to queue audio chunk")?;
        main_ml.iterate(false)?;
    }

    let drain_deadline = Instant::now() + Duration::from_millis(config.drain_timeout_ms);
    loop {
        main_ml.iterate(false)?;

        let mut reply = tmq
            .inq()
            .send(Message::new(sink_msg::GET_LATENCY).to(sink_obj.clone()).with_data(0u64))
            .context("Failed to query latency")?;
        let latency = reply.take_data::<u64>().unwrap_or(0);
        if reply.ret != 0 || latency == 0 {
            break;
        }
        if Instant::now() >= drain_deadline {
            log::warn!("Gave up draining with {} us still buffered", latency);
            break;
        }
        log::debug!("Latency {} us", latency);
        thread::sleep(tick);
    }

    let reply = tmq
        .inq()
        .send(Message::new(sink_msg::SUSPEND).to(sink_obj.clone()).with_data(true))
        .context("Failed to suspend sink")?;
    if reply.ret != 0 {
        log::warn!("Sink refused to suspend ({})", reply.ret);
    }

    tmq.inq()
        .post(Message::shutdown())
        .context("Failed to post shutdown to IO thread")?;

    let retval = main_ml.run().context("Control loop failed")?;
    main_ml.time_free(progress);

    let io_retval = io_thread
        .join()
        .map_err(|_| anyhow!("IO thread panicked"))?;
    tmq.done();

    log::info!(
        "Done: wrote {} bytes, played {}, peak {}, suspended {} (exit {} / {})",
        sink.bytes_written(),
        controller.bytes_played(),
        sink.peak(),
        controller.is_suspended(),
        retval,
        io_retval
    );

    Ok(())
}
