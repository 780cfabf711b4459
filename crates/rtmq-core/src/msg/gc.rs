//! Deferred deallocation for memory blocks
//!
//! Memory blocks travel through message queues into real-time threads, and
//! the last reference is often dropped there. Freeing a large buffer can
//! end up in `munmap()`, which has no bounded latency. Blocks are therefore
//! held in `basedrop::Shared`: dropping the last reference only enqueues the
//! pointer, and a background thread does the actual free.
//!
//! ```ignore
//! use basedrop::Shared;
//! use rtmq_core::msg::gc_handle;
//!
//! let block = Shared::new(&gc_handle(), MemBlock::new(vec![0; 4096]));
//! drop(block); // freed later on the memblock-gc thread
//! ```

use basedrop::{Collector, Handle};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// How often the collector thread reclaims dropped blocks
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

fn init_gc() -> Handle {
    let (tx, rx) = crossbeam::channel::bounded(1);

    let spawned = thread::Builder::new()
        .name("memblock-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it lives on this thread only
            let mut collector = Collector::new();
            if tx.send(collector.handle()).is_err() {
                return;
            }

            log::info!("Memblock GC thread started");

            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        });

    if let Err(e) = spawned {
        log::error!("Failed to spawn memblock GC thread: {}", e);
        std::process::abort();
    }

    match rx.recv() {
        Ok(handle) => handle,
        Err(_) => {
            log::error!("Memblock GC thread exited before handing out its collector");
            std::process::abort();
        }
    }
}

/// Handle for allocating `Shared<T>` values reclaimed by the GC thread
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}
