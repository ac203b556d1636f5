//! Update queue runtime.
//!
//! A producer thread samples SA and bundle signals from the parameter store
//! and feeds a bounded [`UpdateQueue`]; a consumer thread drains it into the
//! orchestrator's revert and reinstall paths. Both share one read-only
//! [`SaTable`] built before either starts.

mod consumer;
mod probe;
mod producer;
mod table;

pub use probe::{ProcessProbe, SysinfoProbe};
pub use producer::BUNDLE_FAIL;
pub use table::{SaModule, SaTable};

use crate::param::ParamStore;
use crate::update::ModuleUpdater;
use consumer::Consumer;
use hmp_update_core::error::{Result, UpdateError};
use hmp_update_core::event::QueueEntry;
use hmp_update_core::queue::UpdateQueue;
use producer::Producer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Running producer/consumer pair.
pub struct UpdateRuntime {
    queue: Arc<UpdateQueue>,
    exit: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for UpdateRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateRuntime")
            .field("queued", &self.queue.len())
            .field("stopping", &self.exit.load(Ordering::SeqCst))
            .finish()
    }
}

impl UpdateRuntime {
    pub fn start(
        updater: Arc<ModuleUpdater>,
        table: Arc<SaTable>,
        params: Arc<dyn ParamStore>,
        probe: Arc<dyn ProcessProbe>,
        capacity: usize,
        poll: Duration,
    ) -> Result<Self> {
        let queue = Arc::new(UpdateQueue::new(capacity));
        let exit = Arc::new(AtomicBool::new(false));

        let consumer = Consumer {
            updater,
            table: Arc::clone(&table),
            probe,
            queue: Arc::clone(&queue),
        };
        let consumer = spawn("hmp-consumer", move || consumer.run())?;

        let producer = Producer {
            table,
            params,
            queue: Arc::clone(&queue),
        };
        let producer_exit = Arc::clone(&exit);
        let producer = match spawn("hmp-producer", move || producer.run(producer_exit, poll)) {
            Ok(handle) => handle,
            Err(e) => {
                queue.stop();
                if consumer.join().is_err() {
                    tracing::error!("Consumer thread panicked");
                }
                return Err(e);
            }
        };

        tracing::info!(capacity = queue.capacity(), "Update runtime started");
        Ok(Self {
            queue,
            exit,
            producer: Some(producer),
            consumer: Some(consumer),
        })
    }

    /// Queue an entry directly, bypassing the producer.
    pub fn enqueue(&self, entry: QueueEntry) -> bool {
        self.queue.put(entry)
    }

    /// Shared handle to the queue, for callers that must not block while
    /// holding the runtime.
    pub fn queue(&self) -> Arc<UpdateQueue> {
        Arc::clone(&self.queue)
    }

    /// Set the exit flag, stop the queue and join both threads. Entries
    /// still queued are abandoned.
    pub fn shutdown(&mut self) {
        if self.exit.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.stop();
        for (role, handle) in [
            ("producer", self.producer.take()),
            ("consumer", self.consumer.take()),
        ] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::error!(role, "Runtime thread panicked");
                }
            }
        }
        tracing::info!("Update runtime stopped");
    }
}

impl Drop for UpdateRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| UpdateError::Other(format!("failed to spawn {} thread: {}", name, e)))
}
