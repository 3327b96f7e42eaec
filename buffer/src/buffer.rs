use crate::{
    fill::{Execution, Fill, Generation, Metrics as FillMetrics, Progress, Storage},
    Error, Producer, View,
};
use async_lock::{Mutex as AsyncMutex, RwLock, RwLockReadGuardArc};
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics, Spawner};
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tracing::debug;

/// Configuration for [Buffer].
#[derive(Clone, Debug)]
pub struct Config {
    /// The number of bytes allocated for the backing storage.
    ///
    /// A producer may not declare a total length larger than this.
    pub capacity: usize,

    /// The maximum number of bytes requested from a producer in a single call.
    pub block_size: NonZeroUsize,

    /// The number of consecutive writes returning zero bytes after which a producer is considered
    /// stalled and its generation fails with [Error::Truncated].
    pub stall_limit: NonZeroUsize,
}

/// A fixed-capacity buffer filled by a background [Producer] and read concurrently.
///
/// See the [crate-level documentation](crate) for the concurrency model.
pub struct Buffer<E: Spawner + Clock + Metrics> {
    context: E,
    capacity: usize,
    block_size: usize,
    stall_limit: usize,
    storage: Storage,

    // Serializes installation (held across the rendezvous with the previous generation)
    installed: AsyncMutex<Option<Execution>>,

    // Generation readers capture (cleared as soon as an installation begins)
    active: Mutex<Option<Arc<Generation>>>,

    // Identifier of the most recent installation
    latest: AtomicU64,

    metrics: FillMetrics,
}

impl<E: Spawner + Clock + Metrics> Buffer<E> {
    /// Allocate a new [Buffer] with no producer installed.
    pub fn new(context: E, cfg: Config) -> Self {
        let storage = vec![0u8; cfg.capacity].into_boxed_slice();
        let metrics = FillMetrics::init(&context);
        Self {
            context,
            capacity: cfg.capacity,
            block_size: cfg.block_size.get(),
            stall_limit: cfg.stall_limit.get(),
            storage: Arc::new(RwLock::new(storage)),

            installed: AsyncMutex::new(None),
            active: Mutex::new(None),
            latest: AtomicU64::new(0),

            metrics,
        }
    }

    /// Returns the capacity of the buffer.
    pub fn size(&self) -> usize {
        self.capacity
    }

    /// Install a new producer, replacing (and waiting for) any active generation.
    ///
    /// If `producer` declares a total length larger than the capacity, [Error::ProducerTooLarge]
    /// is returned and the active generation (if any) is left untouched.
    ///
    /// Any error returned by the replaced generation is discarded.
    pub async fn set_producer<P: Producer>(&self, producer: P) -> Result<(), Error> {
        let total = producer.total_length();
        if total > self.capacity {
            return Err(Error::ProducerTooLarge {
                length: total,
                capacity: self.capacity,
            });
        }

        // Replace the active generation
        let mut installed = self.installed.lock().await;
        let id = self.replace(&mut installed).await;

        // Start the new generation
        let generation = Arc::new(Generation::new(id, total, self.metrics.waiting.clone()));
        let execution = Fill::spawn(
            self.context.with_label("fill"),
            producer,
            generation.clone(),
            self.storage.clone(),
            self.block_size,
            self.stall_limit,
            self.metrics.clone(),
        );
        *installed = Some(execution);
        *self.active.lock().unwrap() = Some(generation);
        self.metrics.installed.inc();
        debug!(generation = id, total, "installed producer");
        Ok(())
    }

    /// Cancel (and wait for) any active generation without installing a new one.
    ///
    /// The storage keeps whatever bytes were written, but subsequent reads return `None` until a
    /// new producer is installed.
    pub async fn clear(&self) {
        let mut installed = self.installed.lock().await;
        let id = self.replace(&mut installed).await;
        debug!(generation = id, "cleared producer");
    }

    /// Retire the active generation, returning the identifier of the next generation.
    async fn replace(&self, installed: &mut Option<Execution>) -> u64 {
        // Any read that captured the outgoing generation is superseded from here on
        let id = self.latest.fetch_add(1, Ordering::AcqRel) + 1;
        *self.active.lock().unwrap() = None;

        // Rendezvous with the outgoing generation
        let Some(mut execution) = installed.take() else {
            return id;
        };
        let previous = execution.generation().id();
        execution.cancel();
        if let Err(err) = execution.join().await {
            debug!(generation = previous, ?err, "discarding error from replaced producer");
        }
        debug!(generation = previous, "replaced producer exited");
        id
    }

    /// Returns the progress of the active generation (or `None` if no producer is installed).
    pub fn progress(&self) -> Option<Progress> {
        self.current().map(|generation| generation.progress())
    }

    /// Wait until `[offset, offset + length)` has been filled and return a [View] over it.
    ///
    /// Returns `None` if no producer is installed. The range must lie within the total length
    /// declared by the active producer. If the producer fails (or is cancelled) before the range is
    /// filled, the failure is returned.
    pub async fn read(&self, offset: usize, length: usize) -> Result<Option<View>, Error> {
        let Some(generation) = self.current() else {
            return Ok(None);
        };
        let end = generation.check(offset, length)?;
        generation.wait(end).await?;
        let storage = self.storage.read_arc().await;
        self.view(&generation, storage, offset, length).map(Some)
    }

    /// Like [Buffer::read], but returns `None` if the range is not available before `timeout`
    /// elapses.
    ///
    /// A zero `timeout` checks once without waiting (see [Buffer::try_read]). Expiry is not an
    /// error.
    pub async fn read_timeout(
        &self,
        offset: usize,
        length: usize,
        timeout: Duration,
    ) -> Result<Option<View>, Error> {
        if timeout.is_zero() {
            return self.try_read(offset, length);
        }
        select! {
            result = self.read(offset, length) => {
                result
            },
            _ = self.context.sleep(timeout) => {
                Ok(None)
            },
        }
    }

    /// Return a [View] over `[offset, offset + length)` if it is available without waiting.
    ///
    /// Returns `None` if no producer is installed, the range has not been filled yet, or the
    /// active generation is in the middle of writing a chunk.
    pub fn try_read(&self, offset: usize, length: usize) -> Result<Option<View>, Error> {
        let Some(generation) = self.current() else {
            return Ok(None);
        };
        let end = generation.check(offset, length)?;
        if !generation.ready(end)? {
            return Ok(None);
        }
        let Some(storage) = self.storage.try_read_arc() else {
            return Ok(None);
        };
        self.view(&generation, storage, offset, length).map(Some)
    }

    fn current(&self) -> Option<Arc<Generation>> {
        self.active.lock().unwrap().clone()
    }

    /// Construct a [View] once the storage is held, verifying no newer generation could have
    /// written to it.
    fn view(
        &self,
        generation: &Generation,
        storage: RwLockReadGuardArc<Box<[u8]>>,
        offset: usize,
        length: usize,
    ) -> Result<View, Error> {
        if self.latest.load(Ordering::Acquire) != generation.id() {
            return Err(Error::Superseded);
        }
        Ok(View::new(storage, offset, length))
    }
}

impl<E: Spawner + Clock + Metrics> Drop for Buffer<E> {
    fn drop(&mut self) {
        // The generation exits at its next chunk boundary
        if let Some(mut execution) = self.installed.get_mut().take() {
            execution.cancel();
        }
    }
}
