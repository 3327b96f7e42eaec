//! Drive a single [Producer] until it fills its declared length, fails, or is cancelled.

use crate::{Error, Producer};
use async_lock::RwLock;
use commonware_macros::select;
use commonware_runtime::{Handle, Spawner};
use futures::channel::oneshot;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Backing storage shared by the [crate::Buffer] and the active generation.
pub(crate) type Storage = Arc<RwLock<Box<[u8]>>>;

/// Lifecycle of a generation.
#[derive(Clone, Debug)]
pub enum State {
    /// The producer is still writing.
    Filling,
    /// The producer wrote exactly its declared length.
    Completed,
    /// The generation was cancelled before it completed.
    Cancelled,
    /// The producer failed (or violated its contract) before it completed.
    Failed(Error),
}

/// Snapshot of the progress of a generation.
#[derive(Clone, Debug)]
pub struct Progress {
    /// Identifier of the generation.
    pub generation: u64,
    /// Number of bytes written so far.
    pub filled: usize,
    /// Number of bytes the producer declared it would write.
    pub total: usize,
    /// Current state of the generation.
    pub state: State,
}

/// Metrics shared by all generations of a [crate::Buffer].
#[derive(Clone, Default)]
pub(crate) struct Metrics {
    pub(crate) installed: Counter,
    pub(crate) completed: Counter,
    pub(crate) cancelled: Counter,
    pub(crate) failed: Counter,
    pub(crate) filled: Counter,
    pub(crate) waiting: Gauge,
}

impl Metrics {
    pub(crate) fn init<E: commonware_runtime::Metrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "installed",
            "Number of producers installed",
            metrics.installed.clone(),
        );
        context.register(
            "completed",
            "Number of producers that completed",
            metrics.completed.clone(),
        );
        context.register(
            "cancelled",
            "Number of producers cancelled before completing",
            metrics.cancelled.clone(),
        );
        context.register(
            "failed",
            "Number of producers that failed",
            metrics.failed.clone(),
        );
        context.register(
            "filled",
            "Number of bytes written by producers",
            metrics.filled.clone(),
        );
        context.register(
            "waiting",
            "Number of reads waiting for data",
            metrics.waiting.clone(),
        );
        metrics
    }
}

type Waiter = (usize, oneshot::Sender<Result<(), Error>>);

struct Inner {
    cursor: usize,
    state: State,
    waiters: Vec<Waiter>,
}

/// Progress of a single generation, observed by readers and advanced by its [Fill].
pub(crate) struct Generation {
    id: u64,
    total: usize,
    inner: Mutex<Inner>,
    waiting: Gauge,
}

impl Generation {
    pub(crate) fn new(id: u64, total: usize, waiting: Gauge) -> Self {
        Self {
            id,
            total,
            inner: Mutex::new(Inner {
                cursor: 0,
                state: State::Filling,
                waiters: Vec::new(),
            }),
            waiting,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Verify `[offset, offset + length)` lies within the declared length, returning its end.
    pub(crate) fn check(&self, offset: usize, length: usize) -> Result<usize, Error> {
        match offset.checked_add(length) {
            Some(end) if end <= self.total => Ok(end),
            _ => Err(Error::OutOfRange {
                offset,
                length,
                total: self.total,
            }),
        }
    }

    /// Returns whether `end` has been filled, or the terminal error that prevents it from ever
    /// being filled.
    pub(crate) fn ready(&self, end: usize) -> Result<bool, Error> {
        let inner = self.inner.lock().unwrap();
        if inner.cursor >= end {
            return Ok(true);
        }
        match &inner.state {
            State::Filling | State::Completed => Ok(false),
            State::Cancelled => Err(Error::Cancelled),
            State::Failed(err) => Err(err.clone()),
        }
    }

    /// Wait until `end` has been filled.
    pub(crate) async fn wait(&self, end: usize) -> Result<(), Error> {
        let receiver = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cursor >= end {
                return Ok(());
            }
            match &inner.state {
                State::Filling => {}
                // Every range that passed `check` is covered by a completed generation
                State::Completed => return Ok(()),
                State::Cancelled => return Err(Error::Cancelled),
                State::Failed(err) => return Err(err.clone()),
            }

            // Drop waiters whose readers have gone away
            let before = inner.waiters.len();
            inner.waiters.retain(|(_, sender)| !sender.is_canceled());
            self.waiting.dec_by((before - inner.waiters.len()) as i64);

            let (sender, receiver) = oneshot::channel();
            inner.waiters.push((end, sender));
            self.waiting.inc();
            receiver
        };

        // If the generation exits without resolving the waiter, it did not complete
        receiver.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Publish a new cursor and release every waiter it satisfies.
    fn advance(&self, cursor: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.cursor = cursor;
        let waiters = std::mem::take(&mut inner.waiters);
        let before = waiters.len();
        for (end, sender) in waiters {
            if sender.is_canceled() {
                continue;
            }
            if end <= cursor {
                let _ = sender.send(Ok(()));
                continue;
            }
            inner.waiters.push((end, sender));
        }
        self.waiting.dec_by((before - inner.waiters.len()) as i64);
    }

    /// Record the terminal state and release every waiter.
    fn finish(&self, state: State) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        let waiters = std::mem::take(&mut inner.waiters);
        self.waiting.dec_by(waiters.len() as i64);
        for (end, sender) in waiters {
            let result = if end <= inner.cursor {
                Ok(())
            } else {
                match &inner.state {
                    State::Filling | State::Completed => Ok(()),
                    State::Cancelled => Err(Error::Cancelled),
                    State::Failed(err) => Err(err.clone()),
                }
            };
            let _ = sender.send(result);
        }
    }

    pub(crate) fn progress(&self) -> Progress {
        let inner = self.inner.lock().unwrap();
        Progress {
            generation: self.id,
            filled: inner.cursor,
            total: self.total,
            state: inner.state.clone(),
        }
    }
}

/// Handle to a spawned [Fill].
pub(crate) struct Execution {
    generation: Arc<Generation>,
    cancel: Option<oneshot::Sender<()>>,
    handle: Handle<Result<(), Error>>,
}

impl Execution {
    pub(crate) fn generation(&self) -> &Arc<Generation> {
        &self.generation
    }

    /// Request that the generation stop before its next chunk. Does not wait.
    pub(crate) fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Wait for the generation to exit, returning the error it failed with (if any).
    pub(crate) async fn join(self) -> Result<(), Error> {
        self.handle
            .await
            .map_err(|err| Error::Runtime(Arc::new(err)))?
    }
}

/// How a [Fill] stopped without failing.
enum Exit {
    Completed,
    Cancelled,
}

/// Pulls chunks from a [Producer] into the shared storage.
pub(crate) struct Fill<P: Producer> {
    producer: P,
    generation: Arc<Generation>,
    storage: Storage,
    scratch: Vec<u8>,
    stall_limit: usize,
    cancel: oneshot::Receiver<()>,
    metrics: Metrics,
}

impl<P: Producer> Fill<P> {
    /// Spawn a new [Fill] for `producer`, returning its [Execution].
    pub(crate) fn spawn<E: Spawner>(
        context: E,
        producer: P,
        generation: Arc<Generation>,
        storage: Storage,
        block_size: usize,
        stall_limit: usize,
        metrics: Metrics,
    ) -> Execution {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let scratch = vec![0u8; block_size.min(generation.total)];
        let fill = Self {
            producer,
            generation: generation.clone(),
            storage,
            scratch,
            stall_limit,
            cancel: cancel_rx,
            metrics,
        };
        let handle = context.spawn(move |_| fill.run());
        Execution {
            generation,
            cancel: Some(cancel_tx),
            handle,
        }
    }

    async fn run(mut self) -> Result<(), Error> {
        let generation = self.generation.id();
        let result = self.fill().await;
        match result {
            Ok(Exit::Completed) => {
                debug!(generation, total = self.generation.total, "producer completed");
                self.metrics.completed.inc();
                self.generation.finish(State::Completed);
                Ok(())
            }
            Ok(Exit::Cancelled) => {
                debug!(generation, "producer cancelled");
                self.metrics.cancelled.inc();
                self.generation.finish(State::Cancelled);
                Ok(())
            }
            Err(err) => {
                warn!(generation, ?err, "producer failed");
                self.metrics.failed.inc();
                self.generation.finish(State::Failed(err.clone()));
                Err(err)
            }
        }
    }

    /// Returns true if cancellation was requested (or the requester is gone).
    fn cancelled(&mut self) -> bool {
        !matches!(self.cancel.try_recv(), Ok(None))
    }

    async fn fill(&mut self) -> Result<Exit, Error> {
        let total = self.generation.total;
        let mut cursor = 0;
        let mut stalls = 0;
        while cursor < total {
            // Cancellation is only observed between chunks
            if self.cancelled() {
                return Ok(Exit::Cancelled);
            }

            // Pull the next chunk without holding the storage
            let requested = self.scratch.len().min(total - cursor);
            let written = self
                .producer
                .write(&mut self.scratch[..requested])
                .await
                .map_err(|err| Error::Producer(Arc::new(err)))?;

            // Verify the producer honored the request
            if written > requested {
                return Err(Error::Overrun { written, requested });
            }
            if written == 0 {
                stalls += 1;
                if stalls >= self.stall_limit {
                    return Err(Error::Truncated {
                        written: cursor,
                        expected: total,
                    });
                }
                trace!(
                    generation = self.generation.id(),
                    cursor,
                    stalls,
                    "producer made no progress"
                );
                continue;
            }
            stalls = 0;

            // Copy the chunk into the storage once outstanding views are dropped
            {
                let mut storage = match self.storage.try_write() {
                    Some(storage) => storage,
                    None => select! {
                        _ = &mut self.cancel => {
                            return Ok(Exit::Cancelled);
                        },
                        storage = self.storage.write() => {
                            storage
                        },
                    },
                };
                storage[cursor..cursor + written].copy_from_slice(&self.scratch[..written]);
            }

            // Publish progress
            cursor += written;
            trace!(
                generation = self.generation.id(),
                cursor,
                total,
                written,
                "filled chunk"
            );
            self.metrics.filled.inc_by(written as u64);
            self.generation.advance(cursor);
        }
        Ok(Exit::Completed)
    }
}
