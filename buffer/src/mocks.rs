//! Producers for testing a [crate::Buffer].

use crate::Producer;
use commonware_runtime::Clock;
use std::{
    convert::Infallible,
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use thiserror::Error;

/// Returns `length` bytes of the stream written by producers seeded with `seed`, starting at
/// `offset`.
pub fn pattern(seed: u8, offset: usize, length: usize) -> Vec<u8> {
    (offset..offset + length)
        .map(|i| seed.wrapping_add((i % 251) as u8))
        .collect()
}

/// Time range during which a producer was writing a chunk.
#[derive(Clone, Debug)]
pub struct Window {
    pub seed: u8,
    pub start: SystemTime,
    pub end: SystemTime,
}

/// Writes [pattern] with a configurable chunk size and delay per chunk.
pub struct Pattern<E: Clock> {
    context: E,
    seed: u8,
    total: usize,
    position: usize,

    chunks: Vec<usize>,
    next: usize,
    delay: Duration,
    windows: Option<Arc<Mutex<Vec<Window>>>>,
}

impl<E: Clock> Pattern<E> {
    pub fn new(context: E, seed: u8, total: usize) -> Self {
        Self {
            context,
            seed,
            total,
            position: 0,

            chunks: Vec::new(),
            next: 0,
            delay: Duration::ZERO,
            windows: None,
        }
    }

    /// Cap each write at the next size in `chunks` (cycling).
    pub fn with_chunks(mut self, chunks: Vec<usize>) -> Self {
        self.chunks = chunks;
        self
    }

    /// Sleep for `delay` before each write.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Record the [Window] of each write.
    pub fn with_windows(mut self, windows: Arc<Mutex<Vec<Window>>>) -> Self {
        self.windows = Some(windows);
        self
    }
}

impl<E: Clock> Producer for Pattern<E> {
    type Error = Infallible;

    fn total_length(&self) -> usize {
        self.total
    }

    fn write(
        &mut self,
        dest: &mut [u8],
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send {
        async move {
            let start = self.context.current();
            if !self.delay.is_zero() {
                self.context.sleep(self.delay).await;
            }

            let mut len = dest.len().min(self.total - self.position);
            if !self.chunks.is_empty() {
                len = len.min(self.chunks[self.next % self.chunks.len()]);
                self.next += 1;
            }
            dest[..len].copy_from_slice(&pattern(self.seed, self.position, len));
            self.position += len;

            if let Some(windows) = &self.windows {
                windows.lock().unwrap().push(Window {
                    seed: self.seed,
                    start,
                    end: self.context.current(),
                });
            }
            Ok(len)
        }
    }
}

/// Declares `total` bytes but stops making progress after `available` bytes of [pattern]
/// (seeded with `0`).
pub struct Stalling<E: Clock> {
    context: E,
    total: usize,
    available: usize,
    position: usize,
    delay: Duration,
}

impl<E: Clock> Stalling<E> {
    pub fn new(context: E, total: usize, available: usize) -> Self {
        assert!(available <= total);
        Self {
            context,
            total,
            available,
            position: 0,
            delay: Duration::ZERO,
        }
    }

    /// Sleep for `delay` before each write.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl<E: Clock> Producer for Stalling<E> {
    type Error = Infallible;

    fn total_length(&self) -> usize {
        self.total
    }

    fn write(
        &mut self,
        dest: &mut [u8],
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send {
        async move {
            if !self.delay.is_zero() {
                self.context.sleep(self.delay).await;
            }
            let len = dest.len().min(self.available - self.position);
            dest[..len].copy_from_slice(&pattern(0, self.position, len));
            self.position += len;
            Ok(len)
        }
    }
}

/// Error returned by [Failing].
#[derive(Debug, Error)]
#[error("failed at {0}")]
pub struct Failure(pub usize);

/// Declares `total` bytes but fails once `fail_at` bytes of [pattern] (seeded with `0`) have been
/// written.
pub struct Failing {
    total: usize,
    fail_at: usize,
    position: usize,
}

impl Failing {
    pub fn new(total: usize, fail_at: usize) -> Self {
        assert!(fail_at <= total);
        Self {
            total,
            fail_at,
            position: 0,
        }
    }
}

impl Producer for Failing {
    type Error = Failure;

    fn total_length(&self) -> usize {
        self.total
    }

    fn write(
        &mut self,
        dest: &mut [u8],
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send {
        let result = if self.position >= self.fail_at {
            Err(Failure(self.position))
        } else {
            let len = dest.len().min(self.fail_at - self.position);
            dest[..len].copy_from_slice(&pattern(0, self.position, len));
            self.position += len;
            Ok(len)
        };
        futures::future::ready(result)
    }
}
