//! Sources of bytes that fill a [crate::Buffer].

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::{convert::Infallible, future::Future};

/// A stateful source of bytes that fills a [crate::Buffer].
///
/// A [Producer] is owned by exactly one generation and is only ever called from that
/// generation's task (never concurrently).
pub trait Producer: Send + 'static {
    /// Error returned when the producer cannot fulfill a request.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Total number of bytes the producer will write.
    ///
    /// This is read exactly once, when the producer is installed, and must not change.
    fn total_length(&self) -> usize;

    /// Copy the next bytes of the stream into the start of `dest`, returning how many were copied.
    ///
    /// Each call continues from where the previous call left off. Returning `0` is allowed, but
    /// once [crate::Config::stall_limit] consecutive calls return `0` before
    /// [Producer::total_length] bytes have been written, the generation ends with
    /// [crate::Error::Truncated]. Returning more than `dest.len()` ends it with
    /// [crate::Error::Overrun].
    ///
    /// `dest` is scratch space owned by the generation, so readers are not blocked while this
    /// call is pending.
    fn write(&mut self, dest: &mut [u8])
        -> impl Future<Output = Result<usize, Self::Error>> + Send;
}

/// A [Producer] that copies from an in-memory payload.
pub struct Memory {
    payload: Bytes,
}

impl Memory {
    /// Create a new [Memory] producer over `payload`.
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }
}

impl Producer for Memory {
    type Error = Infallible;

    fn total_length(&self) -> usize {
        self.payload.len()
    }

    fn write(
        &mut self,
        dest: &mut [u8],
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send {
        let len = dest.len().min(self.payload.len());
        dest[..len].copy_from_slice(&self.payload.split_to(len));
        futures::future::ready(Ok(len))
    }
}

/// A [Producer] that drains a [Stream] of chunks with a known total length (e.g. a response
/// body with a declared content length).
///
/// Chunks larger than the requested block are split and the remainder is served on the next call.
/// If the stream ends before `total` bytes have been yielded, the generation fails with
/// [crate::Error::Truncated].
pub struct Streamed<S> {
    stream: S,
    total: usize,
    pending: Bytes,
    done: bool,
}

impl<S> Streamed<S> {
    /// Create a new [Streamed] producer that will yield `total` bytes from `stream`.
    pub fn new(stream: S, total: usize) -> Self {
        Self {
            stream,
            total,
            pending: Bytes::new(),
            done: false,
        }
    }
}

impl<S, E> Producer for Streamed<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    fn total_length(&self) -> usize {
        self.total
    }

    fn write(
        &mut self,
        dest: &mut [u8],
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send {
        async move {
            // Skip empty chunks
            while self.pending.is_empty() {
                if self.done {
                    return Ok(0);
                }
                match self.stream.next().await {
                    Some(Ok(chunk)) => self.pending = chunk,
                    Some(Err(err)) => return Err(err),
                    None => self.done = true,
                }
            }
            let len = dest.len().min(self.pending.len());
            dest[..len].copy_from_slice(&self.pending.split_to(len));
            Ok(len)
        }
    }
}
