//! Fill a fixed-capacity buffer from a background producer while readers wait on ranges.
//!
//! A [Buffer] owns a contiguous region of memory (allocated once, never resized) that is written
//! incrementally by a single [Producer]. Each installed producer runs on its own spawned task
//! (a "generation") that pulls at most `block_size` bytes per call and publishes its progress
//! after every chunk. Any number of readers may concurrently request a [View] over
//! `[offset, offset + length)`, waiting until the active generation has written that range (or
//! failed).
//!
//! # Single Writer
//!
//! Installing a new producer cancels the active generation and waits for it to exit before the
//! next generation is spawned, so at most one generation ever writes to the backing storage.
//! Cancellation is cooperative: it is observed between chunks and at most one in-flight chunk
//! completes after it is requested.
//!
//! # Visibility
//!
//! A producer writes each chunk into scratch space owned by its generation. The chunk is then
//! copied into the storage while holding the storage lock exclusively, and every [View] holds the
//! same lock shared. A reader that observes its range as filled is therefore guaranteed to observe
//! the bytes the producer wrote, and filled ranges stay readable while the producer is busy
//! producing the next chunk. _Because a [View] pins the storage, the active generation cannot
//! publish its next chunk until outstanding views are dropped. Keep views short-lived._
//!
//! # Generations
//!
//! Each installation is tagged with a monotonically increasing identifier. A read captures the
//! generation that was active when it started. If that generation is cancelled before the range is
//! filled, the read fails with [Error::Cancelled]. If a newer generation is installed after the
//! range was filled but before the view was constructed, the read fails with [Error::Superseded]
//! rather than returning bytes written by another producer.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use commonware_buffer::{producer::Memory, Buffer, Config};
//! use commonware_runtime::{deterministic, Runner};
//! use std::num::NonZeroUsize;
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     // Allocate the buffer
//!     let buffer = Buffer::new(context, Config {
//!         capacity: 1024,
//!         block_size: NonZeroUsize::new(64).unwrap(),
//!         stall_limit: NonZeroUsize::new(8).unwrap(),
//!     });
//!
//!     // Install a producer
//!     let payload = Bytes::from_static(b"hello, world");
//!     buffer.set_producer(Memory::new(payload)).await.unwrap();
//!
//!     // Wait for a range to be filled
//!     let view = buffer.read(7, 5).await.unwrap().unwrap();
//!     assert_eq!(&*view, b"world");
//! });
//! ```

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use std::sync::Arc;
use thiserror::Error;

mod buffer;
pub use buffer::{Buffer, Config};
mod fill;
pub use fill::{Progress, State};
pub mod mocks;
pub mod producer;
pub use producer::Producer;
mod view;
pub use view::View;

/// Errors that can occur when interacting with a [Buffer].
///
/// Errors are cloneable so a single producer failure can be delivered to every waiting reader.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("producer too large: {length} > capacity {capacity}")]
    ProducerTooLarge { length: usize, capacity: usize },
    #[error("producer failed: {0}")]
    Producer(Arc<dyn std::error::Error + Send + Sync>),
    #[error("producer truncated: wrote {written} of {expected} bytes")]
    Truncated { written: usize, expected: usize },
    #[error("producer overrun: wrote {written} bytes when {requested} were requested")]
    Overrun { written: usize, requested: usize },
    #[error("range out of bounds: offset={offset} length={length} total={total}")]
    OutOfRange {
        offset: usize,
        length: usize,
        total: usize,
    },
    #[error("generation cancelled")]
    Cancelled,
    #[error("generation superseded")]
    Superseded,
    #[error("runtime error: {0}")]
    Runtime(Arc<commonware_runtime::Error>),
}
