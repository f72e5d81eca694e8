//! Fixed-pool network buffers.
//!
//! Data moving between the protocol layers lives in chains of fixed-size
//! buffers drawn from a preallocated pool. Chains avoid copying when headers
//! are prepended or payloads split; queues hand whole chains between tasks
//! with O(1) enqueue and dequeue. The pool never grows: allocation on an
//! empty free list fails immediately and the caller decides whether that is
//! fatal (prepending a header) or recoverable (appending payload).

mod checksum;
mod pool;

pub use pool::{Chain, Pool, Queue, Stats};

/// Payload capacity of a single buffer. Large enough that a link-layer
/// packet normally fits in one buffer.
pub const NBUFSZ: usize = 128;

/// Default number of buffers in a pool.
pub const MAXNBUFS: usize = 32;
