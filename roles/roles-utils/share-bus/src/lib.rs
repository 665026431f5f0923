//! Ingest channel contract for the share and meta-event streams.
//!
//! The upstream bus is opaque to the aggregation cores: they only need a
//! blocking consume-with-timeout, an initial offset, and a liveness probe.
//! Transient conditions (timeout, end of stream) surface as `Ok(None)` and
//! are simply re-polled; only topology errors are fatal.

pub mod memory;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{MemoryBus, MemoryBusSender};
pub use tcp::TcpBusConsumer;

/// Where consumption starts when a consumer attaches to the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// The last `n` records of the stream.
    Tail(u64),
    /// A group-committed position.
    Committed(u64),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("consumer is not set up")]
    NotConnected,

    #[error("unknown topic: {0}")]
    UnknownTopic(String),
}

impl BusError {
    /// Unknown-topic style errors mean the consumer is misconfigured and
    /// re-polling can never succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::UnknownTopic(_))
    }
}

/// One consumer attached to one record stream.
#[async_trait]
pub trait BusConsumer: Send {
    /// Attach to the stream at `offset`. Must be called before `consume`.
    async fn setup(&mut self, offset: StartOffset) -> Result<(), BusError>;

    /// Wait up to `timeout` for the next record. `Ok(None)` means timeout
    /// or a non-fatal end-of-stream; callers re-poll.
    async fn consume(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BusError>;

    /// Whether the upstream endpoint currently looks reachable.
    async fn check_alive(&self) -> bool;
}
