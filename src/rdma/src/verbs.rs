//! The verbs primitives the communicator is written against.
//!
//! A provider implements these for a protection domain, a connected reliable queue pair, and
//! the completion queue that both queues of the pair report to.
use std::io;

use thiserror::Error;

use interface::{AccessFlags, MrKeys, QpCapability, WorkCompletion};

use crate::wr::{RecvWr, SendWr};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Send queue is full.")]
    SendQueueFull,
    #[error("Receive queue is full.")]
    RecvQueueFull,
    #[error("Queue pair is in the error state.")]
    QpError,
    #[error("Invalid scatter/gather entry: addr {addr:#x}, length {length}.")]
    InvalidSge { addr: u64, length: u32 },
    #[error("Unknown memory registration: lkey {0}.")]
    UnknownMr(u32),
    #[error("IO: {0}.")]
    Io(#[from] io::Error),
}

pub trait ProtectionDomain: Send + Sync {
    /// Registers `len` bytes starting at `addr`.
    ///
    /// # Safety
    ///
    /// The memory must stay valid until the keys are passed to [`Self::deregister`].
    unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<MrKeys, Error>;

    fn deregister(&self, keys: MrKeys);
}

pub trait QueuePair: Send + Sync {
    fn cap(&self) -> QpCapability;

    /// # Safety
    ///
    /// The memory described by the SGE must stay valid and must not be written by anyone
    /// else until the completion of this request is polled.
    unsafe fn post_send(&self, wr: &SendWr) -> Result<(), Error>;

    /// # Safety
    ///
    /// The memory described by the SGE must stay valid and must not be accessed by anyone
    /// else until the completion of this request is polled.
    unsafe fn post_recv(&self, wr: &RecvWr) -> Result<(), Error>;

    /// Moves the queue pair to the error state. Every outstanding request completes with
    /// `WR_FLUSH_ERR`.
    fn flush(&self) -> Result<(), Error>;
}

pub trait CompletionQueue: Send + Sync {
    /// Polls at most `wc.capacity()` completions, appending them to `wc`.
    ///
    /// Returns the number of completions polled. Completions of requests posted to one queue
    /// are returned in the order they were posted.
    fn poll(&self, wc: &mut Vec<WorkCompletion>) -> Result<usize, Error>;
}
