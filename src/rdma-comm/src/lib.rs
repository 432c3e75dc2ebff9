//! Work request lifecycle for an RPC transport over RDMA.
//!
//! A [`Communicator`] owns one registered memory region split into fixed-size segments, one
//! per (work request type, slot id). Application threads acquire slots from the
//! [`SlotPool`], fill their buffers, and post them through the pre-built descriptors of the
//! [`svc`] managers. A single consumer polls the completion queue and hands each completion
//! to the [`CompletionHandler`], which frees outbound slots and re-arms inbound ones.
pub mod buf;
pub mod communicator;
pub mod completion;
pub mod config;
pub mod error;
pub mod logging;
pub mod poller;
pub mod rpc;
pub mod slot;
pub mod svc;

pub use buf::BufferManager;
pub use communicator::{Communicator, CommunicatorBuilder, PostError};
pub use completion::CompletionHandler;
pub use config::CommunicatorConfig;
pub use error::{CompletionError, Error, Result};
pub use poller::CompletionPoller;
pub use slot::{SlotPool, SlotState, WorkRequestProxy, WorkRequestType};
