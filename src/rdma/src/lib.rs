//! Local memory and the verbs-facing contract consumed by the communicator.
//!
//! The crate does not open devices or set up connections. A verbs provider hands out a
//! [`verbs::ProtectionDomain`], a connected [`verbs::QueuePair`], and the
//! [`verbs::CompletionQueue`] bound to it. [`soft`] is an in-process provider with the same
//! semantics as a reliable-connected queue pair.
pub mod mr;
pub mod soft;
pub mod verbs;
pub mod wr;

pub use interface::{
    AccessFlags, MrKeys, QpCapability, RemoteKey, SendFlags, WcOpcode, WcStatus, WorkCompletion,
};
