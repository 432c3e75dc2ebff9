//! Shapes of the descriptors handed to a queue pair.
use std::mem::size_of;

use static_assertions::const_assert_eq;

use interface::{RemoteKey, SendFlags, WcOpcode};

/// A single scatter/gather element.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

// same layout as `struct ibv_sge`
const_assert_eq!(size_of::<Sge>(), 16);

impl Sge {
    #[inline]
    pub fn new(addr: u64, length: u32, lkey: u32) -> Self {
        Sge { addr, length, lkey }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
}

impl WrOpcode {
    /// The opcode reported by a successful completion of this request.
    #[inline]
    pub fn wc_opcode(self) -> WcOpcode {
        match self {
            WrOpcode::Send => WcOpcode::Send,
            WrOpcode::RdmaWrite => WcOpcode::RdmaWrite,
            WrOpcode::RdmaRead => WcOpcode::RdmaRead,
        }
    }
}

/// A send queue descriptor.
///
/// `remote` is required for one-sided opcodes and ignored for `Send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub sge: Sge,
    pub opcode: WrOpcode,
    pub send_flags: SendFlags,
    pub remote: Option<RemoteKey>,
}

impl SendWr {
    pub fn send(wr_id: u64, sge: Sge) -> Self {
        SendWr {
            wr_id,
            sge,
            opcode: WrOpcode::Send,
            send_flags: SendFlags::SIGNALED,
            remote: None,
        }
    }

    pub fn write(wr_id: u64, sge: Sge, remote: RemoteKey) -> Self {
        SendWr {
            wr_id,
            sge,
            opcode: WrOpcode::RdmaWrite,
            send_flags: SendFlags::SIGNALED,
            remote: Some(remote),
        }
    }

    pub fn read(wr_id: u64, sge: Sge, remote: RemoteKey) -> Self {
        SendWr {
            wr_id,
            sge,
            opcode: WrOpcode::RdmaRead,
            send_flags: SendFlags::SIGNALED,
            remote: Some(remote),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

impl RecvWr {
    #[inline]
    pub fn new(wr_id: u64, sge: Sge) -> Self {
        RecvWr { wr_id, sge }
    }
}
