//! Verbs-level vocabulary shared by the memory, transport, and communicator crates.
use std::fmt;
use std::num::NonZeroU32;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Keys returned by a memory registration.
///
/// `lkey` authorizes local access in a scatter/gather entry. `rkey` together with `addr` is what
/// the peer needs to target this memory with one-sided operations.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrKeys {
    pub lkey: u32,
    pub rkey: u32,
}

/// A remote memory buffer exposed by a peer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteKey {
    pub rkey: u32,
    pub addr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpCapability {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

impl QpCapability {
    /// A capability with `depth` outstanding requests on both queues and a single SGE each.
    pub fn with_depth(depth: u32) -> Self {
        QpCapability {
            max_send_wr: depth,
            max_recv_wr: depth,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        }
    }
}

/// Status codes follow `enum ibv_wc_status`.
pub mod wc_status {
    pub const LOC_LEN_ERR: u32 = 1;
    pub const LOC_QP_OP_ERR: u32 = 2;
    pub const LOC_PROT_ERR: u32 = 4;
    pub const WR_FLUSH_ERR: u32 = 5;
    pub const REM_ACCESS_ERR: u32 = 10;
    pub const REM_OP_ERR: u32 = 11;
    pub const RETRY_EXC_ERR: u32 = 12;
    pub const RNR_RETRY_EXC_ERR: u32 = 13;
    pub const GENERAL_ERR: u32 = 21;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WcStatus {
    Success,
    // The underlying transport error code.
    Error(NonZeroU32),
}

impl WcStatus {
    #[inline]
    pub fn from_code(code: u32) -> Self {
        match NonZeroU32::new(code) {
            None => WcStatus::Success,
            Some(code) => WcStatus::Error(code),
        }
    }

    #[inline]
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::Error(code) => code.get(),
        }
    }

    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.code() {
            0 => "success",
            wc_status::LOC_LEN_ERR => "local length error",
            wc_status::LOC_QP_OP_ERR => "local QP operation error",
            wc_status::LOC_PROT_ERR => "local protection error",
            wc_status::WR_FLUSH_ERR => "work request flushed",
            wc_status::REM_ACCESS_ERR => "remote access error",
            wc_status::REM_OP_ERR => "remote operation error",
            wc_status::RETRY_EXC_ERR => "transport retry counter exceeded",
            wc_status::RNR_RETRY_EXC_ERR => "RNR retry counter exceeded",
            wc_status::GENERAL_ERR => "general error",
            code => return write!(f, "error code {}", code),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
    Invalid,
}

bitflags! {
    /// Flags of the completed WR.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct WcFlags: u32 {
        /// GRH is present (valid only for UD QPs).
        const GRH = 0b00000001;
        /// Immediate data value is valid.
        const WITH_IMM = 0b00000010;
    }

    /// Flags of the WR properties.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct SendFlags: u32 {
        /// Set the fence indicator. Valid only for QPs with Transport Service Type RC.
        const FENCE = 0b00000001;
        /// Set the completion notification indicator. Relevant only if QP was created with
        /// sq_sig_all=0.
        const SIGNALED = 0b00000010;
        /// Set the solicited event indicator. Valid only for Send and RDMA Write with immediate.
        const SOLICITED = 0b00000100;
        /// Send data in given gather list as inline data in a send WQE.  Valid only for Send and
        /// RDMA Write.  The L_Key will not be checked.
        const INLINE = 0b00001000;
    }

    /// Access rights of a memory registration.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b00000001;
        const REMOTE_WRITE = 0b00000010;
        const REMOTE_READ = 0b00000100;
        const REMOTE_ATOMIC = 0b00001000;
    }
}

/// A structure represent completion of some work.
///
/// For a failed completion only `wr_id`, `status`, and `vendor_err` are meaningful.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub imm_data: u32,
    pub wc_flags: WcFlags,
}

impl WorkCompletion {
    pub fn new_success(wr_id: u64, opcode: WcOpcode, byte_len: u32) -> Self {
        WorkCompletion {
            wr_id,
            status: WcStatus::Success,
            opcode,
            vendor_err: 0,
            byte_len,
            imm_data: 0,
            wc_flags: WcFlags::empty(),
        }
    }

    pub fn new_error(wr_id: u64, opcode: WcOpcode, code: NonZeroU32) -> Self {
        WorkCompletion {
            wr_id,
            status: WcStatus::Error(code),
            opcode,
            vendor_err: code.get(),
            byte_len: 0,
            imm_data: 0,
            wc_flags: WcFlags::empty(),
        }
    }
}

mod sa {
    use super::*;
    use static_assertions::const_assert_eq;
    use std::mem::size_of;

    const_assert_eq!(size_of::<MrKeys>(), 8);
    const_assert_eq!(size_of::<WcStatus>(), 4);
    const_assert_eq!(size_of::<RemoteKey>(), 16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_roundtrip() {
        assert_eq!(WcStatus::from_code(0), WcStatus::Success);
        let status = WcStatus::from_code(wc_status::WR_FLUSH_ERR);
        assert!(!status.is_success());
        assert_eq!(status.code(), wc_status::WR_FLUSH_ERR);
        assert_eq!(status.to_string(), "work request flushed");
        assert_eq!(WcStatus::from_code(99).to_string(), "error code 99");
    }
}
