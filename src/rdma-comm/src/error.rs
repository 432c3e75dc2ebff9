use interface::WcStatus;
use thiserror::Error;

use crate::slot::WorkRequestType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Resolution: {0}")]
    Resolution(#[from] ResolutionError),
    #[error("Submission: {0}")]
    Submission(#[from] SubmissionError),
    #[error("Slot pool: {0}")]
    SlotPool(#[from] SlotPoolError),
    #[error("Serialization: {0}")]
    Serialization(#[from] SerializationError),
    #[error("Memory region: {0}")]
    Memory(#[from] rdma::mr::Error),
    #[error("Verbs: {0}")]
    Verbs(#[from] rdma::verbs::Error),
    #[error("Connection is broken")]
    ConnectionBroken,
    #[error("Communicator is closed")]
    Closed,
}

/// Invalid sizing or composition, reported before anything is registered.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_work_requests must be positive")]
    ZeroWorkRequests,
    #[error("max_buffer_size must be positive")]
    ZeroBufferSize,
    #[error("max_buffer_size {0} does not fit a scatter/gather entry")]
    BufferSizeTooLarge(usize),
    #[error("cq_poll_batch must be positive")]
    ZeroPollBatch,
    #[error("no work request type is configured")]
    NoWorkRequestTypes,
    #[error("{0:?} is configured more than once")]
    DuplicateType(WorkRequestType),
    #[error("{0:?} is configured without {1:?}")]
    MissingCounterpart(WorkRequestType, WorkRequestType),
    #[error("the segment layout overflows")]
    LayoutOverflow,
    #[error("region of {capacity} bytes cannot hold {required} bytes of segments")]
    RegionTooSmall { required: usize, capacity: usize },
    #[error("{required} outstanding {queue} requests exceed the queue pair capacity {available}")]
    QueueCapacity {
        queue: &'static str,
        required: usize,
        available: u32,
    },
    #[error("missing builder argument: {0}")]
    Missing(&'static str),
    #[error("{0:?} has no segments in the buffer layout")]
    NotInLayout(WorkRequestType),
    #[error("{0:?} is not executed by any SVC manager")]
    Unrouted(WorkRequestType),
}

/// A completion that cannot be matched to a submitted slot. Fatal for the connection.
#[derive(Debug, Clone, Error)]
pub enum ResolutionError {
    #[error("wr_id {0:#x} does not carry a known work request type")]
    UnknownType(u64),
    #[error("{0:?} is not configured on this connection")]
    NotConfigured(WorkRequestType),
    #[error("{ty:?} slot {id} is out of range (max {max})")]
    OutOfRange {
        ty: WorkRequestType,
        id: u32,
        max: u32,
    },
    #[error("completion opcode {opcode:?} does not match {ty:?} slot {id}")]
    OpcodeMismatch {
        ty: WorkRequestType,
        id: u32,
        opcode: interface::WcOpcode,
    },
    #[error("{ty:?} slot {id} has no operation in flight")]
    NotSubmitted { ty: WorkRequestType, id: u32 },
}

/// The queue pair rejected a descriptor. The slot stays with its holder.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("payload of {len} bytes exceeds the segment size {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("{0:?} is not executed by this SVC manager")]
    UnsupportedType(WorkRequestType),
    #[error("the slot belongs to another communicator")]
    ForeignSlot,
    #[error("no remote key is set for one-sided operations")]
    NoRemoteKey,
    #[error("{0}")]
    Verbs(#[from] rdma::verbs::Error),
}

#[derive(Debug, Error)]
pub enum SlotPoolError {
    #[error("{0:?} slots are not handed out by acquire")]
    NotAcquirable(WorkRequestType),
    #[error("{0:?} is not configured on this connection")]
    NotConfigured(WorkRequestType),
    #[error("{ty:?} slot {id} is not in use")]
    NotInUse { ty: WorkRequestType, id: u32 },
    #[error("slot pool is closed")]
    Closed,
    #[error("blocking acquire inside a completion callback would deadlock")]
    WouldDeadlock,
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("buffer of {capacity} bytes is too small, {required} bytes needed")]
    BufferTooSmall { required: usize, capacity: usize },
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
}

/// What the error callback receives.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("{ty:?} slot {id} completed with {status}")]
    Failed {
        ty: WorkRequestType,
        id: u32,
        status: WcStatus,
    },
    #[error("failed to re-arm receive slot {id}: {source}")]
    Rearm {
        id: u32,
        #[source]
        source: SubmissionError,
    },
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

impl CompletionError {
    pub fn work_request_type(&self) -> Option<WorkRequestType> {
        match self {
            Self::Failed { ty, .. } => Some(*ty),
            Self::Rearm { .. } => Some(WorkRequestType::Receive),
            Self::Resolution(ResolutionError::NotConfigured(ty))
            | Self::Resolution(ResolutionError::OutOfRange { ty, .. })
            | Self::Resolution(ResolutionError::OpcodeMismatch { ty, .. })
            | Self::Resolution(ResolutionError::NotSubmitted { ty, .. }) => Some(*ty),
            Self::Resolution(ResolutionError::UnknownType(_)) => None,
        }
    }

    pub fn slot_id(&self) -> Option<u32> {
        match self {
            Self::Failed { id, .. } | Self::Rearm { id, .. } => Some(*id),
            Self::Resolution(ResolutionError::OutOfRange { id, .. })
            | Self::Resolution(ResolutionError::OpcodeMismatch { id, .. })
            | Self::Resolution(ResolutionError::NotSubmitted { id, .. }) => Some(*id),
            Self::Resolution(_) => None,
        }
    }
}
