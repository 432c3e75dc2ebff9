//! Stateful verbs calls: descriptors built once per slot and re-executed.
use interface::RemoteKey;
use rdma::wr::Sge;

use crate::buf::BufferManager;
use crate::error::{ConfigError, SubmissionError};
use crate::slot::{WorkRequestProxy, WorkRequestType};

mod one_sided;
mod two_sided;

pub use one_sided::OneSidedSvcManager;
pub use two_sided::TwoSidedSvcManager;

/// Executes the pre-built descriptors of a family of work request types.
pub trait SvcManager: Send + Sync {
    fn work_request_types(&self) -> &'static [WorkRequestType];

    /// Issues the descriptor bound to `slot`, patched to the slot's length.
    ///
    /// The caller has marked the slot SUBMITTED. An error means the queue pair did not
    /// accept the descriptor.
    fn execute(&self, slot: &WorkRequestProxy<'_>) -> Result<(), SubmissionError>;

    /// Points one-sided descriptors at the peer's region. Returns false if the manager
    /// has no use for it.
    fn set_remote_key(&self, _remote: RemoteKey) -> bool {
        false
    }
}

/// The scatter/gather entry covering the whole segment of a slot.
pub fn bind_sge(buffers: &BufferManager, ty: WorkRequestType, id: u32) -> Result<Sge, ConfigError> {
    let addr = buffers
        .segment_address(ty, id)
        .ok_or(ConfigError::NotInLayout(ty))?;
    Ok(Sge::new(addr, buffers.segment_size() as u32, buffers.lkey()))
}

/// Builds one descriptor per slot of `ty`.
pub(crate) fn build_descriptors<T, F>(
    buffers: &BufferManager,
    ty: WorkRequestType,
    mut f: F,
) -> Result<Box<[T]>, ConfigError>
where
    F: FnMut(u32, Sge) -> T,
{
    (0..buffers.max_slots())
        .map(|id| bind_sge(buffers, ty, id).map(|sge| f(id, sge)))
        .collect()
}

/// Routes every slot to the manager that executes its type.
pub struct SubmissionManager {
    managers: Vec<Box<dyn SvcManager>>,
    routes: [Option<usize>; WorkRequestType::COUNT],
}

impl SubmissionManager {
    /// The first manager claiming a type executes it. Every type in `types` must be routed.
    pub fn new(
        managers: Vec<Box<dyn SvcManager>>,
        types: &[WorkRequestType],
    ) -> Result<Self, ConfigError> {
        let mut routes = [None; WorkRequestType::COUNT];
        for (index, manager) in managers.iter().enumerate() {
            for ty in manager.work_request_types() {
                routes[ty.index()].get_or_insert(index);
            }
        }
        if let Some(ty) = types.iter().find(|ty| routes[ty.index()].is_none()) {
            return Err(ConfigError::Unrouted(*ty));
        }
        Ok(SubmissionManager { managers, routes })
    }

    pub fn execute(&self, slot: &WorkRequestProxy<'_>) -> Result<(), SubmissionError> {
        let ty = slot.work_request_type();
        let index = self.routes[ty.index()].ok_or(SubmissionError::UnsupportedType(ty))?;
        self.managers[index].execute(slot)
    }

    /// Returns true if any manager took the key.
    pub fn set_remote_key(&self, remote: RemoteKey) -> bool {
        self.managers
            .iter()
            .fold(false, |taken, m| m.set_remote_key(remote) || taken)
    }
}
