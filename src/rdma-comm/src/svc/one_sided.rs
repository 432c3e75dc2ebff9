use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use interface::RemoteKey;
use rdma::verbs::QueuePair;
use rdma::wr::SendWr;

use super::{build_descriptors, SvcManager};
use crate::buf::BufferManager;
use crate::error::{ConfigError, SubmissionError};
use crate::slot::{WorkRequestProxy, WorkRequestType};

struct Descriptor {
    wr: SendWr,
    // offset of the peer's segment in its region
    remote_offset: u64,
}

/// Signaled RDMA writes and reads.
///
/// Slot `id` of a type targets the peer's segment of the same type and id. Until the peer's
/// region is known every execute fails with [`SubmissionError::NoRemoteKey`]. Either type may
/// be left out of the layout.
pub struct OneSidedSvcManager {
    qp: Arc<dyn QueuePair>,
    writes: Box<[spin::Mutex<Descriptor>]>,
    reads: Box<[spin::Mutex<Descriptor>]>,
    connected: AtomicBool,
}

impl OneSidedSvcManager {
    pub fn new(
        buffers: &BufferManager,
        qp: Arc<dyn QueuePair>,
        remote: Option<RemoteKey>,
    ) -> Result<Self, ConfigError> {
        let unset = RemoteKey { rkey: 0, addr: 0 };
        let build = |ty: WorkRequestType| -> Result<Box<[spin::Mutex<Descriptor>]>, ConfigError> {
            if !buffers.work_request_types().contains(&ty) {
                return Ok(Box::default());
            }
            build_descriptors(buffers, ty, |id, sge| {
                let wr_id = ty.wr_id(id);
                let wr = match ty {
                    WorkRequestType::Read => SendWr::read(wr_id, sge, unset),
                    _ => SendWr::write(wr_id, sge, unset),
                };
                let remote_offset = buffers.segment_offset(ty, id).unwrap_or_default();
                spin::Mutex::new(Descriptor { wr, remote_offset })
            })
        };
        let manager = OneSidedSvcManager {
            qp,
            writes: build(WorkRequestType::Write)?,
            reads: build(WorkRequestType::Read)?,
            connected: AtomicBool::new(false),
        };
        if let Some(remote) = remote {
            manager.set_remote_key(remote);
        }
        Ok(manager)
    }

    fn descriptors(&self, ty: WorkRequestType) -> Option<&[spin::Mutex<Descriptor>]> {
        match ty {
            WorkRequestType::Write => Some(&self.writes[..]),
            WorkRequestType::Read => Some(&self.reads[..]),
            _ => None,
        }
    }
}

impl SvcManager for OneSidedSvcManager {
    fn work_request_types(&self) -> &'static [WorkRequestType] {
        &[WorkRequestType::Write, WorkRequestType::Read]
    }

    fn execute(&self, slot: &WorkRequestProxy<'_>) -> Result<(), SubmissionError> {
        let ty = slot.work_request_type();
        let descriptors = self
            .descriptors(ty)
            .ok_or(SubmissionError::UnsupportedType(ty))?;
        if !self.connected.load(Ordering::Acquire) {
            return Err(SubmissionError::NoRemoteKey);
        }
        let mut desc = descriptors
            .get(slot.id() as usize)
            .ok_or(SubmissionError::ForeignSlot)?
            .lock();
        desc.wr.sge.length = slot.len() as u32;
        tracing::trace!("post {:?}: slot {}, len {}", ty, slot.id(), slot.len());
        // SAFETY: the local segment belongs to a slot marked SUBMITTED.
        unsafe { self.qp.post_send(&desc.wr)? };
        Ok(())
    }

    fn set_remote_key(&self, remote: RemoteKey) -> bool {
        for desc in self.writes.iter().chain(self.reads.iter()) {
            let mut desc = desc.lock();
            desc.wr.remote = Some(RemoteKey {
                rkey: remote.rkey,
                addr: remote.addr + desc.remote_offset,
            });
        }
        self.connected.store(true, Ordering::Release);
        tracing::debug!("one-sided descriptors target {:#x}, rkey {}", remote.addr, remote.rkey);
        true
    }
}
