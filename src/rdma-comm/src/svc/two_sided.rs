use std::sync::Arc;

use rdma::verbs::QueuePair;
use rdma::wr::{RecvWr, SendWr};

use super::{build_descriptors, SvcManager};
use crate::buf::BufferManager;
use crate::error::{ConfigError, SubmissionError};
use crate::slot::{WorkRequestProxy, WorkRequestType};

/// Signaled sends and receives.
pub struct TwoSidedSvcManager {
    qp: Arc<dyn QueuePair>,
    sends: Box<[spin::Mutex<SendWr>]>,
    recvs: Box<[RecvWr]>,
}

impl TwoSidedSvcManager {
    pub fn new(buffers: &BufferManager, qp: Arc<dyn QueuePair>) -> Result<Self, ConfigError> {
        let sends = build_descriptors(buffers, WorkRequestType::Send, |id, sge| {
            spin::Mutex::new(SendWr::send(WorkRequestType::Send.wr_id(id), sge))
        })?;
        let recvs = build_descriptors(buffers, WorkRequestType::Receive, |id, sge| {
            RecvWr::new(WorkRequestType::Receive.wr_id(id), sge)
        })?;
        Ok(TwoSidedSvcManager { qp, sends, recvs })
    }
}

impl SvcManager for TwoSidedSvcManager {
    fn work_request_types(&self) -> &'static [WorkRequestType] {
        &[WorkRequestType::Send, WorkRequestType::Receive]
    }

    fn execute(&self, slot: &WorkRequestProxy<'_>) -> Result<(), SubmissionError> {
        let id = slot.id() as usize;
        match slot.work_request_type() {
            WorkRequestType::Send => {
                let mut wr = self
                    .sends
                    .get(id)
                    .ok_or(SubmissionError::ForeignSlot)?
                    .lock();
                wr.sge.length = slot.len() as u32;
                tracing::trace!("post send: slot {}, len {}", id, slot.len());
                // SAFETY: the segment belongs to a slot marked SUBMITTED and nobody else
                // touches it until the completion is resolved.
                unsafe { self.qp.post_send(&wr)? };
            }
            WorkRequestType::Receive => {
                let wr = self.recvs.get(id).ok_or(SubmissionError::ForeignSlot)?;
                tracing::trace!("post recv: slot {}", id);
                // SAFETY: see above.
                unsafe { self.qp.post_recv(wr)? };
            }
            ty => return Err(SubmissionError::UnsupportedType(ty)),
        }
        Ok(())
    }
}
