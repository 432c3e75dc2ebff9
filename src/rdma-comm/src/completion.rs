use std::sync::Arc;

use interface::{wc_status, WorkCompletion};

use crate::error::{CompletionError, ResolutionError};
use crate::slot::{CompletionScope, SlotPool, WorkRequestProxy, WorkRequestType};
use crate::svc::SubmissionManager;

/// Receives the payload of a receive completion, or the bytes fetched by a read.
pub type ReceiveHandler = dyn Fn(WorkRequestType, &[u8]) + Send + Sync;
/// Receives failed completions and connection-fatal resolution errors.
pub type ErrorHandler = dyn Fn(&CompletionError) + Send + Sync;

#[derive(Default)]
pub(crate) struct Callbacks {
    on_receive: spin::RwLock<Option<Arc<ReceiveHandler>>>,
    on_error: spin::RwLock<Option<Arc<ErrorHandler>>>,
}

impl Callbacks {
    pub(crate) fn set_receive(&self, handler: Arc<ReceiveHandler>) {
        *self.on_receive.write() = Some(handler);
    }

    pub(crate) fn set_error(&self, handler: Arc<ErrorHandler>) {
        *self.on_error.write() = Some(handler);
    }

    fn receive(&self, ty: WorkRequestType, bytes: &[u8]) {
        // cloned so that a handler may replace itself
        let handler = self.on_receive.read().clone();
        match handler {
            Some(handler) => handler(ty, bytes),
            None => tracing::warn!(
                "no receive handler, dropping {} bytes of {:?}",
                bytes.len(),
                ty
            ),
        }
    }

    pub(crate) fn error(&self, err: &CompletionError) {
        let handler = self.on_error.read().clone();
        match handler {
            Some(handler) => handler(err),
            None => tracing::warn!("unhandled completion error: {}", err),
        }
    }
}

/// Drives the post-completion action of every polled completion.
///
/// Outbound slots go back to FREE, waking a blocked acquirer. Inbound slots deliver their
/// payload and are re-armed. Reads deliver the fetched bytes before their slot is freed.
/// Callbacks run on the polling thread, in completion order.
pub struct CompletionHandler<'a> {
    pool: &'a SlotPool,
    svc: &'a SubmissionManager,
    callbacks: &'a Callbacks,
    closing: bool,
}

impl<'a> CompletionHandler<'a> {
    pub(crate) fn new(
        pool: &'a SlotPool,
        svc: &'a SubmissionManager,
        callbacks: &'a Callbacks,
        closing: bool,
    ) -> Self {
        CompletionHandler {
            pool,
            svc,
            callbacks,
            closing,
        }
    }

    /// Returns the resolution error of a completion that matches no submitted slot. The
    /// caller is expected to drop the connection.
    pub fn handle(&self, wc: &WorkCompletion) -> Result<(), ResolutionError> {
        let _scope = CompletionScope::enter();
        let slot = self.pool.resolve(wc)?;
        let (ty, id) = (slot.work_request_type(), slot.id());

        if !wc.status.is_success() {
            if ty.is_outbound() {
                drop(slot);
            } else {
                self.rearm(slot);
            }
            if self.closing && wc.status.code() == wc_status::WR_FLUSH_ERR {
                tracing::trace!("{:?} slot {} flushed", ty, id);
                return Ok(());
            }
            tracing::warn!("{:?} slot {} completed with {}", ty, id, wc.status);
            self.callbacks.error(&CompletionError::Failed {
                ty,
                id,
                status: wc.status,
            });
            return Ok(());
        }

        tracing::trace!("{:?} slot {} completed, {} bytes", ty, id, wc.byte_len);
        match ty {
            WorkRequestType::Send | WorkRequestType::Write => drop(slot),
            WorkRequestType::Read => {
                self.callbacks.receive(ty, slot.payload());
                drop(slot);
            }
            WorkRequestType::Receive => {
                self.callbacks.receive(ty, slot.payload());
                self.rearm(slot);
            }
        }
        Ok(())
    }

    /// Frees the slot of a completion on a broken connection. Nothing is delivered and
    /// nothing is re-armed.
    pub fn discard(&self, wc: &WorkCompletion) {
        match self.pool.resolve(wc) {
            Ok(slot) => {
                tracing::trace!(
                    "{:?} slot {} discarded",
                    slot.work_request_type(),
                    slot.id()
                );
                drop(slot);
            }
            Err(e) => tracing::trace!("discarded unmatched completion: {}", e),
        }
    }

    fn rearm(&self, slot: WorkRequestProxy<'a>) {
        if self.closing {
            return;
        }
        let id = slot.id();
        if let Err((slot, e)) = slot.submit_with(|s| self.svc.execute(s)) {
            tracing::error!("failed to re-arm receive slot {}: {}", id, e);
            drop(slot);
            self.callbacks.error(&CompletionError::Rearm { id, source: e });
        }
    }
}
