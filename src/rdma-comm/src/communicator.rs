use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::Backoff;

use interface::{QpCapability, RemoteKey, WorkCompletion};
use rdma::verbs::{CompletionQueue, ProtectionDomain, QueuePair};

use crate::buf::BufferManager;
use crate::completion::{Callbacks, CompletionHandler, ErrorHandler, ReceiveHandler};
use crate::config::CommunicatorConfig;
use crate::error::{
    CompletionError, ConfigError, Error, ResolutionError, Result, SubmissionError,
};
use crate::slot::{SlotPool, WorkRequestProxy, WorkRequestType};
use crate::svc::{OneSidedSvcManager, SubmissionManager, SvcManager, TwoSidedSvcManager};

/// Builds an extra SVC manager once the region is registered. Managers added this way take
/// precedence over the built-in ones for the types they claim.
pub type SvcFactory = Box<
    dyn FnOnce(
        &BufferManager,
        Arc<dyn QueuePair>,
    ) -> std::result::Result<Box<dyn SvcManager>, ConfigError>,
>;

/// A post rejected before or by the queue pair. The slot stays ACQUIRED in `proxy`.
#[derive(Debug)]
pub struct PostError<'a> {
    proxy: WorkRequestProxy<'a>,
    error: Error,
}

impl<'a> PostError<'a> {
    fn new(proxy: WorkRequestProxy<'a>, error: Error) -> Self {
        PostError { proxy, error }
    }

    #[inline]
    pub fn proxy(&self) -> &WorkRequestProxy<'a> {
        &self.proxy
    }

    #[inline]
    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn into_proxy(self) -> WorkRequestProxy<'a> {
        self.proxy
    }

    /// Releases the slot and returns the error.
    pub fn into_error(self) -> Error {
        self.error
    }

    pub fn into_parts(self) -> (WorkRequestProxy<'a>, Error) {
        (self.proxy, self.error)
    }
}

impl<'a> fmt::Display for PostError<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to post {:?} slot {}: {}",
            self.proxy.work_request_type(),
            self.proxy.id(),
            self.error
        )
    }
}

impl<'a> std::error::Error for PostError<'a> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// The endpoint of one connection.
///
/// Owns the registered region, the slot pool, and the descriptors bound to it. Any number
/// of threads may send; completions are dispatched by whoever calls [`Self::progress`], one
/// caller at a time.
pub struct Communicator {
    config: CommunicatorConfig,
    qp: Arc<dyn QueuePair>,
    cq: Arc<dyn CompletionQueue>,
    pool: SlotPool,
    svc: SubmissionManager,
    callbacks: Callbacks,
    // also serializes consumers
    wcs: spin::Mutex<Vec<WorkCompletion>>,
    broken: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("pool", &self.pool)
            .field("broken", &self.is_broken())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("failed to close communicator: {}", e);
        }
    }
}

impl Communicator {
    pub fn builder() -> CommunicatorBuilder {
        CommunicatorBuilder::default()
    }

    #[inline]
    pub fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    #[inline]
    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    /// The registered region as the peer needs it for one-sided operations.
    #[inline]
    pub fn local_key(&self) -> RemoteKey {
        self.pool.buffers().registered_region()
    }

    /// Points one-sided operations at the peer's region.
    pub fn set_remote_key(&self, remote: RemoteKey) -> Result<()> {
        if self.svc.set_remote_key(remote) {
            Ok(())
        } else {
            Err(ConfigError::Unrouted(WorkRequestType::Write).into())
        }
    }

    pub fn on_receive<F>(&self, handler: F)
    where
        F: Fn(WorkRequestType, &[u8]) + Send + Sync + 'static,
    {
        self.callbacks.set_receive(Arc::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&CompletionError) + Send + Sync + 'static,
    {
        self.callbacks.set_error(Arc::new(handler));
    }

    #[inline]
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else if self.is_broken() {
            Err(Error::ConnectionBroken)
        } else {
            Ok(())
        }
    }

    fn check_payload(&self, len: usize) -> Result<()> {
        let max = self.pool.buffers().segment_size();
        if len > max {
            return Err(SubmissionError::PayloadTooLarge { len, max }.into());
        }
        Ok(())
    }

    pub fn acquire_blocking(&self, ty: WorkRequestType) -> Result<WorkRequestProxy<'_>> {
        self.check_usable()?;
        self.pool.acquire_blocking(ty).map_err(|e| self.map_pool_error(e))
    }

    pub fn acquire_now(&self, ty: WorkRequestType) -> Result<Option<WorkRequestProxy<'_>>> {
        self.check_usable()?;
        self.pool.acquire_now(ty).map_err(|e| self.map_pool_error(e))
    }

    // a pool closed underneath a waiter is reported as the reason it was closed
    fn map_pool_error(&self, e: crate::error::SlotPoolError) -> Error {
        match self.check_usable() {
            Err(reason) => reason,
            Ok(()) => e.into(),
        }
    }

    pub fn release(&self, proxy: WorkRequestProxy<'_>) -> Result<()> {
        Ok(self.pool.release(proxy)?)
    }

    /// Hands the slot to the queue pair.
    ///
    /// On failure the slot is still ACQUIRED and comes back inside the error.
    pub fn post<'a>(
        &'a self,
        proxy: WorkRequestProxy<'a>,
    ) -> std::result::Result<(), PostError<'a>> {
        if !std::ptr::eq(proxy.pool(), &self.pool) {
            return Err(PostError::new(proxy, SubmissionError::ForeignSlot.into()));
        }
        if let Err(e) = self.check_usable() {
            return Err(PostError::new(proxy, e));
        }
        proxy
            .submit_with(|slot| self.svc.execute(slot))
            .map_err(|(proxy, e)| {
                tracing::warn!(
                    "failed to post {:?} slot {}: {}",
                    proxy.work_request_type(),
                    proxy.id(),
                    e
                );
                PostError::new(proxy, e.into())
            })
    }

    fn post_blocking<F>(&self, ty: WorkRequestType, len: usize, fill: F) -> Result<()>
    where
        F: FnOnce(&mut WorkRequestProxy<'_>) -> std::result::Result<(), SubmissionError>,
    {
        self.check_payload(len)?;
        let mut proxy = self.acquire_blocking(ty)?;
        fill(&mut proxy)?;
        self.post(proxy).map_err(PostError::into_error)
    }

    fn post_now<F>(&self, ty: WorkRequestType, len: usize, fill: F) -> Result<bool>
    where
        F: FnOnce(&mut WorkRequestProxy<'_>) -> std::result::Result<(), SubmissionError>,
    {
        self.check_payload(len)?;
        match self.acquire_now(ty)? {
            Some(mut proxy) => {
                fill(&mut proxy)?;
                self.post(proxy).map_err(PostError::into_error)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Sends `bytes`, waiting for a free send slot.
    pub fn send_blocking(&self, bytes: &[u8]) -> Result<()> {
        self.post_blocking(WorkRequestType::Send, bytes.len(), |p| p.write_payload(bytes))
    }

    /// Sends `bytes` if a send slot is free. Returns false otherwise.
    pub fn send_now(&self, bytes: &[u8]) -> Result<bool> {
        self.post_now(WorkRequestType::Send, bytes.len(), |p| p.write_payload(bytes))
    }

    /// Writes `bytes` into the peer's segment of the write slot used.
    pub fn write_blocking(&self, bytes: &[u8]) -> Result<()> {
        self.post_blocking(WorkRequestType::Write, bytes.len(), |p| p.write_payload(bytes))
    }

    pub fn write_now(&self, bytes: &[u8]) -> Result<bool> {
        self.post_now(WorkRequestType::Write, bytes.len(), |p| p.write_payload(bytes))
    }

    /// Reads `len` bytes from the peer's segment of the read slot used. The bytes are
    /// delivered to the receive handler.
    pub fn read_blocking(&self, len: usize) -> Result<()> {
        self.post_blocking(WorkRequestType::Read, len, |p| p.set_len(len))
    }

    pub fn read_now(&self, len: usize) -> Result<bool> {
        self.post_now(WorkRequestType::Read, len, |p| p.set_len(len))
    }

    /// Polls one batch of completions and dispatches them in order.
    ///
    /// Returns the number of completions polled. Returns 0 right away if another thread is
    /// dispatching. Once the connection is broken, completions only free their slots, including
    /// the ones polled in the same batch after the completion that broke it.
    pub fn progress(&self) -> Result<usize> {
        let mut wcs = match self.wcs.try_lock() {
            Some(wcs) => wcs,
            None => return Ok(0),
        };
        wcs.clear();
        let n = self.cq.poll(&mut wcs)?;
        if n == 0 {
            return Ok(0);
        }

        let mut broken = self.is_broken();
        let handler =
            CompletionHandler::new(&self.pool, &self.svc, &self.callbacks, self.is_closed());
        for wc in wcs.iter() {
            if broken {
                handler.discard(wc);
            } else if let Err(e) = handler.handle(wc) {
                self.fail(e);
                broken = true;
            }
        }
        Ok(n)
    }

    fn fail(&self, e: ResolutionError) {
        tracing::error!("unmatched completion, dropping the connection: {}", e);
        if !self.broken.swap(true, Ordering::AcqRel) {
            self.pool.close();
            if let Err(e) = self.qp.flush() {
                tracing::error!("failed to flush queue pair: {}", e);
            }
        }
        self.callbacks.error(&CompletionError::Resolution(e));
    }

    /// Tears the connection down.
    ///
    /// Blocked acquirers fail with [`crate::error::SlotPoolError::Closed`]. Outbound
    /// operations in flight get `drain_timeout_ms` to complete, then the queue pair is
    /// flushed and the region deregistered. Calling it again does nothing.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!("closing communicator, {} operations in flight", self.pool.in_flight());
        self.pool.close();

        let deadline = Instant::now() + self.config.drain_timeout();
        let backoff = Backoff::new();
        while self.pool.in_flight() > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "{} operations still in flight after {:?}",
                    self.pool.in_flight(),
                    self.config.drain_timeout()
                );
                break;
            }
            match self.progress() {
                Ok(0) => backoff.snooze(),
                Ok(_) => backoff.reset(),
                Err(e) => {
                    tracing::warn!("failed to drain completions: {}", e);
                    break;
                }
            }
        }

        let flushed = self.qp.flush();
        loop {
            match self.progress() {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("failed to poll flushed completions: {}", e);
                    break;
                }
            }
        }
        self.pool.buffers().deregister();
        flushed?;
        Ok(())
    }

    fn arm_receives(&self) -> Result<()> {
        if !self.pool.is_configured(WorkRequestType::Receive) {
            return Ok(());
        }
        for id in 0..self.pool.max_slots() {
            let slot = match self.pool.claim_idle(WorkRequestType::Receive, id) {
                Some(slot) => slot,
                None => continue,
            };
            slot.submit_with(|s| self.svc.execute(s)).map_err(|(_, e)| e)?;
        }
        tracing::debug!("armed {} receive slots", self.pool.max_slots());
        Ok(())
    }
}

/// Collects the collaborators of a [`Communicator`].
#[derive(Default)]
pub struct CommunicatorBuilder {
    config: CommunicatorConfig,
    pd: Option<Arc<dyn ProtectionDomain>>,
    qp: Option<Arc<dyn QueuePair>>,
    cq: Option<Arc<dyn CompletionQueue>>,
    remote_key: Option<RemoteKey>,
    svc_factories: Vec<SvcFactory>,
    on_receive: Option<Arc<ReceiveHandler>>,
    on_error: Option<Arc<ErrorHandler>>,
}

impl CommunicatorBuilder {
    pub fn config(mut self, config: CommunicatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn protection_domain(mut self, pd: Arc<dyn ProtectionDomain>) -> Self {
        self.pd = Some(pd);
        self
    }

    /// A queue pair already connected to the peer.
    pub fn queue_pair(mut self, qp: Arc<dyn QueuePair>) -> Self {
        self.qp = Some(qp);
        self
    }

    /// The completion queue both queues of the queue pair report to.
    pub fn completion_queue(mut self, cq: Arc<dyn CompletionQueue>) -> Self {
        self.cq = Some(cq);
        self
    }

    pub fn remote_key(mut self, remote: RemoteKey) -> Self {
        self.remote_key = Some(remote);
        self
    }

    pub fn svc_manager<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(
                &BufferManager,
                Arc<dyn QueuePair>,
            ) -> std::result::Result<Box<dyn SvcManager>, ConfigError>
            + 'static,
    {
        self.svc_factories.push(Box::new(factory));
        self
    }

    pub fn on_receive<F>(mut self, handler: F) -> Self
    where
        F: Fn(WorkRequestType, &[u8]) + Send + Sync + 'static,
    {
        self.on_receive = Some(Arc::new(handler));
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CompletionError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    fn check_capacity(config: &CommunicatorConfig, cap: QpCapability) -> Result<()> {
        let max = config.max_work_requests as usize;
        let outbound = config
            .work_request_types
            .iter()
            .filter(|ty| ty.is_outbound())
            .count();
        if outbound * max > cap.max_send_wr as usize {
            return Err(ConfigError::QueueCapacity {
                queue: "send",
                required: outbound * max,
                available: cap.max_send_wr,
            }
            .into());
        }
        if config.has_type(WorkRequestType::Receive) && max > cap.max_recv_wr as usize {
            return Err(ConfigError::QueueCapacity {
                queue: "receive",
                required: max,
                available: cap.max_recv_wr,
            }
            .into());
        }
        Ok(())
    }

    /// Registers the region, builds every descriptor, and pre-posts the receive slots.
    ///
    /// Everything set up before a failure is torn down again.
    pub fn build(self) -> Result<Communicator> {
        let config = self.config;
        config.validate()?;
        let pd = self.pd.ok_or(ConfigError::Missing("protection domain"))?;
        let qp = self.qp.ok_or(ConfigError::Missing("queue pair"))?;
        let cq = self.cq.ok_or(ConfigError::Missing("completion queue"))?;
        Self::check_capacity(&config, qp.cap())?;

        let buffers = BufferManager::new(&config, pd)?;
        let mut managers = Vec::with_capacity(self.svc_factories.len() + 2);
        for factory in self.svc_factories {
            managers.push(factory(&buffers, Arc::clone(&qp))?);
        }
        if config.has_type(WorkRequestType::Send) {
            let manager = TwoSidedSvcManager::new(&buffers, Arc::clone(&qp))?;
            managers.push(Box::new(manager) as Box<dyn SvcManager>);
        }
        if config.has_type(WorkRequestType::Write) || config.has_type(WorkRequestType::Read) {
            let manager = OneSidedSvcManager::new(&buffers, Arc::clone(&qp), self.remote_key)?;
            managers.push(Box::new(manager));
        }
        let svc = SubmissionManager::new(managers, &config.work_request_types)?;

        let comm = Communicator {
            wcs: spin::Mutex::new(Vec::with_capacity(config.cq_poll_batch)),
            config,
            qp,
            cq,
            pool: SlotPool::new(buffers),
            svc,
            callbacks: Callbacks::default(),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        if let Some(handler) = self.on_receive {
            comm.callbacks.set_receive(handler);
        }
        if let Some(handler) = self.on_error {
            comm.callbacks.set_error(handler);
        }
        comm.arm_receives()?;
        tracing::info!(
            "communicator ready: {} slots of {:?}, {} bytes each",
            comm.config.max_work_requests,
            comm.config.work_request_types,
            comm.config.max_buffer_size
        );
        Ok(comm)
    }
}
