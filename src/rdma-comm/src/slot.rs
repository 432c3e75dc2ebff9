//! Slots and their lifecycle.
//!
//! Every slot of a type is `FREE`, `ACQUIRED` by exactly one [`WorkRequestProxy`], or
//! `SUBMITTED` to the queue pair. Outbound slots cycle FREE -> ACQUIRED -> SUBMITTED -> FREE.
//! Inbound slots are never handed out by acquire: they cycle SUBMITTED -> ACQUIRED (while
//! the payload is delivered) -> SUBMITTED.
use std::cell::Cell;
use std::fmt;
use std::mem;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crossbeam::channel::{self, select, Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};

use interface::{WcOpcode, WorkCompletion};

use crate::buf::BufferManager;
use crate::error::{ResolutionError, SlotPoolError, SubmissionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum WorkRequestType {
    /// Outbound signaled send.
    Send = 0,
    /// Inbound receive.
    Receive = 1,
    /// Outbound signaled one-sided write.
    Write = 2,
    /// Outbound signaled one-sided read.
    Read = 3,
}

impl WorkRequestType {
    pub const COUNT: usize = 4;
    pub const ALL: [WorkRequestType; Self::COUNT] = [
        WorkRequestType::Send,
        WorkRequestType::Receive,
        WorkRequestType::Write,
        WorkRequestType::Read,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn from_index(index: u64) -> Option<Self> {
        Self::ALL.get(usize::try_from(index).ok()?).copied()
    }

    #[inline]
    pub fn is_outbound(self) -> bool {
        self != WorkRequestType::Receive
    }

    /// The opcode of a successful completion of this type.
    pub fn wc_opcode(self) -> WcOpcode {
        match self {
            WorkRequestType::Send => WcOpcode::Send,
            WorkRequestType::Receive => WcOpcode::Recv,
            WorkRequestType::Write => WcOpcode::RdmaWrite,
            WorkRequestType::Read => WcOpcode::RdmaRead,
        }
    }

    pub fn from_wc_opcode(opcode: WcOpcode) -> Option<Self> {
        match opcode {
            WcOpcode::Send => Some(WorkRequestType::Send),
            WcOpcode::Recv | WcOpcode::RecvRdmaWithImm => Some(WorkRequestType::Receive),
            WcOpcode::RdmaWrite => Some(WorkRequestType::Write),
            WcOpcode::RdmaRead => Some(WorkRequestType::Read),
            WcOpcode::Invalid => None,
        }
    }

    /// The tag carried by every descriptor of the slot: `(type << 32) | id`.
    #[inline]
    pub fn wr_id(self, id: u32) -> u64 {
        (self as u64) << 32 | id as u64
    }

    pub fn parse_wr_id(wr_id: u64) -> Result<(Self, u32), ResolutionError> {
        let ty = Self::from_index(wr_id >> 32).ok_or(ResolutionError::UnknownType(wr_id))?;
        Ok((ty, wr_id as u32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Free = 0,
    Acquired = 1,
    Submitted = 2,
}

const FREE: u8 = SlotState::Free as u8;
const ACQUIRED: u8 = SlotState::Acquired as u8;
const SUBMITTED: u8 = SlotState::Submitted as u8;

impl SlotState {
    #[inline]
    fn from_u8(state: u8) -> Self {
        match state {
            FREE => SlotState::Free,
            ACQUIRED => SlotState::Acquired,
            _ => SlotState::Submitted,
        }
    }
}

thread_local! {
    static IN_COMPLETION: Cell<bool> = Cell::new(false);
}

/// Marks the current thread as dispatching completions until dropped.
pub(crate) struct CompletionScope {
    prev: bool,
}

impl CompletionScope {
    pub(crate) fn enter() -> Self {
        let prev = IN_COMPLETION.with(|f| f.replace(true));
        CompletionScope { prev }
    }
}

impl Drop for CompletionScope {
    fn drop(&mut self) {
        IN_COMPLETION.with(|f| f.set(self.prev));
    }
}

#[inline]
fn in_completion() -> bool {
    IN_COMPLETION.with(Cell::get)
}

struct TypeSlots {
    ty: WorkRequestType,
    states: Box<[AtomicU8]>,
    // ids of FREE slots, only for outbound types
    free_tx: Sender<u32>,
    free_rx: Receiver<u32>,
}

impl TypeSlots {
    fn new(ty: WorkRequestType, max: u32) -> Self {
        let states = (0..max).map(|_| AtomicU8::new(FREE)).collect();
        let (free_tx, free_rx) = channel::bounded(max as usize);
        if ty.is_outbound() {
            for id in 0..max {
                let pushed = free_tx.try_send(id).is_ok();
                debug_assert!(pushed);
            }
        }
        TypeSlots {
            ty,
            states,
            free_tx,
            free_rx,
        }
    }

    fn push_free(&self, id: u32) {
        if self.free_tx.try_send(id).is_err() {
            tracing::error!("free list of {:?} overflows at slot {}", self.ty, id);
        }
    }
}

/// Which slots of each configured type are free or in use.
pub struct SlotPool {
    buffers: BufferManager,
    slots: [Option<TypeSlots>; WorkRequestType::COUNT],
    max: u32,
    closed: AtomicBool,
    // dropped on close, which wakes every blocked acquirer
    shutdown_tx: spin::Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPool")
            .field("buffers", &self.buffers)
            .field("max", &self.max)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SlotPool {
    /// Creates `max_slots` FREE slots for every type of the buffer layout.
    pub fn new(buffers: BufferManager) -> Self {
        let max = buffers.max_slots();
        let slots = std::array::from_fn(|i| {
            let ty = WorkRequestType::ALL[i];
            buffers
                .work_request_types()
                .contains(&ty)
                .then(|| TypeSlots::new(ty, max))
        });
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        SlotPool {
            buffers,
            slots,
            max,
            closed: AtomicBool::new(false),
            shutdown_tx: spin::Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    #[inline]
    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    #[inline]
    pub fn max_slots(&self) -> u32 {
        self.max
    }

    #[inline]
    pub fn is_configured(&self, ty: WorkRequestType) -> bool {
        self.slots[ty.index()].is_some()
    }

    /// Number of slots of `ty`.
    pub fn capacity(&self, ty: WorkRequestType) -> usize {
        self.slots[ty.index()]
            .as_ref()
            .map_or(0, |slots| slots.states.len())
    }

    pub fn state(&self, ty: WorkRequestType, id: u32) -> Option<SlotState> {
        let slots = self.slots[ty.index()].as_ref()?;
        let state = slots.states.get(id as usize)?;
        Some(SlotState::from_u8(state.load(Ordering::Acquire)))
    }

    /// Number of slots of `ty` in `state`.
    pub fn count(&self, ty: WorkRequestType, state: SlotState) -> usize {
        self.slots[ty.index()].as_ref().map_or(0, |slots| {
            slots
                .states
                .iter()
                .filter(|s| s.load(Ordering::Acquire) == state as u8)
                .count()
        })
    }

    /// Outbound slots waiting for a completion.
    pub fn in_flight(&self) -> usize {
        WorkRequestType::ALL
            .iter()
            .filter(|ty| ty.is_outbound())
            .map(|&ty| self.count(ty, SlotState::Submitted))
            .sum()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fails every blocked and future acquire with [`SlotPoolError::Closed`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown_tx.lock().take();
            tracing::debug!("slot pool closed");
        }
    }

    fn slots(&self, ty: WorkRequestType) -> Result<&TypeSlots, SlotPoolError> {
        self.slots[ty.index()]
            .as_ref()
            .ok_or(SlotPoolError::NotConfigured(ty))
    }

    fn acquirable(&self, ty: WorkRequestType) -> Result<&TypeSlots, SlotPoolError> {
        if !ty.is_outbound() {
            return Err(SlotPoolError::NotAcquirable(ty));
        }
        self.slots(ty)
    }

    /// Blocks until a slot of `ty` is FREE and takes it.
    ///
    /// Waiters are not served in FIFO order. Fails with [`SlotPoolError::WouldDeadlock`] when
    /// called from a completion callback, since only the completion path frees slots.
    pub fn acquire_blocking(
        &self,
        ty: WorkRequestType,
    ) -> Result<WorkRequestProxy<'_>, SlotPoolError> {
        if in_completion() {
            return Err(SlotPoolError::WouldDeadlock);
        }
        let slots = self.acquirable(ty)?;
        loop {
            if self.is_closed() {
                return Err(SlotPoolError::Closed);
            }
            let id = match slots.free_rx.try_recv() {
                Ok(id) => id,
                Err(_) => select! {
                    recv(slots.free_rx) -> id => id.map_err(|_| SlotPoolError::Closed)?,
                    recv(self.shutdown_rx) -> _ => return Err(SlotPoolError::Closed),
                },
            };
            if let Some(proxy) = self.claim(slots, id)? {
                return Ok(proxy);
            }
        }
    }

    /// Takes a FREE slot of `ty` if there is one. Has no effect when the type is exhausted.
    ///
    /// A slot being released concurrently is stored FREE just before its id reaches the free
    /// list, so a call racing with that release may still return `None`. Once `release`
    /// returns, the slot is visible to this call.
    pub fn acquire_now(
        &self,
        ty: WorkRequestType,
    ) -> Result<Option<WorkRequestProxy<'_>>, SlotPoolError> {
        let slots = self.acquirable(ty)?;
        loop {
            if self.is_closed() {
                return Err(SlotPoolError::Closed);
            }
            match slots.free_rx.try_recv() {
                Ok(id) => {
                    if let Some(proxy) = self.claim(slots, id)? {
                        return Ok(Some(proxy));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(SlotPoolError::Closed),
            }
        }
    }

    fn claim<'p>(
        &'p self,
        slots: &'p TypeSlots,
        id: u32,
    ) -> Result<Option<WorkRequestProxy<'p>>, SlotPoolError> {
        if self.is_closed() {
            slots.push_free(id);
            return Err(SlotPoolError::Closed);
        }
        let state = &slots.states[id as usize];
        if let Err(actual) =
            state.compare_exchange(FREE, ACQUIRED, Ordering::AcqRel, Ordering::Acquire)
        {
            tracing::error!(
                "{:?} slot {} on the free list is {:?}",
                slots.ty,
                id,
                SlotState::from_u8(actual)
            );
            return Ok(None);
        }
        Ok(self.proxy(slots, id, 0))
    }

    /// Takes a FREE inbound slot, to be armed by the caller.
    pub(crate) fn claim_idle(&self, ty: WorkRequestType, id: u32) -> Option<WorkRequestProxy<'_>> {
        let slots = self.slots[ty.index()].as_ref()?;
        slots
            .states
            .get(id as usize)?
            .compare_exchange(FREE, ACQUIRED, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.proxy(slots, id, 0)
    }

    fn proxy<'p>(
        &'p self,
        slots: &'p TypeSlots,
        id: u32,
        len: usize,
    ) -> Option<WorkRequestProxy<'p>> {
        let addr = self.buffers.segment_address(slots.ty, id)?;
        Some(WorkRequestProxy {
            pool: self,
            state: &slots.states[id as usize],
            ty: slots.ty,
            id,
            addr,
            len,
        })
    }

    /// Returns the slot held by `proxy` to FREE and wakes one waiter of its type.
    pub fn release(&self, proxy: WorkRequestProxy<'_>) -> Result<(), SlotPoolError> {
        debug_assert!(std::ptr::eq(proxy.pool, self));
        proxy.release()
    }

    /// ACQUIRED or SUBMITTED -> FREE. Releasing a FREE slot fails and changes nothing.
    pub(crate) fn release_slot(&self, ty: WorkRequestType, id: u32) -> Result<(), SlotPoolError> {
        let slots = self.slots(ty)?;
        let state = slots
            .states
            .get(id as usize)
            .ok_or(SlotPoolError::NotInUse { ty, id })?;
        let mut current = state.load(Ordering::Acquire);
        loop {
            if current == FREE {
                return Err(SlotPoolError::NotInUse { ty, id });
            }
            match state.compare_exchange_weak(current, FREE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if ty.is_outbound() {
            slots.push_free(id);
        }
        tracing::trace!("{:?} slot {} released", ty, id);
        Ok(())
    }

    /// Maps a completion back to its slot and hands the slot to the caller.
    ///
    /// The tag in `wr_id` selects the slot. A successful completion must also carry the
    /// opcode of the slot's type; a failed completion is resolved by the tag alone.
    pub fn resolve(&self, wc: &WorkCompletion) -> Result<WorkRequestProxy<'_>, ResolutionError> {
        let (ty, id) = WorkRequestType::parse_wr_id(wc.wr_id)?;
        let slots = self.slots[ty.index()]
            .as_ref()
            .ok_or(ResolutionError::NotConfigured(ty))?;
        let state = slots
            .states
            .get(id as usize)
            .ok_or(ResolutionError::OutOfRange {
                ty,
                id,
                max: self.max,
            })?;
        if wc.status.is_success() && WorkRequestType::from_wc_opcode(wc.opcode) != Some(ty) {
            return Err(ResolutionError::OpcodeMismatch {
                ty,
                id,
                opcode: wc.opcode,
            });
        }
        state
            .compare_exchange(SUBMITTED, ACQUIRED, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ResolutionError::NotSubmitted { ty, id })?;

        let len = match ty {
            WorkRequestType::Receive | WorkRequestType::Read if wc.status.is_success() => {
                (wc.byte_len as usize).min(self.buffers.segment_size())
            }
            _ => 0,
        };
        self.proxy(slots, id, len)
            .ok_or(ResolutionError::NotConfigured(ty))
    }
}

/// Exclusive handle to an ACQUIRED slot and its buffer segment.
///
/// Dropping the proxy releases the slot. Posting it hands the slot to the queue pair until
/// its completion is resolved.
pub struct WorkRequestProxy<'a> {
    pool: &'a SlotPool,
    state: &'a AtomicU8,
    ty: WorkRequestType,
    id: u32,
    addr: u64,
    len: usize,
}

impl<'a> fmt::Debug for WorkRequestProxy<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkRequestProxy")
            .field("ty", &self.ty)
            .field("id", &self.id)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .finish()
    }
}

impl<'a> Drop for WorkRequestProxy<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.release_slot(self.ty, self.id) {
            tracing::error!("failed to release {:?} slot {}: {}", self.ty, self.id, e);
        }
    }
}

impl<'a> WorkRequestProxy<'a> {
    #[inline]
    pub fn work_request_type(&self) -> WorkRequestType {
        self.ty
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn wr_id(&self) -> u64 {
        self.ty.wr_id(self.id)
    }

    /// Occupied bytes of the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.buffers.segment_size()
    }

    pub fn set_len(&mut self, len: usize) -> Result<(), SubmissionError> {
        if len > self.capacity() {
            return Err(SubmissionError::PayloadTooLarge {
                len,
                max: self.capacity(),
            });
        }
        self.len = len;
        Ok(())
    }

    /// The whole segment.
    #[inline]
    pub fn buffer(&self) -> &[u8] {
        // SAFETY: the segment lies inside the registered region and belongs to this slot,
        // which this proxy holds exclusively.
        unsafe { slice::from_raw_parts(self.addr as *const u8, self.capacity()) }
    }

    #[inline]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `buffer`.
        unsafe { slice::from_raw_parts_mut(self.addr as *mut u8, self.capacity()) }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buffer()[..self.len]
    }

    /// Copies `bytes` to the start of the buffer and sets the length.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<(), SubmissionError> {
        self.set_len(bytes.len())?;
        self.buffer_mut()[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn release(self) -> Result<(), SlotPoolError> {
        let (pool, ty, id) = (self.pool, self.ty, self.id);
        mem::forget(self);
        pool.release_slot(ty, id)
    }

    #[inline]
    pub(crate) fn pool(&self) -> &'a SlotPool {
        self.pool
    }

    /// Marks the slot SUBMITTED and runs `exec`. On failure the slot goes back to ACQUIRED
    /// and the proxy is returned with the error.
    pub(crate) fn submit_with<E>(
        self,
        exec: impl FnOnce(&Self) -> Result<(), E>,
    ) -> Result<(), (Self, E)> {
        // The completion may be resolved by another thread before `exec` returns.
        self.state.store(SUBMITTED, Ordering::Release);
        match exec(&self) {
            Ok(()) => {
                mem::forget(self);
                Ok(())
            }
            Err(e) => {
                self.state.store(ACQUIRED, Ordering::Release);
                Err((self, e))
            }
        }
    }
}
