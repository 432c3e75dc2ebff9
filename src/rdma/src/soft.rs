//! An in-process verbs provider.
//!
//! [`connect_pair`] returns two endpoints whose queue pairs are connected to each other the
//! way two reliable-connected QPs are. Data moves with a memory copy when both sides of an
//! operation are present: a send is matched with the oldest posted receive of the peer (or
//! parked until one is posted), and one-sided operations copy from or into the peer's
//! registered memory right away. Keys, ranges, access rights, and lengths are checked and
//! violations complete with the status a NIC would report.
use std::collections::VecDeque;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use interface::wc_status::{
    LOC_LEN_ERR, LOC_PROT_ERR, LOC_QP_OP_ERR, REM_ACCESS_ERR, REM_OP_ERR, RETRY_EXC_ERR,
    WR_FLUSH_ERR,
};
use interface::{
    AccessFlags, MrKeys, QpCapability, RemoteKey, WcOpcode, WcStatus, WorkCompletion,
};

use crate::verbs::{CompletionQueue, Error, ProtectionDomain, QueuePair};
use crate::wr::{RecvWr, SendWr, Sge, WrOpcode};

static NEXT_KEY: AtomicU32 = AtomicU32::new(1);

fn failed(wr_id: u64, opcode: WcOpcode, code: u32) -> WorkCompletion {
    let mut wc = WorkCompletion::new_success(wr_id, opcode, 0);
    wc.status = WcStatus::from_code(code);
    wc.vendor_err = code;
    wc
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    keys: MrKeys,
    addr: u64,
    len: usize,
    access: AccessFlags,
}

impl Registration {
    fn covers(&self, addr: u64, len: u32) -> bool {
        addr >= self.addr
            && addr
                .checked_add(len as u64)
                .map_or(false, |end| end <= self.addr + self.len as u64)
    }
}

#[derive(Debug, Default)]
pub struct SoftProtectionDomain {
    regs: spin::RwLock<Vec<Registration>>,
}

impl SoftProtectionDomain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_registrations(&self) -> usize {
        self.regs.read().len()
    }

    fn check_local(&self, sge: &Sge, write: bool) -> bool {
        self.regs.read().iter().any(|r| {
            r.keys.lkey == sge.lkey
                && r.covers(sge.addr, sge.length)
                && (!write || r.access.contains(AccessFlags::LOCAL_WRITE))
        })
    }

    fn check_remote(&self, remote: &RemoteKey, len: u32, access: AccessFlags) -> bool {
        self.regs.read().iter().any(|r| {
            r.keys.rkey == remote.rkey && r.covers(remote.addr, len) && r.access.contains(access)
        })
    }
}

impl ProtectionDomain for SoftProtectionDomain {
    unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<MrKeys, Error> {
        if addr.is_null() || len == 0 || len > u32::MAX as usize {
            return Err(Error::InvalidSge {
                addr: addr as u64,
                length: len as u32,
            });
        }
        let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        let keys = MrKeys {
            lkey: key,
            rkey: key,
        };
        self.regs.write().push(Registration {
            keys,
            addr: addr as u64,
            len,
            access,
        });
        log::debug!("registered {:p}, len: {}, keys: {:?}", addr, len, keys);
        Ok(keys)
    }

    fn deregister(&self, keys: MrKeys) {
        let mut regs = self.regs.write();
        let before = regs.len();
        regs.retain(|r| r.keys != keys);
        if regs.len() == before {
            log::warn!("deregistering unknown memory region: {:?}", keys);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QpState {
    Ready,
    Error,
}

struct Entry {
    wc: WorkCompletion,
    from_send_queue: bool,
}

struct Side {
    pd: Arc<SoftProtectionDomain>,
    state: QpState,
    recv_queue: VecDeque<RecvWr>,
    // Sends of the peer waiting for a receive to be posted here.
    inbound: VecDeque<SendWr>,
    cq: VecDeque<Entry>,
    outstanding_send: usize,
    injected_failures: usize,
}

impl Side {
    fn new(pd: Arc<SoftProtectionDomain>, cap: &QpCapability) -> Self {
        Side {
            pd,
            state: QpState::Ready,
            recv_queue: VecDeque::with_capacity(cap.max_recv_wr as usize),
            inbound: VecDeque::new(),
            cq: VecDeque::with_capacity((cap.max_send_wr + cap.max_recv_wr) as usize),
            outstanding_send: 0,
            injected_failures: 0,
        }
    }

    fn take_injected_failure(&mut self) -> Result<(), Error> {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected post failure",
            )));
        }
        Ok(())
    }
}

struct Link {
    cap: QpCapability,
    sides: [Side; 2],
}

impl Link {
    fn complete(&mut self, side: usize, wc: WorkCompletion, from_send_queue: bool) {
        self.sides[side].cq.push_back(Entry {
            wc,
            from_send_queue,
        });
    }

    fn post_send(&mut self, side: usize, wr: &SendWr) -> Result<(), Error> {
        let peer = 1 - side;
        let me = &mut self.sides[side];
        me.take_injected_failure()?;
        if me.state == QpState::Error {
            return Err(Error::QpError);
        }
        if me.outstanding_send >= self.cap.max_send_wr as usize {
            return Err(Error::SendQueueFull);
        }
        me.outstanding_send += 1;

        let opcode = wr.opcode.wc_opcode();
        if !me.pd.check_local(&wr.sge, wr.opcode == WrOpcode::RdmaRead) {
            self.complete(side, failed(wr.wr_id, opcode, LOC_PROT_ERR), true);
            return Ok(());
        }

        match wr.opcode {
            WrOpcode::Send => {
                if self.sides[peer].state == QpState::Error {
                    self.complete(side, failed(wr.wr_id, opcode, RETRY_EXC_ERR), true);
                } else {
                    let recv = self.sides[peer].recv_queue.pop_front();
                    match recv {
                        Some(recv) => self.deliver(side, wr, &recv),
                        None => self.sides[peer].inbound.push_back(*wr),
                    }
                }
            }
            WrOpcode::RdmaWrite | WrOpcode::RdmaRead => {
                let wc = match self.one_sided(peer, wr) {
                    Ok(()) => WorkCompletion::new_success(wr.wr_id, opcode, wr.sge.length),
                    Err(code) => failed(wr.wr_id, opcode, code),
                };
                self.complete(side, wc, true);
            }
        }
        Ok(())
    }

    fn one_sided(&self, peer: usize, wr: &SendWr) -> Result<(), u32> {
        let remote = wr.remote.ok_or(LOC_QP_OP_ERR)?;
        let target = &self.sides[peer];
        if target.state == QpState::Error {
            return Err(RETRY_EXC_ERR);
        }
        let access = if wr.opcode == WrOpcode::RdmaRead {
            AccessFlags::REMOTE_READ
        } else {
            AccessFlags::REMOTE_WRITE
        };
        if !target.pd.check_remote(&remote, wr.sge.length, access) {
            return Err(REM_ACCESS_ERR);
        }
        let local = wr.sge.addr as *mut u8;
        let remote = remote.addr as *mut u8;
        let len = wr.sge.length as usize;
        // SAFETY: both ranges are covered by live registrations.
        unsafe {
            if wr.opcode == WrOpcode::RdmaRead {
                ptr::copy(remote, local, len);
            } else {
                ptr::copy(local, remote, len);
            }
        }
        Ok(())
    }

    /// Matches a send of `sender` with a receive posted by its peer.
    fn deliver(&mut self, sender: usize, send: &SendWr, recv: &RecvWr) {
        let receiver = 1 - sender;
        if send.sge.length > recv.sge.length {
            self.complete(receiver, failed(recv.wr_id, WcOpcode::Recv, LOC_LEN_ERR), false);
            self.complete(sender, failed(send.wr_id, WcOpcode::Send, REM_OP_ERR), true);
            return;
        }
        if !self.sides[sender].pd.check_local(&send.sge, false) {
            self.complete(sender, failed(send.wr_id, WcOpcode::Send, LOC_PROT_ERR), true);
            self.sides[receiver].recv_queue.push_front(*recv);
            return;
        }
        // SAFETY: both SGEs were checked against their registrations.
        unsafe {
            ptr::copy(
                send.sge.addr as *const u8,
                recv.sge.addr as *mut u8,
                send.sge.length as usize,
            );
        }
        let len = send.sge.length;
        self.complete(
            receiver,
            WorkCompletion::new_success(recv.wr_id, WcOpcode::Recv, len),
            false,
        );
        self.complete(
            sender,
            WorkCompletion::new_success(send.wr_id, WcOpcode::Send, len),
            true,
        );
    }

    fn post_recv(&mut self, side: usize, wr: &RecvWr) -> Result<(), Error> {
        let me = &mut self.sides[side];
        me.take_injected_failure()?;
        if me.state == QpState::Error {
            return Err(Error::QpError);
        }
        if me.recv_queue.len() >= self.cap.max_recv_wr as usize {
            return Err(Error::RecvQueueFull);
        }
        if !me.pd.check_local(&wr.sge, true) {
            return Err(Error::InvalidSge {
                addr: wr.sge.addr,
                length: wr.sge.length,
            });
        }
        let pending = me.inbound.pop_front();
        match pending {
            Some(send) => self.deliver(1 - side, &send, wr),
            None => self.sides[side].recv_queue.push_back(*wr),
        }
        Ok(())
    }

    fn flush(&mut self, side: usize) {
        let peer = 1 - side;
        if self.sides[side].state == QpState::Error {
            return;
        }
        self.sides[side].state = QpState::Error;

        let recvs: Vec<RecvWr> = self.sides[side].recv_queue.drain(..).collect();
        for recv in recvs {
            self.complete(side, failed(recv.wr_id, WcOpcode::Recv, WR_FLUSH_ERR), false);
        }
        // our sends parked at the peer
        let ours: Vec<SendWr> = self.sides[peer].inbound.drain(..).collect();
        for send in ours {
            self.complete(side, failed(send.wr_id, WcOpcode::Send, WR_FLUSH_ERR), true);
        }
        // sends of the peer that can no longer be received
        let theirs: Vec<SendWr> = self.sides[side].inbound.drain(..).collect();
        for send in theirs {
            self.complete(peer, failed(send.wr_id, WcOpcode::Send, RETRY_EXC_ERR), true);
        }
    }

    fn poll(&mut self, side: usize, wc: &mut Vec<WorkCompletion>) -> usize {
        let me = &mut self.sides[side];
        let n = (wc.capacity() - wc.len()).min(me.cq.len());
        for entry in me.cq.drain(..n) {
            if entry.from_send_queue {
                me.outstanding_send -= 1;
            }
            wc.push(entry.wc);
        }
        n
    }
}

pub struct SoftQueuePair {
    link: Arc<spin::Mutex<Link>>,
    side: usize,
}

impl SoftQueuePair {
    /// Makes the next `n` post calls on this queue pair fail synchronously.
    pub fn inject_post_failures(&self, n: usize) {
        self.link.lock().sides[self.side].injected_failures = n;
    }

    pub fn is_error(&self) -> bool {
        self.link.lock().sides[self.side].state == QpState::Error
    }

    /// Number of send queue entries whose completion has not been polled yet.
    pub fn outstanding_sends(&self) -> usize {
        self.link.lock().sides[self.side].outstanding_send
    }
}

impl QueuePair for SoftQueuePair {
    fn cap(&self) -> QpCapability {
        self.link.lock().cap
    }

    unsafe fn post_send(&self, wr: &SendWr) -> Result<(), Error> {
        log::trace!("post_send: side {}, {:?}", self.side, wr);
        self.link.lock().post_send(self.side, wr)
    }

    unsafe fn post_recv(&self, wr: &RecvWr) -> Result<(), Error> {
        log::trace!("post_recv: side {}, {:?}", self.side, wr);
        self.link.lock().post_recv(self.side, wr)
    }

    fn flush(&self) -> Result<(), Error> {
        log::debug!("flushing queue pair, side {}", self.side);
        self.link.lock().flush(self.side);
        Ok(())
    }
}

pub struct SoftCompletionQueue {
    link: Arc<spin::Mutex<Link>>,
    side: usize,
}

impl CompletionQueue for SoftCompletionQueue {
    fn poll(&self, wc: &mut Vec<WorkCompletion>) -> Result<usize, Error> {
        if wc.capacity() == wc.len() {
            log::warn!("wc has no spare capacity, nothing will be polled");
            return Ok(0);
        }
        Ok(self.link.lock().poll(self.side, wc))
    }
}

/// One side of a connected pair.
pub struct SoftEndpoint {
    pub pd: Arc<SoftProtectionDomain>,
    pub qp: Arc<SoftQueuePair>,
    pub cq: Arc<SoftCompletionQueue>,
}

/// Creates two endpoints whose queue pairs are connected to each other.
pub fn connect_pair(cap: QpCapability) -> (SoftEndpoint, SoftEndpoint) {
    let pds = [
        Arc::new(SoftProtectionDomain::new()),
        Arc::new(SoftProtectionDomain::new()),
    ];
    let link = Arc::new(spin::Mutex::new(Link {
        cap,
        sides: [
            Side::new(Arc::clone(&pds[0]), &cap),
            Side::new(Arc::clone(&pds[1]), &cap),
        ],
    }));
    let [pd0, pd1] = pds;
    let endpoint = |pd, side| SoftEndpoint {
        pd,
        qp: Arc::new(SoftQueuePair {
            link: Arc::clone(&link),
            side,
        }),
        cq: Arc::new(SoftCompletionQueue {
            link: Arc::clone(&link),
            side,
        }),
    };
    (endpoint(pd0, 0), endpoint(pd1, 1))
}
