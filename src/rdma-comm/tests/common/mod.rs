#![allow(dead_code)]
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use interface::QpCapability;
use rdma::soft::{self, SoftEndpoint, SoftProtectionDomain, SoftQueuePair};
use rdma_comm::{Communicator, CommunicatorConfig, WorkRequestType};

pub fn init_log() {
    let _ = rdma_comm::logging::init_log("debug", false);
}

pub fn config(max_work_requests: u32, max_buffer_size: usize) -> CommunicatorConfig {
    CommunicatorConfig {
        max_work_requests,
        max_buffer_size,
        drain_timeout_ms: 200,
        ..Default::default()
    }
}

/// One side of a connected pair, with the provider handles tests poke at.
pub struct Side {
    pub comm: Communicator,
    pub pd: Arc<SoftProtectionDomain>,
    pub qp: Arc<SoftQueuePair>,
}

pub fn build(config: &CommunicatorConfig, ep: SoftEndpoint) -> Side {
    let (pd, qp) = (Arc::clone(&ep.pd), Arc::clone(&ep.qp));
    let comm = Communicator::builder()
        .config(config.clone())
        .protection_domain(ep.pd)
        .queue_pair(ep.qp)
        .completion_queue(ep.cq)
        .build()
        .unwrap();
    Side { comm, pd, qp }
}

pub fn connected(config: &CommunicatorConfig) -> (Side, Side) {
    init_log();
    let outbound = config
        .work_request_types
        .iter()
        .filter(|ty| ty.is_outbound())
        .count() as u32;
    let depth = config.max_work_requests * outbound.max(1);
    let (a, b) = soft::connect_pair(QpCapability::with_depth(depth));
    (build(config, a), build(config, b))
}

/// Drives the completion path of `comms` until `done` holds. Panics after 5 seconds.
pub fn pump(comms: &[&Communicator], done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out");
        for comm in comms {
            comm.progress().unwrap();
        }
    }
}

pub type Inbox = Arc<Mutex<Vec<(WorkRequestType, Vec<u8>)>>>;

/// Records everything delivered to the receive handler of `comm`.
pub fn inbox(comm: &Communicator) -> Inbox {
    let inbox = Inbox::default();
    comm.on_receive({
        let inbox = Arc::clone(&inbox);
        move |ty, bytes| inbox.lock().unwrap().push((ty, bytes.to_vec()))
    });
    inbox
}

pub fn received(inbox: &Inbox) -> usize {
    inbox.lock().unwrap().len()
}
