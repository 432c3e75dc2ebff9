use std::sync::{Arc, Mutex};
use std::time::Duration;

use interface::{wc_status, QpCapability, WcOpcode, WcStatus, WorkCompletion};
use rdma::soft;
use rdma::verbs::{CompletionQueue, Error as VerbsError};

use rdma_comm::error::{ConfigError, ResolutionError, SlotPoolError};
use rdma_comm::{CompletionError, Communicator, Error, SlotState, WorkRequestType};

mod common;
use common::{config, connected, inbox, init_log, pump, received};

#[test]
fn close_drains_and_deregisters() {
    let config = config(4, 32);
    let (a, b) = connected(&config);
    let inbox = inbox(&b.comm);
    assert_eq!(a.pd.num_registrations(), 1);

    a.comm.send_blocking(b"last words").unwrap();
    assert_eq!(a.comm.pool().in_flight(), 1);
    b.comm.progress().unwrap();
    assert_eq!(received(&inbox), 1);

    // the send completion is only polled by close
    a.comm.close().unwrap();
    assert_eq!(a.comm.pool().in_flight(), 0);
    assert_eq!(a.qp.outstanding_sends(), 0);
    assert!(a.qp.is_error());
    assert_eq!(a.pd.num_registrations(), 0);
    assert_eq!(a.comm.pool().count(WorkRequestType::Receive, SlotState::Submitted), 0);

    assert!(matches!(a.comm.send_now(b"more"), Err(Error::Closed)));
    // idempotent
    a.comm.close().unwrap();
}

#[test]
fn close_wakes_blocked_senders() {
    let config = config(1, 32);
    let (a, _b) = connected(&config);
    let comm = &a.comm;
    let held = comm.acquire_now(WorkRequestType::Send).unwrap().unwrap();

    crossbeam::thread::scope(|s| {
        let waiter = s.spawn(|_| comm.send_blocking(b"never"));
        std::thread::sleep(Duration::from_millis(50));
        comm.close().unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Closed)));
    })
    .unwrap();
    drop(held);
    assert_eq!(comm.pool().count(WorkRequestType::Send, SlotState::Free), 1);
}

#[test]
fn drop_closes_the_connection() {
    let config = config(2, 32);
    let (a, b) = connected(&config);
    let (pd, qp) = (Arc::clone(&a.pd), Arc::clone(&a.qp));
    drop(a);
    assert_eq!(pd.num_registrations(), 0);
    assert!(qp.is_error());

    // sends of the peer now fail after acceptance
    let errors = Arc::new(Mutex::new(Vec::new()));
    b.comm.on_error({
        let errors = Arc::clone(&errors);
        move |e| errors.lock().unwrap().push(e.work_request_type())
    });
    b.comm.send_blocking(b"anyone?").unwrap();
    pump(&[&b.comm], || !errors.lock().unwrap().is_empty());
    assert_eq!(errors.lock().unwrap()[0], Some(WorkRequestType::Send));
    assert_eq!(b.comm.pool().count(WorkRequestType::Send, SlotState::Free), 2);
}

#[test]
fn setup_failure_releases_the_region() {
    init_log();
    let config = config(8, 32);
    // the send queue is shallower than the send slots
    let (ep, _) = soft::connect_pair(QpCapability::with_depth(4));
    let pd = Arc::clone(&ep.pd);
    let err = Communicator::builder()
        .config(config)
        .protection_domain(ep.pd)
        .queue_pair(ep.qp)
        .completion_queue(ep.cq)
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Config(ConfigError::QueueCapacity { queue: "send", required: 8, available: 4 })
    ));
    assert_eq!(pd.num_registrations(), 0);

    let (ep, _) = soft::connect_pair(QpCapability::with_depth(8));
    let err = Communicator::builder()
        .config(common::config(8, 32))
        .protection_domain(ep.pd)
        .queue_pair(ep.qp)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::Missing(_))));
}

#[test]
fn failed_arming_releases_the_region() {
    init_log();
    let (ep, _) = soft::connect_pair(QpCapability::with_depth(4));
    let pd = Arc::clone(&ep.pd);
    ep.qp.inject_post_failures(1);
    let err = Communicator::builder()
        .config(config(4, 32))
        .protection_domain(ep.pd)
        .queue_pair(ep.qp)
        .completion_queue(ep.cq)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Submission(_)));
    assert_eq!(pd.num_registrations(), 0);
}

/// Hands out a forged completion ahead of the real ones of the same poll.
struct ForgingCq {
    inner: Arc<soft::SoftCompletionQueue>,
    forged: Mutex<Option<WorkCompletion>>,
}

impl ForgingCq {
    fn new(inner: Arc<soft::SoftCompletionQueue>, wr_id: u64) -> Arc<Self> {
        Arc::new(ForgingCq {
            inner,
            forged: Mutex::new(Some(WorkCompletion::new_success(wr_id, WcOpcode::Send, 0))),
        })
    }
}

impl CompletionQueue for ForgingCq {
    fn poll(&self, wc: &mut Vec<WorkCompletion>) -> Result<usize, VerbsError> {
        let mut n = 0;
        if let Some(forged) = self.forged.lock().unwrap().take() {
            wc.push(forged);
            n += 1;
        }
        Ok(n + self.inner.poll(wc)?)
    }
}

fn collect_errors(comm: &Communicator) -> Arc<Mutex<Vec<String>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    comm.on_error({
        let errors = Arc::clone(&errors);
        move |e: &CompletionError| errors.lock().unwrap().push(e.to_string())
    });
    errors
}

#[test]
fn unmatched_completion_breaks_the_connection() {
    init_log();
    let config = config(4, 32);
    let (ep, peer) = soft::connect_pair(QpCapability::with_depth(4));
    let cq = ForgingCq::new(ep.cq, WorkRequestType::Send.wr_id(4));
    let qp = Arc::clone(&ep.qp);
    let comm = Communicator::builder()
        .config(config.clone())
        .protection_domain(ep.pd)
        .queue_pair(ep.qp)
        .completion_queue(cq)
        .build()
        .unwrap();
    let _peer = common::build(&config, peer);
    let errors = collect_errors(&comm);

    assert_eq!(comm.progress().unwrap(), 1);
    assert!(comm.is_broken());
    assert!(qp.is_error());
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert!(matches!(comm.send_now(b"x"), Err(Error::ConnectionBroken)));
    assert!(matches!(
        comm.acquire_now(WorkRequestType::Send),
        Err(Error::ConnectionBroken)
    ));
}

#[test]
fn completions_behind_an_unmatched_one_are_discarded() {
    init_log();
    let config = config(4, 32);
    let (ep, peer) = soft::connect_pair(QpCapability::with_depth(4));
    let comm = Communicator::builder()
        .config(config.clone())
        .protection_domain(ep.pd)
        .queue_pair(ep.qp)
        .completion_queue(ForgingCq::new(ep.cq, WorkRequestType::Send.wr_id(99)))
        .build()
        .unwrap();
    let peer = common::build(&config, peer);
    let inbox = inbox(&comm);
    let errors = collect_errors(&comm);

    // lands in the same poll as the forged completion
    peer.comm.send_blocking(b"too late").unwrap();
    assert_eq!(comm.progress().unwrap(), 2);
    assert!(comm.is_broken());
    assert_eq!(received(&inbox), 0);
    assert_eq!(errors.lock().unwrap().len(), 1);
    // the delivered slot is freed, not re-armed
    assert_eq!(comm.pool().state(WorkRequestType::Receive, 0), Some(SlotState::Free));

    // flushed receives are dropped silently as well
    assert_eq!(comm.progress().unwrap(), 3);
    assert_eq!(comm.pool().count(WorkRequestType::Receive, SlotState::Submitted), 0);
    assert_eq!(received(&inbox), 0);
    assert_eq!(errors.lock().unwrap().len(), 1);
    comm.close().unwrap();
}

#[test]
fn resolution_errors_name_the_slot() {
    let wc = WorkCompletion::new_success(WorkRequestType::Receive.wr_id(1), WcOpcode::Send, 0);
    let config = config(2, 32);
    let (a, _b) = connected(&config);
    assert!(matches!(
        a.comm.pool().resolve(&wc),
        Err(ResolutionError::OpcodeMismatch { ty: WorkRequestType::Receive, id: 1, .. })
    ));
    let mut wc = wc;
    wc.status = WcStatus::from_code(wc_status::WR_FLUSH_ERR);
    // failed completions are matched by tag
    let proxy = a.comm.pool().resolve(&wc).unwrap();
    assert_eq!(proxy.id(), 1);
    // receive slots never go through acquire
    assert!(matches!(
        a.comm.acquire_now(WorkRequestType::Receive),
        Err(Error::SlotPool(SlotPoolError::NotAcquirable(_)))
    ));
    drop(proxy);
    assert_eq!(a.comm.pool().state(WorkRequestType::Receive, 1), Some(SlotState::Free));
}
