use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use interface::{wc_status, QpCapability};
use rdma::soft;

use rdma_comm::error::{SlotPoolError, SubmissionError};
use rdma_comm::{CompletionError, Error, SlotState, WorkRequestType};

mod common;
use common::{build, config, connected, inbox, init_log, pump, received};

#[test]
fn payloads_arrive_unchanged() {
    let config = config(8, 64);
    let (a, b) = connected(&config);
    let inbox = inbox(&b.comm);

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut sent = Vec::new();
    for _ in 0..100 {
        let len = rng.gen_range(0..=64usize);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        a.comm.send_blocking(&payload).unwrap();
        sent.push(payload);
        // keep the send slots flowing
        a.comm.progress().unwrap();
        b.comm.progress().unwrap();
    }
    pump(&[&a.comm, &b.comm], || received(&inbox) == sent.len());

    let inbox = inbox.lock().unwrap();
    for ((ty, bytes), payload) in inbox.iter().zip(&sent) {
        assert_eq!(*ty, WorkRequestType::Receive);
        assert_eq!(bytes, payload);
    }
}

#[test]
fn oversized_payload_is_rejected() {
    let config = config(4, 16);
    let (a, _b) = connected(&config);
    assert!(matches!(
        a.comm.send_now(&[0u8; 17]),
        Err(Error::Submission(SubmissionError::PayloadTooLarge { len: 17, max: 16 }))
    ));
    assert_eq!(a.comm.pool().count(WorkRequestType::Send, SlotState::Free), 4);
}

#[test]
fn receive_slots_are_rearmed() {
    let config = config(2, 32);
    let (a, b) = connected(&config);
    let inbox = inbox(&b.comm);
    assert_eq!(b.comm.pool().count(WorkRequestType::Receive, SlotState::Submitted), 2);

    for i in 0..10u8 {
        a.comm.send_blocking(&[i; 4]).unwrap();
        pump(&[&a.comm, &b.comm], || received(&inbox) == i as usize + 1);
    }
    let inbox = inbox.lock().unwrap();
    for (i, (_, bytes)) in inbox.iter().enumerate() {
        assert_eq!(bytes, &[i as u8; 4]);
    }
    assert_eq!(b.comm.pool().count(WorkRequestType::Receive, SlotState::Submitted), 2);
}

#[test]
fn failed_receive_is_reported_and_rearmed() {
    init_log();
    let (ea, eb) = soft::connect_pair(QpCapability::with_depth(4));
    let a = build(&config(4, 64), ea);
    // segments too small for what the peer sends
    let b = build(&config(4, 16), eb);
    let inbox = inbox(&b.comm);
    let errors = Arc::new(Mutex::new(Vec::new()));
    b.comm.on_error({
        let errors = Arc::clone(&errors);
        move |e: &CompletionError| {
            if let CompletionError::Failed { ty, status, .. } = e {
                errors.lock().unwrap().push((*ty, status.code()));
            }
        }
    });

    a.comm.send_blocking(&[7u8; 32]).unwrap();
    pump(&[&a.comm, &b.comm], || !errors.lock().unwrap().is_empty());
    assert_eq!(
        errors.lock().unwrap()[0],
        (WorkRequestType::Receive, wc_status::LOC_LEN_ERR)
    );
    assert_eq!(received(&inbox), 0);
    assert_eq!(b.comm.pool().count(WorkRequestType::Receive, SlotState::Submitted), 4);

    // the connection keeps working for payloads that fit
    a.comm.send_blocking(b"fits").unwrap();
    pump(&[&a.comm, &b.comm], || received(&inbox) == 1);
    assert_eq!(inbox.lock().unwrap()[0].1, b"fits");
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn failed_post_keeps_slot_acquired() {
    let config = config(4, 32);
    let (a, b) = connected(&config);
    let inbox = inbox(&b.comm);

    a.qp.inject_post_failures(1);
    let mut proxy = a.comm.acquire_now(WorkRequestType::Send).unwrap().unwrap();
    let id = proxy.id();
    proxy.write_payload(b"retry me").unwrap();
    let err = a.comm.post(proxy).unwrap_err();
    assert!(matches!(
        err.error(),
        Error::Submission(SubmissionError::Verbs(_))
    ));
    assert_eq!(
        a.comm.pool().state(WorkRequestType::Send, id),
        Some(SlotState::Acquired)
    );

    // the same slot goes through on the second attempt
    let proxy = err.into_proxy();
    assert_eq!(proxy.payload(), b"retry me");
    a.comm.post(proxy).unwrap();
    pump(&[&a.comm, &b.comm], || received(&inbox) == 1);
    pump(&[&a.comm], || a.comm.pool().in_flight() == 0);
    assert_eq!(a.comm.pool().count(WorkRequestType::Send, SlotState::Free), 4);
}

#[test]
fn one_release_unblocks_one_waiter() {
    let config = config(4, 32);
    let (a, _b) = connected(&config);
    let comm = &a.comm;
    let mut held: Vec<_> = (0..4)
        .map(|_| comm.acquire_now(WorkRequestType::Send).unwrap().unwrap())
        .collect();
    assert!(comm.acquire_now(WorkRequestType::Send).unwrap().is_none());
    let acquired = AtomicUsize::new(0);

    crossbeam::thread::scope(|s| {
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|_| {
                    let proxy = comm.acquire_blocking(WorkRequestType::Send).unwrap();
                    acquired.fetch_add(1, Ordering::SeqCst);
                    proxy
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(acquired.load(Ordering::SeqCst), 0);

        comm.release(held.pop().unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(acquired.load(Ordering::SeqCst), 1);

        comm.release(held.pop().unwrap()).unwrap();
        let ids: Vec<u32> = waiters.into_iter().map(|w| w.join().unwrap().id()).collect();
        assert_ne!(ids[0], ids[1]);
    })
    .unwrap();
    assert_eq!(acquired.load(Ordering::SeqCst), 2);
}

#[test]
fn blocking_send_from_receive_handler_fails() {
    let config = config(2, 32);
    let (a, b) = connected(&config);
    let b = Arc::new(b.comm);
    let outcome = Arc::new(Mutex::new(Vec::new()));
    b.on_receive({
        let comm = Arc::downgrade(&b);
        let outcome = Arc::clone(&outcome);
        move |_, bytes| {
            let comm = match comm.upgrade() {
                Some(comm) => comm,
                None => return,
            };
            let blocking = comm.send_blocking(bytes);
            let nonblocking = comm.send_now(bytes);
            outcome.lock().unwrap().push((blocking, nonblocking));
        }
    });
    let echo = inbox(&a.comm);

    a.comm.send_blocking(b"ping").unwrap();
    pump(&[&a.comm, &*b], || received(&echo) == 1);

    let outcome = outcome.lock().unwrap();
    assert!(matches!(
        outcome[0].0,
        Err(Error::SlotPool(SlotPoolError::WouldDeadlock))
    ));
    assert!(matches!(outcome[0].1, Ok(true)));
    assert_eq!(echo.lock().unwrap()[0].1, b"ping");
}
