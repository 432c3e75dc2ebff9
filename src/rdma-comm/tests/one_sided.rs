use std::slice;
use std::sync::{Arc, Mutex};

use interface::{wc_status, RemoteKey};

use rdma_comm::error::SubmissionError;
use rdma_comm::{CompletionError, Communicator, Error, SlotState, WorkRequestType};

mod common;
use common::{config, connected, inbox, pump, received, Side};

fn one_sided_pair() -> (Side, Side) {
    let config = config(4, 64).with_types(&[
        WorkRequestType::Send,
        WorkRequestType::Receive,
        WorkRequestType::Write,
        WorkRequestType::Read,
    ]);
    connected(&config)
}

fn segment(comm: &Communicator, ty: WorkRequestType, id: u32) -> &mut [u8] {
    let buffers = comm.pool().buffers();
    let addr = buffers.segment_address(ty, id).unwrap();
    // SAFETY: the segment lies in the region registered by `comm` and no slot of it is in use.
    unsafe { slice::from_raw_parts_mut(addr as *mut u8, buffers.segment_size()) }
}

#[test]
fn one_sided_needs_the_peer_key() {
    let (a, _b) = one_sided_pair();
    assert!(matches!(
        a.comm.write_now(b"early"),
        Err(Error::Submission(SubmissionError::NoRemoteKey))
    ));
    assert_eq!(a.comm.pool().count(WorkRequestType::Write, SlotState::Free), 4);
}

#[test]
fn write_lands_in_the_peer_segment() {
    let (a, b) = one_sided_pair();
    a.comm.set_remote_key(b.comm.local_key()).unwrap();
    b.comm.set_remote_key(a.comm.local_key()).unwrap();

    a.comm.write_blocking(b"written remotely").unwrap();
    pump(&[&a.comm], || a.comm.pool().in_flight() == 0);
    // the first write slot is 0, which targets slot 0 of the peer
    assert_eq!(&segment(&b.comm, WorkRequestType::Write, 0)[..16], b"written remotely");
}

#[test]
fn read_delivers_the_fetched_bytes() {
    let (a, b) = one_sided_pair();
    a.comm.set_remote_key(b.comm.local_key()).unwrap();
    let inbox = inbox(&a.comm);

    segment(&b.comm, WorkRequestType::Read, 0)[..9].copy_from_slice(b"read back");
    a.comm.read_blocking(9).unwrap();
    pump(&[&a.comm], || received(&inbox) == 1);

    let inbox = inbox.lock().unwrap();
    assert_eq!(inbox[0].0, WorkRequestType::Read);
    assert_eq!(inbox[0].1, b"read back");
    assert_eq!(a.comm.pool().count(WorkRequestType::Read, SlotState::Free), 4);
}

#[test]
fn rejected_write_reports_and_frees_the_slot() {
    let (a, b) = one_sided_pair();
    let key = b.comm.local_key();
    a.comm
        .set_remote_key(RemoteKey {
            rkey: key.rkey + 1000,
            addr: key.addr,
        })
        .unwrap();
    let errors = Arc::new(Mutex::new(Vec::new()));
    a.comm.on_error({
        let errors = Arc::clone(&errors);
        move |e: &CompletionError| {
            if let CompletionError::Failed { ty, status, .. } = e {
                errors.lock().unwrap().push((*ty, status.code()));
            }
        }
    });

    a.comm.write_blocking(b"nope").unwrap();
    pump(&[&a.comm], || !errors.lock().unwrap().is_empty());
    assert_eq!(
        errors.lock().unwrap()[0],
        (WorkRequestType::Write, wc_status::REM_ACCESS_ERR)
    );
    assert_eq!(a.comm.pool().count(WorkRequestType::Write, SlotState::Free), 4);
}
