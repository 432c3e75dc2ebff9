//! A dedicated thread that drives the completion path of communicators.
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::communicator::Communicator;

struct Shared {
    // added since the last round
    pending: spin::Mutex<Vec<Arc<Communicator>>>,
    new_pending: AtomicBool,
    shutdown: AtomicBool,
}

impl Shared {
    fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Polls every added communicator in turn until it is closed or broken.
///
/// This is the single consumer of their completion queues; do not call
/// [`Communicator::progress`] on them from elsewhere.
pub struct CompletionPoller {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl CompletionPoller {
    pub fn spawn() -> io::Result<Self> {
        let shared = Arc::new(Shared {
            pending: spin::Mutex::new(Vec::new()),
            new_pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let handle = thread::Builder::new()
            .name("rdma-comm-poller".to_owned())
            .spawn({
                let shared = Arc::clone(&shared);
                move || mainloop(&shared)
            })?;
        Ok(CompletionPoller {
            shared,
            handle: Some(handle),
        })
    }

    pub fn add(&self, comm: Arc<Communicator>) {
        self.shared.pending.lock().push(comm);
        self.shared.new_pending.store(true, Ordering::Release);
        if let Some(handle) = self.handle.as_ref() {
            handle.thread().unpark();
        }
    }

    /// Stops the thread. Communicators still running are dropped by it, not closed.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!("completion poller panicked");
            }
        }
    }
}

impl Drop for CompletionPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn save_energy(shared: &Shared, running: &[Arc<Communicator>], last_event_ts: Instant) {
    // goes into sleep mode after 1000 us
    const SLEEP_THRESHOLD: Duration = Duration::from_micros(1000);
    const SLEEP_DURATION: Duration = Duration::from_micros(5);
    // goes into deep sleep after 10 ms
    const DEEP_SLEEP_THRESHOLD: Duration = Duration::from_millis(10);
    const DEEP_SLEEP_DURATION: Duration = Duration::from_micros(50);
    // park until something is added after idle for 1 second
    const IDLE_THRESHOLD: Duration = Duration::from_secs(1);

    let dura = last_event_ts.elapsed();
    if dura > IDLE_THRESHOLD && running.is_empty() && shared.is_empty() {
        tracing::trace!("completion poller is idle");
        thread::park();
    } else if dura > DEEP_SLEEP_THRESHOLD {
        thread::park_timeout(DEEP_SLEEP_DURATION);
    } else if dura > SLEEP_THRESHOLD {
        thread::park_timeout(SLEEP_DURATION);
    }
}

fn mainloop(shared: &Shared) {
    let mut running: Vec<Arc<Communicator>> = Vec::new();
    let mut shutdown = Vec::new();
    let mut last_event_ts = Instant::now();

    while !shared.shutdown.load(Ordering::Acquire) {
        save_energy(shared, &running, last_event_ts);

        for (index, comm) in running.iter().enumerate() {
            match comm.progress() {
                Ok(0) => {}
                Ok(_) => last_event_ts = Instant::now(),
                Err(e) => {
                    tracing::error!("communicator error, removing it from the poller: {}", e);
                    shutdown.push(index);
                    continue;
                }
            }
            if comm.is_closed() || comm.is_broken() {
                shutdown.push(index);
            }
        }

        for index in shutdown.drain(..).rev() {
            let comm = running.swap_remove(index);
            tracing::debug!("communicator removed from the poller: {:?}", comm);
        }

        if shared
            .new_pending
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            running.append(&mut shared.pending.lock());
            last_event_ts = Instant::now();
        }
    }
    tracing::debug!("completion poller stopped with {} communicators", running.len());
}
