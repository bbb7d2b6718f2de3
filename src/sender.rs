//! The sender thread (spec §4.3): a mutex+condvar intake queue feeding a
//! FIFO of non-blocking per-client writes.
//!
//! A slow client never blocks anyone else: its job simply accumulates bytes
//! unwritten until either the peer drains its receive buffer or something
//! else invalidates the client. There is no per-client coalescing beyond
//! FIFO order.

use crate::peer::PeerSender;
use crate::registry::{ClientRecord, ClientRegistry};
use crate::stats::Stats;
use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::info;

const SENDER_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// A unit of outbound work: a buffer and how much of it has gone out so
/// far. Holds the one client reference that keeps the destination alive for
/// the job's whole lifetime.
pub struct SendJob {
    pub record: Arc<ClientRecord>,
    pub buf: Vec<u8>,
    pub written: usize,
}

impl SendJob {
    pub fn new(record: Arc<ClientRecord>, buf: Vec<u8>) -> Self {
        Self { record, buf, written: 0 }
    }

    fn remaining(&self) -> &[u8] {
        &self.buf[self.written..]
    }

    fn done(&self) -> bool {
        self.written >= self.buf.len()
    }
}

/// Shared handle producers (control loop, receiver) use to queue outbound
/// sends. The sender thread owns the only consumer side.
pub struct SenderHandle {
    intake: Mutex<Vec<SendJob>>,
    condvar: Condvar,
}

impl SenderHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            intake: Mutex::new(Vec::new()),
            condvar: Condvar::new(),
        })
    }

    pub fn enqueue(&self, job: SendJob) {
        let mut intake = self.intake.lock().unwrap();
        intake.push(job);
        self.condvar.notify_one();
    }
}

/// Drive the sender loop until the process exits. Intended to run on its
/// own OS thread for the process lifetime.
pub fn run(
    handle: Arc<SenderHandle>,
    registry: Arc<ClientRegistry>,
    peers: Arc<PeerSender>,
    stats: Arc<Stats>,
) -> ! {
    let mut working: Vec<SendJob> = Vec::new();
    loop {
        let mut i = 0;
        let mut any_delayed = false;
        while i < working.len() {
            match attempt_write(&mut working[i], &registry, &peers) {
                WriteOutcome::Complete => {
                    let job = working.swap_remove(i);
                    stats.sends.record_destroyed(job.buf.len() as u64);
                }
                WriteOutcome::Invalidated => {
                    let job = working.swap_remove(i);
                    stats.sends.record_destroyed(job.buf.len() as u64);
                }
                WriteOutcome::Pending => {
                    any_delayed = true;
                    i += 1;
                }
            }
        }

        let remaining_bytes: u64 = working.iter().map(|j| j.remaining().len() as u64).sum();
        stats.sends.set_count(working.len() as u64);
        if any_delayed {
            stats.delays.record_created(remaining_bytes);
        }

        let mut intake = handle.intake.lock().unwrap();
        if intake.is_empty() {
            let (guard, _timeout) = handle
                .condvar
                .wait_timeout(intake, SENDER_POLL_TIMEOUT)
                .unwrap();
            intake = guard;
        }
        working.append(&mut intake);
    }
}

enum WriteOutcome {
    Complete,
    Invalidated,
    Pending,
}

fn attempt_write(job: &mut SendJob, registry: &ClientRegistry, peers: &PeerSender) -> WriteOutcome {
    if job.record.is_invalid() {
        return WriteOutcome::Invalidated;
    }
    loop {
        if job.done() {
            return WriteOutcome::Complete;
        }
        match (&*job.record.stream).write(job.remaining()) {
            Ok(0) => {
                if registry.invalidate(&job.record).is_some() {
                    peers.notify_stratifier_drop(job.record.id);
                }
                return WriteOutcome::Invalidated;
            }
            Ok(n) => {
                job.written += n;
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteOutcome::Pending,
            Err(e) => {
                info!(id = job.record.id, error = %e, "send write failed");
                if registry.invalidate(&job.record).is_some() {
                    peers.notify_stratifier_drop(job.record.id);
                }
                return WriteOutcome::Invalidated;
            }
        }
    }
}
