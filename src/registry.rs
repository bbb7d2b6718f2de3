//! The client registry: sole authority over client-fd lifetime.
//!
//! A client record is reachable by id through `live` for as long as it is
//! valid. `invalidate` removes it from `live` immediately but keeps it in
//! `retired` until every other holder of an `Arc<ClientRecord>` — the
//! receiver's per-connection bookkeeping, any in-flight send job — has
//! dropped its clone. Only then does `reap` let the last `Arc` go, which is
//! the point the underlying socket actually closes.
//!
//! This sidesteps the fd-reuse hazard the manual-refcounting design in the
//! spec exists to avoid: nothing in this crate ever closes a socket by a raw
//! fd number it looked up separately from the `Arc` it came with, so a
//! freshly accepted connection can never be handed the same fd number while
//! a stale reference is still being serviced.

use crate::ids::ClientId;
use mio::net::TcpStream;
use mio::unix::SourceFd;
use socket2::SockRef;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Read buffers are recycled at this capacity; see `recruit_buffer`.
pub const INBUF_CAPACITY: usize = 4096;

/// A single connected client.
///
/// `stream` is the one owned handle to the socket; the receiver reads
/// through it and send jobs write through it, and it is this `Arc`'s
/// refcount — not a hand-rolled counter — that keeps the fd alive for as
/// long as any of them needs it.
pub struct ClientRecord {
    pub id: ClientId,
    pub stream: Arc<TcpStream>,
    pub fd: RawFd,
    pub server_index: usize,
    pub peer_numeric: SocketAddr,
    pub peer_printable: String,
    pub passthrough: AtomicBool,
    invalid: AtomicBool,
}

impl ClientRecord {
    /// Construct a record directly, bypassing the registry's id table.
    /// Used by the registry's own `insert` and by other modules' tests
    /// that need a `ClientRecord` wired to a real socket without a full
    /// `ClientRegistry` around it.
    pub(crate) fn new(
        id: ClientId,
        stream: Arc<TcpStream>,
        server_index: usize,
        peer_numeric: SocketAddr,
        peer_printable: String,
    ) -> Self {
        Self {
            id,
            fd: stream.as_raw_fd(),
            stream,
            server_index,
            peer_numeric,
            peer_printable,
            passthrough: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRecord")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("peer", &self.peer_printable)
            .field("invalid", &self.is_invalid())
            .finish()
    }
}

#[derive(Default)]
struct RegistryStats {
    created: AtomicU64,
    retired: AtomicU64,
}

struct Inner {
    live: HashMap<ClientId, Arc<ClientRecord>>,
    retired: Vec<Arc<ClientRecord>>,
    recycled_buffers: Vec<Vec<u8>>,
}

/// Process-wide table of connected clients.
pub struct ClientRegistry {
    inner: RwLock<Inner>,
    next_id: AtomicI64,
    poll_registry: mio::Registry,
    stats: RegistryStats,
}

impl ClientRegistry {
    /// `first_id` is the number of listening sockets: ids `0..first_id` are
    /// reserved for listener tokens, so the first client gets `first_id`.
    pub fn new(poll_registry: mio::Registry, first_id: ClientId) -> Self {
        Self {
            inner: RwLock::new(Inner {
                live: HashMap::new(),
                retired: Vec::new(),
                recycled_buffers: Vec::new(),
            }),
            next_id: AtomicI64::new(first_id),
            poll_registry,
            stats: RegistryStats::default(),
        }
    }

    /// Take a zeroed (empty, but capacity-preserving) read buffer from the
    /// recycled pool, or allocate a fresh one. Mirrors the spec's
    /// "recruit from the recycled list or allocate fresh" without reusing
    /// whole client records, which Rust's ownership model already reclaims
    /// deterministically.
    pub fn recruit_buffer(&self) -> Vec<u8> {
        let mut inner = self.inner.write().unwrap();
        inner
            .recycled_buffers
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(INBUF_CAPACITY))
    }

    /// Return a read buffer to the pool for reuse. Cleared but with its
    /// heap allocation intact.
    pub fn release_buffer(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut inner = self.inner.write().unwrap();
        inner.recycled_buffers.push(buf);
    }

    /// Register a freshly accepted connection and assign it an id.
    pub fn insert(
        &self,
        stream: Arc<TcpStream>,
        server_index: usize,
        peer_numeric: SocketAddr,
        peer_printable: String,
    ) -> Arc<ClientRecord> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = Arc::new(ClientRecord::new(
            id,
            stream,
            server_index,
            peer_numeric,
            peer_printable,
        ));
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().unwrap();
        inner.live.insert(id, Arc::clone(&record));
        record
    }

    /// Look up a live client by id, bumping the effective refcount by
    /// handing back a clone. Invalid or unknown ids return `None`.
    pub fn ref_by_id(&self, id: ClientId) -> Option<Arc<ClientRecord>> {
        let inner = self.inner.read().unwrap();
        inner
            .live
            .get(&id)
            .filter(|record| !record.is_invalid())
            .map(Arc::clone)
    }

    /// Drop a reference obtained from `ref_by_id`. Provided for API parity
    /// with the spec's contract; in practice letting `record` go out of
    /// scope has the same effect.
    pub fn unref(&self, record: Arc<ClientRecord>) {
        drop(record);
    }

    /// Number of currently live (non-retired) clients.
    pub fn live_count(&self) -> usize {
        self.inner.read().unwrap().live.len()
    }

    pub fn created_total(&self) -> u64 {
        self.stats.created.load(Ordering::Relaxed)
    }

    pub fn retired_total(&self) -> u64 {
        self.stats.retired.load(Ordering::Relaxed)
    }

    pub fn retired_count(&self) -> usize {
        self.inner.read().unwrap().retired.len()
    }

    /// Idempotently retire a client: remove it from the id table, deregister
    /// it from the readiness subsystem, and move it to the retired list
    /// until its last reference drops. Returns the fd if this call performed
    /// the transition (useful for logging), `None` if it was already invalid.
    pub fn invalidate(&self, record: &Arc<ClientRecord>) -> Option<RawFd> {
        if record
            .invalid
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let mut inner = self.inner.write().unwrap();
        inner.live.remove(&record.id);
        inner.retired.push(Arc::clone(record));
        drop(inner);

        if let Err(e) = self
            .poll_registry
            .deregister(&mut SourceFd(&record.fd))
        {
            // Already gone from the readiness subsystem, or never registered
            // (e.g. invalidated before the acceptor finished registering it).
            debug!(id = record.id, error = %e, "deregister during invalidate");
        }

        self.stats.retired.fetch_add(1, Ordering::Relaxed);
        debug!(id = record.id, fd = record.fd, peer = %record.peer_printable, "client invalidated");
        Some(record.fd)
    }

    /// Sweep the retired list, closing the socket (after disabling lingering
    /// writes) for every record whose last outside reference has dropped.
    ///
    /// A record is eligible once `Arc::strong_count` is 1: the retired
    /// list's own clone is the only one left, so every other holder —
    /// the readiness registration, any in-flight send job, any caller's
    /// local binding — has already dropped its reference.
    pub fn reap(&self) {
        let mut inner = self.inner.write().unwrap();
        let mut i = 0;
        while i < inner.retired.len() {
            if Arc::strong_count(&inner.retired[i]) == 1 {
                let record = inner.retired.swap_remove(i);
                disable_linger(&record.stream);
                debug!(id = record.id, fd = record.fd, "client reaped, socket closing");
                // Dropping `record` here releases the registry's last clone;
                // the TcpStream's own Drop impl closes the fd exactly once.
            } else {
                i += 1;
            }
        }
    }
}

/// Disable SO_LINGER so the final close doesn't block on unsent data the
/// peer may never acknowledge. Uses a borrowed socket view so ownership of
/// the fd never transfers out of the shared `Arc<TcpStream>`.
fn disable_linger(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_linger(Some(Duration::from_secs(0))) {
        warn!(error = %e, "failed to disable SO_LINGER before close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Interest, Poll, Token};
    use std::net::TcpListener as StdTcpListener;

    fn harness() -> (Poll, ClientRegistry, mio::net::TcpListener) {
        let poll = Poll::new().unwrap();
        let registry = ClientRegistry::new(poll.registry().try_clone().unwrap(), 1);
        let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let listener = mio::net::TcpListener::from_std(std_listener);
        (poll, registry, listener)
    }

    fn accept_one(
        poll: &mut Poll,
        registry: &ClientRegistry,
        listener: &mio::net::TcpListener,
    ) -> Arc<ClientRecord> {
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        let stream = Arc::new(stream);
        let record = registry.insert(Arc::clone(&stream), 0, peer, peer.to_string());
        poll.registry()
            .register(&mut SourceFd(&record.fd), Token(record.id as usize), Interest::READABLE)
            .unwrap();
        std::mem::forget(client); // keep the peer socket open for the test
        record
    }

    #[test]
    fn test_insert_assigns_ids_starting_at_listener_count() {
        let (mut poll, registry, listener) = harness();
        let r1 = accept_one(&mut poll, &registry, &listener);
        let r2 = accept_one(&mut poll, &registry, &listener);
        assert_eq!(r1.id, 1);
        assert_eq!(r2.id, 2);
    }

    #[test]
    fn test_ref_by_id_hit_and_miss() {
        let (mut poll, registry, listener) = harness();
        let record = accept_one(&mut poll, &registry, &listener);
        assert!(registry.ref_by_id(record.id).is_some());
        assert!(registry.ref_by_id(9999).is_none());
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let (mut poll, registry, listener) = harness();
        let record = accept_one(&mut poll, &registry, &listener);
        assert!(registry.invalidate(&record).is_some());
        assert!(registry.invalidate(&record).is_none());
        assert!(registry.ref_by_id(record.id).is_none());
    }

    #[test]
    fn test_invalidated_client_absent_from_live_table() {
        let (mut poll, registry, listener) = harness();
        let record = accept_one(&mut poll, &registry, &listener);
        assert_eq!(registry.live_count(), 1);
        registry.invalidate(&record);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.retired_count(), 1);
    }

    #[test]
    fn test_reap_waits_for_all_references() {
        let (mut poll, registry, listener) = harness();
        let record = accept_one(&mut poll, &registry, &listener);
        let extra_ref = registry.ref_by_id(record.id).unwrap();
        registry.invalidate(&record);

        // Still referenced by `extra_ref` and the local `record` binding.
        registry.reap();
        assert_eq!(registry.retired_count(), 1);

        drop(extra_ref);
        drop(record);
        registry.reap();
        assert_eq!(registry.retired_count(), 0);
    }

    #[test]
    fn test_buffer_recycling() {
        let (_poll, registry, _listener) = harness();
        let buf = registry.recruit_buffer();
        assert_eq!(buf.capacity(), INBUF_CAPACITY);
        registry.release_buffer(buf);
        let buf2 = registry.recruit_buffer();
        assert!(buf2.capacity() >= INBUF_CAPACITY);
        assert_eq!(buf2.len(), 0);
    }
}
