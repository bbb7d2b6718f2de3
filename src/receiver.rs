//! The acceptor/receiver thread (spec §4.2).
//!
//! Single thread, single readiness descriptor. Listener tokens occupy the
//! low range `0..listeners.len()`; client tokens are the client's own id,
//! which is always assigned starting at `listeners.len()` so a token can be
//! told apart from a listener index without a tagged union.

use crate::message;
use crate::peer::PeerSender;
use crate::registry::{ClientRegistry, INBUF_CAPACITY};
use crate::sender::{SendJob, SenderHandle};
use crate::stats::Stats;
use mio::event::Event;
use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use socket2::SockRef;
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Newline-terminated lines longer than this (terminator inclusive) cause
/// disconnect; see spec §3, §6.
pub const MAX_MSGSIZE: usize = 1024;

const READINESS_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_GATE_POLL: Duration = Duration::from_millis(5);

struct ReceiverConn {
    record: Arc<crate::registry::ClientRecord>,
    inbuf: Vec<u8>,
    bufofs: usize,
}

/// Owns the readiness descriptor and every listening socket.
pub struct Receiver {
    poll: Poll,
    listeners: Vec<TcpListener>,
    registry: Arc<ClientRegistry>,
    sender: Arc<SenderHandle>,
    peers: Arc<PeerSender>,
    stats: Arc<Stats>,
    accept_gate: Arc<AtomicBool>,
    max_clients: usize,
    proxy_mode: bool,
    connections: HashMap<i64, ReceiverConn>,
}

impl Receiver {
    /// `poll` is constructed by the caller (and its registry cloned into the
    /// `ClientRegistry` passed in here) so that cross-thread deregistration
    /// in `ClientRegistry::invalidate` targets the same readiness instance
    /// this thread polls.
    pub fn new(
        poll: Poll,
        mut listeners: Vec<TcpListener>,
        registry: Arc<ClientRegistry>,
        sender: Arc<SenderHandle>,
        peers: Arc<PeerSender>,
        stats: Arc<Stats>,
        accept_gate: Arc<AtomicBool>,
        max_clients: usize,
        proxy_mode: bool,
    ) -> io::Result<Self> {
        for (index, listener) in listeners.iter_mut().enumerate() {
            poll.registry()
                .register(listener, Token(index), Interest::READABLE)?;
        }
        Ok(Self {
            poll,
            listeners,
            registry,
            sender,
            peers,
            stats,
            accept_gate,
            max_clients,
            proxy_mode,
            connections: HashMap::new(),
        })
    }

    /// Run forever. Busy-waits at startup until the control loop flips the
    /// accept gate, per §4.5.
    pub fn run(mut self) -> ! {
        while !self.accept_gate.load(Ordering::Acquire) {
            thread::sleep(ACCEPT_GATE_POLL);
        }

        let mut events = Events::with_capacity(1024);
        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(READINESS_POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // Readiness subsystem failure is fatal per §7; a supervisor
                // restarts the process.
                panic!("readiness poll failed: {e}");
            }

            for event in events.iter() {
                let token = event.token().0;
                if token < self.listeners.len() {
                    if self.accept_gate.load(Ordering::Acquire) {
                        self.accept_loop(token);
                    }
                    continue;
                }
                self.handle_client_event(token as i64, event);
            }

            self.registry.reap();
        }
    }

    fn accept_loop(&mut self, listener_idx: usize) {
        loop {
            if self.registry.live_count() >= self.max_clients {
                break;
            }
            match self.listeners[listener_idx].accept() {
                Ok((stream, peer)) => self.accept_one(listener_idx, stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.raw_os_error() == Some(libc::ECONNABORTED) => continue,
                Err(e) => {
                    warn!(listener = listener_idx, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn accept_one(
        &mut self,
        listener_idx: usize,
        stream: mio::net::TcpStream,
        peer: SocketAddr,
    ) {
        let sock_ref = SockRef::from(&stream);
        if let Err(e) = sock_ref.set_keepalive(true) {
            warn!(peer = %peer, error = %e, "failed to set keepalive");
        }

        // The augmented `address` field is the bare IP (ckpool's
        // `address_name`, from `inet_ntop`), not `SocketAddr`'s "ip:port"
        // form — the ephemeral client port isn't meaningful to the peer.
        let peer_printable = peer.ip().to_string();
        let stream = Arc::new(stream);
        let record = self
            .registry
            .insert(Arc::clone(&stream), listener_idx, peer, peer_printable.clone());

        let mut source = SourceFd(&record.fd);
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut source, Token(record.id as usize), Interest::READABLE)
        {
            warn!(id = record.id, error = %e, "failed to register client, invalidating");
            self.registry.invalidate(&record);
            return;
        }

        let mut inbuf = self.registry.recruit_buffer();
        inbuf.resize(INBUF_CAPACITY, 0);
        let id = record.id;
        self.connections.insert(id, ReceiverConn { record, inbuf, bufofs: 0 });
        self.stats.clients.record_created(INBUF_CAPACITY as u64);
        info!(id, peer = %peer_printable, server = listener_idx, "client connected");
    }

    fn handle_client_event(&mut self, id: i64, event: &Event) {
        if self.registry.ref_by_id(id).is_none() {
            // Already invalidated by another component (control/sender);
            // drop our local bookkeeping if we still had it.
            if let Some(conn) = self.connections.remove(&id) {
                self.registry.release_buffer(conn.inbuf);
            }
            return;
        }

        let mut should_invalidate = false;
        if event.is_readable() {
            should_invalidate = self.handle_readable(id);
        }

        if !should_invalidate {
            if event.is_error() {
                let err = self
                    .connections
                    .get(&id)
                    .and_then(|c| SockRef::from(&*c.record.stream).take_error().ok().flatten());
                info!(id, error = ?err, "client socket error");
                should_invalidate = true;
            } else if event.is_write_closed() {
                info!(id, "client hang-up");
                should_invalidate = true;
            } else if event.is_read_closed() {
                info!(id, "client half-closed");
                should_invalidate = true;
            }
        }

        if should_invalidate {
            if let Some(conn) = self.connections.get(&id) {
                if self.registry.invalidate(&conn.record).is_some() {
                    self.peers.notify_stratifier_drop(id);
                }
            }
        }

        if let Some(conn) = self.connections.get(&id) {
            if conn.record.is_invalid() {
                if let Some(conn) = self.connections.remove(&id) {
                    self.stats.clients.record_destroyed(INBUF_CAPACITY as u64);
                    self.stats.dead.record_created(0);
                    self.registry.release_buffer(conn.inbuf);
                }
            }
        }
    }

    /// Read once, then drain as many complete lines as the buffer holds.
    /// Returns `true` if the connection should be invalidated.
    fn handle_readable(&mut self, id: i64) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };

        match (&*conn.record.stream).read(&mut conn.inbuf[conn.bufofs..]) {
            Ok(0) => return true,
            Ok(n) => conn.bufofs += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) => {
                info!(id, error = %e, "client read error");
                return true;
            }
        }

        self.drain_lines(id)
    }

    fn drain_lines(&mut self, id: i64) -> bool {
        loop {
            let Some(conn) = self.connections.get_mut(&id) else {
                return false;
            };

            let terminator = conn.inbuf[..conn.bufofs].iter().position(|&b| b == b'\n');
            let Some(pos) = terminator else {
                if conn.bufofs > MAX_MSGSIZE {
                    warn!(id, "oversize line, disconnecting");
                    return true;
                }
                return false;
            };

            // `pos` is the content length (bytes before the terminator), so
            // exactly MAX_MSGSIZE content bytes followed by `\n` (line_len
            // MAX_MSGSIZE + 1) is within bounds; only content strictly
            // longer than MAX_MSGSIZE disconnects.
            if pos > MAX_MSGSIZE {
                warn!(id, "oversize line, disconnecting");
                return true;
            }
            let line_len = pos + 1;

            let line = conn.inbuf[..pos].to_vec();
            conn.inbuf.copy_within(line_len..conn.bufofs, 0);
            conn.bufofs -= line_len;

            if self.dispatch_line(id, &line) {
                return true;
            }
        }
    }

    /// Parse and forward one line. Returns `true` if the client should be
    /// invalidated (parse failure).
    fn dispatch_line(&mut self, id: i64, line: &[u8]) -> bool {
        let parsed = serde_json::from_slice::<serde_json::Value>(line)
            .ok()
            .and_then(|v| v.as_object().cloned());

        let Some(obj) = parsed else {
            self.queue_invalid_json_reply(id);
            return true;
        };

        let Some(conn) = self.connections.get(&id) else {
            return false;
        };
        let passthrough = conn.record.is_passthrough();
        let peer_printable = conn.record.peer_printable.clone();
        let server_index = conn.record.server_index;
        let is_invalid = conn.record.is_invalid();

        match message::augment_inbound(obj, id, passthrough, &peer_printable, server_index) {
            Ok(augmented) => {
                if !is_invalid {
                    let line_out = message::to_line(&augmented);
                    self.peers.send_proc(self.proxy_mode, &line_out);
                }
                false
            }
            Err(_) => {
                self.queue_invalid_json_reply(id);
                true
            }
        }
    }

    fn queue_invalid_json_reply(&mut self, id: i64) {
        if let Some(conn) = self.connections.get(&id) {
            self.sender.enqueue(SendJob::new(
                Arc::clone(&conn.record),
                b"Invalid JSON, disconnecting\n".to_vec(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;
    use std::path::PathBuf;

    fn test_receiver(max_clients: usize) -> (Receiver, PathBuf) {
        use std::net::TcpListener as StdTcpListener;
        let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let listener = TcpListener::from_std(std_listener);

        let poll = Poll::new().unwrap();
        let registry = Arc::new(ClientRegistry::new(poll.registry().try_clone().unwrap(), 1));

        let dir = tempfile::tempdir().unwrap();
        let strat_path = dir.path().join("strat.sock");
        let gen_path = dir.path().join("gen.sock");
        // Leave the peer sockets unbound; send_proc tolerates a missing peer.
        let peers = Arc::new(PeerSender::connect(&strat_path, &gen_path).unwrap());

        let sender = SenderHandle::new();
        let stats = Arc::new(Stats::default());
        let accept_gate = Arc::new(AtomicBool::new(true));

        let receiver = Receiver::new(
            poll,
            vec![listener],
            registry,
            sender,
            peers,
            stats,
            accept_gate,
            max_clients,
            false,
        )
        .unwrap();
        (receiver, dir.into_path())
    }

    #[test]
    fn test_accept_assigns_id_and_tracks_connection() {
        let (mut receiver, _dir) = test_receiver(10);
        let addr = receiver.listeners[0].local_addr().unwrap();
        let _client = StdTcpStream::connect(addr).unwrap();

        let mut events = Events::with_capacity(8);
        receiver.poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        receiver.accept_loop(0);

        assert_eq!(receiver.registry.live_count(), 1);
        assert_eq!(receiver.connections.len(), 1);
    }

    #[test]
    fn test_accept_declines_at_max_clients() {
        let (mut receiver, _dir) = test_receiver(0);
        let addr = receiver.listeners[0].local_addr().unwrap();
        let _client = StdTcpStream::connect(addr).unwrap();

        let mut events = Events::with_capacity(8);
        receiver.poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        receiver.accept_loop(0);

        assert_eq!(receiver.registry.live_count(), 0);
    }

    #[test]
    fn test_oversize_line_invalidates_client() {
        let (mut receiver, _dir) = test_receiver(10);
        let addr = receiver.listeners[0].local_addr().unwrap();
        let mut client = StdTcpStream::connect(addr).unwrap();

        let mut events = Events::with_capacity(8);
        receiver.poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        receiver.accept_loop(0);
        let id = *receiver.connections.keys().next().unwrap();

        client.write_all(&vec![b'x'; 1100]).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        receiver.poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        let should_invalidate = receiver.handle_readable(id);
        assert!(should_invalidate);
    }

    #[test]
    fn test_exactly_max_msgsize_content_bytes_is_accepted() {
        let (mut receiver, _dir) = test_receiver(10);
        let addr = receiver.listeners[0].local_addr().unwrap();
        let mut client = StdTcpStream::connect(addr).unwrap();

        let mut events = Events::with_capacity(8);
        receiver.poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        receiver.accept_loop(0);
        let id = *receiver.connections.keys().next().unwrap();

        let mut line = vec![b'x'; MAX_MSGSIZE];
        line.push(b'\n');
        client.write_all(&line).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        receiver.poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        let should_invalidate = receiver.handle_readable(id);
        assert!(!should_invalidate);
        assert_eq!(receiver.connections.get(&id).unwrap().bufofs, 0);
    }

    #[test]
    fn test_max_msgsize_plus_one_content_bytes_disconnects() {
        let (mut receiver, _dir) = test_receiver(10);
        let addr = receiver.listeners[0].local_addr().unwrap();
        let mut client = StdTcpStream::connect(addr).unwrap();

        let mut events = Events::with_capacity(8);
        receiver.poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        receiver.accept_loop(0);
        let id = *receiver.connections.keys().next().unwrap();

        let mut line = vec![b'x'; MAX_MSGSIZE + 1];
        line.push(b'\n');
        client.write_all(&line).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        receiver.poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        let should_invalidate = receiver.handle_readable(id);
        assert!(should_invalidate);
    }

    #[test]
    fn test_valid_json_line_is_parsed_and_buffer_advances() {
        let (mut receiver, _dir) = test_receiver(10);
        let addr = receiver.listeners[0].local_addr().unwrap();
        let mut client = StdTcpStream::connect(addr).unwrap();

        let mut events = Events::with_capacity(8);
        receiver.poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        receiver.accept_loop(0);
        let id = *receiver.connections.keys().next().unwrap();

        client.write_all(b"{\"method\":\"mining.subscribe\"}\n").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        receiver.poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        let should_invalidate = receiver.handle_readable(id);
        assert!(!should_invalidate);
        assert_eq!(receiver.connections.get(&id).unwrap().bufofs, 0);
    }

    #[test]
    fn test_invalid_json_queues_reply_and_invalidates() {
        let (mut receiver, _dir) = test_receiver(10);
        let addr = receiver.listeners[0].local_addr().unwrap();
        let mut client = StdTcpStream::connect(addr).unwrap();

        let mut events = Events::with_capacity(8);
        receiver.poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        receiver.accept_loop(0);
        let id = *receiver.connections.keys().next().unwrap();

        client.write_all(b"not json\n").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        receiver.poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        let should_invalidate = receiver.handle_readable(id);
        assert!(should_invalidate);
    }
}
