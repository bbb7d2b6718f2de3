//! The control loop (spec §4.4): the main thread, after spawning the
//! acceptor/receiver and sender threads, spends the rest of the process
//! lifetime here.

use crate::ids;
use crate::listener;
use crate::message;
use crate::peer::PeerSender;
use crate::registry::ClientRegistry;
use crate::sender::{SendJob, SenderHandle};
use crate::stats::Stats;
use mio::net::TcpListener as MioTcpListener;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// The control socket is polled with this timeout so the loop can check for
/// the periodic passthrough stats log without a fourth OS thread.
const CONTROL_RECV_TIMEOUT: Duration = Duration::from_secs(5);
const PERIODIC_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Type-erases the logging backend's reload handle so this module doesn't
/// need to know which `tracing-subscriber` layer owns the filter.
pub type LogLevelSetter = Box<dyn Fn(&str) + Send + Sync>;

pub struct Control {
    socket: UnixDatagram,
    registry: Arc<ClientRegistry>,
    sender: Arc<SenderHandle>,
    peers: Arc<PeerSender>,
    stats: Arc<Stats>,
    accept_gate: Arc<AtomicBool>,
    listeners: Vec<MioTcpListener>,
    proxy_mode: bool,
    set_log_level: LogLevelSetter,
    last_stats_log: Instant,
}

pub enum ControlOutcome {
    Continue,
    Shutdown,
}

impl Control {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control_socket_path: &Path,
        registry: Arc<ClientRegistry>,
        sender: Arc<SenderHandle>,
        peers: Arc<PeerSender>,
        stats: Arc<Stats>,
        accept_gate: Arc<AtomicBool>,
        listeners: Vec<MioTcpListener>,
        proxy_mode: bool,
        set_log_level: LogLevelSetter,
    ) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(control_socket_path);
        let socket = UnixDatagram::bind(control_socket_path)?;
        socket.set_read_timeout(Some(CONTROL_RECV_TIMEOUT))?;
        Ok(Self {
            socket,
            registry,
            sender,
            peers,
            stats,
            accept_gate,
            listeners,
            proxy_mode,
            set_log_level,
            last_stats_log: Instant::now(),
        })
    }

    /// Run until a `shutdown` command arrives.
    pub fn run(mut self) {
        loop {
            let mut buf = [0u8; 4096];
            match self.socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    let Some(peer_path) = peer.as_pathname().map(Path::to_path_buf) else {
                        warn!("control command from unnamed peer, cannot reply");
                        self.dispatch(&buf[..n], None);
                        continue;
                    };
                    if let ControlOutcome::Shutdown = self.dispatch(&buf[..n], Some(&peer_path)) {
                        info!("shutdown command received, exiting");
                        std::process::exit(0);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => warn!(error = %e, "control socket recv failed"),
            }
            self.maybe_log_periodic_stats();
        }
    }

    fn maybe_log_periodic_stats(&mut self) {
        if !self.proxy_mode {
            return;
        }
        if self.last_stats_log.elapsed() < PERIODIC_STATS_INTERVAL {
            return;
        }
        self.last_stats_log = Instant::now();
        let payload = self.stats.payload(Some(PERIODIC_STATS_INTERVAL.as_secs()));
        info!(stats = %payload.to_line().trim_end(), "periodic passthrough stats");
    }

    fn dispatch(&mut self, raw: &[u8], peer: Option<&PathBuf>) -> ControlOutcome {
        let Ok(text) = std::str::from_utf8(raw) else {
            warn!("control command is not valid UTF-8");
            return ControlOutcome::Continue;
        };
        let text = text.trim_end_matches(['\n', '\r']);

        if text.starts_with('{') {
            self.handle_send(text);
        } else if let Some(id) = text.strip_prefix("dropclient=") {
            self.handle_dropclient(id);
        } else if let Some(id) = text.strip_prefix("passthrough=") {
            self.handle_passthrough(id);
        } else if text == "ping" {
            self.reply(peer, "pong\n");
        } else if text == "accept" {
            self.accept_gate.store(true, Ordering::Release);
        } else if text == "reject" {
            self.accept_gate.store(false, Ordering::Release);
        } else if text == "stats" {
            let payload = self.stats.payload(None);
            self.reply(peer, &payload.to_line());
        } else if let Some(level) = text.strip_prefix("loglevel=") {
            (self.set_log_level)(level);
        } else if let Some(rest) = text.strip_prefix("getxfd ") {
            self.handle_getxfd(rest, peer);
        } else if text == "shutdown" {
            return ControlOutcome::Shutdown;
        } else {
            warn!(command = text, "unknown control command");
        }
        ControlOutcome::Continue
    }

    fn reply(&self, peer: Option<&PathBuf>, line: &str) {
        let Some(peer) = peer else { return };
        if let Err(e) = self.socket.send_to(line.as_bytes(), peer) {
            warn!(error = %e, "control reply send failed");
        }
    }

    fn handle_send(&mut self, json_text: &str) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(json_text) else {
            warn!("control send command carries invalid JSON");
            return;
        };
        let Some(obj) = value.as_object().cloned() else {
            warn!("control send command JSON is not an object");
            return;
        };
        let Some((id, rest)) = message::extract_send_target(obj) else {
            warn!("control send command missing client_id");
            return;
        };
        let line = message::to_line(&rest);
        self.dispatch_send(id, line);
    }

    /// Send dispatch per §4.4: composite ids look up their passthrough
    /// parent; simple ids look up directly. A miss notifies the stratifier
    /// to drop the id rather than erroring.
    fn dispatch_send(&mut self, id: ids::ClientId, line: String) {
        if ids::is_composite(id) {
            let (parent_id, subclient_id) = ids::split(id);
            match self.registry.ref_by_id(parent_id) {
                Some(parent) => {
                    self.sender.enqueue(SendJob::new(parent, line.into_bytes()));
                }
                None => {
                    // Parent gone. The sub-client id may also happen to be a
                    // live locally-known id (e.g. it was promoted to
                    // passthrough itself); if so invalidate it, otherwise
                    // tell the stratifier to drop the composite id.
                    match self.registry.ref_by_id(subclient_id) {
                        Some(record) => {
                            self.registry.invalidate(&record);
                        }
                        None => self.peers.notify_stratifier_drop(id),
                    }
                }
            }
            return;
        }

        match self.registry.ref_by_id(id) {
            Some(record) => self.sender.enqueue(SendJob::new(record, line.into_bytes())),
            None => self.peers.notify_stratifier_drop(id),
        }
    }

    fn handle_dropclient(&mut self, id_text: &str) {
        let Ok(id) = id_text.parse::<ids::ClientId>() else {
            warn!(id_text, "dropclient command has non-integer id");
            return;
        };
        if ids::is_composite(id) {
            // The physical connection is owned by the passthrough parent
            // and stays up; only the peer's own bookkeeping drops the
            // sub-client.
            return;
        }
        if let Some(record) = self.registry.ref_by_id(id) {
            if self.registry.invalidate(&record).is_some() {
                self.peers.notify_stratifier_drop(id);
            }
        }
    }

    fn handle_passthrough(&mut self, id_text: &str) {
        let Ok(id) = id_text.parse::<ids::ClientId>() else {
            warn!(id_text, "passthrough command has non-integer id");
            return;
        };
        if let Some(record) = self.registry.ref_by_id(id) {
            record.passthrough.store(true, Ordering::Release);
            self.sender
                .enqueue(SendJob::new(record, b"{\"result\": true}\n".to_vec()));
        }
    }

    fn handle_getxfd(&mut self, index_text: &str, peer: Option<&PathBuf>) {
        let Some(peer) = peer else {
            warn!("getxfd from unnamed peer, cannot reply");
            return;
        };
        let Ok(index) = index_text.trim().parse::<usize>() else {
            warn!(index_text, "getxfd command has non-integer index");
            return;
        };
        let Some(target) = self.listeners.get(index) else {
            warn!(index, "getxfd requested out-of-range listener index");
            return;
        };
        if let Err(e) = listener::send_listener_fd(&self.socket, peer, target) {
            warn!(index, error = %e, "getxfd fd hand-off failed");
        }
    }
}
