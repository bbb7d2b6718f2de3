//! The `send_proc` primitive: handing a parsed, augmented message to the
//! stratifier or generator peer process.
//!
//! The peer processes themselves, and everything about what they do with a
//! message, are out of scope here — this module only owns the datagram
//! transport. Send failures (peer not listening, e.g. during its own
//! restart) are logged and otherwise ignored; there is no retry, per the
//! stated non-goal on peer retry/backoff.

use crate::ids::ClientId;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use tracing::debug;

/// Connected datagram sockets to both peer processes.
pub struct PeerSender {
    stratifier: UnixDatagram,
    generator: UnixDatagram,
}

impl PeerSender {
    /// Bind an unnamed local datagram socket and connect it to each peer's
    /// well-known socket path. `connect` on `SOCK_DGRAM` just fixes the
    /// default destination for `send`; it does not require the peer to be
    /// listening yet.
    pub fn connect(stratifier_path: &Path, generator_path: &Path) -> std::io::Result<Self> {
        let stratifier = UnixDatagram::unbound()?;
        stratifier.connect(stratifier_path)?;
        let generator = UnixDatagram::unbound()?;
        generator.connect(generator_path)?;
        Ok(Self { stratifier, generator })
    }

    /// Send `line` to the generator if `proxy_mode` (process-global
    /// passthrough) is set, otherwise to the stratifier.
    pub fn send_proc(&self, proxy_mode: bool, line: &str) {
        let sock = if proxy_mode { &self.generator } else { &self.stratifier };
        if let Err(e) = sock.send(line.as_bytes()) {
            debug!(error = %e, "send_proc failed, peer likely not listening");
        }
    }

    /// Tell the stratifier to drop a client id it can no longer reach
    /// locally: a stale composite send, or a missing passthrough parent.
    /// This always targets the stratifier regardless of proxy mode, per
    /// the control table's drop-notification rule.
    pub fn notify_stratifier_drop(&self, id: ClientId) {
        let line = format!("{{\"drop_client\":{id}}}\n");
        if let Err(e) = self.stratifier.send(line.as_bytes()) {
            debug!(error = %e, id, "drop notification to stratifier failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram as TestDgram;

    #[test]
    fn test_send_proc_routes_by_proxy_mode() {
        let dir = tempfile::tempdir().unwrap();
        let strat_path = dir.path().join("strat.sock");
        let gen_path = dir.path().join("gen.sock");
        let strat_listener = TestDgram::bind(&strat_path).unwrap();
        let gen_listener = TestDgram::bind(&gen_path).unwrap();

        let sender = PeerSender::connect(&strat_path, &gen_path).unwrap();
        sender.send_proc(false, "to stratifier\n");
        sender.send_proc(true, "to generator\n");

        let mut buf = [0u8; 64];
        let (n, _) = strat_listener.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"to stratifier\n");
        let (n, _) = gen_listener.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"to generator\n");
    }

    #[test]
    fn test_notify_stratifier_drop_formats_drop_message() {
        let dir = tempfile::tempdir().unwrap();
        let strat_path = dir.path().join("strat.sock");
        let gen_path = dir.path().join("gen.sock");
        let strat_listener = TestDgram::bind(&strat_path).unwrap();
        let _gen_listener = TestDgram::bind(&gen_path).unwrap();

        let sender = PeerSender::connect(&strat_path, &gen_path).unwrap();
        sender.notify_stratifier_drop(42);

        let mut buf = [0u8; 64];
        let (n, _) = strat_listener.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"{\"drop_client\":42}\n");
    }
}
