//! Listener binding, including the hot-restart fd hand-off.
//!
//! `bind_listeners` is the only entry point; it resolves each configured
//! address to a bound, non-blocking, listening `mio::net::TcpListener`,
//! preferring an inherited socket from a previous instance when
//! `--getfd-socket` names one and its bound address matches.

use crate::error::{ConnectorError, Result};
use crate::fdpass::{recv_with_fd, send_with_fd_to};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::process;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

const BACKLOG: i32 = 8192;
const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const BIND_RETRY_ATTEMPTS: u32 = 25;

/// Bind one listener per entry in `addrs`, in order, returning fully
/// configured `mio::net::TcpListener`s ready to register with a `Poll`.
///
/// If `getfd_socket` is given, each listener is first requested from that
/// path via `getxfd <index>`; a mismatch between the inherited socket's
/// local address and `addrs[index]` falls back to a fresh bind.
pub fn bind_listeners(
    addrs: &[SocketAddr],
    getfd_socket: Option<&Path>,
) -> Result<Vec<mio::net::TcpListener>> {
    let mut listeners = Vec::with_capacity(addrs.len());
    for (index, addr) in addrs.iter().enumerate() {
        let inherited = getfd_socket.and_then(|path| {
            match request_inherited_fd(path, index) {
                Ok(Some(std_listener)) => match std_listener.local_addr() {
                    Ok(bound) if bound == *addr => Some(std_listener),
                    Ok(bound) => {
                        warn!(index, wanted = %addr, got = %bound, "inherited listener address mismatch, rebinding");
                        None
                    }
                    Err(e) => {
                        warn!(index, error = %e, "inherited listener fd unusable, rebinding");
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    warn!(index, error = %e, "fd hand-off request failed, binding fresh");
                    None
                }
            }
        });

        let std_listener = match inherited {
            Some(l) => {
                info!(index, addr = %addr, "inherited listener across hot restart");
                l
            }
            None => bind_with_retry(*addr)?,
        };
        std_listener.set_nonblocking(true).ok();
        listeners.push(mio::net::TcpListener::from_std(std_listener));
    }
    Ok(listeners)
}

fn bind_with_retry(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let mut last_err = None;
    for attempt in 1..=BIND_RETRY_ATTEMPTS {
        match bind_one(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                warn!(addr = %addr, attempt, error = %e, "listener bind failed, retrying");
                last_err = Some(e);
                thread::sleep(BIND_RETRY_INTERVAL);
            }
        }
    }
    Err(ConnectorError::BindExhausted(
        addr,
        last_err.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrInUse)),
    ))
}

fn bind_one(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

/// Ask a running instance's control socket for listener `index`'s fd.
///
/// The control protocol is datagram-based (spec §6): we bind our own
/// throwaway path so the existing process's reply, sent back to the peer
/// address `recvfrom` gave it, has somewhere to land. Returns `Ok(None)` if
/// the control socket is unreachable (first process in the deployment,
/// nothing to inherit from).
fn request_inherited_fd(
    getfd_socket: &Path,
    index: usize,
) -> std::io::Result<Option<std::net::TcpListener>> {
    let reply_path = std::env::temp_dir().join(format!("connector-getfd-{}-{index}.sock", process::id()));
    let _ = std::fs::remove_file(&reply_path);
    let sock = match UnixDatagram::bind(&reply_path) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to bind getfd reply socket");
            return Ok(None);
        }
    };
    let _cleanup = RemoveOnDrop(&reply_path);

    let request = format!("getxfd {index}");
    if sock.send_to(request.as_bytes(), getfd_socket).is_err() {
        return Ok(None);
    }
    sock.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut buf = [0u8; 256];
    let (_, fd) = recv_with_fd(&sock, &mut buf)?;
    Ok(fd.map(|owned| unsafe { std::net::TcpListener::from_raw_fd(owned.into_raw_fd()) }))
}

struct RemoveOnDrop<'a>(&'a Path);

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.0);
    }
}

/// Send listener `index`'s fd to `dest` over `control_sock`, the same
/// datagram socket the `getxfd` request arrived on. Used by the control
/// loop's `getxfd` handler.
pub fn send_listener_fd(
    control_sock: &UnixDatagram,
    dest: &Path,
    listener: &mio::net::TcpListener,
) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    send_with_fd_to(control_sock, dest, b"getxfd", listener.as_raw_fd())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_one_assigns_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_one(addr).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_bind_listeners_without_getfd_socket_binds_fresh() {
        let addrs = vec!["127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap()];
        let listeners = bind_listeners(&addrs, None).unwrap();
        assert_eq!(listeners.len(), 2);
    }

    #[test]
    fn test_request_inherited_fd_returns_none_without_server() {
        let path = std::path::Path::new("/tmp/connector-test-nonexistent.sock");
        let result = request_inherited_fd(path, 0).unwrap();
        assert!(result.is_none());
    }
}
