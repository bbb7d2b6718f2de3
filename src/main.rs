//! connector: the connection front-end for a mining-pool server.
//!
//! Accepts line-delimited JSON clients on one or more TCP listeners,
//! forwards parsed messages to the stratifier or generator peer process,
//! and exposes a local control socket for sends, drops, passthrough
//! promotion, and hot-restart fd hand-off.

mod config;
mod control;
mod error;
mod fdpass;
mod ids;
mod listener;
mod message;
mod peer;
mod receiver;
mod registry;
mod sender;
mod stats;

use config::Config;
use control::{Control, LogLevelSetter};
use error::{ConnectorError, Result};
use mio::{Poll, net::TcpListener as MioTcpListener};
use peer::PeerSender;
use registry::ClientRegistry;
use sender::SenderHandle;
use stats::Stats;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(e) = run() {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = Config::load()?;
    let set_log_level = init_logging(&config.log_level);

    info!(
        listen = ?config.listen,
        proxy = config.proxy,
        max_clients = config.max_clients,
        "starting connector"
    );

    let addrs: Vec<SocketAddr> = config
        .listen
        .iter()
        .map(|s| {
            s.parse()
                .map_err(|e| ConnectorError::InvalidAddress(s.clone(), e))
        })
        .collect::<Result<_>>()?;

    let mio_listeners = listener::bind_listeners(&addrs, config.getfd_socket.as_deref())?;
    let control_listeners: Vec<MioTcpListener> = mio_listeners
        .iter()
        .map(dup_listener)
        .collect::<std::io::Result<_>>()
        .map_err(ConnectorError::PollCreate)?;

    let poll = Poll::new().map_err(ConnectorError::PollCreate)?;
    let registry = Arc::new(ClientRegistry::new(
        poll.registry().try_clone().map_err(ConnectorError::PollCreate)?,
        addrs.len() as i64,
    ));

    let peers = Arc::new(
        PeerSender::connect(&config.stratifier_socket, &config.generator_socket)
            .map_err(|e| ConnectorError::PeerSocket(config.stratifier_socket.clone(), e))?,
    );
    let stats = Arc::new(Stats::default());
    let sender_handle = SenderHandle::new();
    let accept_gate = Arc::new(AtomicBool::new(false));

    {
        let sender_handle = Arc::clone(&sender_handle);
        let registry = Arc::clone(&registry);
        let peers = Arc::clone(&peers);
        let stats = Arc::clone(&stats);
        thread::spawn(move || sender::run(sender_handle, registry, peers, stats));
    }

    {
        let registry = Arc::clone(&registry);
        let sender_handle = Arc::clone(&sender_handle);
        let peers = Arc::clone(&peers);
        let stats = Arc::clone(&stats);
        let accept_gate = Arc::clone(&accept_gate);
        let max_clients = config.max_clients;
        let proxy = config.proxy;
        thread::spawn(move || {
            let receiver = receiver::Receiver::new(
                poll,
                mio_listeners,
                registry,
                sender_handle,
                peers,
                stats,
                accept_gate,
                max_clients,
                proxy,
            )
            .expect("failed to set up acceptor/receiver");
            receiver.run();
        });
    }

    let control = Control::new(
        &config.control_socket,
        registry,
        sender_handle,
        peers,
        stats,
        accept_gate,
        control_listeners,
        config.proxy,
        set_log_level,
    )
    .map_err(|e| ConnectorError::ControlSocket(config.control_socket.clone(), e))?;
    control.run();

    Ok(())
}

/// Duplicate a listener's fd so the control loop can answer `getxfd`
/// independently of the acceptor/receiver thread, which owns the original.
fn dup_listener(listener: &MioTcpListener) -> std::io::Result<MioTcpListener> {
    let new_fd = unsafe { libc::dup(listener.as_raw_fd()) };
    if new_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(new_fd) };
    std_listener.set_nonblocking(true)?;
    Ok(MioTcpListener::from_std(std_listener))
}

/// Set up structured logging with a reloadable filter, and return a setter
/// the control loop can call for the `loglevel=<n>` command.
fn init_logging(initial_level: &str) -> LogLevelSetter {
    let initial_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(initial_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, reload_handle) = tracing_subscriber::reload::Layer::new(initial_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    Box::new(move |level: &str| match EnvFilter::try_new(level) {
        Ok(filter) => {
            if let Err(e) = reload_handle.reload(filter) {
                tracing::warn!(error = %e, "failed to apply new log level");
            }
        }
        Err(e) => tracing::warn!(level, error = %e, "invalid log level requested"),
    })
}
