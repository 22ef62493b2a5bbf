//! The accept loop, the worker pool, and everything they share.
//!
//! One reactor thread multiplexes the accept socket and every connection
//! fd. Ready connections are handed to a bounded pool of workers; one-shot
//! arming guarantees a connection is serviced by at most one worker at a
//! time, and the fd is rearmed only after the worker yields.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use tracing::{error, info, warn};

use ocnvm::NvmBackend;
use ocpool::Manager;

use super::config::BrokerConfig;
use super::conn::{ConnOutcome, Connection};
use super::netif;
use super::reactor::{Reactor, EV_CLOSED};

mod defs {
    pub const MAX_EVENTS: usize = 256;
    pub const WORKER_QUEUE_DEPTH: usize = 1024;
    /// Reactor wakes at least this often to check the stop flag.
    pub const WAIT_TIMEOUT_MS: i32 = 200;
}

/// Process-lifetime context injected into every connection.
pub struct BrokerCtx {
    pub manager: Arc<Manager>,
    pub backend: Arc<dyn NvmBackend>,
    pub vblk_selftest: bool,
}

#[derive(Debug)]
pub enum ServerError {
    /// No IPv4 address was discovered for the configured prefix.
    NoAddress(String),
    /// Binding the message port failed.
    Bind(io::Error),
    /// The readiness multiplexer could not be set up.
    Reactor(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerError::NoAddress(prefix) => {
                write!(f, "no IPv4 address on any '{prefix}*' interface")
            }
            ServerError::Bind(e) => write!(f, "failed to bind message port: {e}"),
            ServerError::Reactor(e) => write!(f, "failed to set up reactor: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

type ConnTable = Arc<Mutex<HashMap<RawFd, Arc<Mutex<Connection>>>>>;

pub struct Server {
    listener: TcpListener,
    reactor: Arc<Reactor>,
    conns: ConnTable,
    ctx: Arc<BrokerCtx>,
    workers: usize,
}

impl Server {
    /// Resolve the address to serve on: the configured override, or the
    /// first IPv4 address on the configured interface prefix.
    pub fn resolve_bind_ip(config: &BrokerConfig) -> Result<Ipv4Addr, ServerError> {
        match config.bind_ip {
            Some(ip) => Ok(ip),
            None => netif::primary_ipv4(&config.iface_prefix)
                .ok_or_else(|| ServerError::NoAddress(config.iface_prefix.clone())),
        }
    }

    pub fn bind(config: &BrokerConfig, ctx: Arc<BrokerCtx>) -> Result<Server, ServerError> {
        let ip = Self::resolve_bind_ip(config)?;
        let listener = TcpListener::bind((ip, config.port)).map_err(ServerError::Bind)?;
        listener.set_nonblocking(true).map_err(ServerError::Bind)?;

        let reactor = Reactor::new().map_err(ServerError::Reactor)?;
        reactor
            .add(listener.as_raw_fd(), false)
            .map_err(ServerError::Reactor)?;

        Ok(Server {
            listener,
            reactor: Arc::new(reactor),
            conns: Arc::new(Mutex::new(HashMap::new())),
            ctx,
            workers: config.workers.max(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `stop` is set. Returns cleanly on shutdown; only
    /// reactor-level failures are errors.
    pub fn run(&self, stop: &AtomicBool) -> io::Result<()> {
        let (tx, rx) = bounded(defs::WORKER_QUEUE_DEPTH);
        let workers = self.spawn_workers(rx);

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; defs::MAX_EVENTS];
        while !stop.load(Ordering::Relaxed) {
            let nready = self.reactor.wait(&mut events, defs::WAIT_TIMEOUT_MS)?;

            for event in &events[..nready] {
                let fd = event.u64 as RawFd;
                let revents = event.events;

                if fd == self.listener.as_raw_fd() {
                    self.accept_ready();
                } else if revents & EV_CLOSED != 0 {
                    self.cleanup(fd);
                } else {
                    let conn = self.conns.lock().unwrap().get(&fd).cloned();
                    if let Some(conn) = conn {
                        // A full queue blocks the reactor until a worker
                        // frees up.
                        if tx.send((fd, conn)).is_err() {
                            break;
                        }
                    }
                }
            }
        }

        drop(tx);
        for worker in workers {
            if let Err(e) = worker.join() {
                error!("worker panicked: {e:?}");
            }
        }
        Ok(())
    }

    fn spawn_workers(&self, rx: Receiver<(RawFd, Arc<Mutex<Connection>>)>) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|i| {
                let rx = rx.clone();
                let reactor = self.reactor.clone();
                let conns = self.conns.clone();
                thread::Builder::new()
                    .name(format!("broker-worker{i}"))
                    .spawn(move || worker_loop(rx, reactor, conns))
                    .expect("failed to spawn worker thread")
            })
            .collect()
    }

    fn accept_ready(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(%peer, "failed to set non-blocking: {e}");
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    let conn = Arc::new(Mutex::new(Connection::new(stream, peer, self.ctx.clone())));
                    self.conns.lock().unwrap().insert(fd, conn);
                    if let Err(e) = self.reactor.add(fd, true) {
                        warn!(%peer, "failed to register connection: {e}");
                        self.conns.lock().unwrap().remove(&fd);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn cleanup(&self, fd: RawFd) {
        let _ = self.reactor.delete(fd);
        // Dropping the connection closes its socket.
        self.conns.lock().unwrap().remove(&fd);
    }
}

fn worker_loop(
    rx: Receiver<(RawFd, Arc<Mutex<Connection>>)>,
    reactor: Arc<Reactor>,
    conns: ConnTable,
) {
    while let Ok((fd, conn)) = rx.recv() {
        let outcome = conn.lock().unwrap().process();
        match outcome {
            ConnOutcome::Rearm { writable } => {
                if let Err(e) = reactor.rearm(fd, writable) {
                    warn!(fd, "rearm failed, dropping connection: {e}");
                    let _ = reactor.delete(fd);
                    conns.lock().unwrap().remove(&fd);
                }
            }
            ConnOutcome::Close => {
                let _ = reactor.delete(fd);
                conns.lock().unwrap().remove(&fd);
            }
        }
    }
}

/// Open every configured device and register it with the manager. A device
/// that cannot be opened is fatal, matching the startup contract.
pub fn register_devices(
    manager: &Manager,
    backend: &dyn NvmBackend,
    config: &BrokerConfig,
) -> Result<usize, ocnvm::DeviceError> {
    let devices = config.device_list();
    for device in &devices {
        let unit = ocpool::Unit::open(
            backend,
            manager.ip(),
            &device.path,
            device.numa_id,
            config.shared_pool_size,
        )?;
        info!(path = %device.path, "registered unit");
        manager.add_unit(unit);
    }
    Ok(devices.len())
}
