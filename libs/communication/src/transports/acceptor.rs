//! Connection Acceptor
//!
//! Listens on one TCP port with a configurable number of accept threads.
//! Every accepted socket must announce its [`ConnectionType`] with one byte;
//! the connection then joins the [`ResourcePool`] for that type. Handshake
//! failures never reach the accept loop's caller: the socket is closed and
//! the error is queued for [`Acceptor::pending_exception`].

use crate::transports::{ConnectionType, TcpConnection};
use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::{
    AcceptorConfig, CommunicationConfig, CommunicationError, PoolConfig, PoolListener,
    ResourcePool, Result, ThreadSafeQueue,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

struct AcceptorShared {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    pools: Mutex<HashMap<ConnectionType, ResourcePool<TcpConnection>>>,
    exceptions: ThreadSafeQueue<CommunicationError>,
    /// Sockets still sending their handshake, so shutdown can interrupt them
    handshakes: Mutex<HashMap<u64, TcpStream>>,
    next_handshake: AtomicU64,
    shutdown: AtomicBool,
    live_threads: AtomicUsize,
    thread_total: usize,
    config: AcceptorConfig,
    pool_config: PoolConfig,
    max_message_size: usize,
}

/// Accepts and classifies inbound connections
pub struct Acceptor {
    shared: Arc<AcceptorShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor").finish_non_exhaustive()
    }
}

impl Acceptor {
    /// Listen on `address:port` with `threads` accept threads.
    ///
    /// An empty address listens on all interfaces; port 0 picks a free port.
    pub fn bind(address: &str, port: u16, threads: usize) -> Result<Self> {
        Self::new(&AcceptorConfig {
            address: address.to_string(),
            port,
            threads,
            ..AcceptorConfig::default()
        })
    }

    pub fn new(config: &AcceptorConfig) -> Result<Self> {
        Self::build(config, &PoolConfig::default(), DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Listen with the acceptor and pool sections of `config`; accepted
    /// connections use its `max_message_size`
    pub fn from_config(config: &CommunicationConfig) -> Result<Self> {
        Self::build(&config.acceptor, &config.pool, config.max_message_size)
    }

    fn build(
        config: &AcceptorConfig,
        pool_config: &PoolConfig,
        max_message_size: usize,
    ) -> Result<Self> {
        if config.threads == 0 {
            return Err(CommunicationError::configuration(
                "acceptor needs at least one thread",
                Some("acceptor.threads"),
            ));
        }

        let listener = bind_listener(&config.address, config.port)?;
        let local_addr = listener.local_addr()?;

        let mut thread_listeners = Vec::with_capacity(config.threads);
        for _ in 0..config.threads {
            thread_listeners.push(listener.try_clone()?);
        }

        let shared = Arc::new(AcceptorShared {
            local_addr,
            listener: Mutex::new(Some(listener)),
            pools: Mutex::new(HashMap::new()),
            exceptions: ThreadSafeQueue::new("Acceptor"),
            handshakes: Mutex::new(HashMap::new()),
            next_handshake: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            live_threads: AtomicUsize::new(0),
            thread_total: config.threads,
            config: config.clone(),
            pool_config: pool_config.clone(),
            max_message_size,
        });

        let acceptor = Acceptor {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::with_capacity(config.threads)),
        };

        for (index, thread_listener) in thread_listeners.into_iter().enumerate() {
            let name = format!("acceptor-{}-{}", local_addr.port(), index);
            let thread_shared = Arc::clone(&shared);

            shared.live_threads.fetch_add(1, Ordering::SeqCst);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || accept_loop(thread_shared, thread_listener));

            match spawned {
                Ok(handle) => acceptor.threads.lock().push(handle),
                Err(source) => {
                    shared.live_threads.fetch_sub(1, Ordering::SeqCst);
                    acceptor.shutdown();
                    return Err(CommunicationError::ThreadSpawn { name, source });
                }
            }
        }

        info!(
            address = %local_addr,
            threads = config.threads,
            "Acceptor listening"
        );
        Ok(acceptor)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn port(&self) -> u16 {
        self.shared.local_addr.port()
    }

    /// Frame limit of accepted connections
    pub fn max_message_size(&self) -> usize {
        self.shared.max_message_size
    }

    /// Pool of accepted connections of one type, created on first use
    pub fn socket_set(&self, connection_type: ConnectionType) -> Result<ResourcePool<TcpConnection>> {
        self.shared.pool(connection_type)
    }

    /// Observe connections of one type joining and leaving
    pub fn add_listener(
        &self,
        connection_type: ConnectionType,
        listener: Arc<dyn PoolListener<TcpConnection>>,
    ) -> Result<()> {
        self.shared.pool(connection_type)?.add_listener(listener);
        Ok(())
    }

    /// Next queued handshake failure.
    ///
    /// With `block` set, waits until one is queued. Returns `None` when
    /// nothing is queued or the acceptor has shut down.
    pub fn pending_exception(&self, block: bool) -> Option<CommunicationError> {
        self.shared.exceptions.dequeue(block).ok().flatten()
    }

    /// Accept threads still running
    pub fn thread_count(&self) -> usize {
        self.shared.live_threads.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Stop listening, close every pooled connection and stop the accept
    /// threads. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown();

        let handles: Vec<_> = std::mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Acceptor thread exited abnormally");
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AcceptorShared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn pool(&self, connection_type: ConnectionType) -> Result<ResourcePool<TcpConnection>> {
        let mut pools = self.pools.lock();
        if self.is_shutdown() {
            return Err(CommunicationError::shutdown("Acceptor"));
        }
        Ok(pools
            .entry(connection_type)
            .or_insert_with(|| ResourcePool::new(&self.pool_config))
            .clone())
    }

    fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let ticket = self.next_handshake.fetch_add(1, Ordering::Relaxed);
        if let Ok(clone) = stream.try_clone() {
            self.handshakes.lock().insert(ticket, clone);
        }

        let handshake = stream
            .set_read_timeout(Some(self.config.handshake_timeout()))
            .map_err(CommunicationError::from)
            .and_then(|_| ConnectionType::read(&mut stream, Some(peer)))
            .and_then(|connection_type| {
                stream.set_read_timeout(None)?;
                Ok(connection_type)
            });

        self.handshakes.lock().remove(&ticket);

        let connection = handshake.and_then(|connection_type| {
            TcpConnection::new(stream, connection_type, self.max_message_size)
        });

        let connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                if !self.is_shutdown() {
                    warn!(peer = %peer, "Rejected connection: {}", e);
                    let _ = self.exceptions.queue(e);
                }
                return;
            }
        };

        let connection_type = connection.connection_type();
        let pool = match self.pool(connection_type) {
            Ok(pool) => pool,
            Err(_) => return,
        };

        connection.add_closed_listener(move |identity| {
            debug!(peer = %identity.peer_addr, id = identity.id, "Pooled connection closed");
        });
        pool.add(connection);

        info!(peer = %peer, connection_type = %connection_type, "Accepted connection");
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(address = %self.local_addr, "Acceptor shutting down");

        let listener = self.listener.lock().take();
        self.wake_accept_threads();
        drop(listener);

        for (_, stream) in self.handshakes.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let pools: Vec<_> = self.pools.lock().values().cloned().collect();
        for pool in pools {
            pool.close();
        }

        self.exceptions.shutdown();
    }

    /// Accept calls cannot be cancelled; connect once per thread so each
    /// returns and sees the shutdown flag.
    fn wake_accept_threads(&self) {
        let target = match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.local_addr.port())
            }
            IpAddr::V6(ip) if ip.is_unspecified() => {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), self.local_addr.port())
            }
            _ => self.local_addr,
        };

        for _ in 0..self.thread_total {
            if self.live_threads.load(Ordering::SeqCst) == 0 {
                break;
            }
            if let Err(e) = TcpStream::connect_timeout(&target, WAKE_CONNECT_TIMEOUT) {
                debug!(address = %target, "Acceptor wake-up connect failed: {}", e);
                break;
            }
        }
    }
}

fn bind_listener(address: &str, port: u16) -> Result<TcpListener> {
    if address.is_empty() {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(|e| {
            CommunicationError::connection_with_source(
                format!("Could not bind to port '{}' on local interfaces", port),
                None,
                e,
            )
        })
    } else {
        TcpListener::bind((address, port)).map_err(|e| {
            CommunicationError::connection_with_source(
                format!("Could not bind to address '{}:{}'", address, port),
                None,
                e,
            )
        })
    }
}

fn accept_loop(shared: Arc<AcceptorShared>, listener: TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if shared.is_shutdown() {
                    break;
                }
                shared.handle_connection(stream, peer);
            }
            Err(e) => {
                if !shared.is_shutdown() {
                    error!(address = %shared.local_addr, "Accept failed, stopping acceptor: {}", e);
                }
                break;
            }
        }
    }

    drop(listener);
    shared.live_threads.fetch_sub(1, Ordering::SeqCst);
    // Best effort: a failed accept thread takes the acceptor down with it.
    shared.shutdown();
}
