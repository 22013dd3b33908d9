//! Server Receiver
//!
//! Receives from every connection of one [`ConnectionType`] accepted by an
//! [`Acceptor`]. A few polling threads cycle through the connection pool;
//! each reservation gives one thread exclusive use of a connection, so a
//! peer's frames are never read by two threads at once. Everything read is
//! funnelled into one queue that [`Receiver::wait_for_message`] drains.
//!
//! A polling thread is either active or idle. Reaching the pool's sentinel
//! after a pass that read nothing makes it idle: it sleeps for the configured
//! backoff before the next pass. Reading any frame makes it active again.

use super::{Receiver, ReceiverCore};
use crate::transports::{Acceptor, ConnectionType, TcpConnection};
use crate::{
    CommunicationConfig, CommunicationError, CommunicationMetrics, Message, MetricsTracker,
    ResourcePool, Result, ServerReceiverConfig,
};
use crossbeam_channel::{Receiver as StopSignal, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Receives from every pooled connection of one type
pub struct ServerReceiver {
    core: Arc<ReceiverCore>,
    metrics: MetricsTracker,
    /// Dropped at shutdown to wake idle polling threads
    stop: Mutex<Option<crossbeam_channel::Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    owned_acceptor: Option<Acceptor>,
}

impl std::fmt::Debug for ServerReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerReceiver").finish_non_exhaustive()
    }
}

impl ServerReceiver {
    /// Poll the `connection_type` pool of `acceptor` with `threads` threads
    pub fn receive_from(
        acceptor: &Acceptor,
        connection_type: ConnectionType,
        threads: usize,
    ) -> Result<Self> {
        Self::receive_from_with_config(
            acceptor,
            connection_type,
            &ServerReceiverConfig {
                threads,
                ..ServerReceiverConfig::default()
            },
        )
    }

    pub fn receive_from_with_config(
        acceptor: &Acceptor,
        connection_type: ConnectionType,
        config: &ServerReceiverConfig,
    ) -> Result<Self> {
        if config.threads == 0 {
            return Err(CommunicationError::configuration(
                "server receiver needs at least one thread",
                Some("server_receiver.threads"),
            ));
        }

        let pool = acceptor.socket_set(connection_type)?;
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let receiver = Self {
            core: Arc::new(ReceiverCore::new(config.check_sequence)),
            metrics: MetricsTracker::new(),
            stop: Mutex::new(Some(stop_tx)),
            threads: Mutex::new(Vec::with_capacity(config.threads)),
            owned_acceptor: None,
        };

        for index in 0..config.threads {
            let name = format!("server-receiver-{}", index);
            let poller = Poller {
                pool: pool.clone(),
                core: Arc::clone(&receiver.core),
                metrics: receiver.metrics.clone(),
                stop: stop_rx.clone(),
                backoff: config.idle_backoff(),
            };

            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || poller.run());

            match spawned {
                Ok(handle) => receiver.threads.lock().push(handle),
                Err(source) => {
                    receiver.shutdown();
                    return Err(CommunicationError::ThreadSpawn { name, source });
                }
            }
        }

        info!(
            address = %acceptor.local_addr(),
            connection_type = %connection_type,
            threads = config.threads,
            "Server receiver started"
        );
        Ok(receiver)
    }

    /// Listen with an acceptor owned by the receiver.
    ///
    /// Shutting the receiver down also shuts the acceptor down.
    pub fn bind_to(config: &CommunicationConfig, connection_type: ConnectionType) -> Result<Self> {
        let acceptor = Acceptor::from_config(config)?;
        let mut receiver =
            Self::receive_from_with_config(&acceptor, connection_type, &config.server_receiver)?;
        receiver.owned_acceptor = Some(acceptor);
        Ok(receiver)
    }

    /// The acceptor created by [`bind_to`](Self::bind_to)
    pub fn acceptor(&self) -> Option<&Acceptor> {
        self.owned_acceptor.as_ref()
    }

    pub fn metrics(&self) -> CommunicationMetrics {
        self.metrics.snapshot()
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }
}

impl Receiver for ServerReceiver {
    /// Concurrent callers each receive distinct messages
    fn wait_for_message(&self) -> Result<Option<Message>> {
        self.core.wait_for_message()
    }

    fn shutdown(&self) {
        self.core.shutdown();
        drop(self.stop.lock().take());

        let handles: Vec<_> = std::mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Server receiver thread exited abnormally");
            }
        }

        if let Some(acceptor) = &self.owned_acceptor {
            acceptor.shutdown();
        }
    }
}

impl Drop for ServerReceiver {
    fn drop(&mut self) {
        Receiver::shutdown(self);
    }
}

/// One polling thread's view of the receiver
struct Poller {
    pool: ResourcePool<TcpConnection>,
    core: Arc<ReceiverCore>,
    metrics: MetricsTracker,
    stop: StopSignal<()>,
    backoff: Duration,
}

enum Step {
    Idle,
    Read,
    Stop,
}

impl Poller {
    fn run(self) {
        let mut idle = false;

        loop {
            let reservation = self.pool.reserve_next();

            if reservation.is_sentinel() {
                drop(reservation);
                if self.stopped(idle) {
                    break;
                }
                idle = true;
                continue;
            }

            let Some(connection) = reservation.resource().cloned() else {
                continue;
            };

            if connection.is_closed() {
                reservation.close();
                continue;
            }

            let step = match connection.try_read_frame() {
                Ok(None) => {
                    reservation.free();
                    Step::Idle
                }
                Ok(Some((message, bytes))) if message.is_close_communication() => {
                    debug!(peer = %connection.peer_addr(), bytes, "Peer closed connection");
                    self.metrics.record_peer_closed();
                    reservation.close();
                    Step::Read
                }
                Ok(Some((message, bytes))) => {
                    self.metrics.record_receive(bytes);
                    let queued = self.core.queue().enqueue(message);
                    reservation.free();
                    if queued.is_err() {
                        Step::Stop
                    } else {
                        Step::Read
                    }
                }
                Err(e) => {
                    warn!(peer = %connection.peer_addr(), "Closing connection after read failure: {}", e);
                    self.metrics.record_error(e.category());
                    self.metrics.record_peer_closed();
                    reservation.close();
                    if self.core.queue().enqueue_error(e).is_err() {
                        Step::Stop
                    } else {
                        Step::Read
                    }
                }
            };

            match step {
                Step::Idle => {}
                Step::Read => idle = false,
                Step::Stop => break,
            }
        }

        debug!("Server receiver thread stopped");
    }

    /// Check for shutdown at the end of a pass, sleeping first if the pass
    /// read nothing
    fn stopped(&self, idle: bool) -> bool {
        if self.core.is_shutdown() {
            return true;
        }
        if idle {
            !matches!(
                self.stop.recv_timeout(self.backoff),
                Err(RecvTimeoutError::Timeout)
            )
        } else {
            !matches!(self.stop.try_recv(), Err(TryRecvError::Empty))
        }
    }
}
