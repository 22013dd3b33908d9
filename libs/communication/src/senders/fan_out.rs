//! Fan-out senders
//!
//! Broadcast each message to every member of a changing set of peers. The
//! frame is encoded once and written to all peers in parallel on a
//! [`Kernel`]; the broadcast returns when every write has finished.
//!
//! A peer whose write fails is closed and dropped from the set. The
//! broadcast itself still succeeds: one dead peer must not stop the others
//! from hearing about it. Failures are logged, counted in the sender's
//! metrics and reported to an optional [`PeerFailureListener`].

use super::{MessageWriter, QueuedSender, Sender, SenderCore};
use crate::codec::encode_frame;
use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::transports::{Acceptor, ConnectionType, TcpConnection};
use crate::{
    CommunicationConfig, CommunicationError, CommunicationMetrics, Kernel, Message,
    MetricsTracker, Reservation, ResourcePool, Result,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Told about every peer a fan-out sender drops
pub trait PeerFailureListener: Send + Sync {
    fn peer_failed(&self, peer: &str, error: &CommunicationError);
}

type FailureListener = Arc<RwLock<Option<Arc<dyn PeerFailureListener>>>>;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Run every task on the kernel and wait until all have finished or been
/// discarded by a kernel shutdown.
fn execute_all(kernel: &Kernel, tasks: Vec<Task>) -> Result<()> {
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(tasks.len());
    let mut result = Ok(());

    for task in tasks {
        let done = done_tx.clone();
        let submitted = kernel.execute(move || {
            task();
            let _ = done.send(());
        });
        if let Err(e) = submitted {
            result = Err(e);
            break;
        }
    }

    // Every task holds a sender; the channel disconnects once the last one
    // has run or been dropped.
    drop(done_tx);
    while done_rx.recv().is_ok() {}
    result
}

fn report_failure(
    metrics: &MetricsTracker,
    listener: &FailureListener,
    peer: &str,
    error: &CommunicationError,
) {
    warn!(peer = %peer, "Dropping peer after failed write: {}", error);
    metrics.record_error(error.category());
    metrics.record_peer_closed();
    let listener = listener.read().clone();
    if let Some(listener) = listener {
        listener.peer_failed(peer, error);
    }
}

struct ServerFanOutWriter {
    pool: ResourcePool<TcpConnection>,
    kernel: Kernel,
    max_message_size: usize,
    metrics: MetricsTracker,
    failure_listener: FailureListener,
}

impl ServerFanOutWriter {
    fn write_task(&self, reservation: Reservation<TcpConnection>, frame: Bytes) -> Task {
        let metrics = self.metrics.clone();
        let failure_listener = Arc::clone(&self.failure_listener);

        Box::new(move || {
            let Some(connection) = reservation.resource().cloned() else {
                return;
            };

            let started = Instant::now();
            match connection.send_frame(&frame) {
                Ok(()) => {
                    metrics.record_send(frame.len(), started.elapsed());
                    reservation.free();
                }
                Err(e) => {
                    reservation.close();
                    let peer = connection.peer_addr().to_string();
                    report_failure(&metrics, &failure_listener, &peer, &e);
                }
            }
        })
    }
}

impl MessageWriter for ServerFanOutWriter {
    fn write_message(&self, message: &Message) -> Result<()> {
        let frame = encode_frame(message, self.max_message_size)?;
        let reservations = self.pool.reserve_all();
        if reservations.is_empty() {
            return Ok(());
        }

        debug!(peers = reservations.len(), bytes = frame.len(), "Broadcasting frame");
        let tasks = reservations
            .into_iter()
            .map(|reservation| self.write_task(reservation, frame.clone()))
            .collect();
        execute_all(&self.kernel, tasks)
    }

    fn close(&self) {
        self.kernel.force_shutdown();
    }
}

/// Broadcasts to every accepted connection of one type
pub struct FanOutServerSender {
    core: SenderCore<ServerFanOutWriter>,
    owned_acceptor: Option<Acceptor>,
}

impl FanOutServerSender {
    /// Broadcast to the `connection_type` pool of `acceptor`, writing with
    /// `threads` kernel threads.
    ///
    /// Frames are limited to the acceptor's `max_message_size`.
    pub fn new(
        process_id: impl Into<String>,
        acceptor: &Acceptor,
        connection_type: ConnectionType,
        threads: usize,
    ) -> Result<Self> {
        Self::build(
            process_id,
            acceptor,
            connection_type,
            threads,
            acceptor.max_message_size(),
        )
    }

    /// As [`new`](Self::new), with the kernel size and frame limit from
    /// `config`
    pub fn with_config(
        process_id: impl Into<String>,
        acceptor: &Acceptor,
        connection_type: ConnectionType,
        config: &CommunicationConfig,
    ) -> Result<Self> {
        Self::build(
            process_id,
            acceptor,
            connection_type,
            config.kernel.threads,
            config.max_message_size,
        )
    }

    fn build(
        process_id: impl Into<String>,
        acceptor: &Acceptor,
        connection_type: ConnectionType,
        threads: usize,
        max_message_size: usize,
    ) -> Result<Self> {
        let pool = acceptor.socket_set(connection_type)?;
        let discriminator = format!("fan-out:{}:{}", acceptor.local_addr(), connection_type);

        Ok(Self {
            core: SenderCore::new(
                process_id,
                &discriminator,
                ServerFanOutWriter {
                    pool,
                    kernel: Kernel::new(threads)?,
                    max_message_size,
                    metrics: MetricsTracker::new(),
                    failure_listener: Arc::new(RwLock::new(None)),
                },
            ),
            owned_acceptor: None,
        })
    }

    /// Listen with an acceptor owned by the sender, built from the
    /// `acceptor` and `pool` sections of `config`.
    ///
    /// Shutting the sender down also shuts the acceptor down.
    pub fn bind_to(
        process_id: impl Into<String>,
        config: &CommunicationConfig,
        connection_type: ConnectionType,
    ) -> Result<Self> {
        let acceptor = Acceptor::from_config(config)?;
        let mut sender = Self::with_config(process_id, &acceptor, connection_type, config)?;
        sender.owned_acceptor = Some(acceptor);
        Ok(sender)
    }

    /// The acceptor created by [`bind_to`](Self::bind_to)
    pub fn acceptor(&self) -> Option<&Acceptor> {
        self.owned_acceptor.as_ref()
    }

    pub fn set_failure_listener(&self, listener: Arc<dyn PeerFailureListener>) {
        *self.core.writer().failure_listener.write() = Some(listener);
    }

    pub fn metrics(&self) -> CommunicationMetrics {
        self.core.writer().metrics.snapshot()
    }

    pub fn instance_id(&self) -> &str {
        self.core.instance_id()
    }

    /// Check every peer for a close-communication message or a dead socket.
    ///
    /// Peers found shut down are closed. Unrelated input is left unread.
    pub fn is_peer_shutdown(&self) -> bool {
        let writer = self.core.writer();
        let mut found = false;

        for reservation in writer.pool.reserve_all() {
            let shut_down = reservation
                .resource()
                .map_or(false, |connection| connection.peek_peer_shutdown());

            if shut_down {
                if let Some(connection) = reservation.resource() {
                    debug!(peer = %connection.peer_addr(), "Peer has shut down");
                }
                writer.metrics.record_peer_closed();
                reservation.close();
                found = true;
            } else {
                reservation.free();
            }
        }
        found
    }
}

impl Sender for FanOutServerSender {
    fn send(&self, message: Message) -> Result<()> {
        self.core.send(message)
    }

    /// Abandons in-flight writes; the peers are assumed gone
    fn shutdown(&self) {
        self.core.shutdown();
        if let Some(acceptor) = &self.owned_acceptor {
            acceptor.shutdown();
        }
    }
}

impl QueuedSender for FanOutServerSender {
    fn queue(&self, message: Message) -> Result<()> {
        self.core.queue(message)
    }

    fn flush(&self) -> Result<()> {
        self.core.flush()
    }
}

impl Drop for FanOutServerSender {
    fn drop(&mut self) {
        Sender::shutdown(self);
    }
}

/// Identifies a stream registered with a [`FanOutStreamSender`]
pub type StreamId = u64;

type SharedStream = Arc<Mutex<Box<dyn Write + Send>>>;
type StreamSet = Arc<Mutex<HashMap<StreamId, SharedStream>>>;

struct StreamFanOutWriter {
    streams: StreamSet,
    next_id: AtomicU64,
    kernel: Kernel,
    max_message_size: usize,
    metrics: MetricsTracker,
    failure_listener: FailureListener,
}

impl MessageWriter for StreamFanOutWriter {
    fn write_message(&self, message: &Message) -> Result<()> {
        let frame = encode_frame(message, self.max_message_size)?;
        let targets: Vec<(StreamId, SharedStream)> = self
            .streams
            .lock()
            .iter()
            .map(|(id, stream)| (*id, Arc::clone(stream)))
            .collect();

        let tasks: Vec<Task> = targets
            .into_iter()
            .map(|(id, stream)| {
                let frame = frame.clone();
                let streams = Arc::clone(&self.streams);
                let metrics = self.metrics.clone();
                let failure_listener = Arc::clone(&self.failure_listener);

                Box::new(move || {
                    let started = Instant::now();
                    let written = {
                        let mut stream = stream.lock();
                        stream.write_all(&frame).and_then(|_| stream.flush())
                    };

                    match written {
                        Ok(()) => metrics.record_send(frame.len(), started.elapsed()),
                        Err(e) => {
                            streams.lock().remove(&id);
                            let error = CommunicationError::from(e);
                            let peer = format!("stream-{}", id);
                            report_failure(&metrics, &failure_listener, &peer, &error);
                        }
                    }
                }) as Task
            })
            .collect();

        execute_all(&self.kernel, tasks)
    }

    fn close(&self) {
        self.kernel.force_shutdown();
    }
}

/// Broadcasts to a set of registered output streams
pub struct FanOutStreamSender {
    core: SenderCore<StreamFanOutWriter>,
}

impl FanOutStreamSender {
    pub fn new(process_id: impl Into<String>, threads: usize) -> Result<Self> {
        Self::build(process_id, threads, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Kernel size and frame limit taken from `config`
    pub fn with_config(
        process_id: impl Into<String>,
        config: &CommunicationConfig,
    ) -> Result<Self> {
        Self::build(process_id, config.kernel.threads, config.max_message_size)
    }

    fn build(
        process_id: impl Into<String>,
        threads: usize,
        max_message_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            core: SenderCore::new(
                process_id,
                "fan-out-streams",
                StreamFanOutWriter {
                    streams: Arc::new(Mutex::new(HashMap::new())),
                    next_id: AtomicU64::new(1),
                    kernel: Kernel::new(threads)?,
                    max_message_size,
                    metrics: MetricsTracker::new(),
                    failure_listener: Arc::new(RwLock::new(None)),
                },
            ),
        })
    }

    /// Register a stream; it receives every later broadcast
    pub fn add<W: Write + Send + 'static>(&self, stream: W) -> StreamId {
        let writer = self.core.writer();
        let id = writer.next_id.fetch_add(1, Ordering::Relaxed);
        let stream: Box<dyn Write + Send> = Box::new(stream);
        writer.streams.lock().insert(id, Arc::new(Mutex::new(stream)));
        id
    }

    /// Stop broadcasting to a stream. Returns false if it was not registered.
    pub fn remove(&self, id: StreamId) -> bool {
        self.core.writer().streams.lock().remove(&id).is_some()
    }

    pub fn stream_count(&self) -> usize {
        self.core.writer().streams.lock().len()
    }

    pub fn set_failure_listener(&self, listener: Arc<dyn PeerFailureListener>) {
        *self.core.writer().failure_listener.write() = Some(listener);
    }

    pub fn metrics(&self) -> CommunicationMetrics {
        self.core.writer().metrics.snapshot()
    }
}

impl Sender for FanOutStreamSender {
    fn send(&self, message: Message) -> Result<()> {
        self.core.send(message)
    }

    fn shutdown(&self) {
        self.core.shutdown();
    }
}

impl QueuedSender for FanOutStreamSender {
    fn queue(&self, message: Message) -> Result<()> {
        self.core.queue(message)
    }

    fn flush(&self) -> Result<()> {
        self.core.flush()
    }
}

impl Drop for FanOutStreamSender {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}
