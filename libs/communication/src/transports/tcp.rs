//! TCP connection wrapper
//!
//! [`TcpConnection`] is the pooled resource behind every accepted socket. It
//! frames messages with a u32 length prefix, buffers partial input so
//! callers can poll without blocking, can peek at the next frame without
//! consuming it, and follows the close protocol: a locally closed
//! connection makes an effort to send a close-communication frame first.
//!
//! Reads and writes use separate handles on the same socket, each behind its
//! own lock, so a polling reader never waits for a slow writer.

use crate::codec::{decode_frame, encode_frame, FRAME_HEADER_LEN};
use crate::transports::ConnectionType;
use crate::{CommunicationError, Message, Resource, Result};
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;

/// How long `close` waits for an in-flight write before giving up on the
/// close-communication frame
const CLOSE_FRAME_WAIT: Duration = Duration::from_millis(100);

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

/// Who is on the other end, and since when
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    /// Process-unique connection number
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub established_at: SystemTime,
}

/// TCP connection statistics
#[derive(Debug, Clone)]
pub struct TcpConnectionStats {
    pub peer_addr: SocketAddr,
    pub connected_duration: Duration,
    pub last_activity: Duration,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

type ClosedListener = Arc<dyn Fn(&ConnectionIdentity) + Send + Sync>;

struct ConnectionReader {
    stream: TcpStream,
    pending: BytesMut,
}

#[derive(Debug, Default, Clone, Copy)]
struct Fill {
    bytes: usize,
    eof: bool,
}

impl ConnectionReader {
    /// Pull what the socket has without blocking, until `limit` bytes are
    /// buffered.
    ///
    /// The caller must hold the writer lock: non-blocking mode is a property
    /// of the socket, shared by the writer's handle.
    fn fill_available(&mut self, limit: usize) -> std::io::Result<Fill> {
        self.stream.set_nonblocking(true)?;
        let result = self.fill_nonblocking(limit);
        let restored = self.stream.set_nonblocking(false);
        let fill = result?;
        restored?;
        Ok(fill)
    }

    fn fill_nonblocking(&mut self, limit: usize) -> std::io::Result<Fill> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut fill = Fill::default();

        while self.pending.len() < limit {
            let want = READ_CHUNK.min(limit - self.pending.len());
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    fill.eof = true;
                    return Ok(fill);
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    fill.bytes += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(fill),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(fill)
    }

    fn take_frame(&mut self, max_message_size: usize) -> Result<Option<(Message, usize)>> {
        match decode_frame(&self.pending, max_message_size)? {
            Some((message, used)) => {
                self.pending.advance(used);
                Ok(Some((message, used)))
            }
            None => Ok(None),
        }
    }
}

/// Framed, poolable TCP connection
pub struct TcpConnection {
    identity: ConnectionIdentity,
    connection_type: ConnectionType,
    writer: Mutex<TcpStream>,
    reader: Mutex<ConnectionReader>,
    /// Unlocked handle used only to shut the socket down
    control: TcpStream,
    max_message_size: usize,
    closed: AtomicBool,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    closed_listeners: Mutex<Vec<ClosedListener>>,
}

impl TcpConnection {
    /// Wrap a connected socket whose handshake has been read
    pub fn new(
        stream: TcpStream,
        connection_type: ConnectionType,
        max_message_size: usize,
    ) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %peer_addr, "Failed to set TCP_NODELAY: {}", e);
        }
        let clone = |stream: &TcpStream| {
            stream.try_clone().map_err(|e| {
                CommunicationError::connection_with_source(
                    "Could not establish communication",
                    Some(peer_addr),
                    e,
                )
            })
        };
        let reader = clone(&stream)?;
        let control = clone(&stream)?;

        let now = Instant::now();
        Ok(Self {
            identity: ConnectionIdentity {
                id: CONNECTION_IDS.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                established_at: SystemTime::now(),
            },
            connection_type,
            writer: Mutex::new(stream),
            reader: Mutex::new(ConnectionReader {
                stream: reader,
                pending: BytesMut::with_capacity(READ_CHUNK),
            }),
            control,
            max_message_size,
            closed: AtomicBool::new(false),
            connected_at: now,
            last_activity: Mutex::new(now),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            closed_listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.identity.peer_addr
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one pre-encoded frame
    pub fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(CommunicationError::connection(
                "Connection closed",
                Some(self.peer_addr()),
            ));
        }

        {
            let mut writer = self.writer.lock();
            writer
                .write_all(frame)
                .and_then(|_| writer.flush())
                .map_err(|e| {
                    CommunicationError::connection_with_source(
                        "Failed to write message",
                        Some(self.peer_addr()),
                        e,
                    )
                })?;
        }

        let total = self.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed)
            + frame.len() as u64;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();

        debug!(
            peer = %self.peer_addr(),
            bytes = frame.len(),
            total_sent = total,
            "Sent frame over TCP"
        );
        Ok(())
    }

    /// Encode and write one message
    pub fn send_message(&self, message: &Message) -> Result<usize> {
        let frame = encode_frame(message, self.max_message_size)?;
        self.send_frame(&frame)?;
        Ok(frame.len())
    }

    /// Read one message if a complete frame has arrived.
    ///
    /// Never blocks on the socket. Returns `Ok(None)` when no complete frame
    /// is buffered yet, and an error once the peer has gone away.
    pub fn try_read_message(&self) -> Result<Option<Message>> {
        Ok(self.try_read_frame()?.map(|(message, _)| message))
    }

    /// As [`try_read_message`](Self::try_read_message), also returning the
    /// frame's size on the wire
    pub fn try_read_frame(&self) -> Result<Option<(Message, usize)>> {
        let mut reader = self.reader.lock();

        if let Some((message, used)) = reader.take_frame(self.max_message_size)? {
            self.record_receive(used);
            return Ok(Some((message, used)));
        }

        let fill = self.fill(&mut reader)?;

        if let Some((message, used)) = reader.take_frame(self.max_message_size)? {
            self.record_receive(used);
            return Ok(Some((message, used)));
        }

        if fill.eof {
            return Err(CommunicationError::connection(
                "Connection closed by peer",
                Some(self.peer_addr()),
            ));
        }
        Ok(None)
    }

    /// Check whether the peer has announced or forced a shutdown.
    ///
    /// Looks at the next buffered frame without consuming it. A
    /// close-communication frame, end of stream or a read error all count as
    /// shut down; an ordinary frame or no input does not.
    pub fn peek_peer_shutdown(&self) -> bool {
        let mut reader = self.reader.lock();

        let fill = match self.fill(&mut reader) {
            Ok(fill) => fill,
            Err(_) => return true,
        };

        match decode_frame(&reader.pending, self.max_message_size) {
            Ok(Some((message, _))) => message.is_close_communication(),
            Ok(None) => fill.eof,
            Err(_) => true,
        }
    }

    pub fn add_closed_listener<F>(&self, listener: F)
    where
        F: Fn(&ConnectionIdentity) + Send + Sync + 'static,
    {
        self.closed_listeners.lock().push(Arc::new(listener));
    }

    pub fn stats(&self) -> TcpConnectionStats {
        TcpConnectionStats {
            peer_addr: self.peer_addr(),
            connected_duration: self.connected_at.elapsed(),
            last_activity: self.last_activity.lock().elapsed(),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    fn fill(&self, reader: &mut ConnectionReader) -> Result<Fill> {
        // A writer mid-frame owns the socket's blocking mode; try again later.
        let Some(_writer) = self.writer.try_lock() else {
            return Ok(Fill::default());
        };

        // One frame at most; a peer that never pauses is read on later passes.
        let limit = self.max_message_size.saturating_add(FRAME_HEADER_LEN);
        reader.fill_available(limit).map_err(|e| {
            CommunicationError::connection_with_source(
                "Failed to read from connection",
                Some(self.peer_addr()),
                e,
            )
        })
    }

    fn record_receive(&self, bytes: usize) {
        let total = self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();

        debug!(
            peer = %self.peer_addr(),
            bytes,
            total_received = total,
            "Received frame over TCP"
        );
    }
}

impl Resource for TcpConnection {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Announce an orderly close.
        if let Some(mut writer) = self.writer.try_lock_for(CLOSE_FRAME_WAIT) {
            if let Ok(frame) = encode_frame(&Message::close_communication(), self.max_message_size)
            {
                let _ = writer.write_all(&frame).and_then(|_| writer.flush());
            }
        }

        // Unblocks any writer or reader still parked on the socket.
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            debug!(peer = %self.peer_addr(), "Socket shutdown failed: {}", e);
        }

        debug!(
            peer = %self.peer_addr(),
            connection_type = %self.connection_type,
            "Closed TCP connection"
        );

        let listeners: Vec<ClosedListener> = self.closed_listeners.lock().clone();
        for listener in listeners {
            listener(&self.identity);
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("identity", &self.identity)
            .field("connection_type", &self.connection_type)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_frame, write_frame};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    const MAX: usize = 1024 * 1024;

    fn pair() -> (TcpConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            TcpConnection::new(server, ConnectionType::Report, MAX).unwrap(),
            client,
        )
    }

    fn stamped(seq: i64) -> Message {
        let mut msg = Message::new(1, format!("message {}", seq).into_bytes());
        msg.set_sender_information("test", "tcp-test", seq);
        msg
    }

    fn read_until_some(connection: &TcpConnection) -> Message {
        for _ in 0..200 {
            if let Some(msg) = connection.try_read_message().unwrap() {
                return msg;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("No message arrived");
    }

    #[test]
    fn test_fill_stops_at_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let mut reader = ConnectionReader {
            stream: server,
            pending: BytesMut::new(),
        };

        client.write_all(&[7u8; 10_000]).unwrap();
        thread::sleep(Duration::from_millis(50));

        let fill = reader.fill_available(100).unwrap();
        assert_eq!(fill.bytes, 100);
        assert_eq!(reader.pending.len(), 100);

        // A full buffer reads nothing more until frames are taken out.
        assert_eq!(reader.fill_available(100).unwrap().bytes, 0);
        reader.pending.advance(60);
        assert_eq!(reader.fill_available(100).unwrap().bytes, 60);
        assert_eq!(reader.pending.len(), 100);
    }

    #[test]
    fn test_max_size_frame_still_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let msg = Message::new(1, vec![3u8; 200]);
        let frame = encode_frame(&msg, MAX).unwrap();
        let limit = frame.len() - FRAME_HEADER_LEN;
        let connection = TcpConnection::new(server, ConnectionType::Report, limit).unwrap();

        // Follow the frame with more input than the buffer may hold.
        client.write_all(&frame).unwrap();
        client.write_all(&frame).unwrap();
        client.write_all(&frame).unwrap();

        for _ in 0..3 {
            assert!(read_until_some(&connection).payload_equals(&msg));
        }
    }

    #[test]
    fn test_try_read_without_input() {
        let (connection, _client) = pair();
        assert!(connection.try_read_message().unwrap().is_none());
    }

    #[test]
    fn test_try_read_complete_frames() {
        let (connection, mut client) = pair();
        write_frame(&mut client, &stamped(0), MAX).unwrap();
        write_frame(&mut client, &stamped(1), MAX).unwrap();

        assert_eq!(read_until_some(&connection).sequence_number(), 0);
        assert_eq!(read_until_some(&connection).sequence_number(), 1);
        assert_eq!(connection.stats().frames_received, 2);
    }

    #[test]
    fn test_partial_frame_waits_for_rest() {
        let (connection, mut client) = pair();
        let frame = encode_frame(&stamped(5), MAX).unwrap();

        client.write_all(&frame[..3]).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(connection.try_read_message().unwrap().is_none());

        client.write_all(&frame[3..]).unwrap();
        assert_eq!(read_until_some(&connection).sequence_number(), 5);
    }

    #[test]
    fn test_peer_disconnect_is_error() {
        let (connection, client) = pair();
        drop(client);
        thread::sleep(Duration::from_millis(20));

        let err = connection.try_read_message().unwrap_err();
        assert_eq!(err.category(), "connection");
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (connection, mut client) = pair();
        write_frame(&mut client, &stamped(0), MAX).unwrap();
        thread::sleep(Duration::from_millis(20));

        assert!(!connection.peek_peer_shutdown());
        assert_eq!(read_until_some(&connection).sequence_number(), 0);
    }

    #[test]
    fn test_peek_detects_close_frame_and_eof() {
        let (connection, mut client) = pair();
        assert!(!connection.peek_peer_shutdown());

        write_frame(&mut client, &Message::close_communication(), MAX).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(connection.peek_peer_shutdown());

        let (connection, client) = pair();
        drop(client);
        thread::sleep(Duration::from_millis(20));
        assert!(connection.peek_peer_shutdown());
    }

    #[test]
    fn test_close_sends_close_frame_and_notifies_once() {
        let (connection, mut client) = pair();
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        connection.add_closed_listener(move |identity| {
            assert!(identity.id > 0);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        Resource::close(&connection);
        Resource::close(&connection);

        let msg = read_frame(&mut client, MAX).unwrap();
        assert!(msg.is_close_communication());
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(connection.send_message(&stamped(0)).is_err());
    }

    #[test]
    fn test_send_message_reaches_peer() {
        let (connection, mut client) = pair();
        connection.send_message(&stamped(3)).unwrap();

        let msg = read_frame(&mut client, MAX).unwrap();
        assert_eq!(msg.sequence_number(), 3);
        assert_eq!(connection.stats().frames_sent, 1);
    }
}
