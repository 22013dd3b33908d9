//! Point-to-point receivers
//!
//! [`StreamReceiver`] reads frames straight off a byte stream on the caller's
//! thread. [`ClientReceiver`] is a stream receiver over a TCP connection it
//! opened itself.

use super::{Receiver, SequenceChecker};
use crate::codec::read_frame;
use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::transports::Connector;
use crate::{CommunicationConfig, Message, Result};
use parking_lot::Mutex;
use std::io::{BufReader, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

struct StreamState<R> {
    reader: R,
    checker: SequenceChecker,
}

/// Receives messages from one byte stream
pub struct StreamReceiver<R: Read + Send> {
    state: Mutex<StreamState<R>>,
    shutdown: AtomicBool,
    max_message_size: usize,
}

impl<R: Read + Send> StreamReceiver<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_message_size(reader, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(reader: R, max_message_size: usize) -> Self {
        Self {
            state: Mutex::new(StreamState {
                reader,
                checker: SequenceChecker::new(),
            }),
            shutdown: AtomicBool::new(false),
            max_message_size,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl<R: Read + Send> Receiver for StreamReceiver<R> {
    /// Read the next frame from the stream.
    ///
    /// A close-communication frame shuts the receiver down and returns
    /// `Ok(None)`; so does any read once shut down. A sequence gap is
    /// reported by the call after the one that delivered the message.
    fn wait_for_message(&self) -> Result<Option<Message>> {
        if self.is_shutdown() {
            return Ok(None);
        }

        let mut state = self.state.lock();
        if let Some(error) = state.checker.take_error() {
            return Err(error);
        }

        match read_frame(&mut state.reader, self.max_message_size) {
            Ok(message) if message.is_close_communication() => {
                debug!("Peer closed the stream");
                self.shutdown.store(true, Ordering::Release);
                Ok(None)
            }
            Ok(message) => {
                state.checker.check(&message);
                Ok(Some(message))
            }
            Err(_) if self.is_shutdown() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Later calls return `Ok(None)`. A read already blocked on the stream
    /// is only woken by closing the stream.
    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Stream receiver over a TCP connection to a server
pub struct ClientReceiver {
    inner: StreamReceiver<BufReader<TcpStream>>,
    socket: TcpStream,
}

impl ClientReceiver {
    /// Connect, announce the connection type and start receiving
    pub fn connect(connector: &Connector) -> Result<Self> {
        Self::connect_with_config(connector, &CommunicationConfig::default())
    }

    pub fn connect_with_config(connector: &Connector, config: &CommunicationConfig) -> Result<Self> {
        let stream = connector.connect()?;
        let socket = stream.try_clone()?;

        Ok(Self {
            inner: StreamReceiver::with_max_message_size(
                BufReader::new(stream),
                config.max_message_size,
            ),
            socket,
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }
}

impl Receiver for ClientReceiver {
    fn wait_for_message(&self) -> Result<Option<Message>> {
        self.inner.wait_for_message()
    }

    /// Closes the connection, waking a blocked reader
    fn shutdown(&self) {
        if self.inner.is_shutdown() {
            return;
        }
        self.inner.shutdown();
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            debug!("Client socket shutdown failed: {}", e);
        }
    }
}

impl Drop for ClientReceiver {
    fn drop(&mut self) {
        Receiver::shutdown(self);
    }
}
