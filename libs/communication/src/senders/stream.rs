//! Point-to-point senders
//!
//! [`StreamSender`] writes one frame per message to any byte stream and
//! flushes after each. [`ClientSender`] is a stream sender over a TCP
//! connection it opened itself.

use super::{MessageWriter, QueuedSender, Sender, SenderCore};
use crate::codec::write_frame;
use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::transports::Connector;
use crate::{CommunicationConfig, Message, Result};
use parking_lot::Mutex;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use tracing::debug;

/// Writes frames to a byte stream
pub struct StreamWriter<W> {
    stream: Mutex<W>,
    max_message_size: usize,
}

impl<W: Write + Send> MessageWriter for StreamWriter<W> {
    fn write_message(&self, message: &Message) -> Result<()> {
        let mut stream = self.stream.lock();
        let bytes = write_frame(&mut *stream, message, self.max_message_size)?;
        debug!(bytes, "Sent frame over stream");
        Ok(())
    }

    fn announces_shutdown(&self) -> bool {
        true
    }

    fn close(&self) {
        let _ = self.stream.lock().flush();
    }
}

/// Sends messages over one byte stream
pub struct StreamSender<W: Write + Send> {
    core: SenderCore<StreamWriter<W>>,
}

impl<W: Write + Send> StreamSender<W> {
    pub fn new(process_id: impl Into<String>, stream: W) -> Self {
        Self::with_max_message_size(process_id, stream, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(
        process_id: impl Into<String>,
        stream: W,
        max_message_size: usize,
    ) -> Self {
        Self::with_discriminator(process_id, "stream", stream, max_message_size)
    }

    fn with_discriminator(
        process_id: impl Into<String>,
        discriminator: &str,
        stream: W,
        max_message_size: usize,
    ) -> Self {
        Self {
            core: SenderCore::new(
                process_id,
                discriminator,
                StreamWriter {
                    stream: Mutex::new(stream),
                    max_message_size,
                },
            ),
        }
    }

    pub fn instance_id(&self) -> &str {
        self.core.instance_id()
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }
}

impl<W: Write + Send> Sender for StreamSender<W> {
    fn send(&self, message: Message) -> Result<()> {
        self.core.send(message)
    }

    /// Sends a close-communication message, then flushes the stream
    fn shutdown(&self) {
        self.core.shutdown();
    }
}

impl<W: Write + Send> QueuedSender for StreamSender<W> {
    fn queue(&self, message: Message) -> Result<()> {
        self.core.queue(message)
    }

    fn flush(&self) -> Result<()> {
        self.core.flush()
    }
}

/// Stream sender over a TCP connection to a server
pub struct ClientSender {
    inner: StreamSender<TcpStream>,
    socket: TcpStream,
}

impl ClientSender {
    /// Connect, announce the connection type and start sending
    pub fn connect(connector: &Connector, process_id: impl Into<String>) -> Result<Self> {
        Self::connect_with_config(connector, process_id, &CommunicationConfig::default())
    }

    pub fn connect_with_config(
        connector: &Connector,
        process_id: impl Into<String>,
        config: &CommunicationConfig,
    ) -> Result<Self> {
        let stream = connector.connect()?;
        let socket = stream.try_clone()?;

        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let discriminator = format!("{}:{}", connector, local);

        Ok(Self {
            inner: StreamSender::with_discriminator(
                process_id,
                &discriminator,
                stream,
                config.max_message_size,
            ),
            socket,
        })
    }

    pub fn instance_id(&self) -> &str {
        self.inner.instance_id()
    }
}

impl Sender for ClientSender {
    fn send(&self, message: Message) -> Result<()> {
        self.inner.send(message)
    }

    /// Announces the shutdown to the server, then closes the connection
    fn shutdown(&self) {
        self.inner.shutdown();
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            debug!("Client socket shutdown failed: {}", e);
        }
    }
}

impl QueuedSender for ClientSender {
    fn queue(&self, message: Message) -> Result<()> {
        self.inner.queue(message)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}

impl Drop for ClientSender {
    fn drop(&mut self) {
        Sender::shutdown(self);
    }
}
