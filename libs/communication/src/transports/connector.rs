//! Connecting side of the handshake

use crate::transports::ConnectionType;
use crate::{CommunicationError, Result};
use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use tracing::{debug, info};

/// Where to connect and which role to announce
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Connector {
    host: String,
    port: u16,
    connection_type: ConnectionType,
}

impl Connector {
    pub fn new(host: impl Into<String>, port: u16, connection_type: ConnectionType) -> Self {
        Self {
            host: host.into(),
            port,
            connection_type,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    /// Open a TCP connection and announce the connection type.
    ///
    /// Each resolved address is tried in turn.
    pub fn connect(&self) -> Result<TcpStream> {
        let addresses: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                CommunicationError::connection_with_source(
                    format!("Could not resolve host '{}'", self.host),
                    None,
                    e,
                )
            })?
            .collect();

        let mut last_error = None;
        for address in addresses {
            match TcpStream::connect(address) {
                Ok(mut stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %address, "Failed to set TCP_NODELAY: {}", e);
                    }
                    self.connection_type.write(&mut stream).map_err(|e| {
                        CommunicationError::connection_with_source(
                            format!("Failed to send connection type to '{}'", address),
                            Some(address),
                            e,
                        )
                    })?;

                    info!(
                        peer = %address,
                        connection_type = %self.connection_type,
                        "Connected"
                    );
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(peer = %address, "Connect attempt failed: {}", e);
                    last_error = Some((address, e));
                }
            }
        }

        Err(match last_error {
            Some((address, e)) => CommunicationError::connection_with_source(
                format!("Failed to connect to '{}'", self),
                Some(address),
                e,
            ),
            None => CommunicationError::connection(
                format!("No addresses found for '{}'", self.host),
                None,
            ),
        })
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.host, self.port, self.connection_type)
    }
}
