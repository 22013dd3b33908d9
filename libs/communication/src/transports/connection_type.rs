//! Connection classification handshake
//!
//! The connecting side writes one byte naming the role of the connection
//! before any frame. The acceptor uses it to pick the pool the socket joins.

use crate::{CommunicationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::net::SocketAddr;

/// Role of a connection, sent as the first byte on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionType {
    /// Console to worker commands
    Control = 0,
    /// Worker to console reports
    Report = 1,
    /// Agent processes
    Agent = 2,
}

impl ConnectionType {
    pub const ALL: [ConnectionType; 3] = [
        ConnectionType::Control,
        ConnectionType::Report,
        ConnectionType::Agent,
    ];

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Announce this type on a freshly opened connection
    pub fn write<W: Write>(self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self.as_byte()])?;
        writer.flush()?;
        Ok(())
    }

    /// Read the type announced by a peer
    pub fn read<R: Read>(reader: &mut R, peer: Option<SocketAddr>) -> Result<Self> {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).map_err(|e| {
            CommunicationError::handshake(format!("Failed to read connection type: {}", e), peer)
        })?;

        Self::try_from(byte[0]).map_err(|_| {
            CommunicationError::handshake(format!("Unknown connection type {}", byte[0]), peer)
        })
    }
}

impl TryFrom<u8> for ConnectionType {
    type Error = CommunicationError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ConnectionType::Control),
            1 => Ok(ConnectionType::Report),
            2 => Ok(ConnectionType::Agent),
            other => Err(CommunicationError::handshake(
                format!("Unknown connection type {}", other),
                None,
            )),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionType::Control => "CONTROL",
            ConnectionType::Report => "REPORT",
            ConnectionType::Agent => "AGENT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_byte_values() {
        assert_eq!(ConnectionType::Control.as_byte(), 0);
        assert_eq!(ConnectionType::Report.as_byte(), 1);
        assert_eq!(ConnectionType::Agent.as_byte(), 2);

        for ct in ConnectionType::ALL {
            assert_eq!(ConnectionType::try_from(ct.as_byte()).unwrap(), ct);
        }
    }

    #[test]
    fn test_unknown_byte_is_handshake_error() {
        let err = ConnectionType::try_from(99).unwrap_err();
        assert_eq!(err.category(), "handshake");
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn test_write_then_read() {
        let mut wire = Vec::new();
        ConnectionType::Report.write(&mut wire).unwrap();
        assert_eq!(wire, vec![1]);

        let ct = ConnectionType::read(&mut Cursor::new(wire), None).unwrap();
        assert_eq!(ct, ConnectionType::Report);
    }

    #[test]
    fn test_read_from_closed_stream() {
        let err = ConnectionType::read(&mut Cursor::new(Vec::new()), None).unwrap_err();
        assert_eq!(err.category(), "handshake");
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionType::Control.to_string(), "CONTROL");
    }
}
