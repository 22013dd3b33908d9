//! TCP transport layer
//!
//! Connection classification, the accepting and connecting sides, and the
//! pooled connection wrapper.

pub mod acceptor;
pub mod connection_type;
pub mod connector;
pub mod tcp;

pub use acceptor::Acceptor;
pub use connection_type::ConnectionType;
pub use connector::Connector;
pub use tcp::{ConnectionIdentity, TcpConnection, TcpConnectionStats};
