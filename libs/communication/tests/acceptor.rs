//! Connection acceptance and classification over loopback TCP

mod common;

use common::{connector, loopback_acceptor, wait_for};
use communication::{
    Acceptor, AcceptorConfig, ConnectionType, PoolListener, TcpConnection,
};
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct CountingListener {
    added: AtomicUsize,
    closed: AtomicUsize,
}

impl PoolListener<TcpConnection> for CountingListener {
    fn resource_added(&self, _resource: &Arc<TcpConnection>) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }

    fn resource_closed(&self, _resource: &Arc<TcpConnection>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn send_raw_byte(acceptor: &Acceptor, byte: u8) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", acceptor.port())).unwrap();
    stream.write_all(&[byte]).unwrap();
    stream
}

#[test_log::test]
fn test_unknown_connection_types_become_pending_exceptions() {
    let acceptor = loopback_acceptor(2);
    assert!(acceptor.pending_exception(false).is_none());

    let _first = send_raw_byte(&acceptor, 123);
    let first = acceptor.pending_exception(true).unwrap();
    assert_eq!(first.category(), "handshake");
    assert!(first.to_string().contains("123"));

    let _second = send_raw_byte(&acceptor, 99);
    let second = acceptor.pending_exception(true).unwrap();
    assert!(second.to_string().contains("99"));

    // Rejected sockets never join a pool.
    for connection_type in ConnectionType::ALL {
        assert_eq!(acceptor.socket_set(connection_type).unwrap().count_active(), 0);
    }
}

#[test_log::test]
fn test_silent_peer_times_out() {
    let acceptor = Acceptor::new(&AcceptorConfig {
        address: "127.0.0.1".to_string(),
        handshake_timeout_ms: 100,
        threads: 1,
        ..AcceptorConfig::default()
    })
    .unwrap();

    let _silent = TcpStream::connect(("127.0.0.1", acceptor.port())).unwrap();
    let err = acceptor.pending_exception(true).unwrap();
    assert!(matches!(err.category(), "io" | "handshake" | "connection"));

    // The accept thread is free again.
    let pool = acceptor.socket_set(ConnectionType::Report).unwrap();
    let _client = connector(&acceptor, ConnectionType::Report).connect().unwrap();
    assert!(wait_for(|| pool.count_active() == 1));
}

#[test_log::test]
fn test_listeners_follow_pool_membership() {
    let acceptor = loopback_acceptor(2);
    let listener = Arc::new(CountingListener::default());
    acceptor
        .add_listener(ConnectionType::Agent, listener.clone())
        .unwrap();
    let pool = acceptor.socket_set(ConnectionType::Agent).unwrap();

    let _a = connector(&acceptor, ConnectionType::Agent).connect().unwrap();
    let _b = connector(&acceptor, ConnectionType::Agent).connect().unwrap();
    assert!(wait_for(|| listener.added.load(Ordering::SeqCst) == 2));

    let reservation = pool.reserve_all().into_iter().next().unwrap();
    reservation.close();
    assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.count_active(), 1);

    acceptor.shutdown();
    assert_eq!(listener.closed.load(Ordering::SeqCst), 2);
}

#[test_log::test]
fn test_shutdown_is_idempotent_and_final() {
    let acceptor = loopback_acceptor(3);
    let pool = acceptor.socket_set(ConnectionType::Control).unwrap();
    let _client = connector(&acceptor, ConnectionType::Control).connect().unwrap();
    assert!(wait_for(|| pool.count_active() == 1));

    acceptor.shutdown();
    acceptor.shutdown();

    assert!(acceptor.is_shutdown());
    assert_eq!(acceptor.thread_count(), 0);
    assert!(pool.is_closed());
    assert_eq!(pool.count_active(), 0);
    assert!(acceptor.socket_set(ConnectionType::Control).unwrap_err().is_shutdown());
    assert!(acceptor.pending_exception(true).is_none());
    assert!(TcpStream::connect(("127.0.0.1", acceptor.port())).is_err());
}
