//! Helpers shared by the loopback integration tests

#![allow(dead_code)]

use communication::{Acceptor, ConnectionType, Connector, Message};
use std::thread;
use std::time::{Duration, Instant};

/// Poll `condition` until it holds or five seconds pass
pub fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

pub fn loopback_acceptor(threads: usize) -> Acceptor {
    Acceptor::bind("127.0.0.1", 0, threads).expect("bind loopback acceptor")
}

pub fn connector(acceptor: &Acceptor, connection_type: ConnectionType) -> Connector {
    Connector::new("127.0.0.1", acceptor.port(), connection_type)
}

pub fn payload(tag: u16, text: &str) -> Message {
    Message::new(tag, text.as_bytes().to_vec())
}
