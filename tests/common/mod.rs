//! Shared helpers for the end-to-end tests.
//!
//! Upstream servers are real [`ServerPort`]s on loopback, scripted through
//! their handler closure. A [`QueryLog`] records the names the upstream
//! saw so tests can assert on query order.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use stub_resolv::serve::{ServerPort, ServerRequest};
use tokio::net::UdpSocket;

/// Starts a scripted upstream server on an ephemeral loopback port.
pub async fn upstream<F>(handler: F) -> (ServerPort, SocketAddrV4)
where
    F: Fn(ServerRequest) + Send + Sync + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = match socket.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!("bound v4"),
    };
    (ServerPort::new(socket, handler), addr)
}

/// Binds a socket that swallows every query without answering.
pub async fn black_hole() -> (UdpSocket, SocketAddrV4) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = match socket.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!("bound v4"),
    };
    (socket, addr)
}

/// A thread-safe record of the question names an upstream received.
#[derive(Clone, Default)]
pub struct QueryLog(Arc<Mutex<Vec<String>>>);

impl QueryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: &str) {
        self.0.lock().unwrap().push(name.to_owned());
    }

    pub fn names(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
