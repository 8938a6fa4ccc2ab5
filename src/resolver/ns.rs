//! The upstream nameservers.
//!
//! Each configured server owns a connected UDP socket and a little health
//! state. A server is either up and part of the round-robin rotation, or
//! down and periodically probed until it answers again. The receive loop,
//! the probe timer, and the writability watcher all run as tokio tasks
//! whose handles live here so they can be stopped when the server goes
//! away.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Mutex, Weak};
use std::time::Duration;
use std::{error, fmt};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// The port DNS over UDP uses.
pub const DNS_PORT: u16 = 53;

/// How long to wait before probing a down server again.
///
/// Indexed by the number of failed probes, saturating at the last entry.
pub const PROBE_BACKOFF: [Duration; 5] = [
    Duration::from_secs(10),
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(900),
    Duration::from_secs(3600),
];

/// Returns the back-off delay after `failed_times` failed probes.
pub fn probe_delay(failed_times: u32) -> Duration {
    PROBE_BACKOFF[(failed_times as usize).min(PROBE_BACKOFF.len() - 1)]
}

//------------ Nameserver ----------------------------------------------------

/// One upstream recursive resolver.
#[derive(Debug)]
pub struct Nameserver {
    /// The server's address, unique within the pool.
    pub address: SocketAddrV4,

    /// The connected socket queries to this server go out on.
    pub socket: UdpSocket,

    /// Mutable health state, always locked after the resolver core.
    pub health: Mutex<Health>,

    /// The task draining the socket.
    pub recv_task: Mutex<Option<JoinHandle<()>>>,
}

/// The health state of a nameserver.
#[derive(Debug, Default)]
pub struct Health {
    /// The server is believed to answer queries.
    pub up: bool,

    /// Consecutive failed probes while down.
    pub failed_times: u32,

    /// Consecutive request timeouts while up.
    pub timedout: u32,

    /// The socket returned EAGAIN; sends wait for writability.
    pub choked: bool,

    /// A writability watcher task is already running.
    pub write_waiting: bool,

    /// The running writability watcher.
    pub write_task: Option<JoinHandle<()>>,

    /// The probe timer; armed exactly while the server is down.
    pub probe_task: Option<JoinHandle<()>>,
}

impl Nameserver {
    /// Binds and connects a socket for the given server.
    pub async fn connect(address: SocketAddrV4) -> Result<Self, io::Error> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(address).await?;
        Ok(Nameserver {
            address,
            socket,
            health: Mutex::new(Health {
                up: true,
                ..Default::default()
            }),
            recv_task: Mutex::new(None),
        })
    }

    /// Returns whether the server is currently considered up.
    pub fn is_up(&self) -> bool {
        self.health.lock().expect("poisoned").up
    }

    /// Stops every task working for this server.
    ///
    /// Called when the server leaves the pool and when the resolver goes
    /// away.
    pub fn stop_tasks(&self) {
        if let Some(task) = self.recv_task.lock().expect("poisoned").take() {
            task.abort();
        }
        let mut health = self.health.lock().expect("poisoned");
        if let Some(task) = health.probe_task.take() {
            task.abort();
        }
        if let Some(task) = health.write_task.take() {
            task.abort();
        }
    }
}

//------------ AddServerError ------------------------------------------------

/// Adding a nameserver to the pool failed.
#[derive(Debug)]
pub enum AddServerError {
    /// The address is already in the pool.
    Duplicate,

    /// The address did not parse as a dotted quad.
    BadAddress,

    /// Creating or connecting the socket failed.
    Io(io::Error),
}

impl fmt::Display for AddServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AddServerError::Duplicate => f.write_str("nameserver already configured"),
            AddServerError::BadAddress => f.write_str("invalid nameserver address"),
            AddServerError::Io(ref err) => err.fmt(f),
        }
    }
}

impl error::Error for AddServerError {}

impl From<io::Error> for AddServerError {
    fn from(err: io::Error) -> Self {
        AddServerError::Io(err)
    }
}

//------------ Weak helpers --------------------------------------------------

/// A weak handle a server task uses to reach back into the resolver.
///
/// Tasks must not keep the resolver alive, so they hold this and give up
/// when the upgrade fails.
pub type WeakInner = Weak<super::core::ResolverInner>;

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_saturates() {
        assert_eq!(probe_delay(0), Duration::from_secs(10));
        assert_eq!(probe_delay(1), Duration::from_secs(60));
        assert_eq!(probe_delay(4), Duration::from_secs(3600));
        assert_eq!(probe_delay(40), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn connect_sets_up() {
        let ns = Nameserver::connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5300))
            .await
            .unwrap();
        assert!(ns.is_up());
        assert_eq!(ns.address.port(), 5300);
    }
}
