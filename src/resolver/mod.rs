//! The stub resolver.
//!
//! [`Resolver`] collects everything needed to run DNS queries against a
//! set of configured recursive nameservers: the server pool with its
//! health tracking, the request queues, and the search configuration.
//! Values are cheap to clone, all information lives behind an arc.
//!
//! A resolver starts out empty. Fill it from the system configuration
//! with [`Resolver::system`], or create it with [`Resolver::new`] and add
//! nameservers and search domains by hand. Queries need a running tokio
//! runtime; the resolver spawns its receive loops and timers onto it.

pub mod conf;
pub(crate) mod core;
pub(crate) mod ns;
pub(crate) mod request;
pub(crate) mod search;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use std::{error, fmt};
use tokio::sync::oneshot;
use tracing::debug;
use crate::base::iana::Rtype;
use self::core::ResolverInner;
use self::ns::DNS_PORT;
use self::request::{build_query, Completion, Request, UNASSIGNED_ID};
use self::search::SearchContext;

pub use self::conf::{ConfError, ConfFlags};
pub use self::ns::AddServerError;

//------------ Resolver ------------------------------------------------------

/// An asynchronous DNS stub resolver.
#[derive(Clone, Debug)]
pub struct Resolver(pub(crate) Arc<ResolverInner>);

impl Resolver {
    /// Creates a resolver with no servers and no search list.
    pub fn new() -> Self {
        Resolver(Arc::new(ResolverInner::new()))
    }

    /// Creates a resolver from the system's `/etc/resolv.conf`.
    pub async fn system() -> Result<Self, ConfError> {
        let resolver = Self::new();
        resolver
            .parse_resolv_conf(ConfFlags::ALL, "/etc/resolv.conf")
            .await?;
        Ok(resolver)
    }
}

/// # The server pool
impl Resolver {
    /// Adds a nameserver on the standard DNS port.
    pub async fn add_nameserver(&self, addr: Ipv4Addr) -> Result<(), AddServerError> {
        self.add_nameserver_addr(SocketAddrV4::new(addr, DNS_PORT))
            .await
    }

    /// Adds a nameserver with an explicit port.
    pub async fn add_nameserver_addr(&self, addr: SocketAddrV4) -> Result<(), AddServerError> {
        self.0.add_server(addr).await
    }

    /// Parses a dotted-quad address and adds it as a nameserver.
    pub async fn add_nameserver_str(&self, addr: &str) -> Result<(), AddServerError> {
        let addr: Ipv4Addr = addr.parse().map_err(|_| AddServerError::BadAddress)?;
        self.add_nameserver(addr).await
    }

    /// Returns the number of configured servers, up or down.
    pub fn count_nameservers(&self) -> usize {
        self.0.core.lock().expect("poisoned").servers.len()
    }

    /// Returns the number of servers currently believed up.
    pub fn good_nameservers(&self) -> usize {
        self.0.core.lock().expect("poisoned").good_servers
    }

    /// Drops all servers and suspends request processing.
    ///
    /// Inflight requests move back to the front of the waiting queue with
    /// their counters reset; nothing is delivered. Processing starts
    /// again once servers have been added and [`resume`][Self::resume] is
    /// called.
    pub fn clear_and_suspend(&self) {
        self.0.clear_and_suspend();
    }

    /// Resumes request processing after a suspend.
    pub fn resume(&self) {
        self.0.resume();
    }

    /// Shuts the resolver down.
    ///
    /// With `fail_requests` every pending request completes with
    /// [`Error::Shutdown`]; without it they are discarded, which a caller
    /// awaiting them also observes as [`Error::Shutdown`].
    pub fn shutdown(&self, fail_requests: bool) {
        self.0.shutdown(fail_requests);
    }
}

/// # Queries
impl Resolver {
    /// Looks up the IPv4 addresses for a host name.
    ///
    /// Unless `flags` disables it, the name is run through the configured
    /// search list first. The returned addresses are valid as long as the
    /// caller keeps them; nothing is cached.
    pub async fn resolve_ipv4(
        &self,
        name: &str,
        flags: QueryFlags,
    ) -> Result<HostAnswer, Error> {
        debug!(name, "resolve requested");
        let rx = {
            let mut guard = self.0.core.lock().expect("poisoned");
            let core = &mut *guard;
            if core.shut_down {
                return Err(Error::Shutdown);
            }
            let (qname, search) = if !flags.no_search && !core.search.domains.is_empty() {
                let (first, ctx) = SearchContext::start(core.search.clone(), name);
                (first, Some(ctx))
            } else {
                (name.to_owned(), None)
            };
            let packet =
                build_query(&qname, UNASSIGNED_ID, Rtype::A).map_err(|_| Error::Format)?;
            let (tx, rx) = oneshot::channel();
            let id = core.next_request_id();
            let mut req = Request::new(id, packet, Rtype::A, Completion::User(tx));
            req.search = search;
            self.0.submit(core, req);
            rx
        };
        match rx.await {
            Ok(Ok(Answer::Host(answer))) => Ok(answer),
            Ok(Ok(Answer::Ptr(_))) => Err(Error::Unknown),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Shutdown),
        }
    }

    /// Looks up the host name for an IPv4 address.
    ///
    /// Synthesises the `in-addr.arpa` name for the address and asks for
    /// its PTR record. The search list never applies to reverse lookups.
    pub async fn resolve_reverse(
        &self,
        addr: Ipv4Addr,
        _flags: QueryFlags,
    ) -> Result<PtrAnswer, Error> {
        let name = reverse_name(addr);
        debug!(name, "reverse resolve requested");
        let rx = {
            let mut guard = self.0.core.lock().expect("poisoned");
            let core = &mut *guard;
            if core.shut_down {
                return Err(Error::Shutdown);
            }
            let packet =
                build_query(&name, UNASSIGNED_ID, Rtype::Ptr).map_err(|_| Error::Format)?;
            let (tx, rx) = oneshot::channel();
            let id = core.next_request_id();
            let req = Request::new(id, packet, Rtype::Ptr, Completion::User(tx));
            self.0.submit(core, req);
            rx
        };
        match rx.await {
            Ok(Ok(Answer::Ptr(answer))) => Ok(answer),
            Ok(Ok(Answer::Host(_))) => Err(Error::Unknown),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Shutdown),
        }
    }
}

/// # The search list
impl Resolver {
    /// Empties the search list and resets ndots to its default.
    pub fn search_clear(&self) {
        let mut core = self.0.core.lock().expect("poisoned");
        core.search = Arc::new(search::SearchState::new());
    }

    /// Appends a postfix domain to the search list.
    pub fn search_add(&self, domain: &str) {
        let domain = domain.trim_start_matches('.');
        if domain.is_empty() {
            return;
        }
        let mut core = self.0.core.lock().expect("poisoned");
        Arc::make_mut(&mut core.search).domains.push(domain.into());
    }

    /// Sets the dot count from which names are tried verbatim first.
    pub fn set_ndots(&self, ndots: u32) {
        let mut core = self.0.core.lock().expect("poisoned");
        Arc::make_mut(&mut core.search).ndots = ndots;
    }
}

/// # Tunables
impl Resolver {
    /// Sets the per-request timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        self.0.core.lock().expect("poisoned").limits.timeout = timeout;
    }

    /// Sets how many requests may be inflight at once.
    pub fn set_max_inflight(&self, max: usize) {
        self.0.core.lock().expect("poisoned").limits.max_inflight = max;
    }

    /// Sets how often a request is transmitted before timing out.
    pub fn set_max_retransmits(&self, max: u32) {
        self.0.core.lock().expect("poisoned").limits.max_retransmits = max;
    }

    /// Sets the name probe queries ask a down server for.
    pub fn set_probe_name(&self, name: &str) {
        self.0.core.lock().expect("poisoned").probe_name = name.into();
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

//------------ reverse_name --------------------------------------------------

/// Returns the `in-addr.arpa` name for an IPv4 address.
pub fn reverse_name(addr: Ipv4Addr) -> String {
    let octets = addr.octets();
    format!(
        "{}.{}.{}.{}.in-addr.arpa",
        octets[3], octets[2], octets[1], octets[0]
    )
}

//------------ QueryFlags ----------------------------------------------------

/// Options for a single query.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QueryFlags {
    /// Do not run the name through the search list.
    pub no_search: bool,
}

impl QueryFlags {
    /// The flags that disable search list processing.
    pub const NO_SEARCH: QueryFlags = QueryFlags { no_search: true };
}

//------------ Answers -------------------------------------------------------

/// The addresses answering a forward lookup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostAnswer {
    /// Up to four addresses from the reply's A records.
    pub addrs: Vec<Ipv4Addr>,

    /// The smallest TTL among the records the addresses came from.
    pub ttl: u32,
}

/// The host name answering a reverse lookup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PtrAnswer {
    /// The host name from the first PTR record.
    pub hostname: String,

    /// That record's TTL.
    pub ttl: u32,
}

/// Any answer a request can complete with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Answer {
    Host(HostAnswer),
    Ptr(PtrAnswer),
}

//------------ Error ---------------------------------------------------------

/// A query failed.
///
/// The numeric codes returned by [`code`][Self::code] are a published
/// contract and match the classic evdns values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The query was malformed.
    Format,

    /// The server failed to process the query.
    ServerFailed,

    /// The name does not exist.
    NotExist,

    /// The server does not implement the query type.
    NotImpl,

    /// The server refused the query.
    Refused,

    /// The reply was truncated.
    Truncated,

    /// The reply was unusable for some other reason.
    Unknown,

    /// The server did not answer in time.
    Timeout,

    /// The resolver was shut down while the query was pending.
    Shutdown,
}

impl Error {
    /// Returns the published numeric code for this error.
    pub fn code(self) -> u32 {
        match self {
            Error::Format => 1,
            Error::ServerFailed => 2,
            Error::NotExist => 3,
            Error::NotImpl => 4,
            Error::Refused => 5,
            Error::Truncated => 65,
            Error::Unknown => 66,
            Error::Timeout => 67,
            Error::Shutdown => 68,
        }
    }

    /// Maps a reply's response code to an error.
    pub(crate) fn from_rcode(rcode: u16) -> Self {
        match rcode {
            1 => Error::Format,
            2 => Error::ServerFailed,
            3 => Error::NotExist,
            4 => Error::NotImpl,
            5 => Error::Refused,
            _ => Error::Unknown,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Format => f.write_str("misformatted query"),
            Error::ServerFailed => f.write_str("server failed"),
            Error::NotExist => f.write_str("name does not exist"),
            Error::NotImpl => f.write_str("query not implemented"),
            Error::Refused => f.write_str("refused"),
            Error::Truncated => f.write_str("reply truncated or ill-formed"),
            Error::Unknown => f.write_str("unknown"),
            Error::Timeout => f.write_str("request timed out"),
            Error::Shutdown => f.write_str("dns subsystem shut down"),
        }
    }
}

impl error::Error for Error {}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reverse_names() {
        assert_eq!(
            reverse_name(Ipv4Addr::new(10, 0, 0, 1)),
            "1.0.0.10.in-addr.arpa"
        );
        assert_eq!(
            reverse_name(Ipv4Addr::new(192, 0, 2, 99)),
            "99.2.0.192.in-addr.arpa"
        );
    }

    #[test]
    fn error_codes_are_published_contract() {
        let codes: Vec<u32> = [
            Error::Format,
            Error::ServerFailed,
            Error::NotExist,
            Error::NotImpl,
            Error::Refused,
            Error::Truncated,
            Error::Unknown,
            Error::Timeout,
            Error::Shutdown,
        ]
        .iter()
        .map(|err| err.code())
        .collect();
        assert_eq!(codes, [1, 2, 3, 4, 5, 65, 66, 67, 68]);
    }

    #[tokio::test]
    async fn resolve_after_shutdown_fails_immediately() {
        let resolver = Resolver::new();
        resolver.shutdown(false);
        assert_eq!(
            resolver
                .resolve_ipv4("example.com", QueryFlags::NO_SEARCH)
                .await,
            Err(Error::Shutdown)
        );
    }
}
