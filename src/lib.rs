//! An asynchronous DNS stub resolver and lightweight responder.
//!
//! This crate does two things, both over plain UDP:
//!
//! *  [`Resolver`] answers forward (A) and reverse (PTR) questions by
//!    forwarding them to a set of configured recursive nameservers. It
//!    tracks each server's health, rotates across the healthy ones,
//!    retransmits and reissues on failure, probes servers that went dark,
//!    and expands short names through a resolv.conf style search list.
//!
//! *  [`ServerPort`][serve::ServerPort] accepts DNS queries on a bound
//!    socket and hands them to a callback that attaches answer records
//!    and responds, with name compression across the whole message.
//!
//! Both sides share the wire codec in the [base] module.
//!
//! The resolver is deliberately small: no TCP fallback, no EDNS, no
//! DNSSEC, no caching. Replies larger than a datagram are delivered as
//! truncated, the way the classic evdns API did it.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use stub_resolv::{QueryFlags, Resolver};
//!
//! let resolver = Resolver::system().await?;
//! let answer = resolver.resolve_ipv4("example.com", QueryFlags::default()).await?;
//! for addr in &answer.addrs {
//!     println!("example.com has address {}", addr);
//! }
//! # Ok(())
//! # }
//! ```

pub mod base;
pub mod resolver;
pub mod serve;

pub use self::resolver::{
    reverse_name, AddServerError, ConfError, ConfFlags, Error, HostAnswer, PtrAnswer,
    QueryFlags, Resolver,
};
