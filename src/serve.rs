//! Answering DNS queries on a bound socket.
//!
//! A [`ServerPort`] wraps a UDP socket and a handler. Every query read
//! off the socket is parsed into a [`ServerRequest`]; the handler attaches
//! answer records and calls [`ServerRequest::respond`], which serialises
//! the response with name compression and sends it. If the socket's send
//! buffer is full the response joins a pending list that is flushed, in
//! order, once the socket accepts writes again.
//!
//! ```no_run
//! # async fn demo() -> std::io::Result<()> {
//! use std::net::Ipv4Addr;
//! use tokio::net::UdpSocket;
//! use stub_resolv::base::header::Header;
//! use stub_resolv::base::iana::Rtype;
//! use stub_resolv::serve::ServerPort;
//!
//! let socket = UdpSocket::bind("127.0.0.1:10053").await?;
//! let _port = ServerPort::new(socket, |mut req| {
//!     for i in 0..req.questions().len() {
//!         let question = &req.questions()[i];
//!         if question.qtype == Rtype::A {
//!             let name = question.name.clone();
//!             req.add_a_reply(&name, &[Ipv4Addr::new(192, 168, 11, 11)], 10);
//!         }
//!     }
//!     let _ = req.respond(Header::QR);
//! });
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::{error, fmt};
use bytes::BufMut;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::warn;
use crate::base::header::{Header, HEADER_LEN};
use crate::base::iana::{Class, Rtype};
use crate::base::name::{append_name, parse_name, LabelTable};
use crate::base::parse::Parser;
use crate::base::{WireError, MAX_PACKET};

//------------ ServerPort ----------------------------------------------------

/// A UDP socket serving DNS queries.
///
/// Dropping the port stops the read loop. Requests already handed to the
/// handler keep the underlying socket alive and can still respond.
#[derive(Debug)]
pub struct ServerPort {
    inner: Arc<PortInner>,
}

struct PortInner {
    socket: UdpSocket,
    handler: Box<dyn Fn(ServerRequest) + Send + Sync>,
    state: Mutex<PortState>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct PortState {
    /// Serialised replies that hit a full send buffer, oldest first.
    pending: VecDeque<(Vec<u8>, SocketAddr)>,

    /// The socket returned EAGAIN; sends go through `pending`.
    choked: bool,

    /// A writability watcher is running.
    write_waiting: bool,

    write_task: Option<JoinHandle<()>>,
}

impl ServerPort {
    /// Starts serving queries arriving on `socket`.
    ///
    /// The handler runs on the port's read task; it should attach its
    /// records and respond without blocking.
    pub fn new<F>(socket: UdpSocket, handler: F) -> Self
    where
        F: Fn(ServerRequest) + Send + Sync + 'static,
    {
        let inner = Arc::new(PortInner {
            socket,
            handler: Box::new(handler),
            state: Mutex::new(PortState::default()),
            read_task: Mutex::new(None),
        });
        let reader = inner.clone();
        let task = tokio::spawn(read_loop(reader));
        *inner.read_task.lock().expect("poisoned") = Some(task);
        ServerPort { inner }
    }

    /// Returns the address the port's socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.inner.socket.local_addr()
    }
}

impl Drop for ServerPort {
    fn drop(&mut self) {
        if let Some(task) = self.inner.read_task.lock().expect("poisoned").take() {
            task.abort();
        }
        if let Some(task) = self
            .inner
            .state
            .lock()
            .expect("poisoned")
            .write_task
            .take()
        {
            task.abort();
        }
    }
}

impl fmt::Debug for PortInner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PortInner")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

/// Reads queries off the port for as long as it lives.
async fn read_loop(port: Arc<PortInner>) {
    let mut buf = [0u8; MAX_PACKET];
    loop {
        match port.socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                if let Some(req) = parse_request(&buf[..len], src, &port) {
                    (port.handler)(req);
                }
            }
            Err(err) => {
                warn!(error = %err, "error reading server port");
            }
        }
    }
}

/// Parses an incoming packet into a request.
///
/// Answers and anything else that fails to parse are dropped. Only the
/// question section is interpreted; the rest of the packet is ignored.
fn parse_request(
    packet: &[u8],
    src: SocketAddr,
    port: &Arc<PortInner>,
) -> Option<ServerRequest> {
    let header = Header::parse(packet).ok()?;
    if header.is_answer() {
        return None;
    }
    let mut parser = Parser::new(packet);
    parser.seek(HEADER_LEN).ok()?;
    let mut questions = Vec::with_capacity(header.qdcount.into());
    for _ in 0..header.qdcount {
        let name = parse_name(&mut parser).ok()?;
        let qtype = Rtype::from_int(parser.parse_u16().ok()?);
        let qclass = Class::from_int(parser.parse_u16().ok()?);
        questions.push(ServerQuestion {
            name,
            qtype,
            qclass,
        });
    }
    Some(ServerRequest {
        xid: header.id,
        flags: header.flags,
        src,
        questions,
        answer: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
        port: port.clone(),
    })
}

//------------ ServerQuestion ------------------------------------------------

/// One question from an incoming query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerQuestion {
    /// The name asked about.
    pub name: String,

    /// The record type asked for.
    pub qtype: Rtype,

    /// The class asked for.
    pub qclass: Class,
}

//------------ ServerRequest -------------------------------------------------

/// The sections a record can be attached to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Section {
    Answer,
    Authority,
    Additional,
}

/// The payload of an attached record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecordData {
    /// Literal RDATA octets.
    Raw(Vec<u8>),

    /// A domain name, compressed against the message when serialised.
    Name(String),
}

#[derive(Debug)]
struct SectionRecord {
    name: String,
    rtype: Rtype,
    class: Class,
    ttl: u32,
    data: RecordData,
}

/// An incoming query being answered.
///
/// Handed to the port's handler, which attaches records and then either
/// responds or drops the request. Holding the request keeps the port's
/// socket alive.
#[derive(Debug)]
pub struct ServerRequest {
    xid: u16,
    flags: u16,
    src: SocketAddr,
    questions: Vec<ServerQuestion>,
    answer: Vec<SectionRecord>,
    authority: Vec<SectionRecord>,
    additional: Vec<SectionRecord>,
    port: Arc<PortInner>,
}

impl ServerRequest {
    /// Returns the questions the client asked.
    pub fn questions(&self) -> &[ServerQuestion] {
        &self.questions
    }

    /// Returns the address the query came from.
    pub fn src(&self) -> SocketAddr {
        self.src
    }

    /// Returns the flags word of the query.
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Attaches a record to one of the response sections.
    pub fn add_reply(
        &mut self,
        section: Section,
        name: &str,
        rtype: Rtype,
        class: Class,
        ttl: u32,
        data: RecordData,
    ) {
        let record = SectionRecord {
            name: name.to_owned(),
            rtype,
            class,
            ttl,
            data,
        };
        match section {
            Section::Answer => self.answer.push(record),
            Section::Authority => self.authority.push(record),
            Section::Additional => self.additional.push(record),
        }
    }

    /// Attaches an A record carrying the given addresses.
    pub fn add_a_reply(&mut self, name: &str, addrs: &[Ipv4Addr], ttl: u32) {
        let mut data = Vec::with_capacity(addrs.len() * 4);
        for addr in addrs {
            data.extend_from_slice(&addr.octets());
        }
        self.add_reply(
            Section::Answer,
            name,
            Rtype::A,
            Class::In,
            ttl,
            RecordData::Raw(data),
        );
    }

    /// Attaches an AAAA record carrying the given addresses.
    pub fn add_aaaa_reply(&mut self, name: &str, addrs: &[Ipv6Addr], ttl: u32) {
        let mut data = Vec::with_capacity(addrs.len() * 16);
        for addr in addrs {
            data.extend_from_slice(&addr.octets());
        }
        self.add_reply(
            Section::Answer,
            name,
            Rtype::Aaaa,
            Class::In,
            ttl,
            RecordData::Raw(data),
        );
    }

    /// Attaches a PTR record mapping `inaddr_name` to `hostname`.
    ///
    /// For reverse lookups `inaddr_name` is usually the question's own
    /// `d.c.b.a.in-addr.arpa` name; [`crate::resolver::reverse_name`]
    /// builds one from an address.
    pub fn add_ptr_reply(&mut self, inaddr_name: &str, hostname: &str, ttl: u32) {
        self.add_reply(
            Section::Answer,
            inaddr_name,
            Rtype::Ptr,
            Class::In,
            ttl,
            RecordData::Name(hostname.to_owned()),
        );
    }

    /// Attaches a CNAME record aliasing `name` to `cname`.
    pub fn add_cname_reply(&mut self, name: &str, cname: &str, ttl: u32) {
        self.add_reply(
            Section::Answer,
            name,
            Rtype::Cname,
            Class::In,
            ttl,
            RecordData::Name(cname.to_owned()),
        );
    }

    /// Serialises the response and sends it.
    ///
    /// `flags` becomes the response's flags word verbatim; the caller is
    /// expected to set [`Header::QR`] and whatever else applies. When the
    /// socket is backpressured the reply is queued and sent once the
    /// socket drains; that still counts as success.
    pub fn respond(self, flags: u16) -> Result<(), RespondError> {
        let response = self.format_response(flags).map_err(RespondError::Wire)?;
        send_reply(&self.port, response, self.src)
    }

    /// Discards the request without sending a reply.
    pub fn drop_request(self) {}

    /// Builds the wire response with one compression table across all
    /// names.
    fn format_response(&self, flags: u16) -> Result<Vec<u8>, WireError> {
        let mut table = LabelTable::new();
        let mut buf = Vec::new();
        Header {
            id: self.xid,
            flags,
            qdcount: self.questions.len() as u16,
            ancount: self.answer.len() as u16,
            nscount: self.authority.len() as u16,
            arcount: self.additional.len() as u16,
        }
        .compose(&mut buf);

        for question in &self.questions {
            append_name(&mut buf, MAX_PACKET, &question.name, Some(&mut table))?;
            buf.put_u16(question.qtype.to_int());
            buf.put_u16(question.qclass.to_int());
        }

        let records = self
            .answer
            .iter()
            .chain(&self.authority)
            .chain(&self.additional);
        for record in records {
            append_name(&mut buf, MAX_PACKET, &record.name, Some(&mut table))?;
            buf.put_u16(record.rtype.to_int());
            buf.put_u16(record.class.to_int());
            buf.put_u32(record.ttl);
            match record.data {
                RecordData::Raw(ref data) => {
                    if buf.len() + 2 + data.len() > MAX_PACKET {
                        return Err(WireError::ShortBuf);
                    }
                    buf.put_u16(data.len() as u16);
                    buf.extend_from_slice(data);
                }
                RecordData::Name(ref name) => {
                    // RDLENGTH is only known once the name has been
                    // compressed, so reserve it and patch it afterwards.
                    let len_at = buf.len();
                    buf.put_u16(0);
                    let start = buf.len();
                    append_name(&mut buf, MAX_PACKET, name, Some(&mut table))?;
                    let rdlen = (buf.len() - start) as u16;
                    buf[len_at..len_at + 2].copy_from_slice(&rdlen.to_be_bytes());
                }
            }
        }
        Ok(buf)
    }
}

/// Sends a reply, queueing it when the socket is backpressured.
///
/// Replies already waiting keep their order: a new reply goes to the back
/// of the queue rather than racing past them.
fn send_reply(
    port: &Arc<PortInner>,
    data: Vec<u8>,
    dst: SocketAddr,
) -> Result<(), RespondError> {
    let mut state = port.state.lock().expect("poisoned");
    if state.choked || !state.pending.is_empty() {
        state.pending.push_back((data, dst));
        arm_write_task(port, &mut state);
        return Ok(());
    }
    match port.socket.try_send_to(&data, dst) {
        Ok(_) => Ok(()),
        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
            state.choked = true;
            state.pending.push_back((data, dst));
            arm_write_task(port, &mut state);
            Ok(())
        }
        Err(err) => Err(RespondError::Io(err)),
    }
}

/// Flushes the pending list after the socket became writable.
fn flush_pending(port: &Arc<PortInner>) {
    let mut state = port.state.lock().expect("poisoned");
    state.choked = false;
    state.write_waiting = false;
    state.write_task = None;
    while let Some((data, dst)) = state.pending.pop_front() {
        match port.socket.try_send_to(&data, dst) {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                state.pending.push_front((data, dst));
                state.choked = true;
                arm_write_task(port, &mut state);
                return;
            }
            Err(err) => {
                warn!(error = %err, "dropping undeliverable reply");
            }
        }
    }
}

fn arm_write_task(port: &Arc<PortInner>, state: &mut PortState) {
    if state.write_waiting {
        return;
    }
    state.write_waiting = true;
    let waiting = port.clone();
    state.write_task = Some(tokio::spawn(async move {
        if waiting.socket.writable().await.is_ok() {
            flush_pending(&waiting);
        }
    }));
}

//------------ RespondError --------------------------------------------------

/// Sending a response failed.
#[derive(Debug)]
pub enum RespondError {
    /// The response could not be serialised.
    Wire(WireError),

    /// The socket reported a hard error.
    Io(io::Error),
}

impl fmt::Display for RespondError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RespondError::Wire(ref err) => err.fmt(f),
            RespondError::Io(ref err) => err.fmt(f),
        }
    }
}

impl error::Error for RespondError {}

//============ Testing =======================================================
