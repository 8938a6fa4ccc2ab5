//! The resolver's view of one outstanding question.

use std::sync::Arc;
use std::net::Ipv4Addr;
use bytes::BufMut;
use rand::random;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use crate::base::header::{Header, HEADER_LEN};
use crate::base::iana::{Class, Rtype};
use crate::base::name::{append_name, parse_name};
use crate::base::parse::Parser;
use crate::base::WireError;
use super::ns::Nameserver;
use super::search::SearchContext;
use super::{Answer, Error, HostAnswer, PtrAnswer};

/// The transaction id of requests that have not been assigned one yet.
pub const UNASSIGNED_ID: u16 = 0xFFFF;

/// The most addresses a host answer will carry.
pub const MAX_ADDRS: usize = 4;

//------------ Request -------------------------------------------------------

/// How the outcome of a request is delivered.
#[derive(Debug)]
pub enum Completion {
    /// A user is waiting on the other end of this channel.
    User(oneshot::Sender<Result<Answer, Error>>),

    /// The request probes a nameserver marked down.
    Probe(Arc<Nameserver>),
}

/// One question on its way through the resolver.
///
/// A request lives in exactly one of the two queues: waiting, in which case
/// its transaction id is [`UNASSIGNED_ID`] and it has no nameserver, or
/// inflight with an id that is unique among the inflight requests and an
/// assigned server.
#[derive(Debug)]
pub struct Request {
    /// A queue-independent identity for timers to find the request by.
    pub id: u64,

    /// The serialised query, transaction id patched on assignment.
    pub packet: Vec<u8>,

    /// The current transaction id.
    pub xid: u16,

    /// The type of question asked.
    pub qtype: Rtype,

    /// Transmissions of the current issue.
    pub tx_count: u32,

    /// How often the request moved to a different server.
    pub reissue_count: u32,

    /// The request still needs to go out on the wire.
    pub transmit_me: bool,

    /// The server this request is assigned to, if inflight.
    pub ns: Option<Arc<Nameserver>>,

    /// How to deliver the outcome.
    pub done: Option<Completion>,

    /// Search progress if the name is being postfix-expanded.
    pub search: Option<SearchContext>,

    /// The timer that fires when the server does not answer.
    pub timeout_task: Option<JoinHandle<()>>,
}

impl Request {
    pub fn new(id: u64, packet: Vec<u8>, qtype: Rtype, done: Completion) -> Self {
        Request {
            id,
            packet,
            xid: UNASSIGNED_ID,
            qtype,
            tx_count: 0,
            reissue_count: 0,
            transmit_me: false,
            ns: None,
            done: Some(done),
            search: None,
            timeout_task: None,
        }
    }

    /// Sets the transaction id, patching the serialised packet.
    pub fn set_xid(&mut self, xid: u16) {
        self.xid = xid;
        self.packet[..2].copy_from_slice(&xid.to_be_bytes());
    }

    /// Replaces the packet with a query for a new name.
    ///
    /// Used when the search logic moves on to the next candidate; the
    /// request goes back to the unassigned state.
    pub fn reset_query(&mut self, packet: Vec<u8>) {
        self.packet = packet;
        self.xid = UNASSIGNED_ID;
        self.ns = None;
        self.tx_count = 0;
        self.reissue_count = 0;
        self.transmit_me = false;
    }

    /// Stops the request's timeout timer if one is running.
    pub fn disarm_timeout(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

//------------ pick_transaction_id -------------------------------------------

/// Returns a fresh transaction id.
///
/// Ids come from the thread's CSPRNG so they are unpredictable to off-path
/// attackers. [`UNASSIGNED_ID`] is reserved and ids already used by an
/// inflight request are rejected; with the inflight queue bounded the loop
/// finishes quickly.
pub fn pick_transaction_id(inflight: &[Request]) -> u16 {
    loop {
        let id = random::<u16>();
        if id == UNASSIGNED_ID {
            continue;
        }
        if inflight.iter().any(|req| req.xid == id) {
            continue;
        }
        return id;
    }
}

//------------ build_query ---------------------------------------------------

/// Serialises a standard query for one question.
pub fn build_query(name: &str, xid: u16, qtype: Rtype) -> Result<Vec<u8>, WireError> {
    // Generous bound kept from evdns; the header alone is nowhere near
    // 96 octets.
    let limit = 96 + name.len() + 6;
    let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    Header {
        id: xid,
        flags: Header::RD,
        qdcount: 1,
        ..Default::default()
    }
    .compose(&mut packet);
    append_name(&mut packet, limit, name, None)?;
    packet.put_u16(qtype.to_int());
    packet.put_u16(Class::In.to_int());
    Ok(packet)
}

//------------ parse_answers -------------------------------------------------

/// Extracts the usable answer from a reply packet.
///
/// The caller has already checked the header for errors. Questions are
/// skipped, then the answer section is scanned for records matching the
/// request type: A records contribute addresses, up to [`MAX_ADDRS`] in
/// total with the smallest of their TTLs; the first PTR record ends the
/// scan. AAAA and everything else is skipped by its RDLENGTH.
///
/// Returns `None` if the reply contained nothing usable.
pub fn parse_answers(
    packet: &[u8],
    header: &Header,
    qtype: Rtype,
) -> Result<Option<Answer>, WireError> {
    let mut parser = Parser::new(packet);
    parser.seek(HEADER_LEN)?;

    for _ in 0..header.qdcount {
        parse_name(&mut parser)?;
        parser.advance(4)?;
    }

    let mut addrs = Vec::new();
    let mut min_ttl = u32::MAX;
    for _ in 0..header.ancount {
        parse_name(&mut parser)?;
        let rtype = Rtype::from_int(parser.parse_u16()?);
        let class = Class::from_int(parser.parse_u16()?);
        let ttl = parser.parse_u32()?;
        let rdlen = usize::from(parser.parse_u16()?);
        match (rtype, class) {
            (Rtype::A, Class::In) if qtype == Rtype::A => {
                let available = rdlen >> 2;
                let take = available.min(MAX_ADDRS - addrs.len());
                for _ in 0..take {
                    addrs.push(Ipv4Addr::from(parser.parse_u32()?));
                }
                min_ttl = min_ttl.min(ttl);
                if addrs.len() == MAX_ADDRS {
                    break;
                }
                parser.advance(rdlen - 4 * take)?;
            }
            (Rtype::Ptr, Class::In) if qtype == Rtype::Ptr => {
                let hostname = parse_name(&mut parser)?;
                return Ok(Some(Answer::Ptr(PtrAnswer { hostname, ttl })));
            }
            _ => parser.advance(rdlen)?,
        }
    }

    if addrs.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Answer::Host(HostAnswer {
            addrs,
            ttl: min_ttl,
        })))
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_layout() {
        let packet = build_query("example.com", 0x1234, Rtype::A).unwrap();
        let header = Header::parse(&packet).unwrap();
        assert_eq!(header.id, 0x1234);
        assert_eq!(header.flags, 0x0100);
        assert_eq!(header.qdcount, 1);
        assert_eq!(header.ancount, 0);

        let mut parser = Parser::new(&packet);
        parser.seek(HEADER_LEN).unwrap();
        assert_eq!(parse_name(&mut parser).unwrap(), "example.com");
        assert_eq!(parser.parse_u16().unwrap(), 1);
        assert_eq!(parser.parse_u16().unwrap(), 1);
        assert_eq!(parser.remaining(), 0);
    }

    #[test]
    fn transaction_ids_avoid_inflight() {
        let mut inflight = Vec::new();
        for _ in 0..32 {
            let id = pick_transaction_id(&inflight);
            assert_ne!(id, UNASSIGNED_ID);
            assert!(inflight.iter().all(|req: &Request| req.xid != id));
            let packet = build_query("example.com", id, Rtype::A).unwrap();
            let (tx, _rx) = oneshot::channel();
            let mut req = Request::new(
                inflight.len() as u64,
                packet,
                Rtype::A,
                Completion::User(tx),
            );
            req.set_xid(id);
            inflight.push(req);
        }
    }

    #[test]
    fn xid_patches_packet() {
        let packet = build_query("example.com", UNASSIGNED_ID, Rtype::A).unwrap();
        let (tx, _rx) = oneshot::channel();
        let mut req = Request::new(0, packet, Rtype::A, Completion::User(tx));
        req.set_xid(0xBEEF);
        assert_eq!(&req.packet[..2], &[0xBE, 0xEF]);
        assert_eq!(Header::parse(&req.packet).unwrap().id, 0xBEEF);
    }

    fn reply_with_answers(records: &[(&str, Rtype, u32, Vec<u8>)]) -> (Vec<u8>, Header) {
        let mut packet = Vec::new();
        let header = Header {
            id: 1,
            flags: Header::QR,
            qdcount: 1,
            ancount: records.len() as u16,
            ..Default::default()
        };
        header.compose(&mut packet);
        append_name(&mut packet, 512, "example.com", None).unwrap();
        packet.put_u16(Rtype::A.to_int());
        packet.put_u16(Class::In.to_int());
        for (name, rtype, ttl, rdata) in records {
            append_name(&mut packet, 512, name, None).unwrap();
            packet.put_u16(rtype.to_int());
            packet.put_u16(Class::In.to_int());
            packet.put_u32(*ttl);
            packet.put_u16(rdata.len() as u16);
            packet.extend_from_slice(rdata);
        }
        (packet, header)
    }

    #[test]
    fn a_records_collect_up_to_four() {
        let records: Vec<(&str, Rtype, u32, Vec<u8>)> = vec![
            ("example.com", Rtype::A, 300, vec![192, 0, 2, 1]),
            ("example.com", Rtype::Aaaa, 10, vec![0; 16]),
            ("example.com", Rtype::A, 60, vec![192, 0, 2, 2, 192, 0, 2, 3]),
            ("example.com", Rtype::A, 600, vec![192, 0, 2, 4]),
            ("example.com", Rtype::A, 5, vec![192, 0, 2, 5]),
        ];
        let (packet, header) = reply_with_answers(&records);
        let answer = parse_answers(&packet, &header, Rtype::A)
            .unwrap()
            .unwrap();
        match answer {
            Answer::Host(host) => {
                assert_eq!(
                    host.addrs,
                    [
                        Ipv4Addr::new(192, 0, 2, 1),
                        Ipv4Addr::new(192, 0, 2, 2),
                        Ipv4Addr::new(192, 0, 2, 3),
                        Ipv4Addr::new(192, 0, 2, 4),
                    ]
                );
                // The fifth address was ignored, as was the AAAA record,
                // and the TTL is the minimum of the used records.
                assert_eq!(host.ttl, 60);
            }
            _ => panic!("expected a host answer"),
        }
    }

    #[test]
    fn ptr_takes_first_name() {
        let mut rdata = Vec::new();
        append_name(&mut rdata, 512, "host.example.", None).unwrap();
        let records: Vec<(&str, Rtype, u32, Vec<u8>)> = vec![
            ("1.0.0.10.in-addr.arpa", Rtype::Ptr, 42, rdata),
        ];
        let (packet, header) = reply_with_answers(&records);
        match parse_answers(&packet, &header, Rtype::Ptr).unwrap().unwrap() {
            Answer::Ptr(ptr) => {
                assert_eq!(ptr.hostname, "host.example");
                assert_eq!(ptr.ttl, 42);
            }
            _ => panic!("expected a ptr answer"),
        }
    }

    #[test]
    fn mismatched_records_yield_nothing() {
        let records: Vec<(&str, Rtype, u32, Vec<u8>)> = vec![
            ("example.com", Rtype::Aaaa, 10, vec![0; 16]),
        ];
        let (packet, header) = reply_with_answers(&records);
        assert_eq!(parse_answers(&packet, &header, Rtype::A).unwrap(), None);
    }
}
