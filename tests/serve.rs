//! End-to-end server port tests over real sockets.

mod common;

use std::net::Ipv4Addr;
use std::time::Duration;
use stub_resolv::base::header::{Header, HEADER_LEN};
use stub_resolv::base::iana::{Class, Rtype};
use stub_resolv::base::name::{append_name, parse_name};
use stub_resolv::base::parse::Parser;
use stub_resolv::reverse_name;
use bytes::BufMut;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use common::upstream;

/// Hand-builds a query packet for one question.
fn query(xid: u16, name: &str, qtype: Rtype) -> Vec<u8> {
    let mut packet = Vec::new();
    Header {
        id: xid,
        flags: Header::RD,
        qdcount: 1,
        ..Default::default()
    }
    .compose(&mut packet);
    append_name(&mut packet, 512, name, None).unwrap();
    packet.put_u16(qtype.to_int());
    packet.put_u16(Class::In.to_int());
    packet
}

async fn exchange(server: std::net::SocketAddrV4, request: &[u8]) -> Vec<u8> {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(request, server).await.unwrap();
    let mut buf = [0u8; 1500];
    let (len, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, std::net::SocketAddr::V4(server));
    buf[..len].to_vec()
}

#[tokio::test]
async fn answers_a_question_over_the_wire() {
    let (_port, addr) = upstream(|mut req| {
        let question = req.questions()[0].clone();
        req.add_a_reply(&question.name, &[Ipv4Addr::new(192, 168, 11, 11)], 10);
        req.respond(Header::QR).unwrap();
    })
    .await;

    let response = exchange(addr, &query(0x4242, "demo.example", Rtype::A)).await;
    let header = Header::parse(&response).unwrap();
    assert_eq!(header.id, 0x4242);
    assert!(header.is_answer());
    assert_eq!(header.qdcount, 1);
    assert_eq!(header.ancount, 1);

    let mut parser = Parser::new(&response);
    parser.seek(HEADER_LEN).unwrap();
    assert_eq!(parse_name(&mut parser).unwrap(), "demo.example");
    parser.advance(4).unwrap();
    assert_eq!(parse_name(&mut parser).unwrap(), "demo.example");
    assert_eq!(parser.parse_u16().unwrap(), Rtype::A.to_int());
    assert_eq!(parser.parse_u16().unwrap(), Class::In.to_int());
    parser.parse_u32().unwrap();
    assert_eq!(parser.parse_u16().unwrap(), 4);
    assert_eq!(parser.parse_slice(4).unwrap(), &[192, 168, 11, 11]);

    // The answer's owner name was emitted as a compression pointer, so
    // the response is shorter than two copies of the name would be.
    assert!(response.len() < 2 * (HEADER_LEN + "demo.example".len() + 2));
}

#[tokio::test]
async fn answers_a_ptr_question_over_the_wire() {
    let (_port, addr) = upstream(|mut req| {
        let question = req.questions()[0].clone();
        if question.qtype == Rtype::Ptr {
            req.add_ptr_reply(&question.name, "printer.office.example", 120);
        }
        req.respond(Header::QR).unwrap();
    })
    .await;

    let name = reverse_name(Ipv4Addr::new(192, 0, 2, 55));
    let response = exchange(addr, &query(7, &name, Rtype::Ptr)).await;
    let header = Header::parse(&response).unwrap();
    assert_eq!(header.ancount, 1);

    let mut parser = Parser::new(&response);
    parser.seek(HEADER_LEN).unwrap();
    parse_name(&mut parser).unwrap();
    parser.advance(4).unwrap();
    assert_eq!(parse_name(&mut parser).unwrap(), name);
    assert_eq!(parser.parse_u16().unwrap(), Rtype::Ptr.to_int());
    parser.advance(6).unwrap();
    let _rdlen = parser.parse_u16();
    assert_eq!(parse_name(&mut parser).unwrap(), "printer.office.example");
}

#[tokio::test]
async fn multiple_questions_are_all_parsed() {
    let (_port, addr) = upstream(|req| {
        assert_eq!(req.questions().len(), 2);
        assert_eq!(req.questions()[0].name, "one.example");
        assert_eq!(req.questions()[1].name, "two.example");
        req.respond(Header::QR).unwrap();
    })
    .await;

    let mut packet = Vec::new();
    Header {
        id: 5,
        flags: Header::RD,
        qdcount: 2,
        ..Default::default()
    }
    .compose(&mut packet);
    for name in ["one.example", "two.example"] {
        append_name(&mut packet, 512, name, None).unwrap();
        packet.put_u16(Rtype::A.to_int());
        packet.put_u16(Class::In.to_int());
    }

    let response = exchange(addr, &packet).await;
    assert_eq!(Header::parse(&response).unwrap().qdcount, 2);
}

#[tokio::test]
async fn responses_are_ignored_by_the_port() {
    let (_port, addr) = upstream(|req| {
        req.respond(Header::QR).unwrap();
    })
    .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut bogus = query(1, "x.example", Rtype::A);
    bogus[2] |= 0x80;
    client.send_to(&bogus, addr).await.unwrap();
    // Follow up with a proper query; it must be the one answered.
    let proper = query(2, "y.example", Rtype::A);
    client.send_to(&proper, addr).await.unwrap();

    let mut buf = [0u8; 1500];
    let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Header::parse(&buf[..len]).unwrap().id, 2);
}
