//! The DNS message header.

use bytes::BufMut;
use super::iana::Rcode;
use super::parse::Parser;
use super::WireError;

/// The length of a DNS message header.
pub const HEADER_LEN: usize = 12;

//------------ Header --------------------------------------------------------

/// The first twelve octets of every DNS message.
///
/// The flags field is kept as the raw sixteen bit word with accessors for
/// the few bits the crate cares about. Everything this resolver sends is a
/// standard query or response, so opcode handling is not needed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Header {
    /// The transaction id correlating queries and responses.
    pub id: u16,

    /// The raw flags word.
    pub flags: u16,

    /// The number of questions.
    pub qdcount: u16,

    /// The number of answer records.
    pub ancount: u16,

    /// The number of authority records.
    pub nscount: u16,

    /// The number of additional records.
    pub arcount: u16,
}

impl Header {
    /// The QR bit: set on responses, clear on queries.
    pub const QR: u16 = 0x8000;

    /// The TC bit: the message was truncated.
    pub const TC: u16 = 0x0200;

    /// The RD bit: recursion desired.
    pub const RD: u16 = 0x0100;

    /// The mask selecting the response code.
    pub const RCODE_MASK: u16 = 0x000F;

    /// The mask selecting everything that makes a response an error:
    /// the TC bit or a non-zero response code.
    pub const ERROR_MASK: u16 = Self::TC | Self::RCODE_MASK;

    /// Reads a header off the start of `packet`.
    pub fn parse(packet: &[u8]) -> Result<Self, WireError> {
        let mut parser = Parser::new(packet);
        Ok(Header {
            id: parser.parse_u16()?,
            flags: parser.parse_u16()?,
            qdcount: parser.parse_u16()?,
            ancount: parser.parse_u16()?,
            nscount: parser.parse_u16()?,
            arcount: parser.parse_u16()?,
        })
    }

    /// Appends the header to a message under construction.
    pub fn compose(&self, target: &mut Vec<u8>) {
        target.put_u16(self.id);
        target.put_u16(self.flags);
        target.put_u16(self.qdcount);
        target.put_u16(self.ancount);
        target.put_u16(self.nscount);
        target.put_u16(self.arcount);
    }

    /// Returns whether the QR bit is set.
    pub fn is_answer(&self) -> bool {
        self.flags & Self::QR != 0
    }

    /// Returns whether the TC bit is set.
    pub fn is_truncated(&self) -> bool {
        self.flags & Self::TC != 0
    }

    /// Returns the response code.
    pub fn rcode(&self) -> Rcode {
        Rcode::from_int((self.flags & Self::RCODE_MASK) as u8)
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compose_parse_round_trip() {
        let header = Header {
            id: 0x1234,
            flags: Header::QR | Header::RD | 3,
            qdcount: 1,
            ancount: 2,
            nscount: 0,
            arcount: 0,
        };
        let mut buf = Vec::new();
        header.compose(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(Header::parse(&buf).unwrap(), header);
    }

    #[test]
    fn flag_bits() {
        let header = Header {
            flags: Header::QR | Header::TC | 2,
            ..Default::default()
        };
        assert!(header.is_answer());
        assert!(header.is_truncated());
        assert_eq!(header.rcode(), Rcode::ServFail);
        assert_eq!(
            Header::parse(&[0, 0, 1]).unwrap_err(),
            WireError::ShortInput
        );
    }
}
