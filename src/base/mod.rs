//! The DNS wire codec.
//!
//! This module contains everything needed to read and write the small part
//! of the DNS wire format the crate deals with: the twelve octet message
//! header, domain names with pointer compression, and a bounds-checked
//! parser to pull the pieces out of a packet.
//!
//! The largest message this crate will ever read or write is a single,
//! unfragmented UDP datagram; see [`MAX_PACKET`].

pub mod header;
pub mod iana;
pub mod name;
pub mod parse;

use std::{error, fmt};

pub use self::header::Header;
pub use self::name::{append_name, count_dots, parse_name, LabelTable};
pub use self::parse::Parser;

/// The largest packet we are prepared to receive or send.
pub const MAX_PACKET: usize = 1500;

//------------ WireError -----------------------------------------------------

/// An error happened interpreting or producing wire data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WireError {
    /// A label exceeds 63 octets.
    LabelTooLong,

    /// A domain name exceeds 255 octets.
    NameTooLong,

    /// A name contains an empty label.
    BadName,

    /// A compression pointer points outside the packet.
    BadPointer,

    /// Following compression pointers did not terminate.
    TooManyHops,

    /// The data to parse ended early.
    ShortInput,

    /// The octets builder did not have enough space.
    ShortBuf,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            WireError::LabelTooLong => f.write_str("label too long"),
            WireError::NameTooLong => f.write_str("domain name too long"),
            WireError::BadName => f.write_str("invalid domain name"),
            WireError::BadPointer => f.write_str("invalid compression pointer"),
            WireError::TooManyHops => f.write_str("too many compression pointers"),
            WireError::ShortInput => f.write_str("unexpected end of input"),
            WireError::ShortBuf => f.write_str("buffer size exceeded"),
        }
    }
}

impl error::Error for WireError {}
