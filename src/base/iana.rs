//! The subset of DNS IANA parameters the resolver deals in.
//!
//! Only the record types, class, and response codes the crate actually
//! handles are modelled. Everything else is carried through the `Int`
//! fallback variants so unknown values survive a parse/compose round trip.

use std::fmt;

//------------ Rtype ---------------------------------------------------------

/// Resource record types.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Rtype {
    /// An IPv4 host address.
    A,

    /// The canonical name for an alias.
    Cname,

    /// A domain name pointer.
    Ptr,

    /// An IPv6 host address.
    Aaaa,

    /// Any other record type.
    Int(u16),
}

impl Rtype {
    pub fn from_int(value: u16) -> Self {
        match value {
            1 => Rtype::A,
            5 => Rtype::Cname,
            12 => Rtype::Ptr,
            28 => Rtype::Aaaa,
            _ => Rtype::Int(value),
        }
    }

    pub fn to_int(self) -> u16 {
        match self {
            Rtype::A => 1,
            Rtype::Cname => 5,
            Rtype::Ptr => 12,
            Rtype::Aaaa => 28,
            Rtype::Int(value) => value,
        }
    }
}

impl From<u16> for Rtype {
    fn from(value: u16) -> Self {
        Rtype::from_int(value)
    }
}

impl From<Rtype> for u16 {
    fn from(value: Rtype) -> Self {
        value.to_int()
    }
}

impl fmt::Display for Rtype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Rtype::A => f.write_str("A"),
            Rtype::Cname => f.write_str("CNAME"),
            Rtype::Ptr => f.write_str("PTR"),
            Rtype::Aaaa => f.write_str("AAAA"),
            Rtype::Int(value) => write!(f, "TYPE{}", value),
        }
    }
}

//------------ Class ---------------------------------------------------------

/// Record classes. Only Internet is ever produced by this crate.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Class {
    /// The Internet class.
    In,

    /// Any other class.
    Int(u16),
}

impl Class {
    pub fn from_int(value: u16) -> Self {
        match value {
            1 => Class::In,
            _ => Class::Int(value),
        }
    }

    pub fn to_int(self) -> u16 {
        match self {
            Class::In => 1,
            Class::Int(value) => value,
        }
    }
}

impl From<u16> for Class {
    fn from(value: u16) -> Self {
        Class::from_int(value)
    }
}

impl From<Class> for u16 {
    fn from(value: Class) -> Self {
        value.to_int()
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Class::In => f.write_str("IN"),
            Class::Int(value) => write!(f, "CLASS{}", value),
        }
    }
}

//------------ Rcode ---------------------------------------------------------

/// Response codes from the low four bits of the header flags.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Rcode {
    /// No error condition.
    NoError,

    /// The server was unable to interpret the query.
    FormErr,

    /// The server ran into trouble processing the query.
    ServFail,

    /// The queried domain name does not exist.
    NXDomain,

    /// The server does not implement the requested kind of query.
    NotImp,

    /// The server refuses to process the query.
    Refused,

    /// Any other response code.
    Int(u8),
}

impl Rcode {
    pub fn from_int(value: u8) -> Self {
        match value {
            0 => Rcode::NoError,
            1 => Rcode::FormErr,
            2 => Rcode::ServFail,
            3 => Rcode::NXDomain,
            4 => Rcode::NotImp,
            5 => Rcode::Refused,
            _ => Rcode::Int(value),
        }
    }

    pub fn to_int(self) -> u8 {
        match self {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NXDomain => 3,
            Rcode::NotImp => 4,
            Rcode::Refused => 5,
            Rcode::Int(value) => value,
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Rcode::NoError => f.write_str("NOERROR"),
            Rcode::FormErr => f.write_str("FORMERR"),
            Rcode::ServFail => f.write_str("SERVFAIL"),
            Rcode::NXDomain => f.write_str("NXDOMAIN"),
            Rcode::NotImp => f.write_str("NOTIMP"),
            Rcode::Refused => f.write_str("REFUSED"),
            Rcode::Int(value) => write!(f, "RCODE{}", value),
        }
    }
}

//============ Testing =======================================================
