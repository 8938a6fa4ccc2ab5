//! Domain names on the wire.
//!
//! Names are handled in their presentation form, dot-separated labels
//! without the trailing dot for the root. [`parse_name`] reads a name out
//! of a packet, following compression pointers. [`append_name`] writes a
//! name, optionally compressing it against a [`LabelTable`] of names
//! already present in the message.

use bytes::BufMut;
use super::parse::Parser;
use super::WireError;

/// The longest label allowed in a name.
pub const MAX_LABEL: usize = 63;

/// The longest name, in presentation format, we accept.
pub const MAX_NAME: usize = 255;

//------------ parse_name ----------------------------------------------------

/// Reads a possibly compressed domain name.
///
/// The name starts at the parser's current position. On success the parser
/// is left just past the name: past the terminating zero octet, or, if the
/// name was compressed, past the first compression pointer. Only the first
/// pointer determines where parsing resumes; later pointers merely redirect
/// within the packet.
///
/// A malformed packet can chain pointers into a cycle. Since every hop is
/// at least one octet of packet, more hops than the packet has octets
/// cannot be legitimate and parsing fails with
/// [`WireError::TooManyHops`].
pub fn parse_name(parser: &mut Parser) -> Result<String, WireError> {
    let packet = parser.octets();
    let mut pos = parser.pos();
    let mut out = Vec::new();
    let mut resume = None;
    let mut hops = 0;

    loop {
        let len = usize::from(*packet.get(pos).ok_or(WireError::ShortInput)?);
        pos += 1;
        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            if len & 0xC0 != 0xC0 {
                return Err(WireError::BadPointer);
            }
            let low = usize::from(*packet.get(pos).ok_or(WireError::ShortInput)?);
            pos += 1;
            if resume.is_none() {
                resume = Some(pos);
            }
            let target = (len & 0x3F) << 8 | low;
            if target >= packet.len() {
                return Err(WireError::BadPointer);
            }
            hops += 1;
            if hops > packet.len() {
                return Err(WireError::TooManyHops);
            }
            pos = target;
            continue;
        }
        let label = packet
            .get(pos..pos + len)
            .ok_or(WireError::ShortInput)?;
        pos += len;
        if !out.is_empty() {
            out.push(b'.');
        }
        if out.len() + len > MAX_NAME {
            return Err(WireError::NameTooLong);
        }
        out.extend_from_slice(label);
    }

    parser.seek(resume.unwrap_or(pos))?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

//------------ append_name ---------------------------------------------------

/// Appends a domain name in wire format to a message under construction.
///
/// The name is split at dots; a trailing dot denotes the root and does not
/// produce an extra label. If a `table` is given, each suffix of the name
/// is looked up in it first: a hit is written as a two octet compression
/// pointer and ends the name, a miss records the suffix's position for
/// later messages names to point at.
///
/// `limit` bounds the total size of `target`; running into it fails with
/// [`WireError::ShortBuf`].
pub fn append_name(
    target: &mut Vec<u8>,
    limit: usize,
    name: &str,
    mut table: Option<&mut LabelTable>,
) -> Result<(), WireError> {
    if name.len() > MAX_NAME {
        return Err(WireError::NameTooLong);
    }
    if !name.is_empty() && name != "." {
        let bytes = name.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            let rest = &name[start..];
            if let Some(table) = table.as_mut() {
                if let Some(pos) = table.get(rest) {
                    if target.len() + 2 > limit {
                        return Err(WireError::ShortBuf);
                    }
                    target.put_u16(0xC000 | pos);
                    return Ok(());
                }
            }
            let end = rest.find('.').map_or(bytes.len(), |i| start + i);
            let label_len = end - start;
            if label_len == 0 {
                return Err(WireError::BadName);
            }
            if label_len > MAX_LABEL {
                return Err(WireError::LabelTooLong);
            }
            if target.len() + 1 + label_len > limit {
                return Err(WireError::ShortBuf);
            }
            if let Some(table) = table.as_mut() {
                table.insert(rest, target.len());
            }
            target.put_u8(label_len as u8);
            target.extend_from_slice(&bytes[start..end]);
            if end == bytes.len() {
                break;
            }
            start = end + 1;
        }
    }
    if target.len() + 1 > limit {
        return Err(WireError::ShortBuf);
    }
    target.put_u8(0);
    Ok(())
}

//------------ count_dots ----------------------------------------------------

/// Returns the number of dots in a name.
///
/// This is what the ndots option of the search logic compares against.
pub fn count_dots(name: &str) -> usize {
    name.bytes().filter(|&b| b == b'.').count()
}

//------------ LabelTable ----------------------------------------------------

/// The name suffixes already written into a message.
///
/// Maps each recorded suffix to its position in the message so later names
/// can be written as compression pointers. The table holds a fixed number
/// of entries; once it is full further suffixes are simply not recorded.
/// Positions at or above 0xC000 cannot be expressed in a pointer and are
/// not recorded either.
#[derive(Clone, Debug, Default)]
pub struct LabelTable {
    entries: Vec<(Box<str>, u16)>,
}

impl LabelTable {
    /// The most suffixes a single message will record.
    const MAX_ENTRIES: usize = 128;

    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the position of a previously recorded suffix.
    pub fn get(&self, name: &str) -> Option<u16> {
        self.entries
            .iter()
            .find(|(entry, _)| entry.as_ref() == name)
            .map(|&(_, pos)| pos)
    }

    /// Records a suffix at the given message position.
    pub fn insert(&mut self, name: &str, pos: usize) {
        if self.entries.len() == Self::MAX_ENTRIES || pos >= 0xC000 {
            return;
        }
        self.entries.push((name.into(), pos as u16));
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    fn packet_with_name(name: &str) -> Vec<u8> {
        let mut packet = vec![0; 12];
        append_name(&mut packet, 512, name, None).unwrap();
        packet
    }

    #[test]
    fn round_trip() {
        for name in ["www.example.com", "example.com", "com", ""] {
            let packet = packet_with_name(name);
            let mut parser = Parser::new(&packet);
            parser.seek(12).unwrap();
            assert_eq!(parse_name(&mut parser).unwrap(), name);
            assert_eq!(parser.pos(), packet.len());
        }
    }

    #[test]
    fn trailing_dot_is_not_kept() {
        let packet = packet_with_name("host.example.");
        let mut parser = Parser::new(&packet);
        parser.seek(12).unwrap();
        assert_eq!(parse_name(&mut parser).unwrap(), "host.example");
    }

    #[test]
    fn shared_suffix_compresses() {
        let mut packet = vec![0; 12];
        let mut table = LabelTable::new();
        append_name(&mut packet, 512, "mail.example.com", Some(&mut table)).unwrap();
        let second_start = packet.len();
        append_name(&mut packet, 512, "www.example.com", Some(&mut table)).unwrap();

        // "www" written out, then a pointer to "example.com" at offset 17.
        assert_eq!(
            &packet[second_start..],
            &[3, b'w', b'w', b'w', 0xC0, 17][..]
        );

        let mut parser = Parser::new(&packet);
        parser.seek(second_start).unwrap();
        assert_eq!(parse_name(&mut parser).unwrap(), "www.example.com");
        assert_eq!(parser.pos(), packet.len());
    }

    #[test]
    fn repeated_name_is_a_single_pointer() {
        let mut packet = vec![0; 12];
        let mut table = LabelTable::new();
        append_name(&mut packet, 512, "example.com", Some(&mut table)).unwrap();
        let second_start = packet.len();
        append_name(&mut packet, 512, "example.com", Some(&mut table)).unwrap();
        assert_eq!(&packet[second_start..], &[0xC0, 12][..]);
    }

    #[test]
    fn bad_names_fail_composing() {
        let mut buf = Vec::new();
        let long_label = "a".repeat(64);
        assert_eq!(
            append_name(&mut buf, 512, &long_label, None),
            Err(WireError::LabelTooLong)
        );
        let long_name = "a.".repeat(130);
        assert_eq!(
            append_name(&mut Vec::new(), 512, &long_name, None),
            Err(WireError::NameTooLong)
        );
        assert_eq!(
            append_name(&mut Vec::new(), 512, "a..b", None),
            Err(WireError::BadName)
        );
        assert_eq!(
            append_name(&mut Vec::new(), 4, "example", None),
            Err(WireError::ShortBuf)
        );
    }

    #[test]
    fn pointer_cycle_is_detected() {
        // A name at offset 12 that points back at itself.
        let mut packet = vec![0; 12];
        packet.extend_from_slice(&[0xC0, 12]);
        let mut parser = Parser::new(&packet);
        parser.seek(12).unwrap();
        assert_eq!(parse_name(&mut parser), Err(WireError::TooManyHops));
    }

    #[test]
    fn pointer_out_of_range() {
        let mut packet = vec![0; 12];
        packet.extend_from_slice(&[0xC0, 255]);
        let mut parser = Parser::new(&packet);
        parser.seek(12).unwrap();
        assert_eq!(parse_name(&mut parser), Err(WireError::BadPointer));
    }

    #[test]
    fn oversized_name_fails_parsing() {
        // Five labels of 63 octets each exceed the 255 octet bound.
        let mut packet = vec![0; 12];
        for _ in 0..5 {
            packet.push(63);
            packet.extend_from_slice(&[b'a'; 63]);
        }
        packet.push(0);
        let mut parser = Parser::new(&packet);
        parser.seek(12).unwrap();
        assert_eq!(parse_name(&mut parser), Err(WireError::NameTooLong));
    }

    #[test]
    fn resume_after_first_pointer() {
        // Query-style packet: a name at 12, then one that is
        // "ftp" + pointer, followed by two octets of record data.
        let mut packet = vec![0; 12];
        append_name(&mut packet, 512, "example.com", None).unwrap();
        let second_start = packet.len();
        packet.extend_from_slice(&[3, b'f', b't', b'p', 0xC0, 12]);
        packet.extend_from_slice(&[0xAB, 0xCD]);

        let mut parser = Parser::new(&packet);
        parser.seek(second_start).unwrap();
        assert_eq!(parse_name(&mut parser).unwrap(), "ftp.example.com");
        assert_eq!(parser.parse_u16().unwrap(), 0xABCD);
    }

    #[test]
    fn dots_are_counted() {
        assert_eq!(count_dots("localhost"), 0);
        assert_eq!(count_dots("www.example.com"), 2);
        assert_eq!(count_dots("trailing."), 1);
    }
}
