//! BOOTP/DHCP message codec (RFC 2131 §2).
//!
//! | offset | size | field                         |
//! |--------|------|-------------------------------|
//! | 0      | 4    | op, htype, hlen, hops         |
//! | 4      | 4    | xid                           |
//! | 8      | 4    | secs, flags                   |
//! | 12     | 16   | ciaddr, yiaddr, siaddr, giaddr|
//! | 28     | 16   | chaddr                        |
//! | 44     | 64   | sname                         |
//! | 108    | 128  | file                          |
//! | 236    | 4    | magic cookie 99.130.83.99     |
//! | 240    | ...  | options                       |
//!
//! Decoding is strict about the framing and lenient about content: a short
//! buffer, a wrong cookie or an option that runs off the end is an error,
//! while unrecognized option codes are kept as raw bytes. Encoding is
//! canonical (options in order, one End, zero padding to 300 bytes) and
//! refuses values a length byte cannot describe, so any packet this module
//! produces decodes back to itself.

use std::borrow::Cow;
use std::net::Ipv4Addr;

use crate::error::{DecodeError, EncodeError};
use crate::mac::MacAddress;
use crate::options::{DhcpOption, MessageType, OptionCode};

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Length of the BOOTP header that precedes the cookie.
const BOOTP_HEADER_LEN: usize = 236;

const OPTIONS_OFFSET: usize = BOOTP_HEADER_LEN + MAGIC_COOKIE.len();

const CHADDR_LEN: usize = 16;

/// Replies are zero-padded to this size for old BOOTP relays.
const MIN_PACKET_LEN: usize = 300;

/// Every IPv4 host must accept a 576-byte datagram (RFC 791).
const ENCODE_CAPACITY: usize = 576;

/// Relays drop packets past this hop count (RFC 1542 §4.1.1).
const MAX_HOPS: u8 = 16;

/// Bit 15 of `flags`: the client can't receive unicast before it is configured.
pub const BROADCAST_FLAG: u16 = 0x8000;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// Sequential reader over a buffer already known to hold the full header.
struct HeaderReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> HeaderReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.position..self.position + N]);
        self.position += N;
        out
    }

    fn u8(&mut self) -> u8 {
        let [value] = self.bytes::<1>();
        value
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.bytes())
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.bytes())
    }

    fn addr(&mut self) -> Ipv4Addr {
        Ipv4Addr::from(self.bytes::<4>())
    }
}

/// One DHCP message, request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    /// [`BOOTREQUEST`] or [`BOOTREPLY`].
    pub op: u8,
    pub htype: u8,
    /// Significant bytes of `chaddr`, at most 16.
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    /// The client's current address while BOUND, RENEWING or REBINDING.
    pub ciaddr: Ipv4Addr,
    /// The address being assigned.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// First relay agent on the path, or 0.0.0.0 when on-link.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    /// Options in wire order, without Pad or End.
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    /// Parses a datagram.
    ///
    /// # Errors
    ///
    /// Checked in this order:
    /// - fewer than 240 bytes
    /// - the magic cookie is wrong
    /// - `hlen` is above 16 or `hops` above 16
    /// - an option has no length byte or claims more bytes than remain
    /// - a typed option carries a malformed value
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < OPTIONS_OFFSET {
            return Err(DecodeError::TooShort {
                len: data.len(),
                minimum: OPTIONS_OFFSET,
            });
        }

        let mut cookie = [0u8; 4];
        cookie.copy_from_slice(&data[BOOTP_HEADER_LEN..OPTIONS_OFFSET]);
        if cookie != MAGIC_COOKIE {
            return Err(DecodeError::BadMagicCookie(cookie));
        }

        let mut header = HeaderReader::new(&data[..BOOTP_HEADER_LEN]);
        let op = header.u8();
        let htype = header.u8();
        let hlen = header.u8();
        let hops = header.u8();

        if usize::from(hlen) > CHADDR_LEN {
            return Err(DecodeError::HardwareLengthTooLong(hlen));
        }
        if hops > MAX_HOPS {
            return Err(DecodeError::TooManyHops(hops));
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid: header.u32(),
            secs: header.u16(),
            flags: header.u16(),
            ciaddr: header.addr(),
            yiaddr: header.addr(),
            siaddr: header.addr(),
            giaddr: header.addr(),
            chaddr: header.bytes(),
            sname: header.bytes(),
            file: header.bytes(),
            options: decode_options(&data[OPTIONS_OFFSET..])?,
        })
    }

    /// Serializes the packet. The result is never shorter than 300 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::OptionTooLong`] if any option value exceeds
    /// 255 bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(ENCODE_CAPACITY);

        out.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            out.extend_from_slice(&addr.octets());
        }
        out.extend_from_slice(&self.chaddr);
        out.extend_from_slice(&self.sname);
        out.extend_from_slice(&self.file);
        out.extend_from_slice(&MAGIC_COOKIE);

        for option in &self.options {
            option.encode_into(&mut out)?;
        }
        out.push(OptionCode::End as u8);

        if out.len() < MIN_PACKET_LEN {
            out.resize(MIN_PACKET_LEN, 0);
        }
        Ok(out)
    }

    /// First option for which `pick` returns a value.
    fn find_option<'a, T>(&'a self, pick: impl Fn(&'a DhcpOption) -> Option<T>) -> Option<T> {
        self.options.iter().find_map(pick)
    }

    /// Option 53. A repeated option 53 is ignored after the first.
    pub fn message_type(&self) -> Option<MessageType> {
        self.find_option(|option| match option {
            DhcpOption::MessageType(message_type) => Some(*message_type),
            _ => None,
        })
    }

    /// Option 50.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.find_option(|option| match option {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Option 54: which server the client is talking to.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.find_option(|option| match option {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Option 12 without trailing NULs, with invalid UTF-8 replaced. A name
    /// made only of NULs counts as absent.
    pub fn hostname(&self) -> Option<Cow<'_, str>> {
        let raw = self.find_option(|option| match option {
            DhcpOption::Hostname(name) => Some(name.as_slice()),
            _ => None,
        })?;
        let end = raw.iter().rposition(|byte| *byte != 0)? + 1;
        Some(String::from_utf8_lossy(&raw[..end]))
    }

    /// Option 55.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.find_option(|option| match option {
            DhcpOption::ParameterRequestList(codes) => Some(codes.as_slice()),
            _ => None,
        })
    }

    /// Option 51 as sent by the client.
    pub fn requested_lease_time(&self) -> Option<u32> {
        self.find_option(|option| match option {
            DhcpOption::LeaseTime(seconds) => Some(*seconds),
            _ => None,
        })
    }

    pub fn mac_address(&self) -> MacAddress {
        MacAddress::from_chaddr(&self.chaddr, self.hlen)
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    /// Builds a BOOTREPLY answering `request`.
    ///
    /// Option 53 goes first, then `options`. `xid`, `flags`, `giaddr`,
    /// `htype`, `hlen` and `chaddr` are carried over. `ciaddr` is echoed in
    /// ACKs only (RFC 2131 Table 3).
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let ciaddr = match message_type {
            MessageType::Ack => request.ciaddr,
            _ => Ipv4Addr::UNSPECIFIED,
        };

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0; 64],
            file: [0; 128],
            options: std::iter::once(DhcpOption::MessageType(message_type))
                .chain(options)
                .collect(),
        }
    }
}

/// Walks the option area up to End or the end of the buffer. Pad bytes are
/// skipped.
fn decode_options(mut rest: &[u8]) -> Result<Vec<DhcpOption>, DecodeError> {
    let mut options = Vec::new();

    while let Some((&code, after_code)) = rest.split_first() {
        match OptionCode::from_u8(code) {
            Some(OptionCode::Pad) => {
                rest = after_code;
                continue;
            }
            Some(OptionCode::End) => break,
            _ => {}
        }

        let Some((&length, body)) = after_code.split_first() else {
            return Err(DecodeError::TruncatedOption { code });
        };
        let length = usize::from(length);
        if length > body.len() {
            return Err(DecodeError::OptionOverrun {
                code,
                length,
                remaining: body.len(),
            });
        }

        let (value, next) = body.split_at(length);
        options.push(DhcpOption::parse(code, value)?);
        rest = next;
    }

    Ok(options)
}
