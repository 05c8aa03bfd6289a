//! RFC 2132 options.
//!
//! On the wire every option other than Pad (0) and End (255) is a
//! `code, length, value` triple. The handful the server reads or writes get
//! a typed [`DhcpOption`] variant; anything else is carried as
//! [`DhcpOption::Unknown`] so it re-encodes byte for byte.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{DecodeError, EncodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    DomainName = 15,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    RenewalTime = 58,
    RebindingTime = 59,
    End = 255,
}

impl OptionCode {
    /// Maps a wire code to a typed code, or `None` for codes carried raw.
    pub const fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Pad,
            1 => Self::SubnetMask,
            3 => Self::Router,
            6 => Self::DnsServer,
            12 => Self::Hostname,
            15 => Self::DomainName,
            50 => Self::RequestedIpAddress,
            51 => Self::LeaseTime,
            53 => Self::MessageType,
            54 => Self::ServerIdentifier,
            55 => Self::ParameterRequestList,
            58 => Self::RenewalTime,
            59 => Self::RebindingTime,
            255 => Self::End,
            _ => return None,
        })
    }
}

/// Option 53 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    pub const ALL: [Self; 8] = [
        Self::Discover,
        Self::Offer,
        Self::Request,
        Self::Decline,
        Self::Ack,
        Self::Nak,
        Self::Release,
        Self::Inform,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|message_type| *message_type as u8 == value)
            .ok_or(value)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// Gateways in preference order.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    /// Raw option 12, kept as sent. Clients sometimes NUL-terminate it or
    /// use a legacy charset; see
    /// [`DhcpPacket::hostname`](crate::DhcpPacket::hostname).
    Hostname(Vec<u8>),
    DomainName(Vec<u8>),
    RequestedIpAddress(Ipv4Addr),
    /// Seconds.
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    /// Option codes the client wants back, in its order of preference.
    ParameterRequestList(Vec<u8>),
    /// T1, in seconds.
    RenewalTime(u32),
    /// T2, in seconds.
    RebindingTime(u32),
    Unknown(u8, Vec<u8>),
}

/// Reads a value that must be exactly `N` bytes long.
fn fixed<const N: usize>(code: u8, data: &[u8], reason: &'static str) -> Result<[u8; N], DecodeError> {
    <[u8; N]>::try_from(data).map_err(|_| DecodeError::InvalidOption { code, reason })
}

fn address_list(code: u8, data: &[u8], reason: &'static str) -> Result<Vec<Ipv4Addr>, DecodeError> {
    if data.len() % 4 != 0 {
        return Err(DecodeError::InvalidOption { code, reason });
    }

    let mut addresses = Vec::with_capacity(data.len() / 4);
    for chunk in data.chunks_exact(4) {
        addresses.push(Ipv4Addr::from(fixed::<4>(code, chunk, reason)?));
    }
    Ok(addresses)
}

/// Appends one TLV. Nothing is written when the value is too long for its
/// length byte.
fn write_tlv(out: &mut Vec<u8>, code: u8, value: &[u8]) -> Result<(), EncodeError> {
    let length = u8::try_from(value.len()).map_err(|_| EncodeError::OptionTooLong {
        code,
        length: value.len(),
    })?;
    out.push(code);
    out.push(length);
    out.extend_from_slice(value);
    Ok(())
}

impl DhcpOption {
    pub fn option_code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::Hostname(_) => OptionCode::Hostname,
            Self::DomainName(_) => OptionCode::DomainName,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::RenewalTime(_) => OptionCode::RenewalTime,
            Self::RebindingTime(_) => OptionCode::RebindingTime,
            Self::Unknown(code, _) => return *code,
        };
        code as u8
    }

    /// Interprets the value of one option.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::InvalidOption`] when a typed option has the
    /// wrong length or option 53 names no known message type.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self, DecodeError> {
        let Some(known) = OptionCode::from_u8(code) else {
            return Ok(Self::Unknown(code, data.to_vec()));
        };

        let option = match known {
            OptionCode::SubnetMask => {
                Self::SubnetMask(fixed::<4>(code, data, "subnet mask must be 4 bytes")?.into())
            }
            OptionCode::Router => Self::Router(address_list(
                code,
                data,
                "router list must be a multiple of 4 bytes",
            )?),
            OptionCode::DnsServer => Self::DnsServer(address_list(
                code,
                data,
                "DNS server list must be a multiple of 4 bytes",
            )?),
            OptionCode::Hostname => Self::Hostname(data.to_vec()),
            OptionCode::DomainName => Self::DomainName(data.to_vec()),
            OptionCode::RequestedIpAddress => Self::RequestedIpAddress(
                fixed::<4>(code, data, "requested address must be 4 bytes")?.into(),
            ),
            OptionCode::LeaseTime => Self::LeaseTime(u32::from_be_bytes(fixed(
                code,
                data,
                "lease time must be 4 bytes",
            )?)),
            OptionCode::MessageType => {
                let [value] = fixed::<1>(code, data, "message type must be 1 byte")?;
                Self::MessageType(MessageType::try_from(value).map_err(|_| {
                    DecodeError::InvalidOption {
                        code,
                        reason: "no such message type",
                    }
                })?)
            }
            OptionCode::ServerIdentifier => Self::ServerIdentifier(
                fixed::<4>(code, data, "server identifier must be 4 bytes")?.into(),
            ),
            OptionCode::ParameterRequestList => Self::ParameterRequestList(data.to_vec()),
            OptionCode::RenewalTime => Self::RenewalTime(u32::from_be_bytes(fixed(
                code,
                data,
                "T1 must be 4 bytes",
            )?)),
            OptionCode::RebindingTime => Self::RebindingTime(u32::from_be_bytes(fixed(
                code,
                data,
                "T2 must be 4 bytes",
            )?)),
            OptionCode::Pad | OptionCode::End => {
                return Err(DecodeError::InvalidOption {
                    code,
                    reason: "pad and end have no value",
                });
            }
        };
        Ok(option)
    }

    /// Appends this option's TLV to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::OptionTooLong`] when the value needs more than
    /// 255 bytes (more than 63 addresses in a list). `out` is left as it was.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        let code = self.option_code();
        match self {
            Self::SubnetMask(addr) | Self::RequestedIpAddress(addr) | Self::ServerIdentifier(addr) => {
                write_tlv(out, code, &addr.octets())
            }
            Self::Router(addrs) | Self::DnsServer(addrs) => {
                let value: Vec<u8> = addrs.iter().flat_map(|addr| addr.octets()).collect();
                write_tlv(out, code, &value)
            }
            Self::LeaseTime(seconds) | Self::RenewalTime(seconds) | Self::RebindingTime(seconds) => {
                write_tlv(out, code, &seconds.to_be_bytes())
            }
            Self::MessageType(message_type) => write_tlv(out, code, &[*message_type as u8]),
            Self::Hostname(data)
            | Self::DomainName(data)
            | Self::ParameterRequestList(data)
            | Self::Unknown(_, data) => write_tlv(out, code, data),
        }
    }

    /// Encodes this option as a standalone TLV.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }
}
