//! Ethernet hardware addresses.
//!
//! Clients are identified by the first six bytes of `chaddr`. Reservations in
//! the config file spell MACs as `aa:bb:cc:dd:ee:ff` (hyphens and upper case
//! are accepted on input); they are always displayed lower-case with colons.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Extracts the client MAC from a packet's `chaddr` field.
    ///
    /// Only the first `hlen` bytes are significant; shorter hardware
    /// addresses are zero-extended to six bytes.
    pub fn from_chaddr(chaddr: &[u8; 16], hlen: u8) -> Self {
        let len = (hlen as usize).min(6);
        let mut octets = [0u8; 6];
        octets[..len].copy_from_slice(&chaddr[..len]);
        Self(octets)
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace('-', ":");
        let mut octets = [0u8; 6];
        let mut count = 0;

        for part in normalized.split(':') {
            if count == 6 || part.len() != 2 {
                return Err(Error::InvalidMacAddress(value.to_string()));
            }
            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidMacAddress(value.to_string()))?;
            count += 1;
        }

        if count != 6 {
            return Err(Error::InvalidMacAddress(value.to_string()));
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
