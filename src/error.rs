//! Crate-wide errors.
//!
//! Management and startup paths return [`Result<T>`]. The packet codec has
//! its own [`DecodeError`] and [`EncodeError`]: the listener logs and drops
//! those, they never reach a caller.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Reading or writing the config file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rejected by [`DhcpConfig::validate`](crate::DhcpConfig::validate).
    /// Whatever config was running before stays in effect.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Creating, configuring or binding the port 67 socket. Binding needs
    /// root or `CAP_NET_BIND_SERVICE`.
    #[error("Socket error: {0}")]
    Socket(String),

    /// A MAC address literal could not be parsed.
    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),
}

/// Reasons a datagram fails to decode as a DHCP packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("packet too short: {len} bytes (minimum {minimum})")]
    TooShort { len: usize, minimum: usize },

    #[error("invalid magic cookie {0:?}")]
    BadMagicCookie([u8; 4]),

    #[error("hardware address length {0} exceeds 16")]
    HardwareLengthTooLong(u8),

    #[error("hop count {0} exceeds maximum")]
    TooManyHops(u8),

    /// An option code was present without its length byte.
    #[error("option {code} is missing its length byte")]
    TruncatedOption { code: u8 },

    /// An option's declared length runs past the end of the buffer.
    #[error("option {code} declares {length} bytes but only {remaining} remain")]
    OptionOverrun {
        code: u8,
        length: usize,
        remaining: usize,
    },

    /// A known option carried a value of the wrong shape.
    #[error("option {code}: {reason}")]
    InvalidOption { code: u8, reason: &'static str },
}

/// Reasons a packet cannot be written to the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// An option value does not fit behind a single length byte.
    #[error("option {code} value is {length} bytes, a length byte holds 255")]
    OptionTooLong { code: u8, length: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
