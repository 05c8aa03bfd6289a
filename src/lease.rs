//! Lease records.
//!
//! A [`LeaseEntry`] is one row of the pool's lease table. Every state that
//! holds an address carries an `expiration`; past it the entry no longer
//! blocks allocation even before the sweeper has visited it:
//!
//! - `Offered`: expiration is the end of the offer hold
//! - `Active`: expiration is the end of the lease
//! - `Declined`: expiration is the end of the conflict cooldown
//!
//! `Expired` and `Released` rows are kept as history and never block anything.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::mac::MacAddress;

/// Longest hostname kept on a lease (one DNS label).
const MAX_HOSTNAME_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Offered,
    Active,
    Expired,
    Released,
    Declined,
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offered => write!(f, "offered"),
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::Released => write!(f, "released"),
            Self::Declined => write!(f, "declined"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseEntry {
    pub mac_address: MacAddress,
    pub ip_address: Ipv4Addr,
    /// Client-provided hostname (Option 12), sanitized.
    pub hostname: Option<String>,
    pub state: LeaseState,
    pub lease_start: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
}

impl LeaseEntry {
    /// Creates an entry that holds its address for `seconds` from `now`.
    pub fn new(
        mac_address: MacAddress,
        ip_address: Ipv4Addr,
        state: LeaseState,
        now: DateTime<Utc>,
        seconds: u32,
    ) -> Self {
        Self {
            mac_address,
            ip_address,
            hostname: None,
            state,
            lease_start: now,
            expiration: now + TimeDelta::seconds(i64::from(seconds)),
        }
    }

    /// True while this entry keeps its address out of the free pool.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.state,
            LeaseState::Offered | LeaseState::Active | LeaseState::Declined
        ) && self.expiration > now
    }

    /// True for an unexpired `Active` lease.
    pub fn is_bound(&self, now: DateTime<Utc>) -> bool {
        self.state == LeaseState::Active && self.expiration > now
    }
}

/// Reduces a client-supplied hostname to `[A-Za-z0-9.-]`, at most 63 chars.
///
/// Returns `None` when nothing usable is left.
pub fn sanitize_hostname(hostname: &str) -> Option<String> {
    let cleaned: String = hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(MAX_HOSTNAME_LEN)
        .collect();

    let cleaned = cleaned.trim_matches(|c| c == '-' || c == '.');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}
