//! Server configuration.
//!
//! The configuration is a single JSON document. Every field has a default so
//! a partial file (or an empty `{}`) is accepted and filled in. Validation
//! runs on load and on every management update; a config that fails
//! validation is never applied.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mac::MacAddress;

/// Longest lease a client may be granted, in minutes (one year).
const MAX_LEASE_TIME_MINUTES: u32 = 525_600;

/// A MAC-pinned address that bypasses dynamic allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticReservation {
    pub mac_address: MacAddress,
    pub ip_address: Ipv4Addr,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    /// This server's own address, sent as option 54.
    pub server_identifier: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_primary: Option<Ipv4Addr>,
    pub dns_secondary: Option<Ipv4Addr>,
    pub lease_time_minutes: u32,
    pub min_lease_time_minutes: Option<u32>,
    pub max_lease_time_minutes: Option<u32>,
    pub domain_name: Option<String>,
    /// NAK requests from clients this server has no record of.
    pub authoritative: bool,
    pub renewal_time_seconds: Option<u32>,
    pub rebinding_time_seconds: Option<u32>,
    pub offer_timeout_seconds: u32,
    pub decline_cooldown_seconds: u32,
    pub sweep_interval_seconds: u32,
    pub max_concurrent_packets: usize,
    pub static_reservations: Vec<StaticReservation>,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            server_identifier: Ipv4Addr::new(192, 168, 1, 1),
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 200),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dns_primary: Some(Ipv4Addr::new(1, 1, 1, 1)),
            dns_secondary: Some(Ipv4Addr::new(9, 9, 9, 9)),
            lease_time_minutes: 1440,
            min_lease_time_minutes: None,
            max_lease_time_minutes: None,
            domain_name: None,
            authoritative: true,
            renewal_time_seconds: None,
            rebinding_time_seconds: None,
            offer_timeout_seconds: 30,
            decline_cooldown_seconds: 3600,
            sweep_interval_seconds: 30,
            max_concurrent_packets: 64,
            static_reservations: Vec::new(),
        }
    }
}

impl DhcpConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: DhcpConfig = serde_json::from_str(content)
            .map_err(|error| Error::InvalidConfig(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the config at `path`, writing the defaults there first if the
    /// file does not exist yet.
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path).await?;
            Self::from_json(&content)
        } else {
            let config = DhcpConfig::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let start = u32::from(self.range_start);
        let end = u32::from(self.range_end);

        if start >= end {
            return Err(Error::InvalidConfig(
                "range_start must be less than range_end".to_string(),
            ));
        }

        let mask = u32::from(self.subnet_mask);
        if mask == 0 || mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(Error::InvalidConfig(format!(
                "subnet_mask {} is not a contiguous netmask",
                self.subnet_mask
            )));
        }

        let network = u32::from(self.server_identifier) & mask;
        if start & mask != network || end & mask != network {
            return Err(Error::InvalidConfig(format!(
                "range {}-{} is not inside the server's subnet",
                self.range_start, self.range_end
            )));
        }

        if self.in_range(self.server_identifier) {
            return Err(Error::InvalidConfig(
                "server_identifier must not be within the dynamic range".to_string(),
            ));
        }

        if let Some(gateway) = self.gateway
            && self.in_range(gateway)
        {
            return Err(Error::InvalidConfig(
                "gateway must not be within the dynamic range".to_string(),
            ));
        }

        if let Some(domain) = &self.domain_name
            && (domain.is_empty() || domain.len() > usize::from(u8::MAX))
        {
            return Err(Error::InvalidConfig(
                "domain_name must be between 1 and 255 bytes".to_string(),
            ));
        }

        self.validate_lease_times()?;

        if self.offer_timeout_seconds == 0
            || self.decline_cooldown_seconds == 0
            || self.sweep_interval_seconds == 0
        {
            return Err(Error::InvalidConfig(
                "offer, decline and sweep timers must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_packets == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_packets must be greater than 0".to_string(),
            ));
        }

        let mut macs = HashSet::new();
        let mut ips = HashSet::new();
        for reservation in &self.static_reservations {
            if !self.in_range(reservation.ip_address) {
                return Err(Error::InvalidConfig(format!(
                    "reservation {} for {} is outside the dynamic range",
                    reservation.ip_address, reservation.mac_address
                )));
            }
            if !macs.insert(reservation.mac_address) {
                return Err(Error::InvalidConfig(format!(
                    "{} has more than one reservation",
                    reservation.mac_address
                )));
            }
            if !ips.insert(reservation.ip_address) {
                return Err(Error::InvalidConfig(format!(
                    "{} is reserved more than once",
                    reservation.ip_address
                )));
            }
        }

        Ok(())
    }

    fn validate_lease_times(&self) -> Result<()> {
        if self.lease_time_minutes == 0 || self.lease_time_minutes > MAX_LEASE_TIME_MINUTES {
            return Err(Error::InvalidConfig(format!(
                "lease_time_minutes must be between 1 and {MAX_LEASE_TIME_MINUTES}"
            )));
        }

        let min = self.min_lease_time_minutes.unwrap_or(1);
        let max = self
            .max_lease_time_minutes
            .unwrap_or(self.lease_time_minutes);

        if min == 0 || max > MAX_LEASE_TIME_MINUTES {
            return Err(Error::InvalidConfig(format!(
                "lease time bounds must be between 1 and {MAX_LEASE_TIME_MINUTES} minutes"
            )));
        }

        if !(min..=max).contains(&self.lease_time_minutes) {
            return Err(Error::InvalidConfig(format!(
                "lease_time_minutes {} is outside [{min}, {max}]",
                self.lease_time_minutes
            )));
        }

        let lease = self.lease_seconds();
        if let Some(t1) = self.renewal_time_seconds
            && (t1 == 0 || t1 >= lease)
        {
            return Err(Error::InvalidConfig(
                "renewal_time_seconds must be between 1 and the lease time".to_string(),
            ));
        }

        if let Some(t2) = self.rebinding_time_seconds {
            let t1 = self.renewal_time_seconds.unwrap_or(lease / 2);
            if t2 <= t1 || t2 >= lease {
                return Err(Error::InvalidConfig(
                    "rebinding_time_seconds must lie between the renewal and lease times"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn in_range(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.range_start) && addr <= u32::from(self.range_end)
    }

    pub fn range_size(&self) -> u32 {
        u32::from(self.range_end)
            .saturating_sub(u32::from(self.range_start))
            .saturating_add(1)
    }

    /// The configured lease time in seconds.
    pub fn lease_seconds(&self) -> u32 {
        self.lease_time_minutes.saturating_mul(60)
    }

    /// Picks the lease duration for a client that asked for `requested`
    /// seconds (option 51), clamped to the configured bounds.
    pub fn negotiate_lease_seconds(&self, requested: Option<u32>) -> u32 {
        let min = self.min_lease_time_minutes.unwrap_or(1).saturating_mul(60);
        let max = self
            .max_lease_time_minutes
            .unwrap_or(self.lease_time_minutes)
            .saturating_mul(60);

        match requested {
            Some(seconds) => seconds.max(min).min(max),
            None => self.lease_seconds(),
        }
    }

    /// T1 for a lease of `lease` seconds.
    pub fn renewal_seconds(&self, lease: u32) -> u32 {
        self.renewal_time_seconds.unwrap_or(lease / 2).min(lease)
    }

    /// T2 for a lease of `lease` seconds.
    pub fn rebinding_seconds(&self, lease: u32) -> u32 {
        let default = (lease as u64 * 7 / 8) as u32;
        self.rebinding_time_seconds
            .unwrap_or(default)
            .min(lease)
            .max(self.renewal_seconds(lease))
    }

    pub fn dns_servers(&self) -> Vec<Ipv4Addr> {
        self.dns_primary
            .into_iter()
            .chain(self.dns_secondary)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(mac: &str, ip: Ipv4Addr) -> StaticReservation {
        StaticReservation {
            mac_address: mac.parse().unwrap(),
            ip_address: ip,
            hostname: None,
            description: None,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = DhcpConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_range_start_not_below_end() {
        let config = DhcpConfig {
            range_start: Ipv4Addr::new(192, 168, 1, 200),
            range_end: Ipv4Addr::new(192, 168, 1, 100),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DhcpConfig {
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 100),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_identifier_in_range() {
        let config = DhcpConfig {
            server_identifier: Ipv4Addr::new(192, 168, 1, 150),
            gateway: None,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gateway_in_range() {
        let config = DhcpConfig {
            gateway: Some(Ipv4Addr::new(192, 168, 1, 150)),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_range_outside_subnet() {
        let config = DhcpConfig {
            range_end: Ipv4Addr::new(192, 168, 2, 10),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_contiguous_mask() {
        let config = DhcpConfig {
            subnet_mask: Ipv4Addr::new(255, 0, 255, 0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lease_time_bounds() {
        let zero = DhcpConfig {
            lease_time_minutes: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let below_min = DhcpConfig {
            lease_time_minutes: 10,
            min_lease_time_minutes: Some(30),
            ..Default::default()
        };
        assert!(below_min.validate().is_err());

        let above_max = DhcpConfig {
            lease_time_minutes: 120,
            max_lease_time_minutes: Some(60),
            ..Default::default()
        };
        assert!(above_max.validate().is_err());

        let bounded = DhcpConfig {
            lease_time_minutes: 60,
            min_lease_time_minutes: Some(10),
            max_lease_time_minutes: Some(120),
            ..Default::default()
        };
        assert!(bounded.validate().is_ok());
    }

    #[test]
    fn test_renewal_rebinding_ordering() {
        let config = DhcpConfig {
            lease_time_minutes: 60,
            renewal_time_seconds: Some(3000),
            rebinding_time_seconds: Some(2000),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DhcpConfig {
            lease_time_minutes: 60,
            renewal_time_seconds: Some(1200),
            rebinding_time_seconds: Some(3000),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timers_rejected() {
        let config = DhcpConfig {
            sweep_interval_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DhcpConfig {
            max_concurrent_packets: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reservation_validation() {
        let outside = DhcpConfig {
            static_reservations: vec![reservation(
                "aa:bb:cc:dd:ee:01",
                Ipv4Addr::new(192, 168, 1, 50),
            )],
            ..Default::default()
        };
        assert!(outside.validate().is_err());

        let duplicate_mac = DhcpConfig {
            static_reservations: vec![
                reservation("aa:bb:cc:dd:ee:01", Ipv4Addr::new(192, 168, 1, 150)),
                reservation("aa:bb:cc:dd:ee:01", Ipv4Addr::new(192, 168, 1, 151)),
            ],
            ..Default::default()
        };
        assert!(duplicate_mac.validate().is_err());

        let duplicate_ip = DhcpConfig {
            static_reservations: vec![
                reservation("aa:bb:cc:dd:ee:01", Ipv4Addr::new(192, 168, 1, 150)),
                reservation("aa:bb:cc:dd:ee:02", Ipv4Addr::new(192, 168, 1, 150)),
            ],
            ..Default::default()
        };
        assert!(duplicate_ip.validate().is_err());
    }

    #[test]
    fn test_in_range_and_size() {
        let config = DhcpConfig::default();
        assert!(config.in_range(Ipv4Addr::new(192, 168, 1, 100)));
        assert!(config.in_range(Ipv4Addr::new(192, 168, 1, 200)));
        assert!(!config.in_range(Ipv4Addr::new(192, 168, 1, 50)));
        assert!(!config.in_range(Ipv4Addr::new(192, 168, 1, 250)));
        assert_eq!(config.range_size(), 101);
    }

    #[test]
    fn test_negotiate_lease_seconds() {
        let config = DhcpConfig {
            lease_time_minutes: 60,
            min_lease_time_minutes: Some(5),
            max_lease_time_minutes: Some(120),
            ..Default::default()
        };

        assert_eq!(config.negotiate_lease_seconds(None), 3600);
        assert_eq!(config.negotiate_lease_seconds(Some(10)), 300);
        assert_eq!(config.negotiate_lease_seconds(Some(1800)), 1800);
        assert_eq!(config.negotiate_lease_seconds(Some(u32::MAX)), 7200);
    }

    #[test]
    fn test_default_negotiation_caps_at_lease_time() {
        let config = DhcpConfig::default();
        assert_eq!(config.negotiate_lease_seconds(Some(u32::MAX)), 86400);
        assert_eq!(config.negotiate_lease_seconds(Some(1)), 60);
    }

    #[test]
    fn test_renewal_and_rebinding_defaults() {
        let config = DhcpConfig::default();
        assert_eq!(config.renewal_seconds(3600), 1800);
        assert_eq!(config.rebinding_seconds(3600), 3150);

        let config = DhcpConfig {
            renewal_time_seconds: Some(1000),
            rebinding_time_seconds: Some(2000),
            ..Default::default()
        };
        assert_eq!(config.renewal_seconds(600), 600);
        assert_eq!(config.rebinding_seconds(600), 600);
    }

    #[test]
    fn test_dns_servers() {
        let config = DhcpConfig {
            dns_primary: None,
            dns_secondary: Some(Ipv4Addr::new(9, 9, 9, 9)),
            ..Default::default()
        };
        assert_eq!(config.dns_servers(), vec![Ipv4Addr::new(9, 9, 9, 9)]);
    }

    #[test]
    fn test_domain_name_must_fit_one_option() {
        let fits = DhcpConfig {
            domain_name: Some("d".repeat(255)),
            ..Default::default()
        };
        assert!(fits.validate().is_ok());

        for domain in [String::new(), "d".repeat(256)] {
            let config = DhcpConfig {
                domain_name: Some(domain),
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_from_json_partial_and_invalid() {
        let config = DhcpConfig::from_json(r#"{"lease_time_minutes": 60}"#).unwrap();
        assert_eq!(config.lease_time_minutes, 60);
        assert_eq!(config.range_start, Ipv4Addr::new(192, 168, 1, 100));

        assert!(matches!(
            DhcpConfig::from_json(r#"{"range_start": "192.168.1.999"}"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            DhcpConfig::from_json(r#"{"static_reservations": [{"mac_address": "zz", "ip_address": "192.168.1.150"}]}"#),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhcp.json");

        let created = DhcpConfig::load_or_create(&path).await.unwrap();
        assert_eq!(created, DhcpConfig::default());
        assert!(path.exists());

        let mut changed = created.clone();
        changed.lease_time_minutes = 120;
        changed.save(&path).await.unwrap();

        let loaded = DhcpConfig::load_or_create(&path).await.unwrap();
        assert_eq!(loaded.lease_time_minutes, 120);
    }
}
