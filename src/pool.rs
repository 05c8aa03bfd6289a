//! Address pool and lease table.
//!
//! The pool owns the inclusive range `[range_start, range_end]` and one
//! [`LeaseEntry`] per address that has ever been handed out. It is plain
//! data with no locking of its own: callers hold it inside
//! [`SharedState`](crate::state::SharedState) so every scan-and-claim runs
//! in a single critical section.
//!
//! Every operation takes `now` explicitly. Entries past their expiration
//! stop blocking allocation immediately; [`AddressPool::sweep`] only moves
//! them to `Expired` so the table reads correctly.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::DhcpConfig;
use crate::lease::{LeaseEntry, LeaseState};
use crate::mac::MacAddress;
use crate::reservation::Reservations;

/// Utilization snapshot reported at the management boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_ips: u32,
    pub used_ips: u32,
    pub reserved_ips: u32,
    pub available_ips: u32,
    pub utilization_percent: f64,
}

#[derive(Debug, Clone)]
pub struct AddressPool {
    range_start: u32,
    range_end: u32,
    offer_timeout_seconds: u32,
    decline_cooldown_seconds: u32,
    reservations: Reservations,
    entries: BTreeMap<Ipv4Addr, LeaseEntry>,
}

impl AddressPool {
    pub fn new(config: &DhcpConfig) -> Self {
        Self {
            range_start: u32::from(config.range_start),
            range_end: u32::from(config.range_end),
            offer_timeout_seconds: config.offer_timeout_seconds,
            decline_cooldown_seconds: config.decline_cooldown_seconds,
            reservations: Reservations::new(&config.static_reservations),
            entries: BTreeMap::new(),
        }
    }

    /// Applies a new range, timers and reservation set.
    ///
    /// Existing entries are kept as they are. Entries that fall outside a
    /// narrowed range stay in the table until they expire but are never
    /// handed out again and cannot be renewed.
    pub fn reconfigure(&mut self, config: &DhcpConfig) {
        self.range_start = u32::from(config.range_start);
        self.range_end = u32::from(config.range_end);
        self.offer_timeout_seconds = config.offer_timeout_seconds;
        self.decline_cooldown_seconds = config.decline_cooldown_seconds;
        self.reservations = Reservations::new(&config.static_reservations);

        let stranded = self
            .entries
            .keys()
            .filter(|ip| !self.in_range(**ip))
            .count();
        if stranded > 0 {
            debug!("{} lease entries now outside the dynamic range", stranded);
        }
    }

    pub fn in_range(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= self.range_start && addr <= self.range_end
    }

    pub fn reservations(&self) -> &Reservations {
        &self.reservations
    }

    /// The entry currently recorded for `ip`, live or not.
    pub fn entry(&self, ip: Ipv4Addr) -> Option<&LeaseEntry> {
        self.entries.get(&ip)
    }

    /// The live `Offered` or `Active` entry held by `mac`, if any.
    pub fn binding_for(&self, mac: &MacAddress, now: DateTime<Utc>) -> Option<&LeaseEntry> {
        self.entries.values().find(|entry| {
            entry.mac_address == *mac
                && matches!(entry.state, LeaseState::Offered | LeaseState::Active)
                && entry.is_live(now)
        })
    }

    /// The unexpired `Active` lease held by `mac`, if any.
    pub fn lease_for(&self, mac: &MacAddress, now: DateTime<Utc>) -> Option<&LeaseEntry> {
        self.entries
            .values()
            .find(|entry| entry.mac_address == *mac && entry.is_bound(now))
    }

    /// True when `mac` holds a live offer or lease on exactly `ip`.
    pub fn is_bound_to(&self, mac: &MacAddress, ip: Ipv4Addr, now: DateTime<Utc>) -> bool {
        self.entries.get(&ip).is_some_and(|entry| {
            entry.mac_address == *mac
                && matches!(entry.state, LeaseState::Offered | LeaseState::Active)
                && entry.is_live(now)
        })
    }

    /// Picks an address for `mac`, claiming it as `Offered`.
    ///
    /// A reservation always wins and is held as `Offered` unless another
    /// client's entry is still live on it. A client that already holds a
    /// live offer or lease it may keep (in range, not reserved for someone
    /// else) gets the same address back. Otherwise its stale offers are
    /// dropped and the lowest free, unreserved address is claimed. Returns
    /// `None` when the range is exhausted.
    pub fn try_allocate(&mut self, mac: &MacAddress, now: DateTime<Utc>) -> Option<Ipv4Addr> {
        if let Some(reserved) = self.reservations.address_for(mac) {
            self.hold_offer(mac, reserved, now);
            return Some(reserved);
        }

        let existing = self
            .entries
            .values()
            .find(|entry| {
                entry.mac_address == *mac
                    && matches!(entry.state, LeaseState::Offered | LeaseState::Active)
                    && entry.is_live(now)
                    && self.in_range(entry.ip_address)
                    && !self.reservations.is_reserved_for_other(entry.ip_address, mac)
            })
            .map(|entry| entry.ip_address);
        if let Some(ip) = existing {
            self.hold_offer(mac, ip, now);
            return Some(ip);
        }

        self.release_mac_offer(mac, now);

        let ip = (self.range_start..=self.range_end)
            .map(Ipv4Addr::from)
            .find(|ip| {
                !self.reservations.is_reserved(*ip)
                    && !self.entries.get(ip).is_some_and(|entry| entry.is_live(now))
            })?;

        self.hold_offer(mac, ip, now);
        Some(ip)
    }

    /// Marks `ip` as offered to `mac` for the offer timeout. A live entry
    /// owned by another client, or an `Active` lease, is left alone.
    fn hold_offer(&mut self, mac: &MacAddress, ip: Ipv4Addr, now: DateTime<Utc>) {
        let hold = TimeDelta::seconds(i64::from(self.offer_timeout_seconds));
        match self.entries.get_mut(&ip) {
            Some(entry) if entry.is_live(now) => {
                if entry.mac_address == *mac && entry.state == LeaseState::Offered {
                    entry.expiration = now + hold;
                }
            }
            _ => {
                let entry =
                    LeaseEntry::new(*mac, ip, LeaseState::Offered, now, self.offer_timeout_seconds);
                self.entries.insert(ip, entry);
            }
        }
    }

    /// True when `ip` could be committed to `mac` right now.
    pub fn is_available_for(&self, ip: Ipv4Addr, mac: &MacAddress, now: DateTime<Utc>) -> bool {
        if self.reservations.address_for(mac) == Some(ip) {
            return true;
        }

        if !self.in_range(ip) || self.reservations.is_reserved_for_other(ip, mac) {
            return false;
        }

        match self.entries.get(&ip) {
            Some(entry) if entry.is_live(now) => {
                entry.mac_address == *mac && entry.state != LeaseState::Declined
            }
            _ => true,
        }
    }

    /// Binds `ip` to `mac` as `Active` for `lease_seconds` from `now`.
    ///
    /// Fails if the address is outside the range, reserved for another MAC,
    /// or held live by a different client. Any other address `mac` was
    /// holding is released, and a MAC's own reservation always wins.
    pub fn commit(
        &mut self,
        mac: &MacAddress,
        ip: Ipv4Addr,
        lease_seconds: u32,
        hostname: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.is_available_for(ip, mac, now) {
            return false;
        }

        let previous: Vec<Ipv4Addr> = self
            .entries
            .values()
            .filter(|entry| {
                entry.mac_address == *mac
                    && entry.ip_address != ip
                    && matches!(entry.state, LeaseState::Offered | LeaseState::Active)
                    && entry.is_live(now)
            })
            .map(|entry| entry.ip_address)
            .collect();
        for old in previous {
            self.release(mac, old, now);
        }

        let hostname = hostname.or_else(|| {
            self.entries
                .get(&ip)
                .filter(|entry| entry.mac_address == *mac)
                .and_then(|entry| entry.hostname.clone())
        });

        let mut entry = LeaseEntry::new(*mac, ip, LeaseState::Active, now, lease_seconds);
        entry.hostname = hostname;
        self.entries.insert(ip, entry);
        true
    }

    /// Releases `ip` if `mac` holds it as an offer or lease.
    pub fn release(&mut self, mac: &MacAddress, ip: Ipv4Addr, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(&ip) {
            Some(entry)
                if entry.mac_address == *mac
                    && matches!(entry.state, LeaseState::Offered | LeaseState::Active) =>
            {
                entry.state = LeaseState::Released;
                entry.expiration = now;
                true
            }
            _ => false,
        }
    }

    /// Releases every offer or lease held by `mac`.
    pub fn release_mac(&mut self, mac: &MacAddress, now: DateTime<Utc>) -> bool {
        let held: Vec<Ipv4Addr> = self
            .entries
            .values()
            .filter(|entry| {
                entry.mac_address == *mac
                    && matches!(entry.state, LeaseState::Offered | LeaseState::Active)
            })
            .map(|entry| entry.ip_address)
            .collect();

        let mut released = false;
        for ip in held {
            released |= self.release(mac, ip, now);
        }
        released
    }

    /// Drops every outstanding offer to `mac`. Leases are kept.
    pub fn release_mac_offer(&mut self, mac: &MacAddress, now: DateTime<Utc>) -> bool {
        let offered: Vec<Ipv4Addr> = self
            .entries
            .values()
            .filter(|entry| {
                entry.mac_address == *mac
                    && entry.state == LeaseState::Offered
                    && entry.is_live(now)
            })
            .map(|entry| entry.ip_address)
            .collect();

        let mut released = false;
        for ip in offered {
            released |= self.release(mac, ip, now);
        }
        released
    }

    /// Records a client's report that `ip` is already in use on the wire.
    ///
    /// Accepted for a free in-range address or one held by `mac` itself; the
    /// address is then withheld from every client for the decline cooldown.
    pub fn decline(&mut self, mac: &MacAddress, ip: Ipv4Addr, now: DateTime<Utc>) -> bool {
        if !self.in_range(ip) || self.reservations.is_reserved_for_other(ip, mac) {
            return false;
        }

        let can_decline = match self.entries.get(&ip) {
            Some(entry) if entry.is_live(now) => entry.mac_address == *mac,
            _ => true,
        };
        if !can_decline {
            return false;
        }

        let entry = LeaseEntry::new(
            *mac,
            ip,
            LeaseState::Declined,
            now,
            self.decline_cooldown_seconds,
        );
        self.entries.insert(ip, entry);
        true
    }

    /// Moves every offer, lease and decline past its expiration to
    /// `Expired`. Returns how many entries changed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for entry in self.entries.values_mut() {
            if matches!(
                entry.state,
                LeaseState::Offered | LeaseState::Active | LeaseState::Declined
            ) && entry.expiration <= now
            {
                entry.state = LeaseState::Expired;
                expired += 1;
            }
        }
        expired
    }

    /// All recorded entries in address order.
    pub fn leases(&self) -> Vec<LeaseEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> PoolStats {
        let total_ips = self.range_end - self.range_start + 1;

        let reserved_ips = self
            .reservations
            .iter()
            .filter(|reservation| self.in_range(reservation.ip_address))
            .count() as u32;

        let used_ips = self
            .entries
            .values()
            .filter(|entry| {
                entry.is_live(now)
                    && self.in_range(entry.ip_address)
                    && !self.reservations.is_reserved(entry.ip_address)
            })
            .count() as u32;

        let available_ips = total_ips.saturating_sub(used_ips + reserved_ips);
        let utilization_percent =
            f64::from(used_ips + reserved_ips) / f64::from(total_ips) * 100.0;

        PoolStats {
            total_ips,
            used_ips,
            reserved_ips,
            available_ips,
            utilization_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticReservation;

    fn test_config() -> DhcpConfig {
        DhcpConfig {
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 104),
            lease_time_minutes: 60,
            ..Default::default()
        }
    }

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, last)
    }

    fn with_reservation(mac_last: u8, ip_last: u8) -> DhcpConfig {
        DhcpConfig {
            static_reservations: vec![StaticReservation {
                mac_address: mac(mac_last),
                ip_address: ip(ip_last),
                hostname: Some("printer".to_string()),
                description: None,
            }],
            ..test_config()
        }
    }

    #[test]
    fn test_allocates_lowest_free_address() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        assert_eq!(pool.try_allocate(&mac(1), now), Some(ip(100)));
        assert_eq!(pool.try_allocate(&mac(2), now), Some(ip(101)));
        assert_eq!(pool.entry(ip(100)).unwrap().state, LeaseState::Offered);
    }

    #[test]
    fn test_reoffer_is_idempotent() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        let first = pool.try_allocate(&mac(1), now);
        let second = pool.try_allocate(&mac(1), now + TimeDelta::seconds(5));
        assert_eq!(first, second);
        assert_eq!(pool.leases().len(), 1);
    }

    #[test]
    fn test_offer_hold_lapses() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        assert_eq!(pool.try_allocate(&mac(1), now), Some(ip(100)));
        let later = now + TimeDelta::seconds(31);
        assert_eq!(pool.try_allocate(&mac(2), later), Some(ip(100)));
    }

    #[test]
    fn test_commit_and_renew() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        let offered = pool.try_allocate(&mac(1), now).unwrap();
        assert!(pool.commit(&mac(1), offered, 3600, Some("laptop".to_string()), now));

        let entry = pool.entry(offered).unwrap();
        assert_eq!(entry.state, LeaseState::Active);
        assert_eq!(entry.expiration, now + TimeDelta::seconds(3600));

        let later = now + TimeDelta::seconds(1800);
        assert!(pool.commit(&mac(1), offered, 3600, None, later));
        let entry = pool.entry(offered).unwrap();
        assert_eq!(entry.expiration, later + TimeDelta::seconds(3600));
        assert_eq!(entry.hostname.as_deref(), Some("laptop"));
    }

    #[test]
    fn test_commit_conflict() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        assert!(pool.commit(&mac(1), ip(100), 3600, None, now));
        assert!(!pool.commit(&mac(2), ip(100), 3600, None, now));
        assert!(!pool.commit(&mac(2), ip(50), 3600, None, now));
    }

    #[test]
    fn test_commit_moves_client_to_new_address() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        assert!(pool.commit(&mac(1), ip(100), 3600, None, now));
        assert!(pool.commit(&mac(1), ip(102), 3600, None, now));

        assert_eq!(pool.entry(ip(100)).unwrap().state, LeaseState::Released);
        assert_eq!(pool.lease_for(&mac(1), now).unwrap().ip_address, ip(102));
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        for last in 1..=5 {
            let offered = pool.try_allocate(&mac(last), now).unwrap();
            assert!(pool.commit(&mac(last), offered, 3600, None, now));
        }
        assert_eq!(pool.try_allocate(&mac(6), now), None);
    }

    #[test]
    fn test_release_frees_immediately() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        assert!(pool.commit(&mac(1), ip(100), 3600, None, now));
        assert!(!pool.release(&mac(2), ip(100), now));
        assert!(pool.release(&mac(1), ip(100), now));
        assert_eq!(pool.try_allocate(&mac(2), now), Some(ip(100)));
    }

    #[test]
    fn test_release_mac() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        assert!(!pool.release_mac(&mac(1), now));
        assert!(pool.commit(&mac(1), ip(101), 3600, None, now));
        assert!(pool.release_mac(&mac(1), now));
        assert!(pool.lease_for(&mac(1), now).is_none());
    }

    #[test]
    fn test_release_mac_offer_keeps_leases() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        assert!(pool.commit(&mac(1), ip(100), 3600, None, now));
        assert!(!pool.release_mac_offer(&mac(1), now));

        pool.try_allocate(&mac(2), now);
        assert!(pool.release_mac_offer(&mac(2), now));
        assert!(pool.binding_for(&mac(2), now).is_none());
    }

    #[test]
    fn test_decline_cooldown() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        assert!(pool.decline(&mac(1), ip(100), now));
        assert_eq!(pool.try_allocate(&mac(2), now), Some(ip(101)));
        assert!(!pool.commit(&mac(1), ip(100), 3600, None, now));

        let after = now + TimeDelta::seconds(3601);
        assert_eq!(pool.try_allocate(&mac(3), after), Some(ip(100)));
    }

    #[test]
    fn test_decline_rules() {
        let mut pool = AddressPool::new(&with_reservation(9, 104));
        let now = Utc::now();

        assert!(pool.commit(&mac(1), ip(100), 3600, None, now));
        assert!(!pool.decline(&mac(2), ip(100), now));
        assert!(pool.decline(&mac(1), ip(100), now));
        assert!(!pool.decline(&mac(1), ip(50), now));
        assert!(!pool.decline(&mac(1), ip(104), now));
    }

    #[test]
    fn test_reservation_precedence() {
        let mut pool = AddressPool::new(&with_reservation(9, 102));
        let now = Utc::now();

        for last in 1..=4 {
            let offered = pool.try_allocate(&mac(last), now).unwrap();
            assert_ne!(offered, ip(102));
            assert!(pool.commit(&mac(last), offered, 3600, None, now));
        }
        assert_eq!(pool.try_allocate(&mac(5), now), None);
        assert_eq!(pool.try_allocate(&mac(9), now), Some(ip(102)));
        assert!(pool.commit(&mac(9), ip(102), 3600, None, now));
    }

    #[test]
    fn test_reserved_client_is_held_as_offered() {
        let mut pool = AddressPool::new(&with_reservation(9, 102));
        let now = Utc::now();

        assert_eq!(pool.try_allocate(&mac(9), now), Some(ip(102)));
        let entry = pool.entry(ip(102)).unwrap();
        assert_eq!(entry.state, LeaseState::Offered);
        assert_eq!(entry.mac_address, mac(9));
        assert_eq!(pool.leases().len(), 1);

        assert!(pool.commit(&mac(9), ip(102), 3600, None, now));
        assert_eq!(pool.try_allocate(&mac(9), now), Some(ip(102)));
        assert_eq!(pool.entry(ip(102)).unwrap().state, LeaseState::Active);
    }

    #[test]
    fn test_new_reservation_moves_current_holder() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();
        assert!(pool.commit(&mac(1), ip(100), 3600, None, now));

        pool.reconfigure(&with_reservation(9, 100));

        let moved = pool.try_allocate(&mac(1), now).unwrap();
        assert_eq!(moved, ip(101));
        assert_eq!(pool.try_allocate(&mac(1), now), Some(ip(101)));
        assert!(pool.commit(&mac(1), moved, 3600, None, now));
        assert_eq!(pool.entry(ip(100)).unwrap().state, LeaseState::Released);
        assert_eq!(pool.lease_for(&mac(1), now).unwrap().ip_address, ip(101));

        assert_eq!(pool.try_allocate(&mac(9), now), Some(ip(100)));
        assert!(pool.commit(&mac(9), ip(100), 3600, None, now));
    }

    #[test]
    fn test_reserved_address_refused_to_others() {
        let mut pool = AddressPool::new(&with_reservation(9, 100));
        let now = Utc::now();

        assert!(!pool.commit(&mac(1), ip(100), 3600, None, now));
        assert!(!pool.is_available_for(ip(100), &mac(1), now));
        assert!(pool.is_available_for(ip(100), &mac(9), now));
    }

    #[test]
    fn test_sweep_expires_entries() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        assert!(pool.commit(&mac(1), ip(100), 60, None, now));
        pool.try_allocate(&mac(2), now);
        assert_eq!(pool.sweep(now), 0);

        let later = now + TimeDelta::seconds(61);
        assert_eq!(pool.sweep(later), 2);
        assert_eq!(pool.entry(ip(100)).unwrap().state, LeaseState::Expired);
        assert_eq!(pool.entry(ip(101)).unwrap().state, LeaseState::Expired);
        assert_eq!(pool.sweep(later), 0);
        assert_eq!(pool.try_allocate(&mac(3), later), Some(ip(100)));
    }

    #[test]
    fn test_stats() {
        let mut pool = AddressPool::new(&with_reservation(9, 104));
        let now = Utc::now();

        assert!(pool.commit(&mac(1), ip(100), 3600, None, now));
        pool.try_allocate(&mac(2), now);
        assert!(pool.commit(&mac(9), ip(104), 3600, None, now));

        let stats = pool.stats(now);
        assert_eq!(stats.total_ips, 5);
        assert_eq!(stats.used_ips, 2);
        assert_eq!(stats.reserved_ips, 1);
        assert_eq!(stats.available_ips, 2);
        assert!((stats.utilization_percent - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_reconfigure_narrowing_keeps_leases() {
        let mut pool = AddressPool::new(&test_config());
        let now = Utc::now();

        assert!(pool.commit(&mac(1), ip(104), 3600, None, now));

        let narrowed = DhcpConfig {
            range_end: ip(102),
            ..test_config()
        };
        pool.reconfigure(&narrowed);

        assert!(pool.lease_for(&mac(1), now).is_some());
        assert!(!pool.commit(&mac(1), ip(104), 3600, None, now));
        assert_eq!(pool.try_allocate(&mac(1), now), Some(ip(100)));
        assert_eq!(pool.stats(now).total_ips, 3);
    }
}
