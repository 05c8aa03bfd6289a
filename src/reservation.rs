//! Static reservation lookup.
//!
//! Reservations are indexed both ways so allocation can ask "does this MAC
//! have a pinned address" and "is this address pinned to someone else" in
//! constant time.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::config::StaticReservation;
use crate::mac::MacAddress;

#[derive(Debug, Clone, Default)]
pub struct Reservations {
    by_mac: HashMap<MacAddress, StaticReservation>,
    by_ip: HashMap<Ipv4Addr, MacAddress>,
}

impl Reservations {
    pub fn new(reservations: &[StaticReservation]) -> Self {
        let mut resolver = Self::default();
        for reservation in reservations {
            resolver.insert(reservation.clone());
        }
        resolver
    }

    /// The address pinned to `mac`, if any.
    pub fn address_for(&self, mac: &MacAddress) -> Option<Ipv4Addr> {
        self.by_mac.get(mac).map(|reservation| reservation.ip_address)
    }

    pub fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        self.by_ip.contains_key(&ip)
    }

    /// True when `ip` is pinned to a MAC other than `mac`.
    pub fn is_reserved_for_other(&self, ip: Ipv4Addr, mac: &MacAddress) -> bool {
        self.by_ip.get(&ip).is_some_and(|owner| owner != mac)
    }

    /// Adds or replaces the reservation for its MAC.
    ///
    /// Returns `false` without changing anything if the address is already
    /// pinned to a different MAC.
    pub fn insert(&mut self, reservation: StaticReservation) -> bool {
        if self.is_reserved_for_other(reservation.ip_address, &reservation.mac_address) {
            return false;
        }

        if let Some(previous) = self.by_mac.remove(&reservation.mac_address) {
            self.by_ip.remove(&previous.ip_address);
        }

        self.by_ip
            .insert(reservation.ip_address, reservation.mac_address);
        self.by_mac.insert(reservation.mac_address, reservation);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &StaticReservation> {
        self.by_mac.values()
    }
}
