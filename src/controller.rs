//! Management operations.
//!
//! [`DhcpController`] is what an admin surface (the CLI here, or an HTTP
//! layer) calls to inspect and change the running server. A change is
//! validated, written to the config file when the controller knows one, and
//! only then applied to the running state. A failed write leaves the server
//! on its previous config.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{DhcpConfig, StaticReservation};
use crate::error::Result;
use crate::lease::LeaseEntry;
use crate::mac::MacAddress;
use crate::pool::PoolStats;
use crate::state::SharedState;

#[derive(Debug, Clone)]
pub struct DhcpController {
    state: SharedState,
    config_path: Option<PathBuf>,
    /// Held across read, save and apply so config changes land one at a
    /// time and in order.
    save_lock: Arc<Mutex<()>>,
}

impl DhcpController {
    pub fn new(state: SharedState, config_path: Option<PathBuf>) -> Self {
        Self {
            state,
            config_path,
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn get_config(&self) -> DhcpConfig {
        self.state.lock().await.config.clone()
    }

    /// Validates, saves and applies `config`. On error the running config is
    /// left untouched.
    pub async fn update_config(&self, config: DhcpConfig) -> Result<()> {
        config.validate()?;

        let _save = self.save_lock.lock().await;
        self.commit(config.clone()).await?;
        info!(
            "Config updated: range {} - {}, lease {} minutes",
            config.range_start, config.range_end, config.lease_time_minutes
        );
        Ok(())
    }

    pub async fn get_leases(&self) -> Vec<LeaseEntry> {
        self.state.lock().await.pool.leases()
    }

    /// Releases whatever `mac` holds. Returns false if it held nothing.
    pub async fn release_lease(&self, mac: &MacAddress) -> bool {
        let released = self.state.lock().await.pool.release_mac(mac, Utc::now());
        if released {
            info!("Released lease for {} by operator", mac);
        }
        released
    }

    /// Adds a reservation, replacing any existing one for the same MAC.
    ///
    /// Returns `Ok(false)` if the address is outside the range or already
    /// reserved for a different MAC.
    pub async fn add_static_reservation(&self, reservation: StaticReservation) -> Result<bool> {
        let _save = self.save_lock.lock().await;

        let mut config = {
            let state = self.state.lock().await;

            if !state.config.in_range(reservation.ip_address) {
                warn!(
                    "Reservation {} for {} is outside the dynamic range",
                    reservation.ip_address, reservation.mac_address
                );
                return Ok(false);
            }

            if state
                .pool
                .reservations()
                .is_reserved_for_other(reservation.ip_address, &reservation.mac_address)
            {
                warn!(
                    "{} is already reserved for another client",
                    reservation.ip_address
                );
                return Ok(false);
            }

            state.config.clone()
        };

        config
            .static_reservations
            .retain(|existing| existing.mac_address != reservation.mac_address);
        let summary = format!("{} for {}", reservation.ip_address, reservation.mac_address);
        config.static_reservations.push(reservation);
        config.validate()?;

        self.commit(config).await?;
        info!("Reserved {}", summary);
        Ok(true)
    }

    /// Removes the reservation for `mac`. Returns `Ok(false)` if there was none.
    pub async fn remove_static_reservation(&self, mac: &MacAddress) -> Result<bool> {
        let _save = self.save_lock.lock().await;

        let mut config = self.get_config().await;
        let before = config.static_reservations.len();
        config
            .static_reservations
            .retain(|existing| existing.mac_address != *mac);
        if config.static_reservations.len() == before {
            return Ok(false);
        }

        self.commit(config).await?;
        info!("Removed reservation for {}", mac);
        Ok(true)
    }

    pub async fn stats(&self) -> PoolStats {
        self.state.lock().await.pool.stats(Utc::now())
    }

    /// Saves `config` and then swaps it in. Callers hold `save_lock`, so the
    /// state cannot change between their read and this write.
    async fn commit(&self, config: DhcpConfig) -> Result<()> {
        if let Some(path) = &self.config_path {
            config.save(path).await?;
        }
        self.state.lock().await.apply_config(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DhcpState;
    use std::net::Ipv4Addr;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn reservation(last: u8, ip: u8) -> StaticReservation {
        StaticReservation {
            mac_address: mac(last),
            ip_address: Ipv4Addr::new(192, 168, 1, ip),
            hostname: Some("nas".to_string()),
            description: Some("storage".to_string()),
        }
    }

    fn controller() -> DhcpController {
        DhcpController::new(DhcpState::shared(DhcpConfig::default()), None)
    }

    #[tokio::test]
    async fn test_update_config_rejects_invalid() {
        let controller = controller();
        let invalid = DhcpConfig {
            range_start: Ipv4Addr::new(192, 168, 1, 200),
            range_end: Ipv4Addr::new(192, 168, 1, 100),
            ..Default::default()
        };

        assert!(controller.update_config(invalid).await.is_err());
        assert_eq!(controller.get_config().await, DhcpConfig::default());
    }

    #[tokio::test]
    async fn test_update_config_applies() {
        let controller = controller();
        let updated = DhcpConfig {
            lease_time_minutes: 30,
            ..Default::default()
        };

        controller.update_config(updated).await.unwrap();
        assert_eq!(controller.get_config().await.lease_time_minutes, 30);
    }

    #[tokio::test]
    async fn test_add_static_reservation() {
        let controller = controller();

        assert!(controller.add_static_reservation(reservation(1, 150)).await.unwrap());
        assert!(!controller.add_static_reservation(reservation(2, 150)).await.unwrap());
        assert!(!controller.add_static_reservation(reservation(3, 10)).await.unwrap());

        assert!(controller.add_static_reservation(reservation(1, 151)).await.unwrap());
        let config = controller.get_config().await;
        assert_eq!(config.static_reservations.len(), 1);
        assert_eq!(
            config.static_reservations[0].ip_address,
            Ipv4Addr::new(192, 168, 1, 151)
        );
        assert_eq!(controller.stats().await.reserved_ips, 1);
    }

    #[tokio::test]
    async fn test_remove_static_reservation() {
        let controller = controller();

        assert!(!controller.remove_static_reservation(&mac(1)).await.unwrap());
        controller.add_static_reservation(reservation(1, 150)).await.unwrap();
        assert!(controller.remove_static_reservation(&mac(1)).await.unwrap());
        assert!(controller.get_config().await.static_reservations.is_empty());
    }

    #[tokio::test]
    async fn test_release_lease() {
        let state = DhcpState::shared(DhcpConfig::default());
        let controller = DhcpController::new(state.clone(), None);

        assert!(!controller.release_lease(&mac(1)).await);
        {
            let mut guard = state.lock().await;
            let ip = guard.pool.try_allocate(&mac(1), Utc::now()).unwrap();
            assert!(guard.pool.commit(&mac(1), ip, 3600, None, Utc::now()));
        }

        assert!(controller.release_lease(&mac(1)).await);
        assert_eq!(controller.stats().await.used_ips, 0);
        assert_eq!(controller.get_leases().await.len(), 1);
    }

    #[tokio::test]
    async fn test_changes_persist_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhcp.json");
        let controller = DhcpController::new(
            DhcpState::shared(DhcpConfig::default()),
            Some(path.clone()),
        );

        controller.add_static_reservation(reservation(1, 150)).await.unwrap();

        let saved = DhcpConfig::load_or_create(&path).await.unwrap();
        assert_eq!(saved.static_reservations, vec![reservation(1, 150)]);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_running_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("dhcp.json");
        let controller = DhcpController::new(
            DhcpState::shared(DhcpConfig::default()),
            Some(path),
        );

        let updated = DhcpConfig {
            lease_time_minutes: 30,
            ..Default::default()
        };
        assert!(matches!(
            controller.update_config(updated).await,
            Err(crate::Error::Io(_))
        ));
        assert_eq!(controller.get_config().await, DhcpConfig::default());

        assert!(controller.add_static_reservation(reservation(1, 150)).await.is_err());
        assert!(controller.get_config().await.static_reservations.is_empty());
        assert_eq!(controller.stats().await.reserved_ips, 0);
    }
}
