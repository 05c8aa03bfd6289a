//! Periodic lease expiry.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::state::SharedState;

pub struct LeaseSweeper {
    state: SharedState,
    interval: Duration,
}

impl LeaseSweeper {
    pub fn new(state: SharedState, interval: Duration) -> Self {
        Self { state, interval }
    }

    /// Runs one pass and returns how many entries expired.
    pub async fn sweep_once(&self) -> usize {
        let expired = self.state.lock().await.pool.sweep(Utc::now());
        if expired > 0 {
            info!("Expired {} lease entries", expired);
        }
        expired
    }

    /// Sweeps every interval until `shutdown` flips to true. A pass in
    /// progress always finishes first.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Lease sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhcpConfig;
    use crate::lease::LeaseState;
    use crate::mac::MacAddress;
    use crate::state::DhcpState;
    use chrono::TimeDelta;

    #[tokio::test]
    async fn test_sweep_once_expires_stale_entries() {
        let state = DhcpState::shared(DhcpConfig::default());
        let mac = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);

        let ip = {
            let mut guard = state.lock().await;
            let past = Utc::now() - TimeDelta::seconds(7200);
            let ip = guard.pool.try_allocate(&mac, past).unwrap();
            assert!(guard.pool.commit(&mac, ip, 3600, None, past));
            ip
        };

        let sweeper = LeaseSweeper::new(state.clone(), Duration::from_secs(30));
        assert_eq!(sweeper.sweep_once().await, 1);
        assert_eq!(sweeper.sweep_once().await, 0);

        let guard = state.lock().await;
        assert_eq!(guard.pool.entry(ip).unwrap().state, LeaseState::Expired);
    }

    #[tokio::test]
    async fn test_spawned_sweeper_stops_on_shutdown() {
        let state = DhcpState::shared(DhcpConfig::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = LeaseSweeper::new(state, Duration::from_millis(10)).spawn(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(30)).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
