//! The shared server state.
//!
//! Config and pool live behind one async mutex. The packet workers, the
//! sweeper and the management controller all go through the same
//! [`SharedState`], and nothing awaits I/O while holding it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::DhcpConfig;
use crate::dora::{self, Reply};
use crate::packet::DhcpPacket;
use crate::pool::AddressPool;

pub type SharedState = Arc<Mutex<DhcpState>>;

#[derive(Debug)]
pub struct DhcpState {
    pub config: DhcpConfig,
    pub pool: AddressPool,
}

impl DhcpState {
    pub fn new(config: DhcpConfig) -> Self {
        let pool = AddressPool::new(&config);
        Self { config, pool }
    }

    pub fn shared(config: DhcpConfig) -> SharedState {
        Arc::new(Mutex::new(Self::new(config)))
    }

    /// Swaps in an already validated config and reconfigures the pool.
    pub fn apply_config(&mut self, config: DhcpConfig) {
        self.pool.reconfigure(&config);
        self.config = config;
    }

    pub fn respond(&mut self, request: &DhcpPacket, now: DateTime<Utc>) -> Option<Reply> {
        dora::respond(request, &mut self.pool, &self.config, now)
    }
}
