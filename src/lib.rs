//! # leasekeeper
//!
//! The DHCPv4 engine of a home network gateway, implementing RFC 2131 (DHCP)
//! and the RFC 2132 options a home LAN needs.
//!
//! ## Features
//!
//! - DISCOVER, OFFER, REQUEST, ACK, NAK, RELEASE, DECLINE, INFORM
//! - Static MAC-to-IP reservations that always win over dynamic allocation
//! - Offer holds, decline cooldowns and a periodic lease sweeper
//! - Relay agent replies via `giaddr`
//! - Rate limiting per client
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use leasekeeper::{DhcpConfig, DhcpServer, DhcpState};
//!
//! #[tokio::main]
//! async fn main() -> leasekeeper::Result<()> {
//!     let config = DhcpConfig::load_or_create("dhcp.json").await?;
//!     let state = DhcpState::shared(config);
//!     let server = DhcpServer::new(Arc::clone(&state)).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`DhcpPacket`] - wire codec, with [`DhcpOption`] for RFC 2132 options
//! - [`AddressPool`] - the lease table and allocator
//! - [`dora::respond`] - the per-message state machine
//! - [`DhcpState`] - config and pool behind the single lock
//! - [`DhcpServer`] - UDP listener on port 67
//! - [`LeaseSweeper`] - background expiry
//! - [`DhcpController`] - management operations

pub mod config;
pub mod controller;
pub mod dora;
pub mod error;
pub mod lease;
pub mod mac;
pub mod options;
pub mod packet;
pub mod pool;
pub mod reservation;
pub mod server;
pub mod state;
pub mod sweeper;

pub use config::{DhcpConfig, StaticReservation};
pub use controller::DhcpController;
pub use dora::{Destination, Reply};
pub use error::{DecodeError, EncodeError, Error, Result};
pub use lease::{LeaseEntry, LeaseState};
pub use mac::MacAddress;
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use pool::{AddressPool, PoolStats};
pub use reservation::Reservations;
pub use server::DhcpServer;
pub use state::{DhcpState, SharedState};
pub use sweeper::LeaseSweeper;
