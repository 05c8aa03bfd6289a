//! The UDP listener.
//!
//! One socket on port 67 feeds a bounded set of worker tasks. Each worker
//! decodes its datagram, takes the state lock only for [`DhcpState::respond`],
//! then encodes and sends the reply with the lock released.
//!
//! [`DhcpState::respond`]: crate::state::DhcpState::respond

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::dora::DHCP_SERVER_PORT;
use crate::error::{Error, Result};
use crate::mac::MacAddress;
use crate::packet::{BOOTREQUEST, DhcpPacket};
use crate::state::SharedState;

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);
const RATE_LIMIT_MAX_REQUESTS: usize = 10;
const RATE_LIMIT_CLEANUP_THRESHOLD: usize = 1000;
const RECV_BUFFER_SIZE: usize = 1500;

/// Per-MAC sliding window limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    clients: Mutex<HashMap<MacAddress, Vec<Instant>>>,
}

impl RateLimiter {
    /// Records a packet from `mac` and returns true if it is over the limit.
    pub async fn is_rate_limited(&self, mac: MacAddress) -> bool {
        self.record(mac, Instant::now()).await
    }

    async fn record(&self, mac: MacAddress, now: Instant) -> bool {
        let mut clients = self.clients.lock().await;

        if clients.len() > RATE_LIMIT_CLEANUP_THRESHOLD {
            clients.retain(|_, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < RATE_LIMIT_WINDOW);
                !timestamps.is_empty()
            });
        }

        let timestamps = clients.entry(mac).or_default();
        timestamps.retain(|t| now.duration_since(*t) < RATE_LIMIT_WINDOW);

        if timestamps.len() >= RATE_LIMIT_MAX_REQUESTS {
            return true;
        }

        timestamps.push(now);
        false
    }
}

/// Decodes one datagram, runs it through the state machine and encodes the
/// reply. Returns the bytes to send and where to send them.
///
/// Malformed datagrams are logged at debug level and dropped.
pub async fn process_datagram(
    state: &SharedState,
    data: &[u8],
    source: SocketAddr,
) -> Option<(Vec<u8>, SocketAddr)> {
    let packet = match DhcpPacket::decode(data) {
        Ok(packet) => packet,
        Err(error) => {
            debug!("Dropping malformed packet from {}: {}", source, error);
            return None;
        }
    };

    let reply = {
        let mut state = state.lock().await;
        state.respond(&packet, Utc::now())
    }?;

    match reply.packet.encode() {
        Ok(bytes) => Some((bytes, reply.destination.socket_addr())),
        Err(error) => {
            warn!("Could not encode reply to {}: {}", reply.packet.mac_address(), error);
            None
        }
    }
}

pub struct DhcpServer {
    state: SharedState,
    socket: Arc<UdpSocket>,
    rate_limiter: Arc<RateLimiter>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    shutdown: watch::Sender<bool>,
}

impl DhcpServer {
    /// Binds `0.0.0.0:67` and prepares a server over `state`.
    pub async fn new(state: SharedState) -> Result<Self> {
        let socket = Self::create_socket()?;

        let max_workers = {
            let state = state.lock().await;
            info!(
                "DHCP server starting on {}:{}",
                state.config.server_identifier, DHCP_SERVER_PORT
            );
            info!(
                "Address range: {} - {} ({} addresses)",
                state.config.range_start,
                state.config.range_end,
                state.config.range_size()
            );
            state.config.max_concurrent_packets
        };

        Ok(Self::from_socket(state, socket, max_workers))
    }

    /// Builds a server around an already bound socket.
    pub fn from_socket(state: SharedState, socket: UdpSocket, max_workers: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state,
            socket: Arc::new(socket),
            rate_limiter: Arc::new(RateLimiter::default()),
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            shutdown,
        }
    }

    fn create_socket() -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(tokio_socket)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// A receiver that flips to true when [`shutdown`](Self::shutdown) is
    /// called, for tasks that should stop with the server.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Receives until shutdown, then waits for in-flight workers to finish.
    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        let mut shutdown = self.shutdown.subscribe();

        info!("DHCP server ready and listening");

        while !*shutdown.borrow_and_update() {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => match result {
                    Ok((size, source)) => {
                        let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                            break;
                        };

                        let data = buffer[..size].to_vec();
                        let handler = PacketHandler {
                            state: Arc::clone(&self.state),
                            socket: Arc::clone(&self.socket),
                            rate_limiter: Arc::clone(&self.rate_limiter),
                        };

                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(error) = handler.handle_packet(&data, source).await {
                                warn!("Error handling packet from {}: {}", source, error);
                            }
                        });
                    }
                    Err(error) => {
                        error!("Error receiving packet: {}", error);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("DHCP server shutting down");
                        break;
                    }
                }
            }
        }

        let permits = u32::try_from(self.max_workers).unwrap_or(u32::MAX);
        if self.workers.acquire_many(permits).await.is_err() {
            warn!("Worker pool closed before in-flight packets drained");
        }

        Ok(())
    }
}

struct PacketHandler {
    state: SharedState,
    socket: Arc<UdpSocket>,
    rate_limiter: Arc<RateLimiter>,
}

impl PacketHandler {
    async fn handle_packet(&self, data: &[u8], source: SocketAddr) -> Result<()> {
        if let Some(mac) = peek_client_mac(data)
            && self.rate_limiter.is_rate_limited(mac).await
        {
            warn!("Rate limited: {} from {}", mac, source);
            return Ok(());
        }

        let Some((reply, destination)) = process_datagram(&self.state, data, source).await else {
            return Ok(());
        };

        self.socket.send_to(&reply, destination).await?;
        Ok(())
    }
}

/// Reads the client MAC straight out of a BOOTREQUEST header so floods are
/// cut off before the full decode.
fn peek_client_mac(data: &[u8]) -> Option<MacAddress> {
    let header = data.get(..34)?;
    if header[0] != BOOTREQUEST {
        return None;
    }
    let chaddr: [u8; 6] = header[28..34].try_into().ok()?;
    Some(MacAddress::new(chaddr))
}
