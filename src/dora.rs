//! The DHCP message state machine.
//!
//! [`respond`] turns one decoded client message into at most one reply,
//! mutating the pool along the way. It does no I/O and never blocks, so the
//! server calls it with the state lock held and encodes/sends afterwards.
//!
//! REQUEST handling follows the client states of RFC 2131 §4.3.2:
//!
//! | option 54   | option 50 | ciaddr | client state      |
//! |-------------|-----------|--------|-------------------|
//! | other server| any       | any    | SELECTING, ignored|
//! | this server | set       | any    | SELECTING         |
//! | absent      | set       | zero   | INIT-REBOOT       |
//! | any         | any       | set    | RENEWING/REBINDING|

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::DhcpConfig;
use crate::lease::sanitize_hostname;
use crate::mac::MacAddress;
use crate::options::{DhcpOption, MessageType, OptionCode};
use crate::packet::{BOOTREQUEST, BROADCAST_FLAG, DhcpPacket};
use crate::pool::AddressPool;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Where a reply is sent (RFC 2131 §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// `255.255.255.255:68`
    Broadcast,
    /// The client's own address, port 68.
    Unicast(Ipv4Addr),
    /// The relay agent in `giaddr`, port 67.
    Relay(Ipv4Addr),
}

impl Destination {
    fn for_reply(request: &DhcpPacket, message_type: MessageType) -> Self {
        if request.giaddr != Ipv4Addr::UNSPECIFIED {
            Self::Relay(request.giaddr)
        } else if message_type == MessageType::Nak
            || request.is_broadcast()
            || request.ciaddr == Ipv4Addr::UNSPECIFIED
        {
            Self::Broadcast
        } else {
            Self::Unicast(request.ciaddr)
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            Self::Broadcast => SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT),
            Self::Unicast(ip) => SocketAddr::new(IpAddr::V4(*ip), DHCP_CLIENT_PORT),
            Self::Relay(ip) => SocketAddr::new(IpAddr::V4(*ip), DHCP_SERVER_PORT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub packet: DhcpPacket,
    pub destination: Destination,
}

impl Reply {
    fn new(request: &DhcpPacket, message_type: MessageType, packet: DhcpPacket) -> Self {
        Self {
            destination: Destination::for_reply(request, message_type),
            packet,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.packet.message_type()
    }
}

/// Handles one client message. Returns `None` when no reply is due.
pub fn respond(
    request: &DhcpPacket,
    pool: &mut AddressPool,
    config: &DhcpConfig,
    now: DateTime<Utc>,
) -> Option<Reply> {
    if request.op != BOOTREQUEST {
        debug!("Ignoring packet with op {}", request.op);
        return None;
    }

    let Some(message_type) = request.message_type() else {
        debug!("Ignoring packet from {} without a message type", request.mac_address());
        return None;
    };

    let responder = Responder {
        request,
        config,
        mac: request.mac_address(),
        now,
    };

    match message_type {
        MessageType::Discover => responder.discover(pool),
        MessageType::Request => responder.request(pool),
        MessageType::Decline => responder.decline(pool),
        MessageType::Release => responder.release(pool),
        MessageType::Inform => responder.inform(),
        other => {
            debug!("Ignoring {} from {}", other, responder.mac);
            None
        }
    }
}

struct Responder<'a> {
    request: &'a DhcpPacket,
    config: &'a DhcpConfig,
    mac: MacAddress,
    now: DateTime<Utc>,
}

impl Responder<'_> {
    fn discover(&self, pool: &mut AddressPool) -> Option<Reply> {
        let Some(offered_ip) = pool.try_allocate(&self.mac, self.now) else {
            warn!("Pool exhausted, cannot offer an address to {}", self.mac);
            return None;
        };

        let lease_seconds = self.lease_seconds();
        let offer = DhcpPacket::create_reply(
            self.request,
            MessageType::Offer,
            offered_ip,
            self.config.server_identifier,
            self.lease_options(lease_seconds),
        );

        info!("OFFER {} to {}", offered_ip, self.mac);
        Some(Reply::new(self.request, MessageType::Offer, offer))
    }

    fn request(&self, pool: &mut AddressPool) -> Option<Reply> {
        let server_id = self.request.server_identifier();
        if let Some(server_id) = server_id
            && server_id != self.config.server_identifier
        {
            debug!("REQUEST from {} is for server {}", self.mac, server_id);
            pool.release_mac_offer(&self.mac, self.now);
            return None;
        }

        let ciaddr = self.request.ciaddr;
        match (server_id, self.request.requested_ip()) {
            (Some(_), Some(requested_ip)) => self.selecting(pool, requested_ip),
            (None, Some(requested_ip)) if ciaddr == Ipv4Addr::UNSPECIFIED => {
                self.init_reboot(pool, requested_ip)
            }
            _ if ciaddr != Ipv4Addr::UNSPECIFIED => self.renewing(pool, ciaddr),
            _ => {
                debug!("REQUEST from {} carries no address", self.mac);
                None
            }
        }
    }

    fn selecting(&self, pool: &mut AddressPool, requested_ip: Ipv4Addr) -> Option<Reply> {
        let offered = pool.is_bound_to(&self.mac, requested_ip, self.now);
        let reserved = pool.reservations().address_for(&self.mac) == Some(requested_ip);

        if !(offered || reserved) {
            return Some(self.nak("requested address was not offered to this client"));
        }

        self.commit(pool, requested_ip)
    }

    fn init_reboot(&self, pool: &mut AddressPool, requested_ip: Ipv4Addr) -> Option<Reply> {
        let reserved = pool.reservations().address_for(&self.mac);
        let leased = pool
            .lease_for(&self.mac, self.now)
            .map(|entry| entry.ip_address);

        if reserved == Some(requested_ip)
            || (leased == Some(requested_ip) && pool.in_range(requested_ip))
        {
            return self.commit(pool, requested_ip);
        }

        if reserved.is_none() && leased.is_none() && !self.config.authoritative {
            debug!("No record of {}, staying silent", self.mac);
            return None;
        }

        Some(self.nak("requested address is not valid for this client"))
    }

    fn renewing(&self, pool: &mut AddressPool, ciaddr: Ipv4Addr) -> Option<Reply> {
        let reserved = pool.reservations().address_for(&self.mac);
        let leased = pool
            .lease_for(&self.mac, self.now)
            .map(|entry| entry.ip_address);

        if reserved == Some(ciaddr) || leased == Some(ciaddr) {
            return self.commit(pool, ciaddr);
        }

        let unknown = reserved.is_none() && pool.binding_for(&self.mac, self.now).is_none();
        if unknown && pool.is_available_for(ciaddr, &self.mac, self.now) {
            info!("Recovering lease {} for {}", ciaddr, self.mac);
            return self.commit(pool, ciaddr);
        }

        if unknown && !self.config.authoritative {
            debug!("No record of {}, staying silent", self.mac);
            return None;
        }

        Some(self.nak("address is not leased to this client"))
    }

    fn commit(&self, pool: &mut AddressPool, ip: Ipv4Addr) -> Option<Reply> {
        let lease_seconds = self.lease_seconds();
        let hostname = self.request.hostname().as_deref().and_then(sanitize_hostname);

        if !pool.commit(&self.mac, ip, lease_seconds, hostname, self.now) {
            return Some(self.nak("address is in use by another client"));
        }

        let ack = DhcpPacket::create_reply(
            self.request,
            MessageType::Ack,
            ip,
            self.config.server_identifier,
            self.lease_options(lease_seconds),
        );

        info!("ACK {} to {} (lease: {} seconds)", ip, self.mac, lease_seconds);
        Some(Reply::new(self.request, MessageType::Ack, ack))
    }

    fn decline(&self, pool: &mut AddressPool) -> Option<Reply> {
        if self.for_other_server() {
            return None;
        }

        let Some(declined_ip) = self.request.requested_ip() else {
            debug!("DECLINE from {} without a requested address", self.mac);
            return None;
        };

        if pool.decline(&self.mac, declined_ip, self.now) {
            warn!(
                "DECLINE from {} for {} - marked address as unavailable",
                self.mac, declined_ip
            );
        } else {
            warn!(
                "DECLINE from {} for {} rejected - address not associated with this client",
                self.mac, declined_ip
            );
        }

        None
    }

    fn release(&self, pool: &mut AddressPool) -> Option<Reply> {
        if self.for_other_server() {
            return None;
        }

        let ciaddr = self.request.ciaddr;
        if ciaddr == Ipv4Addr::UNSPECIFIED {
            warn!("RELEASE from {} with no ciaddr", self.mac);
            return None;
        }

        if pool.release(&self.mac, ciaddr, self.now) {
            info!("RELEASE from {} for {}", self.mac, ciaddr);
        } else {
            debug!("RELEASE from {} for {} matched no lease", self.mac, ciaddr);
        }

        None
    }

    fn inform(&self) -> Option<Reply> {
        let mut options = vec![DhcpOption::ServerIdentifier(self.config.server_identifier)];
        options.extend(self.common_options());

        let options = filter_by_parameter_request_list(
            options,
            self.request.parameter_request_list(),
        );

        let ack = DhcpPacket::create_reply(
            self.request,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            self.config.server_identifier,
            options,
        );

        info!("INFORM response to {}", self.mac);
        Some(Reply::new(self.request, MessageType::Ack, ack))
    }

    fn nak(&self, reason: &str) -> Reply {
        let mut nak = DhcpPacket::create_reply(
            self.request,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            self.config.server_identifier,
            vec![DhcpOption::ServerIdentifier(self.config.server_identifier)],
        );
        nak.siaddr = Ipv4Addr::UNSPECIFIED;
        if self.request.giaddr != Ipv4Addr::UNSPECIFIED {
            nak.flags |= BROADCAST_FLAG;
        }

        warn!("NAK to {}: {}", self.mac, reason);
        Reply::new(self.request, MessageType::Nak, nak)
    }

    fn for_other_server(&self) -> bool {
        self.request
            .server_identifier()
            .is_some_and(|id| id != self.config.server_identifier)
    }

    fn lease_seconds(&self) -> u32 {
        self.config
            .negotiate_lease_seconds(self.request.requested_lease_time())
    }

    fn common_options(&self) -> Vec<DhcpOption> {
        let mut options = vec![DhcpOption::SubnetMask(self.config.subnet_mask)];

        if let Some(gateway) = self.config.gateway {
            options.push(DhcpOption::Router(vec![gateway]));
        }

        let dns_servers = self.config.dns_servers();
        if !dns_servers.is_empty() {
            options.push(DhcpOption::DnsServer(dns_servers));
        }

        if let Some(ref domain) = self.config.domain_name {
            options.push(DhcpOption::DomainName(domain.clone().into_bytes()));
        }

        options
    }

    fn lease_options(&self, lease_seconds: u32) -> Vec<DhcpOption> {
        let mut options = vec![
            DhcpOption::ServerIdentifier(self.config.server_identifier),
            DhcpOption::LeaseTime(lease_seconds),
        ];
        options.extend(self.common_options());
        options.push(DhcpOption::RenewalTime(
            self.config.renewal_seconds(lease_seconds),
        ));
        options.push(DhcpOption::RebindingTime(
            self.config.rebinding_seconds(lease_seconds),
        ));
        options
    }
}

/// Keeps only what the client asked for in option 55. The message type and
/// server identifier always go out.
fn filter_by_parameter_request_list(
    options: Vec<DhcpOption>,
    parameter_request_list: Option<&[u8]>,
) -> Vec<DhcpOption> {
    let Some(prl) = parameter_request_list else {
        return options;
    };

    options
        .into_iter()
        .filter(|opt| {
            let code = opt.option_code();
            code == OptionCode::MessageType as u8
                || code == OptionCode::ServerIdentifier as u8
                || prl.contains(&code)
        })
        .collect()
}
