//! DHCP client for the hardware socket layer
//!
//! The controller has no DHCP of its own, so the exchange runs over a
//! borrowed UDP slot bound to port 68:
//! 1. DISCOVER - Broadcast to find DHCP servers
//! 2. OFFER - Receive an address offer
//! 3. REQUEST - Request the offered address
//! 4. ACK - Receive acknowledgment and configuration
//!
//! Messages are encoded and decoded with smoltcp's DHCPv4 wire types. The
//! engine is driven from the address state machine: `tick` once per second,
//! `run` on every step.

use alloc::vec;
use smoltcp::wire::{DhcpMessageType, DhcpPacket, DhcpRepr, EthernetAddress, Ipv4Address};

use crate::bus::Transaction;
use crate::drivers::{SocketFlags, SocketMode};
use crate::error::NetError;
use crate::slots::SocketSlot;

/// UDP port the client listens on
pub const DHCP_CLIENT_PORT: u16 = 68;
/// UDP port servers listen on
pub const DHCP_SERVER_PORT: u16 = 67;
/// Receive buffer size; large enough for any reply a server sends to a
/// client that announces this maximum message size
pub const DHCP_BUFFER_SIZE: usize = 548;
/// Seconds between retransmissions of an unanswered message
pub const RETRANSMIT_TICKS: u32 = 4;
/// Retransmissions before discovery starts over
pub const MAX_RETRIES: u32 = 3;

/// Subnet mask, router, DNS server, lease time
const PARAMETER_REQUEST_LIST: [u8; 4] = [1, 3, 6, 51];

/// IP configuration obtained from a DHCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub ip: Ipv4Address,
    pub subnet_mask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub dns: Ipv4Address,
    /// Server that granted the lease
    pub server: Ipv4Address,
    /// Lease duration in seconds, if the server sent one
    pub lease_secs: Option<u32>,
}

/// Result of one engine step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpRun {
    /// Negotiation in progress
    Running,
    /// A lease was just acknowledged
    Assigned(Lease),
}

/// Address negotiation engine driven by the address state machine
pub trait DhcpEngine: Send {
    /// Bind the engine to `slot` and start negotiating from scratch
    ///
    /// # Arguments
    /// * `tx` - Open bus transaction
    /// * `slot` - Slot claimed for the exchange; the engine opens it
    /// * `mac` - Hardware address of the interface
    fn start(&mut self, tx: &mut Transaction<'_>, slot: SocketSlot, mac: [u8; 6])
        -> Result<(), NetError>;

    /// Advance the one-second timer
    fn tick(&mut self);

    /// Service the slot: process replies and (re)transmit
    fn run(&mut self, tx: &mut Transaction<'_>) -> DhcpRun;

    /// Stop negotiating and close the slot; the caller releases it
    fn stop(&mut self, tx: &mut Transaction<'_>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Selecting,
    Requesting { offered: Ipv4Address, server: Ipv4Address },
    Bound,
}

/// Built-in DISCOVER/OFFER/REQUEST/ACK client
pub struct DhcpClient {
    slot: Option<SocketSlot>,
    mac: [u8; 6],
    phase: Phase,
    xid: u32,
    sequence: u32,
    ticks_since_send: u32,
    retries: u32,
}

impl Default for DhcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DhcpClient {
    pub fn new() -> Self {
        Self {
            slot: None,
            mac: [0; 6],
            phase: Phase::Init,
            xid: 0,
            sequence: 0,
            ticks_since_send: 0,
            retries: 0,
        }
    }

    fn next_xid(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        let base = u32::from_be_bytes([self.mac[2], self.mac[3], self.mac[4], self.mac[5]]);
        base ^ self.sequence.wrapping_mul(0x9E37_79B9)
    }

    fn restart(&mut self) {
        self.phase = Phase::Init;
        self.retries = 0;
        self.ticks_since_send = 0;
    }

    fn message(&self, message_type: DhcpMessageType) -> DhcpRepr<'static> {
        let hardware = EthernetAddress(self.mac);
        DhcpRepr {
            message_type,
            transaction_id: self.xid,
            secs: 0,
            client_hardware_address: hardware,
            client_ip: Ipv4Address::UNSPECIFIED,
            your_ip: Ipv4Address::UNSPECIFIED,
            server_ip: Ipv4Address::UNSPECIFIED,
            router: None,
            subnet_mask: None,
            relay_agent_ip: Ipv4Address::UNSPECIFIED,
            broadcast: true,
            requested_ip: None,
            client_identifier: Some(hardware),
            server_identifier: None,
            parameter_request_list: Some(&PARAMETER_REQUEST_LIST),
            dns_servers: None,
            max_size: Some(DHCP_BUFFER_SIZE as u16),
            lease_duration: None,
            renew_duration: None,
            rebind_duration: None,
            additional_options: &[],
        }
    }

    fn transmit(&mut self, tx: &mut Transaction<'_>, slot: SocketSlot, repr: &DhcpRepr<'_>) {
        let mut buffer = vec![0u8; repr.buffer_len()];
        let mut packet = DhcpPacket::new_unchecked(&mut buffer[..]);
        if let Err(e) = repr.emit(&mut packet) {
            log::error!("DHCP encode failed: {}", e);
            return;
        }

        let result = tx.chip().send_to(
            slot,
            &buffer,
            Ipv4Address::BROADCAST,
            DHCP_SERVER_PORT,
        );
        match result {
            Ok(_) => log::trace!("DHCP {:?} sent, xid {:#010x}", repr.message_type, self.xid),
            Err(e) => log::trace!("DHCP {:?} not sent: {}", repr.message_type, e),
        }
        self.ticks_since_send = 0;
    }

    fn send_discover(&mut self, tx: &mut Transaction<'_>, slot: SocketSlot) {
        self.xid = self.next_xid();
        let repr = self.message(DhcpMessageType::Discover);
        self.transmit(tx, slot, &repr);
        self.phase = Phase::Selecting;
    }

    fn send_request(
        &mut self,
        tx: &mut Transaction<'_>,
        slot: SocketSlot,
        offered: Ipv4Address,
        server: Ipv4Address,
    ) {
        let mut repr = self.message(DhcpMessageType::Request);
        repr.requested_ip = Some(offered);
        repr.server_identifier = Some(server);
        self.transmit(tx, slot, &repr);
        self.phase = Phase::Requesting { offered, server };
    }

    /// Handle one received datagram
    fn receive(&mut self, tx: &mut Transaction<'_>, slot: SocketSlot, data: &[u8]) -> DhcpRun {
        let packet = match DhcpPacket::new_checked(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::trace!("DHCP packet dropped: {}", e);
                return DhcpRun::Running;
            }
        };
        let repr = match DhcpRepr::parse(&packet) {
            Ok(repr) => repr,
            Err(e) => {
                log::trace!("DHCP packet dropped: {}", e);
                return DhcpRun::Running;
            }
        };

        if repr.transaction_id != self.xid || repr.client_hardware_address.0 != self.mac {
            return DhcpRun::Running;
        }

        match (self.phase, repr.message_type) {
            (Phase::Selecting, DhcpMessageType::Offer) => {
                let Some(server) = repr.server_identifier else {
                    log::trace!("DHCP offer without server identifier ignored");
                    return DhcpRun::Running;
                };
                log::trace!("DHCP offer {} from {}", repr.your_ip, server);
                self.retries = 0;
                self.send_request(tx, slot, repr.your_ip, server);
                DhcpRun::Running
            }
            (Phase::Requesting { offered, server }, DhcpMessageType::Ack) => {
                let dns = repr
                    .dns_servers
                    .as_ref()
                    .and_then(|servers| servers.first().copied())
                    .unwrap_or(Ipv4Address::UNSPECIFIED);
                let ip = if repr.your_ip.is_unspecified() {
                    offered
                } else {
                    repr.your_ip
                };
                let lease = Lease {
                    ip,
                    subnet_mask: repr.subnet_mask.unwrap_or(Ipv4Address::UNSPECIFIED),
                    gateway: repr.router.unwrap_or(Ipv4Address::UNSPECIFIED),
                    dns,
                    server: repr.server_identifier.unwrap_or(server),
                    lease_secs: repr.lease_duration,
                };
                log::trace!("DHCP lease {} from {}", lease.ip, lease.server);
                self.phase = Phase::Bound;
                DhcpRun::Assigned(lease)
            }
            (Phase::Requesting { .. }, DhcpMessageType::Nak) => {
                log::trace!("DHCP NAK, restarting discovery");
                self.restart();
                DhcpRun::Running
            }
            _ => DhcpRun::Running,
        }
    }
}

impl DhcpEngine for DhcpClient {
    fn start(
        &mut self,
        tx: &mut Transaction<'_>,
        slot: SocketSlot,
        mac: [u8; 6],
    ) -> Result<(), NetError> {
        tx.chip()
            .open(slot, SocketMode::Udp, DHCP_CLIENT_PORT, SocketFlags::empty())
            .map_err(NetError::SocketOpen)?;
        self.slot = Some(slot);
        self.mac = mac;
        self.restart();
        log::trace!("DHCP started on {}", slot);
        Ok(())
    }

    fn tick(&mut self) {
        self.ticks_since_send = self.ticks_since_send.saturating_add(1);
    }

    fn run(&mut self, tx: &mut Transaction<'_>) -> DhcpRun {
        let Some(slot) = self.slot else {
            return DhcpRun::Running;
        };

        let mut buffer = [0u8; DHCP_BUFFER_SIZE];
        while tx.chip().rx_size(slot) > 0 {
            let len = match tx.chip().recv_from(slot, &mut buffer) {
                Ok((len, _, _)) => len,
                Err(_) => break,
            };
            if let DhcpRun::Assigned(lease) = self.receive(tx, slot, &buffer[..len]) {
                return DhcpRun::Assigned(lease);
            }
        }

        match self.phase {
            Phase::Init => self.send_discover(tx, slot),
            Phase::Selecting | Phase::Requesting { .. }
                if self.ticks_since_send >= RETRANSMIT_TICKS =>
            {
                self.retries += 1;
                if self.retries > MAX_RETRIES {
                    log::trace!("DHCP no reply after {} retries, restarting", MAX_RETRIES);
                    self.restart();
                    self.send_discover(tx, slot);
                } else if let Phase::Requesting { offered, server } = self.phase {
                    self.send_request(tx, slot, offered, server);
                } else {
                    let repr = self.message(DhcpMessageType::Discover);
                    self.transmit(tx, slot, &repr);
                }
            }
            _ => {}
        }

        DhcpRun::Running
    }

    fn stop(&mut self, tx: &mut Transaction<'_>) {
        if let Some(slot) = self.slot.take() {
            if let Err(e) = tx.chip().close(slot) {
                log::trace!("DHCP close failed: {}", e);
            }
        }
        self.restart();
    }
}
