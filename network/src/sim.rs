// Simulated controller for tests
//
// SimChip implements the driver trait over an in-memory model of the eight
// hardware sockets. A SimHandle shares that model so tests can script the
// network side: the PHY link, remote TCP peers, incoming connections,
// datagrams, and tiny DHCP and DNS servers. SimClock is a virtual clock;
// sleeping advances it instantly.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use isonet_config::{EthernetConfig, HardwareConfig};
use smoltcp::wire::{DhcpMessageType, DhcpPacket, DhcpRepr, Ipv4Address};
use spin::Mutex;

use crate::clock::Clock;
use crate::dhcp::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use crate::dns::{decode_domain_name, DnsHeader, DNS_PORT};
use crate::drivers::{
    ChipDriver, ChipError, NetInfo, SocketFlags, SocketMode, SocketStatus, NUM_SOCKETS,
};
use crate::interface::NetworkInterface;
use crate::slots::SocketSlot;

pub(crate) const SIM_MAC: [u8; 6] = [0x02, 0x08, 0xDC, 0x00, 0x00, 0x01];
const TX_CAPACITY: usize = 2048;
/// Bytes the simulated chip transmits between two register reads
const TX_DRAIN: usize = 512;
/// Status reads before a connect attempt resolves
const CONNECT_POLLS: u8 = 2;

type Endpoint = (Ipv4Address, u16);

struct SimSocket {
    status: SocketStatus,
    mode: SocketMode,
    port: u16,
    flags: SocketFlags,
    destination: Endpoint,
    peer: Option<Endpoint>,
    connecting: Option<(Endpoint, u8)>,
    rx: VecDeque<u8>,
    datagrams: VecDeque<(Endpoint, Vec<u8>)>,
    tx_pending: usize,
}

impl SimSocket {
    fn new() -> Self {
        Self {
            status: SocketStatus::Closed,
            mode: SocketMode::Udp,
            port: 0,
            flags: SocketFlags::empty(),
            destination: (Ipv4Address::UNSPECIFIED, 0),
            peer: None,
            connecting: None,
            rx: VecDeque::new(),
            datagrams: VecDeque::new(),
            tx_pending: 0,
        }
    }

    fn is_stream_open(&self) -> bool {
        matches!(
            self.status,
            SocketStatus::Established | SocketStatus::CloseWait
        )
    }
}

struct TcpPeer {
    endpoint: Endpoint,
    greeting: Vec<u8>,
    echo: bool,
    socket: Option<usize>,
    received: Vec<u8>,
    closed_locally: bool,
}

struct DhcpServer {
    offer: Ipv4Address,
    server: Ipv4Address,
}

struct SimState {
    fail_init: bool,
    link: bool,
    net_info: Option<NetInfo>,
    sockets: Vec<SimSocket>,
    peers: Vec<TcpPeer>,
    dhcp: Option<DhcpServer>,
    dhcp_nak: bool,
    dhcp_discovers: usize,
    dhcp_requests: usize,
    dns_records: Vec<(Ipv4Address, String, Ipv4Address)>,
    udp_sent: Vec<(Endpoint, Vec<u8>)>,
    send_busy: u32,
    send_failure: Option<ChipError>,
}

impl SimState {
    fn local_ip(&self) -> Ipv4Address {
        self.net_info
            .map_or(Ipv4Address::UNSPECIFIED, |info| info.ip)
    }

    fn peer_mut(&mut self, endpoint: Endpoint) -> Option<&mut TcpPeer> {
        self.peers.iter_mut().find(|peer| peer.endpoint == endpoint)
    }

    fn drop_connection(&mut self, index: usize) {
        for peer in self.peers.iter_mut() {
            if peer.socket == Some(index) {
                peer.socket = None;
                peer.closed_locally = true;
            }
        }
    }

    fn deliver(&mut self, to: Endpoint, from: Endpoint, data: &[u8]) {
        let multicast = to.0.is_multicast();
        for socket in self.sockets.iter_mut() {
            if socket.status != SocketStatus::UdpBound || socket.port != to.1 {
                continue;
            }
            let member = socket.flags.contains(SocketFlags::MULTICAST);
            let accepts = if multicast {
                member && socket.destination.0 == to.0
            } else {
                !member
            };
            if accepts {
                socket.datagrams.push_back((from, data.to_vec()));
            }
        }
    }

    fn connect_resolved(&mut self, index: usize, target: Endpoint) {
        let greeting = match self.peer_mut(target) {
            Some(peer) => {
                peer.socket = Some(index);
                peer.closed_locally = false;
                Some(peer.greeting.clone())
            }
            None => None,
        };

        let socket = &mut self.sockets[index];
        socket.connecting = None;
        match greeting {
            Some(greeting) => {
                socket.status = SocketStatus::Established;
                socket.peer = Some(target);
                socket.rx.extend(greeting);
            }
            None => socket.status = SocketStatus::Closed,
        }
    }

    fn dhcp_reply(&mut self, index: usize, data: &[u8]) {
        let Ok(packet) = DhcpPacket::new_checked(data) else {
            return;
        };
        let Ok(request) = DhcpRepr::parse(&packet) else {
            return;
        };

        let message_type = match request.message_type {
            DhcpMessageType::Discover => {
                self.dhcp_discovers += 1;
                DhcpMessageType::Offer
            }
            DhcpMessageType::Request => {
                self.dhcp_requests += 1;
                if self.dhcp_nak {
                    DhcpMessageType::Nak
                } else {
                    DhcpMessageType::Ack
                }
            }
            _ => return,
        };
        let Some(server) = self.dhcp.as_ref() else {
            return;
        };

        let mut dns_servers = heapless::Vec::new();
        let _ = dns_servers.push(server.server);
        let your_ip = if message_type == DhcpMessageType::Nak {
            Ipv4Address::UNSPECIFIED
        } else {
            server.offer
        };
        let reply = DhcpRepr {
            message_type,
            transaction_id: request.transaction_id,
            secs: 0,
            client_hardware_address: request.client_hardware_address,
            client_ip: Ipv4Address::UNSPECIFIED,
            your_ip,
            server_ip: server.server,
            router: Some(server.server),
            subnet_mask: Some(Ipv4Address::new(255, 255, 255, 0)),
            relay_agent_ip: Ipv4Address::UNSPECIFIED,
            broadcast: false,
            requested_ip: None,
            client_identifier: None,
            server_identifier: Some(server.server),
            parameter_request_list: None,
            dns_servers: Some(dns_servers),
            max_size: None,
            lease_duration: Some(3600),
            renew_duration: None,
            rebind_duration: None,
            additional_options: &[],
        };
        let from = (server.server, DHCP_SERVER_PORT);

        let mut buffer = vec![0u8; reply.buffer_len()];
        if reply
            .emit(&mut DhcpPacket::new_unchecked(&mut buffer[..]))
            .is_ok()
        {
            self.sockets[index].datagrams.push_back((from, buffer));
        }
    }

    fn dns_reply(&mut self, index: usize, server: Ipv4Address, query: &[u8]) {
        let Ok(header) = DnsHeader::from_bytes(query) else {
            return;
        };
        let Ok((name, end)) = decode_domain_name(query, DnsHeader::LEN) else {
            return;
        };
        let question_end = (end + 4).min(query.len());

        let answer = self
            .dns_records
            .iter()
            .find(|(at, record, _)| *at == server && *record == name)
            .map(|(_, _, ip)| *ip);

        let response = DnsHeader {
            id: header.id,
            flags: if answer.is_some() { 0x8180 } else { 0x8183 },
            qdcount: 1,
            ancount: u16::from(answer.is_some()),
            nscount: 0,
            arcount: 0,
        };
        let mut reply = response.to_bytes().to_vec();
        reply.extend_from_slice(&query[DnsHeader::LEN..question_end]);
        if let Some(ip) = answer {
            // Pointer to the question name, A, IN, TTL 3600, 4 bytes
            reply.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0x0E, 0x10, 0, 4]);
            reply.extend_from_slice(&ip.0);
        }
        self.sockets[index]
            .datagrams
            .push_back(((server, DNS_PORT), reply));
    }

    fn has_dns_server(&self, ip: Ipv4Address) -> bool {
        self.dns_records.iter().any(|(server, _, _)| *server == ip)
    }
}

/// Simulated controller
pub(crate) struct SimChip {
    state: Arc<Mutex<SimState>>,
}

/// Test-side view of a [`SimChip`]
#[derive(Clone)]
pub(crate) struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimChip {
    pub(crate) fn new() -> Self {
        let sockets = (0..NUM_SOCKETS).map(|_| SimSocket::new()).collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                fail_init: false,
                link: false,
                net_info: None,
                sockets,
                peers: Vec::new(),
                dhcp: None,
                dhcp_nak: false,
                dhcp_discovers: 0,
                dhcp_requests: 0,
                dns_records: Vec::new(),
                udp_sent: Vec::new(),
                send_busy: 0,
                send_failure: None,
            })),
        }
    }

    pub(crate) fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
        }
    }
}

impl SimHandle {
    pub(crate) fn fail_init(&self, fail: bool) {
        self.state.lock().fail_init = fail;
    }

    pub(crate) fn set_link(&self, up: bool) {
        self.state.lock().link = up;
    }

    pub(crate) fn net_info(&self) -> Option<NetInfo> {
        self.state.lock().net_info
    }

    pub(crate) fn force_status(&self, index: usize, status: SocketStatus) {
        self.state.lock().sockets[index].status = status;
    }

    pub(crate) fn enable_dhcp_server(&self, offer: Ipv4Address, server: Ipv4Address) {
        self.state.lock().dhcp = Some(DhcpServer { offer, server });
    }

    /// Answer every REQUEST with a NAK
    pub(crate) fn set_dhcp_nak(&self, nak: bool) {
        self.state.lock().dhcp_nak = nak;
    }

    pub(crate) fn dhcp_discovers(&self) -> usize {
        self.state.lock().dhcp_discovers
    }

    pub(crate) fn dhcp_requests(&self) -> usize {
        self.state.lock().dhcp_requests
    }

    /// Serve an A record for `name` from the DNS server at `server`
    pub(crate) fn add_dns_record(&self, server: Ipv4Address, name: &str, ip: Ipv4Address) {
        self.state
            .lock()
            .dns_records
            .push((server, name.to_string(), ip));
    }

    /// Accept connections to `ip:port` and send `greeting` once connected
    pub(crate) fn add_tcp_peer(&self, ip: Ipv4Address, port: u16, greeting: &[u8]) {
        self.add_peer((ip, port), greeting, false);
    }

    /// Accept connections to `ip:port` and echo everything back
    pub(crate) fn add_echo_peer(&self, ip: Ipv4Address, port: u16) {
        self.add_peer((ip, port), &[], true);
    }

    fn add_peer(&self, endpoint: Endpoint, greeting: &[u8], echo: bool) {
        self.state.lock().peers.push(TcpPeer {
            endpoint,
            greeting: greeting.to_vec(),
            echo,
            socket: None,
            received: Vec::new(),
            closed_locally: false,
        });
    }

    /// A remote peer connects to the socket listening on `local_port`
    pub(crate) fn incoming_connection(
        &self,
        local_port: u16,
        ip: Ipv4Address,
        port: u16,
        data: &[u8],
    ) {
        let mut state = self.state.lock();
        let index = state
            .sockets
            .iter()
            .position(|socket| {
                socket.mode == SocketMode::Tcp
                    && socket.status == SocketStatus::Listening
                    && socket.port == local_port
            })
            .expect("no socket listening on port");

        let socket = &mut state.sockets[index];
        socket.status = SocketStatus::Established;
        socket.peer = Some((ip, port));
        socket.rx.extend(data.iter().copied());

        state.peers.push(TcpPeer {
            endpoint: (ip, port),
            greeting: Vec::new(),
            echo: false,
            socket: Some(index),
            received: Vec::new(),
            closed_locally: false,
        });
    }

    /// The remote side closes its connection
    pub(crate) fn close_tcp_peer(&self, ip: Ipv4Address, port: u16) {
        let mut state = self.state.lock();
        let Some(index) = state.peer_mut((ip, port)).and_then(|peer| peer.socket) else {
            return;
        };
        let socket = &mut state.sockets[index];
        if socket.status == SocketStatus::Established {
            socket.status = SocketStatus::CloseWait;
        }
    }

    /// True once the local side closed its connection to `ip:port`
    pub(crate) fn tcp_peer_closed(&self, ip: Ipv4Address, port: u16) -> bool {
        self.state
            .lock()
            .peer_mut((ip, port))
            .is_some_and(|peer| peer.closed_locally)
    }

    /// Everything `ip:port` has received so far
    pub(crate) fn tcp_peer_received(&self, ip: Ipv4Address, port: u16) -> Vec<u8> {
        self.state
            .lock()
            .peer_mut((ip, port))
            .map(|peer| peer.received.clone())
            .unwrap_or_default()
    }

    /// Make the next `count` stream sends report busy
    pub(crate) fn set_send_busy(&self, count: u32) {
        self.state.lock().send_busy = count;
    }

    /// Fail the next stream send with `error`
    pub(crate) fn fail_next_send(&self, error: ChipError) {
        self.state.lock().send_failure = Some(error);
    }

    /// Deliver a datagram from the network
    pub(crate) fn inject_datagram(
        &self,
        ip: Ipv4Address,
        port: u16,
        from: Endpoint,
        data: &[u8],
    ) {
        self.state.lock().deliver((ip, port), from, data);
    }

    /// Datagrams sent to the network, with their destination
    pub(crate) fn udp_sent(&self) -> Vec<(Endpoint, Vec<u8>)> {
        self.state.lock().udp_sent.clone()
    }
}

impl ChipDriver for SimChip {
    fn init(&mut self, _hardware: &HardwareConfig) -> Result<(), ChipError> {
        let mut state = self.state.lock();
        if state.fail_init {
            return Err(ChipError::NotResponding);
        }
        for socket in state.sockets.iter_mut() {
            *socket = SimSocket::new();
        }
        Ok(())
    }

    fn mac_address(&self) -> [u8; 6] {
        SIM_MAC
    }

    fn phy_link(&mut self) -> bool {
        self.state.lock().link
    }

    fn set_net_info(&mut self, info: &NetInfo) {
        self.state.lock().net_info = Some(*info);
    }

    fn status(&mut self, slot: SocketSlot) -> SocketStatus {
        let mut state = self.state.lock();
        let index = slot.index();
        if let Some((target, polls)) = state.sockets[index].connecting {
            if polls + 1 >= CONNECT_POLLS {
                state.connect_resolved(index, target);
            } else {
                state.sockets[index].connecting = Some((target, polls + 1));
            }
        }
        state.sockets[index].status
    }

    fn open(
        &mut self,
        slot: SocketSlot,
        mode: SocketMode,
        port: u16,
        flags: SocketFlags,
    ) -> Result<(), ChipError> {
        let mut state = self.state.lock();
        let index = slot.index();
        state.drop_connection(index);

        let destination = state.sockets[index].destination;
        let socket = &mut state.sockets[index];
        *socket = SimSocket::new();
        socket.mode = mode;
        socket.port = port;
        socket.flags = flags;
        socket.destination = destination;
        socket.status = match mode {
            SocketMode::Tcp => SocketStatus::Opening,
            SocketMode::Udp => SocketStatus::UdpBound,
        };
        Ok(())
    }

    fn set_destination(&mut self, slot: SocketSlot, ip: Ipv4Address, port: u16) {
        self.state.lock().sockets[slot.index()].destination = (ip, port);
    }

    fn set_nonblocking(&mut self, _slot: SocketSlot, _nonblocking: bool) {}

    fn connect(&mut self, slot: SocketSlot, ip: Ipv4Address, port: u16) -> Result<(), ChipError> {
        let mut state = self.state.lock();
        let socket = &mut state.sockets[slot.index()];
        if socket.mode != SocketMode::Tcp || socket.status != SocketStatus::Opening {
            return Err(ChipError::InvalidSocket);
        }
        if ip.is_unspecified() || port == 0 {
            return Err(ChipError::InvalidArgument);
        }
        socket.connecting = Some(((ip, port), 0));
        Ok(())
    }

    fn listen(&mut self, slot: SocketSlot) -> Result<(), ChipError> {
        let mut state = self.state.lock();
        let socket = &mut state.sockets[slot.index()];
        if socket.mode != SocketMode::Tcp || socket.status != SocketStatus::Opening {
            return Err(ChipError::InvalidSocket);
        }
        socket.status = SocketStatus::Listening;
        Ok(())
    }

    fn send(&mut self, slot: SocketSlot, data: &[u8]) -> Result<usize, ChipError> {
        let mut state = self.state.lock();
        let index = slot.index();
        if !state.sockets[index].is_stream_open() {
            return Err(ChipError::Closed);
        }
        if let Some(error) = state.send_failure.take() {
            return Err(error);
        }
        if state.send_busy > 0 {
            state.send_busy -= 1;
            return Err(ChipError::Busy);
        }

        let socket = &mut state.sockets[index];
        socket.tx_pending = socket.tx_pending.saturating_sub(TX_DRAIN);
        let count = data.len().min(TX_CAPACITY - socket.tx_pending);
        if count == 0 {
            return Err(ChipError::Busy);
        }
        socket.tx_pending += count;
        let sent = &data[..count];

        let mut echo = false;
        for peer in state.peers.iter_mut() {
            if peer.socket == Some(index) {
                peer.received.extend_from_slice(sent);
                echo = peer.echo;
            }
        }
        if echo {
            state.sockets[index].rx.extend(sent.iter().copied());
        }
        Ok(count)
    }

    fn recv(&mut self, slot: SocketSlot, buf: &mut [u8]) -> Result<usize, ChipError> {
        let mut state = self.state.lock();
        let socket = &mut state.sockets[slot.index()];
        if !socket.is_stream_open() {
            return Err(ChipError::Closed);
        }
        if socket.rx.is_empty() {
            return Err(ChipError::Busy);
        }
        let count = buf.len().min(socket.rx.len());
        for (dst, src) in buf.iter_mut().zip(socket.rx.drain(..count)) {
            *dst = src;
        }
        Ok(count)
    }

    fn send_to(
        &mut self,
        slot: SocketSlot,
        data: &[u8],
        ip: Ipv4Address,
        port: u16,
    ) -> Result<usize, ChipError> {
        let mut state = self.state.lock();
        let index = slot.index();
        if state.sockets[index].status != SocketStatus::UdpBound {
            return Err(ChipError::Closed);
        }

        let from = (state.local_ip(), state.sockets[index].port);
        if port == DHCP_SERVER_PORT && from.1 == DHCP_CLIENT_PORT {
            state.dhcp_reply(index, data);
        } else if port == DNS_PORT && state.has_dns_server(ip) {
            state.dns_reply(index, ip, data);
        } else {
            state.udp_sent.push(((ip, port), data.to_vec()));
            if ip == from.0 || ip.is_multicast() {
                state.deliver((ip, port), from, data);
            }
        }
        Ok(data.len())
    }

    fn recv_from(
        &mut self,
        slot: SocketSlot,
        buf: &mut [u8],
    ) -> Result<(usize, Ipv4Address, u16), ChipError> {
        let mut state = self.state.lock();
        let socket = &mut state.sockets[slot.index()];
        if socket.status != SocketStatus::UdpBound {
            return Err(ChipError::Closed);
        }
        let Some(((ip, port), data)) = socket.datagrams.pop_front() else {
            return Err(ChipError::Busy);
        };
        let count = buf.len().min(data.len());
        buf[..count].copy_from_slice(&data[..count]);
        Ok((count, ip, port))
    }

    fn rx_size(&mut self, slot: SocketSlot) -> usize {
        let state = self.state.lock();
        let socket = &state.sockets[slot.index()];
        match socket.mode {
            SocketMode::Tcp => socket.rx.len(),
            SocketMode::Udp => socket.datagrams.front().map_or(0, |(_, data)| data.len()),
        }
    }

    fn tx_free(&mut self, slot: SocketSlot) -> usize {
        let mut state = self.state.lock();
        let socket = &mut state.sockets[slot.index()];
        socket.tx_pending = socket.tx_pending.saturating_sub(TX_DRAIN);
        TX_CAPACITY - socket.tx_pending
    }

    fn tx_capacity(&mut self, _slot: SocketSlot) -> usize {
        TX_CAPACITY
    }

    fn peer(&mut self, slot: SocketSlot) -> (Ipv4Address, u16) {
        self.state.lock().sockets[slot.index()]
            .peer
            .unwrap_or((Ipv4Address::UNSPECIFIED, 0))
    }

    fn disconnect(&mut self, slot: SocketSlot) -> Result<(), ChipError> {
        let mut state = self.state.lock();
        let index = slot.index();
        if state.sockets[index].mode != SocketMode::Tcp {
            return Err(ChipError::InvalidSocket);
        }
        state.drop_connection(index);
        state.sockets[index] = SimSocket::new();
        Ok(())
    }

    fn close(&mut self, slot: SocketSlot) -> Result<(), ChipError> {
        let mut state = self.state.lock();
        let index = slot.index();
        state.drop_connection(index);
        state.sockets[index] = SimSocket::new();
        Ok(())
    }
}

/// Virtual millisecond clock
pub(crate) struct SimClock {
    now: AtomicU64,
    on_sleep: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SimClock {
    pub(crate) fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
            on_sleep: Mutex::new(None),
        }
    }

    /// Run `hook` once, from inside the next sleep
    pub(crate) fn on_next_sleep(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_sleep.lock() = Some(Box::new(hook));
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn sleep_ms(&self, ms: u32) {
        self.now.fetch_add(u64::from(ms), Ordering::Relaxed);
        let hook = self.on_sleep.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

pub(crate) const SIM_IP: Ipv4Address = Ipv4Address([192, 168, 2, 26]);
pub(crate) const SIM_GATEWAY: Ipv4Address = Ipv4Address([192, 168, 2, 1]);

/// Interface with a static address, set up and with the link up
pub(crate) fn ready_interface() -> (Arc<NetworkInterface>, SimHandle) {
    ready_interface_with_clock(Arc::new(SimClock::new()))
}

/// Like [`ready_interface`], driven by a clock the test keeps
pub(crate) fn ready_interface_with_clock(
    clock: Arc<SimClock>,
) -> (Arc<NetworkInterface>, SimHandle) {
    let chip = SimChip::new();
    let handle = chip.handle();
    let config = EthernetConfig::new()
        .with_ip_address(SIM_IP.0)
        .with_subnet_mask([255, 255, 255, 0])
        .with_gateway(SIM_GATEWAY.0)
        .with_dns_server(SIM_GATEWAY.0);
    let iface = NetworkInterface::builder(Box::new(chip), clock)
        .with_config(config)
        .build();

    iface.setup(None).expect("sim setup");
    handle.set_link(true);
    iface.step();
    assert!(iface.ready());
    (iface, handle)
}
