//! Network interface context
//!
//! [`NetworkInterface`] is the one shared object per controller. It owns the
//! bus, the link monitor and the address state machine, and is handed to
//! every socket type as an `Arc`. A single task calls [`NetworkInterface::run`]
//! (or [`NetworkInterface::step`] from its own loop); every other operation
//! may be called from any context.
//!
//! Lock order is socket (connection or listener) state, interface state,
//! then bus. Subscribers are called after the state lock is released, so
//! they may query the interface.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use isonet_config::{
    load_update, to_json, AddressSettings, Addressing, ConfigStorage, ConfigUpdate, DottedQuad,
    EthernetConfig, HardwareConfig, Ipv4,
};
use smoltcp::wire::{EthernetAddress, Ipv4Address};
use spin::Mutex;

use crate::address::{AddressAction, AddressStateMachine, DhcpState};
use crate::bus::Bus;
use crate::clock::Clock;
use crate::dhcp::{DhcpClient, DhcpEngine, Lease};
use crate::dns;
use crate::drivers::{AddressMode, ChipDriver, ChipError, NetInfo};
use crate::error::NetError;
use crate::events::{CallbackDispatcher, InterfaceEvent, Subscriber};
use crate::link::{LinkEdge, LinkMonitor};

/// First local port handed out for outgoing connections and DNS
pub const EPHEMERAL_PORT_START: u16 = 0xC000;
const EPHEMERAL_PORT_COUNT: u16 = 0x4000;

/// Most events a single step can produce: a link-up edge with its address,
/// then one announcement from the address state machine
const MAX_STEP_EVENTS: usize = 3;

type StepEvents = heapless::Vec<InterfaceEvent, MAX_STEP_EVENTS>;

struct InterfaceState {
    mac: [u8; 6],
    link: LinkMonitor,
    ready: bool,
    addresses: AddressSettings,
    machine: AddressStateMachine,
    lease: Option<Lease>,
    setup_done: bool,
}

/// Shared context for one Ethernet controller
pub struct NetworkInterface {
    bus: Bus,
    clock: Arc<dyn Clock>,
    hardware: HardwareConfig,
    config_file: Option<String>,
    callbacks: CallbackDispatcher,
    state: Mutex<InterfaceState>,
    next_port: AtomicU16,
    dns_id: AtomicU16,
}

/// Builder for [`NetworkInterface`]
pub struct InterfaceBuilder {
    chip: Box<dyn ChipDriver>,
    clock: Arc<dyn Clock>,
    config: EthernetConfig,
    engine: Option<Box<dyn DhcpEngine>>,
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl InterfaceBuilder {
    /// Wiring and addressing; defaults to DHCP on the default wiring
    pub fn with_config(mut self, config: EthernetConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the built-in DHCP client
    pub fn with_dhcp_engine(mut self, engine: Box<dyn DhcpEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Register a subscriber before the interface starts
    pub fn with_callback(mut self, subscriber: impl Subscriber + 'static) -> Self {
        self.subscribers.push(Arc::new(subscriber));
        self
    }

    pub fn build(self) -> Arc<NetworkInterface> {
        let engine = self
            .engine
            .unwrap_or_else(|| Box::new(DhcpClient::new()) as Box<dyn DhcpEngine>);
        let dhcp = self.config.addressing == Addressing::Dhcp;

        let callbacks = CallbackDispatcher::new();
        for subscriber in self.subscribers {
            callbacks.subscribe(subscriber);
        }

        Arc::new(NetworkInterface {
            bus: Bus::new(self.chip),
            clock: self.clock,
            hardware: self.config.hardware,
            config_file: self.config.config_file,
            callbacks,
            state: Mutex::new(InterfaceState {
                mac: [0; 6],
                link: LinkMonitor::new(),
                ready: false,
                addresses: self.config.addresses,
                machine: AddressStateMachine::new(engine, dhcp),
                lease: None,
                setup_done: false,
            }),
            next_port: AtomicU16::new(0),
            dns_id: AtomicU16::new(1),
        })
    }
}

impl NetworkInterface {
    /// Start building an interface around a chip driver and a clock
    pub fn builder(chip: Box<dyn ChipDriver>, clock: Arc<dyn Clock>) -> InterfaceBuilder {
        InterfaceBuilder {
            chip,
            clock,
            config: EthernetConfig::default(),
            engine: None,
            subscribers: Vec::new(),
        }
    }

    /// Initialize the controller
    ///
    /// Resets the chip, programs the MAC address and addressing mode, loads
    /// persisted settings from `storage` if given (problems are logged and
    /// ignored) and pushes any configured address to the chip.
    ///
    /// # Returns
    /// * `Ok(())` - Controller is ready to be polled
    /// * `Err(NetError::ChipInit)` - The controller did not initialize; not retried
    pub fn setup(&self, storage: Option<&dyn ConfigStorage>) -> Result<(), NetError> {
        let hardware = self.hardware;
        let mut state = self.state.lock();
        let mode = address_mode(&state.machine);

        let mac = self
            .bus
            .transaction(|tx| -> Result<[u8; 6], ChipError> {
                tx.chip().init(&hardware)?;
                let mac = tx.chip().mac_address();
                tx.chip().set_net_info(&NetInfo {
                    mac,
                    ip: Ipv4Address::UNSPECIFIED,
                    subnet_mask: Ipv4Address::UNSPECIFIED,
                    gateway: Ipv4Address::UNSPECIFIED,
                    dns: Ipv4Address::UNSPECIFIED,
                    mode,
                });
                Ok(mac)
            })
            .map_err(|e| {
                log::error!("chip init failed: {}", e);
                NetError::ChipInit(e)
            })?;

        state.mac = mac;
        log::trace!("mac {}", EthernetAddress(mac));

        if let Some(storage) = storage {
            match load_update(storage) {
                Ok(Some(update)) => self.apply_update(&mut state, &update),
                Ok(None) => log::trace!("no config present"),
                Err(e) => log::trace!("config appears to be invalid, ignoring: {}", e),
            }
        }

        state.setup_done = true;
        if state.addresses.has_ip() {
            self.push_addresses(&mut state);
        }

        log::info!("interface setup complete, DHCP state {}", state.machine.state());
        Ok(())
    }

    /// One polling step: sample the link, advance the address state machine
    /// and deliver resulting events
    pub fn step(&self) {
        let mut events = StepEvents::new();

        {
            let mut state = self.state.lock();
            if !state.setup_done {
                return;
            }

            let link = self.bus.transaction(|tx| tx.chip().phy_link());
            match state.link.sample(link) {
                Some(LinkEdge::Up) => {
                    log::trace!("PHY link up");
                    queue_event(&mut events, InterfaceEvent::LinkUp);
                    if state.machine.state() == DhcpState::NotUsed && state.addresses.has_ip() {
                        state.ready = true;
                        queue_event(&mut events, InterfaceEvent::GotIpAddress);
                    }
                }
                Some(LinkEdge::Down) => {
                    log::trace!("PHY link down");
                    queue_event(&mut events, InterfaceEvent::LinkDown);
                    state.ready = false;
                }
                None => {}
            }

            let link_up = state.link.is_up();
            let mac = state.mac;
            let now = self.clock.now_ms();
            match state.machine.step(&self.bus, link_up, mac, now) {
                AddressAction::LeaseAssigned(lease) => self.apply_lease(&mut state, lease),
                AddressAction::AnnounceAddress => {
                    queue_event(&mut events, InterfaceEvent::GotIpAddress);
                }
                AddressAction::None => {}
            }
        }

        for event in events {
            self.callbacks.dispatch(event);
        }
    }

    /// Poll forever, one step per millisecond
    pub fn run(&self) -> ! {
        loop {
            self.step();
            self.clock.sleep_ms(1);
        }
    }

    /// Link is up and an address is set
    pub fn ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Last sampled PHY link state
    pub fn link_up(&self) -> bool {
        self.state.lock().link.is_up()
    }

    pub fn dhcp_state(&self) -> DhcpState {
        self.state.lock().machine.state()
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.state.lock().mac
    }

    pub fn addresses(&self) -> AddressSettings {
        self.state.lock().addresses
    }

    pub fn local_ip(&self) -> Ipv4Address {
        Ipv4Address(self.state.lock().addresses.ip_addr)
    }

    pub fn subnet_mask(&self) -> Ipv4Address {
        Ipv4Address(self.state.lock().addresses.subnet_mask)
    }

    pub fn gateway_ip(&self) -> Ipv4Address {
        Ipv4Address(self.state.lock().addresses.gateway_addr)
    }

    pub fn dns_server_ip(&self) -> Ipv4Address {
        Ipv4Address(self.state.lock().addresses.dns_addr)
    }

    /// Server that granted the current lease
    pub fn dhcp_server_ip(&self) -> Option<Ipv4Address> {
        self.state.lock().lease.map(|lease| lease.server)
    }

    /// Most recent DHCP lease
    pub fn lease(&self) -> Option<Lease> {
        self.state.lock().lease
    }

    /// Path of the persisted settings, for building a storage backend
    pub fn config_file(&self) -> Option<&str> {
        self.config_file.as_deref()
    }

    /// Number of hardware slots currently held by any consumer
    pub fn allocated_sockets(&self) -> usize {
        self.bus.transaction(|tx| tx.allocated())
    }

    /// Set a static IP address
    pub fn set_ip_address(&self, ip: Ipv4Address) {
        self.set_static(|addresses| addresses.ip_addr = ip.0);
    }

    /// Set a static subnet mask
    pub fn set_subnet_mask(&self, mask: Ipv4Address) {
        self.set_static(|addresses| addresses.subnet_mask = mask.0);
    }

    /// Set a static gateway address
    pub fn set_gateway_address(&self, gateway: Ipv4Address) {
        self.set_static(|addresses| addresses.gateway_addr = gateway.0);
    }

    /// Set a static DNS server address
    pub fn set_dns_address(&self, dns: Ipv4Address) {
        self.set_static(|addresses| addresses.dns_addr = dns.0);
    }

    /// Use static addressing with the current address fields
    pub fn use_static_ip(&self) {
        self.set_static(|_| {});
    }

    /// Use DHCP; clears the IP address
    pub fn use_dhcp(&self) {
        let mut state = self.state.lock();
        self.switch_to_dhcp(&mut state);
        if state.setup_done {
            self.push_addresses(&mut state);
        }
    }

    /// Push the current address fields to the chip
    pub fn update_address_settings(&self) {
        let mut state = self.state.lock();
        self.push_addresses(&mut state);
    }

    /// Register a subscriber for link and address events
    pub fn subscribe(&self, subscriber: impl Subscriber + 'static) {
        self.callbacks.subscribe(Arc::new(subscriber));
    }

    /// Apply a JSON settings document
    ///
    /// Address fields are applied first (each forcing static mode), then the
    /// `DHCP` flag.
    pub fn load_json_config(&self, text: &str) -> Result<(), NetError> {
        let update = ConfigUpdate::from_json(text)?;
        let mut state = self.state.lock();
        self.apply_update(&mut state, &update);
        Ok(())
    }

    /// Load persisted settings from `storage`
    ///
    /// # Returns
    /// * `Ok(true)` - Settings were found and applied
    /// * `Ok(false)` - Nothing stored
    /// * `Err(NetError::Config)` - Stored settings are malformed; nothing changed
    pub fn load_config(&self, storage: &dyn ConfigStorage) -> Result<bool, NetError> {
        match load_update(storage)? {
            Some(update) => {
                let mut state = self.state.lock();
                self.apply_update(&mut state, &update);
                Ok(true)
            }
            None => {
                log::trace!("no config present");
                Ok(false)
            }
        }
    }

    /// Persist the four address fields to `storage`
    pub fn save_config(&self, storage: &mut dyn ConfigStorage) -> Result<(), NetError> {
        let addresses = self.addresses();
        let text = to_json(&addresses)?;
        log::trace!("saving config len={}: {}", text.len(), text);
        storage.save(&text).map_err(|e| {
            log::error!("writing config failed: {}", e);
            NetError::from(e)
        })
    }

    /// Resolve `host` to an IPv4 address
    ///
    /// Dotted-quad literals resolve without network traffic. Otherwise one
    /// slot is borrowed for the query and always returned.
    pub fn resolve(&self, host: &str) -> Result<Ipv4Address, NetError> {
        if let Some(ip) = dns::parse_literal(host) {
            return Ok(ip);
        }

        let server = self.dns_server_ip();
        let id = self.dns_id.fetch_add(1, Ordering::Relaxed);
        let port = self.ephemeral_port();
        dns::resolve(&self.bus, self.clock.as_ref(), server, port, id, host)
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Next local port from the ephemeral range
    pub(crate) fn ephemeral_port(&self) -> u16 {
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % EPHEMERAL_PORT_COUNT;
        EPHEMERAL_PORT_START + offset
    }

    fn set_static(&self, update: impl FnOnce(&mut AddressSettings)) {
        let mut state = self.state.lock();
        state.machine.use_static_ip();
        update(&mut state.addresses);
        if state.setup_done {
            self.push_addresses(&mut state);
        }
    }

    fn switch_to_dhcp(&self, state: &mut InterfaceState) {
        state.addresses.ip_addr = [0; 4];
        state.ready = false;
        state.lease = None;
        state.machine.use_dhcp(&self.bus);
    }

    fn apply_update(&self, state: &mut InterfaceState, update: &ConfigUpdate) {
        if update.has_addresses() {
            state.machine.use_static_ip();
            update.apply_addresses(&mut state.addresses);
        }
        match update.dhcp {
            Some(true) => self.switch_to_dhcp(state),
            Some(false) => state.machine.use_static_ip(),
            None => {}
        }
        if state.setup_done {
            self.push_addresses(state);
        }
    }

    fn apply_lease(&self, state: &mut InterfaceState, lease: Lease) {
        state.addresses = AddressSettings {
            ip_addr: lease.ip.0,
            subnet_mask: lease.subnet_mask.0,
            gateway_addr: lease.gateway.0,
            dns_addr: lease.dns.0,
        };
        state.lease = Some(lease);
        self.push_addresses(state);
    }

    /// Write the address fields to the chip and refresh readiness
    fn push_addresses(&self, state: &mut InterfaceState) {
        let a = &state.addresses;
        log::trace!(
            "updateAddressSettings ip={} mask={} gateway={} dns={}",
            DottedQuad(&a.ip_addr),
            DottedQuad(&a.subnet_mask),
            DottedQuad(&a.gateway_addr),
            DottedQuad(&a.dns_addr)
        );

        let info = NetInfo {
            mac: state.mac,
            ip: ipv4(a.ip_addr),
            subnet_mask: ipv4(a.subnet_mask),
            gateway: ipv4(a.gateway_addr),
            dns: ipv4(a.dns_addr),
            mode: address_mode(&state.machine),
        };
        let link = self.bus.transaction(|tx| {
            tx.chip().set_net_info(&info);
            tx.chip().phy_link()
        });

        state.ready = link && state.addresses.has_ip();
    }
}

fn queue_event(events: &mut StepEvents, event: InterfaceEvent) {
    if let Err(event) = events.push(event) {
        log::warn!("interface event {:?} dropped", event);
        debug_assert!(false, "more than {} events in one step", MAX_STEP_EVENTS);
    }
}

fn ipv4(octets: Ipv4) -> Ipv4Address {
    Ipv4Address(octets)
}

fn address_mode(machine: &AddressStateMachine) -> AddressMode {
    if machine.is_static() {
        AddressMode::Static
    } else {
        AddressMode::Dhcp
    }
}
