//! Configuration types for isonet
//!
//! Describes how the controller is wired (SPI bus and pins) and how the
//! interface gets its IPv4 address.

use alloc::string::String;
use core::fmt;

/// IPv4 address as it is stored in configuration and chip registers
pub type Ipv4 = [u8; 4];

/// Main configuration structure for an Ethernet interface
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EthernetConfig {
    pub hardware: HardwareConfig,
    pub addressing: Addressing,
    pub addresses: AddressSettings,
    /// Path of the persisted JSON settings, if any
    pub config_file: Option<String>,
}

impl EthernetConfig {
    /// Create a configuration using DHCP and the default wiring
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hardware(mut self, hardware: HardwareConfig) -> Self {
        self.hardware = hardware;
        self
    }

    /// Set a static IP address (switches to static addressing)
    pub fn with_ip_address(mut self, ip: Ipv4) -> Self {
        self.addressing = Addressing::Static;
        self.addresses.ip_addr = ip;
        self
    }

    /// Set the subnet mask (switches to static addressing)
    pub fn with_subnet_mask(mut self, mask: Ipv4) -> Self {
        self.addressing = Addressing::Static;
        self.addresses.subnet_mask = mask;
        self
    }

    /// Set the gateway address (switches to static addressing)
    pub fn with_gateway(mut self, gateway: Ipv4) -> Self {
        self.addressing = Addressing::Static;
        self.addresses.gateway_addr = gateway;
        self
    }

    /// Set the DNS server address (switches to static addressing)
    pub fn with_dns_server(mut self, dns: Ipv4) -> Self {
        self.addressing = Addressing::Static;
        self.addresses.dns_addr = dns;
        self
    }

    pub fn with_static_ip(mut self) -> Self {
        self.addressing = Addressing::Static;
        self
    }

    /// Use DHCP; clears any configured IP address
    pub fn with_dhcp(mut self) -> Self {
        self.addressing = Addressing::Dhcp;
        self.addresses.ip_addr = [0; 4];
        self
    }

    pub fn with_config_file(mut self, path: &str) -> Self {
        self.config_file = Some(String::from(path));
        self
    }
}

/// How the interface obtains its address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Addressing {
    #[default]
    Dhcp,
    Static,
}

/// The four addresses programmed into the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressSettings {
    pub ip_addr: Ipv4,
    pub subnet_mask: Ipv4,
    pub gateway_addr: Ipv4,
    pub dns_addr: Ipv4,
}

impl AddressSettings {
    /// True once a non-zero IP address is present
    pub fn has_ip(&self) -> bool {
        self.ip_addr != [0; 4]
    }
}

/// SPI clock polarity/phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpiMode {
    #[default]
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitOrder {
    #[default]
    MsbFirst,
    LsbFirst,
}

/// SPI transaction settings used for every bus transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiSettings {
    pub clock_hz: u32,
    pub mode: SpiMode,
    pub bit_order: BitOrder,
}

impl Default for SpiSettings {
    fn default() -> Self {
        Self {
            clock_hz: 32_000_000,
            mode: SpiMode::Mode0,
            bit_order: BitOrder::MsbFirst,
        }
    }
}

/// Wiring of the Ethernet controller
///
/// Pin numbers are board GPIO numbers. INT and RESET are optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareConfig {
    pub spi_bus: u8,
    pub pin_cs: Option<u16>,
    pub pin_int: Option<u16>,
    pub pin_reset: Option<u16>,
    pub spi: SpiSettings,
}

impl HardwareConfig {
    pub fn with_spi_bus(mut self, bus: u8) -> Self {
        self.spi_bus = bus;
        self
    }

    pub fn with_pin_cs(mut self, pin: u16) -> Self {
        self.pin_cs = Some(pin);
        self
    }

    pub fn with_pin_int(mut self, pin: u16) -> Self {
        self.pin_int = Some(pin);
        self
    }

    pub fn with_pin_reset(mut self, pin: u16) -> Self {
        self.pin_reset = Some(pin);
        self
    }

    pub fn with_spi_settings(mut self, spi: SpiSettings) -> Self {
        self.spi = spi;
        self
    }
}

/// Dotted-quad formatting for [`Ipv4`] values
pub struct DottedQuad<'a>(pub &'a Ipv4);

impl fmt::Display for DottedQuad<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = *self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

/// Parse "a.b.c.d" into four octets
///
/// Returns `None` unless there are exactly four decimal fields, each 0..=255.
pub fn parse_dotted_quad(text: &str) -> Option<Ipv4> {
    let mut octets = [0u8; 4];
    let mut fields = text.trim().split('.');

    for octet in octets.iter_mut() {
        let field = fields.next()?;
        if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *octet = field.parse().ok()?;
    }

    if fields.next().is_some() {
        return None;
    }

    Some(octets)
}
