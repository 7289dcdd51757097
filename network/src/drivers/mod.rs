// Ethernet controller driver interface
//
// The controller runs TCP/IP in hardware and exposes a fixed table of
// socket slots. Drivers translate these calls into register transactions.

use bitflags::bitflags;
use isonet_config::HardwareConfig;
use smoltcp::wire::Ipv4Address;
use thiserror::Error;

use crate::slots::SocketSlot;

/// Number of hardware socket slots on the controller
pub const NUM_SOCKETS: usize = 8;

/// Socket status register, as reported by the chip
///
/// Transitional teardown states (FIN_WAIT, TIME_WAIT, LAST_ACK, ...) are
/// reported as [`SocketStatus::CloseWait`] by drivers; they are neither
/// usable nor free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Closed,
    /// Opened or connecting, not yet established
    Opening,
    Established,
    Listening,
    UdpBound,
    /// Peer has closed its side; buffered data may remain
    CloseWait,
}

/// Protocol a slot is opened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    Tcp,
    Udp,
}

bitflags! {
    /// Mode-register flags applied when a slot is opened
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SocketFlags: u8 {
        /// Join the multicast group set with `set_destination` before opening
        const MULTICAST = 0x80;
        /// Block broadcast reception in UDP mode
        const BROADCAST_BLOCK = 0x40;
        /// Send ACK without delay in TCP mode
        const NO_DELAYED_ACK = 0x20;
    }
}

/// Addressing mode recorded in the chip's network info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Static,
    Dhcp,
}

/// Contents of the chip's common network registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetInfo {
    pub mac: [u8; 6],
    pub ip: Ipv4Address,
    pub subnet_mask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub dns: Ipv4Address,
    pub mode: AddressMode,
}

/// Driver-level result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChipError {
    /// Operation would block; retry later
    #[error("socket busy")]
    Busy,
    #[error("socket closed")]
    Closed,
    #[error("socket timeout")]
    Timeout,
    #[error("invalid socket")]
    InvalidSocket,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("controller not responding")]
    NotResponding,
    #[error("driver error {0}")]
    Code(i8),
}

/// Trait for Ethernet controller drivers
///
/// All calls are made while holding the bus transaction lock (see
/// [`crate::bus::Bus`]), so implementations never need their own locking.
/// Socket calls are non-blocking: a call that cannot progress returns
/// [`ChipError::Busy`] or reports its progress through [`ChipDriver::status`].
pub trait ChipDriver: Send {
    /// Reset and initialize the controller
    ///
    /// # Arguments
    /// * `hardware` - SPI bus, pins and transaction settings
    fn init(&mut self, hardware: &HardwareConfig) -> Result<(), ChipError>;

    /// Get the MAC address programmed into the controller
    fn mac_address(&self) -> [u8; 6];

    /// Read the PHY link status register
    fn phy_link(&mut self) -> bool;

    /// Program the common network registers
    fn set_net_info(&mut self, info: &NetInfo);

    /// Read the status register of a slot
    fn status(&mut self, slot: SocketSlot) -> SocketStatus;

    /// Open a slot in `mode` bound to local `port`
    fn open(
        &mut self,
        slot: SocketSlot,
        mode: SocketMode,
        port: u16,
        flags: SocketFlags,
    ) -> Result<(), ChipError>;

    /// Set the destination registers of a slot (multicast group before open)
    fn set_destination(&mut self, slot: SocketSlot, ip: Ipv4Address, port: u16);

    /// Switch a slot between blocking and non-blocking transfer mode
    fn set_nonblocking(&mut self, slot: SocketSlot, nonblocking: bool);

    /// Start a TCP connection; progress is reported through `status`
    fn connect(&mut self, slot: SocketSlot, ip: Ipv4Address, port: u16) -> Result<(), ChipError>;

    /// Put an opened TCP slot into listen mode
    fn listen(&mut self, slot: SocketSlot) -> Result<(), ChipError>;

    /// Queue stream data
    ///
    /// # Returns
    /// * `Ok(n)` - `n` bytes were copied into the transmit buffer
    /// * `Err(ChipError::Busy)` - No room yet
    fn send(&mut self, slot: SocketSlot, data: &[u8]) -> Result<usize, ChipError>;

    /// Receive stream data
    ///
    /// # Returns
    /// * `Ok(n)` - `n` bytes were copied into `buf`
    /// * `Err(ChipError::Busy)` - Nothing received yet
    fn recv(&mut self, slot: SocketSlot, buf: &mut [u8]) -> Result<usize, ChipError>;

    /// Send one datagram
    fn send_to(
        &mut self,
        slot: SocketSlot,
        data: &[u8],
        ip: Ipv4Address,
        port: u16,
    ) -> Result<usize, ChipError>;

    /// Receive one datagram, truncated to `buf`
    ///
    /// # Returns
    /// * `Ok((len, ip, port))` - Payload length copied and the sender
    fn recv_from(
        &mut self,
        slot: SocketSlot,
        buf: &mut [u8],
    ) -> Result<(usize, Ipv4Address, u16), ChipError>;

    /// Bytes (TCP) or next datagram size (UDP) waiting in the receive buffer
    fn rx_size(&mut self, slot: SocketSlot) -> usize;

    /// Free space in the transmit buffer
    fn tx_free(&mut self, slot: SocketSlot) -> usize;

    /// Total size of the transmit buffer
    fn tx_capacity(&mut self, slot: SocketSlot) -> usize;

    /// Remote endpoint of a connected TCP slot
    fn peer(&mut self, slot: SocketSlot) -> (Ipv4Address, u16);

    /// Gracefully close a TCP connection
    fn disconnect(&mut self, slot: SocketSlot) -> Result<(), ChipError>;

    /// Close a slot immediately
    fn close(&mut self, slot: SocketSlot) -> Result<(), ChipError>;
}
