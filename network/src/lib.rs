#![cfg_attr(not(test), no_std)]

// Connection layer for hardware TCP/IP Ethernet controllers
// Provides socket-slot management, DHCP, DNS, TCP and UDP on top of a chip
// driver that runs the TCP/IP stack itself.

#[macro_use]
extern crate alloc;

pub mod address;
pub mod bus;
pub mod clock;
pub mod dhcp;
pub mod dns;
pub mod drivers;
pub mod error;
pub mod events;
pub mod interface;
pub mod io;
pub mod link;
pub mod slots;
pub mod tcp;
pub mod udp;

#[cfg(test)]
pub(crate) mod sim;

// Re-export commonly used types
pub use address::DhcpState;
pub use clock::Clock;
pub use dhcp::{DhcpClient, DhcpEngine, Lease};
pub use drivers::{ChipDriver, ChipError, NetInfo, SocketStatus, NUM_SOCKETS};
pub use error::NetError;
pub use events::{InterfaceEvent, Subscriber};
pub use interface::{InterfaceBuilder, NetworkInterface};
pub use io::{Readable, Writable};
pub use slots::SocketSlot;
pub use tcp::{TcpClient, TcpServer};
pub use udp::UdpSocket;

pub use isonet_config as config;
pub use smoltcp::wire::Ipv4Address;
