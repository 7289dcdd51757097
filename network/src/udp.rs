// UDP sockets and multicast
//
// Two ways to use a socket:
//
// - Stateless: `send_packet` and `receive_packet` work on caller buffers.
// - Stateful: `begin_packet`/`write`/`end_packet` and `parse_packet`/`read`
//   share one internal buffer, allocated on first use.
//
// Do not interleave the stateful send and receive sides in one session;
// they share the buffer.

use alloc::sync::Arc;
use alloc::vec::Vec;
use smoltcp::wire::Ipv4Address;

use crate::clock::elapsed;
use crate::drivers::{SocketFlags, SocketMode, SocketStatus};
use crate::error::NetError;
use crate::interface::NetworkInterface;
use crate::io::{Readable, Writable};
use crate::slots::{SlotOwner, SocketSlot};

/// Internal buffer size used when none was set
pub const UDP_DEFAULT_BUFFER_SIZE: usize = 512;

pub struct UdpSocket {
    iface: Arc<NetworkInterface>,
    slot: Option<SocketSlot>,
    port: u16,
    group: Option<Ipv4Address>,
    remote_ip: Ipv4Address,
    remote_port: u16,
    buffer: Option<Vec<u8>>,
    buffer_size: usize,
    offset: usize,
    total: usize,
}

impl UdpSocket {
    pub fn new(iface: &Arc<NetworkInterface>) -> Self {
        Self {
            iface: iface.clone(),
            slot: None,
            port: 0,
            group: None,
            remote_ip: Ipv4Address::UNSPECIFIED,
            remote_port: 0,
            buffer: None,
            buffer_size: UDP_DEFAULT_BUFFER_SIZE,
            offset: 0,
            total: 0,
        }
    }

    /// Bind to local `port`, stopping any previous binding
    pub fn begin(&mut self, port: u16) -> Result<(), NetError> {
        self.stop();
        let slot = self.open(port, None)?;
        log::trace!("UDP using {}", slot);
        self.slot = Some(slot);
        self.port = port;
        Ok(())
    }

    fn open(&self, port: u16, group: Option<Ipv4Address>) -> Result<SocketSlot, NetError> {
        self.iface
            .bus()
            .transaction(|tx| -> Result<SocketSlot, NetError> {
                let slot = tx.acquire(SlotOwner::Datagram)?;
                let flags = match group {
                    Some(group) => {
                        tx.chip().set_destination(slot, group, port);
                        SocketFlags::MULTICAST
                    }
                    None => SocketFlags::empty(),
                };
                if let Err(e) = tx.chip().open(slot, SocketMode::Udp, port, flags) {
                    log::trace!("UDP socket error {}", e);
                    tx.release(slot);
                    return Err(NetError::SocketOpen(e));
                }
                Ok(slot)
            })
    }

    /// Close the socket and discard buffered data
    pub fn stop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.iface.bus().transaction(|tx| tx.close_and_release(slot));
        }
        self.group = None;
        self.flush_buffer();
    }

    /// Slot is held and the chip reports it bound in UDP mode
    pub fn is_open(&self) -> bool {
        match self.slot {
            Some(slot) => {
                self.iface.bus().transaction(|tx| tx.chip().status(slot)) == SocketStatus::UdpBound
            }
            None => false,
        }
    }

    /// Send one datagram from a caller buffer
    pub fn send_packet(
        &mut self,
        data: &[u8],
        ip: Ipv4Address,
        port: u16,
    ) -> Result<usize, NetError> {
        let slot = self.slot.ok_or(NetError::NotBound)?;
        log::trace!("sendPacket size {}, {}#{}", data.len(), ip, port);
        self.iface
            .bus()
            .transaction(|tx| tx.chip().send_to(slot, data, ip, port))
            .map_err(NetError::Send)
    }

    /// Receive one datagram into a caller buffer
    ///
    /// Polls every millisecond until a datagram arrives or `timeout_ms`
    /// passes; a zero timeout checks once. The sender becomes the remote
    /// address. The internal buffer is left alone.
    ///
    /// Do not call this between [`UdpSocket::begin_packet`] and
    /// [`UdpSocket::end_packet`]: the datagram being built would go to the
    /// sender received here instead.
    ///
    /// # Returns
    /// * `Ok(n)` - Datagram of `n` bytes, truncated to `buf`
    /// * `Ok(0)` - Nothing arrived in time
    /// * `Err(NetError::NotBound)` - The socket must be bound again
    /// * `Err(NetError::Receive)` - The chip failed the read
    pub fn receive_packet(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, NetError> {
        let slot = match self.slot {
            Some(slot) if self.is_open() => slot,
            _ => return Err(NetError::NotBound),
        };

        let clock = self.iface.clock();
        let start = clock.now_ms();
        loop {
            let received = self.iface.bus().transaction(|tx| {
                if tx.chip().rx_size(slot) == 0 {
                    return None;
                }
                Some(tx.chip().recv_from(slot, buf))
            });

            match received {
                Some(Ok((len, ip, port))) => {
                    self.remote_ip = ip;
                    self.remote_port = port;
                    return Ok(len);
                }
                Some(Err(e)) => return Err(NetError::Receive(e)),
                None => {}
            }

            if timeout_ms == 0 || elapsed(clock, start, timeout_ms) {
                return Ok(0);
            }
            clock.sleep_ms(1);
        }
    }

    /// Start building a datagram for `ip:port`
    ///
    /// # Returns
    /// Capacity of the internal buffer; 0 if it was released
    pub fn begin_packet(&mut self, ip: Ipv4Address, port: u16) -> usize {
        log::trace!("begin packet {}#{}", ip, port);
        self.ensure_buffer();
        self.remote_ip = ip;
        self.remote_port = port;
        self.flush_buffer();
        self.buffer_size
    }

    /// Resolve `host`, then start a datagram for it
    pub fn begin_packet_host(&mut self, host: &str, port: u16) -> Result<usize, NetError> {
        if !self.iface.ready() {
            return Err(NetError::NotReady);
        }
        let ip = self.iface.resolve(host)?;
        Ok(self.begin_packet(ip, port))
    }

    /// Append to the datagram being built
    ///
    /// # Returns
    /// Bytes accepted; less than `data.len()` once the buffer is full
    pub fn write(&mut self, data: &[u8]) -> usize {
        let Some(buffer) = self.buffer.as_mut() else {
            return 0;
        };
        let count = data.len().min(buffer.len() - self.offset);
        buffer[self.offset..self.offset + count].copy_from_slice(&data[..count]);
        self.offset += count;
        count
    }

    /// Send the datagram built since `begin_packet`
    pub fn end_packet(&mut self) -> Result<usize, NetError> {
        let slot = self.slot.ok_or(NetError::NotBound)?;
        let (ip, port) = (self.remote_ip, self.remote_port);
        let len = self.offset;
        let data = self.buffer.as_deref().map_or(&[][..], |buffer| &buffer[..len]);

        let sent = self
            .iface
            .bus()
            .transaction(|tx| tx.chip().send_to(slot, data, ip, port))
            .map_err(NetError::Send);
        self.flush_buffer();
        sent
    }

    /// Receive the next datagram into the internal buffer
    ///
    /// Any unread data from the previous datagram is discarded. Returns 0
    /// both when nothing arrived and when the socket is not usable; use
    /// [`UdpSocket::receive_packet`] to tell the two apart.
    pub fn parse_packet(&mut self, timeout_ms: u32) -> usize {
        self.ensure_buffer();
        self.flush_buffer();

        let Some(mut buffer) = self.buffer.take() else {
            return 0;
        };
        if let Ok(len) = self.receive_packet(&mut buffer, timeout_ms) {
            self.total = len;
        }
        self.buffer = Some(buffer);
        self.available()
    }

    /// Unread bytes of the parsed datagram
    pub fn available(&self) -> usize {
        self.total - self.offset
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.offset += 1;
        Some(byte)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.available());
        if let Some(buffer) = self.buffer.as_ref() {
            buf[..count].copy_from_slice(&buffer[self.offset..self.offset + count]);
            self.offset += count;
            count
        } else {
            0
        }
    }

    pub fn peek(&self) -> Option<u8> {
        if self.available() == 0 {
            return None;
        }
        self.buffer.as_ref().map(|buffer| buffer[self.offset])
    }

    /// Unread part of the parsed datagram
    pub fn buffer(&self) -> &[u8] {
        match self.buffer.as_ref() {
            Some(buffer) => &buffer[self.offset..self.total],
            None => &[],
        }
    }

    /// Replace the internal buffer with one of `size` bytes
    ///
    /// A size of 0 leaves the socket without a buffer.
    pub fn set_buffer(&mut self, size: usize) -> usize {
        self.release_buffer();
        if size > 0 {
            self.buffer = Some(vec![0; size]);
            self.buffer_size = size;
        }
        self.buffer_size
    }

    /// Free the internal buffer; stateful calls do nothing until
    /// `set_buffer` is called again
    pub fn release_buffer(&mut self) {
        self.buffer = None;
        self.buffer_size = 0;
        self.flush_buffer();
    }

    fn ensure_buffer(&mut self) {
        if self.buffer.is_none() && self.buffer_size > 0 {
            self.buffer = Some(vec![0; self.buffer_size]);
        }
    }

    fn flush_buffer(&mut self) {
        self.offset = 0;
        self.total = 0;
    }

    /// Reopen on the bound port as a member of `group`
    pub fn join_multicast(&mut self, group: Ipv4Address) -> Result<(), NetError> {
        if !self.is_open() {
            return Err(NetError::NotBound);
        }
        let port = self.port;
        self.stop();

        let slot = self.open(port, Some(group))?;
        log::trace!("UDP multicast {} using {}", group, slot);
        self.slot = Some(slot);
        self.group = Some(group);
        Ok(())
    }

    /// Reopen on the bound port as a plain UDP socket
    pub fn leave_multicast(&mut self) -> Result<(), NetError> {
        if !self.is_open() {
            return Err(NetError::NotBound);
        }
        let port = self.port;
        self.begin(port)
    }

    /// Multicast group joined, if any
    pub fn multicast_group(&self) -> Option<Ipv4Address> {
        self.group
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Sender of the last received datagram, or destination set by
    /// `begin_packet`
    pub fn remote_ip(&self) -> Ipv4Address {
        self.remote_ip
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Readable for UdpSocket {
    fn available(&mut self) -> usize {
        UdpSocket::available(self)
    }

    fn read_byte(&mut self) -> Option<u8> {
        UdpSocket::read_byte(self)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        UdpSocket::read(self, buf)
    }

    fn peek(&mut self) -> Option<u8> {
        UdpSocket::peek(self)
    }
}

impl Writable for UdpSocket {
    fn write(&mut self, data: &[u8]) -> Result<usize, NetError> {
        Ok(UdpSocket::write(self, data))
    }

    fn flush(&mut self) {}
}
