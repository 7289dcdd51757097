// TCP client connection
//
// A TcpClient is a handle to shared connection state. Clones refer to the
// same socket; the socket is disconnected and its slot released when
// stop() is called or the last handle is dropped.

use alloc::sync::Arc;
use alloc::vec::Vec;
use smoltcp::wire::Ipv4Address;
use spin::{Mutex, MutexGuard};

use crate::clock::elapsed;
use crate::drivers::{ChipError, SocketFlags, SocketMode, SocketStatus};
use crate::error::NetError;
use crate::interface::NetworkInterface;
use crate::io::{Readable, Writable};
use crate::bus::Transaction;
use crate::slots::{SlotOwner, SocketSlot};

/// Size of the local receive buffer
pub const TCP_CLIENT_BUFFER_SIZE: usize = 128;
/// Default send timeout for `write`
pub const DEFAULT_SEND_TIMEOUT_MS: u32 = 180_000;

struct ConnState {
    slot: Option<SocketSlot>,
    buffer: [u8; TCP_CLIENT_BUFFER_SIZE],
    offset: usize,
    total: usize,
    remote: Option<(Ipv4Address, u16)>,
    write_error: Option<NetError>,
}

impl ConnState {
    fn buffered(&self) -> usize {
        self.total - self.offset
    }

    fn flush_buffer(&mut self) {
        self.offset = 0;
        self.total = 0;
    }
}

struct Shared {
    iface: Arc<NetworkInterface>,
    conn: Mutex<ConnState>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        stop_connection(&self.iface, self.conn.get_mut());
    }
}

/// Buffered TCP stream over one hardware slot
#[derive(Clone)]
pub struct TcpClient {
    shared: Arc<Shared>,
}

impl TcpClient {
    /// Create an unconnected client
    pub fn new(iface: &Arc<NetworkInterface>) -> Self {
        Self::with_slot(iface, None, None)
    }

    /// Wrap a slot that a listener accepted
    pub(crate) fn accepted(
        iface: &Arc<NetworkInterface>,
        slot: SocketSlot,
        remote: (Ipv4Address, u16),
    ) -> Self {
        Self::with_slot(iface, Some(slot), Some(remote))
    }

    fn with_slot(
        iface: &Arc<NetworkInterface>,
        slot: Option<SocketSlot>,
        remote: Option<(Ipv4Address, u16)>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                iface: iface.clone(),
                conn: Mutex::new(ConnState {
                    slot,
                    buffer: [0; TCP_CLIENT_BUFFER_SIZE],
                    offset: 0,
                    total: 0,
                    remote,
                    write_error: None,
                }),
            }),
        }
    }

    fn iface(&self) -> &NetworkInterface {
        &self.shared.iface
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.shared.conn.lock()
    }

    /// Connect to `ip:port`
    ///
    /// Any previous connection is stopped first. Blocks until the chip
    /// reports the connection established or refused; there is no timeout.
    ///
    /// # Returns
    /// * `Ok(())` - Connected; transfers are non-blocking from here on
    /// * `Err(NetError::NotReady)` - Interface has no link or no address
    /// * `Err(NetError::NoFreeSocket)` - All slots are in use
    /// * `Err(NetError::ConnectFailed)` - The peer refused or the attempt failed
    pub fn connect(&self, ip: Ipv4Address, port: u16) -> Result<(), NetError> {
        self.stop();
        log::trace!("TCPClient connect({} {})", ip, port);

        let iface = self.iface();
        if !iface.ready() {
            return Err(NetError::NotReady);
        }

        let local_port = iface.ephemeral_port();
        let slot = iface.bus().transaction(|tx| -> Result<SocketSlot, NetError> {
            let slot = tx.acquire(SlotOwner::Stream)?;
            if let Err(e) = tx
                .chip()
                .open(slot, SocketMode::Tcp, local_port, SocketFlags::empty())
            {
                log::trace!("TCPClient socket error {}", e);
                tx.release(slot);
                return Err(NetError::SocketOpen(e));
            }
            Ok(slot)
        })?;
        log::trace!("TCPClient using {}", slot);

        {
            let mut conn = self.lock();
            conn.slot = Some(slot);
            conn.remote = Some((ip, port));
            conn.flush_buffer();
        }

        let connected = self.wait_established(slot, ip, port);
        let mut conn = self.lock();
        if conn.slot != Some(slot) {
            log::trace!("TCPClient {} stopped while connecting", slot);
            return Err(NetError::ConnectFailed);
        }
        if connected {
            iface
                .bus()
                .transaction(|tx| tx.chip().set_nonblocking(slot, true));
            Ok(())
        } else {
            stop_connection(&self.shared.iface, &mut conn);
            Err(NetError::ConnectFailed)
        }
    }

    /// Resolve `host` and connect to it
    ///
    /// A failed lookup fails the connect without claiming a slot.
    pub fn connect_host(&self, host: &str, port: u16) -> Result<(), NetError> {
        self.stop();
        if !self.iface().ready() {
            return Err(NetError::NotReady);
        }

        let ip = self.iface().resolve(host).map_err(|e| {
            log::trace!("unable to get IP for hostname {}: {}", host, e);
            e
        })?;
        self.connect(ip, port)
    }

    /// Run `f` on the bus while this connection still holds `slot`
    ///
    /// Another handle may stop the connection between two polls, after
    /// which the slot can belong to someone else.
    fn on_own_slot<R>(
        &self,
        slot: SocketSlot,
        f: impl FnOnce(&mut Transaction<'_>) -> R,
    ) -> Option<R> {
        let conn = self.lock();
        if conn.slot != Some(slot) {
            return None;
        }
        let result = self.iface().bus().transaction(f);
        drop(conn);
        Some(result)
    }

    fn wait_established(&self, slot: SocketSlot, ip: Ipv4Address, port: u16) -> bool {
        let clock = self.iface().clock();
        match self.on_own_slot(slot, |tx| tx.chip().connect(slot, ip, port)) {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                log::trace!("TCPClient connect() res={}", e);
                return false;
            }
            None => return false,
        }

        loop {
            match self.on_own_slot(slot, |tx| tx.chip().status(slot)) {
                Some(SocketStatus::Established | SocketStatus::CloseWait) => return true,
                Some(SocketStatus::Closed) => {
                    log::trace!("TCPClient connect() refused");
                    return false;
                }
                Some(_) => clock.sleep_ms(1),
                None => return false,
            }
        }
    }

    /// Write `data` with the default send timeout
    pub fn write(&self, data: &[u8]) -> Result<usize, NetError> {
        self.write_timeout(data, DEFAULT_SEND_TIMEOUT_MS)
    }

    pub fn write_byte(&self, byte: u8) -> Result<usize, NetError> {
        self.write(&[byte])
    }

    /// Write `data`, retrying busy sends every millisecond until `timeout_ms`
    ///
    /// A zero timeout makes a single attempt.
    ///
    /// # Returns
    /// * `Ok(n)` - All `n` bytes were queued
    /// * `Err(NetError::WriteTimeout { sent })` - Timed out after `sent` bytes
    /// * `Err(NetError::PartialWrite { sent, error })` - The chip failed after
    ///   `sent` bytes; also kept for [`TcpClient::write_error`]
    /// * `Err(NetError::NotBound)` - No connection, or it was stopped before
    ///   anything was sent
    pub fn write_timeout(&self, data: &[u8], timeout_ms: u32) -> Result<usize, NetError> {
        let slot = {
            let mut conn = self.lock();
            conn.write_error = None;
            conn.slot
        };
        let Some(slot) = slot else {
            return Err(NetError::NotBound);
        };

        let clock = self.iface().clock();
        let start = clock.now_ms();
        let mut sent = 0;

        while sent < data.len() {
            let Some(result) = self.on_own_slot(slot, |tx| tx.chip().send(slot, &data[sent..]))
            else {
                log::trace!("TCPClient {} stopped during write after {} bytes", slot, sent);
                if sent == 0 {
                    return Err(NetError::NotBound);
                }
                let failure = NetError::PartialWrite {
                    sent,
                    error: ChipError::Closed,
                };
                self.lock().write_error = Some(failure.clone());
                return Err(failure);
            };
            match result {
                Ok(n) => sent += n,
                Err(ChipError::Busy) => {}
                Err(error) => {
                    let failure = NetError::PartialWrite { sent, error };
                    self.lock().write_error = Some(failure.clone());
                    return Err(failure);
                }
            }
            if sent == data.len() {
                break;
            }
            if timeout_ms == 0 || elapsed(clock, start, timeout_ms) {
                return Err(NetError::WriteTimeout { sent });
            }
            clock.sleep_ms(1);
        }

        Ok(sent)
    }

    /// Error recorded by the last write, if it failed on the chip
    pub fn write_error(&self) -> Option<NetError> {
        self.lock().write_error.clone()
    }

    /// Bytes readable without blocking
    ///
    /// Refills the local buffer from the chip once it has been consumed.
    pub fn available(&self) -> usize {
        let ready = self.iface().ready();
        let mut conn = self.lock();
        self.refill(&mut conn, ready);
        conn.buffered()
    }

    fn refill(&self, conn: &mut ConnState, ready: bool) {
        if conn.total != 0 && conn.offset == conn.total {
            conn.flush_buffer();
        }
        if conn.total != 0 || !ready {
            return;
        }
        let Some(slot) = conn.slot else {
            return;
        };

        let ConnState { buffer, total, .. } = conn;
        let received = self.iface().bus().transaction(|tx| {
            match tx.chip().status(slot) {
                SocketStatus::Established | SocketStatus::CloseWait => {}
                _ => return 0,
            }
            match tx.chip().recv(slot, &mut buffer[..]) {
                Ok(n) => n,
                Err(ChipError::Busy) => 0,
                Err(e) => {
                    log::trace!("{} recv failed: {}", slot, e);
                    0
                }
            }
        });
        if received > 0 {
            *total = received;
        }
    }

    /// Read one byte
    pub fn read_byte(&self) -> Option<u8> {
        let ready = self.iface().ready();
        let mut conn = self.lock();
        if conn.buffered() == 0 {
            self.refill(&mut conn, ready);
        }
        if conn.buffered() == 0 {
            return None;
        }
        let byte = conn.buffer[conn.offset];
        conn.offset += 1;
        Some(byte)
    }

    /// Read up to `buf.len()` buffered bytes
    ///
    /// Returns 0 when nothing is available.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let ready = self.iface().ready();
        let mut conn = self.lock();
        if conn.buffered() == 0 {
            self.refill(&mut conn, ready);
        }
        let count = buf.len().min(conn.buffered());
        let start = conn.offset;
        buf[..count].copy_from_slice(&conn.buffer[start..start + count]);
        conn.offset += count;
        count
    }

    /// Next byte without consuming it
    pub fn peek(&self) -> Option<u8> {
        let ready = self.iface().ready();
        let mut conn = self.lock();
        if conn.buffered() == 0 {
            self.refill(&mut conn, ready);
        }
        (conn.buffered() > 0).then(|| conn.buffer[conn.offset])
    }

    /// Read into `out` until `terminator` is read, the connection closes or
    /// `timeout_ms` passes without it
    ///
    /// # Returns
    /// Number of bytes appended, including the terminator if found
    pub fn read_until(&self, terminator: u8, out: &mut Vec<u8>, timeout_ms: u32) -> usize {
        let clock = self.iface().clock();
        let start = clock.now_ms();
        let mut count = 0;

        loop {
            match self.read_byte() {
                Some(byte) => {
                    out.push(byte);
                    count += 1;
                    if byte == terminator {
                        return count;
                    }
                }
                None => {
                    if !self.connected() || elapsed(clock, start, timeout_ms) {
                        return count;
                    }
                    clock.sleep_ms(1);
                }
            }
        }
    }

    /// Drop locally buffered data
    pub fn discard_buffered(&self) {
        self.lock().flush_buffer();
    }

    /// Wait until the chip has transmitted everything queued
    pub fn flush(&self) {
        let Some(slot) = self.lock().slot else {
            return;
        };

        loop {
            let drained = self.on_own_slot(slot, |tx| {
                let chip = tx.chip();
                let open = matches!(
                    chip.status(slot),
                    SocketStatus::Established | SocketStatus::CloseWait
                );
                !open || chip.tx_free(slot) >= chip.tx_capacity(slot)
            });
            if drained != Some(false) {
                return;
            }
            self.iface().clock().sleep_ms(1);
        }
    }

    /// Disconnect and release the slot; safe to call repeatedly
    pub fn stop(&self) {
        let mut conn = self.lock();
        stop_connection(&self.shared.iface, &mut conn);
    }

    /// True while the connection is usable or unread data remains
    ///
    /// Once the peer has closed and everything is read, the connection is
    /// stopped and its slot released.
    pub fn connected(&self) -> bool {
        let ready = self.iface().ready();
        let mut conn = self.lock();
        if conn.buffered() > 0 {
            return true;
        }
        let Some(slot) = conn.slot else {
            return false;
        };

        let status = self.iface().bus().transaction(|tx| tx.chip().status(slot));
        if status == SocketStatus::Established && ready {
            return true;
        }

        if status == SocketStatus::CloseWait {
            self.refill(&mut conn, ready);
            if conn.buffered() > 0 {
                return true;
            }
            log::trace!("calling stop(), no more data, in CLOSE_WAIT");
        }

        stop_connection(&self.shared.iface, &mut conn);
        false
    }

    /// Socket is established and the interface is ready
    pub fn status(&self) -> bool {
        let Some(slot) = self.lock().slot else {
            return false;
        };
        self.iface().ready()
            && self.iface().bus().transaction(|tx| tx.chip().status(slot))
                == SocketStatus::Established
    }

    /// Remote address, or unspecified when not connected
    pub fn remote_ip(&self) -> Ipv4Address {
        self.lock()
            .remote
            .map_or(Ipv4Address::UNSPECIFIED, |(ip, _)| ip)
    }

    pub fn remote_port(&self) -> u16 {
        self.lock().remote.map_or(0, |(_, port)| port)
    }

    /// Slot held by this connection
    pub fn slot(&self) -> Option<SocketSlot> {
        self.lock().slot
    }

    /// True if both handles share one connection
    pub fn same_connection(&self, other: &TcpClient) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

fn stop_connection(iface: &NetworkInterface, conn: &mut ConnState) {
    let Some(slot) = conn.slot.take() else {
        return;
    };
    log::trace!("{} closesocket", slot);

    iface.bus().transaction(|tx| {
        if let Err(e) = tx.chip().disconnect(slot) {
            log::trace!("{} disconnect failed {}", slot, e);
            if let Err(e) = tx.chip().close(slot) {
                log::trace!("{} close failed {}", slot, e);
            }
        }
        tx.release(slot);
    });

    conn.remote = None;
    conn.flush_buffer();
}

impl Readable for TcpClient {
    fn available(&mut self) -> usize {
        TcpClient::available(self)
    }

    fn read_byte(&mut self) -> Option<u8> {
        TcpClient::read_byte(self)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        TcpClient::read(self, buf)
    }

    fn peek(&mut self) -> Option<u8> {
        TcpClient::peek(self)
    }
}

impl Writable for TcpClient {
    fn write(&mut self, data: &[u8]) -> Result<usize, NetError> {
        TcpClient::write(self, data)
    }

    fn flush(&mut self) {
        TcpClient::flush(self)
    }
}

impl embedded_io::ErrorType for TcpClient {
    type Error = NetError;
}

impl embedded_io::Read for TcpClient {
    /// Block until data arrives; `Ok(0)` once the connection has closed and
    /// everything was read
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let n = TcpClient::read(self, buf);
            if n > 0 {
                return Ok(n);
            }
            if !self.connected() {
                return Ok(0);
            }
            self.iface().clock().sleep_ms(1);
        }
    }
}

impl embedded_io::ReadReady for TcpClient {
    fn read_ready(&mut self) -> Result<bool, NetError> {
        Ok(TcpClient::available(self) > 0 || !self.connected())
    }
}

impl embedded_io::Write for TcpClient {
    /// Queue `buf`; a write cut short after some bytes reports those bytes
    /// and leaves the error to the next call
    fn write(&mut self, buf: &[u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        match TcpClient::write(self, buf) {
            Err(NetError::WriteTimeout { sent } | NetError::PartialWrite { sent, .. })
                if sent > 0 =>
            {
                Ok(sent)
            }
            result => result,
        }
    }

    fn flush(&mut self) -> Result<(), NetError> {
        TcpClient::flush(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ready_interface, ready_interface_with_clock, SimClock, SimHandle};
    use alloc::vec;

    const SERVER: Ipv4Address = Ipv4Address([192, 168, 2, 6]);

    fn connected_client(handle: &SimHandle, iface: &Arc<NetworkInterface>) -> TcpClient {
        handle.add_tcp_peer(SERVER, 4550, b"Test server!\n");
        let client = TcpClient::new(iface);
        client.connect(SERVER, 4550).unwrap();
        client
    }

    #[test]
    fn test_connect_and_read_line() {
        let (iface, handle) = ready_interface();
        let client = connected_client(&handle, &iface);

        assert!(client.connected());
        assert!(client.status());
        assert_eq!(client.remote_ip(), SERVER);
        assert_eq!(client.remote_port(), 4550);

        let mut line = Vec::new();
        client.read_until(b'\n', &mut line, 1000);
        assert_eq!(line, b"Test server!\n");
    }

    #[test]
    fn test_connect_requires_ready() {
        let (iface, handle) = ready_interface();
        handle.set_link(false);
        iface.step();

        let client = TcpClient::new(&iface);
        assert_eq!(client.connect(SERVER, 4550), Err(NetError::NotReady));
        assert_eq!(iface.allocated_sockets(), 0);
    }

    #[test]
    fn test_refused_connect_releases_slot() {
        let (iface, _handle) = ready_interface();
        let client = TcpClient::new(&iface);

        assert_eq!(client.connect(SERVER, 1), Err(NetError::ConnectFailed));
        assert!(client.slot().is_none());
        assert_eq!(iface.allocated_sockets(), 0);
    }

    #[test]
    fn test_connect_host_failure_claims_no_slot() {
        let (iface, _handle) = ready_interface();
        let client = TcpClient::new(&iface);

        assert!(client.connect_host("missing.example.com", 80).is_err());
        assert_eq!(iface.allocated_sockets(), 0);
    }

    #[test]
    fn test_connect_host() {
        let (iface, handle) = ready_interface();
        handle.add_dns_record(iface.dns_server_ip(), "server.local", SERVER);
        handle.add_tcp_peer(SERVER, 4550, b"hi");

        let client = TcpClient::new(&iface);
        client.connect_host("server.local", 4550).unwrap();
        assert_eq!(client.remote_ip(), SERVER);
        assert_eq!(iface.allocated_sockets(), 1);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (iface, handle) = ready_interface();
        let client = connected_client(&handle, &iface);

        assert_eq!(client.peek(), Some(b'T'));
        assert_eq!(client.peek(), Some(b'T'));
        assert_eq!(client.read_byte(), Some(b'T'));
        assert_eq!(client.peek(), Some(b'e'));
    }

    #[test]
    fn test_clones_share_connection() {
        let (iface, handle) = ready_interface();
        let client = connected_client(&handle, &iface);
        let copy = client.clone();
        assert!(copy.same_connection(&client));

        assert_eq!(copy.read_byte(), Some(b'T'));
        assert_eq!(client.read_byte(), Some(b'e'));

        drop(client);
        assert!(copy.connected());
        assert_eq!(iface.allocated_sockets(), 1);

        drop(copy);
        assert_eq!(iface.allocated_sockets(), 0);
        assert!(handle.tcp_peer_closed(SERVER, 4550));
    }

    #[test]
    fn test_connected_until_peer_close_drained() {
        let (iface, handle) = ready_interface();
        let client = connected_client(&handle, &iface);

        handle.close_tcp_peer(SERVER, 4550);
        // Greeting still unread
        assert!(client.connected());

        let mut buf = [0u8; 64];
        let mut total = 0;
        while client.connected() {
            total += client.read(&mut buf);
        }
        assert_eq!(total, 13);
        assert!(client.slot().is_none());
        assert_eq!(iface.allocated_sockets(), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (iface, handle) = ready_interface();
        let client = connected_client(&handle, &iface);

        client.stop();
        client.stop();
        assert!(!client.connected());
        assert_eq!(client.remote_ip(), Ipv4Address::UNSPECIFIED);
        assert_eq!(client.available(), 0);
        assert_eq!(iface.allocated_sockets(), 0);
    }

    #[test]
    fn test_write_retries_busy() {
        let (iface, handle) = ready_interface();
        let client = connected_client(&handle, &iface);
        handle.set_send_busy(5);

        assert_eq!(client.write(b"testing!\n"), Ok(9));
        assert_eq!(handle.tcp_peer_received(SERVER, 4550), b"testing!\n");
        assert_eq!(client.write_error(), None);
    }

    #[test]
    fn test_write_timeout_reports_count() {
        let (iface, handle) = ready_interface();
        let client = connected_client(&handle, &iface);
        handle.set_send_busy(u32::MAX);

        assert_eq!(
            client.write_timeout(b"abc", 10),
            Err(NetError::WriteTimeout { sent: 0 })
        );
        assert_eq!(
            client.write_timeout(b"abc", 0),
            Err(NetError::WriteTimeout { sent: 0 })
        );
    }

    #[test]
    fn test_write_error_is_recorded() {
        let (iface, handle) = ready_interface();
        let client = connected_client(&handle, &iface);
        handle.fail_next_send(ChipError::Closed);

        let expected = NetError::PartialWrite {
            sent: 0,
            error: ChipError::Closed,
        };
        assert_eq!(client.write(b"abc"), Err(expected.clone()));
        assert_eq!(client.write_error(), Some(expected));

        // Cleared by the next write
        client.write(b"abc").unwrap();
        assert_eq!(client.write_error(), None);
    }

    #[test]
    fn test_write_unconnected() {
        let (iface, _handle) = ready_interface();
        let client = TcpClient::new(&iface);
        assert_eq!(client.write(b"x"), Err(NetError::NotBound));
    }

    #[test]
    fn test_write_stops_when_another_handle_stops() {
        let clock = Arc::new(SimClock::new());
        let (iface, handle) = ready_interface_with_clock(clock.clone());
        let client = connected_client(&handle, &iface);
        let old_slot = client.slot();
        handle.add_tcp_peer(SERVER, 4551, b"");
        let other = TcpClient::new(&iface);

        // While the write waits out a busy send, a clone stops the
        // connection and the freed slot is claimed by another client
        let copy = client.clone();
        let reconnect = other.clone();
        clock.on_next_sleep(move || {
            copy.stop();
            reconnect.connect(SERVER, 4551).unwrap();
        });
        handle.set_send_busy(3);

        assert_eq!(client.write(b"for 4550 only"), Err(NetError::NotBound));
        assert_eq!(other.slot(), old_slot);
        assert!(handle.tcp_peer_received(SERVER, 4551).is_empty());
        assert!(handle.tcp_peer_received(SERVER, 4550).is_empty());
    }

    #[test]
    fn test_connect_stopped_while_waiting() {
        let clock = Arc::new(SimClock::new());
        let (iface, handle) = ready_interface_with_clock(clock.clone());
        handle.add_tcp_peer(SERVER, 4550, b"");
        let client = TcpClient::new(&iface);

        let copy = client.clone();
        clock.on_next_sleep(move || copy.stop());

        assert_eq!(client.connect(SERVER, 4550), Err(NetError::ConnectFailed));
        assert!(client.slot().is_none());
        assert_eq!(iface.allocated_sockets(), 0);
    }

    #[test]
    fn test_flush_returns_when_another_handle_stops() {
        let clock = Arc::new(SimClock::new());
        let (iface, handle) = ready_interface_with_clock(clock.clone());
        let client = connected_client(&handle, &iface);
        client.write(&vec![0x55; 1500]).unwrap();

        let copy = client.clone();
        let other = TcpClient::new(&iface);
        let reconnect = other.clone();
        handle.add_tcp_peer(SERVER, 4551, b"");
        clock.on_next_sleep(move || {
            copy.stop();
            reconnect.connect(SERVER, 4551).unwrap();
        });

        client.flush();
        assert!(client.slot().is_none());
        assert!(other.connected());
    }

    #[test]
    fn test_embedded_io_stream() {
        use embedded_io::{Read as _, ReadReady as _, Write as _};

        let (iface, handle) = ready_interface();
        let mut client = connected_client(&handle, &iface);
        assert_eq!(client.read_ready(), Ok(true));

        let mut greeting = [0u8; 13];
        client.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"Test server!\n");

        client.write_all(b"hello").unwrap();
        embedded_io::Write::flush(&mut client).unwrap();
        assert_eq!(handle.tcp_peer_received(SERVER, 4550), b"hello");

        handle.close_tcp_peer(SERVER, 4550);
        assert_eq!(client.read_ready(), Ok(true));
        let mut buf = [0u8; 8];
        assert_eq!(embedded_io::Read::read(&mut client, &mut buf), Ok(0));
        assert_eq!(iface.allocated_sockets(), 0);
    }

    #[test]
    fn test_embedded_io_error_kinds() {
        use embedded_io::{Error as _, ErrorKind};

        let (iface, _handle) = ready_interface();
        let mut client = TcpClient::new(&iface);
        let error = embedded_io::Write::write(&mut client, b"x").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotConnected);
        assert_eq!(
            NetError::WriteTimeout { sent: 0 }.kind(),
            ErrorKind::TimedOut
        );
        assert_eq!(NetError::NoFreeSocket.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_flush_waits_for_transmit() {
        let (iface, handle) = ready_interface();
        let client = connected_client(&handle, &iface);

        client.write(&vec![0x55; 1500]).unwrap();
        client.flush();
        let slot = client.slot().unwrap();
        iface.bus().transaction(|tx| {
            assert_eq!(tx.chip().tx_free(slot), tx.chip().tx_capacity(slot));
        });
    }

    #[test]
    fn test_megabyte_round_trip() {
        let (iface, handle) = ready_interface();
        handle.add_echo_peer(SERVER, 7);
        let client = TcpClient::new(&iface);
        client.connect(SERVER, 7).unwrap();

        let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut echoed = Vec::with_capacity(payload.len());
        let mut buf = [0u8; 100];

        for (index, chunk) in payload.chunks(4096).enumerate() {
            // Vary the write size inside each chunk
            let split = (index * 997) % chunk.len();
            client.write(&chunk[..split]).unwrap();
            client.write(&chunk[split..]).unwrap();

            let target = echoed.len() + chunk.len();
            while echoed.len() < target {
                let want = 1 + (echoed.len() % buf.len());
                let n = client.read(&mut buf[..want]);
                echoed.extend_from_slice(&buf[..n]);
            }
        }

        assert_eq!(echoed.len(), payload.len());
        assert!(echoed == payload);
        assert_eq!(handle.tcp_peer_received(SERVER, 7).len(), payload.len());
    }
}
