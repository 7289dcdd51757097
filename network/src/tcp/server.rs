// TCP listener
//
// One hardware slot listens at a time. When a peer connects, that slot is
// handed to a TcpClient and a fresh slot starts listening on the same port.

use alloc::sync::Arc;
use smoltcp::wire::Ipv4Address;
use spin::Mutex;

use crate::drivers::{SocketFlags, SocketMode, SocketStatus};
use crate::error::NetError;
use crate::interface::NetworkInterface;
use crate::slots::{SlotOwner, SocketSlot};
use crate::tcp::client::TcpClient;

/// Send timeout used by [`TcpServer::write`]
pub const WAIT_FOREVER: u32 = u32::MAX;

struct ListenState {
    slot: Option<SocketSlot>,
    client: TcpClient,
}

/// TCP server listening on a fixed port
pub struct TcpServer {
    iface: Arc<NetworkInterface>,
    port: u16,
    state: Mutex<ListenState>,
}

impl TcpServer {
    pub fn new(iface: &Arc<NetworkInterface>, port: u16) -> Self {
        Self {
            iface: iface.clone(),
            port,
            state: Mutex::new(ListenState {
                slot: None,
                client: TcpClient::new(iface),
            }),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start listening
    ///
    /// Stops any current listener and client first.
    pub fn begin(&self) -> Result<(), NetError> {
        self.stop();
        if !self.iface.ready() {
            return Err(NetError::NotReady);
        }
        let mut state = self.state.lock();
        self.start_listener(&mut state)
    }

    fn start_listener(&self, state: &mut ListenState) -> Result<(), NetError> {
        let port = self.port;
        let slot = self.iface.bus().transaction(|tx| -> Result<SocketSlot, NetError> {
            let slot = tx.acquire(SlotOwner::Listener)?;
            let opened = tx
                .chip()
                .open(slot, SocketMode::Tcp, port, SocketFlags::empty())
                .and_then(|_| tx.chip().listen(slot));
            if let Err(e) = opened {
                log::trace!("TCPServer listen on {} failed: {}", slot, e);
                tx.close_and_release(slot);
                return Err(NetError::SocketOpen(e));
            }
            Ok(slot)
        })?;

        log::trace!("TCPServer listening on port {} using {}", port, slot);
        state.slot = Some(slot);
        Ok(())
    }

    /// Accept a pending connection
    ///
    /// Returns an unconnected client when nothing has connected. An accepted
    /// connection keeps its slot; the server moves on to a new one.
    pub fn available(&self) -> TcpClient {
        let mut state = self.state.lock();

        let slot = match state.slot {
            Some(slot) => slot,
            None => {
                if self.iface.ready() {
                    if let Err(e) = self.start_listener(&mut state) {
                        log::trace!("TCPServer begin failed: {}", e);
                    }
                }
                return TcpClient::new(&self.iface);
            }
        };

        let accepted = self.iface.bus().transaction(|tx| {
            match tx.chip().status(slot) {
                SocketStatus::Established | SocketStatus::CloseWait => {}
                _ => return None,
            }
            tx.reassign(slot, SlotOwner::Stream);
            tx.chip().set_nonblocking(slot, true);
            Some(tx.chip().peer(slot))
        });
        let Some(remote) = accepted else {
            return TcpClient::new(&self.iface);
        };

        log::trace!("TCPServer accepted {}:{} on {}", remote.0, remote.1, slot);
        let client = TcpClient::accepted(&self.iface, slot, remote);
        state.client = client.clone();
        state.slot = None;

        if let Err(e) = self.start_listener(&mut state) {
            log::info!("TCPServer could not relisten on port {}: {}", self.port, e);
        }
        client
    }

    /// Write to the most recently accepted client, waiting as long as needed
    pub fn write(&self, data: &[u8]) -> Result<usize, NetError> {
        let client = self.state.lock().client.clone();
        client.write_timeout(data, WAIT_FOREVER)
    }

    /// Remote address of the most recently accepted client
    pub fn client_ip(&self) -> Ipv4Address {
        self.state.lock().client.remote_ip()
    }

    /// True while a slot is listening
    pub fn listening(&self) -> bool {
        self.state.lock().slot.is_some()
    }

    /// Stop the current client and the listener
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.client.stop();
        if let Some(slot) = state.slot.take() {
            log::trace!("TCPServer stop {}", slot);
            self.iface.bus().transaction(|tx| tx.close_and_release(slot));
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}
