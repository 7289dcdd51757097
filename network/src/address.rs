// Address acquisition state machine
//
// Runs DHCP over a borrowed slot or leaves a static configuration in place.
// Stopping the DHCP engine is always deferred to a later step so a lease
// reported from inside the engine never tears the engine down re-entrantly.

use alloc::boxed::Box;
use core::fmt;

use crate::bus::Bus;
use crate::dhcp::{DhcpEngine, DhcpRun, Lease};
use crate::error::NetError;
use crate::slots::{SlotOwner, SocketSlot};

/// Minimum interval between DHCP timer ticks
pub const DHCP_TICK_MS: u64 = 1000;

/// Address acquisition state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
    /// Static configuration in effect
    NotUsed,
    /// Waiting for link to start DHCP
    Attempt,
    /// DHCP negotiating on its slot
    InProgress,
    /// Lease acknowledged; announce on the next step
    GotAddress,
    /// Release the DHCP slot, then Done
    Cleanup,
    /// Release the DHCP slot, then NotUsed
    CleanupDisable,
    /// DHCP finished for this link-up cycle
    Done,
}

impl fmt::Display for DhcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhcpState::NotUsed => write!(f, "NotUsed"),
            DhcpState::Attempt => write!(f, "Attempt"),
            DhcpState::InProgress => write!(f, "InProgress"),
            DhcpState::GotAddress => write!(f, "GotAddress"),
            DhcpState::Cleanup => write!(f, "Cleanup"),
            DhcpState::CleanupDisable => write!(f, "CleanupDisable"),
            DhcpState::Done => write!(f, "Done"),
        }
    }
}

/// What the interface has to do after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressAction {
    None,
    /// Apply the lease to the address settings and the chip
    LeaseAssigned(Lease),
    /// Deliver `GotIpAddress` to subscribers
    AnnounceAddress,
}

pub struct AddressStateMachine {
    state: DhcpState,
    engine: Box<dyn DhcpEngine>,
    slot: Option<SocketSlot>,
    last_tick_ms: u64,
}

impl AddressStateMachine {
    /// Create a machine that starts in `Attempt` (DHCP) or `NotUsed` (static)
    pub fn new(engine: Box<dyn DhcpEngine>, dhcp: bool) -> Self {
        Self {
            state: if dhcp {
                DhcpState::Attempt
            } else {
                DhcpState::NotUsed
            },
            engine,
            slot: None,
            last_tick_ms: 0,
        }
    }

    pub fn state(&self) -> DhcpState {
        self.state
    }

    /// True while the chip should be told addresses are static
    pub fn is_static(&self) -> bool {
        matches!(self.state, DhcpState::NotUsed | DhcpState::CleanupDisable)
    }

    /// Slot currently held for DHCP
    pub fn slot(&self) -> Option<SocketSlot> {
        self.slot
    }

    /// Switch to static addressing
    ///
    /// While DHCP still holds its slot the teardown is scheduled through
    /// `CleanupDisable` instead of happening here.
    pub fn use_static_ip(&mut self) {
        let next = match self.state {
            DhcpState::InProgress | DhcpState::GotAddress | DhcpState::Cleanup => {
                DhcpState::CleanupDisable
            }
            DhcpState::CleanupDisable => DhcpState::CleanupDisable,
            _ => DhcpState::NotUsed,
        };
        self.transition(next);
    }

    /// Switch to DHCP, restarting negotiation on the next step with link
    ///
    /// A slot still held from a previous negotiation is closed first.
    pub fn use_dhcp(&mut self, bus: &Bus) {
        self.teardown(bus);
        self.transition(DhcpState::Attempt);
    }

    /// Advance one polling step
    ///
    /// # Arguments
    /// * `bus` - Bus used for DHCP socket traffic
    /// * `link_up` - Link state sampled in this step
    /// * `mac` - Interface hardware address
    /// * `now_ms` - Current time
    pub fn step(&mut self, bus: &Bus, link_up: bool, mac: [u8; 6], now_ms: u64) -> AddressAction {
        let mut action = AddressAction::None;

        match self.state {
            DhcpState::Attempt => {
                if link_up {
                    log::trace!("attempting to get DHCP");
                    let engine = &mut self.engine;
                    let started = bus.transaction(|tx| -> Result<SocketSlot, NetError> {
                        let slot = tx.acquire(SlotOwner::Dhcp)?;
                        if let Err(e) = engine.start(tx, slot, mac) {
                            tx.release(slot);
                            return Err(e);
                        }
                        Ok(slot)
                    });

                    match started {
                        Ok(slot) => {
                            self.slot = Some(slot);
                            self.last_tick_ms = now_ms;
                            self.transition(DhcpState::InProgress);
                        }
                        Err(e) => {
                            log::error!("No sockets for DHCP: {}", e);
                            self.transition(DhcpState::Done);
                        }
                    }
                }
            }

            DhcpState::InProgress => {
                if now_ms.saturating_sub(self.last_tick_ms) >= DHCP_TICK_MS {
                    self.last_tick_ms = now_ms;
                    self.engine.tick();
                }

                let engine = &mut self.engine;
                if let DhcpRun::Assigned(lease) = bus.transaction(|tx| engine.run(tx)) {
                    log::trace!("ip_assign {}", lease.ip);
                    action = AddressAction::LeaseAssigned(lease);
                    self.transition(DhcpState::GotAddress);
                }

                if !link_up {
                    self.transition(DhcpState::Cleanup);
                }
            }

            DhcpState::GotAddress => {
                action = AddressAction::AnnounceAddress;
                self.transition(DhcpState::Cleanup);
            }

            DhcpState::Cleanup | DhcpState::CleanupDisable => {
                self.teardown(bus);
                let next = if self.state == DhcpState::CleanupDisable {
                    DhcpState::NotUsed
                } else {
                    DhcpState::Done
                };
                self.transition(next);
            }

            DhcpState::Done => {
                if !link_up {
                    log::trace!("lost link, will attempt to get DHCP address again");
                    self.transition(DhcpState::Attempt);
                }
            }

            DhcpState::NotUsed => {}
        }

        action
    }

    fn teardown(&mut self, bus: &Bus) {
        if let Some(slot) = self.slot.take() {
            let engine = &mut self.engine;
            bus.transaction(|tx| {
                engine.stop(tx);
                tx.release(slot);
            });
        }
    }

    fn transition(&mut self, next: DhcpState) {
        if next != self.state {
            log::trace!("DHCP state {} -> {}", self.state, next);
            self.state = next;
        }
    }
}
