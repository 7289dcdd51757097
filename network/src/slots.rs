// Hardware socket slot table
//
// The controller exposes NUM_SOCKETS slots. Each slot is claimed by exactly
// one consumer at a time; a claim is only granted when the chip reports the
// slot as Closed.

use core::fmt;

use crate::drivers::{ChipDriver, SocketStatus, NUM_SOCKETS};

/// Index of one hardware socket slot (0..NUM_SOCKETS)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketSlot(u8);

impl SocketSlot {
    /// Wrap a raw index, rejecting out-of-range values
    pub fn new(index: usize) -> Option<Self> {
        if index < NUM_SOCKETS {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SocketSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket {}", self.0)
    }
}

/// Consumer holding a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOwner {
    Dhcp,
    Dns,
    Stream,
    Listener,
    Datagram,
}

impl fmt::Display for SlotOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotOwner::Dhcp => write!(f, "DHCP"),
            SlotOwner::Dns => write!(f, "DNS"),
            SlotOwner::Stream => write!(f, "TCP client"),
            SlotOwner::Listener => write!(f, "TCP server"),
            SlotOwner::Datagram => write!(f, "UDP"),
        }
    }
}

/// Ownership table for the hardware slots
///
/// Must only be used while holding the bus transaction lock, since
/// [`SocketAllocator::acquire`] reads live status registers.
#[derive(Debug, Default)]
pub struct SocketAllocator {
    owners: [Option<SlotOwner>; NUM_SOCKETS],
}

impl SocketAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the lowest unowned slot that the chip reports as Closed
    ///
    /// # Returns
    /// * `Some(slot)` - Slot now owned by `owner`
    /// * `None` - Every slot is owned or still in use on the chip
    pub fn acquire(&mut self, chip: &mut dyn ChipDriver, owner: SlotOwner) -> Option<SocketSlot> {
        for (index, entry) in self.owners.iter_mut().enumerate() {
            if entry.is_some() {
                continue;
            }
            let slot = SocketSlot(index as u8);
            if chip.status(slot) == SocketStatus::Closed {
                *entry = Some(owner);
                log::trace!("{} claimed {}", owner, slot);
                return Some(slot);
            }
        }
        None
    }

    /// Return a slot to the free pool
    pub fn release(&mut self, slot: SocketSlot) {
        if let Some(owner) = self.owners[slot.index()].take() {
            log::trace!("{} released {}", owner, slot);
        }
    }

    /// Hand a held slot to a new owner (listener slot becoming a connection)
    pub fn reassign(&mut self, slot: SocketSlot, owner: SlotOwner) {
        if let Some(entry) = self.owners[slot.index()].as_mut() {
            *entry = owner;
        }
    }

    pub fn owner(&self, slot: SocketSlot) -> Option<SlotOwner> {
        self.owners[slot.index()]
    }

    /// Number of slots currently claimed
    pub fn allocated(&self) -> usize {
        self.owners.iter().filter(|entry| entry.is_some()).count()
    }
}
