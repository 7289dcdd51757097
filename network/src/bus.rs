// Bus transaction lock
//
// One lock guards the chip driver and the slot table together. Every chip
// access from the polling loop or from caller contexts goes through
// Bus::transaction.

use alloc::boxed::Box;
use spin::Mutex;

use crate::drivers::ChipDriver;
use crate::error::NetError;
use crate::slots::{SlotOwner, SocketAllocator, SocketSlot};

struct BusState {
    chip: Box<dyn ChipDriver>,
    slots: SocketAllocator,
}

/// Serialized access to the Ethernet controller
pub struct Bus {
    inner: Mutex<BusState>,
}

/// Access granted for the duration of one bus transaction
pub struct Transaction<'a> {
    chip: &'a mut dyn ChipDriver,
    slots: &'a mut SocketAllocator,
}

impl Bus {
    pub fn new(chip: Box<dyn ChipDriver>) -> Self {
        Self {
            inner: Mutex::new(BusState {
                chip,
                slots: SocketAllocator::new(),
            }),
        }
    }

    /// Run `f` with exclusive access to the chip and the slot table
    ///
    /// Never sleep inside `f`; poll loops release the bus between attempts.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let mut tx = Transaction {
            chip: state.chip.as_mut(),
            slots: &mut state.slots,
        };
        f(&mut tx)
    }
}

impl<'a> Transaction<'a> {
    pub fn chip(&mut self) -> &mut dyn ChipDriver {
        &mut *self.chip
    }

    /// Claim a free slot for `owner`
    ///
    /// # Returns
    /// * `Ok(slot)` - Slot claimed
    /// * `Err(NetError::NoFreeSocket)` - All slots are in use
    pub fn acquire(&mut self, owner: SlotOwner) -> Result<SocketSlot, NetError> {
        match self.slots.acquire(&mut *self.chip, owner) {
            Some(slot) => Ok(slot),
            None => {
                log::error!("No free socket for {}", owner);
                Err(NetError::NoFreeSocket)
            }
        }
    }

    pub fn release(&mut self, slot: SocketSlot) {
        self.slots.release(slot);
    }

    pub fn reassign(&mut self, slot: SocketSlot, owner: SlotOwner) {
        self.slots.reassign(slot, owner);
    }

    pub fn allocated(&self) -> usize {
        self.slots.allocated()
    }

    /// Close a slot on the chip and return it to the pool
    pub fn close_and_release(&mut self, slot: SocketSlot) {
        if let Err(e) = self.chip.close(slot) {
            log::trace!("close {} failed: {}", slot, e);
        }
        self.slots.release(slot);
    }
}
