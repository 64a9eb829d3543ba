//! Lifecycle and slot ownership of cards.
//!
//! A [`Registry`] owns a fixed table of card slots and the worker that completes acquisitions for
//! all of its cards. Backends create a card when they find a board, register it once they know
//! what the board can do, and free it when the board goes away.

use crate::{
    backend::Backend,
    card::{Card, Contract},
    error::{Error, Result},
    workqueue::Workqueue,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Number of card slots in a registry
pub const MAX_DEVICES: usize = 32;

/// Which slot [`Registry::create`] should use
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Slot {
    /// The first free slot
    Auto,
    Index(usize),
}

#[derive(Debug)]
pub struct Registry {
    slots: Mutex<[Option<Arc<Card>>; MAX_DEVICES]>,
    workqueue: Workqueue,
}

impl Registry {
    /// Builds an empty registry and starts its completion worker
    /// # Errors
    /// Returns an error if the worker thread can't be started
    pub fn new() -> Result<Self> {
        let workqueue = Workqueue::spawn().map_err(|e| {
            warn!("Cannot start the completion worker: {e}");
            Error::OutOfMemory
        })?;
        Ok(Self {
            slots: Mutex::new(std::array::from_fn(|_| None)),
            workqueue,
        })
    }

    fn slots(&self) -> MutexGuard<'_, [Option<Arc<Card>>; MAX_DEVICES]> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims a slot and builds an unregistered card around `backend`
    /// # Errors
    /// Returns an error if the requested slot is out of range or taken, or there are no free
    /// slots left
    pub fn create(&self, slot: Slot, backend: Arc<dyn Backend>) -> Result<Arc<Card>> {
        let mut slots = self.slots();
        let index = match slot {
            Slot::Auto => slots
                .iter()
                .position(Option::is_none)
                .ok_or(Error::NoSlotsAvailable)?,
            Slot::Index(i) if i >= MAX_DEVICES => {
                return Err(Error::invalid(format!(
                    "card index {i} out of range, there are {MAX_DEVICES} slots"
                )));
            }
            Slot::Index(i) if slots[i].is_some() => return Err(Error::AlreadyInUse(i)),
            Slot::Index(i) => i,
        };
        let card = Card::new(index, backend, self.workqueue.sender());
        slots[index] = Some(Arc::clone(&card));
        debug!(card = index, "Created card");
        Ok(card)
    }

    /// Validates the backend's declared capabilities, applies the default configuration and opens
    /// the card's control requests
    /// # Errors
    /// Returns an error on an inconsistent contract or when a backend hook fails
    pub fn register(&self, card: &Card, contract: Contract) -> Result<()> {
        card.register(contract)
    }

    /// Closes the card and gives its slot back. Freeing a card twice, or one that was never
    /// registered, does nothing more than releasing the slot.
    pub fn free(&self, card: &Arc<Card>) {
        card.unregister();
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(card.index()) {
            if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, card)) {
                *slot = None;
                info!(card = card.index(), "Freed card slot");
            }
        }
    }

    /// The card in slot `index`, if any
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Arc<Card>> {
        self.slots().get(index).cloned().flatten()
    }

    /// Number of slots in use
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots().iter().filter(|s| s.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
