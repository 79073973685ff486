//! Single-slot completion mailbox
//!
//! Drivers post from interrupt or callback context; the owning state machine
//! takes the message on its next pass. A second post before the take
//! replaces the first one.

use core::cell::RefCell;
use critical_section::Mutex;

pub struct Mailbox<T> {
    slot: Mutex<RefCell<Option<T>>>,
}

impl<T> Mailbox<T> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(RefCell::new(None)),
        }
    }

    /// Producer side
    pub fn post(&self, message: T) {
        critical_section::with(|cs| {
            self.slot.borrow_ref_mut(cs).replace(message);
        });
    }

    /// Consumer side
    pub fn take(&self) -> Option<T> {
        critical_section::with(|cs| self.slot.borrow_ref_mut(cs).take())
    }

    pub fn is_empty(&self) -> bool {
        critical_section::with(|cs| self.slot.borrow_ref(cs).is_none())
    }

    /// Drop any stale message before a new request is issued
    pub fn clear(&self) {
        let _ = self.take();
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
