//! Software ISR registry seam.
//!
//! The dispatcher resolves interrupt numbers to handlers through the
//! [`HandlerResolver`] trait; the host platform usually owns the real
//! registry. [`IsrTable`] is a fixed-capacity implementation for hosts
//! that have none of their own. APLIC IRQ numbers and IMSIC EIDs share
//! the numeric key space of a resolver but never the same resolver
//! semantics: the caller decides which table serves which controller.

use crate::sync::SpinLock;
use crate::{Error, Result};

/// Interrupt handler function type
pub type IsrFn = fn(irq: u32, arg: usize);

/// A registered handler with its context argument
#[derive(Debug, Clone, Copy)]
pub struct IsrEntry {
    pub isr: IsrFn,
    pub arg: usize,
}

/// Handler lookup keyed by IRQ number or EID
pub trait HandlerResolver {
    fn resolve(&self, id: u32) -> Option<IsrEntry>;
}

/// Fixed-capacity ISR registry
pub struct IsrTable<const N: usize> {
    entries: SpinLock<[Option<IsrEntry>; N]>,
}

impl<const N: usize> IsrTable<N> {
    /// Create an empty table
    pub const fn new() -> Self {
        Self {
            entries: SpinLock::new([None; N]),
        }
    }

    /// Register a handler for `id`. Fails if `id` is out of range or
    /// the slot is already claimed.
    pub fn register(&self, id: u32, isr: IsrFn, arg: usize) -> Result<()> {
        let mut entries = self.entries.lock();
        let slot = entries
            .get_mut(id as usize)
            .ok_or(Error::InvalidArgument)?;
        if slot.is_some() {
            return Err(Error::InvalidArgument);
        }
        *slot = Some(IsrEntry { isr, arg });
        Ok(())
    }

    /// Remove the handler for `id`
    pub fn unregister(&self, id: u32) -> Result<()> {
        let mut entries = self.entries.lock();
        let slot = entries
            .get_mut(id as usize)
            .ok_or(Error::InvalidArgument)?;
        if slot.is_none() {
            return Err(Error::InvalidArgument);
        }
        *slot = None;
        Ok(())
    }
}

impl<const N: usize> Default for IsrTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> HandlerResolver for IsrTable<N> {
    fn resolve(&self, id: u32) -> Option<IsrEntry> {
        self.entries.lock().get(id as usize).copied().flatten()
    }
}
