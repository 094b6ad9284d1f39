//! Hypercall dispatch.
//!
//! Hypercalls are port writes: one port per hypercall number in a reserved
//! contiguous range, and the 32-bit data value is the guest-physical
//! address of a parameter block. The table mapping numbers to handlers is
//! assembled once by [`crate::MonitorBuilder`] and immutable while the
//! guest runs.

use log::error;

use crate::error::{Error, Result};
use crate::memory::GuestMemory;

/// First port of the reserved hypercall range.
pub const HYPERCALL_PIO_BASE: u16 = 0x500;

/// Number of hypercall slots (and ports) in the range.
pub const HYPERCALL_MAX: usize = 32;

/// A hypercall handler.
///
/// Receives guest memory and the raw guest-physical parameter-block
/// address. The dispatcher does not validate that address; a handler must
/// perform every guest-memory access through the bounds-checked
/// [`GuestMemory`] accessors and treat a range error as fatal.
pub type HypercallFn = Box<dyn FnMut(&mut GuestMemory, u64) -> Result<()> + Send>;

/// The port for a hypercall number.
pub fn port_for(nr: u32) -> u16 {
    HYPERCALL_PIO_BASE + nr as u16
}

/// Fixed table of hypercall handlers, indexed by hypercall number.
pub struct HypercallTable {
    slots: Vec<Option<HypercallFn>>,
}

impl HypercallTable {
    pub(crate) fn new() -> Self {
        let mut slots = Vec::with_capacity(HYPERCALL_MAX);
        slots.resize_with(HYPERCALL_MAX, || None);
        Self { slots }
    }

    /// Register a handler. Fails on an out-of-range number or an occupied
    /// slot; registration order is irrelevant because numbers are the only
    /// key.
    pub(crate) fn register(&mut self, nr: u32, handler: HypercallFn) -> Result<()> {
        let slot = self
            .slots
            .get_mut(nr as usize)
            .ok_or(Error::InvalidHypercallNumber(nr))?;
        if slot.is_some() {
            return Err(Error::HypercallSlotTaken(nr));
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Whether a handler is registered for `nr`.
    pub fn contains(&self, nr: u32) -> bool {
        matches!(self.slots.get(nr as usize), Some(Some(_)))
    }

    /// Invoke the handler for `nr` with the guest-supplied parameter-block
    /// address. A missing handler is fatal: the guest invoked a hypercall
    /// this monitor never offered.
    pub(crate) fn dispatch(
        &mut self,
        mem: &mut GuestMemory,
        nr: u32,
        gpa: u64,
    ) -> Result<()> {
        match self.slots.get_mut(nr as usize) {
            Some(Some(handler)) => handler(mem, gpa),
            _ => {
                error!("invalid guest hypercall: num={nr}");
                Err(Error::UnknownHypercall(nr))
            }
        }
    }
}
