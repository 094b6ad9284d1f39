//! Monitor builder.

use crate::backend::{self, VmmControl};
use crate::cpu::x86_64::{MAX_GUEST_MEMORY, PAGE_SIZE_2M};
use crate::error::{Error, Result};
use crate::hypercall::{HypercallFn, HypercallTable};
use crate::memory::GuestMemory;
use crate::monitor::Monitor;
use crate::vcpu::ExitHandlerFn;

const DEFAULT_MEMORY_SIZE: u64 = 128 << 20;

/// Builder for creating a [`Monitor`].
///
/// All hypercall handlers and exit-chain handlers are registered here;
/// the resulting tables are fixed for the life of the monitor.
///
/// # Example
///
/// ```rust,no_run
/// use unimon::{abi, Monitor};
///
/// let monitor = Monitor::builder()
///     .memory_size(64 << 20)
///     .hypercall(abi::HYPERCALL_PUTS, |_mem, _gpa| {
///         // read the parameter block, write to the console
///         Ok(())
///     })
///     .build()?;
/// # Ok::<(), unimon::Error>(())
/// ```
#[derive(Default)]
pub struct MonitorBuilder {
    memory_size: Option<u64>,
    hypercalls: Vec<(u32, HypercallFn)>,
    exit_handlers: Vec<ExitHandlerFn>,
}

impl MonitorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the guest memory size in bytes.
    ///
    /// Must be a multiple of 2 MiB and at most 1 GiB. Default: 128 MiB.
    pub fn memory_size(mut self, bytes: u64) -> Self {
        self.memory_size = Some(bytes);
        self
    }

    /// Set the guest memory size in megabytes.
    pub fn memory_mb(self, mb: u32) -> Self {
        self.memory_size((mb as u64) << 20)
    }

    /// Register a hypercall handler for `nr`.
    ///
    /// The handler receives guest memory and the guest-physical address of
    /// the parameter block, and must bounds-check every guest address it
    /// dereferences (the [`crate::memory::GuestMemory`] accessors do).
    pub fn hypercall<F>(mut self, nr: u32, handler: F) -> Self
    where
        F: FnMut(&mut GuestMemory, u64) -> Result<()> + Send + 'static,
    {
        self.hypercalls.push((nr, Box::new(handler)));
        self
    }

    /// Append a handler to the exit chain.
    ///
    /// Handlers are consulted on every VM exit in registration order,
    /// before built-in classification; the first to claim an exit wins.
    pub fn exit_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut GuestMemory, &crate::backend::VmExit) -> Result<crate::vcpu::ExitDisposition>
            + Send
            + 'static,
    {
        self.exit_handlers.push(Box::new(handler));
        self
    }

    /// Build the monitor on the platform backend.
    ///
    /// Creates the VM instance and maps its memory; fails if no hypervisor
    /// is available or any registration is invalid.
    pub fn build(self) -> Result<Monitor> {
        let mem_size = validate_memory_size(self.memory_size.unwrap_or(DEFAULT_MEMORY_SIZE))?;
        let (backend, memory) = backend::create(mem_size)?;
        self.finish(backend, memory)
    }

    /// Build the monitor on a caller-supplied backend and memory.
    ///
    /// This is the entry point for sibling backends implementing the same
    /// [`VmmControl`] contract on other host kernels, and for conformance
    /// tests running against a scripted backend.
    pub fn build_with(
        self,
        backend: Box<dyn VmmControl>,
        memory: GuestMemory,
    ) -> Result<Monitor> {
        validate_memory_size(memory.size())?;
        self.finish(backend, memory)
    }

    fn finish(self, backend: Box<dyn VmmControl>, memory: GuestMemory) -> Result<Monitor> {
        let mut table = HypercallTable::new();
        for (nr, handler) in self.hypercalls {
            table.register(nr, handler)?;
        }
        Ok(Monitor::new(backend, memory, table, self.exit_handlers))
    }
}

fn validate_memory_size(bytes: u64) -> Result<u64> {
    if bytes == 0 || bytes % PAGE_SIZE_2M != 0 || bytes > MAX_GUEST_MEMORY {
        return Err(Error::InvalidMemorySize(bytes));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockVmm;

    #[test]
    fn test_memory_size_validation() {
        assert!(validate_memory_size(0).is_err());
        assert!(validate_memory_size(0x1000).is_err());
        assert!(validate_memory_size(PAGE_SIZE_2M + 1).is_err());
        assert!(validate_memory_size(MAX_GUEST_MEMORY + PAGE_SIZE_2M).is_err());

        assert_eq!(validate_memory_size(PAGE_SIZE_2M).unwrap(), PAGE_SIZE_2M);
        assert_eq!(
            validate_memory_size(MAX_GUEST_MEMORY).unwrap(),
            MAX_GUEST_MEMORY
        );
    }

    #[test]
    fn test_build_with_rejects_odd_memory() {
        let result = MonitorBuilder::new().build_with(
            Box::new(MockVmm::new()),
            GuestMemory::anonymous(0x1234).unwrap(),
        );
        assert!(matches!(result, Err(Error::InvalidMemorySize(0x1234))));
    }

    #[test]
    fn test_duplicate_hypercall_rejected_at_build() {
        let result = MonitorBuilder::new()
            .hypercall(2, |_, _| Ok(()))
            .hypercall(2, |_, _| Ok(()))
            .build_with(
                Box::new(MockVmm::new()),
                GuestMemory::anonymous(PAGE_SIZE_2M).unwrap(),
            );
        assert!(matches!(result, Err(Error::HypercallSlotTaken(2))));
    }

    #[test]
    fn test_out_of_range_hypercall_rejected_at_build() {
        let result = MonitorBuilder::new()
            .hypercall(1000, |_, _| Ok(()))
            .build_with(
                Box::new(MockVmm::new()),
                GuestMemory::anonymous(PAGE_SIZE_2M).unwrap(),
            );
        assert!(matches!(result, Err(Error::InvalidHypercallNumber(1000))));
    }
}
