//! Hypervisor backend abstraction.
//!
//! This module defines the trait every host-kernel backend must implement —
//! the small set of privileged operations a monitor needs from its kernel's
//! virtualization interface — and selects the backend for the current
//! platform. The run loop and boot builder are written once against the
//! trait; a backend for another host kernel only has to provide these
//! operations with matching semantics.

use crate::cpu::x86_64::{Register, Segment, SegmentDescriptor};
use crate::error::Result;
use crate::memory::GuestMemory;

#[cfg(target_os = "freebsd")]
pub mod vmm;

#[cfg(test)]
pub(crate) mod mock;

/// Host CPU facts the boot builder needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCpuInfo {
    /// Timestamp-counter frequency in Hz.
    pub tsc_freq: u64,
    /// Whether the counter ticks at that rate independent of power state.
    /// Guest timekeeping is built on this; a non-invariant counter is a
    /// fatal configuration.
    pub invariant_tsc: bool,
}

/// A decoded VM exit, as reported by [`VmmControl::run`].
///
/// Backends translate their host-specific exit encoding into this enum;
/// classification of what each exit *means* stays in the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    /// The guest halted the virtual CPU; a cooperative, clean exit.
    Halt,
    /// Port I/O access.
    Io {
        port: u16,
        /// True for an in (read) access, false for out (write).
        is_in: bool,
        /// Access width in bytes (1, 2 or 4).
        bytes: u8,
        /// Data value of an out access.
        value: u32,
        rip: u64,
    },
    /// An exit carrying no information, reported by some hosts under
    /// instruction-restart races. Harmless only at zero instruction length.
    Bogus { inst_length: u32, rip: u64 },
    /// The virtualization layer itself failed.
    VirtFailure {
        status: i32,
        reason: u32,
        qualification: u64,
        inst_type: i32,
        inst_error: i32,
        rip: u64,
    },
    /// Any exit reason the backend does not model.
    Other { code: i32, rip: u64 },
}

/// Privileged host-kernel VM control operations.
///
/// One implementation exists per host kernel. Creation and memory setup are
/// backend constructors (see [`create`]); everything after that goes through
/// this trait. Instance teardown is the implementation's `Drop` and is
/// best-effort only.
pub trait VmmControl: Send {
    /// Set a virtual-CPU register.
    fn set_register(&mut self, reg: Register, value: u64) -> Result<()>;

    /// Read back a virtual-CPU register.
    fn get_register(&mut self, reg: Register) -> Result<u64>;

    /// Program a segment register: descriptor state plus selector.
    fn set_segment(&mut self, seg: Segment, desc: &SegmentDescriptor) -> Result<()>;

    /// Program the GDTR base and limit.
    fn set_gdt(&mut self, base: u64, limit: u32) -> Result<()>;

    /// Activate the single virtual CPU. Called exactly once, after all
    /// register state is programmed.
    fn activate_vcpu(&mut self) -> Result<()>;

    /// Run the virtual CPU until the next exit.
    ///
    /// Blocks the calling thread; the guest is fully suspended whenever
    /// this returns. Returns [`crate::Error::Interrupted`] when a benign
    /// host signal cut the run short — the caller retries. Every other
    /// error is fatal.
    fn run(&mut self) -> Result<VmExit>;

    /// Query host CPU facts (see [`HostCpuInfo`]).
    fn host_cpu_info(&self) -> Result<HostCpuInfo>;

    /// Backend name (e.g. "vmm").
    fn name(&self) -> &'static str;
}

/// Check if a hypervisor backend is available on this platform.
pub fn is_available() -> bool {
    #[cfg(target_os = "freebsd")]
    {
        vmm::is_available()
    }

    #[cfg(not(target_os = "freebsd"))]
    {
        false
    }
}

/// Get the name of the backend for this platform.
pub fn name() -> Option<&'static str> {
    #[cfg(target_os = "freebsd")]
    {
        Some("vmm")
    }

    #[cfg(not(target_os = "freebsd"))]
    {
        None
    }
}

/// Create the platform backend: a fresh, isolated VM instance with
/// `mem_size` bytes of guest memory mapped both into the guest's physical
/// address space at 0 and into the monitor as the returned [`GuestMemory`].
pub fn create(mem_size: u64) -> Result<(Box<dyn VmmControl>, GuestMemory)> {
    #[cfg(target_os = "freebsd")]
    {
        let (backend, memory) = vmm::VmmBackend::create(mem_size)?;
        Ok((Box::new(backend) as Box<dyn VmmControl>, memory))
    }

    #[cfg(not(target_os = "freebsd"))]
    {
        let _ = mem_size;
        Err(crate::error::Error::HypervisorNotAvailable)
    }
}
