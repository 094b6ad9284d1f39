//! Guest memory for the monitor.
//!
//! One contiguous region, guest-physical base 0, allocated once at monitor
//! creation and owned exclusively by the monitor for the process lifetime.

mod guest;

pub use guest::GuestMemory;

/// Boot-time guest-physical layout.
///
/// Everything the monitor writes before the first guest instruction lives
/// below [`layout::GUEST_MIN_BASE`]; the kernel image is loaded at or above
/// it.
pub mod layout {
    /// Global descriptor table.
    pub const BOOT_GDT_START: u64 = 0x1000;

    /// Page map level 4 (the CR3 target).
    pub const BOOT_PML4_START: u64 = 0x2000;

    /// Page directory pointer table.
    pub const BOOT_PDPTE_START: u64 = 0x3000;

    /// Page directory, one page of 2 MiB mappings.
    pub const BOOT_PDE_START: u64 = 0x4000;

    /// Boot-info record, passed to the guest entry point in its first
    /// argument register.
    pub const BOOT_INFO_START: u64 = 0x5000;

    /// Command-line string, NUL-terminated.
    pub const CMDLINE_START: u64 = 0x6000;
    pub const CMDLINE_MAX_SIZE: u64 = 0x2000;

    /// Lowest address a kernel image may occupy (1 MiB).
    pub const GUEST_MIN_BASE: u64 = 0x100000;
}
