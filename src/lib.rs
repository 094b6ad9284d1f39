//! # unimon
//!
//! An embeddable unikernel monitor for Rust: boots a single-vCPU x86_64
//! kernel image directly in 64-bit long mode and services its hypercalls
//! over a reserved port range, treating the guest as untrusted input.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use unimon::{Monitor, Result};
//!
//! fn main() -> Result<()> {
//!     let mut monitor = Monitor::builder()
//!         .memory_size(128 << 20)
//!         .build()?;
//!
//!     // load the kernel image into monitor.memory_mut(), then:
//!     let cmdline_addr = monitor.initialize(0x100000, 0x150000)?;
//!     monitor.set_cmdline("")?;
//!     monitor.run()
//! }
//! ```
//!
//! ## Platform Support
//!
//! - **FreeBSD**: vmm(4), the bhyve hypervisor
//!
//! Backends for other host kernels implement the [`backend::VmmControl`]
//! trait and enter through [`MonitorBuilder::build_with`].

mod boot;
mod builder;
mod error;
mod monitor;

pub mod abi;
pub mod backend;
pub mod cpu;
pub mod hypercall;
pub mod memory;
pub mod vcpu;

// Re-exports
pub use builder::MonitorBuilder;
pub use error::{Error, Result};
pub use hypercall::{HYPERCALL_MAX, HYPERCALL_PIO_BASE};
pub use monitor::{Monitor, MonitorState};
pub use vcpu::ExitDisposition;

/// Check if the current platform supports hardware virtualization.
///
/// Returns `true` if the hypervisor is available and can be used.
pub fn is_supported() -> bool {
    backend::is_available()
}

/// Get the name of the hypervisor backend for the current platform.
///
/// Returns `None` if no backend is available.
pub fn backend_name() -> Option<&'static str> {
    backend::name()
}
