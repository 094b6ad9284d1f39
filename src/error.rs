//! Error types for unimon.
//!
//! The monitor core has exactly two outcomes: success, or a fatal error that
//! the embedding process is expected to report and exit on. There is no
//! soft-recoverable class in between; a mismatch between expected and
//! observed guest or host state is a trust violation, not a transient
//! condition. The two tolerated exceptions ([`Error::Interrupted`] and a
//! failed best-effort destroy of a stale VM instance) never escape the
//! library.

use thiserror::Error;

/// Result type alias using unimon's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating the monitor.
#[derive(Error, Debug)]
pub enum Error {
    // Platform/hypervisor errors
    #[error("hypervisor not available on this platform")]
    HypervisorNotAvailable,

    #[error("hypervisor error: {0}")]
    HypervisorError(String),

    #[error("host TSC is not invariant, cannot continue")]
    TscNotInvariant,

    // Configuration errors
    #[error("invalid memory size: {0:#x} (must be a multiple of 2 MiB, at most 1 GiB)")]
    InvalidMemorySize(u64),

    #[error("hypercall number out of range: {0}")]
    InvalidHypercallNumber(u32),

    #[error("hypercall {0} already registered")]
    HypercallSlotTaken(u32),

    #[error("command line too long: {len} bytes (limit {max})")]
    CmdlineTooLong { len: usize, max: usize },

    // Lifecycle errors
    #[error("monitor not in expected state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    // Guest-triggered fatal errors
    #[error("invalid guest address: {gpa:#x}+{len:#x}")]
    InvalidGuestAddress { gpa: u64, len: u64 },

    #[error("invalid guest port access: port={port:#x} bytes={bytes} in={is_in}")]
    InvalidPortAccess { port: u16, bytes: u8, is_in: bool },

    #[error("invalid guest hypercall: num={0}")]
    UnknownHypercall(u32),

    #[error("bogus exit with non-zero instruction length: len={inst_length} rip={rip:#x}")]
    BogusExit { inst_length: u32, rip: u64 },

    #[error(
        "virtualization failure: status={status} reason={reason} \
         qualification={qualification:#x} rip={rip:#x}"
    )]
    VirtFailure {
        status: i32,
        reason: u32,
        qualification: u64,
        inst_type: i32,
        inst_error: i32,
        rip: u64,
    },

    #[error("unhandled vm exit: exitcode={code}, rip={rip:#x}")]
    UnhandledExit { code: i32, rip: u64 },

    // Run-primitive interruption, retried transparently by the run loop
    #[error("run interrupted by signal")]
    Interrupted,

    // Memory errors
    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Platform-specific errors
    #[cfg(target_os = "freebsd")]
    #[error("vmm control operation {op} failed: {source}")]
    VmmControlFailed {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}
