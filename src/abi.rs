//! Guest-facing ABI.
//!
//! The contract between the monitor and the kernel image it boots: the
//! boot-info record handed to the entry point, and the hypercall numbering
//! plus parameter-block layouts used over the reserved port range. All
//! structures have a fixed `#[repr(C)]` layout and are serialized
//! little-endian, field by field, so the bytes in guest memory never depend
//! on the host compiler.
//!
//! Implementations of the guest side of this ABI live out of tree.

/// Read the host wall clock; parameter block [`WalltimeParams`].
pub const HYPERCALL_WALLTIME: u32 = 1;
/// Write bytes to the console; parameter block [`PutsParams`].
pub const HYPERCALL_PUTS: u32 = 2;
/// Yield until a deadline; parameter block [`PollParams`].
pub const HYPERCALL_POLL: u32 = 3;
/// Block device info/write/read.
pub const HYPERCALL_BLKINFO: u32 = 4;
pub const HYPERCALL_BLKWRITE: u32 = 5;
pub const HYPERCALL_BLKREAD: u32 = 6;
/// Network device info/write/read.
pub const HYPERCALL_NETINFO: u32 = 7;
pub const HYPERCALL_NETWRITE: u32 = 8;
pub const HYPERCALL_NETREAD: u32 = 9;
/// Guest requests termination; parameter block [`HaltParams`].
pub const HYPERCALL_HALT: u32 = 10;

/// Boot-info record, written once by the monitor before the first guest
/// instruction and read once by the guest at startup.
///
/// Its guest-physical address is passed to the entry point in the first
/// argument register.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    /// Total guest memory size in bytes.
    pub mem_size: u64,
    /// First byte past the loaded kernel image.
    pub kernel_end: u64,
    /// Guest-physical address of the NUL-terminated command line.
    pub cmdline: u64,
    /// Host timestamp-counter frequency in Hz (the counter is guaranteed
    /// invariant; the monitor refuses to boot otherwise).
    pub tsc_freq: u64,
}

impl BootInfo {
    pub const SIZE: usize = 32;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.mem_size.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.kernel_end.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.cmdline.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.tsc_freq.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let u64_at = |i: usize| u64::from_le_bytes(bytes[i..i + 8].try_into().unwrap());
        Self {
            mem_size: u64_at(0),
            kernel_end: u64_at(8),
            cmdline: u64_at(16),
            tsc_freq: u64_at(24),
        }
    }
}

/// Parameters for [`HYPERCALL_WALLTIME`]; filled in by the monitor.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalltimeParams {
    /// Wall-clock time in nanoseconds since the Unix epoch.
    pub nsecs: u64,
}

impl WalltimeParams {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.nsecs.to_le_bytes()
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            nsecs: u64::from_le_bytes(*bytes),
        }
    }
}

/// Parameters for [`HYPERCALL_PUTS`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutsParams {
    /// Guest-physical address of the data to write.
    pub data: u64,
    /// Length in bytes.
    pub len: u64,
}

impl PutsParams {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.data.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.len.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            data: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            len: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        }
    }
}

/// Parameters for [`HYPERCALL_POLL`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollParams {
    /// Deadline, nanoseconds of monotonic time.
    pub timeout_nsecs: u64,
    /// Set by the monitor: non-zero if input is ready.
    pub ready: u64,
}

impl PollParams {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.timeout_nsecs.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.ready.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            timeout_nsecs: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            ready: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        }
    }
}

/// Parameters for [`HYPERCALL_HALT`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaltParams {
    /// Opaque guest cookie, passed through to the embedder's handler.
    pub cookie: u64,
    /// Guest exit status.
    pub exit_status: u64,
}

impl HaltParams {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.cookie.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.exit_status.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            cookie: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            exit_status: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        }
    }
}
