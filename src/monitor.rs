//! Monitor core implementation.

use crate::backend::VmmControl;
use crate::boot;
use crate::error::{Error, Result};
use crate::hypercall::HypercallTable;
use crate::memory::{layout, GuestMemory};
use crate::vcpu::{self, ExitHandlerFn};

/// The lifecycle state of a [`Monitor`].
///
/// `Halted` and `Failed` are absorbing: once the guest has terminated,
/// cooperatively or not, the monitor is done — guest memory lives until the
/// process exits and there is no restart path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// VM instance created, memory mapped, boot state not yet programmed.
    Created,
    /// Boot environment programmed, ready to run.
    Ready,
    /// Guest executing (or suspended inside an exit).
    Running,
    /// Guest halted cooperatively.
    Halted,
    /// A fatal error occurred.
    Failed,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorState::Created => write!(f, "created"),
            MonitorState::Ready => write!(f, "ready"),
            MonitorState::Running => write!(f, "running"),
            MonitorState::Halted => write!(f, "halted"),
            MonitorState::Failed => write!(f, "failed"),
        }
    }
}

/// A unikernel monitor: one VM instance, its guest memory, and the
/// dispatch tables for guest exits.
///
/// One monitor exists per process; its memory size is fixed at creation.
/// Use [`Monitor::builder()`] to configure and create one.
///
/// # Example
///
/// ```rust,no_run
/// use unimon::Monitor;
///
/// let mut monitor = Monitor::builder()
///     .memory_size(2 << 20)
///     .build()?;
/// let cmdline_addr = monitor.initialize(0x100000, 0x150000)?;
/// monitor.set_cmdline("quiet")?;
/// monitor.run()?;
/// # Ok::<(), unimon::Error>(())
/// ```
pub struct Monitor {
    /// Host-kernel backend
    backend: Box<dyn VmmControl>,
    /// Guest physical memory, owned exclusively
    memory: GuestMemory,
    /// Hypercall dispatch table, immutable after build
    hypercalls: HypercallTable,
    /// Exit-handler chain, consulted in registration order
    exit_handlers: Vec<ExitHandlerFn>,
    /// Current lifecycle state
    state: MonitorState,
}

impl Monitor {
    /// Create a new monitor builder.
    pub fn builder() -> crate::builder::MonitorBuilder {
        crate::builder::MonitorBuilder::new()
    }

    pub(crate) fn new(
        backend: Box<dyn VmmControl>,
        memory: GuestMemory,
        hypercalls: HypercallTable,
        exit_handlers: Vec<ExitHandlerFn>,
    ) -> Self {
        Self {
            backend,
            memory,
            hypercalls,
            exit_handlers,
            state: MonitorState::Created,
        }
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Get the guest memory size in bytes.
    pub fn memory_size(&self) -> u64 {
        self.memory.size()
    }

    /// Get a reference to guest memory.
    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// Get a mutable reference to guest memory, e.g. for loading the
    /// kernel image before [`initialize`](Self::initialize).
    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.memory
    }

    /// Get the backend name (e.g. "vmm").
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn expect_state(&self, expected: MonitorState, label: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected: label,
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Build the boot environment: descriptor tables, page tables,
    /// boot-info record, registers; activates the virtual CPU. The kernel
    /// image must already be in guest memory.
    ///
    /// Returns the guest-physical address for the command line.
    pub fn initialize(&mut self, entry: u64, kernel_end: u64) -> Result<u64> {
        self.expect_state(MonitorState::Created, "created")?;
        match boot::initialize(self.backend.as_mut(), &mut self.memory, entry, kernel_end) {
            Ok(cmdline_addr) => {
                self.state = MonitorState::Ready;
                Ok(cmdline_addr)
            }
            Err(err) => {
                self.state = MonitorState::Failed;
                Err(err)
            }
        }
    }

    /// Copy the NUL-terminated command line to the address
    /// [`initialize`](Self::initialize) returned.
    pub fn set_cmdline(&mut self, cmdline: &str) -> Result<()> {
        self.expect_state(MonitorState::Ready, "ready")?;
        let bytes = cmdline.as_bytes();
        if bytes.len() + 1 > layout::CMDLINE_MAX_SIZE as usize {
            return Err(Error::CmdlineTooLong {
                len: bytes.len(),
                max: layout::CMDLINE_MAX_SIZE as usize - 1,
            });
        }
        self.memory.write(layout::CMDLINE_START, bytes)?;
        self.memory
            .write(layout::CMDLINE_START + bytes.len() as u64, &[0])
    }

    /// Run the guest until it halts.
    ///
    /// Returns `Ok(())` exactly once, on cooperative halt. Any fatal
    /// condition leaves the monitor in [`MonitorState::Failed`] and
    /// returns the error; the process is expected to report it and exit.
    pub fn run(&mut self) -> Result<()> {
        self.expect_state(MonitorState::Ready, "ready")?;
        self.state = MonitorState::Running;
        match vcpu::run_loop(
            self.backend.as_mut(),
            &mut self.memory,
            &mut self.hypercalls,
            &mut self.exit_handlers,
        ) {
            Ok(()) => {
                self.state = MonitorState::Halted;
                Ok(())
            }
            Err(err) => {
                self.state = MonitorState::Failed;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockVmm;
    use crate::backend::VmExit;

    const MEM_SIZE: u64 = 0x200000;

    fn monitor_with(backend: MockVmm) -> Monitor {
        Monitor::builder()
            .build_with(
                Box::new(backend),
                GuestMemory::anonymous(MEM_SIZE).unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let mut monitor = monitor_with(MockVmm::with_exits(vec![Ok(VmExit::Halt)]));
        assert_eq!(monitor.state(), MonitorState::Created);

        monitor.initialize(0x100000, 0x150000).unwrap();
        assert_eq!(monitor.state(), MonitorState::Ready);

        monitor.set_cmdline("console=hvc0").unwrap();
        monitor.run().unwrap();
        assert_eq!(monitor.state(), MonitorState::Halted);
    }

    #[test]
    fn test_run_requires_initialize() {
        let mut monitor = monitor_with(MockVmm::new());
        let err = monitor.run().unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_halted_is_absorbing() {
        let mut monitor = monitor_with(MockVmm::with_exits(vec![Ok(VmExit::Halt)]));
        monitor.initialize(0x100000, 0x150000).unwrap();
        monitor.run().unwrap();
        assert!(matches!(
            monitor.run().unwrap_err(),
            Error::InvalidState { .. }
        ));
    }

    #[test]
    fn test_failed_is_absorbing() {
        let mut monitor = monitor_with(MockVmm::with_exits(vec![Ok(VmExit::Other {
            code: 3,
            rip: 0,
        })]));
        monitor.initialize(0x100000, 0x150000).unwrap();
        monitor.run().unwrap_err();
        assert_eq!(monitor.state(), MonitorState::Failed);
        assert!(matches!(
            monitor.run().unwrap_err(),
            Error::InvalidState { .. }
        ));
    }

    #[test]
    fn test_cmdline_written_at_returned_address() {
        let mut monitor = monitor_with(MockVmm::new());
        let addr = monitor.initialize(0x100000, 0x150000).unwrap();
        monitor.set_cmdline("quiet").unwrap();

        let mut buf = [0u8; 6];
        monitor.memory().read(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"quiet\0");
    }

    #[test]
    fn test_cmdline_requires_initialize() {
        let mut monitor = monitor_with(MockVmm::new());
        assert!(matches!(
            monitor.set_cmdline("x").unwrap_err(),
            Error::InvalidState { .. }
        ));
    }

    #[test]
    fn test_cmdline_length_limit() {
        let mut monitor = monitor_with(MockVmm::new());
        monitor.initialize(0x100000, 0x150000).unwrap();

        let max = layout::CMDLINE_MAX_SIZE as usize - 1;
        monitor.set_cmdline(&"a".repeat(max)).unwrap();
        assert!(matches!(
            monitor.set_cmdline(&"a".repeat(max + 1)).unwrap_err(),
            Error::CmdlineTooLong { .. }
        ));
    }
}
