//! The virtual-CPU run loop.
//!
//! Runs the guest until it traps, faults or halts, then classifies the
//! exit. The guest is untrusted input: every exit is either claimed by a
//! registered exit handler, classified as one of the known-benign cases, or
//! fatal. Nothing is silently ignored.

use log::{debug, error};

use crate::backend::{VmExit, VmmControl};
use crate::error::{Error, Result};
use crate::hypercall::{HypercallTable, HYPERCALL_MAX, HYPERCALL_PIO_BASE};
use crate::memory::GuestMemory;

/// Outcome of one exit-chain handler.
///
/// Together with a handler error this forms the tri-state chain contract:
/// claimed (stop consulting, resume the guest), not claimed (ask the next
/// handler, then built-in classification), or fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// The handler consumed the exit; resume the guest.
    Claimed,
    /// Not this handler's exit.
    NotClaimed,
}

/// An exit-chain handler, consulted before built-in classification in
/// registration order; the first claim wins.
pub type ExitHandlerFn =
    Box<dyn FnMut(&mut GuestMemory, &VmExit) -> Result<ExitDisposition> + Send>;

/// Run the guest to completion.
///
/// Returns `Ok(())` exactly once, when the guest halts cooperatively.
/// Every other way out is a fatal error. The run primitive is retried
/// transparently when interrupted by a benign host signal.
pub(crate) fn run_loop(
    backend: &mut dyn VmmControl,
    memory: &mut GuestMemory,
    hypercalls: &mut HypercallTable,
    handlers: &mut [ExitHandlerFn],
) -> Result<()> {
    loop {
        let exit = match backend.run() {
            Ok(exit) => exit,
            Err(Error::Interrupted) => continue,
            Err(err) => {
                error!("run primitive failed: {err}");
                return Err(err);
            }
        };

        // Registered handlers see every exit first, in fixed order.
        let mut claimed = false;
        for handler in handlers.iter_mut() {
            match handler(memory, &exit) {
                Ok(ExitDisposition::Claimed) => {
                    claimed = true;
                    break;
                }
                Ok(ExitDisposition::NotClaimed) => {}
                Err(err) => {
                    error!("exit handler failed on {exit:?}: {err}");
                    return Err(err);
                }
            }
        }
        if claimed {
            continue;
        }

        match exit {
            VmExit::Halt => {
                debug!("guest halted");
                return Ok(());
            }

            VmExit::Io {
                port,
                is_in,
                bytes,
                value,
                rip,
            } => {
                // A hypercall is exactly a 4-byte write to an in-range
                // port; anything else is a faulty or malicious guest.
                if is_in || bytes != 4 {
                    error!("invalid guest port access: port={port:#x} bytes={bytes} in={is_in} rip={rip:#x}");
                    return Err(Error::InvalidPortAccess { port, bytes, is_in });
                }
                let in_range = (HYPERCALL_PIO_BASE..HYPERCALL_PIO_BASE + HYPERCALL_MAX as u16)
                    .contains(&port);
                if !in_range {
                    error!("invalid guest port access: port={port:#x} rip={rip:#x}");
                    return Err(Error::InvalidPortAccess { port, bytes, is_in });
                }
                let nr = (port - HYPERCALL_PIO_BASE) as u32;
                if let Err(err) = hypercalls.dispatch(memory, nr, value as u64) {
                    error!("hypercall {nr} failed: {err}");
                    return Err(err);
                }
            }

            // No information, nothing executed; resume. A non-zero
            // instruction length contradicts that and is not ignorable.
            VmExit::Bogus { inst_length: 0, .. } => {}
            VmExit::Bogus { inst_length, rip } => {
                error!("bogus exit with inst_length={inst_length} rip={rip:#x}");
                return Err(Error::BogusExit { inst_length, rip });
            }

            VmExit::VirtFailure {
                status,
                reason,
                qualification,
                inst_type,
                inst_error,
                rip,
            } => {
                error!("virtualization failure:");
                error!("\trip\t\t{rip:#018x}");
                error!("\tstatus\t\t{status}");
                error!("\texit_reason\t{reason}");
                error!("\tqualification\t{qualification:#018x}");
                error!("\tinst_type\t{inst_type}");
                error!("\tinst_error\t{inst_error}");
                return Err(Error::VirtFailure {
                    status,
                    reason,
                    qualification,
                    inst_type,
                    inst_error,
                    rip,
                });
            }

            VmExit::Other { code, rip } => {
                error!("unhandled exit: exitcode={code}, rip={rip:#x}");
                return Err(Error::UnhandledExit { code, rip });
            }
        }
    }
}
