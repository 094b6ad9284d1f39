//! Boot environment construction.
//!
//! Puts a fresh virtual CPU directly into 64-bit long mode per the flat
//! boot protocol: descriptor tables and identity page tables in low guest
//! memory, a boot-info record for the guest entry point, and register state
//! programmed through the backend. Runs once, before the first guest
//! instruction; everything written here is immutable afterwards.

use log::{debug, error};

use crate::abi::BootInfo;
use crate::backend::VmmControl;
use crate::cpu::x86_64::{
    self, Register, Segment, SegmentDescriptor, CR0_BOOT, CR4_BOOT, EFER_BOOT, GDT_LIMIT,
    RFLAGS_BOOT,
};
use crate::error::{Error, Result};
use crate::memory::{layout, GuestMemory};

/// Build the boot environment.
///
/// `entry` is the guest-physical entry point, `kernel_end` the first byte
/// past the loaded image. Returns the guest-physical address where the
/// command line must be copied. Fails before touching any state if the
/// host timestamp counter is unusable for guest timekeeping.
pub(crate) fn initialize(
    backend: &mut dyn VmmControl,
    memory: &mut GuestMemory,
    entry: u64,
    kernel_end: u64,
) -> Result<u64> {
    let mem_size = memory.size();
    if entry < layout::GUEST_MIN_BASE || entry >= mem_size {
        return Err(Error::InvalidGuestAddress { gpa: entry, len: 0 });
    }
    if kernel_end < entry || kernel_end > mem_size {
        return Err(Error::InvalidGuestAddress {
            gpa: kernel_end,
            len: 0,
        });
    }

    // Guest timekeeping is derived from the TSC; a non-invariant counter
    // would drift with host power management. Hard requirement.
    let cpu_info = backend.host_cpu_info()?;
    if !cpu_info.invariant_tsc {
        error!("host TSC is not invariant, cannot continue");
        return Err(Error::TscNotInvariant);
    }

    x86_64::write_gdt(memory)?;
    x86_64::write_boot_page_tables(memory)?;

    let boot_info = BootInfo {
        mem_size,
        kernel_end,
        cmdline: layout::CMDLINE_START,
        tsc_freq: cpu_info.tsc_freq,
    };
    memory.write(layout::BOOT_INFO_START, &boot_info.to_bytes())?;

    backend.set_register(Register::Cr0, CR0_BOOT)?;
    backend.set_register(Register::Cr3, layout::BOOT_PML4_START)?;
    backend.set_register(Register::Cr4, CR4_BOOT)?;
    backend.set_register(Register::Efer, EFER_BOOT)?;

    backend.set_segment(Segment::Cs, &SegmentDescriptor::CODE)?;
    backend.set_segment(Segment::Ss, &SegmentDescriptor::DATA)?;
    backend.set_segment(Segment::Ds, &SegmentDescriptor::DATA)?;
    backend.set_segment(Segment::Es, &SegmentDescriptor::DATA)?;
    backend.set_segment(Segment::Fs, &SegmentDescriptor::DATA)?;
    backend.set_segment(Segment::Gs, &SegmentDescriptor::DATA)?;

    backend.set_gdt(layout::BOOT_GDT_START, GDT_LIMIT)?;
    backend.set_segment(Segment::Tr, &SegmentDescriptor::TSS)?;
    backend.set_segment(Segment::Ldtr, &SegmentDescriptor::UNUSABLE)?;

    backend.set_register(Register::Rip, entry)?;
    backend.set_register(Register::Rflags, RFLAGS_BOOT)?;
    // Word-aligned reserve for a null return address.
    backend.set_register(Register::Rsp, mem_size - 8)?;
    // First argument of the entry point: the boot-info record.
    backend.set_register(Register::Rdi, layout::BOOT_INFO_START)?;

    backend.activate_vcpu()?;

    debug!(
        "boot environment ready: entry={entry:#x} kernel_end={kernel_end:#x} mem_size={mem_size:#x}"
    );
    Ok(layout::CMDLINE_START)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, MockVmm};
    use crate::backend::HostCpuInfo;

    const MEM_SIZE: u64 = 0x200000;
    const ENTRY: u64 = 0x100000;
    const KERNEL_END: u64 = 0x150000;

    fn init(backend: &mut MockVmm, memory: &mut GuestMemory) -> Result<u64> {
        initialize(backend, memory, ENTRY, KERNEL_END)
    }

    fn last_write(log: &[Call], reg: Register) -> Option<u64> {
        log.iter().rev().find_map(|c| match c {
            Call::SetRegister(r, v) if *r == reg => Some(*v),
            _ => None,
        })
    }

    #[test]
    fn test_scenario_register_state() {
        let mut backend = MockVmm::new();
        let mut memory = GuestMemory::anonymous(MEM_SIZE).unwrap();
        let cmdline = init(&mut backend, &mut memory).unwrap();
        assert_eq!(cmdline, layout::CMDLINE_START);

        let log = backend.log.lock().unwrap().clone();
        assert_eq!(last_write(&log, Register::Rip), Some(0x100000));
        assert_eq!(last_write(&log, Register::Rsp), Some(0x1FFFF8));
        assert_eq!(last_write(&log, Register::Rdi), Some(layout::BOOT_INFO_START));
        assert_eq!(last_write(&log, Register::Cr0), Some(CR0_BOOT));
        assert_eq!(last_write(&log, Register::Cr3), Some(layout::BOOT_PML4_START));
        assert_eq!(last_write(&log, Register::Efer), Some(EFER_BOOT));
        assert_eq!(last_write(&log, Register::Rflags), Some(0x2));
    }

    #[test]
    fn test_scenario_boot_info() {
        let mut backend = MockVmm::new();
        let mut memory = GuestMemory::anonymous(MEM_SIZE).unwrap();
        init(&mut backend, &mut memory).unwrap();

        let mut bytes = [0u8; BootInfo::SIZE];
        memory.read(layout::BOOT_INFO_START, &mut bytes).unwrap();
        let boot_info = BootInfo::from_bytes(&bytes);
        assert_eq!(boot_info.mem_size, 0x200000);
        assert_eq!(boot_info.kernel_end, 0x150000);
        assert_eq!(boot_info.cmdline, layout::CMDLINE_START);
        assert_eq!(boot_info.tsc_freq, 1_000_000_000);
    }

    #[test]
    fn test_segment_programming() {
        let mut backend = MockVmm::new();
        let mut memory = GuestMemory::anonymous(MEM_SIZE).unwrap();
        init(&mut backend, &mut memory).unwrap();

        let log = backend.log.lock().unwrap().clone();
        let seg = |s: Segment| {
            log.iter()
                .find_map(|c| match c {
                    Call::SetSegment(seg, desc) if *seg == s => Some(*desc),
                    _ => None,
                })
                .unwrap()
        };
        assert_eq!(seg(Segment::Cs), SegmentDescriptor::CODE);
        for s in [Segment::Ss, Segment::Ds, Segment::Es, Segment::Fs, Segment::Gs] {
            assert_eq!(seg(s), SegmentDescriptor::DATA);
        }
        assert_eq!(seg(Segment::Tr), SegmentDescriptor::TSS);
        assert_eq!(seg(Segment::Ldtr), SegmentDescriptor::UNUSABLE);
        assert!(log.contains(&Call::SetGdt(layout::BOOT_GDT_START, GDT_LIMIT)));
    }

    #[test]
    fn test_vcpu_activated_exactly_once_and_last() {
        let mut backend = MockVmm::new();
        let mut memory = GuestMemory::anonymous(MEM_SIZE).unwrap();
        init(&mut backend, &mut memory).unwrap();

        let log = backend.log.lock().unwrap().clone();
        let activations: Vec<_> = log
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == Call::ActivateVcpu)
            .collect();
        assert_eq!(activations.len(), 1);
        assert_eq!(activations[0].0, log.len() - 1);
    }

    #[test]
    fn test_deterministic_construction() {
        let run_once = || {
            let mut backend = MockVmm::new();
            let mut memory = GuestMemory::anonymous(MEM_SIZE).unwrap();
            init(&mut backend, &mut memory).unwrap();
            let log = backend.log.lock().unwrap().clone();
            let mut boot_region = vec![0u8; layout::GUEST_MIN_BASE as usize];
            memory.read(0, &mut boot_region).unwrap();
            (log, boot_region)
        };
        let (log_a, mem_a) = run_once();
        let (log_b, mem_b) = run_once();
        assert_eq!(log_a, log_b);
        assert_eq!(mem_a, mem_b);
    }

    #[test]
    fn test_non_invariant_tsc_fails_before_activation() {
        let mut backend = MockVmm::new().with_cpu_info(HostCpuInfo {
            tsc_freq: 2_000_000_000,
            invariant_tsc: false,
        });
        let mut memory = GuestMemory::anonymous(MEM_SIZE).unwrap();
        let err = init(&mut backend, &mut memory).unwrap_err();
        assert!(matches!(err, Error::TscNotInvariant));

        // Nothing was programmed and no VCPU was activated
        let log = backend.log.lock().unwrap().clone();
        assert!(!log.contains(&Call::ActivateVcpu));
        assert!(!log.iter().any(|c| matches!(c, Call::SetRegister(..))));
    }

    #[test]
    fn test_entry_bounds_checked() {
        let mut backend = MockVmm::new();
        let mut memory = GuestMemory::anonymous(MEM_SIZE).unwrap();
        // Below the loadable floor
        assert!(initialize(&mut backend, &mut memory, 0x1000, 0x150000).is_err());
        // Past the end of memory
        assert!(initialize(&mut backend, &mut memory, MEM_SIZE, MEM_SIZE).is_err());
        // kernel_end past the end of memory
        assert!(initialize(&mut backend, &mut memory, ENTRY, MEM_SIZE + 1).is_err());
    }
}
