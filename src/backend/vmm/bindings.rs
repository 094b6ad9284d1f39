//! FreeBSD vmm(4) control-device bindings.
//!
//! Hand-written subset of `machine/vmm.h` and `machine/vmm_dev.h`: the
//! ioctl requests, register names and exit codes the monitor uses. VM
//! instances are created and destroyed through the `hw.vmm.create` /
//! `hw.vmm.destroy` sysctl nodes and controlled through ioctls on
//! `/dev/vmm/<name>`.

#![allow(dead_code)]

use libc::{c_int, size_t};

// ioctl encoding, sys/ioccom.h
const IOC_OUT: u64 = 0x4000_0000;
const IOC_IN: u64 = 0x8000_0000;
const IOC_INOUT: u64 = IOC_IN | IOC_OUT;
const IOCPARM_MASK: u64 = 0x1fff;

const fn ioc(inout: u64, group: u8, num: u64, len: usize) -> u64 {
    inout | ((len as u64 & IOCPARM_MASK) << 16) | ((group as u64) << 8) | num
}

// ioctl command numbers, machine/vmm_dev.h
const IOCNUM_RUN: u64 = 1;
const IOCNUM_SET_CAPABILITY: u64 = 2;
const IOCNUM_ALLOC_MEMSEG: u64 = 14;
const IOCNUM_MMAP_MEMSEG: u64 = 16;
const IOCNUM_SET_REGISTER: u64 = 20;
const IOCNUM_GET_REGISTER: u64 = 21;
const IOCNUM_SET_SEGMENT_DESCRIPTOR: u64 = 22;
const IOCNUM_ACTIVATE_CPU: u64 = 90;

pub const VM_RUN: u64 = ioc(IOC_INOUT, b'v', IOCNUM_RUN, std::mem::size_of::<VmRunArgs>());
pub const VM_SET_CAPABILITY: u64 = ioc(
    IOC_IN,
    b'v',
    IOCNUM_SET_CAPABILITY,
    std::mem::size_of::<VmCapability>(),
);
pub const VM_ALLOC_MEMSEG: u64 = ioc(
    IOC_IN,
    b'v',
    IOCNUM_ALLOC_MEMSEG,
    std::mem::size_of::<VmMemseg>(),
);
pub const VM_MMAP_MEMSEG: u64 = ioc(
    IOC_IN,
    b'v',
    IOCNUM_MMAP_MEMSEG,
    std::mem::size_of::<VmMemmap>(),
);
pub const VM_SET_REGISTER: u64 = ioc(
    IOC_IN,
    b'v',
    IOCNUM_SET_REGISTER,
    std::mem::size_of::<VmRegister>(),
);
pub const VM_GET_REGISTER: u64 = ioc(
    IOC_INOUT,
    b'v',
    IOCNUM_GET_REGISTER,
    std::mem::size_of::<VmRegister>(),
);
pub const VM_SET_SEGMENT_DESCRIPTOR: u64 = ioc(
    IOC_IN,
    b'v',
    IOCNUM_SET_SEGMENT_DESCRIPTOR,
    std::mem::size_of::<VmSegDesc>(),
);
pub const VM_ACTIVATE_CPU: u64 = ioc(
    IOC_IN,
    b'v',
    IOCNUM_ACTIVATE_CPU,
    std::mem::size_of::<VmActivateCpu>(),
);

// enum vm_cap_type
pub const VM_CAP_HALT_EXIT: c_int = 0;

/// Guest register identifiers, enum vm_reg_name.
pub mod reg {
    use libc::c_int;

    pub const RAX: c_int = 0;
    pub const RBX: c_int = 1;
    pub const RCX: c_int = 2;
    pub const RDX: c_int = 3;
    pub const RSI: c_int = 4;
    pub const RDI: c_int = 5;
    pub const RBP: c_int = 6;
    pub const R8: c_int = 7;
    pub const R15: c_int = 14;
    pub const CR0: c_int = 15;
    pub const CR3: c_int = 16;
    pub const CR4: c_int = 17;
    pub const DR7: c_int = 18;
    pub const RSP: c_int = 19;
    pub const RIP: c_int = 20;
    pub const RFLAGS: c_int = 21;
    pub const EFER: c_int = 22;
    pub const CS: c_int = 23;
    pub const DS: c_int = 24;
    pub const ES: c_int = 25;
    pub const FS: c_int = 26;
    pub const GS: c_int = 27;
    pub const SS: c_int = 28;
    pub const LDTR: c_int = 29;
    pub const TR: c_int = 30;
    pub const GDTR: c_int = 31;
    pub const IDTR: c_int = 32;
}

/// Exit codes, enum vm_exitcode.
pub mod exitcode {
    use libc::c_int;

    pub const INOUT: c_int = 0;
    pub const VMX: c_int = 1;
    pub const BOGUS: c_int = 2;
    pub const RDMSR: c_int = 3;
    pub const WRMSR: c_int = 4;
    pub const HLT: c_int = 5;
    pub const MTRAP: c_int = 6;
    pub const PAUSE: c_int = 7;
    pub const PAGING: c_int = 8;
    pub const INST_EMUL: c_int = 9;
    pub const SPINUP_AP: c_int = 10;
    pub const RENDEZVOUS: c_int = 12;
    pub const IOAPIC_EOI: c_int = 13;
    pub const SUSPENDED: c_int = 14;
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmCapability {
    pub cpuid: c_int,
    pub captype: c_int,
    pub capval: c_int,
    pub allcpus: c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmMemseg {
    pub segid: c_int,
    pub len: size_t,
    pub name: [u8; 64],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmMemmap {
    pub gpa: u64,
    pub segid: c_int,
    pub segoff: i64,
    pub len: size_t,
    pub prot: c_int,
    pub flags: c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmRegister {
    pub cpuid: c_int,
    pub regnum: c_int,
    pub regval: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SegDesc {
    pub base: u64,
    pub limit: u32,
    pub access: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmSegDesc {
    pub cpuid: c_int,
    pub regnum: c_int,
    pub desc: SegDesc,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmActivateCpu {
    pub vcpuid: c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmInout {
    pub bytes: u16,
    pub in_: u8,
    pub string_: u8,
    pub rep: u8,
    pub port: u16,
    pub eax: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmxExit {
    pub status: c_int,
    pub exit_reason: u32,
    pub exit_qualification: u64,
    pub inst_type: c_int,
    pub inst_error: c_int,
}

/// Exit detail union; padded out to the kernel's largest variant
/// (instruction-emulation state) so the structure sizes agree.
#[repr(C)]
#[derive(Clone, Copy)]
pub union VmExitPayload {
    pub inout: VmInout,
    pub vmx: VmxExit,
    pub pad: [u8; 112],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmExitInfo {
    pub exitcode: c_int,
    pub inst_length: c_int,
    pub rip: u64,
    pub u: VmExitPayload,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmRunArgs {
    pub cpuid: c_int,
    pub vm_exit: VmExitInfo,
}

impl VmRunArgs {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }
}
