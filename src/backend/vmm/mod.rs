//! FreeBSD vmm(4) backend.
//!
//! Drives the in-kernel bhyve hypervisor through its sysctl and ioctl
//! control surface. The VM instance is named after the crate; a leftover
//! instance from a crashed previous run is destroyed best-effort before
//! creation (the destroy node is known to be unreliable, so its failure is
//! ignored).

mod bindings;

use std::ffi::CStr;
use std::io;
use std::os::fd::RawFd;
use std::path::Path;

use log::debug;

use crate::backend::{HostCpuInfo, VmExit, VmmControl};
use crate::cpu::x86_64::{Register, Segment, SegmentDescriptor};
use crate::error::{Error, Result};
use crate::memory::GuestMemory;

/// Name of the VM instance under /dev/vmm/.
const VM_NAME: &CStr = c"unimon";

/// Check if the vmm kernel module is loaded.
pub fn is_available() -> bool {
    Path::new("/dev/vmm").exists()
}

fn last_errno(op: &'static str) -> Error {
    Error::VmmControlFailed {
        op,
        source: io::Error::last_os_error(),
    }
}

fn sysctl_write(name: &CStr, value: &CStr) -> libc::c_int {
    unsafe {
        libc::sysctlbyname(
            name.as_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            value.as_ptr() as *const libc::c_void,
            value.to_bytes().len(),
        )
    }
}

fn sysctl_read<T>(name: &CStr, out: &mut T) -> libc::c_int {
    let mut len = std::mem::size_of::<T>();
    unsafe {
        libc::sysctlbyname(
            name.as_ptr(),
            out as *mut T as *mut libc::c_void,
            &mut len,
            std::ptr::null(),
            0,
        )
    }
}

/// FreeBSD vmm backend: an open control descriptor for one VM instance.
pub struct VmmBackend {
    vmfd: RawFd,
    run_args: bindings::VmRunArgs,
}

// Safety: the descriptor is used only through &mut self.
unsafe impl Send for VmmBackend {}

impl VmmBackend {
    /// Create the VM instance and map `mem_size` bytes of guest memory.
    pub fn create(mem_size: u64) -> Result<(Self, GuestMemory)> {
        // Best-effort cleanup of a stale instance; this node fails
        // spuriously and a failure here is not an error.
        if sysctl_write(c"hw.vmm.destroy", VM_NAME) == -1 {
            debug!(
                "stale instance destroy failed (ignored): {}",
                io::Error::last_os_error()
            );
        }

        if sysctl_write(c"hw.vmm.create", VM_NAME) == -1 {
            return Err(last_errno("hw.vmm.create"));
        }

        let vmfd = unsafe { libc::open(c"/dev/vmm/unimon".as_ptr(), libc::O_RDWR) };
        if vmfd == -1 {
            return Err(last_errno("open /dev/vmm"));
        }

        let mut backend = Self {
            vmfd,
            run_args: bindings::VmRunArgs::zeroed(),
        };

        // Halt must reach the monitor as an exit, it is the cooperative
        // termination path.
        let cap = bindings::VmCapability {
            cpuid: 0,
            captype: bindings::VM_CAP_HALT_EXIT,
            capval: 1,
            allcpus: 0,
        };
        backend.ioctl("VM_SET_CAPABILITY", bindings::VM_SET_CAPABILITY, &cap)?;

        let memseg = bindings::VmMemseg {
            segid: 0,
            len: mem_size as usize,
            name: [0; 64],
        };
        backend.ioctl("VM_ALLOC_MEMSEG", bindings::VM_ALLOC_MEMSEG, &memseg)?;

        let memmap = bindings::VmMemmap {
            gpa: 0,
            segid: 0,
            segoff: 0,
            len: mem_size as usize,
            prot: libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            flags: 0,
        };
        backend.ioctl("VM_MMAP_MEMSEG", bindings::VM_MMAP_MEMSEG, &memmap)?;

        // The same segment, shared into the monitor's address space.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mem_size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                vmfd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryAllocationFailed(format!(
                "mmap of guest memory failed: {}",
                io::Error::last_os_error()
            )));
        }

        let memory = unsafe { GuestMemory::from_raw_mapping(ptr as *mut u8, mem_size as usize) };
        Ok((backend, memory))
    }

    fn ioctl<T>(&mut self, op: &'static str, request: u64, arg: &T) -> Result<()> {
        let ret = unsafe {
            libc::ioctl(
                self.vmfd,
                request as libc::c_ulong,
                arg as *const T as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(last_errno(op));
        }
        Ok(())
    }

    fn regnum(reg: Register) -> libc::c_int {
        match reg {
            Register::Cr0 => bindings::reg::CR0,
            Register::Cr3 => bindings::reg::CR3,
            Register::Cr4 => bindings::reg::CR4,
            Register::Efer => bindings::reg::EFER,
            Register::Rflags => bindings::reg::RFLAGS,
            Register::Rip => bindings::reg::RIP,
            Register::Rsp => bindings::reg::RSP,
            Register::Rdi => bindings::reg::RDI,
        }
    }

    fn segnum(seg: Segment) -> libc::c_int {
        match seg {
            Segment::Cs => bindings::reg::CS,
            Segment::Ss => bindings::reg::SS,
            Segment::Ds => bindings::reg::DS,
            Segment::Es => bindings::reg::ES,
            Segment::Fs => bindings::reg::FS,
            Segment::Gs => bindings::reg::GS,
            Segment::Tr => bindings::reg::TR,
            Segment::Ldtr => bindings::reg::LDTR,
        }
    }

    fn set_raw_register(&mut self, regnum: libc::c_int, value: u64) -> Result<()> {
        let arg = bindings::VmRegister {
            cpuid: 0,
            regnum,
            regval: value,
        };
        self.ioctl("VM_SET_REGISTER", bindings::VM_SET_REGISTER, &arg)
    }

    fn set_raw_descriptor(
        &mut self,
        regnum: libc::c_int,
        base: u64,
        limit: u32,
        access: u32,
    ) -> Result<()> {
        let arg = bindings::VmSegDesc {
            cpuid: 0,
            regnum,
            desc: bindings::SegDesc {
                base,
                limit,
                access,
            },
        };
        self.ioctl(
            "VM_SET_SEGMENT_DESCRIPTOR",
            bindings::VM_SET_SEGMENT_DESCRIPTOR,
            &arg,
        )
    }

    fn decode_exit(&self) -> VmExit {
        let vme = &self.run_args.vm_exit;
        match vme.exitcode {
            bindings::exitcode::SUSPENDED => VmExit::Halt,
            bindings::exitcode::INOUT => {
                let io = unsafe { vme.u.inout };
                VmExit::Io {
                    port: io.port,
                    is_in: io.in_ != 0,
                    bytes: io.bytes as u8,
                    value: io.eax,
                    rip: vme.rip,
                }
            }
            bindings::exitcode::BOGUS => VmExit::Bogus {
                inst_length: vme.inst_length as u32,
                rip: vme.rip,
            },
            bindings::exitcode::VMX => {
                let vmx = unsafe { vme.u.vmx };
                VmExit::VirtFailure {
                    status: vmx.status,
                    reason: vmx.exit_reason,
                    qualification: vmx.exit_qualification,
                    inst_type: vmx.inst_type,
                    inst_error: vmx.inst_error,
                    rip: vme.rip,
                }
            }
            code => VmExit::Other {
                code,
                rip: vme.rip,
            },
        }
    }
}

impl VmmControl for VmmBackend {
    fn set_register(&mut self, reg: Register, value: u64) -> Result<()> {
        self.set_raw_register(Self::regnum(reg), value)
    }

    fn get_register(&mut self, reg: Register) -> Result<u64> {
        let mut arg = bindings::VmRegister {
            cpuid: 0,
            regnum: Self::regnum(reg),
            regval: 0,
        };
        let ret = unsafe {
            libc::ioctl(
                self.vmfd,
                bindings::VM_GET_REGISTER as libc::c_ulong,
                &mut arg as *mut _ as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(last_errno("VM_GET_REGISTER"));
        }
        Ok(arg.regval)
    }

    fn set_segment(&mut self, seg: Segment, desc: &SegmentDescriptor) -> Result<()> {
        let regnum = Self::segnum(seg);
        self.set_raw_descriptor(regnum, desc.base, desc.limit, desc.access_word())?;
        self.set_raw_register(regnum, desc.selector_value() as u64)
    }

    fn set_gdt(&mut self, base: u64, limit: u32) -> Result<()> {
        self.set_raw_descriptor(bindings::reg::GDTR, base, limit, 0)
    }

    fn activate_vcpu(&mut self) -> Result<()> {
        let arg = bindings::VmActivateCpu { vcpuid: 0 };
        self.ioctl("VM_ACTIVATE_CPU", bindings::VM_ACTIVATE_CPU, &arg)
    }

    fn run(&mut self) -> Result<VmExit> {
        self.run_args.cpuid = 0;
        let ret = unsafe {
            libc::ioctl(
                self.vmfd,
                bindings::VM_RUN as libc::c_ulong,
                &mut self.run_args as *mut _ as *mut libc::c_void,
            )
        };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Err(Error::Interrupted);
            }
            return Err(Error::VmmControlFailed {
                op: "VM_RUN",
                source: err,
            });
        }
        Ok(self.decode_exit())
    }

    fn host_cpu_info(&self) -> Result<HostCpuInfo> {
        let mut tsc_freq: u64 = 0;
        if sysctl_read(c"machdep.tsc_freq", &mut tsc_freq) == -1 {
            return Err(last_errno("machdep.tsc_freq"));
        }
        let mut invariant: libc::c_int = 0;
        if sysctl_read(c"kern.timecounter.invariant_tsc", &mut invariant) == -1 {
            return Err(last_errno("kern.timecounter.invariant_tsc"));
        }
        Ok(HostCpuInfo {
            tsc_freq,
            invariant_tsc: invariant == 1,
        })
    }

    fn name(&self) -> &'static str {
        "vmm"
    }
}

impl Drop for VmmBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.vmfd);
        }
        // Best-effort teardown, same caveat as in create().
        if sysctl_write(c"hw.vmm.destroy", VM_NAME) == -1 {
            debug!(
                "instance destroy failed (ignored): {}",
                io::Error::last_os_error()
            );
        }
    }
}
