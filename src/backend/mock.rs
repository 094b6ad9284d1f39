//! Scripted backend for tests.
//!
//! Plays back a fixed sequence of exits and records every control call so
//! tests can assert on the exact register and descriptor programming.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::backend::{HostCpuInfo, VmExit, VmmControl};
use crate::cpu::x86_64::{Register, Segment, SegmentDescriptor};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    SetRegister(Register, u64),
    SetSegment(Segment, SegmentDescriptor),
    SetGdt(u64, u32),
    ActivateVcpu,
    Run,
}

pub(crate) struct MockVmm {
    pub log: Arc<Mutex<Vec<Call>>>,
    exits: VecDeque<Result<VmExit>>,
    cpu_info: HostCpuInfo,
}

impl MockVmm {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            exits: VecDeque::new(),
            cpu_info: HostCpuInfo {
                tsc_freq: 1_000_000_000,
                invariant_tsc: true,
            },
        }
    }

    pub fn with_exits(exits: Vec<Result<VmExit>>) -> Self {
        let mut mock = Self::new();
        mock.exits = exits.into();
        mock
    }

    pub fn with_cpu_info(mut self, cpu_info: HostCpuInfo) -> Self {
        self.cpu_info = cpu_info;
        self
    }

    fn record(&self, call: Call) {
        self.log.lock().unwrap().push(call);
    }
}

impl VmmControl for MockVmm {
    fn set_register(&mut self, reg: Register, value: u64) -> Result<()> {
        self.record(Call::SetRegister(reg, value));
        Ok(())
    }

    fn get_register(&mut self, _reg: Register) -> Result<u64> {
        Ok(0)
    }

    fn set_segment(&mut self, seg: Segment, desc: &SegmentDescriptor) -> Result<()> {
        self.record(Call::SetSegment(seg, *desc));
        Ok(())
    }

    fn set_gdt(&mut self, base: u64, limit: u32) -> Result<()> {
        self.record(Call::SetGdt(base, limit));
        Ok(())
    }

    fn activate_vcpu(&mut self) -> Result<()> {
        self.record(Call::ActivateVcpu);
        Ok(())
    }

    fn run(&mut self) -> Result<VmExit> {
        self.record(Call::Run);
        match self.exits.pop_front() {
            Some(exit) => exit,
            // Script exhausted: halt, so a test that under-scripts fails
            // visibly instead of hanging.
            None => Ok(VmExit::Halt),
        }
    }

    fn host_cpu_info(&self) -> Result<HostCpuInfo> {
        Ok(self.cpu_info)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// A backend whose run primitive always fails; for error-path tests.
pub(crate) struct FailingRun;

impl VmmControl for FailingRun {
    fn set_register(&mut self, _reg: Register, _value: u64) -> Result<()> {
        Ok(())
    }

    fn get_register(&mut self, _reg: Register) -> Result<u64> {
        Ok(0)
    }

    fn set_segment(&mut self, _seg: Segment, _desc: &SegmentDescriptor) -> Result<()> {
        Ok(())
    }

    fn set_gdt(&mut self, _base: u64, _limit: u32) -> Result<()> {
        Ok(())
    }

    fn activate_vcpu(&mut self) -> Result<()> {
        Ok(())
    }

    fn run(&mut self) -> Result<VmExit> {
        Err(Error::HypervisorError("run primitive failed".to_string()))
    }

    fn host_cpu_info(&self) -> Result<HostCpuInfo> {
        Ok(HostCpuInfo {
            tsc_freq: 1_000_000_000,
            invariant_tsc: true,
        })
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}
