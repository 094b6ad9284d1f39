//! x86_64 boot-time CPU state.
//!
//! The guest is entered directly in 64-bit long mode with flat segmentation
//! and identity-mapped paging:
//! 1. GDT at a fixed low address (null, code, data, 16-byte TSS pair)
//! 2. Identity page tables covering all of guest memory with 2 MiB pages
//! 3. Control registers enabling protection, paging, long mode and SSE
//!
//! Everything here is deterministic: the same memory size always produces
//! the same descriptor and page-table bytes.

use bitflags::bitflags;

use crate::error::Result;
use crate::memory::{layout, GuestMemory};

/// 2 MiB, the page size used by the boot page tables. Guest memory sizes
/// must be a multiple of this.
pub const PAGE_SIZE_2M: u64 = 2 << 20;

/// Upper bound on guest memory: one page directory of 2 MiB mappings.
pub const MAX_GUEST_MEMORY: u64 = 1 << 30;

bitflags! {
    /// CR0 bits used by the boot protocol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0Flags: u64 {
        const PROTECTED_MODE = 1 << 0;
        const MONITOR_COPROCESSOR = 1 << 1;
        const EXTENSION_TYPE = 1 << 4;
        const NUMERIC_ERROR = 1 << 5;
        const WRITE_PROTECT = 1 << 16;
        const ALIGNMENT_MASK = 1 << 18;
        const PAGING = 1 << 31;
    }

    /// CR4 bits used by the boot protocol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4Flags: u64 {
        const PHYSICAL_ADDRESS_EXTENSION = 1 << 5;
        const OSFXSR = 1 << 9;
        const OSXMMEXCPT = 1 << 10;
    }

    /// EFER bits used by the boot protocol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EferFlags: u64 {
        const LONG_MODE_ENABLE = 1 << 8;
        const LONG_MODE_ACTIVE = 1 << 10;
    }

    /// Page-table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageEntryFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const PAGE_SIZE = 1 << 7;
    }
}

/// Boot value of CR0: protected mode, paging, native FPU error reporting.
pub const CR0_BOOT: u64 = Cr0Flags::PROTECTED_MODE
    .union(Cr0Flags::MONITOR_COPROCESSOR)
    .union(Cr0Flags::EXTENSION_TYPE)
    .union(Cr0Flags::NUMERIC_ERROR)
    .union(Cr0Flags::WRITE_PROTECT)
    .union(Cr0Flags::ALIGNMENT_MASK)
    .union(Cr0Flags::PAGING)
    .bits();

/// Boot value of CR4: PAE plus SSE enablement.
pub const CR4_BOOT: u64 = Cr4Flags::PHYSICAL_ADDRESS_EXTENSION
    .union(Cr4Flags::OSFXSR)
    .union(Cr4Flags::OSXMMEXCPT)
    .bits();

/// Boot value of EFER: long mode enabled and active.
pub const EFER_BOOT: u64 = EferFlags::LONG_MODE_ENABLE
    .union(EferFlags::LONG_MODE_ACTIVE)
    .bits();

/// Boot value of RFLAGS: only the always-set reserved bit.
pub const RFLAGS_BOOT: u64 = 0x2;

/// Virtual-CPU registers the monitor programs or inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Cr0,
    Cr3,
    Cr4,
    Efer,
    Rflags,
    Rip,
    Rsp,
    Rdi,
}

/// Segment registers the monitor programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
    Tr,
    Ldtr,
}

/// GDT slot indices. The TSS descriptor is 16 bytes in long mode and takes
/// two slots.
pub const GDT_NULL: usize = 0;
pub const GDT_CODE: usize = 1;
pub const GDT_DATA: usize = 2;
pub const GDT_TSS_LO: usize = 3;
pub const GDT_TSS_HI: usize = 4;
pub const GDT_NUM_ENTRIES: usize = 5;

/// GDTR limit covering the whole table.
pub const GDT_LIMIT: u32 = (GDT_NUM_ENTRIES * 8 - 1) as u32;

/// An unpacked segment descriptor plus its selector index.
///
/// `limit` is the effective byte limit; packing into a GDT entry scales it
/// down when `granularity` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub base: u64,
    pub limit: u32,
    /// GDT slot index; the selector value loaded into the register is
    /// `selector * 8`.
    pub selector: u16,
    pub seg_type: u8,
    pub code_or_data: bool,
    pub dpl: u8,
    pub present: bool,
    pub long_mode: bool,
    pub default_size: bool,
    pub granularity: bool,
    pub unusable: bool,
}

impl SegmentDescriptor {
    /// Flat 64-bit code segment (execute/read, accessed).
    pub const CODE: SegmentDescriptor = SegmentDescriptor {
        base: 0,
        limit: 0xFFFF_FFFF,
        selector: GDT_CODE as u16,
        seg_type: 0xb,
        code_or_data: true,
        dpl: 0,
        present: true,
        long_mode: true,
        default_size: false,
        granularity: true,
        unusable: false,
    };

    /// Flat data segment (read/write, accessed).
    pub const DATA: SegmentDescriptor = SegmentDescriptor {
        base: 0,
        limit: 0xFFFF_FFFF,
        selector: GDT_DATA as u16,
        seg_type: 0x3,
        code_or_data: true,
        dpl: 0,
        present: true,
        long_mode: false,
        default_size: true,
        granularity: true,
        unusable: false,
    };

    /// 64-bit TSS (busy). The guest never switches tasks; the descriptor
    /// only has to be architecturally valid.
    pub const TSS: SegmentDescriptor = SegmentDescriptor {
        base: 0,
        limit: 0x67,
        selector: GDT_TSS_LO as u16,
        seg_type: 0xb,
        code_or_data: false,
        dpl: 0,
        present: true,
        long_mode: false,
        default_size: false,
        granularity: false,
        unusable: false,
    };

    /// Explicitly unusable descriptor, loaded into LDTR.
    pub const UNUSABLE: SegmentDescriptor = SegmentDescriptor {
        base: 0,
        limit: 0,
        selector: 0,
        seg_type: 0,
        code_or_data: false,
        dpl: 0,
        present: false,
        long_mode: false,
        default_size: false,
        granularity: false,
        unusable: true,
    };

    /// Access/attribute word in the packed format hardware-virtualization
    /// interfaces use for segment state, including the out-of-band
    /// "unusable" bit at position 16.
    pub fn access_word(&self) -> u32 {
        (self.seg_type as u32)
            | (self.code_or_data as u32) << 4
            | (self.dpl as u32) << 5
            | (self.present as u32) << 7
            | (self.long_mode as u32) << 13
            | (self.default_size as u32) << 14
            | (self.granularity as u32) << 15
            | (self.unusable as u32) << 16
    }

    /// Selector value as loaded into the segment register.
    pub fn selector_value(&self) -> u16 {
        self.selector * 8
    }

    /// Pack into an 8-byte GDT entry.
    pub fn gdt_entry(&self) -> u64 {
        let limit = if self.granularity {
            (self.limit >> 12) as u64
        } else {
            self.limit as u64
        };
        let base = self.base;
        let access = (self.seg_type as u64)
            | (self.code_or_data as u64) << 4
            | (self.dpl as u64) << 5
            | (self.present as u64) << 7;

        (limit & 0xFFFF)
            | (base & 0xFFFF) << 16
            | ((base >> 16) & 0xFF) << 32
            | access << 40
            | ((limit >> 16) & 0xF) << 48
            | (self.long_mode as u64) << 53
            | (self.default_size as u64) << 54
            | (self.granularity as u64) << 55
            | ((base >> 24) & 0xFF) << 56
    }
}

/// Build the boot GDT.
pub fn build_gdt() -> Vec<u8> {
    let mut gdt = Vec::with_capacity(GDT_NUM_ENTRIES * 8);

    gdt.extend_from_slice(&0u64.to_le_bytes());
    gdt.extend_from_slice(&SegmentDescriptor::CODE.gdt_entry().to_le_bytes());
    gdt.extend_from_slice(&SegmentDescriptor::DATA.gdt_entry().to_le_bytes());
    // TSS pair: a 16-byte system descriptor; the high half holds
    // base[63:32], zero here.
    gdt.extend_from_slice(&SegmentDescriptor::TSS.gdt_entry().to_le_bytes());
    gdt.extend_from_slice(&0u64.to_le_bytes());

    gdt
}

/// Write the boot GDT into guest memory.
pub fn write_gdt(mem: &mut GuestMemory) -> Result<()> {
    mem.write(layout::BOOT_GDT_START, &build_gdt())
}

/// Write identity-mapping page tables covering all of guest memory.
///
/// One PML4 entry, one PDPTE entry, and one page directory of 2 MiB
/// mappings; the caller has already validated the size against
/// [`MAX_GUEST_MEMORY`].
pub fn write_boot_page_tables(mem: &mut GuestMemory) -> Result<()> {
    let table = PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE;
    let page = table | PageEntryFlags::PAGE_SIZE;

    mem.write_u64(layout::BOOT_PML4_START, layout::BOOT_PDPTE_START | table.bits())?;
    mem.write_u64(layout::BOOT_PDPTE_START, layout::BOOT_PDE_START | table.bits())?;

    let mem_size = mem.size();
    let mut paddr = 0u64;
    let mut slot = 0u64;
    while paddr < mem_size {
        mem.write_u64(layout::BOOT_PDE_START + slot * 8, paddr | page.bits())?;
        paddr += PAGE_SIZE_2M;
        slot += 1;
    }

    Ok(())
}
