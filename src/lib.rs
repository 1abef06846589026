//
// Copyright 2025 The sev_testenv Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! AMD SEV support for a minimal pre-OS test environment.
//!
//! The crate detects whether the guest is running with memory encryption
//! (SEV) and exception-based hypervisor communication (SEV-ES), derives the
//! c-bit address geometry, and prepares the environment so that the test
//! harness can take over from the firmware without losing the ability to
//! talk to the hypervisor: the GHCB page is remapped unencrypted, and the
//! firmware's #VC handler and active segment descriptors are carried across
//! into the harness's own descriptor tables.
//!
//! Everything runs single-threaded during early bring-up. Detection results
//! are either threaded through the setup sequence by value or obtained from
//! the process-wide cached accessor [`sev_capabilities`]; no routine here
//! blocks, and any internal inconsistency is fatal rather than recoverable,
//! because a partially-updated paging or descriptor state cannot be rolled
//! back.

#![cfg_attr(not(test), no_std)]

pub mod capability;
pub mod descriptors;
pub mod geometry;
pub mod ghcb;
pub mod msr;
pub mod paging;
pub mod platform;

use x86_64::registers::segmentation::SegmentSelector;

pub use crate::{
    capability::{sev_capabilities, SevCapabilities},
    geometry::EncryptionGeometry,
    platform::{Base, Platform},
};
use crate::{
    descriptors::{InterruptTable, SegmentTable},
    paging::PageTableOps,
};

/// Prepares the test environment for running under SEV.
///
/// Does nothing beyond deriving the address geometry when SEV is not
/// enabled. Under SEV-ES it additionally remaps the GHCB page unencrypted
/// and reconciles the descriptor tables; this must complete before the
/// harness loads its own tables and before anything that can raise #VC.
///
/// Returns the derived geometry so later consumers can build address masks
/// without re-deriving it.
pub fn initialize_environment<P: Platform>(
    capabilities: &SevCapabilities,
    tables: &mut impl PageTableOps,
    idt: &mut InterruptTable,
    gdt: &mut SegmentTable,
    harness_cs: SegmentSelector,
) -> EncryptionGeometry {
    let geometry = EncryptionGeometry::new(capabilities);
    if !capabilities.sev_enabled() {
        return geometry;
    }

    log::info!(
        "SEV enabled; SEV-ES {}; c-bit position {}",
        if capabilities.sev_es_enabled() { "enabled" } else { "disabled" },
        geometry.bit_position()
    );

    ghcb::ensure_unencrypted_ghcb_page::<P>(capabilities, &geometry, tables);
    descriptors::copy_vc_handler_entry::<P>(capabilities, idt, harness_cs);
    descriptors::copy_active_segment_descriptors::<P>(capabilities, gdt);

    geometry
}

#[cfg(test)]
mod tests {
    use core::arch::x86_64::CpuidResult;

    use x86_64::{
        structures::paging::{page_table::PageTableLevel, PageSize, Size2MiB},
        structures::DescriptorTablePointer,
        PhysAddr, PrivilegeLevel, VirtAddr,
    };

    use super::*;
    use crate::{
        capability::{CPUID_LARGEST_EXTENDED_FUNCTION, CPUID_MEMORY_ENCRYPTION},
        descriptors::{InterruptDescriptor, SegmentDescriptor, VC_VECTOR},
        msr::{GHCB_MSR, SEV_STATUS_MSR},
        paging::testing::TestTables,
    };

    const C_BIT: u64 = 1 << 47;
    const GHCB_ADDR: u64 = 0x0040_5000;
    const VC_HANDLER_OFFSET: u64 = 0x7f00_1000;
    const FIRMWARE_CS_INDEX: u16 = 3;
    const FIRMWARE_DS_INDEX: u16 = 4;

    static FIRMWARE_IDT: [InterruptDescriptor; 64] = {
        let mut table = [InterruptDescriptor::empty(); 64];
        table[VC_VECTOR] = InterruptDescriptor::new(
            VC_HANDLER_OFFSET,
            SegmentSelector::new(FIRMWARE_CS_INDEX, PrivilegeLevel::Ring0),
            0x8E00,
        );
        table
    };

    static FIRMWARE_GDT: [SegmentDescriptor; 8] = {
        let mut table = [SegmentDescriptor::new(0); 8];
        table[FIRMWARE_CS_INDEX as usize] = SegmentDescriptor::new(0x00AF_9B00_0000_FFFF);
        table[FIRMWARE_DS_INDEX as usize] = SegmentDescriptor::new(0x00CF_9300_0000_FFFF);
        table
    };

    /// A guest with SEV and SEV-ES enabled and a c-bit at position 47.
    struct EsGuest;

    impl Platform for EsGuest {
        fn cpuid(leaf: u32) -> CpuidResult {
            let (eax, ebx) = match leaf {
                CPUID_LARGEST_EXTENDED_FUNCTION => (0x8000_0021, 0),
                CPUID_MEMORY_ENCRYPTION => (0b10, 47),
                other => unreachable!("unexpected CPUID leaf {other:#x}"),
            };
            CpuidResult { eax, ebx, ecx: 0, edx: 0 }
        }
        unsafe fn read_msr(msr: u32) -> u64 {
            match msr {
                SEV_STATUS_MSR => 0b11,
                GHCB_MSR => GHCB_ADDR,
                other => unreachable!("unexpected MSR read {other:#x}"),
            }
        }
        unsafe fn write_msr(_msr: u32, _value: u64) {
            unreachable!()
        }
        fn interrupt_table() -> DescriptorTablePointer {
            DescriptorTablePointer {
                limit: (core::mem::size_of::<[InterruptDescriptor; 64]>() - 1) as u16,
                base: VirtAddr::from_ptr(FIRMWARE_IDT.as_ptr()),
            }
        }
        fn segment_table() -> DescriptorTablePointer {
            DescriptorTablePointer {
                limit: (core::mem::size_of::<[SegmentDescriptor; 8]>() - 1) as u16,
                base: VirtAddr::from_ptr(FIRMWARE_GDT.as_ptr()),
            }
        }
        fn code_segment() -> SegmentSelector {
            SegmentSelector::new(FIRMWARE_CS_INDEX, PrivilegeLevel::Ring0)
        }
        fn data_segment() -> SegmentSelector {
            SegmentSelector::new(FIRMWARE_DS_INDEX, PrivilegeLevel::Ring0)
        }
    }

    #[test]
    fn test_initialize_environment_end_to_end() {
        let capabilities = SevCapabilities::probe::<EsGuest>();
        assert!(capabilities.sev_es_enabled());

        let mut tables = TestTables::new(C_BIT);
        tables.map_large(GHCB_ADDR & !(Size2MiB::SIZE - 1));
        let mut idt = InterruptTable::new();
        let mut gdt = SegmentTable::new();
        let harness_cs = SegmentSelector::new(1, PrivilegeLevel::Ring0);

        let geometry = initialize_environment::<EsGuest>(
            &capabilities,
            &mut tables,
            &mut idt,
            &mut gdt,
            harness_cs,
        );

        assert_eq!(geometry.bit_mask(), C_BIT);
        assert_eq!(geometry.address_upper_bound(), 46);

        // The GHCB page ended up shared behind a 4KiB leaf.
        let leaf = tables.find_leaf(PhysAddr::new(GHCB_ADDR), PageTableLevel::One).unwrap();
        assert_eq!(leaf.addr().as_u64(), GHCB_ADDR);

        // The #VC handler came across, retargeted at the harness segment.
        let entry = idt.entry(VC_VECTOR);
        assert_eq!(entry.handler_offset(), VC_HANDLER_OFFSET);
        assert_eq!(entry.selector(), harness_cs);

        // The firmware's active descriptors were mirrored at their indices.
        assert_eq!(
            gdt.entry(FIRMWARE_CS_INDEX as usize),
            FIRMWARE_GDT[FIRMWARE_CS_INDEX as usize]
        );
        assert_eq!(
            gdt.entry(FIRMWARE_DS_INDEX as usize),
            FIRMWARE_GDT[FIRMWARE_DS_INDEX as usize]
        );
    }

    #[test]
    fn test_initialize_environment_without_sev() {
        struct PlainGuest;

        impl Platform for PlainGuest {
            fn cpuid(leaf: u32) -> CpuidResult {
                match leaf {
                    CPUID_LARGEST_EXTENDED_FUNCTION => {
                        CpuidResult { eax: 0x8000_0010, ebx: 0, ecx: 0, edx: 0 }
                    }
                    other => unreachable!("unexpected CPUID leaf {other:#x}"),
                }
            }
            unsafe fn read_msr(msr: u32) -> u64 {
                unreachable!("unexpected MSR read {msr:#x}")
            }
            unsafe fn write_msr(_msr: u32, _value: u64) {
                unreachable!()
            }
            fn interrupt_table() -> DescriptorTablePointer {
                unreachable!()
            }
            fn segment_table() -> DescriptorTablePointer {
                unreachable!()
            }
            fn code_segment() -> SegmentSelector {
                unreachable!()
            }
            fn data_segment() -> SegmentSelector {
                unreachable!()
            }
        }

        let capabilities = SevCapabilities::probe::<PlainGuest>();
        assert!(!capabilities.sev_enabled());

        let mut tables = TestTables::new(0);
        let mut idt = InterruptTable::new();
        let mut gdt = SegmentTable::new();

        let geometry = initialize_environment::<PlainGuest>(
            &capabilities,
            &mut tables,
            &mut idt,
            &mut gdt,
            SegmentSelector::new(1, PrivilegeLevel::Ring0),
        );

        assert_eq!(geometry.bit_mask(), 0);
        assert_eq!(geometry.address_upper_bound(), 51);
        assert_eq!(tables.installs, 0);
        assert_eq!(tables.flushes, 0);
        for vector in 0..descriptors::INTERRUPT_TABLE_ENTRIES {
            assert_eq!(idt.entry(vector), InterruptDescriptor::empty());
        }
    }
}
