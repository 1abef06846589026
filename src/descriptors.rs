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

//! Reconciling the firmware's descriptor tables with our own.
//!
//! Under SEV-ES certain instructions raise a #VC exception that must be
//! forwarded to the hypervisor. The firmware installs a working #VC handler
//! before handing over control, and the test environment reuses it instead
//! of implementing its own: the handler's IDT entry is copied into our IDT
//! by value.
//!
//! The firmware and the test environment assign different meanings to the
//! same selector values, so the copied entry cannot keep the firmware's
//! code segment selector: once our GDT is loaded, that selector would
//! resolve to a descriptor of the wrong type and the next #VC would
//! escalate to a fatal fault. The copied entry is therefore retargeted at
//! our own code segment, and the firmware's active code and data
//! descriptors are mirrored into our GDT at their original indices.

use core::mem::size_of;

use x86_64::{
    instructions::tables::{lgdt, lidt},
    registers::segmentation::SegmentSelector,
    structures::DescriptorTablePointer,
    VirtAddr,
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{capability::SevCapabilities, platform::Platform};

/// The exception vector used for hypervisor communication (#VC).
pub const VC_VECTOR: usize = 29;

/// Number of entries in the environment's interrupt descriptor table.
pub const INTERRUPT_TABLE_ENTRIES: usize = 256;

/// Number of entries in the environment's segment descriptor table.
pub const SEGMENT_TABLE_ENTRIES: usize = 32;

/// A 64-bit interrupt gate descriptor.
///
/// See section 4.8.4 of <https://www.amd.com/system/files/TechDocs/24593.pdf>.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InterruptDescriptor {
    offset_low: u16,
    selector: u16,
    options: u16,
    offset_middle: u16,
    offset_high: u32,
    reserved: u32,
}

static_assertions::assert_eq_size!(InterruptDescriptor, [u8; 16]);

impl InterruptDescriptor {
    /// A descriptor with every field zero; not present.
    pub const fn empty() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            options: 0,
            offset_middle: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    pub const fn new(handler_offset: u64, selector: SegmentSelector, options: u16) -> Self {
        Self {
            offset_low: handler_offset as u16,
            selector: selector.0,
            options,
            offset_middle: (handler_offset >> 16) as u16,
            offset_high: (handler_offset >> 32) as u32,
            reserved: 0,
        }
    }

    /// The virtual address of the handler, reassembled from the three
    /// offset fields.
    pub fn handler_offset(&self) -> u64 {
        (self.offset_low as u64)
            | ((self.offset_middle as u64) << 16)
            | ((self.offset_high as u64) << 32)
    }

    pub fn selector(&self) -> SegmentSelector {
        SegmentSelector(self.selector)
    }

    pub fn set_selector(&mut self, selector: SegmentSelector) {
        self.selector = selector.0;
    }
}

/// A raw 8-byte segment descriptor. The reconciler copies these by value
/// and never interprets the fields.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SegmentDescriptor(u64);

static_assertions::assert_eq_size!(SegmentDescriptor, [u8; 8]);

impl SegmentDescriptor {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Read-only, bounds-checked access to a descriptor table located through a
/// table register value.
pub struct DescriptorTableView<'a, T> {
    entries: &'a [T],
}

impl<'a, T: FromBytes + Copy> DescriptorTableView<'a, T> {
    /// Interprets the memory behind a descriptor-table register value as a
    /// table of `T`.
    ///
    /// ## Safety
    ///
    /// The pointer must come from a live descriptor-table register (SIDT or
    /// SGDT), and the table it references must stay in place for the
    /// lifetime of the view.
    pub unsafe fn new(pointer: &DescriptorTablePointer) -> Self {
        let count = (pointer.limit as usize + 1) / size_of::<T>();
        Self { entries: core::slice::from_raw_parts(pointer.base.as_ptr(), count) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies the entry at `index` out of the table.
    ///
    /// Panics if the index is outside the table; the callers only index
    /// with values the firmware itself handed out, so an out-of-range index
    /// means the environment is inconsistent.
    pub fn entry(&self, index: usize) -> T {
        assert!(
            index < self.entries.len(),
            "descriptor index {} out of range for a table of {} entries",
            index,
            self.entries.len()
        );
        self.entries[index]
    }
}

/// The test environment's own interrupt descriptor table.
#[repr(C, align(16))]
pub struct InterruptTable {
    entries: [InterruptDescriptor; INTERRUPT_TABLE_ENTRIES],
}

impl InterruptTable {
    pub const fn new() -> Self {
        Self { entries: [InterruptDescriptor::empty(); INTERRUPT_TABLE_ENTRIES] }
    }

    pub fn entry(&self, vector: usize) -> InterruptDescriptor {
        assert!(vector < INTERRUPT_TABLE_ENTRIES, "interrupt vector {} out of range", vector);
        self.entries[vector]
    }

    pub fn set_entry(&mut self, vector: usize, entry: InterruptDescriptor) {
        assert!(vector < INTERRUPT_TABLE_ENTRIES, "interrupt vector {} out of range", vector);
        self.entries[vector] = entry;
    }

    pub fn pointer(&self) -> DescriptorTablePointer {
        DescriptorTablePointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: VirtAddr::from_ptr(self),
        }
    }

    /// Loads this table into the IDT register.
    ///
    /// ## Safety
    ///
    /// Every present entry must point at a valid handler, and the table
    /// must never move or be deallocated while loaded.
    pub unsafe fn load(&'static self) {
        lidt(&self.pointer());
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The test environment's own segment descriptor table.
#[repr(C, align(8))]
pub struct SegmentTable {
    entries: [SegmentDescriptor; SEGMENT_TABLE_ENTRIES],
}

impl SegmentTable {
    pub const fn new() -> Self {
        Self { entries: [SegmentDescriptor::new(0); SEGMENT_TABLE_ENTRIES] }
    }

    pub fn entry(&self, index: usize) -> SegmentDescriptor {
        assert!(index < SEGMENT_TABLE_ENTRIES, "segment descriptor index {} out of range", index);
        self.entries[index]
    }

    pub fn set_entry(&mut self, index: usize, entry: SegmentDescriptor) {
        assert!(index < SEGMENT_TABLE_ENTRIES, "segment descriptor index {} out of range", index);
        self.entries[index] = entry;
    }

    pub fn pointer(&self) -> DescriptorTablePointer {
        DescriptorTablePointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: VirtAddr::from_ptr(self),
        }
    }

    /// Loads this table into the GDT register.
    ///
    /// ## Safety
    ///
    /// The descriptors referenced by the currently-loaded segment registers
    /// must be valid in this table, and the table must never move or be
    /// deallocated while loaded.
    pub unsafe fn load(&'static self) {
        lgdt(&self.pointer());
    }
}

impl Default for SegmentTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Copies the firmware's #VC handler entry into our IDT, dispatching it
/// through our own code segment.
///
/// No-op unless SEV-ES is enabled. The handler code itself is reused
/// unmodified; only the segment it runs through changes. Must be called
/// before any instruction that can raise #VC under our own descriptor
/// tables.
pub fn copy_vc_handler_entry<P: Platform>(
    capabilities: &SevCapabilities,
    idt: &mut InterruptTable,
    harness_cs: SegmentSelector,
) {
    if !capabilities.sev_es_enabled() {
        return;
    }

    // Safety: the pointer comes straight from the IDT register, which
    // still refers to the firmware's table at this point in setup.
    let firmware = unsafe { DescriptorTableView::<InterruptDescriptor>::new(&P::interrupt_table()) };
    let mut entry = firmware.entry(VC_VECTOR);
    entry.set_selector(harness_cs);
    idt.set_entry(VC_VECTOR, entry);
}

/// Mirrors the firmware's active code and data segment descriptors into our
/// GDT at their original indices.
///
/// No-op unless SEV-ES is enabled. Runs while the firmware's selectors are
/// still loaded, so that after our GDT takes over those selectors keep
/// resolving to descriptors of the expected type.
pub fn copy_active_segment_descriptors<P: Platform>(
    capabilities: &SevCapabilities,
    gdt: &mut SegmentTable,
) {
    if !capabilities.sev_es_enabled() {
        return;
    }

    // Safety: the pointer comes straight from the GDT register, which
    // still refers to the firmware's table at this point in setup.
    let firmware = unsafe { DescriptorTableView::<SegmentDescriptor>::new(&P::segment_table()) };
    for selector in [P::code_segment(), P::data_segment()] {
        let index = selector.index() as usize;
        gdt.set_entry(index, firmware.entry(index));
    }
}
