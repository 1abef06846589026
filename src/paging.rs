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

//! Access to the live page tables of the test environment.
//!
//! The environment identity-maps guest-physical memory, so entries that
//! point at lower-level tables can be followed directly once the c-bit is
//! stripped from them. The [`PageTableOps`] trait is the seam between the
//! setup code and the paging structures; [`IdentityMappedTables`] is the
//! implementation used on real hardware.

use core::ptr::addr_of_mut;

use x86_64::{
    instructions::tlb,
    registers::control::Cr3,
    structures::paging::{
        page_table::{PageTable, PageTableEntry, PageTableFlags, PageTableIndex, PageTableLevel},
        PageSize, Size2MiB, Size4KiB,
    },
    PhysAddr,
};

use crate::geometry::EncryptionGeometry;

/// Operations the setup sequence needs from the paging structures.
///
/// Addresses are guest-physical; with identity mapping they double as
/// virtual addresses. Implementations never allocate on lookup: an absent
/// leaf is reported as `None`, and only [`PageTableOps::install_pages`]
/// creates new entries.
pub trait PageTableOps {
    /// Returns the entry mapping `addr` at exactly the given paging level,
    /// or `None` if the walk cannot reach that level (an intermediate entry
    /// is absent, or a larger page mapping sits in the way).
    fn find_leaf(&mut self, addr: PhysAddr, level: PageTableLevel) -> Option<&mut PageTableEntry>;

    /// Installs a run of 4KiB pages covering `length` bytes of physical
    /// memory at `base`, mapped at `target`. Infallible; any failure is
    /// fatal.
    fn install_pages(&mut self, base: PhysAddr, length: u64, target: PhysAddr);

    /// Makes preceding entry modifications visible to the processor.
    fn flush(&mut self);
}

// One statically-allocated table is enough: the only split the environment
// ever performs is for the single GHCB page.
static mut SPLIT_PT: PageTable = PageTable::new();

/// Walks the identity-mapped page tables rooted at a given frame.
pub struct IdentityMappedTables {
    root: u64,
    encryption_mask: u64,
    split_table: Option<&'static mut PageTable>,
}

impl IdentityMappedTables {
    /// Creates a walker for the tables currently installed in CR3, using
    /// the built-in spare table for a split.
    ///
    /// ## Safety
    ///
    /// The caller must guarantee that paging is identity-mapped and that no
    /// other code mutates the tables while this walker is alive, and must
    /// not create more than one walker from the built-in spare table.
    pub unsafe fn active(encryption_mask: u64) -> Self {
        let (frame, _) = Cr3::read();
        let root = PhysAddr::new(frame.start_address().as_u64() & !encryption_mask);
        Self::new(root, encryption_mask, Some(&mut *addr_of_mut!(SPLIT_PT)))
    }

    /// Creates a walker for the tables rooted at `root`.
    ///
    /// ## Safety
    ///
    /// `root` must point at a live level-4 table whose entries, after
    /// stripping `encryption_mask`, are directly dereferenceable, and the
    /// tables must not be mutated elsewhere while this walker is alive.
    pub unsafe fn new(
        root: PhysAddr,
        encryption_mask: u64,
        split_table: Option<&'static mut PageTable>,
    ) -> Self {
        Self { root: root.as_u64(), encryption_mask, split_table }
    }

    fn table_index(addr: PhysAddr, level: PageTableLevel) -> PageTableIndex {
        let shift = match level {
            PageTableLevel::One => 12,
            PageTableLevel::Two => 21,
            PageTableLevel::Three => 30,
            PageTableLevel::Four => 39,
        };
        PageTableIndex::new(((addr.as_u64() >> shift) & 0x1FF) as u16)
    }

    fn next_lower(level: PageTableLevel) -> Option<PageTableLevel> {
        match level {
            PageTableLevel::Four => Some(PageTableLevel::Three),
            PageTableLevel::Three => Some(PageTableLevel::Two),
            PageTableLevel::Two => Some(PageTableLevel::One),
            PageTableLevel::One => None,
        }
    }
}

impl PageTableOps for IdentityMappedTables {
    fn find_leaf(&mut self, addr: PhysAddr, level: PageTableLevel) -> Option<&mut PageTableEntry> {
        // Safety: the constructor contract guarantees the root is a live,
        // identity-mapped table.
        let mut table = unsafe { &mut *(self.root as *mut PageTable) };
        let mut current = PageTableLevel::Four;
        loop {
            let entry = &mut table[Self::table_index(addr, current)];
            if current == level {
                if entry.is_unused() {
                    return None;
                }
                return Some(entry);
            }
            let flags = entry.flags();
            if !flags.contains(PageTableFlags::PRESENT)
                || flags.contains(PageTableFlags::HUGE_PAGE)
            {
                return None;
            }
            let next = (entry.addr().as_u64() & !self.encryption_mask) as *mut PageTable;
            // Safety: a present, non-huge entry points at the next table,
            // which with identity mapping is directly dereferenceable.
            table = unsafe { &mut *next };
            current = Self::next_lower(current)?;
        }
    }

    fn install_pages(&mut self, base: PhysAddr, length: u64, target: PhysAddr) {
        assert_eq!(length, Size2MiB::SIZE, "only whole large-page regions can be installed");
        assert!(base.is_aligned(Size2MiB::SIZE), "install base must be large-page aligned");
        assert_eq!(base, target, "tables are identity-mapped");

        let table = self
            .split_table
            .take()
            .expect("no spare page table left for splitting a large mapping");
        for (i, entry) in table.iter_mut().enumerate() {
            let page = base + (i as u64) * Size4KiB::SIZE;
            entry.set_addr(
                PhysAddr::new(page.as_u64() | self.encryption_mask),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            );
        }
        let table_addr = PhysAddr::new((table as *mut PageTable as u64) | self.encryption_mask);

        // Repoint the large entry at the freshly-filled table. Its flags are
        // left untouched; reinterpreting the entry as a table pointer is the
        // caller's decision.
        let coarse = self
            .find_leaf(target, PageTableLevel::Two)
            .expect("no large mapping covers the region being split");
        let flags = coarse.flags();
        coarse.set_addr(table_addr, flags);
    }

    fn flush(&mut self) {
        tlb::flush_all();
    }
}

/// Counts of private (c-bit set) and shared (c-bit clear) page mappings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncryptionCensus {
    pub private: usize,
    pub shared: usize,
}

/// Surveys the encryption state of every 4KiB page mapped in the given
/// physical range. Pages without a mapping are skipped.
///
/// Diagnostic only; the setup sequence does not depend on it.
pub fn survey_region(
    tables: &mut impl PageTableOps,
    geometry: &EncryptionGeometry,
    start: PhysAddr,
    length: u64,
) -> EncryptionCensus {
    let mask = geometry.bit_mask();
    let mut census = EncryptionCensus::default();
    let mut page = start.align_down(Size4KiB::SIZE);
    let end = start + length;
    while page < end {
        let mut raw = tables.find_leaf(page, PageTableLevel::One).map(|entry| entry.addr().as_u64());
        if raw.is_none() {
            // A level-2 entry only maps the page itself if it is a large
            // page; a table pointer with an absent leaf below means the page
            // is unmapped.
            raw = tables
                .find_leaf(page, PageTableLevel::Two)
                .filter(|entry| entry.flags().contains(PageTableFlags::HUGE_PAGE))
                .map(|entry| entry.addr().as_u64());
        }
        match raw {
            Some(raw) if raw & mask != 0 => census.private += 1,
            Some(_) => census.shared += 1,
            None => {}
        }
        page += Size4KiB::SIZE;
    }
    census
}
