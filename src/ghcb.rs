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

//! Keeping the GHCB page unencrypted.
//!
//! Under SEV-ES the guest and hypervisor exchange structured messages
//! through the guest-hypervisor communication block (GHCB), a fixed
//! per-guest page whose address the firmware leaves in the GHCB MSR. The
//! page is only useful to the hypervisor if it is shared, so its page-table
//! leaf must have the c-bit clear. The firmware typically maps the region
//! with 2MiB pages, in which case the mapping has to be split down to a
//! 4KiB leaf first.

use x86_64::{
    structures::paging::{
        page_table::{PageTableEntry, PageTableFlags, PageTableLevel},
        PageSize, Size2MiB, Size4KiB,
    },
    PhysAddr,
};

use crate::{
    capability::SevCapabilities,
    geometry::EncryptionGeometry,
    msr::read_ghcb_msr,
    paging::PageTableOps,
    platform::Platform,
};

/// A validated guest-physical address of the GHCB page.
pub struct GhcbGpa {
    gpa: PhysAddr,
}

impl GhcbGpa {
    pub fn new(gpa: u64) -> Result<Self, &'static str> {
        if gpa % Size4KiB::SIZE != 0 {
            return Err("GHCB must be 4KiB-aligned");
        }
        Ok(Self { gpa: PhysAddr::new(gpa) })
    }

    pub fn address(&self) -> PhysAddr {
        self.gpa
    }
}

/// Reads the GHCB page address assigned by the hypervisor.
///
/// Read fresh on every call; the hypervisor may place the page differently
/// between runs.
pub fn read_ghcb_gpa<P: Platform>() -> Result<GhcbGpa, &'static str> {
    GhcbGpa::new(read_ghcb_msr::<P>())
}

/// Ensures the GHCB page is mapped by a 4KiB leaf with the c-bit clear.
///
/// No-op unless SEV-ES is enabled. If only a larger mapping covers the
/// page, the covering 2MiB region is split: a full run of 4KiB pages is
/// installed over it and the large entry is reinterpreted as a table
/// pointer. Exactly one leaf changes encryption state; every other mapping
/// in the region keeps the c-bit set.
///
/// Idempotent: a second call finds the 4KiB leaf directly and leaves the
/// tables as they were.
pub fn ensure_unencrypted_ghcb_page<P: Platform>(
    capabilities: &SevCapabilities,
    geometry: &EncryptionGeometry,
    tables: &mut impl PageTableOps,
) {
    if !capabilities.sev_es_enabled() {
        return;
    }

    let gpa = read_ghcb_gpa::<P>().expect("hypervisor-assigned GHCB address is invalid");
    let mask = geometry.bit_mask();

    if let Some(leaf) = tables.find_leaf(gpa.address(), PageTableLevel::One) {
        clear_encryption_bit(leaf, mask);
        tables.flush();
        return;
    }

    // Only a larger mapping covers the page: replace the covering 2MiB
    // mapping with an equivalent run of 4KiB pages.
    let base = gpa.address().align_down(Size2MiB::SIZE);
    tables.install_pages(base, Size2MiB::SIZE, base);

    let coarse = tables
        .find_leaf(gpa.address(), PageTableLevel::Two)
        .expect("mapping for the GHCB region disappeared after installing pages");
    let flags = coarse.flags();
    coarse.set_flags(flags - PageTableFlags::HUGE_PAGE);

    let leaf = tables
        .find_leaf(gpa.address(), PageTableLevel::One)
        .expect("no 4KiB mapping for the GHCB after splitting the large mapping");
    clear_encryption_bit(leaf, mask);
    tables.flush();
}

fn clear_encryption_bit(entry: &mut PageTableEntry, mask: u64) {
    let addr = PhysAddr::new(entry.addr().as_u64() & !mask);
    let flags = entry.flags();
    entry.set_addr(addr, flags);
}
