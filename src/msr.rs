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

//! Model-specific registers used by the SEV feature set.
//!
//! Under SEV-ES the hypervisor communicates the location of the GHCB page
//! through MSR 0xC001_0130, and the enabled SEV feature set is reported in
//! the read-only status MSR 0xC001_0131.
//!
//! See section 15.34.10 of <https://www.amd.com/system/files/TechDocs/24593.pdf> for the status
//! MSR layout, and section 2.3.1 of <https://www.amd.com/system/files/TechDocs/56421-guest-hypervisor-communication-block-standardization.pdf>
//! for the GHCB MSR.

use bitflags::bitflags;

use crate::platform::Platform;

/// The identifier of the MSR holding the guest-physical address of the GHCB
/// page under SEV-ES.
pub const GHCB_MSR: u32 = 0xC001_0130;

/// The identifier for the SEV status MSR.
pub const SEV_STATUS_MSR: u32 = 0xC001_0131;

bitflags! {
    /// Flags indicating which SEV features are active.
    ///
    /// The feature set is fixed by the hypervisor when the VM is started;
    /// the status MSR never changes value at runtime.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SevStatus: u64 {
        /// SEV is enabled for this guest.
        const SEV_ENABLED = (1 << 0);
        /// SEV-ES is enabled for this guest.
        const SEV_ES_ENABLED = (1 << 1);
        /// SEV-SNP is active for this guest.
        const SNP_ACTIVE = (1 << 2);
        /// Virtual Top-of-Memory is enabled for this guest.
        const VTOM_ENABLED = (1 << 3);
        /// Reflect-VC is enabled for this guest.
        const REFLECT_VC_ENABLED = (1 << 4);
        /// Restricted Injection is enabled for this guest.
        const RESTRICTED_INJECTION_ENABLED = (1 << 5);
        /// Alternate injection is enabled for this guest.
        const ALTERNATE_INJECTION_ENABLED = (1 << 6);
        /// Debug Register Swapping is enabled for this guest.
        const DEBUG_SWAP_ENABLED = (1 << 7);
        /// The Prevent Host IBS feature is enabled for this guest.
        const PREVENT_HOST_IBS_ENABLED = (1 << 8);
        /// SNP Branch Target Buffer Isolation is enabled for this guest.
        const SNP_BTB_ISOLATION_ENABLED = (1 << 9);
        /// Secure Timestamp Counter is enabled for this guest.
        const SECURE_TSC_ENABLED = (1 << 11);
    }
}

/// Reads the enabled SEV feature set from the status MSR.
///
/// Bits the crate does not know about are ignored rather than treated as an
/// error; new feature bits must not make an otherwise valid status
/// unreadable.
pub fn read_sev_status<P: Platform>() -> SevStatus {
    // Safety: reading this specific MSR has no side effects within the
    // guest.
    SevStatus::from_bits_truncate(unsafe { P::read_msr(SEV_STATUS_MSR) })
}

/// Reads the raw guest-physical address of the GHCB page from the GHCB MSR.
///
/// The value is read fresh on every call: the address is assigned by the
/// hypervisor and may differ between runs.
pub fn read_ghcb_msr<P: Platform>() -> u64 {
    // Safety: reading this specific MSR has no side effects within the
    // guest.
    unsafe { P::read_msr(GHCB_MSR) }
}
