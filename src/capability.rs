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

//! One-shot detection of the SEV feature set.
//!
//! Support is probed via the extended CPUID range and the SEV status MSR.
//! The result is a plain value: absence of support is a valid, terminal
//! answer, never an error. The surrounding harness either threads a
//! [`SevCapabilities`] through its setup sequence or goes through the
//! process-wide cached accessor, [`sev_capabilities`].

use spin::Once;

use crate::{
    msr::{read_sev_status, SevStatus},
    platform::Platform,
};

/// CPUID leaf reporting the largest supported extended function number.
pub const CPUID_LARGEST_EXTENDED_FUNCTION: u32 = 0x8000_0000;

/// CPUID leaf reporting memory encryption capabilities.
///
/// See section E.4.17 of <https://www.amd.com/system/files/TechDocs/24594.pdf>.
pub const CPUID_MEMORY_ENCRYPTION: u32 = 0x8000_001F;

/// Bit in EAX of the memory encryption leaf indicating SEV support.
const SEV_SUPPORTED: u32 = 1 << 1;

/// Field in EBX of the memory encryption leaf holding the c-bit position.
const C_BIT_POSITION_MASK: u32 = 0x3F;

/// The SEV feature set of the current guest, probed once from hardware.
///
/// The feature set is fixed at VM boot by the hypervisor, so the value never
/// goes stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SevCapabilities {
    pub(crate) supported: bool,
    pub(crate) status: SevStatus,
    pub(crate) c_bit_position: u8,
}

impl SevCapabilities {
    const ABSENT: Self =
        Self { supported: false, status: SevStatus::empty(), c_bit_position: 0 };

    /// Probes CPUID and the status MSR for the SEV feature set.
    ///
    /// The status MSR is only touched once CPUID has confirmed SEV support:
    /// on processors without the feature the MSR may not exist at all.
    pub fn probe<P: Platform>() -> Self {
        let largest = P::cpuid(CPUID_LARGEST_EXTENDED_FUNCTION).eax;
        if largest < CPUID_MEMORY_ENCRYPTION {
            return Self::ABSENT;
        }

        let capability = P::cpuid(CPUID_MEMORY_ENCRYPTION);
        if capability.eax & SEV_SUPPORTED == 0 {
            return Self::ABSENT;
        }

        Self {
            supported: true,
            status: read_sev_status::<P>(),
            c_bit_position: (capability.ebx & C_BIT_POSITION_MASK) as u8,
        }
    }

    /// Whether the processor reports SEV support, regardless of whether the
    /// hypervisor enabled it for this guest.
    pub fn sev_supported(&self) -> bool {
        self.supported
    }

    /// Whether SEV is supported and enabled for this guest.
    pub fn sev_enabled(&self) -> bool {
        self.supported && self.status.contains(SevStatus::SEV_ENABLED)
    }

    /// Whether SEV-ES is enabled for this guest.
    ///
    /// SEV-ES is meaningless without SEV itself, so this never reports
    /// `true` when [`Self::sev_enabled`] reports `false`.
    pub fn sev_es_enabled(&self) -> bool {
        self.sev_enabled() && self.status.contains(SevStatus::SEV_ES_ENABLED)
    }

    /// Whether SEV-SNP is active for this guest.
    pub fn snp_active(&self) -> bool {
        self.sev_enabled() && self.status.contains(SevStatus::SNP_ACTIVE)
    }

    /// The page-table bit position marking a page as encrypted, as reported
    /// by CPUID. Only meaningful if [`Self::sev_supported`] is `true`.
    pub fn c_bit_position(&self) -> u8 {
        self.c_bit_position
    }
}

static CAPABILITIES: Once<SevCapabilities> = Once::new();

/// Returns the process-wide SEV capabilities, probing hardware on the first
/// call only.
///
/// Later calls return the cached value without touching CPUID or MSRs
/// again, so test cases can use this freely to gate their execution.
pub fn sev_capabilities<P: Platform>() -> &'static SevCapabilities {
    CAPABILITIES.call_once(SevCapabilities::probe::<P>)
}
