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

//! Guest-physical address geometry under memory encryption.
//!
//! When SEV is active one physical address bit (the c-bit) is repurposed to
//! mark a page as encrypted, which also shrinks the usable guest-physical
//! address range: the bits above the c-bit no longer carry address
//! information.

use crate::capability::SevCapabilities;

/// Upper bound (inclusive, in bits) of guest-physical addresses when memory
/// encryption is not enabled.
pub const ADDRESS_UPPER_BOUND_DEFAULT: u8 = 51;

/// The c-bit position and the address bounds derived from it.
///
/// Derived from [`SevCapabilities`]; must not be constructed before the
/// capabilities have been probed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncryptionGeometry {
    supported: bool,
    enabled: bool,
    bit_position: u8,
}

impl EncryptionGeometry {
    /// Derives the address geometry from the probed capabilities.
    ///
    /// CPUID reports the c-bit position whenever SEV is supported, even if
    /// the hypervisor did not enable it for this guest, so the position is
    /// meaningful in both cases. A reported position of 0 is architecturally
    /// impossible on a processor that reports support and would make every
    /// derived value nonsensical, so it is treated as a fatal invariant
    /// violation rather than clamped.
    pub fn new(capabilities: &SevCapabilities) -> Self {
        if capabilities.sev_supported() {
            assert!(
                capabilities.c_bit_position() != 0,
                "processor reported SEV support with a c-bit position of 0"
            );
        }
        Self {
            supported: capabilities.sev_supported(),
            enabled: capabilities.sev_enabled(),
            bit_position: capabilities.c_bit_position(),
        }
    }

    /// The physical address bit marking a page as encrypted.
    ///
    /// Only meaningful when SEV support was confirmed.
    pub fn bit_position(&self) -> u8 {
        self.bit_position
    }

    /// Mask with only the c-bit set, or `0` if SEV is unsupported.
    ///
    /// The zero mask is deliberately inert: or-ing it into or clearing it
    /// from an address is a no-op, so callers do not need a separate
    /// unsupported code path.
    pub fn bit_mask(&self) -> u64 {
        if self.supported {
            1u64 << self.bit_position
        } else {
            0
        }
    }

    /// Upper bound (inclusive, in bits) of usable guest-physical addresses.
    ///
    /// One below the c-bit position when encryption is enabled, else the
    /// architectural default.
    pub fn address_upper_bound(&self) -> u8 {
        if self.enabled {
            self.bit_position - 1
        } else {
            ADDRESS_UPPER_BOUND_DEFAULT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msr::SevStatus;

    fn capabilities(supported: bool, status: SevStatus, c_bit_position: u8) -> SevCapabilities {
        SevCapabilities { supported, status, c_bit_position }
    }

    #[test]
    fn test_geometry_unsupported() {
        let geometry = EncryptionGeometry::new(&capabilities(false, SevStatus::empty(), 0));
        assert_eq!(geometry.bit_mask(), 0);
        assert_eq!(geometry.address_upper_bound(), ADDRESS_UPPER_BOUND_DEFAULT);
    }

    #[test]
    fn test_geometry_supported_but_disabled() {
        let geometry = EncryptionGeometry::new(&capabilities(true, SevStatus::empty(), 0x2F));
        assert_eq!(geometry.bit_position(), 47);
        assert_eq!(geometry.bit_mask(), 1 << 47);
        // Not enabled, so the architectural default applies.
        assert_eq!(geometry.address_upper_bound(), ADDRESS_UPPER_BOUND_DEFAULT);
    }

    #[test]
    fn test_geometry_enabled() {
        let geometry =
            EncryptionGeometry::new(&capabilities(true, SevStatus::SEV_ENABLED, 0x2F));
        assert_eq!(geometry.bit_mask(), 1 << 47);
        assert_eq!(geometry.address_upper_bound(), 46);
    }

    #[test]
    fn test_geometry_all_valid_bit_positions() {
        for bit_position in 1..=63u8 {
            let geometry = EncryptionGeometry::new(&capabilities(
                true,
                SevStatus::SEV_ENABLED,
                bit_position,
            ));
            assert_eq!(geometry.bit_mask(), 1u64 << bit_position);
            assert_eq!(geometry.address_upper_bound(), bit_position - 1);
        }
    }

    #[test]
    #[should_panic(expected = "c-bit position of 0")]
    fn test_geometry_rejects_bit_position_zero() {
        EncryptionGeometry::new(&capabilities(true, SevStatus::SEV_ENABLED, 0));
    }
}
