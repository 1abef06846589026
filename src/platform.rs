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

//! Abstraction over the CPU primitives the setup sequence relies on.
//!
//! Everything the crate learns about the guest comes through this trait:
//! CPUID results, model-specific registers, and the descriptor-table
//! registers installed by the firmware. Keeping these behind a trait means
//! the setup logic never executes a privileged instruction directly, and
//! tests can substitute deterministic fakes.

use core::arch::x86_64::{CpuidResult, __cpuid};

use x86_64::{
    instructions::tables::{sgdt, sidt},
    registers::{
        model_specific::Msr,
        segmentation::{Segment, SegmentSelector, CS, DS},
    },
    structures::DescriptorTablePointer,
};

/// Access to the processor state the setup sequence reads and writes.
///
/// All functions are associated functions: implementations carry no state,
/// and the real one ([`Base`]) just forwards to the corresponding
/// instructions.
pub trait Platform {
    /// Performs CPUID for the given leaf.
    fn cpuid(leaf: u32) -> CpuidResult;

    /// Reads a model-specific register.
    ///
    /// ## Safety
    ///
    /// The caller must guarantee that the MSR is valid.
    unsafe fn read_msr(msr: u32) -> u64;

    /// Writes a model-specific register.
    ///
    /// ## Safety
    ///
    /// The caller must guarantee that the MSR is valid and that the value
    /// written does not violate memory safety.
    unsafe fn write_msr(msr: u32, value: u64);

    /// Returns the currently-loaded interrupt descriptor table register,
    /// i.e. the table installed by the firmware until we replace it.
    fn interrupt_table() -> DescriptorTablePointer;

    /// Returns the currently-loaded global descriptor table register.
    fn segment_table() -> DescriptorTablePointer;

    /// Returns the currently-loaded code segment selector.
    fn code_segment() -> SegmentSelector;

    /// Returns the currently-loaded data segment selector.
    fn data_segment() -> SegmentSelector;
}

/// The hardware-backed [`Platform`] used on the real processor.
pub struct Base {}

impl Platform for Base {
    fn cpuid(leaf: u32) -> CpuidResult {
        // Safety: all CPUs we care about are modern enough to support CPUID.
        unsafe { __cpuid(leaf) }
    }

    unsafe fn read_msr(msr: u32) -> u64 {
        Msr::new(msr).read()
    }

    unsafe fn write_msr(msr: u32, value: u64) {
        Msr::new(msr).write(value)
    }

    fn interrupt_table() -> DescriptorTablePointer {
        sidt()
    }

    fn segment_table() -> DescriptorTablePointer {
        sgdt()
    }

    fn code_segment() -> SegmentSelector {
        CS::get_reg()
    }

    fn data_segment() -> SegmentSelector {
        DS::get_reg()
    }
}
